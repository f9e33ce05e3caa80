use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::api::InferenceResults;
use crate::config::SenderConfig;
use crate::error::{Error, ProviderErrorKind, Result};
use crate::request::{RateLimitGroup, Request};
use crate::response::{HttpResult, ResponseHandler};

/// Sends a provider request and resolves exactly once with the parsed
/// results or the failure.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(
        &self,
        request: Box<dyn Request>,
        handler: ResponseHandler,
        timeout: Duration,
    ) -> Result<InferenceResults>;
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn per_minute(requests_per_minute: u64) -> Self {
        let requests_per_minute = requests_per_minute.max(1) as f64;
        let rate = requests_per_minute / 60.0;
        Self::new((rate * 10.0).min(requests_per_minute).max(1.0), rate)
    }

    /// A full bucket carries no state a fresh one would not.
    fn is_idle(&mut self) -> bool {
        self.refill();
        self.tokens >= self.capacity
    }

    fn try_consume(&mut self, tokens_needed: f64) -> std::result::Result<(), Duration> {
        self.refill();

        if self.tokens >= tokens_needed {
            self.tokens -= tokens_needed;
            Ok(())
        } else {
            let tokens_short = tokens_needed - self.tokens;
            let wait_seconds = tokens_short / self.refill_rate;
            Err(Duration::from_secs_f64(wait_seconds))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let new_tokens = elapsed * self.refill_rate;

        self.tokens = (self.tokens + new_tokens).min(self.capacity);
        self.last_refill = now;
    }
}

/// Rate limit groups kept before idle buckets are evicted.
const MAX_RATE_LIMIT_GROUPS: usize = 1024;

fn evict_idle_buckets(limiters: &mut HashMap<u64, TokenBucket>) {
    limiters.retain(|_, bucket| !bucket.is_idle());
}

/// [`Sender`] over a shared reqwest client.
///
/// Requests are rate limited per [`RateLimitGroup`], bounded by a
/// concurrency semaphore, retried on transient failures and resent with
/// shorter input when the provider reports the content as too large.
#[derive(Clone)]
pub struct HttpSender {
    client: Client,
    config: SenderConfig,
    concurrent_semaphore: Arc<Semaphore>,
    rate_limiters: Arc<Mutex<HashMap<u64, TokenBucket>>>,
}

impl HttpSender {
    pub fn new(config: SenderConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout())
            .build()
            .map_err(Error::HttpClientBuild)?;

        let concurrent_semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));

        Ok(Self {
            client,
            config,
            concurrent_semaphore,
            rate_limiters: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn wait_for_rate_limit(&self, group: RateLimitGroup) {
        loop {
            let wait_duration = {
                let mut limiters = self.rate_limiters.lock().await;
                if limiters.len() >= MAX_RATE_LIMIT_GROUPS && !limiters.contains_key(&group.key) {
                    evict_idle_buckets(&mut limiters);
                }
                let bucket = limiters.entry(group.key).or_insert_with(|| {
                    TokenBucket::per_minute(group.settings.requests_per_minute())
                });
                match bucket.try_consume(1.0) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };

            let wait_with_buffer = wait_duration + Duration::from_millis(10);

            if wait_with_buffer > Duration::from_millis(100) {
                debug!(
                    "Rate limit: waiting {:?} before next request",
                    wait_with_buffer
                );
            }

            sleep(wait_with_buffer).await;
        }
    }

    async fn execute_once(&self, request: &dyn Request, timeout: Duration) -> Result<HttpResult> {
        let http_request = request.create_http_request()?;

        let _permit = self
            .concurrent_semaphore
            .acquire()
            .await
            .map_err(|_| Error::SemaphoreClosed)?;

        let response = self
            .client
            .post(http_request.url)
            .headers(http_request.headers)
            .body(http_request.body)
            .timeout(timeout)
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = response.status();
        let version = response.version();
        let body = response.bytes().await.map_err(Error::Transport)?;
        trace!("Response body fully consumed, releasing permit");

        Ok(HttpResult::new(status, version, body))
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(
        &self,
        request: Box<dyn Request>,
        handler: ResponseHandler,
        timeout: Duration,
    ) -> Result<InferenceResults> {
        let mut request = request;
        let mut retries = 0;
        let mut truncations = 0;

        loop {
            debug!(
                "Attempting {} request to {} (attempt {})",
                handler.request_type(),
                request.uri(),
                retries + truncations + 1
            );

            self.wait_for_rate_limit(request.rate_limit_group()).await;

            let result = match self.execute_once(request.as_ref(), timeout).await {
                Ok(result) => result,
                Err(Error::Transport(e))
                    if is_retryable_error(&e) && retries < self.config.max_retries =>
                {
                    retries += 1;
                    let backoff = calculate_backoff(retries);
                    debug!(
                        "Retrying after {} seconds due to error: {}",
                        backoff.as_secs(),
                        e
                    );
                    sleep(backoff).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match handler.validate(request.as_ref(), &result) {
                Ok(()) => {
                    debug!(
                        "Request to {} succeeded with status {}",
                        request.uri(),
                        result.status()
                    );
                    return handler.parse(request.as_ref(), &result);
                }
                Err(Error::Provider(err))
                    if err.kind == ProviderErrorKind::ContentTooLarge
                        && truncations < self.config.max_truncation_attempts =>
                {
                    truncations += 1;
                    debug!(
                        "Truncating input after status {} (truncation {})",
                        err.status, truncations
                    );
                    request = request.truncate();
                }
                Err(Error::Provider(err))
                    if should_retry(err.status.as_u16()) && retries < self.config.max_retries =>
                {
                    retries += 1;
                    let backoff = calculate_backoff(retries);
                    debug!(
                        "Retrying after {} seconds due to status {}",
                        backoff.as_secs(),
                        err.status
                    );
                    sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn should_retry(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Timeouts are not retried; they fail the call they belong to.
fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() && !error.is_timeout()
}

fn calculate_backoff(retry_count: usize) -> Duration {
    let exponent = retry_count.min(6) as u32;

    #[cfg(test)]
    {
        let base = 2u64;
        let millis = base.saturating_pow(exponent).min(60) * 10;
        Duration::from_millis(millis)
    }

    #[cfg(not(test))]
    {
        let base = 2u64;
        let seconds = base.saturating_pow(exponent).min(60);
        Duration::from_secs(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use reqwest::Url;
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::action::EMBEDDINGS_HANDLER;
    use crate::embedding::{
        EmbeddingsModel, EmbeddingsRequest, EmbeddingsServiceSettings, EmbeddingsTaskSettings,
    };
    use crate::settings::{DefaultSecretSettings, ParseContext};
    use crate::truncation::{TruncationResult, Truncator};

    fn embeddings_request(server: &MockServer, input: &[&str]) -> Box<dyn Request> {
        let uri = Url::parse(&format!("{}/v1/embeddings", server.uri())).unwrap();
        let model = EmbeddingsModel::new(
            "my-embeddings",
            EmbeddingsServiceSettings::new("m", Some(uri)),
            EmbeddingsTaskSettings::EMPTY,
            None,
            Some(DefaultSecretSettings::new(SecretString::from("test_key"))),
        );
        Box::new(EmbeddingsRequest::new(
            Truncator::default(),
            TruncationResult::untruncated(input.iter().map(|s| s.to_string()).collect()),
            Arc::new(model),
        ))
    }

    fn sender() -> HttpSender {
        HttpSender::new(SenderConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn send_sets_headers_and_parses_embeddings() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("Authorization", "Bearer test_key"))
            .and(header("Content-Type", "application/json"))
            .and(body_json(json!({"model": "m", "input": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.5, 1.0]}, {"embedding": [1.5, 2.0]}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let results = sender()
            .send(
                embeddings_request(&mock_server, &["a", "b"]),
                EMBEDDINGS_HANDLER,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(
            results.into_embeddings().unwrap(),
            vec![vec![0.5, 1.0], vec![1.5, 2.0]]
        );
    }

    #[tokio::test]
    async fn unauthorized_is_reported_with_status_line() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":\"bad key\"}"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = sender()
            .send(
                embeddings_request(&mock_server, &["a"]),
                EMBEDDINGS_HANDLER,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert_eq!(err.status().as_u16(), 401);
        assert!(err.to_string().contains("[my-embeddings]"), "{err}");
        assert!(err.to_string().contains("401 Unauthorized"), "{err}");
    }

    #[tokio::test]
    async fn content_too_large_is_resent_truncated() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_json(json!({"model": "m", "input": ["abcdefgh"]})))
            .respond_with(ResponseTemplate::new(413))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(body_json(json!({"model": "m", "input": ["abcd"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [1.0]}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let results = sender()
            .send(
                embeddings_request(&mock_server, &["abcdefgh"]),
                EMBEDDINGS_HANDLER,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(results.into_embeddings().unwrap(), vec![vec![1.0]]);
    }

    #[tokio::test]
    async fn transient_status_is_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.25]}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let results = sender()
            .send(
                embeddings_request(&mock_server, &["a"]),
                EMBEDDINGS_HANDLER,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(results.into_embeddings().unwrap(), vec![vec![0.25]]);
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid model"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = sender()
            .send(
                embeddings_request(&mock_server, &["a"]),
                EMBEDDINGS_HANDLER,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn timeout_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": [{"embedding": [1.0]}]}))
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = sender()
            .send(
                embeddings_request(&mock_server, &["a"]),
                EMBEDDINGS_HANDLER,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::Transport(e) if e.is_timeout()), "{err}");
        assert_eq!(err.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn low_rate_limit_still_sends() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.5]}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut service_settings = json!({
            "model_id": "m",
            "url": format!("{}/v1/embeddings", mock_server.uri()),
            "rate_limit": {"requests_per_minute": 5}
        })
        .as_object()
        .cloned()
        .unwrap();
        let settings =
            EmbeddingsServiceSettings::from_map(&mut service_settings, ParseContext::Request)
                .unwrap();
        let model = EmbeddingsModel::new(
            "my-embeddings",
            settings,
            EmbeddingsTaskSettings::EMPTY,
            None,
            Some(DefaultSecretSettings::new(SecretString::from("test_key"))),
        );
        let request = EmbeddingsRequest::new(
            Truncator::default(),
            TruncationResult::untruncated(vec!["a".to_string()]),
            Arc::new(model),
        );
        assert_eq!(request.rate_limit_group().settings.requests_per_minute(), 5);

        let results = tokio::time::timeout(
            Duration::from_secs(5),
            sender().send(Box::new(request), EMBEDDINGS_HANDLER, Duration::from_secs(5)),
        )
        .await
        .expect("send should not wait on the rate limiter")
        .unwrap();

        assert_eq!(results.into_embeddings().unwrap(), vec![vec![0.5]]);
    }

    #[test]
    fn bucket_holds_at_least_one_request() {
        for rpm in 1..=5 {
            let mut bucket = TokenBucket::per_minute(rpm);
            assert!(bucket.capacity >= 1.0);
            assert!(bucket.try_consume(1.0).is_ok(), "rpm {rpm}");
            let wait = bucket.try_consume(1.0).unwrap_err();
            assert!(wait <= Duration::from_secs(60), "rpm {rpm}: {wait:?}");
        }
    }

    #[test]
    fn backoff_is_capped_for_large_retry_counts() {
        assert_eq!(calculate_backoff(1), Duration::from_millis(20));
        assert_eq!(calculate_backoff(6), Duration::from_millis(600));
        assert_eq!(calculate_backoff(64), Duration::from_millis(600));
        assert_eq!(calculate_backoff(usize::MAX), Duration::from_millis(600));
    }

    #[test]
    fn eviction_keeps_buckets_that_are_waiting() {
        let mut limiters = HashMap::new();
        for key in 0..MAX_RATE_LIMIT_GROUPS as u64 {
            limiters.insert(key, TokenBucket::per_minute(60));
        }
        let mut busy = TokenBucket::per_minute(60);
        assert!(busy.try_consume(1.0).is_ok());
        limiters.insert(u64::MAX, busy);

        evict_idle_buckets(&mut limiters);

        assert_eq!(limiters.len(), 1);
        assert!(limiters.contains_key(&u64::MAX));
    }

    #[test]
    fn token_bucket_waits_when_empty() {
        let mut bucket = TokenBucket::per_minute(60);
        for _ in 0..10 {
            assert!(bucket.try_consume(1.0).is_ok());
        }
        let wait = bucket.try_consume(1.0).unwrap_err();
        assert!(wait > Duration::from_millis(900));
    }
}
