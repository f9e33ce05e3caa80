//! Typed settings extracted from untyped configuration maps.
//!
//! Every extractor removes the key it reads from the map, so whatever is left
//! afterwards is unknown to the service. Failures are pushed into a shared
//! [`ValidationErrors`] instead of returning early; callers decide when to
//! surface them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use reqwest::Url;
use secrecy::SecretString;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result, ValidationErrors};
use crate::model::TaskType;

pub type ConfigMap = serde_json::Map<String, Value>;

pub const SERVICE_SETTINGS: &str = "service_settings";
pub const TASK_SETTINGS: &str = "task_settings";
pub const SECRET_SETTINGS: &str = "secret_settings";
pub const CHUNKING_SETTINGS: &str = "chunking_settings";

pub const MODEL_ID: &str = "model_id";
pub const URL: &str = "url";
pub const SIMILARITY: &str = "similarity";
pub const DIMENSIONS: &str = "dimensions";
pub const MAX_INPUT_TOKENS: &str = "max_input_tokens";
pub const API_KEY: &str = "api_key";
pub const RATE_LIMIT: &str = "rate_limit";
pub const REQUESTS_PER_MINUTE: &str = "requests_per_minute";

/// Where a configuration map came from.
///
/// `Request` maps are user input and are validated strictly; `Persistent` maps
/// were written by an earlier version of the service and are read leniently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseContext {
    Request,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMeasure {
    Cosine,
    DotProduct,
    L2Norm,
}

impl SimilarityMeasure {
    pub fn as_str(self) -> &'static str {
        match self {
            SimilarityMeasure::Cosine => "cosine",
            SimilarityMeasure::DotProduct => "dot_product",
            SimilarityMeasure::L2Norm => "l2_norm",
        }
    }
}

impl fmt::Display for SimilarityMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimilarityMeasure {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "cosine" => Ok(SimilarityMeasure::Cosine),
            "dot_product" => Ok(SimilarityMeasure::DotProduct),
            "l2_norm" => Ok(SimilarityMeasure::L2Norm),
            _ => Err(()),
        }
    }
}

/// Settings shared by every service settings type.
pub trait ServiceSettings {
    fn model_id(&self) -> &str;
    fn uri(&self) -> &Url;
    fn rate_limit_settings(&self) -> RateLimitSettings;
}

/// Request-overridable task settings.
///
/// Implementations are immutable values; [`TaskSettings::of`] builds a new
/// value instead of mutating either input.
pub trait TaskSettings: Sized + Copy + PartialEq + fmt::Debug {
    fn from_map(map: &mut ConfigMap) -> Result<Self>;

    /// Merges `request` over `original`: each `Some` field of `request` wins.
    fn of(original: &Self, request: &Self) -> Self;

    fn is_empty(&self) -> bool;
}

/// Requests-per-minute budget for one rate limit group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitSettings {
    requests_per_minute: u64,
}

impl RateLimitSettings {
    pub const fn new(requests_per_minute: u64) -> Self {
        Self {
            requests_per_minute,
        }
    }

    pub fn requests_per_minute(&self) -> u64 {
        self.requests_per_minute
    }

    /// Reads the optional `rate_limit` object, falling back to `default`.
    pub fn of(
        map: &mut ConfigMap,
        default: RateLimitSettings,
        errors: &mut ValidationErrors,
        service: &str,
        context: ParseContext,
    ) -> RateLimitSettings {
        let mut settings = match map.remove(RATE_LIMIT) {
            None | Some(Value::Null) => return default,
            Some(Value::Object(settings)) => settings,
            Some(other) => {
                errors.add(invalid_type_message(RATE_LIMIT, &other, "Map"));
                return default;
            }
        };

        let requests_per_minute =
            extract_optional_positive_long(&mut settings, REQUESTS_PER_MINUTE, RATE_LIMIT, errors);

        if context == ParseContext::Request && !settings.is_empty() {
            errors.add(unknown_settings_message(&settings, service));
        }

        requests_per_minute.map(Self::new).unwrap_or(default)
    }

    pub fn to_settings_configuration(
        task_types: &[TaskType],
    ) -> BTreeMap<String, SettingsConfiguration> {
        BTreeMap::from([(
            format!("{RATE_LIMIT}.{REQUESTS_PER_MINUTE}"),
            SettingsConfiguration {
                description: "Minimize the number of rate limit errors.".to_string(),
                label: "Rate Limit".to_string(),
                required: false,
                sensitive: false,
                updatable: false,
                field_type: SettingsFieldType::Int,
                supported_task_types: task_types.to_vec(),
            },
        )])
    }
}

/// The provider credential. Never serialized; `Debug` output is redacted.
#[derive(Debug, Clone)]
pub struct DefaultSecretSettings {
    api_key: SecretString,
}

impl DefaultSecretSettings {
    pub fn new(api_key: SecretString) -> Self {
        Self { api_key }
    }

    pub fn api_key(&self) -> &SecretString {
        &self.api_key
    }

    /// A missing map means the caller has no secrets to offer (for example a
    /// persisted config read without its secrets document).
    pub fn from_map(map: Option<&mut ConfigMap>) -> Result<Option<Self>> {
        let Some(map) = map else {
            return Ok(None);
        };

        let mut errors = ValidationErrors::new();
        let api_key = extract_required_string(map, API_KEY, SECRET_SETTINGS, &mut errors);
        errors.into_result()?;

        Ok(api_key.map(|key| Self::new(SecretString::from(key))))
    }

    pub fn to_settings_configuration(
        task_types: &[TaskType],
    ) -> BTreeMap<String, SettingsConfiguration> {
        BTreeMap::from([(
            API_KEY.to_string(),
            SettingsConfiguration {
                description: "API Key for the provider you're connecting to.".to_string(),
                label: "API Key".to_string(),
                required: true,
                sensitive: true,
                updatable: true,
                field_type: SettingsFieldType::Str,
                supported_task_types: task_types.to_vec(),
            },
        )])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsFieldType {
    Str,
    Int,
    Bool,
    Map,
}

/// Schema entry describing one configurable field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsConfiguration {
    pub description: String,
    pub label: String,
    pub required: bool,
    pub sensitive: bool,
    pub updatable: bool,
    #[serde(rename = "type")]
    pub field_type: SettingsFieldType,
    pub supported_task_types: Vec<TaskType>,
}

pub(crate) fn serialize_url<S>(url: &Url, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(url.as_str())
}

fn invalid_type_message(key: &str, value: &Value, expected: &str) -> String {
    format!(
        "field [{key}] is not of the expected type. The value [{value}] cannot be converted to a [{expected}]"
    )
}

fn unknown_settings_message(map: &ConfigMap, service: &str) -> String {
    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    format!(
        "Configuration contains settings [{}] unknown to the [{service}] service",
        keys.join(", ")
    )
}

pub fn extract_required_string(
    map: &mut ConfigMap,
    key: &str,
    scope: &str,
    errors: &mut ValidationErrors,
) -> Option<String> {
    match map.remove(key) {
        None | Some(Value::Null) => {
            errors.add(format!(
                "[{scope}] does not contain the required setting [{key}]"
            ));
            None
        }
        Some(Value::String(value)) if value.trim().is_empty() => {
            errors.add(format!(
                "[{scope}] Invalid value empty string. [{key}] must be a non-empty string"
            ));
            None
        }
        Some(Value::String(value)) => Some(value),
        Some(other) => {
            errors.add(invalid_type_message(key, &other, "String"));
            None
        }
    }
}

pub fn extract_optional_string(
    map: &mut ConfigMap,
    key: &str,
    scope: &str,
    errors: &mut ValidationErrors,
) -> Option<String> {
    match map.remove(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(value)) if value.trim().is_empty() => {
            errors.add(format!(
                "[{scope}] Invalid value empty string. [{key}] must be a non-empty string"
            ));
            None
        }
        Some(Value::String(value)) => Some(value),
        Some(other) => {
            errors.add(invalid_type_message(key, &other, "String"));
            None
        }
    }
}

fn extract_positive(
    map: &mut ConfigMap,
    key: &str,
    scope: &str,
    errors: &mut ValidationErrors,
    max: u64,
    type_name: &str,
) -> Option<u64> {
    let value = match map.remove(key) {
        None | Some(Value::Null) => return None,
        Some(value) => value,
    };

    let Value::Number(number) = &value else {
        errors.add(invalid_type_message(key, &value, type_name));
        return None;
    };

    if let Some(positive) = number.as_u64() {
        if positive == 0 {
            errors.add(format!(
                "[{scope}] Invalid value [{number}]. [{key}] must be a positive integer"
            ));
            return None;
        }
        if positive > max {
            errors.add(invalid_type_message(key, &value, type_name));
            return None;
        }
        return Some(positive);
    }

    if number.as_i64().is_some() {
        errors.add(format!(
            "[{scope}] Invalid value [{number}]. [{key}] must be a positive integer"
        ));
    } else {
        errors.add(invalid_type_message(key, &value, type_name));
    }
    None
}

pub fn extract_optional_positive_integer(
    map: &mut ConfigMap,
    key: &str,
    scope: &str,
    errors: &mut ValidationErrors,
) -> Option<u32> {
    extract_positive(map, key, scope, errors, u32::MAX as u64, "Integer")
        .and_then(|value| u32::try_from(value).ok())
}

pub fn extract_optional_positive_long(
    map: &mut ConfigMap,
    key: &str,
    scope: &str,
    errors: &mut ValidationErrors,
) -> Option<u64> {
    extract_positive(map, key, scope, errors, u64::MAX, "Long")
}

pub fn extract_optional_bool(
    map: &mut ConfigMap,
    key: &str,
    errors: &mut ValidationErrors,
) -> Option<bool> {
    match map.remove(key) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(value)) => Some(value),
        Some(other) => {
            errors.add(invalid_type_message(key, &other, "Boolean"));
            None
        }
    }
}

pub fn extract_similarity(
    map: &mut ConfigMap,
    scope: &str,
    errors: &mut ValidationErrors,
) -> Option<SimilarityMeasure> {
    let raw = extract_optional_string(map, SIMILARITY, scope, errors)?;
    match raw.parse() {
        Ok(similarity) => Some(similarity),
        Err(()) => {
            errors.add(format!(
                "[{scope}] Invalid value [{raw}] received. [{SIMILARITY}] must be one of [cosine, dot_product, l2_norm]"
            ));
            None
        }
    }
}

pub fn convert_to_uri(
    url: Option<String>,
    key: &str,
    scope: &str,
    errors: &mut ValidationErrors,
) -> Option<Url> {
    let url = url?;
    match Url::parse(&url) {
        Ok(uri) => Some(uri),
        Err(err) => {
            errors.add(format!(
                "[{scope}] Invalid url [{url}] received for field [{key}]. Error: {err}"
            ));
            None
        }
    }
}

/// Removes a required nested settings object.
pub fn remove_from_map_or_throw_if_null(config: &mut ConfigMap, key: &str) -> Result<ConfigMap> {
    match remove_from_map(config, key)? {
        Some(map) => Ok(map),
        None => {
            let mut errors = ValidationErrors::new();
            errors.add(format!("Model configuration is missing [{key}]"));
            Err(Error::Validation(errors))
        }
    }
}

pub fn remove_from_map_or_default_empty(config: &mut ConfigMap, key: &str) -> Result<ConfigMap> {
    Ok(remove_from_map(config, key)?.unwrap_or_default())
}

pub fn remove_from_map(config: &mut ConfigMap, key: &str) -> Result<Option<ConfigMap>> {
    match config.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => {
            let mut errors = ValidationErrors::new();
            errors.add(invalid_type_message(key, &other, "Map"));
            Err(Error::Validation(errors))
        }
    }
}

/// Rejects keys that no extractor consumed.
pub fn throw_if_not_empty_map(map: &ConfigMap, service: &str) -> Result<()> {
    if map.is_empty() {
        return Ok(());
    }
    let mut errors = ValidationErrors::new();
    errors.add(unknown_settings_message(map, service));
    Err(Error::Validation(errors))
}
