//! Shortening of oversized inputs.

/// Rough character budget per provider token used for pre-truncation.
pub const CHARS_PER_TOKEN: usize = 4;

const DEFAULT_REDUCTION_PERCENTAGE: f64 = 0.5;

/// Inputs after truncation plus a parallel flag per input recording whether
/// it was shortened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationResult {
    input: Vec<String>,
    truncated: Vec<bool>,
}

impl TruncationResult {
    pub fn untruncated(input: Vec<String>) -> Self {
        let truncated = vec![false; input.len()];
        Self { input, truncated }
    }

    pub fn input(&self) -> &[String] {
        &self.input
    }

    pub fn truncated(&self) -> &[bool] {
        &self.truncated
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Truncator {
    reduction_percentage: f64,
}

impl Default for Truncator {
    fn default() -> Self {
        Self::new(DEFAULT_REDUCTION_PERCENTAGE)
    }
}

impl Truncator {
    /// `reduction_percentage` is the share of characters kept per pass and is
    /// clamped to `[0, 1]`.
    pub fn new(reduction_percentage: f64) -> Self {
        Self {
            reduction_percentage: reduction_percentage.clamp(0.0, 1.0),
        }
    }

    pub fn reduction_percentage(&self) -> f64 {
        self.reduction_percentage
    }

    /// Shortens every input by the reduction percentage.
    pub fn truncate(&self, input: &[String]) -> TruncationResult {
        let (input, truncated) = input
            .iter()
            .map(|text| {
                let keep = (text.chars().count() as f64 * self.reduction_percentage).floor();
                truncate_chars(text, keep as usize)
            })
            .unzip();
        TruncationResult { input, truncated }
    }

    /// Shortens an earlier result further; an input stays flagged once it has
    /// been truncated.
    pub fn truncate_further(&self, previous: &TruncationResult) -> TruncationResult {
        let mut next = self.truncate(&previous.input);
        for (flag, was) in next.truncated.iter_mut().zip(&previous.truncated) {
            *flag |= *was;
        }
        next
    }

    /// Cuts inputs to an approximate token budget; `None` leaves them intact.
    pub fn truncate_to_token_limit(input: &[String], token_limit: Option<u32>) -> TruncationResult {
        let Some(limit) = token_limit else {
            return TruncationResult::untruncated(input.to_vec());
        };
        let max_chars = (limit as usize).saturating_mul(CHARS_PER_TOKEN);
        let (input, truncated) = input
            .iter()
            .map(|text| truncate_chars(text, max_chars))
            .unzip();
        TruncationResult { input, truncated }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (text[..idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn truncate_halves_each_input() {
        let result = Truncator::default().truncate(&strings(&["abcdefgh", "abc", ""]));
        assert_eq!(result.input(), strings(&["abcd", "a", ""]).as_slice());
        assert_eq!(result.truncated(), &[true, true, false]);
    }

    #[test]
    fn repeated_truncation_never_grows_and_keeps_flags_aligned() {
        let truncator = Truncator::default();
        let original = TruncationResult::untruncated(strings(&["héllo wörld", "x", "longer input text"]));

        let once = truncator.truncate_further(&original);
        let twice = truncator.truncate_further(&once);

        for (before, after) in once.input().iter().zip(twice.input()) {
            assert!(after.chars().count() <= before.chars().count());
        }
        assert_eq!(once.truncated().len(), original.len());
        assert_eq!(twice.truncated().len(), original.len());
        assert_eq!(twice.truncated(), &[true, true, true]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let result = Truncator::new(0.5).truncate(&strings(&["ßßßß"]));
        assert_eq!(result.input()[0], "ßß");
    }

    #[test]
    fn token_limit_truncation() {
        let input = strings(&["abcdefghij", "abc"]);
        let untouched = Truncator::truncate_to_token_limit(&input, None);
        assert_eq!(untouched.input(), input.as_slice());
        assert_eq!(untouched.truncated(), &[false, false]);

        let limited = Truncator::truncate_to_token_limit(&input, Some(1));
        assert_eq!(limited.input(), strings(&["abcd", "abc"]).as_slice());
        assert_eq!(limited.truncated(), &[true, false]);
    }
}
