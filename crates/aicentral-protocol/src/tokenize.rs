use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tiktoken_rs::CoreBPE;

/// Model-keyed tokenizer cache for estimating token counts of streamed
/// responses, where the backend never reports usage.
///
/// Construction failures degrade to a bytes-per-token heuristic; estimation
/// must never fail a request.
pub struct TokenEstimator {
    encoders: Mutex<HashMap<String, Option<Arc<CoreBPE>>>>,
    fallback: Option<Arc<CoreBPE>>,
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.encoders.lock().map(|guard| guard.len()).unwrap_or(0);
        f.debug_struct("TokenEstimator")
            .field("cached_models", &cached)
            .finish()
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self {
            encoders: Mutex::new(HashMap::new()),
            fallback: tiktoken_rs::cl100k_base().ok().map(Arc::new),
        }
    }

    /// Estimated token count of `text` under `model`'s encoding. Unknown
    /// models use the default encoding; if even that is unavailable, a crude
    /// four-bytes-per-token heuristic keeps the estimate non-zero.
    pub fn estimate(&self, model: Option<&str>, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        if let Some(encoder) = self.encoder_for(model) {
            return encoder.encode_ordinary(text).len() as u64;
        }
        text.len().div_ceil(4) as u64
    }

    fn encoder_for(&self, model: Option<&str>) -> Option<Arc<CoreBPE>> {
        let Some(model) = model.filter(|m| !m.is_empty()) else {
            return self.fallback.clone();
        };

        if let Ok(guard) = self.encoders.lock()
            && let Some(cached) = guard.get(model)
        {
            return cached.clone().or_else(|| self.fallback.clone());
        }

        let built = tiktoken_rs::get_bpe_from_model(model).ok().map(Arc::new);
        if let Ok(mut guard) = self.encoders.lock() {
            guard.insert(model.to_string(), built.clone());
        }
        built.or_else(|| self.fallback.clone())
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        let estimator = TokenEstimator::new();
        assert_eq!(estimator.estimate(Some("gpt-4o"), ""), 0);
    }

    #[test]
    fn unknown_model_falls_back_without_failing() {
        let estimator = TokenEstimator::new();
        let count = estimator.estimate(Some("definitely-not-a-model"), "hello world");
        assert!(count > 0);
    }

    #[test]
    fn repeated_lookups_reuse_the_cache() {
        let estimator = TokenEstimator::new();
        let first = estimator.estimate(Some("gpt-4o"), "the same text");
        let second = estimator.estimate(Some("gpt-4o"), "the same text");
        assert_eq!(first, second);
    }

    #[test]
    fn longer_text_estimates_more_tokens() {
        let estimator = TokenEstimator::new();
        let short = estimator.estimate(None, "hi");
        let long = estimator.estimate(None, &"word ".repeat(200));
        assert!(long > short);
    }
}
