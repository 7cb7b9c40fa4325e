//! Self-Reflection Loop
//!
//! Optional second opinion: the model reviews its own analysis and, if the
//! review finds problems, is asked once for an improved answer.

use crate::ai::client::AiResult;
use crate::ai::prompts::{
    build_improvement_prompt, build_reflection_prompt, APPROVED, NEEDS_IMPROVEMENT,
};
use crate::config::ReflectionConfig;
use std::future::Future;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SelfReflection {
    improvement_keywords: Vec<String>,
    long_reply_chars: usize,
}

impl Default for SelfReflection {
    fn default() -> Self {
        Self::new(&ReflectionConfig::default())
    }
}

impl SelfReflection {
    pub fn new(config: &ReflectionConfig) -> Self {
        Self {
            improvement_keywords: config
                .improvement_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.trim().is_empty())
                .collect(),
            long_reply_chars: config.long_reply_chars,
        }
    }

    /// Whether a review reply asks for another round
    pub fn needs_improvement(&self, review: &str) -> bool {
        if review.contains(NEEDS_IMPROVEMENT) {
            return true;
        }
        if review.contains(APPROVED) {
            return false;
        }
        let lower = review.to_lowercase();
        self.improvement_keywords.iter().any(|k| lower.contains(k.as_str()))
            || review.trim().chars().count() > self.long_reply_chars
    }

    /// Review `initial` and return either it or one improved revision.
    /// Any failure along the way returns `initial` unchanged.
    pub async fn reflect<F, Fut>(&self, initial: &str, original_prompt: &str, send: F) -> String
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = AiResult<String>>,
    {
        let review = match send(build_reflection_prompt(initial, original_prompt)).await {
            Ok(review) => review,
            Err(e) => {
                warn!(error = %e, "self-review failed, keeping the original answer");
                return initial.to_string();
            }
        };

        if !self.needs_improvement(&review) {
            debug!("self-review approved the answer");
            return initial.to_string();
        }

        debug!("self-review requested an improvement");
        match send(build_improvement_prompt(original_prompt, initial, &review)).await {
            Ok(improved) if !improved.trim().is_empty() => improved,
            Ok(_) => initial.to_string(),
            Err(e) => {
                warn!(error = %e, "improvement request failed, keeping the original answer");
                initial.to_string()
            }
        }
    }
}
