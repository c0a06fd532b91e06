//! Transcript enhancement provider interface.

use async_trait::async_trait;
use mia_common::config::Settings;
use mia_common::{Error, Result};
use std::sync::Arc;

/// Rewrites raw transcript text into a cleaned-up version.
#[async_trait]
pub trait EnhanceProvider: Send + Sync {
    async fn enhance(&self, raw: &str) -> Result<String>;
}

pub fn build_enhance_provider(settings: &Settings) -> Result<Arc<dyn EnhanceProvider>> {
    match settings.enhancer_provider.trim().to_lowercase().as_str() {
        "mock" => Ok(Arc::new(MockEnhancer)),
        other => Err(Error::Config(format!("unknown enhancer provider: {}", other))),
    }
}

/// Ratio of enhanced to raw length, a cheap signal of how much the
/// enhancement changed the text. 1.0 means untouched.
pub fn quality_score(raw: &str, enhanced: &str) -> f64 {
    if raw.is_empty() {
        return 1.0;
    }
    enhanced.chars().count() as f64 / raw.chars().count() as f64
}

const FILLER_WORDS: &[&str] = &["um", "uh", "erm", "hmm", "like,"];

/// Deterministic enhancement: drops filler words, collapses whitespace and
/// capitalizes sentence starts. Stands in for the LLM rewrite.
pub struct MockEnhancer;

#[async_trait]
impl EnhanceProvider for MockEnhancer {
    async fn enhance(&self, raw: &str) -> Result<String> {
        let mut words: Vec<&str> = Vec::new();
        for word in raw.split_whitespace() {
            let bare = word.trim_matches(|c: char| c.is_ascii_punctuation());
            if FILLER_WORDS.contains(&bare.to_lowercase().as_str()) {
                continue;
            }
            words.push(word);
        }
        let joined = words.join(" ");
        let mut chars = joined.chars();
        Ok(match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => joined,
        })
    }
}
