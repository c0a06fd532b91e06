//! Speech-to-text provider interface.

use async_trait::async_trait;
use mia_common::config::Settings;
use mia_common::{Error, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// One transcribed chunk.
#[derive(Debug, Clone)]
pub struct SttResult {
    pub text: String,
    pub speaker: Option<String>,
    pub confidence: Option<f64>,
}

/// Speech-to-text over a single audio chunk.
#[async_trait]
pub trait SttProvider: Send + Sync {
    async fn transcribe_chunk(&self, audio: &[u8], sample_rate: u32) -> Result<SttResult>;
}

/// Resolve the configured provider. Real engines plug in here; the mock is
/// the only in-tree implementation.
pub fn build_stt_provider(settings: &Settings) -> Result<Arc<dyn SttProvider>> {
    match settings.stt_provider.trim().to_lowercase().as_str() {
        "mock" => Ok(Arc::new(MockSttProvider)),
        other => Err(Error::Config(format!("unknown STT provider: {}", other))),
    }
}

/// Speaker attribution from a provider hint, falling back to a
/// deterministic round-robin over the chunk sequence.
pub fn resolve_speaker(hint: Option<&str>, seq: i64) -> String {
    match hint {
        Some(h) if !h.trim().is_empty() => h.trim().to_string(),
        _ => format!("spk{}", (seq % 2) + 1),
    }
}

/// Deterministic STT: the transcript is a function of the audio bytes, so
/// re-running a chunk (retries, rebuilds) yields identical text.
pub struct MockSttProvider;

#[async_trait]
impl SttProvider for MockSttProvider {
    async fn transcribe_chunk(&self, audio: &[u8], _sample_rate: u32) -> Result<SttResult> {
        if audio.is_empty() {
            return Ok(SttResult {
                text: String::new(),
                speaker: None,
                confidence: None,
            });
        }
        let digest = hex::encode(Sha256::digest(audio));
        Ok(SttResult {
            text: format!("segment {} ({} bytes)", &digest[..8], audio.len()),
            speaker: None,
            confidence: Some(0.92),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_is_deterministic() {
        let stt = MockSttProvider;
        let a = stt.transcribe_chunk(b"same audio", 16000).await.unwrap();
        let b = stt.transcribe_chunk(b"same audio", 16000).await.unwrap();
        assert_eq!(a.text, b.text);
        assert!(!a.text.is_empty());

        let c = stt.transcribe_chunk(b"other audio", 16000).await.unwrap();
        assert_ne!(a.text, c.text);
    }

    #[tokio::test]
    async fn test_empty_audio_yields_empty_text() {
        let stt = MockSttProvider;
        let res = stt.transcribe_chunk(b"", 16000).await.unwrap();
        assert!(res.text.is_empty());
    }

    #[test]
    fn test_speaker_resolution() {
        assert_eq!(resolve_speaker(Some("alice"), 0), "alice");
        assert_eq!(resolve_speaker(None, 0), "spk1");
        assert_eq!(resolve_speaker(None, 1), "spk2");
        assert_eq!(resolve_speaker(Some("  "), 2), "spk1");
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut settings = Settings::default();
        settings.stt_provider = "whisperx".to_string();
        assert!(build_stt_provider(&settings).is_err());
    }
}
