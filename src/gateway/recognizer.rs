//! Recognizer: speech-to-text capability contract.

use crate::error::GatewayError;
use async_trait::async_trait;

/// Metadata returned alongside the transcript.
#[derive(Debug, Clone)]
pub struct RecognitionMeta {
    pub language_probability: f32,
}

#[derive(Debug, Clone)]
pub struct RecognitionResult {
    pub text: String,
    pub detected_lang: String,
    pub meta: RecognitionMeta,
}

/// Speech recognition over a fixed-rate PCM window.
///
/// Implementations must be deterministic for identical input (greedy
/// decoding, temperature 0) and apply their own speech-activity filtering
/// to trim obvious silence before decoding.
#[async_trait]
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_initialized(&self) -> bool;

    async fn initialize(&self) -> Result<(), GatewayError>;

    /// Transcribe `samples` (f32, `sample_rate` Hz, mono). When
    /// `language_hint` is `Some`, the returned `detected_lang` must equal
    /// the hint and `meta.language_probability` must be `1.0`.
    async fn transcribe(
        &self,
        samples: &[f32],
        language_hint: Option<&str>,
        sample_rate: u32,
    ) -> Result<RecognitionResult, GatewayError>;

    fn supported_languages(&self) -> Vec<&'static str>;
}
