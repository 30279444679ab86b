//! Synthesizer: text-to-speech capability contract.

use crate::error::GatewayError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

/// Produces 24kHz mono float samples in `[-1, 1]`. The pipeline converts to
/// signed 16-bit little-endian before it hits the wire.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Set when `speaker_reference` was omitted and a default voice was
    /// used instead.
    pub voice_fallback: bool,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_initialized(&self) -> bool;

    async fn initialize(&self) -> Result<(), GatewayError>;

    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        speaker_reference: Option<&Path>,
    ) -> Result<SynthesisResult, GatewayError>;

    /// Streaming variant yielding PCM chunks as they become available.
    async fn synthesize_stream(
        &self,
        text: &str,
        language: &str,
        speaker_reference: Option<&Path>,
    ) -> Result<BoxStream<'static, Result<Vec<f32>, GatewayError>>, GatewayError>;
}
