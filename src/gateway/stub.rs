//! Deterministic stub adapters
//!
//! No real models: fixed, input-derived output for development and test
//! without requiring model weights on disk.

use super::recognizer::{Recognizer, RecognitionMeta, RecognitionResult};
use super::synthesizer::{Synthesizer, SynthesisResult};
use super::translator::Translator;
use crate::error::GatewayError;
use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

const STUB_CONFIDENCE: f32 = 0.95;
const STUB_MIN_AUDIO_MS: i64 = 300;

pub struct StubRecognizer {
    initialized: AtomicBool,
}

impl StubRecognizer {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
        }
    }

    fn generate_dummy_text(duration_ms: i64) -> String {
        match duration_ms {
            0..=999 => "Test.".to_string(),
            1000..=1999 => "Test audio transcription.".to_string(),
            _ => format!("Stub transcription for {duration_ms}ms of audio."),
        }
    }
}

impl Default for StubRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Recognizer for StubRecognizer {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    async fn initialize(&self) -> Result<(), GatewayError> {
        tracing::info!("StubRecognizer: initializing (no-op)");
        self.initialized.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn transcribe(
        &self,
        samples: &[f32],
        language_hint: Option<&str>,
        sample_rate: u32,
    ) -> Result<RecognitionResult, GatewayError> {
        if !self.is_initialized() {
            return Err(GatewayError::NotLoaded("stub recognizer".to_string()));
        }

        let duration_ms = (samples.len() as i64 * 1000) / sample_rate.max(1) as i64;
        if duration_ms < STUB_MIN_AUDIO_MS {
            return Err(GatewayError::InvalidInput(format!(
                "audio too short: {duration_ms}ms < {STUB_MIN_AUDIO_MS}ms minimum"
            )));
        }

        let text = Self::generate_dummy_text(duration_ms);
        let (detected_lang, language_probability) = match language_hint {
            Some(hint) => (hint.to_string(), 1.0),
            None => ("en".to_string(), STUB_CONFIDENCE),
        };

        Ok(RecognitionResult {
            text,
            detected_lang,
            meta: RecognitionMeta { language_probability },
        })
    }

    fn supported_languages(&self) -> Vec<&'static str> {
        vec!["en", "es", "fr", "de", "ja", "zh"]
    }
}

pub struct StubTranslator {
    initialized: AtomicBool,
}

impl StubTranslator {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
        }
    }
}

impl Default for StubTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Translator for StubTranslator {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    async fn initialize(&self) -> Result<(), GatewayError> {
        self.initialized.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, GatewayError> {
        if !self.is_initialized() {
            return Err(GatewayError::NotLoaded("stub translator".to_string()));
        }
        if source_lang == target_lang {
            return Ok(text.to_string());
        }
        Ok(format!("[{target_lang}] {text}"))
    }
}

pub struct StubSynthesizer {
    initialized: AtomicBool,
}

impl StubSynthesizer {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
        }
    }

    /// Deterministic sine burst, one cycle per 4 characters, standing in
    /// for a real waveform.
    fn generate_samples(text: &str, sample_rate: u32) -> Vec<f32> {
        let duration_ms = (text.chars().count().max(1) as u64 * 60).min(8000);
        let n = (sample_rate as u64 * duration_ms / 1000) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                0.2 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
            })
            .collect()
    }
}

impl Default for StubSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Synthesizer for StubSynthesizer {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    async fn initialize(&self) -> Result<(), GatewayError> {
        self.initialized.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn synthesize(
        &self,
        text: &str,
        _language: &str,
        speaker_reference: Option<&Path>,
    ) -> Result<SynthesisResult, GatewayError> {
        if !self.is_initialized() {
            return Err(GatewayError::NotLoaded("stub synthesizer".to_string()));
        }
        if text.trim().is_empty() {
            return Err(GatewayError::InvalidInput("empty text".to_string()));
        }
        let sample_rate = 24_000;
        Ok(SynthesisResult {
            samples: Self::generate_samples(text, sample_rate),
            sample_rate,
            voice_fallback: speaker_reference.is_none(),
        })
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        language: &str,
        speaker_reference: Option<&Path>,
    ) -> Result<BoxStream<'static, Result<Vec<f32>, GatewayError>>, GatewayError> {
        let result = self.synthesize(text, language, speaker_reference).await?;
        let chunk_size = 2400; // 100ms at 24kHz
        let s = stream! {
            for chunk in result.samples.chunks(chunk_size) {
                yield Ok(chunk.to_vec());
            }
        };
        Ok(Box::pin(s))
    }
}
