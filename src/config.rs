//! Runtime configuration envelope
//!
//! Every tunable named in the external-interfaces configuration envelope
//! lives here as a plain struct, overridable per-field via `RELAY_*`
//! environment variables. Mirrors the `WHISPER_MODEL`-style env override
//! used elsewhere in this tree rather than pulling in a config-file crate.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelayConfig {
    pub rolling_buffer_max_ms: u64,
    pub context_tail_ms: u64,
    pub min_first_utterance_ms: u64,
    pub min_continuation_ms: u64,
    pub silence_rms_threshold: f32,
    pub silence_reset_ms: u64,
    pub end_of_speech_ms: u64,
    pub pending_timeout_ms: u64,
    pub pending_min_chars: usize,
    pub pending_max_chars: usize,
    pub max_tts_chars: usize,
    pub asr_detect_conf_threshold: f32,
    pub asr_force_override_threshold: f32,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub tick_interval_ms: u64,
    pub idle_unload_s: u64,
    pub intake_max_ms: u64,
    pub send_timeout_ms: u64,
    pub duplicate_suppress_ms: u64,
    pub empty_asr_streak_limit: u32,
}

impl RelayConfig {
    pub fn max_transcript_chars(&self) -> usize {
        2 * self.max_tts_chars
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rolling_buffer_max_ms: 3000,
            context_tail_ms: 200,
            min_first_utterance_ms: 450,
            min_continuation_ms: 100,
            silence_rms_threshold: 0.0018,
            silence_reset_ms: 1200,
            end_of_speech_ms: 2000,
            pending_timeout_ms: 3500,
            pending_min_chars: 40,
            pending_max_chars: 150,
            // Midpoint of the documented [120, 250] range; see DESIGN.md.
            max_tts_chars: 200,
            asr_detect_conf_threshold: 0.70,
            asr_force_override_threshold: 0.40,
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            tick_interval_ms: 100,
            idle_unload_s: 3600,
            intake_max_ms: 2000,
            send_timeout_ms: 2000,
            duplicate_suppress_ms: 1500,
            empty_asr_streak_limit: 3,
        }
    }
}

impl RelayConfig {
    /// Apply `RELAY_*` environment variable overrides on top of `Default`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        macro_rules! override_u64 {
            ($field:ident, $var:literal) => {
                if let Ok(raw) = std::env::var($var) {
                    match raw.parse() {
                        Ok(v) => cfg.$field = v,
                        Err(_) => tracing::warn!("ignoring invalid {}={}", $var, raw),
                    }
                }
            };
        }
        macro_rules! override_f32 {
            ($field:ident, $var:literal) => {
                if let Ok(raw) = std::env::var($var) {
                    match raw.parse() {
                        Ok(v) => cfg.$field = v,
                        Err(_) => tracing::warn!("ignoring invalid {}={}", $var, raw),
                    }
                }
            };
        }

        override_u64!(rolling_buffer_max_ms, "RELAY_ROLLING_BUFFER_MAX_MS");
        override_u64!(context_tail_ms, "RELAY_CONTEXT_TAIL_MS");
        override_u64!(min_first_utterance_ms, "RELAY_MIN_FIRST_UTTERANCE_MS");
        override_u64!(min_continuation_ms, "RELAY_MIN_CONTINUATION_MS");
        override_f32!(silence_rms_threshold, "RELAY_SILENCE_RMS_THRESHOLD");
        override_u64!(silence_reset_ms, "RELAY_SILENCE_RESET_MS");
        override_u64!(end_of_speech_ms, "RELAY_END_OF_SPEECH_MS");
        override_u64!(pending_timeout_ms, "RELAY_PENDING_TIMEOUT_MS");
        override_f32!(asr_detect_conf_threshold, "RELAY_ASR_DETECT_CONF_THRESHOLD");
        override_f32!(
            asr_force_override_threshold,
            "RELAY_ASR_FORCE_OVERRIDE_THRESHOLD"
        );
        override_u64!(tick_interval_ms, "RELAY_TICK_INTERVAL_MS");
        override_u64!(idle_unload_s, "RELAY_IDLE_UNLOAD_S");

        if let Ok(raw) = std::env::var("RELAY_MAX_TTS_CHARS") {
            match raw.parse::<usize>() {
                Ok(v) => cfg.max_tts_chars = v.clamp(120, 250),
                Err(_) => tracing::warn!("ignoring invalid RELAY_MAX_TTS_CHARS={}", raw),
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_envelope() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.rolling_buffer_max_ms, 3000);
        assert_eq!(cfg.output_sample_rate, 24_000);
        assert_eq!(cfg.max_transcript_chars(), 400);
    }

    #[test]
    fn from_env_overrides_are_clamped() {
        std::env::set_var("RELAY_MAX_TTS_CHARS", "999");
        let cfg = RelayConfig::from_env();
        assert_eq!(cfg.max_tts_chars, 250);
        std::env::remove_var("RELAY_MAX_TTS_CHARS");
    }
}
