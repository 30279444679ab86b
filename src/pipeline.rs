//! Per-speaker streaming pipeline
//!
//! One cooperative task per active speaker, advancing on a fixed tick,
//! grounded in the source tree's `Pipeline::run_loop` shape (tick interval,
//! `mpsc` shutdown signal, `tokio::select!`) but fixed to the
//! rolling-buffer -> recognize -> aggregate -> translate -> synthesize flow
//! rather than a generic user-defined stage chain.

use crate::config::RelayConfig;
use crate::error::Stage;
use crate::gateway::ModelGateway;
use crate::ids::{RoomId, UserId};
use crate::intake::IntakeBuffer;
use crate::protocol::{now_ms, AudioPayload, ServerMessage};
use crate::registry::Registry;
use crate::voice_profile::VoiceProfileResolver;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// Per-speaker mutable state (§3 `SpeakerState`). Owned exclusively by that
/// speaker's task.
#[derive(Debug, Clone)]
pub struct SpeakerState {
    pub room_id: RoomId,
    pub input_lang: String,
    pub output_lang: String,
    pub speaks_pref: Vec<String>,
    pub understands_pref: Vec<String>,
    pub last_good_input: Option<String>,
    pub last_detected_language: Option<String>,
    pub muted: bool,
    pub paused: bool,

    pub rolling_buffer: Vec<u8>,
    pub pending_transcript: String,
    pub pending_started_at: Option<Instant>,
    pub last_transcript: Option<(String, Instant)>,
    pub last_activity_ts: Instant,
    pub silence_accum_ms: u64,
    pub empty_asr_streak: u32,
    pub speaking: bool,
    pub first_transcript_emitted: bool,
    pub last_asr_call_at: Option<Instant>,
    pub last_detected_state: Option<DecisionSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionSnapshot {
    pub speaker_lang: String,
    pub detected_lang: String,
    pub detected_conf: f32,
}

impl SpeakerState {
    pub fn new(
        room_id: RoomId,
        input_lang: String,
        output_lang: String,
        speaks_pref: Vec<String>,
        understands_pref: Vec<String>,
    ) -> Self {
        Self {
            room_id,
            input_lang,
            output_lang,
            speaks_pref,
            understands_pref,
            last_good_input: None,
            last_detected_language: None,
            muted: false,
            paused: false,
            rolling_buffer: Vec::new(),
            pending_transcript: String::new(),
            pending_started_at: None,
            last_transcript: None,
            last_activity_ts: Instant::now(),
            silence_accum_ms: 0,
            empty_asr_streak: 0,
            speaking: false,
            first_transcript_emitted: false,
            last_asr_call_at: None,
            last_detected_state: None,
        }
    }
}

/// A room participant's language preferences, as last reported by their own
/// `init_settings`/`language_update`. Shared across speaker tasks so a
/// speaker's flush can resolve each listener's target language without
/// reaching into another task's private `SpeakerState`.
#[derive(Debug, Clone)]
pub struct ParticipantPrefs {
    pub input_lang: String,
    pub output_lang: String,
    pub understands_pref: Vec<String>,
}

pub type PreferencesDirectory = Arc<RwLock<HashMap<UserId, ParticipantPrefs>>>;

/// Delivery bookkeeping for a `(speaker, listener, target_language)` triple,
/// plus the per-`(speaker, listener)` sequence counter.
#[derive(Default)]
struct ListenerDelivery {
    last_sent_text: HashMap<String, String>, // keyed by target language
    seq: u64,
}

/// Shared services a speaker task depends on. Constructed once by
/// `AppContext` and handed to every speaker task as an `Arc`.
pub struct PipelineServices {
    pub registry: Arc<Registry<ServerMessage>>,
    pub intake: Arc<IntakeBuffer>,
    pub gateway: Arc<ModelGateway>,
    pub voice_profiles: Arc<VoiceProfileResolver>,
    pub preferences: PreferencesDirectory,
    pub config: RelayConfig,
}

pub struct SpeakerInit {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub input_lang: String,
    pub output_lang: String,
    pub speaks_pref: Vec<String>,
    pub understands_pref: Vec<String>,
}

/// Commands a coordinator can send into a running speaker task.
pub enum SpeakerCommand {
    UpdateLanguages {
        input_lang: String,
        output_lang: String,
        speaks_pref: Option<Vec<String>>,
        understands_pref: Option<Vec<String>>,
    },
    SetMuted(bool),
    SetPaused(bool),
    Shutdown,
}

/// A running speaker task.
pub struct SpeakerTask {
    command_tx: mpsc::Sender<SpeakerCommand>,
    join_handle: tokio::task::JoinHandle<()>,
}

impl SpeakerTask {
    pub fn spawn(services: Arc<PipelineServices>, init: SpeakerInit) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        {
            let mut prefs = services.preferences.write();
            prefs.insert(
                init.user_id.clone(),
                ParticipantPrefs {
                    input_lang: init.input_lang.clone(),
                    output_lang: init.output_lang.clone(),
                    understands_pref: init.understands_pref.clone(),
                },
            );
        }
        let join_handle = tokio::spawn(run_speaker(services, init, command_rx));
        Self {
            command_tx,
            join_handle,
        }
    }

    pub async fn send(&self, command: SpeakerCommand) {
        let _ = self.command_tx.send(command).await;
    }

    /// Cancel the task and wait for it to unwind. Any in-flight delivery
    /// job is dropped along with it.
    pub async fn stop(self) {
        let _ = self.command_tx.send(SpeakerCommand::Shutdown).await;
        let _ = self.join_handle.await;
    }
}

async fn run_speaker(
    services: Arc<PipelineServices>,
    init: SpeakerInit,
    mut command_rx: mpsc::Receiver<SpeakerCommand>,
) {
    let SpeakerInit {
        user_id,
        room_id,
        input_lang,
        output_lang,
        speaks_pref,
        understands_pref,
    } = init;

    let mut state = SpeakerState::new(room_id, input_lang, output_lang, speaks_pref, understands_pref);
    let mut deliveries: HashMap<UserId, ListenerDelivery> = HashMap::new();
    let delivery_permit = Arc::new(Semaphore::new(1));
    let mut interval = tokio::time::interval(Duration::from_millis(services.config.tick_interval_ms));

    debug!(%user_id, "speaker task started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tick(&services, &user_id, &mut state, &mut deliveries, &delivery_permit).await;
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SpeakerCommand::Shutdown) | None => {
                        debug!(%user_id, "speaker task cancelled");
                        break;
                    }
                    Some(SpeakerCommand::SetMuted(muted)) => {
                        let was_muted = state.muted;
                        state.muted = muted;
                        if was_muted && !muted {
                            // Unmute restarts processing from a clean slate
                            // rather than resuming a stale rolling buffer.
                            reset_context(&services, &user_id, &mut state, &mut deliveries, "unmute");
                        }
                    }
                    Some(SpeakerCommand::SetPaused(paused)) => state.paused = paused,
                    Some(SpeakerCommand::UpdateLanguages { input_lang, output_lang, speaks_pref, understands_pref }) => {
                        state.input_lang = input_lang.clone();
                        state.output_lang = output_lang.clone();
                        if let Some(sp) = speaks_pref {
                            state.speaks_pref = sp;
                        }
                        if let Some(up) = understands_pref {
                            state.understands_pref = up.clone();
                        }
                        let mut prefs = services.preferences.write();
                        prefs.insert(
                            user_id.clone(),
                            ParticipantPrefs {
                                input_lang,
                                output_lang,
                                understands_pref: state.understands_pref.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    services.intake.clear(&user_id);
    services.preferences.write().remove(&user_id);
}

async fn tick(
    services: &Arc<PipelineServices>,
    user_id: &UserId,
    state: &mut SpeakerState,
    deliveries: &mut HashMap<UserId, ListenerDelivery>,
    delivery_permit: &Arc<Semaphore>,
) {
    let cfg = &services.config;

    // 4.5.1 Rolling buffer and gating
    let new_bytes = services.intake.drain(user_id);
    if new_bytes.is_empty() && state.rolling_buffer.is_empty() {
        return;
    }
    state.rolling_buffer.extend_from_slice(&new_bytes);
    let max_buffer_bytes = (cfg.input_sample_rate as u64 * 2 * cfg.rolling_buffer_max_ms / 1000) as usize;
    trim_front(&mut state.rolling_buffer, max_buffer_bytes);

    let mut samples = bytes_to_f32(&new_bytes);
    let chunk_ms = (new_bytes.len() as u64 * 1000) / (cfg.input_sample_rate as u64 * 2).max(1);
    let mut rms = compute_rms(&samples);

    if rms >= cfg.silence_rms_threshold {
        state.last_activity_ts = Instant::now();
        state.speaking = true;
        state.silence_accum_ms = 0;
    } else {
        state.silence_accum_ms += chunk_ms;
    }

    if (0.0002..0.0045).contains(&rms) {
        rms = apply_agc(&mut samples, 0.010, 4.0);
    }

    if rms < cfg.silence_rms_threshold {
        if state.speaking {
            if state.silence_accum_ms >= cfg.end_of_speech_ms {
                flush_pending(services, user_id, state, deliveries, delivery_permit, "end-of-speech").await;
                reset_context(services, user_id, state, deliveries, "end-of-speech");
            }
            return;
        }
        if state.silence_accum_ms >= cfg.silence_reset_ms {
            reset_context(services, user_id, state, deliveries, "prolonged near-silence");
        }
        return;
    }

    if let Some(last_call) = state.last_asr_call_at {
        if last_call.elapsed() < Duration::from_millis(cfg.tick_interval_ms) {
            return;
        }
    }

    let min_ms = if state.first_transcript_emitted {
        cfg.min_continuation_ms
    } else {
        cfg.min_first_utterance_ms
    };
    let buffered_ms = (state.rolling_buffer.len() as u64 * 1000) / (cfg.input_sample_rate as u64 * 2).max(1);
    if buffered_ms < min_ms {
        return;
    }

    // 4.5.2 Recognition and language decision
    state.last_asr_call_at = Some(Instant::now());
    let hint = if state.input_lang != "auto" {
        Some(state.input_lang.clone())
    } else {
        state.last_good_input.clone()
    };

    let recognizer = match services.gateway.recognizer.get().await {
        Ok(r) => r,
        Err(e) => {
            notify_error(services, user_id, Stage::Asr, &e.to_string()).await;
            return;
        }
    };

    let buffer_samples = bytes_to_f32(&state.rolling_buffer);
    let recognition = match recognizer
        .transcribe(&buffer_samples, hint.as_deref(), cfg.input_sample_rate)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(%user_id, error = %e, "recognizer call failed, treating as empty transcript");
            handle_empty_asr(services, user_id, state, deliveries, delivery_permit).await;
            return;
        }
    };

    let transcript = recognition.text.trim().to_string();
    if transcript.is_empty() || is_punctuation_only(&transcript) {
        handle_empty_asr(services, user_id, state, deliveries, delivery_permit).await;
        return;
    }
    state.empty_asr_streak = 0;

    if is_hallucination(&transcript) {
        reset_context(services, user_id, state, deliveries, "hallucinated repetition");
        return;
    }

    let max_transcript_chars = cfg.max_transcript_chars();
    let transcript = truncate_chars(&transcript, max_transcript_chars);

    if let Some((prev, ts)) = &state.last_transcript {
        if prev.eq_ignore_ascii_case(&transcript) && ts.elapsed() < Duration::from_millis(cfg.duplicate_suppress_ms) {
            return;
        }
    }
    state.last_transcript = Some((transcript.clone(), Instant::now()));
    trim_front(
        &mut state.rolling_buffer,
        (cfg.input_sample_rate as u64 * 2 * cfg.context_tail_ms / 1000) as usize,
    );

    let detected_primary = primary_subtag(&recognition.detected_lang);
    let detected_conf = recognition.meta.language_probability;
    let speaker_lang = decide_language(state, &detected_primary, detected_conf, cfg);

    // 4.5.3 Partial emission
    services
        .registry
        .send_to_room(
            &state.room_id,
            ServerMessage::PartialTranscript {
                user_id: user_id.to_string(),
                text: transcript.clone(),
                language: speaker_lang.clone(),
                timestamp: now_ms(),
            },
            None,
        )
        .await;

    if state.muted {
        return;
    }

    let new_snapshot = DecisionSnapshot {
        speaker_lang: speaker_lang.clone(),
        detected_lang: detected_primary.clone(),
        detected_conf,
    };

    let language_changed = match &state.last_detected_state {
        Some(old) => old.speaker_lang != new_snapshot.speaker_lang || old.detected_lang != new_snapshot.detected_lang,
        None => false,
    };

    if language_changed {
        // Flush must use the *old* snapshot: it's still in `state` at this
        // point, since we haven't written `new_snapshot` yet.
        flush_pending(services, user_id, state, deliveries, delivery_permit, "language-change").await;
        reset_context(services, user_id, state, deliveries, "language-change");
    }
    state.last_detected_state = Some(new_snapshot);
    state.first_transcript_emitted = true;

    // 4.5.4 Transcript aggregation
    let has_sentence_end = transcript.chars().any(|c| matches!(c, '.' | '!' | '?' | '…'));
    if state.pending_transcript.is_empty() {
        state.pending_started_at = Some(Instant::now());
        state.pending_transcript = transcript;
    } else {
        state.pending_transcript.push(' ');
        state.pending_transcript.push_str(&transcript);
    }

    let elapsed_ms = state.pending_started_at.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0);
    let len = state.pending_transcript.chars().count();

    let should_flush = (len >= cfg.pending_min_chars && has_sentence_end)
        || (elapsed_ms >= cfg.pending_timeout_ms && len >= 15)
        || (len >= cfg.pending_max_chars);

    if should_flush {
        flush_pending(services, user_id, state, deliveries, delivery_permit, "flush-policy").await;
    }
}

async fn handle_empty_asr(
    services: &Arc<PipelineServices>,
    user_id: &UserId,
    state: &mut SpeakerState,
    deliveries: &mut HashMap<UserId, ListenerDelivery>,
    delivery_permit: &Arc<Semaphore>,
) {
    state.empty_asr_streak += 1;
    if state.empty_asr_streak >= services.config.empty_asr_streak_limit {
        flush_pending(services, user_id, state, deliveries, delivery_permit, "repeated-empty-asr").await;
        reset_context(services, user_id, state, deliveries, "repeated empty ASR");
    }
}

/// §4.5.5 Per-listener delivery, run under the per-speaker delivery
/// semaphore so flushes for the same speaker never interleave their `seq`.
async fn flush_pending(
    services: &Arc<PipelineServices>,
    user_id: &UserId,
    state: &mut SpeakerState,
    deliveries: &mut HashMap<UserId, ListenerDelivery>,
    delivery_permit: &Arc<Semaphore>,
    reason: &str,
) {
    if state.pending_transcript.is_empty() {
        return;
    }
    let full_transcript = std::mem::take(&mut state.pending_transcript);
    state.pending_started_at = None;

    let Some(snapshot) = state.last_detected_state.clone() else {
        return;
    };

    let _permit = delivery_permit.acquire().await.expect("semaphore never closed");
    debug!(%user_id, reason, len = full_transcript.len(), "flushing transcript");
    deliver_to_listeners(services, user_id, state, deliveries, &full_transcript, &snapshot).await;
}

async fn deliver_to_listeners(
    services: &Arc<PipelineServices>,
    user_id: &UserId,
    state: &SpeakerState,
    deliveries: &mut HashMap<UserId, ListenerDelivery>,
    full_transcript: &str,
    snapshot: &DecisionSnapshot,
) {
    let translator = match services.gateway.translator.get().await {
        Ok(t) => t,
        Err(e) => {
            notify_error(services, user_id, Stage::Mt, &e.to_string()).await;
            return;
        }
    };
    let synthesizer = match services.gateway.synthesizer.get().await {
        Ok(s) => s,
        Err(e) => {
            notify_error(services, user_id, Stage::Tts, &e.to_string()).await;
            return;
        }
    };

    let listeners: Vec<UserId> = services
        .registry
        .members(&state.room_id)
        .into_iter()
        .filter(|u| u != user_id)
        .collect();
    if listeners.is_empty() {
        return;
    }

    let voice_reference = services.voice_profiles.resolve(user_id);
    let mut translations: HashMap<String, String> = HashMap::new();

    for listener in &listeners {
        let prefs = services.preferences.read().get(listener).cloned();
        let target_lang = resolve_target_language(prefs.as_ref(), &snapshot.speaker_lang);

        let mt_source = if target_lang == snapshot.speaker_lang
            && snapshot.detected_lang != snapshot.speaker_lang
            && snapshot.detected_conf >= services.config.asr_force_override_threshold
        {
            snapshot.detected_lang.clone()
        } else {
            snapshot.speaker_lang.clone()
        };

        let full_translation = match translations.get(&target_lang) {
            Some(cached) => cached.clone(),
            None => match translator.translate(full_transcript, &mt_source, &target_lang).await {
                Ok(text) => {
                    translations.insert(target_lang.clone(), text.clone());
                    text
                }
                Err(e) => {
                    notify_error(services, user_id, Stage::Mt, &e.to_string()).await;
                    return;
                }
            },
        };

        services
            .registry
            .send_to_user(
                listener,
                ServerMessage::PartialTranslation {
                    from_user_id: user_id.to_string(),
                    text: full_translation.clone(),
                    language: target_lang.clone(),
                    timestamp: now_ms(),
                },
            )
            .await
            .ok();

        let entry = deliveries.entry(listener.clone()).or_default();
        let prev = entry.last_sent_text.get(&target_lang).cloned().unwrap_or_default();
        let delta = compute_delta(&prev, &full_translation);
        if delta.trim().is_empty() {
            continue;
        }

        let synth_result = match synthesizer
            .synthesize(&delta, &target_lang, voice_reference.as_deref())
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(%listener, error = %e, "synthesis failed for listener, delta not advanced");
                continue;
            }
        };

        entry.seq += 1;
        let seq = entry.seq;
        entry.last_sent_text.insert(target_lang.clone(), full_translation.clone());

        let pcm_bytes = f32_to_s16le_bytes(&synth_result.samples);
        let encoded = base64_encode(&pcm_bytes);

        let sent = services
            .registry
            .send_to_user(
                listener,
                ServerMessage::TranslatedAudio {
                    user_id: user_id.to_string(),
                    seq,
                    audio: AudioPayload {
                        data: encoded.clone(),
                        encoding: "pcm_s16le".to_string(),
                        sample_rate: synth_result.sample_rate,
                    },
                    audio_data: encoded,
                    original_text: full_transcript.to_string(),
                    detected_language: snapshot.detected_lang.clone(),
                    text: delta,
                    language: target_lang,
                    voice_fallback: synth_result.voice_fallback,
                    timestamp: now_ms(),
                },
            )
            .await;
        if let Err(e) = sent {
            warn!(%listener, error = %e, "translated_audio delivery failed");
        }
    }
}

/// §4.5.5 step 3: per-listener target language resolution.
fn resolve_target_language(prefs: Option<&ParticipantPrefs>, speaker_lang: &str) -> String {
    let Some(prefs) = prefs else {
        return "en".to_string();
    };
    if is_concrete(&prefs.output_lang) {
        return prefs.output_lang.clone();
    }
    if prefs.understands_pref.iter().any(|l| l == speaker_lang) {
        return speaker_lang.to_string();
    }
    if let Some(first) = prefs.understands_pref.iter().find(|l| is_concrete(l)) {
        return first.clone();
    }
    if is_concrete(&prefs.input_lang) {
        return prefs.input_lang.clone();
    }
    "en".to_string()
}

fn is_concrete(lang: &str) -> bool {
    !lang.is_empty() && lang != "auto"
}

/// §4.5.6 Context reset. Also clears the intake queue so frames already
/// buffered for the discarded context don't re-enter the rolling buffer on
/// the next tick.
fn reset_context(
    services: &Arc<PipelineServices>,
    user_id: &UserId,
    state: &mut SpeakerState,
    deliveries: &mut HashMap<UserId, ListenerDelivery>,
    reason: &str,
) {
    debug!(reason, "resetting speaker context");
    state.rolling_buffer.clear();
    state.pending_transcript.clear();
    state.pending_started_at = None;
    state.last_transcript = None;
    state.speaking = false;
    state.first_transcript_emitted = false;
    state.silence_accum_ms = 0;
    state.empty_asr_streak = 0;
    deliveries.clear();
    services.intake.clear(user_id);
}

async fn notify_error(services: &Arc<PipelineServices>, user_id: &UserId, stage: Stage, message: &str) {
    let _ = services
        .registry
        .send_to_user(
            user_id,
            ServerMessage::TranslationError {
                stage,
                message: message.to_string(),
            },
        )
        .await;
}

// ---- Helpers -----------------------------------------------------------

fn trim_front(buf: &mut Vec<u8>, max_len: usize) {
    if buf.len() > max_len {
        let drop = buf.len() - max_len;
        buf.drain(0..drop);
    }
}

fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
        .collect()
}

fn f32_to_s16le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let v = (clamped * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
    ((sum_sq / samples.len() as f64).sqrt()) as f32
}

/// Gain up to `max_gain`x toward `target` RMS, clipping to `[-1, 1]`.
/// Returns the recomputed RMS after gain.
fn apply_agc(samples: &mut [f32], target: f32, max_gain: f32) -> f32 {
    let rms = compute_rms(samples);
    if rms <= 0.0 {
        return rms;
    }
    let gain = (target / rms).min(max_gain);
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
    compute_rms(samples)
}

fn is_punctuation_only(text: &str) -> bool {
    text.chars().all(|c| !c.is_alphanumeric())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn primary_subtag(tag: &str) -> String {
    tag.split(['-', '_']).next().unwrap_or(tag).to_ascii_lowercase()
}

/// §4.5.2 language decision.
fn decide_language(state: &mut SpeakerState, detected_primary: &str, detected_conf: f32, cfg: &RelayConfig) -> String {
    let concrete_input = is_concrete(&state.input_lang).then(|| state.input_lang.clone());

    let mut chosen = if let Some(concrete) = &concrete_input {
        concrete.clone()
    } else if detected_conf >= cfg.asr_detect_conf_threshold {
        detected_primary.to_string()
    } else if let Some(last_good) = &state.last_good_input {
        last_good.clone()
    } else {
        state
            .speaks_pref
            .iter()
            .find(|l| is_concrete(l))
            .cloned()
            .unwrap_or_else(|| "en".to_string())
    };

    if concrete_input.is_none() && detected_conf < cfg.asr_detect_conf_threshold && chosen == detected_primary {
        chosen = state
            .last_good_input
            .clone()
            .or_else(|| state.speaks_pref.iter().find(|l| is_concrete(l)).cloned())
            .unwrap_or_else(|| "en".to_string());
    }

    if concrete_input.is_some() || detected_conf >= cfg.asr_detect_conf_threshold {
        state.last_good_input = Some(chosen.clone());
    }

    chosen
}

/// Suffix of `full` that is not already covered by `prev`. If `full`
/// doesn't start with `prev`, the whole thing is new.
fn compute_delta(prev: &str, full: &str) -> String {
    if prev.is_empty() {
        return full.to_string();
    }
    if let Some(suffix) = full.strip_prefix(prev) {
        suffix.to_string()
    } else {
        full.to_string()
    }
}

fn is_hallucination(text: &str) -> bool {
    let tokens: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect();
    let len = tokens.len();

    if len >= 30 {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for t in &tokens {
            *counts.entry(*t).or_insert(0) += 1;
        }
        if let Some(&max) = counts.values().max() {
            if max as f32 / len as f32 >= 0.30 {
                return true;
            }
        }
    }

    if len >= 40 {
        let unique: std::collections::HashSet<&str> = tokens.iter().copied().collect();
        if unique.len() as f32 / len as f32 <= 0.45 {
            return true;
        }
    }

    if len >= 24 {
        let bigram_count = len - 1;
        let mut counts: HashMap<(&str, &str), usize> = HashMap::new();
        for w in tokens.windows(2) {
            *counts.entry((w[0], w[1])).or_insert(0) += 1;
        }
        if let Some(&max) = counts.values().max() {
            if bigram_count > 0 && max as f32 / bigram_count as f32 >= 0.40 {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(compute_rms(&[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn agc_boosts_quiet_signal_toward_target() {
        let mut samples = vec![0.001f32; 100];
        let rms = apply_agc(&mut samples, 0.010, 4.0);
        assert!(rms > 0.001);
    }

    #[test]
    fn compute_delta_returns_suffix_when_prefix_matches() {
        assert_eq!(compute_delta("hello world.", "hello world. how are you?"), " how are you?");
    }

    #[test]
    fn compute_delta_returns_whole_text_when_prefix_mismatches() {
        assert_eq!(compute_delta("goodbye", "hello world."), "hello world.");
    }

    #[test]
    fn hallucination_flags_repeated_token_run() {
        let repeated = "what's ".repeat(32);
        assert!(is_hallucination(&repeated));
    }

    #[test]
    fn hallucination_does_not_flag_normal_prose() {
        let text = "the quick brown fox jumps over the lazy dog near the riverbank at dawn";
        assert!(!is_hallucination(text));
    }

    #[test]
    fn primary_subtag_strips_region() {
        assert_eq!(primary_subtag("pt-BR"), "pt");
        assert_eq!(primary_subtag("en"), "en");
    }

    #[test]
    fn decide_language_prefers_concrete_input() {
        let mut state = SpeakerState::new(RoomId::new("r"), "fr".to_string(), "en".to_string(), vec![], vec![]);
        let cfg = RelayConfig::default();
        let chosen = decide_language(&mut state, "es", 0.9, &cfg);
        assert_eq!(chosen, "fr");
    }

    #[test]
    fn decide_language_falls_back_to_last_good_on_low_confidence() {
        let mut state = SpeakerState::new(
            RoomId::new("r"),
            "auto".to_string(),
            "en".to_string(),
            vec!["de".to_string()],
            vec![],
        );
        state.last_good_input = Some("de".to_string());
        let cfg = RelayConfig::default();
        let chosen = decide_language(&mut state, "es", 0.2, &cfg);
        assert_eq!(chosen, "de");
    }

    #[test]
    fn resolve_target_language_prefers_concrete_output_lang() {
        let prefs = ParticipantPrefs {
            input_lang: "auto".to_string(),
            output_lang: "es".to_string(),
            understands_pref: vec!["en".to_string()],
        };
        assert_eq!(resolve_target_language(Some(&prefs), "en"), "es");
    }

    #[test]
    fn resolve_target_language_falls_back_to_speaker_lang_when_understood() {
        let prefs = ParticipantPrefs {
            input_lang: "auto".to_string(),
            output_lang: "auto".to_string(),
            understands_pref: vec!["pt".to_string(), "en".to_string()],
        };
        assert_eq!(resolve_target_language(Some(&prefs), "pt"), "pt");
    }

    #[test]
    fn resolve_target_language_defaults_to_english_without_prefs() {
        assert_eq!(resolve_target_language(None, "pt"), "en");
    }

    #[test]
    fn reset_context_clears_pending_state_and_deliveries() {
        let services = test_services();
        let user = UserId::new("x");
        let mut state = SpeakerState::new(RoomId::new("r"), "en".into(), "en".into(), vec![], vec![]);
        state.pending_transcript = "hello".to_string();
        state.speaking = true;
        let mut deliveries = HashMap::new();
        deliveries.insert(user.clone(), ListenerDelivery::default());
        reset_context(&services, &user, &mut state, &mut deliveries, "test");
        assert!(state.pending_transcript.is_empty());
        assert!(!state.speaking);
        assert!(deliveries.is_empty());
    }

    #[test]
    fn reset_context_clears_pending_intake_bytes() {
        let services = test_services();
        let user = UserId::new("x");
        services.intake.push(&user, &[1, 2, 3, 4]);
        let mut state = SpeakerState::new(RoomId::new("r"), "en".into(), "en".into(), vec![], vec![]);
        let mut deliveries = HashMap::new();
        reset_context(&services, &user, &mut state, &mut deliveries, "test");
        assert!(services.intake.drain(&user).is_empty());
    }

    // ---- Scenario helpers ----------------------------------------------

    fn test_services() -> Arc<PipelineServices> {
        Arc::new(PipelineServices {
            registry: Arc::new(Registry::new(Duration::from_millis(200))),
            intake: Arc::new(IntakeBuffer::new(16_000, 2000)),
            gateway: Arc::new(ModelGateway::stub(Duration::from_secs(3600))),
            voice_profiles: Arc::new(VoiceProfileResolver::new(std::env::temp_dir())),
            preferences: Arc::new(RwLock::new(HashMap::new())),
            config: RelayConfig::default(),
        })
    }

    fn join_room(services: &PipelineServices, user: &UserId, room: &RoomId) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(32);
        services.registry.register(user.clone(), room.clone(), tx);
        rx
    }

    fn set_prefs(services: &PipelineServices, user: &UserId, output_lang: &str, understands: &[&str]) {
        services.preferences.write().insert(
            user.clone(),
            ParticipantPrefs {
                input_lang: "auto".to_string(),
                output_lang: output_lang.to_string(),
                understands_pref: understands.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    /// `ms` of constant-amplitude s16le PCM. `level` outside `(0.0002,
    /// 0.0045)` and above `silence_rms_threshold` is treated as speech by
    /// the rolling-buffer gate without tripping the quiet-signal AGC path.
    fn pcm_chunk(level: f32, ms: u64, sample_rate: u32) -> Vec<u8> {
        let n = (sample_rate as u64 * ms / 1000) as usize;
        let value = (level.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        let mut out = Vec::with_capacity(n * 2);
        for _ in 0..n {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    fn snapshot(lang: &str) -> DecisionSnapshot {
        DecisionSnapshot {
            speaker_lang: lang.to_string(),
            detected_lang: lang.to_string(),
            detected_conf: 0.95,
        }
    }

    // ---- S1: single-listener happy path --------------------------------

    #[tokio::test]
    async fn s1_single_listener_happy_path() {
        let services = test_services();
        let room = RoomId::new("room-s1");
        let speaker = UserId::new("speaker");
        let listener = UserId::new("listener");
        let mut listener_rx = join_room(&services, &listener, &room);
        let _speaker_rx = join_room(&services, &speaker, &room);
        set_prefs(&services, &listener, "es", &[]);

        let state = SpeakerState::new(room, "en".to_string(), "en".to_string(), vec![], vec![]);
        let mut deliveries = HashMap::new();
        deliver_to_listeners(&services, &speaker, &state, &mut deliveries, "hello world.", &snapshot("en")).await;

        match listener_rx.recv().await.unwrap() {
            ServerMessage::PartialTranslation { text, language, .. } => {
                assert_eq!(text, "[es] hello world.");
                assert_eq!(language, "es");
            }
            other => panic!("expected partial_translation, got {other:?}"),
        }
        match listener_rx.recv().await.unwrap() {
            ServerMessage::TranslatedAudio { seq, text, language, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(text, "[es] hello world.");
                assert_eq!(language, "es");
            }
            other => panic!("expected translated_audio, got {other:?}"),
        }
        assert_eq!(deliveries.get(&listener).unwrap().seq, 1);
    }

    // ---- S2: incremental delta on the second flush ----------------------

    #[tokio::test]
    async fn s2_second_flush_sends_delta_only() {
        let services = test_services();
        let room = RoomId::new("room-s2");
        let speaker = UserId::new("speaker");
        let listener = UserId::new("listener");
        let mut listener_rx = join_room(&services, &listener, &room);
        let _speaker_rx = join_room(&services, &speaker, &room);
        set_prefs(&services, &listener, "es", &[]);

        let state = SpeakerState::new(room, "en".to_string(), "en".to_string(), vec![], vec![]);
        let mut deliveries = HashMap::new();
        deliver_to_listeners(&services, &speaker, &state, &mut deliveries, "hello world.", &snapshot("en")).await;
        listener_rx.recv().await.unwrap(); // partial_translation
        listener_rx.recv().await.unwrap(); // translated_audio seq=1

        deliver_to_listeners(
            &services,
            &speaker,
            &state,
            &mut deliveries,
            "hello world. how are you?",
            &snapshot("en"),
        )
        .await;
        listener_rx.recv().await.unwrap(); // partial_translation

        match listener_rx.recv().await.unwrap() {
            ServerMessage::TranslatedAudio { seq, text, .. } => {
                assert_eq!(seq, 2);
                assert_eq!(text, " how are you?");
            }
            other => panic!("expected translated_audio, got {other:?}"),
        }
        assert_eq!(
            deliveries.get(&listener).unwrap().last_sent_text.get("es").unwrap(),
            "[es] hello world. how are you?"
        );
    }

    // ---- S3: multi-listener fan-out, shared MT call, isolated failure --

    #[tokio::test]
    async fn s3_shared_target_language_and_failure_isolation() {
        let services = test_services();
        let room = RoomId::new("room-s3");
        let speaker = UserId::new("speaker");
        let listener_b = UserId::new("listener-b");
        let listener_c = UserId::new("listener-c");
        let mut rx_b = join_room(&services, &listener_b, &room);
        let _speaker_rx = join_room(&services, &speaker, &room);
        set_prefs(&services, &listener_b, "es", &[]);
        set_prefs(&services, &listener_c, "es", &[]);
        services.registry.register(listener_c.clone(), room.clone(), {
            let (tx, rx) = mpsc::channel(32);
            drop(rx); // closed immediately: every send to listener_c fails
            tx
        });

        let state = SpeakerState::new(room, "en".to_string(), "en".to_string(), vec![], vec![]);
        let mut deliveries = HashMap::new();
        deliver_to_listeners(&services, &speaker, &state, &mut deliveries, "hello world.", &snapshot("en")).await;

        match rx_b.recv().await.unwrap() {
            ServerMessage::PartialTranslation { text, language, .. } => {
                assert_eq!(text, "[es] hello world.");
                assert_eq!(language, "es");
            }
            other => panic!("expected partial_translation, got {other:?}"),
        }
        match rx_b.recv().await.unwrap() {
            ServerMessage::TranslatedAudio { seq, text, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(text, "[es] hello world.");
            }
            other => panic!("expected translated_audio, got {other:?}"),
        }
        // Both listeners shared one cached translation for "es"; listener_b
        // still got its full delivery despite listener_c's dead channel.
        assert_eq!(deliveries.get(&listener_b).unwrap().seq, 1);
    }

    // ---- S4: hallucination guard ----------------------------------------

    #[tokio::test]
    async fn s4_hallucination_resets_without_delivery() {
        let services = test_services();
        let room = RoomId::new("room-s4");
        let speaker = UserId::new("speaker");
        let listener = UserId::new("listener");
        let mut listener_rx = join_room(&services, &listener, &room);
        let _speaker_rx = join_room(&services, &speaker, &room);

        let mut state = SpeakerState::new(room, "en".to_string(), "en".to_string(), vec![], vec![]);
        state.last_transcript = Some(("old transcript".to_string(), Instant::now()));
        state.speaking = true;
        let mut deliveries = HashMap::new();
        deliveries.insert(listener.clone(), ListenerDelivery::default());

        let repeated = "what's ".repeat(32);
        assert!(is_hallucination(&repeated));
        reset_context(&services, &speaker, &mut state, &mut deliveries, "hallucinated repetition");

        assert!(state.last_transcript.is_none());
        assert!(deliveries.is_empty());
        assert!(listener_rx.try_recv().is_err());
    }

    // ---- S5: end-of-speech flushes before reset, near-silence discards --

    #[tokio::test]
    async fn s5_end_of_speech_flushes_pending_before_reset() {
        let services = test_services();
        let room = RoomId::new("room-s5");
        let speaker = UserId::new("speaker");
        let listener = UserId::new("listener");
        let mut listener_rx = join_room(&services, &listener, &room);
        let _speaker_rx = join_room(&services, &speaker, &room);
        set_prefs(&services, &listener, "es", &[]);

        let mut state = SpeakerState::new(room, "en".to_string(), "en".to_string(), vec![], vec![]);
        let mut deliveries = HashMap::new();
        let delivery_permit = Arc::new(Semaphore::new(1));

        // Enough speech to cross min_first_utterance_ms and accumulate a
        // pending transcript that hasn't met the flush-policy thresholds yet.
        services.intake.push(&speaker, &pcm_chunk(0.05, 500, 16_000));
        tick(&services, &speaker, &mut state, &mut deliveries, &delivery_permit).await;
        assert!(state.speaking);
        assert!(!state.pending_transcript.is_empty());

        // 2.1s of near-silence while `speaking` is true: must flush the
        // pending transcript (one partial_translation + translated_audio)
        // before resetting, not discard it.
        services.intake.push(&speaker, &pcm_chunk(0.0, 2100, 16_000));
        tick(&services, &speaker, &mut state, &mut deliveries, &delivery_permit).await;

        assert!(state.pending_transcript.is_empty());
        assert!(!state.speaking);
        assert!(deliveries.is_empty());

        listener_rx.recv().await.unwrap(); // partial_transcript from tick 1
        match listener_rx.recv().await.unwrap() {
            ServerMessage::PartialTranslation { .. } => {}
            other => panic!("expected partial_translation from end-of-speech flush, got {other:?}"),
        }
        match listener_rx.recv().await.unwrap() {
            ServerMessage::TranslatedAudio { seq, .. } => assert_eq!(seq, 1),
            other => panic!("expected translated_audio from end-of-speech flush, got {other:?}"),
        }

        // Next utterance after the reset uses the first-utterance threshold
        // again: a chunk under 450ms must not be transcribed.
        services.intake.push(&speaker, &pcm_chunk(0.05, 300, 16_000));
        tick(&services, &speaker, &mut state, &mut deliveries, &delivery_permit).await;
        assert!(state.pending_transcript.is_empty());
        assert!(!state.first_transcript_emitted);
    }

    #[tokio::test]
    async fn s5_prolonged_near_silence_without_speech_discards_and_does_not_flush() {
        let services = test_services();
        let room = RoomId::new("room-s5b");
        let speaker = UserId::new("speaker");
        let listener = UserId::new("listener");
        let mut listener_rx = join_room(&services, &listener, &room);
        let _speaker_rx = join_room(&services, &speaker, &room);

        let mut state = SpeakerState::new(room, "en".to_string(), "en".to_string(), vec![], vec![]);
        state.pending_transcript = "stale fragment".to_string();
        let mut deliveries = HashMap::new();
        let delivery_permit = Arc::new(Semaphore::new(1));

        // Never marked `speaking`: 1.3s of silence alone crosses
        // `silence_reset_ms` and must discard without flushing.
        services.intake.push(&speaker, &pcm_chunk(0.0, 1300, 16_000));
        tick(&services, &speaker, &mut state, &mut deliveries, &delivery_permit).await;

        assert!(state.pending_transcript.is_empty());
        assert!(listener_rx.try_recv().is_err());
    }

    // ---- S6: muted speaker suppresses output, unmute starts fresh -------

    #[tokio::test]
    async fn s6_muted_speaker_buffers_without_output_then_unmute_resets() {
        let services = test_services();
        let room = RoomId::new("room-s6");
        let speaker = UserId::new("speaker");
        let listener = UserId::new("listener");
        let mut listener_rx = join_room(&services, &listener, &room);
        let _speaker_rx = join_room(&services, &speaker, &room);

        let mut state = SpeakerState::new(room, "en".to_string(), "en".to_string(), vec![], vec![]);
        state.muted = true;
        let mut deliveries = HashMap::new();
        let delivery_permit = Arc::new(Semaphore::new(1));

        services.intake.push(&speaker, &pcm_chunk(0.05, 500, 16_000));
        tick(&services, &speaker, &mut state, &mut deliveries, &delivery_permit).await;

        // Muted: the transcript is still recognized (partial_transcript is
        // emitted before the mute check) but nothing downstream of it runs.
        listener_rx.recv().await.unwrap(); // partial_transcript
        assert!(listener_rx.try_recv().is_err());
        assert!(state.pending_transcript.is_empty());

        state.muted = false;
        reset_context(&services, &speaker, &mut state, &mut deliveries, "unmute");
        assert!(state.rolling_buffer.is_empty());
        assert!(!state.speaking);
    }
}
