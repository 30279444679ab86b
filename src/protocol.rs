//! Wire protocol
//!
//! Tagged JSON message envelopes for the per-user transport channel,
//! exported to TypeScript the way the source tree's `CallMessage` is.

use crate::error::Stage;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../generated/ClientMessage.ts")]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    InitSettings {
        input_language: String,
        output_language: String,
        speaks_languages: Vec<String>,
        understands_languages: Vec<String>,
    },
    AudioChunk {
        audio_data: String,
    },
    LanguageUpdate {
        input_language: String,
        output_language: String,
        #[serde(default)]
        speaks_languages: Option<Vec<String>>,
        #[serde(default)]
        understands_languages: Option<Vec<String>>,
    },
    Control {
        action: ControlAction,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Mute,
    Unmute,
    PauseTranslation,
    ResumeTranslation,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ParticipantInfo {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct AudioPayload {
    pub data: String,
    pub encoding: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../generated/ServerMessage.ts")]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        user_id: String,
        room_id: String,
        message: String,
    },
    ParticipantJoined {
        user_id: String,
        participants: Vec<ParticipantInfo>,
    },
    ParticipantLeft {
        user_id: String,
        participants: Vec<ParticipantInfo>,
    },
    PartialTranscript {
        user_id: String,
        text: String,
        language: String,
        timestamp: u64,
    },
    PartialTranslation {
        from_user_id: String,
        text: String,
        language: String,
        timestamp: u64,
    },
    TranslatedAudio {
        user_id: String,
        seq: u64,
        audio: AudioPayload,
        /// Deprecated mirror of `audio.data`; kept byte-identical until
        /// clients migrate to the structured field.
        audio_data: String,
        original_text: String,
        detected_language: String,
        text: String,
        language: String,
        voice_fallback: bool,
        timestamp: u64,
    },
    LanguageUpdated {
        input_language: String,
        output_language: String,
        message: String,
    },
    TranslationError {
        stage: Stage,
        message: String,
    },
    MuteStatus {
        muted: bool,
    },
    TranslationStatus {
        paused: bool,
    },
    Pong,
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
