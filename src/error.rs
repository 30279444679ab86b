//! Error taxonomy
//!
//! One `thiserror` enum per component boundary, matching the source tree's
//! `PipelineError`/`AdapterError`/`VADError` convention.

use thiserror::Error;
use ts_rs::TS;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("user not present: {0}")]
    UserNotPresent(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("send timed out")]
    SendTimeout,

    #[error("channel closed")]
    ChannelClosed,
}

/// Which model gateway a failure occurred in, surfaced to the client in
/// `translation_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, TS)]
#[ts(export, export_to = "../generated/Stage.ts")]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Asr,
    Mt,
    Tts,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Asr => write!(f, "asr"),
            Stage::Mt => write!(f, "mt"),
            Stage::Tts => write!(f, "tts"),
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("model not loaded: {0}")]
    NotLoaded(String),

    #[error("load failed: {0}")]
    LoadFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("{stage} gateway unavailable: {message}")]
    GatewayUnavailable { stage: Stage, message: String },

    #[error("speaker task already running")]
    AlreadyRunning,

    #[error("intake channel closed")]
    IntakeClosed,
}
