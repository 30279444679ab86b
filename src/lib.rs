//! Relay core
//!
//! Real-time multilingual audio relay: participants join a room over a
//! bidirectional message channel, stream microphone audio, and hear each
//! other in their preferred language, spoken in the original speaker's
//! cloned voice.
//!
//! # Architecture
//!
//! ```text
//! transport (WebSocket) -> coordinator -> registry (fan-out)
//!                              |
//!                         pipeline (one task per active speaker)
//!                              |
//!                    gateway (recognizer/translator/synthesizer)
//! ```
//!
//! Everything downstream of the transport is generic over the outbound
//! message type and owns no global state; `context::AppContext` is the one
//! composition root.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod intake;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod voice_profile;

pub use config::RelayConfig;
pub use context::AppContext;
pub use coordinator::RoomCoordinator;
pub use error::{GatewayError, PipelineError, RegistryError, Stage};
pub use gateway::ModelGateway;
pub use ids::{RoomId, UserId};
pub use intake::IntakeBuffer;
pub use pipeline::{PipelineServices, SpeakerCommand, SpeakerInit, SpeakerState, SpeakerTask};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::Registry;
pub use voice_profile::VoiceProfileResolver;
