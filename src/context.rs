//! Composition root
//!
//! Builds every long-lived service once and hands out `Arc` clones, rather
//! than reaching for module-level globals the way `tts::TTSRegistry` does
//! (see §9 on the DI-over-singleton split).

use crate::config::RelayConfig;
use crate::coordinator::RoomCoordinator;
use crate::gateway::ModelGateway;
use crate::intake::IntakeBuffer;
use crate::pipeline::PipelineServices;
use crate::protocol::ServerMessage;
use crate::registry::Registry;
use crate::voice_profile::VoiceProfileResolver;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct AppContext {
    pub services: Arc<PipelineServices>,
    pub coordinator: Arc<RoomCoordinator>,
}

impl AppContext {
    pub fn new(config: RelayConfig, voices_dir: impl Into<std::path::PathBuf>) -> Self {
        let registry = Arc::new(Registry::<ServerMessage>::new(Duration::from_millis(config.send_timeout_ms)));
        let intake = Arc::new(IntakeBuffer::new(config.input_sample_rate, config.intake_max_ms));
        let gateway = Arc::new(ModelGateway::stub(Duration::from_secs(config.idle_unload_s)));
        let voice_profiles = Arc::new(VoiceProfileResolver::new(voices_dir));
        let preferences = Arc::new(RwLock::new(HashMap::new()));

        let services = Arc::new(PipelineServices {
            registry,
            intake,
            gateway,
            voice_profiles,
            preferences,
            config,
        });
        let coordinator = Arc::new(RoomCoordinator::new(services.clone()));

        Self { services, coordinator }
    }

    /// Spawn the idle-unload background tasks for the model gateway.
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.services.gateway.spawn_idle_unload_tasks(Duration::from_secs(60))
    }
}
