//! Room Coordinator
//!
//! Thin layer the transport invokes on connect/disconnect/control: registers
//! the user's channel with the Registry, starts/stops their speaker task,
//! and keeps the room roster used for `participant_joined`/`participant_left`.

use crate::ids::{RoomId, UserId};
use crate::pipeline::{PipelineServices, SpeakerCommand, SpeakerInit, SpeakerTask};
use crate::protocol::{ParticipantInfo, ServerMessage};
use crate::registry::Registry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ParticipantIdentity {
    pub username: String,
    pub full_name: String,
}

pub struct RoomCoordinator {
    services: Arc<PipelineServices>,
    speakers: RwLock<HashMap<UserId, SpeakerTask>>,
    identities: RwLock<HashMap<UserId, ParticipantIdentity>>,
}

impl RoomCoordinator {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self {
            services,
            speakers: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry<ServerMessage>> {
        &self.services.registry
    }

    /// Register the channel, start the speaker task with `auto` preferences
    /// (normalized on the first `init_settings`/`language_update`), and
    /// broadcast `participant_joined`.
    pub async fn join(
        &self,
        user_id: UserId,
        room_id: RoomId,
        identity: ParticipantIdentity,
        channel: mpsc::Sender<ServerMessage>,
    ) {
        self.services.registry.register(user_id.clone(), room_id.clone(), channel);
        self.identities.write().insert(user_id.clone(), identity);

        let task = SpeakerTask::spawn(
            self.services.clone(),
            SpeakerInit {
                user_id: user_id.clone(),
                room_id: room_id.clone(),
                input_lang: "auto".to_string(),
                output_lang: "auto".to_string(),
                speaks_pref: Vec::new(),
                understands_pref: Vec::new(),
            },
        );
        self.speakers.write().insert(user_id.clone(), task);

        info!(%user_id, %room_id, "participant joined");
        self.broadcast_roster(&room_id, &user_id, true).await;
    }

    pub async fn leave(&self, user_id: &UserId, room_id: &RoomId, channel: &mpsc::Sender<ServerMessage>) {
        self.services.registry.unregister(user_id, channel);
        self.services.intake.remove(user_id);
        self.identities.write().remove(user_id);
        if let Some(task) = self.speakers.write().remove(user_id) {
            task.stop().await;
        }
        info!(%user_id, %room_id, "participant left");
        self.broadcast_roster(room_id, user_id, false).await;
    }

    pub async fn update_languages(
        &self,
        user_id: &UserId,
        input_lang: String,
        output_lang: String,
        speaks_pref: Option<Vec<String>>,
        understands_pref: Option<Vec<String>>,
    ) {
        let command = SpeakerCommand::UpdateLanguages {
            input_lang: normalize_lang(&input_lang),
            output_lang: normalize_lang(&output_lang),
            speaks_pref: speaks_pref.map(|tags| tags.iter().map(|t| normalize_lang(t)).collect()),
            understands_pref: understands_pref.map(|tags| tags.iter().map(|t| normalize_lang(t)).collect()),
        };
        if let Some(task) = self.speakers.read().get(user_id) {
            task.send(command).await;
        }
    }

    pub async fn set_muted(&self, user_id: &UserId, muted: bool) {
        if let Some(task) = self.speakers.read().get(user_id) {
            task.send(SpeakerCommand::SetMuted(muted)).await;
        }
    }

    pub async fn set_paused(&self, user_id: &UserId, paused: bool) {
        if let Some(task) = self.speakers.read().get(user_id) {
            task.send(SpeakerCommand::SetPaused(paused)).await;
        }
    }

    pub fn push_audio(&self, user_id: &UserId, pcm_bytes: Vec<u8>) {
        self.services.intake.push(user_id, &pcm_bytes);
    }

    async fn broadcast_roster(&self, room_id: &RoomId, subject: &UserId, joined: bool) {
        let members = self.services.registry.members(room_id);
        let participants: Vec<ParticipantInfo> = {
            let identities = self.identities.read();
            members
                .iter()
                .filter_map(|id| {
                    identities.get(id).map(|identity| ParticipantInfo {
                        id: id.to_string(),
                        username: identity.username.clone(),
                        full_name: identity.full_name.clone(),
                        name: identity.full_name.clone(),
                    })
                })
                .collect()
        };

        let message = if joined {
            ServerMessage::ParticipantJoined {
                user_id: subject.to_string(),
                participants,
            }
        } else {
            ServerMessage::ParticipantLeft {
                user_id: subject.to_string(),
                participants,
            }
        };
        self.services.registry.send_to_room(room_id, message, None).await;
    }
}

/// `pt-BR` -> `pt`; `auto`/empty pass through as `auto`.
pub fn normalize_lang(tag: &str) -> String {
    if tag.is_empty() || tag.eq_ignore_ascii_case("auto") {
        return "auto".to_string();
    }
    tag.split(['-', '_']).next().unwrap_or(tag).to_ascii_lowercase()
}
