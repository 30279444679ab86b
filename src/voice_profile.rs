//! Voice Profile Resolver
//!
//! Resolves a user's speaker-reference WAV for synthesis: a registered
//! metadata record if present and ready, otherwise the conventional
//! `<voices>/<user_id>.wav` path if that file exists on disk, otherwise
//! `None` (the pipeline then falls back to a default voice).

use crate::ids::UserId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Metadata for an uploaded voice profile, mirroring the source system's
/// `VoiceProfile` record (`model_path`, `is_ready`).
#[derive(Debug, Clone)]
pub struct VoiceProfileRecord {
    pub model_path: PathBuf,
    pub is_ready: bool,
}

pub struct VoiceProfileResolver {
    voices_dir: PathBuf,
    records: RwLock<HashMap<UserId, VoiceProfileRecord>>,
}

impl VoiceProfileResolver {
    pub fn new(voices_dir: impl Into<PathBuf>) -> Self {
        Self {
            voices_dir: voices_dir.into(),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a user's voice profile metadata.
    pub fn register(&self, user_id: UserId, record: VoiceProfileRecord) {
        self.records.write().insert(user_id, record);
    }

    pub fn remove(&self, user_id: &UserId) {
        self.records.write().remove(user_id);
    }

    /// Resolve the speaker-reference path for `user_id`, if any.
    pub fn resolve(&self, user_id: &UserId) -> Option<PathBuf> {
        if let Some(record) = self.records.read().get(user_id) {
            if record.is_ready {
                return Some(record.model_path.clone());
            }
        }
        self.default_path(user_id)
    }

    fn default_path(&self, user_id: &UserId) -> Option<PathBuf> {
        let path = self.voices_dir.join(format!("{}.wav", user_id.as_str()));
        path_exists(&path).then_some(path)
    }
}

fn path_exists(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn resolves_registered_ready_profile_without_touching_disk() {
        let resolver = VoiceProfileResolver::new("/nonexistent");
        let user = UserId::new("alice");
        resolver.register(
            user.clone(),
            VoiceProfileRecord {
                model_path: PathBuf::from("/models/alice-v2.wav"),
                is_ready: true,
            },
        );
        assert_eq!(
            resolver.resolve(&user),
            Some(PathBuf::from("/models/alice-v2.wav"))
        );
    }

    #[test]
    fn falls_back_to_default_path_when_not_ready() {
        let dir = std::env::temp_dir().join(format!("relay-voices-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let user = UserId::new("bob");
        fs::write(dir.join("bob.wav"), b"RIFF....").unwrap();

        let resolver = VoiceProfileResolver::new(&dir);
        resolver.register(
            user.clone(),
            VoiceProfileRecord {
                model_path: PathBuf::from("/models/bob-pending.wav"),
                is_ready: false,
            },
        );
        assert_eq!(resolver.resolve(&user), Some(dir.join("bob.wav")));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn returns_none_when_nothing_registered_and_no_default_file() {
        let dir = std::env::temp_dir().join(format!("relay-voices-empty-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let resolver = VoiceProfileResolver::new(&dir);
        assert_eq!(resolver.resolve(&UserId::new("ghost")), None);
        fs::remove_dir_all(&dir).ok();
    }
}
