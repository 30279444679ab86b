//! Audio Intake Buffer
//!
//! Decouples transport receive from pipeline processing: raw PCM bytes
//! arriving off the WebSocket are pushed here and drained by the speaker's
//! pipeline task on its own schedule.

use crate::ids::UserId;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::warn;

const BYTES_PER_SAMPLE: usize = 2; // s16le

struct Queue {
    bytes: Vec<u8>,
}

/// Bounded per-user PCM byte queue, capped at roughly `max_ms` of audio at
/// `sample_rate`. Oldest bytes are dropped once the cap is exceeded so a
/// stalled pipeline task can't grow memory without bound.
pub struct IntakeBuffer {
    queues: RwLock<HashMap<UserId, Queue>>,
    max_bytes: usize,
}

impl IntakeBuffer {
    pub fn new(sample_rate: u32, max_ms: u64) -> Self {
        let max_bytes = (sample_rate as u64 * max_ms / 1000) as usize * BYTES_PER_SAMPLE;
        Self {
            queues: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    /// Append `bytes` to `user_id`'s queue, trimming from the front if the
    /// cap is exceeded.
    pub fn push(&self, user_id: &UserId, bytes: &[u8]) {
        let mut queues = self.queues.write();
        let queue = queues.entry(user_id.clone()).or_insert_with(|| Queue { bytes: Vec::new() });
        queue.bytes.extend_from_slice(bytes);

        if queue.bytes.len() > self.max_bytes {
            let overflow = queue.bytes.len() - self.max_bytes;
            warn!(%user_id, overflow, "intake buffer over cap, dropping oldest frames");
            queue.bytes.drain(0..overflow);
        }
    }

    /// Atomically remove and return all buffered bytes for `user_id`.
    pub fn drain(&self, user_id: &UserId) -> Vec<u8> {
        let mut queues = self.queues.write();
        match queues.get_mut(user_id) {
            Some(queue) => std::mem::take(&mut queue.bytes),
            None => Vec::new(),
        }
    }

    /// Empty `user_id`'s queue without removing it (used on stop and on
    /// hallucination reset).
    pub fn clear(&self, user_id: &UserId) {
        if let Some(queue) = self.queues.write().get_mut(user_id) {
            queue.bytes.clear();
        }
    }

    /// Drop `user_id`'s queue entirely (used on disconnect).
    pub fn remove(&self, user_id: &UserId) {
        self.queues.write().remove(user_id);
    }
}
