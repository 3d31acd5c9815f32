//! ID generation for tasks and events.

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Prefix of generated task ids.
pub const TASK_PREFIX: &str = "tk";

/// Prefix of generated event ids.
pub const EVENT_PREFIX: &str = "ev";

/// Generate a unique ID from a seed + timestamp + entropy.
/// Format: prefix + "-" + 16 hex chars of SHA256(seed + timestamp + random)
pub fn generate_id(prefix: &str, seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    // 16 bytes of randomness
    hasher.update(rand::rng().random::<[u8; 16]>());
    let hash = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    format!("{}-{:016x}", prefix, u64::from_be_bytes(head))
}

/// Generate a fresh task id for the given action.
pub fn task_id(action: &str) -> String {
    generate_id(TASK_PREFIX, action)
}

/// Generate a fresh event id within a task.
pub fn event_id(task_id: &str) -> String {
    generate_id(EVENT_PREFIX, task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_format() {
        let id = task_id("svc:echo");
        assert!(id.starts_with("tk-"));
        assert_eq!(id.len(), 19); // "tk-" + 16 hex chars
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let id1 = event_id("tk-same");
        let id2 = event_id("tk-same");
        // Due to random component, same inputs should produce different IDs
        assert_ne!(id1, id2);
    }
}
