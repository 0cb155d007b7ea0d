//! Content-addressed summarization memo.
//!
//! A summarization job is identified by the digest of its inputs; a repeated
//! job returns the prior summary verbatim. Digest collisions are treated as
//! logical identity.

use sha2::{Digest, Sha256};
use tracing::warn;

use govorun_storage::StorageRouter;

/// Digest over `(chat_id, topic_id, first_msg_id, last_msg_id, prompt)`,
/// rendered as lowercase hex. Fields are length-prefixed so adjacent fields
/// cannot alias each other.
pub fn csid(
    chat_id: i64,
    topic_id: i64,
    first_msg_id: &str,
    last_msg_id: &str,
    prompt: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chat_id.to_le_bytes());
    hasher.update(topic_id.to_le_bytes());
    for part in [first_msg_id, last_msg_id, prompt] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Memoized lookup. A storage failure is a miss.
pub fn lookup(router: &StorageRouter, csid: &str) -> Option<String> {
    match router.summary_get(csid) {
        Ok(hit) => hit,
        Err(e) => {
            warn!(csid, error = %e, "summary lookup failed; treating as miss");
            None
        }
    }
}

/// Record a produced summary. A storage failure only warns.
pub fn store(router: &StorageRouter, csid: &str, summary: &str) {
    let now = chrono::Utc::now().timestamp();
    if let Err(e) = router.summary_set(csid, summary, now, None) {
        warn!(csid, error = %e, "summary store failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csid_is_deterministic() {
        let a = csid(-100, 0, "m1", "m9", "summarize briefly");
        let b = csid(-100, 0, "m1", "m9", "summarize briefly");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn csid_differs_per_input() {
        let base = csid(-100, 0, "m1", "m9", "p");
        assert_ne!(base, csid(-101, 0, "m1", "m9", "p"));
        assert_ne!(base, csid(-100, 7, "m1", "m9", "p"));
        assert_ne!(base, csid(-100, 0, "m2", "m9", "p"));
        assert_ne!(base, csid(-100, 0, "m1", "m8", "p"));
        assert_ne!(base, csid(-100, 0, "m1", "m9", "q"));
    }

    #[test]
    fn length_prefix_prevents_field_aliasing() {
        // ("ab", "c") must not collide with ("a", "bc").
        assert_ne!(csid(1, 1, "ab", "c", "p"), csid(1, 1, "a", "bc", "p"));
    }
}
