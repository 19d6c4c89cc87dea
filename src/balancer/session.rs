//! Session stickiness: (api-key, request-model) → last successful channel.
//!
//! Entries are written after a successful forward and expire lazily on
//! read. The TTL comes from the group at call time, so a group config
//! change applies immediately to existing sessions.

use dashmap::DashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionEntry {
    pub channel_id: i64,
    pub channel_key_id: i64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionMap {
    entries: DashMap<String, SessionEntry>,
}

fn session_key(api_key_id: i64, request_model: &str) -> String {
    format!("{api_key_id}:{request_model}")
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry for the pair, or None. An entry older than the TTL is
    /// deleted on the way out.
    pub fn get(
        &self,
        api_key_id: i64,
        request_model: &str,
        ttl_secs: u64,
        now_ms: u64,
    ) -> Option<SessionEntry> {
        if ttl_secs == 0 {
            return None;
        }
        let key = session_key(api_key_id, request_model);
        let entry = self.entries.get(&key).map(|entry| *entry)?;
        if now_ms.saturating_sub(entry.timestamp_ms) > ttl_secs * 1_000 {
            self.entries.remove(&key);
            return None;
        }
        Some(entry)
    }

    pub fn set(
        &self,
        api_key_id: i64,
        request_model: &str,
        channel_id: i64,
        channel_key_id: i64,
        now_ms: u64,
    ) {
        self.entries.insert(
            session_key(api_key_id, request_model),
            SessionEntry {
                channel_id,
                channel_key_id,
                timestamp_ms: now_ms,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_within_ttl_returns_entry() {
        let sessions = SessionMap::new();
        sessions.set(1, "gpt-4o", 7, 70, 10_000);
        let entry = sessions.get(1, "gpt-4o", 60, 69_999).unwrap();
        assert_eq!(entry.channel_id, 7);
        assert_eq!(entry.channel_key_id, 70);
    }

    #[test]
    fn get_at_exact_ttl_boundary_returns_entry() {
        let sessions = SessionMap::new();
        sessions.set(1, "gpt-4o", 7, 70, 10_000);
        assert!(sessions.get(1, "gpt-4o", 60, 70_000).is_some());
    }

    #[test]
    fn expired_entry_is_deleted_on_read() {
        let sessions = SessionMap::new();
        sessions.set(1, "gpt-4o", 7, 70, 10_000);
        assert!(sessions.get(1, "gpt-4o", 60, 70_001).is_none());
        assert!(sessions.is_empty());
    }

    #[test]
    fn zero_ttl_disables_stickiness() {
        let sessions = SessionMap::new();
        sessions.set(1, "gpt-4o", 7, 70, 10_000);
        assert!(sessions.get(1, "gpt-4o", 0, 10_001).is_none());
        // Entry survives; only reads with a TTL evict.
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn set_overwrites_with_new_timestamp() {
        let sessions = SessionMap::new();
        sessions.set(1, "gpt-4o", 7, 70, 10_000);
        sessions.set(1, "gpt-4o", 8, 80, 20_000);
        let entry = sessions.get(1, "gpt-4o", 60, 20_500).unwrap();
        assert_eq!(entry.channel_id, 8);
        assert_eq!(entry.timestamp_ms, 20_000);
    }

    #[test]
    fn keys_are_scoped_per_api_key_and_model() {
        let sessions = SessionMap::new();
        sessions.set(1, "gpt-4o", 7, 70, 10_000);
        assert!(sessions.get(2, "gpt-4o", 60, 10_001).is_none());
        assert!(sessions.get(1, "gpt-4o-mini", 60, 10_001).is_none());
    }
}
