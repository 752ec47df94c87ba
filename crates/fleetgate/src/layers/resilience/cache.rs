use super::host_key;
use crate::layers::policy::normalize_command;
use dashmap::DashMap;
use protocol::PrivilegeMode;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    host: String,
    command: String,
}

impl CacheKey {
    fn new(host: &str, command: &str) -> Self {
        Self {
            host: host_key(host),
            command: normalize_command(command),
        }
    }
}

/// What a successful execution leaves behind for reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedOutput {
    pub output: String,
    pub truncated: bool,
    pub exit_code: Option<i32>,
    pub privilege: PrivilegeMode,
    pub executed_command: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedOutput,
    captured_at: Instant,
    expires_at: Instant,
    seq: u64,
}

/// TTL cache of guarded outputs keyed by (host, normalized command).
///
/// Each entry carries the TTL it was stored with. Expired entries are dropped
/// lazily on lookup; when full, the oldest insertion is evicted.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
    max_entries: usize,
    sequence: AtomicU64,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn get(&self, host: &str, command: &str) -> Option<CachedOutput> {
        let key = CacheKey::new(host, command);
        let now = Instant::now();
        let entry = self.entries.get(&key)?;
        if now < entry.expires_at {
            tracing::debug!(
                event = "cache.hit",
                host = %key.host,
                command = %key.command,
                age_ms = now.saturating_duration_since(entry.captured_at).as_millis() as u64,
            );
            return Some(entry.value.clone());
        }
        drop(entry);
        self.entries.remove_if(&key, |_, entry| entry.expires_at <= now);
        None
    }

    /// A zero `ttl` stores nothing.
    pub fn put(&self, host: &str, command: &str, value: CachedOutput, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let key = CacheKey::new(host, command);
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            captured_at: now,
            expires_at: now + ttl,
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.insert(key, entry);
        if self.entries.len() > self.max_entries {
            self.evict(now);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&self, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().seq)
                .map(|entry| entry.key().clone());
            let Some(key) = oldest else {
                break;
            };
            self.entries.remove(&key);
            tracing::debug!(event = "cache.evicted", host = %key.host, command = %key.command);
        }
    }
}
