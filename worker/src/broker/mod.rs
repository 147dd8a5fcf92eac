//! Ports to the backing store.
//!
//! The core only needs two capabilities from the store: an append-only log
//! with consumer groups ([`StreamLog`]) and a key/value space with TTLs and
//! sorted sets ([`KeyValueStore`]). [`RedisBroker`] provides both against a
//! Redis server; [`MemoryBroker`] provides the same contracts in-process.

mod memory;
mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("unexpected reply: {0}")]
    Protocol(String),
}

/// Log-assigned entry id, `<milliseconds>-<sequence>`, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// The start of the log; also the cursor returned when a scan wraps.
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BrokerError::Protocol(format!("invalid entry id {s:?}"));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimBatch {
    pub entries: Vec<StreamEntry>,
    /// Cursor for the next scan; [`EntryId::ZERO`] once the pending list has
    /// been walked to the end.
    pub next: EntryId,
}

#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Creates `group` on `stream` starting at the beginning of the log,
    /// creating the stream if needed. Succeeds if the group already exists.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    async fn append(
        &self,
        stream: &str,
        fields: &[(&'static str, String)],
    ) -> Result<EntryId, BrokerError>;

    /// Delivers up to `count` entries never delivered to the group before,
    /// recording them as pending for `consumer`. Waits up to `block` for new
    /// entries; a zero `block` returns immediately.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Returns how many entries were removed from the pending list.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<u64, BrokerError>;

    async fn delete(&self, stream: &str, id: EntryId) -> Result<u64, BrokerError>;

    /// Transfers up to `count` pending entries idle for at least `min_idle`
    /// to `consumer`, scanning from `start`.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> Result<ClaimBatch, BrokerError>;
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomically sets `key` only if it does not exist. Returns whether the
    /// value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, BrokerError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), BrokerError>;

    /// Members scored within `[min, max]`, ordered by score.
    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, BrokerError>;

    async fn delete_keys(&self, keys: &[&str]) -> Result<u64, BrokerError>;
}
