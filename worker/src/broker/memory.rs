use super::{BrokerError, ClaimBatch, EntryId, KeyValueStore, StreamEntry, StreamLog};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;

/// In-process broker with the same delivery, pending and TTL semantics as the
/// Redis implementation. State lives only as long as the value.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    values: HashMap<String, Expiring>,
    sorted: HashMap<String, HashMap<String, f64>>,
}

#[derive(Default)]
struct Stream {
    last_id: EntryId,
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, Delivery>,
}

struct Delivery {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

struct Expiring {
    value: String,
    expires_at: Instant,
}

impl Stream {
    fn next_id(&mut self) -> EntryId {
        let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
        let id = if now_ms > self.last_id.ms {
            EntryId::new(now_ms, 0)
        } else {
            EntryId::new(self.last_id.ms, self.last_id.seq + 1)
        };
        self.last_id = id;
        id
    }
}

impl State {
    fn stream_with_group(&mut self, stream: &str, group: &str) -> Result<&mut Stream, BrokerError> {
        self.streams
            .get_mut(stream)
            .filter(|s| s.groups.contains_key(group))
            .ok_or_else(|| BrokerError::Protocol(format!("NOGROUP no group {group} for key {stream}")))
    }

    fn live_value(&mut self, key: &str, now: Instant) -> Option<&Expiring> {
        if self.values.get(key).is_some_and(|v| v.expires_at <= now) {
            self.values.remove(key);
        }
        self.values.get(key)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Entries still present in the log, in id order.
    pub fn entries(&self, stream: &str) -> Vec<EntryId> {
        self.state()
            .streams
            .get(stream)
            .map(|s| s.entries.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Pending (delivered, unacknowledged) entries of a group with their owner
    /// and delivery count.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<(EntryId, String, u32)> {
        self.state()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, d)| (*id, d.consumer.clone(), d.deliveries))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut state = self.state();
        let s = state.stream_with_group(stream, group)?;
        let now = Instant::now();

        let Some(g) = s.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let start = g.last_delivered;
        let mut delivered = Vec::new();
        for (id, fields) in s.entries.range(start..).filter(|(id, _)| **id > start).take(count) {
            g.pending.insert(
                *id,
                Delivery {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            g.last_delivered = *id;
            delivered.push(StreamEntry {
                id: *id,
                fields: fields.clone(),
            });
        }
        Ok(delivered)
    }
}

#[async_trait]
impl StreamLog for MemoryBroker {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        let s = state.streams.entry(stream.to_string()).or_default();
        s.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&'static str, String)],
    ) -> Result<EntryId, BrokerError> {
        let id = {
            let mut state = self.state();
            let s = state.streams.entry(stream.to_string()).or_default();
            let id = s.next_id();
            let fields = fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            s.entries.insert(id, fields);
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.try_read(stream, group, consumer, count)?;
            if !delivered.is_empty() || block.is_zero() {
                return Ok(delivered);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<u64, BrokerError> {
        let mut state = self.state();
        let s = state.stream_with_group(stream, group)?;
        let removed = s
            .groups
            .get_mut(group)
            .and_then(|g| g.pending.remove(&id))
            .is_some();
        Ok(removed as u64)
    }

    async fn delete(&self, stream: &str, id: EntryId) -> Result<u64, BrokerError> {
        let mut state = self.state();
        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.entries.remove(&id))
            .is_some();
        Ok(removed as u64)
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> Result<ClaimBatch, BrokerError> {
        let mut state = self.state();
        let s = state.stream_with_group(stream, group)?;
        let now = Instant::now();

        let Some(g) = s.groups.get_mut(group) else {
            return Ok(ClaimBatch {
                entries: Vec::new(),
                next: EntryId::ZERO,
            });
        };

        let mut claimed = Vec::new();
        let mut deleted = Vec::new();
        let mut next = EntryId::ZERO;
        for (id, delivery) in g.pending.range_mut(start..) {
            if claimed.len() == count {
                next = *id;
                break;
            }
            if now.saturating_duration_since(delivery.delivered_at) < min_idle {
                continue;
            }
            let Some(fields) = s.entries.get(id) else {
                deleted.push(*id);
                continue;
            };
            delivery.consumer = consumer.to_string();
            delivery.delivered_at = now;
            delivery.deliveries += 1;
            claimed.push(StreamEntry {
                id: *id,
                fields: fields.clone(),
            });
        }
        for id in deleted {
            g.pending.remove(&id);
        }

        Ok(ClaimBatch {
            entries: claimed,
            next,
        })
    }
}

#[async_trait]
impl KeyValueStore for MemoryBroker {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut state = self.state();
        let now = Instant::now();
        if state.live_value(key, now).is_some() {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.state().values.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut state = self.state();
        Ok(state.live_value(key, Instant::now()).map(|v| v.value.clone()))
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), BrokerError> {
        self.state()
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, BrokerError> {
        let state = self.state();
        let Some(set) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(f64, &String)> = set
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (*score, member))
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        Ok(hits.into_iter().map(|(_, member)| member.clone()).collect())
    }

    async fn delete_keys(&self, keys: &[&str]) -> Result<u64, BrokerError> {
        let mut state = self.state();
        let mut deleted = 0;
        for key in keys {
            let removed = state.values.remove(*key).is_some()
                | state.sorted.remove(*key).is_some()
                | state.streams.remove(*key).is_some();
            deleted += removed as u64;
        }
        Ok(deleted)
    }
}
