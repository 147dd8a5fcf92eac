use super::{BrokerError, ClaimBatch, EntryId, KeyValueStore, StreamEntry, StreamLog};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use redis::{RedisResult, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Redis-backed implementation of both broker ports.
///
/// Blocking stream reads stall every command queued behind them on the same
/// connection, so each consumer reads through its own connection.
pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    readers: Readers<MultiplexedConnection>,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        tracing::info!(url, "Connected to redis");

        Ok(Self {
            client,
            conn,
            readers: Readers::default(),
        })
    }
}

/// Connections keyed by consumer name, opened on first use.
pub(crate) struct Readers<C> {
    conns: Mutex<HashMap<String, C>>,
}

impl<C> Default for Readers<C> {
    fn default() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: Clone> Readers<C> {
    fn conns(&self) -> MutexGuard<'_, HashMap<String, C>> {
        self.conns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) async fn get_or_open<F, Fut, E>(&self, consumer: &str, open: F) -> Result<C, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let existing = self.conns().get(consumer).cloned();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let conn = open().await?;
        tracing::debug!(consumer, "Opened reader connection");
        Ok(self
            .conns()
            .entry(consumer.to_string())
            .or_insert(conn)
            .clone())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.conns().len()
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().max(1) as u64
}

fn string_fields(map: HashMap<String, Value>) -> HashMap<String, String> {
    map.into_iter()
        .filter_map(|(k, v)| redis::from_redis_value::<String>(&v).ok().map(|v| (k, v)))
        .collect()
}

fn field_pairs(values: &[Value]) -> HashMap<String, String> {
    values
        .chunks_exact(2)
        .filter_map(|pair| {
            let key = redis::from_redis_value::<String>(&pair[0]).ok()?;
            let value = redis::from_redis_value::<String>(&pair[1]).ok()?;
            Some((key, value))
        })
        .collect()
}

/// Decodes an `XAUTOCLAIM` reply: `[cursor, [[id, [field, value, ..]] | nil, ..], ..]`.
/// Nil slots are entries deleted while pending; Redis drops them from the
/// pending list itself.
pub(crate) fn parse_auto_claim(reply: Value) -> Result<ClaimBatch, BrokerError> {
    let parts = match reply {
        Value::Bulk(parts) => parts,
        other => return Err(BrokerError::Protocol(format!("XAUTOCLAIM reply: {other:?}"))),
    };

    let mut parts = parts.into_iter();
    let cursor: String = match parts.next() {
        Some(value) => redis::from_redis_value(&value)?,
        None => return Err(BrokerError::Protocol("XAUTOCLAIM reply without cursor".into())),
    };

    let mut entries = Vec::new();
    if let Some(Value::Bulk(claimed)) = parts.next() {
        for item in claimed {
            let Value::Bulk(item) = item else {
                continue;
            };
            let [id, fields] = item.as_slice() else {
                continue;
            };
            let id: String = redis::from_redis_value(id)?;
            let fields = match fields {
                Value::Bulk(values) => field_pairs(values),
                _ => HashMap::new(),
            };
            entries.push(StreamEntry {
                id: id.parse()?,
                fields,
            });
        }
    }

    Ok(ClaimBatch {
        entries,
        next: cursor.parse()?,
    })
}

#[async_trait]
impl StreamLog for RedisBroker {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(stream, group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&'static str, String)],
    ) -> Result<EntryId, BrokerError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        id.parse()
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(millis(block));
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let mut reader = self
            .readers
            .get_or_open(consumer, || self.client.get_multiplexed_async_connection())
            .await?;
        let reply: Option<StreamReadReply> = cmd.query_async(&mut reader).await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push(StreamEntry {
                    id: id.id.parse()?,
                    fields: string_fields(id.map),
                });
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(acked)
    }

    async fn delete(&self, stream: &str, id: EntryId) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        let deleted: u64 = redis::cmd("XDEL")
            .arg(stream)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(deleted)
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
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(start.to_string())
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        parse_auto_claim(reply)
    }
}

#[async_trait]
impl KeyValueStore for RedisBroker {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn delete_keys(&self, keys: &[&str]) -> Result<u64, BrokerError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let deleted: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(deleted)
    }
}
