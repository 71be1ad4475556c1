//! Redis 在线状态存储。
//!
//! 每条在线记录是一个自带 TTL 的字符串键，持有连接的实例负责续期；
//! 实例崩溃后记录自动过期，不需要任何清理逻辑。

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use application::{PresenceStore, StoreError};
use domain::{ConnectionId, PresenceRecord};

use super::error::store_err;

const PRESENCE_PREFIX: &str = "presence:";
const ONLINE_PREFIX: &str = "online:";
const SCAN_PAGE: usize = 100;

pub struct RedisPresenceStore {
    conn: ConnectionManager,
    presence_ttl: u64,
    online_ttl: u64,
}

impl RedisPresenceStore {
    pub fn new(conn: ConnectionManager, presence_ttl: Duration, online_ttl: Duration) -> Self {
        Self {
            conn,
            presence_ttl: presence_ttl.as_secs().max(1),
            online_ttl: online_ttl.as_secs().max(1),
        }
    }

    fn presence_key(id: ConnectionId) -> String {
        format!("{PRESENCE_PREFIX}{id}")
    }

    fn online_key(instance_id: &str) -> String {
        format!("{ONLINE_PREFIX}{instance_id}")
    }

    /// 游标分页扫描。扫描期间的增删可能被观察到也可能被错过，
    /// 调用方把结果当成最终一致的快照。
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn values_of(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn upsert(&self, record: PresenceRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::presence_key(record.id))
            .arg(payload)
            .arg("EX")
            .arg(self.presence_ttl)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn refresh(&self, id: ConnectionId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // 键已经过期时 EXPIRE 返回 0，不视为错误
        let _: i64 = redis::cmd("EXPIRE")
            .arg(Self::presence_key(id))
            .arg(self.presence_ttl)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn remove(&self, id: ConnectionId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(Self::presence_key(id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        let keys = self.scan_keys(&format!("{PRESENCE_PREFIX}*")).await?;
        let values = self.values_of(&keys).await?;

        let mut records = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            match serde_json::from_str::<PresenceRecord>(&value) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed presence record");
                }
            }
        }
        Ok(records)
    }

    async fn set_instance_online(&self, instance_id: &str, count: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::online_key(instance_id))
            .arg(count)
            .arg("EX")
            .arg(self.online_ttl)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn total_online(&self) -> Result<u64, StoreError> {
        let keys = self.scan_keys(&format!("{ONLINE_PREFIX}*")).await?;
        let values = self.values_of(&keys).await?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|value| value.parse::<u64>().ok())
            .sum())
    }
}
