//! Redis 全局统计计数器。

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use application::{StatsCounters, StoreError};

use super::error::store_err;

const FINGERPRINT_SET_KEY: &str = "stats:fingerprints";
const ALL_TIME_KEY: &str = "stats:all_time_users";
const PER_MINUTE_KEY: &str = "stats:messages_per_minute";

pub struct RedisStatsCounters {
    conn: ConnectionManager,
    minute_window: u64,
}

impl RedisStatsCounters {
    pub fn new(conn: ConnectionManager, minute_window: Duration) -> Self {
        Self {
            conn,
            minute_window: minute_window.as_secs().max(1),
        }
    }
}

#[async_trait]
impl StatsCounters for RedisStatsCounters {
    async fn register_user(&self, fingerprint: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // SADD 返回 1 表示首次见到该指纹；只有这时才累计总数。
        // 集合加入和计数不是原子对，极端情况下会重复计数——
        // 这是近似指标，不是账本。
        let added: i64 = redis::cmd("SADD")
            .arg(FINGERPRINT_SET_KEY)
            .arg(fingerprint)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if added == 1 {
            let _: i64 = redis::cmd("INCR")
                .arg(ALL_TIME_KEY)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    async fn all_time_users(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = redis::cmd("GET")
            .arg(ALL_TIME_KEY)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(count.unwrap_or(0))
    }

    async fn mark_message(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // 每次计数都把窗口过期时间重置到完整长度——TTL 近似滑动窗口
        let _: () = redis::pipe()
            .cmd("INCR")
            .arg(PER_MINUTE_KEY)
            .ignore()
            .cmd("EXPIRE")
            .arg(PER_MINUTE_KEY)
            .arg(self.minute_window)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn messages_per_minute(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = redis::cmd("GET")
            .arg(PER_MINUTE_KEY)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(count.unwrap_or(0))
    }
}
