//! Redis 排行榜存储，按 `(city, country)` 聚合的有序集合。

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use application::{LeaderboardStore, StoreError};
use domain::LeaderboardEntry;

use super::error::store_err;

const LEADERBOARD_KEY: &str = "leaderboard:cities";

pub struct RedisLeaderboardStore {
    conn: ConnectionManager,
}

impl RedisLeaderboardStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn member(city: &str, country: &str) -> String {
        format!("{city}|{country}")
    }

    fn split_member(member: &str) -> (String, String) {
        match member.rsplit_once('|') {
            Some((city, country)) => (city.to_string(), country.to_string()),
            None => (member.to_string(), String::new()),
        }
    }
}

#[async_trait]
impl LeaderboardStore for RedisLeaderboardStore {
    async fn increment(&self, city: &str, country: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: f64 = redis::cmd("ZINCRBY")
            .arg(LEADERBOARD_KEY)
            .arg(1)
            .arg(Self::member(city, country))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn top(&self, k: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<(String, u64)> = redis::cmd("ZREVRANGE")
            .arg(LEADERBOARD_KEY)
            .arg(0)
            .arg((k - 1) as isize)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(raw
            .into_iter()
            .map(|(member, count)| {
                let (city, country) = Self::split_member(&member);
                LeaderboardEntry {
                    city,
                    country,
                    count,
                }
            })
            .collect())
    }
}
