//! 共享状态和扇出的能力接口。
//!
//! 中继核心只依赖这些 trait，Redis 实现位于 infrastructure，
//! 测试使用 [`memory`] 里的内存实现，不需要任何网络依赖。

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use domain::{ConnectionId, LeaderboardEntry, PresenceRecord};

/// 扇出总线的四个逻辑频道。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Messages,
    Stats,
    Users,
    Leaderboard,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Messages,
        Channel::Stats,
        Channel::Users,
        Channel::Leaderboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Messages => "messages",
            Channel::Stats => "stats",
            Channel::Users => "users",
            Channel::Leaderboard => "leaderboard",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "messages" => Some(Channel::Messages),
            "stats" => Some(Channel::Stats),
            "users" => Some(Channel::Users),
            "leaderboard" => Some(Channel::Leaderboard),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 共享存储和总线的错误。
///
/// 对单个事件而言都是瞬态的：记录日志、放弃本次操作，会话保持打开，
/// 下一个心跳隐式重试。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable(message.into())
    }
}

/// 跨实例共享的在线状态存储。
///
/// 每条记录只由持有连接的实例写入（按连接 id 覆盖写），实例之间
/// 不存在写冲突。记录自带过期时间，实例崩溃后无需清理即自动消失。
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 写入/覆盖记录并重置过期时间。
    async fn upsert(&self, record: PresenceRecord) -> Result<(), StoreError>;

    /// 只重置过期时间，不改内容。每个心跳对本地会话调用一次。
    async fn refresh(&self, id: ConnectionId) -> Result<(), StoreError>;

    /// 立即删除（干净断开路径）。
    async fn remove(&self, id: ConnectionId) -> Result<(), StoreError>;

    /// 全量在线列表。分页扫描，结果是最终一致的而不是事务性的。
    async fn list_all(&self) -> Result<Vec<PresenceRecord>, StoreError>;

    /// 上报本实例当前连接数，短过期，心跳内必须续期。
    async fn set_instance_online(&self, instance_id: &str, count: u64) -> Result<(), StoreError>;

    /// 所有未过期实例记录之和。
    async fn total_online(&self) -> Result<u64, StoreError>;
}

/// 按 `(city, country)` 聚合的消息排行榜。
#[async_trait]
pub trait LeaderboardStore: Send + Sync {
    /// 原子加一。计数单调不减。
    async fn increment(&self, city: &str, country: &str) -> Result<(), StoreError>;

    /// 前 k 名，按计数降序，平局顺序由存储决定。
    async fn top(&self, k: usize) -> Result<Vec<LeaderboardEntry>, StoreError>;
}

/// 全局近似统计计数器。
#[async_trait]
pub trait StatsCounters: Send + Sync {
    /// 首次见到该指纹时累计历史用户数（至少一次语义，截断哈希碰撞
    /// 会被重复计数，可接受）。
    async fn register_user(&self, fingerprint: &str) -> Result<(), StoreError>;

    async fn all_time_users(&self) -> Result<u64, StoreError>;

    /// 每次调用重置固定窗口的过期时间——TTL 近似滑动窗口。
    async fn mark_message(&self) -> Result<(), StoreError>;

    async fn messages_per_minute(&self) -> Result<u64, StoreError>;
}

/// 跨实例发布/订阅。
///
/// 投递保证是尽力而为的至多一次：订阅者掉线期间的发布不会重放。
/// 同一实例对同一频道的发布按序到达，除此之外没有全序。
#[async_trait]
pub trait FanoutBus: Send + Sync {
    async fn publish(&self, channel: Channel, payload: String) -> Result<(), StoreError>;

    /// 订阅全部四个频道，包含本实例自己的发布回声。
    fn subscribe(&self) -> mpsc::UnboundedReceiver<(Channel, String)>;
}

/// 内存实现，用于测试和单实例部署。
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// 带过期时间的内存在线存储。
    pub struct MemoryPresenceStore {
        presence_ttl: Duration,
        online_ttl: Duration,
        records: Mutex<HashMap<ConnectionId, (PresenceRecord, Instant)>>,
        online: Mutex<HashMap<String, (u64, Instant)>>,
    }

    impl MemoryPresenceStore {
        pub fn new(presence_ttl: Duration, online_ttl: Duration) -> Self {
            Self {
                presence_ttl,
                online_ttl,
                records: Mutex::new(HashMap::new()),
                online: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn upsert(&self, record: PresenceRecord) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let expires_at = Instant::now() + self.presence_ttl;
            records.insert(record.id, (record, expires_at));
            Ok(())
        }

        async fn refresh(&self, id: ConnectionId) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((_, expires_at)) = records.get_mut(&id) {
                *expires_at = Instant::now() + self.presence_ttl;
            }
            Ok(())
        }

        async fn remove(&self, id: ConnectionId) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.remove(&id);
            Ok(())
        }

        async fn list_all(&self) -> Result<Vec<PresenceRecord>, StoreError> {
            let now = Instant::now();
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            Ok(records
                .values()
                .filter(|(_, expires_at)| *expires_at > now)
                .map(|(record, _)| record.clone())
                .collect())
        }

        async fn set_instance_online(
            &self,
            instance_id: &str,
            count: u64,
        ) -> Result<(), StoreError> {
            let mut online = self.online.lock().unwrap_or_else(|e| e.into_inner());
            online.insert(
                instance_id.to_string(),
                (count, Instant::now() + self.online_ttl),
            );
            Ok(())
        }

        async fn total_online(&self) -> Result<u64, StoreError> {
            let now = Instant::now();
            let online = self.online.lock().unwrap_or_else(|e| e.into_inner());
            Ok(online
                .values()
                .filter(|(_, expires_at)| *expires_at > now)
                .map(|(count, _)| count)
                .sum())
        }
    }

    #[derive(Default)]
    pub struct MemoryLeaderboardStore {
        counts: Mutex<HashMap<(String, String), u64>>,
    }

    impl MemoryLeaderboardStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl LeaderboardStore for MemoryLeaderboardStore {
        async fn increment(&self, city: &str, country: &str) -> Result<(), StoreError> {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts
                .entry((city.to_string(), country.to_string()))
                .or_insert(0) += 1;
            Ok(())
        }

        async fn top(&self, k: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
            let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            let mut entries: Vec<LeaderboardEntry> = counts
                .iter()
                .map(|((city, country), count)| LeaderboardEntry {
                    city: city.clone(),
                    country: country.clone(),
                    count: *count,
                })
                .collect();
            entries.sort_by(|a, b| b.count.cmp(&a.count));
            entries.truncate(k);
            Ok(entries)
        }
    }

    pub struct MemoryStatsCounters {
        minute_window: Duration,
        seen: Mutex<HashSet<String>>,
        all_time: Mutex<u64>,
        per_minute: Mutex<(u64, Instant)>,
    }

    impl MemoryStatsCounters {
        pub fn new(minute_window: Duration) -> Self {
            Self {
                minute_window,
                seen: Mutex::new(HashSet::new()),
                all_time: Mutex::new(0),
                per_minute: Mutex::new((0, Instant::now())),
            }
        }
    }

    impl Default for MemoryStatsCounters {
        fn default() -> Self {
            Self::new(Duration::from_secs(60))
        }
    }

    #[async_trait]
    impl StatsCounters for MemoryStatsCounters {
        async fn register_user(&self, fingerprint: &str) -> Result<(), StoreError> {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if seen.insert(fingerprint.to_string()) {
                let mut all_time = self.all_time.lock().unwrap_or_else(|e| e.into_inner());
                *all_time += 1;
            }
            Ok(())
        }

        async fn all_time_users(&self) -> Result<u64, StoreError> {
            Ok(*self.all_time.lock().unwrap_or_else(|e| e.into_inner()))
        }

        async fn mark_message(&self) -> Result<(), StoreError> {
            let mut per_minute = self.per_minute.lock().unwrap_or_else(|e| e.into_inner());
            let (count, expires_at) = *per_minute;
            let now = Instant::now();
            let count = if expires_at > now { count + 1 } else { 1 };
            // 每次计数都把过期时间重置为完整窗口
            *per_minute = (count, now + self.minute_window);
            Ok(())
        }

        async fn messages_per_minute(&self) -> Result<u64, StoreError> {
            let per_minute = self.per_minute.lock().unwrap_or_else(|e| e.into_inner());
            let (count, expires_at) = *per_minute;
            if expires_at > Instant::now() {
                Ok(count)
            } else {
                Ok(0)
            }
        }
    }

    /// 进程内总线。所有订阅者（包括发布者自己的实例）收到每条发布。
    #[derive(Default)]
    pub struct MemoryFanoutBus {
        subscribers: Mutex<Vec<mpsc::UnboundedSender<(Channel, String)>>>,
    }

    impl MemoryFanoutBus {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl FanoutBus for MemoryFanoutBus {
        async fn publish(&self, channel: Channel, payload: String) -> Result<(), StoreError> {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|tx| tx.send((channel, payload.clone())).is_ok());
            Ok(())
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<(Channel, String)> {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.push(tx);
            rx
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use domain::Location;

        fn record(instance: &str) -> PresenceRecord {
            PresenceRecord::new(
                ConnectionId::generate(),
                "fp",
                &Location::new(0.0, 0.0),
                instance,
            )
        }

        #[tokio::test]
        async fn presence_records_expire_without_refresh() {
            let store = MemoryPresenceStore::new(
                Duration::from_millis(40),
                Duration::from_millis(40),
            );
            let rec = record("i-1");
            let id = rec.id;
            store.upsert(rec).await.unwrap();
            assert_eq!(store.list_all().await.unwrap().len(), 1);

            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(store.list_all().await.unwrap().is_empty());

            // refresh 不能复活已过期的记录内容——记录仍然缺失
            store.refresh(id).await.unwrap();
            assert!(store.list_all().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn refresh_extends_presence_lifetime() {
            let store = MemoryPresenceStore::new(
                Duration::from_millis(80),
                Duration::from_millis(80),
            );
            let rec = record("i-1");
            let id = rec.id;
            store.upsert(rec).await.unwrap();

            tokio::time::sleep(Duration::from_millis(50)).await;
            store.refresh(id).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert_eq!(store.list_all().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn online_count_sums_live_instances_and_decays_to_zero() {
            let store = MemoryPresenceStore::new(
                Duration::from_millis(40),
                Duration::from_millis(40),
            );
            store.set_instance_online("i-1", 3).await.unwrap();
            store.set_instance_online("i-2", 2).await.unwrap();
            assert_eq!(store.total_online().await.unwrap(), 5);

            tokio::time::sleep(Duration::from_millis(60)).await;
            assert_eq!(store.total_online().await.unwrap(), 0);
        }

        #[tokio::test]
        async fn all_time_counter_ignores_repeat_fingerprints() {
            let counters = MemoryStatsCounters::default();
            counters.register_user("aa").await.unwrap();
            counters.register_user("aa").await.unwrap();
            counters.register_user("bb").await.unwrap();
            assert_eq!(counters.all_time_users().await.unwrap(), 2);
        }

        #[tokio::test]
        async fn messages_per_minute_decays_after_window() {
            let counters = MemoryStatsCounters::new(Duration::from_millis(40));
            counters.mark_message().await.unwrap();
            counters.mark_message().await.unwrap();
            assert_eq!(counters.messages_per_minute().await.unwrap(), 2);

            tokio::time::sleep(Duration::from_millis(60)).await;
            assert_eq!(counters.messages_per_minute().await.unwrap(), 0);
        }

        #[tokio::test]
        async fn leaderboard_orders_by_count() {
            let store = MemoryLeaderboardStore::new();
            for _ in 0..3 {
                store.increment("Berlin", "DE").await.unwrap();
            }
            store.increment("Paris", "FR").await.unwrap();

            let top = store.top(10).await.unwrap();
            assert_eq!(top[0].city, "Berlin");
            assert_eq!(top[0].count, 3);
            assert_eq!(top[1].city, "Paris");

            let only_one = store.top(1).await.unwrap();
            assert_eq!(only_one.len(), 1);
        }

        #[tokio::test]
        async fn bus_delivers_to_all_subscribers_including_publisher() {
            let bus = MemoryFanoutBus::new();
            let mut rx_a = bus.subscribe();
            let mut rx_b = bus.subscribe();

            bus.publish(Channel::Stats, "{}".into()).await.unwrap();

            assert_eq!(rx_a.try_recv().unwrap().0, Channel::Stats);
            assert_eq!(rx_b.try_recv().unwrap().0, Channel::Stats);
        }
    }
}
