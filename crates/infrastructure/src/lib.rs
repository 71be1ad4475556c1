pub mod redis;

pub use crate::redis::{
    RedisError, RedisFanoutBus, RedisLeaderboardStore, RedisPresenceStore, RedisResult,
    RedisStatsCounters,
};
