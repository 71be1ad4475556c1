//! Redis 实现的共享存储与扇出总线。
//!
//! 所有写操作要么是纯增量（INCR/ZINCRBY/SADD）要么是按自己连接 id 的
//! 覆盖写，不需要任何跨实例协调。

pub mod counters;
pub mod error;
pub mod fanout;
pub mod leaderboard;
pub mod presence;

pub use counters::RedisStatsCounters;
pub use error::{RedisError, RedisResult};
pub use fanout::RedisFanoutBus;
pub use leaderboard::RedisLeaderboardStore;
pub use presence::RedisPresenceStore;
