pub mod engine;
pub mod geo;
pub mod rate_limiter;
pub mod reply_cache;
pub mod session;
pub mod stores;

pub use engine::{RelayConfig, RelayDependencies, RelayEngine};
pub use geo::{GeoResolver, NullGeoResolver, StaticGeoResolver};
pub use rate_limiter::{ActionClass, RateLimiter};
pub use reply_cache::{CachedMessage, ReplyCache};
pub use session::{Session, SessionRegistry};
pub use stores::{Channel, FanoutBus, LeaderboardStore, PresenceStore, StatsCounters, StoreError};
