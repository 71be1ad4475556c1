pub mod errors;
pub mod events;
pub mod fingerprint;
pub mod location;
pub mod presence;
pub mod sanitize;
pub mod value_objects;

pub use errors::DomainError;
pub use events::{BroadcastMessage, ClientEvent, ServerEvent};
pub use fingerprint::Fingerprint;
pub use location::Location;
pub use presence::{LeaderboardEntry, PresenceRecord, StatsSnapshot};
pub use value_objects::{ConnectionId, MessageId, Timestamp};
