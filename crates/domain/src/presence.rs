use serde::{Deserialize, Serialize};

use crate::location::Location;
use crate::value_objects::ConnectionId;

/// 跨实例共享的在线记录，由持有活跃连接的实例负责续期。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: ConnectionId,
    pub stable_fingerprint: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub owner_instance_id: String,
}

impl PresenceRecord {
    pub fn new(
        id: ConnectionId,
        fingerprint: impl Into<String>,
        location: &Location,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            id,
            stable_fingerprint: fingerprint.into(),
            lat: location.lat,
            lng: location.lng,
            city: location.city.clone(),
            country: location.country.clone(),
            owner_instance_id: instance_id.into(),
        }
    }
}

/// 全局统计快照。数值都是近似指标，不是账本。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub online: u64,
    pub all_time_users: u64,
    pub messages_per_minute: u64,
}

/// 排行榜条目，按 `(city, country)` 聚合的消息计数。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub city: String,
    pub country: String,
    pub count: u64,
}
