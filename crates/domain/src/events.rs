//! 连接上的 JSON 消息信封。
//!
//! 入站和出站都是 `type` 字段打标的联合类型，新事件种类必须显式加入枚举，
//! 不存在落空的分支。

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::location::Location;
use crate::presence::{LeaderboardEntry, PresenceRecord, StatsSnapshot};
use crate::value_objects::{ConnectionId, MessageId, Timestamp};

/// 客户端入站事件。未知的 `type` 在反序列化阶段失败，调用方记录后丢弃。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Message {
        text: String,
        #[serde(default)]
        encrypted: bool,
        #[serde(default)]
        encrypted_for: Option<String>,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },
    Ping,
    Identify {
        id: String,
    },
    UpdateLocation {
        lat: f64,
        lng: f64,
    },
    Typing,
    #[serde(rename_all = "camelCase")]
    Reaction {
        message_id: MessageId,
        emoji: String,
    },
}

/// 服务端出站事件。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Welcome {
        id: ConnectionId,
        fingerprint: String,
        location: Location,
        stats: StatsSnapshot,
    },
    Message(BroadcastMessage),
    Stats(StatsSnapshot),
    Users {
        users: Vec<PresenceRecord>,
    },
    Leaderboard {
        entries: Vec<LeaderboardEntry>,
    },
    Typing {
        fingerprint: String,
        lat: f64,
        lng: f64,
    },
    #[serde(rename_all = "camelCase")]
    Reaction {
        message_id: MessageId,
        emoji: String,
        fingerprint: String,
    },
    Pong,
    Error {
        message: String,
    },
}

/// 广播出去的消息信封。只在线上传输，任何地方都不持久化。
///
/// `instance_id` 用于抑制回环：发布者实例在收到自己的发布回声时不再向本地
/// 会话二次投递。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub id: MessageId,
    pub text: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: Timestamp,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_for: Option<String>,
    pub sender_id: ConnectionId,
    pub sender_fingerprint: String,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_lng: Option<f64>,
}

/// 校验表情回应：1-2 个符号字符，不接受字母数字或空白。
pub fn validate_reaction(emoji: &str) -> Result<(), DomainError> {
    let count = emoji.chars().count();
    if count == 0 || count > 2 {
        return Err(DomainError::invalid_argument(
            "emoji",
            "must be 1-2 characters",
        ));
    }
    if emoji
        .chars()
        .any(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || c.is_control())
    {
        return Err(DomainError::invalid_argument(
            "emoji",
            "must be symbol characters",
        ));
    }
    Ok(())
}
