//! 统一配置中心
//!
//! 提供应用的全局配置管理，包括：
//! - 服务监听地址
//! - Redis 连接
//! - 中继引擎的时间与容量参数

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务配置
    pub server: ServerConfig,
    /// Redis配置
    pub redis: RedisConfig,
    /// 中继参数
    pub relay: RelaySettings,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 实例标识，缺省时启动代码生成随机值
    pub instance_id: Option<String>,
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// 中继引擎参数（秒和条数）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    pub rate_limit: usize,
    pub rate_window_secs: u64,
    pub presence_ttl_secs: u64,
    pub online_ttl_secs: u64,
    pub heartbeat_secs: u64,
    pub reply_cache_ttl_secs: u64,
    pub leaderboard_min_interval_secs: u64,
    pub max_text_len: usize,
}

impl RelaySettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// 从环境变量加载配置。
    /// 所有项都有开发用默认值；REDIS_URL 在生产部署必须显式设置。
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_parse("SERVER_PORT", 8080),
                instance_id: env::var("INSTANCE_ID").ok(),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            relay: RelaySettings {
                rate_limit: env_parse("RELAY_RATE_LIMIT", 120),
                rate_window_secs: env_parse("RELAY_RATE_WINDOW_SECS", 60),
                presence_ttl_secs: env_parse("RELAY_PRESENCE_TTL_SECS", 30),
                online_ttl_secs: env_parse("RELAY_ONLINE_TTL_SECS", 60),
                heartbeat_secs: env_parse("RELAY_HEARTBEAT_SECS", 10),
                reply_cache_ttl_secs: env_parse("RELAY_REPLY_CACHE_TTL_SECS", 35),
                leaderboard_min_interval_secs: env_parse("RELAY_LEADERBOARD_INTERVAL_SECS", 10),
                max_text_len: env_parse("RELAY_MAX_TEXT_LEN", 280),
            },
        }
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.url.is_empty() {
            return Err(ConfigError::InvalidRedisUrl(
                "Redis URL cannot be empty".to_string(),
            ));
        }
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(ConfigError::InvalidRedisUrl(format!(
                "unsupported Redis URL scheme: {}",
                self.redis.url
            )));
        }
        if self.relay.rate_limit == 0 {
            return Err(ConfigError::InvalidRelaySettings(
                "rate limit must be greater than 0".to_string(),
            ));
        }
        // 心跳必须比在线记录 TTL 短，否则活跃连接会被当成过期回收
        if self.relay.heartbeat_secs >= self.relay.presence_ttl_secs {
            return Err(ConfigError::InvalidRelaySettings(
                "heartbeat interval must be shorter than presence TTL".to_string(),
            ));
        }
        if self.relay.heartbeat_secs >= self.relay.online_ttl_secs {
            return Err(ConfigError::InvalidRelaySettings(
                "heartbeat interval must be shorter than online-count TTL".to_string(),
            ));
        }
        if self.relay.max_text_len == 0 {
            return Err(ConfigError::InvalidRelaySettings(
                "max text length must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid Redis URL: {0}")]
    InvalidRedisUrl(String),
    #[error("Invalid relay settings: {0}")]
    InvalidRelaySettings(String),
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] std::env::VarError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::from_env();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.rate_limit, 120);
        assert_eq!(config.relay.presence_ttl_secs, 30);
        assert!(config.server.port > 0);
    }

    #[test]
    fn rejects_empty_redis_url() {
        let mut config = AppConfig::from_env();
        config.redis.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_redis_scheme() {
        let mut config = AppConfig::from_env();
        config.redis.url = "postgres://localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_slower_than_presence_ttl() {
        let mut config = AppConfig::from_env();
        config.relay.heartbeat_secs = 30;
        config.relay.presence_ttl_secs = 30;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("presence TTL"));
    }

    #[test]
    fn rejects_zero_rate_limit() {
        let mut config = AppConfig::from_env();
        config.relay.rate_limit = 0;
        assert!(config.validate().is_err());
    }
}
