use application::StoreError;
use thiserror::Error;

/// Redis 层错误类型
#[derive(Debug, Error)]
pub enum RedisError {
    #[error("redis connection error: {message}")]
    Connection { message: String },
    #[error("redis subscribe error: {message}")]
    Subscribe { message: String },
}

pub type RedisResult<T> = Result<T, RedisError>;

/// 命令失败统一映射为瞬态存储错误，由调用方记录并放弃本次操作。
pub(crate) fn store_err(err: ::redis::RedisError) -> StoreError {
    StoreError::unavailable(err.to_string())
}
