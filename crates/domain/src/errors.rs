use thiserror::Error;

/// 领域层错误类型
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument {
        field: &'static str,
        reason: &'static str,
    },
}

impl DomainError {
    pub fn invalid_argument(field: &'static str, reason: &'static str) -> Self {
        DomainError::InvalidArgument { field, reason }
    }
}
