use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 客户端持久化伪身份。不是安全凭证，哈希碰撞可以容忍。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

/// 声明身份截断后的长度。
const DECLARED_MAX: usize = 20;

impl Fingerprint {
    /// 从 `(ip, country)` 推导初始指纹。
    ///
    /// 顺序敏感的字符串哈希（djb2 变体），非加密。
    pub fn derive(ip: &str, country: Option<&str>) -> Self {
        let seed = format!("{}|{}", ip, country.unwrap_or("??"));
        let mut hash: u32 = 5381;
        for byte in seed.bytes() {
            hash = hash.wrapping_mul(33) ^ u32::from(byte);
        }
        Self(format!("{hash:08x}"))
    }

    /// 校验客户端声明的标识符，通过后取稳定的截断形式。
    pub fn parse_declared(value: &str) -> Result<Self, DomainError> {
        let value = value.trim();
        if !(8..=64).contains(&value.len()) {
            return Err(DomainError::invalid_argument(
                "identity",
                "must be 8-64 characters",
            ));
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DomainError::invalid_argument(
                "identity",
                "must be ASCII alphanumeric",
            ));
        }
        Ok(Self(value.chars().take(DECLARED_MAX).collect()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = Fingerprint::derive("10.0.0.1", Some("DE"));
        let b = Fingerprint::derive("10.0.0.1", Some("DE"));
        assert_eq!(a, b);
    }

    #[test]
    fn derive_is_order_sensitive() {
        // "ab|c" 与 "c|ab" 必须散列到不同值
        let a = Fingerprint::derive("ab", Some("c"));
        let b = Fingerprint::derive("c", Some("ab"));
        assert_ne!(a, b);
    }

    #[test]
    fn derive_handles_unknown_country() {
        let a = Fingerprint::derive("10.0.0.1", None);
        let b = Fingerprint::derive("10.0.0.1", Some("DE"));
        assert_ne!(a, b);
    }

    #[test]
    fn declared_identity_is_validated() {
        assert!(Fingerprint::parse_declared("short").is_err());
        assert!(Fingerprint::parse_declared("has spaces inside!").is_err());
        assert!(Fingerprint::parse_declared("emoji🙂identity").is_err());
        assert!(Fingerprint::parse_declared(&"x".repeat(65)).is_err());
        assert!(Fingerprint::parse_declared("abcd1234").is_ok());
    }

    #[test]
    fn declared_identity_is_truncated_and_stable() {
        let long = "a1b2c3d4e5f6a7b8c9d0extratail";
        let fp = Fingerprint::parse_declared(long).unwrap();
        assert_eq!(fp.as_str().len(), 20);
        assert_eq!(fp, Fingerprint::parse_declared(long).unwrap());
    }
}
