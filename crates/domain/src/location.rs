use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 会话的地理位置。经纬度始终存在，城市/国家是地理库能解析时的补充信息。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            city: None,
            country: None,
        }
    }

    pub fn with_place(
        lat: f64,
        lng: f64,
        city: Option<String>,
        country: Option<String>,
    ) -> Self {
        Self {
            lat,
            lng,
            city,
            country,
        }
    }

    /// 校验客户端上报的坐标。非有限值或超出范围都拒绝。
    pub fn validate_coordinates(lat: f64, lng: f64) -> Result<(), DomainError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(DomainError::invalid_argument(
                "lat",
                "must be finite and within [-90, 90]",
            ));
        }
        if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
            return Err(DomainError::invalid_argument(
                "lng",
                "must be finite and within [-180, 180]",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_boundary_coordinates() {
        assert!(Location::validate_coordinates(90.0, 180.0).is_ok());
        assert!(Location::validate_coordinates(-90.0, -180.0).is_ok());
        assert!(Location::validate_coordinates(0.0, 0.0).is_ok());
    }

    #[test]
    fn rejects_out_of_range_latitude() {
        assert!(Location::validate_coordinates(91.0, 0.0).is_err());
        assert!(Location::validate_coordinates(-90.5, 0.0).is_err());
    }

    #[test]
    fn rejects_out_of_range_longitude() {
        assert!(Location::validate_coordinates(0.0, 180.5).is_err());
        assert!(Location::validate_coordinates(0.0, -181.0).is_err());
    }

    #[test]
    fn rejects_non_finite_values() {
        assert!(Location::validate_coordinates(f64::NAN, 0.0).is_err());
        assert!(Location::validate_coordinates(0.0, f64::INFINITY).is_err());
        assert!(Location::validate_coordinates(f64::NEG_INFINITY, 0.0).is_err());
    }
}
