//! IP 地理位置解析接口。
//!
//! 真正的地理库查询在系统边界之外，这里只定义纯函数式的能力接口。
//! 解析失败时引擎退回到伪随机位置，保证每个会话都有可渲染的坐标。

use std::collections::HashMap;
use std::net::IpAddr;

use rand::Rng;

use domain::Location;

/// IP → 位置 的尽力而为查询。私有地址和未知 IP 返回 `None`。
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<Location>;
}

/// 永远解析不到位置。单机部署和没有地理库可用时的缺省实现。
pub struct NullGeoResolver;

impl GeoResolver for NullGeoResolver {
    fn resolve(&self, _ip: IpAddr) -> Option<Location> {
        None
    }
}

/// 固定映射表实现，测试用。
#[derive(Default)]
pub struct StaticGeoResolver {
    entries: HashMap<IpAddr, Location>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, location: Location) -> Self {
        self.entries.insert(ip, location);
        self
    }
}

impl GeoResolver for StaticGeoResolver {
    fn resolve(&self, ip: IpAddr) -> Option<Location> {
        self.entries.get(&ip).cloned()
    }
}

/// 地理查询不可用时的伪随机回退位置。
///
/// 纬度限制在大陆分布密集的区间，避免大量会话落在极地和空洋面上。
pub fn fallback_location() -> Location {
    let mut rng = rand::rng();
    Location::new(
        rng.random_range(-55.0..=70.0),
        rng.random_range(-180.0..180.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_location_is_always_valid() {
        for _ in 0..100 {
            let location = fallback_location();
            assert!(Location::validate_coordinates(location.lat, location.lng).is_ok());
        }
    }

    #[test]
    fn static_resolver_returns_configured_entries() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let resolver = StaticGeoResolver::new().with(
            ip,
            Location::with_place(52.5, 13.4, Some("Berlin".into()), Some("DE".into())),
        );

        assert_eq!(resolver.resolve(ip).unwrap().city.as_deref(), Some("Berlin"));
        assert!(resolver.resolve("127.0.0.1".parse().unwrap()).is_none());
    }
}
