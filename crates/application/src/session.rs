use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use tokio::sync::mpsc;

use domain::{ConnectionId, Fingerprint, Location, ServerEvent, Timestamp};

/// 单个连接的实例本地状态。
///
/// 由接受该连接的实例独占，出站投递走无界通道，发送端断开时静默丢弃。
#[derive(Debug)]
pub struct Session {
    pub id: ConnectionId,
    pub fingerprint: Fingerprint,
    pub location: Location,
    pub connected_at: Timestamp,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        fingerprint: Fingerprint,
        location: Location,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            id,
            fingerprint,
            location,
            connected_at: Utc::now(),
            sender,
        }
    }

    fn send(&self, event: ServerEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// 实例本地的会话表。
///
/// 临界区全部是同步操作（出站投递只是一次通道发送），锁内不会出现 await。
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session.id, session);
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.keys().copied().collect()
    }

    pub fn fingerprint_of(&self, id: ConnectionId) -> Option<Fingerprint> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(&id).map(|s| s.fingerprint.clone())
    }

    pub fn location_of(&self, id: ConnectionId) -> Option<Location> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(&id).map(|s| s.location.clone())
    }

    /// 发送方身份快照：指纹加当前位置。
    pub fn identity_of(&self, id: ConnectionId) -> Option<(Fingerprint, Location)> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(&id)
            .map(|s| (s.fingerprint.clone(), s.location.clone()))
    }

    /// 更新坐标，保留已知的城市/国家，返回更新后的位置。
    pub fn update_location(&self, id: ConnectionId, lat: f64, lng: f64) -> Option<Location> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let session = sessions.get_mut(&id)?;
        session.location.lat = lat;
        session.location.lng = lng;
        Some(session.location.clone())
    }

    /// 替换指纹，返回之前的值。
    pub fn set_fingerprint(
        &self,
        id: ConnectionId,
        fingerprint: Fingerprint,
    ) -> Option<Fingerprint> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let session = sessions.get_mut(&id)?;
        Some(std::mem::replace(&mut session.fingerprint, fingerprint))
    }

    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(&id).map(|s| s.send(event)).unwrap_or(false)
    }

    /// 向所有本地会话广播。投递失败（对端任务已退出）静默忽略，
    /// 清理由连接关闭路径负责。
    pub fn broadcast(&self, event: &ServerEvent) {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        for session in sessions.values() {
            session.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(registry: &SessionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.insert(Session::new(
            id,
            Fingerprint::derive("10.0.0.1", None),
            Location::new(1.0, 2.0),
            tx,
        ));
        (id, rx)
    }

    #[test]
    fn insert_and_remove_are_paired() {
        let registry = SessionRegistry::new();
        let (id, _rx) = make_session(&registry);

        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_reaches_every_session() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = make_session(&registry);
        let (_b, mut rx_b) = make_session(&registry);

        registry.broadcast(&ServerEvent::Pong);

        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::Pong)));
        assert!(matches!(rx_b.try_recv(), Ok(ServerEvent::Pong)));
    }

    #[test]
    fn update_location_preserves_place_names() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::generate();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.insert(Session::new(
            id,
            Fingerprint::derive("10.0.0.1", Some("DE")),
            Location::with_place(52.5, 13.4, Some("Berlin".into()), Some("DE".into())),
            tx,
        ));

        let updated = registry.update_location(id, 48.1, 11.6).unwrap();
        assert_eq!(updated.lat, 48.1);
        assert_eq!(updated.city.as_deref(), Some("Berlin"));
    }

    #[test]
    fn send_to_missing_session_is_false() {
        let registry = SessionRegistry::new();
        assert!(!registry.send_to(ConnectionId::generate(), ServerEvent::Pong));
    }
}
