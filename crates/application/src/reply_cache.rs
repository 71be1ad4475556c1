use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use domain::MessageId;

/// 本地缓存的消息正文和坐标，仅用于解析回复引用。
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub id: MessageId,
    pub text: String,
    pub lat: f64,
    pub lng: f64,
    pub cached_at: Instant,
}

/// 短 TTL 的回复上下文缓存。
///
/// 不跨实例共享：引用另一个实例上缓存的消息时静默丢失引用预览，
/// 这是可接受的降级行为而不是错误。
pub struct ReplyCache {
    ttl: Duration,
    entries: Mutex<HashMap<MessageId, CachedMessage>>,
}

impl ReplyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: MessageId, text: String, lat: f64, lng: f64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            id,
            CachedMessage {
                id,
                text,
                lat,
                lng,
                cached_at: Instant::now(),
            },
        );
    }

    /// 解析引用。过期条目即使还没被清扫也视为不存在。
    pub fn resolve(&self, id: MessageId) -> Option<CachedMessage> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&id)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .cloned()
    }

    /// 周期性清扫过期条目，返回清除数量。
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_fresh_entries() {
        let cache = ReplyCache::new(Duration::from_secs(35));
        let id = MessageId::generate();
        cache.insert(id, "hi".into(), 1.0, 2.0);

        let cached = cache.resolve(id).expect("entry should resolve");
        assert_eq!(cached.text, "hi");
        assert_eq!(cached.lat, 1.0);
    }

    #[test]
    fn unknown_id_resolves_to_none() {
        let cache = ReplyCache::new(Duration::from_secs(35));
        assert!(cache.resolve(MessageId::generate()).is_none());
    }

    #[test]
    fn expired_entries_do_not_resolve() {
        let cache = ReplyCache::new(Duration::from_millis(40));
        let id = MessageId::generate();
        cache.insert(id, "old".into(), 0.0, 0.0);

        std::thread::sleep(Duration::from_millis(60));

        assert!(cache.resolve(id).is_none());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = ReplyCache::new(Duration::from_millis(60));
        let old = MessageId::generate();
        cache.insert(old, "old".into(), 0.0, 0.0);

        std::thread::sleep(Duration::from_millis(80));
        let fresh = MessageId::generate();
        cache.insert(fresh, "fresh".into(), 0.0, 0.0);

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.resolve(fresh).is_some());
    }
}
