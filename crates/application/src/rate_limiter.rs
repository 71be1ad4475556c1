use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use domain::ConnectionId;

/// 限流的动作类别，消息和输入提示各自独立计数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionClass {
    Message,
    Typing,
}

/// 滑动窗口限流器
///
/// 每个连接、每个动作类别维护窗口内的时间戳序列。不跨实例共享——
/// 换实例重连等于重新拿到配额，这是接受的取舍而不是安全保证。
pub struct RateLimiter {
    window: Duration,
    limit: usize,
    buckets: Mutex<HashMap<(ConnectionId, ActionClass), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, limit: usize) -> Self {
        Self {
            window,
            limit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// 检查并记录一次动作。达到上限时拒绝且不记录。
    pub fn allow(&self, id: ConnectionId, class: ActionClass) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry((id, class)).or_default();

        while let Some(&oldest) = bucket.front() {
            if now.duration_since(oldest) >= self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.limit {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// 会话关闭时丢弃该连接的全部配额记录，内存只随并发连接数增长。
    pub fn forget(&self, id: ConnectionId) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|(key, _), _| *key != id);
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_limit_within_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 120);
        let id = ConnectionId::generate();

        for i in 0..120 {
            assert!(
                limiter.allow(id, ActionClass::Message),
                "event {} should be allowed",
                i + 1
            );
        }
        // 第 121 次被拒绝
        assert!(!limiter.allow(id, ActionClass::Message));
        assert!(!limiter.allow(id, ActionClass::Message));
    }

    #[test]
    fn action_classes_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        let id = ConnectionId::generate();

        for _ in 0..3 {
            assert!(limiter.allow(id, ActionClass::Message));
        }
        assert!(!limiter.allow(id, ActionClass::Message));

        // 消息配额用完不影响输入提示
        assert!(limiter.allow(id, ActionClass::Typing));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();

        assert!(limiter.allow(a, ActionClass::Message));
        assert!(!limiter.allow(a, ActionClass::Message));
        assert!(limiter.allow(b, ActionClass::Message));
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(Duration::from_millis(80), 2);
        let id = ConnectionId::generate();

        assert!(limiter.allow(id, ActionClass::Message));
        assert!(limiter.allow(id, ActionClass::Message));
        assert!(!limiter.allow(id, ActionClass::Message));

        std::thread::sleep(Duration::from_millis(120));

        assert!(limiter.allow(id, ActionClass::Message));
    }

    #[test]
    fn denied_events_are_not_recorded() {
        let limiter = RateLimiter::new(Duration::from_millis(80), 1);
        let id = ConnectionId::generate();

        assert!(limiter.allow(id, ActionClass::Message));
        // 被拒绝的尝试不写入时间戳，窗口过后立即恢复
        for _ in 0..10 {
            assert!(!limiter.allow(id, ActionClass::Message));
        }
        std::thread::sleep(Duration::from_millis(120));
        assert!(limiter.allow(id, ActionClass::Message));
    }

    #[test]
    fn forget_drops_all_classes() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 5);
        let id = ConnectionId::generate();

        limiter.allow(id, ActionClass::Message);
        limiter.allow(id, ActionClass::Typing);
        assert_eq!(limiter.tracked_buckets(), 2);

        limiter.forget(id);
        assert_eq!(limiter.tracked_buckets(), 0);
    }
}
