//! 中继引擎
//!
//! 每个连接的状态机是 `Connecting -> Open -> Closed`，没有中间态，
//! 重连是客户端层面的事情（新连接 = 新会话）。实例本地状态（会话表、
//! 限流器、回复缓存）由本实例独占；跨实例状态全部通过注入的共享存储
//! 和扇出总线交互，每个变更要么是纯增量要么是按自己连接 id 的覆盖写，
//! 实例之间构造上不可能发生写冲突。

use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use domain::{
    events::validate_reaction, sanitize::sanitize_text, sanitize::truncate_chars,
    BroadcastMessage, ClientEvent, ConnectionId, Fingerprint, LeaderboardEntry, Location,
    MessageId, PresenceRecord, ServerEvent, StatsSnapshot,
};

use crate::geo::{fallback_location, GeoResolver};
use crate::rate_limiter::{ActionClass, RateLimiter};
use crate::reply_cache::ReplyCache;
use crate::session::{Session, SessionRegistry};
use crate::stores::{Channel, FanoutBus, LeaderboardStore, PresenceStore, StatsCounters, StoreError};

/// 中继引擎的时间与容量参数。测试会整体缩小时间参数。
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// 限流窗口。
    pub rate_window: Duration,
    /// 每窗口每动作类别的上限。
    pub rate_limit: usize,
    /// 在线记录过期时间，必须大于心跳间隔。
    pub presence_ttl: Duration,
    /// 实例在线计数过期时间。
    pub online_ttl: Duration,
    /// 心跳间隔：统计快照发布、回复缓存清扫、在线记录续期。
    pub heartbeat_interval: Duration,
    /// 回复上下文缓存时长。
    pub reply_cache_ttl: Duration,
    /// 两次排行榜发布之间的最小间隔（节流）。
    pub leaderboard_min_interval: Duration,
    /// 消息文本长度上限（字符数）。
    pub max_text_len: usize,
    /// 回复预览截断长度（字符数）。
    pub reply_preview_len: usize,
    /// 排行榜快照条目数。
    pub leaderboard_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rate_window: Duration::from_secs(60),
            rate_limit: 120,
            presence_ttl: Duration::from_secs(30),
            online_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            reply_cache_ttl: Duration::from_secs(35),
            leaderboard_min_interval: Duration::from_secs(10),
            max_text_len: 280,
            reply_preview_len: 120,
            leaderboard_size: 10,
        }
    }
}

/// 注入的共享能力。
pub struct RelayDependencies {
    pub presence: Arc<dyn PresenceStore>,
    pub leaderboard: Arc<dyn LeaderboardStore>,
    pub counters: Arc<dyn StatsCounters>,
    pub bus: Arc<dyn FanoutBus>,
    pub geo: Arc<dyn GeoResolver>,
}

pub struct RelayEngine {
    instance_id: String,
    config: RelayConfig,
    sessions: SessionRegistry,
    limiter: RateLimiter,
    reply_cache: ReplyCache,
    presence: Arc<dyn PresenceStore>,
    leaderboard: Arc<dyn LeaderboardStore>,
    counters: Arc<dyn StatsCounters>,
    bus: Arc<dyn FanoutBus>,
    geo: Arc<dyn GeoResolver>,
    /// 本地已知的最近一次全局统计，welcome 先用它应答。
    cached_stats: RwLock<StatsSnapshot>,
    last_leaderboard_publish: Mutex<Option<Instant>>,
}

impl RelayEngine {
    pub fn new(
        instance_id: impl Into<String>,
        config: RelayConfig,
        deps: RelayDependencies,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_window, config.rate_limit);
        let reply_cache = ReplyCache::new(config.reply_cache_ttl);
        Self {
            instance_id: instance_id.into(),
            config,
            sessions: SessionRegistry::new(),
            limiter,
            reply_cache,
            presence: deps.presence,
            leaderboard: deps.leaderboard,
            counters: deps.counters,
            bus: deps.bus,
            geo: deps.geo,
            cached_stats: RwLock::new(StatsSnapshot::default()),
            last_leaderboard_publish: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn local_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// 连接进入 Open 状态。
    ///
    /// 先同步注册会话并立即应答 welcome（本地已知统计，容忍暂时不准），
    /// 随后才走共享存储：历史用户计数、实例在线数、在线记录，最后把
    /// 全局精确的快照补发给新客户端。
    pub async fn on_open(
        &self,
        ip: IpAddr,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> ConnectionId {
        let id = ConnectionId::generate();
        let location = self.geo.resolve(ip).unwrap_or_else(fallback_location);
        let fingerprint = Fingerprint::derive(&ip.to_string(), location.country.as_deref());

        self.sessions.insert(Session::new(
            id,
            fingerprint.clone(),
            location.clone(),
            sender,
        ));
        tracing::info!(connection = %id, fingerprint = %fingerprint, "connection opened");

        let stats = *self.cached_stats.read().unwrap_or_else(|e| e.into_inner());
        self.sessions.send_to(
            id,
            ServerEvent::Welcome {
                id,
                fingerprint: fingerprint.to_string(),
                location: location.clone(),
                stats,
            },
        );

        if let Err(err) = self.counters.register_user(fingerprint.as_str()).await {
            tracing::warn!(error = %err, "failed to register all-time user");
        }
        self.push_online_count().await;

        let record = PresenceRecord::new(id, fingerprint.as_str(), &location, &self.instance_id);
        if let Err(err) = self.presence.upsert(record).await {
            tracing::warn!(error = %err, connection = %id, "presence upsert failed");
        }

        // 连接可能在 upsert 等待期间已经关闭；补偿性删除，
        // 避免已关闭会话的在线记录活到自然过期。
        if !self.sessions.contains(id) {
            if let Err(err) = self.presence.remove(id).await {
                tracing::warn!(error = %err, connection = %id, "compensating presence remove failed");
            }
            self.publish_users().await;
            return id;
        }

        self.publish_users().await;

        // 补发全局精确快照
        match self.fresh_stats().await {
            Ok(stats) => {
                *self.cached_stats.write().unwrap_or_else(|e| e.into_inner()) = stats;
                self.sessions.send_to(id, ServerEvent::Stats(stats));
            }
            Err(err) => tracing::warn!(error = %err, "failed to compute stats for new connection"),
        }
        match self.presence.list_all().await {
            Ok(users) => {
                self.sessions.send_to(id, ServerEvent::Users { users });
            }
            Err(err) => tracing::warn!(error = %err, "failed to list presence for new connection"),
        }
        match self.leaderboard.top(self.config.leaderboard_size).await {
            Ok(entries) => {
                self.sessions.send_to(id, ServerEvent::Leaderboard { entries });
            }
            Err(err) => tracing::warn!(error = %err, "failed to load leaderboard for new connection"),
        }

        id
    }

    /// 入站事件分发。新的事件种类必须在这里显式处理。
    pub async fn on_event(&self, id: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::Message {
                text,
                encrypted,
                encrypted_for,
                reply_to,
            } => {
                self.handle_message(id, text, encrypted, encrypted_for, reply_to)
                    .await;
            }
            ClientEvent::Ping => {
                self.sessions.send_to(id, ServerEvent::Pong);
            }
            ClientEvent::Identify { id: declared } => {
                self.handle_identify(id, &declared).await;
            }
            ClientEvent::UpdateLocation { lat, lng } => {
                self.handle_update_location(id, lat, lng).await;
            }
            ClientEvent::Typing => {
                self.handle_typing(id);
            }
            ClientEvent::Reaction { message_id, emoji } => {
                self.handle_reaction(id, message_id, &emoji);
            }
        }
    }

    async fn handle_message(
        &self,
        id: ConnectionId,
        text: String,
        encrypted: bool,
        encrypted_for: Option<String>,
        reply_to: Option<MessageId>,
    ) {
        let Some((fingerprint, location)) = self.sessions.identity_of(id) else {
            return;
        };

        if !self.limiter.allow(id, ActionClass::Message) {
            self.sessions.send_to(
                id,
                ServerEvent::Error {
                    message: "rate limit exceeded".into(),
                },
            );
            return;
        }

        // 空消息和超长消息静默丢弃
        if text.trim().is_empty() || text.chars().count() > self.config.max_text_len {
            return;
        }

        // 密文原样透传，中继从不尝试解密
        let text = if encrypted { text } else { sanitize_text(&text) };

        let mut message = BroadcastMessage {
            id: MessageId::generate(),
            text,
            lat: location.lat,
            lng: location.lng,
            timestamp: Utc::now(),
            encrypted,
            encrypted_for,
            sender_id: id,
            sender_fingerprint: fingerprint.to_string(),
            instance_id: self.instance_id.clone(),
            reply_to: None,
            reply_to_text: None,
            reply_to_lat: None,
            reply_to_lng: None,
        };

        if let Some(reply_id) = reply_to {
            // 解析不到的引用静默丢弃（可能缓存过期，也可能在别的实例上）
            if let Some(cached) = self.reply_cache.resolve(reply_id) {
                message.reply_to = Some(reply_id);
                message.reply_to_text =
                    Some(truncate_chars(&cached.text, self.config.reply_preview_len));
                message.reply_to_lat = Some(cached.lat);
                message.reply_to_lng = Some(cached.lng);
            }
        }

        self.reply_cache
            .insert(message.id, message.text.clone(), message.lat, message.lng);

        if let Err(err) = self.counters.mark_message().await {
            tracing::warn!(error = %err, "failed to mark message counter");
        }

        // 本地同步广播；发布回声靠 instance_id 抑制，不会二次投递
        self.sessions.broadcast(&ServerEvent::Message(message.clone()));
        self.publish_json(Channel::Messages, &message).await;

        if let Some(city) = location.city {
            let country = location.country.unwrap_or_default();
            match self.leaderboard.increment(&city, &country).await {
                Ok(()) => self.maybe_publish_leaderboard().await,
                Err(err) => {
                    tracing::warn!(error = %err, city = %city, "leaderboard increment failed");
                }
            }
        }
    }

    async fn handle_identify(&self, id: ConnectionId, declared: &str) {
        let fingerprint = match Fingerprint::parse_declared(declared) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                tracing::debug!(connection = %id, error = %err, "identify rejected");
                return;
            }
        };

        match self.sessions.set_fingerprint(id, fingerprint.clone()) {
            // 重复的相同 identify 是无操作
            Some(previous) if previous == fingerprint => return,
            Some(_) => {}
            None => return,
        }

        tracing::debug!(connection = %id, fingerprint = %fingerprint, "session identified");

        if let Some(location) = self.sessions.location_of(id) {
            let record =
                PresenceRecord::new(id, fingerprint.as_str(), &location, &self.instance_id);
            if let Err(err) = self.presence.upsert(record).await {
                tracing::warn!(error = %err, connection = %id, "presence re-register failed");
            }
            self.publish_users().await;
        }
    }

    async fn handle_update_location(&self, id: ConnectionId, lat: f64, lng: f64) {
        if let Err(err) = Location::validate_coordinates(lat, lng) {
            // 越界坐标静默丢弃，不触发任何重广播
            tracing::debug!(connection = %id, error = %err, "update_location rejected");
            return;
        }
        let Some(location) = self.sessions.update_location(id, lat, lng) else {
            return;
        };
        let Some(fingerprint) = self.sessions.fingerprint_of(id) else {
            return;
        };

        let record = PresenceRecord::new(id, fingerprint.as_str(), &location, &self.instance_id);
        if let Err(err) = self.presence.upsert(record).await {
            tracing::warn!(error = %err, connection = %id, "presence update failed");
        }
        self.publish_users().await;
    }

    /// 输入提示只在本实例内广播，不做跨实例扇出（明确的范围边界）。
    fn handle_typing(&self, id: ConnectionId) {
        if !self.limiter.allow(id, ActionClass::Typing) {
            self.sessions.send_to(
                id,
                ServerEvent::Error {
                    message: "rate limit exceeded".into(),
                },
            );
            return;
        }
        let Some((fingerprint, location)) = self.sessions.identity_of(id) else {
            return;
        };
        self.sessions.broadcast(&ServerEvent::Typing {
            fingerprint: fingerprint.to_string(),
            lat: location.lat,
            lng: location.lng,
        });
    }

    /// 表情回应同样只在本实例内广播，不持久化。
    fn handle_reaction(&self, id: ConnectionId, message_id: MessageId, emoji: &str) {
        if validate_reaction(emoji).is_err() {
            return;
        }
        let Some(fingerprint) = self.sessions.fingerprint_of(id) else {
            return;
        };
        self.sessions.broadcast(&ServerEvent::Reaction {
            message_id,
            emoji: emoji.to_string(),
            fingerprint: fingerprint.to_string(),
        });
    }

    /// 连接关闭。幂等：重复调用是无操作。
    pub async fn on_close(&self, id: ConnectionId) {
        if !self.sessions.remove(id) {
            return;
        }
        self.limiter.forget(id);
        tracing::info!(connection = %id, "connection closed");

        self.push_online_count().await;
        if let Err(err) = self.presence.remove(id).await {
            tracing::warn!(error = %err, connection = %id, "presence remove failed");
        }
        self.publish_users().await;
        self.publish_stats().await;
    }

    /// 心跳：统计快照发布、回复缓存清扫、本地会话在线记录续期。
    ///
    /// 这是防止活跃连接从共享存储中静默过期的存活机制。
    pub async fn tick(&self) {
        self.publish_stats().await;

        let swept = self.reply_cache.sweep();
        if swept > 0 {
            tracing::debug!(swept, "reply cache swept");
        }

        for id in self.sessions.ids() {
            if let Err(err) = self.presence.refresh(id).await {
                tracing::warn!(error = %err, connection = %id, "presence refresh failed");
            }
        }
        self.push_online_count().await;
    }

    /// 总线投递入口。对端载荷不可解析时记录后丢弃，绝不向本地客户端传播。
    pub async fn on_published(&self, channel: Channel, payload: &str) {
        match channel {
            Channel::Messages => match serde_json::from_str::<BroadcastMessage>(payload) {
                // 自己的发布回声：本地已经同步广播过了
                Ok(message) if message.instance_id == self.instance_id => {}
                Ok(message) => {
                    self.sessions.broadcast(&ServerEvent::Message(message));
                }
                Err(err) => {
                    tracing::warn!(error = %err, channel = %channel, "malformed peer payload");
                }
            },
            Channel::Stats => match serde_json::from_str::<StatsSnapshot>(payload) {
                Ok(stats) => {
                    *self.cached_stats.write().unwrap_or_else(|e| e.into_inner()) = stats;
                    self.sessions.broadcast(&ServerEvent::Stats(stats));
                }
                Err(err) => {
                    tracing::warn!(error = %err, channel = %channel, "malformed peer payload");
                }
            },
            Channel::Users => match serde_json::from_str::<Vec<PresenceRecord>>(payload) {
                Ok(users) => {
                    self.sessions.broadcast(&ServerEvent::Users { users });
                }
                Err(err) => {
                    tracing::warn!(error = %err, channel = %channel, "malformed peer payload");
                }
            },
            Channel::Leaderboard => match serde_json::from_str::<Vec<LeaderboardEntry>>(payload) {
                Ok(entries) => {
                    self.sessions.broadcast(&ServerEvent::Leaderboard { entries });
                }
                Err(err) => {
                    tracing::warn!(error = %err, channel = %channel, "malformed peer payload");
                }
            },
        }
    }

    /// 查询接口：实时计算的全局统计。
    pub async fn stats_snapshot(&self) -> Result<StatsSnapshot, StoreError> {
        self.fresh_stats().await
    }

    /// 查询接口：全量在线用户（最终一致）。
    pub async fn online_users(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        self.presence.list_all().await
    }

    /// 查询接口：排行榜前 k 名。
    pub async fn leaderboard_top(&self, k: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
        self.leaderboard.top(k).await
    }

    /// 心跳循环，由启动代码 spawn。
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 第一次 tick 立即完成，跳过它避免启动时重复发布
        interval.tick().await;
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// 订阅泵：把总线投递交给引擎处理，由启动代码 spawn。
    pub async fn run_subscription(self: Arc<Self>) {
        let mut receiver = self.bus.subscribe();
        while let Some((channel, payload)) = receiver.recv().await {
            self.on_published(channel, &payload).await;
        }
        tracing::warn!("fanout subscription stream ended");
    }

    async fn push_online_count(&self) {
        let count = self.sessions.len() as u64;
        if let Err(err) = self
            .presence
            .set_instance_online(&self.instance_id, count)
            .await
        {
            tracing::warn!(error = %err, "failed to update instance online count");
        }
    }

    async fn fresh_stats(&self) -> Result<StatsSnapshot, StoreError> {
        let online = self.presence.total_online().await?;
        let all_time_users = self.counters.all_time_users().await?;
        let messages_per_minute = self.counters.messages_per_minute().await?;
        Ok(StatsSnapshot {
            online,
            all_time_users,
            messages_per_minute,
        })
    }

    /// 统计快照走总线回环投递：发布后每个实例（包括本实例）的订阅泵
    /// 负责广播给各自的本地会话。
    async fn publish_stats(&self) {
        match self.fresh_stats().await {
            Ok(stats) => {
                *self.cached_stats.write().unwrap_or_else(|e| e.into_inner()) = stats;
                self.publish_json(Channel::Stats, &stats).await;
            }
            Err(err) => tracing::warn!(error = %err, "failed to compute stats snapshot"),
        }
    }

    /// 全量在线列表发布。刻意用全量快照而不是增量，换取实例间没有
    /// 合并顺序问题。
    async fn publish_users(&self) {
        match self.presence.list_all().await {
            Ok(users) => self.publish_json(Channel::Users, &users).await,
            Err(err) => tracing::warn!(error = %err, "failed to list presence"),
        }
    }

    async fn maybe_publish_leaderboard(&self) {
        let due = {
            let mut last = self
                .last_leaderboard_publish
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match *last {
                Some(at) if at.elapsed() < self.config.leaderboard_min_interval => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if !due {
            return;
        }
        match self.leaderboard.top(self.config.leaderboard_size).await {
            Ok(entries) => self.publish_json(Channel::Leaderboard, &entries).await,
            Err(err) => tracing::warn!(error = %err, "failed to load leaderboard"),
        }
    }

    /// 发布失败只记录，不重试——至多一次投递是接受的属性而不是缺陷。
    async fn publish_json<T: Serialize>(&self, channel: Channel, value: &T) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, channel = %channel, "failed to serialize payload");
                return;
            }
        };
        if let Err(err) = self.bus.publish(channel, payload).await {
            tracing::warn!(error = %err, channel = %channel, "publish failed");
        }
    }
}
