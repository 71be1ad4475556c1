//! 主应用程序入口
//!
//! 装配 Redis 存储、中继引擎和 Axum 服务，启动心跳与订阅泵。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::{NullGeoResolver, RelayConfig, RelayDependencies, RelayEngine};
use config::AppConfig;
use infrastructure::{
    RedisFanoutBus, RedisLeaderboardStore, RedisPresenceStore, RedisStatsCounters,
};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let app_config = AppConfig::from_env();
    app_config.validate()?;

    // 实例标识：共享存储里在线计数和消息回声抑制都以它为键
    let instance_id = app_config
        .server
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("relay-{}", uuid::Uuid::new_v4()));
    tracing::info!(instance = %instance_id, "starting relay instance");

    let relay_config = RelayConfig {
        rate_window: Duration::from_secs(app_config.relay.rate_window_secs),
        rate_limit: app_config.relay.rate_limit,
        presence_ttl: Duration::from_secs(app_config.relay.presence_ttl_secs),
        online_ttl: Duration::from_secs(app_config.relay.online_ttl_secs),
        heartbeat_interval: app_config.relay.heartbeat_interval(),
        reply_cache_ttl: Duration::from_secs(app_config.relay.reply_cache_ttl_secs),
        leaderboard_min_interval: Duration::from_secs(
            app_config.relay.leaderboard_min_interval_secs,
        ),
        max_text_len: app_config.relay.max_text_len,
        ..RelayConfig::default()
    };

    // Redis 共享存储和扇出总线
    let redis_client = redis::Client::open(app_config.redis.url.as_str())?;
    let conn = redis_client.get_connection_manager().await?;
    tracing::info!("connected to redis");

    let presence = Arc::new(RedisPresenceStore::new(
        conn.clone(),
        relay_config.presence_ttl,
        relay_config.online_ttl,
    ));
    let leaderboard = Arc::new(RedisLeaderboardStore::new(conn.clone()));
    let counters = Arc::new(RedisStatsCounters::new(conn, Duration::from_secs(60)));
    let bus = Arc::new(RedisFanoutBus::connect(redis_client).await?);

    let engine = Arc::new(RelayEngine::new(
        instance_id,
        relay_config,
        RelayDependencies {
            presence,
            leaderboard,
            counters,
            bus,
            geo: Arc::new(NullGeoResolver),
        },
    ));

    // 心跳：统计发布、缓存清扫、在线记录续期
    tokio::spawn(engine.clone().run_heartbeat());
    // 订阅泵：其他实例的发布广播给本地会话
    tokio::spawn(engine.clone().run_subscription());

    // 启动 Web 服务器
    let app = router(AppState::new(engine));
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("relay listening on http://{addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
