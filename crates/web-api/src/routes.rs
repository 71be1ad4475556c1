use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use domain::{LeaderboardEntry, PresenceRecord, StatsSnapshot};

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

const LEADERBOARD_DEFAULT: usize = 10;
const LEADERBOARD_MAX: usize = 100;

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct UsersResponse {
    users: Vec<PresenceRecord>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/users", get(users))
        .route("/leaderboard", get(leaderboard))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsSnapshot>, ApiError> {
    let stats = state.engine.stats_snapshot().await?;
    Ok(Json(stats))
}

async fn users(State(state): State<AppState>) -> Result<Json<UsersResponse>, ApiError> {
    let users = state.engine.online_users().await?;
    Ok(Json(UsersResponse { users }))
}

async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(LEADERBOARD_DEFAULT)
        .min(LEADERBOARD_MAX);
    let entries = state.engine.leaderboard_top(limit).await?;
    Ok(Json(entries))
}

async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let ip = client_ip(&headers, addr);
    ws.on_upgrade(move |socket| WebSocketConnection::run(socket, state, ip))
}

/// 反向代理后面的真实客户端 IP 取自 X-Forwarded-For 的第一跳，
/// 解析不出来时退回到对端套接字地址。
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use application::stores::memory::{
        MemoryFanoutBus, MemoryLeaderboardStore, MemoryPresenceStore, MemoryStatsCounters,
    };
    use application::{NullGeoResolver, RelayConfig, RelayDependencies, RelayEngine};

    fn test_state() -> AppState {
        let config = RelayConfig::default();
        let engine = Arc::new(RelayEngine::new(
            "test",
            config.clone(),
            RelayDependencies {
                presence: Arc::new(MemoryPresenceStore::new(
                    config.presence_ttl,
                    config.online_ttl,
                )),
                leaderboard: Arc::new(MemoryLeaderboardStore::new()),
                counters: Arc::new(MemoryStatsCounters::default()),
                bus: Arc::new(MemoryFanoutBus::new()),
                geo: Arc::new(NullGeoResolver),
            },
        ));
        AppState::new(engine)
    }

    #[tokio::test]
    async fn router_builds_with_memory_state() {
        let _router = router(test_state());
    }

    #[tokio::test]
    async fn stats_endpoint_reports_snapshot() {
        let state = test_state();
        let response = stats(State(state)).await.unwrap();
        assert_eq!(response.0.online, 0);
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.9, 10.0.0.2".parse().unwrap(),
        );
        assert_eq!(
            client_ip(&headers, addr),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn client_ip_falls_back_to_socket_address() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, addr), addr.ip());

        let mut bad = HeaderMap::new();
        bad.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(client_ip(&bad, addr), addr.ip());
    }
}
