use std::net::IpAddr;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use domain::{ClientEvent, ServerEvent};

use crate::state::AppState;

/// WebSocket 连接胶水层
///
/// 连接的全部语义都在中继引擎里；这里只负责：
/// - 建立出站事件通道并注册会话
/// - 把入站 JSON 帧解析成事件交给引擎
/// - 连接断开时触发幂等的关闭清理
pub struct WebSocketConnection;

impl WebSocketConnection {
    pub async fn run(socket: WebSocket, state: AppState, ip: IpAddr) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let id = state.engine.on_open(ip, events_tx).await;

        let (mut sender, mut incoming) = socket.split();

        // 发送任务：引擎投递的事件序列化后写入 socket
        let send_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to serialize outbound event");
                        continue;
                    }
                };
                if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        });

        // 接收任务：入站帧解析成事件交给引擎，解析不了的记录后丢弃
        let engine = state.engine.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(Ok(message)) = incoming.next().await {
                match message {
                    WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => engine.on_event(id, event).await,
                        Err(err) => {
                            tracing::debug!(connection = %id, error = %err, "dropping unparseable frame");
                        }
                    },
                    WsMessage::Close(_) => break,
                    // ping/pong 由底层协议栈应答，二进制帧不支持
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => {}
                }
            }
        });

        // 任一方向结束即视为连接断开
        tokio::select! {
            _ = send_task => {}
            _ = recv_task => {}
        }

        state.engine.on_close(id).await;
        tracing::info!(connection = %id, "websocket connection cleaned up");
    }
}
