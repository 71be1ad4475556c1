//! Redis Pub/Sub 扇出总线。
//!
//! 四个逻辑频道映射到 `relay:{channel}`。投递是尽力而为的至多一次：
//! 订阅连接断开期间的发布没有重放。后台监听任务断线后指数退避重连。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use application::{Channel, FanoutBus, StoreError};

use super::error::{store_err, RedisError, RedisResult};

const CHANNEL_PREFIX: &str = "relay:";
const MAX_BACKOFF_SECS: u64 = 30;

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<(Channel, String)>>>>;

pub struct RedisFanoutBus {
    conn: ConnectionManager,
    subscribers: Subscribers,
}

impl RedisFanoutBus {
    /// 建立发布连接并启动后台订阅任务。
    pub async fn connect(client: Client) -> RedisResult<Self> {
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|err| RedisError::Connection {
                message: err.to_string(),
            })?;

        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(Self::listen_loop(client, Arc::clone(&subscribers)));

        info!("fanout bus connected");
        Ok(Self { conn, subscribers })
    }

    fn channel_name(channel: Channel) -> String {
        format!("{CHANNEL_PREFIX}{channel}")
    }

    async fn listen_loop(client: Client, subscribers: Subscribers) {
        let mut backoff = 1;
        loop {
            match Self::listen_once(&client, &subscribers).await {
                Ok(()) => {
                    warn!("fanout subscription stream closed, reconnecting");
                    backoff = 1;
                }
                Err(err) => {
                    warn!(error = %err, backoff_secs = backoff, "fanout subscription failed");
                    sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    async fn listen_once(client: &Client, subscribers: &Subscribers) -> RedisResult<()> {
        let mut pubsub =
            client
                .get_async_pubsub()
                .await
                .map_err(|err| RedisError::Connection {
                    message: err.to_string(),
                })?;

        for channel in Channel::ALL {
            pubsub
                .subscribe(Self::channel_name(channel))
                .await
                .map_err(|err| RedisError::Subscribe {
                    message: err.to_string(),
                })?;
        }
        debug!("subscribed to all fanout channels");

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let name = message.get_channel_name().to_string();
            let Some(channel) = name
                .strip_prefix(CHANNEL_PREFIX)
                .and_then(Channel::parse)
            else {
                continue;
            };
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, channel = %channel, "failed to read fanout payload");
                    continue;
                }
            };
            let mut subs = subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subs.retain(|tx| tx.send((channel, payload.clone())).is_ok());
        }
        Ok(())
    }
}

#[async_trait]
impl FanoutBus for RedisFanoutBus {
    async fn publish(&self, channel: Channel, payload: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(Self::channel_name(channel))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<(Channel, String)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.push(tx);
        rx
    }
}
