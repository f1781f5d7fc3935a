//! Redis Pub/Sub 드라이버
//!
//! 발행은 풀에서 공유하는 멀티플렉스 연결로, 수신은 구독 전용 연결로 처리합니다.
//!
//! 구독 상태의 연결에서는 일반 PING을 보낼 수 없으므로, 각 드라이버는 전용 heartbeat
//! 채널을 구독하고 `ping`에서 그 채널로 PUBLISH합니다. 수신자가 0이면 서버가 구독
//! 연결을 잃은 것으로 보고 연결을 버립니다.

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info};
use redis::aio::MultiplexedConnection;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::mq::config::RedisConnectionConfig;
use crate::mq::connection_pool::{ConnectionPool, EndpointKey};
use crate::mq::error::DriverError;

const HEARTBEAT_PREFIX: &str = "realtime-broker:heartbeat:";

/// 수신한 Pub/Sub 메시지
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Pub/Sub 명령 추상화
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// 구독 연결을 (재)생성하고 기존 구독 채널을 다시 구독
    async fn connect(&self) -> Result<(), DriverError>;

    async fn is_connected(&self) -> bool;

    /// PUBLISH. 메시지를 받은 구독자 수를 반환합니다.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, DriverError>;

    async fn subscribe(&self, channels: &[String]) -> Result<(), DriverError>;

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), DriverError>;

    /// 최대 `timeout_ms` 동안 다음 메시지를 기다림. 시간 초과면 `None`.
    async fn next_message(&self, timeout_ms: u64) -> Result<Option<PubSubMessage>, DriverError>;

    /// 구독 연결 생존 확인. 실패하면 구독 연결은 버려진 상태입니다.
    async fn ping(&self) -> Result<(), DriverError>;

    async fn disconnect(&self) -> Result<(), DriverError>;
}

/// redis-rs 기반 Pub/Sub 드라이버
pub struct RedisPubSubBackend {
    client: redis::Client,
    endpoint: EndpointKey,
    pool: Arc<ConnectionPool<MultiplexedConnection>>,
    subscriber: Mutex<Option<redis::aio::PubSub>>,
    channels: Mutex<BTreeSet<String>>,
    heartbeat_channel: String,
}

impl RedisPubSubBackend {
    pub fn new(
        config: &RedisConnectionConfig,
        pool: Arc<ConnectionPool<MultiplexedConnection>>,
    ) -> Result<Self, DriverError> {
        Ok(Self {
            client: redis::Client::open(config.url())?,
            endpoint: config.endpoint_key(),
            pool,
            subscriber: Mutex::new(None),
            channels: Mutex::new(BTreeSet::new()),
            heartbeat_channel: format!("{}{}", HEARTBEAT_PREFIX, uuid::Uuid::new_v4().simple()),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, DriverError> {
        let client = self.client.clone();
        self.pool
            .get_or_connect(&self.endpoint, || async move {
                client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(DriverError::from)
            })
            .await
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, DriverError> {
        let mut conn = self.connection().await?;
        match cmd.query_async::<_, T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = DriverError::from(e);
                if err.is_connection_error() {
                    self.pool.purge(&self.endpoint).await;
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl PubSubBackend for RedisPubSubBackend {
    async fn connect(&self) -> Result<(), DriverError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();

        pubsub.subscribe(&self.heartbeat_channel).await?;
        let channels = self.channels.lock().await;
        for channel in channels.iter() {
            pubsub.subscribe(channel).await?;
        }

        *self.subscriber.lock().await = Some(pubsub);
        info!("Redis Pub/Sub 구독 연결 생성 ({}개 채널)", channels.len());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.subscriber.lock().await.is_some()
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, DriverError> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload);
        self.query(&cmd).await
    }

    async fn subscribe(&self, channels: &[String]) -> Result<(), DriverError> {
        let mut subscriber = self.subscriber.lock().await;
        if let Some(pubsub) = subscriber.as_mut() {
            for channel in channels {
                pubsub.subscribe(channel).await?;
            }
        }
        self.channels.lock().await.extend(channels.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), DriverError> {
        let mut subscriber = self.subscriber.lock().await;
        if let Some(pubsub) = subscriber.as_mut() {
            for channel in channels {
                pubsub.unsubscribe(channel).await?;
            }
        }
        let mut subscribed = self.channels.lock().await;
        for channel in channels {
            subscribed.remove(channel);
        }
        Ok(())
    }

    async fn next_message(&self, timeout_ms: u64) -> Result<Option<PubSubMessage>, DriverError> {
        let mut subscriber = self.subscriber.lock().await;
        let pubsub = subscriber
            .as_mut()
            .ok_or_else(|| DriverError::connection_lost("Pub/Sub 구독 연결 없음"))?;

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let next = {
                let mut stream = pubsub.on_message();
                tokio::time::timeout_at(deadline, stream.next()).await
            };

            match next {
                Err(_) => return Ok(None),
                Ok(None) => {
                    *subscriber = None;
                    return Err(DriverError::connection_lost("Pub/Sub 연결 종료"));
                }
                Ok(Some(msg)) if msg.get_channel_name() == self.heartbeat_channel => continue,
                Ok(Some(msg)) => {
                    let payload: String = msg.get_payload()?;
                    return Ok(Some(PubSubMessage {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    }));
                }
            }
        }
    }

    async fn ping(&self) -> Result<(), DriverError> {
        if self.subscriber.lock().await.is_none() {
            return Err(DriverError::connection_lost("Pub/Sub 구독 연결 없음"));
        }
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(&self.heartbeat_channel).arg("ping");
        let receivers: u64 = self.query(&cmd).await?;
        if receivers == 0 {
            *self.subscriber.lock().await = None;
            return Err(DriverError::connection_lost(
                "heartbeat 수신자 없음: 구독 연결 유실",
            ));
        }
        debug!("Pub/Sub heartbeat 확인 ({})", self.heartbeat_channel);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        *self.subscriber.lock().await = None;
        self.channels.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_channel_is_private_per_driver() {
        let pool = Arc::new(ConnectionPool::new("redis"));
        let config = RedisConnectionConfig::default();
        let first = RedisPubSubBackend::new(&config, pool.clone()).unwrap();
        let second = RedisPubSubBackend::new(&config, pool).unwrap();

        assert!(first.heartbeat_channel.starts_with(HEARTBEAT_PREFIX));
        assert_ne!(first.heartbeat_channel, second.heartbeat_channel);
    }
}
