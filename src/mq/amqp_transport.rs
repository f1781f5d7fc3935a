//! AMQP 드라이버
//!
//! RabbitMQ 브로커는 `AmqpTransport` 트레이트만 사용하며,
//! 실제 연결과 채널 관리는 `LapinTransport`가 담당합니다.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::mq::config::RabbitMqConfig;
use crate::mq::connection_pool::{ConnectionPool, EndpointKey};
use crate::mq::error::DriverError;

/// 트랜스포트 내부 채널 식별자
pub type ChannelId = u64;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// 발행 속성
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpProperties {
    pub content_type: String,
    /// 2 = persistent, 1 = transient
    pub delivery_mode: u8,
    /// 유닉스 초
    pub timestamp: u64,
}

impl AmqpProperties {
    pub fn json(persistent: bool) -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            delivery_mode: if persistent { 2 } else { 1 },
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }
}

/// 수신한 메시지
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Topic exchange 라우팅 키 매칭
///
/// `*`는 정확히 한 단어, `#`은 0개 이상의 단어와 매칭됩니다.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// AMQP 명령 추상화
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// 연결이 살아 있으면 아무것도 하지 않고 `false`, 새로 연결했으면 `true`
    ///
    /// 새 연결이면 이전 연결의 채널과 exclusive 큐는 더 이상 존재하지 않습니다.
    async fn connect(&self) -> Result<bool, DriverError>;

    async fn is_connected(&self) -> bool;

    async fn open_channel(&self, prefetch_count: u16) -> Result<ChannelId, DriverError>;

    async fn is_channel_open(&self, channel: ChannelId) -> bool;

    /// 채널을 닫고 잊음. 이미 닫혔거나 모르는 채널이면 아무것도 하지 않습니다.
    async fn release_channel(&self, channel: ChannelId) -> Result<(), DriverError>;

    async fn declare_exchange(
        &self,
        channel: ChannelId,
        exchange: &str,
        kind: &str,
    ) -> Result<(), DriverError>;

    /// 큐 선언. `name`이 비어 있으면 서버가 이름을 정하며, 실제 큐 이름을 반환합니다.
    async fn declare_queue(
        &self,
        channel: ChannelId,
        name: &str,
        exclusive: bool,
    ) -> Result<String, DriverError>;

    async fn bind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DriverError>;

    async fn unbind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DriverError>;

    async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &AmqpProperties,
    ) -> Result<(), DriverError>;

    async fn start_consumer(
        &self,
        channel: ChannelId,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<(), DriverError>;

    /// 최대 `timeout_ms` 동안 다음 메시지를 기다림. 시간 초과면 `None`.
    async fn next_delivery(
        &self,
        channel: ChannelId,
        timeout_ms: u64,
    ) -> Result<Option<AmqpDelivery>, DriverError>;

    async fn ack(&self, channel: ChannelId, delivery_tag: u64) -> Result<(), DriverError>;

    async fn nack(&self, channel: ChannelId, delivery_tag: u64, requeue: bool) -> Result<(), DriverError>;

    /// 이 트랜스포트가 연 채널을 모두 닫음
    async fn close(&self) -> Result<(), DriverError>;
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "topic" => ExchangeKind::Topic,
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// lapin 기반 AMQP 드라이버
///
/// 연결은 엔드포인트 키로 풀에서 공유하고, 채널과 컨슈머는 인스턴스별로 소유합니다.
pub struct LapinTransport {
    uri: String,
    endpoint: EndpointKey,
    pool: Arc<ConnectionPool<Arc<Connection>>>,
    connection: Mutex<Option<Arc<Connection>>>,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    consumers: Mutex<HashMap<ChannelId, Consumer>>,
    next_channel_id: AtomicU64,
}

impl LapinTransport {
    pub fn new(config: &RabbitMqConfig, pool: Arc<ConnectionPool<Arc<Connection>>>) -> Self {
        Self {
            uri: config.amqp_uri(),
            endpoint: config.endpoint_key(),
            pool,
            connection: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            next_channel_id: AtomicU64::new(1),
        }
    }

    async fn current_connection(&self) -> Result<Arc<Connection>, DriverError> {
        match self.connection.lock().await.as_ref() {
            Some(conn) if conn.status().connected() => Ok(conn.clone()),
            _ => Err(DriverError::connection_lost("AMQP 연결 없음")),
        }
    }

    async fn channel(&self, id: ChannelId) -> Result<Channel, DriverError> {
        self.channels
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DriverError::connection_lost(format!("AMQP 채널 {} 없음", id)))
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn connect(&self) -> Result<bool, DriverError> {
        let mut current = self.connection.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.status().connected() {
                return Ok(false);
            }
        }

        // 끊긴 연결은 풀에서 제거 후 새로 연결
        if let Some(pooled) = self.pool.get(&self.endpoint).await {
            if !pooled.status().connected() {
                self.pool.purge(&self.endpoint).await;
            }
        }

        let uri = self.uri.clone();
        let conn = self
            .pool
            .get_or_connect(&self.endpoint, || async move {
                Connection::connect(&uri, ConnectionProperties::default())
                    .await
                    .map(Arc::new)
                    .map_err(DriverError::from)
            })
            .await?;

        self.channels.lock().await.clear();
        self.consumers.lock().await.clear();
        *current = Some(conn);
        info!("AMQP 연결 완료: {}", self.endpoint);
        Ok(true)
    }

    async fn is_connected(&self) -> bool {
        self.current_connection().await.is_ok()
    }

    async fn open_channel(&self, prefetch_count: u16) -> Result<ChannelId, DriverError> {
        let conn = self.current_connection().await?;
        let channel = conn.create_channel().await?;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;

        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().await.insert(id, channel);
        debug!("AMQP 채널 생성: {} (prefetch={})", id, prefetch_count);
        Ok(id)
    }

    async fn is_channel_open(&self, channel: ChannelId) -> bool {
        self.channels
            .lock()
            .await
            .get(&channel)
            .map(|c| c.status().connected())
            .unwrap_or(false)
    }

    async fn release_channel(&self, channel: ChannelId) -> Result<(), DriverError> {
        self.consumers.lock().await.remove(&channel);
        let released = self.channels.lock().await.remove(&channel);
        if let Some(released) = released {
            if released.status().connected() {
                released.close(200, "channel released").await?;
            }
            debug!("AMQP 채널 해제: {}", channel);
        }
        Ok(())
    }

    async fn declare_exchange(
        &self,
        channel: ChannelId,
        exchange: &str,
        kind: &str,
    ) -> Result<(), DriverError> {
        let channel = self.channel(channel).await?;
        channel
            .exchange_declare(
                exchange,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: ChannelId,
        name: &str,
        exclusive: bool,
    ) -> Result<String, DriverError> {
        let channel = self.channel(channel).await?;
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    exclusive,
                    durable: !exclusive,
                    auto_delete: exclusive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DriverError> {
        let channel = self.channel(channel).await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DriverError> {
        let channel = self.channel(channel).await?;
        channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &AmqpProperties,
    ) -> Result<(), DriverError> {
        let channel = self.channel(channel).await?;
        let props = BasicProperties::default()
            .with_content_type(ShortString::from(properties.content_type.clone()))
            .with_delivery_mode(properties.delivery_mode)
            .with_timestamp(properties.timestamp);

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                props,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn start_consumer(
        &self,
        channel: ChannelId,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<(), DriverError> {
        let amqp_channel = self.channel(channel).await?;
        let consumer = amqp_channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.consumers.lock().await.insert(channel, consumer);
        info!("AMQP 컨슈머 등록: {} (queue={})", consumer_tag, queue);
        Ok(())
    }

    async fn next_delivery(
        &self,
        channel: ChannelId,
        timeout_ms: u64,
    ) -> Result<Option<AmqpDelivery>, DriverError> {
        let mut consumers = self.consumers.lock().await;
        let consumer = consumers
            .get_mut(&channel)
            .ok_or_else(|| DriverError::connection_lost(format!("채널 {}에 컨슈머 없음", channel)))?;

        match tokio::time::timeout(Duration::from_millis(timeout_ms), consumer.next()).await {
            Err(_) => Ok(None),
            Ok(None) => {
                consumers.remove(&channel);
                Err(DriverError::connection_lost("AMQP 컨슈머 스트림 종료"))
            }
            Ok(Some(Err(e))) => Err(DriverError::from(e)),
            Ok(Some(Ok(delivery))) => Ok(Some(AmqpDelivery {
                delivery_tag: delivery.delivery_tag,
                routing_key: delivery.routing_key.as_str().to_string(),
                body: delivery.data,
            })),
        }
    }

    async fn ack(&self, channel: ChannelId, delivery_tag: u64) -> Result<(), DriverError> {
        let channel = self.channel(channel).await?;
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, channel: ChannelId, delivery_tag: u64, requeue: bool) -> Result<(), DriverError> {
        let channel = self.channel(channel).await?;
        channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.consumers.lock().await.clear();
        let channels: Vec<Channel> = self.channels.lock().await.drain().map(|(_, c)| c).collect();
        for channel in channels {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "client disconnect").await {
                    warn!("AMQP 채널 종료 실패: {}", e);
                }
            }
        }
        *self.connection.lock().await = None;
        Ok(())
    }
}
