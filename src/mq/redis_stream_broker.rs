//! Redis Streams 브로커
//!
//! `RedisStreamProducer`와 `RedisStreamConsumer`를 묶어 `BrokerInterface`로 노출합니다.

use async_trait::async_trait;
use log::info;
use redis::aio::MultiplexedConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::mq::broker::{BrokerInterface, HealthCheckResult, HealthStatus, MessageCallback};
use crate::mq::config::RedisStreamConfig;
use crate::mq::connection_pool::ConnectionPool;
use crate::mq::error::{BrokerError, BrokerResult};
use crate::mq::message::Message;
use crate::mq::metrics::{BrokerMetrics, ConnectionEvent};
use crate::mq::redis_consumer::RedisStreamConsumer;
use crate::mq::redis_streams::{BatchPublishResult, RedisStreamProducer};
use crate::mq::stream_backend::{RedisStreamBackend, StreamBackend};

const BROKER_NAME: &str = "redis_streams";

/// Redis Streams 브로커
pub struct RedisStreamBroker {
    backend: Arc<dyn StreamBackend>,
    producer: RedisStreamProducer,
    consumer: RedisStreamConsumer,
    connected: AtomicBool,
    metrics: Arc<dyn BrokerMetrics>,
}

impl RedisStreamBroker {
    /// 주어진 드라이버로 브로커 생성
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        config: &RedisStreamConfig,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> Self {
        Self {
            producer: RedisStreamProducer::new(
                backend.clone(),
                config.max_len,
                config.chunk_size,
                metrics.clone(),
            ),
            consumer: RedisStreamConsumer::new(backend.clone(), config, metrics.clone()),
            backend,
            connected: AtomicBool::new(true),
            metrics,
        }
    }

    /// Redis에 연결하고 PING으로 확인한 뒤 브로커 생성
    pub async fn connect(
        config: &RedisStreamConfig,
        pool: Arc<ConnectionPool<MultiplexedConnection>>,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> BrokerResult<Self> {
        let connection_failed = |reason: String| BrokerError::ConnectionFailed {
            broker: BROKER_NAME.to_string(),
            reason,
        };

        let backend = RedisStreamBackend::new(&config.connection, pool)
            .map_err(|e| connection_failed(e.to_string()))?;
        backend
            .ping()
            .await
            .map_err(|e| connection_failed(e.to_string()))?;

        info!(
            "Redis Streams 브로커 연결 완료: {}:{}",
            config.connection.host, config.connection.port
        );
        metrics.record_connection_event(BROKER_NAME, ConnectionEvent::Connected);

        Ok(Self::new(Arc::new(backend), config, metrics))
    }

    pub fn producer(&self) -> &RedisStreamProducer {
        &self.producer
    }

    pub fn consumer(&self) -> &RedisStreamConsumer {
        &self.consumer
    }

    /// 청크 단위 배치 발행
    pub async fn publish_batch(
        &self,
        channel: &str,
        messages: &[Message],
        chunk_size: Option<usize>,
    ) -> BrokerResult<BatchPublishResult> {
        self.ensure_connected()?;
        self.producer.publish_batch(channel, messages, chunk_size).await
    }

    /// 여러 스트림을 반복 소비 (비차단 / 차단 모드)
    pub async fn consume_multiple(
        &self,
        channels: &[String],
        batch_size: usize,
        blocking: bool,
    ) -> BrokerResult<usize> {
        self.ensure_connected()?;
        self.consumer.consume_multiple(channels, batch_size, blocking).await
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected {
                broker: BROKER_NAME.to_string(),
            })
        }
    }
}

#[async_trait]
impl BrokerInterface for RedisStreamBroker {
    fn name(&self) -> &str {
        BROKER_NAME
    }

    async fn publish(&self, channel: &str, message: &Message) -> BrokerResult<()> {
        self.ensure_connected()?;
        self.producer.publish(channel, message).await.map(|_| ())
    }

    async fn subscribe(&self, channel: &str, callback: MessageCallback) -> BrokerResult<()> {
        self.ensure_connected()?;
        self.consumer.subscribe(channel, callback).await
    }

    async fn unsubscribe(&self, channel: &str) -> BrokerResult<()> {
        self.consumer.unsubscribe(channel);
        Ok(())
    }

    async fn consume(&self, timeout_ms: u64, batch_size: usize) -> BrokerResult<usize> {
        self.ensure_connected()?;
        self.consumer.consume(timeout_ms, batch_size).await
    }

    fn stop_consuming(&self) {
        self.consumer.stop();
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.backend.ping().await.is_ok()
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.consumer.stop();
            self.consumer.clear_subscriptions();
            self.metrics
                .record_connection_event(BROKER_NAME, ConnectionEvent::Disconnected);
            info!("Redis Streams 브로커 연결 해제");
        }
        Ok(())
    }

    async fn health_check(&self) -> HealthCheckResult {
        if !self.connected.load(Ordering::SeqCst) {
            return HealthCheckResult::unhealthy(BROKER_NAME, "disconnected");
        }

        let started = Instant::now();
        if let Err(e) = self.backend.ping().await {
            return HealthCheckResult::unhealthy(BROKER_NAME, &e.to_string());
        }
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = HealthCheckResult::new(BROKER_NAME, HealthStatus::Healthy)
            .with_latency(latency_ms)
            .with_detail("group", self.consumer.group())
            .with_detail("consumer", self.consumer.consumer_name())
            .with_detail("consumer_state", self.consumer.state().to_string())
            .with_detail("subscriptions", self.consumer.streams());

        match self.consumer.pending_counts().await {
            Ok(pending) => result.with_detail(
                "pending",
                serde_json::to_value(pending).unwrap_or_default(),
            ),
            Err(e) => {
                let mut degraded = result.with_detail("error", e.to_string());
                degraded.status = HealthStatus::Degraded;
                degraded
            }
        }
    }
}
