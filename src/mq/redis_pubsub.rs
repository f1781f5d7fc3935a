//! Redis Pub/Sub 브로커
//!
//! 영속성 없는 fire-and-forget 전달입니다. 구독자가 없을 때 발행된 메시지는 사라집니다.
//! 수신 루프는 서킷 브레이커 안에서 실행되며, 실패하면 지수 백오프로 재연결합니다.

use async_trait::async_trait;
use log::{debug, info, warn};
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::mq::broker::{
    invoke_callback, BrokerInterface, HealthCheckResult, HealthStatus, MessageCallback,
};
use crate::mq::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::mq::config::{RedisPubSubConfig, MIN_BLOCK_MS};
use crate::mq::connection_pool::ConnectionPool;
use crate::mq::error::{BrokerError, BrokerResult, DriverError};
use crate::mq::message::Message;
use crate::mq::metrics::{BrokerMetrics, ConnectionEvent};
use crate::mq::pubsub_backend::{PubSubBackend, PubSubMessage, RedisPubSubBackend};

const BROKER_NAME: &str = "redis_pubsub";

/// Redis Pub/Sub 브로커
pub struct RedisPubSubBroker {
    backend: Arc<dyn PubSubBackend>,
    config: RedisPubSubConfig,
    breaker: CircuitBreaker,
    handlers: RwLock<HashMap<String, MessageCallback>>,
    last_ping: Mutex<Instant>,
    connected: AtomicBool,
    stopping: AtomicBool,
    metrics: Arc<dyn BrokerMetrics>,
}

impl RedisPubSubBroker {
    /// 주어진 드라이버로 구독 연결을 만들고 브로커 생성
    pub async fn new(
        backend: Arc<dyn PubSubBackend>,
        config: RedisPubSubConfig,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> BrokerResult<Self> {
        backend
            .connect()
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                broker: BROKER_NAME.to_string(),
                reason: e.to_string(),
            })?;
        metrics.record_connection_event(BROKER_NAME, ConnectionEvent::Connected);

        Ok(Self {
            backend,
            breaker: CircuitBreaker::new(BROKER_NAME, config.circuit_breaker.clone()),
            config,
            handlers: RwLock::new(HashMap::new()),
            last_ping: Mutex::new(Instant::now()),
            connected: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            metrics,
        })
    }

    /// Redis 서버에 연결
    pub async fn connect(
        config: RedisPubSubConfig,
        pool: Arc<ConnectionPool<MultiplexedConnection>>,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> BrokerResult<Self> {
        let backend = RedisPubSubBackend::new(&config.connection, pool).map_err(|e| {
            BrokerError::ConnectionFailed {
                broker: BROKER_NAME.to_string(),
                reason: e.to_string(),
            }
        })?;
        info!(
            "Redis Pub/Sub 브로커 연결: {}:{}",
            config.connection.host, config.connection.port
        );
        Self::new(Arc::new(backend), config, metrics).await
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// 중단 플래그 해제
    pub fn resume(&self) {
        self.stopping.store(false, Ordering::SeqCst);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
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

    fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn handler(&self, channel: &str) -> Option<MessageCallback> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    fn driver_error(&self, operation: &str, e: DriverError) -> BrokerError {
        self.metrics
            .record_error(BROKER_NAME, operation, &e.kind.to_string());
        if e.is_connection_error() {
            BrokerError::ConnectionFailed {
                broker: BROKER_NAME.to_string(),
                reason: e.to_string(),
            }
        } else {
            BrokerError::driver(BROKER_NAME, e)
        }
    }

    /// 수신 루프: deadline, 처리 개수, 중단 요청 중 먼저 도달하는 조건에서 반환.
    /// 처리 개수는 `processed`에 누적되므로 도중에 실패해도 이미 전달한 메시지는 집계됩니다.
    async fn listen(
        &self,
        deadline: Instant,
        limit: usize,
        processed: &mut usize,
    ) -> BrokerResult<()> {
        if !self.backend.is_connected().await {
            return Err(BrokerError::ConnectionFailed {
                broker: BROKER_NAME.to_string(),
                reason: "구독 연결 없음".to_string(),
            });
        }

        let ping_interval = Duration::from_millis(self.config.ping_interval_ms);

        while *processed < limit && !self.is_stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let last_ping = *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner);
            let next_ping = last_ping + ping_interval;
            if now >= next_ping {
                self.backend
                    .ping()
                    .await
                    .map_err(|e| self.driver_error("ping", e))?;
                *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
                debug!("Pub/Sub liveness ping 성공");
                continue;
            }

            let wait = deadline.min(next_ping).saturating_duration_since(now);
            let wait_ms = (wait.as_millis() as u64).max(1);

            let message = self
                .backend
                .next_message(wait_ms)
                .await
                .map_err(|e| self.driver_error("consume", e))?;

            if let Some(message) = message {
                if self.dispatch(message) {
                    *processed += 1;
                }
            }
        }

        Ok(())
    }

    /// 메시지 하나를 콜백에 전달. 콜백 오류는 로그만 남깁니다.
    fn dispatch(&self, raw: PubSubMessage) -> bool {
        let started = Instant::now();
        let handler = match self.handler(&raw.channel) {
            Some(handler) => handler,
            None => {
                debug!("구독하지 않은 채널 메시지 무시: {}", raw.channel);
                return false;
            }
        };

        let message = match Message::from_json(&raw.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("잘못된 Pub/Sub 메시지 폐기 ({}): {}", raw.channel, e);
                return false;
            }
        };

        match invoke_callback(&handler, &raw.channel, &message) {
            Ok(()) => {
                self.metrics
                    .record_consume(BROKER_NAME, &raw.channel, 1, started.elapsed());
                true
            }
            Err(e) => {
                warn!("Pub/Sub 콜백 실패 ({} {}): {}", raw.channel, message.id(), e);
                self.metrics.record_error(BROKER_NAME, "callback", "callback_failed");
                false
            }
        }
    }

    /// 백오프 후 재연결 시도
    async fn reconnect(&self, attempt: u32) {
        self.metrics
            .record_connection_event(BROKER_NAME, ConnectionEvent::Reconnecting);
        self.config.backoff.wait(attempt).await;

        match self.backend.connect().await {
            Ok(()) => {
                *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
                info!("Redis Pub/Sub 재연결 성공 (시도 {})", attempt + 1);
                self.metrics
                    .record_connection_event(BROKER_NAME, ConnectionEvent::Reconnected);
            }
            Err(e) => {
                warn!("Redis Pub/Sub 재연결 실패 (시도 {}): {}", attempt + 1, e);
                self.metrics
                    .record_connection_event(BROKER_NAME, ConnectionEvent::ReconnectFailed);
            }
        }
    }
}

#[async_trait]
impl BrokerInterface for RedisPubSubBroker {
    fn name(&self) -> &str {
        BROKER_NAME
    }

    async fn publish(&self, channel: &str, message: &Message) -> BrokerResult<()> {
        self.ensure_connected()?;
        let json = message.to_json()?;
        let started = Instant::now();

        let result = self
            .breaker
            .call(|| async {
                self.backend
                    .publish(channel, &json)
                    .await
                    .map_err(|source| BrokerError::PublishFailed {
                        broker: BROKER_NAME.to_string(),
                        channel: channel.to_string(),
                        source,
                    })
            })
            .await;

        match result {
            Ok(receivers) => {
                if receivers == 0 {
                    debug!("구독자 없는 채널에 발행: {} (메시지 유실)", channel);
                }
                self.metrics
                    .record_publish(BROKER_NAME, channel, started.elapsed(), true);
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .record_publish(BROKER_NAME, channel, started.elapsed(), false);
                self.metrics.record_error(BROKER_NAME, "publish", e.kind_name());
                Err(e)
            }
        }
    }

    async fn subscribe(&self, channel: &str, callback: MessageCallback) -> BrokerResult<()> {
        self.ensure_connected()?;
        self.backend
            .subscribe(&[channel.to_string()])
            .await
            .map_err(|e| self.driver_error("subscribe", e))?;
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string(), callback);
        info!("Pub/Sub 채널 구독: {}", channel);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> BrokerResult<()> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel);
        self.backend
            .unsubscribe(&[channel.to_string()])
            .await
            .map_err(|e| self.driver_error("unsubscribe", e))
    }

    /// 수신 루프를 `timeout_ms`와 `batch_size` 한도 안에서 실행
    ///
    /// 실패 시 재연결을 `max_retries`번까지 시도하며, 초과하면 `ConsumeFailed`를 반환합니다.
    async fn consume(&self, timeout_ms: u64, batch_size: usize) -> BrokerResult<usize> {
        self.ensure_connected()?;
        let timeout = Duration::from_millis(timeout_ms.max(MIN_BLOCK_MS));

        if self.is_stopping() {
            return Ok(0);
        }
        if !self.has_handlers() {
            tokio::time::sleep(timeout).await;
            return Ok(0);
        }

        let deadline = Instant::now() + timeout;
        let limit = batch_size.max(1);
        let mut processed = 0;
        let mut attempt: u32 = 0;

        loop {
            let result = self
                .breaker
                .call(|| self.listen(deadline, limit, &mut processed))
                .await;

            match result {
                Ok(()) => break,
                Err(e) => {
                    if self.config.backoff.is_exhausted(attempt) {
                        warn!("Pub/Sub 재시도 한도 초과 ({}회): {}", attempt, e);
                        return Err(BrokerError::ConsumeFailed {
                            broker: BROKER_NAME.to_string(),
                            channel: "*".to_string(),
                            reason: format!("재시도 {}회 후 실패: {}", attempt, e),
                        });
                    }
                    warn!("Pub/Sub 수신 실패, 재연결 시도 {}: {}", attempt + 1, e);
                    self.reconnect(attempt).await;
                    attempt += 1;
                }
            }

            if self.is_stopping() {
                break;
            }
        }

        Ok(processed)
    }

    fn stop_consuming(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.backend.is_connected().await
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_consuming();
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.metrics
            .record_connection_event(BROKER_NAME, ConnectionEvent::Disconnected);
        info!("Redis Pub/Sub 브로커 연결 해제");

        self.backend
            .disconnect()
            .await
            .map_err(|e| self.driver_error("disconnect", e))
    }

    async fn health_check(&self) -> HealthCheckResult {
        if !self.connected.load(Ordering::SeqCst) {
            return HealthCheckResult::unhealthy(BROKER_NAME, "disconnected");
        }

        let started = Instant::now();
        if let Err(e) = self.backend.ping().await {
            return HealthCheckResult::unhealthy(BROKER_NAME, &e.to_string())
                .with_detail("circuit_state", self.breaker.state().to_string());
        }

        let circuit = self.breaker.state();
        let status = if circuit == CircuitState::Closed {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        let mut channels: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        channels.sort();

        HealthCheckResult::new(BROKER_NAME, status)
            .with_latency(started.elapsed().as_secs_f64() * 1000.0)
            .with_detail("circuit_state", circuit.to_string())
            .with_detail("circuit_failures", self.breaker.failure_count())
            .with_detail("subscriptions", channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::broker::callback;
    use crate::mq::in_memory::MemoryPubSubBackend;
    use crate::mq::metrics::InMemoryMetrics;
    use crate::mq::retry::ExponentialBackoff;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn config(max_retries: u32) -> RedisPubSubConfig {
        RedisPubSubConfig {
            backoff: ExponentialBackoff::new(1, 5, max_retries),
            ..RedisPubSubConfig::default()
        }
    }

    async fn broker(backend: Arc<MemoryPubSubBackend>, max_retries: u32) -> RedisPubSubBroker {
        RedisPubSubBroker::new(backend, config(max_retries), Arc::new(InMemoryMetrics::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let broker = broker(backend.clone(), 3).await;
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();

        broker
            .subscribe("news", callback(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await
            .unwrap();
        broker.publish("news", &Message::new(json!({"n": 1}))).await.unwrap();
        broker.publish("news", &Message::new(json!({"n": 2}))).await.unwrap();

        let processed = broker.consume(50, 10).await.unwrap();

        assert_eq!(processed, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_lost() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let broker = broker(backend.clone(), 3).await;

        broker.publish("nobody", &Message::new(json!({}))).await.unwrap();
        broker
            .subscribe("nobody", callback(|_, _| Ok(())))
            .await
            .unwrap();

        assert_eq!(broker.consume(20, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_callback_error_does_not_abort_loop() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let broker = broker(backend.clone(), 3).await;

        broker
            .subscribe("news", callback(|_, message: &Message| {
                if message.payload()["n"] == 1 {
                    Err("bad".into())
                } else {
                    Ok(())
                }
            }))
            .await
            .unwrap();
        broker.publish("news", &Message::new(json!({"n": 1}))).await.unwrap();
        broker.publish("news", &Message::new(json!({"n": 2}))).await.unwrap();
        backend.inject("news", "not json");

        assert_eq!(broker.consume(50, 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_dropped_connection() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let broker = broker(backend.clone(), 3).await;
        broker.subscribe("news", callback(|_, _| Ok(()))).await.unwrap();

        backend.fail_next_receives(1);
        broker.consume(20, 10).await.unwrap();

        assert_eq!(backend.connect_calls(), 2);
        assert!(broker.is_connected().await);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_consume_failed() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let broker = broker(backend.clone(), 2).await;
        broker.subscribe("news", callback(|_, _| Ok(()))).await.unwrap();

        backend.set_down(true);
        let err = broker.consume(20, 10).await.unwrap_err();

        assert!(matches!(err, BrokerError::ConsumeFailed { .. }));
        assert_eq!(backend.connect_calls(), 1 + 2);
    }

    #[tokio::test]
    async fn test_failed_liveness_ping_reconnects_and_keeps_count() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let config = RedisPubSubConfig {
            ping_interval_ms: 20,
            ..config(3)
        };
        let broker = RedisPubSubBroker::new(
            backend.clone(),
            config,
            Arc::new(InMemoryMetrics::new()),
        )
        .await
        .unwrap();
        broker.subscribe("news", callback(|_, _| Ok(()))).await.unwrap();
        broker.publish("news", &Message::new(json!({"n": 1}))).await.unwrap();

        backend.fail_next_pings(1);
        let processed = broker.consume(100, 10).await.unwrap();

        // 실패 전에 전달된 메시지도 집계됨
        assert_eq!(processed, 1);
        assert_eq!(backend.connect_calls(), 2);
        assert!(backend.ping_calls() >= 2);
        assert!(broker.is_connected().await);

        broker.publish("news", &Message::new(json!({"n": 2}))).await.unwrap();
        assert_eq!(broker.consume(30, 10).await.unwrap(), 1);
    }
}
