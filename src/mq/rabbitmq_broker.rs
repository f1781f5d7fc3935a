//! RabbitMQ 브로커
//!
//! Topic exchange에 발행하고, 구독 채널마다 큐 바인딩을 추가해 소비합니다.
//! 채널 이름의 `:`은 라우팅 키에서 `.`으로 바뀝니다 (`orders:created` -> `orders.created`).
//!
//! 소비 중 연결이 끊기면 지수 백오프로 재연결한 뒤 exchange, 큐, 바인딩, 컨슈머를
//! 모두 다시 만들기 때문에 호출자가 다시 구독할 필요가 없습니다.

use async_trait::async_trait;
use lapin::Connection;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::mq::amqp_transport::{
    topic_matches, AmqpDelivery, AmqpProperties, AmqpTransport, ChannelId, LapinTransport,
};
use crate::mq::broker::{
    invoke_callback, BrokerInterface, HealthCheckResult, HealthStatus, MessageCallback,
};
use crate::mq::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::mq::config::{hostname, RabbitMqConfig, MIN_BLOCK_MS};
use crate::mq::connection_pool::ConnectionPool;
use crate::mq::error::{BrokerError, BrokerResult, DriverError};
use crate::mq::message::Message;
use crate::mq::metrics::{BrokerMetrics, ConnectionEvent};

const BROKER_NAME: &str = "rabbitmq";

/// 채널 이름을 AMQP 라우팅 키로 변환
pub fn channel_to_routing_key(channel: &str) -> String {
    channel.replace(':', ".")
}

/// 패턴 구체성: (리터럴 단어 수, `*` 단어 수)
fn pattern_specificity(pattern: &str) -> (usize, usize) {
    pattern.split('.').fold((0, 0), |(literal, star), word| match word {
        "#" => (literal, star),
        "*" => (literal, star + 1),
        _ => (literal + 1, star),
    })
}

/// 라운드 로빈 채널 풀
///
/// 닫힌 슬롯은 다음 사용 시점에 새 채널로 교체됩니다.
struct ChannelPool {
    slots: Vec<Option<ChannelId>>,
    next: usize,
}

impl ChannelPool {
    fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size.max(1)],
            next: 0,
        }
    }

    /// 모든 슬롯을 비우고 비우기 전의 채널 반환
    fn reset(&mut self) -> Vec<ChannelId> {
        self.next = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    fn open_channels(&self) -> Vec<ChannelId> {
        self.slots.iter().flatten().copied().collect()
    }
}

/// 연결별로 다시 만들어야 하는 토폴로지 상태
#[derive(Default)]
struct Topology {
    exchange_declared: bool,
    queue: Option<String>,
    consumer_channel: Option<ChannelId>,
}

/// 구독 정보: 라우팅 키 -> 채널, 채널 -> 콜백
#[derive(Default)]
struct Subscriptions {
    routes: BTreeMap<String, String>,
    handlers: HashMap<String, MessageCallback>,
}

/// RabbitMQ 브로커
pub struct RabbitMqBroker {
    transport: Arc<dyn AmqpTransport>,
    config: RabbitMqConfig,
    breaker: CircuitBreaker,
    channels: Mutex<ChannelPool>,
    topology: Mutex<Topology>,
    subscriptions: RwLock<Subscriptions>,
    /// non-exclusive 모드에서 사용할 큐 이름 (인스턴스당 한 번 결정)
    durable_queue_name: String,
    consumer_tag: String,
    last_liveness_check: std::sync::Mutex<Instant>,
    connected: AtomicBool,
    stopping: AtomicBool,
    metrics: Arc<dyn BrokerMetrics>,
}

impl RabbitMqBroker {
    /// 주어진 트랜스포트로 연결 후 브로커 생성
    pub async fn new(
        transport: Arc<dyn AmqpTransport>,
        config: RabbitMqConfig,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> BrokerResult<Self> {
        transport
            .connect()
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                broker: BROKER_NAME.to_string(),
                reason: e.to_string(),
            })?;
        metrics.record_connection_event(BROKER_NAME, ConnectionEvent::Connected);

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let host = hostname();
        let durable_queue_name = config
            .queue
            .clone()
            .unwrap_or_else(|| format!("{}.{}.{}", config.exchange, host, &suffix[..8]));

        info!(
            "RabbitMQ 브로커 초기화: {}:{} (exchange={}, type={})",
            config.host, config.port, config.exchange, config.exchange_type
        );

        Ok(Self {
            transport,
            breaker: CircuitBreaker::new(BROKER_NAME, config.circuit_breaker.clone()),
            channels: Mutex::new(ChannelPool::new(config.max_channels)),
            topology: Mutex::new(Topology::default()),
            subscriptions: RwLock::new(Subscriptions::default()),
            durable_queue_name,
            consumer_tag: format!("{}-{}", host, &suffix[..8]),
            last_liveness_check: std::sync::Mutex::new(Instant::now()),
            connected: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            config,
            metrics,
        })
    }

    /// RabbitMQ 서버에 연결
    pub async fn connect(
        config: RabbitMqConfig,
        pool: Arc<ConnectionPool<Arc<Connection>>>,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> BrokerResult<Self> {
        let transport = LapinTransport::new(&config, pool);
        Self::new(Arc::new(transport), config, metrics).await
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// 현재 바인딩된 큐 이름
    pub async fn queue_name(&self) -> Option<String> {
        self.topology.lock().await.queue.clone()
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

    fn read_subscriptions(&self) -> std::sync::RwLockReadGuard<'_, Subscriptions> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_subscriptions(&self) -> std::sync::RwLockWriteGuard<'_, Subscriptions> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 라운드 로빈으로 채널 선택. 닫힌 슬롯은 새 채널로 교체합니다.
    async fn acquire_channel(&self) -> Result<ChannelId, DriverError> {
        let mut pool = self.channels.lock().await;
        let index = pool.next % pool.slots.len();
        pool.next = pool.next.wrapping_add(1);

        if let Some(id) = pool.slots[index] {
            if self.transport.is_channel_open(id).await {
                return Ok(id);
            }
            debug!("닫힌 채널 슬롯 {} 재생성", index);
            self.release_channels(&[id]).await;
        }

        let id = self.transport.open_channel(self.config.prefetch_count).await?;
        pool.slots[index] = Some(id);
        Ok(id)
    }

    /// 연결당 한 번 exchange 선언
    async fn ensure_exchange(&self, topology: &mut Topology, channel: ChannelId) -> Result<(), DriverError> {
        if topology.exchange_declared {
            return Ok(());
        }
        self.transport
            .declare_exchange(channel, &self.config.exchange, &self.config.exchange_type)
            .await?;
        topology.exchange_declared = true;
        debug!(
            "Exchange 선언: {} ({})",
            self.config.exchange, self.config.exchange_type
        );
        Ok(())
    }

    /// exchange와 큐를 준비하고 큐 이름 반환
    async fn ensure_queue(&self, topology: &mut Topology) -> Result<String, DriverError> {
        let channel = self.acquire_channel().await?;
        self.ensure_exchange(topology, channel).await?;

        if let Some(queue) = topology.queue.as_ref() {
            return Ok(queue.clone());
        }

        let requested = if self.config.exclusive {
            ""
        } else {
            self.durable_queue_name.as_str()
        };
        let queue = self
            .transport
            .declare_queue(channel, requested, self.config.exclusive)
            .await?;
        info!("큐 선언: {} (exclusive={})", queue, self.config.exclusive);
        topology.queue = Some(queue.clone());
        Ok(queue)
    }

    /// 네이티브 컨슈머를 한 번만 등록하고 그 채널을 반환
    async fn ensure_consumer(&self) -> Result<ChannelId, DriverError> {
        let mut topology = self.topology.lock().await;
        if let Some(channel) = topology.consumer_channel.take() {
            if self.transport.is_channel_open(channel).await {
                topology.consumer_channel = Some(channel);
                return Ok(channel);
            }
            self.release_channels(&[channel]).await;
        }

        let queue = self.ensure_queue(&mut topology).await?;
        let channel = self.transport.open_channel(self.config.prefetch_count).await?;
        self.transport
            .start_consumer(channel, &queue, &self.consumer_tag)
            .await?;
        topology.consumer_channel = Some(channel);
        Ok(channel)
    }

    /// 트랜스포트에 남은 채널을 닫음 (실패는 로그만)
    async fn release_channels(&self, channels: &[ChannelId]) {
        for &channel in channels {
            if let Err(e) = self.transport.release_channel(channel).await {
                debug!("채널 {} 해제 실패: {}", channel, e);
            }
        }
    }

    /// 연결 확인 후 채널 재생성, 모든 바인딩 복구, 컨슈머 재등록
    ///
    /// 새 연결일 때만 exchange와 큐를 다시 선언합니다. 연결이 살아 있으면 기존 큐를 유지합니다.
    async fn rebuild(&self) -> Result<(), DriverError> {
        let reconnected = self.transport.connect().await?;
        let mut stale = self.channels.lock().await.reset();

        let mut topology = self.topology.lock().await;
        stale.extend(topology.consumer_channel.take());
        self.release_channels(&stale).await;

        if reconnected {
            // exclusive 큐는 이전 연결과 함께 삭제됨
            topology.exchange_declared = false;
            topology.queue = None;
        }

        let queue = self.ensure_queue(&mut topology).await?;
        let routing_keys: Vec<String> = self.read_subscriptions().routes.keys().cloned().collect();
        let channel = self.acquire_channel().await?;
        for routing_key in &routing_keys {
            self.transport
                .bind_queue(channel, &queue, &self.config.exchange, routing_key)
                .await?;
        }
        drop(topology);

        self.ensure_consumer().await?;
        info!(
            "RabbitMQ 토폴로지 복구 완료: {}개 바인딩 (새 연결={})",
            routing_keys.len(),
            reconnected
        );
        Ok(())
    }

    /// 재연결 시도. 한도를 넘으면 `ConsumeFailed`.
    async fn recover(&self, cause: &DriverError) -> BrokerResult<()> {
        let mut attempt: u32 = 0;
        let mut last_error = cause.to_string();

        loop {
            if self.config.backoff.is_exhausted(attempt) {
                warn!("RabbitMQ 재연결 한도 초과 ({}회): {}", attempt, last_error);
                return Err(BrokerError::ConsumeFailed {
                    broker: BROKER_NAME.to_string(),
                    channel: self.config.exchange.clone(),
                    reason: format!("재연결 {}회 실패: {}", attempt, last_error),
                });
            }

            self.metrics
                .record_connection_event(BROKER_NAME, ConnectionEvent::Reconnecting);
            self.config.backoff.wait(attempt).await;

            match self.rebuild().await {
                Ok(()) => {
                    info!("RabbitMQ 재연결 성공 (시도 {})", attempt + 1);
                    self.metrics
                        .record_connection_event(BROKER_NAME, ConnectionEvent::Reconnected);
                    *self
                        .last_liveness_check
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Instant::now();
                    return Ok(());
                }
                Err(e) => {
                    warn!("RabbitMQ 재연결 실패 (시도 {}): {}", attempt + 1, e);
                    self.metrics
                        .record_connection_event(BROKER_NAME, ConnectionEvent::ReconnectFailed);
                    last_error = e.to_string();
                    attempt += 1;
                }
            }
        }
    }

    /// 주기적 상태 확인: 연결과 최소 하나의 열린 채널
    fn liveness_check_due(&self) -> bool {
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        let mut last_check = self
            .last_liveness_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last_check.elapsed() < interval {
            return false;
        }
        *last_check = Instant::now();
        true
    }

    async fn check_liveness(&self) -> bool {
        if !self.transport.is_connected().await {
            return false;
        }
        let mut open = self.channels.lock().await.open_channels();
        if let Some(consumer) = self.topology.lock().await.consumer_channel {
            open.push(consumer);
        }
        for channel in open {
            if self.transport.is_channel_open(channel).await {
                return true;
            }
        }
        false
    }

    /// 라우팅 키로 구독 채널과 콜백 조회
    ///
    /// 정확히 일치하는 키가 우선이고, 그다음은 가장 구체적인 패턴입니다
    /// (리터럴 단어가 많을수록, 그다음 `*`가 많을수록). 동률이면 사전순으로 앞선 패턴.
    fn route(&self, routing_key: &str) -> Option<(String, MessageCallback)> {
        let subscriptions = self.read_subscriptions();
        let channel = subscriptions.routes.get(routing_key).cloned().or_else(|| {
            subscriptions
                .routes
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, routing_key))
                .min_by_key(|(pattern, _)| std::cmp::Reverse(pattern_specificity(pattern)))
                .map(|(_, channel)| channel.clone())
        })?;
        let handler = subscriptions.handlers.get(&channel)?.clone();
        Some((channel, handler))
    }

    /// 메시지 하나 처리: 성공 시 ack, 콜백 실패 시 nack+requeue, 형식 오류/미등록 키는 ack 후 폐기
    async fn handle_delivery(&self, channel: ChannelId, delivery: AmqpDelivery) -> bool {
        let started = Instant::now();
        let tag = delivery.delivery_tag;

        let (subscribed, handler) = match self.route(&delivery.routing_key) {
            Some(route) => route,
            None => {
                warn!("등록되지 않은 라우팅 키 메시지 폐기: {}", delivery.routing_key);
                self.ack(channel, tag).await;
                return false;
            }
        };

        let message = match Message::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!("잘못된 메시지 폐기 ({}): {}", delivery.routing_key, e);
                self.ack(channel, tag).await;
                return false;
            }
        };

        match invoke_callback(&handler, &subscribed, &message) {
            Ok(()) => {
                self.ack(channel, tag).await;
                self.metrics
                    .record_consume(BROKER_NAME, &subscribed, 1, started.elapsed());
                true
            }
            Err(e) => {
                warn!("콜백 실패, 재적재 ({} {}): {}", subscribed, message.id(), e);
                self.metrics.record_error(BROKER_NAME, "callback", "callback_failed");
                if let Err(e) = self.transport.nack(channel, tag, true).await {
                    warn!("nack 실패: {}", e);
                    self.metrics.record_error(BROKER_NAME, "nack", &e.kind.to_string());
                }
                false
            }
        }
    }

    async fn ack(&self, channel: ChannelId, tag: u64) {
        if let Err(e) = self.transport.ack(channel, tag).await {
            warn!("ack 실패 (tag={}): {}", tag, e);
            self.metrics.record_error(BROKER_NAME, "ack", &e.kind.to_string());
        }
    }

    async fn publish_raw(&self, routing_key: &str, body: &[u8]) -> Result<(), DriverError> {
        let channel = self.acquire_channel().await?;
        {
            let mut topology = self.topology.lock().await;
            self.ensure_exchange(&mut topology, channel).await?;
        }
        let properties = AmqpProperties::json(self.config.persistent);
        self.transport
            .publish(channel, &self.config.exchange, routing_key, body, &properties)
            .await
    }
}

#[async_trait]
impl BrokerInterface for RabbitMqBroker {
    fn name(&self) -> &str {
        BROKER_NAME
    }

    async fn publish(&self, channel: &str, message: &Message) -> BrokerResult<()> {
        self.ensure_connected()?;
        let routing_key = channel_to_routing_key(channel);
        let body = message.to_json()?.into_bytes();
        let started = Instant::now();

        let result = self
            .breaker
            .call(|| async {
                self.publish_raw(&routing_key, &body)
                    .await
                    .map_err(|source| BrokerError::PublishFailed {
                        broker: BROKER_NAME.to_string(),
                        channel: channel.to_string(),
                        source,
                    })
            })
            .await;

        let success = result.is_ok();
        self.metrics
            .record_publish(BROKER_NAME, channel, started.elapsed(), success);
        if let Err(e) = &result {
            self.metrics.record_error(BROKER_NAME, "publish", e.kind_name());
        }
        result
    }

    async fn subscribe(&self, channel: &str, callback: MessageCallback) -> BrokerResult<()> {
        self.ensure_connected()?;
        let routing_key = channel_to_routing_key(channel);

        {
            let mut topology = self.topology.lock().await;
            let queue = self
                .ensure_queue(&mut topology)
                .await
                .map_err(|e| self.driver_error("subscribe", e))?;
            let amqp_channel = self
                .acquire_channel()
                .await
                .map_err(|e| self.driver_error("subscribe", e))?;
            self.transport
                .bind_queue(amqp_channel, &queue, &self.config.exchange, &routing_key)
                .await
                .map_err(|e| self.driver_error("subscribe", e))?;
        }

        let mut subscriptions = self.write_subscriptions();
        subscriptions.routes.insert(routing_key.clone(), channel.to_string());
        subscriptions.handlers.insert(channel.to_string(), callback);
        info!("RabbitMQ 구독: {} (routing_key={})", channel, routing_key);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> BrokerResult<()> {
        let routing_key = channel_to_routing_key(channel);
        {
            let mut subscriptions = self.write_subscriptions();
            subscriptions.routes.remove(&routing_key);
            subscriptions.handlers.remove(channel);
        }

        let queue = self.topology.lock().await.queue.clone();
        if let Some(queue) = queue {
            let amqp_channel = self
                .acquire_channel()
                .await
                .map_err(|e| self.driver_error("unsubscribe", e))?;
            self.transport
                .unbind_queue(amqp_channel, &queue, &self.config.exchange, &routing_key)
                .await
                .map_err(|e| self.driver_error("unsubscribe", e))?;
        }
        info!("RabbitMQ 구독 해제: {}", channel);
        Ok(())
    }

    /// `batch_size`개를 처리하거나 `timeout_ms`가 지나면 반환
    async fn consume(&self, timeout_ms: u64, batch_size: usize) -> BrokerResult<usize> {
        self.ensure_connected()?;
        let timeout = Duration::from_millis(timeout_ms.max(MIN_BLOCK_MS));

        if self.is_stopping() {
            return Ok(0);
        }
        if self.read_subscriptions().handlers.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(0);
        }

        let deadline = Instant::now() + timeout;
        let limit = batch_size.max(1);
        let mut processed = 0;

        while processed < limit && !self.is_stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            if self.liveness_check_due() && !self.check_liveness().await {
                warn!("RabbitMQ 상태 확인 실패, 재연결");
                self.recover(&DriverError::connection_lost("health check failed"))
                    .await?;
            }

            let channel = match self.ensure_consumer().await {
                Ok(channel) => channel,
                Err(e) => {
                    self.metrics
                        .record_error(BROKER_NAME, "consume", &e.kind.to_string());
                    self.recover(&e).await?;
                    continue;
                }
            };

            let slice = deadline
                .saturating_duration_since(now)
                .min(Duration::from_millis(self.config.wait_slice_ms));
            let wait_ms = (slice.as_millis() as u64).max(1);

            match self.transport.next_delivery(channel, wait_ms).await {
                Ok(None) => {}
                Ok(Some(delivery)) => {
                    if self.handle_delivery(channel, delivery).await {
                        processed += 1;
                    }
                }
                Err(e) => {
                    warn!("RabbitMQ 수신 실패: {}", e);
                    self.metrics
                        .record_error(BROKER_NAME, "consume", &e.kind.to_string());
                    self.recover(&e).await?;
                }
            }
        }

        Ok(processed)
    }

    fn stop_consuming(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.transport.is_connected().await
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_consuming();
        {
            let mut subscriptions = self.write_subscriptions();
            subscriptions.routes.clear();
            subscriptions.handlers.clear();
        }
        self.channels.lock().await.reset();
        *self.topology.lock().await = Topology::default();

        self.metrics
            .record_connection_event(BROKER_NAME, ConnectionEvent::Disconnected);
        info!("RabbitMQ 브로커 연결 해제");

        self.transport
            .close()
            .await
            .map_err(|e| self.driver_error("disconnect", e))
    }

    async fn health_check(&self) -> HealthCheckResult {
        if !self.connected.load(Ordering::SeqCst) {
            return HealthCheckResult::unhealthy(BROKER_NAME, "disconnected");
        }

        let started = Instant::now();
        if !self.transport.is_connected().await {
            return HealthCheckResult::unhealthy(BROKER_NAME, "AMQP 연결 끊김")
                .with_detail("circuit_state", self.breaker.state().to_string());
        }

        let pooled = self.channels.lock().await.open_channels();
        let mut open_channels = 0;
        for channel in pooled {
            if self.transport.is_channel_open(channel).await {
                open_channels += 1;
            }
        }

        let circuit = self.breaker.state();
        let status = if circuit == CircuitState::Closed {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        let queue = self.topology.lock().await.queue.clone();

        HealthCheckResult::new(BROKER_NAME, status)
            .with_latency(started.elapsed().as_secs_f64() * 1000.0)
            .with_detail("open_channels", open_channels)
            .with_detail("max_channels", self.config.max_channels)
            .with_detail("circuit_state", circuit.to_string())
            .with_detail("queue", queue)
            .with_detail("subscriptions", self.read_subscriptions().handlers.len())
    }
}
