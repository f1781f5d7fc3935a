//! Redis Streams Consumer
//!
//! Consumer Group 기반 소비자입니다. 한 사이클은
//! `Idle -> Polling -> Processing -> Acking -> (Idle | Reclaiming)` 순서로 진행되며,
//! 콜백이 실패한 엔트리는 ACK하지 않고 PEL에 남겨 재할당(reclaim)으로 다시 처리합니다.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::mq::broker::{invoke_callback, MessageCallback};
use crate::mq::config::{RedisStreamConfig, MIN_BLOCK_MS};
use crate::mq::error::{BrokerError, BrokerResult, DriverError};
use crate::mq::message::Message;
use crate::mq::metrics::BrokerMetrics;
use crate::mq::stream_backend::{GroupCreation, StreamBackend, StreamEntry};

const BROKER_NAME: &str = "redis_streams";

/// 컨슈머 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Polling,
    Processing,
    Acking,
    Reclaiming,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Polling => "polling",
            ConsumerState::Processing => "processing",
            ConsumerState::Acking => "acking",
            ConsumerState::Reclaiming => "reclaiming",
        };
        write!(f, "{}", name)
    }
}

/// 한 사이클의 결과
#[derive(Debug, Clone, Copy, Default)]
struct CycleOutcome {
    /// XREADGROUP으로 새로 읽은 엔트리 수
    read: usize,
    /// 콜백이 성공한 메시지 수 (재할당 포함)
    processed: usize,
}

/// 엔트리 배치 처리 결과
#[derive(Debug, Default)]
struct BatchOutcome {
    processed: usize,
    failed: usize,
    malformed: usize,
    ack_ids: Vec<String>,
}

/// Redis Streams Consumer
pub struct RedisStreamConsumer {
    backend: Arc<dyn StreamBackend>,
    group: String,
    consumer: String,
    block_ms: u64,
    non_blocking_block_ms: u64,
    batch_size: usize,
    idle_time_ms: u64,
    reclaim_interval: u64,
    handlers: RwLock<HashMap<String, MessageCallback>>,
    /// Consumer Group 생성을 마친 스트림
    provisioned: tokio::sync::Mutex<HashSet<String>>,
    state: Mutex<ConsumerState>,
    stopping: AtomicBool,
    cycles: AtomicU64,
    metrics: Arc<dyn BrokerMetrics>,
}

impl RedisStreamConsumer {
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        config: &RedisStreamConfig,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> Self {
        info!(
            "Redis Streams Consumer 초기화: group={}, consumer={}",
            config.group, config.consumer
        );

        Self {
            backend,
            group: config.group.clone(),
            consumer: config.consumer.clone(),
            block_ms: config.block_ms.max(MIN_BLOCK_MS),
            non_blocking_block_ms: config.non_blocking_block_ms.max(MIN_BLOCK_MS),
            batch_size: config.batch_size.max(1),
            idle_time_ms: config.idle_time_ms,
            reclaim_interval: config.reclaim_interval.max(1),
            handlers: RwLock::new(HashMap::new()),
            provisioned: tokio::sync::Mutex::new(HashSet::new()),
            state: Mutex::new(ConsumerState::Idle),
            stopping: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 콜백이 등록된 스트림 목록 (정렬됨)
    pub fn streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        streams.sort();
        streams
    }

    /// Consumer Group을 스트림당 한 번만 생성
    pub async fn ensure_group(&self, stream: &str) -> BrokerResult<()> {
        let mut provisioned = self.provisioned.lock().await;
        if provisioned.contains(stream) {
            return Ok(());
        }

        match self.backend.create_group(stream, &self.group).await {
            Ok(GroupCreation::Created) => {
                info!("Consumer Group 생성: {} / {}", stream, self.group);
            }
            Ok(GroupCreation::AlreadyExists) => {
                debug!("Consumer Group 이미 존재: {} / {}", stream, self.group);
            }
            Err(e) => {
                self.metrics
                    .record_error(BROKER_NAME, "create_group", &e.kind.to_string());
                return Err(self.surface(stream, e));
            }
        }

        provisioned.insert(stream.to_string());
        Ok(())
    }

    /// 스트림 콜백 등록 (재등록 시 교체)
    pub async fn subscribe(&self, stream: &str, callback: MessageCallback) -> BrokerResult<()> {
        self.ensure_group(stream).await?;
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream.to_string(), callback);
        info!("스트림 구독: {} (consumer={})", stream, self.consumer);
        Ok(())
    }

    pub fn unsubscribe(&self, stream: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream)
            .is_some();
        if removed {
            info!("스트림 구독 해제: {}", stream);
        }
        removed
    }

    pub fn clear_subscriptions(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// 협조적 중단 요청. 진행 중인 폴링은 끝까지 수행됩니다.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// 중단 플래그 해제
    pub fn resume(&self) {
        self.stopping.store(false, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// 구독 중인 모든 스트림에 대해 한 사이클 실행
    ///
    /// `timeout_ms`가 0이면 최소 BLOCK 시간으로 보정합니다.
    pub async fn consume(&self, timeout_ms: u64, batch_size: usize) -> BrokerResult<usize> {
        if self.is_stopping() {
            return Ok(0);
        }

        let streams = self.streams();
        let block_ms = timeout_ms.max(MIN_BLOCK_MS);
        if streams.is_empty() {
            tokio::time::sleep(Duration::from_millis(block_ms)).await;
            return Ok(0);
        }

        let outcome = self.run_cycle(&streams, batch_size.max(1), block_ms).await?;
        Ok(outcome.processed)
    }

    /// 여러 스트림을 반복 소비
    ///
    /// 비차단 모드는 짧은 폴링 창을 사용하며 연속 두 번 빈 폴링이면 반환합니다.
    /// 차단 모드는 `stop()`이 호출될 때까지 반복합니다.
    /// 콜백이 등록되지 않은 스트림은 읽지 않습니다.
    pub async fn consume_multiple(
        &self,
        streams: &[String],
        batch_size: usize,
        blocking: bool,
    ) -> BrokerResult<usize> {
        // 콜백 없는 스트림은 XREADGROUP 대상에서 제외
        let (streams, skipped): (Vec<String>, Vec<String>) = streams
            .iter()
            .cloned()
            .partition(|stream| self.handler(stream).is_some());
        if !skipped.is_empty() {
            warn!("콜백 없는 스트림 제외: {:?}", skipped);
        }
        if streams.is_empty() {
            return Ok(0);
        }

        for stream in &streams {
            self.ensure_group(stream).await?;
        }

        let block_ms = if blocking {
            self.block_ms
        } else {
            self.non_blocking_block_ms
        };
        let batch_size = if batch_size == 0 { self.batch_size } else { batch_size };

        let mut total = 0;
        let mut empty_polls = 0;

        while !self.is_stopping() {
            let outcome = self.run_cycle(&streams, batch_size, block_ms).await?;
            total += outcome.processed;

            if blocking {
                continue;
            }
            if outcome.read == 0 {
                empty_polls += 1;
                if empty_polls >= 2 {
                    break;
                }
            } else {
                empty_polls = 0;
            }
        }

        debug!("consume_multiple 종료: {}개 처리 (blocking={})", total, blocking);
        Ok(total)
    }

    /// 스트림별 pending 개수 (헬스체크용)
    pub async fn pending_counts(&self) -> Result<HashMap<String, u64>, DriverError> {
        let mut counts = HashMap::new();
        for stream in self.streams() {
            let count = self.backend.pending_count(&stream, &self.group).await?;
            counts.insert(stream, count);
        }
        Ok(counts)
    }

    async fn run_cycle(
        &self,
        streams: &[String],
        batch_size: usize,
        block_ms: u64,
    ) -> BrokerResult<CycleOutcome> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let mut outcome = CycleOutcome::default();

        self.set_state(ConsumerState::Polling);
        let batches = match self
            .backend
            .read_group(streams, &self.group, &self.consumer, batch_size, block_ms)
            .await
        {
            Ok(batches) => batches,
            Err(e) => {
                self.set_state(ConsumerState::Idle);
                self.metrics
                    .record_error(BROKER_NAME, "consume", &e.kind.to_string());
                return Err(self.surface(&streams.join(","), e));
            }
        };

        for (stream, entries) in batches {
            outcome.read += entries.len();

            self.set_state(ConsumerState::Processing);
            let batch = self.process_entries(&stream, &entries);

            self.set_state(ConsumerState::Acking);
            self.ack_batch(&stream, &batch.ack_ids).await?;

            if batch.failed > 0 || batch.malformed > 0 {
                debug!(
                    "{}: 처리 {}, 실패 {}, 형식 오류 {}",
                    stream, batch.processed, batch.failed, batch.malformed
                );
            }
            self.metrics
                .record_consume(BROKER_NAME, &stream, batch.processed, started.elapsed());
            outcome.processed += batch.processed;
        }

        if cycle % self.reclaim_interval == 0 {
            self.set_state(ConsumerState::Reclaiming);
            let reclaimed = self.reclaim(streams, batch_size).await;
            self.set_state(ConsumerState::Idle);
            outcome.processed += reclaimed?;
        } else {
            self.set_state(ConsumerState::Idle);
        }

        Ok(outcome)
    }

    /// 오래 idle 상태인 pending 엔트리를 가져와 다시 처리
    ///
    /// 먼저 자신이 소유한 엔트리를 XCLAIM하고, 이후 XAUTOCLAIM으로
    /// 다른 컨슈머가 방치한 엔트리를 회수합니다.
    async fn reclaim(&self, streams: &[String], batch_size: usize) -> BrokerResult<usize> {
        let mut processed = 0;

        for stream in streams {
            let own = match self
                .backend
                .pending(stream, &self.group, Some(&self.consumer), batch_size)
                .await
            {
                Ok(pending) => pending,
                Err(e) => {
                    self.reclaim_error(stream, e)?;
                    continue;
                }
            };

            let idle_ids: Vec<String> = own
                .into_iter()
                .filter(|p| p.idle_ms >= self.idle_time_ms)
                .map(|p| p.id)
                .collect();

            if !idle_ids.is_empty() {
                match self
                    .backend
                    .claim(stream, &self.group, &self.consumer, self.idle_time_ms, &idle_ids)
                    .await
                {
                    Ok(entries) => processed += self.reprocess(stream, &entries).await?,
                    Err(e) => self.reclaim_error(stream, e)?,
                }
            }

            match self
                .backend
                .auto_claim(stream, &self.group, &self.consumer, self.idle_time_ms, "0-0", batch_size)
                .await
            {
                Ok(result) => processed += self.reprocess(stream, &result.entries).await?,
                Err(e) => self.reclaim_error(stream, e)?,
            }
        }

        if processed > 0 {
            info!("재할당 처리 완료: {}개 메시지", processed);
        }
        Ok(processed)
    }

    async fn reprocess(&self, stream: &str, entries: &[StreamEntry]) -> BrokerResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let batch = self.process_entries(stream, entries);
        self.ack_batch(stream, &batch.ack_ids).await?;
        Ok(batch.processed)
    }

    /// 엔트리별 실패 경계 안에서 콜백 실행
    ///
    /// 형식 오류 엔트리는 콜백 유무와 관계없이 ACK 대상입니다.
    /// 성공한 엔트리의 ID도 ACK 대상에 포함되고, 콜백 실패나 콜백 없는 엔트리는 pending으로 남습니다.
    fn process_entries(&self, stream: &str, entries: &[StreamEntry]) -> BatchOutcome {
        let mut batch = BatchOutcome::default();
        let mut decoded = Vec::with_capacity(entries.len());

        for entry in entries {
            match entry.payload().map(Message::from_json) {
                Some(Ok(message)) => decoded.push((entry, message)),
                Some(Err(e)) => {
                    warn!("잘못된 메시지 폐기 ({} {}): {}", stream, entry.id, e);
                    batch.malformed += 1;
                    batch.ack_ids.push(entry.id.clone());
                }
                None => {
                    warn!("payload 필드 없는 엔트리 폐기: {} {}", stream, entry.id);
                    batch.malformed += 1;
                    batch.ack_ids.push(entry.id.clone());
                }
            }
        }

        if decoded.is_empty() {
            return batch;
        }

        let handler = match self.handler(stream) {
            Some(handler) => handler,
            None => {
                warn!("콜백 없는 스트림 엔트리 {}개 보류: {}", decoded.len(), stream);
                batch.failed = decoded.len();
                return batch;
            }
        };

        for (entry, message) in decoded {
            match invoke_callback(&handler, stream, &message) {
                Ok(()) => {
                    batch.processed += 1;
                    batch.ack_ids.push(entry.id.clone());
                }
                Err(e) => {
                    warn!("콜백 실패, pending 유지 ({} {}): {}", stream, entry.id, e);
                    batch.failed += 1;
                }
            }
        }

        batch
    }

    fn handler(&self, stream: &str) -> Option<MessageCallback> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream)
            .cloned()
    }

    /// 스트림당 XACK 한 번
    async fn ack_batch(&self, stream: &str, ids: &[String]) -> BrokerResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        match self.backend.ack(stream, &self.group, ids).await {
            Ok(acked) => {
                if acked < ids.len() {
                    debug!("XACK 일부만 반영: {} ({}/{})", stream, acked, ids.len());
                }
                Ok(())
            }
            Err(e) if e.is_connection_error() => {
                self.metrics.record_error(BROKER_NAME, "ack", &e.kind.to_string());
                Err(self.surface(stream, e))
            }
            Err(e) => {
                // ACK 실패 엔트리는 pending으로 남아 재할당됨
                warn!("XACK 실패 ({}): {}", stream, e);
                self.metrics.record_error(BROKER_NAME, "ack", &e.kind.to_string());
                Ok(())
            }
        }
    }

    fn reclaim_error(&self, stream: &str, e: DriverError) -> BrokerResult<()> {
        self.metrics
            .record_error(BROKER_NAME, "reclaim", &e.kind.to_string());
        if e.is_connection_error() {
            return Err(self.surface(stream, e));
        }
        warn!("재할당 실패 ({}): {}", stream, e);
        Ok(())
    }

    /// 연결 계열 오류는 `ConnectionFailed`, 나머지는 `Driver`로 변환
    fn surface(&self, channel: &str, e: DriverError) -> BrokerError {
        if e.is_connection_error() {
            warn!("Redis 연결 오류 ({}): {}", channel, e);
            BrokerError::ConnectionFailed {
                broker: BROKER_NAME.to_string(),
                reason: e.to_string(),
            }
        } else {
            BrokerError::driver(BROKER_NAME, e)
        }
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::broker::callback;
    use crate::mq::in_memory::MemoryStreamBackend;
    use crate::mq::metrics::NoopMetrics;
    use crate::mq::stream_backend::PAYLOAD_FIELD;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn config() -> RedisStreamConfig {
        RedisStreamConfig {
            group: "test-group".to_string(),
            consumer: "worker-1".to_string(),
            idle_time_ms: 50,
            reclaim_interval: 1,
            ..RedisStreamConfig::default()
        }
    }

    fn consumer(backend: Arc<MemoryStreamBackend>, config: &RedisStreamConfig) -> RedisStreamConsumer {
        RedisStreamConsumer::new(backend, config, Arc::new(NoopMetrics))
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> MessageCallback {
        callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_group_provisioned_once() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend.clone(), &config());
        let counter = Arc::new(AtomicUsize::new(0));

        consumer.subscribe("orders", counting_callback(counter.clone())).await.unwrap();
        consumer.subscribe("orders", counting_callback(counter)).await.unwrap();
        for _ in 0..3 {
            consumer.consume(10, 10).await.unwrap();
        }

        assert_eq!(backend.group_create_calls(), 1);
        assert_eq!(consumer.state(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn test_batch_acked_in_one_call() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend.clone(), &RedisStreamConfig {
            reclaim_interval: 100,
            ..config()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        consumer.subscribe("orders", counting_callback(counter.clone())).await.unwrap();

        for n in 0..5 {
            let json = Message::new(json!({ "n": n })).to_json().unwrap();
            backend.add_raw_entry("orders", &[(PAYLOAD_FIELD, json.as_str())]);
        }

        let processed = consumer.consume(10, 10).await.unwrap();

        assert_eq!(processed, 5);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(backend.ack_calls(), 1);
        assert_eq!(backend.pending_len("orders", "test-group"), 0);
    }

    #[tokio::test]
    async fn test_malformed_entries_acked_and_skipped() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend.clone(), &config());
        let counter = Arc::new(AtomicUsize::new(0));
        consumer.subscribe("orders", counting_callback(counter.clone())).await.unwrap();

        backend.add_raw_entry("orders", &[("other", "x")]);
        backend.add_raw_entry("orders", &[(PAYLOAD_FIELD, "not json")]);

        let processed = consumer.consume(10, 10).await.unwrap();

        assert_eq!(processed, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(backend.pending_len("orders", "test-group"), 0);
    }

    #[tokio::test]
    async fn test_connection_error_surfaces() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend.clone(), &config());
        consumer
            .subscribe("orders", counting_callback(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();

        backend.fail_next_reads(1);
        let err = consumer.consume(10, 10).await.unwrap_err();

        assert!(matches!(err, BrokerError::ConnectionFailed { .. }));
        assert_eq!(consumer.state(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn test_non_blocking_returns_after_two_empty_polls() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend.clone(), &RedisStreamConfig {
            non_blocking_block_ms: 20,
            ..config()
        });
        consumer
            .subscribe("orders", counting_callback(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();

        let started = Instant::now();
        let processed = consumer
            .consume_multiple(&["orders".to_string()], 10, false)
            .await
            .unwrap();

        assert_eq!(processed, 0);
        assert_eq!(backend.read_calls(), 2);
        assert!(started.elapsed() < Duration::from_millis(40 + 200));
    }

    #[tokio::test]
    async fn test_consume_multiple_skips_streams_without_callback() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend.clone(), &RedisStreamConfig {
            non_blocking_block_ms: 10,
            ..config()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        consumer.subscribe("orders", counting_callback(counter.clone())).await.unwrap();

        let json = Message::new(json!({"n": 1})).to_json().unwrap();
        backend.add_raw_entry("audit", &[("other", "x")]);
        backend.add_raw_entry("audit", &[(PAYLOAD_FIELD, json.as_str())]);
        backend.add_raw_entry("orders", &[(PAYLOAD_FIELD, json.as_str())]);

        let processed = consumer
            .consume_multiple(&["orders".to_string(), "audit".to_string()], 10, false)
            .await
            .unwrap();

        assert_eq!(processed, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(backend.pending_len("audit", "test-group"), 0);
        assert_eq!(backend.pending_len("orders", "test-group"), 0);
        assert_eq!(backend.len("audit"), 2);
    }

    #[tokio::test]
    async fn test_consume_multiple_with_only_unsubscribed_streams() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend.clone(), &config());

        let processed = consumer
            .consume_multiple(&["audit".to_string()], 10, true)
            .await
            .unwrap();

        assert_eq!(processed, 0);
        assert_eq!(backend.read_calls(), 0);
    }

    #[test]
    fn test_malformed_entries_acked_without_handler() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend, &config());
        let json = Message::new(json!({"n": 1})).to_json().unwrap();
        let entries = vec![
            StreamEntry {
                id: "1-0".to_string(),
                fields: HashMap::from([("other".to_string(), "x".to_string())]),
            },
            StreamEntry {
                id: "2-0".to_string(),
                fields: HashMap::from([(PAYLOAD_FIELD.to_string(), "not json".to_string())]),
            },
            StreamEntry {
                id: "3-0".to_string(),
                fields: HashMap::from([(PAYLOAD_FIELD.to_string(), json)]),
            },
        ];

        let batch = consumer.process_entries("audit", &entries);

        assert_eq!(batch.malformed, 2);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.processed, 0);
        assert_eq!(batch.ack_ids, vec!["1-0".to_string(), "2-0".to_string()]);
    }

    #[tokio::test]
    async fn test_reclaim_runs_only_every_nth_cycle() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend.clone(), &RedisStreamConfig {
            idle_time_ms: 0,
            reclaim_interval: 3,
            ..config()
        });
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        consumer
            .subscribe("orders", callback(move |_, _| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("first delivery fails".into())
                } else {
                    Ok(())
                }
            }))
            .await
            .unwrap();

        let json = Message::new(json!({"n": 1})).to_json().unwrap();
        backend.add_raw_entry("orders", &[(PAYLOAD_FIELD, json.as_str())]);

        // 1, 2번째 사이클: 회수 없음
        assert_eq!(consumer.consume(10, 10).await.unwrap(), 0);
        assert_eq!(consumer.consume(10, 10).await.unwrap(), 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.pending_len("orders", "test-group"), 1);

        // 3번째 사이클: 회수 후 재처리
        assert_eq!(consumer.consume(10, 10).await.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(backend.pending_len("orders", "test-group"), 0);
    }

    #[tokio::test]
    async fn test_stop_prevents_new_cycles() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let consumer = consumer(backend.clone(), &config());
        consumer
            .subscribe("orders", counting_callback(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();

        consumer.stop();
        let processed = consumer
            .consume_multiple(&["orders".to_string()], 10, true)
            .await
            .unwrap();

        assert_eq!(processed, 0);
        assert_eq!(backend.read_calls(), 0);

        consumer.resume();
        assert!(!consumer.is_stopping());
    }
}
