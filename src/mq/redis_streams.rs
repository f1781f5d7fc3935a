//! Redis Streams Producer
//!
//! 메시지를 `payload` 필드 하나로 직렬화해 XADD 합니다.
//! 배치 발행은 청크 단위 파이프라인으로 왕복 횟수를 줄입니다.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::mq::error::{BrokerError, BrokerResult};
use crate::mq::message::Message;
use crate::mq::metrics::BrokerMetrics;
use crate::mq::stream_backend::StreamBackend;

const BROKER_NAME: &str = "redis_streams";

/// 배치 발행 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchPublishResult {
    /// 성공한 메시지의 스트림 ID (입력 순서)
    pub message_ids: Vec<String>,
    pub queued: usize,
    pub failed: usize,
    pub chunks: usize,
    pub elapsed_ms: f64,
    pub throughput_per_sec: f64,
}

/// Redis Streams Producer
pub struct RedisStreamProducer {
    backend: Arc<dyn StreamBackend>,
    max_len: usize,
    chunk_size: usize,
    metrics: Arc<dyn BrokerMetrics>,
}

impl RedisStreamProducer {
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        max_len: usize,
        chunk_size: usize,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> Self {
        Self {
            backend,
            max_len,
            chunk_size: chunk_size.max(1),
            metrics,
        }
    }

    /// 기본 청크 크기
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 메시지 하나를 스트림에 발행하고 엔트리 ID를 반환
    pub async fn publish(&self, stream: &str, message: &Message) -> BrokerResult<String> {
        let json = message.to_json()?;
        let started = Instant::now();

        match self.backend.append(stream, &json, self.max_len).await {
            Ok(id) => {
                self.metrics
                    .record_publish(BROKER_NAME, stream, started.elapsed(), true);
                debug!("스트림 발행 완료: {} -> {} ({})", message.id(), stream, id);
                Ok(id)
            }
            Err(e) => {
                self.metrics
                    .record_publish(BROKER_NAME, stream, started.elapsed(), false);
                self.metrics
                    .record_error(BROKER_NAME, "publish", &e.kind.to_string());
                Err(BrokerError::PublishFailed {
                    broker: BROKER_NAME.to_string(),
                    channel: stream.to_string(),
                    source: e,
                })
            }
        }
    }

    /// 여러 메시지를 청크 단위 파이프라인으로 발행
    ///
    /// 실패한 청크의 메시지는 모두 실패로 집계하고 다음 청크를 계속 진행합니다.
    pub async fn publish_batch(
        &self,
        stream: &str,
        messages: &[Message],
        chunk_size: Option<usize>,
    ) -> BrokerResult<BatchPublishResult> {
        let chunk_size = chunk_size.unwrap_or(self.chunk_size).max(1);
        let started = Instant::now();
        let mut result = BatchPublishResult::default();

        for chunk in messages.chunks(chunk_size) {
            result.chunks += 1;

            let payloads = chunk
                .iter()
                .map(Message::to_json)
                .collect::<Result<Vec<_>, _>>()?;

            let chunk_started = Instant::now();
            match self.backend.append_batch(stream, &payloads, self.max_len).await {
                Ok(ids) => {
                    result.queued += ids.len();
                    result.message_ids.extend(ids);
                    self.metrics
                        .record_publish(BROKER_NAME, stream, chunk_started.elapsed(), true);
                }
                Err(e) => {
                    warn!(
                        "청크 발행 실패 ({}개 메시지, {}): {}",
                        chunk.len(),
                        stream,
                        e
                    );
                    result.failed += chunk.len();
                    self.metrics
                        .record_publish(BROKER_NAME, stream, chunk_started.elapsed(), false);
                    self.metrics
                        .record_error(BROKER_NAME, "publish_batch", &e.kind.to_string());
                }
            }
        }

        let elapsed = started.elapsed();
        result.elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        result.throughput_per_sec = throughput(result.queued, elapsed);

        info!(
            "배치 발행 완료: {} (성공 {}, 실패 {}, 청크 {}, {:.1}ms)",
            stream, result.queued, result.failed, result.chunks, result.elapsed_ms
        );
        Ok(result)
    }
}

fn throughput(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::in_memory::MemoryStreamBackend;
    use crate::mq::metrics::InMemoryMetrics;
    use serde_json::json;

    fn producer(backend: Arc<MemoryStreamBackend>, metrics: Arc<InMemoryMetrics>) -> RedisStreamProducer {
        RedisStreamProducer::new(backend, 10_000, 500, metrics)
    }

    #[tokio::test]
    async fn test_publish_single() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let producer = producer(backend.clone(), metrics.clone());

        let id = producer
            .publish("orders", &Message::new(json!({"n": 1})))
            .await
            .unwrap();

        assert!(id.contains('-'));
        assert_eq!(backend.len("orders"), 1);
        assert_eq!(metrics.get_counter("redis_streams.publish.orders"), Some(1));
    }

    #[tokio::test]
    async fn test_publish_batch_chunks_into_round_trips() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let producer = producer(backend.clone(), Arc::new(InMemoryMetrics::new()));
        let messages: Vec<Message> = (0..7).map(|n| Message::new(json!({ "n": n }))).collect();

        let result = producer.publish_batch("orders", &messages, Some(3)).await.unwrap();

        assert_eq!(result.chunks, 3);
        assert_eq!(result.queued, 7);
        assert_eq!(result.failed, 0);
        assert_eq!(result.message_ids.len(), 7);
        assert_eq!(backend.append_round_trips(), 3);
    }

    #[tokio::test]
    async fn test_failed_chunk_counts_all_messages_and_continues() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let producer = producer(backend.clone(), metrics.clone());
        let messages: Vec<Message> = (0..4).map(|n| Message::new(json!({ "n": n }))).collect();

        backend.fail_next_appends(1);
        let result = producer.publish_batch("orders", &messages, Some(2)).await.unwrap();

        assert_eq!(result.chunks, 2);
        assert_eq!(result.failed, 2);
        assert_eq!(result.queued, 2);
        assert_eq!(backend.len("orders"), 2);
        assert_eq!(metrics.get_counter("redis_streams.publish_failed"), Some(1));
    }

    #[tokio::test]
    async fn test_publish_failure_maps_to_publish_failed() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let producer = producer(backend.clone(), Arc::new(InMemoryMetrics::new()));

        backend.set_unavailable(true);
        let err = producer
            .publish("orders", &Message::new(json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::PublishFailed { ref channel, .. } if channel == "orders"));
    }
}
