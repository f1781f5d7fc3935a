//! 브로커 시나리오 테스트
//!
//! 인메모리 드라이버 위에서 세 가지 브로커의 전달 보장, 회수, 재연결 동작을 검증합니다.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use realtime_broker::mq::in_memory::{MemoryAmqpTransport, MemoryPubSubBackend, MemoryStreamBackend};
use realtime_broker::mq::stream_backend::PAYLOAD_FIELD;
use realtime_broker::mq::{
    callback, BrokerError, BrokerHealthMonitor, BrokerInterface, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, ExponentialBackoff, HealthCheckConfig, HealthStatus,
    InMemoryMetrics, Message, MessageCallback, NoopMetrics, RabbitMqBroker, RabbitMqConfig,
    RedisPubSubBroker, RedisPubSubConfig, RedisStreamBroker, RedisStreamConfig,
};

const GROUP: &str = "scenario-group";

fn stream_config(consumer: &str) -> RedisStreamConfig {
    RedisStreamConfig {
        group: GROUP.to_string(),
        consumer: consumer.to_string(),
        idle_time_ms: 100,
        reclaim_interval: 1,
        non_blocking_block_ms: 30,
        ..RedisStreamConfig::default()
    }
}

fn stream_broker(backend: &Arc<MemoryStreamBackend>, consumer: &str) -> RedisStreamBroker {
    RedisStreamBroker::new(backend.clone(), &stream_config(consumer), Arc::new(NoopMetrics))
}

fn collecting_callback(seen: Arc<Mutex<Vec<i64>>>) -> MessageCallback {
    callback(move |_, message: &Message| {
        let n = message.payload()["n"].as_i64().unwrap_or(-1);
        seen.lock().unwrap().push(n);
        Ok(())
    })
}

/// 메시지 JSON 왕복 테스트
#[test]
fn test_message_round_trip() {
    let message = Message::with_routing_key(json!({"n": 1, "tags": ["a", "b"]}), "orders.created")
        .with_header("source", "scenario");

    let decoded = Message::from_json(&message.to_json().unwrap()).unwrap();

    assert_eq!(decoded, message);
}

/// orders 스트림 발행/소비 후 pending 없음
#[tokio::test]
async fn test_streams_publish_consume_leaves_nothing_pending() {
    let backend = Arc::new(MemoryStreamBackend::new());
    let broker = stream_broker(&backend, "worker-1");
    let seen = Arc::new(Mutex::new(Vec::new()));

    broker.subscribe("orders", collecting_callback(seen.clone())).await.unwrap();
    for n in 1..=3 {
        broker.publish("orders", &Message::new(json!({ "n": n }))).await.unwrap();
    }

    let processed = broker.consume(10, 10).await.unwrap();

    assert_eq!(processed, 3);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(backend.pending_len("orders", GROUP), 0);

    let health = broker.health_check().await;
    assert_eq!(health.status, HealthStatus::Healthy);
}

/// 한 배치의 성공/형식 오류 엔트리는 XACK 한 번으로 확인, 실패 엔트리는 pending 유지
#[tokio::test]
async fn test_streams_single_ack_per_batch() {
    let backend = Arc::new(MemoryStreamBackend::new());
    let broker = stream_broker(&backend, "worker-1");
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    broker
        .subscribe("orders", callback(move |_, message: &Message| {
            seen.fetch_add(1, Ordering::SeqCst);
            if message.payload()["n"] == 4 {
                Err("rejected".into())
            } else {
                Ok(())
            }
        }))
        .await
        .unwrap();

    for n in 1..=4 {
        broker.publish("orders", &Message::new(json!({ "n": n }))).await.unwrap();
    }
    backend.add_raw_entry("orders", &[(PAYLOAD_FIELD, "{broken")]);

    let processed = broker.consume(10, 10).await.unwrap();

    assert_eq!(processed, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(backend.ack_calls(), 1);
    assert_eq!(backend.pending_len("orders", GROUP), 1);
}

/// 형식이 잘못된 엔트리는 콜백 없이 ACK
#[tokio::test]
async fn test_streams_malformed_entry_acked_without_callback() {
    let backend = Arc::new(MemoryStreamBackend::new());
    let broker = stream_broker(&backend, "worker-1");
    let seen = Arc::new(Mutex::new(Vec::new()));

    broker.subscribe("orders", collecting_callback(seen.clone())).await.unwrap();
    backend.add_raw_entry("orders", &[(PAYLOAD_FIELD, "not json")]);

    assert_eq!(broker.consume(10, 10).await.unwrap(), 0);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(backend.pending_len("orders", GROUP), 0);
}

/// 실패한 메시지는 idle 임계값 이전에는 회수되지 않고 이후에 재처리
#[tokio::test]
async fn test_streams_reclaim_after_idle_threshold() {
    let backend = Arc::new(MemoryStreamBackend::new());
    let broker = stream_broker(&backend, "worker-1");
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();

    broker
        .subscribe("orders", callback(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("transient failure".into())
            } else {
                Ok(())
            }
        }))
        .await
        .unwrap();
    broker.publish("orders", &Message::new(json!({"n": 1}))).await.unwrap();

    assert_eq!(broker.consume(10, 10).await.unwrap(), 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(backend.pending_len("orders", GROUP), 1);

    // 임계값 이전
    assert_eq!(broker.consume(10, 10).await.unwrap(), 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(broker.consume(10, 10).await.unwrap(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(backend.pending_len("orders", GROUP), 0);
}

/// 중단된 컨슈머의 pending 메시지를 다른 컨슈머가 회수
#[tokio::test]
async fn test_streams_reclaim_from_crashed_consumer() {
    let backend = Arc::new(MemoryStreamBackend::new());
    let crashed = stream_broker(&backend, "worker-crashed");
    crashed
        .subscribe("orders", callback(|_, _| Err("crash before ack".into())))
        .await
        .unwrap();
    crashed.publish("orders", &Message::new(json!({"n": 7}))).await.unwrap();
    assert_eq!(crashed.consume(10, 10).await.unwrap(), 0);

    let survivor = stream_broker(&backend, "worker-survivor");
    let seen = Arc::new(Mutex::new(Vec::new()));
    survivor.subscribe("orders", collecting_callback(seen.clone())).await.unwrap();

    assert_eq!(survivor.consume(10, 10).await.unwrap(), 0);
    assert!(seen.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(survivor.consume(10, 10).await.unwrap(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![7]);
    assert_eq!(backend.pending_len("orders", GROUP), 0);
}

/// 논블로킹 다중 소비는 폴링 창 두 번 안에 종료
#[tokio::test]
async fn test_streams_non_blocking_terminates() {
    let backend = Arc::new(MemoryStreamBackend::new());
    let broker = stream_broker(&backend, "worker-1");
    let streams = vec!["orders".to_string(), "trades".to_string()];
    for stream in &streams {
        broker.subscribe(stream, callback(|_, _| Ok(()))).await.unwrap();
    }

    let started = Instant::now();
    let processed = broker.consume_multiple(&streams, 10, false).await.unwrap();

    assert_eq!(processed, 0);
    assert!(started.elapsed() < Duration::from_millis(2 * 30 + 200));
}

/// 서킷 브레이커 상태 전이와 단일 시험 호출
#[tokio::test]
async fn test_circuit_breaker_transitions() {
    let breaker = CircuitBreaker::new("scenario", CircuitBreakerConfig {
        failure_threshold: 2,
        open_timeout_ms: 50,
    });
    let count = AtomicUsize::new(0);
    let invoked = &count;

    for _ in 0..2 {
        let result: Result<(), BrokerError> = breaker
            .call(move || async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::NotConnected { broker: "scenario".to_string() })
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected: Result<(), BrokerError> = breaker
        .call(move || async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(rejected, Err(BrokerError::CircuitOpen(_))));
    assert_eq!(count.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(70)).await;

    let trial = breaker.call(|| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<(), BrokerError>(())
    });
    let concurrent = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        breaker.call(|| async { Ok::<(), BrokerError>(()) }).await
    };
    let (trial, concurrent) = tokio::join!(trial, concurrent);

    assert!(trial.is_ok());
    assert!(matches!(concurrent, Err(BrokerError::CircuitOpen(_))));
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

fn amqp_config() -> RabbitMqConfig {
    RabbitMqConfig {
        max_channels: 2,
        backoff: ExponentialBackoff::new(1, 5, 3),
        wait_slice_ms: 20,
        ..RabbitMqConfig::default()
    }
}

/// 연결 끊김 후 재연결 시 구독을 다시 하지 않아도 바인딩 복구
#[tokio::test]
async fn test_amqp_reconnect_rebinds_without_resubscribe() {
    let transport = Arc::new(MemoryAmqpTransport::new());
    let broker = RabbitMqBroker::new(transport.clone(), amqp_config(), Arc::new(NoopMetrics))
        .await
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    broker.subscribe("orders:created", collecting_callback(seen.clone())).await.unwrap();
    let first_queue = broker.queue_name().await.unwrap();
    assert_eq!(transport.binding_count(), 1);

    transport.fail_next_waits(1);
    assert_eq!(broker.consume(50, 10).await.unwrap(), 0);
    assert_eq!(transport.connect_calls(), 2);

    broker
        .publish("orders:created", &Message::new(json!({"n": 5})))
        .await
        .unwrap();
    let processed = broker.consume(200, 1).await.unwrap();

    assert_eq!(processed, 1);
    assert_eq!(*seen.lock().unwrap(), vec![5]);
    assert_eq!(transport.binding_count(), 1);
    assert_ne!(broker.queue_name().await.unwrap(), first_queue);
    assert!(broker.is_connected().await);
}

/// 와일드카드 구독은 토픽 패턴으로 라우팅
#[tokio::test]
async fn test_amqp_wildcard_subscription() {
    let transport = Arc::new(MemoryAmqpTransport::new());
    let broker = RabbitMqBroker::new(transport.clone(), amqp_config(), Arc::new(NoopMetrics))
        .await
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    broker.subscribe("orders.#", collecting_callback(seen.clone())).await.unwrap();
    broker.publish("orders:created", &Message::new(json!({"n": 1}))).await.unwrap();
    broker.publish("orders:eu:filled", &Message::new(json!({"n": 2}))).await.unwrap();
    broker.publish("trades:created", &Message::new(json!({"n": 3}))).await.unwrap();

    let processed = broker.consume(200, 2).await.unwrap();

    assert_eq!(processed, 2);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}

/// Pub/Sub 재시도 한도 초과 시 ConsumeFailed
#[tokio::test]
async fn test_pubsub_retry_exhaustion() {
    let backend = Arc::new(MemoryPubSubBackend::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let broker = RedisPubSubBroker::new(
        backend.clone(),
        RedisPubSubConfig {
            backoff: ExponentialBackoff::new(1, 5, 3),
            ..RedisPubSubConfig::default()
        },
        metrics,
    )
    .await
    .unwrap();
    broker.subscribe("news", callback(|_, _| Ok(()))).await.unwrap();

    backend.set_down(true);
    let err = broker.consume(20, 10).await.unwrap_err();

    assert!(matches!(err, BrokerError::ConsumeFailed { .. }));
    assert_eq!(err.kind_name(), "consume_failed");
}

/// 헬스 모니터는 여러 브로커 상태를 함께 추적
#[tokio::test]
async fn test_health_monitor_tracks_multiple_brokers() {
    let stream_backend = Arc::new(MemoryStreamBackend::new());
    let transport = Arc::new(MemoryAmqpTransport::new());
    let streams: Arc<dyn BrokerInterface> = Arc::new(stream_broker(&stream_backend, "worker-1"));
    let amqp: Arc<dyn BrokerInterface> = Arc::new(
        RabbitMqBroker::new(transport.clone(), amqp_config(), Arc::new(NoopMetrics))
            .await
            .unwrap(),
    );

    let monitor = BrokerHealthMonitor::new(HealthCheckConfig {
        check_interval_ms: 10,
        timeout_ms: 500,
        max_consecutive_failures: 1,
    })
    .with_broker("streams", streams)
    .with_broker("rabbitmq", amqp);

    monitor.check_all().await;
    assert!(monitor.is_all_healthy().await);

    stream_backend.set_unavailable(true);
    monitor.check_all().await;

    assert!(!monitor.is_broker_healthy("streams").await);
    assert!(monitor.is_broker_healthy("rabbitmq").await);
    assert!(!monitor.is_all_healthy().await);
}
