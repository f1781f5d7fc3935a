//! Message Queue 통합 모듈
//!
//! Redis Streams, Redis Pub/Sub, RabbitMQ를 하나의 `BrokerInterface`로 통합합니다.
//! 각 브로커는 드라이버 트레이트(`StreamBackend`, `PubSubBackend`, `AmqpTransport`)
//! 위에서 동작하므로 `in_memory` 드라이버로 서버 없이 실행할 수 있습니다.

pub mod amqp_transport;
pub mod broker;
pub mod circuit_breaker;
pub mod config;
pub mod connection_pool;
pub mod error;
pub mod factory;
pub mod health_monitor;
pub mod in_memory;
pub mod message;
pub mod metrics;
pub mod pubsub_backend;
pub mod rabbitmq_broker;
pub mod redis_consumer;
pub mod redis_pubsub;
pub mod redis_stream_broker;
pub mod redis_streams;
pub mod retry;
pub mod stream_backend;

pub use amqp_transport::{AmqpTransport, LapinTransport};
pub use broker::{callback, BrokerInterface, HealthCheckResult, HealthStatus, MessageCallback};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState};
pub use config::{
    options_from_env, OptionMap, RabbitMqConfig, RedisConnectionConfig, RedisPubSubConfig,
    RedisStreamConfig,
};
pub use connection_pool::{ConnectionPool, EndpointKey, PoolStats};
pub use error::{BrokerError, BrokerResult, CallbackError, DriverError, DriverErrorKind};
pub use factory::{BrokerDriver, BrokerFactory};
pub use health_monitor::{BrokerHealth, BrokerHealthMonitor, ConnectionStatus, HealthCheckConfig};
pub use message::Message;
pub use metrics::{BrokerMetrics, ConnectionEvent, InMemoryMetrics, NoopMetrics};
pub use pubsub_backend::{PubSubBackend, RedisPubSubBackend};
pub use rabbitmq_broker::{channel_to_routing_key, RabbitMqBroker};
pub use redis_consumer::{ConsumerState, RedisStreamConsumer};
pub use redis_pubsub::RedisPubSubBroker;
pub use redis_stream_broker::RedisStreamBroker;
pub use redis_streams::{BatchPublishResult, RedisStreamProducer};
pub use retry::ExponentialBackoff;
pub use stream_backend::{RedisStreamBackend, StreamBackend};
