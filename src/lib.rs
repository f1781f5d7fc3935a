//! realtime-broker
//!
//! 실시간 메시지 브로커 클라이언트 계층 (Redis Streams, Redis Pub/Sub, RabbitMQ)

pub mod mq;

pub use mq::{
    callback, BrokerDriver, BrokerError, BrokerFactory, BrokerInterface, BrokerResult,
    HealthCheckResult, HealthStatus, Message, MessageCallback,
};
