//! 브로커 공통 인터페이스
//!
//! Redis Streams, Redis Pub/Sub, RabbitMQ 브로커가 모두 구현하는 계약과
//! 헬스체크 결과 타입을 정의합니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::mq::error::{BrokerResult, CallbackError};
use crate::mq::message::Message;

/// 메시지 콜백: (채널, 메시지) -> 처리 결과
///
/// `Err`를 반환하면 해당 메시지 처리 실패로 간주합니다.
pub type MessageCallback = Arc<dyn Fn(&str, &Message) -> Result<(), CallbackError> + Send + Sync>;

/// 클로저를 `MessageCallback`으로 변환
pub fn callback<F>(f: F) -> MessageCallback
where
    F: Fn(&str, &Message) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 메시지 하나를 격리된 실패 경계 안에서 콜백에 전달
pub(crate) fn invoke_callback(
    callback: &MessageCallback,
    channel: &str,
    message: &Message,
) -> Result<(), CallbackError> {
    match catch_unwind(AssertUnwindSafe(|| callback(channel, message))) {
        Ok(result) => result,
        Err(_) => Err("콜백 패닉".into()),
    }
}

/// 헬스 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// 헬스체크 결과
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub broker: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(broker: &str, status: HealthStatus) -> Self {
        Self {
            broker: broker.to_string(),
            status,
            latency_ms: None,
            details: serde_json::Map::new(),
            checked_at: Utc::now(),
        }
    }

    /// 프로브 자체가 실패한 경우
    pub fn unhealthy(broker: &str, error: &str) -> Self {
        Self::new(broker, HealthStatus::Unhealthy).with_detail("error", error)
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn error(&self) -> Option<&str> {
        self.details.get("error").and_then(|v| v.as_str())
    }
}

/// 메시지 브로커 공통 계약
#[async_trait]
pub trait BrokerInterface: Send + Sync {
    /// 브로커 이름 (로그, 메트릭, 오류에 사용)
    fn name(&self) -> &str;

    /// 메시지 발행. 재시도하지 않습니다.
    async fn publish(&self, channel: &str, message: &Message) -> BrokerResult<()>;

    /// 콜백 등록. 같은 채널에 다시 등록하면 콜백을 교체합니다.
    async fn subscribe(&self, channel: &str, callback: MessageCallback) -> BrokerResult<()>;

    async fn unsubscribe(&self, channel: &str) -> BrokerResult<()>;

    /// 한 번의 소비 사이클을 실행하고 처리한 메시지 수를 반환
    async fn consume(&self, timeout_ms: u64, batch_size: usize) -> BrokerResult<usize>;

    /// 협조적 소비 중단 요청 (진행 중인 폴링은 끝까지 수행됨)
    fn stop_consuming(&self);

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> BrokerResult<()>;

    /// 헬스체크. 실패하지 않고 항상 결과를 반환합니다.
    async fn health_check(&self) -> HealthCheckResult;
}
