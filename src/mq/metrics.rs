//! 브로커 메트릭 수집
//!
//! 브로커는 메트릭 싱크에 기록만 하며, 싱크는 브로커 호출 경로로 오류를 전파하지 않습니다.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 연결 이벤트
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    ReconnectFailed,
}

impl std::fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Disconnected => "disconnected",
            ConnectionEvent::Reconnecting => "reconnecting",
            ConnectionEvent::Reconnected => "reconnected",
            ConnectionEvent::ReconnectFailed => "reconnect_failed",
        };
        write!(f, "{}", name)
    }
}

/// 메트릭 싱크 (쓰기 전용)
pub trait BrokerMetrics: Send + Sync {
    fn record_publish(&self, broker: &str, channel: &str, latency: Duration, success: bool);
    fn record_consume(&self, broker: &str, channel: &str, messages: usize, latency: Duration);
    fn record_error(&self, broker: &str, operation: &str, error_kind: &str);
    fn record_connection_event(&self, broker: &str, event: ConnectionEvent);
}

/// 아무것도 기록하지 않는 싱크
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl BrokerMetrics for NoopMetrics {
    fn record_publish(&self, _: &str, _: &str, _: Duration, _: bool) {}
    fn record_consume(&self, _: &str, _: &str, _: usize, _: Duration) {}
    fn record_error(&self, _: &str, _: &str, _: &str) {}
    fn record_connection_event(&self, _: &str, _: ConnectionEvent) {}
}

/// 타이머 통계
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimerStats {
    pub count: u64,
    pub sum_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl TimerStats {
    fn record(&mut self, value_ms: f64) {
        if self.count == 0 {
            self.min_ms = value_ms;
            self.max_ms = value_ms;
        } else {
            self.min_ms = self.min_ms.min(value_ms);
            self.max_ms = self.max_ms.max(value_ms);
        }
        self.count += 1;
        self.sum_ms += value_ms;
    }

    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }
}

/// 메트릭 스냅샷
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub timers: HashMap<String, TimerStats>,
}

#[derive(Default)]
struct MetricsState {
    counters: HashMap<String, u64>,
    timers: HashMap<String, TimerStats>,
}

/// 메모리 메트릭 수집기
///
/// 카운터 이름: `{broker}.publish`, `{broker}.publish_failed`, `{broker}.consume`,
/// `{broker}.consume.{channel}`, `{broker}.error.{operation}.{kind}`, `{broker}.connection.{event}`
#[derive(Default)]
pub struct InMemoryMetrics {
    state: Mutex<MetricsState>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_counter(&self, name: &str) -> Option<u64> {
        self.lock().counters.get(name).copied()
    }

    /// (평균, 최소, 최대, 횟수)
    pub fn get_timer_stats(&self, name: &str) -> Option<(f64, f64, f64, u64)> {
        self.lock()
            .timers
            .get(name)
            .map(|t| (t.avg_ms(), t.min_ms, t.max_ms, t.count))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        MetricsSnapshot {
            counters: state.counters.clone(),
            timers: state.timers.clone(),
        }
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.counters.clear();
        state.timers.clear();
    }

    fn increment(&self, name: String, value: u64) {
        *self.lock().counters.entry(name).or_insert(0) += value;
    }

    fn record_timer(&self, name: String, latency: Duration) {
        self.lock()
            .timers
            .entry(name)
            .or_default()
            .record(latency.as_secs_f64() * 1000.0);
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerMetrics for InMemoryMetrics {
    fn record_publish(&self, broker: &str, channel: &str, latency: Duration, success: bool) {
        if success {
            self.increment(format!("{}.publish", broker), 1);
            self.increment(format!("{}.publish.{}", broker, channel), 1);
            self.record_timer(format!("{}.publish_latency_ms", broker), latency);
        } else {
            self.increment(format!("{}.publish_failed", broker), 1);
        }
    }

    fn record_consume(&self, broker: &str, channel: &str, messages: usize, latency: Duration) {
        self.increment(format!("{}.consume", broker), messages as u64);
        self.increment(format!("{}.consume.{}", broker, channel), messages as u64);
        self.record_timer(format!("{}.consume_latency_ms", broker), latency);
    }

    fn record_error(&self, broker: &str, operation: &str, error_kind: &str) {
        self.increment(format!("{}.error", broker), 1);
        self.increment(format!("{}.error.{}.{}", broker, operation, error_kind), 1);
    }

    fn record_connection_event(&self, broker: &str, event: ConnectionEvent) {
        self.increment(format!("{}.connection.{}", broker, event), 1);
    }
}
