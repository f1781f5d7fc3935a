//! 브로커 연결 상태 모니터링
//!
//! 등록된 브로커들의 `health_check()`를 주기적으로 호출하고
//! 브로커별 연속 실패 횟수, 성공률, 마지막 오류, 응답 시간을 기록합니다.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::mq::broker::{BrokerInterface, HealthStatus};
use crate::mq::message::current_time_millis;

/// 브로커 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// 아직 확인 전
    Unknown,
    Connected,
    Degraded,
    Disconnected,
    /// 연속 실패 한도 도달
    Failed,
}

/// 브로커별 모니터링 상태
#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub status: ConnectionStatus,
    pub last_check_time: u64,
    pub consecutive_failures: u32,
    pub total_checks: u32,
    pub successful_checks: u32,
    pub success_rate: f64,
    pub last_error: Option<String>,
    pub response_time_ms: u64,
}

impl Default for BrokerHealth {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Unknown,
            last_check_time: 0,
            consecutive_failures: 0,
            total_checks: 0,
            successful_checks: 0,
            success_rate: 0.0,
            last_error: None,
            response_time_ms: 0,
        }
    }
}

/// 헬스체크 설정
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub check_interval_ms: u64,
    pub timeout_ms: u64,
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5000,     // 5초마다 체크
            timeout_ms: 3000,            // 3초 타임아웃
            max_consecutive_failures: 3, // 3회 연속 실패 시 장애로 판단
        }
    }
}

/// 브로커 헬스 모니터
pub struct BrokerHealthMonitor {
    brokers: Vec<(String, Arc<dyn BrokerInterface>)>,
    health: Arc<RwLock<BTreeMap<String, BrokerHealth>>>,
    config: HealthCheckConfig,
    is_monitoring: Arc<Mutex<bool>>,
}

impl BrokerHealthMonitor {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            brokers: Vec::new(),
            health: Arc::new(RwLock::new(BTreeMap::new())),
            config,
            is_monitoring: Arc::new(Mutex::new(false)),
        }
    }

    /// 모니터링 대상 브로커 추가
    pub fn with_broker(mut self, name: &str, broker: Arc<dyn BrokerInterface>) -> Self {
        self.brokers.push((name.to_string(), broker));
        self
    }

    /// 모든 브로커를 한 번 확인
    pub async fn check_all(&self) {
        Self::run_checks(&self.brokers, &self.health, &self.config).await;
    }

    /// 주기적 모니터링 시작 (이미 실행 중이면 무시)
    pub async fn start_monitoring(&self) {
        let mut is_monitoring = self.is_monitoring.lock().await;
        if *is_monitoring {
            warn!("헬스 모니터링이 이미 실행 중입니다");
            return;
        }
        *is_monitoring = true;
        drop(is_monitoring);

        info!("브로커 헬스 모니터링 시작 ({}개 브로커)", self.brokers.len());

        let brokers = self.brokers.clone();
        let health = self.health.clone();
        let config = self.config.clone();
        let is_monitoring = self.is_monitoring.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(config.check_interval_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !*is_monitoring.lock().await {
                    break;
                }

                Self::run_checks(&brokers, &health, &config).await;
            }

            info!("브로커 헬스 모니터링 종료");
        });
    }

    /// 모니터링 중단 요청
    pub async fn stop_monitoring(&self) {
        let mut is_monitoring = self.is_monitoring.lock().await;
        if *is_monitoring {
            *is_monitoring = false;
            info!("브로커 헬스 모니터링 중단 요청");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        *self.is_monitoring.lock().await
    }

    /// 전체 헬스 상태 조회
    pub async fn get_health_status(&self) -> BTreeMap<String, BrokerHealth> {
        self.health.read().await.clone()
    }

    pub async fn get_broker_status(&self, name: &str) -> Option<BrokerHealth> {
        self.health.read().await.get(name).cloned()
    }

    /// 특정 브로커가 정상인지 확인
    pub async fn is_broker_healthy(&self, name: &str) -> bool {
        self.get_broker_status(name)
            .await
            .map(|h| h.status == ConnectionStatus::Connected)
            .unwrap_or(false)
    }

    /// 모든 브로커가 정상인지 확인
    pub async fn is_all_healthy(&self) -> bool {
        let health = self.health.read().await;
        !self.brokers.is_empty()
            && self.brokers.iter().all(|(name, _)| {
                health
                    .get(name)
                    .map(|h| h.status == ConnectionStatus::Connected)
                    .unwrap_or(false)
            })
    }

    /// 헬스 리포트 생성
    pub async fn generate_health_report(&self) -> String {
        let health = self.get_health_status().await;
        let mut report = String::from("=== 브로커 헬스 리포트 ===\n");
        for (name, status) in &health {
            report.push_str(&format!(
                "{}: {:?} (성공률: {:.1}%, 응답시간: {}ms)\n",
                name,
                status.status,
                status.success_rate * 100.0,
                status.response_time_ms
            ));
        }
        report.push_str(&format!(
            "전체 상태: {}\n",
            if self.is_all_healthy().await { "정상" } else { "장애" }
        ));
        report
    }

    async fn run_checks(
        brokers: &[(String, Arc<dyn BrokerInterface>)],
        health: &RwLock<BTreeMap<String, BrokerHealth>>,
        config: &HealthCheckConfig,
    ) {
        for (name, broker) in brokers {
            let started = Instant::now();
            let outcome = match timeout(Duration::from_millis(config.timeout_ms), broker.health_check()).await {
                Ok(result) => match result.status {
                    HealthStatus::Healthy => Ok(ConnectionStatus::Connected),
                    HealthStatus::Degraded => Ok(ConnectionStatus::Degraded),
                    HealthStatus::Unhealthy => Err(result
                        .error()
                        .unwrap_or("unhealthy")
                        .to_string()),
                },
                Err(_) => Err(format!("헬스체크 타임아웃 ({}ms)", config.timeout_ms)),
            };
            let response_time = started.elapsed().as_millis() as u64;

            let mut all = health.write().await;
            let status = all.entry(name.clone()).or_default();
            Self::update_health(name, status, outcome, response_time, config);
        }
    }

    fn update_health(
        name: &str,
        status: &mut BrokerHealth,
        outcome: Result<ConnectionStatus, String>,
        response_time: u64,
        config: &HealthCheckConfig,
    ) {
        status.last_check_time = current_time_millis();
        status.total_checks += 1;
        status.response_time_ms = response_time;

        match outcome {
            Ok(connection_status) => {
                debug!("{} 헬스체크 성공 ({}ms)", name, response_time);
                status.successful_checks += 1;
                status.consecutive_failures = 0;
                status.status = connection_status;
                status.last_error = None;
            }
            Err(error) => {
                warn!("{} 헬스체크 실패: {}", name, error);
                status.consecutive_failures += 1;
                status.last_error = Some(error);

                if status.consecutive_failures >= config.max_consecutive_failures {
                    status.status = ConnectionStatus::Failed;
                    warn!(
                        "브로커 장애 감지: {} (연속 실패: {})",
                        name, status.consecutive_failures
                    );
                } else {
                    status.status = ConnectionStatus::Disconnected;
                }
            }
        }

        status.success_rate = status.successful_checks as f64 / status.total_checks as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::config::RedisStreamConfig;
    use crate::mq::in_memory::MemoryStreamBackend;
    use crate::mq::metrics::NoopMetrics;
    use crate::mq::redis_stream_broker::RedisStreamBroker;

    fn monitor(backend: Arc<MemoryStreamBackend>, max_failures: u32) -> BrokerHealthMonitor {
        let broker = RedisStreamBroker::new(backend, &RedisStreamConfig::default(), Arc::new(NoopMetrics));
        BrokerHealthMonitor::new(HealthCheckConfig {
            check_interval_ms: 10,
            timeout_ms: 500,
            max_consecutive_failures: max_failures,
        })
        .with_broker("streams", Arc::new(broker))
    }

    #[tokio::test]
    async fn test_initial_state_unknown() {
        let monitor = monitor(Arc::new(MemoryStreamBackend::new()), 3);

        assert!(!monitor.is_broker_healthy("streams").await);
        assert!(!monitor.is_all_healthy().await);
        assert!(monitor.get_health_status().await.is_empty());
    }

    #[tokio::test]
    async fn test_consecutive_failures_mark_failed() {
        let backend = Arc::new(MemoryStreamBackend::new());
        let monitor = monitor(backend.clone(), 2);

        monitor.check_all().await;
        assert!(monitor.is_broker_healthy("streams").await);

        backend.set_unavailable(true);
        monitor.check_all().await;
        let status = monitor.get_broker_status("streams").await.unwrap();
        assert_eq!(status.status, ConnectionStatus::Disconnected);
        assert!(status.last_error.is_some());

        monitor.check_all().await;
        let status = monitor.get_broker_status("streams").await.unwrap();
        assert_eq!(status.status, ConnectionStatus::Failed);
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.total_checks, 3);
        assert!((status.success_rate - 1.0 / 3.0).abs() < 1e-9);

        let report = monitor.generate_health_report().await;
        assert!(report.contains("streams"));
        assert!(report.contains("장애"));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let monitor = monitor(Arc::new(MemoryStreamBackend::new()), 3);

        monitor.start_monitoring().await;
        monitor.start_monitoring().await;
        assert!(monitor.is_monitoring().await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.is_broker_healthy("streams").await);

        monitor.stop_monitoring().await;
        monitor.stop_monitoring().await;
        assert!(!monitor.is_monitoring().await);
    }
}
