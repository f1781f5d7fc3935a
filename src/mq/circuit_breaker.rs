//! 서킷 브레이커
//!
//! 연속 실패가 임계값을 넘으면 호출을 즉시 실패시키고,
//! 타임아웃 이후 단 한 번의 시험 호출로 복구 여부를 판단합니다.

use log::{info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// 서킷 브레이커 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// 서킷 브레이커 설정
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,    // 5회 연속 실패 시 차단
            open_timeout_ms: 30000,  // 30초 후 시험 호출 허용
        }
    }
}

/// 서킷이 열려 있어 호출이 거부됨
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{breaker}] 서킷 브레이커 열림: {retry_after_ms}ms 후 재시도 가능")]
pub struct CircuitOpenError {
    pub breaker: String,
    pub retry_after_ms: u64,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// 브로커 인스턴스 전용 서킷 브레이커
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// 연산을 서킷 브레이커로 감싸 실행
    ///
    /// 서킷이 열려 있으면 `op`를 호출하지 않고 `CircuitOpenError`로 즉시 실패합니다.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let mut permit = self.try_acquire()?;

        let result = op().await;
        permit.finished = true;

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut inner = self.lock();
        let open_timeout = Duration::from_millis(self.config.open_timeout_ms);

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(open_timeout);
                if elapsed < open_timeout {
                    return Err(self.open_error(open_timeout - elapsed));
                }
                info!("[{}] 서킷 브레이커 half-open 전환: 시험 호출 허용", self.name);
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
            }
            CircuitState::HalfOpen => {
                // 시험 호출은 한 번에 하나만
                if inner.trial_in_flight {
                    return Err(self.open_error(Duration::ZERO));
                }
                inner.trial_in_flight = true;
            }
        }

        Ok(CallPermit {
            breaker: self,
            finished: false,
        })
    }

    /// 성공 기록
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!("[{}] 서킷 브레이커 closed 복구", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// 실패 기록
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                warn!("[{}] 시험 호출 실패: 서킷 브레이커 다시 open", self.name);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                warn!(
                    "[{}] 연속 {}회 실패: 서킷 브레이커 open ({}ms)",
                    self.name, inner.consecutive_failures, self.config.open_timeout_ms
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    /// 수동 초기화
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            breaker: self.name.clone(),
            retry_after_ms: retry_after.as_millis() as u64,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 호출 도중 future가 drop되면 실패로 기록
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    finished: bool,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[derive(Debug)]
    enum TestError {
        Open,
        Failed,
    }

    impl From<CircuitOpenError> for TestError {
        fn from(_: CircuitOpenError) -> Self {
            TestError::Open
        }
    }

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_timeout_ms: timeout_ms,
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), TestError> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Failed)
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), TestError> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), TestError>(())
            })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = breaker(3, 60_000);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&breaker, &calls).await, Err(TestError::Failed)));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = succeed(&breaker, &calls).await;
        assert!(matches!(result, Err(TestError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 3); // 래핑된 연산은 호출되지 않음
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, 60_000);
        let calls = AtomicUsize::new(0);

        let _ = fail(&breaker, &calls).await;
        let _ = fail(&breaker, &calls).await;
        succeed(&breaker, &calls).await.unwrap();
        let _ = fail(&breaker, &calls).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = breaker(1, 50);
        let calls = AtomicUsize::new(0);

        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(80)).await;
        succeed(&breaker, &calls).await.unwrap();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 50);
        let calls = AtomicUsize::new(0);

        let _ = fail(&breaker, &calls).await;
        sleep(Duration::from_millis(80)).await;
        assert!(matches!(fail(&breaker, &calls).await, Err(TestError::Failed)));

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker, &calls).await, Err(TestError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_only_one_trial_call_in_half_open() {
        let breaker = breaker(1, 50);
        let calls = AtomicUsize::new(0);

        let _ = fail(&breaker, &calls).await;
        sleep(Duration::from_millis(80)).await;

        let trial = breaker.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(50)).await;
            Ok::<(), TestError>(())
        });
        let second = async {
            sleep(Duration::from_millis(10)).await;
            succeed(&breaker, &calls).await
        };

        let (trial_result, second_result) = tokio::join!(trial, second);
        assert!(trial_result.is_ok());
        assert!(matches!(second_result, Err(TestError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
