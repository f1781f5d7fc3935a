//! 재연결 지수 백오프

use log::debug;
use std::time::Duration;
use tokio::time::sleep;

/// 지수 백오프 설정
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,  // 기본 1초 지연
            max_delay_ms: 30000,  // 최대 30초 지연
            max_retries: 5,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_retries,
        }
    }

    /// `attempt`번째 재시도(0부터) 지연 시간
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = std::cmp::min(self.base_delay_ms.saturating_mul(factor), self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// 재시도 한도 초과 여부
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }

    /// 지수 백오프 적용
    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        debug!("지수 백오프 적용: {}ms (재시도: {})", delay.as_millis(), attempt);
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = ExponentialBackoff::new(100, 1000, 5);

        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(80), Duration::from_millis(1000));
    }

    #[test]
    fn test_exhaustion() {
        let backoff = ExponentialBackoff::new(10, 100, 3);
        assert!(!backoff.is_exhausted(2));
        assert!(backoff.is_exhausted(3));
    }
}
