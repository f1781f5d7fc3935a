//! 메모리 기반 Pub/Sub 드라이버
//!
//! 구독 중인 채널로 발행된 메시지만 전달되며, 구독자가 없으면 버려집니다.

use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::mq::error::DriverError;
use crate::mq::pubsub_backend::{PubSubBackend, PubSubMessage};

#[derive(Default)]
struct PubSubState {
    connected: bool,
    down: bool,
    failing_connects: usize,
    failing_receives: usize,
    failing_pings: usize,
    channels: BTreeSet<String>,
    inbox: VecDeque<PubSubMessage>,
}

/// 메모리 Pub/Sub 드라이버
#[derive(Default)]
pub struct MemoryPubSubBackend {
    state: Mutex<PubSubState>,
    notify: Notify,
    connect_calls: AtomicUsize,
    ping_calls: AtomicUsize,
}

impl MemoryPubSubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// true면 서버 다운: 연결과 모든 명령이 실패
    pub fn set_down(&self, down: bool) {
        let mut state = self.lock();
        state.down = down;
        if down {
            state.connected = false;
            state.inbox.clear();
        }
    }

    /// 다음 n번의 연결 시도를 실패시킴
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// 다음 n번의 수신 대기를 연결 끊김으로 실패시킴
    pub fn fail_next_receives(&self, count: usize) {
        self.lock().failing_receives = count;
    }

    /// 다음 `count`번의 PING을 실패시키고 연결을 끊음
    pub fn fail_next_pings(&self, count: usize) {
        self.lock().failing_pings = count;
    }

    pub fn ping_calls(&self) -> usize {
        self.ping_calls.load(Ordering::SeqCst)
    }

    /// 구독 여부와 관계없이 원시 메시지를 수신함에 넣음
    pub fn inject(&self, channel: &str, payload: &str) {
        self.lock().inbox.push_back(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        self.notify.notify_waiters();
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.lock().channels.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, PubSubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_connected(state: &PubSubState) -> Result<(), DriverError> {
        if state.down || !state.connected {
            return Err(DriverError::connection_lost("memory pub/sub disconnected"));
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubBackend for MemoryPubSubBackend {
    async fn connect(&self) -> Result<(), DriverError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.down {
            return Err(DriverError::connection_lost("connection refused (memory pub/sub down)"));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(DriverError::connection_lost("connection refused (injected)"));
        }
        state.connected = true;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let state = self.lock();
        state.connected && !state.down
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, DriverError> {
        let receivers = {
            let mut state = self.lock();
            if state.down {
                return Err(DriverError::connection_lost("memory pub/sub down"));
            }
            if state.connected && state.channels.contains(channel) {
                state.inbox.push_back(PubSubMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
                1
            } else {
                0
            }
        };
        if receivers > 0 {
            self.notify.notify_waiters();
        }
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.down {
            return Err(DriverError::connection_lost("memory pub/sub down"));
        }
        state.channels.extend(channels.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), DriverError> {
        let mut state = self.lock();
        for channel in channels {
            state.channels.remove(channel);
        }
        Ok(())
    }

    async fn next_message(&self, timeout_ms: u64) -> Result<Option<PubSubMessage>, DriverError> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                Self::check_connected(&state)?;
                if state.failing_receives > 0 {
                    state.failing_receives -= 1;
                    state.connected = false;
                    return Err(DriverError::connection_lost("connection reset (injected)"));
                }
                if let Some(message) = state.inbox.pop_front() {
                    return Ok(Some(message));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        Self::check_connected(&state)?;
        if state.failing_pings > 0 {
            state.failing_pings -= 1;
            state.connected = false;
            return Err(DriverError::connection_lost("ping timeout (injected)"));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.connected = false;
        state.channels.clear();
        state.inbox.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_only_to_subscribed_channels() {
        let backend = MemoryPubSubBackend::new();
        backend.connect().await.unwrap();
        backend.subscribe(&["news".to_string()]).await.unwrap();

        assert_eq!(backend.publish("news", "a").await.unwrap(), 1);
        assert_eq!(backend.publish("other", "b").await.unwrap(), 0);

        let message = backend.next_message(10).await.unwrap().unwrap();
        assert_eq!(message.channel, "news");
        assert!(backend.next_message(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_down_fails_connect() {
        let backend = MemoryPubSubBackend::new();
        backend.set_down(true);

        assert!(backend.connect().await.unwrap_err().is_connection_error());
        assert!(backend.next_message(10).await.is_err());
    }
}
