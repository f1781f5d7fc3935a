//! 메모리 기반 AMQP 드라이버
//!
//! Topic exchange 라우팅, 큐 바인딩, 채널별 unacked 메시지, nack 재적재를 재현합니다.
//! 연결이 끊기면 exclusive 큐와 그 바인딩은 서버에서처럼 삭제됩니다.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::mq::amqp_transport::{
    topic_matches, AmqpDelivery, AmqpProperties, AmqpTransport, ChannelId,
};
use crate::mq::error::DriverError;

struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
}

struct MemoryQueue {
    exclusive: bool,
    messages: VecDeque<StoredMessage>,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct MemoryChannel {
    consumer_queue: Option<String>,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Default)]
struct AmqpState {
    connected: bool,
    down: bool,
    failing_waits: usize,
    next_channel_id: ChannelId,
    next_queue_id: u64,
    exchanges: HashMap<String, String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    channels: HashMap<ChannelId, MemoryChannel>,
    published: Vec<(String, AmqpProperties)>,
}

impl AmqpState {
    /// 연결 종료 처리: 채널 닫힘, unacked 재적재, exclusive 큐 삭제
    fn drop_connection(&mut self) {
        self.connected = false;

        let channels: Vec<MemoryChannel> = self.channels.drain().map(|(_, c)| c).collect();
        for channel in channels {
            for (_, unacked) in channel.unacked {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(unacked.message);
                }
            }
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            self.queues.remove(name);
        }
        self.bindings.retain(|b| !exclusive.contains(&b.queue));
    }

    /// 채널 닫기: unacked 메시지는 큐 앞으로 재적재
    fn close_channel(&mut self, channel: ChannelId) {
        if let Some(closed) = self.channels.remove(&channel) {
            for (_, unacked) in closed.unacked {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(unacked.message);
                }
            }
        }
    }

    fn check_channel(&self, channel: ChannelId) -> Result<(), DriverError> {
        if !self.connected || self.down {
            return Err(DriverError::connection_lost("memory amqp disconnected"));
        }
        if !self.channels.contains_key(&channel) {
            return Err(DriverError::connection_lost(format!("channel {} closed", channel)));
        }
        Ok(())
    }
}

/// 메모리 AMQP 드라이버
#[derive(Default)]
pub struct MemoryAmqpTransport {
    state: Mutex<AmqpState>,
    notify: Notify,
    connect_calls: AtomicUsize,
}

impl MemoryAmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 서버 측 연결 종료 (exclusive 큐 삭제 포함)
    pub fn drop_connection(&self) {
        self.lock().drop_connection();
        self.notify.notify_waiters();
    }

    /// true면 서버 다운: 연결 시도와 모든 명령이 실패
    pub fn set_down(&self, down: bool) {
        let mut state = self.lock();
        state.down = down;
        if down {
            state.drop_connection();
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// 다음 n번의 수신 대기에서 연결을 끊음
    pub fn fail_next_waits(&self, count: usize) {
        self.lock().failing_waits = count;
    }

    /// 채널 하나를 서버 측에서 닫음
    pub fn close_channel(&self, channel: ChannelId) {
        self.lock().close_channel(channel);
        self.notify.notify_waiters();
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    /// 발행 기록 (routing key, 속성)
    pub fn published(&self) -> Vec<(String, AmqpProperties)> {
        self.lock().published.clone()
    }

    /// exchange를 거치지 않고 큐에 원시 메시지 적재
    pub fn inject(&self, queue: &str, routing_key: &str, body: &[u8]) {
        if let Some(q) = self.lock().queues.get_mut(queue) {
            q.messages.push_back(StoredMessage {
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
            });
        }
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, AmqpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_deliver(state: &mut AmqpState, channel: ChannelId) -> Option<AmqpDelivery> {
        let queue_name = state.channels.get(&channel)?.consumer_queue.clone()?;
        let message = state.queues.get_mut(&queue_name)?.messages.pop_front()?;
        let memory_channel = state.channels.get_mut(&channel)?;

        memory_channel.next_tag += 1;
        let tag = memory_channel.next_tag;
        let delivery = AmqpDelivery {
            delivery_tag: tag,
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
        };
        memory_channel.unacked.insert(
            tag,
            Unacked {
                queue: queue_name,
                message,
            },
        );
        Some(delivery)
    }
}

#[async_trait]
impl AmqpTransport for MemoryAmqpTransport {
    async fn connect(&self) -> Result<bool, DriverError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.down {
            return Err(DriverError::connection_lost("connection refused (memory amqp down)"));
        }
        let fresh = !state.connected;
        state.connected = true;
        Ok(fresh)
    }

    async fn is_connected(&self) -> bool {
        let state = self.lock();
        state.connected && !state.down
    }

    async fn open_channel(&self, _prefetch_count: u16) -> Result<ChannelId, DriverError> {
        let mut state = self.lock();
        if !state.connected || state.down {
            return Err(DriverError::connection_lost("memory amqp disconnected"));
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(id, MemoryChannel::default());
        Ok(id)
    }

    async fn is_channel_open(&self, channel: ChannelId) -> bool {
        self.lock().check_channel(channel).is_ok()
    }

    async fn release_channel(&self, channel: ChannelId) -> Result<(), DriverError> {
        self.lock().close_channel(channel);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn declare_exchange(
        &self,
        channel: ChannelId,
        exchange: &str,
        kind: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        state
            .exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| kind.to_string());
        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: ChannelId,
        name: &str,
        exclusive: bool,
    ) -> Result<String, DriverError> {
        let mut state = self.lock();
        state.check_channel(channel)?;

        let name = if name.is_empty() {
            state.next_queue_id += 1;
            format!("amq.gen-{}", state.next_queue_id)
        } else {
            name.to_string()
        };
        state.queues.entry(name.clone()).or_insert_with(|| MemoryQueue {
            exclusive,
            messages: VecDeque::new(),
        });
        Ok(name)
    }

    async fn bind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        if !state.queues.contains_key(queue) {
            return Err(DriverError::other(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(DriverError::other(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        state
            .bindings
            .retain(|b| !(b.queue == queue && b.exchange == exchange && b.routing_key == routing_key));
        Ok(())
    }

    async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &AmqpProperties,
    ) -> Result<(), DriverError> {
        {
            let mut state = self.lock();
            state.check_channel(channel)?;
            if !state.exchanges.contains_key(exchange) {
                return Err(DriverError::other(format!("NOT_FOUND - no exchange '{}'", exchange)));
            }

            let targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .collect();

            for queue in targets {
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.messages.push_back(StoredMessage {
                        routing_key: routing_key.to_string(),
                        body: body.to_vec(),
                    });
                }
            }
            state
                .published
                .push((routing_key.to_string(), properties.clone()));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn start_consumer(
        &self,
        channel: ChannelId,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        if !state.queues.contains_key(queue) {
            return Err(DriverError::other(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if let Some(memory_channel) = state.channels.get_mut(&channel) {
            memory_channel.consumer_queue = Some(queue.to_string());
        }
        Ok(())
    }

    async fn next_delivery(
        &self,
        channel: ChannelId,
        timeout_ms: u64,
    ) -> Result<Option<AmqpDelivery>, DriverError> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.failing_waits > 0 {
                    state.failing_waits -= 1;
                    state.drop_connection();
                    return Err(DriverError::connection_lost("connection reset (injected)"));
                }
                state.check_channel(channel)?;
                if let Some(delivery) = Self::try_deliver(&mut state, channel) {
                    return Ok(Some(delivery));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, channel: ChannelId, delivery_tag: u64) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        if let Some(memory_channel) = state.channels.get_mut(&channel) {
            memory_channel.unacked.remove(&delivery_tag);
        }
        Ok(())
    }

    async fn nack(&self, channel: ChannelId, delivery_tag: u64, requeue: bool) -> Result<(), DriverError> {
        {
            let mut state = self.lock();
            state.check_channel(channel)?;
            let unacked = state
                .channels
                .get_mut(&channel)
                .and_then(|c| c.unacked.remove(&delivery_tag));

            if let (Some(unacked), true) = (unacked, requeue) {
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(unacked.message);
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.lock().drop_connection();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(transport: &MemoryAmqpTransport) -> (ChannelId, String) {
        transport.connect().await.unwrap();
        let channel = transport.open_channel(10).await.unwrap();
        transport.declare_exchange(channel, "realtime", "topic").await.unwrap();
        let queue = transport.declare_queue(channel, "", true).await.unwrap();
        (channel, queue)
    }

    #[tokio::test]
    async fn test_topic_routing_and_ack() {
        let transport = MemoryAmqpTransport::new();
        let (channel, queue) = setup(&transport).await;
        transport.bind_queue(channel, &queue, "realtime", "orders.*").await.unwrap();
        transport.start_consumer(channel, &queue, "tag").await.unwrap();

        let props = AmqpProperties::json(true);
        transport.publish(channel, "realtime", "orders.created", b"{}", &props).await.unwrap();
        transport.publish(channel, "realtime", "payments.created", b"{}", &props).await.unwrap();

        let delivery = transport.next_delivery(channel, 10).await.unwrap().unwrap();
        assert_eq!(delivery.routing_key, "orders.created");
        assert!(transport.next_delivery(channel, 10).await.unwrap().is_none());

        transport.ack(channel, delivery.delivery_tag).await.unwrap();
        assert_eq!(transport.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_nack_requeues_at_front() {
        let transport = MemoryAmqpTransport::new();
        let (channel, queue) = setup(&transport).await;
        transport.bind_queue(channel, &queue, "realtime", "#").await.unwrap();
        transport.start_consumer(channel, &queue, "tag").await.unwrap();

        let props = AmqpProperties::json(false);
        transport.publish(channel, "realtime", "a", b"1", &props).await.unwrap();
        transport.publish(channel, "realtime", "b", b"2", &props).await.unwrap();

        let first = transport.next_delivery(channel, 10).await.unwrap().unwrap();
        transport.nack(channel, first.delivery_tag, true).await.unwrap();

        let again = transport.next_delivery(channel, 10).await.unwrap().unwrap();
        assert_eq!(again.body, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_connect_reports_fresh_connection() {
        let transport = MemoryAmqpTransport::new();

        assert!(transport.connect().await.unwrap());
        assert!(!transport.connect().await.unwrap());

        transport.drop_connection();
        assert!(transport.connect().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_channel_requeues_unacked() {
        let transport = MemoryAmqpTransport::new();
        let (channel, queue) = setup(&transport).await;
        transport.bind_queue(channel, &queue, "realtime", "#").await.unwrap();
        transport.start_consumer(channel, &queue, "tag").await.unwrap();
        transport
            .publish(channel, "realtime", "a", b"1", &AmqpProperties::json(true))
            .await
            .unwrap();
        transport.next_delivery(channel, 10).await.unwrap().unwrap();

        transport.release_channel(channel).await.unwrap();
        transport.release_channel(channel).await.unwrap();

        assert_eq!(transport.open_channel_count(), 0);
        assert_eq!(transport.queue_depth(&queue), 1);
    }

    #[tokio::test]
    async fn test_drop_connection_removes_exclusive_queue() {
        let transport = MemoryAmqpTransport::new();
        let (channel, queue) = setup(&transport).await;
        transport.bind_queue(channel, &queue, "realtime", "orders.*").await.unwrap();

        transport.drop_connection();

        assert!(!transport.is_connected().await);
        assert!(!transport.is_channel_open(channel).await);
        assert_eq!(transport.binding_count(), 0);
        assert!(transport.queue_names().is_empty());
    }
}
