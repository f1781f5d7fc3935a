//! 메모리 기반 Redis Streams 드라이버
//!
//! Consumer Group, PEL, idle 시간, XCLAIM/XAUTOCLAIM 의미를 프로세스 안에서 재현합니다.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::mq::error::DriverError;
use crate::mq::message::current_time_millis;
use crate::mq::stream_backend::{
    AutoClaimResult, GroupCreation, PendingEntry, StreamBackend, StreamEntry, PAYLOAD_FIELD,
};

type EntryId = (u64, u64);

fn parse_id(id: &str) -> EntryId {
    let mut parts = id.splitn(2, '-');
    let ms = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let seq = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (ms, seq)
}

fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

struct PendingInfo {
    consumer: String,
    last_delivery: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingInfo>,
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_id(&mut self) -> EntryId {
        let now = current_time_millis();
        let id = if now > self.last_id.0 {
            (now, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = id;
        id
    }

    fn trim(&mut self, max_len: usize) {
        while max_len > 0 && self.entries.len() > max_len {
            let first = match self.entries.keys().next() {
                Some(id) => *id,
                None => break,
            };
            self.entries.remove(&first);
        }
    }

    fn entry(&self, id: EntryId) -> Option<StreamEntry> {
        self.entries.get(&id).map(|fields| StreamEntry {
            id: format_id(id),
            fields: fields.clone(),
        })
    }
}

#[derive(Default)]
struct FaultPlan {
    unavailable: bool,
    failing_reads: usize,
    failing_appends: usize,
}

/// 메모리 Streams 드라이버
#[derive(Default)]
pub struct MemoryStreamBackend {
    streams: Mutex<HashMap<String, StreamState>>,
    faults: Mutex<FaultPlan>,
    notify: Notify,
    ack_calls: AtomicUsize,
    read_calls: AtomicUsize,
    append_round_trips: AtomicUsize,
    group_create_calls: AtomicUsize,
}

impl MemoryStreamBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 임의 필드로 엔트리 추가 (payload 없는 엔트리 주입 등)
    pub fn add_raw_entry(&self, stream: &str, fields: &[(&str, &str)]) -> String {
        let id = {
            let mut streams = self.lock_streams();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state.entries.insert(
                id,
                fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            );
            id
        };
        self.notify.notify_waiters();
        format_id(id)
    }

    /// true면 모든 명령이 연결 오류로 실패
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock_faults().unavailable = unavailable;
    }

    /// 다음 n번의 XREADGROUP을 연결 오류로 실패시킴
    pub fn fail_next_reads(&self, count: usize) {
        self.lock_faults().failing_reads = count;
    }

    /// 다음 n번의 XADD(배치 포함)를 실패시킴
    pub fn fail_next_appends(&self, count: usize) {
        self.lock_faults().failing_appends = count;
    }

    pub fn ack_calls(&self) -> usize {
        self.ack_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn append_round_trips(&self) -> usize {
        self.append_round_trips.load(Ordering::SeqCst)
    }

    pub fn group_create_calls(&self) -> usize {
        self.group_create_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self, stream: &str) -> usize {
        self.lock_streams().get(stream).map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn pending_len(&self, stream: &str, group: &str) -> usize {
        self.lock_streams()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), DriverError> {
        if self.lock_faults().unavailable {
            return Err(DriverError::connection_lost("memory stream backend unavailable"));
        }
        Ok(())
    }

    fn take_fault(&self, select: impl FnOnce(&mut FaultPlan) -> &mut usize) -> bool {
        let mut faults = self.lock_faults();
        let counter = select(&mut faults);
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_faults(&self) -> MutexGuard<'_, FaultPlan> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn no_group(stream: &str, group: &str) -> DriverError {
        DriverError::other(format!("NOGROUP {} {}", stream, group))
    }

    /// 새 엔트리를 컨슈머에게 전달하고 PEL에 등록
    fn deliver_new(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(String, Vec<StreamEntry>)>, DriverError> {
        let mut state = self.lock_streams();
        let mut result = Vec::new();

        for stream in streams {
            let stream_state = state
                .get_mut(stream)
                .ok_or_else(|| Self::no_group(stream, group))?;
            let StreamState { entries, groups, .. } = stream_state;
            let group_state = groups.get_mut(group).ok_or_else(|| Self::no_group(stream, group))?;

            let start = (group_state.last_delivered.0, group_state.last_delivered.1.saturating_add(1));
            let mut delivered = Vec::new();
            for (id, fields) in entries.range(start..).take(count) {
                delivered.push(StreamEntry {
                    id: format_id(*id),
                    fields: fields.clone(),
                });
                group_state.pending.insert(
                    *id,
                    PendingInfo {
                        consumer: consumer.to_string(),
                        last_delivery: Instant::now(),
                        delivery_count: 1,
                    },
                );
                group_state.last_delivered = *id;
            }

            if !delivered.is_empty() {
                result.push((stream.clone(), delivered));
            }
        }
        Ok(result)
    }

    fn claim_ids(
        state: &mut StreamState,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Vec<StreamEntry> {
        let mut claimed = Vec::new();
        let mut removed = Vec::new();
        {
            let StreamState { entries, groups, .. } = &mut *state;
            let group_state = match groups.get_mut(group) {
                Some(g) => g,
                None => return claimed,
            };

            for id in ids {
                let info = match group_state.pending.get_mut(id) {
                    Some(info) => info,
                    None => continue,
                };
                if info.last_delivery.elapsed() < min_idle {
                    continue;
                }
                match entries.get(id) {
                    Some(fields) => {
                        info.consumer = consumer.to_string();
                        info.last_delivery = Instant::now();
                        info.delivery_count += 1;
                        claimed.push(StreamEntry {
                            id: format_id(*id),
                            fields: fields.clone(),
                        });
                    }
                    None => removed.push(*id),
                }
            }

            for id in removed {
                group_state.pending.remove(&id);
            }
        }
        claimed
    }
}

#[async_trait]
impl StreamBackend for MemoryStreamBackend {
    async fn append(&self, stream: &str, payload: &str, max_len: usize) -> Result<String, DriverError> {
        self.check_available()?;
        if self.take_fault(|f| &mut f.failing_appends) {
            return Err(DriverError::timeout("XADD timeout (injected)"));
        }
        self.append_round_trips.fetch_add(1, Ordering::SeqCst);

        let id = {
            let mut streams = self.lock_streams();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state
                .entries
                .insert(id, HashMap::from([(PAYLOAD_FIELD.to_string(), payload.to_string())]));
            state.trim(max_len);
            id
        };
        self.notify.notify_waiters();
        Ok(format_id(id))
    }

    async fn append_batch(
        &self,
        stream: &str,
        payloads: &[String],
        max_len: usize,
    ) -> Result<Vec<String>, DriverError> {
        self.check_available()?;
        if self.take_fault(|f| &mut f.failing_appends) {
            return Err(DriverError::timeout("pipeline timeout (injected)"));
        }
        self.append_round_trips.fetch_add(1, Ordering::SeqCst);

        let ids = {
            let mut streams = self.lock_streams();
            let state = streams.entry(stream.to_string()).or_default();
            let mut ids = Vec::with_capacity(payloads.len());
            for payload in payloads {
                let id = state.next_id();
                state
                    .entries
                    .insert(id, HashMap::from([(PAYLOAD_FIELD.to_string(), payload.clone())]));
                ids.push(format_id(id));
            }
            state.trim(max_len);
            ids
        };
        self.notify.notify_waiters();
        Ok(ids)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, DriverError> {
        self.check_available()?;
        self.group_create_calls.fetch_add(1, Ordering::SeqCst);

        let mut streams = self.lock_streams();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        state.groups.insert(group.to_string(), GroupState::default());
        Ok(GroupCreation::Created)
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, Vec<StreamEntry>)>, DriverError> {
        self.check_available()?;
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_fault(|f| &mut f.failing_reads) {
            return Err(DriverError::connection_lost("connection reset (injected)"));
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(block_ms);
        loop {
            let notified = self.notify.notified();
            let delivered = self.deliver_new(streams, group, consumer, count)?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, DriverError> {
        self.check_available()?;
        self.ack_calls.fetch_add(1, Ordering::SeqCst);

        let mut streams = self.lock_streams();
        let group_state = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| Self::no_group(stream, group))?;

        Ok(ids
            .iter()
            .filter(|id| group_state.pending.remove(&parse_id(id)).is_some())
            .count())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, DriverError> {
        self.check_available()?;

        let streams = self.lock_streams();
        let group_state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| Self::no_group(stream, group))?;

        Ok(group_state
            .pending
            .iter()
            .filter(|(_, info)| consumer.map_or(true, |c| info.consumer == c))
            .take(count)
            .map(|(id, info)| PendingEntry {
                stream: stream.to_string(),
                group: group.to_string(),
                id: format_id(*id),
                consumer: info.consumer.clone(),
                idle_ms: info.last_delivery.elapsed().as_millis() as u64,
                delivery_count: info.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, DriverError> {
        self.check_available()?;

        let mut streams = self.lock_streams();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_group(stream, group))?;
        let ids: Vec<EntryId> = ids.iter().map(|id| parse_id(id)).collect();

        Ok(Self::claim_ids(
            state,
            group,
            consumer,
            Duration::from_millis(min_idle_ms),
            &ids,
        ))
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: &str,
        count: usize,
    ) -> Result<AutoClaimResult, DriverError> {
        self.check_available()?;

        let min_idle = Duration::from_millis(min_idle_ms);
        let mut streams = self.lock_streams();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_group(stream, group))?;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| Self::no_group(stream, group))?;

        let candidates: Vec<EntryId> = group_state
            .pending
            .range(parse_id(start)..)
            .filter(|(_, info)| info.last_delivery.elapsed() >= min_idle)
            .map(|(id, _)| *id)
            .take(count + 1)
            .collect();

        let (batch, next_cursor) = if candidates.len() > count {
            (&candidates[..count], format_id(candidates[count]))
        } else {
            (&candidates[..], "0-0".to_string())
        };

        let entries = Self::claim_ids(state, group, consumer, min_idle, batch);
        Ok(AutoClaimResult { next_cursor, entries })
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, DriverError> {
        self.check_available()?;
        Ok(self.pending_len(stream, group) as u64)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, DriverError> {
        self.check_available()?;
        Ok(self.len(stream) as u64)
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_read_and_ack() {
        let backend = MemoryStreamBackend::new();
        backend.create_group("orders", "g").await.unwrap();
        backend.append("orders", "{}", 100).await.unwrap();
        backend.append("orders", "{}", 100).await.unwrap();

        let read = backend
            .read_group(&["orders".to_string()], "g", "c1", 10, 10)
            .await
            .unwrap();
        assert_eq!(read[0].1.len(), 2);
        assert_eq!(backend.pending_len("orders", "g"), 2);

        let ids: Vec<String> = read[0].1.iter().map(|e| e.id.clone()).collect();
        assert_eq!(backend.ack("orders", "g", &ids).await.unwrap(), 2);
        assert_eq!(backend.pending_len("orders", "g"), 0);
    }

    #[tokio::test]
    async fn test_group_already_exists() {
        let backend = MemoryStreamBackend::new();
        assert_eq!(backend.create_group("s", "g").await.unwrap(), GroupCreation::Created);
        assert_eq!(backend.create_group("s", "g").await.unwrap(), GroupCreation::AlreadyExists);
    }

    #[tokio::test]
    async fn test_claim_respects_min_idle() {
        let backend = MemoryStreamBackend::new();
        backend.create_group("s", "g").await.unwrap();
        let id = backend.append("s", "{}", 100).await.unwrap();
        backend.read_group(&["s".to_string()], "g", "c1", 10, 10).await.unwrap();

        let early = backend.claim("s", "g", "c2", 10_000, &[id.clone()]).await.unwrap();
        assert!(early.is_empty());

        let claimed = backend.claim("s", "g", "c2", 0, &[id]).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let pending = backend.pending("s", "g", Some("c2"), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_trim_keeps_max_len() {
        let backend = MemoryStreamBackend::new();
        for _ in 0..5 {
            backend.append("s", "{}", 3).await.unwrap();
        }
        assert_eq!(backend.len("s"), 3);
    }
}
