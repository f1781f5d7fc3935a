//! Redis Streams 드라이버
//!
//! 프로듀서/컨슈머는 `StreamBackend` 트레이트만 사용하며,
//! 실제 Redis 연결은 `RedisStreamBackend`가 담당합니다.

use async_trait::async_trait;
use log::{debug, warn};
use redis::aio::MultiplexedConnection;
use redis::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::mq::config::RedisConnectionConfig;
use crate::mq::connection_pool::{ConnectionPool, EndpointKey};
use crate::mq::error::{DriverError, DriverErrorKind};

/// 스트림 엔트리의 메시지 필드 이름
pub const PAYLOAD_FIELD: &str = "payload";

/// 스트림 엔트리
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn payload(&self) -> Option<&str> {
        self.fields.get(PAYLOAD_FIELD).map(String::as_str)
    }
}

/// ACK되지 않은 엔트리 (PEL 항목)
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub stream: String,
    pub group: String,
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Consumer Group 생성 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// XAUTOCLAIM 결과
#[derive(Debug, Clone, Default)]
pub struct AutoClaimResult {
    pub next_cursor: String,
    pub entries: Vec<StreamEntry>,
}

/// Redis Streams 명령 추상화
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// XADD MAXLEN ~ (근사 trim)
    async fn append(&self, stream: &str, payload: &str, max_len: usize) -> Result<String, DriverError>;

    /// 파이프라인 한 번의 왕복으로 여러 XADD 실행
    async fn append_batch(
        &self,
        stream: &str,
        payloads: &[String],
        max_len: usize,
    ) -> Result<Vec<String>, DriverError>;

    /// XGROUP CREATE ... MKSTREAM
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, DriverError>;

    /// XREADGROUP ... BLOCK block_ms STREAMS ... >
    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, Vec<StreamEntry>)>, DriverError>;

    /// XACK (한 번의 호출로 여러 ID)
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, DriverError>;

    /// XPENDING 확장 형식. `consumer`가 있으면 해당 컨슈머 소유분만.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, DriverError>;

    /// XCLAIM
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, DriverError>;

    /// XAUTOCLAIM
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: &str,
        count: usize,
    ) -> Result<AutoClaimResult, DriverError>;

    /// Consumer Group 전체 pending 개수
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, DriverError>;

    async fn stream_len(&self, stream: &str) -> Result<u64, DriverError>;

    async fn ping(&self) -> Result<(), DriverError>;
}

/// redis-rs 기반 Streams 드라이버
///
/// 일반 명령은 풀에서 공유하는 멀티플렉스 연결을 사용하고,
/// BLOCK 읽기는 공유 연결을 막지 않도록 전용 연결을 사용합니다.
pub struct RedisStreamBackend {
    client: redis::Client,
    endpoint: EndpointKey,
    pool: Arc<ConnectionPool<MultiplexedConnection>>,
    reader: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStreamBackend {
    pub fn new(
        config: &RedisConnectionConfig,
        pool: Arc<ConnectionPool<MultiplexedConnection>>,
    ) -> Result<Self, DriverError> {
        let client = redis::Client::open(config.url())?;
        Ok(Self {
            client,
            endpoint: config.endpoint_key(),
            pool,
            reader: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, DriverError> {
        let client = self.client.clone();
        self.pool
            .get_or_connect(&self.endpoint, || async move {
                client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(DriverError::from)
            })
            .await
    }

    async fn reader_connection(&self) -> Result<MultiplexedConnection, DriverError> {
        let mut reader = self.reader.lock().await;
        if let Some(conn) = reader.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *reader = Some(conn.clone());
        Ok(conn)
    }

    /// 연결 오류 시 풀과 전용 연결을 비워 다음 호출에서 재연결
    async fn on_error(&self, err: &DriverError) {
        if err.is_connection_error() {
            warn!("Redis 연결 오류, 연결 폐기: {}", err);
            self.pool.purge(&self.endpoint).await;
            *self.reader.lock().await = None;
        }
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, DriverError> {
        let mut conn = self.connection().await?;
        match cmd.query_async::<_, T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = DriverError::from(e);
                self.on_error(&err).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl StreamBackend for RedisStreamBackend {
    async fn append(&self, stream: &str, payload: &str, max_len: usize) -> Result<String, DriverError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload);
        self.query(&cmd).await
    }

    async fn append_batch(
        &self,
        stream: &str,
        payloads: &[String],
        max_len: usize,
    ) -> Result<Vec<String>, DriverError> {
        let mut pipe = redis::pipe();
        for payload in payloads {
            pipe.cmd("XADD")
                .arg(stream)
                .arg("MAXLEN")
                .arg("~")
                .arg(max_len)
                .arg("*")
                .arg(PAYLOAD_FIELD)
                .arg(payload);
        }

        let mut conn = self.connection().await?;
        match pipe.query_async::<_, Vec<String>>(&mut conn).await {
            Ok(ids) => Ok(ids),
            Err(e) => {
                let err = DriverError::from(e);
                self.on_error(&err).await;
                Err(err)
            }
        }
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, DriverError> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg("0").arg("MKSTREAM");

        match self.query::<()>(&cmd).await {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.kind == DriverErrorKind::AlreadyExists => {
                Ok(GroupCreation::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, Vec<StreamEntry>)>, DriverError> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(streams);
        for _ in streams {
            cmd.arg(">");
        }

        let mut conn = self.reader_connection().await?;
        let value = match cmd.query_async::<_, Value>(&mut conn).await {
            Ok(value) => value,
            Err(e) => {
                let err = DriverError::from(e);
                self.on_error(&err).await;
                return Err(err);
            }
        };

        parse_read_reply(&value)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, DriverError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(ids);
        self.query(&cmd).await
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, DriverError> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group).arg("-").arg("+").arg(count);
        if let Some(consumer) = consumer {
            cmd.arg(consumer);
        }

        let rows: Vec<(String, String, u64, u64)> = self.query(&cmd).await?;
        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, delivery_count)| PendingEntry {
                stream: stream.to_string(),
                group: group.to_string(),
                id,
                consumer,
                idle_ms,
                delivery_count,
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
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle_ms).arg(ids);

        let value: Value = self.query(&cmd).await?;
        parse_entries(&value)
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
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(start)
            .arg("COUNT")
            .arg(count);

        let value: Value = self.query(&cmd).await?;
        match value {
            Value::Bulk(items) if items.len() >= 2 => Ok(AutoClaimResult {
                next_cursor: redis::from_redis_value(&items[0])?,
                entries: parse_entries(&items[1])?,
            }),
            other => Err(DriverError::other(format!("XAUTOCLAIM 응답 형식 오류: {:?}", other))),
        }
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, DriverError> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group);

        let value: Value = self.query(&cmd).await?;
        match value {
            Value::Bulk(items) if !items.is_empty() => Ok(redis::from_redis_value(&items[0])?),
            _ => Ok(0),
        }
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, DriverError> {
        let mut cmd = redis::cmd("XLEN");
        cmd.arg(stream);
        self.query(&cmd).await
    }

    async fn ping(&self) -> Result<(), DriverError> {
        let pong: String = self.query(&redis::cmd("PING")).await?;
        debug!("Redis PING 응답: {}", pong);
        Ok(())
    }
}

/// XREADGROUP 응답: `[[stream, [[id, [f, v, ...]], ...]], ...]` 또는 nil
fn parse_read_reply(value: &Value) -> Result<Vec<(String, Vec<StreamEntry>)>, DriverError> {
    let streams = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        other => return Err(DriverError::other(format!("XREADGROUP 응답 형식 오류: {:?}", other))),
    };

    let mut result = Vec::with_capacity(streams.len());
    for stream in streams {
        match stream {
            Value::Bulk(parts) if parts.len() == 2 => {
                let key: String = redis::from_redis_value(&parts[0])?;
                result.push((key, parse_entries(&parts[1])?));
            }
            other => return Err(DriverError::other(format!("스트림 응답 형식 오류: {:?}", other))),
        }
    }
    Ok(result)
}

/// 엔트리 목록 파싱. 삭제된 엔트리(nil)는 건너뛰고, 필드가 nil이면 빈 필드로 취급합니다.
fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>, DriverError> {
    let items = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(items) => items,
        other => return Err(DriverError::other(format!("엔트리 응답 형식 오류: {:?}", other))),
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let parts = match item {
            Value::Bulk(parts) if parts.len() == 2 => parts,
            Value::Nil => continue,
            other => return Err(DriverError::other(format!("엔트리 형식 오류: {:?}", other))),
        };

        let id: String = redis::from_redis_value(&parts[0])?;
        let mut fields = HashMap::new();
        if let Value::Bulk(kv) = &parts[1] {
            for pair in kv.chunks(2) {
                if let [k, v] = pair {
                    let key: String = redis::from_redis_value(k)?;
                    let val: String = redis::from_redis_value(v)?;
                    fields.insert(key, val);
                }
            }
        }
        entries.push(StreamEntry { id, fields });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_read_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("orders"),
            Value::Bulk(vec![
                Value::Bulk(vec![data("1-0"), Value::Bulk(vec![data("payload"), data("{}")])]),
                Value::Bulk(vec![data("2-0"), Value::Nil]),
            ]),
        ])]);

        let parsed = parse_read_reply(&reply).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "orders");
        assert_eq!(parsed[0].1[0].payload(), Some("{}"));
        assert_eq!(parsed[0].1[1].payload(), None);
    }

    #[test]
    fn test_parse_nil_reply_is_empty() {
        assert!(parse_read_reply(&Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn test_parse_entries_skips_deleted() {
        let reply = Value::Bulk(vec![
            Value::Nil,
            Value::Bulk(vec![data("3-0"), Value::Bulk(vec![data("payload"), data("x")])]),
        ]);
        let entries = parse_entries(&reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "3-0");
    }
}
