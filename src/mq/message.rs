//! 브로커 메시지 엔벨로프
//!
//! 모든 브로커가 공유하는 메시지 구조와 JSON 와이어 포맷 변환을 제공합니다.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 브로커 메시지 (생성 후 불변)
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: String,
    payload: serde_json::Value,
    timestamp: u64,
    routing_key: Option<String>,
    headers: BTreeMap<String, String>,
}

/// JSON 와이어 포맷
///
/// 외부 프로듀서가 만든 메시지도 받을 수 있도록 `payload` 외의 필드는 모두 선택입니다.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Option<String>,
    payload: serde_json::Value,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
}

impl Message {
    /// 새 메시지 생성
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            timestamp: current_time_millis(),
            routing_key: None,
            headers: BTreeMap::new(),
        }
    }

    /// 라우팅 키를 지정한 새 메시지 생성
    pub fn with_routing_key(payload: serde_json::Value, routing_key: &str) -> Self {
        let mut message = Self::new(payload);
        message.routing_key = Some(routing_key.to_string());
        message
    }

    /// 헤더를 추가한 사본 반환
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// 생성 시각 (Unix epoch 밀리초)
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// JSON 문자열로 직렬화
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let wire = WireMessage {
            id: Some(self.id.clone()),
            payload: self.payload.clone(),
            timestamp: Some(self.timestamp),
            routing_key: self.routing_key.clone(),
            headers: self.headers.clone(),
        };
        serde_json::to_string(&wire)
    }

    /// JSON 문자열에서 역직렬화
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let wire: WireMessage = serde_json::from_str(json)?;
        Ok(Self {
            id: wire.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            payload: wire.payload,
            timestamp: wire.timestamp.unwrap_or_else(current_time_millis),
            routing_key: wire.routing_key,
            headers: wire.headers,
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let json = std::str::from_utf8(bytes).map_err(|e| {
            serde_json::Error::io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        Self::from_json(json)
    }
}

pub(crate) fn current_time_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
