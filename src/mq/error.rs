//! 브로커 오류 타입
//!
//! 드라이버(redis, lapin) 오류는 경계에서 `DriverErrorKind`로 분류되고,
//! 브로커 계층은 `BrokerError`만 노출합니다.

use crate::mq::circuit_breaker::CircuitOpenError;

/// 드라이버 오류 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// 연결 끊김 / 연결 거부 / I/O 오류
    ConnectionLost,
    Timeout,
    Deadlock,
    /// 이미 존재하는 리소스 (예: Consumer Group)
    AlreadyExists,
    Other,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverErrorKind::ConnectionLost => write!(f, "connection_lost"),
            DriverErrorKind::Timeout => write!(f, "timeout"),
            DriverErrorKind::Deadlock => write!(f, "deadlock"),
            DriverErrorKind::AlreadyExists => write!(f, "already_exists"),
            DriverErrorKind::Other => write!(f, "other"),
        }
    }
}

/// 분류된 드라이버 오류
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::ConnectionLost, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, message)
    }

    /// 재연결이 필요한 전송 계층 오류인지 확인
    pub fn is_connection_error(&self) -> bool {
        self.kind == DriverErrorKind::ConnectionLost
    }
}

impl From<redis::RedisError> for DriverError {
    fn from(err: redis::RedisError) -> Self {
        let kind = if err.code() == Some("BUSYGROUP") {
            DriverErrorKind::AlreadyExists
        } else if err.is_timeout() {
            DriverErrorKind::Timeout
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            DriverErrorKind::ConnectionLost
        } else {
            DriverErrorKind::Other
        };

        Self::new(kind, err.to_string())
    }
}

impl From<lapin::Error> for DriverError {
    fn from(err: lapin::Error) -> Self {
        let kind = match &err {
            lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::MissingHeartbeatError => DriverErrorKind::ConnectionLost,
            _ => DriverErrorKind::Other,
        };

        Self::new(kind, err.to_string())
    }
}

/// 브로커 오류 타입
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("[{broker}] 연결 실패: {reason}")]
    ConnectionFailed { broker: String, reason: String },

    #[error("[{broker}] 메시지 발행 실패 ({channel}): {source}")]
    PublishFailed {
        broker: String,
        channel: String,
        #[source]
        source: DriverError,
    },

    #[error("[{broker}] 메시지 소비 실패 ({channel}): {reason}")]
    ConsumeFailed {
        broker: String,
        channel: String,
        reason: String,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("[{broker}] 브로커가 연결되어 있지 않습니다")]
    NotConnected { broker: String },

    #[error("직렬화 오류: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("[{broker}] 드라이버 오류: {source}")]
    Driver {
        broker: String,
        #[source]
        source: DriverError,
    },

    #[error("알 수 없는 브로커 드라이버: {0}")]
    UnknownDriver(String),
}

impl BrokerError {
    pub fn driver(broker: &str, source: DriverError) -> Self {
        BrokerError::Driver {
            broker: broker.to_string(),
            source,
        }
    }

    /// 메트릭/로그용 오류 분류 이름
    pub fn kind_name(&self) -> &'static str {
        match self {
            BrokerError::ConnectionFailed { .. } => "connection_failed",
            BrokerError::PublishFailed { .. } => "publish_failed",
            BrokerError::ConsumeFailed { .. } => "consume_failed",
            BrokerError::CircuitOpen(_) => "circuit_open",
            BrokerError::NotConnected { .. } => "not_connected",
            BrokerError::Serialization(_) => "serialization",
            BrokerError::Driver { .. } => "driver",
            BrokerError::UnknownDriver(_) => "unknown_driver",
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// 콜백에서 반환하는 오류 (메시지 단위 실패)
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
