//! 엔드포인트 단위 연결 풀
//!
//! 같은 (host, port, credential)을 대상으로 하는 브로커 인스턴스들이
//! 하나의 물리 연결을 공유하도록 합니다.

use log::{debug, info};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// 엔드포인트 식별자 (SHA-256 지문)
///
/// 자격 증명은 지문에만 반영되고 평문으로 저장되지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn new(scheme: &str, host: &str, port: u16, credential: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(scheme.as_bytes());
        hasher.update([0u8]);
        hasher.update(host.to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(port.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(credential.unwrap_or("").as_bytes());
        Self(format!("{}:{:x}", scheme, hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 로그에는 앞부분만
        let short: String = self.0.chars().take(24).collect();
        write!(f, "{}", short)
    }
}

struct PooledEntry<C> {
    connection: C,
    created_at: Instant,
    last_used: Instant,
}

/// 연결 풀 통계
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub oldest_entry_age_ms: u64,
}

/// 연결 풀
pub struct ConnectionPool<C> {
    name: String,
    entries: Mutex<HashMap<EndpointKey, PooledEntry<C>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<C: Clone + Send> ConnectionPool<C> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// 풀에 있는 연결 조회
    pub async fn get(&self, key: &EndpointKey) -> Option<C> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.connection.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 연결 등록 (같은 키의 기존 연결은 교체)
    pub async fn store(&self, key: EndpointKey, connection: C) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        debug!("[{}] 연결 등록: {}", self.name, key);
        entries.insert(
            key,
            PooledEntry {
                connection,
                created_at: now,
                last_used: now,
            },
        );
    }

    /// 연결이 없으면 `connect`로 생성 후 등록
    ///
    /// 생성 중에는 풀 잠금을 유지하므로 같은 엔드포인트에 대한 중복 핸드셰이크가 없습니다.
    pub async fn get_or_connect<E, F, Fut>(&self, key: &EndpointKey, connect: F) -> Result<C, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.last_used = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.connection.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let connection = connect().await?;
        let now = Instant::now();
        entries.insert(
            key.clone(),
            PooledEntry {
                connection: connection.clone(),
                created_at: now,
                last_used: now,
            },
        );
        info!("[{}] 새 연결 생성 및 등록: {}", self.name, key);
        Ok(connection)
    }

    /// 특정 연결 제거
    pub async fn purge(&self, key: &EndpointKey) -> bool {
        let removed = self.entries.lock().await.remove(key).is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!("[{}] 연결 제거: {}", self.name, key);
        }
        removed
    }

    /// 일정 시간 사용되지 않은 연결 제거
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.last_used.elapsed() < max_idle);
        let evicted = before - entries.len();

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            info!("[{}] 유휴 연결 {}개 제거", self.name, evicted);
        }
        evicted
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        self.evictions.fetch_add(entries.len() as u64, Ordering::Relaxed);
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.lock().await;
        let oldest = entries
            .values()
            .map(|e| e.created_at.elapsed().as_millis() as u64)
            .max()
            .unwrap_or(0);

        PoolStats {
            entries: entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            oldest_entry_age_ms: oldest,
        }
    }
}
