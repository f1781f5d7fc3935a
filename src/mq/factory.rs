//! 브로커 팩토리
//!
//! 연결 풀과 메트릭 싱크를 주입받아 평면 옵션 맵으로부터 브로커를 생성합니다.

use log::info;
use redis::aio::MultiplexedConnection;
use std::str::FromStr;
use std::sync::Arc;

use crate::mq::broker::BrokerInterface;
use crate::mq::config::{OptionMap, RabbitMqConfig, RedisPubSubConfig, RedisStreamConfig};
use crate::mq::connection_pool::ConnectionPool;
use crate::mq::error::{BrokerError, BrokerResult};
use crate::mq::metrics::BrokerMetrics;
use crate::mq::rabbitmq_broker::RabbitMqBroker;
use crate::mq::redis_pubsub::RedisPubSubBroker;
use crate::mq::redis_stream_broker::RedisStreamBroker;

/// 브로커 드라이버 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerDriver {
    RedisStreams,
    RedisPubSub,
    RabbitMq,
}

impl FromStr for BrokerDriver {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" | "redis_streams" | "redis-streams" | "streams" => Ok(BrokerDriver::RedisStreams),
            "redis_pubsub" | "redis-pubsub" | "pubsub" => Ok(BrokerDriver::RedisPubSub),
            "rabbitmq" | "amqp" => Ok(BrokerDriver::RabbitMq),
            other => Err(BrokerError::UnknownDriver(other.to_string())),
        }
    }
}

impl std::fmt::Display for BrokerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerDriver::RedisStreams => write!(f, "redis_streams"),
            BrokerDriver::RedisPubSub => write!(f, "redis_pubsub"),
            BrokerDriver::RabbitMq => write!(f, "rabbitmq"),
        }
    }
}

/// 공유 자원을 보관하는 브로커 팩토리
pub struct BrokerFactory {
    redis_pool: Arc<ConnectionPool<MultiplexedConnection>>,
    amqp_pool: Arc<ConnectionPool<Arc<lapin::Connection>>>,
    metrics: Arc<dyn BrokerMetrics>,
}

impl BrokerFactory {
    pub fn new(metrics: Arc<dyn BrokerMetrics>) -> Self {
        Self::with_pools(
            Arc::new(ConnectionPool::new("redis")),
            Arc::new(ConnectionPool::new("amqp")),
            metrics,
        )
    }

    pub fn with_pools(
        redis_pool: Arc<ConnectionPool<MultiplexedConnection>>,
        amqp_pool: Arc<ConnectionPool<Arc<lapin::Connection>>>,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> Self {
        Self {
            redis_pool,
            amqp_pool,
            metrics,
        }
    }

    pub fn redis_pool(&self) -> &Arc<ConnectionPool<MultiplexedConnection>> {
        &self.redis_pool
    }

    pub fn amqp_pool(&self) -> &Arc<ConnectionPool<Arc<lapin::Connection>>> {
        &self.amqp_pool
    }

    pub fn metrics(&self) -> &Arc<dyn BrokerMetrics> {
        &self.metrics
    }

    /// 드라이버 종류와 옵션으로 브로커 생성 (연결 포함)
    pub async fn create(
        &self,
        driver: BrokerDriver,
        options: &OptionMap,
    ) -> BrokerResult<Arc<dyn BrokerInterface>> {
        info!("브로커 생성: {}", driver);

        let broker: Arc<dyn BrokerInterface> = match driver {
            BrokerDriver::RedisStreams => {
                let config = RedisStreamConfig::from_options(options);
                Arc::new(
                    RedisStreamBroker::connect(&config, self.redis_pool.clone(), self.metrics.clone())
                        .await?,
                )
            }
            BrokerDriver::RedisPubSub => {
                let config = RedisPubSubConfig::from_options(options);
                Arc::new(
                    RedisPubSubBroker::connect(config, self.redis_pool.clone(), self.metrics.clone())
                        .await?,
                )
            }
            BrokerDriver::RabbitMq => {
                let config = RabbitMqConfig::from_options(options);
                Arc::new(
                    RabbitMqBroker::connect(config, self.amqp_pool.clone(), self.metrics.clone())
                        .await?,
                )
            }
        };
        Ok(broker)
    }

    /// 드라이버 이름 문자열로 브로커 생성
    pub async fn create_by_name(
        &self,
        driver: &str,
        options: &OptionMap,
    ) -> BrokerResult<Arc<dyn BrokerInterface>> {
        self.create(driver.parse()?, options).await
    }
}
