//! realtime-broker 워커
//!
//! 환경 변수로 드라이버와 채널을 지정하고 수신 메시지를 로그로 출력합니다.
//!
//! - `BROKER_DRIVER`: redis_streams | redis_pubsub | rabbitmq (기본값 redis_streams)
//! - `BROKER_CHANNELS`: 쉼표로 구분한 채널 목록 (기본값 events)
//! - `BROKER_HOST`, `BROKER_PORT`, `BROKER_BLOCKMS`, `BROKER_BATCHSIZE` 등 브로커 옵션

use anyhow::Context;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use realtime_broker::mq::config::{option_int, option_u64};
use realtime_broker::mq::{
    callback, options_from_env, BrokerDriver, BrokerFactory, BrokerInterface, ExponentialBackoff,
    InMemoryMetrics,
};

const ENV_PREFIX: &str = "BROKER_";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let options = options_from_env(ENV_PREFIX);
    let driver: BrokerDriver = std::env::var("BROKER_DRIVER")
        .unwrap_or_else(|_| "redis_streams".to_string())
        .parse()
        .context("BROKER_DRIVER 해석 실패")?;
    let channels: Vec<String> = std::env::var("BROKER_CHANNELS")
        .unwrap_or_else(|_| "events".to_string())
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    let timeout_ms = option_u64(&options, "blockMs", 1000);
    let batch_size = option_int(&options, "batchSize", 10usize).max(1);

    info!("realtime-broker 워커 시작: driver={}, channels={:?}", driver, channels);

    let metrics = Arc::new(InMemoryMetrics::new());
    let factory = BrokerFactory::new(metrics.clone());
    let broker = factory
        .create(driver, &options)
        .await
        .with_context(|| format!("{} 브로커 연결 실패", driver))?;

    for channel in &channels {
        broker
            .subscribe(
                channel,
                callback(|channel, message| {
                    info!(
                        "메시지 수신: channel={}, id={}, payload={}",
                        channel,
                        message.id(),
                        message.payload()
                    );
                    Ok(())
                }),
            )
            .await
            .with_context(|| format!("채널 구독 실패: {}", channel))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("종료 신호 수신");
                shutdown.store(true, Ordering::SeqCst);
                broker.stop_consuming();
            }
        });
    }

    run_loop(broker.as_ref(), &shutdown, timeout_ms, batch_size).await;

    if let Err(e) = broker.disconnect().await {
        warn!("브로커 종료 중 오류: {}", e);
    }

    info!("워커 종료, 메트릭: {:?}", metrics.snapshot());
    Ok(())
}

async fn run_loop(
    broker: &dyn BrokerInterface,
    shutdown: &AtomicBool,
    timeout_ms: u64,
    batch_size: usize,
) {
    let backoff = ExponentialBackoff::default();
    let mut failures: u32 = 0;

    while !shutdown.load(Ordering::SeqCst) {
        match broker.consume(timeout_ms, batch_size).await {
            Ok(processed) => {
                failures = 0;
                if processed > 0 {
                    info!("{}개 메시지 처리", processed);
                }
            }
            Err(e) => {
                error!("소비 실패 ({}): {}", e.kind_name(), e);
                backoff.wait(failures).await;
                failures = failures.saturating_add(1);
            }
        }
    }
}
