mod config;
mod controller;
mod error;
mod exchange;
mod mirror;
mod monitor;
mod planner;
mod risk;
mod schedule;
mod trade_log;
mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use config::Config;
use controller::GridController;
use exchange::{ExchangeAdapter, SimAdapter, UnconfiguredAdapter};
use monitor::PositionMonitor;
use schedule::ScheduleManager;
use trade_log::TradeLogger;

fn shadow_mode() -> bool {
    std::env::var("EDGEX_SHADOW_MODE")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };
    log::info!(
        "starting grid controller for {} (box={} bin={} follow={})",
        config.symbol,
        config.grid_mode.box_mode,
        config.grid_mode.bin_mode,
        config.grid_mode.follow_enable
    );

    let adapter: Arc<dyn ExchangeAdapter> = if shadow_mode() {
        log::info!("running in shadow mode (simulated fills, no live orders)");
        Arc::new(SimAdapter::new(
            config.risk.initial_balance_usd.unwrap_or(10_000.0),
            config.grid.price_tick,
            0.0002,
            0.0005,
        ))
    } else {
        log::warn!("no live exchange wire protocol configured; every order will fail");
        Arc::new(UnconfiguredAdapter)
    };

    let monitor = Arc::new(PositionMonitor::new(config.risk.clone()));

    let schedule = if config.schedule.enabled {
        Some(ScheduleManager::new(config.schedule.schedule_type.clone()))
    } else {
        None
    };

    let logger = TradeLogger::new("logs", config.account_id.clone());

    spawn_monitor_feed(adapter.clone(), monitor.clone(), config.symbol.clone(), config.poll_interval_sec);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("shutdown signal received, finishing current tick");
                running.store(false, Ordering::SeqCst);
            }
        });
    }

    let mut controller = GridController::new(config, adapter, monitor, schedule, logger);
    controller.run(running).await;

    log::info!("controller stopped");
}

/// Polls price/position/balance and feeds `PositionMonitor`, the "streamed"
/// source the controller's price-fetch step prefers. The adapter contract
/// doesn't distinguish push vs. poll transport, so this is a faithful
/// stand-in for a venue that streams over a WebSocket.
fn spawn_monitor_feed(adapter: Arc<dyn ExchangeAdapter>, monitor: Arc<PositionMonitor>, symbol: String, interval_sec: f64) {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs_f64(interval_sec.max(1.5));
        loop {
            if let Ok(price) = adapter.ticker(&symbol).await {
                monitor.on_ticker(price);
            }
            if let Ok(positions) = adapter.list_positions().await {
                monitor.on_positions(&positions);
            }
            if let Ok(balance) = adapter.balance().await {
                monitor.on_balance(balance);
            }
            tokio::time::sleep(interval).await;
        }
    });
}
