use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Config, OutOfScheduleAction};
use crate::exchange::{ExchangeAdapter, TimeInForce};
use crate::mirror;
use crate::monitor::{PositionMonitor, PositionSideTag};
use crate::planner::{GridPlanner, PlanOp};
use crate::risk::ReduceOnlyGate;
use crate::schedule::ScheduleManager;
use crate::trade_log::TradeLogger;
use crate::types::{LocalMirror, OpenOrder, Price, PositionSide, Side};

#[derive(Debug, Clone, Copy)]
enum EmergencyReason {
    PositionLossCut,
    PositionTakeProfit,
    BalanceRecovery,
    AssetLossCut,
    AssetTakeProfit,
}

impl EmergencyReason {
    fn label(self) -> &'static str {
        match self {
            EmergencyReason::PositionLossCut => "position_loss_cut",
            EmergencyReason::PositionTakeProfit => "position_take_profit",
            EmergencyReason::BalanceRecovery => "balance_recovery",
            EmergencyReason::AssetLossCut => "asset_loss_cut",
            EmergencyReason::AssetTakeProfit => "asset_take_profit",
        }
    }

    fn is_asset_based(self) -> bool {
        matches!(self, EmergencyReason::AssetLossCut | EmergencyReason::AssetTakeProfit)
    }

    fn clear(self, monitor: &PositionMonitor) {
        match self {
            EmergencyReason::PositionLossCut => monitor.flags.position_loss_cut.clear(),
            EmergencyReason::PositionTakeProfit => monitor.flags.position_take_profit.clear(),
            EmergencyReason::BalanceRecovery => monitor.flags.balance_recovery.clear(),
            EmergencyReason::AssetLossCut => monitor.flags.asset_loss_cut.clear(),
            EmergencyReason::AssetTakeProfit => monitor.flags.asset_take_profit.clear(),
        }
    }
}

const MIRROR_MAX_AGE: Duration = Duration::from_secs(3600);
const SELF_CROSS_WINDOW: Duration = Duration::from_secs(3600);
const EMERGENCY_CANCEL_SPACING: Duration = Duration::from_millis(100);
const EMERGENCY_SETTLE_WAIT: Duration = Duration::from_secs(2);
const EMERGENCY_COOLDOWN: Duration = Duration::from_secs(30);
const SCHEDULE_EXIT_WAIT: Duration = Duration::from_secs(60);
const REDUCE_SWEEP_SPACING: Duration = Duration::from_millis(50);

/// Drives the grid for one symbol: gate on schedule, check emergencies, fetch
/// price, reconcile the mirror against the exchange, run the active
/// planner, replenish fills, and sweep unmanaged orders. One instance owns
/// its `LocalMirror` and cached snapshot exclusively; nothing else mutates
/// them. Grounded on the teacher's tick-based `loop { sleep; ... }` main
/// loop shape in `main.rs`, restructured around the ten-step sequence this
/// domain requires.
pub struct GridController {
    config: Config,
    adapter: Arc<dyn ExchangeAdapter>,
    monitor: Arc<PositionMonitor>,
    schedule: Option<ScheduleManager>,
    planner: GridPlanner,
    reduce_gate: ReduceOnlyGate,
    logger: TradeLogger,
    mirror: LocalMirror,
    cached_snapshot: Vec<OpenOrder>,
    tick: u64,
    last_mirror_clear: Instant,
    self_cross_skips: VecDeque<Instant>,
    schedule_was_active: Option<bool>,
}

impl GridController {
    pub fn new(
        config: Config,
        adapter: Arc<dyn ExchangeAdapter>,
        monitor: Arc<PositionMonitor>,
        schedule: Option<ScheduleManager>,
        logger: TradeLogger,
    ) -> Self {
        let planner = GridPlanner::new(config.grid, config.grid_mode);
        let reduce_gate = ReduceOnlyGate::new(config.risk.size_limit);
        Self {
            config,
            adapter,
            monitor,
            schedule,
            planner,
            reduce_gate,
            logger,
            mirror: LocalMirror::new(),
            cached_snapshot: Vec::new(),
            tick: 0,
            last_mirror_clear: Instant::now(),
            self_cross_skips: VecDeque::new(),
            schedule_was_active: None,
        }
    }

    /// Runs until `running` is cleared. The current tick always finishes
    /// before the loop exits; the caller is responsible for calling
    /// `adapter.close()`-equivalent cleanup once this returns.
    pub async fn run(&mut self, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            self.tick += 1;
            self.periodic_maintenance();

            if self.schedule_gate().await {
                continue;
            }

            if let Some(reason) = self.first_emergency() {
                self.run_emergency(reason).await;
                continue;
            }

            let mid = match self.fetch_price().await {
                Some(p) => p,
                None => {
                    self.sleep_poll_interval().await;
                    continue;
                }
            };

            self.refresh_snapshot().await;

            if self.tick % self.config.grid.active_sync_every.max(1) == 0 {
                mirror::rebuild_from_snapshot(&mut self.mirror, &self.cached_snapshot);
            }

            self.reevaluate_reduce_gate().await;

            let position_side = self.monitor.aggregates().side.into();
            let plan_ops = self.planner.plan(mid, &self.mirror, position_side);
            self.apply_ops(plan_ops).await;

            let (filled_buys, filled_sells) = mirror::detect_fills(&self.mirror, &self.cached_snapshot);
            if !filled_buys.is_empty() || !filled_sells.is_empty() {
                let replenish_ops = self.planner.anchor_replenish(&self.mirror, &filled_buys, &filled_sells);
                mirror::remove_filled(&mut self.mirror, &filled_buys, &filled_sells);
                self.apply_ops(replenish_ops).await;
            }

            if self.config.grid.enforce_levels {
                self.cleanup_unmanaged().await;
            }

            self.sleep_poll_interval().await;
        }
    }

    fn periodic_maintenance(&mut self) {
        if self.last_mirror_clear.elapsed() >= MIRROR_MAX_AGE {
            self.mirror.clear();
            self.cached_snapshot.clear();
            self.last_mirror_clear = Instant::now();
            log::info!("mirror force-cleared after max age");
        }
        let cutoff = Instant::now() - SELF_CROSS_WINDOW;
        while matches!(self.self_cross_skips.front(), Some(t) if *t < cutoff) {
            self.self_cross_skips.pop_front();
        }
        let threshold = 3 * self.config.grid.levels;
        if self.self_cross_skips.len() >= threshold {
            self.mirror.clear();
            self.cached_snapshot.clear();
            self.self_cross_skips.clear();
            log::warn!("mirror force-cleared after {} self-cross skips in one hour", threshold);
        }
    }

    /// Returns true if the tick should `continue` without running the rest
    /// of the loop body (schedule disabled or just transitioned off).
    async fn schedule_gate(&mut self) -> bool {
        let Some(schedule) = &self.schedule else { return false };
        if !self.config.schedule.enabled {
            return false;
        }
        schedule.fetch_schedule(false).await;
        let active = schedule.is_active().await;

        match self.schedule_was_active {
            Some(false) if active => log::info!("schedule activated"),
            Some(true) if !active => {
                log::info!("schedule deactivated, running exit procedure");
                self.run_schedule_exit().await;
            }
            _ => {}
        }
        self.schedule_was_active = Some(active);

        if !active {
            self.sleep_poll_interval().await;
            return true;
        }
        false
    }

    async fn run_schedule_exit(&mut self) {
        if let Ok(open) = self.adapter.list_open(&self.config.symbol).await {
            for o in &open {
                let _ = self.adapter.cancel(&self.config.symbol, &o.order_id).await;
            }
        }
        self.mirror.clear();

        match self.config.schedule.out_of_schedule_action {
            OutOfScheduleAction::Nothing => {}
            OutOfScheduleAction::Immediately => {
                let _ = self.adapter.flatten(&self.config.symbol).await;
            }
            OutOfScheduleAction::Auto => self.schedule_exit_auto_close().await,
        }
    }

    async fn schedule_exit_auto_close(&mut self) {
        let agg = self.monitor.aggregates();
        if agg.side == PositionSideTag::Flat {
            return;
        }
        let mid = self.monitor.last_price();
        let tick = self.config.grid.price_tick;
        let (side, price) = match agg.side {
            PositionSideTag::Long => (Side::Sell, Price::quantize(mid + 5.0, tick, Side::Sell)),
            PositionSideTag::Short => (Side::Buy, Price::quantize(mid - 5.0, tick, Side::Buy)),
            PositionSideTag::Flat => return,
        };
        let size = agg.net_size.abs();
        let order_id = match self
            .adapter
            .place_limit(&self.config.symbol, side, price, size, TimeInForce::GoodTilCancel)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                log::warn!("schedule exit close order failed: {}", e);
                return;
            }
        };
        tokio::time::sleep(SCHEDULE_EXIT_WAIT).await;
        let still_open = self
            .adapter
            .list_open(&self.config.symbol)
            .await
            .map(|snap| snap.iter().any(|o| o.order_id == order_id))
            .unwrap_or(false);
        if still_open {
            let _ = self.adapter.cancel(&self.config.symbol, &order_id).await;
            let _ = self.adapter.flatten(&self.config.symbol).await;
        }
    }

    fn first_emergency(&self) -> Option<EmergencyReason> {
        let flags = &self.monitor.flags;
        if flags.position_loss_cut.is_set() {
            Some(EmergencyReason::PositionLossCut)
        } else if flags.position_take_profit.is_set() {
            Some(EmergencyReason::PositionTakeProfit)
        } else if flags.balance_recovery.is_set() {
            Some(EmergencyReason::BalanceRecovery)
        } else if flags.asset_loss_cut.is_set() {
            Some(EmergencyReason::AssetLossCut)
        } else if flags.asset_take_profit.is_set() {
            Some(EmergencyReason::AssetTakeProfit)
        } else {
            None
        }
    }

    async fn run_emergency(&mut self, reason: EmergencyReason) {
        log::warn!("emergency procedure: {}", reason.label());
        self.logger.log_event("EMERGENCY_START", &self.config.symbol, reason.label());

        let _ = self.adapter.flatten(&self.config.symbol).await;

        if let Ok(open) = self.adapter.list_open(&self.config.symbol).await {
            for o in &open {
                let _ = self.adapter.cancel(&self.config.symbol, &o.order_id).await;
                tokio::time::sleep(EMERGENCY_CANCEL_SPACING).await;
            }
        }
        self.mirror.clear();
        self.cached_snapshot.clear();

        tokio::time::sleep(EMERGENCY_SETTLE_WAIT).await;
        let _ = self.adapter.flatten(&self.config.symbol).await;

        reason.clear(&self.monitor);
        if reason.is_asset_based() {
            if let Ok(balance) = self.adapter.balance().await {
                self.monitor.reset_initial_asset(balance);
            }
        }
        self.logger.log_event("EMERGENCY_END", &self.config.symbol, reason.label());

        tokio::time::sleep(EMERGENCY_COOLDOWN).await;
    }

    async fn fetch_price(&self) -> Option<f64> {
        let streamed = self.monitor.last_price();
        if streamed > 0.0 {
            return Some(streamed);
        }
        self.adapter.ticker(&self.config.symbol).await.ok()
    }

    async fn refresh_snapshot(&mut self) {
        match self.adapter.list_open(&self.config.symbol).await {
            Ok(snapshot) => self.cached_snapshot = snapshot,
            Err(e) => log::warn!("list_open failed, reusing cached snapshot: {}", e),
        }
    }

    async fn reevaluate_reduce_gate(&mut self) {
        let agg = self.monitor.aggregates();
        let total_asset = self.monitor.initial_asset().unwrap_or_else(|| self.monitor.current_balance());
        let price = self.monitor.last_price();
        let was_active = self.reduce_gate.is_active();
        self.reduce_gate.evaluate(agg.net_size, price, total_asset);
        if !was_active && self.reduce_gate.is_active() {
            self.reduce_only_sweep(agg.side).await;
        }
    }

    /// The schedule-driven size scalar (spec's one in-scope sizing
    /// mechanism): 1.0 when no schedule is configured, otherwise the active
    /// entry's `lot_coefficient`.
    async fn size_multiplier(&self) -> f64 {
        match &self.schedule {
            Some(schedule) if self.config.schedule.enabled => schedule.lot_coefficient().await,
            _ => 1.0,
        }
    }

    async fn reduce_only_sweep(&mut self, side: PositionSideTag) {
        let sweep_side = match side {
            PositionSideTag::Long => Side::Buy,
            PositionSideTag::Short => Side::Sell,
            PositionSideTag::Flat => return,
        };
        let prices: Vec<Price> = self.mirror.side_map(sweep_side).keys().copied().collect();
        for price in prices {
            self.cancel_checked(sweep_side, price, REDUCE_SWEEP_SPACING).await;
        }
    }

    async fn apply_ops(&mut self, ops: Vec<PlanOp>) {
        let spacing = Duration::from_secs_f64(self.config.grid.op_spacing_sec.max(0.0));
        for op in ops.iter() {
            if let PlanOp::Cancel { side, price } = op {
                self.cancel_checked(*side, *price, spacing).await;
            }
        }
        let size = self.config.grid.base_size * self.size_multiplier().await;
        for op in ops.iter() {
            if let PlanOp::Place { side, price } = op {
                self.place_checked(*side, *price, size, spacing).await;
            }
        }
    }

    async fn cancel_checked(&mut self, side: Side, price: Price, spacing: Duration) {
        let Some(order_id) = self.mirror.side_map(side).get(&price).cloned() else {
            return;
        };
        match self.adapter.cancel(&self.config.symbol, &order_id).await {
            Ok(()) => {
                self.mirror.side_map_mut(side).remove(&price);
                self.logger
                    .log_order("CANCEL", &self.config.symbol, side, price, self.config.grid.price_tick, 0.0, &order_id, "");
            }
            Err(e) => log::warn!("cancel failed for {} {:?}: {}", side, price, e),
        }
        tokio::time::sleep(spacing).await;
    }

    async fn place_checked(&mut self, side: Side, price: Price, size: f64, spacing: Duration) {
        if mirror::would_self_cross(&self.mirror, side, price) {
            self.self_cross_skips.push_back(Instant::now());
            return;
        }
        let net_size = self.monitor.aggregates().net_size;
        if !self.reduce_gate.allows(side, net_size) {
            return;
        }
        match self
            .adapter
            .place_limit(&self.config.symbol, side, price, size, TimeInForce::GoodTilCancel)
            .await
        {
            Ok(order_id) => {
                self.mirror.side_map_mut(side).insert(price, order_id.clone());
                self.logger
                    .log_order("PLACE", &self.config.symbol, side, price, self.config.grid.price_tick, size, &order_id, "");
            }
            Err(e) => log::warn!("place failed for {} {:?}: {}", side, price, e),
        }
        tokio::time::sleep(spacing).await;
    }

    async fn cleanup_unmanaged(&mut self) {
        let unmanaged = mirror::unmanaged_order_ids(&self.mirror, &self.cached_snapshot);
        let spacing = Duration::from_secs_f64(self.config.grid.op_spacing_sec.max(0.0));
        for order_id in unmanaged.into_iter().take(3) {
            if self.adapter.cancel(&self.config.symbol, &order_id).await.is_ok() {
                self.logger.log_event("UNMANAGED_CANCEL", &self.config.symbol, &order_id);
            }
            tokio::time::sleep(spacing).await;
        }
    }

    async fn sleep_poll_interval(&self) {
        let secs = self.config.poll_interval_sec.max(1.5);
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GridModeConfig, RiskConfig, ScheduleConfig};
    use crate::exchange::SimAdapter;
    use crate::types::GridParams;

    fn test_config() -> Config {
        Config {
            base_url: "https://example.invalid".to_string(),
            account_id: "acct".to_string(),
            stark_private_key: "key".to_string(),
            symbol: "BTCUSD".to_string(),
            poll_interval_sec: 1.5,
            grid: GridParams {
                price_tick: 0.1,
                step_usd: 50.0,
                first_offset_usd: 100.0,
                levels: 2,
                base_size: 0.01,
                op_spacing_sec: 0.0,
                max_new_per_loop: 0,
                enforce_levels: true,
                active_sync_every: 1,
                follow_slack_steps: 1,
                max_shift_per_loop: 1,
            },
            grid_mode: GridModeConfig {
                box_mode: true,
                bin_mode: false,
                follow_enable: false,
            },
            risk: RiskConfig {
                position_losscut_pct: None,
                position_take_profit_pct: None,
                asset_losscut_pct: None,
                asset_take_profit_pct: None,
                balance_recovery_enabled: false,
                initial_balance_usd: None,
                recovery_enforce_level_usd: None,
                leverage: 1.0,
                size_limit: None,
            },
            schedule: ScheduleConfig {
                enabled: false,
                schedule_type: "normal".to_string(),
                out_of_schedule_action: OutOfScheduleAction::Auto,
            },
        }
    }

    #[tokio::test]
    async fn first_tick_places_initial_box_grid() {
        let config = test_config();
        let sim = Arc::new(SimAdapter::new(10_000.0, 0.1, 0.0002, 0.0005));
        sim.set_mid(10_000.0);
        let monitor = Arc::new(PositionMonitor::new(config.risk.clone()));
        monitor.on_ticker(10_000.0);
        let logger = TradeLogger::new(std::env::temp_dir().join("controller_test_logs"), "acct".to_string());
        let mut controller = GridController::new(config, sim.clone(), monitor, None, logger);

        controller.refresh_snapshot().await;
        let ops = controller.planner.plan(10_000.0, &controller.mirror, PositionSide::Flat);
        controller.apply_ops(ops).await;

        let open = sim.list_open("BTCUSD").await.unwrap();
        assert_eq!(open.len(), 4);
    }

    #[tokio::test]
    async fn self_cross_skip_is_recorded() {
        let config = test_config();
        let sim = Arc::new(SimAdapter::new(10_000.0, 0.1, 0.0002, 0.0005));
        sim.set_mid(10_000.0);
        let monitor = Arc::new(PositionMonitor::new(config.risk.clone()));
        let logger = TradeLogger::new(std::env::temp_dir().join("controller_test_logs2"), "acct".to_string());
        let mut controller = GridController::new(config, sim, monitor, None, logger);
        controller.mirror.sells.insert(Price(100000), "sell1".to_string());

        controller.place_checked(Side::Buy, Price(100000), 0.01, Duration::from_millis(0)).await;
        assert_eq!(controller.self_cross_skips.len(), 1);
    }
}
