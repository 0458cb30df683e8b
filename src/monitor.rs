use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::RiskConfig;
use crate::types::{Position, PositionSide};

/// A single-producer/single-consumer one-shot flag: the monitor task sets
/// it, the controller task clears it after handling.
#[derive(Debug, Default)]
pub struct Latch(AtomicBool);

impl Latch {
    pub fn set_if_unset(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct TriggerFlags {
    pub position_loss_cut: Latch,
    pub position_take_profit: Latch,
    pub balance_recovery: Latch,
    pub asset_loss_cut: Latch,
    pub asset_take_profit: Latch,
}

/// Derived aggregate computed fresh on every position/ticker event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregates {
    pub net_size: f64,
    pub avg_entry: f64,
    pub unrealized_pnl: f64,
    pub position_value: f64,
    pub pnl_pct: f64,
    pub side: PositionSideTag,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PositionSideTag {
    #[default]
    Flat,
    Long,
    Short,
}

impl From<PositionSideTag> for PositionSide {
    fn from(tag: PositionSideTag) -> PositionSide {
        match tag {
            PositionSideTag::Flat => PositionSide::Flat,
            PositionSideTag::Long => PositionSide::Long,
            PositionSideTag::Short => PositionSide::Short,
        }
    }
}

const FLAT_EPSILON: f64 = 1e-4;

/// Consumes price/position/balance events, maintains derived aggregates, and
/// raises the five latched trigger flags. Owned exclusively by the monitor
/// task; the controller only reads through the shared accessors.
pub struct PositionMonitor {
    risk: RiskConfig,
    last_price: Mutex<f64>,
    current_balance: Mutex<f64>,
    aggregates: Mutex<Aggregates>,
    initial_asset: Mutex<Option<f64>>,
    initial_balance_bits: AtomicU64,
    pub flags: TriggerFlags,
}

impl PositionMonitor {
    pub fn new(risk: RiskConfig) -> Self {
        let initial_balance_bits = risk.initial_balance_usd.unwrap_or(0.0).to_bits();
        Self {
            risk,
            last_price: Mutex::new(0.0),
            current_balance: Mutex::new(0.0),
            aggregates: Mutex::new(Aggregates::default()),
            initial_asset: Mutex::new(None),
            initial_balance_bits: AtomicU64::new(initial_balance_bits),
            flags: TriggerFlags::default(),
        }
    }

    pub fn last_price(&self) -> f64 {
        *self.last_price.lock().unwrap()
    }

    pub fn current_balance(&self) -> f64 {
        *self.current_balance.lock().unwrap()
    }

    pub fn aggregates(&self) -> Aggregates {
        *self.aggregates.lock().unwrap()
    }

    pub fn initial_asset(&self) -> Option<f64> {
        *self.initial_asset.lock().unwrap()
    }

    /// Only the controller, after finalizing an emergency wind-down, may
    /// rewrite `initial_asset`.
    pub fn reset_initial_asset(&self, value: f64) {
        *self.initial_asset.lock().unwrap() = Some(value);
    }

    pub fn on_ticker(&self, price: f64) {
        *self.last_price.lock().unwrap() = price;
        self.recompute();
        self.evaluate_triggers();
    }

    pub fn on_positions(&self, positions: &[Position]) {
        let net_size: f64 = positions.iter().map(|p| p.signed_size).sum();
        let abs_value: f64 = positions.iter().map(|p| p.open_value.abs()).sum();
        let abs_size: f64 = positions.iter().map(|p| p.signed_size.abs()).sum();
        let avg_entry = if abs_size > 0.0 { abs_value / abs_size } else { 0.0 };

        {
            let mut agg = self.aggregates.lock().unwrap();
            agg.net_size = net_size;
            agg.avg_entry = avg_entry;
        }
        self.recompute();
        self.evaluate_triggers();
    }

    pub fn on_balance(&self, balance: f64) {
        let equity = self.total_equity(balance);
        *self.current_balance.lock().unwrap() = equity;

        if self.risk.asset_losscut_pct.is_some() || self.risk.asset_take_profit_pct.is_some() {
            let mut initial = self.initial_asset.lock().unwrap();
            if initial.is_none() {
                *initial = Some(equity);
                log::info!("initial_asset set: {:.2}", equity);
            }
        }
        self.recompute();
        self.evaluate_triggers();
    }

    fn recompute(&self) {
        let last_price = self.last_price();
        let mut agg = self.aggregates.lock().unwrap();
        if agg.net_size.abs() < FLAT_EPSILON {
            agg.side = PositionSideTag::Flat;
            agg.unrealized_pnl = 0.0;
            agg.position_value = 0.0;
            agg.pnl_pct = 0.0;
            return;
        }
        agg.side = if agg.net_size > 0.0 {
            PositionSideTag::Long
        } else {
            PositionSideTag::Short
        };
        let abs_size = agg.net_size.abs();
        agg.unrealized_pnl = match agg.side {
            PositionSideTag::Long => (last_price - agg.avg_entry) * abs_size,
            _ => (agg.avg_entry - last_price) * abs_size,
        };
        agg.position_value = agg.avg_entry * abs_size;
        agg.pnl_pct = if agg.position_value > 0.0 {
            (agg.unrealized_pnl / agg.position_value) * 100.0 * self.risk.leverage
        } else {
            0.0
        };
    }

    /// Normalizes the adapter's reported available collateral to total
    /// equity, undoing the venue convention of reporting margin net of open
    /// notional.
    pub fn total_equity(&self, reported_balance: f64) -> f64 {
        let agg = self.aggregates();
        match agg.side {
            PositionSideTag::Long => reported_balance + agg.position_value,
            PositionSideTag::Short => reported_balance - agg.position_value,
            PositionSideTag::Flat => reported_balance,
        }
    }

    fn evaluate_triggers(&self) {
        let agg = self.aggregates();
        let balance = self.current_balance();

        if let Some(plcp) = self.risk.position_losscut_pct {
            if agg.pnl_pct <= -plcp.abs() {
                self.flags.position_loss_cut.set_if_unset();
            }
        }
        if let Some(ptpp) = self.risk.position_take_profit_pct {
            if agg.pnl_pct >= ptpp.abs() {
                self.flags.position_take_profit.set_if_unset();
            }
        }
        if self.risk.balance_recovery_enabled {
            if let Some(enforce_level) = self.risk.recovery_enforce_level_usd {
                let initial_balance = f64::from_bits(self.initial_balance_bits.load(Ordering::SeqCst));
                let drawdown = initial_balance - balance;
                if drawdown >= enforce_level && balance + agg.unrealized_pnl >= initial_balance {
                    self.flags.balance_recovery.set_if_unset();
                }
            }
        }

        if let Some(initial_asset) = self.initial_asset() {
            if initial_asset > 0.0 {
                let total_asset = balance + agg.unrealized_pnl;
                let change_pct = (total_asset - initial_asset) / initial_asset * 100.0;
                if let Some(alcp) = self.risk.asset_losscut_pct {
                    if change_pct <= -alcp.abs() {
                        self.flags.asset_loss_cut.set_if_unset();
                    }
                }
                if let Some(atpp) = self.risk.asset_take_profit_pct {
                    if change_pct >= atpp.abs() {
                        self.flags.asset_take_profit.set_if_unset();
                    }
                }
            }
        }

        if agg.side == PositionSideTag::Flat {
            self.flags.position_loss_cut.clear();
            self.flags.balance_recovery.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk_with(plcp: Option<f64>, leverage: f64) -> RiskConfig {
        RiskConfig {
            position_losscut_pct: plcp,
            position_take_profit_pct: None,
            asset_losscut_pct: None,
            asset_take_profit_pct: None,
            balance_recovery_enabled: false,
            initial_balance_usd: None,
            recovery_enforce_level_usd: None,
            leverage,
            size_limit: None,
        }
    }

    #[test]
    fn position_loss_cut_raises_on_threshold() {
        let monitor = PositionMonitor::new(risk_with(Some(5.0), 10.0));
        monitor.on_positions(&[Position {
            signed_size: 1.0,
            open_value: 100.0,
        }]);
        monitor.on_ticker(95.5);
        let agg = monitor.aggregates();
        assert!((agg.pnl_pct - (-45.0)).abs() < 1e-9);
        assert!(monitor.flags.position_loss_cut.is_set());
    }

    #[test]
    fn long_pnl_sign_matches_price_direction() {
        let monitor = PositionMonitor::new(risk_with(None, 1.0));
        monitor.on_positions(&[Position {
            signed_size: 1.0,
            open_value: 100.0,
        }]);
        monitor.on_ticker(110.0);
        assert!(monitor.aggregates().unrealized_pnl > 0.0);
        monitor.on_ticker(90.0);
        assert!(monitor.aggregates().unrealized_pnl < 0.0);
    }

    #[test]
    fn flat_autoclears_loss_cut_and_recovery() {
        let monitor = PositionMonitor::new(risk_with(Some(1.0), 10.0));
        monitor.on_positions(&[Position {
            signed_size: 1.0,
            open_value: 100.0,
        }]);
        monitor.on_ticker(50.0);
        assert!(monitor.flags.position_loss_cut.is_set());
        monitor.on_positions(&[]);
        assert!(!monitor.flags.position_loss_cut.is_set());
    }

    #[test]
    fn on_balance_normalizes_reported_collateral_to_equity() {
        let monitor = PositionMonitor::new(risk_with(None, 1.0));
        monitor.on_positions(&[Position {
            signed_size: 1.0,
            open_value: 100.0,
        }]);
        monitor.on_ticker(100.0); // position_value = avg_entry * abs_size = 100
        monitor.on_balance(50.0); // reported margin net of the open notional
        assert!((monitor.current_balance() - 150.0).abs() < 1e-9);
    }

    #[test]
    fn asset_take_profit_uses_initial_asset_baseline() {
        let mut risk = risk_with(None, 1.0);
        risk.asset_take_profit_pct = Some(2.0);
        let monitor = PositionMonitor::new(risk);
        monitor.on_balance(1000.0);
        monitor.on_positions(&[Position {
            signed_size: 1.0,
            open_value: 100.0,
        }]);
        monitor.on_ticker(110.0); // sets unrealized_pnl = +10
        monitor.on_balance(1015.0);
        assert!(monitor.flags.asset_take_profit.is_set());
    }
}
