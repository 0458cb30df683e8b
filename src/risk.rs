use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::SizeLimit;
use crate::types::Side;

/// Gates new same-direction order placement once the position crosses a
/// configured size limit, releasing only after it falls back under a lower
/// threshold. Mirrors the teacher's `RiskManager` circuit-breaker shape
/// (latch-until-hysteresis-clears) applied to position size rather than
/// drawdown.
pub struct ReduceOnlyGate {
    limit: Option<SizeLimit>,
    active: AtomicBool,
}

impl ReduceOnlyGate {
    pub fn new(limit: Option<SizeLimit>) -> Self {
        Self {
            limit,
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Recomputes the reduce-only latch from the current net position size
    /// and, for ratio limits, notional (`price * size`) over the current
    /// total asset value. Call on every position/balance/price update.
    pub fn evaluate(&self, net_size: f64, price: f64, total_asset: f64) {
        let Some(limit) = self.limit else { return };
        let magnitude = net_size.abs();

        let (enter, release) = match limit {
            SizeLimit::Absolute { limit, release } => (magnitude >= limit, magnitude <= release),
            SizeLimit::Ratio { limit, release } => {
                if total_asset <= 0.0 {
                    return;
                }
                let notional = magnitude * price;
                let ratio = notional / total_asset;
                (ratio >= limit, ratio <= release)
            }
        };

        if enter && !self.active.load(Ordering::SeqCst) {
            self.active.store(true, Ordering::SeqCst);
            log::warn!("reduce-only mode engaged: position size {:.6}", magnitude);
        } else if release && self.active.load(Ordering::SeqCst) {
            self.active.store(false, Ordering::SeqCst);
            log::info!("reduce-only mode released: position size {:.6}", magnitude);
        }
    }

    /// While active, an order is allowed only if it would reduce the
    /// magnitude of the existing position: a BUY while net short, or a SELL
    /// while net long. Orders on a flat book are always allowed through
    /// (reduce-only has nothing to reduce).
    pub fn allows(&self, side: Side, net_size: f64) -> bool {
        if !self.is_active() {
            return true;
        }
        match side {
            Side::Buy => net_size < 0.0,
            Side::Sell => net_size > 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_limit_engages_and_releases() {
        let gate = ReduceOnlyGate::new(Some(SizeLimit::Absolute {
            limit: 1.0,
            release: 0.8,
        }));
        gate.evaluate(0.5, 0.0, 0.0);
        assert!(!gate.is_active());
        gate.evaluate(1.0, 0.0, 0.0);
        assert!(gate.is_active());
        gate.evaluate(0.9, 0.0, 0.0);
        assert!(gate.is_active());
        gate.evaluate(0.7, 0.0, 0.0);
        assert!(!gate.is_active());
    }

    #[test]
    fn ratio_limit_uses_notional_over_total_asset() {
        let gate = ReduceOnlyGate::new(Some(SizeLimit::Ratio {
            limit: 0.5,
            release: 0.3,
        }));
        // price=100, size=0.4 -> notional=40, ratio=0.4 against a 100 baseline.
        gate.evaluate(0.4, 100.0, 100.0);
        assert!(!gate.is_active());
        // price=100, size=0.6 -> notional=60, ratio=0.6, crosses the 0.5 limit.
        gate.evaluate(0.6, 100.0, 100.0);
        assert!(gate.is_active());
    }

    #[test]
    fn active_gate_blocks_same_direction_only() {
        let gate = ReduceOnlyGate::new(Some(SizeLimit::Absolute {
            limit: 1.0,
            release: 0.8,
        }));
        gate.evaluate(1.0, 0.0, 0.0); // net long 1.0
        assert!(!gate.allows(Side::Buy, 1.0));
        assert!(gate.allows(Side::Sell, 1.0));
    }

    #[test]
    fn no_limit_always_allows() {
        let gate = ReduceOnlyGate::new(None);
        gate.evaluate(1000.0, 0.0, 0.0);
        assert!(gate.allows(Side::Buy, 1000.0));
    }
}
