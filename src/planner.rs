use std::collections::BTreeSet;

use crate::config::GridModeConfig;
use crate::types::{GridMode, GridParams, LocalMirror, Price, PositionSide, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOp {
    Cancel { side: Side, price: Price },
    Place { side: Side, price: Price },
}

fn price_to_ticks(price: f64, tick: f64) -> i64 {
    (price / tick).round() as i64
}

fn floor_div(a: i64, b: i64) -> i64 {
    a.div_euclid(b)
}

fn ceil_div(a: i64, b: i64) -> i64 {
    -(-a).div_euclid(b)
}

fn has_min_gap(side_set: &BTreeSet<i64>, px: i64, min_gap: i64) -> bool {
    side_set.iter().all(|&v| (v - px).abs() >= min_gap)
}

/// Round-half-to-even, matching Python's `round()` used for BIN center.
fn round_half_even(x: f64) -> i64 {
    let floor = x.floor();
    let diff = x - floor;
    let f = floor as i64;
    if diff < 0.5 {
        f
    } else if diff > 0.5 {
        f + 1
    } else if f % 2 == 0 {
        f
    } else {
        f + 1
    }
}

/// Interleaves two place-op sequences, starting from `first`, so a
/// rate-limit-curtailed loop never starves the second side.
fn interleave(first: Vec<PlanOp>, second: Vec<PlanOp>) -> Vec<PlanOp> {
    let mut out = Vec::with_capacity(first.len() + second.len());
    let mut a = first.into_iter();
    let mut b = second.into_iter();
    loop {
        let x = a.next();
        let y = b.next();
        if x.is_none() && y.is_none() {
            break;
        }
        if let Some(op) = x {
            out.push(op);
        }
        if let Some(op) = y {
            out.push(op);
        }
    }
    out
}

/// Decides the resting-order lattice for one side of the book. Owns no
/// network state; `GridController` applies the `PlanOp`s it returns and
/// keeps the authoritative mirror up to date.
///
/// Grounded directly on `grid_engine.py::_ensure_grid`'s three branches,
/// translated from the original's float arithmetic into tick-integer math
/// so the lattice can never drift under repeated re-quantization.
pub struct GridPlanner {
    params: GridParams,
    mode: GridModeConfig,
    bin_center_units: Option<i64>,
}

impl GridPlanner {
    pub fn new(params: GridParams, mode: GridModeConfig) -> Self {
        Self {
            params,
            mode,
            bin_center_units: None,
        }
    }

    /// BOX > BIN > follow, matching the original's branch order: box_mode is
    /// checked first and returns unconditionally, then bin_mode, then the
    /// legacy anchored/follow path.
    pub fn active_mode(&self) -> GridMode {
        if self.mode.box_mode {
            GridMode::Box
        } else if self.mode.bin_mode {
            GridMode::Bin
        } else {
            GridMode::Follow
        }
    }

    pub fn plan(&mut self, mid: f64, mirror: &LocalMirror, position_side: PositionSide) -> Vec<PlanOp> {
        if self.params.levels == 0 {
            return Vec::new();
        }
        match self.active_mode() {
            GridMode::Box => self.plan_box(mid, mirror, position_side),
            GridMode::Bin => self.plan_bin(mid, mirror),
            GridMode::Follow => self.plan_follow(mid, mirror),
        }
    }

    fn plan_box(&self, mid: f64, mirror: &LocalMirror, position_side: PositionSide) -> Vec<PlanOp> {
        let tick = self.params.price_tick;
        let s = self.params.step_ticks();
        let x = self.params.first_offset_ticks();
        let tol = self.params.tolerance_ticks();
        let p = price_to_ticks(mid, tick);
        let levels = self.params.levels as i64;

        let buy_start = floor_div(p - x, s) * s;
        let buy_targets: Vec<i64> = (0..levels)
            .map(|i| buy_start - i * s)
            .filter(|&t| t > 0 && t < p)
            .collect();

        let sell_start = ceil_div(p + x, s) * s;
        let sell_targets: Vec<i64> = (0..levels).map(|i| sell_start + i * s).filter(|&t| t > p).collect();

        let near_any = |v: i64, targets: &[i64]| targets.iter().any(|&t| (v - t).abs() <= tol);

        let inner_buy_border = p - x;
        let inner_sell_border = p + x;

        let current_buys: Vec<i64> = mirror.buys.keys().map(|pr| pr.0).collect();
        let current_sells: Vec<i64> = mirror.sells.keys().map(|pr| pr.0).collect();

        let keep_buys: Vec<i64> = current_buys
            .iter()
            .copied()
            .filter(|&v| near_any(v, &buy_targets) || v >= inner_buy_border - tol)
            .collect();
        let keep_sells: Vec<i64> = current_sells
            .iter()
            .copied()
            .filter(|&v| near_any(v, &sell_targets) || v <= inner_sell_border + tol)
            .collect();

        let mut ops = Vec::new();
        for &v in &current_buys {
            if !keep_buys.contains(&v) {
                ops.push(PlanOp::Cancel { side: Side::Buy, price: Price(v) });
            }
        }
        for &v in &current_sells {
            if !keep_sells.contains(&v) {
                ops.push(PlanOp::Cancel { side: Side::Sell, price: Price(v) });
            }
        }
        let buy_places: Vec<PlanOp> = buy_targets
            .iter()
            .filter(|&&t| !keep_buys.iter().any(|&v| (v - t).abs() <= tol))
            .map(|&t| PlanOp::Place { side: Side::Buy, price: Price(t) })
            .collect();
        let sell_places: Vec<PlanOp> = sell_targets
            .iter()
            .filter(|&&t| !keep_sells.iter().any(|&v| (v - t).abs() <= tol))
            .map(|&t| PlanOp::Place { side: Side::Sell, price: Price(t) })
            .collect();

        // Interleave starting from the close-first side: SHORT closes on a
        // BUY, everything else (LONG or FLAT) closes on a SELL.
        let interleaved = match position_side {
            PositionSide::Short => interleave(buy_places, sell_places),
            PositionSide::Long | PositionSide::Flat => interleave(sell_places, buy_places),
        };
        ops.extend(interleaved);
        ops
    }

    fn plan_bin(&mut self, mid: f64, mirror: &LocalMirror) -> Vec<PlanOp> {
        let tick = self.params.price_tick;
        let s = self.params.step_ticks();
        let p = price_to_ticks(mid, tick);
        let levels = self.params.levels as i64;
        let center_units = round_half_even(p as f64 / s as f64);
        let center = center_units * s;

        let mut ops = Vec::new();

        if mirror.buys.is_empty() && mirror.sells.is_empty() && self.bin_center_units.is_none() {
            for k in (1..=levels).rev() {
                ops.push(PlanOp::Place { side: Side::Buy, price: Price(center - k * s) });
            }
            for k in 1..=levels {
                ops.push(PlanOp::Place { side: Side::Sell, price: Price(center + k * s) });
            }
            self.bin_center_units = Some(center_units);
            return ops;
        }

        let prev_units = self.bin_center_units.unwrap_or(center_units);
        let delta = center_units - prev_units;
        self.bin_center_units = Some(center_units);

        if delta == 0 {
            let buy_targets: Vec<i64> = (1..=levels).rev().map(|k| center - k * s).collect();
            let sell_targets: Vec<i64> = (1..=levels).map(|k| center + k * s).collect();
            if mirror.buys.len() < self.params.levels {
                for &t in &buy_targets {
                    if mirror.buys.len() + ops.iter().filter(|o| matches!(o, PlanOp::Place { side: Side::Buy, .. })).count()
                        >= self.params.levels
                    {
                        break;
                    }
                    if !mirror.buys.contains_key(&Price(t)) {
                        ops.push(PlanOp::Place { side: Side::Buy, price: Price(t) });
                    }
                }
            }
            if mirror.sells.len() < self.params.levels {
                for &t in &sell_targets {
                    if mirror.sells.len() + ops.iter().filter(|o| matches!(o, PlanOp::Place { side: Side::Sell, .. })).count()
                        >= self.params.levels
                    {
                        break;
                    }
                    if !mirror.sells.contains_key(&Price(t)) {
                        ops.push(PlanOp::Place { side: Side::Sell, price: Price(t) });
                    }
                }
            }
            return ops;
        }

        let steps = delta.abs();
        let direction_up = delta > 0;
        let mut work_buys: BTreeSet<i64> = mirror.buys.keys().map(|pr| pr.0).collect();
        let mut work_sells: BTreeSet<i64> = mirror.sells.keys().map(|pr| pr.0).collect();

        for _ in 0..steps {
            if direction_up {
                if let Some(&far_buy) = work_buys.iter().next() {
                    ops.push(PlanOp::Cancel { side: Side::Buy, price: Price(far_buy) });
                    work_buys.remove(&far_buy);
                    let near_buy = work_buys.iter().next_back().copied().unwrap_or(center - s);
                    let new_near_buy = near_buy + s;
                    if new_near_buy < p && !work_buys.contains(&new_near_buy) && has_min_gap(&work_buys, new_near_buy, s) {
                        ops.push(PlanOp::Place { side: Side::Buy, price: Price(new_near_buy) });
                        work_buys.insert(new_near_buy);
                    }
                }
                if let Some(&far_sell) = work_sells.iter().next_back() {
                    let new_outer_sell = far_sell + s;
                    if new_outer_sell > p && !work_sells.contains(&new_outer_sell) && has_min_gap(&work_sells, new_outer_sell, s) {
                        ops.push(PlanOp::Place { side: Side::Sell, price: Price(new_outer_sell) });
                        work_sells.insert(new_outer_sell);
                    }
                }
            } else {
                if let Some(&far_sell) = work_sells.iter().next_back() {
                    ops.push(PlanOp::Cancel { side: Side::Sell, price: Price(far_sell) });
                    work_sells.remove(&far_sell);
                    let near_sell = work_sells.iter().next().copied().unwrap_or(center + s);
                    let new_near_sell = near_sell - s;
                    if new_near_sell > p && !work_sells.contains(&new_near_sell) && has_min_gap(&work_sells, new_near_sell, s) {
                        ops.push(PlanOp::Place { side: Side::Sell, price: Price(new_near_sell) });
                        work_sells.insert(new_near_sell);
                    }
                }
                if let Some(&far_buy) = work_buys.iter().next() {
                    let new_outer_buy = far_buy - s;
                    if new_outer_buy > 0 && new_outer_buy < p && !work_buys.contains(&new_outer_buy) && has_min_gap(&work_buys, new_outer_buy, s) {
                        ops.push(PlanOp::Place { side: Side::Buy, price: Price(new_outer_buy) });
                        work_buys.insert(new_outer_buy);
                    }
                }
            }
        }
        ops
    }

    fn plan_follow(&self, mid: f64, mirror: &LocalMirror) -> Vec<PlanOp> {
        let tick = self.params.price_tick;
        let s = self.params.step_ticks();
        let x = self.params.first_offset_ticks();
        let p = price_to_ticks(mid, tick);
        let levels = self.params.levels as i64;

        let mut ops = Vec::new();
        let need_buy_seed = mirror.buys.is_empty();
        let need_sell_seed = mirror.sells.is_empty();

        if need_buy_seed || need_sell_seed {
            if need_buy_seed {
                let mut placed = 0;
                for i in 0..levels {
                    let px = p - (x + i * s);
                    if px <= 0 || px >= p {
                        continue;
                    }
                    ops.push(PlanOp::Place { side: Side::Buy, price: Price(px) });
                    placed += 1;
                    if placed >= levels {
                        break;
                    }
                }
            }
            if need_sell_seed {
                let mut placed = 0;
                for i in 0..levels {
                    let px = p + (x + i * s);
                    if px <= p {
                        continue;
                    }
                    ops.push(PlanOp::Place { side: Side::Sell, price: Price(px) });
                    placed += 1;
                    if placed >= levels {
                        break;
                    }
                }
            }
            return ops;
        }

        let desired_min_buy = p - (x + self.params.follow_slack_steps * s);
        let mut work_buys: BTreeSet<i64> = mirror.buys.keys().map(|pr| pr.0).collect();
        let mut shifts = 0usize;
        while let Some(&nearest_buy) = work_buys.iter().next_back() {
            if nearest_buy >= desired_min_buy || shifts >= self.params.max_shift_per_loop {
                break;
            }
            let Some(&far_buy) = work_buys.iter().next() else { break };
            ops.push(PlanOp::Cancel { side: Side::Buy, price: Price(far_buy) });
            work_buys.remove(&far_buy);
            let new_buy_px = nearest_buy + s;
            if new_buy_px >= p {
                break;
            }
            if work_buys.contains(&new_buy_px) {
                shifts += 1;
                continue;
            }
            if !has_min_gap(&work_buys, new_buy_px, s) {
                break;
            }
            ops.push(PlanOp::Place { side: Side::Buy, price: Price(new_buy_px) });
            work_buys.insert(new_buy_px);
            shifts += 1;
        }

        let desired_max_sell = p + (x + self.params.follow_slack_steps * s);
        let mut work_sells: BTreeSet<i64> = mirror.sells.keys().map(|pr| pr.0).collect();
        let mut shifts = 0usize;
        while let Some(&nearest_sell) = work_sells.iter().next() {
            if nearest_sell <= desired_max_sell || shifts >= self.params.max_shift_per_loop {
                break;
            }
            let Some(&far_sell) = work_sells.iter().next_back() else { break };
            ops.push(PlanOp::Cancel { side: Side::Sell, price: Price(far_sell) });
            work_sells.remove(&far_sell);
            let new_sell_px = nearest_sell - s;
            if new_sell_px <= p {
                break;
            }
            if work_sells.contains(&new_sell_px) {
                shifts += 1;
                continue;
            }
            if !has_min_gap(&work_sells, new_sell_px, s) {
                break;
            }
            ops.push(PlanOp::Place { side: Side::Sell, price: Price(new_sell_px) });
            work_sells.insert(new_sell_px);
            shifts += 1;
        }

        ops
    }

    /// On a fill, cancels the farthest opposite-side rung, opens a rung
    /// closer to mid on the opposite side, and extends the same side one
    /// rung further out. Skipped entirely in BIN mode, where `plan_bin`
    /// reconciles the whole lattice every tick regardless of fills.
    /// Grounded on `grid_engine.py::_replenish_if_filled`'s anchor section.
    pub fn anchor_replenish(&self, mirror: &LocalMirror, filled_buys: &[Price], filled_sells: &[Price]) -> Vec<PlanOp> {
        if self.mode.bin_mode {
            return Vec::new();
        }
        let s = self.params.step_ticks();
        let mut ops = Vec::new();
        let mut work_sells: BTreeSet<i64> = mirror.sells.keys().map(|pr| pr.0).collect();
        let mut work_buys: BTreeSet<i64> = mirror.buys.keys().map(|pr| pr.0).collect();

        if !filled_buys.is_empty() {
            if let Some(&far_sell) = work_sells.iter().next_back() {
                ops.push(PlanOp::Cancel { side: Side::Sell, price: Price(far_sell) });
                work_sells.remove(&far_sell);
            }
            let base_near_sell = work_sells
                .iter()
                .next()
                .copied()
                .unwrap_or_else(|| filled_buys.iter().map(|pr| pr.0).max().unwrap() + s);
            let new_near_sell = base_near_sell - s;
            if new_near_sell > 0 && !work_sells.contains(&new_near_sell) {
                ops.push(PlanOp::Place { side: Side::Sell, price: Price(new_near_sell) });
                work_sells.insert(new_near_sell);
            }
            let base_outer_buy = work_buys
                .iter()
                .next()
                .copied()
                .unwrap_or_else(|| filled_buys.iter().map(|pr| pr.0).min().unwrap() - s);
            let new_outer_buy = base_outer_buy - s;
            if new_outer_buy > 0 && !work_buys.contains(&new_outer_buy) {
                ops.push(PlanOp::Place { side: Side::Buy, price: Price(new_outer_buy) });
            }
        }

        if !filled_sells.is_empty() {
            if let Some(&far_buy) = work_buys.iter().next() {
                ops.push(PlanOp::Cancel { side: Side::Buy, price: Price(far_buy) });
                work_buys.remove(&far_buy);
            }
            let base_near_buy = work_buys
                .iter()
                .next_back()
                .copied()
                .unwrap_or_else(|| filled_sells.iter().map(|pr| pr.0).min().unwrap() - s);
            let new_near_buy = base_near_buy + s;
            if !work_buys.contains(&new_near_buy) {
                ops.push(PlanOp::Place { side: Side::Buy, price: Price(new_near_buy) });
                work_buys.insert(new_near_buy);
            }
            let base_outer_sell = work_sells
                .iter()
                .next_back()
                .copied()
                .unwrap_or_else(|| filled_sells.iter().map(|pr| pr.0).max().unwrap() + s);
            let new_outer_sell = base_outer_sell + s;
            if !work_sells.contains(&new_outer_sell) {
                ops.push(PlanOp::Place { side: Side::Sell, price: Price(new_outer_sell) });
            }
        }

        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GridParams {
        GridParams {
            price_tick: 0.1,
            step_usd: 50.0,
            first_offset_usd: 100.0,
            levels: 3,
            base_size: 0.01,
            op_spacing_sec: 0.0,
            max_new_per_loop: 0,
            enforce_levels: true,
            active_sync_every: 3,
            follow_slack_steps: 1,
            max_shift_per_loop: 1,
        }
    }

    fn mode(box_mode: bool, bin_mode: bool, follow: bool) -> GridModeConfig {
        GridModeConfig { box_mode, bin_mode, follow_enable: follow }
    }

    #[test]
    fn box_mode_initial_placement_brackets_mid() {
        let mut planner = GridPlanner::new(params(), mode(true, false, false));
        let mirror = LocalMirror::new();
        let ops = planner.plan(10000.0, &mirror, PositionSide::Flat);
        let places: Vec<_> = ops
            .iter()
            .filter(|o| matches!(o, PlanOp::Place { .. }))
            .collect();
        assert_eq!(places.len(), 6);
        for op in &places {
            if let PlanOp::Place { side, price } = op {
                let px = price.to_f64(0.1);
                match side {
                    Side::Buy => assert!(px < 10000.0 - 99.0),
                    Side::Sell => assert!(px > 10000.0 + 99.0),
                }
            }
        }
    }

    #[test]
    fn box_mode_interleaves_starting_from_close_first_side() {
        let planner = GridPlanner::new(params(), mode(true, false, false));
        let mirror = LocalMirror::new();

        let flat_ops = planner.plan_box(10000.0, &mirror, PositionSide::Flat);
        let places: Vec<_> = flat_ops.iter().filter(|o| matches!(o, PlanOp::Place { .. })).collect();
        assert!(matches!(places[0], PlanOp::Place { side: Side::Sell, .. }));
        assert!(matches!(places[1], PlanOp::Place { side: Side::Buy, .. }));

        let short_ops = planner.plan_box(10000.0, &mirror, PositionSide::Short);
        let places: Vec<_> = short_ops.iter().filter(|o| matches!(o, PlanOp::Place { .. })).collect();
        assert!(matches!(places[0], PlanOp::Place { side: Side::Buy, .. }));
        assert!(matches!(places[1], PlanOp::Place { side: Side::Sell, .. }));
    }

    #[test]
    fn box_mode_keeps_rungs_within_tolerance_on_small_price_move() {
        let mut planner = GridPlanner::new(params(), mode(true, false, false));
        let mut mirror = LocalMirror::new();
        let ops1 = planner.plan(10000.0, &mirror, PositionSide::Flat);
        for op in ops1 {
            if let PlanOp::Place { side, price } = op {
                mirror.side_map_mut(side).insert(price, format!("{:?}{}", side, price.0));
            }
        }
        let ops2 = planner.plan(10000.02, &mirror, PositionSide::Flat);
        assert!(ops2.is_empty(), "tiny move should not cause churn: {:?}", ops2);
    }

    #[test]
    fn bin_mode_slides_one_step_when_center_advances() {
        let mut planner = GridPlanner::new(params(), mode(false, true, false));
        let mut mirror = LocalMirror::new();
        let ops1 = planner.plan(10000.0, &mirror, PositionSide::Flat);
        for op in ops1 {
            if let PlanOp::Place { side, price } = op {
                mirror.side_map_mut(side).insert(price, format!("{:?}{}", side, price.0));
            }
        }
        let ops2 = planner.plan(10050.0, &mirror, PositionSide::Flat);
        assert!(ops2.iter().any(|o| matches!(o, PlanOp::Cancel { side: Side::Buy, .. })));
    }

    #[test]
    fn bin_center_rounds_half_to_even_on_exact_tie() {
        let mut planner = GridPlanner::new(
            GridParams {
                price_tick: 1.0,
                step_usd: 100.0,
                first_offset_usd: 100.0,
                levels: 2,
                base_size: 0.01,
                op_spacing_sec: 0.0,
                max_new_per_loop: 0,
                enforce_levels: true,
                active_sync_every: 3,
                follow_slack_steps: 1,
                max_shift_per_loop: 1,
            },
            mode(false, true, false),
        );
        let mirror = LocalMirror::new();
        planner.plan(100_050.0, &mirror, PositionSide::Flat);
        assert_eq!(planner.bin_center_units, Some(1000));
    }

    #[test]
    fn anchor_replenish_on_buy_fill_adds_sell_and_outer_buy() {
        let planner = GridPlanner::new(params(), mode(true, false, false));
        let mut mirror = LocalMirror::new();
        mirror.buys.insert(Price(99000), "b1".to_string());
        mirror.sells.insert(Price(100500), "s1".to_string());
        mirror.sells.insert(Price(101000), "s2".to_string());
        let ops = planner.anchor_replenish(&mirror, &[Price(99500)], &[]);
        assert!(ops.contains(&PlanOp::Cancel { side: Side::Sell, price: Price(101000) }));
        assert!(ops.iter().any(|o| matches!(o, PlanOp::Place { side: Side::Sell, .. })));
        assert!(ops.iter().any(|o| matches!(o, PlanOp::Place { side: Side::Buy, .. })));
    }

    #[test]
    fn anchor_replenish_skipped_in_bin_mode() {
        let planner = GridPlanner::new(params(), mode(false, true, false));
        let mirror = LocalMirror::new();
        let ops = planner.anchor_replenish(&mirror, &[Price(100)], &[]);
        assert!(ops.is_empty());
    }
}
