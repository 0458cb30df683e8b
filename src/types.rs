use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A price expressed as an integer multiple of the instrument's tick size.
/// Keeping the lattice in ticks instead of raw `f64` means every BOX/BIN
/// comparison is exact integer arithmetic — no drift from repeated
/// `round()`-ing of binary floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(pub i64);

impl Price {
    pub fn to_f64(self, tick: f64) -> f64 {
        self.0 as f64 * tick
    }

    /// Quantize a raw price to the lattice, rounding toward the book for the
    /// given side (BUY floors, SELL ceils) so a placement never crosses the
    /// requested price.
    pub fn quantize(raw: f64, tick: f64, side: Side) -> Price {
        if tick <= 0.0 {
            return Price(raw.round() as i64);
        }
        let units = raw / tick;
        let ticks = match side {
            Side::Buy => units.floor(),
            Side::Sell => units.ceil(),
        };
        Price(ticks as i64)
    }

    pub fn from_units(units: i64) -> Price {
        Price(units)
    }

    pub fn checked_add_ticks(self, ticks: i64) -> Price {
        Price(self.0 + ticks)
    }
}

impl std::ops::Add<i64> for Price {
    type Output = Price;
    fn add(self, rhs: i64) -> Price {
        Price(self.0 + rhs)
    }
}

impl std::ops::Sub<i64> for Price {
    type Output = Price;
    fn sub(self, rhs: i64) -> Price {
        Price(self.0 - rhs)
    }
}

impl std::ops::Sub<Price> for Price {
    type Output = i64;
    fn sub(self, rhs: Price) -> i64 {
        self.0 - rhs.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

/// Which grid algorithm the planner runs this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridMode {
    Box,
    Bin,
    Follow,
}

/// Immutable per-instrument grid configuration. step/first_offset/price_tick
/// are carried both as raw USD (for logging/config display) and pre-quantized
/// into tick units (for lattice math).
#[derive(Debug, Clone, Copy)]
pub struct GridParams {
    pub price_tick: f64,
    pub step_usd: f64,
    pub first_offset_usd: f64,
    pub levels: usize,
    pub base_size: f64,
    pub op_spacing_sec: f64,
    pub max_new_per_loop: usize,
    pub enforce_levels: bool,
    pub active_sync_every: u64,
    pub follow_slack_steps: i64,
    pub max_shift_per_loop: usize,
}

impl GridParams {
    pub fn step_ticks(&self) -> i64 {
        (self.step_usd / self.price_tick).round().max(1.0) as i64
    }

    pub fn first_offset_ticks(&self) -> i64 {
        (self.first_offset_usd / self.price_tick).round() as i64
    }

    /// Tolerance for "already on lattice" comparisons: `tick * 1.01` rounded
    /// up to whole ticks, minimum one tick.
    pub fn tolerance_ticks(&self) -> i64 {
        ((self.price_tick * 1.01) / self.price_tick).ceil().max(1.0) as i64
    }
}

/// A single resting limit order at one lattice price on one side.
#[derive(Debug, Clone)]
pub struct Rung {
    pub side: Side,
    pub price: Price,
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Filled,
    Canceled,
    Rejected,
}

/// Authoritative order record as reported by the adapter's open-order
/// snapshot. Each `ExchangeAdapter` is responsible for normalizing its own
/// venue's wire shape into this type; nothing downstream ever inspects raw
/// JSON.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: Side,
    pub price: Price,
    pub status: OrderStatus,
}

/// Two price->order_id maps, one per side. The controller is the sole
/// mutator; planners read it, never write it directly.
#[derive(Debug, Clone, Default)]
pub struct LocalMirror {
    pub buys: BTreeMap<Price, String>,
    pub sells: BTreeMap<Price, String>,
}

impl LocalMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn side_map(&self, side: Side) -> &BTreeMap<Price, String> {
        match side {
            Side::Buy => &self.buys,
            Side::Sell => &self.sells,
        }
    }

    pub fn side_map_mut(&mut self, side: Side) -> &mut BTreeMap<Price, String> {
        match side {
            Side::Buy => &mut self.buys,
            Side::Sell => &mut self.sells,
        }
    }

    pub fn clear(&mut self) {
        self.buys.clear();
        self.sells.clear();
    }

    pub fn len(&self, side: Side) -> usize {
        self.side_map(side).len()
    }

    /// True if `price` is at least `min_gap` ticks from every existing price
    /// on `side`.
    pub fn has_min_gap(&self, side: Side, price: Price, min_gap: i64) -> bool {
        self.side_map(side)
            .keys()
            .all(|&existing| (existing - price).abs() >= min_gap)
    }

    /// All order ids currently tracked, for fill-detection set-difference
    /// against the latest snapshot.
    pub fn all_ids(&self) -> std::collections::HashSet<String> {
        self.buys
            .values()
            .chain(self.sells.values())
            .cloned()
            .collect()
    }
}

/// One sub-position as reported by the adapter; the monitor aggregates these
/// into net size / average entry.
#[derive(Debug, Clone, Copy)]
pub struct Position {
    pub signed_size: f64,
    pub open_value: f64,
}

/// An ordered half-open schedule interval.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub from: String,
    pub to: String,
    #[serde(default = "default_lot_coefficient")]
    pub lot_coefficient: f64,
    #[serde(default, alias = "title")]
    pub label: String,
}

fn default_lot_coefficient() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScheduleDocumentInner {
    ByType(std::collections::HashMap<String, Vec<ScheduleEntry>>),
    Bare(Vec<ScheduleEntry>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDocument {
    #[serde(default)]
    pub schedules: Option<ScheduleDocumentInner>,
}
