use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::OrderError;
use crate::types::{OpenOrder, OrderStatus, Position, Price, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    GoodTilCancel,
    ImmediateOrCancel,
    FillOrKill,
    PostOnly,
}

/// The contract every venue integration must satisfy. `GridController` talks
/// to the market exclusively through this trait, the same seam the teacher
/// draws around `ExchangeClient` — only the operations and their shapes
/// differ.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn ticker(&self, symbol: &str) -> Result<f64, OrderError>;
    async fn best_bid_ask(&self, symbol: &str) -> Result<(f64, f64), OrderError>;

    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        price: Price,
        size: f64,
        tif: TimeInForce,
    ) -> Result<String, OrderError>;

    async fn place_market(&self, symbol: &str, side: Side, size: f64) -> Result<String, OrderError>;

    async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), OrderError>;
    async fn list_open(&self, symbol: &str) -> Result<Vec<OpenOrder>, OrderError>;
    async fn list_positions(&self) -> Result<Vec<Position>, OrderError>;
    async fn balance(&self) -> Result<f64, OrderError>;

    /// Cancels every resting order and closes any open position at market.
    /// Used by the emergency procedure; must be best-effort and never panic
    /// on a partially-filled book.
    async fn flatten(&self, symbol: &str) -> Result<(), OrderError>;

    fn as_sim(&self) -> Option<&SimAdapter> {
        None
    }
}

struct RestingOrder {
    side: Side,
    price: Price,
    size: f64,
}

struct SimState {
    balance: f64,
    net_size: f64,
    avg_entry: f64,
    orders: HashMap<String, RestingOrder>,
    last_mid: f64,
}

/// In-memory venue for tests and dry runs. Limit orders rest until `cross`
/// is called by the test or the controller's own fill-detection pass (it
/// never self-fills); market orders and `flatten` execute immediately at
/// the last known mid, mirroring the teacher's `SimExchange` in spirit.
pub struct SimAdapter {
    price_tick: f64,
    maker_fee: f64,
    taker_fee: f64,
    next_id: AtomicU64,
    state: Mutex<SimState>,
}

impl SimAdapter {
    pub fn new(initial_balance: f64, price_tick: f64, maker_fee: f64, taker_fee: f64) -> Self {
        Self {
            price_tick,
            maker_fee,
            taker_fee,
            next_id: AtomicU64::new(1),
            state: Mutex::new(SimState {
                balance: initial_balance,
                net_size: 0.0,
                avg_entry: 0.0,
                orders: HashMap::new(),
                last_mid: 0.0,
            }),
        }
    }

    pub fn set_mid(&self, mid: f64) {
        self.state.lock().unwrap().last_mid = mid;
    }

    /// Fills every resting order whose price has been crossed by `mid`,
    /// returning the filled order ids. Exposed so tests can drive fills
    /// without a real order book.
    pub fn cross(&self, mid: f64) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state.last_mid = mid;
        let mut filled = Vec::new();
        let crossed: Vec<String> = state
            .orders
            .iter()
            .filter(|(_, o)| match o.side {
                Side::Buy => mid <= o.price.to_f64(self.price_tick),
                Side::Sell => mid >= o.price.to_f64(self.price_tick),
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in crossed {
            if let Some(order) = state.orders.remove(&id) {
                let fill_price = order.price.to_f64(self.price_tick);
                apply_fill(&mut state, order.side, fill_price, order.size, self.maker_fee);
                filled.push(id);
            }
        }
        filled
    }
}

fn apply_fill(state: &mut SimState, side: Side, price: f64, size: f64, fee_rate: f64) {
    let signed = match side {
        Side::Buy => size,
        Side::Sell => -size,
    };
    let notional = price * size;
    state.balance -= notional.abs() * fee_rate;

    if state.net_size == 0.0 || state.net_size.signum() == signed.signum() {
        let combined_value = state.avg_entry * state.net_size.abs() + price * size;
        state.net_size += signed;
        state.avg_entry = if state.net_size.abs() > 0.0 {
            combined_value / state.net_size.abs()
        } else {
            0.0
        };
    } else {
        let closing = size.min(state.net_size.abs());
        let pnl = match side {
            Side::Buy => (state.avg_entry - price) * closing,
            Side::Sell => (price - state.avg_entry) * closing,
        };
        state.balance += pnl;
        state.net_size += signed;
        if state.net_size.abs() < 1e-12 {
            state.net_size = 0.0;
            state.avg_entry = 0.0;
        } else if state.net_size.signum() != (-signed.signum()) {
            // position flipped direction; remaining size opens at this fill price
            state.avg_entry = price;
        }
    }
}

#[async_trait]
impl ExchangeAdapter for SimAdapter {
    async fn ticker(&self, _symbol: &str) -> Result<f64, OrderError> {
        Ok(self.state.lock().unwrap().last_mid)
    }

    async fn best_bid_ask(&self, _symbol: &str) -> Result<(f64, f64), OrderError> {
        let mid = self.state.lock().unwrap().last_mid;
        Ok((mid - self.price_tick, mid + self.price_tick))
    }

    async fn place_limit(
        &self,
        _symbol: &str,
        side: Side,
        price: Price,
        size: f64,
        tif: TimeInForce,
    ) -> Result<String, OrderError> {
        if size <= 0.0 {
            return Err(OrderError::InvalidOrder("size must be positive".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        if tif == TimeInForce::PostOnly {
            let mid = state.last_mid;
            let would_cross = match side {
                Side::Buy => price.to_f64(self.price_tick) >= mid,
                Side::Sell => price.to_f64(self.price_tick) <= mid,
            };
            if would_cross {
                return Err(OrderError::MakerViolation(
                    "post-only order would cross the book".to_string(),
                ));
            }
        }
        let id = format!("sim-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        state.orders.insert(id.clone(), RestingOrder { side, price, size });
        Ok(id)
    }

    async fn place_market(&self, _symbol: &str, side: Side, size: f64) -> Result<String, OrderError> {
        let mut state = self.state.lock().unwrap();
        let price = state.last_mid;
        apply_fill(&mut state, side, price, size, self.taker_fee);
        let id = format!("sim-mkt-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        Ok(id)
    }

    async fn cancel(&self, _symbol: &str, order_id: &str) -> Result<(), OrderError> {
        let mut state = self.state.lock().unwrap();
        state
            .orders
            .remove(order_id)
            .map(|_| ())
            .ok_or_else(|| OrderError::InvalidOrder(format!("unknown order {}", order_id)))
    }

    async fn list_open(&self, _symbol: &str) -> Result<Vec<OpenOrder>, OrderError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .iter()
            .map(|(id, o)| OpenOrder {
                order_id: id.clone(),
                side: o.side,
                price: o.price,
                status: OrderStatus::Open,
            })
            .collect())
    }

    async fn list_positions(&self) -> Result<Vec<Position>, OrderError> {
        let state = self.state.lock().unwrap();
        if state.net_size.abs() < 1e-12 {
            return Ok(Vec::new());
        }
        Ok(vec![Position {
            signed_size: state.net_size,
            open_value: state.avg_entry * state.net_size.abs(),
        }])
    }

    async fn balance(&self) -> Result<f64, OrderError> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn flatten(&self, _symbol: &str) -> Result<(), OrderError> {
        let mut state = self.state.lock().unwrap();
        state.orders.clear();
        if state.net_size.abs() > 1e-12 {
            let price = state.last_mid;
            let side = if state.net_size > 0.0 { Side::Sell } else { Side::Buy };
            let size = state.net_size.abs();
            apply_fill(&mut state, side, price, size, self.taker_fee);
        }
        Ok(())
    }

    fn as_sim(&self) -> Option<&SimAdapter> {
        Some(self)
    }
}

/// Placeholder for a real venue integration. Wire protocol and request
/// signing are out of scope here; every call fails loudly rather than
/// pretending to talk to a market.
pub struct UnconfiguredAdapter;

#[async_trait]
impl ExchangeAdapter for UnconfiguredAdapter {
    async fn ticker(&self, _symbol: &str) -> Result<f64, OrderError> {
        Err(OrderError::NetworkError("no live adapter configured".to_string()))
    }
    async fn best_bid_ask(&self, _symbol: &str) -> Result<(f64, f64), OrderError> {
        Err(OrderError::NetworkError("no live adapter configured".to_string()))
    }
    async fn place_limit(
        &self,
        _symbol: &str,
        _side: Side,
        _price: Price,
        _size: f64,
        _tif: TimeInForce,
    ) -> Result<String, OrderError> {
        Err(OrderError::NetworkError("no live adapter configured".to_string()))
    }
    async fn place_market(&self, _symbol: &str, _side: Side, _size: f64) -> Result<String, OrderError> {
        Err(OrderError::NetworkError("no live adapter configured".to_string()))
    }
    async fn cancel(&self, _symbol: &str, _order_id: &str) -> Result<(), OrderError> {
        Err(OrderError::NetworkError("no live adapter configured".to_string()))
    }
    async fn list_open(&self, _symbol: &str) -> Result<Vec<OpenOrder>, OrderError> {
        Err(OrderError::NetworkError("no live adapter configured".to_string()))
    }
    async fn list_positions(&self) -> Result<Vec<Position>, OrderError> {
        Err(OrderError::NetworkError("no live adapter configured".to_string()))
    }
    async fn balance(&self) -> Result<f64, OrderError> {
        Err(OrderError::NetworkError("no live adapter configured".to_string()))
    }
    async fn flatten(&self, _symbol: &str) -> Result<(), OrderError> {
        Err(OrderError::NetworkError("no live adapter configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_only_rejects_crossing_price() {
        let sim = SimAdapter::new(1000.0, 0.1, 0.0002, 0.0005);
        sim.set_mid(100.0);
        let result = sim
            .place_limit("X", Side::Buy, Price::quantize(101.0, 0.1, Side::Buy), 1.0, TimeInForce::PostOnly)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn limit_order_fills_on_cross() {
        let sim = SimAdapter::new(1000.0, 0.1, 0.0002, 0.0005);
        sim.set_mid(100.0);
        let id = sim
            .place_limit("X", Side::Buy, Price::quantize(99.0, 0.1, Side::Buy), 1.0, TimeInForce::PostOnly)
            .await
            .unwrap();
        let filled = sim.cross(99.0);
        assert_eq!(filled, vec![id]);
        let positions = sim.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].signed_size - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn flatten_closes_position_and_cancels_orders() {
        let sim = SimAdapter::new(1000.0, 0.1, 0.0002, 0.0005);
        sim.set_mid(100.0);
        sim.place_market("X", Side::Buy, 1.0).await.unwrap();
        sim.place_limit("X", Side::Sell, Price::quantize(105.0, 0.1, Side::Sell), 1.0, TimeInForce::PostOnly)
            .await
            .unwrap();
        sim.flatten("X").await.unwrap();
        assert!(sim.list_positions().await.unwrap().is_empty());
        assert!(sim.list_open("X").await.unwrap().is_empty());
    }
}
