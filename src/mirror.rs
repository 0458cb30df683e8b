use crate::types::{LocalMirror, OpenOrder, OrderStatus, Side};
use std::collections::HashSet;

/// Rebuilds the mirror from the latest authoritative snapshot, discarding
/// prior entries entirely. Mirrors `grid_engine.py::_sync_active_orders_from_exchange`.
pub fn rebuild_from_snapshot(mirror: &mut LocalMirror, snapshot: &[OpenOrder]) {
    mirror.clear();
    for order in snapshot {
        if order.status != OrderStatus::Open {
            continue;
        }
        mirror.side_map_mut(order.side).insert(order.price, order.order_id.clone());
    }
}

/// Orders present in the snapshot that the mirror does not account for —
/// stale orders from a prior run, or orders placed manually.
pub fn unmanaged_order_ids(mirror: &LocalMirror, snapshot: &[OpenOrder]) -> Vec<String> {
    let known: HashSet<&String> = mirror
        .buys
        .values()
        .chain(mirror.sells.values())
        .collect();
    snapshot
        .iter()
        .filter(|o| o.status == OrderStatus::Open && !known.contains(&o.order_id))
        .map(|o| o.order_id.clone())
        .collect()
}

/// A fill (or vanish) is any mirror id absent from the latest snapshot's id
/// set. Returns filled prices per side so the caller can run the anchor
/// rule without re-walking the mirror.
pub fn detect_fills(mirror: &LocalMirror, snapshot: &[OpenOrder]) -> (Vec<crate::types::Price>, Vec<crate::types::Price>) {
    let live_ids: HashSet<&str> = snapshot
        .iter()
        .filter(|o| o.status == OrderStatus::Open)
        .map(|o| o.order_id.as_str())
        .collect();

    let filled_buys = mirror
        .buys
        .iter()
        .filter(|(_, id)| !live_ids.contains(id.as_str()))
        .map(|(&px, _)| px)
        .collect();
    let filled_sells = mirror
        .sells
        .iter()
        .filter(|(_, id)| !live_ids.contains(id.as_str()))
        .map(|(&px, _)| px)
        .collect();

    (filled_buys, filled_sells)
}

pub fn remove_filled(mirror: &mut LocalMirror, filled_buys: &[crate::types::Price], filled_sells: &[crate::types::Price]) {
    for px in filled_buys {
        mirror.buys.remove(px);
    }
    for px in filled_sells {
        mirror.sells.remove(px);
    }
}

/// Self-cross guard: a BUY may never be placed at a price the mirror already
/// holds a SELL at, and vice versa.
pub fn would_self_cross(mirror: &LocalMirror, side: Side, price: crate::types::Price) -> bool {
    mirror.side_map(side.opposite()).contains_key(&price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Price;

    fn order(id: &str, side: Side, ticks: i64) -> OpenOrder {
        OpenOrder {
            order_id: id.to_string(),
            side,
            price: Price(ticks),
            status: OrderStatus::Open,
        }
    }

    #[test]
    fn rebuild_replaces_stale_entries() {
        let mut mirror = LocalMirror::new();
        mirror.buys.insert(Price(100), "stale".to_string());
        let snapshot = vec![order("fresh", Side::Buy, 200)];
        rebuild_from_snapshot(&mut mirror, &snapshot);
        assert_eq!(mirror.buys.len(), 1);
        assert_eq!(mirror.buys.get(&Price(200)), Some(&"fresh".to_string()));
    }

    #[test]
    fn rebuild_is_idempotent() {
        let snapshot = vec![order("a", Side::Buy, 100), order("b", Side::Sell, 200)];
        let mut first = LocalMirror::new();
        rebuild_from_snapshot(&mut first, &snapshot);
        let mut second = first.clone();
        rebuild_from_snapshot(&mut second, &snapshot);
        assert_eq!(first.buys, second.buys);
        assert_eq!(first.sells, second.sells);
    }

    #[test]
    fn detects_filled_buy() {
        let mut mirror = LocalMirror::new();
        mirror.buys.insert(Price(100), "buy1".to_string());
        mirror.sells.insert(Price(200), "sell1".to_string());
        let snapshot = vec![order("sell1", Side::Sell, 200)];
        let (filled_buys, filled_sells) = detect_fills(&mirror, &snapshot);
        assert_eq!(filled_buys, vec![Price(100)]);
        assert!(filled_sells.is_empty());
    }

    #[test]
    fn unmanaged_orders_excludes_known_ids() {
        let mut mirror = LocalMirror::new();
        mirror.buys.insert(Price(100), "mine".to_string());
        let snapshot = vec![order("mine", Side::Buy, 100), order("stray", Side::Sell, 300)];
        let unmanaged = unmanaged_order_ids(&mirror, &snapshot);
        assert_eq!(unmanaged, vec!["stray".to_string()]);
    }

    #[test]
    fn self_cross_detected() {
        let mut mirror = LocalMirror::new();
        mirror.sells.insert(Price(150), "sell1".to_string());
        assert!(would_self_cross(&mirror, Side::Buy, Price(150)));
        assert!(!would_self_cross(&mirror, Side::Buy, Price(151)));
    }
}
