use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::types::{Price, Side};

const ORDER_HEADERS: &[&str] = &[
    "ts_iso", "ts_ms", "account_id", "action", "symbol", "side", "size", "price", "order_id", "note",
];
const EVENT_HEADERS: &[&str] = &["ts_iso", "ts_ms", "account_id", "event", "symbol", "data"];

#[derive(Debug, serde::Serialize)]
struct OrderRow {
    ts_iso: String,
    ts_ms: i64,
    account_id: String,
    action: &'static str,
    symbol: String,
    side: String,
    size: f64,
    price: f64,
    order_id: String,
    note: String,
}

#[derive(Debug, serde::Serialize)]
struct EventRow {
    ts_iso: String,
    ts_ms: i64,
    account_id: String,
    event: String,
    symbol: String,
    data: String,
}

/// Appends every order placement/cancel and lifecycle event to CSV files
/// under `base_dir`, writing the header once per file. Grounded on
/// `trade_logger.py`'s append-only `DictWriter` idiom; failures are logged
/// and swallowed rather than propagated, since a logging hiccup must never
/// stop the controller loop.
pub struct TradeLogger {
    orders_path: PathBuf,
    events_path: PathBuf,
    account_id: String,
}

impl TradeLogger {
    pub fn new<P: AsRef<Path>>(base_dir: P, account_id: String) -> Self {
        let base_dir = base_dir.as_ref();
        if let Err(e) = std::fs::create_dir_all(base_dir) {
            log::error!("failed to create log dir {:?}: {}", base_dir, e);
        }
        Self {
            orders_path: base_dir.join("orders.csv"),
            events_path: base_dir.join("events.csv"),
            account_id,
        }
    }

    pub fn log_order(&self, action: &'static str, symbol: &str, side: Side, price: Price, tick: f64, size: f64, order_id: &str, note: &str) {
        let now = Utc::now();
        let row = OrderRow {
            ts_iso: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            ts_ms: now.timestamp_millis(),
            account_id: self.account_id.clone(),
            action,
            symbol: symbol.to_string(),
            side: side.to_string(),
            size,
            price: price.to_f64(tick),
            order_id: order_id.to_string(),
            note: note.to_string(),
        };
        self.append(&self.orders_path, ORDER_HEADERS, row);
    }

    pub fn log_event(&self, event: &str, symbol: &str, data: &str) {
        let now = Utc::now();
        let row = EventRow {
            ts_iso: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            ts_ms: now.timestamp_millis(),
            account_id: self.account_id.clone(),
            event: event.to_string(),
            symbol: symbol.to_string(),
            data: data.to_string(),
        };
        self.append(&self.events_path, EVENT_HEADERS, row);
    }

    fn append<T: serde::Serialize>(&self, path: &Path, headers: &[&str], row: T) {
        let needs_header = !path.exists() || std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("failed to open {:?}: {}", path, e);
                return;
            }
        };
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            if let Err(e) = writer.write_record(headers) {
                log::error!("failed to write csv header for {:?}: {}", path, e);
            }
        }
        if let Err(e) = writer.serialize(row) {
            log::error!("failed to write csv row to {:?}: {}", path, e);
        }
        let _ = writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Price;

    #[test]
    fn writes_header_once_and_appends_rows() {
        let dir = std::env::temp_dir().join(format!("trade_log_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let logger = TradeLogger::new(&dir, "acct-1".to_string());
        logger.log_order("PLACE", "BTC-USD", Side::Buy, Price(1000), 0.1, 0.01, "oid-1", "");
        logger.log_order("CANCEL", "BTC-USD", Side::Buy, Price(1000), 0.1, 0.01, "oid-1", "filled");

        let content = std::fs::read_to_string(dir.join("orders.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ts_iso,"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
