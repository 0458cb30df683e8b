use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::types::{ScheduleDocument, ScheduleDocumentInner, ScheduleEntry};

const SCHEDULE_URL: &str = "https://zaramcei.github.io/edgex-grid/schedule/schedule.json";
const FETCH_INTERVAL_SEC: u64 = 300;

/// Periodically fetches a remote schedule document and answers "is active
/// now?" / "what lot coefficient applies?". Refreshes are serialized by a
/// single-writer guard so at most one fetch is ever in flight.
pub struct ScheduleManager {
    schedule_type: String,
    state: Mutex<ScheduleState>,
    client: reqwest::Client,
}

struct ScheduleState {
    entries: Vec<ScheduleEntry>,
    last_fetch: Option<std::time::Instant>,
}

impl ScheduleManager {
    pub fn new(schedule_type: String) -> Self {
        Self {
            schedule_type,
            state: Mutex::new(ScheduleState {
                entries: Vec::new(),
                last_fetch: None,
            }),
            client: reqwest::Client::new(),
        }
    }

    /// Refreshes the schedule unless the last successful fetch is still
    /// within `FETCH_INTERVAL_SEC`, unless `force` is set. A fetch failure
    /// retains the previous snapshot.
    pub async fn fetch_schedule(&self, force: bool) -> bool {
        let mut state = self.state.lock().await;
        if !force {
            if let Some(last) = state.last_fetch {
                if last.elapsed().as_secs() < FETCH_INTERVAL_SEC {
                    return true;
                }
            }
        }

        let resp = match self
            .client
            .get(SCHEDULE_URL)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                log::warn!("schedule fetch failed: {}", e);
                return false;
            }
        };

        let doc = match resp.json::<ScheduleDocument>().await {
            Ok(d) => d,
            Err(e) => {
                log::warn!("schedule fetch failed: malformed document: {}", e);
                return false;
            }
        };

        let entries = match doc.schedules {
            Some(ScheduleDocumentInner::ByType(by_type)) => {
                match by_type.get(&self.schedule_type) {
                    Some(e) => e.clone(),
                    None => {
                        log::warn!(
                            "schedule type '{}' not found; available: {:?}",
                            self.schedule_type,
                            by_type.keys().collect::<Vec<_>>()
                        );
                        Vec::new()
                    }
                }
            }
            Some(ScheduleDocumentInner::Bare(list)) => list,
            None => Vec::new(),
        };

        log::info!(
            "schedule fetch succeeded: {} entries (type={})",
            entries.len(),
            self.schedule_type
        );
        state.entries = entries;
        state.last_fetch = Some(std::time::Instant::now());
        true
    }

    async fn current_entry(&self) -> Option<ScheduleEntry> {
        let state = self.state.lock().await;
        let now: DateTime<Utc> = Utc::now();
        state
            .entries
            .iter()
            .find(|entry| {
                let from = parse_as_utc(&entry.from);
                let to = parse_as_utc(&entry.to);
                match (from, to) {
                    (Some(from), Some(to)) => from <= now && now <= to,
                    _ => false,
                }
            })
            .cloned()
    }

    pub async fn is_active(&self) -> bool {
        self.current_entry().await.is_some()
    }

    pub async fn lot_coefficient(&self) -> f64 {
        match self.current_entry().await {
            Some(entry) => entry.lot_coefficient,
            None => 0.0,
        }
    }
}

/// Parses an ISO8601 timestamp, treating a missing offset as UTC.
fn parse_as_utc(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naive_timestamp_treated_as_utc() {
        let dt = parse_as_utc("2026-01-01T00:00:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn offset_timestamp_parses() {
        let dt = parse_as_utc("2026-01-01T00:00:00+09:00").unwrap();
        assert_eq!(dt.timezone(), Utc);
    }

    #[tokio::test]
    async fn is_active_matches_containing_interval() {
        let mgr = ScheduleManager::new("normal".to_string());
        {
            let mut state = mgr.state.lock().await;
            state.entries.push(ScheduleEntry {
                from: "2000-01-01T00:00:00Z".to_string(),
                to: "2999-01-01T00:00:00Z".to_string(),
                lot_coefficient: 1.5,
                label: "always".to_string(),
            });
            state.last_fetch = Some(std::time::Instant::now());
        }
        assert!(mgr.is_active().await);
        assert_eq!(mgr.lot_coefficient().await, 1.5);
    }

    #[tokio::test]
    async fn inactive_outside_any_interval() {
        let mgr = ScheduleManager::new("normal".to_string());
        assert!(!mgr.is_active().await);
        assert_eq!(mgr.lot_coefficient().await, 0.0);
    }
}
