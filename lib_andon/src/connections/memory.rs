//! In-process [`TelemetryStore`] used when no database is configured, and by the test suite.
//!
//! Commits are atomic: the only way a commit can fail is the injected failure, which is
//! checked before the lock is taken, and applying a commit in place cannot stop halfway.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::NaiveDate;

use crate::connections::store::{
    DowntimeQuery, DowntimeRow, FaultQuery, FrameCommit, StationRow, StoreError, TelemetryStore,
};
use crate::telemetry::{Category, FaultMutation, FaultRecord};

/// Planned count given to a station row on first insert.
pub const DEFAULT_PLANNED_COUNT: u64 = 100;

#[derive(Debug, Default)]
struct Tables {
    stations: BTreeMap<String, StationRow>,
    faults: Vec<FaultRecord>,
    downtime: BTreeMap<(String, Category, NaiveDate), f64>,
}

impl Tables {
    fn apply(&mut self, commit: &FrameCommit, planned_count: u64) {
        if let Some(update) = commit.production {
            let row = self
                .stations
                .entry(commit.station_id.clone())
                .or_insert_with(|| StationRow {
                    station_id: commit.station_id.clone(),
                    planned_count,
                    actual_count: 0,
                    efficiency: 0.0,
                    updated_at: update.at,
                });
            row.actual_count = update.count;
            row.efficiency = efficiency(row.actual_count, row.planned_count);
            row.updated_at = update.at;
        }

        for mutation in &commit.mutations {
            match mutation {
                FaultMutation::Open { station_id, category, opened_at } => {
                    self.faults
                        .push(FaultRecord::open(station_id.clone(), category.clone(), *opened_at));
                }
                FaultMutation::Close {
                    station_id,
                    category,
                    closed_at,
                    downtime_minutes,
                    day,
                    ..
                } => {
                    let open = self
                        .faults
                        .iter_mut()
                        .filter(|r| r.is_open() && &r.station_id == station_id && &r.category == category)
                        .max_by_key(|r| r.opened_at);
                    // Same rule as the SQL adapter: no open row, no aggregate.
                    let Some(record) = open else {
                        log::warn!("No open {} record for station {} to close.", category, station_id);
                        continue;
                    };
                    record.closed_at = Some(*closed_at);
                    *self
                        .downtime
                        .entry((station_id.clone(), category.clone(), *day))
                        .or_insert(0.0) += *downtime_minutes;
                }
            }
        }
    }
}

fn efficiency(actual: u64, planned: u64) -> f64 {
    if planned > 0 {
        actual as f64 * 100.0 / planned as f64
    } else {
        0.0
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    planned_count: u64,
    fail_commits: AtomicBool,
    commits: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_PLANNED_COUNT)
    }
}

impl MemoryStore {
    /// An empty store; `planned_count` seeds every station row on first insert.
    pub fn new(planned_count: u64) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            planned_count,
            fail_commits: AtomicBool::new(false),
            commits: AtomicU64::new(0),
        }
    }

    /// Makes every following commit fail with [`StoreError::Unavailable`] until reset.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Inserts a record directly, bypassing the pipeline.
    pub fn insert_fault(&self, record: FaultRecord) {
        self.lock().faults.push(record);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// The station row, if the station ever reported a production count.
    pub fn station(&self, station_id: &str) -> Option<StationRow> {
        self.lock().stations.get(station_id).cloned()
    }

    /// Every fault record in insertion order.
    pub fn fault_records(&self) -> Vec<FaultRecord> {
        self.lock().faults.clone()
    }

    /// Accumulated minutes for one aggregate row, or `None` if the row does not exist.
    pub fn downtime(&self, station_id: &str, category: &Category, day: NaiveDate) -> Option<f64> {
        self.lock()
            .downtime
            .get(&(station_id.to_string(), category.clone(), day))
            .copied()
    }

    pub fn downtime_row_count(&self) -> usize {
        self.lock().downtime.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TelemetryStore for MemoryStore {
    async fn commit(&self, commit: &FrameCommit) -> Result<(), StoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is set to reject commits".to_string()));
        }

        self.lock().apply(commit, self.planned_count);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_open_faults(&self) -> Result<Vec<FaultRecord>, StoreError> {
        let tables = self.lock();
        let mut latest: BTreeMap<(&str, &Category), &FaultRecord> = BTreeMap::new();
        for record in tables.faults.iter().filter(|r| r.is_open()) {
            let key = (record.station_id.as_str(), &record.category);
            match latest.get(&key) {
                Some(existing) if existing.opened_at >= record.opened_at => {}
                _ => {
                    latest.insert(key, record);
                }
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn station_rows(&self) -> Result<Vec<StationRow>, StoreError> {
        Ok(self.lock().stations.values().cloned().collect())
    }

    async fn downtime_rows(&self, query: &DowntimeQuery) -> Result<Vec<DowntimeRow>, StoreError> {
        let mut rows: Vec<DowntimeRow> = self
            .lock()
            .downtime
            .iter()
            .map(|((station_id, category, day), minutes)| DowntimeRow {
                station_id: station_id.clone(),
                category: category.clone(),
                day: *day,
                minutes: *minutes,
            })
            .filter(|row| query.matches(row))
            .collect();
        rows.sort_by(|a, b| {
            (Reverse(a.day), &a.station_id, &a.category).cmp(&(Reverse(b.day), &b.station_id, &b.category))
        });
        Ok(rows)
    }

    async fn fault_history(&self, query: &FaultQuery) -> Result<Vec<FaultRecord>, StoreError> {
        let mut records: Vec<FaultRecord> = self
            .lock()
            .faults
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        records.sort_by_key(|record| Reverse(record.opened_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::store::ProductionUpdate;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn test_production_upsert_derives_efficiency() {
        let store = MemoryStore::new(200);
        let mut commit = FrameCommit::new("3");
        commit.production = Some(ProductionUpdate { count: 50, at: at(10, 0, 0) });
        store.commit(&commit).await.unwrap();

        commit.production = Some(ProductionUpdate { count: 150, at: at(10, 5, 0) });
        store.commit(&commit).await.unwrap();

        let row = store.station("3").unwrap();
        assert_eq!(row.planned_count, 200);
        assert_eq!(row.actual_count, 150);
        assert!((row.efficiency - 75.0).abs() < 1e-9);
        assert_eq!(row.updated_at, at(10, 5, 0));
        assert_eq!(efficiency(10, 0), 0.0);
    }

    #[tokio::test]
    async fn test_close_updates_record_and_aggregate() {
        let store = MemoryStore::default();
        let store_cat = Category::new("Store");
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let mut open = FrameCommit::new("3");
        open.mutations.push(FaultMutation::Open {
            station_id: "3".into(),
            category: store_cat.clone(),
            opened_at: at(10, 0, 0),
        });
        store.commit(&open).await.unwrap();

        for (close_at, minutes) in [(at(10, 3, 0), 3.0), (at(11, 0, 0), 1.5)] {
            let mut close = FrameCommit::new("3");
            close.mutations.push(FaultMutation::Close {
                station_id: "3".into(),
                category: store_cat.clone(),
                opened_at: at(10, 0, 0),
                closed_at: close_at,
                downtime_minutes: minutes,
                day,
            });
            store.commit(&close).await.unwrap();
        }

        // The second close found no open record, so the aggregate only holds the first.
        assert_eq!(store.downtime("3", &store_cat, day), Some(3.0));
        assert_eq!(store.fault_records()[0].closed_at, Some(at(10, 3, 0)));
        assert!(store.load_open_faults().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_changes_nothing() {
        let store = MemoryStore::default();
        store.set_fail_commits(true);
        let mut commit = FrameCommit::new("3");
        commit.production = Some(ProductionUpdate { count: 1, at: at(10, 0, 0) });

        assert!(matches!(store.commit(&commit).await, Err(StoreError::Unavailable(_))));
        assert!(store.station("3").is_none());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_commit_keeps_earlier_writes() {
        let store = MemoryStore::default();
        let quality = Category::new("Quality");
        for hour in 0..50 {
            let mut commit = FrameCommit::new("3");
            commit.mutations.push(FaultMutation::Open {
                station_id: "3".into(),
                category: quality.clone(),
                opened_at: at(hour % 24, hour / 24, 0),
            });
            store.commit(&commit).await.unwrap();
        }

        store.set_fail_commits(true);
        let mut rejected = FrameCommit::new("3");
        rejected.production = Some(ProductionUpdate { count: 9, at: at(23, 0, 0) });
        assert!(store.commit(&rejected).await.is_err());

        assert_eq!(store.fault_records().len(), 50);
        assert!(store.station("3").is_none());
        assert_eq!(store.commit_count(), 50);
    }

    #[tokio::test]
    async fn test_read_side_orders_rows_for_reports() {
        let store = MemoryStore::default();
        let day = |d| NaiveDate::from_ymd_opt(2024, 3, d).unwrap();
        for (station, category, opened_at, closed_at, on) in [
            ("2", "Store", at(8, 0, 0), at(8, 10, 0), day(1)),
            ("1", "Quality", at(9, 0, 0), at(9, 4, 0), day(2)),
            ("1", "Store", at(7, 0, 0), at(7, 1, 0), day(2)),
        ] {
            let mut commit = FrameCommit::new(station);
            commit.production = Some(ProductionUpdate { count: 5, at: opened_at });
            commit.mutations.push(FaultMutation::Open {
                station_id: station.into(),
                category: Category::new(category),
                opened_at,
            });
            commit.mutations.push(FaultMutation::Close {
                station_id: station.into(),
                category: Category::new(category),
                opened_at,
                closed_at,
                downtime_minutes: (closed_at - opened_at).num_seconds() as f64 / 60.0,
                day: on,
            });
            store.commit(&commit).await.unwrap();
        }

        let stations: Vec<String> = store.station_rows().await.unwrap().into_iter().map(|r| r.station_id).collect();
        assert_eq!(stations, vec!["1", "2"]);

        let rows = store.downtime_rows(&DowntimeQuery::default()).await.unwrap();
        let keys: Vec<(&str, &str, f64)> = rows
            .iter()
            .map(|r| (r.station_id.as_str(), r.category.as_str(), r.minutes))
            .collect();
        assert_eq!(keys, vec![("1", "Quality", 4.0), ("1", "Store", 1.0), ("2", "Store", 10.0)]);
        assert_eq!(rows[0].day, day(2));

        let only_day_one = DowntimeQuery {
            to: Some(day(1)),
            ..Default::default()
        };
        assert_eq!(store.downtime_rows(&only_day_one).await.unwrap().len(), 1);

        let history = store
            .fault_history(&FaultQuery {
                station_id: Some("1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let opened: Vec<DateTime<Utc>> = history.iter().map(|r| r.opened_at).collect();
        assert_eq!(opened, vec![at(9, 0, 0), at(7, 0, 0)]);
    }

    #[tokio::test]
    async fn test_load_open_faults_returns_latest_per_key() {
        let store = MemoryStore::default();
        let quality = Category::new("Quality");
        store.insert_fault(FaultRecord::open("1", quality.clone(), at(8, 0, 0)));
        store.insert_fault(FaultRecord::open("1", quality.clone(), at(9, 0, 0)));
        store.insert_fault(FaultRecord::open("2", quality.clone(), at(7, 0, 0)));

        let open = store.load_open_faults().await.unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].station_id, "1");
        assert_eq!(open[0].opened_at, at(9, 0, 0));
    }
}
