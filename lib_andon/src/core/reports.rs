//! # Reports
//!
//! Read-only views over a [`TelemetryStore`] for the dashboard: daily downtime records, the
//! fault history of one plant day, per-station statistics and the plant summary.
//!
//! Every "day" here is a calendar day in the plant time zone, the same one the fault tracker
//! books downtime on.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::connections::store::{DowntimeQuery, DowntimeRow, FaultQuery, StoreError, TelemetryStore};
use crate::telemetry::{Category, CategoryTable, FaultRecord};

/// Window used by [`Reports::station_stats`] when the caller does not pick one.
pub const DEFAULT_STATS_DAYS: u32 = 7;
/// Longest window [`Reports::station_stats`] accepts; longer requests are clamped.
pub const MAX_STATS_DAYS: u32 = 366;

/// Plant-wide figures for today.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub day: NaiveDate,
    pub total_stations: usize,
    pub total_production: u64,
    pub average_efficiency: f64,
    /// Minutes booked today across every station and category.
    pub total_downtime: f64,
    pub active_faults: usize,
    /// Open faults per configured category; categories without one report 0.
    pub faults_by_type: BTreeMap<Category, usize>,
}

/// One station over the last `days` plant days, today included.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationStats {
    pub station_id: String,
    pub days: u32,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub actual_count: u64,
    pub efficiency: f64,
    pub total_downtime: f64,
    pub downtime_by_category: BTreeMap<Category, f64>,
    /// Fault records opened inside the window.
    pub faults_opened: usize,
    pub open_faults: Vec<Category>,
    pub daily: Vec<DowntimeRow>,
}

/// Report builder bound to one store and plant configuration.
pub struct Reports<S: TelemetryStore> {
    store: Arc<S>,
    categories: CategoryTable,
    timezone: Tz,
}

impl<S: TelemetryStore> Clone for Reports<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            categories: self.categories.clone(),
            timezone: self.timezone,
        }
    }
}

impl<S: TelemetryStore> Reports<S> {
    /// # Arguments
    ///
    /// * `store` - Store the sequencer writes to.
    /// * `categories` - Configured categories; every one appears in the summary.
    /// * `timezone` - Plant timezone that defines where a day starts.
    pub fn new(store: Arc<S>, categories: CategoryTable, timezone: Tz) -> Self {
        Self {
            store,
            categories,
            timezone,
        }
    }

    /// The plant-local calendar day containing `now`.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    /// Every downtime aggregate row, newest day first.
    pub async fn daily_records(&self) -> Result<Vec<DowntimeRow>, StoreError> {
        self.store.downtime_rows(&DowntimeQuery::default()).await
    }

    /// Fault records opened on plant day `day`, or all of them when `day` is `None`; most
    /// recently opened first.
    pub async fn fault_history(&self, day: Option<NaiveDate>) -> Result<Vec<FaultRecord>, StoreError> {
        let query = match day {
            Some(day) => FaultQuery {
                station_id: None,
                opened_from: Some(day_start(&self.timezone, day)),
                opened_before: day
                    .checked_add_days(Days::new(1))
                    .map(|next| day_start(&self.timezone, next)),
            },
            None => FaultQuery::default(),
        };
        self.store.fault_history(&query).await
    }

    /// Statistics for `station_id` over the last `days` plant days. `days` is clamped to
    /// `1..=MAX_STATS_DAYS`. Returns `None` for a station that never reported.
    pub async fn station_stats(
        &self,
        station_id: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<StationStats>, StoreError> {
        let stations = self.store.station_rows().await?;
        let Some(row) = stations.into_iter().find(|row| row.station_id == station_id) else {
            return Ok(None);
        };

        let days = days.clamp(1, MAX_STATS_DAYS);
        let to = self.today(now);
        let from = to.checked_sub_days(Days::new(u64::from(days - 1))).unwrap_or(NaiveDate::MIN);

        let daily = self
            .store
            .downtime_rows(&DowntimeQuery {
                station_id: Some(station_id.to_string()),
                from: Some(from),
                to: Some(to),
            })
            .await?;
        let mut downtime_by_category: BTreeMap<Category, f64> = BTreeMap::new();
        for entry in &daily {
            *downtime_by_category.entry(entry.category.clone()).or_insert(0.0) += entry.minutes;
        }

        let opened = self
            .store
            .fault_history(&FaultQuery {
                station_id: Some(station_id.to_string()),
                opened_from: Some(day_start(&self.timezone, from)),
                opened_before: None,
            })
            .await?;

        let open_faults = self
            .store
            .load_open_faults()
            .await?
            .into_iter()
            .filter(|record| record.station_id == station_id)
            .map(|record| record.category)
            .collect();

        Ok(Some(StationStats {
            station_id: row.station_id,
            days,
            from,
            to,
            actual_count: row.actual_count,
            efficiency: row.efficiency,
            total_downtime: daily.iter().map(|entry| entry.minutes).sum(),
            downtime_by_category,
            faults_opened: opened.len(),
            open_faults,
            daily,
        }))
    }

    /// Production, efficiency, today's downtime and the open faults of the whole plant.
    pub async fn dashboard_summary(&self, now: DateTime<Utc>) -> Result<DashboardSummary, StoreError> {
        let day = self.today(now);
        let stations = self.store.station_rows().await?;
        let today = self
            .store
            .downtime_rows(&DowntimeQuery {
                station_id: None,
                from: Some(day),
                to: Some(day),
            })
            .await?;
        let open = self.store.load_open_faults().await?;

        let mut faults_by_type: BTreeMap<Category, usize> =
            self.categories.iter().map(|(_, category)| (category.clone(), 0)).collect();
        for record in &open {
            *faults_by_type.entry(record.category.clone()).or_insert(0) += 1;
        }

        let average_efficiency = if stations.is_empty() {
            0.0
        } else {
            stations.iter().map(|row| row.efficiency).sum::<f64>() / stations.len() as f64
        };

        Ok(DashboardSummary {
            day,
            total_stations: stations.len(),
            total_production: stations.iter().map(|row| row.actual_count).sum(),
            average_efficiency,
            total_downtime: today.iter().map(|entry| entry.minutes).sum(),
            active_faults: open.len(),
            faults_by_type,
        })
    }
}

/// First instant of plant day `day`, in UTC.
fn day_start(timezone: &Tz, day: NaiveDate) -> DateTime<Utc> {
    let midnight = day.and_time(NaiveTime::MIN);
    timezone
        .from_local_datetime(&midnight)
        .earliest()
        // Zones that skip midnight on a DST change start the day one hour later.
        .or_else(|| timezone.from_local_datetime(&(midnight + TimeDelta::hours(1))).earliest())
        .map(|start| start.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::MemoryStore;
    use crate::core::dispatcher::Dispatcher;
    use crate::core::sequencer::Sequencer;
    use crate::telemetry::{RawFrame, StationLayout};

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    /// 8-channel payload with `asserted` channels held low and `production` on channel 1.
    fn payload(asserted: &[usize], production: u64) -> String {
        let tokens: Vec<String> = (0..8)
            .flat_map(|channel| {
                let level = if asserted.contains(&channel) { 0 } else { 1 };
                let counter = if channel == 1 { production } else { 0 };
                [level.to_string(), counter.to_string()]
            })
            .collect();
        format!("{{{}}}", tokens.join(","))
    }

    /// Station 1: Production down 5 minutes on the 1st, Quality open since 09:00 on the 2nd.
    /// Station 2: Store down 10 minutes on the 2nd.
    async fn two_day_history() -> Reports<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        let layout = StationLayout::default();
        let (mut sequencer, _handle) = Sequencer::new(
            layout.clone(),
            chrono_tz::UTC,
            Arc::clone(&store),
            Arc::new(Dispatcher::default()),
        );
        let script = [
            ("1", payload(&[2], 10), at(1, 10, 0)),
            ("1", payload(&[], 10), at(1, 10, 5)),
            ("2", payload(&[5], 30), at(2, 8, 0)),
            ("2", payload(&[], 30), at(2, 8, 10)),
            ("1", payload(&[6], 20), at(2, 9, 0)),
        ];
        for (station, body, received_at) in script {
            sequencer.process(RawFrame::new(station, body, received_at)).await.unwrap();
        }
        Reports::new(store, layout.categories().clone(), chrono_tz::UTC)
    }

    #[tokio::test]
    async fn test_dashboard_summary_covers_today_only() {
        let reports = two_day_history().await;
        let summary = reports.dashboard_summary(at(2, 12, 0)).await.unwrap();

        assert_eq!(summary.day, day(2));
        assert_eq!(summary.total_stations, 2);
        assert_eq!(summary.total_production, 50);
        assert!((summary.average_efficiency - 25.0).abs() < 1e-9);
        assert!((summary.total_downtime - 10.0).abs() < 1e-9);
        assert_eq!(summary.active_faults, 1);
        assert_eq!(summary.faults_by_type.len(), 4);
        assert_eq!(summary.faults_by_type[&Category::new("Quality")], 1);
        assert_eq!(summary.faults_by_type[&Category::new("Production")], 0);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["faultsByType"]["Quality"], 1);
        assert_eq!(json["day"], "2024-03-02");
    }

    #[tokio::test]
    async fn test_station_stats_window() {
        let reports = two_day_history().await;

        let week = reports.station_stats("1", 7, at(2, 12, 0)).await.unwrap().unwrap();
        assert_eq!(week.from, NaiveDate::from_ymd_opt(2024, 2, 25).unwrap());
        assert_eq!(week.to, day(2));
        assert_eq!(week.actual_count, 20);
        assert!((week.efficiency - 20.0).abs() < 1e-9);
        assert!((week.total_downtime - 5.0).abs() < 1e-9);
        assert_eq!(week.downtime_by_category.get(&Category::new("Production")), Some(&5.0));
        assert_eq!(week.faults_opened, 2);
        assert_eq!(week.open_faults, vec![Category::new("Quality")]);

        let today = reports.station_stats("1", 0, at(2, 12, 0)).await.unwrap().unwrap();
        assert_eq!(today.days, 1);
        assert_eq!(today.from, day(2));
        assert_eq!(today.total_downtime, 0.0);
        assert!(today.daily.is_empty());
        assert_eq!(today.faults_opened, 1);

        assert!(reports.station_stats("9", 7, at(2, 12, 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_daily_records_and_fault_history() {
        let reports = two_day_history().await;

        let records = reports.daily_records().await.unwrap();
        let keys: Vec<(&str, NaiveDate)> = records.iter().map(|r| (r.station_id.as_str(), r.day)).collect();
        assert_eq!(keys, vec![("2", day(2)), ("1", day(1))]);

        let first_day = reports.fault_history(Some(day(1))).await.unwrap();
        assert_eq!(first_day.len(), 1);
        assert_eq!(first_day[0].closed_at, Some(at(1, 10, 5)));

        let all = reports.fault_history(None).await.unwrap();
        let opened: Vec<DateTime<Utc>> = all.iter().map(|r| r.opened_at).collect();
        assert_eq!(opened, vec![at(2, 9, 0), at(2, 8, 0), at(1, 10, 0)]);
    }

    #[test]
    fn test_plant_day_boundaries_follow_the_timezone() {
        let athens = chrono_tz::Europe::Athens;
        assert_eq!(day_start(&athens, day(1)), Utc.with_ymd_and_hms(2024, 2, 29, 22, 0, 0).unwrap());
        assert_eq!(day_start(&chrono_tz::UTC, day(1)), at(1, 0, 0));

        let reports = Reports::new(Arc::new(MemoryStore::default()), CategoryTable::default(), athens);
        assert_eq!(reports.today(at(1, 23, 30)), day(2));
    }
}
