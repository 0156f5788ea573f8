//! # Fault Lifecycle Tracker
//!
//! One two-state machine per `(station, category)`: **Normal** (no open record) and
//! **Faulted** (exactly one open record). Channel transitions drive it:
//!
//! - `1 -> 0` on a category channel opens a record, unless one is already open.
//! - `0 -> 1` closes the open record and books its downtime against the plant-local day of
//!   the close. Without an open record the close is an orphan and only logged.
//!
//! Work is split in two. [`FaultTracker::plan`] is pure: it reads the open-record index and
//! returns the store mutations plus the change notifications. [`FaultTracker::apply`] updates
//! the index and must only run after the mutations were committed, so a failed write leaves
//! the tracker exactly as it was.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{Category, CategoryTable, ChannelTransition};

/// A persisted fault occurrence. `closed_at` is `None` while the fault is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    pub station_id: String,
    pub category: Category,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl FaultRecord {
    /// A new open record, with `closed_at` unset.
    pub fn open(station_id: impl Into<String>, category: Category, opened_at: DateTime<Utc>) -> Self {
        Self {
            station_id: station_id.into(),
            category,
            opened_at,
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// A write the store must perform for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultMutation {
    /// Insert a new open fault record.
    Open {
        station_id: String,
        category: Category,
        opened_at: DateTime<Utc>,
    },
    /// Close the most recent open record for the key and add `downtime_minutes` to the
    /// `(station_id, category, day)` aggregate.
    Close {
        station_id: String,
        category: Category,
        opened_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
        downtime_minutes: f64,
        day: NaiveDate,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Fault,
    Resolved,
}

/// One entry of the `changes` array in a broadcast event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultChange {
    pub category: Category,
    pub kind: ChangeKind,
    pub at: DateTime<Utc>,
}

/// Output of [`FaultTracker::plan`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultPlan {
    pub mutations: Vec<FaultMutation>,
    pub changes: Vec<FaultChange>,
    /// Categories that saw a close without an open record.
    pub orphans: Vec<Category>,
}

/// Open-record index for every station, owned by the sequencer worker.
#[derive(Debug)]
pub struct FaultTracker {
    categories: CategoryTable,
    timezone: Tz,
    open: HashMap<String, BTreeMap<Category, DateTime<Utc>>>,
}

impl FaultTracker {
    /// Creates a tracker with nothing open.
    ///
    /// # Arguments
    ///
    /// * `categories` - Categories the tracker accounts for.
    /// * `timezone` - Plant timezone. Downtime is booked to the plant day the fault closed on.
    pub fn new(categories: CategoryTable, timezone: Tz) -> Self {
        Self {
            categories,
            timezone,
            open: HashMap::new(),
        }
    }

    pub fn categories(&self) -> &CategoryTable {
        &self.categories
    }

    /// Computes what `transitions` mean for `station_id` without touching the index.
    /// Transitions on channels outside the category table are ignored.
    pub fn plan(&self, station_id: &str, transitions: &[ChannelTransition], at: DateTime<Utc>) -> FaultPlan {
        let mut plan = FaultPlan::default();

        for transition in transitions {
            let Some(category) = self.categories.category_for(transition.channel_index) else {
                continue;
            };

            if transition.is_open() {
                if let Some(since) = self.open_since(station_id, category) {
                    log::debug!(
                        "Station {} already has an open {} fault since {}; ignoring repeated open.",
                        station_id,
                        category,
                        since
                    );
                    continue;
                }
                plan.mutations.push(FaultMutation::Open {
                    station_id: station_id.to_string(),
                    category: category.clone(),
                    opened_at: at,
                });
                plan.changes.push(FaultChange {
                    category: category.clone(),
                    kind: ChangeKind::Fault,
                    at,
                });
            } else if transition.is_close() {
                let Some(opened_at) = self.open_since(station_id, category) else {
                    log::warn!(
                        "Orphan close: station {} cleared {} at {} with no open fault record.",
                        station_id,
                        category,
                        at
                    );
                    plan.orphans.push(category.clone());
                    continue;
                };
                plan.mutations.push(FaultMutation::Close {
                    station_id: station_id.to_string(),
                    category: category.clone(),
                    opened_at,
                    closed_at: at,
                    downtime_minutes: self.downtime_minutes(station_id, category, opened_at, at),
                    day: at.with_timezone(&self.timezone).date_naive(),
                });
                plan.changes.push(FaultChange {
                    category: category.clone(),
                    kind: ChangeKind::Resolved,
                    at,
                });
            }
        }

        plan
    }

    /// Commits a plan to the index. Call only after its mutations were persisted.
    pub fn apply(&mut self, plan: &FaultPlan) {
        for mutation in &plan.mutations {
            match mutation {
                FaultMutation::Open { station_id, category, opened_at } => {
                    self.open
                        .entry(station_id.clone())
                        .or_default()
                        .entry(category.clone())
                        .or_insert(*opened_at);
                }
                FaultMutation::Close { station_id, category, .. } => {
                    if let Some(by_category) = self.open.get_mut(station_id) {
                        by_category.remove(category);
                        if by_category.is_empty() {
                            self.open.remove(station_id);
                        }
                    }
                }
            }
        }
    }

    /// Rebuilds the index from persisted records, skipping closed ones. When a key has more
    /// than one open record the most recent `opened_at` wins. Returns the number of keys
    /// seeded.
    pub fn seed<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = FaultRecord>,
    {
        let mut seeded = 0;
        for record in records.into_iter().filter(FaultRecord::is_open) {
            let by_category = self.open.entry(record.station_id.clone()).or_default();
            match by_category.get_mut(&record.category) {
                Some(existing) => {
                    log::warn!(
                        "Station {} has several open {} records; keeping the most recent.",
                        record.station_id,
                        record.category
                    );
                    if record.opened_at > *existing {
                        *existing = record.opened_at;
                    }
                }
                None => {
                    by_category.insert(record.category, record.opened_at);
                    seeded += 1;
                }
            }
        }
        seeded
    }

    /// When the open fault for the key started, if one is open.
    pub fn open_since(&self, station_id: &str, category: &Category) -> Option<DateTime<Utc>> {
        self.open.get(station_id)?.get(category).copied()
    }

    pub fn is_open(&self, station_id: &str, category: &Category) -> bool {
        self.open_since(station_id, category).is_some()
    }

    /// Open categories of one station, sorted by name.
    pub fn open_categories(&self, station_id: &str) -> Vec<Category> {
        self.open
            .get(station_id)
            .map(|by_category| by_category.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Total open records across all stations.
    pub fn open_count(&self) -> usize {
        self.open.values().map(BTreeMap::len).sum()
    }

    fn downtime_minutes(
        &self,
        station_id: &str,
        category: &Category,
        opened_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    ) -> f64 {
        let minutes = (closed_at - opened_at).num_milliseconds() as f64 / 60_000.0;
        if minutes < 0.0 {
            log::warn!(
                "Station {} {} closed at {} before it opened at {}; booking 0 minutes.",
                station_id,
                category,
                closed_at,
                opened_at
            );
            return 0.0;
        }
        minutes
    }
}
