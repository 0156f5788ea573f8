//! # Telemetry Model
//!
//! Fixed-shape types shared by every pipeline stage, plus the immutable `StationLayout`
//! describing how a station frame is laid out on the wire.
//!
//! ## Contained Modules:
//! - **`frame`**: the `FrameDecoder` turning a raw payload into a `StationFrame`.
//! - **`state_store`**: last-applied frame per station.
//! - **`detector`**: level-change detection between two frames.
//! - **`lifecycle`**: the per-`(station, category)` fault state machine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decodes raw transport payloads.
pub mod frame;
/// Per-station last-applied frame.
pub mod state_store;
/// Channel level transition detection.
pub mod detector;
/// Fault open/close state machine and downtime accounting.
pub mod lifecycle;

pub use detector::{ChannelTransition, TransitionDetector};
pub use frame::{FrameDecoder, FrameError};
pub use lifecycle::{ChangeKind, FaultChange, FaultMutation, FaultPlan, FaultRecord, FaultTracker};
pub use state_store::StationStateStore;

/// Number of `(level, counter)` pairs in the reference deployment.
pub const DEFAULT_CHANNEL_COUNT: usize = 8;
/// Channel whose counter is the station's production tally.
pub const DEFAULT_PRODUCTION_CHANNEL: usize = 1;

/// Binary signal level of one channel. The device reports `1` for normal and `0` while the
/// operator holds the call button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalLevel {
    /// `0` on the wire.
    Asserted,
    /// `1` on the wire.
    Normal,
}

impl SignalLevel {
    /// Maps a wire value; anything but `0` or `1` is rejected.
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(SignalLevel::Asserted),
            1 => Some(SignalLevel::Normal),
            _ => None,
        }
    }
}

/// One `(level, counter)` slot of a station frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelReading {
    pub channel_index: usize,
    pub level: SignalLevel,
    /// Device-side event tally. Never reset by this system.
    pub counter: u64,
}

impl ChannelReading {
    /// The implicit reading of a channel nobody has heard from yet.
    pub fn normal(channel_index: usize) -> Self {
        Self {
            channel_index,
            level: SignalLevel::Normal,
            counter: 0,
        }
    }
}

/// A payload exactly as it came off the transport, stamped on receipt.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub station_id: String,
    pub payload: Vec<u8>,
    /// Receipt time assigned by the transport adapter; the device clock is not trusted.
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    /// # Arguments
    ///
    /// * `station_id` - Station id taken from the topic.
    /// * `payload` - Undecoded message body.
    /// * `received_at` - Receipt time, stamped by the transport.
    pub fn new(station_id: impl Into<String>, payload: impl Into<Vec<u8>>, received_at: DateTime<Utc>) -> Self {
        Self {
            station_id: station_id.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

/// A decoded frame: exactly `channel_count` readings in channel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationFrame {
    pub station_id: String,
    pub readings: Vec<ChannelReading>,
    pub received_at: DateTime<Utc>,
}

impl StationFrame {
    /// The all-normal frame assumed for a station before its first report.
    pub fn all_normal(station_id: impl Into<String>, channel_count: usize, at: DateTime<Utc>) -> Self {
        Self {
            station_id: station_id.into(),
            readings: (0..channel_count).map(ChannelReading::normal).collect(),
            received_at: at,
        }
    }

    /// Reading of `channel`, if the frame has one.
    pub fn reading(&self, channel: usize) -> Option<&ChannelReading> {
        self.readings.get(channel)
    }

    /// Level of `channel`, treating a missing slot as normal.
    pub fn level(&self, channel: usize) -> SignalLevel {
        self.reading(channel)
            .map(|r| r.level)
            .unwrap_or(SignalLevel::Normal)
    }
}

/// Named fault class such as `Production` or `Quality`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    /// Wraps a category name as configured, without normalising case.
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(name: &str) -> Self {
        Category::new(name)
    }
}

/// Rejections raised while validating a `StationLayout`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("a station frame needs at least one channel")]
    NoChannels,
    #[error("channel {channel} is out of range for a {channel_count}-channel frame")]
    ChannelOutOfRange { channel: usize, channel_count: usize },
    #[error("category '{0}' is mapped to more than one channel")]
    DuplicateCategory(String),
    #[error("category name for channel {0} is empty")]
    EmptyCategory(usize),
    #[error("production channel {0} is also mapped to a fault category")]
    ProductionChannelIsFault(usize),
}

/// Immutable channel-index → fault-category lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryTable {
    by_channel: BTreeMap<usize, Category>,
}

impl CategoryTable {
    /// Builds a table. Category names must be unique; range checks happen in
    /// [`StationLayout::new`] where the channel count is known.
    pub fn new<I, C>(entries: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = (usize, C)>,
        C: Into<Category>,
    {
        let mut by_channel = BTreeMap::new();
        for (channel, category) in entries {
            let category = category.into();
            if category.as_str().trim().is_empty() {
                return Err(LayoutError::EmptyCategory(channel));
            }
            if by_channel.values().any(|existing| existing == &category) {
                return Err(LayoutError::DuplicateCategory(category.to_string()));
            }
            by_channel.insert(channel, category);
        }
        Ok(Self { by_channel })
    }

    /// Category reported on `channel`; `None` for unmapped channels.
    pub fn category_for(&self, channel: usize) -> Option<&Category> {
        self.by_channel.get(&channel)
    }

    /// Inverse of [`CategoryTable::category_for`].
    pub fn channel_for(&self, category: &Category) -> Option<usize> {
        self.by_channel
            .iter()
            .find(|(_, c)| *c == category)
            .map(|(channel, _)| *channel)
    }

    /// Entries in ascending channel order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Category)> {
        self.by_channel.iter().map(|(channel, category)| (*channel, category))
    }

    pub fn len(&self) -> usize {
        self.by_channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }
}

impl Default for CategoryTable {
    /// Buttons 3, 4, 6 and 7 of the reference call box.
    fn default() -> Self {
        let by_channel = [(2, "Production"), (3, "Maintenance"), (5, "Store"), (6, "Quality")]
            .into_iter()
            .map(|(channel, name)| (channel, Category::new(name)))
            .collect();
        Self { by_channel }
    }
}

/// How a station frame is laid out: channel count, the production counter channel and the
/// fault category table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationLayout {
    channel_count: usize,
    production_channel: usize,
    categories: CategoryTable,
}

impl StationLayout {
    /// Validates a layout.
    ///
    /// # Arguments
    ///
    /// * `channel_count` - Channels per frame, at least one.
    /// * `production_channel` - Counter channel; must be below `channel_count`.
    /// * `categories` - Fault categories; none may sit on the production channel or past the last channel.
    ///
    /// # Returns
    ///
    /// The layout, or the first `LayoutError` found.
    pub fn new(
        channel_count: usize,
        production_channel: usize,
        categories: CategoryTable,
    ) -> Result<Self, LayoutError> {
        if channel_count == 0 {
            return Err(LayoutError::NoChannels);
        }
        if production_channel >= channel_count {
            return Err(LayoutError::ChannelOutOfRange {
                channel: production_channel,
                channel_count,
            });
        }
        if let Some((channel, _)) = categories.iter().find(|(channel, _)| *channel >= channel_count) {
            return Err(LayoutError::ChannelOutOfRange { channel, channel_count });
        }
        if categories.category_for(production_channel).is_some() {
            return Err(LayoutError::ProductionChannelIsFault(production_channel));
        }
        Ok(Self {
            channel_count,
            production_channel,
            categories,
        })
    }

    /// Channels per frame.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn production_channel(&self) -> usize {
        self.production_channel
    }

    /// Fault categories by channel.
    pub fn categories(&self) -> &CategoryTable {
        &self.categories
    }
}

impl Default for StationLayout {
    fn default() -> Self {
        Self {
            channel_count: DEFAULT_CHANNEL_COUNT,
            production_channel: DEFAULT_PRODUCTION_CHANNEL,
            categories: CategoryTable::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_matches_reference_call_box() {
        let layout = StationLayout::default();
        assert_eq!(layout.channel_count(), 8);
        assert_eq!(layout.production_channel(), 1);
        let names: Vec<_> = layout.categories().iter().map(|(i, c)| (i, c.as_str().to_string())).collect();
        assert_eq!(
            names,
            vec![
                (2, "Production".to_string()),
                (3, "Maintenance".to_string()),
                (5, "Store".to_string()),
                (6, "Quality".to_string()),
            ]
        );
        // The default must pass its own validation.
        assert!(StationLayout::new(8, 1, CategoryTable::default()).is_ok());
    }

    #[test]
    fn test_layout_rejects_out_of_range_and_overlapping_channels() {
        let table = CategoryTable::new([(9, "Production")]).unwrap();
        assert_eq!(
            StationLayout::new(8, 1, table),
            Err(LayoutError::ChannelOutOfRange { channel: 9, channel_count: 8 })
        );

        let table = CategoryTable::new([(1, "Production")]).unwrap();
        assert_eq!(StationLayout::new(8, 1, table), Err(LayoutError::ProductionChannelIsFault(1)));

        assert_eq!(
            StationLayout::new(8, 8, CategoryTable::default()),
            Err(LayoutError::ChannelOutOfRange { channel: 8, channel_count: 8 })
        );
    }

    #[test]
    fn test_category_table_rejects_duplicate_names() {
        let err = CategoryTable::new([(2, "Quality"), (6, "Quality")]).unwrap_err();
        assert_eq!(err, LayoutError::DuplicateCategory("Quality".to_string()));
    }

    #[test]
    fn test_category_lookup_both_directions() {
        let table = CategoryTable::default();
        assert_eq!(table.category_for(5).map(Category::as_str), Some("Store"));
        assert_eq!(table.category_for(4), None);
        assert_eq!(table.channel_for(&Category::new("Quality")), Some(6));
        assert_eq!(table.channel_for(&Category::new("JMD")), None);
    }
}
