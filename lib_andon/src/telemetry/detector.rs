//! Level-change detection between the last-applied frame and an incoming one.

use serde::Serialize;

use super::{SignalLevel, StationFrame};

/// A channel whose level differs between two consecutive frames of one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTransition {
    pub channel_index: usize,
    pub from: SignalLevel,
    pub to: SignalLevel,
}

impl ChannelTransition {
    /// `1 -> 0`: the operator pressed the call button.
    pub fn is_open(&self) -> bool {
        self.from == SignalLevel::Normal && self.to == SignalLevel::Asserted
    }

    /// `0 -> 1`: the call was cleared.
    pub fn is_close(&self) -> bool {
        self.from == SignalLevel::Asserted && self.to == SignalLevel::Normal
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransitionDetector {
    production_channel: usize,
    channel_count: usize,
}

impl TransitionDetector {
    /// Creates a detector with no remembered levels.
    ///
    /// # Arguments
    ///
    /// * `production_channel` - Channel whose counter is tracked instead of its level.
    /// * `channel_count` - Number of channels in every frame.
    pub fn new(production_channel: usize, channel_count: usize) -> Self {
        Self {
            production_channel,
            channel_count,
        }
    }

    /// Every channel whose level changed, in ascending channel order. A missing previous
    /// frame is read as all-normal, so a station's first frame can only open faults.
    pub fn detect(&self, previous: Option<&StationFrame>, current: &StationFrame) -> Vec<ChannelTransition> {
        (0..self.channel_count)
            .filter_map(|channel_index| {
                let from = previous
                    .map(|p| p.level(channel_index))
                    .unwrap_or(SignalLevel::Normal);
                let to = current.level(channel_index);
                (from != to).then_some(ChannelTransition {
                    channel_index,
                    from,
                    to,
                })
            })
            .collect()
    }

    /// The production counter to persist, if it needs persisting: always on a station's first
    /// frame, afterwards only when the value differs from the stored one. Level changes on the
    /// production channel play no part.
    pub fn production_update(&self, previous: Option<&StationFrame>, current: &StationFrame) -> Option<u64> {
        let count = current.reading(self.production_channel)?.counter;
        match previous.and_then(|p| p.reading(self.production_channel)) {
            Some(prev) if prev.counter == count => None,
            _ => Some(count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::FrameDecoder;

    fn frame(payload: &str) -> StationFrame {
        let readings = FrameDecoder::new(8).decode_readings(payload).unwrap();
        StationFrame {
            station_id: "7".to_string(),
            readings,
            received_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_first_frame_compares_against_all_normal() {
        let detector = TransitionDetector::new(1, 8);
        let current = frame("{1,0,1,10,0,1,1,0,1,0,1,0,1,0,1,0}");

        let transitions = detector.detect(None, &current);
        assert_eq!(
            transitions,
            vec![ChannelTransition {
                channel_index: 2,
                from: SignalLevel::Normal,
                to: SignalLevel::Asserted,
            }]
        );
        assert!(transitions[0].is_open());
        assert_eq!(detector.production_update(None, &current), Some(10));
    }

    #[test]
    fn test_unchanged_frame_yields_nothing() {
        let detector = TransitionDetector::new(1, 8);
        let a = frame("{1,0,1,10,0,1,1,0,1,0,1,0,1,0,1,0}");
        let b = a.clone();
        assert!(detector.detect(Some(&a), &b).is_empty());
        assert_eq!(detector.production_update(Some(&a), &b), None);
    }

    #[test]
    fn test_transitions_are_ordered_by_channel() {
        let detector = TransitionDetector::new(1, 8);
        let prev = frame("{1,0,1,10,0,1,1,0,1,0,1,0,1,0,1,0}");
        let cur = frame("{0,0,1,11,1,1,1,0,1,0,0,0,0,0,1,0}");

        let transitions = detector.detect(Some(&prev), &cur);
        let channels: Vec<_> = transitions.iter().map(|t| t.channel_index).collect();
        assert_eq!(channels, vec![0, 2, 5, 6]);
        assert!(transitions[1].is_close());
        assert!(transitions[2].is_open() && transitions[3].is_open());
        assert_eq!(detector.production_update(Some(&prev), &cur), Some(11));
    }

    #[test]
    fn test_production_counter_ignores_level_changes() {
        let detector = TransitionDetector::new(1, 8);
        let prev = frame("{1,0,1,10,1,0,1,0,1,0,1,0,1,0,1,0}");
        let cur = frame("{1,0,0,10,1,0,1,0,1,0,1,0,1,0,1,0}");
        assert_eq!(detector.detect(Some(&prev), &cur).len(), 1);
        assert_eq!(detector.production_update(Some(&prev), &cur), None);
    }
}
