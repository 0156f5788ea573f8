//! # Frame Decoder
//!
//! Parses the ASCII payload published by a call box, `{l0,c0,l1,c1,...}`, into a
//! `StationFrame`. A payload is either accepted whole or rejected with a `FrameError`;
//! nothing is ever partially applied.

use thiserror::Error;

use super::{ChannelReading, RawFrame, SignalLevel, StationFrame};

/// Why a payload was rejected. Every variant is a `MalformedFrame` condition: the caller logs
/// it and discards the frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: payload is not valid UTF-8")]
    NotUtf8,
    #[error("malformed frame: payload must be wrapped in '{{' and '}}'")]
    MissingBraces,
    #[error("malformed frame: expected {expected} tokens, found {found}")]
    TokenCount { expected: usize, found: usize },
    #[error("malformed frame: token {position} ('{token}') is not a non-negative integer")]
    InvalidToken { position: usize, token: String },
    #[error("malformed frame: channel {channel} level must be 0 or 1, got {value}")]
    InvalidLevel { channel: usize, value: u64 },
}

/// Stateless decoder for a fixed channel count.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    channel_count: usize,
}

impl FrameDecoder {
    /// Creates a decoder expecting `channel_count` level/counter pairs per payload.
    pub fn new(channel_count: usize) -> Self {
        Self { channel_count }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Decodes a raw transport frame, keeping its station id and receipt timestamp.
    pub fn decode(&self, raw: &RawFrame) -> Result<StationFrame, FrameError> {
        let text = std::str::from_utf8(&raw.payload).map_err(|_| FrameError::NotUtf8)?;
        let readings = self.decode_readings(text)?;
        Ok(StationFrame {
            station_id: raw.station_id.clone(),
            readings,
            received_at: raw.received_at,
        })
    }

    /// Decodes the body of a payload into exactly `channel_count` readings.
    pub fn decode_readings(&self, text: &str) -> Result<Vec<ChannelReading>, FrameError> {
        let body = text
            .trim()
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or(FrameError::MissingBraces)?;

        let tokens: Vec<&str> = body.split(',').map(str::trim).collect();
        let expected = self.channel_count * 2;
        if tokens.len() != expected {
            // "{}" splits into one empty token; report it as zero tokens.
            let found = if body.trim().is_empty() { 0 } else { tokens.len() };
            return Err(FrameError::TokenCount { expected, found });
        }

        let mut values = Vec::with_capacity(expected);
        for (position, token) in tokens.iter().enumerate() {
            values.push(parse_token(position, token)?);
        }

        values
            .chunks_exact(2)
            .enumerate()
            .map(|(channel_index, pair)| {
                let level = SignalLevel::from_wire(pair[0]).ok_or(FrameError::InvalidLevel {
                    channel: channel_index,
                    value: pair[0],
                })?;
                Ok(ChannelReading {
                    channel_index,
                    level,
                    counter: pair[1],
                })
            })
            .collect()
    }
}

fn parse_token(position: usize, token: &str) -> Result<u64, FrameError> {
    // u64::from_str accepts a leading '+', which the wire format does not.
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::InvalidToken {
            position,
            token: token.to_string(),
        });
    }
    token.parse::<u64>().map_err(|_| FrameError::InvalidToken {
        position,
        token: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn raw(payload: &str) -> RawFrame {
        RawFrame::new("7", payload, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
    }

    #[test]
    fn test_decodes_reference_payload() {
        let decoder = FrameDecoder::new(8);
        let frame = decoder
            .decode(&raw("{1,0,1,10,0,1,1,0,1,0,1,0,1,0,1,0}"))
            .expect("reference payload must decode");

        assert_eq!(frame.station_id, "7");
        assert_eq!(frame.readings.len(), 8);
        assert_eq!(frame.readings[1].counter, 10);
        assert_eq!(frame.readings[2].level, SignalLevel::Asserted);
        assert_eq!(frame.readings[2].counter, 1);
        assert!(frame
            .readings
            .iter()
            .enumerate()
            .all(|(i, r)| r.channel_index == i));
    }

    #[test]
    fn test_tolerates_surrounding_whitespace() {
        let decoder = FrameDecoder::new(2);
        let readings = decoder.decode_readings("  { 1, 5 ,0,7}\n").unwrap();
        assert_eq!(readings[0].counter, 5);
        assert_eq!(readings[1].level, SignalLevel::Asserted);
    }

    #[test]
    fn test_rejects_wrong_token_count() {
        let decoder = FrameDecoder::new(8);
        assert_eq!(
            decoder.decode(&raw("{1,0,1}")),
            Err(FrameError::TokenCount { expected: 16, found: 3 })
        );
        assert_eq!(
            decoder.decode(&raw("{}")),
            Err(FrameError::TokenCount { expected: 16, found: 0 })
        );
    }

    #[test]
    fn test_rejects_bad_tokens_and_levels() {
        let decoder = FrameDecoder::new(2);
        assert_eq!(
            decoder.decode_readings("{1,-3,1,0}"),
            Err(FrameError::InvalidToken { position: 1, token: "-3".to_string() })
        );
        assert_eq!(
            decoder.decode_readings("{1,+3,1,0}"),
            Err(FrameError::InvalidToken { position: 1, token: "+3".to_string() })
        );
        assert_eq!(
            decoder.decode_readings("{1,3,,0}"),
            Err(FrameError::InvalidToken { position: 2, token: String::new() })
        );
        assert_eq!(
            decoder.decode_readings("{1,3,2,0}"),
            Err(FrameError::InvalidLevel { channel: 1, value: 2 })
        );
        assert!(matches!(
            decoder.decode_readings("{1,99999999999999999999999,1,0}"),
            Err(FrameError::InvalidToken { position: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_missing_braces_and_binary_payloads() {
        let decoder = FrameDecoder::new(2);
        assert_eq!(decoder.decode_readings("1,0,1,0"), Err(FrameError::MissingBraces));
        assert_eq!(decoder.decode_readings("{1,0,1,0"), Err(FrameError::MissingBraces));

        let binary = RawFrame::new("7", vec![0xff, 0xfe, 0x7b], Utc::now());
        assert_eq!(decoder.decode(&binary), Err(FrameError::NotUtf8));
    }
}
