//! Device self-description reported by INFO frames

use super::codec::join_value;
use crate::error::FramingError;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Settings of one analog input as reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalogPinInfo {
    /// Highest raw value the converter produces
    pub resolution: u16,
    pub filter_type: u8,
    /// Smoothing percentage
    pub smoothing: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub num_digital: usize,
    pub num_analog: usize,
    pub analog: Vec<AnalogPinInfo>,
    pub received_at: DateTime<Utc>,
}

impl DeviceInfo {
    /// Parse an INFO payload: `num_digital, num_analog` then four bytes per analog pin
    pub fn from_payload(payload: &[u8]) -> Result<Self, FramingError> {
        let truncated = |expected: usize| FramingError::Truncated {
            opcode: 'I',
            expected,
            got: payload.len(),
        };
        let (&num_digital, &num_analog) = match payload {
            [d, a, ..] => (d, a),
            _ => return Err(truncated(2)),
        };
        let expected = 2 + 4 * num_analog as usize;
        if payload.len() < expected {
            return Err(truncated(expected));
        }

        let analog = payload[2..expected]
            .chunks_exact(4)
            .map(|chunk| AnalogPinInfo {
                resolution: join_value(chunk[0], chunk[1]),
                filter_type: chunk[2],
                smoothing: chunk[3],
            })
            .collect();

        Ok(Self {
            num_digital: num_digital as usize,
            num_analog: num_analog as usize,
            analog,
            received_at: Utc::now(),
        })
    }

    /// JSON rendering for the `info/get` command
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}
