//! Core data types shared across the engine
//!
//! This module contains the small value types that cross module boundaries:
//! connection state, pin identifiers and the engine statistics counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// MIDI controller number of analog pin 0. Digital pin `n` uses controller `n + 1`.
pub const ANALOG_CC_BASE: u8 = 101;

/// Kind of a device input pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinKind {
    Digital,
    Analog,
}

impl PinKind {
    /// Label prefix used in the configuration maps
    pub fn prefix(&self) -> char {
        match self {
            PinKind::Digital => 'D',
            PinKind::Analog => 'A',
        }
    }
}

/// A device pin, addressed by its 0-based index on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinId {
    pub kind: PinKind,
    pub index: usize,
}

impl PinId {
    pub fn digital(index: usize) -> Self {
        Self {
            kind: PinKind::Digital,
            index,
        }
    }

    pub fn analog(index: usize) -> Self {
        Self {
            kind: PinKind::Analog,
            index,
        }
    }

    /// Configuration label (`D1`, `A3`, ...). Labels are 1-based.
    pub fn label(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.index + 1)
    }

    /// Parse a configuration label back into a pin
    pub fn from_label(label: &str) -> Option<Self> {
        let mut chars = label.chars();
        let kind = match chars.next()? {
            'D' | 'd' => PinKind::Digital,
            'A' | 'a' => PinKind::Analog,
            _ => return None,
        };
        let number: usize = chars.as_str().parse().ok()?;
        if number == 0 {
            return None;
        }
        Some(Self {
            kind,
            index: number - 1,
        })
    }

    /// MIDI controller number this pin is mapped to
    pub fn controller(&self) -> u8 {
        let cc = match self.kind {
            PinKind::Digital => self.index + 1,
            PinKind::Analog => ANALOG_CC_BASE as usize + self.index,
        };
        cc.min(127) as u8
    }
}

impl std::fmt::Display for PinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// State of the link to the pedal board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Looking for a device (initial state and after a loss)
    #[default]
    Searching,
    /// Port open and heartbeat confirmed
    Connected,
    /// The link was lost; a search will follow unless reconnection is disabled
    Disconnected,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Searching => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnected => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnected,
            _ => ConnectionState::Searching,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Searching => write!(f, "SEARCHING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Connection state readable from any thread
#[derive(Debug, Default)]
pub struct SharedState(AtomicU8);

impl SharedState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Store a new state, returning the previous one
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state.as_u8(), Ordering::SeqCst))
    }
}

/// Counters kept by the read loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Frames decoded successfully
    pub frames: u64,
    /// Frames dropped because they were truncated or garbled
    pub framing_errors: u64,
    /// Stray bytes skipped while looking for a header
    pub noise_bytes: u64,
    /// MIDI messages sent
    pub midi_sent: u64,
    /// Analog MIDI messages suppressed because the value did not change
    pub midi_suppressed: u64,
    /// Successful connections (first connection included)
    pub connections: u64,
    /// Events dropped because the event queue was full
    pub dropped_events: u64,
}
