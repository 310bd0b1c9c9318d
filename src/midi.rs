//! MIDI output
//!
//! The engine only emits control-change messages, through the [`MidiSink`]
//! trait. [`MidirSink`] writes to a real (or, on unix, virtual) port,
//! [`NullMidiSink`] discards messages when no MIDI system is available, and
//! [`MemoryMidiSink`] records them for tests.

use crate::error::Result;
use midir::{MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use std::sync::Arc;

/// Client name registered with the MIDI system
const CLIENT_NAME: &str = "pedlbrd";

/// A MIDI control-change message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlChange {
    pub channel: u8,
    pub controller: u8,
    pub value: u8,
}

impl ControlChange {
    pub fn new(channel: u8, controller: u8, value: u8) -> Self {
        Self {
            channel,
            controller,
            value,
        }
    }

    /// Wire bytes (status, controller, value)
    pub fn to_bytes(self) -> [u8; 3] {
        [
            0xB0 | self.channel.min(15),
            self.controller & 0x7F,
            self.value & 0x7F,
        ]
    }
}

/// Destination of the engine's MIDI messages
#[cfg_attr(test, mockall::automock)]
pub trait MidiSink: Send {
    fn send(&mut self, cc: ControlChange) -> Result<()>;
}

/// Output through `midir`
pub struct MidirSink {
    connection: MidiOutputConnection,
    port_name: String,
}

impl MidirSink {
    /// Open the output port
    ///
    /// On unix a virtual port called `name` is created. Elsewhere the first
    /// port whose name contains `name` is used, falling back to the first
    /// port.
    pub fn open(name: &str) -> Result<Self> {
        let output = MidiOutput::new(CLIENT_NAME)?;

        #[cfg(unix)]
        {
            use midir::os::unix::VirtualOutput;
            let connection = output.create_virtual(name)?;
            tracing::info!("Created virtual MIDI port '{}'", name);
            Ok(Self {
                connection,
                port_name: name.to_string(),
            })
        }

        #[cfg(not(unix))]
        {
            let ports = output.ports();
            let wanted = name.to_lowercase();
            let port = ports
                .iter()
                .find(|p| {
                    output
                        .port_name(p)
                        .map(|n| n.to_lowercase().contains(&wanted))
                        .unwrap_or(false)
                })
                .or_else(|| ports.first())
                .ok_or_else(|| crate::error::PedlError::Midi("no MIDI output ports".to_string()))?
                .clone();
            let port_name = output
                .port_name(&port)
                .unwrap_or_else(|_| "unknown".to_string());
            let connection = output.connect(&port, CLIENT_NAME)?;
            tracing::info!("Connected to MIDI port '{}'", port_name);
            Ok(Self {
                connection,
                port_name,
            })
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl MidiSink for MidirSink {
    fn send(&mut self, cc: ControlChange) -> Result<()> {
        self.connection.send(&cc.to_bytes())?;
        Ok(())
    }
}

/// Names of the MIDI output ports currently visible
pub fn list_output_ports() -> Vec<String> {
    let Ok(output) = MidiOutput::new(CLIENT_NAME) else {
        return Vec::new();
    };
    output
        .ports()
        .iter()
        .enumerate()
        .map(|(i, port)| {
            output
                .port_name(port)
                .unwrap_or_else(|_| format!("Unknown Device {}", i))
        })
        .collect()
}

/// Sink that discards every message
#[derive(Debug, Default)]
pub struct NullMidiSink {
    dropped: u64,
}

impl NullMidiSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl MidiSink for NullMidiSink {
    fn send(&mut self, cc: ControlChange) -> Result<()> {
        self.dropped += 1;
        tracing::trace!(
            "MIDI dropped ch{} cc{} = {}",
            cc.channel,
            cc.controller,
            cc.value
        );
        Ok(())
    }
}

/// Sink that records every message
///
/// Clones share the same record, which grows without bound. Use it in tests
/// only.
#[derive(Debug, Clone, Default)]
pub struct MemoryMidiSink {
    sent: Arc<Mutex<Vec<ControlChange>>>,
}

impl MemoryMidiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ControlChange> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<ControlChange> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl MidiSink for MemoryMidiSink {
    fn send(&mut self, cc: ControlChange) -> Result<()> {
        tracing::trace!(
            "MIDI ch{} cc{} = {}",
            cc.channel,
            cc.controller,
            cc.value
        );
        self.sent.lock().push(cc);
        Ok(())
    }
}
