//! # pedlbrd: Foot-Pedal Controller Bridge
//!
//! Reads a USB pedal board over a serial line, turns pedal and knob samples
//! into MIDI control changes and OSC telemetry, and exposes a small OSC
//! command surface for configuration and queries.
//!
//! ## Architecture
//!
//! - **Device engine**: a read loop that owns the serial port, decodes frames
//!   and runs each sample through the per-pin dispatch table
//! - **Command server**: receives OSC commands, on its own thread or polled
//!   from the read loop, and answers them directly or through the device
//! - **Telemetry**: OSC messages to the registered data and UI addresses
//! - **Communication**: crossbeam channels between the command server, the
//!   read loop and the embedding application
//!
//! ## Configuration
//!
//! The configuration is stored in the platform config directory under
//! `pedlbrd`:
//!
//! - **Linux**: `~/.config/pedlbrd/`
//! - **macOS**: `~/Library/Application Support/pedlbrd/`
//! - **Windows**: `%APPDATA%\pedlbrd\`
//!
//! ## Example
//!
//! ```ignore
//! use pedlbrd::{
//!     config::{Config, ConfigStore},
//!     device::{DeviceEngine, EngineOptions, EngineParts, SystemPorts},
//!     midi::MidirSink,
//!     net::UdpTransport,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> pedlbrd::Result<()> {
//!     let path = Config::default_path()?;
//!     let config = Config::load_or_default(&path);
//!     let parts = EngineParts {
//!         midi: Box::new(MidirSink::open(&config.midi_device_name)?),
//!         transport: Arc::new(UdpTransport::bind(config.osc_port)?),
//!         discovery: Box::new(SystemPorts::new()),
//!     };
//!     let store = ConfigStore::with_path(config, path);
//!     let (engine, _handle) = DeviceEngine::new(store, parts, EngineOptions::default());
//!     engine.run()?;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod midi;
pub mod net;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use command::{CommandServer, CommandTable};
pub use config::{Config, ConfigStore};
pub use device::{DeviceEngine, EngineEvent, EngineHandle, EngineOptions, EngineParts};
pub use error::{CommandError, FramingError, PedlError, Result};
pub use types::{ConnectionState, EngineStats, PinId};
