//! Error handling for the pedal bridge
//!
//! This module defines the error taxonomy used across the engine:
//!
//! - [`FramingError`] - a truncated or garbled serial frame (dropped, never fatal)
//! - [`CommandError`] - a remote command that could not be executed (reported to the caller)
//! - [`PedlError`] - everything else, including port I/O failures and startup errors

use thiserror::Error;

/// A serial frame that could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The serial read timed out before the whole payload arrived
    #[error("truncated frame '{opcode}': expected {expected} payload bytes, got {got}")]
    Truncated {
        opcode: char,
        expected: usize,
        got: usize,
    },

    /// Header byte carrying an opcode the device never sends
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    /// A header byte showed up where a payload byte was expected
    #[error("unexpected header byte 0x{byte:02X} inside '{opcode}' payload")]
    UnexpectedHeader { opcode: char, byte: u8 },

    /// A variable-length frame declared an impossible size
    #[error("bad '{opcode}' frame: {reason}")]
    BadLength { opcode: char, reason: String },

    /// The payload is well framed but its contents make no sense
    #[error("bad '{opcode}' payload: {reason}")]
    BadPayload { opcode: char, reason: String },
}

/// A remote command that failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("bad arguments for {path}: expected '{expected}', got '{got}'")]
    BadArguments {
        path: String,
        expected: String,
        got: String,
    },

    #[error("{what} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        what: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("could not parse reply id from '{0}'")]
    BadReplyId(String),

    #[error("unknown correlation id {0}")]
    UnknownCorrelationId(u8),

    #[error("no free correlation id ({0} requests pending)")]
    RegistryFull(usize),

    #[error("device not connected")]
    NotConnected,

    #[error("device reported error code {0}")]
    Device(u8),

    #[error("device did not answer within {0} ms")]
    DeviceTimeout(u64),

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// Shorthand for a range check failure
    pub fn out_of_range(what: impl Into<String>, value: i64, min: i64, max: i64) -> Self {
        CommandError::OutOfRange {
            what: what.into(),
            value,
            min,
            max,
        }
    }
}

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum PedlError {
    /// Garbled serial data
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// The serial port failed (usually the device was unplugged)
    #[error("Port I/O error on {port}: {source}")]
    PortIo {
        port: String,
        #[source]
        source: std::io::Error,
    },

    /// No candidate port answered with a heartbeat
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Remote command failure
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// `set` on a key path that does not exist or does not type-check
    #[error("Config path error at '{path}': {reason}")]
    ConfigPath { path: String, reason: String },

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to the MIDI output port
    #[error("MIDI error: {0}")]
    Midi(String),

    /// Errors related to the network transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PedlError>,
    },
}

impl PedlError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PedlError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Wrap an I/O failure on a named serial port
    pub fn port_io(port: impl Into<String>, source: std::io::Error) -> Self {
        PedlError::PortIo {
            port: port.into(),
            source,
        }
    }

    pub fn config_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        PedlError::ConfigPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error should stop the engine
    pub fn is_fatal(&self) -> bool {
        match self {
            PedlError::DeviceNotFound(_) => true,
            PedlError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

impl From<midir::InitError> for PedlError {
    fn from(e: midir::InitError) -> Self {
        PedlError::Midi(e.to_string())
    }
}

impl From<midir::ConnectError<midir::MidiOutput>> for PedlError {
    fn from(e: midir::ConnectError<midir::MidiOutput>) -> Self {
        PedlError::Midi(e.to_string())
    }
}

impl From<midir::SendError> for PedlError {
    fn from(e: midir::SendError) -> Self {
        PedlError::Midi(e.to_string())
    }
}

impl From<rosc::OscError> for PedlError {
    fn from(e: rosc::OscError) -> Self {
        PedlError::Transport(format!("{:?}", e))
    }
}

impl From<serialport::Error> for PedlError {
    fn from(e: serialport::Error) -> Self {
        PedlError::Io(e.into())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, PedlError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PedlError::DeviceNotFound("no heartbeat on /dev/ttyACM0".to_string());
        assert_eq!(
            err.to_string(),
            "Device not found: no heartbeat on /dev/ttyACM0"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = PedlError::Config("bad file".to_string());
        let with_ctx = err.with_context("Failed to load config");
        assert!(with_ctx.to_string().contains("Failed to load config"));
    }

    #[test]
    fn test_fatal_only_for_device_not_found() {
        assert!(PedlError::DeviceNotFound("x".into()).is_fatal());
        assert!(PedlError::DeviceNotFound("x".into())
            .with_context("startup")
            .is_fatal());
        assert!(!PedlError::Command(CommandError::NotConnected).is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(!PedlError::port_io("/dev/ttyACM0", io).is_fatal());
    }

    #[test]
    fn test_framing_error_display() {
        let err = FramingError::Truncated {
            opcode: 'A',
            expected: 3,
            got: 1,
        };
        assert!(err.to_string().contains("expected 3"));
        assert_eq!(
            FramingError::UnknownOpcode(0x7A).to_string(),
            "unknown opcode 0x7A"
        );
    }

    #[test]
    fn test_out_of_range_display() {
        let err = CommandError::out_of_range("midi channel", 16, 0, 15);
        assert_eq!(
            err.to_string(),
            "midi channel out of range: 16 (allowed 0..=15)"
        );
    }
}
