//! Network command/telemetry transport
//!
//! Remote clients talk to the engine with addressed messages carrying typed
//! positional arguments (OSC style). The engine only depends on the
//! [`NetTransport`] trait; [`UdpTransport`] speaks OSC over UDP and
//! [`MemoryTransport`] keeps everything in-process.
//!
//! - [`Telemetry`] - fan-out helpers for data/UI addresses, replies and errors

pub mod memory;
pub mod telemetry;
pub mod udp;

pub use memory::MemoryTransport;
pub use telemetry::Telemetry;
pub use udp::UdpTransport;

use crate::error::{PedlError, Result};
use std::time::Duration;

/// Host used when an address only names a port
pub const DEFAULT_HOST: &str = "localhost";

/// One positional argument of a network message
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i32),
    Float(f32),
    Str(String),
}

impl Arg {
    /// Signature character for this argument (`i`, `f` or `s`)
    pub fn type_tag(&self) -> char {
        match self {
            Arg::Int(_) => 'i',
            Arg::Float(_) => 'f',
            Arg::Str(_) => 's',
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Arg::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Arg::Float(v) => Some(*v),
            Arg::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Int(v) => write!(f, "{}", v),
            Arg::Float(v) => write!(f, "{}", v),
            Arg::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Arg::Float(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

/// Signature string of an argument list (`"isf"`)
pub fn signature_of(args: &[Arg]) -> String {
    args.iter().map(Arg::type_tag).collect()
}

/// An addressed message with typed arguments
#[derive(Debug, Clone, PartialEq)]
pub struct NetMessage {
    pub path: String,
    pub args: Vec<Arg>,
}

impl NetMessage {
    pub fn new(path: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            path: path.into(),
            args,
        }
    }
}

/// Destination (or origin) of a network message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetAddress {
    pub host: String,
    pub port: u16,
}

impl NetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` or a bare `port` (which means localhost)
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with_host(text, DEFAULT_HOST)
    }

    /// Parse `host:port`, or a bare `port` on `default_host`
    pub fn parse_with_host(text: &str, default_host: &str) -> Result<Self> {
        let text = text.trim();
        let (host, port) = match text.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => (host, port),
            Some((_, port)) => (default_host, port),
            None => (default_host, text),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| PedlError::Transport(format!("could not parse address: {}", text)))?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for NetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A message received from the network, with its sender
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub message: NetMessage,
    pub source: NetAddress,
}

/// Message-addressed network transport
///
/// Implementations must be usable from the read loop and the command thread
/// at the same time.
pub trait NetTransport: Send + Sync {
    /// Send a message to an address. Delivery is best effort.
    fn send(&self, to: &NetAddress, message: &NetMessage) -> Result<()>;

    /// Wait up to `timeout` for the next incoming message
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Incoming>>;

    /// Get ready to send to `targets` (e.g. resolve host names ahead of time)
    fn prepare(&self, _targets: &[NetAddress]) {}
}
