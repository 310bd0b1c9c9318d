//! OSC over UDP
//!
//! Bundles are flattened: every message inside a received bundle is queued
//! and handed out one by one.
//!
//! Host names are resolved once and cached. A failed send drops the cached
//! entry so the next send resolves again.

use super::{Arg, Incoming, NetAddress, NetMessage, NetTransport};
use crate::error::{PedlError, Result};
use parking_lot::Mutex;
use rosc::{OscMessage, OscPacket, OscType};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 8192;

/// UDP socket speaking OSC 1.0
pub struct UdpTransport {
    socket: UdpSocket,
    backlog: Mutex<VecDeque<Incoming>>,
    resolved: Mutex<HashMap<NetAddress, SocketAddr>>,
}

impl UdpTransport {
    /// Bind to `port` on all interfaces (0 picks a free port)
    pub fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .map_err(|e| PedlError::Transport(format!("could not bind UDP port {}: {}", port, e)))?;
        tracing::info!("OSC server listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            backlog: Mutex::new(VecDeque::new()),
            resolved: Mutex::new(HashMap::new()),
        })
    }

    /// Port the socket is bound to
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Socket address of `to`, from the cache or a fresh lookup
    ///
    /// The socket is IPv4, so IPv4 results are preferred.
    fn resolve(&self, to: &NetAddress) -> Result<SocketAddr> {
        if let Some(addr) = self.resolved.lock().get(to) {
            return Ok(*addr);
        }
        let addrs: Vec<SocketAddr> = (to.host.as_str(), to.port).to_socket_addrs()?.collect();
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| PedlError::Transport(format!("could not resolve {}", to)))?;
        self.resolved.lock().insert(to.clone(), addr);
        Ok(addr)
    }
}

impl NetTransport for UdpTransport {
    fn send(&self, to: &NetAddress, message: &NetMessage) -> Result<()> {
        let packet = OscPacket::Message(to_osc(message));
        let bytes = rosc::encoder::encode(&packet)?;
        let addr = self.resolve(to)?;
        if let Err(e) = self.socket.send_to(&bytes, addr) {
            self.resolved.lock().remove(to);
            return Err(e.into());
        }
        Ok(())
    }

    fn prepare(&self, targets: &[NetAddress]) {
        for to in targets {
            if let Err(e) = self.resolve(to) {
                tracing::warn!("Could not resolve {}: {}", to, e);
            }
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Incoming>> {
        if let Some(incoming) = self.backlog.lock().pop_front() {
            return Ok(Some(incoming));
        }

        // A zero timeout means "block forever" for set_read_timeout
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };

        let (_, packet) = rosc::decoder::decode_udp(&buf[..len])?;
        let source = NetAddress::new(from.ip().to_string(), from.port());

        let mut messages = Vec::new();
        flatten(packet, &mut messages);
        let mut backlog = self.backlog.lock();
        for message in messages {
            backlog.push_back(Incoming {
                message,
                source: source.clone(),
            });
        }
        Ok(backlog.pop_front())
    }
}

fn flatten(packet: OscPacket, out: &mut Vec<NetMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(from_osc(msg)),
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten(inner, out);
            }
        }
    }
}

fn to_osc(message: &NetMessage) -> OscMessage {
    let args = message
        .args
        .iter()
        .map(|arg| match arg {
            Arg::Int(v) => OscType::Int(*v),
            Arg::Float(v) => OscType::Float(*v),
            Arg::Str(s) => OscType::String(s.clone()),
        })
        .collect();
    OscMessage {
        addr: message.path.clone(),
        args,
    }
}

fn from_osc(msg: OscMessage) -> NetMessage {
    let args = msg
        .args
        .into_iter()
        .filter_map(|arg| match arg {
            OscType::Int(v) => Some(Arg::Int(v)),
            OscType::Long(v) => Some(Arg::Int(v as i32)),
            OscType::Float(v) => Some(Arg::Float(v)),
            OscType::Double(v) => Some(Arg::Float(v as f32)),
            OscType::String(s) => Some(Arg::Str(s)),
            OscType::Bool(b) => Some(Arg::Int(b as i32)),
            other => {
                tracing::debug!("Ignoring unsupported OSC argument {:?}", other);
                None
            }
        })
        .collect();
    NetMessage::new(msg.addr, args)
}
