//! Outbound notifications
//!
//! Pin data goes to the data addresses, status and device notifications go
//! to the UI addresses, and replies/errors go to whoever asked. Address
//! lists are swapped wholesale when the configuration changes.

use super::{Arg, NetAddress, NetMessage, NetTransport};
use crate::config::Config;
use crate::types::ConnectionState;
use arc_swap::ArcSwap;
use std::sync::Arc;

pub const PATH_DIGITAL: &str = "/data/D";
pub const PATH_ANALOG: &str = "/data/A";
pub const PATH_HEARTBEAT: &str = "/heartbeat";
pub const PATH_STATUS: &str = "/status";
pub const PATH_DEVMSG: &str = "/devmsg";
pub const PATH_MIDI_PORTS: &str = "/midioutports";
pub const PATH_REPLY: &str = "/reply";
pub const PATH_ERROR: &str = "/error";

pub struct Telemetry {
    transport: Arc<dyn NetTransport>,
    data: ArcSwap<Vec<NetAddress>>,
    ui: ArcSwap<Vec<NetAddress>>,
}

/// Parse address strings, skipping (and logging) bad ones
pub fn parse_addresses(list: &[String]) -> Vec<NetAddress> {
    list.iter()
        .filter_map(|text| match NetAddress::parse(text) {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!("Ignoring address '{}': {}", text, e);
                None
            }
        })
        .collect()
}

impl Telemetry {
    pub fn new(transport: Arc<dyn NetTransport>) -> Self {
        Self {
            transport,
            data: ArcSwap::from_pointee(Vec::new()),
            ui: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn from_config(transport: Arc<dyn NetTransport>, config: &Config) -> Self {
        let telemetry = Self::new(transport);
        telemetry.apply_config(config);
        telemetry
    }

    /// Take both address lists from the configuration
    pub fn apply_config(&self, config: &Config) {
        let data = parse_addresses(&config.osc_data_addresses);
        let ui = parse_addresses(&config.osc_ui_addresses);
        self.transport.prepare(&data);
        self.transport.prepare(&ui);
        self.data.store(Arc::new(data));
        self.ui.store(Arc::new(ui));
    }

    pub fn transport(&self) -> &Arc<dyn NetTransport> {
        &self.transport
    }

    pub fn data_addresses(&self) -> Vec<NetAddress> {
        self.data.load().as_ref().clone()
    }

    pub fn ui_addresses(&self) -> Vec<NetAddress> {
        self.ui.load().as_ref().clone()
    }

    /// Send one message; failures are logged, never returned
    pub fn send_to(&self, to: &NetAddress, path: &str, args: Vec<Arg>) {
        let message = NetMessage::new(path, args);
        if let Err(e) = self.transport.send(to, &message) {
            tracing::debug!("Could not send {} to {}: {}", path, to, e);
        }
    }

    fn fan_out(&self, targets: &[NetAddress], path: &str, args: Vec<Arg>) {
        let message = NetMessage::new(path, args);
        for to in targets {
            if let Err(e) = self.transport.send(to, &message) {
                tracing::debug!("Could not send {} to {}: {}", path, to, e);
            }
        }
    }

    pub fn send_data(&self, path: &str, args: Vec<Arg>) {
        self.fan_out(&self.data.load(), path, args);
    }

    pub fn send_ui(&self, path: &str, args: Vec<Arg>) {
        self.fan_out(&self.ui.load(), path, args);
    }

    pub fn digital(&self, pin: usize, value: u8) {
        self.send_data(PATH_DIGITAL, vec![Arg::Int(pin as i32), Arg::Int(value as i32)]);
    }

    pub fn analog(&self, pin: usize, normalized: f32, raw: u16) {
        self.send_data(
            PATH_ANALOG,
            vec![
                Arg::Int(pin as i32),
                Arg::Float(normalized),
                Arg::Int(raw as i32),
            ],
        );
    }

    pub fn heartbeat(&self) {
        self.send_ui(PATH_HEARTBEAT, vec![]);
    }

    pub fn status(&self, state: ConnectionState) {
        self.send_ui(PATH_STATUS, vec![Arg::Str(state.to_string())]);
    }

    pub fn device_message(&self, text: &str) {
        self.send_ui(PATH_DEVMSG, vec![Arg::from(text)]);
    }

    pub fn midi_ports(&self, ports: &[String]) {
        self.send_ui(
            PATH_MIDI_PORTS,
            ports.iter().map(|p| Arg::Str(p.clone())).collect(),
        );
    }

    /// `/reply (method, id, value...)`
    pub fn reply(&self, to: &NetAddress, method: &str, id: i32, values: Vec<Arg>) {
        let mut args = Vec::with_capacity(values.len() + 2);
        args.push(Arg::from(method));
        args.push(Arg::Int(id));
        args.extend(values);
        self.send_to(to, PATH_REPLY, args);
    }

    /// `/error (path, message)`
    pub fn error(&self, to: &NetAddress, path: &str, message: &str) {
        tracing::warn!("{} failed: {}", path, message);
        self.send_to(to, PATH_ERROR, vec![Arg::from(path), Arg::from(message)]);
    }
}
