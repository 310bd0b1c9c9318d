//! Simulated pedal board
//!
//! [`MockDevice`] speaks the same wire protocol as the firmware: it answers
//! `F`, `S`, `G`, `I` and `L` commands, emits heartbeats, and can be
//! unplugged and plugged back in. Clones share one device, so a test keeps a
//! handle while the engine owns the link.

use super::codec::{encode_frame, split_value, DeviceParam, Opcode, SerialFrame, TERMINATOR};
use super::port::{PortDiscovery, SerialLink};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Error code sent for an unknown parameter
pub const ERR_UNKNOWN_PARAM: u8 = 1;

/// Error code sent for a pin the device does not have
pub const ERR_BAD_PIN: u8 = 2;

const IDLE_SLEEP: Duration = Duration::from_millis(2);

struct DeviceState {
    num_analog: usize,
    resolution: u16,
    digital: Vec<u8>,
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    partial: Vec<u8>,
    plugged: bool,
    generation: u64,
    heartbeat_on_open: bool,
    heartbeat_period: Option<Duration>,
    last_heartbeat: Instant,
    /// (param, pin) -> value; the heartbeat period uses pin 0
    settings: HashMap<(u8, u8), u16>,
    led: Option<u8>,
    answer_gets: bool,
}

impl DeviceState {
    fn push_frame(&mut self, opcode: Opcode, payload: Vec<u8>) {
        let bytes = encode_frame(&SerialFrame::new(opcode, payload));
        self.inbound.extend(bytes);
    }

    fn info_payload(&self) -> Vec<u8> {
        let mut payload = vec![self.digital.len() as u8, self.num_analog as u8];
        for pin in 0..self.num_analog as u8 {
            let (hi, lo) = split_value(self.resolution);
            let filter = self.setting(DeviceParam::FilterType, pin).unwrap_or(0);
            let smoothing = self.setting(DeviceParam::Smoothing, pin).unwrap_or(0);
            payload.extend([hi, lo, filter as u8, smoothing as u8]);
        }
        payload
    }

    fn setting(&self, param: DeviceParam, pin: u8) -> Option<u16> {
        self.settings.get(&(param.code(), pin)).copied()
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.written.extend_from_slice(bytes);
        for &byte in bytes {
            if byte == TERMINATOR {
                let command = std::mem::take(&mut self.partial);
                self.execute(&command);
            } else {
                self.partial.push(byte);
            }
        }
    }

    fn execute(&mut self, command: &[u8]) {
        let Some((&header, params)) = command.split_first() else {
            return;
        };
        let Some(opcode) = Opcode::from_code(header & 0x7F) else {
            tracing::warn!("mock device: unknown command header 0x{:02X}", header);
            return;
        };
        match opcode {
            Opcode::ForceDigital => {
                for (pin, value) in self.digital.clone().into_iter().enumerate() {
                    self.push_frame(Opcode::Digital, vec![pin as u8, value]);
                }
            }
            Opcode::Info => {
                let payload = self.info_payload();
                self.push_frame(Opcode::Info, payload);
            }
            Opcode::Led => self.led = params.first().copied(),
            Opcode::Set => self.set_param(params),
            Opcode::Get => self.get_param(params),
            other => tracing::warn!("mock device: ignoring '{}' command", other.as_char()),
        }
    }

    fn set_param(&mut self, params: &[u8]) {
        match params {
            [p, hi, lo] if *p == DeviceParam::HeartPeriod.code() => {
                let ms = super::codec::join_value(*hi, *lo);
                self.settings.insert((*p, 0), ms);
                self.heartbeat_period = (ms > 0).then(|| Duration::from_millis(ms as u64));
            }
            [p, pin, value] if (*pin as usize) < self.num_analog => {
                self.settings.insert((*p, *pin), *value as u16);
            }
            _ => tracing::warn!("mock device: bad set {:?}", params),
        }
    }

    fn get_param(&mut self, params: &[u8]) {
        if !self.answer_gets {
            return;
        }
        let (param, id, args) = match params {
            [param, id, args @ ..] => (*param, *id, args),
            _ => return,
        };
        let pin = match DeviceParam::from_code(param) {
            Some(DeviceParam::HeartPeriod) => Some(0),
            Some(_) => args.first().copied().filter(|p| (*p as usize) < self.num_analog),
            None => {
                self.push_frame(Opcode::Error, vec![ERR_UNKNOWN_PARAM, id]);
                return;
            }
        };
        match pin.and_then(|pin| self.settings.get(&(param, pin)).copied()) {
            Some(value) => {
                let (hi, lo) = split_value(value);
                self.push_frame(Opcode::Reply, vec![id, hi, lo]);
            }
            None => self.push_frame(Opcode::Error, vec![ERR_BAD_PIN, id]),
        }
    }
}

/// Handle to a simulated pedal board
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A board with 10 digital and 4 analog pins
    pub fn new() -> Self {
        Self::with_pins(10, 4)
    }

    pub fn with_pins(num_digital: usize, num_analog: usize) -> Self {
        let mut settings = HashMap::new();
        for pin in 0..num_analog as u8 {
            settings.insert((DeviceParam::Smoothing.code(), pin), 50);
            settings.insert((DeviceParam::FilterType.code(), pin), 0);
        }
        settings.insert((DeviceParam::HeartPeriod.code(), 0), 1000);

        Self {
            state: Arc::new(Mutex::new(DeviceState {
                num_analog,
                resolution: 1023,
                digital: vec![0; num_digital],
                inbound: VecDeque::new(),
                written: Vec::new(),
                partial: Vec::new(),
                plugged: true,
                generation: 0,
                heartbeat_on_open: true,
                heartbeat_period: None,
                last_heartbeat: Instant::now(),
                settings,
                led: None,
                answer_gets: true,
            })),
        }
    }

    /// Open a link, as the OS would on `open()`
    pub fn open_link(&self, name: &str) -> io::Result<MockLink> {
        let mut state = self.state.lock();
        if !state.plugged {
            return Err(io::Error::new(ErrorKind::NotFound, "device unplugged"));
        }
        state.inbound.clear();
        state.partial.clear();
        if state.heartbeat_on_open {
            state.push_frame(Opcode::Heartbeat, vec![]);
        }
        state.last_heartbeat = Instant::now();
        Ok(MockLink {
            name: name.to_string(),
            generation: state.generation,
            state: self.state.clone(),
        })
    }

    /// Whether a heartbeat is queued when a link is opened
    pub fn set_heartbeat_on_open(&self, enabled: bool) {
        self.state.lock().heartbeat_on_open = enabled;
    }

    /// Emit heartbeats periodically while a link reads (`None` = never)
    pub fn set_heartbeat_period(&self, period: Option<Duration>) {
        self.state.lock().heartbeat_period = period;
    }

    /// Whether `G` requests are answered (silently dropped otherwise)
    pub fn set_answer_gets(&self, enabled: bool) {
        self.state.lock().answer_gets = enabled;
    }

    pub fn set_resolution(&self, resolution: u16) {
        self.state.lock().resolution = resolution;
    }

    /// Set the rest state of a digital pin without sending a frame
    pub fn set_digital(&self, pin: usize, value: u8) {
        if let Some(slot) = self.state.lock().digital.get_mut(pin) {
            *slot = value;
        }
    }

    /// Change a digital pin and send its frame
    pub fn press(&self, pin: usize, value: u8) {
        let mut state = self.state.lock();
        if let Some(slot) = state.digital.get_mut(pin) {
            *slot = value;
        }
        state.push_frame(Opcode::Digital, vec![pin as u8, value]);
    }

    pub fn analog(&self, pin: usize, value: u16) {
        let (hi, lo) = split_value(value);
        self.state
            .lock()
            .push_frame(Opcode::Analog, vec![pin as u8, hi, lo]);
    }

    pub fn button(&self, button: u8, value: u8) {
        self.state
            .lock()
            .push_frame(Opcode::Button, vec![button, value]);
    }

    pub fn heartbeat(&self) {
        self.state.lock().push_frame(Opcode::Heartbeat, vec![]);
    }

    pub fn message(&self, text: &str) {
        let mut payload = vec![text.len().min(127) as u8];
        payload.extend(text.bytes().take(127).map(|b| b & 0x7F));
        self.state.lock().push_frame(Opcode::Message, payload);
    }

    /// Queue raw bytes, for garbage and truncation tests
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state.lock().inbound.extend(bytes.iter().copied());
    }

    /// Pull the cable: open links fail and new opens are refused
    pub fn unplug(&self) {
        let mut state = self.state.lock();
        state.plugged = false;
        state.generation += 1;
    }

    pub fn replug(&self) {
        self.state.lock().plugged = true;
    }

    pub fn is_plugged(&self) -> bool {
        self.state.lock().plugged
    }

    /// Every byte the host has written
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Commands the host has sent, as (opcode, params)
    pub fn commands(&self) -> Vec<(Opcode, Vec<u8>)> {
        let written = self.written();
        written
            .split(|b| *b == TERMINATOR)
            .filter_map(|cmd| {
                let (&header, params) = cmd.split_first()?;
                Some((Opcode::from_code(header & 0x7F)?, params.to_vec()))
            })
            .collect()
    }

    /// Current value of a device parameter
    pub fn setting(&self, param: DeviceParam, pin: u8) -> Option<u16> {
        self.state.lock().setting(param, pin)
    }

    pub fn led_pattern(&self) -> Option<u8> {
        self.state.lock().led
    }
}

/// Host side of a [`MockDevice`] connection
pub struct MockLink {
    name: String,
    generation: u64,
    state: Arc<Mutex<DeviceState>>,
}

impl MockLink {
    fn check(&self, state: &DeviceState) -> io::Result<()> {
        if !state.plugged || state.generation != self.generation {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "device unplugged"));
        }
        Ok(())
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.state.lock();
            self.check(&state)?;
            if let Some(period) = state.heartbeat_period {
                if state.last_heartbeat.elapsed() >= period {
                    state.last_heartbeat = Instant::now();
                    state.push_frame(Opcode::Heartbeat, vec![]);
                }
            }
            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(IDLE_SLEEP);
        Err(io::Error::new(ErrorKind::TimedOut, "read timed out"))
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        self.check(&state)?;
        state.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let state = self.state.lock();
        self.check(&state)
    }
}

impl SerialLink for MockLink {
    fn port_name(&self) -> &str {
        &self.name
    }
}

/// Discovery over a fixed set of simulated boards
pub struct MockDiscovery {
    ports: Vec<(String, MockDevice)>,
    opened: Arc<Mutex<Vec<String>>>,
    searches: Arc<Mutex<u32>>,
}

impl MockDiscovery {
    pub fn new(ports: Vec<(String, MockDevice)>) -> Self {
        Self {
            ports,
            opened: Arc::new(Mutex::new(Vec::new())),
            searches: Arc::new(Mutex::new(0)),
        }
    }

    /// One board on `/dev/mock0`
    pub fn single(device: MockDevice) -> Self {
        Self::new(vec![("/dev/mock0".to_string(), device)])
    }

    /// Ports opened so far, in order
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    /// Shared counter of discovery passes, readable after the engine takes ownership
    pub fn search_counter(&self) -> Arc<Mutex<u32>> {
        self.searches.clone()
    }
}

impl PortDiscovery for MockDiscovery {
    fn candidates(&mut self) -> Vec<String> {
        *self.searches.lock() += 1;
        self.ports.iter().map(|(name, _)| name.clone()).collect()
    }

    fn open(&mut self, name: &str) -> io::Result<Box<dyn SerialLink>> {
        let device = self
            .ports
            .iter()
            .find(|(port, _)| port == name)
            .map(|(_, device)| device.clone())
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, name.to_string()))?;
        self.opened.lock().push(name.to_string());
        Ok(Box::new(device.open_link(name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::codec::{encode_command, DecodeOutcome, FrameDecoder};

    fn decode_frame(link: &mut MockLink) -> std::io::Result<DecodeOutcome> {
        FrameDecoder::new().decode(link)
    }

    fn next_frame(link: &mut MockLink) -> SerialFrame {
        match decode_frame(link).unwrap() {
            DecodeOutcome::Frame(frame) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_on_open() {
        let device = MockDevice::new();
        let mut link = device.open_link("/dev/mock0").unwrap();
        assert_eq!(next_frame(&mut link).opcode, Opcode::Heartbeat);
        assert_eq!(decode_frame(&mut link).unwrap(), DecodeOutcome::Idle);
    }

    #[test]
    fn test_force_digital_resends_states() {
        let device = MockDevice::with_pins(3, 0);
        device.set_heartbeat_on_open(false);
        device.set_digital(1, 1);
        let mut link = device.open_link("x").unwrap();
        link.write_all(&encode_command(Opcode::ForceDigital, &[]).unwrap())
            .unwrap();
        let frames: Vec<_> = (0..3).map(|_| next_frame(&mut link)).collect();
        assert_eq!(frames[1], SerialFrame::new(Opcode::Digital, vec![1, 1]));
    }

    #[test]
    fn test_set_then_get() {
        let device = MockDevice::new();
        device.set_heartbeat_on_open(false);
        let mut link = device.open_link("x").unwrap();
        let s = DeviceParam::Smoothing.code() as i32;
        link.write_all(&encode_command(Opcode::Set, &[s, 2, 80]).unwrap())
            .unwrap();
        link.write_all(&encode_command(Opcode::Get, &[s, 9, 2]).unwrap())
            .unwrap();
        assert_eq!(
            next_frame(&mut link),
            SerialFrame::new(Opcode::Reply, vec![9, 0, 80])
        );
        assert_eq!(device.setting(DeviceParam::Smoothing, 2), Some(80));
    }

    #[test]
    fn test_silent_device_ignores_get() {
        let device = MockDevice::new();
        device.set_heartbeat_on_open(false);
        device.set_answer_gets(false);
        let mut link = device.open_link("x").unwrap();
        let s = DeviceParam::Smoothing.code() as i32;
        link.write_all(&encode_command(Opcode::Get, &[s, 3, 0]).unwrap())
            .unwrap();
        assert_eq!(decode_frame(&mut link).unwrap(), DecodeOutcome::Idle);
        assert_eq!(device.commands(), vec![(Opcode::Get, vec![s as u8, 3, 0])]);
    }

    #[test]
    fn test_get_unknown_param_errors() {
        let device = MockDevice::new();
        device.set_heartbeat_on_open(false);
        let mut link = device.open_link("x").unwrap();
        link.write_all(&encode_command(Opcode::Get, &[b'Z' as i32, 4]).unwrap())
            .unwrap();
        assert_eq!(
            next_frame(&mut link),
            SerialFrame::new(Opcode::Error, vec![ERR_UNKNOWN_PARAM, 4])
        );
    }

    #[test]
    fn test_unplug_breaks_link() {
        let device = MockDevice::new();
        let mut link = device.open_link("x").unwrap();
        device.unplug();
        let err = decode_frame(&mut link).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert!(device.open_link("x").is_err());

        device.replug();
        assert!(decode_frame(&mut link).is_err());
        assert!(device.open_link("x").is_ok());
    }

    #[test]
    fn test_commands_are_recorded() {
        let device = MockDevice::new();
        let mut link = device.open_link("x").unwrap();
        link.write_all(&encode_command(Opcode::Led, &[5]).unwrap())
            .unwrap();
        assert_eq!(device.commands(), vec![(Opcode::Led, vec![5])]);
        assert_eq!(device.led_pattern(), Some(5));
    }
}
