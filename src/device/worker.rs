//! Device read loop
//!
//! The worker owns the serial link and every piece of state that only the
//! read path touches (pin states, connection manager, scheduler). Each
//! iteration it:
//!
//! - **Processes requests** queued by the command server
//! - **Runs due timers** (autosave, info request, reply expiry, idle checks)
//! - **Reads one frame** from the link, or searches for the device when due
//! - **Checks the watchdog** and handles a lost connection
//!
//! In sync mode the worker also polls the network for commands, so the
//! whole engine runs on one thread.

use super::codec::{self, DecodeOutcome, DeviceEvent, FrameDecoder, Opcode};
use super::connection::{ConnectKind, ConnectionManager, LossAction, ReconnectPolicy};
use super::info::DeviceInfo;
use super::pins::{AnalogOutcome, DigitalOutcome, PinStates};
use super::port::{self, PortDiscovery, SerialLink};
use super::{EngineContext, EngineEvent, EngineRequest};
use crate::command::CommandServer;
use crate::config::Config;
use crate::error::{CommandError, PedlError, Result};
use crate::midi::{self, ControlChange, MidiSink};
use crate::scheduler::{Scheduler, TimerId};
use crate::types::{ConnectionState, EngineStats, PinId};
use crossbeam_channel::{Receiver, TryRecvError};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Most network commands handled per poll in sync mode
const MAX_COMMANDS_PER_POLL: usize = 64;

/// Hardware button that starts digital calibration
const CALIBRATE_BUTTON: u8 = 0;

/// Timer tasks run by the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    SaveConfig,
    IdleCheck,
    RequestInfo,
    /// Hardware buttons are honored from now on
    Settled,
    ExpireReplies,
}

pub struct DeviceWorker {
    ctx: Arc<EngineContext>,
    requests: Receiver<EngineRequest>,
    midi: Box<dyn MidiSink>,
    discovery: Box<dyn PortDiscovery>,
    /// Present in sync mode only
    commands: Option<CommandServer>,
    link: Option<Box<dyn SerialLink>>,
    decoder: FrameDecoder,
    conn: ConnectionManager,
    pins: PinStates,
    scheduler: Scheduler<Task>,
    /// Pending info request of the current connection
    info_timer: Option<TimerId>,
    settled: bool,
    stats: EngineStats,
    midi_ports: Vec<String>,
    last_command_poll: Instant,
}

impl DeviceWorker {
    pub fn new(
        ctx: Arc<EngineContext>,
        requests: Receiver<EngineRequest>,
        midi: Box<dyn MidiSink>,
        discovery: Box<dyn PortDiscovery>,
    ) -> Self {
        let config = ctx.config.snapshot();
        let conn = ConnectionManager::new(ReconnectPolicy::from_config(&config), ctx.options.watchdog);
        Self {
            requests,
            midi,
            discovery,
            commands: None,
            link: None,
            decoder: FrameDecoder::new(),
            conn,
            pins: PinStates::from_config(&config),
            scheduler: Scheduler::new(),
            info_timer: None,
            settled: false,
            stats: EngineStats::default(),
            midi_ports: Vec::new(),
            last_command_poll: Instant::now(),
            ctx,
        }
    }

    /// Poll network commands from the read loop (sync mode)
    pub fn attach_command_server(&mut self, server: CommandServer) {
        self.commands = Some(server);
    }

    /// Run until stopped
    ///
    /// Returns an error only when the first search fails and neither
    /// retrying nor running disconnected is allowed.
    pub fn run(mut self) -> Result<EngineStats> {
        tracing::info!("Device engine started");
        self.schedule_housekeeping();

        let result = self.run_loop();
        if let Err(e) = &result {
            tracing::error!("Device engine failed: {}", e);
        }
        self.shutdown();
        result.map(|()| self.stats.clone())
    }

    fn run_loop(&mut self) -> Result<()> {
        while self.ctx.is_running() {
            self.process_requests();
            if !self.ctx.is_running() {
                break;
            }

            self.run_due_tasks(Instant::now());

            if self.link.is_some() {
                self.read_once();
            } else if self.conn.should_search(Instant::now()) {
                self.search()?;
            } else {
                self.idle();
            }

            if self.conn.watchdog_expired(Instant::now()) {
                self.handle_loss(PedlError::Transport(format!(
                    "no heartbeat for {:?}",
                    self.ctx.options.watchdog
                )));
            }

            if self.last_command_poll.elapsed() >= self.ctx.options.poll_interval {
                self.poll_commands();
            }
        }
        Ok(())
    }

    fn schedule_housekeeping(&mut self) {
        let config = self.ctx.config.snapshot();
        if config.autosave_config_period > 0.0 {
            self.scheduler.schedule_regularly(
                Duration::from_secs_f64(config.autosave_config_period),
                Task::SaveConfig,
            );
        }
        if config.sync_bg_checkinterval > 0.0 {
            self.scheduler.schedule_regularly(
                Duration::from_secs_f64(config.sync_bg_checkinterval),
                Task::IdleCheck,
            );
        }
        let expiry_period = (self.ctx.options.reply_timeout / 4).max(Duration::from_millis(10));
        self.scheduler
            .schedule_regularly(expiry_period, Task::ExpireReplies);
    }

    fn shutdown(&mut self) {
        self.ctx.stop();
        self.link = None;
        self.scheduler.clear();
        for (_, pending) in self.ctx.replies.drain() {
            self.ctx.telemetry.error(
                &pending.route.address,
                &pending.route.path,
                &CommandError::NotConnected.to_string(),
            );
        }
        if let Err(e) = self.ctx.config.save_if_dirty() {
            tracing::error!("Failed to save config: {}", e);
        }
        self.stats.dropped_events = self.ctx.dropped_events();
        tracing::info!("Device engine stopped: {:?}", self.stats);
        self.ctx.emit(EngineEvent::Stopped(self.stats.clone()));
    }

    // ---- requests and timers ----

    fn process_requests(&mut self) {
        loop {
            match self.requests.try_recv() {
                Ok(request) => self.handle_request(request),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.ctx.stop();
                    break;
                }
            }
        }
    }

    fn handle_request(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::WriteDevice(bytes) => self.write(&bytes),
            EngineRequest::CalibrateDigital => self.start_calibration(),
            EngineRequest::ResetState => {
                self.pins.reset();
                tracing::info!("Pin state reset");
            }
            EngineRequest::RequestInfo => self.request_info(),
            EngineRequest::SaveConfig => match self.ctx.config.save() {
                Ok(()) => tracing::info!("Config saved"),
                Err(e) => tracing::warn!("Failed to save config: {}", e),
            },
            EngineRequest::ResizePins => {
                let (digital, analog, resolution) = self.ctx.config.read(|c| {
                    (c.num_digital_pins, c.num_analog_pins, c.analog_resolution)
                });
                self.pins.resize(digital, analog, resolution);
            }
            EngineRequest::ReloadPolicy => {
                let policy = self.ctx.config.read(ReconnectPolicy::from_config);
                tracing::debug!("Reconnect policy: {:?}", policy);
                self.conn.set_policy(policy);
            }
            EngineRequest::Stop => self.ctx.stop(),
        }
    }

    fn run_due_tasks(&mut self, now: Instant) {
        for task in self.scheduler.poll_due(now) {
            match task {
                Task::SaveConfig => {
                    if let Err(e) = self.ctx.config.save_if_dirty() {
                        tracing::warn!("Autosave failed: {}", e);
                    }
                }
                Task::IdleCheck => self.idle_check(),
                Task::RequestInfo => {
                    self.info_timer = None;
                    self.request_info();
                }
                Task::Settled => {
                    self.settled = true;
                    tracing::debug!("Hardware buttons enabled");
                }
                Task::ExpireReplies => {
                    let timeout = self.ctx.options.reply_timeout;
                    for (id, pending) in self.ctx.replies.expire(timeout) {
                        tracing::debug!("Reply {} for {} expired", id, pending.route.path);
                        self.ctx.telemetry.error(
                            &pending.route.address,
                            &pending.route.path,
                            &CommandError::DeviceTimeout(timeout.as_millis() as u64).to_string(),
                        );
                    }
                }
            }
        }
    }

    /// Background bookkeeping that does not need the device
    fn idle_check(&mut self) {
        if !self.ctx.options.watch_midi_ports {
            return;
        }
        let ports = midi::list_output_ports();
        if ports != self.midi_ports {
            tracing::debug!("MIDI output ports: {:?}", ports);
            self.ctx.telemetry.midi_ports(&ports);
            self.midi_ports = ports;
        }
    }

    fn poll_commands(&mut self) {
        self.last_command_poll = Instant::now();
        let Some(server) = &self.commands else {
            return;
        };
        for _ in 0..MAX_COMMANDS_PER_POLL {
            match server.poll(Duration::ZERO) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!("Network receive failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Wait a little while there is no link to read
    fn idle(&mut self) {
        let now = Instant::now();
        let sleep = [self.scheduler.next_deadline(), self.conn.next_attempt()]
            .into_iter()
            .flatten()
            .map(|at| at.saturating_duration_since(now))
            .fold(self.ctx.options.idle_sleep, Duration::min);
        match &self.commands {
            Some(server) => {
                if let Err(e) = server.poll(sleep) {
                    tracing::warn!("Network receive failed: {}", e);
                    std::thread::sleep(sleep);
                }
            }
            None => std::thread::sleep(sleep),
        }
    }

    // ---- connection ----

    fn search(&mut self) -> Result<()> {
        tracing::debug!("Searching for device");
        match port::discover_device(self.discovery.as_mut(), self.ctx.options.probe_timeout) {
            Ok(link) => {
                self.on_connect(link);
                Ok(())
            }
            Err(e) => {
                let result = self.conn.on_search_failed(Instant::now(), e);
                self.set_state(self.conn.state());
                result
            }
        }
    }

    fn on_connect(&mut self, link: Box<dyn SerialLink>) {
        let name = link.port_name().to_string();
        self.decoder.clear();
        self.link = Some(link);
        let kind = self.conn.on_connected(Instant::now());
        self.stats.connections = self.conn.connections();
        tracing::info!("Connected to device on {} ({:?})", name, kind);
        self.set_state(ConnectionState::Connected);

        let (autocalibrate, reset_after_reconnect) = self
            .ctx
            .config
            .read(|c| (c.autocalibrate_digital, c.reset_after_reconnect));

        self.info_timer = Some(
            self.scheduler
                .call_later(self.ctx.options.info_delay, Task::RequestInfo),
        );
        match kind {
            ConnectKind::First => {
                self.scheduler
                    .call_later(self.ctx.options.settle_delay, Task::Settled);
            }
            ConnectKind::Reconnect if reset_after_reconnect => self.pins.reset(),
            ConnectKind::Reconnect => {}
        }
        if autocalibrate {
            self.start_calibration();
        }
    }

    fn handle_loss(&mut self, reason: PedlError) {
        tracing::warn!("Lost connection to device: {}", reason);
        self.link = None;
        if let Some(timer) = self.info_timer.take() {
            self.scheduler.cancel(timer);
        }

        for (id, pending) in self.ctx.replies.drain() {
            tracing::debug!("Dropping pending reply {}", id);
            self.ctx.telemetry.error(
                &pending.route.address,
                &pending.route.path,
                &CommandError::NotConnected.to_string(),
            );
        }

        let action = self.conn.on_lost(Instant::now());
        self.set_state(ConnectionState::Disconnected);
        match action {
            LossAction::Stop => {
                tracing::info!("Reconnection disabled, stopping");
                self.ctx.stop();
            }
            LossAction::Search => {
                self.conn.begin_search();
                self.set_state(ConnectionState::Searching);
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.ctx.swap_state(state);
        if previous != state {
            tracing::info!("Connection state: {} -> {}", previous, state);
            self.ctx.telemetry.status(state);
            self.ctx.emit(EngineEvent::StateChanged(state));
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some(link) = self.link.as_mut() else {
            tracing::debug!("Dropping {} bytes for disconnected device", bytes.len());
            return;
        };
        if let Err(e) = link.write_all(bytes).and_then(|()| link.flush()) {
            let port = link.port_name().to_string();
            self.handle_loss(PedlError::port_io(port, e));
        }
    }

    fn write_command(&mut self, opcode: Opcode, params: &[i32]) {
        match codec::encode_command(opcode, params) {
            Ok(bytes) => self.write(&bytes),
            Err(e) => tracing::error!("Could not encode '{}' command: {}", opcode.as_char(), e),
        }
    }

    fn request_info(&mut self) {
        if self.link.is_some() {
            self.write_command(Opcode::Info, &[]);
        }
    }

    /// The next digital sample of every pin is its rest position
    fn start_calibration(&mut self) {
        tracing::info!("Calibrating digital inputs");
        self.pins.request_calibration();
        self.pins.reset_analog();
        self.write_command(Opcode::ForceDigital, &[]);
    }

    // ---- inbound frames ----

    fn read_once(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match self.decoder.decode(link.as_mut()) {
            Ok(DecodeOutcome::Frame(frame)) => {
                self.stats.frames += 1;
                match DeviceEvent::parse(&frame) {
                    Ok(event) => self.handle_event(event),
                    Err(e) => {
                        self.stats.framing_errors += 1;
                        tracing::warn!("Dropped frame: {}", e);
                    }
                }
            }
            Ok(DecodeOutcome::Idle) => self.poll_commands(),
            Ok(DecodeOutcome::Noise(byte)) => {
                self.stats.noise_bytes += 1;
                tracing::trace!("Skipped stray byte 0x{:02X}", byte);
            }
            Ok(DecodeOutcome::Malformed(e)) => {
                self.stats.framing_errors += 1;
                tracing::warn!("Dropped frame: {}", e);
            }
            Err(e) => {
                let port = link.port_name().to_string();
                self.handle_loss(PedlError::port_io(port, e));
            }
        }
    }

    fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Digital { pin, value } => self.on_digital(pin, value),
            DeviceEvent::Analog { pin, value } => self.on_analog(pin, value),
            DeviceEvent::Heartbeat => {
                self.conn.on_heartbeat(Instant::now());
                self.ctx.telemetry.heartbeat();
            }
            DeviceEvent::Button { button, value } => self.on_button(button, value),
            DeviceEvent::Reply { id, value } => self.on_reply(id, value),
            DeviceEvent::Error { code, id } => self.on_device_error(code, id),
            DeviceEvent::Info(info) => self.on_info(info),
            DeviceEvent::Message(text) => {
                tracing::info!("Device: {}", text);
                self.ctx.telemetry.device_message(&text);
            }
        }
    }

    fn send_midi(&mut self, cc: ControlChange) {
        match self.midi.send(cc) {
            Ok(()) => self.stats.midi_sent += 1,
            Err(e) => tracing::warn!("MIDI send failed: {}", e),
        }
    }

    fn on_digital(&mut self, pin: usize, value: u8) {
        let table = self.ctx.dispatch();
        match table.dispatch_digital(&mut self.pins, pin, value) {
            DigitalOutcome::Calibrated { inverted } => {
                let current = self.ctx.config.read(|c| c.digital(pin).inverted);
                if current != inverted {
                    let path = Config::pin_path(PinId::digital(pin), "inverted");
                    if let Err(e) = self.ctx.config.set(&path, json!(inverted)) {
                        tracing::warn!("Could not store calibration of {}: {}", path, e);
                    }
                }
                tracing::info!("Calibrated {}: inverted={}", PinId::digital(pin), inverted);
                self.ctx.emit(EngineEvent::Calibrated { pin, inverted });
            }
            DigitalOutcome::Dispatched { midi, value } => {
                if self.ctx.echo() {
                    tracing::info!("{} = {}", PinId::digital(pin), value);
                }
                self.send_midi(midi);
                self.ctx.telemetry.digital(pin, value);
            }
            DigitalOutcome::UnknownPin => {
                tracing::debug!("Ignoring sample for unknown digital pin {}", pin);
            }
        }
    }

    fn on_analog(&mut self, pin: usize, raw: u16) {
        let table = self.ctx.dispatch();
        match table.dispatch_analog(&mut self.pins, pin, raw) {
            AnalogOutcome::Dispatched {
                normalized,
                raw,
                midi,
            } => {
                if self.ctx.echo() {
                    tracing::info!("{} = {} ({:.3})", PinId::analog(pin), raw, normalized);
                }
                match midi {
                    Some(cc) => self.send_midi(cc),
                    None => self.stats.midi_suppressed += 1,
                }
                self.ctx.telemetry.analog(pin, normalized, raw);
            }
            AnalogOutcome::UnknownPin => {
                tracing::debug!("Ignoring sample for unknown analog pin {}", pin);
            }
        }
    }

    fn on_button(&mut self, button: u8, value: u8) {
        if button != CALIBRATE_BUTTON || value != 1 {
            tracing::debug!("Button {} = {}", button, value);
            return;
        }
        if self.settled {
            self.start_calibration();
        } else {
            tracing::debug!("Ignoring calibrate button during startup");
        }
    }

    fn on_reply(&mut self, id: u8, value: u16) {
        match self.ctx.replies.resolve(id) {
            Ok(pending) => {
                let route = pending.route;
                let values = (pending.postprocess)(value);
                self.ctx
                    .telemetry
                    .reply(&route.address, &route.method, route.caller_id, values);
            }
            Err(e) => tracing::warn!("Dropping device reply: {}", e),
        }
    }

    fn on_device_error(&mut self, code: u8, id: u8) {
        if id == 0 {
            tracing::warn!("Device reported error code {}", code);
            return;
        }
        match self.ctx.replies.resolve(id) {
            Ok(pending) => self.ctx.telemetry.error(
                &pending.route.address,
                &pending.route.path,
                &CommandError::Device(code).to_string(),
            ),
            Err(e) => tracing::warn!("Device error {} for unknown request: {}", code, e),
        }
    }

    fn on_info(&mut self, info: DeviceInfo) {
        tracing::info!(
            "Device has {} digital and {} analog inputs",
            info.num_digital,
            info.num_analog
        );
        let resolution = self.ctx.config.read(|c| c.analog_resolution);
        self.pins
            .resize(info.num_digital, info.num_analog, resolution);
        for (pin, analog) in info.analog.iter().enumerate() {
            self.pins.set_resolution(pin, analog.resolution);
        }

        let (digital, analog) = self
            .ctx
            .config
            .read(|c| (c.num_digital_pins, c.num_analog_pins));
        for (key, current, reported) in [
            ("num_digital_pins", digital, info.num_digital),
            ("num_analog_pins", analog, info.num_analog),
        ] {
            if current != reported {
                if let Err(e) = self.ctx.config.set(key, json!(reported)) {
                    tracing::warn!("Could not update {}: {}", key, e);
                }
            }
        }

        self.ctx.set_device_info(info.clone());
        self.ctx.emit(EngineEvent::DeviceInfo(info));
    }
}
