//! Device communication engine
//!
//! The engine owns the serial link in a dedicated worker loop and talks to
//! the rest of the program through channels and a shared [`EngineContext`].
//!
//! # Architecture
//!
//! - [`EngineContext`] - state shared by the read loop and the command server
//!   (config store, telemetry, reply registry, dispatch table, connection state)
//! - [`EngineRequest`] - work the command server hands to the read loop
//! - [`EngineEvent`] - notifications for the embedding application
//! - [`EngineHandle`] - application-side handle (events, stop)
//! - [`DeviceEngine`] - entry point that runs the loop (and, in threaded
//!   mode, the command server thread)
//!
//! # Components
//!
//! - [`codec`] - serial frame decoding and command encoding
//! - [`port`] - serial port discovery
//! - [`connection`] - connection state machine and reconnection policy
//! - [`pins`] - per-pin dispatch pipeline
//! - [`replies`] - device reply correlation
//! - [`mock`] - simulated pedal board
//! - [`worker`] - the read loop
//!
//! # Example
//!
//! ```ignore
//! use pedlbrd::config::{Config, ConfigStore};
//! use pedlbrd::device::{DeviceEngine, EngineOptions, EngineParts};
//!
//! let store = ConfigStore::new(Config::default());
//! let (engine, handle) = DeviceEngine::new(store, parts, EngineOptions::default());
//! let join = engine.spawn();
//!
//! for event in handle.events().iter() {
//!     println!("{:?}", event);
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod info;
pub mod mock;
pub mod pins;
pub mod port;
pub mod replies;
pub mod worker;

pub use codec::{DeviceEvent, DeviceParam, Opcode, SerialFrame};
pub use connection::{ConnectionManager, ReconnectPolicy};
pub use info::DeviceInfo;
pub use pins::{DispatchTable, PinStates};
pub use port::{PortDiscovery, SerialLink, SystemPorts};
pub use replies::{ReplyRegistry, ReplyRoute};
pub use worker::DeviceWorker;

use crate::command::CommandServer;
use crate::config::{Config, ConfigChange, ConfigStore, EngineMode};
use crate::error::{CommandError, Result};
use crate::midi::MidiSink;
use crate::net::{NetTransport, Telemetry};
use crate::types::{ConnectionState, EngineStats, SharedState};
use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Capacity of the event channel; events beyond it are dropped
const EVENT_CAPACITY: usize = 256;

/// Work for the read loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    /// Write encoded command bytes to the device
    WriteDevice(Vec<u8>),
    /// Start the digital calibration workflow
    CalibrateDigital,
    /// Reset per-pin runtime state
    ResetState,
    /// Ask the device for an INFO frame
    RequestInfo,
    /// Save the configuration now
    SaveConfig,
    /// Pin counts changed in the configuration
    ResizePins,
    /// Reconnection settings changed in the configuration
    ReloadPolicy,
    Stop,
}

/// Notifications for the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged(ConnectionState),
    DeviceInfo(DeviceInfo),
    /// A digital pin was calibrated
    Calibrated { pin: usize, inverted: bool },
    /// The engine loop has exited
    Stopped(EngineStats),
}

/// Timing knobs of the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Heartbeat silence after which the device is declared lost
    pub watchdog: Duration,
    /// How long a candidate port may take to send a heartbeat
    pub probe_timeout: Duration,
    /// Longest wait for a network command in sync mode
    pub poll_interval: Duration,
    /// Delay between connecting and requesting device info
    pub info_delay: Duration,
    /// Delay before hardware button presses are honored after the first connection
    pub settle_delay: Duration,
    /// How long a forwarded request waits for the device
    pub reply_timeout: Duration,
    /// Sleep between iterations while there is nothing to read
    pub idle_sleep: Duration,
    /// Report MIDI output port changes during idle bookkeeping
    pub watch_midi_ports: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            watchdog: connection::DEFAULT_WATCHDOG,
            probe_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            info_delay: Duration::from_millis(500),
            settle_delay: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(5),
            idle_sleep: Duration::from_millis(20),
            watch_midi_ports: true,
        }
    }
}

/// External collaborators of the engine
pub struct EngineParts {
    pub midi: Box<dyn MidiSink>,
    pub transport: Arc<dyn NetTransport>,
    pub discovery: Box<dyn PortDiscovery>,
}

/// State shared between the read loop and the command server
pub struct EngineContext {
    pub config: ConfigStore,
    pub telemetry: Telemetry,
    pub replies: ReplyRegistry,
    pub options: EngineOptions,
    dispatch: ArcSwap<DispatchTable>,
    state: SharedState,
    device_info: ArcSwapOption<DeviceInfo>,
    echo: AtomicBool,
    running: AtomicBool,
    dropped_events: AtomicU64,
    requests: Sender<EngineRequest>,
    events: Sender<EngineEvent>,
}

impl EngineContext {
    /// Current dispatch table
    pub fn dispatch(&self) -> Arc<DispatchTable> {
        self.dispatch.load_full()
    }

    /// Publish a new dispatch table built from `config`
    pub fn rebuild_dispatch(&self, config: &Config) {
        self.dispatch
            .store(Arc::new(DispatchTable::from_config(config)));
        tracing::debug!("dispatch table rebuilt");
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Store a new state, returning the previous one
    pub(crate) fn swap_state(&self, state: ConnectionState) -> ConnectionState {
        self.state.set(state)
    }

    pub fn device_info(&self) -> Option<Arc<DeviceInfo>> {
        self.device_info.load_full()
    }

    pub(crate) fn set_device_info(&self, info: DeviceInfo) {
        self.device_info.store(Some(Arc::new(info)));
    }

    pub fn echo(&self) -> bool {
        self.echo.load(Ordering::Relaxed)
    }

    pub fn set_echo(&self, on: bool) {
        self.echo.store(on, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the engine to stop; observed at the top of every loop iteration
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.requests.try_send(EngineRequest::Stop);
    }

    /// Queue work for the read loop
    pub fn request(&self, request: EngineRequest) -> std::result::Result<(), CommandError> {
        self.requests
            .send(request)
            .map_err(|_| CommandError::Failed("engine is not running".to_string()))
    }

    /// Queue bytes for the device; fails unless the device is connected
    pub fn send_to_device(&self, bytes: Vec<u8>) -> std::result::Result<(), CommandError> {
        if self.state() != ConnectionState::Connected {
            return Err(CommandError::NotConnected);
        }
        self.request(EngineRequest::WriteDevice(bytes))
    }

    /// Send an event to the application without blocking
    pub fn emit(&self, event: EngineEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// React to a configuration change
    fn on_config_change(&self, change: &ConfigChange) {
        match change.root() {
            "midichannel" | "digital_inputs" | "analog_inputs" => {
                self.rebuild_dispatch(&change.config);
            }
            "num_digital_pins" | "num_analog_pins" | "analog_resolution" => {
                self.rebuild_dispatch(&change.config);
                let _ = self.requests.send(EngineRequest::ResizePins);
            }
            "osc_data_addresses" | "osc_ui_addresses" => {
                self.telemetry.apply_config(&change.config);
            }
            "reconnect_period_seconds" | "firsttime_retry_period" | "firsttime_accept_fail" => {
                let _ = self.requests.send(EngineRequest::ReloadPolicy);
            }
            other => tracing::trace!("config change to '{}' needs no action", other),
        }
    }
}

/// Application-side handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    ctx: Arc<EngineContext>,
    events: Receiver<EngineEvent>,
}

impl EngineHandle {
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.events
    }

    /// Drain all pending events
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.events.try_iter().collect()
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.state()
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    pub fn stop(&self) {
        self.ctx.stop();
    }
}

/// The device engine, ready to run
pub struct DeviceEngine {
    ctx: Arc<EngineContext>,
    worker: DeviceWorker,
}

impl DeviceEngine {
    pub fn new(
        config: ConfigStore,
        parts: EngineParts,
        options: EngineOptions,
    ) -> (Self, EngineHandle) {
        let (request_tx, request_rx) = unbounded();
        let (event_tx, event_rx) = bounded(EVENT_CAPACITY);

        let snapshot = config.snapshot();
        let ctx = Arc::new(EngineContext {
            telemetry: Telemetry::from_config(parts.transport, &snapshot),
            dispatch: ArcSwap::from_pointee(DispatchTable::from_config(&snapshot)),
            config,
            replies: ReplyRegistry::new(),
            options: options.clone(),
            state: SharedState::new(ConnectionState::Searching),
            device_info: ArcSwapOption::empty(),
            echo: AtomicBool::new(false),
            running: AtomicBool::new(true),
            dropped_events: AtomicU64::new(0),
            requests: request_tx,
            events: event_tx,
        });

        let weak: Weak<EngineContext> = Arc::downgrade(&ctx);
        ctx.config.on_change(move |change| {
            if let Some(ctx) = weak.upgrade() {
                ctx.on_config_change(change);
            }
        });

        let worker = DeviceWorker::new(ctx.clone(), request_rx, parts.midi, parts.discovery);
        let handle = EngineHandle {
            ctx: ctx.clone(),
            events: event_rx,
        };
        (Self { ctx, worker }, handle)
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Run the engine on the current thread until it stops
    ///
    /// In threaded mode the command server gets its own thread, joined
    /// before this returns.
    pub fn run(self) -> Result<EngineStats> {
        let Self { ctx, mut worker } = self;
        let mode = ctx.config.read(|c| c.engine_mode);

        let server = CommandServer::new(ctx.clone());
        let server_thread = match mode {
            EngineMode::Threaded => {
                let spawned = std::thread::Builder::new()
                    .name("pedlbrd-commands".to_string())
                    .spawn(move || server.serve());
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        ctx.stop();
                        return Err(e.into());
                    }
                }
            }
            EngineMode::Sync => {
                worker.attach_command_server(server);
                None
            }
        };

        let result = worker.run();
        ctx.stop();

        if let Some(handle) = server_thread {
            if handle.join().is_err() {
                tracing::error!("Command server thread panicked");
            }
        }
        result
    }

    /// Run the engine on a new thread
    pub fn spawn(self) -> JoinHandle<Result<EngineStats>> {
        std::thread::spawn(move || self.run())
    }
}
