//! Builders for engines running against the simulated device

use super::{client, test_timeout, wait_for};
use pedlbrd::config::{Config, ConfigStore, EngineMode};
use pedlbrd::device::mock::{MockDevice, MockDiscovery};
use pedlbrd::device::{DeviceEngine, EngineHandle, EngineOptions, EngineParts};
use pedlbrd::midi::MemoryMidiSink;
use pedlbrd::net::{Arg, MemoryTransport};
use pedlbrd::{ConnectionState, EngineStats};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Timing suited to tests: everything happens within milliseconds
pub fn fast_options() -> EngineOptions {
    EngineOptions {
        watchdog: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        info_delay: Duration::from_millis(10),
        settle_delay: Duration::from_millis(50),
        reply_timeout: Duration::from_millis(500),
        idle_sleep: Duration::from_millis(5),
        watch_midi_ports: false,
    }
}

/// Builder for a running engine
pub struct EngineBuilder {
    config: Config,
    options: EngineOptions,
    ports: Option<Vec<(String, MockDevice)>>,
    device: MockDevice,
}

impl EngineBuilder {
    pub fn new() -> Self {
        let config = Config {
            osc_data_addresses: vec!["localhost:9001".into()],
            osc_ui_addresses: vec!["localhost:9002".into()],
            autocalibrate_digital: false,
            autosave_config_period: 0.0,
            sync_bg_checkinterval: 0.0,
            reconnect_period_seconds: 0.05,
            firsttime_retry_period: 0.05,
            ..Config::default()
        };
        let device = MockDevice::new();
        device.set_heartbeat_period(Some(Duration::from_millis(50)));
        Self {
            config,
            options: fast_options(),
            ports: None,
            device,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self.config.fill_missing_inputs();
        self
    }

    pub fn options(mut self, f: impl FnOnce(&mut EngineOptions)) -> Self {
        f(&mut self.options);
        self
    }

    pub fn mode(self, mode: EngineMode) -> Self {
        self.config(|c| c.engine_mode = mode)
    }

    pub fn device(mut self, device: MockDevice) -> Self {
        self.device = device;
        self
    }

    /// Replace the single simulated port with an explicit list
    pub fn ports(mut self, ports: Vec<(String, MockDevice)>) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn spawn(self) -> TestEngine {
        let transport = Arc::new(MemoryTransport::new());
        let midi = MemoryMidiSink::new();
        let discovery = match self.ports {
            Some(ports) => MockDiscovery::new(ports),
            None => MockDiscovery::single(self.device.clone()),
        };
        let searches = discovery.search_counter();

        let parts = EngineParts {
            midi: Box::new(midi.clone()),
            transport: transport.clone(),
            discovery: Box::new(discovery),
        };
        let (engine, handle) =
            DeviceEngine::new(ConfigStore::new(self.config), parts, self.options);
        let join = engine.spawn();

        TestEngine {
            handle,
            transport,
            midi,
            device: self.device,
            searches,
            join: Some(join),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running engine and the collaborators it talks to
pub struct TestEngine {
    pub handle: EngineHandle,
    pub transport: Arc<MemoryTransport>,
    pub midi: MemoryMidiSink,
    pub device: MockDevice,
    pub searches: Arc<parking_lot::Mutex<u32>>,
    join: Option<JoinHandle<pedlbrd::Result<EngineStats>>>,
}

impl TestEngine {
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn wait_state(&self, state: ConnectionState) -> bool {
        wait_for(test_timeout(), || self.handle.state() == state)
    }

    pub fn wait_connected(&self) {
        assert!(
            self.wait_state(ConnectionState::Connected),
            "engine did not connect (state {})",
            self.state()
        );
    }

    /// Send a command from the test client
    pub fn send(&self, path: &str, args: Vec<Arg>) {
        self.transport.inject(client(), path, args);
    }

    pub fn search_count(&self) -> u32 {
        *self.searches.lock()
    }

    /// Wait for the engine thread to exit on its own
    pub fn join(&mut self) -> pedlbrd::Result<EngineStats> {
        let join = self.join.take().expect("engine already joined");
        join.join().expect("engine thread panicked")
    }

    pub fn stop(&mut self) -> pedlbrd::Result<EngineStats> {
        self.handle.stop();
        self.join()
    }
}

impl Drop for TestEngine {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.handle.stop();
            let _ = join.join();
        }
    }
}
