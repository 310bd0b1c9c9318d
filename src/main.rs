//! pedlbrd - Main Entry Point
//!
//! Usage: `pedlbrd [config-file]`
//!
//! Without an argument the configuration is read from the platform config
//! directory. Set `PEDLBRD_MOCK=1` to run against a simulated pedal board.

use anyhow::Context;
use pedlbrd::{
    config::{self, Config, ConfigStore},
    device::{
        mock::{MockDevice, MockDiscovery},
        DeviceEngine, EngineOptions, EngineParts, PortDiscovery, SystemPorts,
    },
    midi::{MidiSink, MidirSink, NullMidiSink},
    net::UdpTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable selecting the simulated device
const MOCK_ENV: &str = "PEDLBRD_MOCK";

fn init_logging() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pedlbrd=debug"));

    let file = config::ensure_app_config_dir().ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir.join("logs"), "pedlbrd.log");
        tracing_appender::non_blocking(appender)
    });
    let (file_writer, guard) = match file {
        Some((writer, guard)) => (Some(writer), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_writer.map(|writer| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
        }))
        .init();

    guard
}

fn open_midi(name: &str) -> Box<dyn MidiSink> {
    match MidirSink::open(name) {
        Ok(sink) => Box::new(sink),
        Err(e) => {
            tracing::warn!("MIDI output unavailable ({}), messages will be dropped", e);
            Box::new(NullMidiSink::new())
        }
    }
}

fn discovery() -> Box<dyn PortDiscovery> {
    let mock = std::env::var(MOCK_ENV).is_ok_and(|v| v == "1");
    if mock {
        tracing::info!("Using simulated pedal board");
        let device = MockDevice::new();
        device.set_heartbeat_period(Some(Duration::from_secs(1)));
        Box::new(MockDiscovery::single(device))
    } else {
        Box::new(SystemPorts::new())
    }
}

fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging();
    tracing::info!("Starting pedlbrd {}", env!("CARGO_PKG_VERSION"));

    let path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => Config::default_path().context("no config directory")?,
    };
    tracing::info!("Using config {}", path.display());
    let config = Config::load_or_default(&path);

    let transport = UdpTransport::bind(config.osc_port)
        .with_context(|| format!("could not listen on OSC port {}", config.osc_port))?;
    let parts = EngineParts {
        midi: open_midi(&config.midi_device_name),
        transport: Arc::new(transport),
        discovery: discovery(),
    };

    let store = ConfigStore::with_path(config, path);
    let (engine, _handle) = DeviceEngine::new(store, parts, EngineOptions::default());
    let stats = engine.run().context("device engine failed")?;

    tracing::info!(
        "Shutting down after {} frames and {} MIDI messages",
        stats.frames,
        stats.midi_sent
    );
    Ok(())
}
