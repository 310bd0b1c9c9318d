//! Configuration for the pedal bridge
//!
//! The configuration is a typed [`Config`] struct. Remote commands mutate it
//! through the [`ConfigStore`] façade, which addresses fields with
//! `/`-joined key paths (`digital_inputs/D3/inverted`) and notifies exactly
//! one change callback.
//!
//! # Config Location
//!
//! The configuration file lives in the platform config directory:
//! - **Linux**: `~/.config/pedlbrd/`
//! - **macOS**: `~/Library/Application Support/pedlbrd/`
//! - **Windows**: `%APPDATA%\pedlbrd\`
//!
//! # Files
//!
//! - `config.json` - the default configuration file
//! - any `*.toml` file passed explicitly is read and written as TOML
//!
//! # Example
//!
//! ```ignore
//! use pedlbrd::config::{Config, ConfigStore};
//!
//! let config = Config::load_or_default(&Config::default_path()?);
//! let store = ConfigStore::new(config);
//! store.set("midichannel", 3.into())?;
//! assert_eq!(store.get("midichannel"), Some(3.into()));
//! ```

pub mod store;

pub use store::{ConfigChange, ConfigStore};

use crate::error::{PedlError, Result};
use crate::types::{PinId, PinKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Application identifier for config and log directories
pub const APP_ID: &str = "pedlbrd";

/// Default configuration filename
pub const CONFIG_FILE: &str = "config.json";

/// Highest MIDI channel (0-based)
pub const MAX_MIDI_CHANNEL: u8 = 15;

/// Default OSC port the command server listens on
pub const DEFAULT_OSC_PORT: u16 = 47120;

/// Get the application config directory path
pub fn app_config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app config directory exists
pub fn ensure_app_config_dir() -> Result<PathBuf> {
    let dir = app_config_dir().ok_or_else(|| {
        PedlError::Config("Could not determine app config directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            PedlError::Config(format!("Failed to create app config directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// How network commands are served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Commands are polled from the serial read loop
    Sync,
    /// Commands are served from their own thread
    #[default]
    Threaded,
}

/// Per-pin settings of a digital input
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DigitalInputConfig {
    /// The pin reads 1 at rest (set by calibration)
    pub inverted: bool,
}

/// Per-pin settings of an analog input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalogInputConfig {
    /// Track the observed range instead of using `min`/`max`
    pub autorange: bool,
    pub min: u16,
    pub max: u16,
}

impl Default for AnalogInputConfig {
    fn default() -> Self {
        Self {
            autorange: true,
            min: 0,
            max: 1023,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Name of the MIDI output port
    pub midi_device_name: String,

    /// MIDI channel used for every pin (0-15)
    pub midichannel: u8,

    /// UDP port of the command server
    pub osc_port: u16,

    /// Receivers of pin data telemetry (`host:port`)
    pub osc_data_addresses: Vec<String>,

    /// Receivers of status and UI notifications (`host:port`)
    pub osc_ui_addresses: Vec<String>,

    /// Seconds between discovery attempts after a disconnect (0 = stop)
    pub reconnect_period_seconds: f64,

    /// Seconds between discovery attempts before the first connection (0 = no retry)
    pub firsttime_retry_period: f64,

    /// Keep running disconnected if the first search finds nothing
    pub firsttime_accept_fail: bool,

    /// Calibrate digital pins on every connection
    pub autocalibrate_digital: bool,

    /// Reset per-pin state when reconnecting
    pub reset_after_reconnect: bool,

    /// Seconds between idle bookkeeping runs
    pub sync_bg_checkinterval: f64,

    /// Seconds between config autosaves (0 = never)
    pub autosave_config_period: f64,

    pub engine_mode: EngineMode,

    pub num_digital_pins: usize,
    pub num_analog_pins: usize,

    /// Analog resolution assumed until the device reports its own
    pub analog_resolution: u16,

    /// Digital pin settings keyed by label (`D1`, `D2`, ...)
    pub digital_inputs: BTreeMap<String, DigitalInputConfig>,

    /// Analog pin settings keyed by label (`A1`, `A2`, ...)
    pub analog_inputs: BTreeMap<String, AnalogInputConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Self {
            midi_device_name: "PEDLBRD".to_string(),
            midichannel: 0,
            osc_port: DEFAULT_OSC_PORT,
            osc_data_addresses: vec![format!("localhost:{}", DEFAULT_OSC_PORT + 1)],
            osc_ui_addresses: Vec::new(),
            reconnect_period_seconds: 1.0,
            firsttime_retry_period: 1.0,
            firsttime_accept_fail: true,
            autocalibrate_digital: true,
            reset_after_reconnect: false,
            sync_bg_checkinterval: 2.0,
            autosave_config_period: 20.0,
            engine_mode: EngineMode::default(),
            num_digital_pins: 10,
            num_analog_pins: 4,
            analog_resolution: 1023,
            digital_inputs: BTreeMap::new(),
            analog_inputs: BTreeMap::new(),
        };
        config.fill_missing_inputs();
        config
    }
}

impl Config {
    /// Default location of the config file
    pub fn default_path() -> Result<PathBuf> {
        Ok(ensure_app_config_dir()?.join(CONFIG_FILE))
    }

    /// Add default entries for pins that have none
    pub fn fill_missing_inputs(&mut self) {
        for index in 0..self.num_digital_pins {
            self.digital_inputs
                .entry(PinId::digital(index).label())
                .or_default();
        }
        for index in 0..self.num_analog_pins {
            self.analog_inputs
                .entry(PinId::analog(index).label())
                .or_insert_with(|| AnalogInputConfig {
                    max: self.analog_resolution,
                    ..AnalogInputConfig::default()
                });
        }
    }

    /// Settings of digital pin `index` (defaults if missing)
    pub fn digital(&self, index: usize) -> DigitalInputConfig {
        self.digital_inputs
            .get(&PinId::digital(index).label())
            .cloned()
            .unwrap_or_default()
    }

    /// Settings of analog pin `index` (defaults if missing)
    pub fn analog(&self, index: usize) -> AnalogInputConfig {
        self.analog_inputs
            .get(&PinId::analog(index).label())
            .cloned()
            .unwrap_or_default()
    }

    /// Config key path of a per-pin field
    pub fn pin_path(pin: PinId, field: &str) -> String {
        let map = match pin.kind {
            PinKind::Digital => "digital_inputs",
            PinKind::Analog => "analog_inputs",
        };
        format!("{}/{}/{}", map, pin.label(), field)
    }

    /// One character per digital pin: `-` normal, `X` inverted
    pub fn digital_map_string(&self) -> String {
        (0..self.num_digital_pins)
            .map(|i| if self.digital(i).inverted { 'X' } else { '-' })
            .collect()
    }

    /// Load from a JSON or TOML file (chosen by extension)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PedlError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let mut config: Config = if is_toml(path) {
            toml::from_str(&content)
                .map_err(|e| PedlError::Config(format!("Failed to parse {}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| PedlError::Config(format!("Failed to parse {}: {}", path.display(), e)))?
        };
        config.fill_missing_inputs();
        Ok(config)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to a JSON or TOML file (chosen by extension)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| PedlError::Serialization(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| PedlError::Serialization(format!("Failed to serialize config: {}", e)))?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)
            .map_err(|e| PedlError::Config(format!("Failed to write {}: {}", path.display(), e)))
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}
