//! Per-pin dispatch pipeline
//!
//! The pipeline is split in two halves:
//!
//! - [`DispatchTable`] - immutable mapping derived from the configuration
//!   (MIDI channel, controller numbers, inversion, fixed ranges). It is
//!   rebuilt wholesale on every relevant config change and published through
//!   an `ArcSwap`, so the read loop always sees a complete table.
//! - [`PinStates`] - mutable per-pin runtime state (calibration requests,
//!   autorange bounds, last MIDI value). Only the read loop touches it.

use crate::config::Config;
use crate::midi::ControlChange;
use crate::types::PinId;

/// Mapping of one digital pin
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalDispatch {
    pub pin: usize,
    pub channel: u8,
    pub controller: u8,
    pub inverted: bool,
}

/// Mapping of one analog pin
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogDispatch {
    pub pin: usize,
    pub channel: u8,
    pub controller: u8,
    pub autorange: bool,
    /// Fixed range used when autorange is off
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchTable {
    pub digital: Vec<DigitalDispatch>,
    pub analog: Vec<AnalogDispatch>,
}

impl DispatchTable {
    pub fn from_config(config: &Config) -> Self {
        let channel = config.midichannel.min(crate::config::MAX_MIDI_CHANNEL);
        let digital = (0..config.num_digital_pins)
            .map(|pin| DigitalDispatch {
                pin,
                channel,
                controller: PinId::digital(pin).controller(),
                inverted: config.digital(pin).inverted,
            })
            .collect();
        let analog = (0..config.num_analog_pins)
            .map(|pin| {
                let settings = config.analog(pin);
                AnalogDispatch {
                    pin,
                    channel,
                    controller: PinId::analog(pin).controller(),
                    autorange: settings.autorange,
                    min: settings.min,
                    max: settings.max,
                }
            })
            .collect();
        Self { digital, analog }
    }

    /// Run a DIGITAL sample through the pipeline
    pub fn dispatch_digital(&self, states: &mut PinStates, pin: usize, value: u8) -> DigitalOutcome {
        let (Some(map), Some(state)) = (self.digital.get(pin), states.digital.get_mut(pin)) else {
            return DigitalOutcome::UnknownPin;
        };
        if state.needs_calibration {
            state.needs_calibration = false;
            return DigitalOutcome::Calibrated {
                inverted: value == 1,
            };
        }
        let on = (value == 1) != map.inverted;
        DigitalOutcome::Dispatched {
            midi: ControlChange::new(map.channel, map.controller, if on { 127 } else { 0 }),
            value,
        }
    }

    /// Run an ANALOG sample through the pipeline
    pub fn dispatch_analog(&self, states: &mut PinStates, pin: usize, raw: u16) -> AnalogOutcome {
        let (Some(map), Some(state)) = (self.analog.get(pin), states.analog.get_mut(pin)) else {
            return AnalogOutcome::UnknownPin;
        };
        let normalized = if map.autorange {
            state.autorange(raw)
        } else {
            normalize_fixed(map.min, map.max, raw)
        };
        let midi_value = (normalized * 127.0).round() as u8;
        let midi = if state.last_midi == Some(midi_value) {
            None
        } else {
            state.last_midi = Some(midi_value);
            Some(ControlChange::new(map.channel, map.controller, midi_value))
        };
        AnalogOutcome::Dispatched {
            normalized,
            raw,
            midi,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DigitalOutcome {
    /// The sample was the pin's rest position; no output is produced
    Calibrated { inverted: bool },
    Dispatched { midi: ControlChange, value: u8 },
    UnknownPin,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalogOutcome {
    /// `midi` is `None` when the MIDI value did not change
    Dispatched {
        normalized: f32,
        raw: u16,
        midi: Option<ControlChange>,
    },
    UnknownPin,
}

/// Normalize against a fixed range, clamping to `[0, 1]`
pub fn normalize_fixed(min: u16, max: u16, raw: u16) -> f32 {
    if max <= min {
        return if raw >= max { 1.0 } else { 0.0 };
    }
    ((raw as f32 - min as f32) / (max as f32 - min as f32)).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DigitalPinState {
    /// The next sample is the rest position
    pub needs_calibration: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalogPinState {
    pub min: u16,
    pub max: u16,
    pub resolution: u16,
    pub last_midi: Option<u8>,
}

impl AnalogPinState {
    /// Empty range: the first sample sets both bounds
    pub fn new(resolution: u16) -> Self {
        Self {
            min: resolution,
            max: 0,
            resolution,
            last_midi: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.resolution);
    }

    /// Widen the observed range with `raw` and normalize against it
    pub fn autorange(&mut self, raw: u16) -> f32 {
        let raised = raw > self.max;
        let lowered = raw < self.min;
        if raised {
            self.max = raw;
        }
        if lowered {
            self.min = raw;
        }
        if raised {
            1.0
        } else if lowered {
            0.0
        } else if self.max <= self.min {
            0.0
        } else {
            ((raw - self.min) as f32 / (self.max - self.min) as f32).clamp(0.0, 1.0)
        }
    }
}

/// Runtime state of every pin, owned by the read loop
#[derive(Debug, Clone, PartialEq)]
pub struct PinStates {
    pub digital: Vec<DigitalPinState>,
    pub analog: Vec<AnalogPinState>,
}

impl PinStates {
    pub fn new(num_digital: usize, num_analog: usize, resolution: u16) -> Self {
        Self {
            digital: vec![DigitalPinState::default(); num_digital],
            analog: vec![AnalogPinState::new(resolution); num_analog],
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.num_digital_pins,
            config.num_analog_pins,
            config.analog_resolution,
        )
    }

    /// Grow or shrink to new pin counts, keeping existing state
    pub fn resize(&mut self, num_digital: usize, num_analog: usize, resolution: u16) {
        self.digital.resize(num_digital, DigitalPinState::default());
        self.analog.resize(num_analog, AnalogPinState::new(resolution));
    }

    /// Treat the next sample of every digital pin as its rest position
    pub fn request_calibration(&mut self) {
        for pin in &mut self.digital {
            pin.needs_calibration = true;
        }
    }

    pub fn reset_analog(&mut self) {
        for pin in &mut self.analog {
            pin.reset();
        }
    }

    pub fn reset(&mut self) {
        for pin in &mut self.digital {
            pin.needs_calibration = false;
        }
        self.reset_analog();
    }

    /// Apply a resolution reported by the device; the range restarts
    pub fn set_resolution(&mut self, pin: usize, resolution: u16) {
        if let Some(state) = self.analog.get_mut(pin) {
            if state.resolution != resolution {
                *state = AnalogPinState::new(resolution);
            }
        }
    }
}
