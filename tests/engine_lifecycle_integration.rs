//! Integration tests for the device engine lifecycle
//!
//! These tests run the whole engine against the simulated pedal board:
//! - Discovery, connection and device info
//! - Digital and analog samples to MIDI and telemetry
//! - Calibration
//! - Disconnection, reconnection and the watchdog

mod common;

use common::builders::EngineBuilder;
use common::{assert_float_eq, float_arg, messages, test_timeout, wait_for};
use pedlbrd::device::mock::{MockDevice, MockDiscovery};
use pedlbrd::device::{DeviceEngine, EngineParts, Opcode};
use pedlbrd::midi::{ControlChange, MemoryMidiSink};
use pedlbrd::net::telemetry::{PATH_ANALOG, PATH_DEVMSG, PATH_DIGITAL, PATH_HEARTBEAT, PATH_STATUS};
use pedlbrd::net::{Arg, MemoryTransport};
use pedlbrd::{Config, ConfigStore, ConnectionState, EngineEvent, PedlError};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

#[test]
#[serial]
fn test_engine_connects_and_stops() {
    let mut engine = EngineBuilder::new().spawn();
    engine.wait_connected();

    assert!(wait_for(test_timeout(), || {
        messages(&engine.transport, PATH_STATUS)
            .iter()
            .any(|m| m.args == vec![Arg::from("CONNECTED")])
    }));

    let stats = engine.stop().expect("engine should stop cleanly");
    assert_eq!(stats.connections, 1);

    let events = engine.handle.drain();
    assert!(events.contains(&EngineEvent::StateChanged(ConnectionState::Connected)));
    assert!(matches!(events.last(), Some(EngineEvent::Stopped(_))));
}

#[test]
#[serial]
fn test_device_info_is_requested() {
    let engine = EngineBuilder::new()
        .device(MockDevice::with_pins(6, 2))
        .spawn();
    engine.wait_connected();

    assert!(wait_for(test_timeout(), || engine
        .handle
        .context()
        .device_info()
        .is_some()));
    let info = engine.handle.context().device_info().unwrap();
    assert_eq!(info.num_digital, 6);
    assert_eq!(info.num_analog, 2);
    assert_eq!(info.analog[0].resolution, 1023);

    // The reported pin counts replace the configured ones
    assert!(wait_for(test_timeout(), || engine
        .handle
        .context()
        .config
        .read(|c| c.num_digital_pins == 6 && c.num_analog_pins == 2)));
    assert!(wait_for(test_timeout(), || engine
        .handle
        .context()
        .dispatch()
        .analog
        .len()
        == 2));
}

#[test]
#[serial]
fn test_digital_inversion_reaches_midi() {
    let engine = EngineBuilder::new()
        .config(|c| {
            c.digital_inputs.get_mut("D1").unwrap().inverted = true;
            c.midichannel = 2;
        })
        .spawn();
    engine.wait_connected();

    engine.device.press(0, 1);
    engine.device.press(1, 1);

    assert!(wait_for(test_timeout(), || engine.midi.sent().len() >= 2));
    assert_eq!(
        engine.midi.sent(),
        vec![ControlChange::new(2, 1, 0), ControlChange::new(2, 2, 127)]
    );

    // Telemetry carries the raw value
    let digital = messages(&engine.transport, PATH_DIGITAL);
    assert_eq!(digital[0].args, vec![Arg::Int(0), Arg::Int(1)]);
    assert_eq!(digital[1].args, vec![Arg::Int(1), Arg::Int(1)]);
}

#[test]
#[serial]
fn test_analog_autorange_and_deduplication() {
    let engine = EngineBuilder::new().spawn();
    engine.wait_connected();

    for raw in [500, 900, 200, 201] {
        engine.device.analog(0, raw);
    }

    assert!(wait_for(test_timeout(), || messages(
        &engine.transport,
        PATH_ANALOG
    )
    .len()
        >= 4));
    let analog = messages(&engine.transport, PATH_ANALOG);
    assert_float_eq(float_arg(&analog[0], 1), 1.0, 1e-6);
    assert_float_eq(float_arg(&analog[1], 1), 1.0, 1e-6);
    assert_float_eq(float_arg(&analog[2], 1), 0.0, 1e-6);
    assert_eq!(analog[2].args[2], Arg::Int(200));

    // 1.0 twice and then 0.0 twice: only the changes reach MIDI
    assert_eq!(
        engine.midi.sent(),
        vec![ControlChange::new(0, 101, 127), ControlChange::new(0, 101, 0)]
    );
}

#[test]
#[serial]
fn test_autocalibration_marks_pressed_pins_inverted() {
    let device = MockDevice::new();
    device.set_heartbeat_period(Some(Duration::from_millis(50)));
    device.set_digital(2, 1);
    let engine = EngineBuilder::new()
        .device(device)
        .config(|c| c.autocalibrate_digital = true)
        .spawn();
    engine.wait_connected();

    let mut events = Vec::new();
    assert!(wait_for(test_timeout(), || {
        events.extend(engine.handle.drain());
        events.contains(&EngineEvent::Calibrated {
            pin: 2,
            inverted: true,
        })
    }));
    assert_eq!(
        engine
            .handle
            .context()
            .config
            .read(|c| c.digital_map_string()),
        "--X-------"
    );
    assert!(engine.handle.context().dispatch().digital[2].inverted);

    // Calibration frames do not produce MIDI
    assert!(engine.midi.sent().is_empty());

    // The pin at rest is now "off"
    engine.device.press(2, 1);
    assert!(wait_for(test_timeout(), || !engine.midi.sent().is_empty()));
    assert_eq!(engine.midi.sent()[0], ControlChange::new(0, 3, 0));
}

#[test]
#[serial]
fn test_button_calibrates_after_settling() {
    let engine = EngineBuilder::new().spawn();
    engine.wait_connected();
    let force_count = || {
        engine
            .device
            .commands()
            .iter()
            .filter(|(op, _)| *op == Opcode::ForceDigital)
            .count()
    };

    std::thread::sleep(Duration::from_millis(150));
    engine.device.button(0, 1);
    assert!(wait_for(test_timeout(), || force_count() == 1));
}

#[test]
#[serial]
fn test_device_messages_and_heartbeats_are_forwarded() {
    let engine = EngineBuilder::new().spawn();
    engine.wait_connected();
    engine.device.message("hello");

    assert!(wait_for(test_timeout(), || !messages(
        &engine.transport,
        PATH_DEVMSG
    )
    .is_empty()));
    assert_eq!(
        messages(&engine.transport, PATH_DEVMSG)[0].args,
        vec![Arg::from("hello")]
    );
    assert!(wait_for(test_timeout(), || !messages(
        &engine.transport,
        PATH_HEARTBEAT
    )
    .is_empty()));
}

#[test]
#[serial]
fn test_garbage_is_skipped() {
    let mut engine = EngineBuilder::new().spawn();
    engine.wait_connected();

    // stray bytes, then a digital frame cut short by a complete analog frame
    engine.device.push_bytes(&[
        0x01,
        0x02,
        0x80 | b'D',
        0x03,
        0x80 | b'A',
        0,
        7,
        127,
    ]);
    engine.device.press(4, 1);
    assert!(wait_for(test_timeout(), || engine.midi.sent().len() >= 2));

    let stats = engine.stop().unwrap();
    assert_eq!(stats.noise_bytes, 2);
    assert_eq!(stats.framing_errors, 1);
    assert_eq!(
        engine.midi.sent(),
        vec![ControlChange::new(0, 101, 127), ControlChange::new(0, 5, 127)]
    );
    let analog = messages(&engine.transport, PATH_ANALOG);
    assert_eq!(analog[0].args[2], Arg::Int(1023));
}

#[test]
#[serial]
fn test_reconnects_with_positive_period() {
    let engine = EngineBuilder::new()
        .config(|c| c.reconnect_period_seconds = 0.05)
        .spawn();
    engine.wait_connected();

    engine.device.unplug();
    assert!(engine.wait_state(ConnectionState::Searching));
    let searches = engine.search_count();

    // Discovery keeps retrying while the board is away
    assert!(wait_for(test_timeout(), || engine.search_count() >= searches + 2));
    assert_eq!(engine.state(), ConnectionState::Searching);

    engine.device.replug();
    engine.wait_connected();

    let events = engine.handle.drain();
    let states: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Searching,
            ConnectionState::Connected,
        ]
    );
}

#[test]
#[serial]
fn test_zero_period_stops_on_disconnect() {
    let mut engine = EngineBuilder::new()
        .config(|c| c.reconnect_period_seconds = 0.0)
        .spawn();
    engine.wait_connected();

    engine.device.unplug();
    let stats = engine.join().expect("a lost device is not an error");
    assert_eq!(stats.connections, 1);
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert!(!engine.handle.is_running());
}

#[test]
#[serial]
fn test_watchdog_declares_silent_device_lost() {
    let device = MockDevice::new();
    device.set_heartbeat_period(None);
    let mut engine = EngineBuilder::new()
        .device(device)
        .config(|c| c.reconnect_period_seconds = 0.0)
        .options(|o| o.watchdog = Duration::from_millis(200))
        .spawn();
    engine.wait_connected();

    engine.join().unwrap();
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

#[test]
#[serial]
fn test_strict_first_search_is_fatal() {
    let mut engine = EngineBuilder::new()
        .ports(Vec::new())
        .config(|c| {
            c.firsttime_retry_period = 0.0;
            c.firsttime_accept_fail = false;
        })
        .spawn();

    let err = engine.join().unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, PedlError::DeviceNotFound(_)));
}

#[test]
#[serial]
fn test_accepted_first_failure_keeps_running() {
    let mut engine = EngineBuilder::new()
        .ports(Vec::new())
        .config(|c| {
            c.firsttime_retry_period = 0.0;
            c.firsttime_accept_fail = true;
            c.reconnect_period_seconds = 0.0;
        })
        .spawn();

    assert!(engine.wait_state(ConnectionState::Disconnected));
    std::thread::sleep(Duration::from_millis(50));
    assert!(engine.handle.is_running());
    assert!(engine.stop().is_ok());
}

#[test]
#[serial]
fn test_engine_without_spawn_helper() {
    let transport = Arc::new(MemoryTransport::new());
    let device = MockDevice::new();
    device.set_heartbeat_period(Some(Duration::from_millis(50)));
    let parts = EngineParts {
        midi: Box::new(MemoryMidiSink::new()),
        transport: transport.clone(),
        discovery: Box::new(MockDiscovery::single(device)),
    };
    let (engine, handle) = DeviceEngine::new(
        ConfigStore::new(Config::default()),
        parts,
        common::builders::fast_options(),
    );
    let join = engine.spawn();

    assert!(wait_for(test_timeout(), || handle.state()
        == ConnectionState::Connected));
    handle.stop();
    assert!(join.join().unwrap().is_ok());
}
