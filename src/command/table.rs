//! The standard command set
//!
//! Pin numbers in commands are 0-based, as on the wire and in telemetry.

use super::{
    CommandResult, CommandSpec, ForwardReply, GetOutcome, Handler, Request, ANY_ARGS,
};
use crate::config::{Config, MAX_MIDI_CHANNEL};
use crate::device::codec::{self, DeviceParam, Opcode, MAX_PARAM, MAX_SPLIT_VALUE};
use crate::device::EngineRequest;
use crate::error::CommandError;
use crate::net::{Arg, NetAddress};
use crate::types::PinId;
use serde_json::json;

/// Highest smoothing percentage
const MAX_SMOOTHING: i32 = 100;

pub const COMMANDS: &[CommandSpec] = &[
    // ---- local settings ----
    CommandSpec {
        path: "/midichannel/set",
        signature: "i",
        description: "Set the MIDI channel (0-15)",
        handler: Handler::Ordinary(set_midichannel),
    },
    CommandSpec {
        path: "/midichannel/get",
        signature: "",
        description: "MIDI channel",
        handler: Handler::Get(get_midichannel),
    },
    CommandSpec {
        path: "/digitalinvert/set",
        signature: "ii",
        description: "Invert digital pin (pin, 0|1)",
        handler: Handler::Ordinary(set_digitalinvert),
    },
    CommandSpec {
        path: "/digitalinvert/get",
        signature: "i",
        description: "Whether a digital pin is inverted (pin)",
        handler: Handler::Get(get_digitalinvert),
    },
    CommandSpec {
        path: "/autorange/set",
        signature: "ii",
        description: "Enable autorange on an analog pin (pin, 0|1)",
        handler: Handler::Ordinary(set_autorange),
    },
    CommandSpec {
        path: "/autorange/get",
        signature: "i",
        description: "Whether autorange is on (pin)",
        handler: Handler::Get(get_autorange),
    },
    CommandSpec {
        path: "/analogrange/set",
        signature: "iii",
        description: "Fixed range of an analog pin, disables autorange (pin, min, max)",
        handler: Handler::Ordinary(set_analogrange),
    },
    CommandSpec {
        path: "/analogrange/get",
        signature: "i",
        description: "Fixed range of an analog pin (pin)",
        handler: Handler::Get(get_analogrange),
    },
    CommandSpec {
        path: "/maxanalog/set",
        signature: "ii",
        description: "Upper bound of an analog pin's fixed range (pin, max)",
        handler: Handler::Ordinary(set_maxanalog),
    },
    CommandSpec {
        path: "/maxanalog/get",
        signature: "i",
        description: "Upper bound of an analog pin's fixed range (pin)",
        handler: Handler::Get(get_maxanalog),
    },
    // ---- device parameters ----
    CommandSpec {
        path: "/smoothing/set",
        signature: "ii",
        description: "Analog smoothing percentage (pin, 0-100)",
        handler: Handler::Ordinary(set_smoothing),
    },
    CommandSpec {
        path: "/smoothing/get",
        signature: "i",
        description: "Analog smoothing percentage, asked from the device (pin)",
        handler: Handler::Get(get_smoothing),
    },
    CommandSpec {
        path: "/filtertype/set",
        signature: "ii",
        description: "Analog filter type (pin, type)",
        handler: Handler::Ordinary(set_filtertype),
    },
    CommandSpec {
        path: "/filtertype/get",
        signature: "i",
        description: "Analog filter type, asked from the device (pin)",
        handler: Handler::Get(get_filtertype),
    },
    CommandSpec {
        path: "/heartperiod/set",
        signature: "i",
        description: "Heartbeat period in milliseconds",
        handler: Handler::Ordinary(set_heartperiod),
    },
    CommandSpec {
        path: "/heartperiod/get",
        signature: "",
        description: "Heartbeat period in milliseconds, asked from the device",
        handler: Handler::Get(get_heartperiod),
    },
    CommandSpec {
        path: "/led/set",
        signature: "i",
        description: "LED pattern",
        handler: Handler::Ordinary(set_led),
    },
    // ---- actions ----
    CommandSpec {
        path: "/calibrate",
        signature: "",
        description: "Take the current digital states as rest positions",
        handler: Handler::Ordinary(calibrate),
    },
    CommandSpec {
        path: "/resetstate",
        signature: "",
        description: "Forget calibration requests and analog ranges",
        handler: Handler::Ordinary(resetstate),
    },
    CommandSpec {
        path: "/echo",
        signature: "i",
        description: "Log every sample and command (0|1)",
        handler: Handler::Ordinary(echo),
    },
    CommandSpec {
        path: "/saveconfig",
        signature: "",
        description: "Save the configuration now",
        handler: Handler::Ordinary(saveconfig),
    },
    CommandSpec {
        path: "/info/refresh",
        signature: "",
        description: "Ask the device to describe itself",
        handler: Handler::Ordinary(info_refresh),
    },
    CommandSpec {
        path: "/quit",
        signature: "",
        description: "Stop the engine",
        handler: Handler::Ordinary(quit),
    },
    // ---- addresses ----
    CommandSpec {
        path: "/registerdata",
        signature: ANY_ARGS,
        description: "Receive pin data ([port | address])",
        handler: Handler::Meta(registerdata),
    },
    CommandSpec {
        path: "/registerui",
        signature: ANY_ARGS,
        description: "Receive status notifications ([port | address])",
        handler: Handler::Meta(registerui),
    },
    CommandSpec {
        path: "/registerall",
        signature: ANY_ARGS,
        description: "Receive pin data and notifications ([port | address])",
        handler: Handler::Meta(registerall),
    },
    CommandSpec {
        path: "/signout",
        signature: ANY_ARGS,
        description: "Stop receiving anything ([port | address])",
        handler: Handler::Meta(signout),
    },
    CommandSpec {
        path: "/dataaddr/get",
        signature: "",
        description: "Addresses receiving pin data",
        handler: Handler::Get(get_dataaddr),
    },
    CommandSpec {
        path: "/uiaddr/get",
        signature: "",
        description: "Addresses receiving notifications",
        handler: Handler::Get(get_uiaddr),
    },
    // ---- queries ----
    CommandSpec {
        path: "/status/get",
        signature: "",
        description: "Connection state",
        handler: Handler::Get(get_status),
    },
    CommandSpec {
        path: "/digitalmapstr/get",
        signature: "",
        description: "Digital inversion map, one character per pin",
        handler: Handler::Get(get_digitalmapstr),
    },
    CommandSpec {
        path: "/info/get",
        signature: "",
        description: "Device description as JSON",
        handler: Handler::Get(get_info),
    },
    CommandSpec {
        path: "/api/get",
        signature: "",
        description: "Every command with its signature",
        handler: Handler::Get(get_api),
    },
    CommandSpec {
        path: "/help",
        signature: "",
        description: "Send the command list to /help",
        handler: Handler::Ordinary(help),
    },
];

/// Path answered by `/help`
pub const PATH_HELP: &str = "/help";

// ---- helpers ----

fn check_range(what: &str, value: i32, min: i32, max: i32) -> CommandResult<i32> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(CommandError::out_of_range(what, value as i64, min as i64, max as i64))
    }
}

fn digital_pin(req: &Request, index: usize) -> CommandResult<usize> {
    let count = req.ctx.config.read(|c| c.num_digital_pins) as i32;
    check_range("digital pin", req.int(index)?, 0, count - 1).map(|p| p as usize)
}

fn analog_pin(req: &Request, index: usize) -> CommandResult<usize> {
    let count = req.ctx.config.read(|c| c.num_analog_pins) as i32;
    check_range("analog pin", req.int(index)?, 0, count - 1).map(|p| p as usize)
}

fn set_config(req: &Request, path: &str, value: serde_json::Value) -> CommandResult {
    req.ctx
        .config
        .set(path, value)
        .map_err(|e| CommandError::Failed(e.to_string()))
}

fn request(req: &Request, request: EngineRequest) -> CommandResult {
    req.ctx.request(request)
}

fn send_device(req: &Request, opcode: Opcode, params: &[i32]) -> CommandResult {
    let bytes = codec::encode_command(opcode, params)?;
    req.ctx.send_to_device(bytes)
}

fn value(values: Vec<Arg>) -> CommandResult<GetOutcome> {
    Ok(GetOutcome::Value(values))
}

fn flag(on: bool) -> Arg {
    Arg::Int(on as i32)
}

// ---- local settings ----

fn set_midichannel(req: &Request) -> CommandResult {
    let channel = check_range("midi channel", req.int(0)?, 0, MAX_MIDI_CHANNEL as i32)?;
    set_config(req, "midichannel", json!(channel))
}

fn get_midichannel(req: &Request) -> CommandResult<GetOutcome> {
    value(vec![Arg::Int(req.ctx.config.read(|c| c.midichannel) as i32)])
}

fn set_digitalinvert(req: &Request) -> CommandResult {
    let pin = digital_pin(req, 0)?;
    let inverted = req.int(1)? != 0;
    set_config(
        req,
        &Config::pin_path(PinId::digital(pin), "inverted"),
        json!(inverted),
    )
}

fn get_digitalinvert(req: &Request) -> CommandResult<GetOutcome> {
    let pin = digital_pin(req, 0)?;
    let inverted = req.ctx.config.read(|c| c.digital(pin).inverted);
    value(vec![Arg::Int(pin as i32), flag(inverted)])
}

fn set_autorange(req: &Request) -> CommandResult {
    let pin = analog_pin(req, 0)?;
    let on = req.int(1)? != 0;
    set_config(req, &Config::pin_path(PinId::analog(pin), "autorange"), json!(on))
}

fn get_autorange(req: &Request) -> CommandResult<GetOutcome> {
    let pin = analog_pin(req, 0)?;
    let on = req.ctx.config.read(|c| c.analog(pin).autorange);
    value(vec![Arg::Int(pin as i32), flag(on)])
}

fn set_analogrange(req: &Request) -> CommandResult {
    let pin = analog_pin(req, 0)?;
    let max = check_range("analog max", req.int(2)?, 1, MAX_SPLIT_VALUE as i32)?;
    let min = check_range("analog min", req.int(1)?, 0, max - 1)?;
    let path = PinId::analog(pin);
    set_config(
        req,
        &format!("analog_inputs/{}", path.label()),
        json!({ "autorange": false, "min": min, "max": max }),
    )
}

fn get_analogrange(req: &Request) -> CommandResult<GetOutcome> {
    let pin = analog_pin(req, 0)?;
    let settings = req.ctx.config.read(|c| c.analog(pin));
    value(vec![
        Arg::Int(pin as i32),
        Arg::Int(settings.min as i32),
        Arg::Int(settings.max as i32),
    ])
}

fn set_maxanalog(req: &Request) -> CommandResult {
    let pin = analog_pin(req, 0)?;
    let min = req.ctx.config.read(|c| c.analog(pin).min) as i32;
    let max = check_range("analog max", req.int(1)?, min + 1, MAX_SPLIT_VALUE as i32)?;
    set_config(req, &Config::pin_path(PinId::analog(pin), "max"), json!(max))
}

fn get_maxanalog(req: &Request) -> CommandResult<GetOutcome> {
    let pin = analog_pin(req, 0)?;
    let max = req.ctx.config.read(|c| c.analog(pin).max);
    value(vec![Arg::Int(pin as i32), Arg::Int(max as i32)])
}

// ---- device parameters ----

fn set_smoothing(req: &Request) -> CommandResult {
    let pin = analog_pin(req, 0)?;
    let percent = check_range("smoothing", req.int(1)?, 0, MAX_SMOOTHING)?;
    send_device(
        req,
        Opcode::Set,
        &[DeviceParam::Smoothing.code() as i32, pin as i32, percent],
    )
}

/// GET of a per-pin device parameter; the reply carries `(pin, value)`
fn forward_pin_param(req: &Request, param: DeviceParam) -> CommandResult<GetOutcome> {
    let pin = analog_pin(req, 0)? as i32;
    Ok(GetOutcome::Forward(ForwardReply {
        param,
        args: vec![pin],
        postprocess: Box::new(move |v| vec![Arg::Int(pin), Arg::Int(v as i32)]),
    }))
}

fn get_smoothing(req: &Request) -> CommandResult<GetOutcome> {
    forward_pin_param(req, DeviceParam::Smoothing)
}

fn set_filtertype(req: &Request) -> CommandResult {
    let pin = analog_pin(req, 0)?;
    let kind = check_range("filter type", req.int(1)?, 0, MAX_PARAM)?;
    send_device(
        req,
        Opcode::Set,
        &[DeviceParam::FilterType.code() as i32, pin as i32, kind],
    )
}

fn get_filtertype(req: &Request) -> CommandResult<GetOutcome> {
    forward_pin_param(req, DeviceParam::FilterType)
}

fn set_heartperiod(req: &Request) -> CommandResult {
    let ms = check_range("heartbeat period", req.int(0)?, 0, MAX_SPLIT_VALUE as i32)?;
    let (hi, lo) = codec::split_value(ms as u16);
    send_device(
        req,
        Opcode::Set,
        &[DeviceParam::HeartPeriod.code() as i32, hi as i32, lo as i32],
    )
}

fn get_heartperiod(_req: &Request) -> CommandResult<GetOutcome> {
    Ok(GetOutcome::Forward(ForwardReply {
        param: DeviceParam::HeartPeriod,
        args: Vec::new(),
        postprocess: Box::new(|v| vec![Arg::Int(v as i32)]),
    }))
}

fn set_led(req: &Request) -> CommandResult {
    let pattern = check_range("led pattern", req.int(0)?, 0, MAX_PARAM)?;
    send_device(req, Opcode::Led, &[pattern])
}

// ---- actions ----

fn calibrate(req: &Request) -> CommandResult {
    request(req, EngineRequest::CalibrateDigital)
}

fn resetstate(req: &Request) -> CommandResult {
    request(req, EngineRequest::ResetState)
}

fn echo(req: &Request) -> CommandResult {
    let on = req.int(0)? != 0;
    req.ctx.set_echo(on);
    tracing::info!("Echo {}", if on { "on" } else { "off" });
    Ok(())
}

fn saveconfig(req: &Request) -> CommandResult {
    request(req, EngineRequest::SaveConfig)
}

fn info_refresh(req: &Request) -> CommandResult {
    send_device(req, Opcode::Info, &[])
}

fn quit(req: &Request) -> CommandResult {
    tracing::info!("Quit requested by {}", req.source);
    req.ctx.stop();
    Ok(())
}

fn help(req: &Request) -> CommandResult {
    let lines = req.table.api_lines().into_iter().map(Arg::Str).collect();
    req.ctx.telemetry.send_to(req.source, PATH_HELP, lines);
    Ok(())
}

// ---- addresses ----

const DATA_KEY: &str = "osc_data_addresses";
const UI_KEY: &str = "osc_ui_addresses";

/// Address named by the optional argument: none means the sender, an int is
/// a port on the sender's host, a string is `host:port` or a bare port
fn requested_address(req: &Request) -> CommandResult<NetAddress> {
    match req.args {
        [] => Ok(req.source.clone()),
        [Arg::Int(port)] => {
            let port = check_range("port", *port, 1, u16::MAX as i32)?;
            Ok(NetAddress::new(req.source.host.clone(), port as u16))
        }
        [Arg::Str(text)] => NetAddress::parse_with_host(text, &req.source.host)
            .map_err(|e| CommandError::Failed(e.to_string())),
        _ => Err(CommandError::BadArguments {
            path: req.path.to_string(),
            expected: "[i|s]".to_string(),
            got: crate::net::signature_of(req.args),
        }),
    }
}

fn address_list(req: &Request, key: &str) -> Vec<String> {
    req.ctx.config.read(|c| match key {
        DATA_KEY => c.osc_data_addresses.clone(),
        _ => c.osc_ui_addresses.clone(),
    })
}

fn same_address(entry: &str, address: &NetAddress) -> bool {
    NetAddress::parse(entry).is_ok_and(|a| &a == address)
}

fn register(req: &Request, keys: &[&str]) -> CommandResult {
    let address = requested_address(req)?;
    for key in keys {
        let mut list = address_list(req, key);
        if list.iter().any(|entry| same_address(entry, &address)) {
            tracing::debug!("{} already in {}", address, key);
            continue;
        }
        list.push(address.to_string());
        set_config(req, key, json!(list))?;
        tracing::info!("Registered {} in {}", address, key);
    }
    Ok(())
}

fn registerdata(req: &Request) -> CommandResult {
    register(req, &[DATA_KEY])
}

fn registerui(req: &Request) -> CommandResult {
    register(req, &[UI_KEY])
}

fn registerall(req: &Request) -> CommandResult {
    register(req, &[DATA_KEY, UI_KEY])
}

fn signout(req: &Request) -> CommandResult {
    let address = requested_address(req)?;
    for key in [DATA_KEY, UI_KEY] {
        let mut list = address_list(req, key);
        let before = list.len();
        list.retain(|entry| !same_address(entry, &address));
        if list.len() != before {
            set_config(req, key, json!(list))?;
            tracing::info!("Removed {} from {}", address, key);
        }
    }
    Ok(())
}

fn addresses_as_args(addresses: Vec<NetAddress>) -> Vec<Arg> {
    addresses
        .into_iter()
        .map(|a| Arg::Str(a.to_string()))
        .collect()
}

fn get_dataaddr(req: &Request) -> CommandResult<GetOutcome> {
    value(addresses_as_args(req.ctx.telemetry.data_addresses()))
}

fn get_uiaddr(req: &Request) -> CommandResult<GetOutcome> {
    value(addresses_as_args(req.ctx.telemetry.ui_addresses()))
}

// ---- queries ----

fn get_status(req: &Request) -> CommandResult<GetOutcome> {
    value(vec![Arg::Str(req.ctx.state().to_string())])
}

fn get_digitalmapstr(req: &Request) -> CommandResult<GetOutcome> {
    value(vec![Arg::Str(
        req.ctx.config.read(Config::digital_map_string),
    )])
}

fn get_info(req: &Request) -> CommandResult<GetOutcome> {
    let info = req
        .ctx
        .device_info()
        .ok_or_else(|| CommandError::Failed("no device info received yet".to_string()))?;
    value(vec![Arg::Str(info.to_json())])
}

fn get_api(req: &Request) -> CommandResult<GetOutcome> {
    value(req.table.api_lines().into_iter().map(Arg::Str).collect())
}
