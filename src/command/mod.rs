//! Remote command dispatcher
//!
//! Every command is an entry in a static [`CommandTable`] that maps a wire
//! path to an argument signature, a one-line description and a handler.
//! Handlers come in three kinds:
//!
//! - **Ordinary** - a local action; nothing is sent back on success
//! - **Meta** - receives the raw request (any arguments); used for address
//!   registration
//! - **Get** - answers the caller. The first argument is a reply token: an
//!   integer id (reply to the sender) or a `host:port/id` string (reply to
//!   that address). The handler either returns the value directly or a
//!   [`ForwardReply`], in which case the request is sent to the device and
//!   answered when the device's REPLY frame comes back.
//!
//! Failures are reported to the sender on `/error (path, message)`. A
//! handler panic is caught and reported the same way.

pub mod table;

use crate::device::codec::{self, DeviceParam, Opcode};
use crate::device::replies::{Postprocess, ReplyRoute};
use crate::device::EngineContext;
use crate::error::{CommandError, Result};
use crate::net::{signature_of, Arg, Incoming, NetAddress};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Receive timeout of the command thread; bounds how long a stop takes
const SERVE_TIMEOUT: Duration = Duration::from_millis(50);

/// Signature of commands that accept any arguments
pub const ANY_ARGS: &str = "*";

/// One incoming command, as seen by a handler
pub struct Request<'a> {
    pub ctx: &'a EngineContext,
    pub table: &'a CommandTable,
    pub path: &'a str,
    /// Arguments without the reply token
    pub args: &'a [Arg],
    pub source: &'a NetAddress,
}

impl Request<'_> {
    fn bad_args(&self, expected: &str) -> CommandError {
        CommandError::BadArguments {
            path: self.path.to_string(),
            expected: expected.to_string(),
            got: signature_of(self.args),
        }
    }

    pub fn int(&self, index: usize) -> std::result::Result<i32, CommandError> {
        self.args
            .get(index)
            .and_then(Arg::as_int)
            .ok_or_else(|| self.bad_args("i"))
    }

    pub fn float(&self, index: usize) -> std::result::Result<f32, CommandError> {
        self.args
            .get(index)
            .and_then(Arg::as_float)
            .ok_or_else(|| self.bad_args("f"))
    }

    pub fn str(&self, index: usize) -> std::result::Result<&str, CommandError> {
        self.args
            .get(index)
            .and_then(Arg::as_str)
            .ok_or_else(|| self.bad_args("s"))
    }
}

/// A GET request answered by the device
pub struct ForwardReply {
    pub param: DeviceParam,
    /// Parameter arguments after the correlation id
    pub args: Vec<i32>,
    /// Turns the device value into the reply values
    pub postprocess: Postprocess,
}

pub enum GetOutcome {
    Value(Vec<Arg>),
    Forward(ForwardReply),
}

type CommandResult<T = ()> = std::result::Result<T, CommandError>;

#[derive(Clone, Copy)]
pub enum Handler {
    Ordinary(fn(&Request) -> CommandResult),
    Meta(fn(&Request) -> CommandResult),
    Get(fn(&Request) -> CommandResult<GetOutcome>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Ordinary,
    Meta,
    Get,
}

/// A registered command
#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub path: &'static str,
    /// Argument type tags (`i`, `f`, `s`); excludes the reply token of GET commands
    pub signature: &'static str,
    pub description: &'static str,
    pub handler: Handler,
}

impl CommandSpec {
    pub fn kind(&self) -> CommandKind {
        match self.handler {
            Handler::Ordinary(_) => CommandKind::Ordinary,
            Handler::Meta(_) => CommandKind::Meta,
            Handler::Get(_) => CommandKind::Get,
        }
    }

    /// Path without the leading slash (`smoothing/get`)
    pub fn name(&self) -> &'static str {
        self.path.trim_start_matches('/')
    }

    /// Method name used in replies (`smoothing`)
    pub fn method(&self) -> &'static str {
        let name = self.name();
        name.strip_suffix("/get").unwrap_or(name)
    }

    /// Signature as written on the wire, reply token included
    pub fn wire_signature(&self) -> String {
        match self.kind() {
            CommandKind::Get => format!("i{}", self.signature),
            _ => self.signature.to_string(),
        }
    }
}

/// Path to command lookup, built once
pub struct CommandTable {
    specs: Vec<CommandSpec>,
    by_path: HashMap<&'static str, usize>,
}

impl CommandTable {
    pub fn new(specs: &[CommandSpec]) -> Self {
        let by_path = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.path, i))
            .collect();
        Self {
            specs: specs.to_vec(),
            by_path,
        }
    }

    /// The standard command set
    pub fn standard() -> Self {
        Self::new(table::COMMANDS)
    }

    pub fn get(&self, path: &str) -> Option<&CommandSpec> {
        self.by_path.get(path).map(|&i| &self.specs[i])
    }

    pub fn specs(&self) -> &[CommandSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// One line per command: `path signature  description`
    pub fn api_lines(&self) -> Vec<String> {
        let mut specs: Vec<&CommandSpec> = self.specs.iter().collect();
        specs.sort_by_key(|s| s.path);
        specs
            .into_iter()
            .map(|s| format!("{} {}  {}", s.path, s.wire_signature(), s.description))
            .collect()
    }
}

/// Whether `args` fit `signature`; an int is accepted where a float is expected
pub fn signature_matches(signature: &str, args: &[Arg]) -> bool {
    if signature == ANY_ARGS {
        return true;
    }
    signature.len() == args.len()
        && signature.chars().zip(args).all(|(want, arg)| {
            let got = arg.type_tag();
            want == got || (want == 'f' && got == 'i')
        })
}

/// Where a GET reply goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub address: NetAddress,
    pub id: i32,
}

impl ReplyTarget {
    /// Interpret a reply token sent by `source`
    pub fn parse(token: &Arg, source: &NetAddress) -> CommandResult<Self> {
        match token {
            Arg::Int(id) => Ok(Self {
                address: source.clone(),
                id: *id,
            }),
            Arg::Str(text) => {
                let bad = || CommandError::BadReplyId(text.clone());
                match text.rsplit_once('/') {
                    Some((addr, id)) => Ok(Self {
                        address: NetAddress::parse_with_host(addr, &source.host)
                            .map_err(|_| bad())?,
                        id: id.trim().parse().map_err(|_| bad())?,
                    }),
                    None => Ok(Self {
                        address: source.clone(),
                        id: text.trim().parse().map_err(|_| bad())?,
                    }),
                }
            }
            other => Err(CommandError::BadReplyId(other.to_string())),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn guarded<T>(f: impl FnOnce() -> CommandResult<T>) -> CommandResult<T> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(CommandError::HandlerPanicked(panic_message(payload.as_ref()))))
}

/// Receives network commands and runs them
pub struct CommandServer {
    ctx: Arc<EngineContext>,
    table: CommandTable,
}

impl CommandServer {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self::with_table(ctx, CommandTable::standard())
    }

    /// A server answering only the commands of `table`
    pub fn with_table(ctx: Arc<EngineContext>, table: CommandTable) -> Self {
        tracing::debug!("{} commands registered", table.len());
        Self { ctx, table }
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Wait up to `timeout` for one command and run it
    ///
    /// Returns whether a command was received.
    pub fn poll(&self, timeout: Duration) -> Result<bool> {
        match self.ctx.telemetry.transport().recv_timeout(timeout)? {
            Some(incoming) => {
                let _ = self.handle(&incoming);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Serve commands until the engine stops
    pub fn serve(self) {
        tracing::info!("Command server started");
        while self.ctx.is_running() {
            if let Err(e) = self.poll(SERVE_TIMEOUT) {
                tracing::warn!("Network receive failed: {}", e);
                std::thread::sleep(SERVE_TIMEOUT);
            }
        }
        tracing::info!("Command server stopped");
    }

    /// Run one command, reporting any failure to its sender
    pub fn handle(&self, incoming: &Incoming) -> CommandResult {
        let path = incoming.message.path.as_str();
        if self.ctx.echo() {
            tracing::info!("{} {:?} from {}", path, incoming.message.args, incoming.source);
        } else {
            tracing::debug!("{} {:?} from {}", path, incoming.message.args, incoming.source);
        }

        let result = self.dispatch(incoming);
        match &result {
            Ok(()) => {}
            Err(CommandError::BadReplyId(token)) => {
                tracing::error!("{}: could not parse reply id '{}', not answering", path, token);
            }
            Err(e) => {
                self.ctx
                    .telemetry
                    .error(&incoming.source, path, &e.to_string());
            }
        }
        result
    }

    fn dispatch(&self, incoming: &Incoming) -> CommandResult {
        let path = incoming.message.path.as_str();
        let spec = self
            .table
            .get(path)
            .ok_or_else(|| CommandError::UnknownCommand(path.to_string()))?;
        let all_args = incoming.message.args.as_slice();

        let (target, args) = match spec.kind() {
            CommandKind::Get => {
                let (token, rest) = all_args
                    .split_first()
                    .ok_or_else(|| CommandError::BadReplyId(String::new()))?;
                (Some(ReplyTarget::parse(token, &incoming.source)?), rest)
            }
            _ => (None, all_args),
        };

        if !signature_matches(spec.signature, args) {
            return Err(CommandError::BadArguments {
                path: path.to_string(),
                expected: spec.signature.to_string(),
                got: signature_of(args),
            });
        }

        let request = Request {
            ctx: &self.ctx,
            table: &self.table,
            path,
            args,
            source: &incoming.source,
        };

        match (spec.handler, target) {
            (Handler::Ordinary(f), _) | (Handler::Meta(f), _) => guarded(|| f(&request)),
            (Handler::Get(f), Some(target)) => match guarded(|| f(&request))? {
                GetOutcome::Value(values) => {
                    self.ctx
                        .telemetry
                        .reply(&target.address, spec.method(), target.id, values);
                    Ok(())
                }
                GetOutcome::Forward(forward) => self.forward(spec, target, forward),
            },
            (Handler::Get(_), None) => Err(CommandError::BadReplyId(String::new())),
        }
    }

    /// Send a GET to the device and park the reply route
    fn forward(&self, spec: &CommandSpec, target: ReplyTarget, forward: ForwardReply) -> CommandResult {
        let route = ReplyRoute {
            method: spec.method().to_string(),
            path: spec.path.to_string(),
            address: target.address,
            caller_id: target.id,
        };
        let id = self.ctx.replies.register(route, forward.postprocess)?;

        let mut params = Vec::with_capacity(forward.args.len() + 2);
        params.push(forward.param.code() as i32);
        params.push(id as i32);
        params.extend(forward.args);

        let sent = codec::encode_command(Opcode::Get, &params)
            .and_then(|bytes| self.ctx.send_to_device(bytes));
        if let Err(e) = sent {
            self.ctx.replies.cancel(id);
            return Err(e);
        }
        tracing::debug!("{} forwarded to device as request {}", spec.path, id);
        Ok(())
    }
}
