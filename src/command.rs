//! Outbound command description.
//!
//! A [`Command`] is built by a request handler, queued on exactly one channel,
//! dequeued once and consumed by at most one response cycle. It owns its
//! context payload; the payload moves into the parse callback, which may turn
//! it into the result data.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{ChannelId, InitPhase};
use crate::error::{ExtendedError, ResultCode};
use crate::request::Request;

/// Opaque correlation token supplied by the host.
pub type Token = u64;

/// Context handed over with a command.
pub type Payload = Box<dyn Any + Send>;

/// Result data delivered to the host. Shared so coalesced requests can
/// receive the same answer.
pub type ResultData = Arc<dyn Any + Send + Sync>;

/// Input handed to a parse callback.
pub struct ParseInput<'a> {
    pub channel: ChannelId,
    pub request: Request,
    /// Raw response text, including the final result line.
    pub response: &'a str,
    /// Result as classified from the final result line.
    pub result: ResultCode,
    pub error: Option<ExtendedError>,
    pub context: Option<Payload>,
}

/// What a parse callback produces.
#[derive(Default)]
pub struct Parsed {
    pub result: ResultCode,
    pub data: Option<ResultData>,
}

impl Parsed {
    pub fn ok(data: impl Any + Send + Sync) -> Self {
        Self {
            result: ResultCode::Success,
            data: Some(Arc::new(data)),
        }
    }

    pub fn failed(result: ResultCode) -> Self {
        Self { result, data: None }
    }
}

pub type ParseFn = Box<dyn FnOnce(ParseInput<'_>) -> Parsed + Send>;

/// Position of an init command within its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitStep {
    pub phase: InitPhase,
    pub is_final: bool,
}

pub struct Command {
    pub(crate) channel: Option<ChannelId>,
    pub(crate) token: Option<Token>,
    pub(crate) request: Request,
    pub(crate) cmd1: Option<String>,
    pub(crate) cmd2: Option<String>,
    pub(crate) parse: Option<ParseFn>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) high_priority: bool,
    pub(crate) always_parse: bool,
    pub(crate) init: Option<InitStep>,
    pub(crate) context: Option<Payload>,
    pub(crate) created: Instant,
}

impl Command {
    pub fn new(request: Request, cmd1: impl Into<String>) -> Self {
        Self {
            channel: None,
            token: None,
            request,
            cmd1: Some(cmd1.into()),
            cmd2: None,
            parse: None,
            timeout: None,
            high_priority: false,
            always_parse: false,
            init: None,
            context: None,
            created: Instant::now(),
        }
    }

    /// A command with no AT string. It runs the hook pipeline and
    /// completes as success without touching the modem.
    pub fn noop(request: Request) -> Self {
        let mut cmd = Self::new(request, String::new());
        cmd.cmd1 = None;
        cmd
    }

    pub(crate) fn init_string(cmd: String, step: InitStep, timeout: Duration) -> Self {
        let mut c = Self::new(Request::Internal, cmd);
        c.init = Some(step);
        c.high_priority = true;
        c.timeout = Some(timeout);
        c
    }

    pub fn token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Pin the command to a specific channel instead of the request's default route.
    pub fn on_channel(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Second AT string, sent only when the first one succeeded.
    pub fn then(mut self, cmd2: impl Into<String>) -> Self {
        self.cmd2 = Some(cmd2.into());
        self
    }

    pub fn parse_with<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ParseInput<'_>) -> Parsed + Send + 'static,
    {
        self.parse = Some(Box::new(f));
        self
    }

    /// Override the channel's default timeout for this command.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    /// Run the parse callback even when the modem reported failure.
    pub fn always_parse(mut self) -> Self {
        self.always_parse = true;
        self
    }

    pub fn context(mut self, payload: impl Any + Send) -> Self {
        self.context = Some(Box::new(payload));
        self
    }

    pub fn request(&self) -> Request {
        self.request
    }

    pub fn token_value(&self) -> Option<Token> {
        self.token
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn is_init(&self) -> bool {
        self.init.is_some()
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    pub fn is_noop(&self) -> bool {
        self.cmd1.as_deref().map_or(true, str::is_empty)
    }

    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cmd1(&self) -> Option<&str> {
        self.cmd1.as_deref()
    }

    pub fn cmd2(&self) -> Option<&str> {
        self.cmd2.as_deref()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("channel", &self.channel)
            .field("token", &self.token)
            .field("request", &self.request)
            .field("cmd1", &self.cmd1.as_deref().map(crate::logutil::escape_log))
            .field("cmd2", &self.cmd2.as_deref().map(crate::logutil::escape_log))
            .field("timeout", &self.timeout)
            .field("high_priority", &self.high_priority)
            .field("always_parse", &self.always_parse)
            .field("init", &self.init)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

/// One delivery on the result egress.
#[derive(Clone)]
pub struct Completion {
    pub token: Token,
    pub request: Request,
    pub channel: ChannelId,
    pub result: ResultCode,
    pub error: Option<ExtendedError>,
    pub data: Option<ResultData>,
}

impl Completion {
    /// Downcast the result data.
    pub fn data_as<T: Any>(&self) -> Option<&T> {
        self.data.as_ref().and_then(|d| d.downcast_ref::<T>())
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("token", &self.token)
            .field("request", &self.request)
            .field("channel", &self.channel)
            .field("result", &self.result)
            .field("error", &self.error)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_flags() {
        let cmd = Command::new(Request::GetSimStatus, "AT+CPIN?\r")
            .token(7)
            .timeout(Duration::from_secs(5))
            .high_priority()
            .always_parse()
            .context(42u32);
        assert_eq!(cmd.token_value(), Some(7));
        assert!(cmd.is_high_priority());
        assert!(cmd.always_parse);
        assert!(!cmd.is_noop());
        assert_eq!(cmd.timeout_value(), Some(Duration::from_secs(5)));
        let ctx = cmd.context.unwrap();
        assert_eq!(ctx.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn noop_has_no_at_string() {
        let cmd = Command::noop(Request::ScreenState).token(1);
        assert!(cmd.is_noop());
        assert!(cmd.cmd1().is_none());
        assert!(cmd.timeout_value().is_none());
    }

    #[test]
    fn completion_downcasts_data() {
        let c = Completion {
            token: 1,
            request: Request::GetImei,
            channel: ChannelId(0),
            result: ResultCode::Success,
            error: None,
            data: Some(Arc::new(String::from("35693803564380"))),
        };
        assert_eq!(c.data_as::<String>().map(String::as_str), Some("35693803564380"));
        assert!(c.data_as::<u32>().is_none());
    }
}
