//! Egress seams: where results, notifications and reset requests leave the engine.

use std::fmt;
use std::sync::Mutex;

use log::{error, info};

use crate::channel::ChannelId;
use crate::command::Completion;
use crate::logutil::escape_log;

/// Typed unsolicited notification produced by a silo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    SimStatusChanged,
    SimLockStatus(String),
    StkProactiveCommand(String),
    StkEventNotify(String),
    StkSessionEnd,
    StkCallControl(String),
    NetworkStateChanged(String),
    PacketDomainEvent(String),
    NitzTime(String),
    CellInfo(String),
    CallStateChanged,
    Ring,
    CallWaiting(String),
    SuppSvcNotification { mobile_terminated: bool, body: String },
    CallMeter(String),
    Ussd(String),
    SignalIndicator(String),
    NewSms { pdu: String },
    NewBroadcastSms { pdu: String },
    SmsStatusReport { pdu: String },
    NewSmsOnSim { index: u32 },
    BroadcastSmsOnSim { index: u32 },
    StatusReportOnSim { index: u32 },
    DataCallListChanged { context_id: Option<u32> },
    PhonebookReady,
    DriverIndication(String),
}

/// Consumer of everything the engine produces.
pub trait Host: Send + Sync {
    /// Called exactly once for every command that carried a token.
    fn on_complete(&self, completion: Completion);

    fn on_unsolicited(&self, _channel: ChannelId, _notification: Notification) {}

    /// Raw payload received on a data channel while it is in data mode.
    fn on_raw_data(&self, _channel: ChannelId, _data: &[u8]) {}
}

/// Host that only logs. Used by the CLI.
#[derive(Debug, Default)]
pub struct LoggingHost;

impl Host for LoggingHost {
    fn on_complete(&self, c: Completion) {
        info!(
            "complete token={} request={:?} chnl=[{}] result={}{}",
            c.token,
            c.request,
            c.channel,
            c.result,
            c.error.map(|e| format!(" ({})", e)).unwrap_or_default()
        );
    }

    fn on_unsolicited(&self, channel: ChannelId, n: Notification) {
        info!("chnl=[{}] unsolicited {}", channel, escape_log(&format!("{:?}", n)));
    }
}

/// Why a modem reset was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetReason {
    PortOpenFailed { path: String },
    InitFailed { channel: ChannelId },
    /// The ping after an abort went unanswered.
    ModemUnresponsive { channel: ChannelId },
    /// Too many consecutive command timeouts.
    ChannelDead { channel: ChannelId },
    /// Read errors or EOF on the port.
    PortFailure { channel: ChannelId },
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::PortOpenFailed { path } => write!(f, "port {} could not be opened", path),
            ResetReason::InitFailed { channel } => write!(f, "chnl=[{}] init failed", channel),
            ResetReason::ModemUnresponsive { channel } => write!(f, "chnl=[{}] modem unresponsive", channel),
            ResetReason::ChannelDead { channel } => write!(f, "chnl=[{}] too many timeouts", channel),
            ResetReason::PortFailure { channel } => write!(f, "chnl=[{}] port failure", channel),
        }
    }
}

/// Receives critical reset requests.
pub trait Supervisor: Send + Sync {
    fn request_reset(&self, reason: ResetReason);
}

/// Supervisor that records requests for inspection.
#[derive(Debug, Default)]
pub struct RecordingSupervisor {
    requests: Mutex<Vec<ResetReason>>,
}

impl RecordingSupervisor {
    pub fn requests(&self) -> Vec<ResetReason> {
        self.requests.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl Supervisor for RecordingSupervisor {
    fn request_reset(&self, reason: ResetReason) {
        error!("reset requested: {}", reason);
        if let Ok(mut g) = self.requests.lock() {
            g.push(reason);
        }
    }
}
