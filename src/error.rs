//! Error taxonomy for the engine.
//!
//! Four families surface from the core: transport ([`PortError`]), protocol
//! ([`ProtocolError`]), vendor/semantic ([`VendorError`], mapped from CME/CMS
//! numeric codes) and resource exhaustion ([`AllocError`]). [`RilError`] folds
//! them together for callers that only need `?`.

use std::fmt;
use std::io;
use thiserror::Error;

/// Failures on the physical link.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("failed to open {path} after {attempts} attempts: {source}")]
    Open {
        path: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("socket handshake on {path} failed: {reason}")]
    Handshake { path: String, reason: String },
    #[error("write abandoned after {attempts} EAGAIN retries")]
    WriteExhausted { attempts: u32 },
    #[error("port closed by peer")]
    Closed,
    #[error("wait cancelled by shutdown")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[cfg(feature = "serial")]
    #[error("serial configuration failed: {0}")]
    Serial(#[from] serialport::Error),
}

/// Outcomes of a blocking queue operation that did not yield a command.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue operation timed out")]
    TimedOut,
    #[error("queue operation cancelled")]
    Cancelled,
    #[error("queue is empty")]
    Empty,
    #[error("head of queue did not satisfy predicate")]
    NotSatisfied,
}

/// Malformed or unterminated modem output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("response buffer full ({capacity} bytes) without a terminator")]
    BufferOverflow { capacity: usize },
    #[error("unparseable response: {0}")]
    Unparseable(String),
    #[error("corrupt fragment discarded ({discarded} bytes)")]
    Corrupt { discarded: usize },
}

/// Numeric extended error reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtendedError {
    /// `+CME ERROR: <n>` (mobile equipment)
    Cme(u32),
    /// `+CMS ERROR: <n>` (message service)
    Cms(u32),
}

impl ExtendedError {
    pub fn code(&self) -> u32 {
        match self {
            ExtendedError::Cme(c) | ExtendedError::Cms(c) => *c,
        }
    }
}

impl fmt::Display for ExtendedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtendedError::Cme(c) => write!(f, "CME {}", c),
            ExtendedError::Cms(c) => write!(f, "CMS {}", c),
        }
    }
}

/// Stable semantic taxonomy for CME/CMS codes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VendorError {
    #[error("incorrect password")]
    IncorrectPassword,
    #[error("SIM PIN required")]
    PinRequired,
    #[error("SIM PUK required")]
    PukRequired,
    #[error("SIM absent")]
    SimAbsent,
    #[error("modem not ready")]
    NotReady,
    #[error("operation not supported")]
    Unsupported,
    #[error("generic failure")]
    Generic,
}

impl From<ExtendedError> for VendorError {
    fn from(err: ExtendedError) -> Self {
        match err {
            ExtendedError::Cme(code) => match code {
                16 => VendorError::IncorrectPassword,
                11 | 17 => VendorError::PinRequired,
                12 | 18 => VendorError::PukRequired,
                10 | 13 | 15 => VendorError::SimAbsent,
                14 => VendorError::NotReady,
                4 => VendorError::Unsupported,
                _ => VendorError::Generic,
            },
            ExtendedError::Cms(code) => match code {
                311 | 312 | 317 => VendorError::PinRequired,
                316 | 318 => VendorError::PukRequired,
                310 | 313 => VendorError::SimAbsent,
                314 | 515 => VendorError::NotReady,
                303 => VendorError::Unsupported,
                _ => VendorError::Generic,
            },
        }
    }
}

impl VendorError {
    pub fn result_code(self) -> ResultCode {
        match self {
            VendorError::IncorrectPassword => ResultCode::PasswordIncorrect,
            VendorError::PinRequired => ResultCode::SimPinRequired,
            VendorError::PukRequired => ResultCode::SimPukRequired,
            VendorError::SimAbsent => ResultCode::SimAbsent,
            VendorError::NotReady => ResultCode::RadioNotAvailable,
            VendorError::Unsupported => ResultCode::RequestNotSupported,
            VendorError::Generic => ResultCode::GenericFailure,
        }
    }
}

/// Result code delivered to the host for each completed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultCode {
    #[default]
    Success,
    GenericFailure,
    RadioNotAvailable,
    PasswordIncorrect,
    SimPinRequired,
    SimPukRequired,
    SimAbsent,
    RequestNotSupported,
    Cancelled,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Success => "SUCCESS",
            ResultCode::GenericFailure => "GENERIC_FAILURE",
            ResultCode::RadioNotAvailable => "RADIO_NOT_AVAILABLE",
            ResultCode::PasswordIncorrect => "PASSWORD_INCORRECT",
            ResultCode::SimPinRequired => "SIM_PIN_REQUIRED",
            ResultCode::SimPukRequired => "SIM_PUK_REQUIRED",
            ResultCode::SimAbsent => "SIM_ABSENT",
            ResultCode::RequestNotSupported => "REQUEST_NOT_SUPPORTED",
            ResultCode::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Resource exhaustion on channel/context allocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("no free data channel")]
    NoFreeChannel,
    #[error("no free HSI sub-channel in {min}..{max}")]
    NoFreeSubChannel { min: u32, max: u32 },
    #[error("context id {0} is not allocated")]
    UnknownContext(u32),
}

/// Umbrella error for engine operations.
#[derive(Debug, Error)]
pub enum RilError {
    #[error("transport: {0}")]
    Transport(#[from] PortError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("vendor: {0}")]
    Vendor(#[from] VendorError),
    #[error("resource: {0}")]
    Resource(#[from] AllocError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
    #[error("no channel hosts {0}")]
    NoChannel(String),
    #[error("channel {channel} failed init phase {phase}")]
    InitFailed { channel: String, phase: String },
    #[error("network interface {iface}: {source}")]
    NetIf {
        iface: String,
        #[source]
        source: io::Error,
    },
    #[error("configuration: {0}")]
    Config(String),
}

pub type RilResult<T> = Result<T, RilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cme_codes_map_to_taxonomy() {
        assert_eq!(VendorError::from(ExtendedError::Cme(16)), VendorError::IncorrectPassword);
        assert_eq!(VendorError::from(ExtendedError::Cme(11)), VendorError::PinRequired);
        assert_eq!(VendorError::from(ExtendedError::Cme(12)), VendorError::PukRequired);
        assert_eq!(VendorError::from(ExtendedError::Cme(10)), VendorError::SimAbsent);
        assert_eq!(VendorError::from(ExtendedError::Cme(14)), VendorError::NotReady);
        assert_eq!(VendorError::from(ExtendedError::Cme(4)), VendorError::Unsupported);
        assert_eq!(VendorError::from(ExtendedError::Cme(100)), VendorError::Generic);
    }

    #[test]
    fn cms_codes_map_to_taxonomy() {
        assert_eq!(VendorError::from(ExtendedError::Cms(310)), VendorError::SimAbsent);
        assert_eq!(VendorError::from(ExtendedError::Cms(311)), VendorError::PinRequired);
        assert_eq!(VendorError::from(ExtendedError::Cms(316)), VendorError::PukRequired);
        assert_eq!(VendorError::from(ExtendedError::Cms(515)), VendorError::NotReady);
        assert_eq!(VendorError::from(ExtendedError::Cms(500)), VendorError::Generic);
        // 16 is only meaningful in the CME space
        assert_eq!(VendorError::from(ExtendedError::Cms(16)), VendorError::Generic);
    }

    #[test]
    fn vendor_errors_never_map_to_success() {
        for v in [
            VendorError::IncorrectPassword,
            VendorError::PinRequired,
            VendorError::PukRequired,
            VendorError::SimAbsent,
            VendorError::NotReady,
            VendorError::Unsupported,
            VendorError::Generic,
        ] {
            assert!(!v.result_code().is_success(), "{:?} mapped to success", v);
        }
    }
}
