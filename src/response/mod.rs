//! Response accumulation and classification.
//!
//! A [`Response`] collects bytes read from a channel until
//! [`Response::is_complete_response`] recognises a terminal pattern. The
//! classifier records where the recognised response ends
//! (`end_marker`); [`Response::transfer_data`] cuts the buffer there so any
//! bytes that already belong to the next response survive into a fresh
//! accumulator.
//!
//! Patterns are tested in a fixed order:
//!
//! 1. an unsolicited notification claimed by a hosted silo (buffer start only)
//! 2. `+CME ERROR: <n>` / `+CMS ERROR: <n>`
//! 3. `\r\nOK\r\n`, or the SMS prompt `\r\n> ` at buffer start
//! 4. `\r\nERROR\r\n`
//! 5. `\r\nCONNECT\r\n`
//! 6. `\r\nNO CARRIER\r\n`
//! 7. `\r\nABORTED\r\n`
//! 8. a corrupt fragment, only while the channel flagged the buffer corrupt
//!
//! Classification only reads the buffer, so running it twice on the same
//! bytes yields the same verdict and marker.

pub mod scan;

use std::borrow::Cow;

use bytes::BytesMut;
use log::{debug, warn};

use crate::channel::ChannelId;
use crate::command::ResultData;
use crate::error::{ExtendedError, ProtocolError, ResultCode, VendorError};
use crate::logutil::escape_log;
use scan::{find, find_and_skip, skip_rsp_start, CRLF};

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

const CME_ERROR: &[u8] = b"+CME ERROR: ";
const CMS_ERROR: &[u8] = b"+CMS ERROR: ";
const OK: &[u8] = b"\r\nOK\r\n";
const SMS_PROMPT: &[u8] = b"> ";
const ERROR: &[u8] = b"\r\nERROR\r\n";
const CONNECT: &[u8] = b"\r\nCONNECT\r\n";
const NO_CARRIER: &[u8] = b"\r\nNO CARRIER\r\n";
const ABORTED: &[u8] = b"\r\nABORTED\r\n";

/// Where an unsolicited notification was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrcMatch {
    /// Index of the claiming silo in the channel's chain.
    pub silo: usize,
    /// Index of the matching entry in that silo's prefix table.
    pub entry: usize,
    /// Offset just past the notification, relative to the slice handed to the matcher.
    pub end: usize,
}

/// Recognises unsolicited notifications at the start of a buffer.
pub trait UrcMatcher {
    /// `buf` starts at the notification text (leading CRLF already skipped).
    fn match_unsolicited(&self, buf: &[u8]) -> Option<UrcMatch>;
}

/// Matcher for channels that host no silos.
pub struct NoUrc;

impl UrcMatcher for NoUrc {
    fn match_unsolicited(&self, _buf: &[u8]) -> Option<UrcMatch> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unsolicited(UrcMatch),
    ExtendedError(ExtendedError),
    Ok,
    SmsPrompt,
    Error,
    Connect,
    NoCarrier,
    Aborted,
    /// Recognised but not understood; the bytes up to the marker are dropped.
    Unrecognized,
    /// Synthesised for a command whose response never arrived.
    TimedOut,
}

pub struct Response {
    channel: ChannelId,
    buf: BytesMut,
    capacity: usize,
    corrupt: bool,
    verdict: Option<Verdict>,
    result: ResultCode,
    error: Option<ExtendedError>,
    end_marker: usize,
    data: Option<ResultData>,
}

impl Response {
    pub fn new(channel: ChannelId, capacity: usize) -> Self {
        Self {
            channel,
            buf: BytesMut::with_capacity(capacity.min(DEFAULT_BUFFER_SIZE)),
            capacity: capacity.max(16),
            corrupt: false,
            verdict: None,
            result: ResultCode::Success,
            error: None,
            end_marker: 0,
            data: None,
        }
    }

    /// Failure response for a command that timed out.
    pub fn timed_out(channel: ChannelId) -> Self {
        let mut r = Self::new(channel, 16);
        r.verdict = Some(Verdict::TimedOut);
        r.result = ResultCode::GenericFailure;
        r
    }

    /// Failure response synthesised without modem output (write error, overflow).
    pub fn failed(channel: ChannelId, result: ResultCode) -> Self {
        let mut r = Self::new(channel, 16);
        r.verdict = Some(Verdict::Unrecognized);
        r.result = result;
        r
    }

    /// Append bytes. Fails when the buffer would exceed its capacity; the
    /// caller appends what fits and handles the overflow.
    pub fn append(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.buf.len() + data.len() > self.capacity {
            return Err(ProtocolError::BufferOverflow {
                capacity: self.capacity,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Free space left in the buffer.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Drop everything accumulated so far.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.reset_classification();
    }

    pub fn set_corrupt(&mut self, corrupt: bool) {
        self.corrupt = corrupt;
    }

    pub fn is_corrupt_flagged(&self) -> bool {
        self.corrupt
    }

    fn reset_classification(&mut self) {
        self.verdict = None;
        self.result = ResultCode::Success;
        self.error = None;
        self.end_marker = 0;
    }

    fn accept(&mut self, verdict: Verdict, end: usize, result: ResultCode) -> bool {
        self.verdict = Some(verdict);
        self.end_marker = end;
        self.result = result;
        true
    }

    /// Test the accumulated bytes against every terminal pattern.
    pub fn is_complete_response(&mut self, urc: &dyn UrcMatcher) -> bool {
        self.reset_classification();
        if self.buf.is_empty() {
            return false;
        }
        self.is_unsolicited_at_start(urc)
            || self.is_extended_error(CME_ERROR, ExtendedError::Cme)
            || self.is_extended_error(CMS_ERROR, ExtendedError::Cms)
            || self.is_ok()
            || self.is_terminal(ERROR, Verdict::Error, ResultCode::GenericFailure)
            || self.is_terminal(CONNECT, Verdict::Connect, ResultCode::Success)
            || self.is_terminal(NO_CARRIER, Verdict::NoCarrier, ResultCode::Success)
            || self.is_terminal(ABORTED, Verdict::Aborted, ResultCode::Success)
            || self.is_corrupt()
    }

    fn is_unsolicited_at_start(&mut self, urc: &dyn UrcMatcher) -> bool {
        let start = skip_rsp_start(&self.buf);
        match urc.match_unsolicited(&self.buf[start..]) {
            Some(m) => {
                let end = start + m.end;
                self.accept(Verdict::Unsolicited(m), end, ResultCode::Success)
            }
            None => false,
        }
    }

    fn is_extended_error(&mut self, token: &[u8], make: fn(u32) -> ExtendedError) -> bool {
        let Some(after) = find_and_skip(&self.buf, token) else {
            return false;
        };
        let rest = &self.buf[after..];
        // Wait for the CR so a partially received number is never read.
        let Some(cr) = find(rest, b"\r") else {
            return false;
        };
        match scan::extract_uint(rest) {
            Some((code, used)) if used == cr => {
                if !rest[cr..].starts_with(CRLF) {
                    return false;
                }
                let err = make(code);
                self.error = Some(err);
                let result = VendorError::from(err).result_code();
                self.accept(Verdict::ExtendedError(err), after + cr + CRLF.len(), result)
            }
            _ => {
                warn!(
                    "chnl=[{}] could not extract error code from {}",
                    self.channel,
                    escape_log(&String::from_utf8_lossy(&self.buf))
                );
                let end = match find_and_skip(rest, CRLF) {
                    Some(n) => after + n,
                    None => self.buf.len(),
                };
                self.accept(Verdict::Unrecognized, end, ResultCode::GenericFailure)
            }
        }
    }

    fn is_ok(&mut self) -> bool {
        if let Some(end) = find_and_skip(&self.buf, OK) {
            return self.accept(Verdict::Ok, end, ResultCode::Success);
        }
        let start = skip_rsp_start(&self.buf);
        if start > 0 && self.buf[start..].starts_with(SMS_PROMPT) {
            return self.accept(Verdict::SmsPrompt, start + SMS_PROMPT.len(), ResultCode::Success);
        }
        false
    }

    fn is_terminal(&mut self, token: &[u8], verdict: Verdict, result: ResultCode) -> bool {
        match find_and_skip(&self.buf, token) {
            Some(end) => self.accept(verdict, end, result),
            None => false,
        }
    }

    fn is_corrupt(&mut self) -> bool {
        if !self.corrupt {
            return false;
        }
        // Everything up to the first CRLF that is followed by another line start.
        match find(&self.buf, b"\r\n\r") {
            Some(p) => {
                debug!("chnl=[{}] filtering corrupt fragment of {} bytes", self.channel, p + 2);
                self.accept(Verdict::Unrecognized, p + CRLF.len(), ResultCode::GenericFailure)
            }
            None => false,
        }
    }

    /// Split off the recognised response. The returned value owns the bytes
    /// up to the end marker and the classification; `self` keeps the
    /// remainder and starts a new cycle.
    pub fn transfer_data(&mut self) -> Option<Response> {
        let verdict = self.verdict?;
        if self.end_marker == 0 || self.end_marker > self.buf.len() {
            return None;
        }
        let head = self.buf.split_to(self.end_marker);
        let out = Response {
            channel: self.channel,
            buf: head,
            capacity: self.capacity,
            corrupt: false,
            verdict: Some(verdict),
            result: self.result,
            error: self.error,
            end_marker: self.end_marker,
            data: None,
        };
        self.reset_classification();
        self.corrupt = false;
        Some(out)
    }

    /// Prepend the text of `earlier` so the two-part exchange of a command
    /// is parsed as one response. Classification of `self` is kept.
    pub fn merge_front(&mut self, earlier: Response) {
        let mut joined = earlier.buf;
        joined.extend_from_slice(&self.buf);
        self.buf = joined;
        self.end_marker = self.buf.len();
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    pub fn is_unsolicited(&self) -> bool {
        matches!(self.verdict, Some(Verdict::Unsolicited(_)))
    }

    pub fn urc_match(&self) -> Option<UrcMatch> {
        match self.verdict {
            Some(Verdict::Unsolicited(m)) => Some(m),
            _ => None,
        }
    }

    pub fn is_unrecognized(&self) -> bool {
        matches!(self.verdict, Some(Verdict::Unrecognized))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self.verdict, Some(Verdict::TimedOut))
    }

    pub fn result(&self) -> ResultCode {
        self.result
    }

    pub fn set_result(&mut self, result: ResultCode) {
        self.result = result;
    }

    pub fn error(&self) -> Option<ExtendedError> {
        self.error
    }

    pub fn end_marker(&self) -> usize {
        self.end_marker
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.buf)
    }

    pub fn data(&self) -> Option<&ResultData> {
        self.data.as_ref()
    }

    pub fn set_data(&mut self, data: Option<ResultData>) {
        self.data = data;
    }

    pub fn take_data(&mut self) -> Option<ResultData> {
        self.data.take()
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("channel", &self.channel)
            .field("verdict", &self.verdict)
            .field("result", &self.result)
            .field("end_marker", &self.end_marker)
            .field("buf", &escape_log(&self.text()))
            .finish()
    }
}
