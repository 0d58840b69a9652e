//! Domain response interpreters ("silos") and the per-channel dispatch chain.
//!
//! A channel hosts an ordered list of silos. Every command passes through
//! each silo's hooks in order; a hook returning `false` ends that stage for
//! the remaining silos. Unsolicited notifications are recognised through
//! the prefix tables, and the first silo whose table claims the bytes wins.
//!
//! Modem-family differences are composed in [`factory::build`]: each silo
//! holds its [`ModemFamily`] and only the differing commands branch on it.

pub mod data;
pub mod factory;
pub mod misc;
pub mod network;
pub mod phonebook;
pub mod sim;
pub mod sms;
pub mod voice;

use std::fmt;
use std::sync::Arc;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::command::Command;
use crate::data::DataChannelRegistry;
use crate::host::{Host, Notification};
use crate::response::{scan, Response, UrcMatch, UrcMatcher};

pub use factory::ModemFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Sim,
    Voice,
    Sms,
    Data,
    Network,
    Phonebook,
    Misc,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Domain::Sim => "sim",
            Domain::Voice => "voice",
            Domain::Sms => "sms",
            Domain::Data => "data",
            Domain::Network => "network",
            Domain::Phonebook => "phonebook",
            Domain::Misc => "misc",
        };
        f.write_str(s)
    }
}

/// How far an unsolicited notification extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrcShape {
    /// Ends with the first CRLF.
    Line,
    /// A header line followed by one payload line (PDU notifications).
    TwoLines,
    /// Runs until a trailing `\r\nOK\r\n`.
    UntilOk,
}

#[derive(Debug, Clone, Copy)]
pub struct UrcPattern {
    pub prefix: &'static str,
    pub shape: UrcShape,
}

impl UrcPattern {
    pub const fn line(prefix: &'static str) -> Self {
        Self {
            prefix,
            shape: UrcShape::Line,
        }
    }

    pub const fn two_lines(prefix: &'static str) -> Self {
        Self {
            prefix,
            shape: UrcShape::TwoLines,
        }
    }

    pub const fn until_ok(prefix: &'static str) -> Self {
        Self {
            prefix,
            shape: UrcShape::UntilOk,
        }
    }

    /// End offset of the notification at the start of `buf`, once all of it arrived.
    fn extent(&self, buf: &[u8]) -> Option<usize> {
        if !buf.starts_with(self.prefix.as_bytes()) {
            return None;
        }
        match self.shape {
            UrcShape::Line => scan::line_end(buf),
            UrcShape::TwoLines => {
                let first = scan::line_end(buf)?;
                scan::line_end(&buf[first..]).map(|n| first + n)
            }
            UrcShape::UntilOk => scan::find_and_skip(buf, b"\r\nOK\r\n"),
        }
    }

    /// Notification text after the prefix, trimmed.
    pub fn body<'a>(&self, text: &'a str) -> &'a str {
        let t = scan::trim_line(text);
        scan::trim_line(t.strip_prefix(self.prefix).unwrap_or(t))
    }
}

/// Shared collaborators handed to every silo.
#[derive(Clone)]
pub struct SiloDeps {
    pub host: Arc<dyn Host>,
    pub registry: Option<Arc<DataChannelRegistry>>,
}

/// Capability set of one domain interpreter. Every hook defaults to
/// "nothing to do, continue".
pub trait Silo: Send + Sync {
    fn domain(&self) -> Domain;

    fn unsolicited_table(&self) -> &'static [UrcPattern] {
        &[]
    }

    /// Second look at a prefix match; `false` leaves the bytes to the
    /// solicited classifier (query results that share a URC prefix).
    fn accepts(&self, _entry: usize, _line: &str) -> bool {
        true
    }

    /// May rewrite the command. Returning `false` completes the command
    /// with `rsp`'s result without writing anything.
    fn pre_send(&self, _cmd: &mut Command, _rsp: &mut Response) -> bool {
        true
    }

    fn post_send(&self, _cmd: &Command, _rsp: &Response) -> bool {
        true
    }

    fn pre_parse(&self, _cmd: &Command, _rsp: &mut Response) -> bool {
        true
    }

    fn post_parse(&self, _cmd: &Command, _rsp: &mut Response) -> bool {
        true
    }

    /// Interpret a claimed notification. `text` is the raw notification
    /// with its leading CRLF removed.
    fn parse_unsolicited(&self, _entry: usize, _channel: ChannelId, _text: &str) -> Option<Notification> {
        None
    }
}

/// The ordered silos of one channel.
pub struct SiloChain {
    silos: Vec<Box<dyn Silo>>,
}

impl SiloChain {
    pub fn new(silos: Vec<Box<dyn Silo>>) -> Self {
        Self { silos }
    }

    pub fn empty() -> Self {
        Self { silos: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.silos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.silos.is_empty()
    }

    pub fn domains(&self) -> Vec<Domain> {
        self.silos.iter().map(|s| s.domain()).collect()
    }

    pub fn pre_send(&self, cmd: &mut Command, rsp: &mut Response) -> bool {
        self.silos.iter().all(|s| s.pre_send(cmd, rsp))
    }

    pub fn post_send(&self, cmd: &Command, rsp: &Response) -> bool {
        self.silos.iter().all(|s| s.post_send(cmd, rsp))
    }

    pub fn pre_parse(&self, cmd: &Command, rsp: &mut Response) -> bool {
        self.silos.iter().all(|s| s.pre_parse(cmd, rsp))
    }

    pub fn post_parse(&self, cmd: &Command, rsp: &mut Response) -> bool {
        self.silos.iter().all(|s| s.post_parse(cmd, rsp))
    }

    /// Dispatch a classified unsolicited response to the silo that claimed it.
    pub fn parse_unsolicited(&self, rsp: &Response) -> Option<Notification> {
        let m = rsp.urc_match()?;
        let silo = self.silos.get(m.silo)?;
        let raw = rsp.text();
        let text = raw.strip_prefix("\r\n").unwrap_or(raw.as_ref());
        trace!("chnl=[{}] {} silo handles entry {}", rsp.channel(), silo.domain(), m.entry);
        silo.parse_unsolicited(m.entry, rsp.channel(), text)
    }
}

impl UrcMatcher for SiloChain {
    fn match_unsolicited(&self, buf: &[u8]) -> Option<UrcMatch> {
        for (si, silo) in self.silos.iter().enumerate() {
            for (ei, pat) in silo.unsolicited_table().iter().enumerate() {
                if buf.len() < pat.prefix.len() {
                    continue;
                }
                let Some(end) = pat.extent(buf) else {
                    continue;
                };
                let line = String::from_utf8_lossy(&buf[..end]);
                if !silo.accepts(ei, &line) {
                    debug!("{} silo leaves {:?} to the solicited path", silo.domain(), pat.prefix);
                    continue;
                }
                return Some(UrcMatch {
                    silo: si,
                    entry: ei,
                    end,
                });
            }
        }
        None
    }
}

impl fmt::Debug for SiloChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.silos.iter().map(|s| s.domain())).finish()
    }
}
