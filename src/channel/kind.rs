//! Channel identity and the static per-kind defaults (init strings, hosted silos).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::silo::Domain;

/// Index of a channel in the configured channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// General purpose control channel.
    Atcmd,
    /// Network registration and PDP management.
    Dlc2,
    /// Voice, SMS and supplementary services.
    Dlc6,
    /// SIM, identity and operator queries.
    Dlc8,
    Sim,
    /// Diagnostics / OEM hook traffic.
    Oem,
    /// Unsolicited notification channel.
    Urc,
    Data,
}

/// Init phases, sent in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitPhase {
    Basic,
    Unlock,
    PowerOn,
    Ready,
}

impl InitPhase {
    pub const ALL: [InitPhase; 4] = [InitPhase::Basic, InitPhase::Unlock, InitPhase::PowerOn, InitPhase::Ready];
}

impl fmt::Display for InitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InitPhase::Basic => "basic",
            InitPhase::Unlock => "unlock",
            InitPhase::PowerOn => "power-on",
            InitPhase::Ready => "ready",
        };
        f.write_str(s)
    }
}

impl ChannelKind {
    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Atcmd => "atcmd",
            ChannelKind::Dlc2 => "dlc2",
            ChannelKind::Dlc6 => "dlc6",
            ChannelKind::Dlc8 => "dlc8",
            ChannelKind::Sim => "sim",
            ChannelKind::Oem => "oem",
            ChannelKind::Urc => "urc",
            ChannelKind::Data => "data",
        }
    }

    pub fn is_data(self) -> bool {
        self == ChannelKind::Data
    }

    /// Built-in init strings, pipe-delimited, without the `AT` prefix.
    pub fn default_init(self, phase: InitPhase) -> &'static str {
        use ChannelKind::*;
        use InitPhase::*;
        match (self, phase) {
            (Atcmd, Basic) => "E0V1Q0X4|S0=0|+CMEE=1",
            (Atcmd, Unlock) => "+CRC=1|+CR=1|+CSSN=1,1",
            (Atcmd, Ready) => "+CMGF=0|+CCWA=1|+CTZU=1|+CTZR=1|+CREG=2|+CGREG=2",
            (Dlc2, Basic) => "E0V1Q0X4|S0=0|+CMEE=1",
            (Dlc6, Basic) => "E0V1Q0X4|+CMEE=1|S0=0|+CMGF=0",
            (Dlc6, Unlock) => "+CSMS=1|+CGSMS=3",
            (Dlc8, Basic) => "E0V1Q0X4|+CMEE=1|S0=0",
            (Sim, Basic) => "E0V1Q0X4|+CMEE=1",
            (Sim, PowerOn) => "+CSCS=\"UCS2\"",
            (Oem, Basic) => "E0V1Q0X4|+CMEE=1|S0=0",
            (Urc, Basic) => "E0V1Q0X4|S0=0|+CMEE=1|+XSIMSTATE=1|+XCALLSTAT=1|+CTZU=1|+CTZR=1|+XREG=1|+CGEREP=1,0|+CSSN=1,1|+CMGF=0",
            (Urc, Unlock) => "+CNMI=2,2,2,1|+CRC=1|+CCWA=1|+CUSD=1",
            (Data, Basic) => "E0V1Q0X4|+CMEE=1",
            _ => "",
        }
    }

    /// Silo domains hosted by this kind of channel, in dispatch order.
    pub fn domains(self) -> &'static [Domain] {
        use Domain::*;
        match self {
            ChannelKind::Atcmd => &[Voice, Network, Sms, Sim, Phonebook, Data],
            ChannelKind::Dlc2 | ChannelKind::Dlc6 | ChannelKind::Dlc8 => &[Voice, Network, Sms, Sim, Phonebook],
            ChannelKind::Urc => &[Voice, Network, Sms, Sim, Phonebook, Misc],
            ChannelKind::Sim => &[Sim, Phonebook],
            ChannelKind::Oem => &[Voice, Phonebook, Misc],
            ChannelKind::Data => &[Data],
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Split a pipe-delimited init string into its AT commands.
pub fn split_init_string(s: &str) -> Vec<String> {
    s.split('|')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| format!("AT{}\r", c))
        .collect()
}
