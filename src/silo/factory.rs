//! Composition of (domain, modem family) into silo instances.

use std::fmt;
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};

use super::data::DataSilo;
use super::misc::MiscSilo;
use super::network::NetworkSilo;
use super::phonebook::PhonebookSilo;
use super::sim::SimSilo;
use super::sms::SmsSilo;
use super::voice::VoiceSilo;
use super::{Domain, Silo, SiloChain, SiloDeps};
use crate::channel::ChannelKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ModemFamily {
    #[default]
    Default,
    Inf,
    SierraWireless,
    Xmm,
}

impl ModemFamily {
    /// Family for a configured modem name. Unknown names fall back to
    /// [`ModemFamily::Default`].
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "" | "Default" => ModemFamily::Default,
            "InfineonN721" => ModemFamily::Inf,
            "SierraWireless8790" => ModemFamily::SierraWireless,
            "XMM6260" | "XMM6360" | "XMM7160" => ModemFamily::Xmm,
            other => {
                warn!("unknown modem type {:?}, using default behaviour", other);
                ModemFamily::Default
            }
        }
    }
}

impl FromStr for ModemFamily {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl fmt::Display for ModemFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModemFamily::Default => "default",
            ModemFamily::Inf => "infineon",
            ModemFamily::SierraWireless => "sierra-wireless",
            ModemFamily::Xmm => "xmm",
        };
        f.write_str(s)
    }
}

/// The one place a domain and a family become behaviour.
pub fn build_silo(domain: Domain, family: ModemFamily, deps: &SiloDeps) -> Box<dyn Silo> {
    match domain {
        Domain::Sim => Box::new(SimSilo::new(deps.clone())),
        Domain::Voice => Box::new(VoiceSilo::new(deps.clone())),
        Domain::Sms => Box::new(SmsSilo),
        Domain::Data => Box::new(DataSilo::new(family, deps.clone())),
        Domain::Network => Box::new(NetworkSilo::new(family)),
        Domain::Phonebook => Box::new(PhonebookSilo),
        Domain::Misc => Box::new(MiscSilo),
    }
}

/// Silo chain for a channel of `kind`.
pub fn build(kind: ChannelKind, family: ModemFamily, deps: &SiloDeps) -> SiloChain {
    SiloChain::new(
        kind.domains()
            .iter()
            .map(|d| build_silo(*d, family, deps))
            .collect(),
    )
}
