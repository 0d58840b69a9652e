//! Network registration, time zone and radio access technology selection.
//!
//! Preferred network type is the one command set whose syntax differs per
//! modem family. The host submits [`Request::SetPreferredNetworkType`] with
//! a [`NetworkType`] context and no AT string; this silo writes the family
//! command. [`Request::GetPreferredNetworkType`] answers are mapped back
//! into a [`NetworkType`].

use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{Domain, ModemFamily, Silo, UrcPattern};
use crate::channel::ChannelId;
use crate::command::Command;
use crate::error::ResultCode;
use crate::host::Notification;
use crate::request::Request;
use crate::response::{scan, Response};

static TABLE: [UrcPattern; 9] = [
    UrcPattern::line("+CREG:"),
    UrcPattern::line("+CGREG:"),
    UrcPattern::line("+XREG:"),
    UrcPattern::line("+CGEV:"),
    UrcPattern::line("+CTZV:"),
    UrcPattern::line("+CTZDST:"),
    UrcPattern::line("+XNITZINFO"),
    UrcPattern::line("+PACSP1"),
    UrcPattern::until_ok("+XCGEDPAGE:"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    GsmOnly,
    WcdmaOnly,
    /// GSM and WCDMA, WCDMA preferred.
    GsmWcdma,
    /// LTE preferred, falling back to WCDMA and GSM.
    LteGsmWcdma,
}

impl NetworkType {
    /// AT command selecting this type, or `None` when the family cannot.
    pub fn set_command(self, family: ModemFamily) -> Option<String> {
        use NetworkType::*;
        let args = match (family, self) {
            (ModemFamily::Inf | ModemFamily::Xmm, GsmOnly) => "+XACT=0",
            (ModemFamily::Inf | ModemFamily::Xmm, WcdmaOnly) => "+XACT=1",
            (ModemFamily::Inf | ModemFamily::Xmm, GsmWcdma) => "+XACT=2,1",
            (ModemFamily::Xmm, LteGsmWcdma) => "+XACT=6,2",
            (ModemFamily::Inf, LteGsmWcdma) => return None,
            (ModemFamily::SierraWireless, GsmOnly) => "!SELRAT=02",
            (ModemFamily::SierraWireless, WcdmaOnly) => "!SELRAT=01",
            (ModemFamily::SierraWireless, GsmWcdma) => "!SELRAT=03",
            (ModemFamily::SierraWireless, LteGsmWcdma) => "!SELRAT=00",
            (ModemFamily::Default, GsmOnly) => "+COPS=0,,,0",
            (ModemFamily::Default, WcdmaOnly) => "+COPS=0,,,2",
            (ModemFamily::Default, GsmWcdma) => "+COPS=0,,,2",
            (ModemFamily::Default, LteGsmWcdma) => "+COPS=0,,,7",
        };
        Some(format!("AT{}\r", args))
    }

    /// Query command reporting the current type.
    pub fn query_command(family: ModemFamily) -> &'static str {
        match family {
            ModemFamily::Inf | ModemFamily::Xmm => "AT+XACT?\r",
            ModemFamily::SierraWireless => "AT!SELRAT?\r",
            ModemFamily::Default => "AT+COPS?\r",
        }
    }

    /// Interpret a query response.
    pub fn from_response(family: ModemFamily, text: &str) -> Option<Self> {
        let line = text.lines().map(scan::trim_line).find(|l| l.starts_with('+') || l.starts_with('!'))?;
        let (_, rest) = line.split_once(':')?;
        let fields = scan::split_fields(rest);
        match family {
            ModemFamily::Inf | ModemFamily::Xmm => match fields.first()?.as_str() {
                "0" => Some(NetworkType::GsmOnly),
                "1" => Some(NetworkType::WcdmaOnly),
                "2" => Some(NetworkType::GsmWcdma),
                "6" => Some(NetworkType::LteGsmWcdma),
                _ => None,
            },
            ModemFamily::SierraWireless => match fields.first()?.trim_start_matches('0') {
                "2" => Some(NetworkType::GsmOnly),
                "1" => Some(NetworkType::WcdmaOnly),
                "3" => Some(NetworkType::GsmWcdma),
                "" => Some(NetworkType::LteGsmWcdma),
                _ => None,
            },
            // +COPS: <mode>[,<format>,<oper>,<AcT>]
            ModemFamily::Default => match fields.get(3).map(String::as_str) {
                Some("0") => Some(NetworkType::GsmOnly),
                Some("2") => Some(NetworkType::GsmWcdma),
                Some("7") => Some(NetworkType::LteGsmWcdma),
                _ => None,
            },
        }
    }
}

pub struct NetworkSilo {
    family: ModemFamily,
}

impl NetworkSilo {
    pub fn new(family: ModemFamily) -> Self {
        Self { family }
    }
}

/// `+CREG: <stat>[,"<lac>",...]` is unsolicited; the query form starts
/// with the `<n>` setting, so its second field is unquoted.
fn is_registration_urc(body: &str) -> bool {
    let mut raw = body.split(',');
    let _first = raw.next();
    match raw.next() {
        None => true,
        Some(second) => second.trim_start().starts_with('"'),
    }
}

impl Silo for NetworkSilo {
    fn domain(&self) -> Domain {
        Domain::Network
    }

    fn unsolicited_table(&self) -> &'static [UrcPattern] {
        &TABLE
    }

    fn accepts(&self, entry: usize, line: &str) -> bool {
        let pat = TABLE[entry];
        match pat.prefix {
            "+CREG:" | "+CGREG:" => is_registration_urc(pat.body(line)),
            _ => true,
        }
    }

    fn pre_send(&self, cmd: &mut Command, rsp: &mut Response) -> bool {
        match cmd.request() {
            Request::SetPreferredNetworkType if cmd.is_noop() => {
                let wanted = cmd.context.as_ref().and_then(|c| c.downcast_ref::<NetworkType>()).copied();
                match wanted.and_then(|t| t.set_command(self.family)) {
                    Some(at) => {
                        debug!("{:?} network type command {:?}", self.family, wanted);
                        cmd.cmd1 = Some(at);
                        true
                    }
                    None => {
                        warn!("{:?} cannot select network type {:?}", self.family, wanted);
                        rsp.set_result(ResultCode::RequestNotSupported);
                        false
                    }
                }
            }
            Request::GetPreferredNetworkType if cmd.is_noop() => {
                cmd.cmd1 = Some(NetworkType::query_command(self.family).to_string());
                true
            }
            _ => true,
        }
    }

    fn post_parse(&self, cmd: &Command, rsp: &mut Response) -> bool {
        if cmd.request() == Request::GetPreferredNetworkType && rsp.result().is_success() && rsp.data().is_none() {
            let parsed = NetworkType::from_response(self.family, &rsp.text());
            match parsed {
                Some(t) => rsp.set_data(Some(Arc::new(t))),
                None => rsp.set_result(ResultCode::GenericFailure),
            }
        }
        true
    }

    fn parse_unsolicited(&self, entry: usize, _channel: ChannelId, text: &str) -> Option<Notification> {
        let pat = TABLE[entry];
        let body = pat.body(text).to_string();
        match pat.prefix {
            "+CREG:" | "+CGREG:" | "+XREG:" | "+PACSP1" => Some(Notification::NetworkStateChanged(body)),
            "+CGEV:" => Some(Notification::PacketDomainEvent(body)),
            "+CTZV:" | "+CTZDST:" | "+XNITZINFO" => Some(Notification::NitzTime(body)),
            "+XCGEDPAGE:" => Some(Notification::CellInfo(body)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::UrcMatcher;
    use crate::silo::SiloChain;

    #[test]
    fn registration_query_is_not_claimed() {
        let chain = SiloChain::new(vec![Box::new(NetworkSilo::new(ModemFamily::Default))]);
        assert!(chain.match_unsolicited(b"+CREG: 2,1,\"00C3\",\"0000D2F1\"\r\n").is_none());
        assert!(chain.match_unsolicited(b"+CREG: 2,1\r\n").is_none());
        assert!(chain.match_unsolicited(b"+CREG: 1\r\n").is_some());
        assert!(chain.match_unsolicited(b"+CREG: 1,\"00C3\",\"0000D2F1\",2\r\n").is_some());
        assert!(chain.match_unsolicited(b"+CGEV: NW DETACH\r\n").is_some());
    }

    #[test]
    fn family_picks_command_syntax() {
        assert_eq!(NetworkType::GsmOnly.set_command(ModemFamily::Inf).as_deref(), Some("AT+XACT=0\r"));
        assert_eq!(
            NetworkType::GsmWcdma.set_command(ModemFamily::SierraWireless).as_deref(),
            Some("AT!SELRAT=03\r")
        );
        assert_eq!(NetworkType::LteGsmWcdma.set_command(ModemFamily::Inf), None);
        assert_eq!(
            NetworkType::LteGsmWcdma.set_command(ModemFamily::Default).as_deref(),
            Some("AT+COPS=0,,,7\r")
        );
    }

    #[test]
    fn unsupported_type_is_refused_before_sending() {
        let silo = NetworkSilo::new(ModemFamily::Inf);
        let mut cmd = Command::noop(Request::SetPreferredNetworkType).context(NetworkType::LteGsmWcdma);
        let mut rsp = Response::new(ChannelId(2), 64);
        assert!(!silo.pre_send(&mut cmd, &mut rsp));
        assert_eq!(rsp.result(), ResultCode::RequestNotSupported);

        let mut cmd = Command::noop(Request::SetPreferredNetworkType).context(NetworkType::WcdmaOnly);
        assert!(silo.pre_send(&mut cmd, &mut rsp));
        assert_eq!(cmd.cmd1(), Some("AT+XACT=1\r"));
    }

    #[test]
    fn query_results_map_back() {
        let text = "\r\n+XACT: 2,1\r\n\r\nOK\r\n";
        assert_eq!(NetworkType::from_response(ModemFamily::Xmm, text), Some(NetworkType::GsmWcdma));
        let text = "\r\n!SELRAT: 02, GSM Only\r\n\r\nOK\r\n";
        assert_eq!(
            NetworkType::from_response(ModemFamily::SierraWireless, text),
            Some(NetworkType::GsmOnly)
        );
        let text = "\r\n+COPS: 0,0,\"Operator\",7\r\n\r\nOK\r\n";
        assert_eq!(
            NetworkType::from_response(ModemFamily::Default, text),
            Some(NetworkType::LteGsmWcdma)
        );
    }
}
