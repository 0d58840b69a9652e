//! Voice calls and supplementary services.

use log::debug;

use super::{Domain, Silo, SiloDeps, UrcPattern};
use crate::channel::ChannelId;
use crate::command::Command;
use crate::host::Notification;
use crate::request::Request;
use crate::response::Response;

// RING CTM must precede RING.
static TABLE: [UrcPattern; 19] = [
    UrcPattern::line("+CRING:"),
    UrcPattern::line("DISCONNECT"),
    UrcPattern::line("+XCALLSTAT:"),
    UrcPattern::line("CONNECT"),
    UrcPattern::line("+CCWA:"),
    UrcPattern::line("+CSSU:"),
    UrcPattern::line("+CSSI:"),
    UrcPattern::line("+CCCM:"),
    UrcPattern::line("+CUSD:"),
    UrcPattern::line("+COLP:"),
    UrcPattern::line("+COLR:"),
    UrcPattern::line("+XCIEV:"),
    UrcPattern::line("+XCALLINFO:"),
    UrcPattern::line("RING CTM"),
    UrcPattern::line("RING"),
    UrcPattern::line("BUSY"),
    UrcPattern::line("NO ANSWER"),
    UrcPattern::line("CTM CALL"),
    UrcPattern::line("NO CTM CALL"),
];

pub struct VoiceSilo {
    deps: SiloDeps,
}

impl VoiceSilo {
    pub fn new(deps: SiloDeps) -> Self {
        Self { deps }
    }
}

impl Silo for VoiceSilo {
    fn domain(&self) -> Domain {
        Domain::Voice
    }

    fn unsolicited_table(&self) -> &'static [UrcPattern] {
        &TABLE
    }

    fn accepts(&self, entry: usize, line: &str) -> bool {
        let pat = TABLE[entry];
        match pat.prefix {
            // The +CCWA query answers "<status>,<class>"; the URC leads with the number.
            "+CCWA:" => pat.body(line).starts_with('"'),
            _ => true,
        }
    }

    fn post_parse(&self, cmd: &Command, rsp: &mut Response) -> bool {
        if matches!(cmd.request(), Request::Dial | Request::Hangup | Request::Answer) && rsp.result().is_success() {
            debug!("chnl=[{}] {:?} done, call list changed", rsp.channel(), cmd.request());
            self.deps.host.on_unsolicited(rsp.channel(), Notification::CallStateChanged);
        }
        true
    }

    fn parse_unsolicited(&self, entry: usize, _channel: ChannelId, text: &str) -> Option<Notification> {
        let pat = TABLE[entry];
        let body = pat.body(text).to_string();
        match pat.prefix {
            "+CRING:" | "RING" | "RING CTM" => Some(Notification::Ring),
            "DISCONNECT" | "+XCALLSTAT:" | "CONNECT" | "+XCALLINFO:" | "BUSY" | "NO ANSWER" | "CTM CALL"
            | "NO CTM CALL" => Some(Notification::CallStateChanged),
            "+CCWA:" => Some(Notification::CallWaiting(body)),
            "+CSSU:" => Some(Notification::SuppSvcNotification {
                mobile_terminated: true,
                body,
            }),
            "+CSSI:" => Some(Notification::SuppSvcNotification {
                mobile_terminated: false,
                body,
            }),
            "+COLP:" | "+COLR:" => Some(Notification::SuppSvcNotification {
                mobile_terminated: false,
                body,
            }),
            "+CCCM:" => Some(Notification::CallMeter(body)),
            "+CUSD:" => Some(Notification::Ussd(body)),
            "+XCIEV:" => Some(Notification::SignalIndicator(body)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LoggingHost;
    use crate::response::UrcMatcher;
    use crate::silo::SiloChain;
    use std::sync::Arc;

    fn chain() -> SiloChain {
        SiloChain::new(vec![Box::new(VoiceSilo::new(SiloDeps {
            host: Arc::new(LoggingHost),
            registry: None,
        }))])
    }

    #[test]
    fn ring_ctm_wins_over_ring() {
        let m = chain().match_unsolicited(b"RING CTM\r\n").unwrap();
        assert_eq!(TABLE[m.entry].prefix, "RING CTM");
        let m = chain().match_unsolicited(b"RING\r\n").unwrap();
        assert_eq!(TABLE[m.entry].prefix, "RING");
    }

    #[test]
    fn call_waiting_query_is_solicited() {
        assert!(chain().match_unsolicited(b"+CCWA: 1,1\r\n").is_none());
        let m = chain().match_unsolicited(b"+CCWA: \"+4912345\",145,1\r\n").unwrap();
        let silo = VoiceSilo::new(SiloDeps {
            host: Arc::new(LoggingHost),
            registry: None,
        });
        assert_eq!(
            silo.parse_unsolicited(m.entry, ChannelId(0), "+CCWA: \"+4912345\",145,1\r\n"),
            Some(Notification::CallWaiting("\"+4912345\",145,1".into()))
        );
    }
}
