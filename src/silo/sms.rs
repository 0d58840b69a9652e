//! SMS delivery, broadcast and status reports.

use super::{Domain, Silo, UrcPattern};
use crate::channel::ChannelId;
use crate::command::Command;
use crate::host::Notification;
use crate::request::Request;
use crate::response::{scan, Response};

const CTRL_Z: char = '\x1a';

static TABLE: [UrcPattern; 6] = [
    UrcPattern::two_lines("+CMT:"),
    UrcPattern::two_lines("+CBM:"),
    UrcPattern::two_lines("+CDS:"),
    UrcPattern::line("+CMTI:"),
    UrcPattern::line("+CBMI:"),
    UrcPattern::line("+CDSI:"),
];

#[derive(Debug, Default)]
pub struct SmsSilo;

/// Storage index from `"<mem>",<index>`.
fn storage_index(body: &str) -> Option<u32> {
    scan::split_fields(body).get(1)?.parse().ok()
}

/// The PDU line of a two-line notification.
fn pdu_line(text: &str) -> String {
    text.split("\r\n").nth(1).map(scan::trim_line).unwrap_or_default().to_string()
}

impl Silo for SmsSilo {
    fn domain(&self) -> Domain {
        Domain::Sms
    }

    fn unsolicited_table(&self) -> &'static [UrcPattern] {
        &TABLE
    }

    fn pre_send(&self, cmd: &mut Command, _rsp: &mut Response) -> bool {
        // The PDU after the prompt is only accepted once terminated by Ctrl-Z.
        if cmd.request() == Request::SendSms {
            if let Some(pdu) = cmd.cmd2.as_mut() {
                if !pdu.ends_with(CTRL_Z) {
                    pdu.push(CTRL_Z);
                }
            }
        }
        true
    }

    fn parse_unsolicited(&self, entry: usize, _channel: ChannelId, text: &str) -> Option<Notification> {
        let pat = TABLE[entry];
        match pat.prefix {
            "+CMT:" => Some(Notification::NewSms { pdu: pdu_line(text) }),
            "+CBM:" => Some(Notification::NewBroadcastSms { pdu: pdu_line(text) }),
            "+CDS:" => Some(Notification::SmsStatusReport { pdu: pdu_line(text) }),
            "+CMTI:" => storage_index(pat.body(text)).map(|index| Notification::NewSmsOnSim { index }),
            "+CBMI:" => storage_index(pat.body(text)).map(|index| Notification::BroadcastSmsOnSim { index }),
            "+CDSI:" => storage_index(pat.body(text)).map(|index| Notification::StatusReportOnSim { index }),
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
    fn pdu_arrives_on_second_line() {
        let chain = SiloChain::new(vec![Box::new(SmsSilo)]);
        let bytes = b"+CMT: ,24\r\n07911326040000F0040B911346610089F60000208062917314080CC8F71D14969741F977FD07\r\n";
        assert!(chain.match_unsolicited(&bytes[..12]).is_none());
        let m = chain.match_unsolicited(bytes).unwrap();
        assert_eq!(m.end, bytes.len());
        let text = std::str::from_utf8(bytes).unwrap();
        assert_eq!(
            SmsSilo.parse_unsolicited(m.entry, ChannelId(7), text),
            Some(Notification::NewSms {
                pdu: "07911326040000F0040B911346610089F60000208062917314080CC8F71D14969741F977FD07".into()
            })
        );
    }

    #[test]
    fn stored_message_index() {
        assert_eq!(
            SmsSilo.parse_unsolicited(3, ChannelId(7), "+CMTI: \"SM\",5\r\n"),
            Some(Notification::NewSmsOnSim { index: 5 })
        );
    }

    #[test]
    fn pdu_gets_terminated() {
        let mut cmd = Command::new(Request::SendSms, "AT+CMGS=23\r").then("0011000B91");
        let mut rsp = Response::new(ChannelId(7), 64);
        assert!(SmsSilo.pre_send(&mut cmd, &mut rsp));
        assert_eq!(cmd.cmd2(), Some("0011000B91\x1a"));
        assert!(SmsSilo.pre_send(&mut cmd, &mut rsp));
        assert_eq!(cmd.cmd2(), Some("0011000B91\x1a"));
    }
}
