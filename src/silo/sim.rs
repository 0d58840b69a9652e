//! SIM and SIM toolkit.

use log::{debug, info};

use super::{Domain, Silo, SiloDeps, UrcPattern};
use crate::channel::ChannelId;
use crate::command::Command;
use crate::error::{ResultCode, VendorError};
use crate::host::Notification;
use crate::request::Request;
use crate::response::Response;

static TABLE: [UrcPattern; 9] = [
    UrcPattern::line("+STKCTRLIND:"),
    UrcPattern::line("+STKCC:"),
    UrcPattern::line("+STKPRO:"),
    UrcPattern::line("+STKCNF:"),
    UrcPattern::line("+SATI:"),
    UrcPattern::line("+SATN:"),
    UrcPattern::line("+SATF:"),
    UrcPattern::line("+XLOCK:"),
    UrcPattern::line("+XSIM:"),
];

pub struct SimSilo {
    deps: SiloDeps,
}

impl SimSilo {
    pub fn new(deps: SiloDeps) -> Self {
        Self { deps }
    }
}

impl Silo for SimSilo {
    fn domain(&self) -> Domain {
        Domain::Sim
    }

    fn unsolicited_table(&self) -> &'static [UrcPattern] {
        &TABLE
    }

    fn post_parse(&self, cmd: &Command, rsp: &mut Response) -> bool {
        // A SIM error on any command means the SIM state moved under us.
        let Some(err) = rsp.error() else {
            return true;
        };
        let sim_state = matches!(
            VendorError::from(err),
            VendorError::SimAbsent | VendorError::PinRequired | VendorError::PukRequired
        );
        let expected = matches!(
            cmd.request(),
            Request::GetSimStatus | Request::EnterSimPin | Request::EnterSimPuk
        );
        if sim_state && !expected {
            debug!("chnl=[{}] {:?} reported {}, SIM state changed", rsp.channel(), cmd.request(), err);
            self.deps.host.on_unsolicited(rsp.channel(), Notification::SimStatusChanged);
        }
        if cmd.request() == Request::EnterSimPin && rsp.result() == ResultCode::SimPukRequired {
            info!("chnl=[{}] SIM blocked after PIN attempt", rsp.channel());
        }
        true
    }

    fn parse_unsolicited(&self, entry: usize, _channel: ChannelId, text: &str) -> Option<Notification> {
        let pat = TABLE[entry];
        let body = pat.body(text).to_string();
        match pat.prefix {
            "+STKCTRLIND:" | "+STKCC:" => Some(Notification::StkCallControl(body)),
            "+STKPRO:" | "+SATI:" => Some(Notification::StkProactiveCommand(body)),
            "+SATN:" => Some(Notification::StkEventNotify(body)),
            "+STKCNF:" | "+SATF:" => Some(Notification::StkSessionEnd),
            "+XLOCK:" => Some(Notification::SimLockStatus(body)),
            "+XSIM:" => Some(Notification::SimStatusChanged),
            _ => None,
        }
    }
}
