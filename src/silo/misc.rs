//! Driver and diagnostics indications.

use log::warn;

use super::{Domain, Silo, UrcPattern};
use crate::channel::ChannelId;
use crate::host::Notification;

static TABLE: [UrcPattern; 1] = [UrcPattern::line("+XDRVI:")];

#[derive(Debug, Default)]
pub struct MiscSilo;

impl Silo for MiscSilo {
    fn domain(&self) -> Domain {
        Domain::Misc
    }

    fn unsolicited_table(&self) -> &'static [UrcPattern] {
        &TABLE
    }

    fn parse_unsolicited(&self, entry: usize, channel: ChannelId, text: &str) -> Option<Notification> {
        let body = TABLE[entry].body(text);
        if body.is_empty() {
            warn!("chnl=[{}] empty +XDRVI indication", channel);
            return None;
        }
        Some(Notification::DriverIndication(body.to_string()))
    }
}
