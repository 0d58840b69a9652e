use super::{Domain, Silo, UrcPattern};
use crate::channel::ChannelId;
use crate::host::Notification;

static TABLE: [UrcPattern; 1] = [UrcPattern::line("+PBREADY")];

#[derive(Debug, Default)]
pub struct PhonebookSilo;

impl Silo for PhonebookSilo {
    fn domain(&self) -> Domain {
        Domain::Phonebook
    }

    fn unsolicited_table(&self) -> &'static [UrcPattern] {
        &TABLE
    }

    fn parse_unsolicited(&self, _entry: usize, _channel: ChannelId, _text: &str) -> Option<Notification> {
        Some(Notification::PhonebookReady)
    }
}
