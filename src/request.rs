//! Request kinds the engine knows how to route.
//!
//! The per-request AT builders live with the host; the core only needs to
//! know which channel a request belongs on and a couple of behavioural
//! traits (coalescing, long abort wait).

use crate::channel::ChannelKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    GetSimStatus,
    EnterSimPin,
    EnterSimPuk,
    GetImsi,
    GetImei,
    SimIo,
    GetCurrentCalls,
    Dial,
    Hangup,
    Answer,
    LastCallFailCause,
    SignalStrength,
    RegistrationState,
    GprsRegistrationState,
    Operator,
    RadioPower,
    SendSms,
    SmsAcknowledge,
    SendUssd,
    SetupDataCall,
    DeactivateDataCall,
    LastDataCallFailCause,
    GetIpAddress,
    GetDns,
    QueryNetworkSelectionMode,
    SetNetworkSelectionAutomatic,
    QueryAvailableNetworks,
    SetPreferredNetworkType,
    GetPreferredNetworkType,
    BasebandVersion,
    OemHookRaw,
    ScreenState,
    /// Init strings, pings and other engine-internal traffic.
    Internal,
    /// Host-defined request pinned to a channel kind.
    Custom(ChannelKind),
}

impl Request {
    /// Channel kind a request is routed to.
    pub fn channel_kind(self) -> ChannelKind {
        use Request::*;
        match self {
            GetSimStatus | EnterSimPin | EnterSimPuk | GetImsi | GetImei | SimIo | Operator
            | BasebandVersion => ChannelKind::Dlc8,
            Dial | Hangup | SendSms | SendUssd => ChannelKind::Dlc6,
            SignalStrength
            | RegistrationState
            | GprsRegistrationState
            | LastDataCallFailCause
            | GetIpAddress
            | GetDns
            | QueryNetworkSelectionMode
            | SetNetworkSelectionAutomatic
            | QueryAvailableNetworks
            | SetPreferredNetworkType
            | GetPreferredNetworkType => ChannelKind::Dlc2,
            GetCurrentCalls
            | Answer
            | LastCallFailCause
            | RadioPower
            | SmsAcknowledge
            | DeactivateDataCall
            | Internal => ChannelKind::Atcmd,
            SetupDataCall => ChannelKind::Data,
            OemHookRaw => ChannelKind::Oem,
            ScreenState => ChannelKind::Urc,
            Custom(kind) => kind,
        }
    }

    /// Polling queries whose queued duplicates can share one modem round trip.
    pub fn is_coalescable(self) -> bool {
        matches!(
            self,
            Request::GetCurrentCalls
                | Request::SignalStrength
                | Request::RegistrationState
                | Request::GprsRegistrationState
                | Request::Operator
                | Request::QueryNetworkSelectionMode
        )
    }

    /// Long running requests that the modem may still be finishing when aborted.
    pub fn needs_long_abort_wait(self) -> bool {
        matches!(
            self,
            Request::QueryAvailableNetworks | Request::SetNetworkSelectionAutomatic
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_follows_channel_table() {
        assert_eq!(Request::GetSimStatus.channel_kind(), ChannelKind::Dlc8);
        assert_eq!(Request::Dial.channel_kind(), ChannelKind::Dlc6);
        assert_eq!(Request::SignalStrength.channel_kind(), ChannelKind::Dlc2);
        assert_eq!(Request::SetupDataCall.channel_kind(), ChannelKind::Data);
        assert_eq!(Request::Custom(ChannelKind::Sim).channel_kind(), ChannelKind::Sim);
    }

    #[test]
    fn writes_are_never_coalesced() {
        assert!(!Request::Dial.is_coalescable());
        assert!(!Request::SendSms.is_coalescable());
        assert!(Request::SignalStrength.is_coalescable());
    }
}
