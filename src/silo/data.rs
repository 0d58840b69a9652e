//! PDP activation and data channel notifications.
//!
//! A setup data call arrives as a no-op command carrying a
//! [`DataCallRequest`]; `pre_send` writes the family's activation commands.
//! `post_parse` records the addresses from the `+CGPADDR` answer and the DNS
//! servers from `+XDNS`/`+CGCONTRDP`, brings the interface up on success and
//! tears the context down on failure.
//!
//! A setup answer is only applied while its allocation is still current: a
//! context freed and handed out again while the command was in flight is left
//! to its new owner.

use std::sync::Arc;

use log::{debug, error, info, warn};

use super::{Domain, ModemFamily, Silo, SiloDeps, UrcPattern};
use crate::channel::ChannelId;
use crate::command::Command;
use crate::data::{parse_cgpaddr, parse_dns, DataCall, DataCallRequest, DataCallTarget, DataChannelRegistry, FailCause, PdpState};
use crate::error::ResultCode;
use crate::host::Notification;
use crate::request::Request;
use crate::response::Response;

static TABLE: [UrcPattern; 4] = [
    UrcPattern::line("NO CARRIER"),
    UrcPattern::line("+XCIEV:"),
    UrcPattern::line("RING"),
    UrcPattern::until_ok("+XCGEDPAGE:"),
];

pub struct DataSilo {
    family: ModemFamily,
    deps: SiloDeps,
}

impl DataSilo {
    pub fn new(family: ModemFamily, deps: SiloDeps) -> Self {
        Self { family, deps }
    }

    fn registry(&self) -> Option<&Arc<DataChannelRegistry>> {
        self.deps.registry.as_ref()
    }

    /// DNS query appended after `+CGPADDR`.
    fn dns_query(&self, cid: u32) -> String {
        match self.family {
            ModemFamily::Inf | ModemFamily::Xmm => "+XDNS?".to_string(),
            _ => format!("+CGCONTRDP={}", cid),
        }
    }

    /// AT strings activating `req` on `channel`.
    pub fn activation_commands(&self, channel: ChannelId, req: &DataCallRequest) -> (String, String) {
        let cid = req.context_id;
        let dns = self.dns_query(cid);
        match (self.family, req.hsi_channel) {
            (ModemFamily::Xmm, Some(hsi)) => (
                format!("AT+CGDCONT={},\"{}\",\"{}\"\r", cid, req.pdp_type, req.apn),
                format!(
                    "AT+XDATACHANNEL=1,1,\"/mux/{}\",\"/mipi_ipc/{}\",0,{};+CGACT=1,{};+CGPADDR={};{}\r",
                    channel.0, hsi, cid, cid, cid, dns
                ),
            ),
            _ => (
                format!(
                    "AT+CGDCONT={},\"{}\",\"{}\";+CGACT=1,{};+CGPADDR={};{}\r",
                    cid, req.pdp_type, req.apn, cid, cid, dns
                ),
                format!("AT+CGDATA=\"M-RAW_IP\",{}\r", cid),
            ),
        }
    }

    fn setup_succeeded(&self, registry: &DataChannelRegistry, cid: u32, rsp: &mut Response) {
        let text = rsp.text().into_owned();
        if let Some((v4, v6)) = parse_cgpaddr(&text, cid) {
            let _ = registry.set_addresses(cid, v4, v6);
        } else {
            warn!("chnl=[{}] cid {} activated without +CGPADDR", rsp.channel(), cid);
        }
        let (dns, gateways) = parse_dns(&text, cid);
        if dns.is_empty() {
            debug!("chnl=[{}] cid {} no DNS servers reported", rsp.channel(), cid);
        }
        let _ = registry.set_dns(cid, dns, gateways);
        match registry.data_config_up(cid) {
            Ok(()) => {
                if let Some(ctx) = registry.context(cid) {
                    rsp.set_data(Some(Arc::new(DataCall {
                        context_id: cid,
                        interface: ctx.interface.unwrap_or_default(),
                        pdp_type: ctx.pdp_type,
                        ipv4: ctx.ipv4,
                        ipv6: ctx.ipv6,
                        dns: ctx.dns,
                        gateways: ctx.gateways,
                    })));
                }
            }
            Err(e) => {
                error!("chnl=[{}] cid {} interface bring-up failed: {}", rsp.channel(), cid, e);
                let _ = registry.set_fail_cause(cid, FailCause::Unspecified);
                if let Err(e) = registry.data_config_down(cid) {
                    debug!("cid {} teardown after failed bring-up: {}", cid, e);
                }
                rsp.set_result(ResultCode::GenericFailure);
                rsp.set_data(None);
            }
        }
    }

    fn setup_failed(&self, registry: &DataChannelRegistry, cid: u32, rsp: &Response) {
        let cause = rsp.error().map_or(FailCause::Unspecified, |e| FailCause::from_code(e.code()));
        info!("chnl=[{}] cid {} activation failed: {:?}", rsp.channel(), cid, cause);
        let _ = registry.set_fail_cause(cid, cause);
        if let Err(e) = registry.data_config_down(cid) {
            debug!("cid {} teardown after failed activation: {}", cid, e);
        }
    }
}

impl Silo for DataSilo {
    fn domain(&self) -> Domain {
        Domain::Data
    }

    fn unsolicited_table(&self) -> &'static [UrcPattern] {
        &TABLE
    }

    fn pre_send(&self, cmd: &mut Command, _rsp: &mut Response) -> bool {
        if !cmd.is_noop() {
            return true;
        }
        match cmd.request() {
            Request::SetupDataCall => {
                let Some(channel) = cmd.channel() else {
                    return true;
                };
                let built = cmd
                    .context
                    .as_ref()
                    .and_then(|c| c.downcast_ref::<DataCallRequest>())
                    .map(|req| self.activation_commands(channel, req));
                if let Some((cmd1, cmd2)) = built {
                    cmd.cmd1 = Some(cmd1);
                    cmd.cmd2 = Some(cmd2);
                }
            }
            Request::DeactivateDataCall => {
                if let Some(target) = cmd.context.as_ref().and_then(|c| c.downcast_ref::<DataCallTarget>()) {
                    cmd.cmd1 = Some(format!("AT+CGACT=0,{}\r", target.context_id));
                }
            }
            _ => {}
        }
        true
    }

    fn post_parse(&self, cmd: &Command, rsp: &mut Response) -> bool {
        let Some(registry) = self.registry() else {
            return true;
        };
        match cmd.request() {
            Request::SetupDataCall => {
                let request = cmd.context.as_ref().and_then(|c| c.downcast_ref::<DataCallRequest>());
                let cid = match request {
                    Some(req) if registry.owns(req.context_id, req.generation, rsp.channel()) => req.context_id,
                    Some(req) => {
                        warn!(
                            "chnl=[{}] cid {} was released while activating, dropping answer",
                            rsp.channel(),
                            req.context_id
                        );
                        rsp.set_result(ResultCode::GenericFailure);
                        rsp.set_data(None);
                        return true;
                    }
                    None => match registry.claim_channel(rsp.channel()) {
                        Some(cid) => cid,
                        None => return true,
                    },
                };
                if rsp.result().is_success() {
                    let _ = registry.set_state(cid, PdpState::Activating);
                    self.setup_succeeded(registry, cid, rsp);
                } else {
                    self.setup_failed(registry, cid, rsp);
                }
                self.deps.host.on_unsolicited(
                    rsp.channel(),
                    Notification::DataCallListChanged { context_id: Some(cid) },
                );
            }
            Request::DeactivateDataCall => {
                let cid = cmd.context.as_ref().and_then(|c| c.downcast_ref::<DataCallTarget>()).map(|t| t.context_id);
                if let Some(cid) = cid {
                    if let Err(e) = registry.data_config_down(cid) {
                        warn!("cid {} teardown: {}", cid, e);
                    }
                    self.deps.host.on_unsolicited(
                        rsp.channel(),
                        Notification::DataCallListChanged { context_id: Some(cid) },
                    );
                }
            }
            _ => {}
        }
        true
    }

    fn parse_unsolicited(&self, entry: usize, channel: ChannelId, text: &str) -> Option<Notification> {
        match TABLE[entry].prefix {
            "NO CARRIER" => {
                let registry = self.registry()?;
                let cid = registry.context_id_for_channel(channel)?;
                info!("chnl=[{}] NO CARRIER, tearing down cid {}", channel, cid);
                if let Err(e) = registry.data_config_down(cid) {
                    warn!("cid {} teardown: {}", cid, e);
                }
                Some(Notification::DataCallListChanged { context_id: Some(cid) })
            }
            "+XCIEV:" => Some(Notification::SignalIndicator(TABLE[entry].body(text).to_string())),
            // Claimed so it never reaches a pending command.
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::netif::{NetIfCall, RecordingNetIf};
    use crate::data::PdpType;
    use crate::host::LoggingHost;

    fn setup(family: ModemFamily) -> (DataSilo, Arc<DataChannelRegistry>, Arc<RecordingNetIf>) {
        let netif = Arc::new(RecordingNetIf::default());
        let registry = Arc::new(DataChannelRegistry::new(
            vec![ChannelId(3), ChannelId(4)],
            "rmnet",
            None,
            netif.clone(),
        ));
        let silo = DataSilo::new(
            family,
            SiloDeps {
                host: Arc::new(LoggingHost),
                registry: Some(registry.clone()),
            },
        );
        (silo, registry, netif)
    }

    fn request(cid: u32, hsi: Option<u32>) -> DataCallRequest {
        DataCallRequest {
            context_id: cid,
            apn: "internet".into(),
            pdp_type: PdpType::Ip,
            hsi_channel: hsi,
            generation: 1,
        }
    }

    #[test]
    fn family_routes_activation() {
        let (silo, _, _) = setup(ModemFamily::Xmm);
        let (c1, c2) = silo.activation_commands(ChannelId(3), &request(1, Some(4)));
        assert_eq!(c1, "AT+CGDCONT=1,\"IP\",\"internet\"\r");
        assert!(c2.starts_with("AT+XDATACHANNEL=1,1,\"/mux/3\",\"/mipi_ipc/4\",0,1;"));
        assert!(c2.ends_with(";+CGPADDR=1;+XDNS?\r"));

        let (silo, _, _) = setup(ModemFamily::Inf);
        let (c1, c2) = silo.activation_commands(ChannelId(3), &request(1, None));
        assert_eq!(c1, "AT+CGDCONT=1,\"IP\",\"internet\";+CGACT=1,1;+CGPADDR=1;+XDNS?\r");
        assert_eq!(c2, "AT+CGDATA=\"M-RAW_IP\",1\r");

        let (silo, _, _) = setup(ModemFamily::Default);
        let (c1, _) = silo.activation_commands(ChannelId(3), &request(1, None));
        assert!(c1.ends_with(";+CGPADDR=1;+CGCONTRDP=1\r"));
    }

    #[test]
    fn noop_setup_is_filled_in() {
        let (silo, _, _) = setup(ModemFamily::Default);
        let mut cmd = Command::noop(Request::SetupDataCall)
            .on_channel(ChannelId(4))
            .context(request(2, None));
        let mut rsp = Response::new(ChannelId(4), 64);
        assert!(silo.pre_send(&mut cmd, &mut rsp));
        assert!(cmd.cmd1().unwrap().starts_with("AT+CGDCONT=2,"));
        assert!(cmd.cmd2().is_some());
    }

    #[test]
    fn failed_activation_frees_context() {
        let (silo, registry, _) = setup(ModemFamily::Default);
        let a = registry.get_free_chnl().unwrap();
        let mut rsp = Response::new(a.channel, 64);
        rsp.append(b"\r\n+CME ERROR: 33\r\n").unwrap();
        assert!(rsp.is_complete_response(&crate::response::NoUrc));
        let cmd = Command::new(Request::SetupDataCall, "AT+CGACT=1,1\r").on_channel(a.channel);
        silo.post_parse(&cmd, &mut rsp);
        assert!(registry.context(a.context_id).is_none());
        assert_eq!(registry.last_fail_cause(), FailCause::OptionNotSubscribed);
    }

    #[test]
    fn no_carrier_tears_down_active_context() {
        let (silo, registry, netif) = setup(ModemFamily::Default);
        let a = registry.get_free_chnl().unwrap();
        registry.data_config_up(a.context_id).unwrap();
        let n = silo.parse_unsolicited(0, a.channel, "NO CARRIER\r\n");
        assert_eq!(
            n,
            Some(Notification::DataCallListChanged {
                context_id: Some(a.context_id)
            })
        );
        assert!(registry.context(a.context_id).is_none());
        assert!(netif.calls().contains(&NetIfCall::SetLink {
            iface: "rmnet0".into(),
            up: true
        }));
        assert_eq!(silo.parse_unsolicited(0, ChannelId(4), "NO CARRIER\r\n"), None);
    }

    #[test]
    fn answer_for_a_released_context_leaves_new_owner_alone() {
        let (silo, registry, netif) = setup(ModemFamily::Default);
        let first = registry.get_free_chnl().unwrap();
        let stale = DataCallRequest {
            generation: first.generation,
            ..request(first.context_id, None)
        };
        // Torn down by NO CARRIER, then handed to the next setup.
        assert!(silo.parse_unsolicited(0, first.channel, "NO CARRIER\r\n").is_some());
        let second = registry.get_free_chnl().unwrap();
        assert_eq!(second.context_id, first.context_id);
        assert_ne!(second.generation, first.generation);

        let cmd = Command::noop(Request::SetupDataCall)
            .on_channel(first.channel)
            .context(stale);
        let mut rsp = Response::new(first.channel, 128);
        rsp.append(b"\r\n+CGPADDR: 1,\"10.0.0.9\"\r\n\r\nOK\r\n").unwrap();
        assert!(rsp.is_complete_response(&crate::response::NoUrc));
        silo.post_parse(&cmd, &mut rsp);

        assert_eq!(rsp.result(), ResultCode::GenericFailure);
        let ctx = registry.context(second.context_id).unwrap();
        assert_eq!(ctx.state, PdpState::Initing);
        assert!(ctx.ipv4.is_none());
        assert!(!netif.calls().iter().any(|c| matches!(c, NetIfCall::SetLink { up: true, .. })));
    }

    #[test]
    fn current_allocation_gets_addresses_and_dns() {
        let (silo, registry, netif) = setup(ModemFamily::Default);
        let a = registry.get_free_chnl().unwrap();
        let req = DataCallRequest {
            generation: a.generation,
            pdp_type: PdpType::Ipv4v6,
            ..request(a.context_id, None)
        };
        let cmd = Command::noop(Request::SetupDataCall).on_channel(a.channel).context(req);
        let mut rsp = Response::new(a.channel, 256);
        rsp.append(
            b"\r\n+CGPADDR: 1,\"10.0.0.2\",\"fe80::1\"\r\n\
              +CGCONTRDP: 1,5,\"internet\",\"10.0.0.2\",\"10.0.0.254\",\"8.8.8.8\",\"8.8.4.4\"\r\n\r\nOK\r\n",
        )
        .unwrap();
        assert!(rsp.is_complete_response(&crate::response::NoUrc));
        silo.post_parse(&cmd, &mut rsp);

        assert!(rsp.result().is_success());
        let ctx = registry.context(1).unwrap();
        assert_eq!(ctx.state, PdpState::Active);
        assert_eq!(ctx.pdp_type, Some(PdpType::Ipv4v6));
        assert_eq!(ctx.dns, vec!["8.8.8.8".parse::<std::net::IpAddr>().unwrap(), "8.8.4.4".parse().unwrap()]);
        assert_eq!(ctx.gateways, vec!["10.0.0.254".parse::<std::net::IpAddr>().unwrap()]);
        assert!(netif.calls().contains(&NetIfCall::SetIpv6 {
            iface: "rmnet0".into(),
            addr: "fe80::1".parse().unwrap(),
            prefix_len: 64
        }));
    }
}
