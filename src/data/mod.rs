//! PDP context bookkeeping for the data channels.
//!
//! Every data channel is a slot; a slot with a context ID is in use. The
//! context ID is dense: slot position + 1. All allocation state lives
//! behind one mutex, and OS interface calls are made outside it.

pub mod netif;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::error::{AllocError, RilError, RilResult};
use netif::NetIf;

const IPV6_PREFIX_LEN: u32 = 64;

/// What the registry needs from the channel carrying a context.
pub trait DataLink: Send + Sync {
    /// Descriptor of the mux tty, when the port is one.
    fn raw_fd(&self) -> Option<RawFd>;
    /// Park the response thread (the DLC now carries IP, not AT).
    fn block_reads(&self);
    fn unblock_reads(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PdpState {
    #[default]
    Idle,
    Initing,
    Activating,
    Active,
    Deactivating,
    Deactivated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PdpType {
    #[default]
    Ip,
    Ipv6,
    Ipv4v6,
}

impl PdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            PdpType::Ip => "IP",
            PdpType::Ipv6 => "IPV6",
            PdpType::Ipv4v6 => "IPV4V6",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IP" | "IPV4" => Some(PdpType::Ip),
            "IPV6" => Some(PdpType::Ipv6),
            "IPV4V6" => Some(PdpType::Ipv4v6),
            _ => None,
        }
    }
}

impl fmt::Display for PdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the last PDP activation failed (3GPP 24.008 session management causes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailCause {
    #[default]
    None,
    OperatorBarred,
    InsufficientResources,
    MissingUnknownApn,
    UnknownPdpAddressType,
    UserAuthentication,
    ActivationRejectGgsn,
    ActivationRejectUnspecified,
    OptionNotSupported,
    OptionNotSubscribed,
    OptionOutOfOrder,
    NsapiInUse,
    Unspecified,
}

impl FailCause {
    pub fn from_code(code: u32) -> Self {
        match code {
            8 => FailCause::OperatorBarred,
            26 => FailCause::InsufficientResources,
            27 => FailCause::MissingUnknownApn,
            28 => FailCause::UnknownPdpAddressType,
            29 => FailCause::UserAuthentication,
            30 => FailCause::ActivationRejectGgsn,
            31 => FailCause::ActivationRejectUnspecified,
            32 => FailCause::OptionNotSupported,
            33 => FailCause::OptionNotSubscribed,
            34 => FailCause::OptionOutOfOrder,
            35 => FailCause::NsapiInUse,
            _ => FailCause::Unspecified,
        }
    }
}

/// Reserved range of HSI sub-channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsiRange {
    pub first: u32,
    pub count: u32,
}

/// Snapshot of one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataContext {
    pub channel: Option<ChannelId>,
    pub context_id: Option<u32>,
    pub state: PdpState,
    pub fail_cause: FailCause,
    pub apn: String,
    pub pdp_type: Option<PdpType>,
    pub interface: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub dns: Vec<IpAddr>,
    pub gateways: Vec<IpAddr>,
    pub hsi_channel: Option<u32>,
    /// Bumped on every allocation of the slot.
    pub generation: u64,
}

impl DataContext {
    fn clear(&mut self) {
        let channel = self.channel;
        let generation = self.generation;
        *self = DataContext {
            channel,
            generation,
            ..DataContext::default()
        };
    }

    fn occupy(&mut self, cid: u32) {
        self.context_id = Some(cid);
        self.state = PdpState::Initing;
        self.generation += 1;
    }
}

/// Context payload of a setup data call built by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCallRequest {
    pub context_id: u32,
    pub apn: String,
    pub pdp_type: PdpType,
    pub hsi_channel: Option<u32>,
    /// Slot generation at allocation; a mismatch means the context was
    /// freed and reallocated while the command was in flight.
    pub generation: u64,
}

/// Context payload of a deactivate data call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataCallTarget {
    pub context_id: u32,
}

/// Result data of a successful setup data call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataCall {
    pub context_id: u32,
    pub interface: String,
    pub pdp_type: Option<PdpType>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub dns: Vec<IpAddr>,
    pub gateways: Vec<IpAddr>,
}

/// Where a new context was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub channel: ChannelId,
    pub context_id: u32,
    pub hsi_channel: Option<u32>,
    pub generation: u64,
}

struct Slots {
    contexts: Vec<DataContext>,
    links: Vec<Option<Arc<dyn DataLink>>>,
    last_fail_cause: FailCause,
}

pub struct DataChannelRegistry {
    channels: Vec<ChannelId>,
    interface_prefix: String,
    hsi: Option<HsiRange>,
    netif: Arc<dyn NetIf>,
    slots: Mutex<Slots>,
}

impl DataChannelRegistry {
    /// `channels` are the data channels in slot order.
    pub fn new(
        channels: Vec<ChannelId>,
        interface_prefix: impl Into<String>,
        hsi: Option<HsiRange>,
        netif: Arc<dyn NetIf>,
    ) -> Self {
        let contexts = channels
            .iter()
            .map(|c| DataContext {
                channel: Some(*c),
                ..DataContext::default()
            })
            .collect();
        let links = channels.iter().map(|_| None).collect();
        Self {
            channels,
            interface_prefix: interface_prefix.into(),
            hsi,
            netif,
            slots: Mutex::new(Slots {
                contexts,
                links,
                last_fail_cause: FailCause::None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot_of_channel(&self, channel: ChannelId) -> Option<usize> {
        self.channels.iter().position(|c| *c == channel)
    }

    fn slot_of_cid(&self, cid: u32) -> Option<usize> {
        let idx = (cid as usize).checked_sub(1)?;
        (idx < self.channels.len()).then_some(idx)
    }

    pub fn uses_hsi(&self) -> bool {
        self.hsi.is_some()
    }

    pub fn hsi_range(&self) -> Option<HsiRange> {
        self.hsi
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    /// Attach the channel link used for mux ioctls and the read gate.
    pub fn attach(&self, channel: ChannelId, link: Arc<dyn DataLink>) {
        if let Some(idx) = self.slot_of_channel(channel) {
            self.lock().links[idx] = Some(link);
        }
    }

    /// First data channel without a context.
    pub fn get_free_chnl(&self) -> Result<Allocation, AllocError> {
        let mut slots = self.lock();
        let idx = slots
            .contexts
            .iter()
            .position(|c| c.context_id.is_none())
            .ok_or(AllocError::NoFreeChannel)?;
        let cid = idx as u32 + 1;
        let ctx = &mut slots.contexts[idx];
        ctx.occupy(cid);
        debug!("data: allocated cid {} on chnl=[{}]", cid, self.channels[idx]);
        Ok(Allocation {
            channel: self.channels[idx],
            context_id: cid,
            hsi_channel: None,
            generation: ctx.generation,
        })
    }

    /// Free data channel plus a free HSI sub-channel at or above `min_index`.
    /// Nothing is reserved when either is unavailable.
    pub fn get_free_chnls_hsi(&self, min_index: u32) -> Result<Allocation, AllocError> {
        let range = self.hsi.unwrap_or(HsiRange { first: 0, count: 0 });
        let lo = min_index.max(range.first);
        let hi = range.first + range.count;
        let mut slots = self.lock();
        let idx = slots
            .contexts
            .iter()
            .position(|c| c.context_id.is_none())
            .ok_or(AllocError::NoFreeChannel)?;
        let hsi = (lo..hi)
            .find(|h| !slots.contexts.iter().any(|c| c.hsi_channel == Some(*h)))
            .ok_or(AllocError::NoFreeSubChannel { min: lo, max: hi })?;
        let cid = idx as u32 + 1;
        let ctx = &mut slots.contexts[idx];
        ctx.occupy(cid);
        ctx.hsi_channel = Some(hsi);
        debug!("data: allocated cid {} hsi {} on chnl=[{}]", cid, hsi, self.channels[idx]);
        Ok(Allocation {
            channel: self.channels[idx],
            context_id: cid,
            hsi_channel: Some(hsi),
            generation: ctx.generation,
        })
    }

    /// Context on `channel`, assigning the slot's own ID when none is set.
    /// Only for activations that arrive without an allocation.
    pub fn claim_channel(&self, channel: ChannelId) -> Option<u32> {
        let idx = self.slot_of_channel(channel)?;
        let mut slots = self.lock();
        let ctx = &mut slots.contexts[idx];
        if let Some(cid) = ctx.context_id {
            return Some(cid);
        }
        let cid = idx as u32 + 1;
        ctx.occupy(cid);
        Some(cid)
    }

    /// Whether `cid` is still the allocation made at `generation` on `channel`.
    pub fn owns(&self, cid: u32, generation: u64, channel: ChannelId) -> bool {
        let Some(idx) = self.slot_of_cid(cid) else {
            return false;
        };
        let slots = self.lock();
        let ctx = &slots.contexts[idx];
        ctx.context_id == Some(cid) && ctx.generation == generation && self.channels[idx] == channel
    }

    pub fn context_id_for_channel(&self, channel: ChannelId) -> Option<u32> {
        let idx = self.slot_of_channel(channel)?;
        self.lock().contexts[idx].context_id
    }

    pub fn get_chnl_from_context_id(&self, cid: u32) -> Option<ChannelId> {
        let idx = self.slot_of_cid(cid)?;
        self.lock().contexts[idx].context_id.map(|_| self.channels[idx])
    }

    pub fn context(&self, cid: u32) -> Option<DataContext> {
        let idx = self.slot_of_cid(cid)?;
        let slots = self.lock();
        let ctx = &slots.contexts[idx];
        ctx.context_id.map(|_| ctx.clone())
    }

    pub fn contexts(&self) -> Vec<DataContext> {
        self.lock().contexts.clone()
    }

    fn with_context<T>(&self, cid: u32, f: impl FnOnce(&mut DataContext) -> T) -> Result<T, AllocError> {
        let idx = self.slot_of_cid(cid).ok_or(AllocError::UnknownContext(cid))?;
        let mut slots = self.lock();
        let ctx = &mut slots.contexts[idx];
        if ctx.context_id != Some(cid) {
            return Err(AllocError::UnknownContext(cid));
        }
        Ok(f(ctx))
    }

    pub fn set_state(&self, cid: u32, state: PdpState) -> Result<(), AllocError> {
        self.with_context(cid, |c| c.state = state)
    }

    pub fn set_request(&self, cid: u32, apn: &str, pdp_type: PdpType) -> Result<(), AllocError> {
        self.with_context(cid, |c| {
            c.apn = apn.to_string();
            c.pdp_type = Some(pdp_type);
        })
    }

    pub fn set_fail_cause(&self, cid: u32, cause: FailCause) -> Result<(), AllocError> {
        self.lock().last_fail_cause = cause;
        self.with_context(cid, |c| c.fail_cause = cause)
    }

    pub fn last_fail_cause(&self) -> FailCause {
        self.lock().last_fail_cause
    }

    pub fn set_addresses(&self, cid: u32, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> Result<(), AllocError> {
        self.with_context(cid, |c| {
            c.ipv4 = ipv4;
            c.ipv6 = ipv6;
        })
    }

    /// Record DNS servers, plus gateways when the network reported any.
    pub fn set_dns(&self, cid: u32, dns: Vec<IpAddr>, gateways: Vec<IpAddr>) -> Result<(), AllocError> {
        self.with_context(cid, |c| {
            c.dns = dns;
            if !gateways.is_empty() {
                c.gateways = gateways;
            }
        })
    }

    /// Release a context ID and clear everything recorded for it.
    pub fn free_context_id(&self, cid: u32) {
        if let Some(idx) = self.slot_of_cid(cid) {
            let mut slots = self.lock();
            if slots.contexts[idx].context_id == Some(cid) {
                slots.contexts[idx].clear();
                debug!("data: freed cid {}", cid);
            }
        }
    }

    pub fn reset_data_call_info(&self, cid: u32) {
        self.free_context_id(cid);
    }

    /// Clear every slot. Used when the engine shuts down.
    pub fn reset_all(&self) {
        let mut slots = self.lock();
        for c in slots.contexts.iter_mut() {
            c.clear();
        }
    }

    pub fn interface_name(&self, cid: u32) -> String {
        format!("{}{}", self.interface_prefix, cid.saturating_sub(1))
    }

    /// Bring the interface of `cid` up and mark the context active.
    pub fn data_config_up(&self, cid: u32) -> RilResult<()> {
        let iface = self.interface_name(cid);
        let idx = self.slot_of_cid(cid).ok_or(AllocError::UnknownContext(cid))?;
        let (ctx, link) = {
            let mut slots = self.lock();
            let ctx = &mut slots.contexts[idx];
            if ctx.context_id != Some(cid) {
                return Err(AllocError::UnknownContext(cid).into());
            }
            ctx.pdp_type = match (ctx.ipv4, ctx.ipv6) {
                (Some(_), Some(_)) => Some(PdpType::Ipv4v6),
                (None, Some(_)) => Some(PdpType::Ipv6),
                (Some(_), None) => Some(PdpType::Ip),
                (None, None) => ctx.pdp_type,
            };
            ctx.interface = Some(iface.clone());
            if ctx.gateways.is_empty() {
                ctx.gateways = ctx.ipv4.map(|a| IpAddr::V4(default_gateway(a))).into_iter().collect();
            }
            let snapshot = ctx.clone();
            (snapshot, slots.links[idx].clone())
        };
        let netif_err = |source| RilError::NetIf {
            iface: iface.clone(),
            source,
        };

        if ctx.hsi_channel.is_none() {
            let fd = link.as_ref().and_then(|l| l.raw_fd());
            match fd {
                Some(fd) => self.netif.enable_mux_net(fd, &iface).map_err(netif_err)?,
                None => warn!("data: cid {} has no mux descriptor, skipping network mode", cid),
            }
            if let Some(l) = &link {
                l.block_reads();
            }
        }
        self.netif.set_link(&iface, true).map_err(netif_err)?;
        if let Some(v4) = ctx.ipv4 {
            self.netif.set_ipv4(&iface, v4).map_err(netif_err)?;
        }
        if let Some(v6) = ctx.ipv6 {
            self.netif.set_ipv6(&iface, v6, IPV6_PREFIX_LEN).map_err(netif_err)?;
        }
        self.set_state(cid, PdpState::Active)?;
        info!(
            "data: cid {} up on {} ({}{})",
            cid,
            iface,
            ctx.ipv4.map(|a| a.to_string()).unwrap_or_default(),
            ctx.ipv6.map(|a| format!(" {}", a)).unwrap_or_default()
        );
        Ok(())
    }

    /// Tear `cid` down. The read gate is reopened and the ID freed even when
    /// an interface step fails; the first failure is returned.
    pub fn data_config_down(&self, cid: u32) -> RilResult<()> {
        let Some(idx) = self.slot_of_cid(cid) else {
            return Err(AllocError::UnknownContext(cid).into());
        };
        let (ctx, link) = {
            let mut slots = self.lock();
            let ctx = &mut slots.contexts[idx];
            if ctx.context_id != Some(cid) {
                return Err(AllocError::UnknownContext(cid).into());
            }
            ctx.state = PdpState::Deactivating;
            let snapshot = ctx.clone();
            (snapshot, slots.links[idx].clone())
        };
        let iface = ctx.interface.clone().unwrap_or_else(|| self.interface_name(cid));

        let mut result = Ok(());
        if ctx.hsi_channel.is_none() {
            if let Some(fd) = link.as_ref().and_then(|l| l.raw_fd()) {
                if let Err(e) = self.netif.disable_mux_net(fd) {
                    error!("data: cid {} disabling network mode failed: {}", cid, e);
                    result = Err(RilError::NetIf {
                        iface: iface.clone(),
                        source: e,
                    });
                }
            }
        } else if let Err(e) = self.netif.set_link(&iface, false) {
            error!("data: cid {} bringing {} down failed: {}", cid, iface, e);
            result = Err(RilError::NetIf {
                iface: iface.clone(),
                source: e,
            });
        }
        if let Some(l) = &link {
            l.unblock_reads();
        }
        self.free_context_id(cid);
        info!("data: cid {} down", cid);
        result
    }
}

impl fmt::Debug for DataChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelRegistry")
            .field("channels", &self.channels)
            .field("interface_prefix", &self.interface_prefix)
            .field("hsi", &self.hsi)
            .finish()
    }
}

/// Gateway reported for an IPv4 context when the network gives none: host 1
/// of the address's /24.
fn default_gateway(addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from((u32::from(addr) & 0xFFFF_FF00) | 1)
}

/// Addresses from a `+CGPADDR: <cid>,"<addr>"[,"<addr>"]` line for `cid`.
pub fn parse_cgpaddr(text: &str, cid: u32) -> Option<(Option<Ipv4Addr>, Option<Ipv6Addr>)> {
    text.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("+CGPADDR:")?;
        let fields = crate::response::scan::split_fields(rest);
        let id: u32 = fields.first()?.parse().ok()?;
        if id != cid {
            return None;
        }
        let mut v4 = None;
        let mut v6 = None;
        for f in fields.iter().skip(1) {
            match f.parse::<IpAddr>() {
                Ok(IpAddr::V4(a)) => v4 = Some(a),
                Ok(IpAddr::V6(a)) => v6 = Some(a),
                Err(_) => {}
            }
        }
        Some((v4, v6))
    })
}

/// DNS servers and gateways for `cid` from `+XDNS: <cid>,"<dns1>","<dns2>"`
/// or `+CGCONTRDP: <cid>,<bearer>,<apn>,<addr>,<gw>,<dns1>,<dns2>` lines.
/// Unspecified addresses (`0.0.0.0`, `::`) are skipped.
pub fn parse_dns(text: &str, cid: u32) -> (Vec<IpAddr>, Vec<IpAddr>) {
    fn push(list: &mut Vec<IpAddr>, field: Option<&String>) {
        if let Some(a) = field.and_then(|f| f.parse::<IpAddr>().ok()) {
            if !a.is_unspecified() && !list.contains(&a) {
                list.push(a);
            }
        }
    }
    let mut dns = Vec::new();
    let mut gateways = Vec::new();
    for line in text.lines().map(str::trim) {
        let (rest, gw_at, dns_at) = if let Some(rest) = line.strip_prefix("+XDNS:") {
            (rest, None, 1)
        } else if let Some(rest) = line.strip_prefix("+CGCONTRDP:") {
            (rest, Some(4), 5)
        } else {
            continue;
        };
        let fields = crate::response::scan::split_fields(rest);
        if fields.first().and_then(|f| f.parse::<u32>().ok()) != Some(cid) {
            continue;
        }
        if let Some(i) = gw_at {
            push(&mut gateways, fields.get(i));
        }
        push(&mut dns, fields.get(dns_at));
        push(&mut dns, fields.get(dns_at + 1));
    }
    (dns, gateways)
}

#[cfg(test)]
mod tests {
    use super::netif::{NetIfCall, RecordingNetIf};
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Link {
        blocked: AtomicBool,
    }

    impl DataLink for Link {
        fn raw_fd(&self) -> Option<RawFd> {
            Some(42)
        }
        fn block_reads(&self) {
            self.blocked.store(true, Ordering::SeqCst);
        }
        fn unblock_reads(&self) {
            self.blocked.store(false, Ordering::SeqCst);
        }
    }

    fn registry(netif: Arc<RecordingNetIf>, hsi: Option<HsiRange>) -> DataChannelRegistry {
        DataChannelRegistry::new(vec![ChannelId(3), ChannelId(4), ChannelId(5)], "rmnet", hsi, netif)
    }

    #[test]
    fn allocation_is_dense_and_exhausts() {
        let r = registry(Arc::new(RecordingNetIf::default()), None);
        let ids: Vec<u32> = (0..3).map(|_| r.get_free_chnl().unwrap().context_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(r.get_free_chnl(), Err(AllocError::NoFreeChannel));
        assert_eq!(r.get_chnl_from_context_id(2), Some(ChannelId(4)));
        r.free_context_id(2);
        assert_eq!(r.get_free_chnl().unwrap().channel, ChannelId(4));
    }

    #[test]
    fn hsi_allocation_respects_min_index_and_is_atomic() {
        let r = registry(Arc::new(RecordingNetIf::default()), Some(HsiRange { first: 2, count: 2 }));
        let a = r.get_free_chnls_hsi(3).unwrap();
        assert_eq!(a.hsi_channel, Some(3));
        assert_eq!(r.get_free_chnls_hsi(3), Err(AllocError::NoFreeSubChannel { min: 3, max: 4 }));
        // The failed call must not have consumed a channel.
        assert_eq!(r.get_free_chnl().unwrap().context_id, 2);
    }

    #[test]
    fn free_clears_every_field() {
        let r = registry(Arc::new(RecordingNetIf::default()), None);
        let a = r.get_free_chnl().unwrap();
        r.set_request(a.context_id, "internet", PdpType::Ipv4v6).unwrap();
        r.set_addresses(a.context_id, Some(Ipv4Addr::new(10, 0, 0, 2)), None).unwrap();
        r.set_fail_cause(a.context_id, FailCause::from_code(27)).unwrap();
        r.free_context_id(a.context_id);
        assert!(r.context(a.context_id).is_none());
        let slot = &r.contexts()[0];
        assert_eq!(slot.channel, Some(ChannelId(3)));
        assert_eq!(slot.state, PdpState::Idle);
        assert_eq!(slot.fail_cause, FailCause::None);
        assert!(slot.apn.is_empty() && slot.ipv4.is_none() && slot.interface.is_none());
        assert_eq!(r.last_fail_cause(), FailCause::MissingUnknownApn);
    }

    #[test]
    fn config_up_and_down_drive_mux_and_gate() {
        let netif = Arc::new(RecordingNetIf::default());
        let r = registry(netif.clone(), None);
        let link = Arc::new(Link {
            blocked: AtomicBool::new(false),
        });
        r.attach(ChannelId(3), link.clone());
        let a = r.get_free_chnl().unwrap();
        r.set_addresses(a.context_id, Some(Ipv4Addr::new(10, 0, 0, 2)), None).unwrap();
        r.data_config_up(a.context_id).unwrap();
        let ctx = r.context(1).unwrap();
        assert_eq!(ctx.state, PdpState::Active);
        assert_eq!(ctx.interface.as_deref(), Some("rmnet0"));
        assert_eq!(ctx.pdp_type, Some(PdpType::Ip));
        assert_eq!(ctx.gateways, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);
        assert!(link.blocked.load(Ordering::SeqCst));
        assert_eq!(
            netif.calls(),
            vec![
                NetIfCall::EnableMuxNet { iface: "rmnet0".into() },
                NetIfCall::SetLink {
                    iface: "rmnet0".into(),
                    up: true
                },
                NetIfCall::SetIpv4 {
                    iface: "rmnet0".into(),
                    addr: Ipv4Addr::new(10, 0, 0, 2)
                },
            ]
        );

        r.data_config_down(1).unwrap();
        assert!(!link.blocked.load(Ordering::SeqCst));
        assert!(r.context(1).is_none());
        assert_eq!(netif.calls().last(), Some(&NetIfCall::DisableMuxNet));
    }

    #[test]
    fn failed_bring_up_reports_interface() {
        let netif = Arc::new(RecordingNetIf::failing_enable());
        let r = registry(netif, None);
        r.attach(
            ChannelId(3),
            Arc::new(Link {
                blocked: AtomicBool::new(false),
            }),
        );
        let a = r.get_free_chnl().unwrap();
        match r.data_config_up(a.context_id) {
            Err(RilError::NetIf { iface, .. }) => assert_eq!(iface, "rmnet0"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fail_causes_map_from_codes() {
        assert_eq!(FailCause::from_code(8), FailCause::OperatorBarred);
        assert_eq!(FailCause::from_code(29), FailCause::UserAuthentication);
        assert_eq!(FailCause::from_code(35), FailCause::NsapiInUse);
        assert_eq!(FailCause::from_code(36), FailCause::Unspecified);
    }

    #[test]
    fn parses_pdp_addresses() {
        let text = "\r\n+CGPADDR: 2,\"10.1.1.1\"\r\n+CGPADDR: 1,\"10.0.0.2\",\"fe80::1\"\r\n\r\nOK\r\n";
        let (v4, v6) = parse_cgpaddr(text, 1).unwrap();
        assert_eq!(v4, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(v6, Some("fe80::1".parse().unwrap()));
        assert!(parse_cgpaddr(text, 3).is_none());
    }

    #[test]
    fn parses_dns_servers_per_context() {
        let xdns = "\r\n+XDNS: 1, \"10.11.12.13\", \"0.0.0.0\"\r\n+XDNS: 2, \"1.1.1.1\", \"1.0.0.1\"\r\n\r\nOK\r\n";
        let (dns, gw) = parse_dns(xdns, 1);
        assert_eq!(dns, vec![IpAddr::V4(Ipv4Addr::new(10, 11, 12, 13))]);
        assert!(gw.is_empty());

        let rdp = "+CGCONTRDP: 3,5,\"apn\",\"10.0.0.2\",\"10.0.0.254\",\"9.9.9.9\",\"2620:fe::fe\"\r\n";
        let (dns, gw) = parse_dns(rdp, 3);
        assert_eq!(dns, vec!["9.9.9.9".parse::<IpAddr>().unwrap(), "2620:fe::fe".parse().unwrap()]);
        assert_eq!(gw, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254))]);
        assert_eq!(parse_dns(rdp, 1), (vec![], vec![]));
    }

    #[test]
    fn reallocation_bumps_generation() {
        let r = registry(Arc::new(RecordingNetIf::default()), None);
        let a = r.get_free_chnl().unwrap();
        assert!(r.owns(1, a.generation, ChannelId(3)));
        assert!(!r.owns(1, a.generation, ChannelId(4)));
        r.free_context_id(1);
        assert!(!r.owns(1, a.generation, ChannelId(3)));
        let b = r.get_free_chnl().unwrap();
        assert_eq!(b.context_id, 1);
        assert!(!r.owns(1, a.generation, ChannelId(3)));
        assert!(r.owns(1, b.generation, ChannelId(3)));
    }
}
