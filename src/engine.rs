//! Engine: the channel table plus the data call front door.
//!
//! Start-up opens every configured port, builds each channel's silo chain
//! through the family factory, spawns the channel threads and runs the init
//! phases across all channels in lock step. A phase must succeed on every
//! channel before the next one starts; once the last phase is done the
//! channels open for ordinary traffic.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};

use crate::cancel::CancelEvent;
use crate::channel::{Channel, ChannelDeps, ChannelId, ChannelKind, ChannelStatus, InitPhase};
use crate::command::{Command, Completion, Token};
use crate::config::Config;
use crate::data::netif::NetIf;
use crate::data::{Allocation, DataCallRequest, DataCallTarget, DataChannelRegistry, FailCause, PdpType};
use crate::error::{AllocError, PortError, ResultCode, RilError, RilResult};
use crate::host::{Host, ResetReason, Supervisor};
use crate::metrics;
use crate::port::Port;
use crate::request::Request;
use crate::silo::{factory, ModemFamily, SiloDeps};

pub struct Engine {
    family: ModemFamily,
    channels: Vec<Channel>,
    by_kind: HashMap<ChannelKind, usize>,
    registry: Option<Arc<DataChannelRegistry>>,
    hsi_min_index: u32,
    deps: ChannelDeps,
}

impl Engine {
    /// Open every configured port and bring the engine up.
    pub fn start(
        config: &Config,
        host: Arc<dyn Host>,
        supervisor: Arc<dyn Supervisor>,
        netif: Arc<dyn NetIf>,
    ) -> RilResult<Engine> {
        config.validate().map_err(|e| RilError::Config(e.to_string()))?;
        let cancel = CancelEvent::new().map_err(PortError::Io)?;
        let mut ports = Vec::with_capacity(config.channels.len());
        for ch in &config.channels {
            let settings = config.port_settings(ch);
            match Port::open(&settings, &cancel) {
                Ok(p) => ports.push(p),
                Err(e) => {
                    error!("{} channel on {}: {}", ch.kind, ch.path, e);
                    metrics::inc_resets_requested();
                    supervisor.request_reset(ResetReason::PortOpenFailed { path: ch.path.clone() });
                    return Err(e.into());
                }
            }
        }
        Self::with_ports(config, ports, cancel, host, supervisor, netif)
    }

    /// Bring the engine up on already opened ports, one per entry of
    /// `config.channels`, in the same order.
    pub fn with_ports(
        config: &Config,
        ports: Vec<Port>,
        cancel: Arc<CancelEvent>,
        host: Arc<dyn Host>,
        supervisor: Arc<dyn Supervisor>,
        netif: Arc<dyn NetIf>,
    ) -> RilResult<Engine> {
        if ports.len() != config.channels.len() {
            return Err(RilError::Config(format!(
                "{} ports for {} channels",
                ports.len(),
                config.channels.len()
            )));
        }
        let family = config.family();
        let data_channels: Vec<ChannelId> = config
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind.is_data())
            .map(|(i, _)| ChannelId(i))
            .collect();
        let registry = (!data_channels.is_empty()).then(|| {
            Arc::new(DataChannelRegistry::new(
                data_channels,
                config.data.interface_prefix.clone(),
                config.hsi_range(),
                netif,
            ))
        });
        let silo_deps = SiloDeps {
            host: host.clone(),
            registry: registry.clone(),
        };
        let deps = ChannelDeps {
            host,
            supervisor,
            cancel,
        };
        let settings = config.channel_settings();

        let mut channels = Vec::with_capacity(ports.len());
        let mut by_kind = HashMap::new();
        for (i, (cfg, port)) in config.channels.iter().zip(ports).enumerate() {
            let id = ChannelId(i);
            let silos = factory::build(cfg.kind, family, &silo_deps);
            let ch = Channel::new(id, cfg.kind, port, silos, settings.clone(), deps.clone());
            if let Some(reg) = &registry {
                if cfg.kind.is_data() {
                    reg.attach(id, ch.data_link());
                }
            }
            by_kind.entry(cfg.kind).or_insert(i);
            channels.push(ch);
        }

        let engine = Engine {
            family,
            channels,
            by_kind,
            registry,
            hsi_min_index: config.data.hsi_min_index,
            deps,
        };
        info!(
            "starting {} channels, modem family {}",
            engine.channels.len(),
            engine.family
        );
        if let Err(e) = engine.initialize(config) {
            engine.shutdown();
            return Err(e);
        }
        Ok(engine)
    }

    fn initialize(&self, config: &Config) -> RilResult<()> {
        for ch in &self.channels {
            ch.start()?;
        }
        for phase in InitPhase::ALL {
            let mut pending = Vec::with_capacity(self.channels.len());
            for ch in &self.channels {
                pending.push((ch, ch.begin_init_phase(phase, &config.init_string(ch.kind(), phase))?));
            }
            for (ch, p) in pending {
                if let Err(e) = ch.wait_init_phase(p) {
                    error!("chnl=[{}] {} init phase {} failed: {}", ch.id(), ch.kind(), phase, e);
                    if !self.deps.cancel.is_cancelled() {
                        metrics::inc_resets_requested();
                        self.deps
                            .supervisor
                            .request_reset(ResetReason::InitFailed { channel: ch.id() });
                    }
                    return Err(e);
                }
            }
        }
        for ch in &self.channels {
            ch.set_ready();
        }
        info!("all channels ready");
        Ok(())
    }

    pub fn family(&self) -> ModemFamily {
        self.family
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0)
    }

    /// First channel of `kind`.
    pub fn channel_of(&self, kind: ChannelKind) -> Option<&Channel> {
        self.by_kind.get(&kind).and_then(|i| self.channels.get(*i))
    }

    pub fn registry(&self) -> Option<&Arc<DataChannelRegistry>> {
        self.registry.as_ref()
    }

    pub fn status(&self) -> Vec<ChannelStatus> {
        self.channels.iter().map(Channel::status).collect()
    }

    /// Queue a command on its pinned channel, or on the first channel of the
    /// kind its request routes to.
    pub fn submit(&self, cmd: Command) -> RilResult<()> {
        let target = match cmd.channel() {
            Some(id) => self.channels.get(id.0),
            None => self.channel_of(cmd.request().channel_kind()),
        };
        match target {
            Some(ch) => ch.enqueue(cmd),
            None => {
                let what = match cmd.channel() {
                    Some(id) => format!("channel {}", id),
                    None => cmd.request().channel_kind().to_string(),
                };
                warn!("no channel for {:?} ({})", cmd.request(), what);
                self.reject(&cmd, ResultCode::GenericFailure);
                Err(RilError::NoChannel(what))
            }
        }
    }

    /// Complete a command the engine could not queue.
    fn reject(&self, cmd: &Command, result: ResultCode) {
        metrics::inc_commands_failed();
        if let Some(token) = cmd.token_value() {
            self.deps.host.on_complete(Completion {
                token,
                request: cmd.request(),
                channel: cmd.channel().unwrap_or(ChannelId(0)),
                result,
                error: None,
                data: None,
            });
        }
    }

    fn reject_token(&self, token: Token, request: Request) {
        self.reject(&Command::noop(request).token(token), ResultCode::GenericFailure);
    }

    /// Allocate a data channel and context ID and activate a PDP context on
    /// it. The host receives a [`crate::data::DataCall`] through `token`.
    pub fn setup_data_call(&self, token: Token, apn: &str, pdp_type: PdpType) -> RilResult<Allocation> {
        let Some(registry) = &self.registry else {
            self.reject_token(token, Request::SetupDataCall);
            return Err(RilError::NoChannel("data".into()));
        };
        let allocated = if self.family == ModemFamily::Xmm && registry.uses_hsi() {
            registry.get_free_chnls_hsi(self.hsi_min_index)
        } else {
            registry.get_free_chnl()
        };
        let alloc = match allocated {
            Ok(a) => a,
            Err(e) => {
                warn!("setup data call for {}: {}", apn, e);
                self.reject_token(token, Request::SetupDataCall);
                return Err(e.into());
            }
        };
        registry.set_request(alloc.context_id, apn, pdp_type)?;
        info!(
            "setup data call apn={} type={} cid={} chnl=[{}]",
            apn, pdp_type, alloc.context_id, alloc.channel
        );
        let cmd = Command::noop(Request::SetupDataCall)
            .token(token)
            .on_channel(alloc.channel)
            .context(DataCallRequest {
                context_id: alloc.context_id,
                apn: apn.to_string(),
                pdp_type,
                hsi_channel: alloc.hsi_channel,
                generation: alloc.generation,
            });
        if let Err(e) = self.submit(cmd) {
            registry.free_context_id(alloc.context_id);
            return Err(e);
        }
        Ok(alloc)
    }

    /// Deactivate `cid` and tear its interface down.
    pub fn deactivate_data_call(&self, token: Token, cid: u32) -> RilResult<()> {
        let known = self.registry.as_ref().and_then(|r| r.context(cid)).is_some();
        if !known {
            self.reject_token(token, Request::DeactivateDataCall);
            return Err(AllocError::UnknownContext(cid).into());
        }
        self.submit(
            Command::noop(Request::DeactivateDataCall)
                .token(token)
                .context(DataCallTarget { context_id: cid }),
        )
    }

    pub fn last_data_call_fail_cause(&self) -> FailCause {
        self.registry
            .as_ref()
            .map_or(FailCause::None, |r| r.last_fail_cause())
    }

    /// Switch raw data delivery on or off for one channel.
    pub fn set_raw_data_mode(&self, channel: ChannelId, on: bool) -> RilResult<()> {
        let ch = self
            .channel(channel)
            .ok_or_else(|| RilError::NoChannel(format!("channel {}", channel)))?;
        ch.set_data_mode(on);
        Ok(())
    }

    /// Cancel everything, join every channel thread and forget all contexts.
    pub fn shutdown(&self) {
        if !self.deps.cancel.is_cancelled() {
            info!("shutting down {} channels", self.channels.len());
        }
        self.deps.cancel.cancel();
        for ch in &self.channels {
            ch.stop();
        }
        if let Some(r) = &self.registry {
            r.reset_all();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
