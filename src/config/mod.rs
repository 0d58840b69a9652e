//! # Configuration
//!
//! TOML configuration for the engine and the `atmux` binary.
//!
//! ```toml
//! [modem]
//! family = "XMM7160"
//!
//! [[modem.init_overrides]]
//! kind = "urc"
//! phase = "unlock"
//! commands = "+CNMI=2,2,2,1|+CRC=1"
//!
//! [[channels]]
//! kind = "atcmd"
//! path = "/dev/gsmtty1"
//!
//! [[channels]]
//! kind = "data"
//! path = "/dev/gsmtty3"
//!
//! [timeouts]
//! default_ms = 10000
//! retry_threshold_ms = 0
//!
//! [data]
//! interface_prefix = "rmnet"
//! ```
//!
//! Every section and field has a default, so a file only needs what it
//! changes. [`Config::validate`] rejects tables the engine cannot run.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::fs;

use crate::channel::{ChannelKind, ChannelSettings, InitPhase};
use crate::data::HsiRange;
use crate::port::PortSettings;
use crate::silo::ModemFamily;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub port: PortConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Modem type name, e.g. "InfineonN721" or "XMM7160". Unknown names use default behaviour.
    #[serde(default = "default_family")]
    pub family: String,
    /// Replacement init strings for specific (channel kind, phase) pairs.
    #[serde(default)]
    pub init_overrides: Vec<InitOverride>,
}

fn default_family() -> String {
    "Default".to_string()
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            family: default_family(),
            init_overrides: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitOverride {
    pub kind: ChannelKind,
    pub phase: InitPhase,
    /// Pipe-delimited commands without the `AT` prefix.
    pub commands: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub path: String,
    /// Connect to a domain socket instead of opening a tty.
    #[serde(default)]
    pub socket: bool,
    /// Overrides `[port] baud` for this channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud: Option<u32>,
}

fn default_channels() -> Vec<ChannelConfig> {
    let table = [
        (ChannelKind::Atcmd, 1),
        (ChannelKind::Dlc2, 2),
        (ChannelKind::Dlc6, 6),
        (ChannelKind::Dlc8, 8),
        (ChannelKind::Sim, 9),
        (ChannelKind::Urc, 12),
        (ChannelKind::Oem, 13),
        (ChannelKind::Data, 3),
        (ChannelKind::Data, 4),
        (ChannelKind::Data, 5),
    ];
    table
        .iter()
        .map(|(kind, n)| ChannelConfig {
            kind: *kind,
            path: format!("/dev/gsmtty{}", n),
            socket: false,
            baud: None,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_open_retries")]
    pub open_retries: u32,
    #[serde(default = "default_open_interval_ms")]
    pub open_interval_ms: u64,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_open_retries() -> u32 {
    30
}
fn default_open_interval_ms() -> u64 {
    1000
}
fn default_write_retries() -> u32 {
    10
}
fn default_baud() -> u32 {
    115_200
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            open_retries: default_open_retries(),
            open_interval_ms: default_open_interval_ms(),
            write_retries: default_write_retries(),
            baud: default_baud(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_command_ms")]
    pub default_ms: u64,
    #[serde(default = "default_command_ms")]
    pub init_ms: u64,
    /// 0 disables the single retry of short commands.
    #[serde(default)]
    pub retry_threshold_ms: u64,
    #[serde(default = "default_abort_ms")]
    pub abort_ms: u64,
    #[serde(default = "default_abort_long_ms")]
    pub abort_long_ms: u64,
    #[serde(default = "default_ping_ms")]
    pub ping_ms: u64,
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive: u32,
    /// How long a submit waits for queue space; 0 waits forever.
    #[serde(default = "default_put_ms")]
    pub put_ms: u64,
}

fn default_command_ms() -> u64 {
    10_000
}
fn default_abort_ms() -> u64 {
    500
}
fn default_abort_long_ms() -> u64 {
    5_000
}
fn default_ping_ms() -> u64 {
    3_000
}
fn default_max_consecutive() -> u32 {
    3
}
fn default_put_ms() -> u64 {
    5_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_ms: default_command_ms(),
            init_ms: default_command_ms(),
            retry_threshold_ms: 0,
            abort_ms: default_abort_ms(),
            abort_long_ms: default_abort_long_ms(),
            ping_ms: default_ping_ms(),
            max_consecutive: default_max_consecutive(),
            put_ms: default_put_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    crate::response::DEFAULT_BUFFER_SIZE
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_interface_prefix")]
    pub interface_prefix: String,
    /// Route data calls over HSI sub-channels instead of the mux.
    #[serde(default)]
    pub hsi: bool,
    #[serde(default)]
    pub hsi_first: u32,
    #[serde(default)]
    pub hsi_count: u32,
    /// Lowest sub-channel handed out.
    #[serde(default)]
    pub hsi_min_index: u32,
}

fn default_interface_prefix() -> String {
    "rmnet".to_string()
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            interface_prefix: default_interface_prefix(),
            hsi: false,
            hsi_first: 0,
            hsi_count: 0,
            hsi_min_index: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modem: ModemConfig::default(),
            channels: default_channels(),
            port: PortConfig::default(),
            timeouts: TimeoutConfig::default(),
            response: ResponseConfig::default(),
            queue: QueueConfig::default(),
            data: DataConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            bail!("no channels configured");
        }
        if self.queue.capacity == 0 {
            bail!("queue.capacity must be nonzero");
        }
        if self.response.buffer_size < 64 {
            bail!("response.buffer_size must be at least 64 bytes");
        }
        if self.port.open_retries == 0 {
            bail!("port.open_retries must be nonzero");
        }

        let mut seen = HashSet::new();
        for ch in self.channels.iter().filter(|c| !c.kind.is_data()) {
            if !seen.insert(ch.kind) {
                bail!("channel kind {} configured twice", ch.kind);
            }
        }

        let data: Vec<usize> = self
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind.is_data())
            .map(|(i, _)| i)
            .collect();
        if let (Some(first), Some(last)) = (data.first(), data.last()) {
            if last - first + 1 != data.len() {
                bail!("data channels must be contiguous in the channel table");
            }
        }

        if self.data.hsi {
            if self.data.hsi_count == 0 {
                bail!("data.hsi requires data.hsi_count > 0");
            }
            let end = self.data.hsi_first + self.data.hsi_count;
            if self.data.hsi_min_index >= end {
                bail!(
                    "data.hsi_min_index {} is outside {}..{}",
                    self.data.hsi_min_index,
                    self.data.hsi_first,
                    end
                );
            }
        }
        Ok(())
    }

    pub fn family(&self) -> ModemFamily {
        ModemFamily::from_name(&self.modem.family)
    }

    /// Init string for `kind` in `phase`, configured override first.
    pub fn init_string(&self, kind: ChannelKind, phase: InitPhase) -> String {
        self.modem
            .init_overrides
            .iter()
            .rev()
            .find(|o| o.kind == kind && o.phase == phase)
            .map(|o| o.commands.clone())
            .unwrap_or_else(|| kind.default_init(phase).to_string())
    }

    pub fn hsi_range(&self) -> Option<HsiRange> {
        self.data.hsi.then_some(HsiRange {
            first: self.data.hsi_first,
            count: self.data.hsi_count,
        })
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        let t = &self.timeouts;
        ChannelSettings {
            default_timeout: Duration::from_millis(t.default_ms),
            init_timeout: Duration::from_millis(t.init_ms),
            retry_threshold: Duration::from_millis(t.retry_threshold_ms),
            abort_wait: Duration::from_millis(t.abort_ms),
            abort_wait_long: Duration::from_millis(t.abort_long_ms),
            ping_timeout: Duration::from_millis(t.ping_ms),
            max_consecutive_timeouts: t.max_consecutive,
            buffer_size: self.response.buffer_size,
            queue_capacity: self.queue.capacity,
            put_timeout: (t.put_ms > 0).then(|| Duration::from_millis(t.put_ms)),
        }
    }

    pub fn port_settings(&self, channel: &ChannelConfig) -> PortSettings {
        PortSettings {
            path: channel.path.clone(),
            socket: channel.socket,
            baud: channel.baud.unwrap_or(self.port.baud),
            open_retries: self.port.open_retries,
            open_interval: Duration::from_millis(self.port.open_interval_ms),
            write_retries: self.port.write_retries,
        }
    }
}
