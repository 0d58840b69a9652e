//! # atmux - AT command/response engine for cellular modems
//!
//! atmux multiplexes one cellular modem's command interface into several
//! logical channels, each bound to its own mux tty or socket. Every channel
//! runs a bounded command queue, a command thread and a response thread;
//! the response thread classifies what the modem sends and separates
//! unsolicited notifications from the answers to pending commands.
//!
//! ## Features
//!
//! - **Channel table**: AT, registration, voice/SMS, SIM, OEM, URC and data
//!   channels, each with its own init strings and hosted silos.
//! - **Response classification**: CME/CMS errors, final result codes, SMS
//!   prompts and multi-line notifications, split without losing bytes.
//! - **Silos**: per-domain hooks (SIM, voice, SMS, network, data, phonebook,
//!   misc) with modem family overlays chosen by one factory.
//! - **Timeout recovery**: abort, ping, retry and reset requests.
//! - **Data calls**: context allocation, PDP activation and interface
//!   configuration through the n_gsm network ioctls.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use atmux::config::Config;
//! use atmux::engine::Engine;
//! use atmux::host::{LoggingHost, RecordingSupervisor};
//! use atmux::data::netif::RecordingNetIf;
//! use atmux::command::Command;
//! use atmux::request::Request;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("atmux.toml").await?;
//!     let engine = Engine::start(
//!         &config,
//!         Arc::new(LoggingHost),
//!         Arc::new(RecordingSupervisor::default()),
//!         Arc::new(RecordingNetIf::default()),
//!     )?;
//!     engine.submit(Command::new(Request::GetSimStatus, "AT+CPIN?\r").token(1))?;
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - channel table, start-up, data call front door
//! - [`channel`] - command and response threads of one channel
//! - [`queue`] - bounded priority command queue
//! - [`response`] - response accumulation and classification
//! - [`silo`] - domain hooks and unsolicited notification tables
//! - [`data`] - data channel registry and network interface control
//! - [`port`] - tty and socket links
//! - [`config`] - TOML configuration
//! - [`error`] - error taxonomy

pub mod cancel;
pub mod channel;
pub mod command;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod host;
pub mod logutil;
pub mod metrics;
pub mod port;
pub mod queue;
pub mod request;
pub mod response;
pub mod silo;
