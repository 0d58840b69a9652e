//! Binary entrypoint for the atmux CLI.
//!
//! Commands:
//! - `start` - open every configured channel, run init and serve until interrupted
//! - `init` - write a starter `atmux.toml`
//! - `status` - print the configured channel table and init strings
//! - `probe --port <path> [--socket] [-b <baud>] [--timeout <s>]` - identify the modem on one link
//!
//! See the library crate docs for module-level details: `atmux::`.
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use atmux::cancel::CancelEvent;
use atmux::channel::{ChannelId, InitPhase};
use atmux::config::Config;
use atmux::data::netif::NetIf;
use atmux::engine::Engine;
use atmux::host::{LoggingHost, ResetReason, Supervisor};
use atmux::logutil::escape_log;
use atmux::metrics;
use atmux::port::{Port, PortSettings, ReadOutcome};
use atmux::response::{NoUrc, Response, Verdict};

const PROBE_COMMANDS: [&str; 3] = ["AT", "AT+CGMR", "AT+CPIN?"];

#[derive(Parser)]
#[command(name = "atmux")]
#[command(about = "AT command/response engine for multiplexed cellular modem links")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "atmux.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Open all channels and serve until interrupted
    Start {
        /// Run as a background daemon (Unix only)
        #[arg(short, long)]
        daemon: bool,

        /// PID file location (for daemon mode)
        #[arg(long, default_value = "/tmp/atmux.pid")]
        pid_file: String,
    },
    /// Write a default configuration file
    Init,
    /// Show the configured channel table
    Status,
    /// Send a few AT commands on one link and print the classified answers
    Probe {
        /// Modem tty or mux socket path
        #[arg(short, long)]
        port: String,
        /// Treat the path as a mux socket
        #[arg(long)]
        socket: bool,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 115200)]
        baud: u32,
        /// Command to send, without the trailing CR (repeatable; default AT, AT+CGMR, AT+CPIN?)
        #[arg(long = "command")]
        commands: Vec<String>,
        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

/// Forwards reset requests to the main task, which stops the engine.
struct ExitSupervisor {
    tx: mpsc::UnboundedSender<ResetReason>,
}

impl Supervisor for ExitSupervisor {
    fn request_reset(&self, reason: ResetReason) {
        error!("modem reset requested: {}", reason);
        let _ = self.tx.send(reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };

    match &cli.command {
        Commands::Start { daemon, .. } if *daemon => {
            // Logging starts in the child after the fork.
        }
        Commands::Init => {}
        _ => init_logging(&pre_config, cli.verbose),
    }

    match cli.command {
        Commands::Start { daemon, pid_file } => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };

            #[cfg(all(unix, feature = "daemon"))]
            if daemon {
                // The parent exits here; the child runs without --daemon.
                daemonize_process(&config, &pid_file)?;
            }

            #[cfg(not(all(unix, feature = "daemon")))]
            if daemon {
                let _ = pid_file;
                eprintln!("Error: Daemon mode requires Unix platform and 'daemon' feature.");
                eprintln!("Compile with: cargo build --features daemon");
                std::process::exit(1);
            }

            info!("Starting atmux v{}", env!("CARGO_PKG_VERSION"));
            let code = run(config).await?;
            std::process::exit(code);
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if std::path::Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists; not overwriting", cli.config));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            print_status(&config)?;
        }
        Commands::Probe {
            port,
            socket,
            baud,
            commands,
            timeout,
        } => {
            let mut settings = PortSettings::tty(port);
            settings.socket = socket;
            settings.baud = baud;
            settings.open_retries = 1;
            let commands = if commands.is_empty() {
                PROBE_COMMANDS.iter().map(|c| c.to_string()).collect()
            } else {
                commands
            };
            let deadline = Duration::from_secs(timeout);
            let payload = tokio::task::spawn_blocking(move || probe(&settings, &commands, deadline)).await??;
            let ok = payload["status"] == "ok";
            println!("{}", payload);
            std::process::exit(if ok { 0 } else { 1 });
        }
    }

    Ok(())
}

/// Bring the engine up, then wait for ctrl-c or a reset request.
/// Returns the process exit code.
async fn run(config: Config) -> Result<i32> {
    let (tx, mut resets) = mpsc::unbounded_channel();
    let supervisor: Arc<dyn Supervisor> = Arc::new(ExitSupervisor { tx });
    let netif = default_netif();

    let engine = tokio::task::spawn_blocking(move || {
        Engine::start(&config, Arc::new(LoggingHost), supervisor, netif)
    })
    .await?;
    let engine = match engine {
        Ok(e) => e,
        Err(e) => {
            error!("engine start failed: {}", e);
            return Ok(2);
        }
    };
    info!("atmux ready on {} channels", engine.status().len());

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            0
        }
        Some(reason) = resets.recv() => {
            warn!("stopping after reset request: {}", reason);
            3
        }
    };

    tokio::task::spawn_blocking(move || {
        engine.shutdown();
        drop(engine);
    })
    .await?;
    match serde_json::to_string(&metrics::snapshot()) {
        Ok(s) => info!("final counters: {}", s),
        Err(e) => warn!("could not serialize counters: {}", e),
    }
    Ok(code)
}

#[cfg(target_os = "linux")]
fn default_netif() -> Arc<dyn NetIf> {
    Arc::new(atmux::data::netif::LinuxNetIf)
}

#[cfg(not(target_os = "linux"))]
fn default_netif() -> Arc<dyn NetIf> {
    warn!("no network interface control on this platform; data calls only record their settings");
    Arc::new(atmux::data::netif::RecordingNetIf::default())
}

fn print_status(config: &Config) -> Result<()> {
    println!("atmux v{}", env!("CARGO_PKG_VERSION"));
    println!("modem family: {}", config.family());
    println!("channels:");
    for (i, ch) in config.channels.iter().enumerate() {
        println!(
            "  [{}] {:<8} {}{}",
            ChannelId(i),
            ch.kind.to_string(),
            ch.path,
            if ch.socket { " (socket)" } else { "" }
        );
        for phase in InitPhase::ALL {
            let init = config.init_string(ch.kind, phase);
            if !init.is_empty() {
                println!("        {:<8} {}", phase.to_string(), escape_log(&init));
            }
        }
    }
    let s = config.channel_settings();
    println!(
        "timeouts: default {:?}, init {:?}, abort {:?}/{:?}, ping {:?}, max consecutive {}",
        s.default_timeout, s.init_timeout, s.abort_wait, s.abort_wait_long, s.ping_timeout,
        s.max_consecutive_timeouts
    );
    match config.hsi_range() {
        Some(r) => println!("data: prefix {} hsi {}..{}", config.data.interface_prefix, r.first, r.first + r.count),
        None => println!("data: prefix {}", config.data.interface_prefix),
    }
    Ok(())
}

/// Open one link and send each command in turn, collecting bytes until a
/// final result code or the per-command deadline.
fn probe(settings: &PortSettings, commands: &[String], deadline: Duration) -> Result<serde_json::Value> {
    let cancel = CancelEvent::new()?;
    let port = Port::open(settings, &cancel)?;
    info!("probing {} with {} commands", port.name(), commands.len());
    let started = Instant::now();
    let mut rsp = Response::new(ChannelId(0), 4096);
    let mut results = Vec::with_capacity(commands.len());
    let mut all_ok = true;
    for command in commands {
        let answer = probe_one(&port, &cancel, &mut rsp, command, deadline)?;
        all_ok &= answer["status"] == "ok";
        results.push(answer);
    }
    Ok(serde_json::json!({
        "status": if all_ok { "ok" } else { "incomplete" },
        "port": port.name(),
        "results": results,
        "elapsed_ms": started.elapsed().as_millis() as u64,
    }))
}

fn probe_one(
    port: &Port,
    cancel: &CancelEvent,
    rsp: &mut Response,
    command: &str,
    deadline: Duration,
) -> Result<serde_json::Value> {
    debug!("TX {}", escape_log(command));
    let started = Instant::now();
    port.write(format!("{}\r", command).as_bytes())?;
    let mut lines = Vec::new();
    let mut chunk = [0u8; 1024];
    let verdict = loop {
        let left = deadline.saturating_sub(started.elapsed());
        if left.is_zero() {
            break None;
        }
        if !port.wait_for_data(cancel, Some(left))? {
            continue;
        }
        match port.read(&mut chunk)? {
            ReadOutcome::Data(n) => rsp.append(&chunk[..n])?,
            ReadOutcome::WouldBlock => continue,
            ReadOutcome::Eof => return Err(anyhow!("{} closed during probe", port.name())),
        }
        let mut done = None;
        while rsp.is_complete_response(&NoUrc) {
            let Some(part) = rsp.transfer_data() else { break };
            if part.verdict() == Some(Verdict::Unrecognized) {
                continue;
            }
            lines.extend(
                part.text()
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_owned),
            );
            done = Some(part);
            break;
        }
        if let Some(part) = done {
            break Some(part);
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(match verdict {
        Some(part) => serde_json::json!({
            "command": command,
            "status": if part.result().is_success() { "ok" } else { "error" },
            "result": part.result().to_string(),
            "error": part.error().map(|e| e.to_string()),
            "lines": lines,
            "elapsed_ms": elapsed_ms,
        }),
        None => {
            let partial = String::from_utf8_lossy(rsp.bytes()).into_owned();
            rsp.clear();
            serde_json::json!({
                "command": command,
                "status": "timeout",
                "partial": partial,
                "timeout_seconds": deadline.as_secs(),
            })
        }
    })
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let config_level = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    // CLI verbosity overrides the configured level.
    let base_level = match verbosity {
        0 => config_level,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    match file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // In daemon mode stdout is redirected, so only the file gets the line.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}

/// Re-spawn the current command line without `--daemon`, detached, and exit.
#[cfg(all(unix, feature = "daemon"))]
fn daemonize_process(config: &Config, pid_file: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::process::Command;

    let log_path = config.logging.file.as_deref().unwrap_or("atmux.log");

    let current_exe = std::env::current_exe()?;
    let mut args: Vec<String> = std::env::args().collect();
    if let Some(pos) = args.iter().position(|arg| arg == "--daemon" || arg == "-d") {
        args.remove(pos);
    }
    let child_args = &args[1..];

    let log_file = OpenOptions::new().create(true).append(true).open(log_path)?;
    let child = Command::new(&current_exe)
        .args(child_args)
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    std::fs::write(pid_file, format!("{}", child.id()))?;
    std::process::exit(0);
}
