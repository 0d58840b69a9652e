//! Fake modems on socket pairs and a recording host.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use atmux::cancel::CancelEvent;
use atmux::channel::{ChannelId, ChannelKind};
use atmux::command::Completion;
use atmux::config::{ChannelConfig, Config, TimeoutConfig};
use atmux::data::netif::RecordingNetIf;
use atmux::engine::Engine;
use atmux::error::RilResult;
use atmux::host::{Host, Notification, RecordingSupervisor};
use atmux::port::Port;

pub const OK: &str = "\r\nOK\r\n";

/// Answer for one received command line (without its CR). `None` stays silent.
pub type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

pub fn answer_ok() -> Responder {
    Box::new(|_: &str| Some(OK.to_string()))
}

#[derive(Default)]
pub struct Collect {
    pub done: Mutex<Vec<Completion>>,
    pub urcs: Mutex<Vec<(ChannelId, Notification)>>,
}

impl Collect {
    pub fn completions(&self) -> Vec<Completion> {
        self.done.lock().unwrap().clone()
    }

    pub fn for_token(&self, token: u64) -> Vec<Completion> {
        self.completions().into_iter().filter(|c| c.token == token).collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.urcs.lock().unwrap().iter().map(|(_, n)| n.clone()).collect()
    }
}

impl Host for Collect {
    fn on_complete(&self, c: Completion) {
        self.done.lock().unwrap().push(c);
    }

    fn on_unsolicited(&self, channel: ChannelId, n: Notification) {
        self.urcs.lock().unwrap().push((channel, n));
    }
}

/// Modem side of one channel. Every line it receives is recorded.
pub struct FakeModem {
    pub received: Arc<Mutex<Vec<String>>>,
}

impl FakeModem {
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.received().iter().filter(|l| l.as_str() == line).count()
    }
}

fn spawn_modem(stream: UnixStream, mut respond: Responder) -> FakeModem {
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let mut writer = stream.try_clone().unwrap();
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\r', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let text = String::from_utf8_lossy(&line).trim_end_matches('\r').to_string();
            log.lock().unwrap().push(text.clone());
            if let Some(answer) = respond(&text) {
                if writer.write_all(answer.as_bytes()).is_err() {
                    break;
                }
            }
        }
    });
    FakeModem { received }
}

/// Config with one channel per kind and short timeouts.
pub fn config(kinds: &[ChannelKind]) -> Config {
    let mut config = Config::default();
    config.channels = kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| ChannelConfig {
            kind: *kind,
            path: format!("fake{}", i),
            socket: true,
            baud: None,
        })
        .collect();
    config.timeouts = TimeoutConfig {
        default_ms: 400,
        init_ms: 1_000,
        retry_threshold_ms: 0,
        abort_ms: 50,
        abort_long_ms: 100,
        ping_ms: 200,
        max_consecutive: 3,
        put_ms: 500,
    };
    config
}

pub struct Rig {
    pub engine: RilResult<Engine>,
    pub host: Arc<Collect>,
    pub supervisor: Arc<RecordingSupervisor>,
    pub netif: Arc<RecordingNetIf>,
    pub modems: Vec<FakeModem>,
}

impl Rig {
    pub fn engine(&self) -> &Engine {
        self.engine.as_ref().expect("engine started")
    }
}

/// Start an engine over socket pairs, one responder per configured channel.
pub fn rig(config: &Config, responders: Vec<Responder>) -> Rig {
    assert_eq!(config.channels.len(), responders.len());
    let mut ports = Vec::new();
    let mut modems = Vec::new();
    for (i, respond) in responders.into_iter().enumerate() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ports.push(Port::from_stream(format!("fake{}", i), ours).unwrap());
        modems.push(spawn_modem(theirs, respond));
    }
    let host = Arc::new(Collect::default());
    let supervisor = Arc::new(RecordingSupervisor::default());
    let netif = Arc::new(RecordingNetIf::default());
    let engine = Engine::with_ports(
        config,
        ports,
        CancelEvent::new().unwrap(),
        host.clone(),
        supervisor.clone(),
        netif.clone(),
    );
    Rig {
        engine,
        host,
        supervisor,
        netif,
        modems,
    }
}

pub fn wait_until(f: impl Fn() -> bool) -> bool {
    let end = Instant::now() + Duration::from_secs(5);
    while Instant::now() < end {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}
