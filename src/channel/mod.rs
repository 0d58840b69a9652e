//! Logical command channel: one port, one queue, two threads.
//!
//! The command thread dequeues a command, runs the silo hooks, writes the AT
//! strings and waits for the solicited answer the response thread hands
//! over. The response thread reads the port, classifies what arrives and
//! routes it: unsolicited notifications to the silos and the host,
//! solicited answers to the command thread, unrecognised fragments to the
//! floor.
//!
//! Until every init phase has completed the command thread only dequeues
//! init commands; everything else stays queued.

pub mod kind;

pub use kind::{split_init_string, ChannelId, ChannelKind, InitPhase};

use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, error, info, trace, warn};

use crate::cancel::CancelEvent;
use crate::command::{Command, Completion, InitStep, ParseInput};
use crate::data::DataLink;
use crate::error::{PortError, QueueError, ResultCode, RilError, RilResult};
use crate::host::{Host, ResetReason, Supervisor};
use crate::logutil::{escape_bytes, escape_log};
use crate::metrics;
use crate::port::{Port, ReadOutcome, WriteStatus};
use crate::queue::{CommandQueue, QueueStats};
use crate::request::Request;
use crate::response::{Response, DEFAULT_BUFFER_SIZE};
use crate::silo::SiloChain;

const ABORT_CMD: &[u8] = b"AT\x1b\r";
const PING_CMD: &str = "AT+CMEE=1\r";
const READ_CHUNK: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const GATE_RECHECK: Duration = Duration::from_millis(200);
const MAX_READ_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    InitBasic,
    InitUnlock,
    InitPowerOn,
    Ready,
}

impl ChannelState {
    /// State while `phase` is being sent. The ready phase still runs
    /// before the channel is open for ordinary traffic.
    fn during(phase: InitPhase) -> Self {
        match phase {
            InitPhase::Basic => ChannelState::InitBasic,
            InitPhase::Unlock => ChannelState::InitUnlock,
            InitPhase::PowerOn | InitPhase::Ready => ChannelState::InitPowerOn,
        }
    }
}

/// Per-channel timing and sizing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub default_timeout: Duration,
    pub init_timeout: Duration,
    /// Commands whose timeout is at or below this get one retry. Zero disables retries.
    pub retry_threshold: Duration,
    pub abort_wait: Duration,
    /// Abort wait for requests the modem takes long to cancel (network scan, CGACT).
    pub abort_wait_long: Duration,
    pub ping_timeout: Duration,
    pub max_consecutive_timeouts: u32,
    pub buffer_size: usize,
    pub queue_capacity: usize,
    /// How long `enqueue` waits for queue space. `None` waits forever.
    pub put_timeout: Option<Duration>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(10_000),
            init_timeout: Duration::from_millis(10_000),
            retry_threshold: Duration::ZERO,
            abort_wait: Duration::from_millis(500),
            abort_wait_long: Duration::from_millis(5_000),
            ping_timeout: Duration::from_millis(3_000),
            max_consecutive_timeouts: 3,
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_capacity: 64,
            put_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Collaborators every channel shares.
#[derive(Clone)]
pub struct ChannelDeps {
    pub host: Arc<dyn Host>,
    pub supervisor: Arc<dyn Supervisor>,
    pub cancel: Arc<CancelEvent>,
}

/// Init commands queued for one phase; hand back to [`Channel::wait_init_phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPhase {
    pub phase: InitPhase,
    pub commands: usize,
}

#[derive(Debug, Clone, Copy)]
struct PhaseOutcome {
    phase: InitPhase,
    ok: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub port: String,
    pub state: ChannelState,
    pub data_mode: bool,
    /// A command or recovery step is waiting for its answer.
    pub in_flight: bool,
    pub queue: QueueStats,
}

/// Parks the response thread while a mux channel carries network traffic.
struct ReadGate {
    blocked: Mutex<bool>,
    cv: Condvar,
}

impl ReadGate {
    fn new() -> Self {
        Self {
            blocked: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn set(&self, blocked: bool) {
        let mut g = self.blocked.lock().unwrap_or_else(|e| e.into_inner());
        *g = blocked;
        drop(g);
        self.cv.notify_all();
    }

    fn is_blocked(&self) -> bool {
        *self.blocked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the gate is open. False when cancelled first.
    fn wait_open(&self, cancel: &CancelEvent) -> bool {
        let mut g = self.blocked.lock().unwrap_or_else(|e| e.into_inner());
        while *g {
            if cancel.is_cancelled() {
                return false;
            }
            g = self
                .cv
                .wait_timeout(g, GATE_RECHECK)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        !cancel.is_cancelled()
    }
}

enum Exchange {
    Answered(Response),
    TimedOut,
    Cancelled,
    WriteFailed(PortError),
}

struct Shared {
    id: ChannelId,
    kind: ChannelKind,
    label: String,
    port: Port,
    queue: Arc<CommandQueue>,
    silos: SiloChain,
    settings: ChannelSettings,
    deps: ChannelDeps,
    state: Mutex<ChannelState>,
    ready: AtomicBool,
    awaiting: AtomicBool,
    timed_out: AtomicBool,
    data_mode: AtomicBool,
    init_failed: AtomicBool,
    consecutive_timeouts: AtomicU32,
    gate: ReadGate,
    solicited_tx: Sender<Response>,
    solicited_rx: Receiver<Response>,
    init_tx: Sender<PhaseOutcome>,
    init_rx: Receiver<PhaseOutcome>,
}

pub struct Channel {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(
        id: ChannelId,
        kind: ChannelKind,
        port: Port,
        silos: SiloChain,
        settings: ChannelSettings,
        deps: ChannelDeps,
    ) -> Self {
        let label = if kind.is_data() {
            format!("{}{}", kind, id)
        } else {
            kind.to_string()
        };
        let queue = CommandQueue::new(label.clone(), settings.queue_capacity, deps.cancel.clone());
        let (solicited_tx, solicited_rx) = crossbeam_channel::unbounded();
        let (init_tx, init_rx) = crossbeam_channel::unbounded();
        debug!("chnl=[{}] {} on {} hosts {:?}", id, label, port.name(), silos);
        Self {
            shared: Arc::new(Shared {
                id,
                kind,
                label,
                port,
                queue,
                silos,
                settings,
                deps,
                state: Mutex::new(ChannelState::Closed),
                ready: AtomicBool::new(false),
                awaiting: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                data_mode: AtomicBool::new(false),
                init_failed: AtomicBool::new(false),
                consecutive_timeouts: AtomicU32::new(0),
                gate: ReadGate::new(),
                solicited_tx,
                solicited_rx,
                init_tx,
                init_rx,
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Spawn the command and response threads.
    pub fn start(&self) -> RilResult<()> {
        self.shared.set_state(ChannelState::Opening);
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = self.shared.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("{}-cmd", self.shared.label))
                .spawn(move || cmd.command_loop())
                .map_err(PortError::Io)?,
        );
        let rsp = self.shared.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("{}-rsp", self.shared.label))
                .spawn(move || rsp.response_loop())
                .map_err(PortError::Io)?,
        );
        Ok(())
    }

    /// Queue `cmd`. A command that cannot be queued is completed as a
    /// failure before the error is returned.
    pub fn enqueue(&self, cmd: Command) -> RilResult<()> {
        let s = &self.shared;
        trace!("chnl=[{}] enqueue {:?}", s.id, cmd);
        let put = if cmd.is_high_priority() {
            s.queue.put_front(cmd, s.settings.put_timeout)
        } else {
            s.queue.put(cmd, s.settings.put_timeout)
        };
        match put {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("chnl=[{}] could not queue {:?}: {}", s.id, e.command.request(), e.kind);
                let result = if e.kind == QueueError::Cancelled {
                    ResultCode::Cancelled
                } else {
                    ResultCode::GenericFailure
                };
                s.complete(e.command, Response::failed(s.id, result));
                Err(RilError::Queue(e.kind))
            }
        }
    }

    /// Queue the init commands of `phase`.
    pub fn begin_init_phase(&self, phase: InitPhase, init: &str) -> RilResult<PendingPhase> {
        let s = &self.shared;
        s.set_state(ChannelState::during(phase));
        let cmds = split_init_string(init);
        let count = cmds.len();
        if count > 0 {
            info!("chnl=[{}] init phase {} ({} commands)", s.id, phase, count);
        }
        s.init_failed.store(false, Ordering::Release);
        for (i, at) in cmds.into_iter().enumerate() {
            let step = InitStep {
                phase,
                is_final: i + 1 == count,
            };
            let cmd = Command::init_string(at, step, s.settings.init_timeout);
            if let Err(e) = s.queue.put_init(cmd, s.settings.put_timeout) {
                return Err(RilError::Queue(e.kind));
            }
        }
        Ok(PendingPhase { phase, commands: count })
    }

    /// Block until the final command of `pending` reports. Every command of
    /// the phase must have succeeded.
    pub fn wait_init_phase(&self, pending: PendingPhase) -> RilResult<()> {
        let s = &self.shared;
        let failed = || RilError::InitFailed {
            channel: s.label.clone(),
            phase: pending.phase.to_string(),
        };
        if pending.commands == 0 {
            return Ok(());
        }
        let per_command = s.settings.init_timeout * 2 + s.settings.abort_wait_long + s.settings.ping_timeout;
        let deadline = Instant::now() + per_command * pending.commands as u32;
        let cancel = s.deps.cancel.receiver();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(s.init_rx) -> msg => match msg {
                    Ok(o) if o.phase == pending.phase => {
                        return if o.ok { Ok(()) } else { Err(failed()) };
                    }
                    Ok(o) => debug!("chnl=[{}] stale outcome for phase {}", s.id, o.phase),
                    Err(_) => return Err(failed()),
                },
                recv(cancel) -> _ => return Err(RilError::Queue(QueueError::Cancelled)),
                default(left) => {
                    error!("chnl=[{}] init phase {} never completed", s.id, pending.phase);
                    return Err(failed());
                }
            }
        }
    }

    /// Open the channel for ordinary commands.
    pub fn set_ready(&self) {
        self.shared.set_state(ChannelState::Ready);
    }

    /// Route incoming bytes straight to the host instead of the classifier.
    pub fn set_data_mode(&self, on: bool) {
        info!("chnl=[{}] raw data mode {}", self.shared.id, if on { "on" } else { "off" });
        self.shared.data_mode.store(on, Ordering::Release);
    }

    /// Handle the data channel registry uses to drive this channel.
    pub fn data_link(&self) -> Arc<dyn DataLink> {
        Arc::new(LinkHandle(Arc::downgrade(&self.shared)))
    }

    pub fn status(&self) -> ChannelStatus {
        let s = &self.shared;
        ChannelStatus {
            id: s.id,
            kind: s.kind,
            port: s.port.name().to_string(),
            state: s.state(),
            data_mode: s.data_mode.load(Ordering::Acquire),
            in_flight: s.awaiting.load(Ordering::Acquire),
            queue: s.queue.stats(),
        }
    }

    /// Fire the cancellation event, join both threads and complete every
    /// command still queued as cancelled.
    pub fn stop(&self) {
        let s = &self.shared;
        s.deps.cancel.cancel();
        s.gate.set(false);
        let handles: Vec<JoinHandle<()>> = {
            let mut g = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            g.drain(..).collect()
        };
        let was_running = !handles.is_empty();
        for h in handles {
            if h.join().is_err() {
                error!("chnl=[{}] worker thread panicked", s.id);
            }
        }
        for cmd in s.queue.drain() {
            s.complete(cmd, Response::failed(s.id, ResultCode::Cancelled));
        }
        s.set_state(ChannelState::Closed);
        if was_running {
            info!("chnl=[{}] {} stopped", s.id, s.label);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("port", &self.shared.port.name())
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Non-owning [`DataLink`] so the registry never keeps a channel alive.
struct LinkHandle(Weak<Shared>);

impl DataLink for LinkHandle {
    fn raw_fd(&self) -> Option<RawFd> {
        let s = self.0.upgrade()?;
        // The mux ioctl only applies to tty links.
        s.port.is_tty().then(|| s.port.as_raw_fd())
    }

    fn block_reads(&self) {
        if let Some(s) = self.0.upgrade() {
            debug!("chnl=[{}] read gate closed", s.id);
            s.gate.set(true);
        }
    }

    fn unblock_reads(&self) {
        if let Some(s) = self.0.upgrade() {
            debug!("chnl=[{}] read gate open", s.id);
            s.gate.set(false);
        }
    }
}

impl Shared {
    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ChannelState) {
        let mut g = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *g != next {
            debug!("chnl=[{}] {:?} -> {:?}", self.id, *g, next);
            *g = next;
        }
        drop(g);
        let ready = next == ChannelState::Ready;
        if self.ready.swap(ready, Ordering::AcqRel) != ready {
            // Re-run the dequeue predicate on the command thread.
            self.queue.poke();
        }
    }

    fn request_reset(&self, reason: ResetReason) {
        metrics::inc_resets_requested();
        self.deps.supervisor.request_reset(reason);
    }

    // ---- command thread -------------------------------------------------

    fn command_loop(self: Arc<Self>) {
        debug!("chnl=[{}] command thread up", self.id);
        loop {
            let seen = self.queue.version();
            let ready = self.ready.load(Ordering::Acquire);
            match self.queue.conditional_get(|c| ready || c.is_init(), None) {
                Ok(cmd) => self.process(cmd),
                Err(QueueError::NotSatisfied) => {
                    if let Err(QueueError::Cancelled) = self.queue.wait_for_change(seen, None) {
                        break;
                    }
                }
                Err(QueueError::Cancelled) => break,
                Err(e) => debug!("chnl=[{}] dequeue: {}", self.id, e),
            }
        }
        debug!("chnl=[{}] command thread down", self.id);
    }

    fn process(&self, mut cmd: Command) {
        let mut rsp = Response::new(self.id, self.settings.buffer_size);
        if !self.silos.pre_send(&mut cmd, &mut rsp) {
            debug!("chnl=[{}] {:?} completed by pre-send hook", self.id, cmd.request());
            self.finish(cmd, rsp);
            return;
        }
        let mut rsp = if cmd.is_noop() { rsp } else { self.exchange(&cmd) };

        self.silos.post_send(&cmd, &rsp);

        if self.silos.pre_parse(&cmd, &mut rsp) {
            let run = !rsp.is_timed_out() && (rsp.result().is_success() || cmd.always_parse);
            if run {
                if let Some(parse) = cmd.parse.take() {
                    let text = rsp.text().into_owned();
                    let parsed = parse(ParseInput {
                        channel: self.id,
                        request: cmd.request(),
                        response: &text,
                        result: rsp.result(),
                        error: rsp.error(),
                        context: cmd.context.take(),
                    });
                    rsp.set_result(parsed.result);
                    rsp.set_data(parsed.data);
                }
            }
        }
        self.silos.post_parse(&cmd, &mut rsp);
        self.finish(cmd, rsp);
    }

    /// Write cmd1, then cmd2 when cmd1 succeeded. The answers are merged so
    /// parsing sees the whole exchange.
    fn exchange(&self, cmd: &Command) -> Response {
        let timeout = cmd.timeout_value().unwrap_or(self.settings.default_timeout);
        let Some(cmd1) = cmd.cmd1() else {
            return Response::new(self.id, 16);
        };
        let first = self.send_with_recovery(cmd, cmd1, timeout);
        let Some(cmd2) = cmd.cmd2() else {
            return first;
        };
        if !first.result().is_success() || first.is_timed_out() {
            debug!("chnl=[{}] cmd2 skipped after {}", self.id, first.result());
            return first;
        }
        let mut second = self.send_with_recovery(cmd, cmd2, timeout);
        second.merge_front(first);
        second
    }

    fn send_with_recovery(&self, cmd: &Command, at: &str, timeout: Duration) -> Response {
        let threshold = self.settings.retry_threshold;
        let mut retries = if !threshold.is_zero() && timeout <= threshold { 1 } else { 0 };
        loop {
            match self.transact(at, timeout) {
                Exchange::Answered(rsp) => {
                    self.consecutive_timeouts.store(0, Ordering::Release);
                    return rsp;
                }
                Exchange::Cancelled => return Response::failed(self.id, ResultCode::Cancelled),
                Exchange::WriteFailed(e) => {
                    error!("chnl=[{}] write of {} failed: {}", self.id, escape_log(at), e);
                    return Response::failed(self.id, ResultCode::GenericFailure);
                }
                Exchange::TimedOut => {
                    metrics::inc_timeouts();
                    warn!(
                        "chnl=[{}] {:?} timed out after {:?}: {}",
                        self.id,
                        cmd.request(),
                        timeout,
                        escape_log(at)
                    );
                    self.handle_timeout(cmd.request());
                    if retries > 0 && !self.deps.cancel.is_cancelled() {
                        retries -= 1;
                        metrics::inc_retries();
                        info!("chnl=[{}] retrying {}", self.id, escape_log(at));
                        continue;
                    }
                    return Response::timed_out(self.id);
                }
            }
        }
    }

    fn transact(&self, at: &str, timeout: Duration) -> Exchange {
        self.drain_stale();
        self.awaiting.store(true, Ordering::Release);
        debug!("chnl=[{}] TX {}", self.id, escape_log(at));
        match self.port.write(at.as_bytes()) {
            Ok(WriteStatus::Written(_)) => {}
            Ok(WriteStatus::LinkClosed) => {
                debug!("chnl=[{}] link closed under write, awaiting reset", self.id);
            }
            Err(e) => {
                self.awaiting.store(false, Ordering::Release);
                return Exchange::WriteFailed(e);
            }
        }
        metrics::inc_commands_sent();
        let sent_at = Instant::now();
        let out = self.await_answer(timeout);
        self.awaiting.store(false, Ordering::Release);
        if let Exchange::Answered(ref r) = out {
            metrics::observe_response_latency(sent_at);
            debug!("chnl=[{}] RX {}", self.id, escape_log(&r.text()));
        }
        out
    }

    fn await_answer(&self, timeout: Duration) -> Exchange {
        let cancel = self.deps.cancel.receiver();
        select! {
            recv(self.solicited_rx) -> msg => match msg {
                Ok(rsp) => Exchange::Answered(rsp),
                Err(_) => Exchange::Cancelled,
            },
            recv(cancel) -> _ => Exchange::Cancelled,
            default(timeout) => Exchange::TimedOut,
        }
    }

    /// Drop answers that arrived after their command gave up.
    fn drain_stale(&self) {
        while let Ok(stale) = self.solicited_rx.try_recv() {
            debug!("chnl=[{}] dropping stale response {}", self.id, escape_log(&stale.text()));
        }
    }

    /// Abort the hung command, then ping to find out whether the modem is alive.
    fn handle_timeout(&self, request: Request) {
        let count = self.consecutive_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
        self.timed_out.store(true, Ordering::Release);

        let abort_wait = if request.needs_long_abort_wait() {
            self.settings.abort_wait_long
        } else {
            self.settings.abort_wait
        };
        info!("chnl=[{}] sending abort, waiting {:?}", self.id, abort_wait);
        self.awaiting.store(true, Ordering::Release);
        match self.port.write(ABORT_CMD) {
            Ok(_) => match self.await_answer(abort_wait) {
                Exchange::Answered(r) => debug!("chnl=[{}] abort answered {}", self.id, escape_log(&r.text())),
                Exchange::Cancelled => {
                    self.awaiting.store(false, Ordering::Release);
                    return;
                }
                _ => debug!("chnl=[{}] abort not answered", self.id),
            },
            Err(e) => warn!("chnl=[{}] abort write failed: {}", self.id, e),
        }
        self.awaiting.store(false, Ordering::Release);

        match self.transact(PING_CMD, self.settings.ping_timeout) {
            Exchange::Answered(_) => debug!("chnl=[{}] modem answered ping", self.id),
            Exchange::TimedOut => {
                error!("chnl=[{}] ping timed out, modem unresponsive", self.id);
                self.request_reset(ResetReason::ModemUnresponsive { channel: self.id });
            }
            Exchange::Cancelled => return,
            Exchange::WriteFailed(e) => warn!("chnl=[{}] ping write failed: {}", self.id, e),
        }

        if count >= self.settings.max_consecutive_timeouts.max(1) {
            error!("chnl=[{}] {} consecutive timeouts, channel dead", self.id, count);
            self.consecutive_timeouts.store(0, Ordering::Release);
            self.request_reset(ResetReason::ChannelDead { channel: self.id });
        }
    }

    /// Deliver the result of `cmd`, record init progress and answer
    /// identical queued requests with the same result.
    fn finish(&self, cmd: Command, rsp: Response) {
        let request = cmd.request();
        let cmd1 = cmd.cmd1().map(str::to_owned);
        let coalesce = request.is_coalescable() && cmd1.is_some() && !cmd.is_init();
        let completion = self.complete(cmd, rsp);

        if !coalesce {
            return;
        }
        let Some(completion) = completion else {
            return;
        };
        loop {
            let same = |c: &Command| c.request() == request && c.cmd1() == cmd1.as_deref() && !c.is_init();
            match self.queue.conditional_get(same, Some(Duration::ZERO)) {
                Ok(dup) => {
                    metrics::inc_commands_coalesced();
                    debug!("chnl=[{}] {:?} answered from previous result", self.id, request);
                    if let Some(token) = dup.token_value() {
                        self.deps.host.on_complete(Completion {
                            token,
                            ..completion.clone()
                        });
                    }
                }
                Err(_) => break,
            }
        }
    }

    /// Send the completion for one command. Returns what was delivered so
    /// coalesced commands can share it.
    fn complete(&self, cmd: Command, mut rsp: Response) -> Option<Completion> {
        let result = rsp.result();
        if let Some(step) = cmd.init {
            if !result.is_success() {
                warn!("chnl=[{}] init command {:?} failed: {}", self.id, cmd.cmd1(), result);
                self.init_failed.store(true, Ordering::Release);
            }
            if step.is_final {
                let ok = !self.init_failed.swap(false, Ordering::AcqRel);
                let _ = self.init_tx.send(PhaseOutcome { phase: step.phase, ok });
            }
        }
        if result.is_success() {
            metrics::inc_commands_completed();
        } else {
            metrics::inc_commands_failed();
        }
        let token = cmd.token_value()?;
        let data = if result.is_success() { rsp.take_data() } else { None };
        let completion = Completion {
            token,
            request: cmd.request(),
            channel: self.id,
            result,
            error: rsp.error(),
            data,
        };
        trace!("chnl=[{}] complete {:?}", self.id, completion);
        self.deps.host.on_complete(completion.clone());
        Some(completion)
    }

    // ---- response thread ------------------------------------------------

    fn response_loop(self: Arc<Self>) {
        debug!("chnl=[{}] response thread up", self.id);
        let cancel = self.deps.cancel.clone();
        let mut pending = Response::new(self.id, self.settings.buffer_size);
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut errors = 0u32;
        loop {
            if !self.gate.wait_open(&cancel) {
                break;
            }
            match self.port.wait_for_data(&cancel, Some(POLL_INTERVAL)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(PortError::Cancelled) => break,
                Err(e) => {
                    if self.read_error(&mut errors, e) {
                        break;
                    }
                    continue;
                }
            }
            if self.gate.is_blocked() {
                continue;
            }
            match self.port.read(&mut chunk) {
                Ok(ReadOutcome::Data(n)) => {
                    errors = 0;
                    self.process_modem_data(&mut pending, &chunk[..n]);
                }
                Ok(ReadOutcome::WouldBlock) => {}
                Ok(ReadOutcome::Eof) => {
                    if !cancel.is_cancelled() {
                        error!("chnl=[{}] port {} closed", self.id, self.port.name());
                        self.request_reset(ResetReason::PortFailure { channel: self.id });
                    }
                    break;
                }
                Err(e) => {
                    if self.read_error(&mut errors, e) {
                        break;
                    }
                }
            }
        }
        debug!("chnl=[{}] response thread down", self.id);
    }

    /// Count a read failure. True when the thread should give up.
    fn read_error(&self, errors: &mut u32, e: PortError) -> bool {
        *errors += 1;
        warn!("chnl=[{}] read error {}/{}: {}", self.id, errors, MAX_READ_ERRORS, e);
        if *errors >= MAX_READ_ERRORS {
            self.request_reset(ResetReason::PortFailure { channel: self.id });
            return true;
        }
        false
    }

    fn process_modem_data(&self, pending: &mut Response, data: &[u8]) {
        if self.data_mode.load(Ordering::Acquire) {
            self.deps.host.on_raw_data(self.id, data);
            return;
        }
        trace!("chnl=[{}] read {}", self.id, escape_bytes(data));
        let mut rest = data;
        while !rest.is_empty() {
            if self.timed_out.load(Ordering::Acquire) {
                pending.set_corrupt(true);
            }
            let take = rest.len().min(pending.remaining_capacity());
            if take == 0 {
                self.overflow(pending);
                continue;
            }
            if let Err(e) = pending.append(&rest[..take]) {
                warn!("chnl=[{}] {}", self.id, e);
                self.overflow(pending);
                continue;
            }
            rest = &rest[take..];
            self.dispatch_complete(pending);
        }
    }

    fn overflow(&self, pending: &mut Response) {
        metrics::inc_buffer_overflows();
        error!(
            "chnl=[{}] response buffer full without terminator, dropping {} bytes",
            self.id,
            pending.len()
        );
        pending.clear();
        if self.awaiting.load(Ordering::Acquire) {
            let _ = self
                .solicited_tx
                .send(Response::failed(self.id, ResultCode::GenericFailure));
        }
    }

    fn dispatch_complete(&self, pending: &mut Response) {
        while pending.is_complete_response(&self.silos) {
            let Some(done) = pending.transfer_data() else {
                break;
            };
            self.timed_out.store(false, Ordering::Release);
            if done.is_unrecognized() {
                metrics::inc_corrupt_discarded();
                debug!("chnl=[{}] discarding {}", self.id, escape_log(&done.text()));
                continue;
            }
            if done.is_unsolicited() {
                metrics::inc_unsolicited();
                debug!("chnl=[{}] URC {}", self.id, escape_log(&done.text()));
                if let Some(n) = self.silos.parse_unsolicited(&done) {
                    self.deps.host.on_unsolicited(self.id, n);
                }
                continue;
            }
            if self.awaiting.load(Ordering::Acquire) {
                let _ = self.solicited_tx.send(done);
            } else {
                debug!("chnl=[{}] unexpected response {}", self.id, escape_log(&done.text()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Notification, RecordingSupervisor};
    use crate::silo::{factory, ModemFamily, SiloDeps};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct Collect {
        done: Mutex<Vec<Completion>>,
        urcs: Mutex<Vec<Notification>>,
        raw: Mutex<Vec<u8>>,
    }

    impl Host for Collect {
        fn on_complete(&self, c: Completion) {
            self.done.lock().unwrap().push(c);
        }
        fn on_unsolicited(&self, _channel: ChannelId, n: Notification) {
            self.urcs.lock().unwrap().push(n);
        }
        fn on_raw_data(&self, _channel: ChannelId, data: &[u8]) {
            self.raw.lock().unwrap().extend_from_slice(data);
        }
    }

    fn wait_until(f: impl Fn() -> bool) -> bool {
        let end = Instant::now() + Duration::from_secs(5);
        while Instant::now() < end {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn channel(kind: ChannelKind) -> (Channel, UnixStream, Arc<Collect>, Arc<RecordingSupervisor>) {
        channel_with_abort_wait(kind, Duration::from_millis(50))
    }

    fn channel_with_abort_wait(
        kind: ChannelKind,
        abort_wait: Duration,
    ) -> (Channel, UnixStream, Arc<Collect>, Arc<RecordingSupervisor>) {
        let (ours, modem) = UnixStream::pair().unwrap();
        let host = Arc::new(Collect::default());
        let sup = Arc::new(RecordingSupervisor::default());
        let deps = ChannelDeps {
            host: host.clone(),
            supervisor: sup.clone(),
            cancel: CancelEvent::new().unwrap(),
        };
        let silos = factory::build(
            kind,
            ModemFamily::Default,
            &SiloDeps {
                host: host.clone(),
                registry: None,
            },
        );
        let settings = ChannelSettings {
            default_timeout: Duration::from_millis(300),
            abort_wait,
            ping_timeout: Duration::from_millis(200),
            ..ChannelSettings::default()
        };
        let ch = Channel::new(
            ChannelId(0),
            kind,
            Port::from_stream("test", ours).unwrap(),
            silos,
            settings,
            deps,
        );
        (ch, modem, host, sup)
    }

    #[test]
    fn ordinary_commands_wait_for_ready() {
        let (ch, modem, host, _) = channel(ChannelKind::Dlc8);
        ch.start().unwrap();
        ch.enqueue(Command::new(Request::GetImei, "AT+CGSN\r").token(1)).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(host.done.lock().unwrap().is_empty());

        let mut reader = BufReader::new(modem.try_clone().unwrap());
        let mut w = modem;
        ch.set_ready();
        let mut line = Vec::new();
        reader.read_until(b'\r', &mut line).unwrap();
        assert_eq!(line, b"AT+CGSN\r");
        w.write_all(b"\r\n35693803564380\r\n\r\nOK\r\n").unwrap();
        assert!(wait_until(|| host.done.lock().unwrap().len() == 1));
        assert!(host.done.lock().unwrap()[0].result.is_success());
        ch.stop();
    }

    #[test]
    fn unsolicited_reaches_host_between_commands() {
        let (ch, mut modem, host, _) = channel(ChannelKind::Urc);
        ch.start().unwrap();
        ch.set_ready();
        modem.write_all(b"\r\n+CMTI: \"SM\",4\r\n").unwrap();
        assert!(wait_until(|| !host.urcs.lock().unwrap().is_empty()));
        assert_eq!(host.urcs.lock().unwrap()[0], Notification::NewSmsOnSim { index: 4 });
        ch.stop();
    }

    #[test]
    fn raw_data_mode_bypasses_classifier() {
        let (ch, mut modem, host, _) = channel(ChannelKind::Data);
        ch.start().unwrap();
        ch.set_ready();
        ch.set_data_mode(true);
        modem.write_all(b"\r\nOK\r\n\x7e\x01").unwrap();
        assert!(wait_until(|| host.raw.lock().unwrap().len() == 8));
        assert!(ch.status().data_mode);
        ch.stop();
    }

    #[test]
    fn eof_requests_reset() {
        let (ch, modem, _, sup) = channel(ChannelKind::Oem);
        ch.start().unwrap();
        drop(modem);
        assert!(wait_until(|| !sup.requests().is_empty()));
        assert_eq!(sup.requests()[0], ResetReason::PortFailure { channel: ChannelId(0) });
        ch.stop();
    }

    #[test]
    fn stop_cancels_queued_commands() {
        let (ch, _modem, host, _) = channel(ChannelKind::Sim);
        ch.start().unwrap();
        ch.enqueue(Command::new(Request::GetImsi, "AT+CIMI\r").token(5)).unwrap();
        ch.stop();
        let done = host.done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].result, ResultCode::Cancelled);
        assert_eq!(ch.state(), ChannelState::Closed);
    }

    #[test]
    fn overflow_fails_pending_command_early() {
        let (ch, modem, host, _) = channel(ChannelKind::Oem);
        ch.start().unwrap();
        ch.set_ready();
        ch.enqueue(
            Command::new(Request::OemHookRaw, "AT+XDUMP\r")
                .token(9)
                .timeout(Duration::from_secs(30)),
        )
        .unwrap();
        let mut r = modem.try_clone().unwrap();
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"AT+XDUMP\r");
        let mut w = modem;
        w.write_all(&vec![b'x'; DEFAULT_BUFFER_SIZE + 10]).unwrap();
        assert!(wait_until(|| host.done.lock().unwrap().len() == 1));
        assert_eq!(host.done.lock().unwrap()[0].result, ResultCode::GenericFailure);
        ch.stop();
    }

    #[test]
    fn stop_during_abort_leaves_nothing_in_flight() {
        let (ch, modem, host, _) = channel_with_abort_wait(ChannelKind::Oem, Duration::from_secs(10));
        ch.start().unwrap();
        ch.set_ready();
        ch.enqueue(
            Command::new(Request::OemHookRaw, "AT+XSLOW\r")
                .token(4)
                .timeout(Duration::from_millis(100)),
        )
        .unwrap();
        let mut reader = BufReader::new(modem);
        let mut line = Vec::new();
        reader.read_until(b'\r', &mut line).unwrap();
        assert_eq!(line, b"AT+XSLOW\r");
        line.clear();
        reader.read_until(b'\r', &mut line).unwrap();
        assert_eq!(line, ABORT_CMD);
        assert!(ch.status().in_flight);

        ch.stop();
        assert!(!ch.status().in_flight);
        assert_eq!(host.done.lock().unwrap().len(), 1);
    }
}
