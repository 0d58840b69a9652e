//! Per-channel command queue.
//!
//! Bounded FIFO with priority insertion. Producers block on a
//! "space available" condition variable and consumers on an
//! "item available" one; the process-wide [`CancelEvent`] wakes both.
//!
//! Priority puts land behind any priority items already queued, so two
//! priority commands keep their relative order while both overtake every
//! ordinary command still waiting.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::cancel::{CancelEvent, CancelListener};
use crate::command::Command;
use crate::error::QueueError;

/// A put that did not happen. The command is handed back so the caller can
/// still complete it.
#[derive(Debug)]
pub struct PutError {
    pub kind: QueueError,
    pub command: Command,
}

impl std::fmt::Display for PutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "put failed: {}", self.kind)
    }
}

impl std::error::Error for PutError {}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub high_water: usize,
    pub total_put: u64,
    pub total_priority_put: u64,
    pub total_get: u64,
    pub rejected_put: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Back,
    Priority,
    Init,
}

struct Inner {
    items: VecDeque<Command>,
    version: u64,
    stats: QueueStats,
}

pub struct CommandQueue {
    name: String,
    capacity: usize,
    inner: Mutex<Inner>,
    space_available: Condvar,
    item_available: Condvar,
    cancel: Arc<CancelEvent>,
}

impl CommandQueue {
    pub fn new(name: impl Into<String>, capacity: usize, cancel: Arc<CancelEvent>) -> Arc<Self> {
        let q = Arc::new(Self {
            name: name.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                version: 0,
                stats: QueueStats::default(),
            }),
            space_available: Condvar::new(),
            item_available: Condvar::new(),
            cancel,
        });
        let weak: Weak<dyn CancelListener> = Arc::downgrade(&q) as Weak<dyn CancelListener>;
        q.cancel.register(weak);
        q
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned queue still holds valid commands; keep serving them.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append at the tail, waiting up to `timeout` for space (`None` waits forever).
    pub fn put(&self, cmd: Command, timeout: Option<Duration>) -> Result<(), PutError> {
        self.insert(cmd, Placement::Back, timeout)
    }

    /// Insert ahead of every ordinary command, behind earlier priority ones.
    pub fn put_front(&self, cmd: Command, timeout: Option<Duration>) -> Result<(), PutError> {
        self.insert(cmd, Placement::Priority, timeout)
    }

    /// Insert behind earlier init commands but ahead of everything else, so
    /// an init-only consumer never finds an ordinary command at the head
    /// while init work is pending.
    pub fn put_init(&self, cmd: Command, timeout: Option<Duration>) -> Result<(), PutError> {
        self.insert(cmd, Placement::Init, timeout)
    }

    fn insert(&self, mut cmd: Command, placement: Placement, timeout: Option<Duration>) -> Result<(), PutError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if self.cancel.is_cancelled() {
                inner.stats.rejected_put += 1;
                return Err(PutError {
                    kind: QueueError::Cancelled,
                    command: cmd,
                });
            }
            if inner.items.len() < self.capacity {
                break;
            }
            inner = match self.wait(&self.space_available, inner, deadline) {
                Ok(g) => g,
                Err(mut g) => {
                    g.stats.rejected_put += 1;
                    warn!("queue {}: put timed out with {} queued", self.name, g.items.len());
                    return Err(PutError {
                        kind: QueueError::TimedOut,
                        command: cmd,
                    });
                }
            };
        }
        match placement {
            Placement::Back => inner.items.push_back(cmd),
            Placement::Priority => {
                cmd.high_priority = true;
                let pos = inner.items.iter().take_while(|c| c.high_priority).count();
                inner.items.insert(pos, cmd);
                inner.stats.total_priority_put += 1;
            }
            Placement::Init => {
                cmd.high_priority = true;
                let pos = inner.items.iter().take_while(|c| c.is_init()).count();
                inner.items.insert(pos, cmd);
                inner.stats.total_priority_put += 1;
            }
        }
        inner.stats.total_put += 1;
        inner.version = inner.version.wrapping_add(1);
        let depth = inner.items.len();
        inner.stats.depth = depth;
        if depth > inner.stats.high_water {
            inner.stats.high_water = depth;
        }
        trace!("queue {}: depth {}", self.name, depth);
        drop(inner);
        self.item_available.notify_all();
        Ok(())
    }

    /// Remove the head, waiting up to `timeout` for an item (`None` waits forever).
    pub fn get(&self, timeout: Option<Duration>) -> Result<Command, QueueError> {
        self.conditional_get(|_| true, timeout)
    }

    /// Remove the head without waiting.
    pub fn try_get(&self) -> Result<Command, QueueError> {
        let mut inner = self.lock();
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        self.pop_head(&mut inner).ok_or(QueueError::Empty)
    }

    /// Wait for an item, then remove the head only if `pred` accepts it.
    /// A rejected head stays queued and `NotSatisfied` is returned.
    pub fn conditional_get<P>(&self, pred: P, timeout: Option<Duration>) -> Result<Command, QueueError>
    where
        P: Fn(&Command) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if self.cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            if let Some(head) = inner.items.front() {
                if !pred(head) {
                    return Err(QueueError::NotSatisfied);
                }
                if let Some(cmd) = self.pop_head(&mut inner) {
                    return Ok(cmd);
                }
            }
            inner = self
                .wait(&self.item_available, inner, deadline)
                .map_err(|_| QueueError::TimedOut)?;
        }
    }

    fn pop_head(&self, inner: &mut Inner) -> Option<Command> {
        let cmd = inner.items.pop_front()?;
        inner.stats.total_get += 1;
        inner.stats.depth = inner.items.len();
        self.space_available.notify_one();
        Some(cmd)
    }

    /// Current change counter; bumps on every put and on [`poke`](Self::poke).
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Wake consumers so they re-evaluate their dequeue predicate.
    pub fn poke(&self) {
        let mut inner = self.lock();
        inner.version = inner.version.wrapping_add(1);
        drop(inner);
        self.item_available.notify_all();
    }

    /// Block until the change counter moves past `seen`.
    pub fn wait_for_change(&self, seen: u64, timeout: Option<Duration>) -> Result<(), QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if self.cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            if inner.version != seen {
                return Ok(());
            }
            inner = self
                .wait(&self.item_available, inner, deadline)
                .map_err(|_| QueueError::TimedOut)?;
        }
    }

    /// Remove every queued command.
    pub fn drain(&self) -> Vec<Command> {
        let mut inner = self.lock();
        let drained: Vec<Command> = inner.items.drain(..).collect();
        inner.stats.depth = 0;
        drop(inner);
        self.space_available.notify_all();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    /// Wait on `cv` until notified or `deadline` passes. `Err` carries the
    /// guard back on timeout.
    fn wait<'a>(
        &self,
        cv: &Condvar,
        guard: MutexGuard<'a, Inner>,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, Inner>, MutexGuard<'a, Inner>> {
        match deadline {
            None => Ok(cv.wait(guard).unwrap_or_else(|e| e.into_inner())),
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(guard);
                }
                let (g, _) = cv.wait_timeout(guard, d - now).unwrap_or_else(|e| e.into_inner());
                Ok(g)
            }
        }
    }
}

impl CancelListener for CommandQueue {
    fn on_cancel(&self) {
        let _guard = self.lock();
        self.space_available.notify_all();
        self.item_available.notify_all();
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;

    fn cmd(tag: u64) -> Command {
        Command::new(Request::Internal, format!("AT+T{}\r", tag)).token(tag)
    }

    fn queue(cap: usize) -> Arc<CommandQueue> {
        CommandQueue::new("test", cap, CancelEvent::new().unwrap())
    }

    #[test]
    fn fifo_order() {
        let q = queue(8);
        for i in 0..4 {
            q.put(cmd(i), None).unwrap();
        }
        let order: Vec<u64> = (0..4).map(|_| q.try_get().unwrap().token.unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(q.try_get().unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn priority_goes_ahead_but_keeps_its_own_order() {
        let q = queue(8);
        q.put(cmd(1), None).unwrap();
        q.put(cmd(2), None).unwrap();
        q.put_front(cmd(10), None).unwrap();
        q.put_front(cmd(11), None).unwrap();
        let order: Vec<u64> = (0..4).map(|_| q.try_get().unwrap().token.unwrap()).collect();
        assert_eq!(order, vec![10, 11, 1, 2]);
    }

    #[test]
    fn init_commands_overtake_priority_commands() {
        use crate::channel::InitPhase;
        use crate::command::InitStep;
        let q = queue(8);
        q.put_front(cmd(10), None).unwrap();
        let step = InitStep {
            phase: InitPhase::Basic,
            is_final: false,
        };
        q.put_init(Command::init_string("ATE0\r".into(), step, Duration::from_secs(1)), None)
            .unwrap();
        q.put_init(Command::init_string("AT+CMEE=1\r".into(), step, Duration::from_secs(1)), None)
            .unwrap();
        assert_eq!(q.try_get().unwrap().cmd1(), Some("ATE0\r"));
        assert_eq!(q.try_get().unwrap().cmd1(), Some("AT+CMEE=1\r"));
        assert_eq!(q.try_get().unwrap().token, Some(10));
    }

    #[test]
    fn get_times_out_on_empty_queue() {
        let q = queue(2);
        let start = Instant::now();
        assert_eq!(q.get(Some(Duration::from_millis(50))).unwrap_err(), QueueError::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn put_times_out_when_full_and_returns_command() {
        let q = queue(1);
        q.put(cmd(1), None).unwrap();
        let err = q.put(cmd(2), Some(Duration::from_millis(30))).unwrap_err();
        assert_eq!(err.kind, QueueError::TimedOut);
        assert_eq!(err.command.token, Some(2));
        assert_eq!(q.stats().rejected_put, 1);
    }

    #[test]
    fn conditional_get_leaves_rejected_head() {
        let q = queue(4);
        q.put(cmd(5), None).unwrap();
        assert_eq!(
            q.conditional_get(|c| c.is_init(), Some(Duration::from_millis(10))).unwrap_err(),
            QueueError::NotSatisfied
        );
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(None).unwrap().token, Some(5));
    }

    #[test]
    fn cancel_unblocks_waiting_consumer() {
        let ev = CancelEvent::new().unwrap();
        let q = CommandQueue::new("t", 2, ev.clone());
        let q2 = q.clone();
        let h = std::thread::spawn(move || q2.get(None));
        std::thread::sleep(Duration::from_millis(30));
        ev.cancel();
        assert_eq!(h.join().unwrap().unwrap_err(), QueueError::Cancelled);
    }

    #[test]
    fn blocked_producer_resumes_when_space_frees() {
        let q = queue(1);
        q.put(cmd(1), None).unwrap();
        let q2 = q.clone();
        let h = std::thread::spawn(move || q2.put(cmd(2), Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(q.get(None).unwrap().token, Some(1));
        h.join().unwrap().unwrap();
        assert_eq!(q.get(None).unwrap().token, Some(2));
    }

    #[test]
    fn poke_wakes_change_waiter() {
        let q = queue(1);
        let seen = q.version();
        let q2 = q.clone();
        let h = std::thread::spawn(move || q2.wait_for_change(seen, Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        q.poke();
        h.join().unwrap().unwrap();
    }
}
