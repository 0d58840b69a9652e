//! Process-wide cancellation event.
//!
//! One [`CancelEvent`] is shared by every queue, port wait and channel
//! thread. Firing it wakes condition-variable waiters (through registered
//! [`CancelListener`]s), poll-based port waits (through a self-pipe that
//! turns readable) and crossbeam selects (through a receiver whose sender is
//! dropped).

use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Something blocked on a condition variable that must be woken on shutdown.
pub trait CancelListener: Send + Sync {
    fn on_cancel(&self);
}

pub struct CancelEvent {
    fired: AtomicBool,
    pipe_rd: OwnedFd,
    pipe_wr: OwnedFd,
    closer: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
    listeners: Mutex<Vec<Weak<dyn CancelListener>>>,
}

impl CancelEvent {
    pub fn new() -> io::Result<Arc<Self>> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds is a valid two-element array for pipe2 to fill.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded so both descriptors are open and owned by us.
        let (pipe_rd, pipe_wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        let (tx, rx) = crossbeam_channel::bounded(0);
        Ok(Arc::new(Self {
            fired: AtomicBool::new(false),
            pipe_rd,
            pipe_wr,
            closer: Mutex::new(Some(tx)),
            rx,
            listeners: Mutex::new(Vec::new()),
        }))
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Fire the event. Idempotent.
    pub fn cancel(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        // The pipe is never drained, so every later poll sees it readable.
        let byte = [1u8];
        // SAFETY: writing one byte from a valid buffer to our own pipe.
        let _ = unsafe { libc::write(self.pipe_wr.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if let Ok(mut closer) = self.closer.lock() {
            closer.take();
        }
        let listeners = match self.listeners.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for l in listeners.iter().filter_map(Weak::upgrade) {
            l.on_cancel();
        }
    }

    pub fn register(&self, listener: Weak<dyn CancelListener>) {
        if self.is_cancelled() {
            if let Some(l) = listener.upgrade() {
                l.on_cancel();
            }
            return;
        }
        if let Ok(mut guard) = self.listeners.lock() {
            guard.retain(|w| w.strong_count() > 0);
            guard.push(listener);
        }
    }

    /// Read end of the wake pipe, for inclusion in a `poll` set.
    pub fn wake_fd(&self) -> RawFd {
        self.pipe_rd.as_raw_fd()
    }

    /// Receiver that disconnects once the event fires.
    pub fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }

    /// Sleep for `dur` unless cancelled first. Returns true when cancelled.
    pub fn sleep(&self, dur: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.rx.recv_timeout(dur) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => self.is_cancelled(),
            _ => true,
        }
    }
}

impl std::fmt::Debug for CancelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelEvent")
            .field("fired", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Counter(AtomicUsize);
    impl CancelListener for Counter {
        fn on_cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_wakes_listeners_once() {
        let ev = CancelEvent::new().unwrap();
        let c = Arc::new(Counter(AtomicUsize::new(0)));
        let weak: Weak<dyn CancelListener> = Arc::downgrade(&c) as Weak<dyn CancelListener>;
        ev.register(weak);
        ev.cancel();
        ev.cancel();
        assert_eq!(c.0.load(Ordering::SeqCst), 1);
        assert!(ev.is_cancelled());
    }

    #[test]
    fn late_registration_fires_immediately() {
        let ev = CancelEvent::new().unwrap();
        ev.cancel();
        let c = Arc::new(Counter(AtomicUsize::new(0)));
        ev.register(Arc::downgrade(&c) as Weak<dyn CancelListener>);
        assert_eq!(c.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sleep_returns_early_on_cancel() {
        let ev = CancelEvent::new().unwrap();
        let ev2 = ev.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            ev2.cancel();
        });
        let start = Instant::now();
        assert!(ev.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(2));
        t.join().unwrap();
    }
}
