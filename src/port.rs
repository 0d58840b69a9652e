//! Duplex byte link to the modem: a mux tty or a domain socket.
//!
//! The descriptor is non-blocking. Readers park in [`Port::wait_for_data`],
//! which polls the link together with the cancellation pipe so shutdown
//! wakes every waiter. Reads and writes take `&self`; the command thread
//! writes while the response thread reads.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::cancel::CancelEvent;
use crate::error::PortError;
use crate::logutil::escape_log;

/// Handshake written to a socket link before use.
const SOCKET_HELLO: &[u8] = b"gsm";
const SOCKET_ACK_LEN: usize = 10;
const WRITE_RETRY_WAIT: Duration = Duration::from_millis(100);

/// How to reach one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    pub path: String,
    pub socket: bool,
    pub baud: u32,
    pub open_retries: u32,
    pub open_interval: Duration,
    pub write_retries: u32,
}

impl PortSettings {
    pub fn tty(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            socket: false,
            baud: 115_200,
            open_retries: 30,
            open_interval: Duration::from_millis(1000),
            write_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written(usize),
    /// The peer closed the link (EPIPE / ECONNRESET). Not an error: the
    /// link was taken down deliberately, e.g. by a modem reset.
    LinkClosed,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    Tty,
    Socket,
}

pub struct Port {
    name: String,
    fd: OwnedFd,
    kind: LinkKind,
    write_retries: u32,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(feature = "serial")]
fn open_tty(path: &str, baud: u32) -> Result<OwnedFd, PortError> {
    use std::os::fd::{FromRawFd, IntoRawFd};
    let tty = serialport::new(path, baud)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .open_native()?;
    let raw = tty.into_raw_fd();
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    set_nonblocking(fd.as_raw_fd())?;
    Ok(fd)
}

#[cfg(not(feature = "serial"))]
fn open_tty(path: &str, _baud: u32) -> Result<OwnedFd, PortError> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)?;
    Ok(OwnedFd::from(file))
}

fn open_socket(path: &str) -> Result<OwnedFd, PortError> {
    let mut stream = UnixStream::connect(path)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(SOCKET_HELLO)?;
    let mut ack = [0u8; SOCKET_ACK_LEN];
    let n = stream.read(&mut ack).map_err(|e| PortError::Handshake {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    if n == 0 {
        return Err(PortError::Handshake {
            path: path.to_string(),
            reason: "closed before acknowledging".into(),
        });
    }
    debug!("socket {} acknowledged with {}", path, escape_log(&String::from_utf8_lossy(&ack[..n])));
    stream.set_read_timeout(None)?;
    stream.set_nonblocking(true)?;
    Ok(OwnedFd::from(stream))
}

impl Port {
    /// Open `settings.path`, retrying until the attempts run out or `cancel` fires.
    pub fn open(settings: &PortSettings, cancel: &CancelEvent) -> Result<Port, PortError> {
        let attempts = settings.open_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let opened = if settings.socket {
                open_socket(&settings.path)
            } else {
                open_tty(&settings.path, settings.baud)
            };
            match opened {
                Ok(fd) => {
                    info!("opened {} (attempt {})", settings.path, attempt);
                    return Ok(Port {
                        name: settings.path.clone(),
                        fd,
                        kind: if settings.socket { LinkKind::Socket } else { LinkKind::Tty },
                        write_retries: settings.write_retries,
                    });
                }
                Err(e) => {
                    debug!("open {} attempt {}/{} failed: {}", settings.path, attempt, attempts, e);
                    last_err = Some(e);
                }
            }
            if attempt < attempts && cancel.sleep(settings.open_interval) {
                return Err(PortError::Cancelled);
            }
        }
        let source = match last_err {
            Some(PortError::Io(e)) => e,
            Some(other) => io::Error::new(io::ErrorKind::Other, other.to_string()),
            None => io::Error::new(io::ErrorKind::NotFound, "no attempt made"),
        };
        Err(PortError::Open {
            path: settings.path.clone(),
            attempts,
            source,
        })
    }

    /// Wrap an already connected stream. No handshake is performed.
    pub fn from_stream(name: impl Into<String>, stream: UnixStream) -> io::Result<Port> {
        stream.set_nonblocking(true)?;
        Ok(Port {
            name: name.into(),
            fd: OwnedFd::from(stream),
            kind: LinkKind::Socket,
            write_retries: 10,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_tty(&self) -> bool {
        self.kind == LinkKind::Tty
    }

    /// Block until the link is readable, `timeout` passes (`Ok(false)`) or
    /// `cancel` fires.
    pub fn wait_for_data(&self, cancel: &CancelEvent, timeout: Option<Duration>) -> Result<bool, PortError> {
        let timeout_ms: libc::c_int = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        loop {
            if cancel.is_cancelled() {
                return Err(PortError::Cancelled);
            }
            let mut fds = [
                libc::pollfd {
                    fd: self.fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: cancel.wake_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if fds[1].revents != 0 || cancel.is_cancelled() {
                return Err(PortError::Cancelled);
            }
            if rc == 0 {
                return Ok(false);
            }
            // HUP/ERR also count: the following read reports EOF or the error.
            return Ok(fds[0].revents != 0);
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, PortError> {
        loop {
            let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                trace!("{} rx {}", self.name, escape_log(&String::from_utf8_lossy(&buf[..n as usize])));
                return Ok(ReadOutcome::Data(n as usize));
            }
            if n == 0 {
                return Ok(ReadOutcome::Eof);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
                _ => return Err(err.into()),
            }
        }
    }

    /// Write all of `data`, retrying on EAGAIN a bounded number of times.
    pub fn write(&self, data: &[u8]) -> Result<WriteStatus, PortError> {
        let mut written = 0;
        let mut retries = 0;
        while written < data.len() {
            let rest = &data[written..];
            let n = self.write_some(rest);
            if n >= 0 {
                written += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    retries += 1;
                    if retries > self.write_retries {
                        return Err(PortError::WriteExhausted { attempts: retries - 1 });
                    }
                    self.wait_writable(WRITE_RETRY_WAIT);
                }
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                    warn!("{} closed by peer during write", self.name);
                    return Ok(WriteStatus::LinkClosed);
                }
                _ => return Err(err.into()),
            }
        }
        Ok(WriteStatus::Written(written))
    }

    /// Sockets are written with `send` so a closed peer yields EPIPE
    /// instead of SIGPIPE in a host that has not ignored the signal.
    fn write_some(&self, data: &[u8]) -> isize {
        let fd = self.fd.as_raw_fd();
        match self.kind {
            LinkKind::Socket => unsafe { libc::send(fd, data.as_ptr().cast(), data.len(), SEND_FLAGS) },
            LinkKind::Tty => unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) },
        }
    }

    fn wait_writable(&self, wait: Duration) {
        let mut fds = [libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        }];
        unsafe { libc::poll(fds.as_mut_ptr(), 1, wait.as_millis() as libc::c_int) };
    }
}

impl AsRawFd for Port {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn reads_what_the_peer_wrote() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let port = Port::from_stream("pair", a).unwrap();
        let cancel = CancelEvent::new().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(port.read(&mut buf).unwrap(), ReadOutcome::WouldBlock);
        b.write_all(b"\r\nOK\r\n").unwrap();
        assert!(port.wait_for_data(&cancel, Some(Duration::from_secs(1))).unwrap());
        assert_eq!(port.read(&mut buf).unwrap(), ReadOutcome::Data(6));
        drop(b);
        assert!(port.wait_for_data(&cancel, Some(Duration::from_secs(1))).unwrap());
        assert_eq!(port.read(&mut buf).unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn writes_reach_the_peer() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let port = Port::from_stream("pair", a).unwrap();
        assert_eq!(port.write(b"AT\r").unwrap(), WriteStatus::Written(3));
        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"AT\r");
    }

    #[test]
    fn write_to_closed_peer_is_not_an_error() {
        let (a, b) = UnixStream::pair().unwrap();
        let port = Port::from_stream("pair", a).unwrap();
        drop(b);
        assert_eq!(port.write(b"AT\r").unwrap(), WriteStatus::LinkClosed);
    }

    #[test]
    fn cancel_wakes_waiter() {
        let (a, _b) = UnixStream::pair().unwrap();
        let port = Port::from_stream("pair", a).unwrap();
        let cancel = CancelEvent::new().unwrap();
        let c = cancel.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            c.cancel();
        });
        assert!(matches!(port.wait_for_data(&cancel, None), Err(PortError::Cancelled)));
        t.join().unwrap();
    }

    #[test]
    fn wait_times_out() {
        let (a, _b) = UnixStream::pair().unwrap();
        let port = Port::from_stream("pair", a).unwrap();
        let cancel = CancelEvent::new().unwrap();
        assert!(!port.wait_for_data(&cancel, Some(Duration::from_millis(20))).unwrap());
    }

    #[test]
    fn socket_handshake_and_open_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gsm.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut hello = [0u8; 3];
            s.read_exact(&mut hello).unwrap();
            assert_eq!(&hello, b"gsm");
            s.write_all(b"OK").unwrap();
        });
        let mut settings = PortSettings::tty(path.to_string_lossy().into_owned());
        settings.socket = true;
        let cancel = CancelEvent::new().unwrap();
        let port = Port::open(&settings, &cancel).unwrap();
        assert!(!port.is_tty());
        server.join().unwrap();

        let mut missing = PortSettings::tty(dir.path().join("nope").to_string_lossy().into_owned());
        missing.socket = true;
        missing.open_retries = 2;
        missing.open_interval = Duration::from_millis(5);
        match Port::open(&missing, &cancel) {
            Err(PortError::Open { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}
