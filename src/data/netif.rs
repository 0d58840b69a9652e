//! Network interface control for PDP contexts.
//!
//! Mux data channels are switched into network mode with the n_gsm
//! `GSMIOC_ENABLE_NET` ioctl on the channel's tty; the kernel then exposes a
//! network interface that is configured with the usual socket ioctls.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;
use std::sync::Mutex;

/// Operations the data path needs from the OS.
pub trait NetIf: Send + Sync {
    /// Switch a mux channel into network mode, creating `iface`.
    fn enable_mux_net(&self, port_fd: RawFd, iface: &str) -> io::Result<()>;
    fn disable_mux_net(&self, port_fd: RawFd) -> io::Result<()>;
    fn set_link(&self, iface: &str, up: bool) -> io::Result<()>;
    fn set_ipv4(&self, iface: &str, addr: Ipv4Addr) -> io::Result<()>;
    fn set_ipv6(&self, iface: &str, addr: Ipv6Addr, prefix_len: u32) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
pub use linux::LinuxNetIf;

#[cfg(target_os = "linux")]
mod linux {
    use super::NetIf;
    use libc::{c_char, c_short, c_ulong};
    use std::io;
    use std::ffi::CString;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    const GSMIOC_ENABLE_NET: c_ulong = 0x4034_4702;
    const GSMIOC_DISABLE_NET: c_ulong = 0x4703;
    /// Adaption 3: IP packets carried directly in the DLC.
    const GSM_NET_ADAPTION: u32 = 3;

    #[repr(C)]
    struct GsmNetConfig {
        adaption: u32,
        protocol: u16,
        unused2: u16,
        if_name: [c_char; libc::IFNAMSIZ],
        unused: [u8; 28],
    }

    #[repr(C)]
    struct IfReqFlags {
        name: [c_char; libc::IFNAMSIZ],
        flags: c_short,
        pad: [u8; 22],
    }

    #[repr(C)]
    struct IfReqAddr {
        name: [c_char; libc::IFNAMSIZ],
        addr: libc::sockaddr_in,
        pad: [u8; 8],
    }

    /// `struct in6_ifreq` from linux/ipv6.h.
    #[repr(C)]
    struct In6IfReq {
        addr: libc::in6_addr,
        prefix_len: u32,
        ifindex: libc::c_int,
    }

    fn if_index(iface: &str) -> io::Result<libc::c_int> {
        let name = CString::new(iface).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        match unsafe { libc::if_nametoindex(name.as_ptr()) } {
            0 => Err(io::Error::last_os_error()),
            idx => Ok(idx as libc::c_int),
        }
    }

    fn if_name(iface: &str) -> io::Result<[c_char; libc::IFNAMSIZ]> {
        let bytes = iface.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name {:?}", iface),
            ));
        }
        let mut name = [0 as c_char; libc::IFNAMSIZ];
        for (dst, src) in name.iter_mut().zip(bytes) {
            *dst = *src as c_char;
        }
        Ok(name)
    }

    fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc)
        }
    }

    fn control_socket(domain: libc::c_int) -> io::Result<OwnedFd> {
        let fd = check(unsafe { libc::socket(domain, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) })?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Kernel-backed implementation.
    #[derive(Debug, Default)]
    pub struct LinuxNetIf;

    impl NetIf for LinuxNetIf {
        fn enable_mux_net(&self, port_fd: RawFd, iface: &str) -> io::Result<()> {
            let mut cfg = GsmNetConfig {
                adaption: GSM_NET_ADAPTION,
                protocol: (libc::ETH_P_IP as u16).to_be(),
                unused2: 0,
                if_name: if_name(iface)?,
                unused: [0; 28],
            };
            check(unsafe { libc::ioctl(port_fd, GSMIOC_ENABLE_NET as _, &mut cfg as *mut GsmNetConfig) })?;
            Ok(())
        }

        fn disable_mux_net(&self, port_fd: RawFd) -> io::Result<()> {
            check(unsafe { libc::ioctl(port_fd, GSMIOC_DISABLE_NET as _) })?;
            Ok(())
        }

        fn set_link(&self, iface: &str, up: bool) -> io::Result<()> {
            let sock = control_socket(libc::AF_INET)?;
            let mut req = IfReqFlags {
                name: if_name(iface)?,
                flags: 0,
                pad: [0; 22],
            };
            check(unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut req as *mut IfReqFlags) })?;
            if up {
                req.flags |= libc::IFF_UP as c_short;
            } else {
                req.flags &= !(libc::IFF_UP as c_short);
            }
            check(unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &mut req as *mut IfReqFlags) })?;
            Ok(())
        }

        fn set_ipv4(&self, iface: &str, addr: Ipv4Addr) -> io::Result<()> {
            let sock = control_socket(libc::AF_INET)?;
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_addr.s_addr = u32::from(addr).to_be();
            let mut req = IfReqAddr {
                name: if_name(iface)?,
                addr: sin,
                pad: [0; 8],
            };
            check(unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFADDR as _, &mut req as *mut IfReqAddr) })?;
            Ok(())
        }

        fn set_ipv6(&self, iface: &str, addr: Ipv6Addr, prefix_len: u32) -> io::Result<()> {
            if_name(iface)?;
            let sock = control_socket(libc::AF_INET6)?;
            let mut req = In6IfReq {
                addr: libc::in6_addr { s6_addr: addr.octets() },
                prefix_len,
                ifindex: if_index(iface)?,
            };
            check(unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFADDR as _, &mut req as *mut In6IfReq) })?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn netconfig_matches_kernel_layout() {
            // _IOW('G', 2, struct gsm_netconfig) encodes the struct size.
            assert_eq!(mem::size_of::<GsmNetConfig>(), 0x34);
            assert_eq!(mem::size_of::<IfReqFlags>(), 40);
            assert_eq!(mem::size_of::<IfReqAddr>(), 40);
            assert_eq!(mem::size_of::<In6IfReq>(), 24);
        }

        #[test]
        fn rejects_bad_interface_names() {
            assert!(if_name("").is_err());
            assert!(if_name("averyveryverylongname").is_err());
            assert!(if_name("rmnet0").is_ok());
        }
    }
}

/// One recorded [`NetIf`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetIfCall {
    EnableMuxNet { iface: String },
    DisableMuxNet,
    SetLink { iface: String, up: bool },
    SetIpv4 { iface: String, addr: Ipv4Addr },
    SetIpv6 { iface: String, addr: Ipv6Addr, prefix_len: u32 },
}

/// In-memory [`NetIf`] that records calls; for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingNetIf {
    calls: Mutex<Vec<NetIfCall>>,
    fail_enable: bool,
}

impl RecordingNetIf {
    /// A double whose `enable_mux_net` always fails.
    pub fn failing_enable() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_enable: true,
        }
    }

    pub fn calls(&self) -> Vec<NetIfCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: NetIfCall) {
        if let Ok(mut c) = self.calls.lock() {
            c.push(call);
        }
    }
}

impl NetIf for RecordingNetIf {
    fn enable_mux_net(&self, _port_fd: RawFd, iface: &str) -> io::Result<()> {
        self.record(NetIfCall::EnableMuxNet { iface: iface.to_string() });
        if self.fail_enable {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }
        Ok(())
    }

    fn disable_mux_net(&self, _port_fd: RawFd) -> io::Result<()> {
        self.record(NetIfCall::DisableMuxNet);
        Ok(())
    }

    fn set_link(&self, iface: &str, up: bool) -> io::Result<()> {
        self.record(NetIfCall::SetLink {
            iface: iface.to_string(),
            up,
        });
        Ok(())
    }

    fn set_ipv4(&self, iface: &str, addr: Ipv4Addr) -> io::Result<()> {
        self.record(NetIfCall::SetIpv4 {
            iface: iface.to_string(),
            addr,
        });
        Ok(())
    }

    fn set_ipv6(&self, iface: &str, addr: Ipv6Addr, prefix_len: u32) -> io::Result<()> {
        self.record(NetIfCall::SetIpv6 {
            iface: iface.to_string(),
            addr,
            prefix_len,
        });
        Ok(())
    }
}
