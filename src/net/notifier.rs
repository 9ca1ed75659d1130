//! Change notification for addresses and routes.
//!
//! [`IpNotifier::wait`] is a single-shot wait: it completes at the next
//! address or link change and must be called again to arm the next one. On
//! Linux the notifier subscribes a netlink socket to the address and link
//! multicast groups on a background thread; on other platforms every wait
//! completes immediately with an "unsupported" error.

use std::io;

/// Watches the host's addresses and routes for changes.
pub struct IpNotifier {
    backend: Backend,
}

enum Backend {
    #[cfg(target_os = "linux")]
    Netlink(linux::NetlinkNotifier),
    Unsupported,
}

impl IpNotifier {
    /// Creates a notifier with the best backend the platform has.
    pub fn new() -> Self {
        #[cfg(target_os = "linux")]
        {
            match linux::NetlinkNotifier::new() {
                Ok(notifier) => {
                    return Self { backend: Backend::Netlink(notifier) }
                }
                Err(e) => {
                    log::warn!(
                        "Netlink notifier unavailable, address changes \
                         will not be detected: {}",
                        e
                    );
                }
            }
        }
        Self { backend: Backend::Unsupported }
    }

    /// Completes at the next address/link change. One completion per call;
    /// re-arm by calling again.
    pub async fn wait(&mut self) -> io::Result<()> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Netlink(notifier) => notifier.wait().await,
            Backend::Unsupported => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ip change notification is not supported on this platform",
            )),
        }
    }
}

impl Default for IpNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::{
        collections::HashMap,
        io,
        mem,
        net::IpAddr,
        os::unix::io::RawFd,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use nix::sys::socket::{
        bind, recv, setsockopt, socket, sockopt, AddressFamily, MsgFlags,
        NetlinkAddr, SockAddr, SockFlag, SockProtocol, SockType,
    };
    use nix::sys::time::{TimeVal, TimeValLike};
    use tokio::sync::mpsc;

    use crate::{
        disk::file::nix_to_io,
        net::route::{align4, read_at, NlMsgHdr, RtAttr},
    };

    const RTM_NEWLINK: u16 = 16;
    const RTM_NEWADDR: u16 = 20;
    const RTM_DELADDR: u16 = 21;
    const IFA_LOCAL: u16 = 2;
    const IFA_ADDRESS: u16 = 1;

    const RTMGRP_LINK: u32 = 0x1;
    const RTMGRP_IPV4_IFADDR: u32 = 0x10;
    const RTMGRP_IPV6_IFADDR: u32 = 0x100;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct IfAddrMsg {
        ifa_family: u8,
        ifa_prefixlen: u8,
        ifa_flags: u8,
        ifa_scope: u8,
        ifa_index: u32,
    }

    pub(super) struct NetlinkNotifier {
        events: mpsc::UnboundedReceiver<io::Result<()>>,
        stop: Arc<AtomicBool>,
    }

    impl NetlinkNotifier {
        pub fn new() -> io::Result<Self> {
            let fd: RawFd = socket(
                AddressFamily::Netlink,
                SockType::Raw,
                SockFlag::SOCK_CLOEXEC,
                SockProtocol::NetlinkRoute,
            )
            .map_err(nix_to_io)?;
            let groups =
                RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR;
            if let Err(e) =
                bind(fd, &SockAddr::Netlink(NetlinkAddr::new(0, groups)))
            {
                let _ = nix::unistd::close(fd);
                return Err(nix_to_io(e));
            }
            // wake periodically so a dropped notifier can stop the thread
            let _ = setsockopt(
                fd,
                sockopt::ReceiveTimeout,
                &TimeVal::seconds(1),
            );

            let stop = Arc::new(AtomicBool::new(false));
            let (tx, events) = mpsc::unbounded_channel();
            {
                let stop = Arc::clone(&stop);
                std::thread::Builder::new()
                    .name("ip-notifier".into())
                    .spawn(move || listen_loop(fd, tx, stop))
                    .map_err(|e| {
                        io::Error::new(io::ErrorKind::Other, e)
                    })?;
            }
            Ok(Self { events, stop })
        }

        pub async fn wait(&mut self) -> io::Result<()> {
            match self.events.recv().await {
                Some(result) => result,
                None => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "ip notifier thread exited",
                )),
            }
        }
    }

    impl Drop for NetlinkNotifier {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
        }
    }

    fn listen_loop(
        fd: RawFd,
        tx: mpsc::UnboundedSender<io::Result<()>>,
        stop: Arc<AtomicBool>,
    ) {
        // the last address each interface advertised, to suppress the
        // kernel's periodic re-announcements that carry no actual change
        let mut last_addr: HashMap<u32, IpAddr> = HashMap::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            if stop.load(Ordering::Relaxed) || tx.is_closed() {
                break;
            }
            let n = match recv(fd, &mut buf, MsgFlags::empty()) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let errno = e.as_errno();
                    if errno == Some(nix::errno::Errno::EAGAIN)
                        || errno == Some(nix::errno::Errno::EINTR)
                    {
                        continue;
                    }
                    let _ = tx.send(Err(nix_to_io(e)));
                    break;
                }
            };
            if process_messages(&buf[..n], &mut last_addr) {
                if tx.send(Ok(())).is_err() {
                    break;
                }
            }
        }
        let _ = nix::unistd::close(fd);
    }

    /// Walks one datagram of netlink messages; true if any of them
    /// represents an actual change worth waking the caller for.
    fn process_messages(
        buf: &[u8],
        last_addr: &mut HashMap<u32, IpAddr>,
    ) -> bool {
        let mut relevant = false;
        let mut at = 0;
        while let Some(hdr) = read_at::<NlMsgHdr>(buf, at) {
            let len = hdr.nlmsg_len as usize;
            if len < mem::size_of::<NlMsgHdr>() || at + len > buf.len() {
                break;
            }
            let body = &buf[at + mem::size_of::<NlMsgHdr>()..at + len];
            match hdr.nlmsg_type {
                RTM_NEWADDR => {
                    if new_addr_changes(body, last_addr) {
                        relevant = true;
                    }
                }
                RTM_DELADDR | RTM_NEWLINK => relevant = true,
                _ => {}
            }
            at += align4(len);
        }
        relevant
    }

    /// True if the address announcement differs from what the interface
    /// last advertised.
    fn new_addr_changes(
        body: &[u8],
        last_addr: &mut HashMap<u32, IpAddr>,
    ) -> bool {
        let ifa: IfAddrMsg = match read_at(body, 0) {
            Some(ifa) => ifa,
            None => return true,
        };
        let mut at = align4(mem::size_of::<IfAddrMsg>());
        let mut addr = None;
        while let Some(attr) = read_at::<RtAttr>(body, at) {
            let len = attr.rta_len as usize;
            if len < mem::size_of::<RtAttr>() || at + len > body.len() {
                break;
            }
            if attr.rta_type == IFA_LOCAL || attr.rta_type == IFA_ADDRESS {
                let payload = &body[at + mem::size_of::<RtAttr>()..at + len];
                addr = match payload.len() {
                    4 => {
                        let mut octets = [0u8; 4];
                        octets.copy_from_slice(payload);
                        Some(IpAddr::from(octets))
                    }
                    16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(payload);
                        Some(IpAddr::from(octets))
                    }
                    _ => None,
                };
                if attr.rta_type == IFA_LOCAL {
                    break;
                }
            }
            at += align4(len);
        }

        match addr {
            Some(addr) => {
                last_addr.insert(ifa.ifa_index, addr) != Some(addr)
            }
            // no address attribute: treat as a change to be safe
            None => true,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn addr_msg(index: u32, addr: [u8; 4]) -> Vec<u8> {
            let mut body = vec![0u8; mem::size_of::<IfAddrMsg>()];
            body[0] = libc::AF_INET as u8;
            body[4..8].copy_from_slice(&index.to_ne_bytes());
            let len = (mem::size_of::<RtAttr>() + 4) as u16;
            body.extend_from_slice(&len.to_ne_bytes());
            body.extend_from_slice(&IFA_LOCAL.to_ne_bytes());
            body.extend_from_slice(&addr);
            body
        }

        #[test]
        fn test_redundant_announcements_suppressed() {
            let mut last = HashMap::new();
            let msg = addr_msg(2, [192, 168, 1, 5]);
            assert!(new_addr_changes(&msg, &mut last));
            // the same address again is not a change
            assert!(!new_addr_changes(&msg, &mut last));
            // a different address is
            let msg2 = addr_msg(2, [192, 168, 1, 9]);
            assert!(new_addr_changes(&msg2, &mut last));
            // another interface tracks independently
            let msg3 = addr_msg(3, [10, 0, 0, 1]);
            assert!(new_addr_changes(&msg3, &mut last));
        }
    }
}
