//! Routing table enumeration over a netlink route socket.
//!
//! A single `RTM_GETROUTE` dump request is sent and the multipart reply is
//! walked message by message. Only Linux speaks netlink; other platforms
//! get an empty table, which callers treat as "no routes known".

#[cfg(target_os = "linux")]
pub use linux::enumerate_routes;

#[cfg(target_os = "linux")]
pub(crate) use linux::{
    align4, read_at, NlMsgHdr, RtAttr, NLMSG_DONE, NLMSG_ERROR,
};

#[cfg(not(target_os = "linux"))]
pub fn enumerate_routes() -> std::io::Result<Vec<super::IpRoute>> {
    Ok(Vec::new())
}

#[cfg(target_os = "linux")]
mod linux {
    use std::{
        io,
        mem,
        net::IpAddr,
        os::unix::io::RawFd,
    };

    use nix::sys::socket::{
        bind, recv, send, socket, AddressFamily, MsgFlags, NetlinkAddr,
        SockAddr, SockFlag, SockProtocol, SockType,
    };

    use crate::{
        disk::file::nix_to_io,
        net::{build_netmask, Family, IpRoute},
    };

    // netlink message and attribute framing, as described in rtnetlink(7)
    pub(crate) const NLMSG_DONE: u16 = 3;
    pub(crate) const NLMSG_ERROR: u16 = 2;
    const RTM_NEWROUTE: u16 = 24;
    const RTM_GETROUTE: u16 = 26;
    const NLM_F_REQUEST: u16 = 0x1;
    const NLM_F_DUMP: u16 = 0x300;

    const RTA_DST: u16 = 1;
    const RTA_OIF: u16 = 4;
    const RTA_GATEWAY: u16 = 5;
    const RTA_PREFSRC: u16 = 7;
    const RTA_METRICS: u16 = 8;
    const RTAX_MTU: u16 = 2;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub(crate) struct NlMsgHdr {
        pub nlmsg_len: u32,
        pub nlmsg_type: u16,
        pub nlmsg_flags: u16,
        pub nlmsg_seq: u32,
        pub nlmsg_pid: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct RtMsg {
        rtm_family: u8,
        rtm_dst_len: u8,
        rtm_src_len: u8,
        rtm_tos: u8,
        rtm_table: u8,
        rtm_protocol: u8,
        rtm_scope: u8,
        rtm_type: u8,
        rtm_flags: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub(crate) struct RtAttr {
        pub rta_len: u16,
        pub rta_type: u16,
    }

    pub(crate) const fn align4(len: usize) -> usize {
        (len + 3) & !3
    }

    /// Reads a header struct out of a byte buffer at `at`.
    ///
    /// # Safety-free by construction
    ///
    /// The caller checks that `at + size_of::<T>()` is in bounds; all the
    /// framing types are plain bytes with no invalid representations.
    pub(crate) fn read_at<T: Copy>(buf: &[u8], at: usize) -> Option<T> {
        if at + mem::size_of::<T>() > buf.len() {
            return None;
        }
        Some(unsafe {
            std::ptr::read_unaligned(buf.as_ptr().add(at) as *const T)
        })
    }

    fn parse_addr(payload: &[u8]) -> Option<IpAddr> {
        match payload.len() {
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
        }
    }

    fn interface_name(index: u32) -> String {
        let mut buf = [0u8; libc::IF_NAMESIZE];
        let name = unsafe {
            libc::if_indextoname(index, buf.as_mut_ptr() as *mut libc::c_char)
        };
        if name.is_null() {
            return String::new();
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    /// Walks the attributes of one route message into an [`IpRoute`].
    fn parse_route(buf: &[u8]) -> Option<IpRoute> {
        let rtm: RtMsg = read_at(buf, 0)?;
        let family = match rtm.rtm_family as i32 {
            libc::AF_INET => Family::V4,
            libc::AF_INET6 => Family::V6,
            _ => return None,
        };

        let mut route = IpRoute {
            destination: family.unspecified(),
            netmask: build_netmask(rtm.rtm_dst_len, family),
            gateway: family.unspecified(),
            source_hint: family.unspecified(),
            name: String::new(),
            mtu: 0,
        };

        let mut at = align4(mem::size_of::<RtMsg>());
        while let Some(attr) = read_at::<RtAttr>(buf, at) {
            let len = attr.rta_len as usize;
            if len < mem::size_of::<RtAttr>() || at + len > buf.len() {
                break;
            }
            let payload = &buf[at + mem::size_of::<RtAttr>()..at + len];
            match attr.rta_type {
                RTA_DST => {
                    if let Some(addr) = parse_addr(payload) {
                        route.destination = addr;
                    }
                }
                RTA_GATEWAY => {
                    if let Some(addr) = parse_addr(payload) {
                        route.gateway = addr;
                    }
                }
                RTA_PREFSRC => {
                    if let Some(addr) = parse_addr(payload) {
                        route.source_hint = addr;
                    }
                }
                RTA_OIF => {
                    if payload.len() == 4 {
                        let mut index = [0u8; 4];
                        index.copy_from_slice(payload);
                        route.name =
                            interface_name(u32::from_ne_bytes(index));
                    }
                }
                RTA_METRICS => {
                    // nested attributes; the MTU hides in here
                    let mut nested = mem::size_of::<RtAttr>();
                    while let Some(metric) =
                        read_at::<RtAttr>(&buf[at..at + len], nested)
                    {
                        let mlen = metric.rta_len as usize;
                        if mlen < mem::size_of::<RtAttr>()
                            || nested + mlen > len
                        {
                            break;
                        }
                        if metric.rta_type == RTAX_MTU && mlen >= 8 {
                            let mut mtu = [0u8; 4];
                            mtu.copy_from_slice(
                                &buf[at + nested + mem::size_of::<RtAttr>()
                                    ..at + nested + 8],
                            );
                            route.mtu = u32::from_ne_bytes(mtu);
                        }
                        nested += align4(mlen);
                    }
                }
                _ => {}
            }
            at += align4(len);
        }
        Some(route)
    }

    /// Dumps the kernel routing table for both address families.
    pub fn enumerate_routes() -> io::Result<Vec<IpRoute>> {
        let fd: RawFd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .map_err(nix_to_io)?;
        let sock = OwnedFd(fd);
        bind(sock.0, &SockAddr::Netlink(NetlinkAddr::new(0, 0)))
            .map_err(nix_to_io)?;

        // request: header + an AF_UNSPEC rtmsg dumps every family
        let hdr = NlMsgHdr {
            nlmsg_len: (mem::size_of::<NlMsgHdr>() + mem::size_of::<RtMsg>())
                as u32,
            nlmsg_type: RTM_GETROUTE,
            nlmsg_flags: NLM_F_REQUEST | NLM_F_DUMP,
            nlmsg_seq: 1,
            nlmsg_pid: 0,
        };
        let mut request = Vec::with_capacity(hdr.nlmsg_len as usize);
        request.extend_from_slice(unsafe {
            std::slice::from_raw_parts(
                &hdr as *const NlMsgHdr as *const u8,
                mem::size_of::<NlMsgHdr>(),
            )
        });
        request.extend_from_slice(&[0u8; mem::size_of::<RtMsg>()]);
        send(sock.0, &request, MsgFlags::empty()).map_err(nix_to_io)?;

        let mut routes = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        'dump: loop {
            let n = recv(sock.0, &mut buf, MsgFlags::empty())
                .map_err(nix_to_io)?;
            if n == 0 {
                break;
            }
            let mut at = 0;
            while let Some(hdr) = read_at::<NlMsgHdr>(&buf[..n], at) {
                let len = hdr.nlmsg_len as usize;
                if len < mem::size_of::<NlMsgHdr>() || at + len > n {
                    break;
                }
                match hdr.nlmsg_type {
                    NLMSG_DONE => break 'dump,
                    NLMSG_ERROR => {
                        return Err(io::Error::new(
                            io::ErrorKind::Other,
                            "netlink route dump failed",
                        ))
                    }
                    RTM_NEWROUTE => {
                        let body =
                            &buf[at + mem::size_of::<NlMsgHdr>()..at + len];
                        if let Some(route) = parse_route(body) {
                            routes.push(route);
                        }
                    }
                    _ => {}
                }
                at += align4(len);
            }
        }
        Ok(routes)
    }

    /// Closes the netlink socket when the enumeration is done.
    struct OwnedFd(RawFd);

    impl Drop for OwnedFd {
        fn drop(&mut self) {
            let _ = nix::unistd::close(self.0);
        }
    }

}
