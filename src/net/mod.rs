//! Network interface and route enumeration.
//!
//! Outbound peer and tracker connections need to know which interfaces
//! exist, which gateway a given interface routes through, and when any of
//! that changes. Interface listing goes through `getifaddrs`; route
//! enumeration and change notification use a netlink route socket on Linux
//! (see [`route`] and [`notifier`]) and degrade gracefully elsewhere.

pub mod notifier;
pub mod route;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An address family, where an operation is family-specific.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// The unspecified ("any") address of this family.
    pub fn unspecified(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// One address of one network interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpInterface {
    /// The system name of the interface, e.g. `eth0`.
    pub name: String,
    /// A human-friendly name where the platform has one; the system name
    /// elsewhere.
    pub friendly_name: String,
    /// A description where the platform has one.
    pub description: String,
    pub address: IpAddr,
    pub netmask: IpAddr,
    /// The scope id of a link-local v6 address, zero otherwise.
    pub scope_id: u32,
    /// False for addresses the system considers deprecated.
    pub preferred: bool,
}

/// One routing table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpRoute {
    pub destination: IpAddr,
    pub netmask: IpAddr,
    pub gateway: IpAddr,
    /// The preferred source address of the route, if the table carries
    /// one. Disambiguates multiple subnets on one device.
    pub source_hint: IpAddr,
    /// The name of the egress interface.
    pub name: String,
    /// The route's MTU, zero if unknown.
    pub mtu: u32,
}

impl IpRoute {
    /// True for a default route (destination is the any-address).
    pub fn is_default(&self) -> bool {
        self.destination.is_unspecified()
    }
}

/// Lists every address of every network interface.
pub fn enumerate_interfaces() -> std::io::Result<Vec<IpInterface>> {
    let mut interfaces = Vec::new();
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(crate::disk::file::nix_to_io)?;
    for ifaddr in addrs {
        let address = match ifaddr.address.and_then(sockaddr_to_addr) {
            Some(address) => address,
            None => continue,
        };
        let (addr, scope_id) = address;
        let netmask = ifaddr
            .netmask
            .and_then(sockaddr_to_addr)
            .map(|(a, _)| a)
            .unwrap_or_else(|| Family::of(&addr).unspecified());
        interfaces.push(IpInterface {
            friendly_name: ifaddr.interface_name.clone(),
            description: String::new(),
            name: ifaddr.interface_name,
            address: addr,
            netmask,
            scope_id,
            preferred: true,
        });
    }
    Ok(interfaces)
}

fn sockaddr_to_addr(
    addr: nix::sys::socket::SockAddr,
) -> Option<(IpAddr, u32)> {
    match addr {
        nix::sys::socket::SockAddr::Inet(inet) => match inet.to_std() {
            std::net::SocketAddr::V4(sa) => {
                Some((IpAddr::V4(*sa.ip()), 0))
            }
            std::net::SocketAddr::V6(sa) => {
                Some((IpAddr::V6(*sa.ip()), sa.scope_id()))
            }
        },
        _ => None,
    }
}

/// Lists the routing table. See [`route::enumerate_routes`].
pub fn enumerate_routes() -> std::io::Result<Vec<IpRoute>> {
    route::enumerate_routes()
}

/// Builds a contiguous-prefix netmask of `prefix_bits` bits.
///
/// # Panics
///
/// Panics if `prefix_bits` exceeds the family's address width.
pub fn build_netmask(prefix_bits: u8, family: Family) -> IpAddr {
    match family {
        Family::V4 => {
            assert!(prefix_bits <= 32);
            let mask = if prefix_bits == 0 {
                0
            } else {
                u32::MAX << (32 - prefix_bits as u32)
            };
            IpAddr::V4(Ipv4Addr::from(mask))
        }
        Family::V6 => {
            assert!(prefix_bits <= 128);
            let mut octets = [0u8; 16];
            let mut bits = prefix_bits as usize;
            for octet in octets.iter_mut() {
                let take = bits.min(8);
                *octet = if take == 0 {
                    0
                } else {
                    0xffu8 << (8 - take)
                };
                bits -= take;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

/// True iff `a` and `b` are in the same family and agree on every bit the
/// mask covers.
pub fn match_addr_mask(a: &IpAddr, b: &IpAddr, mask: &IpAddr) -> bool {
    match (a, b, mask) {
        (IpAddr::V4(a), IpAddr::V4(b), IpAddr::V4(mask)) => {
            let (a, b, m) = (
                u32::from(*a),
                u32::from(*b),
                u32::from(*mask),
            );
            a & m == b & m
        }
        (IpAddr::V6(a), IpAddr::V6(b), IpAddr::V6(mask)) => {
            let (a, b, m) =
                (a.octets(), b.octets(), mask.octets());
            a.iter()
                .zip(b.iter())
                .zip(m.iter())
                .all(|((a, b), m)| a & m == b & m)
        }
        _ => false,
    }
}

/// Returns the gateway of the default route egressing `interface`, if one
/// exists. When the routing table carries source hints, a route whose hint
/// does not match the interface's address is skipped; this disambiguates
/// multiple subnets on one device.
pub fn get_gateway(
    interface: &IpInterface,
    routes: &[IpRoute],
) -> Option<IpAddr> {
    routes
        .iter()
        .find(|r| {
            r.is_default()
                && r.name == interface.name
                && Family::of(&r.gateway) == Family::of(&interface.address)
                && !r.gateway.is_unspecified()
                && (r.source_hint.is_unspecified()
                    || r.source_hint == interface.address)
        })
        .map(|r| r.gateway)
}

/// True if `device` has a default route in the given family.
pub fn has_default_route(
    device: &str,
    family: Family,
    routes: &[IpRoute],
) -> bool {
    routes.iter().any(|r| {
        r.is_default()
            && r.name == device
            && Family::of(&r.destination) == family
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn route(
        dest: &str,
        mask: &str,
        gateway: &str,
        hint: &str,
        name: &str,
    ) -> IpRoute {
        IpRoute {
            destination: v4(dest),
            netmask: v4(mask),
            gateway: v4(gateway),
            source_hint: v4(hint),
            name: name.into(),
            mtu: 0,
        }
    }

    fn eth0() -> IpInterface {
        IpInterface {
            name: "eth0".into(),
            friendly_name: "eth0".into(),
            description: String::new(),
            address: v4("192.168.1.5"),
            netmask: v4("255.255.255.0"),
            scope_id: 0,
            preferred: true,
        }
    }

    #[test]
    fn test_build_netmask_v4() {
        assert_eq!(build_netmask(0, Family::V4), v4("0.0.0.0"));
        assert_eq!(build_netmask(8, Family::V4), v4("255.0.0.0"));
        assert_eq!(build_netmask(24, Family::V4), v4("255.255.255.0"));
        assert_eq!(build_netmask(32, Family::V4), v4("255.255.255.255"));
    }

    #[test]
    fn test_build_netmask_v6() {
        assert_eq!(
            build_netmask(64, Family::V6),
            "ffff:ffff:ffff:ffff::".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            build_netmask(10, Family::V6),
            "ffc0::".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_match_addr_mask() {
        let mask = build_netmask(24, Family::V4);
        assert!(match_addr_mask(
            &v4("192.168.1.5"),
            &v4("192.168.1.200"),
            &mask
        ));
        assert!(!match_addr_mask(
            &v4("192.168.1.5"),
            &v4("192.168.2.5"),
            &mask
        ));
        // families never match across
        assert!(!match_addr_mask(
            &v4("192.168.1.5"),
            &"::1".parse().unwrap(),
            &mask
        ));
    }

    #[test]
    fn test_get_gateway_default_route() {
        let routes = vec![
            route("10.0.0.0", "255.0.0.0", "0.0.0.0", "0.0.0.0", "eth1"),
            route("0.0.0.0", "0.0.0.0", "192.168.1.1", "0.0.0.0", "eth0"),
        ];
        assert_eq!(get_gateway(&eth0(), &routes), Some(v4("192.168.1.1")));
    }

    #[test]
    fn test_get_gateway_honors_source_hint() {
        // two default routes on the same device, different subnets
        let routes = vec![
            route("0.0.0.0", "0.0.0.0", "10.0.0.1", "10.0.0.5", "eth0"),
            route(
                "0.0.0.0",
                "0.0.0.0",
                "192.168.1.1",
                "192.168.1.5",
                "eth0",
            ),
        ];
        assert_eq!(get_gateway(&eth0(), &routes), Some(v4("192.168.1.1")));
    }

    #[test]
    fn test_get_gateway_wrong_device() {
        let routes = vec![route(
            "0.0.0.0",
            "0.0.0.0",
            "192.168.1.1",
            "0.0.0.0",
            "wlan0",
        )];
        assert_eq!(get_gateway(&eth0(), &routes), None);
    }

    #[test]
    fn test_has_default_route() {
        let routes = vec![route(
            "0.0.0.0",
            "0.0.0.0",
            "192.168.1.1",
            "0.0.0.0",
            "eth0",
        )];
        assert!(has_default_route("eth0", Family::V4, &routes));
        assert!(!has_default_route("eth1", Family::V4, &routes));
        assert!(!has_default_route("eth0", Family::V6, &routes));
    }

    #[test]
    fn test_enumerate_interfaces_smoke() {
        // every host has at least a loopback
        let interfaces = enumerate_interfaces().unwrap();
        assert!(interfaces.iter().any(|i| i.address.is_loopback()));
        for i in &interfaces {
            assert_eq!(
                Family::of(&i.address),
                Family::of(&i.netmask),
                "netmask family matches address family"
            );
        }
    }
}
