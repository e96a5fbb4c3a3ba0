//! Local source-address discovery through UDP probing.
//!
//! For each enabled address space, a UDP socket is "connected" to a
//! well-known address in that space and the OS-chosen local address is read
//! back. No packets are ever sent; this just leverages kernel routing for
//! per-family source selection without parsing platform routing tables.

use rdv_protocol::{AddrSpace, AddrSpaces, sort_dedup_addrs};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

const PROBE_PORT: u16 = 53;

/// Probing addrs to use for each space.
const UDP_PROBE_ADDRS: [(AddrSpace, IpAddr); 8] = [
    (AddrSpace::Loopback4, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
    (AddrSpace::Link4, IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1))),
    (AddrSpace::Private4, IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))),
    (AddrSpace::Public4, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))),
    (AddrSpace::Loopback6, IpAddr::V6(Ipv6Addr::LOCALHOST)),
    // Known issue: on linux, a valid locally defined zone appears to be
    // needed to open a UDP socket towards a link-local addr.
    (
        AddrSpace::Link6,
        IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
    ),
    (
        AddrSpace::Private6,
        IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
    ),
    (
        AddrSpace::Public6,
        IpAddr::V6(Ipv6Addr::new(0x2400, 0, 0, 0, 0, 0, 0, 1)),
    ),
];

/// Returns one local source addr per enabled destination addr space, as
/// chosen by the OS routing tables.
///
/// In rdv this deduplicates equivalent candidate addrs and ensures mutual
/// dial-listen attempts occur over the same address tuples, which matters
/// most for IPv6 hosts with many extra privacy addresses. Note that the
/// local- and destination spaces can differ: a host behind a home NAT
/// typically reaches a public IPv4 addr from a private one like
/// 192.168.x.x.
pub(crate) fn probe_local_addrs(spaces: AddrSpaces) -> HashMap<AddrSpace, IpAddr> {
    let mut laddrs = HashMap::new();
    for (space, addr) in UDP_PROBE_ADDRS {
        if !spaces.contains(space) {
            continue;
        }
        match probe_local_addr(addr) {
            Ok(laddr) => {
                laddrs.insert(space, laddr);
            }
            Err(err) => log::debug!("rdv: probe failed space={space} err={err}"),
        }
    }
    laddrs
}

/// Probes the local addr the OS would use to reach `remote`, through a
/// no-op UDP socket. Nothing is sent.
fn probe_local_addr(remote: IpAddr) -> std::io::Result<IpAddr> {
    let unspecified: IpAddr = match remote {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
    socket.connect(SocketAddr::new(remote, PROBE_PORT))?;
    Ok(socket.local_addr()?.ip())
}

/// The local addresses to report to the server: one `(probed ip, shared
/// port)` per enabled space, deduplicated and sorted. IPv6 zones never
/// leave this machine.
pub(crate) fn self_addrs(
    laddrs: &HashMap<AddrSpace, IpAddr>,
    port: u16,
    spaces: AddrSpaces,
) -> Vec<SocketAddr> {
    let mut addrs: Vec<SocketAddr> = laddrs
        .values()
        .filter(|ip| spaces.contains_addr(**ip))
        .map(|ip| SocketAddr::new(*ip, port))
        .collect();
    sort_dedup_addrs(&mut addrs);
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_probe_finds_loopback_source() {
        let spaces = AddrSpaces::from(AddrSpace::Loopback4);
        let laddrs = probe_local_addrs(spaces);
        assert_eq!(
            laddrs.get(&AddrSpace::Loopback4),
            Some(&"127.0.0.1".parse().unwrap())
        );
        // only the enabled space is probed
        assert_eq!(laddrs.len(), 1);
    }

    #[test]
    fn none_spaces_probe_nothing() {
        assert!(probe_local_addrs(AddrSpaces::NONE).is_empty());
    }

    #[test]
    fn self_addrs_filter_sort_dedup() {
        let mut laddrs = HashMap::new();
        laddrs.insert(AddrSpace::Private4, "192.168.0.7".parse().unwrap());
        laddrs.insert(AddrSpace::Public4, "10.0.0.3".parse().unwrap());
        laddrs.insert(AddrSpace::Loopback4, "127.0.0.1".parse().unwrap());

        // Note the public4 probe resolved to a private source addr, as is
        // typical behind a NAT; filtering applies to the addr, not the
        // probed space
        let addrs = self_addrs(&laddrs, 9000, AddrSpaces::DEFAULT);
        assert_eq!(
            addrs,
            vec![
                "10.0.0.3:9000".parse().unwrap(),
                "192.168.0.7:9000".parse().unwrap(),
            ]
        );

        assert!(self_addrs(&laddrs, 9000, AddrSpaces::NONE).is_empty());
    }
}
