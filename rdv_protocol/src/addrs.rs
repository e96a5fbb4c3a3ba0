//! Address-space classification.
//!
//! Every unicast IP address falls into exactly one [`AddrSpace`] derived from
//! its class (loopback, link-local, private, public) and family. Clients use
//! an [`AddrSpaces`] set both to filter which local addresses they report and
//! which peer candidates they attempt.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// The unicast address space of a single IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AddrSpace {
    /// Common and useful for remote connectivity. Public IPv6 addrs can also
    /// provide local connectivity.
    Public4 = 1 << 0,
    Public6 = 1 << 1,

    /// Private IPv4 addrs are very common and useful for local connectivity.
    /// IPv6 local (ULA) addrs are less common.
    Private4 = 1 << 2,
    Private6 = 1 << 3,

    /// Link-local IPv4 addrs are not common and IPv6 addrs are not
    /// recommended due to zones.
    Link4 = 1 << 4,
    Link6 = 1 << 5,

    /// Loopback addresses are mostly useful for testing.
    Loopback4 = 1 << 6,
    Loopback6 = 1 << 7,
}

impl AddrSpace {
    /// All enumerated spaces, in a fixed order.
    pub const ALL: [AddrSpace; 8] = [
        AddrSpace::Public4,
        AddrSpace::Public6,
        AddrSpace::Private4,
        AddrSpace::Private6,
        AddrSpace::Link4,
        AddrSpace::Link6,
        AddrSpace::Loopback4,
        AddrSpace::Loopback6,
    ];

    /// Classifies an IP address, or `None` if it is not a usable unicast
    /// address (unspecified, multicast). IPv4-mapped IPv6 addresses are
    /// classified as their IPv4 equivalent.
    pub fn of(ip: IpAddr) -> Option<AddrSpace> {
        let ip = unmap_ip(ip);
        match ip {
            _ if ip.is_unspecified() || ip.is_multicast() => None,
            IpAddr::V4(v4) => Some(if v4.is_loopback() {
                AddrSpace::Loopback4
            } else if v4.is_link_local() {
                AddrSpace::Link4
            } else if v4.is_private() {
                AddrSpace::Private4
            } else {
                AddrSpace::Public4
            }),
            IpAddr::V6(v6) => Some(if v6.is_loopback() {
                AddrSpace::Loopback6
            } else if is_unicast_link_local(v6) {
                AddrSpace::Link6
            } else if is_unique_local(v6) {
                AddrSpace::Private6
            } else {
                AddrSpace::Public6
            }),
        }
    }
}

impl std::fmt::Display for AddrSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AddrSpace::Public4 => "public4",
            AddrSpace::Public6 => "public6",
            AddrSpace::Private4 => "private4",
            AddrSpace::Private6 => "private6",
            AddrSpace::Link4 => "link4",
            AddrSpace::Link6 => "link6",
            AddrSpace::Loopback4 => "loopback4",
            AddrSpace::Loopback6 => "loopback6",
        })
    }
}

// fe80::/10
fn is_unicast_link_local(ip: Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

// fc00::/7 (unique local, RFC 4193)
fn is_unique_local(ip: Ipv6Addr) -> bool {
    ip.segments()[0] & 0xfe00 == 0xfc00
}

fn unmap_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Converts an IPv4-mapped IPv6 socket address (as produced by a dual-stack
/// listener) to its IPv4 form, and strips the IPv6 zone otherwise.
pub fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => SocketAddr::new(IpAddr::V6(*v6.ip()), addr.port()),
        },
        SocketAddr::V4(_) => addr,
    }
}

/// A set of [`AddrSpace`]s, used to configure which candidates a client
/// reports and attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrSpaces(u32);

impl AddrSpaces {
    /// The empty set, which forces a relay conn by disabling p2p.
    ///
    /// Distinct from the default so that a zero-value config can still mean
    /// [`AddrSpaces::DEFAULT`].
    pub const NONE: AddrSpaces = AddrSpaces(1 << 31);

    /// Public IPv4 and IPv6 only.
    pub const PUBLIC: AddrSpaces =
        AddrSpaces(AddrSpace::Public4 as u32 | AddrSpace::Public6 as u32);

    /// Suitable for p2p WAN and LAN connectivity.
    pub const DEFAULT: AddrSpaces = AddrSpaces(
        AddrSpace::Public4 as u32
            | AddrSpace::Public6 as u32
            | AddrSpace::Private4 as u32
            | AddrSpace::Private6 as u32,
    );

    /// All enumerated unicast spaces.
    pub const ALL: AddrSpaces = AddrSpaces(0xff);

    /// Whether this set contains the given space.
    pub fn contains(self, space: AddrSpace) -> bool {
        self.0 & space as u32 != 0
    }

    /// Whether this set contains the space of the given address.
    pub fn contains_addr(self, ip: IpAddr) -> bool {
        AddrSpace::of(ip).is_some_and(|s| self.contains(s))
    }

    /// Whether this is the distinguished force-relay marker.
    pub fn is_none(self) -> bool {
        self == AddrSpaces::NONE
    }
}

impl Default for AddrSpaces {
    fn default() -> Self {
        AddrSpaces::DEFAULT
    }
}

impl From<AddrSpace> for AddrSpaces {
    fn from(space: AddrSpace) -> Self {
        AddrSpaces(space as u32)
    }
}

impl std::ops::BitOr for AddrSpaces {
    type Output = AddrSpaces;

    fn bitor(self, rhs: AddrSpaces) -> AddrSpaces {
        AddrSpaces(self.0 | rhs.0)
    }
}

impl std::ops::BitOr<AddrSpace> for AddrSpaces {
    type Output = AddrSpaces;

    fn bitor(self, rhs: AddrSpace) -> AddrSpaces {
        AddrSpaces(self.0 | rhs as u32)
    }
}
