//! CIDR subnet value type
//!
//! A [`Subnet`] is an immutable `(network address, prefix length)` pair for
//! either address family. The network address is always masked to the
//! prefix at construction, so two subnets are equal exactly when address
//! and prefix match.

use crate::{Error, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of a subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Address width in bits
    pub fn width(&self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Largest address value of the family
    pub fn max_value(&self) -> u128 {
        match self {
            Family::V4 => u32::MAX as u128,
            Family::V6 => u128::MAX,
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Convert an address to its integer value
pub fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(a) as u128,
        IpAddr::V6(a) => u128::from(a),
    }
}

/// Convert an integer value back to an address of the given family
///
/// IPv4 values are truncated to the low 32 bits.
pub fn u128_to_addr(family: Family, value: u128) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// An IP subnet in CIDR form
///
/// Ordering is narrowest first (longest prefix), then IPv4 before IPv6,
/// then by network address. Sorted sets of subnets therefore iterate the
/// smallest blocks first, which is what the allocator relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet(IpNet);

impl Subnet {
    /// Create a subnet, masking `address` down to its network address
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self> {
        let width = Family::of(&address).width();
        if prefix_len > width {
            return Err(Error::InvalidNetmask(format!(
                "{} prefix must be within [0-{}], got {}",
                match Family::of(&address) {
                    Family::V4 => "IPv4",
                    Family::V6 => "IPv6",
                },
                width,
                prefix_len
            )));
        }
        let net = IpNet::new(address, prefix_len)?;
        Ok(Self(net.trunc()))
    }

    /// Create a subnet from an address and a dotted/colon netmask
    pub fn with_netmask(address: IpAddr, netmask: IpAddr) -> Result<Self> {
        if Family::of(&address) != Family::of(&netmask) {
            return Err(Error::InvalidNetmask(
                "Netmask and address must share the same address family".to_string(),
            ));
        }
        let net = IpNet::with_netmask(address, netmask)
            .map_err(|_| Error::InvalidNetmask(format!("{} is not a valid netmask", netmask)))?;
        Ok(Self(net.trunc()))
    }

    /// Single-address subnet (/32 or /128)
    pub fn host(address: IpAddr) -> Self {
        match address {
            IpAddr::V4(a) => Self(IpNet::V4(Ipv4Net::new_assert(a, 32))),
            IpAddr::V6(a) => Self(IpNet::V6(Ipv6Net::new_assert(a, 128))),
        }
    }

    /// Build a subnet from an integer network address
    pub fn from_u128(family: Family, network: u128, prefix_len: u8) -> Result<Self> {
        Self::new(u128_to_addr(family, network), prefix_len)
    }

    pub fn network(&self) -> IpAddr {
        self.0.network()
    }

    pub fn broadcast(&self) -> IpAddr {
        self.0.broadcast()
    }

    pub fn netmask(&self) -> IpAddr {
        self.0.netmask()
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn family(&self) -> Family {
        Family::of(&self.network())
    }

    /// Number of host bits (`width - prefix_len`)
    pub fn host_bits(&self) -> u8 {
        self.family().width() - self.prefix_len()
    }

    pub fn is_single_host(&self) -> bool {
        self.host_bits() == 0
    }

    /// Number of addresses covered, saturating at `u128::MAX` for `::/0`
    pub fn address_count(&self) -> u128 {
        match self.host_bits() {
            128 => u128::MAX,
            bits => 1u128 << bits,
        }
    }

    /// First address as an integer
    pub fn first(&self) -> u128 {
        addr_to_u128(self.network())
    }

    /// Last address as an integer
    pub fn last(&self) -> u128 {
        addr_to_u128(self.broadcast())
    }

    /// Does this subnet contain `other`?
    ///
    /// True iff this prefix is no longer than the other's and the other's
    /// network masked to this prefix equals this network.
    pub fn contains(&self, other: &Subnet) -> bool {
        self.family() == other.family()
            && self.prefix_len() <= other.prefix_len()
            && self.0.contains(&other.0)
    }

    /// Does this subnet contain the address?
    pub fn contains_addr(&self, addr: IpAddr) -> bool {
        self.0.contains(&addr)
    }

    /// Equal, or either contains the other
    pub fn overlaps(&self, other: &Subnet) -> bool {
        self == other || self.contains(other) || other.contains(self)
    }

    /// Split into the two halves of the next longer prefix
    ///
    /// Four-address blocks split into two two-address blocks and
    /// two-address blocks into two single addresses. A single address
    /// cannot be split.
    pub fn split(&self) -> Result<[Subnet; 2]> {
        if self.is_single_host() {
            return Err(Error::CannotSplit(self.to_string()));
        }
        let child = self.prefix_len() + 1;
        let half = 1u128 << (self.host_bits() - 1);
        let family = self.family();
        Ok([
            Subnet::from_u128(family, self.first(), child)?,
            Subnet::from_u128(family, self.first() + half, child)?,
        ])
    }

    /// Split a four-address block into its two inclusive address pairs
    pub fn split4into2(&self) -> Result<[Subnet; 2]> {
        if self.host_bits() != 2 {
            return Err(Error::InvalidNetmask(format!(
                "{} is not a four-address subnet",
                self
            )));
        }
        self.split()
    }

    /// Underlying `ipnet` value
    pub fn as_ipnet(&self) -> IpNet {
        self.0
    }
}

impl Ord for Subnet {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .prefix_len()
            .cmp(&self.prefix_len())
            .then_with(|| self.family().cmp(&other.family()))
            .then_with(|| self.first().cmp(&other.first()))
    }
}

impl PartialOrd for Subnet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Subnet {
    type Err = Error;

    /// Parse `address/prefix`, `address/netmask`, or a bare address
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('/') {
            Some((addr, mask)) => {
                let address = IpAddr::from_str(addr.trim())?;
                let mask = mask.trim();
                match mask.parse::<u8>() {
                    Ok(prefix) => Subnet::new(address, prefix),
                    Err(_) => {
                        let netmask = IpAddr::from_str(mask).map_err(|_| {
                            Error::InvalidNetmask(format!(
                                "{} is not a valid netmask expression",
                                mask
                            ))
                        })?;
                        Subnet::with_netmask(address, netmask)
                    }
                }
            }
            None => Ok(Subnet::host(IpAddr::from_str(s)?)),
        }
    }
}

impl TryFrom<String> for Subnet {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl From<IpNet> for Subnet {
    fn from(net: IpNet) -> Self {
        Self(net.trunc())
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn net(s: &str) -> Subnet {
        s.parse().unwrap()
    }

    #[test]
    fn test_network_address_is_masked() {
        let s = net("10.0.0.77/24");
        assert_eq!(s.network(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(s, net("10.0.0.0/24"));
        assert_eq!(s.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_netmask_notation() {
        assert_eq!(net("192.168.1.0/255.255.255.0"), net("192.168.1.0/24"));
        assert!("192.168.1.0/255.0.255.0".parse::<Subnet>().is_err());
        assert!(matches!(
            "10.0.0.0/33".parse::<Subnet>(),
            Err(Error::InvalidNetmask(_))
        ));
        assert_eq!(net("10.0.0.9"), Subnet::host("10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn test_contains_and_overlaps() {
        let wide = net("10.0.0.0/24");
        let narrow = net("10.0.0.128/25");
        let other = net("10.0.1.0/25");

        assert!(wide.contains(&narrow));
        assert!(!narrow.contains(&wide));
        assert!(wide.overlaps(&narrow));
        assert!(narrow.overlaps(&wide));
        assert!(!wide.overlaps(&other));
        assert!(wide.contains_addr("10.0.0.200".parse().unwrap()));
        assert!(!net("::/0").contains(&wide));
    }

    #[test]
    fn test_split_halves() {
        let [lo, hi] = net("10.0.0.0/24").split().unwrap();
        assert_eq!(lo, net("10.0.0.0/25"));
        assert_eq!(hi, net("10.0.0.128/25"));

        let [a, b] = net("10.0.0.4/31").split().unwrap();
        assert_eq!(a, net("10.0.0.4/32"));
        assert_eq!(b, net("10.0.0.5/32"));

        assert!(matches!(
            net("10.0.0.4/32").split(),
            Err(Error::CannotSplit(_))
        ));
        assert!(net("2001:db8::1/128").split().is_err());
    }

    #[test]
    fn test_split4into2() {
        let [a, b] = net("10.0.0.8/30").split4into2().unwrap();
        assert_eq!(a, net("10.0.0.8/31"));
        assert_eq!(b, net("10.0.0.10/31"));
        assert!(net("10.0.0.8/29").split4into2().is_err());
    }

    #[test]
    fn test_narrowest_first_ordering() {
        let set: BTreeSet<Subnet> = [
            net("10.0.0.0/24"),
            net("10.0.1.0/25"),
            net("10.0.2.0/25"),
            net("10.0.3.1/32"),
        ]
        .into_iter()
        .collect();

        let order: Vec<String> = set.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            order,
            vec!["10.0.3.1/32", "10.0.1.0/25", "10.0.2.0/25", "10.0.0.0/24"]
        );
    }

    #[test]
    fn test_address_count() {
        assert_eq!(net("10.0.0.0/24").address_count(), 256);
        assert_eq!(net("10.0.0.1/32").address_count(), 1);
        assert_eq!(net("::/0").address_count(), u128::MAX);
        assert_eq!(net("0.0.0.0/0").address_count(), 1 << 32);
    }

    #[test]
    fn test_serde_as_cidr_string() {
        let s = net("2001:db8::/64");
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"2001:db8::/64\"");
        let back: Subnet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
