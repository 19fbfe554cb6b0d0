//! IPv4 addresses, prefixes and ranges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest IPv4 prefix length.
pub const MAX_PREFIX_LENGTH: u8 = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrParseError {
    #[error("invalid IPv4 address '{0}'")]
    Ip(String),
    #[error("invalid prefix '{0}'")]
    Prefix(String),
    #[error("prefix length {0} exceeds 32")]
    Length(u32),
}

/// An IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ip(pub u32);

impl Ip {
    pub const ZERO: Ip = Ip(0);
    pub const MAX: Ip = Ip(u32::MAX);

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_i64(self) -> i64 {
        i64::from(self.0)
    }

    /// Number of leading ones when read as a netmask.
    pub fn num_subnet_bits(self) -> u8 {
        self.0.leading_ones() as u8
    }
}

impl fmt::Display for Ip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0.to_be_bytes();
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl FromStr for Ip {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 4];
        let mut parts = s.split('.');
        for octet in &mut octets {
            *octet = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| AddrParseError::Ip(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddrParseError::Ip(s.to_string()));
        }
        Ok(Ip(u32::from_be_bytes(octets)))
    }
}

impl TryFrom<String> for Ip {
    type Error = AddrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ip> for String {
    fn from(ip: Ip) -> Self {
        ip.to_string()
    }
}

fn mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

/// A network prefix. The address is always stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix {
    ip: Ip,
    len: u8,
}

impl Prefix {
    pub fn new(ip: Ip, len: u8) -> Self {
        let len = len.min(MAX_PREFIX_LENGTH);
        Prefix {
            ip: Ip(ip.0 & mask(len)),
            len,
        }
    }

    /// The prefix matching every address.
    pub fn zero() -> Self {
        Prefix::new(Ip::ZERO, 0)
    }

    pub fn host(ip: Ip) -> Self {
        Prefix::new(ip, MAX_PREFIX_LENGTH)
    }

    pub fn ip(self) -> Ip {
        self.ip
    }

    pub fn len(self) -> u8 {
        self.len
    }

    pub fn start_ip(self) -> Ip {
        self.ip
    }

    pub fn end_ip(self) -> Ip {
        Ip(self.ip.0 | !mask(self.len))
    }

    pub fn contains_ip(self, ip: Ip) -> bool {
        ip.0 & mask(self.len) == self.ip.0
    }

    /// True when every address of `other` is also in `self`.
    pub fn contains_prefix(self, other: Prefix) -> bool {
        other.len >= self.len && self.contains_ip(other.ip)
    }

    pub fn overlaps(self, other: Prefix) -> bool {
        self.contains_prefix(other) || other.contains_prefix(self)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.len)
    }
}

impl FromStr for Prefix {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, len) = s
            .split_once('/')
            .ok_or_else(|| AddrParseError::Prefix(s.to_string()))?;
        let len: u32 = len
            .parse()
            .map_err(|_| AddrParseError::Prefix(s.to_string()))?;
        if len > u32::from(MAX_PREFIX_LENGTH) {
            return Err(AddrParseError::Length(len));
        }
        Ok(Prefix::new(ip.parse()?, len as u8))
    }
}

impl TryFrom<String> for Prefix {
    type Error = AddrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Prefix> for String {
    fn from(p: Prefix) -> Self {
        p.to_string()
    }
}

/// An inclusive integer range, used for ports, prefix lengths and ICMP
/// fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubRange {
    pub start: u32,
    pub end: u32,
}

impl SubRange {
    pub fn new(start: u32, end: u32) -> Self {
        SubRange { start, end }
    }

    pub fn singleton(v: u32) -> Self {
        SubRange { start: v, end: v }
    }

    pub fn contains(self, v: u32) -> bool {
        self.start <= v && v <= self.end
    }
}

/// A prefix together with the range of prefix lengths it admits, as in
/// `10.0.0.0/8 le 24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefixRange {
    pub prefix: Prefix,
    pub lengths: SubRange,
}

impl PrefixRange {
    pub fn exact(prefix: Prefix) -> Self {
        PrefixRange {
            prefix,
            lengths: SubRange::singleton(u32::from(prefix.len())),
        }
    }

    pub fn new(prefix: Prefix, min_len: u8, max_len: u8) -> Self {
        PrefixRange {
            prefix,
            lengths: SubRange::new(u32::from(min_len), u32::from(max_len)),
        }
    }

    /// True when a concrete route prefix falls in this range.
    pub fn includes(self, p: Prefix) -> bool {
        self.lengths.contains(u32::from(p.len())) && self.prefix.contains_ip(p.ip())
    }
}

/// An interface's configured address: a host IP plus the subnet length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterfaceAddress {
    pub ip: Ip,
    pub len: u8,
}

impl InterfaceAddress {
    pub fn new(ip: Ip, len: u8) -> Self {
        InterfaceAddress {
            ip,
            len: len.min(MAX_PREFIX_LENGTH),
        }
    }

    /// The connected subnet.
    pub fn prefix(self) -> Prefix {
        Prefix::new(self.ip, self.len)
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.len)
    }
}

impl FromStr for InterfaceAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, len) = s
            .split_once('/')
            .ok_or_else(|| AddrParseError::Prefix(s.to_string()))?;
        let len: u32 = len
            .parse()
            .map_err(|_| AddrParseError::Prefix(s.to_string()))?;
        if len > u32::from(MAX_PREFIX_LENGTH) {
            return Err(AddrParseError::Length(len));
        }
        Ok(InterfaceAddress::new(ip.parse()?, len as u8))
    }
}

impl TryFrom<String> for InterfaceAddress {
    type Error = AddrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InterfaceAddress> for String {
    fn from(a: InterfaceAddress) -> Self {
        a.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_roundtrips_through_text() {
        let ip: Ip = "10.1.2.3".parse().unwrap();
        assert_eq!(ip.as_u32(), 0x0a01_0203);
        assert_eq!(ip.to_string(), "10.1.2.3");
        assert!("10.1.2".parse::<Ip>().is_err());
        assert!("10.1.2.3.4".parse::<Ip>().is_err());
        assert!("10.1.2.256".parse::<Ip>().is_err());
    }

    #[test]
    fn prefix_clears_host_bits_and_bounds() {
        let p: Prefix = "10.0.0.77/24".parse().unwrap();
        assert_eq!(p.to_string(), "10.0.0.0/24");
        assert_eq!(p.end_ip().to_string(), "10.0.0.255");
        assert!(p.contains_ip("10.0.0.200".parse().unwrap()));
        assert!(!p.contains_ip("10.0.1.0".parse().unwrap()));
        assert_eq!(Prefix::zero().end_ip(), Ip::MAX);
        assert!(matches!("1.2.3.4/33".parse::<Prefix>(), Err(AddrParseError::Length(33))));
    }

    #[test]
    fn prefix_containment_and_overlap() {
        let wide: Prefix = "10.0.0.0/8".parse().unwrap();
        let narrow: Prefix = "10.2.0.0/16".parse().unwrap();
        let other: Prefix = "11.0.0.0/8".parse().unwrap();
        assert!(wide.contains_prefix(narrow));
        assert!(!narrow.contains_prefix(wide));
        assert!(narrow.overlaps(wide));
        assert!(!other.overlaps(narrow));
    }

    #[test]
    fn prefix_range_checks_length() {
        let range = PrefixRange::new("10.0.0.0/8".parse().unwrap(), 8, 24);
        assert!(range.includes("10.1.0.0/16".parse().unwrap()));
        assert!(!range.includes("10.1.1.0/25".parse().unwrap()));
        assert!(!range.includes("12.0.0.0/16".parse().unwrap()));
    }

    #[test]
    fn serde_uses_dotted_notation() {
        let addr: InterfaceAddress = "192.168.1.1/30".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"192.168.1.1/30\"");
        let back: InterfaceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert_eq!(back.prefix().to_string(), "192.168.1.0/30");
    }
}
