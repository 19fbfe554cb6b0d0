use serde::{Deserialize, Serialize};

use crate::addr::{Ip, Prefix, SubRange};

/// An IP protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpProtocol(pub u8);

impl IpProtocol {
    pub const ICMP: IpProtocol = IpProtocol(1);
    pub const TCP: IpProtocol = IpProtocol(6);
    pub const UDP: IpProtocol = IpProtocol(17);

    pub fn number(self) -> i64 {
        i64::from(self.0)
    }
}

/// A TCP flag match. `None` fields are not constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpFlagsMatch {
    pub ack: Option<bool>,
    pub cwr: Option<bool>,
    pub ece: Option<bool>,
    pub fin: Option<bool>,
    pub psh: Option<bool>,
    pub rst: Option<bool>,
    pub syn: Option<bool>,
    pub urg: Option<bool>,
}

impl TcpFlagsMatch {
    /// Flag constraints as (flag name, required value) pairs.
    pub fn constraints(&self) -> Vec<(&'static str, bool)> {
        [
            ("ack", self.ack),
            ("cwr", self.cwr),
            ("ece", self.ece),
            ("fin", self.fin),
            ("psh", self.psh),
            ("rst", self.rst),
            ("syn", self.syn),
            ("urg", self.urg),
        ]
        .into_iter()
        .filter_map(|(name, v)| v.map(|b| (name, b)))
        .collect()
    }
}

/// A set of packet headers. Empty positive lists mean "anything"; empty
/// negative lists exclude nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderSpace {
    pub dst_ips: Vec<Prefix>,
    pub not_dst_ips: Vec<Prefix>,
    pub src_ips: Vec<Prefix>,
    pub not_src_ips: Vec<Prefix>,
    pub src_or_dst_ips: Vec<Prefix>,
    pub dst_ports: Vec<SubRange>,
    pub not_dst_ports: Vec<SubRange>,
    pub src_ports: Vec<SubRange>,
    pub not_src_ports: Vec<SubRange>,
    pub src_or_dst_ports: Vec<SubRange>,
    pub ip_protocols: Vec<IpProtocol>,
    pub not_ip_protocols: Vec<IpProtocol>,
    pub icmp_types: Vec<SubRange>,
    pub not_icmp_types: Vec<SubRange>,
    pub icmp_codes: Vec<SubRange>,
    pub not_icmp_codes: Vec<SubRange>,
    pub tcp_flags: Vec<TcpFlagsMatch>,
}

impl HeaderSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// All packets destined into `prefix`.
    pub fn to_destination(prefix: Prefix) -> Self {
        HeaderSpace {
            dst_ips: vec![prefix],
            ..Self::default()
        }
    }

    /// True when no field is constrained.
    pub fn is_unconstrained(&self) -> bool {
        self == &HeaderSpace::default()
    }

    /// True when `ip` may be a destination of a packet in this space.
    pub fn admits_dst(&self, ip: Ip) -> bool {
        (self.dst_ips.is_empty() || self.dst_ips.iter().any(|p| p.contains_ip(ip)))
            && !self.not_dst_ips.iter().any(|p| p.contains_ip(ip))
    }

    /// True when some destination in this space lies inside `prefix`.
    pub fn overlaps_dst(&self, prefix: Prefix) -> bool {
        let positive = self.dst_ips.is_empty() || self.dst_ips.iter().any(|p| p.overlaps(prefix));
        let excluded = self.not_dst_ips.iter().any(|p| p.contains_prefix(prefix));
        positive && !excluded
    }
}
