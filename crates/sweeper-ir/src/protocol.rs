use std::fmt;

use serde::{Deserialize, Serialize};

/// A routing protocol as modelled by the encoder.
///
/// `Best` is not a real protocol: it names the overall winner across all
/// protocols a router runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Connected,
    Static,
    Ospf,
    Bgp,
    Best,
}

impl Protocol {
    pub fn is_connected(self) -> bool {
        self == Protocol::Connected
    }

    pub fn is_static(self) -> bool {
        self == Protocol::Static
    }

    pub fn is_ospf(self) -> bool {
        self == Protocol::Ospf
    }

    pub fn is_bgp(self) -> bool {
        self == Protocol::Bgp
    }

    pub fn is_best(self) -> bool {
        self == Protocol::Best
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Connected => "CONNECTED",
            Protocol::Static => "STATIC",
            Protocol::Ospf => "OSPF",
            Protocol::Bgp => "BGP",
            Protocol::Best => "BEST",
        }
    }

    /// Default administrative distance. BGP uses the eBGP value.
    pub fn default_admin_distance(self) -> i64 {
        match self {
            Protocol::Connected => 0,
            Protocol::Static => 1,
            Protocol::Ospf => 110,
            Protocol::Bgp => 20,
            Protocol::Best => 0,
        }
    }

    /// Largest metric a route of this protocol may carry before it is
    /// treated as unreachable.
    pub fn max_metric(self) -> Option<i64> {
        match self {
            Protocol::Ospf => Some(65_535),
            Protocol::Bgp => Some(255),
            _ => None,
        }
    }

    pub fn from_routing_protocol(p: RoutingProtocol) -> Option<Protocol> {
        match p {
            RoutingProtocol::Connected => Some(Protocol::Connected),
            RoutingProtocol::Static => Some(Protocol::Static),
            RoutingProtocol::Ospf
            | RoutingProtocol::OspfIa
            | RoutingProtocol::OspfE1
            | RoutingProtocol::OspfE2 => Some(Protocol::Ospf),
            RoutingProtocol::Bgp | RoutingProtocol::Ibgp => Some(Protocol::Bgp),
            RoutingProtocol::Aggregate => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol names as they appear in `match protocol` policy clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingProtocol {
    Bgp,
    Ibgp,
    Ospf,
    OspfIa,
    OspfE1,
    OspfE2,
    Static,
    Connected,
    Aggregate,
}

/// BGP relationship of the receiving end of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BgpSendType {
    ToEbgp,
    ToRr,
    ToClient,
    ToNonClient,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ospf_variants_collapse() {
        for p in [
            RoutingProtocol::Ospf,
            RoutingProtocol::OspfIa,
            RoutingProtocol::OspfE1,
            RoutingProtocol::OspfE2,
        ] {
            assert_eq!(Protocol::from_routing_protocol(p), Some(Protocol::Ospf));
        }
        assert_eq!(Protocol::from_routing_protocol(RoutingProtocol::Aggregate), None);
    }

    #[test]
    fn metric_limits() {
        assert_eq!(Protocol::Ospf.max_metric(), Some(65_535));
        assert_eq!(Protocol::Bgp.max_metric(), Some(255));
        assert_eq!(Protocol::Static.max_metric(), None);
    }
}
