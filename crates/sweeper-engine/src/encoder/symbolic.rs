//! Symbolic packets, enumerations and route records.
//!
//! Every record here is a bundle of `SmtTerm`s that were declared in an
//! `Encoding` when the record was created. Fields that the optimization pass
//! proved irrelevant are `Elidable::Elided` and read as their protocol
//! default by every consumer.

use std::collections::HashSet;

use indexmap::IndexMap;
use sweeper_ir::addr::Prefix;
use sweeper_ir::community::CommunityVar;
use sweeper_ir::header_space::HeaderSpace;
use sweeper_ir::network::{Acl, AclMatch};
use sweeper_ir::protocol::Protocol;
use sweeper_smt::{Encoding, SmtTerm};

/// A field that may have been optimized away.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Elidable<T> {
    #[default]
    Elided,
    Present(T),
}

impl<T> Elidable<T> {
    pub fn get(&self) -> Option<&T> {
        match self {
            Elidable::Elided => None,
            Elidable::Present(v) => Some(v),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Elidable::Present(_))
    }

    fn when(present: bool, make: impl FnOnce() -> T) -> Self {
        if present {
            Elidable::Present(make())
        } else {
            Elidable::Elided
        }
    }
}

/// `ip` lies inside `prefix`.
pub fn in_prefix(ip: &SmtTerm, prefix: Prefix) -> SmtTerm {
    if prefix.len() == 0 {
        return SmtTerm::tt();
    }
    ip.clone()
        .within(prefix.start_ip().as_i64(), prefix.end_ip().as_i64())
}

/// Flag names in the order the packet stores them.
pub const TCP_FLAG_NAMES: [&str; 8] = ["ack", "cwr", "ece", "fin", "psh", "rst", "syn", "urg"];

/// The symbolic packet a partition forwards.
#[derive(Debug, Clone)]
pub struct SymbolicPacket {
    pub dst_ip: SmtTerm,
    pub src_ip: SmtTerm,
    pub dst_port: SmtTerm,
    pub src_port: SmtTerm,
    pub icmp_code: SmtTerm,
    pub icmp_type: SmtTerm,
    pub ip_protocol: SmtTerm,
    /// Indexed like [`TCP_FLAG_NAMES`].
    pub tcp_flags: [SmtTerm; 8],
}

impl SymbolicPacket {
    pub fn new(enc: &mut Encoding, prefix: &str) -> Self {
        let int = |enc: &mut Encoding, field: &str| enc.declare_int(format!("{prefix}{field}"));
        SymbolicPacket {
            dst_ip: int(enc, "dst-ip"),
            src_ip: int(enc, "src-ip"),
            dst_port: int(enc, "dst-port"),
            src_port: int(enc, "src-port"),
            icmp_code: int(enc, "icmp-code"),
            icmp_type: int(enc, "icmp-type"),
            ip_protocol: int(enc, "ip-protocol"),
            tcp_flags: TCP_FLAG_NAMES.map(|f| enc.declare_bool(format!("{prefix}tcp-{f}"))),
        }
    }

    /// Named integer fields, for model extraction.
    pub fn int_fields(&self) -> [(&'static str, &SmtTerm); 7] {
        [
            ("dstIp", &self.dst_ip),
            ("srcIp", &self.src_ip),
            ("dstPort", &self.dst_port),
            ("srcPort", &self.src_port),
            ("icmpCode", &self.icmp_code),
            ("icmpType", &self.icmp_type),
            ("ipProtocol", &self.ip_protocol),
        ]
    }

    pub fn tcp_flag(&self, name: &str) -> Option<&SmtTerm> {
        TCP_FLAG_NAMES
            .iter()
            .position(|f| *f == name)
            .map(|i| &self.tcp_flags[i])
    }

    /// Ranges every packet field must lie in.
    pub fn bound_constraints(&self) -> Vec<SmtTerm> {
        let ports = (1 << 16) - 1;
        vec![
            self.dst_ip.clone().within(0, i64::from(u32::MAX)),
            self.src_ip.clone().within(0, i64::from(u32::MAX)),
            self.dst_port.clone().within(0, ports),
            self.src_port.clone().within(0, ports),
            self.icmp_type.clone().within(0, 255),
            self.ip_protocol.clone().within(0, 256),
            self.icmp_code.clone().within(0, 15),
        ]
    }

    /// Field-wise equality with another packet.
    pub fn mk_equal(&self, other: &SymbolicPacket) -> SmtTerm {
        let mut eqs: Vec<SmtTerm> = self
            .int_fields()
            .iter()
            .zip(other.int_fields().iter())
            .map(|((_, a), (_, b))| (*a).clone().eq((*b).clone()))
            .collect();
        for (a, b) in self.tcp_flags.iter().zip(other.tcp_flags.iter()) {
            eqs.push(a.clone().eq(b.clone()));
        }
        SmtTerm::and(eqs)
    }

    /// Membership of this packet in `hs`.
    pub fn header_space_constraint(&self, hs: &HeaderSpace) -> SmtTerm {
        let mut acc = Vec::new();
        if !hs.dst_ips.is_empty() {
            acc.push(any_prefix(&self.dst_ip, &hs.dst_ips));
        }
        if !hs.not_dst_ips.is_empty() {
            acc.push(any_prefix(&self.dst_ip, &hs.not_dst_ips).not());
        }
        if !hs.src_ips.is_empty() {
            acc.push(any_prefix(&self.src_ip, &hs.src_ips));
        }
        if !hs.not_src_ips.is_empty() {
            acc.push(any_prefix(&self.src_ip, &hs.not_src_ips).not());
        }
        if !hs.src_or_dst_ips.is_empty() {
            acc.push(SmtTerm::or(vec![
                any_prefix(&self.src_ip, &hs.src_or_dst_ips),
                any_prefix(&self.dst_ip, &hs.src_or_dst_ips),
            ]));
        }
        let ranges = |t: &SmtTerm, rs: &[sweeper_ir::addr::SubRange]| {
            SmtTerm::or(
                rs.iter()
                    .map(|r| t.clone().within(i64::from(r.start), i64::from(r.end)))
                    .collect(),
            )
        };
        if !hs.dst_ports.is_empty() {
            acc.push(ranges(&self.dst_port, &hs.dst_ports));
        }
        if !hs.not_dst_ports.is_empty() {
            acc.push(ranges(&self.dst_port, &hs.not_dst_ports).not());
        }
        if !hs.src_ports.is_empty() {
            acc.push(ranges(&self.src_port, &hs.src_ports));
        }
        if !hs.not_src_ports.is_empty() {
            acc.push(ranges(&self.src_port, &hs.not_src_ports).not());
        }
        if !hs.src_or_dst_ports.is_empty() {
            acc.push(SmtTerm::or(vec![
                ranges(&self.src_port, &hs.src_or_dst_ports),
                ranges(&self.dst_port, &hs.src_or_dst_ports),
            ]));
        }
        if !hs.icmp_types.is_empty() {
            acc.push(ranges(&self.icmp_type, &hs.icmp_types));
        }
        if !hs.not_icmp_types.is_empty() {
            acc.push(ranges(&self.icmp_type, &hs.not_icmp_types).not());
        }
        if !hs.icmp_codes.is_empty() {
            acc.push(ranges(&self.icmp_code, &hs.icmp_codes));
        }
        if !hs.not_icmp_codes.is_empty() {
            acc.push(ranges(&self.icmp_code, &hs.not_icmp_codes).not());
        }
        let protos = |ps: &[sweeper_ir::header_space::IpProtocol]| {
            SmtTerm::or(
                ps.iter()
                    .map(|p| self.ip_protocol.clone().eq(SmtTerm::int(p.number())))
                    .collect(),
            )
        };
        if !hs.ip_protocols.is_empty() {
            acc.push(protos(&hs.ip_protocols));
        }
        if !hs.not_ip_protocols.is_empty() {
            acc.push(protos(&hs.not_ip_protocols).not());
        }
        if !hs.tcp_flags.is_empty() {
            let alternatives = hs
                .tcp_flags
                .iter()
                .map(|m| {
                    SmtTerm::and(
                        m.constraints()
                            .into_iter()
                            .filter_map(|(name, value)| {
                                let flag = self.tcp_flag(name)?.clone();
                                Some(if value { flag } else { flag.not() })
                            })
                            .collect(),
                    )
                })
                .collect();
            acc.push(SmtTerm::or(alternatives));
        }
        SmtTerm::and(acc)
    }

    /// First-match evaluation of `acl`: true when the packet is permitted.
    /// Falling off the end denies.
    pub fn compile_acl(&self, acl: &Acl, acls: &IndexMap<String, Acl>) -> SmtTerm {
        let mut seen = HashSet::new();
        seen.insert(acl.name.clone());
        self.compile_acl_lines(acl, acls, &mut seen)
    }

    /// Match condition of each line of `acl`, in order.
    pub fn acl_line_guards(&self, acl: &Acl, acls: &IndexMap<String, Acl>) -> Vec<SmtTerm> {
        let mut seen = HashSet::from([acl.name.clone()]);
        acl.lines
            .iter()
            .map(|l| self.compile_match(&l.matches, acls, &mut seen))
            .collect()
    }

    fn compile_acl_lines(
        &self,
        acl: &Acl,
        acls: &IndexMap<String, Acl>,
        seen: &mut HashSet<String>,
    ) -> SmtTerm {
        let mut acc = SmtTerm::ff();
        for line in acl.lines.iter().rev() {
            let guard = self.compile_match(&line.matches, acls, seen);
            acc = guard.ite(SmtTerm::bool(line.action.is_permit()), acc);
        }
        acc
    }

    fn compile_match(
        &self,
        m: &AclMatch,
        acls: &IndexMap<String, Acl>,
        seen: &mut HashSet<String>,
    ) -> SmtTerm {
        match m {
            AclMatch::True => SmtTerm::tt(),
            AclMatch::False => SmtTerm::ff(),
            AclMatch::HeaderSpace(hs) => self.header_space_constraint(hs),
            AclMatch::And(ms) => {
                SmtTerm::and(ms.iter().map(|m| self.compile_match(m, acls, seen)).collect())
            }
            AclMatch::Or(ms) => {
                SmtTerm::or(ms.iter().map(|m| self.compile_match(m, acls, seen)).collect())
            }
            AclMatch::Not(inner) => self.compile_match(inner, acls, seen).not(),
            AclMatch::PermittedBy(name) => match acls.get(name) {
                // A reference cycle permits nothing.
                Some(other) if seen.insert(name.clone()) => {
                    let t = self.compile_acl_lines(other, acls, seen);
                    seen.remove(name);
                    t
                }
                _ => SmtTerm::ff(),
            },
        }
    }
}

fn any_prefix(ip: &SmtTerm, prefixes: &[Prefix]) -> SmtTerm {
    SmtTerm::or(prefixes.iter().map(|p| in_prefix(ip, *p)).collect())
}

/// A finite enumeration encoded as an integer index.
///
/// An enumeration with a single value needs no variable and is the constant
/// index 0.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicEnum<T> {
    values: Vec<T>,
    term: SmtTerm,
}

impl<T: PartialEq + Clone> SymbolicEnum<T> {
    pub fn new(enc: &mut Encoding, name: &str, values: Vec<T>) -> Self {
        let term = if values.len() <= 1 {
            SmtTerm::int(0)
        } else {
            let v = enc.declare_int(name);
            enc.assert_term(v.clone().within(0, values.len() as i64 - 1));
            v
        };
        SymbolicEnum { values, term }
    }

    pub fn term(&self) -> &SmtTerm {
        &self.term
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }

    /// The enumeration holds `value`; false when `value` is not a member.
    pub fn check_if_value(&self, value: &T) -> SmtTerm {
        match self.index_of(value) {
            Some(_) if self.values.len() == 1 => SmtTerm::tt(),
            Some(i) => self.term.clone().eq(SmtTerm::int(i as i64)),
            None => SmtTerm::ff(),
        }
    }

    pub fn is_default_value(&self) -> SmtTerm {
        self.term.clone().eq(SmtTerm::int(0))
    }

    pub fn eq_enum(&self, other: &SymbolicEnum<T>) -> SmtTerm {
        self.term.clone().eq(other.term.clone())
    }

    /// The member at a model's index value.
    pub fn value(&self, index: i64) -> Option<&T> {
        usize::try_from(index).ok().and_then(|i| self.values.get(i))
    }
}

/// OSPF route type, ordered by preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OspfType {
    O,
    Oia,
    E1,
    E2,
}

impl OspfType {
    pub const ALL: [OspfType; 4] = [OspfType::O, OspfType::Oia, OspfType::E1, OspfType::E2];

    pub fn index(self) -> i64 {
        self as i64
    }

    pub fn term(self) -> SmtTerm {
        SmtTerm::int(self.index())
    }

    /// Intra- or inter-area route, as opposed to an external one.
    pub fn is_internal(self) -> bool {
        matches!(self, OspfType::O | OspfType::Oia)
    }
}

/// The role a route record plays in the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    BestOverall,
    Best,
    Export,
    Import,
    Env,
    Redistributed,
}

/// Which optional fields a new route record carries.
#[derive(Debug, Clone, Default)]
pub struct RouteFields {
    pub admin_dist: bool,
    pub local_pref: bool,
    pub med: bool,
    pub ospf_area: bool,
    pub ospf_type: bool,
    pub router_id: bool,
    /// Also gates the IGP metric.
    pub bgp_internal: bool,
    pub client_id: bool,
    /// Protocols the best-overall record can come from.
    pub history: Option<Vec<Protocol>>,
    pub communities: Vec<CommunityVar>,
}

/// The symbolic record of one route.
#[derive(Debug, Clone)]
pub struct SymbolicRoute {
    pub name: String,
    pub router: String,
    pub proto: Protocol,
    pub kind: RouteKind,
    /// False for placeholders that resolve to another record.
    pub used: bool,
    pub permitted: SmtTerm,
    pub prefix_length: SmtTerm,
    pub admin_dist: Elidable<SmtTerm>,
    pub metric: SmtTerm,
    pub med: Elidable<SmtTerm>,
    pub local_pref: Elidable<SmtTerm>,
    pub bgp_internal: Elidable<SmtTerm>,
    pub igp_metric: Elidable<SmtTerm>,
    pub router_id: Elidable<SmtTerm>,
    pub ospf_area: Elidable<SmtTerm>,
    pub ospf_type: Elidable<SymbolicEnum<OspfType>>,
    pub client_id: Elidable<SmtTerm>,
    pub protocol_history: Elidable<SymbolicEnum<Protocol>>,
    pub communities: IndexMap<CommunityVar, SmtTerm>,
}

impl SymbolicRoute {
    pub fn new(
        enc: &mut Encoding,
        name: impl Into<String>,
        router: &str,
        proto: Protocol,
        kind: RouteKind,
        fields: &RouteFields,
    ) -> Self {
        let name = name.into();
        let int = |enc: &mut Encoding, suffix: &str| enc.declare_int(format!("{name}_{suffix}"));
        let boolean =
            |enc: &mut Encoding, suffix: &str| enc.declare_bool(format!("{name}_{suffix}"));

        let permitted = boolean(enc, "permitted");
        let prefix_length = int(enc, "prefixLength");
        let metric = int(enc, "metric");
        let admin_dist = Elidable::when(fields.admin_dist, || int(enc, "adminDist"));
        let med = Elidable::when(fields.med, || int(enc, "med"));
        let local_pref = Elidable::when(fields.local_pref, || int(enc, "localPref"));
        let bgp_internal = Elidable::when(fields.bgp_internal, || boolean(enc, "bgpInternal"));
        let igp_metric = Elidable::when(fields.bgp_internal, || int(enc, "igpMetric"));
        let router_id = Elidable::when(fields.router_id, || int(enc, "routerID"));
        let ospf_area = Elidable::when(fields.ospf_area, || int(enc, "ospfArea"));
        let ospf_type = Elidable::when(fields.ospf_type, || {
            SymbolicEnum::new(enc, &format!("{name}_ospfType"), OspfType::ALL.to_vec())
        });
        let client_id = Elidable::when(fields.client_id, || int(enc, "clientId"));
        let protocol_history = match &fields.history {
            Some(protos) => Elidable::Present(SymbolicEnum::new(
                enc,
                &format!("{name}_history"),
                protos.clone(),
            )),
            None => Elidable::Elided,
        };
        let communities = fields
            .communities
            .iter()
            .map(|c| {
                let v = boolean(enc, &format!("community_{}", c.var_suffix()));
                (c.clone(), v)
            })
            .collect();

        SymbolicRoute {
            router: router.to_string(),
            proto,
            kind,
            used: true,
            permitted,
            prefix_length,
            admin_dist,
            metric,
            med,
            local_pref,
            bgp_internal,
            igp_metric,
            router_id,
            ospf_area,
            ospf_type,
            client_id,
            protocol_history,
            communities,
            name,
        }
    }

    /// A placeholder for an import record merged into the opposite export.
    pub fn unused(name: impl Into<String>, router: &str, proto: Protocol) -> Self {
        SymbolicRoute {
            name: name.into(),
            router: router.to_string(),
            proto,
            kind: RouteKind::Import,
            used: false,
            permitted: SmtTerm::ff(),
            prefix_length: SmtTerm::int(0),
            admin_dist: Elidable::Elided,
            metric: SmtTerm::int(0),
            med: Elidable::Elided,
            local_pref: Elidable::Elided,
            bgp_internal: Elidable::Elided,
            igp_metric: Elidable::Elided,
            router_id: Elidable::Elided,
            ospf_area: Elidable::Elided,
            ospf_type: Elidable::Elided,
            client_id: Elidable::Elided,
            protocol_history: Elidable::Elided,
            communities: IndexMap::new(),
        }
    }

    pub fn is_env(&self) -> bool {
        self.kind == RouteKind::Env
    }

    pub fn is_export(&self) -> bool {
        self.kind == RouteKind::Export
    }

    pub fn is_best(&self) -> bool {
        matches!(self.kind, RouteKind::Best | RouteKind::BestOverall)
    }

    /// Terms of every declared integer field, paired with a display label.
    pub fn int_fields(&self) -> Vec<(&'static str, &SmtTerm)> {
        let mut out = vec![("prefixLength", &self.prefix_length), ("metric", &self.metric)];
        let optional = [
            ("adminDist", &self.admin_dist),
            ("med", &self.med),
            ("localPref", &self.local_pref),
            ("igpMetric", &self.igp_metric),
            ("routerID", &self.router_id),
            ("ospfArea", &self.ospf_area),
            ("clientId", &self.client_id),
        ];
        out.extend(optional.into_iter().filter_map(|(k, v)| v.get().map(|t| (k, t))));
        out
    }
}
