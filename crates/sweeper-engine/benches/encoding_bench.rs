use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sweeper_engine::{Encoder, EngineOptions, HeaderQuestion};
use sweeper_ir::addr::{InterfaceAddress, Ip};
use sweeper_ir::graph::Graph;
use sweeper_ir::header_space::HeaderSpace;
use sweeper_ir::network::{Interface, Network, OspfProcess, RouterConfig};

/// `n` routers in a line running OSPF, the last one owning 10.0.200.0/24.
fn ospf_chain(n: u32) -> Network {
    let mut net = Network::new();
    for i in 0..n {
        let mut conf = RouterConfig::new(format!("R{i}"));
        let mut ifaces = Vec::new();
        if i > 0 {
            ifaces.push(Interface::new(
                "left",
                Some(InterfaceAddress::new(Ip(0x0a00_0002 + (i << 8)), 24)),
            ));
        }
        if i + 1 < n {
            ifaces.push(Interface::new(
                "right",
                Some(InterfaceAddress::new(Ip(0x0a00_0001 + ((i + 1) << 8)), 24)),
            ));
        } else {
            ifaces.push(Interface::new("stub", Some(InterfaceAddress::new(Ip(0x0a00_c801), 24))));
        }
        let mut ospf = OspfProcess::new(Ip(i + 1));
        let mut area = Vec::new();
        for mut it in ifaces {
            it.ospf_enabled = true;
            area.push(it.name.clone());
            conf.add_interface(it);
        }
        ospf.areas.insert(0, area);
        conf.ospf = Some(ospf);
        net.add_router(conf);
    }
    net
}

fn to_stub() -> HeaderQuestion {
    HeaderQuestion {
        header_space: HeaderSpace::to_destination("10.0.200.0/24".parse().unwrap()),
        ..HeaderQuestion::default()
    }
}

fn bench_encode_chain(c: &mut Criterion) {
    let options = EngineOptions::default();
    let q = to_stub();
    let mut group = c.benchmark_group("encode_ospf_chain");
    for n in [4u32, 16, 64] {
        let graph = Arc::new(Graph::new(ospf_chain(n)).unwrap());
        group.bench_with_input(BenchmarkId::from_parameter(n), &graph, |b, graph| {
            b.iter(|| Encoder::new(black_box(graph.clone()), &q, &options).unwrap())
        });
    }
    group.finish();
}

#[cfg(feature = "z3")]
fn bench_reachability_chain(c: &mut Criterion) {
    use sweeper_engine::{HeaderLocationQuestion, PropertyChecker};

    let mut group = c.benchmark_group("reachability_ospf_chain");
    group.sample_size(10);
    for n in [4u32, 16] {
        let checker = PropertyChecker::new(ospf_chain(n), EngineOptions::default()).unwrap();
        let q = HeaderLocationQuestion {
            final_node_regex: format!("R{}", n - 1),
            final_iface_regex: "stub".into(),
            ..HeaderLocationQuestion::new(to_stub())
        };
        group.bench_with_input(BenchmarkId::from_parameter(n), &q, |b, q| {
            b.iter(|| checker.check_reachability(black_box(q)).unwrap())
        });
    }
    group.finish();
}

#[cfg(not(feature = "z3"))]
fn bench_reachability_chain(_: &mut Criterion) {}

criterion_group!(benches, bench_encode_chain, bench_reachability_chain);
criterion_main!(benches);
