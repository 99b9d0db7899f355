//! Propagation benchmark: push a fresh value through a linear chain of
//! derived nodes and let the engine drain the whole cascade.

use criterion::{criterion_group, criterion_main, Criterion};

use cascade_core::graph::{Graph, Node};

fn chain_graph(depth: usize) -> Graph<i64> {
    let graph = Graph::new();
    graph.add_node(Node::new("n0")).unwrap();
    for i in 1..depth {
        let name = format!("n{i}");
        let input = format!("n{}", i - 1);
        graph.add_node(Node::new(name.clone())).unwrap();
        graph
            .add_rule(&name, &[input.as_str()], |inputs| {
                Ok(inputs[0].result()?.unwrap_or(0) + 1)
            })
            .unwrap();
    }
    graph.build().unwrap();
    graph
}

fn bench_chain_propagation(c: &mut Criterion) {
    let graph = chain_graph(64);
    let root = graph.get("n0").unwrap();
    let mut value = 0i64;

    c.bench_function("propagate_chain_64", |b| {
        b.iter(|| {
            value += 1;
            root.set_result(value);
        })
    });
}

criterion_group!(benches, bench_chain_propagation);
criterion_main!(benches);
