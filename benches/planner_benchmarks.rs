use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use tensor_memplan::{
    memory::BufferAssigner, DataType, Graph, MemoryPlanner, MemoryReuse, OpSpec, PlannerOptions,
};

/// Residual network: every block is conv -> relu (in place) -> add(skip)
fn residual_graph(blocks: usize) -> Graph {
    let mut graph = Graph::new();
    let x = graph.add_value("x", DataType::Float32, &[1, 64, 56, 56]);
    let mut skip = x;
    for block in 0..blocks {
        let conv = graph.add_value(&format!("conv{}", block), DataType::Float32, &[1, 64, 56, 56]);
        let relu = graph.add_value(&format!("relu{}", block), DataType::Float32, &[1, 64, 56, 56]);
        let sum = graph.add_value(&format!("sum{}", block), DataType::Float32, &[1, 64, 56, 56]);
        graph
            .add_op(OpSpec::new("Conv").inputs(&[skip]).outputs(&[conv]).scratchpad(1 << 16))
            .unwrap();
        graph
            .add_op(OpSpec::new("Relu").inputs(&[conv]).outputs(&[relu]).inplace(0, 0))
            .unwrap();
        graph
            .add_op(OpSpec::new("Add").inputs(&[relu, skip]).outputs(&[sum]))
            .unwrap();
        skip = sum;
    }
    graph.set_inputs(&[x]).unwrap();
    graph.set_outputs(&[skip]).unwrap();
    graph
}

fn bench_planner(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner");
    for &blocks in &[16usize, 128, 1024] {
        let graph = residual_graph(blocks);
        for &reuse in &[MemoryReuse::Enabled, MemoryReuse::Disabled] {
            group.bench_with_input(
                BenchmarkId::new(format!("residual_{}", reuse), blocks),
                &graph,
                |b, graph| {
                    b.iter(|| {
                        let options = PlannerOptions::new().set_memory_reuse(reuse);
                        let mut planner = MemoryPlanner::new(options).unwrap();
                        planner.run(black_box(graph)).unwrap();
                        black_box(planner.into_plan())
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_assigner(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let sizes: Vec<usize> = (0..4096).map(|_| rng.gen_range(64..1 << 20)).collect();

    let mut group = c.benchmark_group("buffer_assigner");
    for &match_range in &[0usize, 2, 16] {
        group.bench_with_input(BenchmarkId::new("churn", match_range), &sizes, |b, sizes| {
            b.iter(|| {
                let mut assigner = BufferAssigner::new(match_range);
                let mut live = Vec::with_capacity(32);
                for &size in sizes {
                    live.push(assigner.request(size));
                    if live.len() > 16 {
                        assigner.release(live.swap_remove(size % live.len()));
                    }
                }
                black_box(assigner.slot_count())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_planner, bench_assigner);
criterion_main!(benches);
