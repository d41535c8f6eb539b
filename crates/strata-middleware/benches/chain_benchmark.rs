//! Chain compilation and execution benchmarks
//!
//! Run with: cargo bench --package strata-middleware

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata_core::{handler_fn, Context};
use strata_middleware::{ChainCompiler, Layer, LayeredPipeline};

fn populated_pipeline(per_layer: usize) -> LayeredPipeline {
    let pipeline = LayeredPipeline::new();
    for layer in Layer::ALL {
        for i in 0..per_layer {
            pipeline
                .use_handler(layer, format!("m{i}"), handler_fn(|ctx| ctx.set("seen", true)), i as i32)
                .unwrap();
        }
    }
    pipeline
}

fn bench_cache_hit(c: &mut Criterion) {
    let pipeline = populated_pipeline(5);
    let compiler = ChainCompiler::new();
    compiler.compile_chain(&pipeline, &Layer::ALL).unwrap();

    c.bench_function("compile_chain_cache_hit", |b| {
        b.iter(|| compiler.compile_chain(black_box(&pipeline), black_box(&Layer::ALL)).unwrap());
    });
}

fn bench_cold_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_chain_cold");
    for per_layer in [1usize, 5, 20] {
        let pipeline = populated_pipeline(per_layer);
        group.bench_with_input(BenchmarkId::from_parameter(per_layer), &pipeline, |b, pipeline| {
            b.iter(|| {
                let compiler = ChainCompiler::new();
                compiler.compile_chain(pipeline, &Layer::ALL).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let pipeline = populated_pipeline(5);
    let chain = ChainCompiler::new()
        .compile_chain(&pipeline, &Layer::ALL)
        .unwrap();

    c.bench_function("execute_chain_20_handlers", |b| {
        b.iter(|| {
            let mut ctx = Context::new();
            chain.execute(black_box(&mut ctx));
            ctx
        });
    });
}

criterion_group!(benches, bench_cache_hit, bench_cold_compile, bench_execute);
criterion_main!(benches);
