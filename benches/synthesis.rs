//! Benchmarks for trampoline synthesis.
//!
//! Measures the stages a hook request goes through:
//! - generating and compiling the trampoline class
//! - encoding the compiled unit
//! - serving a unit from the in-memory cache
//! - decoding a unit with the container reader

extern crate dexhook;

use criterion::{criterion_group, criterion_main, Criterion};
use dexhook::{
    codegen::{compile_unit, encode},
    dex::{writer, DexFile},
    dispatch::CallbackChain,
    trampoline::generator::generate,
    vm::{ObjectId, Value},
    MemberDescriptor, OptimizerConfig, TrampolineCompiler, TrampolineConfig,
};
use std::hint::black_box;

const MEMBER: &str = "Lcom/example/Calc;->scale(IJLjava/lang/String;D)Ljava/lang/Object;";

/// Benchmark a cold synthesis: generation, the optimizing pipeline and encoding.
fn bench_synthesize_cold(c: &mut Criterion) {
    let member = MemberDescriptor::parse(MEMBER).unwrap();
    let chain: CallbackChain<Value, ObjectId> = CallbackChain::new();

    c.bench_function("synthesize_cold", |b| {
        b.iter(|| {
            let compiler = TrampolineCompiler::new(TrampolineConfig::default()).unwrap();
            black_box(compiler.synthesize(black_box(&member), &chain).unwrap())
        });
    });
}

/// Benchmark a cold synthesis with every SSA pass disabled.
fn bench_synthesize_unoptimized(c: &mut Criterion) {
    let member = MemberDescriptor::parse(MEMBER).unwrap();
    let chain: CallbackChain<Value, ObjectId> = CallbackChain::new();
    let config = TrampolineConfig::default().with_optimizer(OptimizerConfig::disabled());

    c.bench_function("synthesize_unoptimized", |b| {
        b.iter(|| {
            let compiler = TrampolineCompiler::new(config.clone()).unwrap();
            black_box(compiler.synthesize(black_box(&member), &chain).unwrap())
        });
    });
}

/// Benchmark serving an already synthesized unit.
fn bench_synthesize_cached(c: &mut Criterion) {
    let member = MemberDescriptor::parse(MEMBER).unwrap();
    let chain: CallbackChain<Value, ObjectId> = CallbackChain::new();
    let compiler = TrampolineCompiler::new(TrampolineConfig::default()).unwrap();
    compiler.synthesize(&member, &chain).unwrap();

    c.bench_function("synthesize_cached", |b| {
        b.iter(|| black_box(compiler.synthesize(black_box(&member), &chain).unwrap()));
    });
}

/// Benchmark compiling the generated class without writing it.
fn bench_compile_unit(c: &mut Criterion) {
    let member = MemberDescriptor::parse(MEMBER).unwrap();
    let config = TrampolineConfig::default();

    c.bench_function("compile_unit", |b| {
        b.iter(|| {
            let unit = generate(&member, &config).unwrap();
            black_box(compile_unit(unit, &config.optimizer).unwrap())
        });
    });
}

/// Benchmark writing a compiled unit.
fn bench_write(c: &mut Criterion) {
    let member = MemberDescriptor::parse(MEMBER).unwrap();
    let config = TrampolineConfig::default();
    let unit = compile_unit(generate(&member, &config).unwrap(), &config.optimizer).unwrap();

    c.bench_function("write_unit", |b| {
        b.iter(|| black_box(writer::write(black_box(&unit)).unwrap()));
    });
}

/// Benchmark decoding a unit.
fn bench_parse(c: &mut Criterion) {
    let member = MemberDescriptor::parse(MEMBER).unwrap();
    let config = TrampolineConfig::default();
    let bytes = encode(generate(&member, &config).unwrap(), &config.optimizer).unwrap();

    c.bench_function("parse_unit", |b| {
        b.iter(|| black_box(DexFile::parse(black_box(&bytes)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_synthesize_cold,
    bench_synthesize_unoptimized,
    bench_synthesize_cached,
    bench_compile_unit,
    bench_write,
    bench_parse,
);
criterion_main!(benches);
