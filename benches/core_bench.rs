//! Benchmarks for tfworker core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use indexmap::IndexMap;
use serde_json::json;
use tfworker::core::codegen;
use tfworker::core::parser::parse_config;
use tfworker::core::resolver::build_execution_order;
use tfworker::core::types::Definition;

/// `n` definitions where each reads an output of the previous one.
fn chain(n: usize) -> IndexMap<String, Definition> {
    (0..n)
        .map(|i| {
            let name = format!("def-{i:04}");
            let mut def = Definition::new(&name, &format!("definitions/{name}"));
            if i > 0 {
                def = def
                    .with_remote("upstream", &format!("def-{:04}.outputs.id", i - 1))
                    .unwrap();
            }
            (name, def)
        })
        .collect()
}

/// `n` leaves all feeding one sink, declared sink first.
fn fan_in(n: usize) -> IndexMap<String, Definition> {
    let mut sink = Definition::new("sink", "definitions/sink");
    for i in 0..n {
        sink = sink
            .with_remote(&format!("v{i}"), &format!("leaf-{i:04}.outputs.id"))
            .unwrap();
    }
    let mut defs = IndexMap::new();
    defs.insert("sink".to_string(), sink);
    for i in 0..n {
        let name = format!("leaf-{i:04}");
        defs.insert(name.clone(), Definition::new(&name, "definitions/leaf"));
    }
    defs
}

fn bench_execution_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution_order");
    for n in [10, 50, 200] {
        let defs = chain(n);
        group.bench_with_input(BenchmarkId::new("chain", n), &defs, |b, defs| {
            b.iter(|| black_box(build_execution_order(black_box(defs)).unwrap()));
        });
        let defs = fan_in(n);
        group.bench_with_input(BenchmarkId::new("fan_in", n), &defs, |b, defs| {
            b.iter(|| black_box(build_execution_order(black_box(defs)).unwrap()));
        });
    }
    group.finish();
}

fn bench_yaml_parse(c: &mut Criterion) {
    let yaml = r#"
version: "1.0"
backend:
  type: s3
  bucket: state-bucket
  region: us-east-1
providers:
  aws:
    requirements:
      version: ">= 5.0"
    vars:
      region: us-east-1
terraform_vars:
  environment: prod
  tags: { team: infra, cost_center: "42" }
definitions:
  tags:
    path: definitions/tags
  network:
    path: definitions/network
    remote_vars:
      tag_map: tags.outputs.tag_map
  database:
    path: definitions/database
    terraform_vars:
      instance_class: db.r6g.large
    remote_vars:
      subnets: network.outputs.private_subnets
      vpc_id: network.outputs.vpc.id
"#;

    c.bench_function("yaml_parse_config", |b| {
        b.iter(|| black_box(parse_config(black_box(yaml)).unwrap()));
    });
}

fn bench_render_tfvars(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_tfvars");
    for n in [8, 64, 256] {
        let vars: IndexMap<String, serde_json::Value> = (0..n)
            .map(|i| {
                let value = match i % 3 {
                    0 => json!(format!("value-{i}")),
                    1 => json!(["a", "b", i]),
                    _ => json!({ "name": format!("n{i}"), "nested": { "enabled": true } }),
                };
                (format!("var_{i}"), value)
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &vars, |b, vars| {
            b.iter(|| black_box(codegen::render_tfvars(black_box(vars))));
        });
    }
    group.finish();
}

fn bench_hash_directory(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..32 {
        let sub = dir.path().join(format!("module-{}", i % 4));
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join(format!("file-{i}.tf")), "x".repeat(2048)).unwrap();
    }

    c.bench_function("hash_directory_32_files", |b| {
        b.iter(|| black_box(tfworker::core::hasher::hash_directory(dir.path()).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_execution_order,
    bench_yaml_parse,
    bench_render_tfvars,
    bench_hash_directory
);
criterion_main!(benches);
