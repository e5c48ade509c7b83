// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! DescGate sample-application benchmarks.
//!
//! The registration fast path contract: re-applying a structurally
//! identical sample must be significantly cheaper than a cold insert
//! (no event dispatch, no allocation beyond the hash lookup).

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use hipc::core::types::{
    AdvertisedLayer, DataTypeInformation, EntityId, EntityKey, EntityState, PublisherEntry,
    RegistrationCmd, Sample, TopicCounters, TopicId,
};
use hipc::registration::DescGate;
use std::hint::black_box;

fn make_publisher_sample(index: u64) -> Sample {
    Sample {
        cmd: RegistrationCmd::Register,
        state: EntityState::Publisher(PublisherEntry {
            id: TopicId {
                entity: EntityKey {
                    entity_id: EntityId(index + 1),
                    process_id: 4242,
                    host_name: "bench-host".to_string(),
                },
                topic_name: format!("topic_{}", index),
            },
            datatype: DataTypeInformation {
                name: format!("type_{}", index % 8),
                encoding: "raw".to_string(),
                descriptor: format!("desc_{}", index % 4).into_bytes(),
            },
            layers: vec![AdvertisedLayer::Udp {
                group: "239.0.0.2".to_string(),
                port: 14002,
            }],
            counters: TopicCounters::default(),
        }),
    }
}

fn make_unique_publisher_samples(n: u64) -> Vec<Sample> {
    (0..n).map(make_publisher_sample).collect()
}

fn apply_sample_benches(c: &mut Criterion) {
    const SAMPLES: u64 = 1024;

    let mut group = c.benchmark_group("apply_sample");
    group.throughput(criterion::Throughput::Elements(SAMPLES));

    // Cold path: every apply inserts a new entry.
    group.bench_function("cold_insert", |b| {
        b.iter_batched(
            || (DescGate::new(), make_unique_publisher_samples(SAMPLES)),
            |(gate, samples)| {
                for sample in &samples {
                    black_box(gate.apply_local(sample));
                }
            },
            BatchSize::SmallInput,
        );
    });

    // Fast path: identical re-application must be a no-op.
    group.bench_function("reapply_no_change", |b| {
        let gate = DescGate::new();
        let samples = make_unique_publisher_samples(SAMPLES);
        for sample in &samples {
            gate.apply_local(sample);
        }
        b.iter(|| {
            for sample in &samples {
                black_box(gate.apply_local(sample));
            }
        });
    });

    group.finish();
}

fn unregister_benches(c: &mut Criterion) {
    const SAMPLES: u64 = 1024;

    c.bench_function("apply_sample/register_unregister_cycle", |b| {
        b.iter_batched(
            || {
                let samples = make_unique_publisher_samples(SAMPLES);
                let unregs: Vec<Sample> = samples
                    .iter()
                    .map(|s| Sample {
                        cmd: RegistrationCmd::Unregister,
                        state: s.state.clone(),
                    })
                    .collect();
                (DescGate::new(), samples, unregs)
            },
            |(gate, samples, unregs)| {
                for sample in &samples {
                    gate.apply_local(sample);
                }
                for sample in &unregs {
                    black_box(gate.apply_local(sample));
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, apply_sample_benches, unregister_benches);
criterion_main!(benches);
