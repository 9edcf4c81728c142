//! Reverie Activation Benchmarks
//!
//! Benchmarks for spreading activation and similarity scoring using Criterion.
//! Run with: cargo bench -p reverie-core

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use reverie_core::concept::similarity::{concept_similarity, cosine_similarity, jaccard_similarity};
use reverie_core::{
    ActivationConfig, ActivationEngine, ConceptNode, ConceptStore, ConceptType, StoreConfig,
};

const TOPICS: [&str; 5] = ["retry", "cache", "mock", "schema", "timeout"];

fn build_store(nodes: usize) -> Arc<ConceptStore> {
    let store = ConceptStore::open_in_memory(StoreConfig::default()).expect("in-memory store");
    for i in 0..nodes {
        let topic = TOPICS[i % TOPICS.len()];
        let kind = if i % 3 == 0 { ConceptType::Technique } else { ConceptType::Pattern };
        store
            .add_concept(ConceptNode::new(
                format!("n{i}"),
                kind,
                format!("{topic} handling for service {}", i % 7),
            ))
            .expect("add concept");
    }
    Arc::new(store)
}

fn bench_spread(c: &mut Criterion) {
    let store = build_store(100);
    let mut engine = ActivationEngine::with_seed(
        Arc::clone(&store),
        ActivationConfig {
            noise_level: 0.0,
            ..Default::default()
        },
        7,
    );
    let seeds = vec!["n0".to_string(), "n1".to_string()];

    c.bench_function("spread_100_nodes", |b| {
        b.iter(|| {
            store.decay_activations(0.0).expect("reset");
            black_box(engine.spread(&seeds, 0.9, None).expect("spread"));
        })
    });
}

fn bench_novel_associations(c: &mut Criterion) {
    let store = build_store(100);
    let mut engine = ActivationEngine::with_seed(Arc::clone(&store), ActivationConfig::default(), 7);
    let activated = engine
        .spread(&["n0".to_string()], 1.0, None)
        .expect("spread")
        .activated_nodes;

    c.bench_function("novel_associations", |b| {
        b.iter(|| {
            black_box(engine.find_novel_associations(&activated).expect("associations"));
        })
    });
}

fn bench_similarity(c: &mut Criterion) {
    let a = ConceptNode::new("a", ConceptType::Pattern, "use mocks for the payment client")
        .with_embedding((0..256).map(|j| (j as f32).sin()).collect());
    let b = ConceptNode::new("b", ConceptType::Pattern, "use mocks for the billing client")
        .with_embedding((0..256).map(|j| (j as f32).cos()).collect());

    c.bench_function("concept_similarity_256d", |bench| {
        bench.iter(|| black_box(concept_similarity(&a, &b)))
    });
    c.bench_function("jaccard_similarity", |bench| {
        bench.iter(|| black_box(jaccard_similarity(&a.content, &b.content)))
    });
    let (ea, eb) = (a.embedding.clone().unwrap_or_default(), b.embedding.clone().unwrap_or_default());
    c.bench_function("cosine_similarity_256d", |bench| {
        bench.iter(|| black_box(cosine_similarity(&ea, &eb)))
    });
}

criterion_group!(benches, bench_spread, bench_novel_associations, bench_similarity);
criterion_main!(benches);
