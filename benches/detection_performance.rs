//! 🚦 Detection hot-path benchmarks
//!
//! Rule matching runs for every URL; index search runs for every URL the
//! rules do not decide. Both must stay far below a classifier round trip.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use url_sentinel::detection::rules::{RuleDefinition, RuleEngine, RuleSet};
use url_sentinel::rag::{build_corpus, Embedder, HashingEmbedder, Partition, RetrievalEngine};

fn rule_engine() -> RuleEngine {
    let normal = vec![
        RuleDefinition::new("N001", r"^/static/.*\.(css|js|png|jpg|gif|ico)$", "none"),
        RuleDefinition::new("N002", r"^/(index|about|contact)(\.html)?$", "none"),
    ];
    let anomalous = vec![
        RuleDefinition::new("A001", r"(\bor\b|\band\b)\s+\d+\s*=\s*\d+", "sql_injection"),
        RuleDefinition::new("A002", r"union(\s|%20|\+)+select", "sql_injection"),
        RuleDefinition::new("A003", r"<\s*script|javascript:|onerror\s*=", "xss"),
        RuleDefinition::new("A004", r"\.\./|%2e%2e%2f", "path_traversal"),
        RuleDefinition::new("A005", r"/etc/passwd|/bin/(ba)?sh|;\s*(cat|wget|curl)\s", "command_injection"),
    ];
    RuleEngine::new(RuleSet::from_definitions(normal, anomalous))
}

fn sample_urls(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| match i % 4 {
            0 => format!("/products/view?id={}&ref=home", i),
            1 => format!("/search?q=item{}' or 1=1--", i),
            2 => format!("/static/img/{}.png", i),
            _ => format!("/files?path=../../{}/etc/passwd", i),
        })
        .collect()
}

/// Rule engine over a mixed batch (hits and fall-throughs)
fn bench_rule_matching(c: &mut Criterion) {
    let engine = rule_engine();
    let urls = sample_urls(256);

    c.bench_function("rule_engine_detect_256", |b| {
        b.iter(|| {
            for url in &urls {
                black_box(engine.detect(black_box(url)));
            }
        });
    });
}

/// Hashing embedder plus top-5 search over 2k cases
fn bench_index_search(c: &mut Criterion) {
    let urls = sample_urls(2000);
    let (normal, attack) = urls.split_at(1000);
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(512));
    let engine = RetrievalEngine::build(embedder.clone(), &build_corpus(normal, attack), &[])
        .expect("index build failed");

    c.bench_function("embed_url", |b| {
        b.iter(|| embedder.encode(black_box("/search?q=abc' union select password from users--")))
    });

    let query = embedder
        .encode("/search?q=abc' union select password from users--")
        .expect("embed failed");
    c.bench_function("index_search_top5_2k", |b| {
        b.iter(|| engine.index().search(black_box(&query), Partition::Case, 5))
    });

    c.bench_function("retrieve_cases_top5_2k", |b| {
        b.iter(|| engine.retrieve_cases(black_box("/files?path=../../x/etc/passwd"), 5))
    });
}

criterion_group!(benches, bench_rule_matching, bench_index_search);
criterion_main!(benches);
