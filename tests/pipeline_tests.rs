// tests/pipeline_tests.rs
// End-to-end runs over temporary data, rule and index files

mod common;

use common::CountingClassifier;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use url_sentinel::detection::rules::RuleEngine;
use url_sentinel::detection::storage::{load_stage1_results, ErrorFile};
use url_sentinel::detection::{
    build_index, load_stage2_input, DeepAnalyzer, DetectionConfig, DetectionError, DetectionMethod, Label,
    Pipeline,
};
use url_sentinel::rag::RetrievalEngine;

const NORMAL_RULES: &str = r#"
rules:
  - id: N001
    name: static assets
    pattern: '^/static/.*\.(css|js|png)$'
"#;

const ANOMALOUS_RULES: &str = r#"
rules:
  - id: A001
    name: tautology
    pattern: 'or\s+1=1'
    attack_type: sql_injection
    severity: high
  - id: A002
    name: broken
    pattern: '(unclosed'
  - id: A003
    name: traversal
    pattern: '\.\./'
    attack_type: path_traversal
"#;

fn workspace() -> (TempDir, DetectionConfig) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("rules")).unwrap();
    std::fs::create_dir_all(root.join("data")).unwrap();
    std::fs::write(root.join("rules/normal.yaml"), NORMAL_RULES).unwrap();
    std::fs::write(root.join("rules/anomalous.yaml"), ANOMALOUS_RULES).unwrap();
    std::fs::write(
        root.join("data/normal.txt"),
        "/static/app.js\n/static/site.css\t200\n/products?id=7\n\n/account/profile\n",
    )
    .unwrap();
    std::fs::write(
        root.join("data/attack.txt"),
        "/login?user=a' or 1=1--\n/download?f=../../etc/passwd\n/search?q=<svg onload=alert(1)>\n",
    )
    .unwrap();
    std::fs::write(
        root.join("data/knowledge.yaml"),
        "- id: CAPEC-66\n  text: SQL injection through unsanitized query parameters\n- id: CAPEC-63\n  text: Cross-site scripting via injected markup\n",
    )
    .unwrap();

    let mut config = DetectionConfig::default();
    config.rules.normal_rules_file = root.join("rules/normal.yaml");
    config.rules.anomalous_rules_file = root.join("rules/anomalous.yaml");
    config.data.dir = root.join("data");
    config.output.dir = root.join("output");
    config.rag.index_path = root.join("rag/vector.index");
    config.rag.metadata_path = root.join("rag/metadata.json");
    config.rag.knowledge_file = Some(root.join("data/knowledge.yaml"));
    config.pipeline.workers = 2;
    (dir, config)
}

#[test]
fn rules_from_yaml_skip_malformed_entries() {
    let (_dir, config) = workspace();
    let engine = RuleEngine::from_config(&config.rules);
    assert_eq!(engine.rule_counts(), (1, 2));

    let outcome = engine.detect("/x?a=../../b");
    assert_eq!(outcome.predicted, Some(Label::Malicious));
    assert_eq!(outcome.matches[0].attack_type, "path_traversal");
}

#[test]
fn missing_rule_files_disable_only_that_class() {
    let (_dir, mut config) = workspace();
    config.rules.normal_rules_file = Path::new("/nonexistent/normal.yaml").to_path_buf();
    let engine = RuleEngine::from_config(&config.rules);
    assert_eq!(engine.rule_counts(), (0, 2));
    assert_eq!(engine.detect("/static/app.js").predicted, None);
}

#[test]
fn stage1_without_retrieval_calls_model_for_undecided_urls() {
    let (_dir, config) = workspace();
    let classifier = CountingClassifier::replying("1|xss");
    let pipeline = Pipeline::new(
        config.clone(),
        Arc::new(RuleEngine::from_config(&config.rules)),
        None,
        classifier.clone(),
    );

    let stage1 = pipeline.run_stage1().unwrap();
    let urls: Vec<&str> = stage1.results.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "/static/app.js",
            "/static/site.css",
            "/products?id=7",
            "/account/profile",
            "/login?user=a' or 1=1--",
            "/download?f=../../etc/passwd",
            "/search?q=<svg onload=alert(1)>",
        ]
    );

    // 4 rule hits, 3 model calls
    assert_eq!(classifier.calls(), 3);
    let live = pipeline.live_statistics();
    assert_eq!(live.model_calls, 3);
    assert_eq!(live.total_detections, 7);
    assert_eq!(live.malicious_detected, 5);
    let cm = stage1.snapshot.confusion;
    assert_eq!((cm.tp, cm.tn, cm.fp, cm.fn_), (3, 2, 2, 0));
    assert_eq!(stage1.snapshot.by_rule["A001"].usage, 1);
    assert!(stage1.snapshot.stage1_wall_time.is_some());

    let saved = load_stage1_results(&pipeline.store().stage1_path()).unwrap();
    assert_eq!(saved, stage1.results);

    let fp: ErrorFile =
        serde_json::from_str(&std::fs::read_to_string(pipeline.store().false_positives_path()).unwrap()).unwrap();
    assert_eq!(fp.summary.total, 2);
    assert_eq!(fp.summary.model, 2);
}

#[test]
fn indexed_urls_short_circuit_and_deep_stage_runs() {
    let (_dir, mut config) = workspace();
    config.rag.enabled = true;
    build_index(&config).unwrap();

    let retrieval = RetrievalEngine::from_config(&config.rag, 5).unwrap();
    assert_eq!(retrieval.index().len(), 9);

    let classifier = CountingClassifier::replying("## Attack Type\nxss\n## Risk\nmedium");
    let pipeline = Pipeline::new(
        config.clone(),
        Arc::new(RuleEngine::from_config(&config.rules)),
        Some(Arc::new(retrieval)),
        classifier.clone(),
    );

    let (stage1, stage2) = pipeline.run(true).unwrap();
    // every URL is either rule-decided or an exact index hit
    assert_eq!(stage1.snapshot.by_method[&DetectionMethod::RagSimilarity].count, 3);
    assert_eq!(stage1.snapshot.metrics.accuracy, 1.0);

    let stage2 = stage2.unwrap();
    assert_eq!(stage2.reports.len(), 3);
    assert_eq!(classifier.calls(), 3);
    assert_eq!(stage2.summary.attack_types["sql_injection"], 1);
    assert_eq!(stage2.summary.attack_types["attack"], 1);
    assert!(stage2.reports.iter().all(|r| r.sections.risk == "medium"));
    assert!(pipeline.store().stage2_path().exists());

    let reloaded = load_stage2_input(&pipeline.store().anomalous_list_path()).unwrap();
    assert_eq!(reloaded.len(), 3);
    assert!(reloaded.iter().all(|r| r.detection_method == DetectionMethod::External));
}

#[test]
fn deep_analysis_of_empty_batch_makes_no_calls() {
    let classifier = CountingClassifier::replying("## Summary\nunused");
    let analyzer = DeepAnalyzer::new(DetectionConfig::default(), classifier.clone(), None);
    assert!(analyzer.batch_analyze(&[]).is_empty());
    assert_eq!(classifier.calls(), 0);
}

#[test]
fn tampered_index_is_rejected_and_run_continues_without_it() {
    let (_dir, mut config) = workspace();
    config.rag.enabled = true;
    build_index(&config).unwrap();

    let mut blob = std::fs::read(&config.rag.index_path).unwrap();
    let last = blob.len() - 1;
    blob[last] ^= 0xff;
    std::fs::write(&config.rag.index_path, blob).unwrap();

    let err = RetrievalEngine::from_config(&config.rag, 5).err().unwrap();
    assert!(matches!(err, DetectionError::IndexIntegrity(_)));
    assert!(err.disables_retrieval());

    let classifier = CountingClassifier::replying("0");
    let pipeline = Pipeline::new(
        config.clone(),
        Arc::new(RuleEngine::from_config(&config.rules)),
        None,
        classifier.clone(),
    );
    assert!(!pipeline.detector().is_retrieval_available());
    let stage1 = pipeline.run_stage1().unwrap();
    assert_eq!(stage1.results.len(), 7);
    assert_eq!(classifier.calls(), 3);
}

#[test]
fn missing_index_reports_missing_resource() {
    let (_dir, mut config) = workspace();
    config.rag.enabled = true;
    assert!(matches!(
        RetrievalEngine::from_config(&config.rag, 5),
        Err(DetectionError::MissingResource(_))
    ));
}

#[test]
fn shipped_rules_and_config_load_cleanly() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut config = DetectionConfig::from_file(&root.join("sentinel.toml")).unwrap();
    assert_eq!(config.attack_types.canonicalize("sqli"), "sql_injection");

    config.rules.normal_rules_file = root.join(&config.rules.normal_rules_file);
    config.rules.anomalous_rules_file = root.join(&config.rules.anomalous_rules_file);
    let engine = RuleEngine::from_config(&config.rules);
    assert_eq!(engine.rule_counts(), (3, 8));

    for (url, expected) in [
        ("/login?id=1' or 1=1--", Some("sql_injection")),
        ("/list?cat=1 UNION SELECT user,pass FROM users", Some("sql_injection")),
        ("/q?s=<script>alert(1)</script>", Some("xss")),
        ("/view?page=../../../../etc/passwd", Some("path_traversal")),
        ("/ping?host=127.0.0.1;whoami", Some("command_injection")),
        ("/static/css/site.css", None),
        ("/products?id=42&sort=price", None),
    ] {
        let outcome = engine.detect(url);
        match expected {
            Some(attack_type) => {
                assert_eq!(outcome.predicted, Some(Label::Malicious), "{}", url);
                assert_eq!(outcome.matches[0].attack_type, attack_type, "{}", url);
            }
            None => assert_ne!(outcome.predicted, Some(Label::Malicious), "{}", url),
        }
    }
}
