//! Two-stage run orchestration
//!
//! Stage 1 classifies the labeled normal and attack URL files, computes and
//! persists statistics and the anomalous list. Stage 2 optionally produces
//! deep-analysis reports for every URL flagged malicious.

use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::detection::{
    config::DetectionConfig,
    deep::{DeepAnalysisReport, DeepAnalyzer, Stage2Summary},
    errors::{DetectionError, Result},
    events::{DetectionStatistics, EventBus, LoggingSubscriber, StatisticsSubscriber},
    hybrid::HybridDetector,
    model::{Classifier, HttpClassifier},
    rules::RuleEngine,
    statistics::{MetricsSnapshot, StatisticsEngine},
    storage::{load_urls, ArtifactStore},
    DetectionResult, Label,
};
use crate::rag::{
    build_corpus, embedder_from_config, load_knowledge_file, Embedder, RetrievalEngine,
};

/// URLs from a labeled file; a missing file logs a warning and yields nothing
pub fn load_labeled(path: &Path, label: Label) -> Vec<(String, Option<Label>)> {
    match load_urls(path) {
        Ok(urls) => {
            info!("📂 Loaded {} URLs from {}", urls.len(), path.display());
            urls.into_iter().map(|u| (u, Some(label))).collect()
        }
        Err(e) => {
            warn!("⚠️ Skipping {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Classify URLs on up to `workers` threads. Output order matches input
/// order; a failing URL becomes an error-marked benign result.
pub fn detect_batch(
    detector: &HybridDetector,
    items: &[(String, Option<Label>)],
    workers: usize,
) -> Result<Vec<DetectionResult>> {
    let classify = |(url, label): &(String, Option<Label>)| detector.detect_or_mark(url).with_true_label(*label);

    if workers <= 1 {
        return Ok(items.iter().map(classify).collect());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| DetectionError::Configuration(format!("worker pool: {}", e)))?;
    Ok(pool.install(|| items.par_iter().map(classify).collect()))
}

/// Result of a Stage-1 run
#[derive(Debug, Clone)]
pub struct Stage1Outcome {
    pub results: Vec<DetectionResult>,
    pub snapshot: MetricsSnapshot,
    pub elapsed: f64,
}

/// Result of a Stage-2 run
#[derive(Debug, Clone)]
pub struct Stage2Outcome {
    pub reports: Vec<DeepAnalysisReport>,
    pub summary: Stage2Summary,
}

/// Wires the detector, analyzer, statistics and artifact store together
pub struct Pipeline {
    config: DetectionConfig,
    detector: HybridDetector,
    analyzer: DeepAnalyzer,
    statistics: StatisticsEngine,
    live: Arc<StatisticsSubscriber>,
    store: ArtifactStore,
}

impl Pipeline {
    pub fn new(
        config: DetectionConfig,
        rule_engine: Arc<RuleEngine>,
        retrieval: Option<Arc<RetrievalEngine>>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let live = Arc::new(StatisticsSubscriber::new("live-stats"));
        event_bus.subscribe(Arc::new(LoggingSubscriber::new("log")));
        event_bus.subscribe(live.clone());

        let detector = HybridDetector::new(config.clone(), rule_engine, retrieval.clone(), classifier.clone())
            .with_event_bus(event_bus.clone());
        let analyzer = DeepAnalyzer::new(config.clone(), classifier, retrieval).with_event_bus(event_bus);

        Self {
            store: ArtifactStore::new(config.output.clone()),
            config,
            detector,
            analyzer,
            statistics: StatisticsEngine::new(),
            live,
        }
    }

    /// Build every component from configuration. Missing rules or index
    /// only disable their stage.
    pub fn from_config(config: DetectionConfig) -> Result<Self> {
        let rule_engine = Arc::new(RuleEngine::from_config(&config.rules));

        let retrieval = if config.rag.enabled {
            match RetrievalEngine::from_config(&config.rag, config.model.timeout_secs) {
                Ok(engine) => Some(Arc::new(engine)),
                Err(e) => {
                    warn!("⚠️ Retrieval disabled for this run: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let classifier: Arc<dyn Classifier> = Arc::new(HttpClassifier::from_config(&config.model)?);
        Ok(Self::new(config, rule_engine, retrieval, classifier))
    }

    pub fn detector(&self) -> &HybridDetector {
        &self.detector
    }

    pub fn analyzer(&self) -> &DeepAnalyzer {
        &self.analyzer
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Counters collected from the event bus since construction
    pub fn live_statistics(&self) -> DetectionStatistics {
        self.live.get_statistics()
    }

    /// Classify the configured normal and attack files, then persist the
    /// results, anomalous list, metrics and error sets
    pub fn run_stage1(&self) -> Result<Stage1Outcome> {
        let mut items = load_labeled(&self.config.data.normal_path(), Label::Benign);
        items.extend(load_labeled(&self.config.data.attack_path(), Label::Malicious));

        info!("🚀 Stage 1: classifying {} URLs with {} worker(s)", items.len(), self.config.pipeline.workers);
        let start = Instant::now();
        let results = detect_batch(&self.detector, &items, self.config.pipeline.workers)?;
        let elapsed = start.elapsed().as_secs_f64();

        let snapshot = self.statistics.ingest(&results).with_wall_time(elapsed);
        info!("\n{}", snapshot.render_report());
        let live = self.live.get_statistics();
        info!(
            "🤖 {} classifier calls, {:.1} ms average per URL",
            live.model_calls,
            live.average_duration_ms()
        );

        self.store.save_stage1_results(&results)?;
        self.store.save_anomalous_list(&results)?;
        self.store.save_metrics(&snapshot)?;
        self.store.save_error_sets(&snapshot)?;

        Ok(Stage1Outcome {
            results,
            snapshot,
            elapsed,
        })
    }

    /// Deep-analyze the malicious items and persist reports and summary
    pub fn run_stage2(&self, items: &[DetectionResult], output: Option<&Path>) -> Result<Stage2Outcome> {
        let flagged: Vec<DetectionResult> = items.iter().filter(|r| r.is_malicious()).cloned().collect();

        let start = Instant::now();
        let reports = self.analyzer.batch_analyze(&flagged);
        let summary = Stage2Summary::from_reports(&reports, start.elapsed().as_secs_f64());
        summary.log();

        self.store.save_stage2_reports(&reports, output)?;
        self.store.save_stage2_summary(&summary)?;
        Ok(Stage2Outcome { reports, summary })
    }

    /// Stage 1, then Stage 2 when `deep` is set
    pub fn run(&self, deep: bool) -> Result<(Stage1Outcome, Option<Stage2Outcome>)> {
        let stage1 = self.run_stage1()?;
        let stage2 = if deep {
            Some(self.run_stage2(&stage1.results, None)?)
        } else {
            None
        };

        info!("⏱️ Stage 1: {:.2}s", stage1.elapsed);
        if let Some(stage2) = &stage2 {
            info!("⏱️ Stage 2: {:.2}s", stage2.summary.elapsed_time);
            info!("⏱️ Total:   {:.2}s", stage1.elapsed + stage2.summary.elapsed_time);
        }
        Ok((stage1, stage2))
    }
}

/// Offline index build from the configured URL files and knowledge file
pub fn build_index(config: &DetectionConfig) -> Result<RetrievalEngine> {
    let normal_path = config.data.normal_path();
    let attack_path = config.data.attack_path();
    let normal = load_urls(&normal_path)?;
    let attack = load_urls(&attack_path)?;

    let normal_source = source_name(&normal_path);
    let attack_source = source_name(&attack_path);
    let corpus: Vec<_> = build_corpus(&normal, &attack)
        .into_iter()
        .enumerate()
        .map(|(i, case)| {
            let source = if i < normal.len() { &normal_source } else { &attack_source };
            case.with_source(source.as_str())
        })
        .collect();

    let knowledge = match &config.rag.knowledge_file {
        Some(path) => load_knowledge_file(path)?,
        None => Vec::new(),
    };

    let embedder: Arc<dyn Embedder> =
        Arc::from(embedder_from_config(&config.rag.embedder, config.model.timeout_secs)?);
    let engine = RetrievalEngine::build(embedder, &corpus, &knowledge)?;
    engine.save(&config.rag.index_path, &config.rag.metadata_path)?;
    Ok(engine)
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::model::{GenerationParams, Prompt};
    use crate::detection::DetectionMethod;

    /// Malicious iff the URL contains `evil`; fails on `boom`
    struct KeywordClassifier;

    impl Classifier for KeywordClassifier {
        fn generate(&self, prompt: &Prompt, _params: &GenerationParams) -> Result<String> {
            if prompt.user.contains("boom") {
                return Err(DetectionError::Classifier("boom".into()));
            }
            if prompt.user.contains("## Summary") {
                return Ok("## Summary\nflagged".into());
            }
            Ok(if prompt.user.contains("evil") { "1|xss" } else { "0" }.into())
        }

        fn name(&self) -> &str {
            "keyword"
        }
    }

    fn detector() -> HybridDetector {
        HybridDetector::new(
            DetectionConfig::default(),
            Arc::new(RuleEngine::disabled()),
            None,
            Arc::new(KeywordClassifier),
        )
    }

    #[test]
    fn test_detect_batch_preserves_order_in_parallel() {
        let items: Vec<(String, Option<Label>)> = (0..40)
            .map(|i| {
                let url = if i % 3 == 0 { format!("/evil/{}", i) } else { format!("/ok/{}", i) };
                (url, Some(Label::from_flag(i % 3 == 0)))
            })
            .collect();

        let results = detect_batch(&detector(), &items, 4).unwrap();
        assert_eq!(results.len(), 40);
        for (result, (url, label)) in results.iter().zip(&items) {
            assert_eq!(&result.url, url);
            assert_eq!(result.true_label, *label);
            assert_eq!(result.is_correct(), Some(true));
        }
    }

    #[test]
    fn test_failure_does_not_abort_batch() {
        let items = vec![
            ("/a".to_string(), None),
            ("/boom".to_string(), Some(Label::Malicious)),
            ("/evil".to_string(), None),
        ];
        let results = detect_batch(&detector(), &items, 1).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[1].error.is_some());
        assert_eq!(results[1].true_label, Some(Label::Malicious));
        assert_eq!(results[2].predicted, Label::Malicious);
    }

    #[test]
    fn test_full_run_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("normal.txt"), "/index.html\n/about\n").unwrap();
        std::fs::write(data.join("attack.txt"), "/evil?q=1\t403\n/sneaky\n").unwrap();

        let mut config = DetectionConfig::default();
        config.data.dir = data;
        config.output.dir = dir.path().join("output");

        let pipeline = Pipeline::new(config, Arc::new(RuleEngine::disabled()), None, Arc::new(KeywordClassifier));
        let (stage1, stage2) = pipeline.run(true).unwrap();

        assert_eq!(stage1.results.len(), 4);
        assert_eq!(stage1.snapshot.confusion.tp, 1);
        assert_eq!(stage1.snapshot.confusion.fn_, 1);
        assert_eq!(stage1.snapshot.confusion.tn, 2);
        assert!(stage1.results.iter().all(|r| r.detection_method == DetectionMethod::Model));

        let stage2 = stage2.unwrap();
        assert_eq!(stage2.reports.len(), 1);
        assert_eq!(stage2.reports[0].sections.summary, "flagged");

        let store = pipeline.store();
        for path in [
            store.stage1_path(),
            store.anomalous_list_path(),
            store.stage2_path(),
            store.metrics_path(),
            store.false_positives_path(),
            store.false_negatives_path(),
        ] {
            assert!(path.exists(), "missing {}", path.display());
        }
    }

    #[test]
    fn test_missing_data_files_yield_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DetectionConfig::default();
        config.data.dir = dir.path().join("nowhere");
        config.output.dir = dir.path().join("output");

        let pipeline = Pipeline::new(config, Arc::new(RuleEngine::disabled()), None, Arc::new(KeywordClassifier));
        let stage1 = pipeline.run_stage1().unwrap();
        assert!(stage1.results.is_empty());
        assert_eq!(stage1.snapshot.total, 0);
    }

    #[test]
    fn test_build_index_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("normal.txt"), "/index.html\n").unwrap();
        std::fs::write(data.join("attack.txt"), "/a?id=1' or 1=1--\n").unwrap();

        let mut config = DetectionConfig::default();
        config.data.dir = data;
        config.rag.enabled = true;
        config.rag.index_path = dir.path().join("rag/vector.index");
        config.rag.metadata_path = dir.path().join("rag/metadata.json");

        let built = build_index(&config).unwrap();
        assert_eq!(built.index().len(), 2);

        let loaded = RetrievalEngine::from_config(&config.rag, 5).unwrap();
        assert_eq!(loaded.index().entries(), built.index().entries());

        let hits = loaded.retrieve_cases("/a?id=1' or 1=1--", 2).unwrap();
        assert_eq!(hits[0].source.as_deref(), Some("attack.txt"));
        assert_eq!(hits[1].source.as_deref(), Some("normal.txt"));
    }
}
