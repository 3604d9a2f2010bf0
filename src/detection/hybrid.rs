//! 混合检测器 - 主入口
//!
//! Decision order: rule engine, then the retrieval similarity shortcut, then
//! one classifier call. Each step either terminates with a verdict or falls
//! through to the next.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::detection::{
    config::DetectionConfig,
    errors::{DetectionError, Result},
    events::{DetectionEvent, EventBus, Stage},
    model::{Classifier, GenerationParams, PromptBuilder},
    parser::ResponseParser,
    rules::{RuleClass, RuleEngine},
    DetectionMethod, DetectionResult, Label,
};
use crate::rag::{KnowledgeHit, RetrievalEngine, RetrievedCase};

/// Stage-1 detector
pub struct HybridDetector {
    config: DetectionConfig,
    rule_engine: Arc<RuleEngine>,
    retrieval: Option<Arc<RetrievalEngine>>,
    classifier: Arc<dyn Classifier>,
    parser: ResponseParser,
    event_bus: Arc<EventBus>,
    /// Cleared the first time retrieval fails; never set again during a run
    retrieval_available: AtomicBool,
}

impl HybridDetector {
    pub fn new(
        config: DetectionConfig,
        rule_engine: Arc<RuleEngine>,
        retrieval: Option<Arc<RetrievalEngine>>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let available = config.rag.enabled && retrieval.is_some();
        if config.rag.enabled && retrieval.is_none() {
            warn!("⚠️ Retrieval enabled but no index loaded; similarity shortcut is off");
        }
        info!(
            "🤖 Hybrid detector ready: rules={}, retrieval={}, classifier={}",
            rule_engine.is_enabled(),
            available,
            classifier.name()
        );

        Self {
            config,
            rule_engine,
            retrieval,
            classifier,
            parser: ResponseParser::new(),
            event_bus: Arc::new(EventBus::default()),
            retrieval_available: AtomicBool::new(available),
        }
    }

    /// Share an event bus with other components
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn is_retrieval_available(&self) -> bool {
        self.retrieval_available.load(Ordering::Acquire)
    }

    fn active_retrieval(&self) -> Option<&RetrievalEngine> {
        if self.is_retrieval_available() {
            self.retrieval.as_deref()
        } else {
            None
        }
    }

    /// Switch retrieval off for the remainder of the run
    fn disable_retrieval(&self, error: &DetectionError) {
        if self.retrieval_available.swap(false, Ordering::AcqRel) {
            warn!("⚠️ Retrieval disabled: {}", error);
            self.event_bus.publish(DetectionEvent::StageDisabled {
                stage: Stage::Retrieval,
                reason: error.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Classify one URL. Only a classifier failure is returned as an error;
    /// retrieval failures disable retrieval and fall through.
    pub fn detect(&self, url: &str) -> Result<DetectionResult> {
        let start = Instant::now();
        self.event_bus.publish(DetectionEvent::DetectionStarted {
            url: url.to_string(),
            timestamp: Utc::now(),
        });

        // 1. rules
        let outcome = self.rule_engine.detect(url);
        if let (Some(predicted), Some(hit)) = (outcome.predicted, outcome.matches.first()) {
            let (method, attack_type) = match outcome.class {
                RuleClass::Anomalous => (
                    DetectionMethod::RuleAnomalous,
                    self.config.attack_types.canonicalize(&hit.attack_type),
                ),
                _ => (DetectionMethod::RuleNormal, "none".to_string()),
            };
            let elapsed = start.elapsed().as_secs_f64();

            self.event_bus.publish(DetectionEvent::RuleMatched {
                url: url.to_string(),
                rule_id: hit.rule_id.clone(),
                attack_type: attack_type.clone(),
                predicted,
                timestamp: Utc::now(),
            });
            let result = DetectionResult::new(url, predicted, attack_type, method)
                .with_rules(outcome.matches.clone())
                .with_elapsed(elapsed);
            return Ok(self.complete(result));
        }

        // 2. similarity shortcut
        let mut cases: Vec<RetrievedCase> = Vec::new();
        if let Some(engine) = self.active_retrieval() {
            match engine.retrieve_cases(url, self.config.rag.top_k) {
                Ok(hits) => cases = hits,
                Err(e) => self.disable_retrieval(&e),
            }
        }
        if let Some(best) = cases.first() {
            if best.similarity >= self.config.rag.similarity_threshold {
                let predicted = Label::from_flag(!best.is_normal());
                let attack_type = self.config.attack_types.canonicalize(&best.label);
                self.event_bus.publish(DetectionEvent::SimilarityShortcut {
                    url: url.to_string(),
                    similarity: best.similarity,
                    label: best.label.clone(),
                    timestamp: Utc::now(),
                });
                let result = DetectionResult::new(url, predicted, attack_type, DetectionMethod::RagSimilarity)
                    .with_evidence(cases)
                    .with_elapsed(start.elapsed().as_secs_f64());
                return Ok(self.complete(result));
            }
        }

        // 3. classifier
        let fast = &self.config.model.fast_detection;
        let mut knowledge: Vec<KnowledgeHit> = Vec::new();
        if fast.use_rag && self.config.rag.knowledge_top_k > 0 {
            if let Some(engine) = self.active_retrieval() {
                match engine.retrieve_knowledge(url, self.config.rag.knowledge_top_k) {
                    Ok(hits) => knowledge = hits,
                    Err(e) => self.disable_retrieval(&e),
                }
            }
        }

        let no_cases: &[RetrievedCase] = &[];
        let no_knowledge: &[KnowledgeHit] = &[];
        let (prompt_cases, prompt_knowledge) = if fast.use_rag {
            (cases.as_slice(), knowledge.as_slice())
        } else {
            (no_cases, no_knowledge)
        };
        let with_context = !prompt_cases.is_empty() || !prompt_knowledge.is_empty();
        let prompt = PromptBuilder::fast(url, prompt_cases, prompt_knowledge);

        let call_start = Instant::now();
        let raw = self.classifier.generate(&prompt, &GenerationParams::from(fast))?;
        self.event_bus.publish(DetectionEvent::ModelInvoked {
            url: url.to_string(),
            stage: Stage::Classifier,
            with_context,
            duration_ms: call_start.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });

        let verdict = self.parser.parse_fast(&raw);
        debug!("Parsed classifier output for {} via {} strategy", url, verdict.strategy);

        let method = if with_context {
            DetectionMethod::ModelWithRag
        } else {
            DetectionMethod::Model
        };
        let attack_type = match verdict.predicted {
            Label::Benign => verdict.attack_type,
            Label::Malicious => self.config.attack_types.canonicalize(&verdict.attack_type),
        };

        let mut result = DetectionResult::new(url, verdict.predicted, attack_type, method);
        if !cases.is_empty() {
            result = result.with_evidence(cases);
        }
        if fast.use_rag {
            result.knowledge_refs = knowledge.into_iter().map(|k| k.id).collect();
        }
        result.raw_model_output = Some(raw);
        result.elapsed_time = start.elapsed().as_secs_f64();
        Ok(self.complete(result))
    }

    /// Classify one URL, turning a failure into an error-marked benign record
    pub fn detect_or_mark(&self, url: &str) -> DetectionResult {
        let start = Instant::now();
        match self.detect(url) {
            Ok(result) => result,
            Err(e) => {
                warn!("❌ Detection failed for {}: {}", url, e);
                self.event_bus.publish(DetectionEvent::DetectionError {
                    url: url.to_string(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                DetectionResult::failed(url, e.to_string(), start.elapsed().as_secs_f64())
            }
        }
    }

    fn complete(&self, result: DetectionResult) -> DetectionResult {
        self.event_bus.publish(DetectionEvent::DetectionCompleted {
            url: result.url.clone(),
            result: result.clone(),
            duration_ms: (result.elapsed_time * 1000.0) as u64,
            timestamp: Utc::now(),
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::model::Prompt;
    use crate::detection::rules::{RuleDefinition, RuleSet};
    use crate::rag::{build_corpus, HashingEmbedder};
    use std::sync::atomic::AtomicUsize;

    struct FixedClassifier {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    impl FixedClassifier {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(reply.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Classifier for FixedClassifier {
        fn generate(&self, _prompt: &Prompt, _params: &GenerationParams) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .clone()
                .ok_or_else(|| DetectionError::Classifier("unreachable".into()))
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn rules() -> Arc<RuleEngine> {
        Arc::new(RuleEngine::new(RuleSet::from_definitions(
            vec![RuleDefinition::new("N-1", r"\.css$", "none")],
            vec![RuleDefinition::new("A-1", r"or\s+1=1", "SQLi")],
        )))
    }

    fn retrieval() -> Arc<RetrievalEngine> {
        let corpus = build_corpus(&["/static/site.css".into()], &["/cmd.php?c=;cat /etc/passwd".into()]);
        Arc::new(RetrievalEngine::build(Arc::new(HashingEmbedder::new(128)), &corpus, &[]).unwrap())
    }

    #[test]
    fn test_rule_terminates_before_classifier() {
        let classifier = FixedClassifier::replying("0");
        let mut config = DetectionConfig::default();
        config.attack_types.aliases.insert("sqli".into(), "sql_injection".into());
        let detector = HybridDetector::new(config, rules(), None, classifier.clone());

        let result = detector.detect("/login?id=1' or 1=1--").unwrap();
        assert_eq!(result.detection_method, DetectionMethod::RuleAnomalous);
        assert_eq!(result.attack_type, "sql_injection");
        assert_eq!(classifier.calls(), 0);

        let result = detector.detect("/a/site.css").unwrap();
        assert_eq!(result.detection_method, DetectionMethod::RuleNormal);
        assert_eq!(result.attack_type, "none");
    }

    #[test]
    fn test_similarity_shortcut_skips_classifier() {
        let classifier = FixedClassifier::replying("0");
        let mut config = DetectionConfig::default();
        config.rag.enabled = true;
        let detector = HybridDetector::new(config, Arc::new(RuleEngine::disabled()), Some(retrieval()), classifier.clone());

        let result = detector.detect("/cmd.php?c=;cat /etc/passwd").unwrap();
        assert_eq!(result.detection_method, DetectionMethod::RagSimilarity);
        assert_eq!(result.predicted, Label::Malicious);
        assert_eq!(result.attack_type, "attack");
        assert!(result.similarity_evidence.is_some());
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn test_below_threshold_uses_classifier_with_context() {
        let classifier = FixedClassifier::replying("1|xss");
        let mut config = DetectionConfig::default();
        config.rag.enabled = true;
        config.rag.similarity_threshold = 1.0;
        let detector = HybridDetector::new(config, Arc::new(RuleEngine::disabled()), Some(retrieval()), classifier.clone());

        let result = detector.detect("/search?q=<svg onload=alert(1)>").unwrap();
        assert_eq!(result.detection_method, DetectionMethod::ModelWithRag);
        assert_eq!(result.attack_type, "xss");
        assert_eq!(result.raw_model_output.as_deref(), Some("1|xss"));
        assert_eq!(classifier.calls(), 1);
    }

    #[test]
    fn test_classifier_failure_is_marked() {
        let detector = HybridDetector::new(
            DetectionConfig::default(),
            Arc::new(RuleEngine::disabled()),
            None,
            FixedClassifier::failing(),
        );

        assert!(detector.detect("/x").is_err());
        let marked = detector.detect_or_mark("/x");
        assert_eq!(marked.predicted, Label::Benign);
        assert!(marked.error.is_some());
    }

    #[test]
    fn test_enabled_without_index_is_unavailable() {
        let mut config = DetectionConfig::default();
        config.rag.enabled = true;
        let detector = HybridDetector::new(config, rules(), None, FixedClassifier::replying("0"));
        assert!(!detector.is_retrieval_available());
        assert_eq!(detector.detect("/plain").unwrap().detection_method, DetectionMethod::Model);
    }
}
