//! Stage-2 deep analysis of URLs flagged malicious

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::detection::{
    config::DetectionConfig,
    errors::{DetectionError, Result},
    events::{DetectionEvent, EventBus, Stage},
    model::{Classifier, GenerationParams, PromptBuilder},
    parser::{ReportSections, ResponseParser},
    DetectionResult,
};
use crate::rag::{KnowledgeHit, RetrievalEngine, RetrievedCase};

/// Structured threat report for one malicious URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepAnalysisReport {
    pub url: String,
    #[serde(flatten)]
    pub sections: ReportSections,
    #[serde(default)]
    pub similar_cases: Vec<RetrievedCase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knowledge: Vec<KnowledgeHit>,
    #[serde(default)]
    pub raw_output: Option<String>,
    /// Seconds
    pub elapsed_time: f64,
    pub stage1_result: DetectionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeepAnalysisReport {
    /// Report for an item whose analysis failed; all sections empty
    pub fn failed(stage1: &DetectionResult, error: impl Into<String>, elapsed_time: f64) -> Self {
        Self {
            url: stage1.url.clone(),
            sections: ReportSections::default(),
            similar_cases: Vec::new(),
            knowledge: Vec::new(),
            raw_output: None,
            elapsed_time,
            stage1_result: stage1.clone(),
            error: Some(error.into()),
        }
    }
}

/// Stage-2 analyzer
pub struct DeepAnalyzer {
    config: DetectionConfig,
    classifier: Arc<dyn Classifier>,
    retrieval: Option<Arc<RetrievalEngine>>,
    parser: ResponseParser,
    event_bus: Arc<EventBus>,
    retrieval_available: AtomicBool,
}

impl DeepAnalyzer {
    pub fn new(
        config: DetectionConfig,
        classifier: Arc<dyn Classifier>,
        retrieval: Option<Arc<RetrievalEngine>>,
    ) -> Self {
        let available = config.rag.enabled && config.model.deep_analysis.use_rag && retrieval.is_some();
        Self {
            config,
            classifier,
            retrieval,
            parser: ResponseParser::new(),
            event_bus: Arc::new(EventBus::default()),
            retrieval_available: AtomicBool::new(available),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    fn active_retrieval(&self) -> Option<&RetrievalEngine> {
        if self.retrieval_available.load(Ordering::Acquire) {
            self.retrieval.as_deref()
        } else {
            None
        }
    }

    fn disable_retrieval(&self, error: &DetectionError) {
        if self.retrieval_available.swap(false, Ordering::AcqRel) {
            warn!("⚠️ Deep analysis retrieval disabled: {}", error);
            self.event_bus.publish(DetectionEvent::StageDisabled {
                stage: Stage::Retrieval,
                reason: error.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Produce a report for one Stage-1 result flagged malicious
    pub fn analyze(&self, url: &str, stage1: &DetectionResult) -> Result<DeepAnalysisReport> {
        if !stage1.is_malicious() {
            return Err(DetectionError::InvalidInput(format!(
                "{} was classified benign; deep analysis only covers malicious URLs",
                url
            )));
        }
        let start = Instant::now();

        let mut cases = Vec::new();
        let mut knowledge = Vec::new();
        if let Some(engine) = self.active_retrieval() {
            match engine.retrieve_cases(url, self.config.rag.top_k) {
                Ok(hits) => cases = hits,
                Err(e) => self.disable_retrieval(&e),
            }
        }
        if self.config.rag.knowledge_top_k > 0 {
            if let Some(engine) = self.active_retrieval() {
                match engine.retrieve_knowledge(url, self.config.rag.knowledge_top_k) {
                    Ok(hits) => knowledge = hits,
                    Err(e) => self.disable_retrieval(&e),
                }
            }
        }

        let prompt = PromptBuilder::deep(url, &stage1.attack_type, &cases, &knowledge);
        let params = GenerationParams::from(&self.config.model.deep_analysis);

        let call_start = Instant::now();
        let raw = self.classifier.generate(&prompt, &params)?;
        self.event_bus.publish(DetectionEvent::ModelInvoked {
            url: url.to_string(),
            stage: Stage::DeepAnalysis,
            with_context: !cases.is_empty() || !knowledge.is_empty(),
            duration_ms: call_start.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });

        let sections = self.parser.parse_deep(&raw);
        Ok(DeepAnalysisReport {
            url: url.to_string(),
            sections,
            similar_cases: cases,
            knowledge,
            raw_output: Some(raw),
            elapsed_time: start.elapsed().as_secs_f64(),
            stage1_result: stage1.clone(),
            error: None,
        })
    }

    /// Analyze every item in order. A failing item yields an error-marked
    /// report and the batch continues.
    pub fn batch_analyze(&self, items: &[DetectionResult]) -> Vec<DeepAnalysisReport> {
        if items.is_empty() {
            info!("No malicious URLs to analyze");
            return Vec::new();
        }

        info!("🔬 Stage 2: deep analysis of {} URLs", items.len());
        let total = items.len();
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let start = Instant::now();
                match self.analyze(&item.url, item) {
                    Ok(report) => {
                        info!("[{}/{}] ✅ {} analyzed in {:.3}s", i + 1, total, item.url, report.elapsed_time);
                        report
                    }
                    Err(e) => {
                        warn!("[{}/{}] ❌ {} failed: {}", i + 1, total, item.url, e);
                        self.event_bus.publish(DetectionEvent::DetectionError {
                            url: item.url.clone(),
                            error: e.to_string(),
                            timestamp: Utc::now(),
                        });
                        DeepAnalysisReport::failed(item, e.to_string(), start.elapsed().as_secs_f64())
                    }
                }
            })
            .collect()
    }
}

/// Aggregate view of a Stage-2 run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage2Summary {
    pub count: usize,
    pub failed: usize,
    /// Wall-clock seconds for the whole batch
    pub elapsed_time: f64,
    pub average_time: f64,
    /// Stage-1 attack type → count
    pub attack_types: BTreeMap<String, usize>,
}

impl Stage2Summary {
    pub fn from_reports(reports: &[DeepAnalysisReport], elapsed_time: f64) -> Self {
        let mut attack_types = BTreeMap::new();
        for report in reports {
            *attack_types
                .entry(report.stage1_result.attack_type.clone())
                .or_insert(0) += 1;
        }
        Self {
            count: reports.len(),
            failed: reports.iter().filter(|r| r.error.is_some()).count(),
            elapsed_time,
            average_time: if reports.is_empty() {
                0.0
            } else {
                elapsed_time / reports.len() as f64
            },
            attack_types,
        }
    }

    /// Log the summary, attack types by descending count
    pub fn log(&self) {
        info!(
            "📊 Stage 2: {} reports ({} failed) in {:.2}s, {:.3}s per URL",
            self.count, self.failed, self.elapsed_time, self.average_time
        );
        let mut types: Vec<(&String, &usize)> = self.attack_types.iter().collect();
        types.sort_by(|a, b| b.1.cmp(a.1));
        for (attack_type, count) in types {
            let share = *count as f64 / self.count.max(1) as f64 * 100.0;
            info!("   {:<20} {:>4} ({:.1}%)", attack_type, count, share);
        }
    }
}
