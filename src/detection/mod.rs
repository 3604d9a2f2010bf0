//! Hybrid URL attack detection
//!
//! Two-stage pipeline: a per-URL Stage-1 decision (rules, then the case
//! similarity shortcut, then the classifier) followed by a Stage-2 deep
//! analysis of every URL flagged malicious.
//!
//! ## Components
//! - 🛡️ Ordered regex rule engine (anomalous before normal)
//! - 🔎 Nearest-neighbour case retrieval shortcut
//! - 🤖 Classifier with tolerant response parsing
//! - 📋 Structured threat reports for flagged URLs
//! - 📊 Confusion-matrix evaluation and error sets
//! - 🔌 Event bus for per-URL decision records

pub mod config;
pub mod deep;
pub mod errors;
pub mod events;
pub mod hybrid;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod rules;
pub mod statistics;
pub mod storage;

pub use config::DetectionConfig;
pub use deep::{DeepAnalysisReport, DeepAnalyzer, Stage2Summary};
pub use errors::{DetectionError, Result};
pub use events::{DetectionEvent, EventBus, EventSubscriber, LoggingSubscriber, StatisticsSubscriber};
pub use hybrid::HybridDetector;
pub use model::{Classifier, GenerationParams, HttpClassifier, Prompt, PromptBuilder};
pub use parser::{FastVerdict, ParseStrategy, ReportSections, ResponseParser};
pub use pipeline::{build_index, detect_batch, Pipeline, Stage1Outcome, Stage2Outcome};
pub use rules::{Rule, RuleClass, RuleEngine, RuleMatch, RuleOutcome, RuleSet, Severity};
pub use statistics::{ConfusionMatrix, Metrics, MetricsSnapshot, StatisticsEngine};
pub use storage::{load_stage2_input, load_urls, ArtifactStore};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::rag::RetrievedCase;

/// Binary verdict, serialized as `"0"` (benign) / `"1"` (malicious)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    #[serde(rename = "0")]
    Benign,
    #[serde(rename = "1")]
    Malicious,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Benign => "0",
            Self::Malicious => "1",
        }
    }

    pub fn is_malicious(&self) -> bool {
        matches!(self, Self::Malicious)
    }

    pub fn from_flag(malicious: bool) -> Self {
        if malicious {
            Self::Malicious
        } else {
            Self::Benign
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which step of the pipeline produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    RuleNormal,
    RuleAnomalous,
    RagSimilarity,
    Model,
    ModelWithRag,
    /// Stage-2 input taken from a plain URL list; never produced by Stage 1
    External,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleNormal => "rule_normal",
            Self::RuleAnomalous => "rule_anomalous",
            Self::RagSimilarity => "rag_similarity",
            Self::Model => "model",
            Self::ModelWithRag => "model_with_rag",
            Self::External => "external",
        }
    }

    pub fn is_rule(&self) -> bool {
        matches!(self, Self::RuleNormal | Self::RuleAnomalous)
    }

    pub fn is_model(&self) -> bool {
        matches!(self, Self::Model | Self::ModelWithRag)
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-1 verdict for one URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub url: String,
    pub predicted: Label,
    pub attack_type: String,
    pub detection_method: DetectionMethod,
    #[serde(default)]
    pub matched_rules: Vec<RuleMatch>,
    /// Retrieved cases, when retrieval ran for this URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_evidence: Option<Vec<RetrievedCase>>,
    /// Ids of knowledge chunks injected into the prompt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knowledge_refs: Vec<String>,
    /// Seconds spent on this URL
    pub elapsed_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_model_output: Option<String>,
    #[serde(default)]
    pub true_label: Option<Label>,
    /// Set when the URL could not be classified; the verdict is then benign
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionResult {
    pub fn new(
        url: impl Into<String>,
        predicted: Label,
        attack_type: impl Into<String>,
        detection_method: DetectionMethod,
    ) -> Self {
        Self {
            url: url.into(),
            predicted,
            attack_type: attack_type.into(),
            detection_method,
            matched_rules: Vec::new(),
            similarity_evidence: None,
            knowledge_refs: Vec::new(),
            elapsed_time: 0.0,
            raw_model_output: None,
            true_label: None,
            error: None,
        }
    }

    /// Conservative benign record for a URL whose classification failed
    pub fn failed(url: impl Into<String>, error: impl Into<String>, elapsed_time: f64) -> Self {
        Self {
            elapsed_time,
            error: Some(error.into()),
            ..Self::new(url, Label::Benign, "none", DetectionMethod::Model)
        }
    }

    pub fn with_rules(mut self, matches: Vec<RuleMatch>) -> Self {
        self.matched_rules = matches;
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<RetrievedCase>) -> Self {
        self.similarity_evidence = Some(evidence);
        self
    }

    pub fn with_elapsed(mut self, seconds: f64) -> Self {
        self.elapsed_time = seconds;
        self
    }

    pub fn with_true_label(mut self, label: Option<Label>) -> Self {
        self.true_label = label;
        self
    }

    pub fn is_malicious(&self) -> bool {
        self.predicted.is_malicious()
    }

    /// `None` when no ground truth is attached
    pub fn is_correct(&self) -> Option<bool> {
        self.true_label.map(|truth| truth == self.predicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_wire_format() {
        assert_eq!(serde_json::to_string(&Label::Malicious).unwrap(), "\"1\"");
        let label: Label = serde_json::from_str("\"0\"").unwrap();
        assert_eq!(label, Label::Benign);
        assert!(serde_json::from_str::<Label>("\"2\"").is_err());
    }

    #[test]
    fn test_detection_result_creation() {
        let result = DetectionResult::new("/a", Label::Malicious, "xss", DetectionMethod::RuleAnomalous)
            .with_true_label(Some(Label::Malicious));
        assert!(result.is_malicious());
        assert_eq!(result.is_correct(), Some(true));

        let failed = DetectionResult::failed("/b", "classifier down", 0.5);
        assert_eq!(failed.predicted, Label::Benign);
        assert!(failed.error.is_some());
        assert_eq!(failed.is_correct(), None);
    }

    #[test]
    fn test_detection_result_json() {
        let result = DetectionResult::new("/x", Label::Benign, "none", DetectionMethod::ModelWithRag);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["detection_method"], "model_with_rag");
        assert_eq!(json["predicted"], "0");
        assert!(json.get("error").is_none());

        let back: DetectionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
