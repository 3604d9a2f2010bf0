//! Stage-1 evaluation
//!
//! Folds an immutable sequence of detection results into a
//! [`MetricsSnapshot`]: confusion matrix and derived ratios, per-method and
//! per-rule breakdowns, timing, and the misclassified items partitioned by
//! the stage that decided them. Snapshots merge, so large runs can be
//! aggregated map-then-reduce.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::warn;

use crate::detection::rules::RuleClass;
use crate::detection::{DetectionMethod, DetectionResult, Label};

/// Binary confusion matrix; malicious is the positive class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub tn: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, truth: Label, predicted: Label) {
        match (truth.is_malicious(), predicted.is_malicious()) {
            (true, true) => self.tp += 1,
            (false, false) => self.tn += 1,
            (false, true) => self.fp += 1,
            (true, false) => self.fn_ += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.tp + self.tn + self.fp + self.fn_
    }

    pub fn merge(&mut self, other: &Self) {
        self.tp += other.tp;
        self.tn += other.tn;
        self.fp += other.fp;
        self.fn_ += other.fn_;
    }
}

/// Derived ratios, fractions in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub fpr: f64,
    pub fnr: f64,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl Metrics {
    /// Zero denominators yield 0
    pub fn from_confusion_matrix(cm: &ConfusionMatrix) -> Self {
        let precision = ratio(cm.tp, cm.tp + cm.fp);
        let recall = ratio(cm.tp, cm.tp + cm.fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            accuracy: ratio(cm.tp + cm.tn, cm.total()),
            precision,
            recall,
            f1,
            fpr: ratio(cm.fp, cm.fp + cm.tn),
            fnr: ratio(cm.fn_, cm.fn_ + cm.tp),
        }
    }

    pub fn table_header() -> String {
        format!(
            "| {:<16} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8} |",
            "Scope", "Acc", "Prec", "Rec", "F1", "FPR", "FNR"
        )
    }

    /// One table row, ratios rendered as percentages
    pub fn to_table_row(&self, name: &str) -> String {
        format!(
            "| {:<16} | {:>7.2}% | {:>7.2}% | {:>7.2}% | {:>7.2}% | {:>7.2}% | {:>7.2}% |",
            name,
            self.accuracy * 100.0,
            self.precision * 100.0,
            self.recall * 100.0,
            self.f1 * 100.0,
            self.fpr * 100.0,
            self.fnr * 100.0,
        )
    }
}

/// Per detection-method breakdown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodStats {
    /// All items decided by this method, labeled or not
    pub count: usize,
    pub confusion: ConfusionMatrix,
    pub metrics: Metrics,
    pub total_elapsed: f64,
    pub average_elapsed: f64,
}

impl MethodStats {
    fn observe(&mut self, result: &DetectionResult) {
        self.count += 1;
        self.total_elapsed += result.elapsed_time;
        if let Some(truth) = result.true_label {
            self.confusion.record(truth, result.predicted);
        }
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.total_elapsed += other.total_elapsed;
        self.confusion.merge(&other.confusion);
    }

    fn finalize(&mut self) {
        self.metrics = Metrics::from_confusion_matrix(&self.confusion);
        self.average_elapsed = if self.count == 0 {
            0.0
        } else {
            self.total_elapsed / self.count as f64
        };
    }
}

/// Per-rule usage and accuracy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStats {
    pub rule_id: String,
    pub rule_name: String,
    pub rule_class: RuleClass,
    pub usage: usize,
    /// Uses with a ground-truth label
    pub labeled: usize,
    pub correct: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub accuracy: f64,
    pub total_elapsed: f64,
    pub average_elapsed: f64,
}

impl RuleStats {
    fn new(rule_id: &str, rule_name: &str, rule_class: RuleClass) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            rule_name: rule_name.to_string(),
            rule_class,
            usage: 0,
            labeled: 0,
            correct: 0,
            false_positives: 0,
            false_negatives: 0,
            accuracy: 0.0,
            total_elapsed: 0.0,
            average_elapsed: 0.0,
        }
    }

    fn observe(&mut self, result: &DetectionResult) {
        self.usage += 1;
        self.total_elapsed += result.elapsed_time;
        if let Some(truth) = result.true_label {
            self.labeled += 1;
            match (truth, result.predicted) {
                (t, p) if t == p => self.correct += 1,
                (Label::Benign, Label::Malicious) => self.false_positives += 1,
                _ => self.false_negatives += 1,
            }
        }
    }

    fn merge(&mut self, other: &Self) {
        self.usage += other.usage;
        self.labeled += other.labeled;
        self.correct += other.correct;
        self.false_positives += other.false_positives;
        self.false_negatives += other.false_negatives;
        self.total_elapsed += other.total_elapsed;
    }

    fn finalize(&mut self) {
        self.accuracy = ratio(self.correct, self.labeled);
        self.average_elapsed = if self.usage == 0 {
            0.0
        } else {
            self.total_elapsed / self.usage as f64
        };
    }
}

/// Stage that produced a misclassification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Rule,
    Similarity,
    Model,
}

impl From<DetectionMethod> for ErrorStage {
    fn from(method: DetectionMethod) -> Self {
        match method {
            DetectionMethod::RuleNormal | DetectionMethod::RuleAnomalous => Self::Rule,
            DetectionMethod::RagSimilarity => Self::Similarity,
            DetectionMethod::Model | DetectionMethod::ModelWithRag | DetectionMethod::External => Self::Model,
        }
    }
}

/// Misclassified results of one kind, partitioned by deciding stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageErrors {
    pub rule: Vec<DetectionResult>,
    pub similarity: Vec<DetectionResult>,
    pub model: Vec<DetectionResult>,
}

impl StageErrors {
    fn push(&mut self, result: &DetectionResult) {
        let bucket = match ErrorStage::from(result.detection_method) {
            ErrorStage::Rule => &mut self.rule,
            ErrorStage::Similarity => &mut self.similarity,
            ErrorStage::Model => &mut self.model,
        };
        bucket.push(result.clone());
    }

    fn merge(&mut self, other: &Self) {
        self.rule.extend(other.rule.iter().cloned());
        self.similarity.extend(other.similarity.iter().cloned());
        self.model.extend(other.model.iter().cloned());
    }

    pub fn total(&self) -> usize {
        self.rule.len() + self.similarity.len() + self.model.len()
    }

    /// Every result in stage order
    pub fn all(&self) -> impl Iterator<Item = &DetectionResult> {
        self.rule.iter().chain(&self.similarity).chain(&self.model)
    }
}

/// False positives and false negatives
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSets {
    pub false_positives: StageErrors,
    pub false_negatives: StageErrors,
}

/// Aggregated Stage-1 statistics for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total: usize,
    pub labeled: usize,
    /// Items without ground truth; excluded from the confusion matrix
    pub unlabeled: usize,
    /// Items carrying an error marker
    pub errors: usize,
    pub predicted_malicious: usize,
    pub predicted_benign: usize,
    pub confusion: ConfusionMatrix,
    pub metrics: Metrics,
    pub by_method: BTreeMap<DetectionMethod, MethodStats>,
    pub by_rule: BTreeMap<String, RuleStats>,
    /// Attack type → count, over items predicted malicious
    pub attack_types: BTreeMap<String, usize>,
    pub rule_hit_rate: f64,
    pub similarity_hit_rate: f64,
    pub model_call_rate: f64,
    pub total_elapsed: f64,
    pub average_elapsed: f64,
    /// Wall-clock seconds for the Stage-1 run, when measured by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage1_wall_time: Option<f64>,
    /// Persisted separately from the metrics document
    #[serde(skip)]
    pub error_sets: ErrorSets,
}

impl MetricsSnapshot {
    fn observe(&mut self, result: &DetectionResult) {
        self.total += 1;
        self.total_elapsed += result.elapsed_time;
        if result.error.is_some() {
            self.errors += 1;
        }

        match result.predicted {
            Label::Malicious => {
                self.predicted_malicious += 1;
                *self.attack_types.entry(result.attack_type.clone()).or_insert(0) += 1;
            }
            Label::Benign => self.predicted_benign += 1,
        }

        match result.true_label {
            Some(truth) => {
                self.labeled += 1;
                self.confusion.record(truth, result.predicted);
                match (truth, result.predicted) {
                    (Label::Benign, Label::Malicious) => self.error_sets.false_positives.push(result),
                    (Label::Malicious, Label::Benign) => self.error_sets.false_negatives.push(result),
                    _ => {}
                }
            }
            None => self.unlabeled += 1,
        }

        self.by_method
            .entry(result.detection_method)
            .or_default()
            .observe(result);

        // a rule-decided result carries exactly one matched rule
        if result.detection_method.is_rule() {
            if let Some(hit) = result.matched_rules.first() {
                self.by_rule
                    .entry(hit.rule_id.clone())
                    .or_insert_with(|| RuleStats::new(&hit.rule_id, &hit.rule_name, hit.rule_class))
                    .observe(result);
            }
        }
    }

    /// Combine two partial snapshots; derived values are recomputed
    pub fn merge(mut self, other: Self) -> Self {
        self.total += other.total;
        self.labeled += other.labeled;
        self.unlabeled += other.unlabeled;
        self.errors += other.errors;
        self.predicted_malicious += other.predicted_malicious;
        self.predicted_benign += other.predicted_benign;
        self.confusion.merge(&other.confusion);
        self.total_elapsed += other.total_elapsed;

        for (method, stats) in &other.by_method {
            self.by_method.entry(*method).or_default().merge(stats);
        }
        for (id, stats) in other.by_rule {
            match self.by_rule.get_mut(&id) {
                Some(existing) => existing.merge(&stats),
                None => {
                    self.by_rule.insert(id, stats);
                }
            }
        }
        for (attack_type, count) in other.attack_types {
            *self.attack_types.entry(attack_type).or_insert(0) += count;
        }
        self.error_sets.false_positives.merge(&other.error_sets.false_positives);
        self.error_sets.false_negatives.merge(&other.error_sets.false_negatives);
        self.stage1_wall_time = match (self.stage1_wall_time, other.stage1_wall_time) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };

        self.finalize();
        self
    }

    fn method_count(&self, methods: &[DetectionMethod]) -> usize {
        methods
            .iter()
            .filter_map(|m| self.by_method.get(m))
            .map(|s| s.count)
            .sum()
    }

    fn finalize(&mut self) {
        self.metrics = Metrics::from_confusion_matrix(&self.confusion);
        for stats in self.by_method.values_mut() {
            stats.finalize();
        }
        for stats in self.by_rule.values_mut() {
            stats.finalize();
        }

        let rule = self.method_count(&[DetectionMethod::RuleNormal, DetectionMethod::RuleAnomalous]);
        let similarity = self.method_count(&[DetectionMethod::RagSimilarity]);
        let model = self.method_count(&[DetectionMethod::Model, DetectionMethod::ModelWithRag]);
        self.rule_hit_rate = ratio(rule, self.total);
        self.similarity_hit_rate = ratio(similarity, self.total);
        self.model_call_rate = ratio(model, self.total);
        self.average_elapsed = if self.total == 0 {
            0.0
        } else {
            self.total_elapsed / self.total as f64
        };
    }

    pub fn with_wall_time(mut self, seconds: f64) -> Self {
        self.stage1_wall_time = Some(seconds);
        self
    }

    /// Human-readable report: confusion matrix, metrics, method breakdown
    pub fn render_report(&self) -> String {
        let cm = &self.confusion;
        let mut out = String::new();

        let _ = writeln!(out, "Stage 1 results: {} URLs ({} labeled, {} unlabeled, {} errors)",
            self.total, self.labeled, self.unlabeled, self.errors);
        let _ = writeln!(out, "Predicted malicious: {}, predicted benign: {}", self.predicted_malicious, self.predicted_benign);
        if let Some(wall) = self.stage1_wall_time {
            let _ = writeln!(out, "Wall time: {:.2}s ({:.4}s per URL)", wall, wall / self.total.max(1) as f64);
        }

        let _ = writeln!(out, "\nConfusion matrix");
        let _ = writeln!(out, "| {:<16} | {:>12} | {:>12} |", "", "Pred benign", "Pred malicious");
        let _ = writeln!(out, "| {:<16} | {:>12} | {:>12} |", "True benign", cm.tn, cm.fp);
        let _ = writeln!(out, "| {:<16} | {:>12} | {:>12} |", "True malicious", cm.fn_, cm.tp);

        let _ = writeln!(out, "\nMetrics");
        let _ = writeln!(out, "{}", Metrics::table_header());
        let _ = writeln!(out, "{}", self.metrics.to_table_row("overall"));
        for (method, stats) in &self.by_method {
            let _ = writeln!(out, "{}", stats.metrics.to_table_row(method.as_str()));
        }

        let _ = writeln!(out, "\nDetection methods");
        for (method, stats) in &self.by_method {
            let _ = writeln!(
                out,
                "  {:<16} {:>6} ({:>5.1}%)  avg {:.4}s",
                method.as_str(),
                stats.count,
                ratio(stats.count, self.total) * 100.0,
                stats.average_elapsed
            );
        }
        let _ = writeln!(
            out,
            "  rule hit rate {:.1}%, similarity hit rate {:.1}%, model call rate {:.1}%",
            self.rule_hit_rate * 100.0,
            self.similarity_hit_rate * 100.0,
            self.model_call_rate * 100.0
        );

        if !self.attack_types.is_empty() {
            let _ = writeln!(out, "\nAttack types");
            let mut types: Vec<(&String, &usize)> = self.attack_types.iter().collect();
            types.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            for (attack_type, count) in types {
                let _ = writeln!(
                    out,
                    "  {:<20} {:>6} ({:>5.1}%)",
                    attack_type,
                    count,
                    ratio(*count, self.predicted_malicious) * 100.0
                );
            }
        }

        if !self.by_rule.is_empty() {
            let _ = writeln!(out, "\nRules");
            for stats in self.by_rule.values() {
                let _ = writeln!(
                    out,
                    "  {:<12} {:<10} used {:>5}, accuracy {:>6.2}%, FP {}, FN {}, avg {:.6}s",
                    stats.rule_id,
                    stats.rule_class.as_str(),
                    stats.usage,
                    stats.accuracy * 100.0,
                    stats.false_positives,
                    stats.false_negatives,
                    stats.average_elapsed
                );
            }
        }
        out
    }
}

/// Builds snapshots from detection results
#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticsEngine;

impl StatisticsEngine {
    pub fn new() -> Self {
        Self
    }

    /// Fold a result sequence into a snapshot. An empty sequence logs a
    /// warning and yields the all-zero snapshot.
    pub fn ingest(&self, results: &[DetectionResult]) -> MetricsSnapshot {
        if results.is_empty() {
            warn!("⚠️ No detection results to aggregate; metrics are all zero");
            return MetricsSnapshot::default();
        }
        fold(results)
    }

    /// Same as [`ingest`](Self::ingest), computed chunk-wise in parallel and
    /// merged in input order
    pub fn ingest_parallel(&self, results: &[DetectionResult], chunk_size: usize) -> MetricsSnapshot {
        if results.is_empty() {
            return self.ingest(results);
        }
        results
            .par_chunks(chunk_size.max(1))
            .map(fold)
            .reduce(MetricsSnapshot::default, MetricsSnapshot::merge)
    }
}

fn fold(results: &[DetectionResult]) -> MetricsSnapshot {
    let mut snapshot = MetricsSnapshot::default();
    for result in results {
        snapshot.observe(result);
    }
    snapshot.finalize();
    snapshot
}
