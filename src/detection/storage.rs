//! Run artifacts on disk
//!
//! Stage-1 results, the anomalous URL list, Stage-2 reports, metrics and
//! the false-positive / false-negative files, plus the loaders for URL lists
//! and Stage-2 input.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::detection::{
    config::OutputConfig,
    deep::{DeepAnalysisReport, Stage2Summary},
    errors::{DetectionError, Result},
    statistics::{MetricsSnapshot, StageErrors},
    DetectionMethod, DetectionResult, Label,
};

/// Counts heading a false-positive or false-negative file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total: usize,
    pub rule: usize,
    pub similarity: usize,
    pub model: usize,
}

impl From<&StageErrors> for ErrorSummary {
    fn from(errors: &StageErrors) -> Self {
        Self {
            total: errors.total(),
            rule: errors.rule.len(),
            similarity: errors.similarity.len(),
            model: errors.model.len(),
        }
    }
}

/// On-disk layout of a false-positive / false-negative file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFile {
    pub summary: ErrorSummary,
    pub cases: Vec<DetectionResult>,
}

/// Writes run artifacts under the configured output directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    output: OutputConfig,
}

impl ArtifactStore {
    pub fn new(output: OutputConfig) -> Self {
        Self { output }
    }

    pub fn stage1_path(&self) -> PathBuf {
        self.output.path(&self.output.stage1_all)
    }

    pub fn anomalous_list_path(&self) -> PathBuf {
        self.output.path(&self.output.anomalous_list)
    }

    pub fn stage2_path(&self) -> PathBuf {
        self.output.path(&self.output.stage2_deep_analysis)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.output.path(&self.output.metrics)
    }

    pub fn false_positives_path(&self) -> PathBuf {
        self.output.path(&self.output.false_positives)
    }

    pub fn false_negatives_path(&self) -> PathBuf {
        self.output.path(&self.output.false_negatives)
    }

    pub fn save_stage1_results(&self, results: &[DetectionResult]) -> Result<PathBuf> {
        let path = self.stage1_path();
        write_json(&path, &results)?;
        info!("💾 Saved {} Stage-1 results to {}", results.len(), path.display());
        Ok(path)
    }

    /// Newline-delimited URLs predicted malicious; returns how many
    pub fn save_anomalous_list(&self, results: &[DetectionResult]) -> Result<usize> {
        let path = self.anomalous_list_path();
        let urls: Vec<&str> = results
            .iter()
            .filter(|r| r.is_malicious())
            .map(|r| r.url.as_str())
            .collect();
        let mut content = urls.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        ensure_parent(&path)?;
        std::fs::write(&path, content)?;
        info!("💾 Saved {} anomalous URLs to {}", urls.len(), path.display());
        Ok(urls.len())
    }

    pub fn save_stage2_reports(&self, reports: &[DeepAnalysisReport], path: Option<&Path>) -> Result<PathBuf> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| self.stage2_path());
        write_json(&path, &reports)?;
        info!("💾 Saved {} Stage-2 reports to {}", reports.len(), path.display());
        Ok(path)
    }

    pub fn save_stage2_summary(&self, summary: &Stage2Summary) -> Result<PathBuf> {
        let path = self.stage2_path().with_extension("summary.json");
        write_json(&path, summary)?;
        Ok(path)
    }

    pub fn save_metrics(&self, snapshot: &MetricsSnapshot) -> Result<PathBuf> {
        let path = self.metrics_path();
        write_json(&path, snapshot)?;
        info!("💾 Saved metrics to {}", path.display());
        Ok(path)
    }

    /// Write both error files from the snapshot's error sets
    pub fn save_error_sets(&self, snapshot: &MetricsSnapshot) -> Result<(PathBuf, PathBuf)> {
        let errors = &snapshot.error_sets;
        let fp_path = self.false_positives_path();
        let fn_path = self.false_negatives_path();

        for (path, set) in [(&fp_path, &errors.false_positives), (&fn_path, &errors.false_negatives)] {
            let file = ErrorFile {
                summary: ErrorSummary::from(set),
                cases: set.all().cloned().collect(),
            };
            write_json(path, &file)?;
        }
        info!(
            "💾 Saved {} false positives and {} false negatives",
            errors.false_positives.total(),
            errors.false_negatives.total()
        );
        Ok((fp_path, fn_path))
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Pretty-printed JSON, creating parent directories
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Read a URL list: lines trimmed, blanks skipped, only the first
/// tab-separated column kept
pub fn load_urls(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(DetectionError::MissingResource(format!("URL list {}", path.display())));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(parse_url_lines(&content))
}

pub fn parse_url_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split('\t').next())
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect()
}

/// Load Stage-1 results written by [`ArtifactStore::save_stage1_results`]
pub fn load_stage1_results(path: &Path) -> Result<Vec<DetectionResult>> {
    if !path.exists() {
        return Err(DetectionError::MissingResource(format!(
            "Stage-1 results {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Stage-2 input: a Stage-1 results JSON (malicious entries only) or a
/// plain URL list, each URL treated as malicious with unknown type
pub fn load_stage2_input(path: &Path) -> Result<Vec<DetectionResult>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let items = match extension.as_deref() {
        Some("json") => load_stage1_results(path)?
            .into_iter()
            .filter(|r| r.is_malicious())
            .collect::<Vec<_>>(),
        Some("txt") | Some("list") => load_urls(path)?
            .into_iter()
            .map(|url| DetectionResult::new(url, Label::Malicious, "unknown", DetectionMethod::External))
            .collect(),
        other => {
            return Err(DetectionError::InvalidInput(format!(
                "unsupported Stage-2 input format {:?} (expected .json or .txt)",
                other.unwrap_or("")
            )))
        }
    };
    info!("📊 Loaded {} URLs for Stage 2 from {}", items.len(), path.display());
    Ok(items)
}
