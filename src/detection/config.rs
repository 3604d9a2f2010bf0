//! 检测配置模块
//!
//! Typed configuration for the whole pipeline. Every section and field has a
//! documented default, so a partial (or empty) TOML file is always usable.
//! Unknown keys are reported with their dotted path and then ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::detection::errors::{DetectionError, Result};

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Rule engine
    pub rules: RulesConfig,
    /// Retrieval layer
    pub rag: RagConfig,
    /// Classifier endpoint and prompt budgets
    pub model: ModelConfig,
    /// Labeled input files
    pub data: DataConfig,
    /// Artifact locations
    pub output: OutputConfig,
    /// Worker pool
    pub pipeline: PipelineConfig,
    /// Attack-type canonicalization
    pub attack_types: AttackTypeConfig,
}

/// `[rules]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub enabled: bool,
    pub normal_rules_file: PathBuf,
    pub anomalous_rules_file: PathBuf,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            normal_rules_file: PathBuf::from("rules/normal_rules.yaml"),
            anomalous_rules_file: PathBuf::from("rules/anomalous_rules.yaml"),
        }
    }
}

/// `[rag]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub enabled: bool,
    /// Best-case similarity at or above this value short-circuits to a verdict
    pub similarity_threshold: f32,
    /// Cases retrieved per query
    pub top_k: usize,
    /// Knowledge chunks retrieved per query; 0 keeps knowledge out of prompts
    pub knowledge_top_k: usize,
    pub index_path: PathBuf,
    pub metadata_path: PathBuf,
    /// YAML list of `{id, text, source}` used by the offline build
    pub knowledge_file: Option<PathBuf>,
    pub embedder: EmbedderConfig,
}

impl RagConfig {
    fn default_similarity_threshold() -> f32 { 0.9 }
    fn default_top_k() -> usize { 5 }
    fn default_knowledge_top_k() -> usize { 3 }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            similarity_threshold: Self::default_similarity_threshold(),
            top_k: Self::default_top_k(),
            knowledge_top_k: Self::default_knowledge_top_k(),
            index_path: PathBuf::from("data/rag/vector.index"),
            metadata_path: PathBuf::from("data/rag/metadata.json"),
            knowledge_file: None,
            embedder: EmbedderConfig::default(),
        }
    }
}

/// Embedder backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    /// Character n-gram feature hashing, no model required
    Hashing,
    /// OpenAI-compatible `/embeddings` endpoint
    Http,
}

/// `[rag.embedder]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub kind: EmbedderKind,
    pub dimension: usize,
    pub endpoint: Option<String>,
    pub model: Option<String>,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            kind: EmbedderKind::Hashing,
            dimension: 512,
            endpoint: None,
            model: None,
        }
    }
}

/// `[model]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible server, e.g. `http://127.0.0.1:8000/v1`
    pub endpoint: String,
    pub name: String,
    /// Environment variable holding a bearer token, if the server needs one
    pub api_key_env: Option<String>,
    /// Client-side request timeout
    pub timeout_secs: u64,
    pub fast_detection: FastDetectionConfig,
    pub deep_analysis: DeepAnalysisConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/v1".to_string(),
            name: "qwen3-0.6b".to_string(),
            api_key_env: None,
            timeout_secs: 120,
            fast_detection: FastDetectionConfig::default(),
            deep_analysis: DeepAnalysisConfig::default(),
        }
    }
}

/// `[model.fast_detection]` - terse verdict prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastDetectionConfig {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub use_rag: bool,
}

impl Default for FastDetectionConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            temperature: 0.0,
            use_rag: true,
        }
    }
}

/// `[model.deep_analysis]` - structured report prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepAnalysisConfig {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub use_rag: bool,
}

impl Default for DeepAnalysisConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            temperature: 0.3,
            use_rag: true,
        }
    }
}

/// `[data]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub dir: PathBuf,
    pub normal_file: String,
    pub attack_file: String,
}

impl DataConfig {
    pub fn normal_path(&self) -> PathBuf {
        self.dir.join(&self.normal_file)
    }

    pub fn attack_path(&self) -> PathBuf {
        self.dir.join(&self.attack_file)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            normal_file: "normal.txt".to_string(),
            attack_file: "attack.txt".to_string(),
        }
    }
}

/// `[output]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub stage1_all: String,
    pub anomalous_list: String,
    pub stage2_deep_analysis: String,
    pub metrics: String,
    pub false_positives: String,
    pub false_negatives: String,
}

impl OutputConfig {
    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            stage1_all: "stage1_realtime_all.json".to_string(),
            anomalous_list: "stage1_anomalous.txt".to_string(),
            stage2_deep_analysis: "stage2_deep_analysis.json".to_string(),
            metrics: "stage1_metrics.json".to_string(),
            false_positives: "false_positives.json".to_string(),
            false_negatives: "false_negatives.json".to_string(),
        }
    }
}

/// `[pipeline]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on URLs (and therefore Classifier calls) in flight
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

/// `[attack_types]` - optional alias table, e.g. `SQLi = "sql_injection"`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackTypeConfig {
    pub aliases: BTreeMap<String, String>,
}

impl AttackTypeConfig {
    /// Map a raw label through the alias table (case-insensitive lookup).
    /// Labels without an alias pass through unchanged.
    pub fn canonicalize(&self, label: &str) -> String {
        let trimmed = label.trim();
        self.aliases
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
            .map(|(_, canonical)| canonical.clone())
            .unwrap_or_else(|| trimmed.to_string())
    }
}

/// Section paths whose children are checked against [`KNOWN_KEYS`]
const KNOWN_SECTIONS: &[&str] = &[
    "rules",
    "rag",
    "rag.embedder",
    "model",
    "model.fast_detection",
    "model.deep_analysis",
    "data",
    "output",
    "pipeline",
    "attack_types",
];

/// Tables whose keys are user data, not settings
const OPEN_TABLES: &[&str] = &["attack_types.aliases"];

const KNOWN_KEYS: &[&str] = &[
    "rules.enabled",
    "rules.normal_rules_file",
    "rules.anomalous_rules_file",
    "rag.enabled",
    "rag.similarity_threshold",
    "rag.top_k",
    "rag.knowledge_top_k",
    "rag.index_path",
    "rag.metadata_path",
    "rag.knowledge_file",
    "rag.embedder.kind",
    "rag.embedder.dimension",
    "rag.embedder.endpoint",
    "rag.embedder.model",
    "model.endpoint",
    "model.name",
    "model.api_key_env",
    "model.timeout_secs",
    "model.fast_detection.max_new_tokens",
    "model.fast_detection.temperature",
    "model.fast_detection.use_rag",
    "model.deep_analysis.max_new_tokens",
    "model.deep_analysis.temperature",
    "model.deep_analysis.use_rag",
    "data.dir",
    "data.normal_file",
    "data.attack_file",
    "output.dir",
    "output.stage1_all",
    "output.anomalous_list",
    "output.stage2_deep_analysis",
    "output.metrics",
    "output.false_positives",
    "output.false_negatives",
    "pipeline.workers",
];

impl DetectionConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DetectionError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration text; unknown keys are logged and ignored
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(content)?;
        for key in Self::unknown_keys(&raw) {
            warn!("Ignoring unknown configuration key `{}`", key);
        }
        let config: Self = raw.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Dotted paths of every key the configuration does not recognize
    pub fn unknown_keys(raw: &toml::Value) -> Vec<String> {
        let mut unknown = Vec::new();
        if let Some(table) = raw.as_table() {
            collect_unknown("", table, &mut unknown);
        }
        unknown
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.rag.similarity_threshold) {
            return Err(DetectionError::Configuration(format!(
                "rag.similarity_threshold must be within [0, 1], got {}",
                self.rag.similarity_threshold
            )));
        }
        if self.rag.top_k == 0 {
            return Err(DetectionError::Configuration(
                "rag.top_k must be greater than 0".to_string(),
            ));
        }
        if self.rag.embedder.dimension == 0 {
            return Err(DetectionError::Configuration(
                "rag.embedder.dimension must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(DetectionError::Configuration(
                "pipeline.workers must be greater than 0".to_string(),
            ));
        }
        if self.model.fast_detection.temperature < 0.0 || self.model.deep_analysis.temperature < 0.0 {
            return Err(DetectionError::Configuration(
                "model temperatures must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn collect_unknown(prefix: &str, table: &toml::value::Table, unknown: &mut Vec<String>) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        if OPEN_TABLES.contains(&path.as_str()) {
            continue;
        }
        if KNOWN_SECTIONS.contains(&path.as_str()) {
            match value.as_table() {
                Some(child) => collect_unknown(&path, child, unknown),
                None => unknown.push(path),
            }
        } else if !KNOWN_KEYS.contains(&path.as_str()) {
            unknown.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DetectionConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.rules.enabled);
        assert!(!config.rag.enabled);
        assert_eq!(config.rag.top_k, 5);
        assert_eq!(config.pipeline.workers, 1);
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = DetectionConfig::from_toml_str("").unwrap();
        assert_eq!(config, DetectionConfig::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = DetectionConfig::from_toml_str(
            r#"
            [rag]
            enabled = true
            similarity_threshold = 0.85

            [model.deep_analysis]
            max_new_tokens = 2048
            "#,
        )
        .unwrap();

        assert!(config.rag.enabled);
        assert_eq!(config.rag.similarity_threshold, 0.85);
        assert_eq!(config.rag.top_k, 5);
        assert_eq!(config.model.deep_analysis.max_new_tokens, 2048);
        assert!(config.model.deep_analysis.use_rag);
        assert_eq!(config.model.fast_detection.max_new_tokens, 32);
    }

    #[test]
    fn test_unknown_keys_are_reported_not_fatal() {
        let raw: toml::Value = toml::from_str(
            r#"
            [rag]
            enabeld = true
            top_k = 3

            [attack_types.aliases]
            SQLi = "sql_injection"

            [telemetry]
            url = "x"
            "#,
        )
        .unwrap();

        let unknown = DetectionConfig::unknown_keys(&raw);
        assert_eq!(unknown, vec!["rag.enabeld".to_string(), "telemetry".to_string()]);

        let config: DetectionConfig = raw.try_into().unwrap();
        assert_eq!(config.rag.top_k, 3);
        assert!(!config.rag.enabled);
    }

    #[test]
    fn test_config_validation() {
        let mut config = DetectionConfig::default();
        config.rag.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = DetectionConfig::default();
        config.pipeline.workers = 0;
        assert!(config.validate().is_err());

        assert!(DetectionConfig::from_toml_str("[rag]\ntop_k = 0\n").is_err());
    }

    #[test]
    fn test_alias_canonicalization() {
        let mut config = AttackTypeConfig::default();
        config.aliases.insert("SQLi".to_string(), "sql_injection".to_string());

        assert_eq!(config.canonicalize("sqli"), "sql_injection");
        assert_eq!(config.canonicalize(" SQLi "), "sql_injection");
        assert_eq!(config.canonicalize("xss"), "xss");
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");

        let mut config = DetectionConfig::default();
        config.rag.enabled = true;
        config.attack_types.aliases.insert("SQLi".into(), "sql_injection".into());
        config.save_to_file(&path).unwrap();

        let loaded = DetectionConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
