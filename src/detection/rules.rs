//! URL rule engine
//!
//! Deterministic regex classifier over two ordered rule sets. Anomalous
//! rules are always consulted first, then normal rules; the first match
//! inside a class wins. A URL matching neither set is deferred to the rest
//! of the pipeline.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::detection::config::RulesConfig;
use crate::detection::errors::{DetectionError, Result};
use crate::detection::Label;

/// Rule severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Which rule set produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleClass {
    Normal,
    Anomalous,
    None,
}

impl RuleClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Anomalous => "anomalous",
            Self::None => "none",
        }
    }
}

impl fmt::Display for RuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule as written in a rule file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub pattern: String,
    #[serde(default = "RuleDefinition::default_attack_type")]
    pub attack_type: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
}

impl RuleDefinition {
    fn default_attack_type() -> String {
        "unknown".to_string()
    }

    /// Convenience constructor used by tests and embedded rule sets
    pub fn new(id: &str, pattern: &str, attack_type: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            pattern: pattern.to_string(),
            attack_type: attack_type.to_string(),
            severity: Severity::default(),
            description: String::new(),
        }
    }
}

/// Rule file layout: a top-level `rules:` list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// A compiled, immutable rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub pattern: String,
    pub attack_type: String,
    pub severity: Severity,
    pub description: String,
    regex: Regex,
}

impl Rule {
    /// Compile a definition; patterns match case-insensitively
    pub fn compile(def: RuleDefinition) -> Result<Self> {
        let regex = RegexBuilder::new(&def.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| DetectionError::MalformedRule {
                rule_id: def.id.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            id: def.id,
            name: def.name,
            pattern: def.pattern,
            attack_type: def.attack_type,
            severity: def.severity,
            description: def.description,
            regex,
        })
    }

    fn find(&self, url: &str, class: RuleClass) -> Option<RuleMatch> {
        self.regex.find(url).map(|m| RuleMatch {
            rule_id: self.id.clone(),
            rule_name: self.name.clone(),
            rule_class: class,
            attack_type: self.attack_type.clone(),
            severity: self.severity,
            matched_text: m.as_str().to_string(),
            description: self.description.clone(),
        })
    }
}

/// A single rule hit against a URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub rule_class: RuleClass,
    pub attack_type: String,
    pub severity: Severity,
    pub matched_text: String,
    pub description: String,
}

/// Ordered normal and anomalous rule sequences
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub normal_rules: Vec<Rule>,
    pub anomalous_rules: Vec<Rule>,
}

impl RuleSet {
    /// Compile both sequences, skipping (and logging) malformed patterns
    pub fn from_definitions(normal: Vec<RuleDefinition>, anomalous: Vec<RuleDefinition>) -> Self {
        Self {
            normal_rules: compile_all(normal, RuleClass::Normal),
            anomalous_rules: compile_all(anomalous, RuleClass::Anomalous),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normal_rules.is_empty() && self.anomalous_rules.is_empty()
    }
}

fn compile_all(defs: Vec<RuleDefinition>, class: RuleClass) -> Vec<Rule> {
    defs.into_iter()
        .filter_map(|def| match Rule::compile(def) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!("Skipping {} rule: {}", class, e);
                None
            }
        })
        .collect()
}

/// Read a YAML rule file
pub fn load_rule_file(path: &Path) -> Result<Vec<RuleDefinition>> {
    if !path.exists() {
        return Err(DetectionError::MissingResource(format!(
            "rule file {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    let file: RuleFile = serde_yaml::from_str(&content)?;
    Ok(file.rules)
}

/// Result of running the rule engine over one URL
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    /// `None` defers the decision to the rest of the pipeline
    pub predicted: Option<Label>,
    pub matches: Vec<RuleMatch>,
    pub class: RuleClass,
}

impl RuleOutcome {
    pub fn none() -> Self {
        Self {
            predicted: None,
            matches: Vec::new(),
            class: RuleClass::None,
        }
    }
}

/// Rule engine for classifying URLs against the loaded rule sets
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: RuleSet,
    enabled: bool,
}

impl RuleEngine {
    /// Create an enabled engine over a compiled rule set
    pub fn new(rules: RuleSet) -> Self {
        Self { rules, enabled: true }
    }

    /// An engine that defers every URL
    pub fn disabled() -> Self {
        Self {
            rules: RuleSet::default(),
            enabled: false,
        }
    }

    /// Build the engine from configuration. A missing or unreadable rule
    /// file only leaves that class empty.
    pub fn from_config(config: &RulesConfig) -> Self {
        if !config.enabled {
            warn!("Rule engine disabled by configuration");
            return Self::disabled();
        }

        let normal = load_class(&config.normal_rules_file, RuleClass::Normal);
        let anomalous = load_class(&config.anomalous_rules_file, RuleClass::Anomalous);
        let engine = Self::new(RuleSet::from_definitions(normal, anomalous));

        let (normal_count, anomalous_count) = engine.rule_counts();
        info!(
            "📊 Rule engine ready: {} normal rules, {} anomalous rules",
            normal_count, anomalous_count
        );
        engine
    }

    /// Classify a URL: anomalous rules first, then normal rules
    pub fn detect(&self, url: &str) -> RuleOutcome {
        if !self.enabled {
            return RuleOutcome::none();
        }

        if let Some(hit) = first_match(&self.rules.anomalous_rules, url, RuleClass::Anomalous) {
            return RuleOutcome {
                predicted: Some(Label::Malicious),
                matches: vec![hit],
                class: RuleClass::Anomalous,
            };
        }

        if let Some(hit) = first_match(&self.rules.normal_rules, url, RuleClass::Normal) {
            return RuleOutcome {
                predicted: Some(Label::Benign),
                matches: vec![hit],
                class: RuleClass::Normal,
            };
        }

        RuleOutcome::none()
    }

    /// One-line description of an outcome
    pub fn summary(&self, outcome: &RuleOutcome) -> String {
        match outcome.matches.first() {
            None => "No rule matched".to_string(),
            Some(hit) => match outcome.class {
                RuleClass::Anomalous => format!(
                    "Anomalous rule {} ({}) matched `{}`: attack type {}, severity {:?}",
                    hit.rule_id, hit.rule_name, hit.matched_text, hit.attack_type, hit.severity
                ),
                _ => format!(
                    "Normal rule {} ({}) matched `{}`",
                    hit.rule_id, hit.rule_name, hit.matched_text
                ),
            },
        }
    }

    /// `(normal, anomalous)` rule counts
    pub fn rule_counts(&self) -> (usize, usize) {
        (self.rules.normal_rules.len(), self.rules.anomalous_rules.len())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

fn first_match(rules: &[Rule], url: &str, class: RuleClass) -> Option<RuleMatch> {
    rules.iter().find_map(|rule| rule.find(url, class))
}

fn load_class(path: &Path, class: RuleClass) -> Vec<RuleDefinition> {
    match load_rule_file(path) {
        Ok(defs) => {
            info!("✅ Loaded {} {} rules from {}", defs.len(), class, path.display());
            defs
        }
        Err(e) => {
            warn!("⚠️ {} rules unavailable: {}", class, e);
            Vec::new()
        }
    }
}
