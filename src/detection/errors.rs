//! Detection pipeline error types
//!
//! Every failure inside the pipeline is locally recoverable; these variants
//! let the owning stage decide whether to disable itself, skip an item or
//! fall back to a conservative verdict.

use thiserror::Error;

/// Detection pipeline error type
#[derive(Debug, Error)]
pub enum DetectionError {
    /// A rule file, vector index or metadata file is absent or unreadable
    #[error("Missing resource: {0}")]
    MissingResource(String),

    /// A rule pattern failed to compile
    #[error("Malformed rule {rule_id}: {message}")]
    MalformedRule { rule_id: String, message: String },

    /// Index blob and metadata disagree, or the blob is corrupt
    #[error("Index integrity error: {0}")]
    IndexIntegrity(String),

    /// Retrieval requested while the RAG layer is disabled or not loaded
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Embedder failed to produce a vector
    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// Classifier call failed
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// Configuration value out of range
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caller handed in something the stage does not accept
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport error talking to an external model endpoint
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Detection pipeline result type
pub type Result<T> = std::result::Result<T, DetectionError>;

impl DetectionError {
    /// Errors that only disable one stage or skip one item
    pub fn is_recoverable(&self) -> bool {
        !self.is_critical()
    }

    /// Errors that belong to bootstrap code rather than the pipeline
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Whether this failure should switch retrieval off for the rest of the run
    pub fn disables_retrieval(&self) -> bool {
        matches!(
            self,
            Self::MissingResource(_)
                | Self::IndexIntegrity(_)
                | Self::RetrievalUnavailable(_)
                | Self::Embedding(_)
        )
    }
}

impl From<serde_json::Error> for DetectionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("json: {}", err))
    }
}

impl From<serde_yaml::Error> for DetectionError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(format!("yaml: {}", err))
    }
}

impl From<toml::de::Error> for DetectionError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(format!("toml: {}", err))
    }
}

impl From<toml::ser::Error> for DetectionError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(format!("toml: {}", err))
    }
}

impl From<bincode::Error> for DetectionError {
    fn from(err: bincode::Error) -> Self {
        Self::IndexIntegrity(format!("corrupt index blob: {}", err))
    }
}
