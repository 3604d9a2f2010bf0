//! Flat inner-product vector index
//!
//! Vectors and their metadata are kept in lock-step: position `i` in the
//! vector list describes `entries[i]`. The index is persisted as two files,
//! a bincode vector blob and a JSON metadata document carrying the blob's
//! SHA-256 checksum and entry count, and they are only ever loaded together.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

use crate::detection::errors::{DetectionError, Result};

/// Logical partition of the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Labeled URL examples
    Case,
    /// Free-text attack knowledge
    Knowledge,
}

/// Metadata for one indexed vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexEntry {
    Case {
        text: String,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Knowledge {
        text: String,
        attack_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
}

impl IndexEntry {
    pub fn case(text: impl Into<String>, label: impl Into<String>, source: Option<String>) -> Self {
        Self::Case {
            text: text.into(),
            label: label.into(),
            source,
        }
    }

    pub fn knowledge(attack_id: impl Into<String>, text: impl Into<String>, source: Option<String>) -> Self {
        Self::Knowledge {
            text: text.into(),
            attack_id: attack_id.into(),
            source,
        }
    }

    pub fn partition(&self) -> Partition {
        match self {
            Self::Case { .. } => Partition::Case,
            Self::Knowledge { .. } => Partition::Knowledge,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Case { text, .. } | Self::Knowledge { text, .. } => text,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct IndexBlob {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

/// On-disk metadata document
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub dimension: usize,
    pub count: usize,
    /// Hex SHA-256 of the vector blob
    pub checksum: String,
    pub entries: Vec<IndexEntry>,
}

/// Ordered embedding collection with top-k cosine queries
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Append one vector and its metadata
    pub fn add(&mut self, vector: Vec<f32>, entry: IndexEntry) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(DetectionError::InvalidInput(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        self.vectors.push(vector);
        self.entries.push(entry);
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, position: usize) -> Option<&IndexEntry> {
        self.entries.get(position)
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn count(&self, partition: Partition) -> usize {
        self.entries.iter().filter(|e| e.partition() == partition).count()
    }

    /// Top-k `(position, similarity)` within one partition.
    ///
    /// Similarity is the inner product clamped into `[0, 1]`. Results are
    /// ordered by descending similarity; equal scores keep insertion order.
    pub fn search(&self, query: &[f32], partition: Partition, top_k: usize) -> Vec<(usize, f32)> {
        if top_k == 0 || query.len() != self.dimension {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .par_iter()
            .zip(self.entries.par_iter())
            .enumerate()
            .filter(|(_, (_, entry))| entry.partition() == partition)
            .map(|(pos, (vector, _))| (pos, dot(query, vector).clamp(0.0, 1.0)))
            .collect();

        // stable: ties stay in insertion order
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    /// Write the vector blob and metadata document
    pub fn save(&self, blob_path: &Path, metadata_path: &Path) -> Result<()> {
        let blob = bincode::serialize(&IndexBlob {
            dimension: self.dimension,
            vectors: self.vectors.clone(),
        })
        .map_err(|e| DetectionError::Serialization(format!("bincode: {}", e)))?;

        let metadata = IndexMetadata {
            dimension: self.dimension,
            count: self.entries.len(),
            checksum: checksum(&blob),
            entries: self.entries.clone(),
        };

        for path in [blob_path, metadata_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(blob_path, &blob)?;
        std::fs::write(metadata_path, serde_json::to_string_pretty(&metadata)?)?;

        info!(
            "💾 Saved vector index: {} entries ({} cases, {} knowledge) to {}",
            self.len(),
            self.count(Partition::Case),
            self.count(Partition::Knowledge),
            blob_path.display()
        );
        Ok(())
    }

    /// Load both halves and check they agree with each other and with the
    /// dimension of the embedder that will query them
    pub fn load(blob_path: &Path, metadata_path: &Path, expected_dimension: usize) -> Result<Self> {
        for path in [blob_path, metadata_path] {
            if !path.exists() {
                return Err(DetectionError::MissingResource(format!(
                    "vector index file {}",
                    path.display()
                )));
            }
        }

        let bytes = std::fs::read(blob_path)?;
        let metadata: IndexMetadata = serde_json::from_slice(&std::fs::read(metadata_path)?)
            .map_err(|e| DetectionError::IndexIntegrity(format!("unreadable metadata: {}", e)))?;

        if metadata.checksum != checksum(&bytes) {
            return Err(DetectionError::IndexIntegrity(
                "vector blob checksum does not match metadata".to_string(),
            ));
        }

        let blob: IndexBlob = bincode::deserialize(&bytes)?;

        if blob.vectors.len() != metadata.entries.len() || metadata.count != metadata.entries.len() {
            return Err(DetectionError::IndexIntegrity(format!(
                "length mismatch: {} vectors, {} metadata entries, declared count {}",
                blob.vectors.len(),
                metadata.entries.len(),
                metadata.count
            )));
        }
        if blob.dimension != metadata.dimension || blob.dimension != expected_dimension {
            return Err(DetectionError::IndexIntegrity(format!(
                "dimension mismatch: index {}, metadata {}, embedder {}",
                blob.dimension, metadata.dimension, expected_dimension
            )));
        }
        if let Some(bad) = blob.vectors.iter().position(|v| v.len() != blob.dimension) {
            return Err(DetectionError::IndexIntegrity(format!(
                "vector {} has dimension {}",
                bad,
                blob.vectors[bad].len()
            )));
        }

        debug!("Loaded vector index with {} entries", metadata.entries.len());
        Ok(Self {
            dimension: blob.dimension,
            vectors: blob.vectors,
            entries: metadata.entries,
        })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
