//! Retrieval engine over labeled cases and knowledge chunks

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::detection::config::RagConfig;
use crate::detection::errors::{DetectionError, Result};
use crate::rag::embedding::{embedder_from_config, Embedder};
use crate::rag::index::{IndexEntry, Partition, VectorIndex};

const EMBED_CHUNK: usize = 64;

/// Labeled example fed to the offline build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledCase {
    pub text: String,
    /// `normal`, `attack`, or a specific attack type
    pub label: String,
    /// Corpus file the case was read from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LabeledCase {
    pub fn new(text: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            label: label.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Free-text attack knowledge, as listed in the knowledge YAML file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// Read a YAML list of knowledge chunks
pub fn load_knowledge_file(path: &Path) -> Result<Vec<KnowledgeChunk>> {
    if !path.exists() {
        return Err(DetectionError::MissingResource(format!(
            "knowledge file {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Label normal and attack URL lists for indexing
pub fn build_corpus(normal: &[String], attack: &[String]) -> Vec<LabeledCase> {
    normal
        .iter()
        .map(|u| LabeledCase::new(u.clone(), "normal"))
        .chain(attack.iter().map(|u| LabeledCase::new(u.clone(), "attack")))
        .collect()
}

/// A case returned by a similarity query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedCase {
    pub text: String,
    pub label: String,
    /// Cosine similarity in `[0, 1]`
    pub similarity: f32,
    /// Position in the index
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RetrievedCase {
    pub fn is_normal(&self) -> bool {
        self.label.eq_ignore_ascii_case("normal")
    }
}

/// A knowledge chunk returned by a similarity query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub similarity: f32,
}

/// Nearest-neighbour retrieval; read-only once built or loaded
pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    index: VectorIndex,
}

impl RetrievalEngine {
    pub fn new(embedder: Arc<dyn Embedder>, index: VectorIndex) -> Self {
        Self { embedder, index }
    }

    /// Embed cases and knowledge into a fresh index
    pub fn build(embedder: Arc<dyn Embedder>, cases: &[LabeledCase], knowledge: &[KnowledgeChunk]) -> Result<Self> {
        let mut index = VectorIndex::new(embedder.dimension());

        let case_texts: Vec<String> = cases.iter().map(|c| c.text.clone()).collect();
        for (case, vector) in cases.iter().zip(embed_all(embedder.as_ref(), &case_texts)?) {
            index.add(
                vector,
                IndexEntry::case(case.text.clone(), case.label.clone(), case.source.clone()),
            )?;
        }

        let knowledge_texts: Vec<String> = knowledge.iter().map(|k| k.text.clone()).collect();
        for (chunk, vector) in knowledge.iter().zip(embed_all(embedder.as_ref(), &knowledge_texts)?) {
            index.add(
                vector,
                IndexEntry::knowledge(chunk.id.clone(), chunk.text.clone(), chunk.source.clone()),
            )?;
        }

        info!(
            "🔎 Built retrieval index with {} embedder: {} cases, {} knowledge chunks",
            embedder.name(),
            index.count(Partition::Case),
            index.count(Partition::Knowledge)
        );
        Ok(Self { embedder, index })
    }

    /// Load a persisted index; its dimension must match the embedder
    pub fn load(embedder: Arc<dyn Embedder>, blob_path: &Path, metadata_path: &Path) -> Result<Self> {
        let index = VectorIndex::load(blob_path, metadata_path, embedder.dimension())?;
        info!(
            "✅ Loaded retrieval index: {} cases, {} knowledge chunks",
            index.count(Partition::Case),
            index.count(Partition::Knowledge)
        );
        Ok(Self { embedder, index })
    }

    /// Build the configured embedder and load the configured index
    pub fn from_config(config: &RagConfig, timeout_secs: u64) -> Result<Self> {
        if !config.enabled {
            return Err(DetectionError::RetrievalUnavailable("rag.enabled is false".into()));
        }
        let embedder: Arc<dyn Embedder> = Arc::from(embedder_from_config(&config.embedder, timeout_secs)?);
        Self::load(embedder, &config.index_path, &config.metadata_path)
    }

    pub fn save(&self, blob_path: &Path, metadata_path: &Path) -> Result<()> {
        self.index.save(blob_path, metadata_path)
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Most similar labeled cases, best first
    pub fn retrieve_cases(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedCase>> {
        let vector = self.embedder.encode(query)?;
        Ok(self
            .index
            .search(&vector, Partition::Case, top_k)
            .into_iter()
            .filter_map(|(position, similarity)| match self.index.entry(position) {
                Some(IndexEntry::Case { text, label, source }) => Some(RetrievedCase {
                    text: text.clone(),
                    label: label.clone(),
                    similarity,
                    position,
                    source: source.clone(),
                }),
                _ => None,
            })
            .collect())
    }

    /// Most similar knowledge chunks, best first
    pub fn retrieve_knowledge(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>> {
        if self.index.count(Partition::Knowledge) == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.encode(query)?;
        Ok(self
            .index
            .search(&vector, Partition::Knowledge, top_k)
            .into_iter()
            .filter_map(|(position, similarity)| match self.index.entry(position) {
                Some(IndexEntry::Knowledge { text, attack_id, source }) => Some(KnowledgeHit {
                    id: attack_id.clone(),
                    text: text.clone(),
                    source: source.clone(),
                    similarity,
                }),
                _ => None,
            })
            .collect())
    }
}

fn embed_all(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let chunks: Vec<Vec<Vec<f32>>> = texts
        .par_chunks(EMBED_CHUNK)
        .map(|chunk| embedder.encode_batch(chunk))
        .collect::<Result<_>>()?;
    let vectors: Vec<Vec<f32>> = chunks.into_iter().flatten().collect();

    if vectors.len() != texts.len() {
        warn!("Embedder returned {} vectors for {} texts", vectors.len(), texts.len());
        return Err(DetectionError::Embedding("embedding count mismatch".into()));
    }
    Ok(vectors)
}
