//! Embedders: text → fixed-dimension unit vector

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::detection::config::{EmbedderConfig, EmbedderKind};
use crate::detection::errors::{DetectionError, Result};

/// Embedding provider contract
pub trait Embedder: Send + Sync {
    /// Embed a single text into a unit-normalized vector of `dimension()` floats
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving order
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.encode(t)).collect()
    }

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

/// Build the embedder named by configuration
pub fn embedder_from_config(config: &EmbedderConfig, timeout_secs: u64) -> Result<Box<dyn Embedder>> {
    match config.kind {
        EmbedderKind::Hashing => Ok(Box::new(HashingEmbedder::new(config.dimension))),
        EmbedderKind::Http => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                DetectionError::Configuration("rag.embedder.endpoint is required for kind = \"http\"".into())
            })?;
            let model = config.model.clone().unwrap_or_default();
            Ok(Box::new(HttpEmbedder::new(endpoint, model, config.dimension, timeout_secs)?))
        }
    }
}

/// Scale a vector to unit length in place; zero vectors are left alone
pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Feature-hashing embedder over character n-grams.
///
/// Deterministic and model-free. URLs sharing payload fragments
/// (`' or 1=1`, `../`, `<script`) land close together, which is what the
/// similarity shortcut needs.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    ngram: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, ngram: 3 }
    }

    pub fn with_ngram(mut self, ngram: usize) -> Self {
        self.ngram = ngram.max(1);
        self
    }

    /// FNV-1a
    fn bucket(bytes: &[u8], dims: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in bytes {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h as usize) % dims
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();
        if chars.is_empty() || self.dimension == 0 {
            return vec;
        }

        // ordered so colliding grams always sum in the same order
        let mut counts: BTreeMap<String, f32> = BTreeMap::new();
        if chars.len() < self.ngram {
            counts.insert(lowered.clone(), 1.0);
        } else {
            for window in chars.windows(self.ngram) {
                *counts.entry(window.iter().collect()).or_default() += 1.0;
            }
        }

        for (gram, count) in &counts {
            // sublinear tf keeps long repetitive payloads from dominating
            vec[Self::bucket(gram.as_bytes(), self.dimension)] += 1.0 + count.ln();
        }

        l2_normalize(&mut vec);
        vec
    }
}

impl Embedder for HashingEmbedder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint
#[derive(Debug)]
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dimension: usize, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        let endpoint = endpoint.into();
        Ok(Self {
            client,
            url: format!("{}/embeddings", endpoint.trim_end_matches('/')),
            model: model.into(),
            dimension,
        })
    }
}

impl Embedder for HttpEmbedder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        self.encode_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| DetectionError::Embedding("empty embedding response".into()))
    }

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.url)
            .json(&EmbeddingRequest { model: &self.model, input: texts })
            .send()
            .map_err(|e| DetectionError::Embedding(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DetectionError::Embedding(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        let mut body: EmbeddingResponse = response
            .json()
            .map_err(|e| DetectionError::Embedding(e.to_string()))?;

        if body.data.len() != texts.len() {
            return Err(DetectionError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }
        body.data.sort_by_key(|d| d.index);

        body.data
            .into_iter()
            .map(|d| {
                if d.embedding.len() != self.dimension {
                    return Err(DetectionError::Embedding(format!(
                        "expected dimension {}, got {}",
                        self.dimension,
                        d.embedding.len()
                    )));
                }
                let mut v = d.embedding;
                l2_normalize(&mut v);
                Ok(v)
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}
