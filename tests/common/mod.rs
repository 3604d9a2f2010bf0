// tests/common/mod.rs
// Shared stubs for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url_sentinel::detection::{Classifier, DetectionError, GenerationParams, Prompt, Result};
use url_sentinel::rag::Embedder;

/// Returns one fixed reply and counts calls
pub struct CountingClassifier {
    reply: Option<String>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Prompt>>,
}

impl CountingClassifier {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Every call fails
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.prompts.lock().last().cloned()
    }
}

impl Classifier for CountingClassifier {
    fn generate(&self, prompt: &Prompt, _params: &GenerationParams) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.clone());
        self.reply
            .clone()
            .ok_or_else(|| DetectionError::Classifier("stub endpoint unavailable".into()))
    }

    fn name(&self) -> &str {
        "counting-stub"
    }
}

/// Looks texts up in a table; unknown texts get the fallback vector
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fallback: Vec<f32>,
}

impl FixedEmbedder {
    pub fn new(fallback: Vec<f32>) -> Self {
        Self {
            vectors: HashMap::new(),
            fallback,
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }
}

impl Embedder for FixedEmbedder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectors.get(text).cloned().unwrap_or_else(|| self.fallback.clone()))
    }

    fn dimension(&self) -> usize {
        self.fallback.len()
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Embeds successfully for the first `budget` calls, then fails every call
pub struct FlakyEmbedder {
    budget: usize,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(budget: usize) -> Arc<Self> {
        Arc::new(Self {
            budget,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for FlakyEmbedder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.budget {
            Ok(if text.contains("attack") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
        } else {
            Err(DetectionError::Embedding("embedding endpoint went away".into()))
        }
    }

    fn dimension(&self) -> usize {
        2
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// Unit vector in the plane whose dot product with `[1, 0]` is `cos`
pub fn at_cosine(cos: f32) -> Vec<f32> {
    vec![cos, (1.0 - cos * cos).sqrt()]
}
