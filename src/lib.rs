// src/lib.rs
//! Hybrid URL attack detection.
//!
//! Stage 1 classifies each URL through ordered regex rules, a retrieval
//! similarity shortcut and one classifier call. Stage 2 writes structured
//! reports for the URLs flagged malicious, and a statistics engine scores
//! labeled runs.

pub mod detection;
pub mod rag;

pub use detection::{
    DetectionConfig, DetectionError, DetectionMethod, DetectionResult, HybridDetector, Label, Result,
};
