//! Retrieval layer
//!
//! Nearest-neighbour search over two partitions of one vector index:
//! labeled URL cases (used for the similarity shortcut and prompt examples)
//! and knowledge chunks (used as prompt context).

pub mod embedding;
pub mod engine;
pub mod index;

pub use embedding::{embedder_from_config, Embedder, HashingEmbedder, HttpEmbedder};
pub use engine::{
    build_corpus, load_knowledge_file, KnowledgeChunk, KnowledgeHit, LabeledCase, RetrievalEngine,
    RetrievedCase,
};
pub use index::{IndexEntry, IndexMetadata, Partition, VectorIndex};
