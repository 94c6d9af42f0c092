//! lexgraph-rag - 법령 문서용 그래프 인식 RAG 시스템
//!
//! 구조 인식 청킹 + LanceDB 벡터 검색 + 관계 그래프 확장 + 대화 메모리를
//! 결합해 법령/규정 코퍼스에 대한 질문에 답합니다.

pub mod cli;
pub mod collector;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod pipeline;

// Re-exports
pub use config::Settings;
pub use embedding::{EmbeddingProvider, OllamaEmbedding};
pub use error::QueryError;
pub use knowledge::{
    Chunk, ChunkConfig, Chunker, GraphExpander, KnowledgeStore, LanceVectorStore,
    MemoryVectorStore, RelationshipGraph, Retriever, SemanticChunker, VectorStore,
};
pub use llm::{ContextBundle, LanguageModel, OllamaChat};
pub use memory::{ConversationMemory, ConversationTurn};
pub use pipeline::{Pipeline, QueryOptions, QueryOrchestrator, QueryOutcome};
