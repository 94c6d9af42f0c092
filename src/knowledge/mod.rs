//! Knowledge 모듈 - 법령 코퍼스 지식 계층
//!
//! - Chunker: 장/절/조 구조 인식 분할
//! - SQLite: 문서 처리 상태 + 청크 본문
//! - LanceDB: 청크 임베딩 벡터 검색
//! - Graph: 포함/순서/인용 관계 그래프
//! - Retriever + Expander: 검색, 리랭크, 그래프 확장

mod chunker;
mod expander;
mod graph;
mod lance;
mod retriever;
mod store;
mod vector;

// Re-exports
pub use chunker::{
    content_hash, is_annex_label, normalize_label, semantic_chunker, Chunk,
    ChunkConfig, Chunker, DocumentMeta, SemanticChunker,
};
pub use expander::{ChunkOrigin, ExpandedChunk, ExpanderConfig, ExpansionTier, GraphExpander};
pub use graph::{
    extract_mentions, structure_id, DocumentStructure, EdgeKind, GraphEdge, GraphNode, GraphStats,
    NodeKind, RelationshipGraph, StructureEntry,
};
pub use lance::LanceVectorStore;
pub use retriever::{Retriever, RetrieverConfig, ScoredChunk};
pub use store::{DocumentStatus, KnowledgeStore, StoreStats};
pub use vector::{
    cosine_similarity, MemoryVectorStore, SearchResult, VectorEntry, VectorStore,
    DEFAULT_EMBEDDING_DIMENSION,
};

pub(crate) use store::parse_datetime;
