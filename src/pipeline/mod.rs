//! 파이프라인 - 저장소와 협력자 조립
//!
//! 첫 질의 전에 모든 영속 상태(지식 DB, 벡터 인덱스, 그래프, 대화 메모리)를
//! 불러옵니다. 그래프 스냅샷이 없거나 읽을 수 없으면 저장된 청크로 다시 만듭니다.

mod ingest;
mod orchestrator;

pub use ingest::{IngestReport, Ingestor, SourceDocument};
pub use orchestrator::{
    Answer, MemoryWrite, PreparedQuery, QueryOptions, QueryOrchestrator, QueryOutcome,
    StreamOutcome,
};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::Settings;
use crate::embedding::{EmbeddingProvider, OllamaEmbedding};
use crate::knowledge::{
    semantic_chunker, ChunkConfig, Chunker, GraphExpander, GraphStats, KnowledgeStore,
    LanceVectorStore, RelationshipGraph, Retriever, StoreStats, VectorStore,
};
use crate::llm::{LanguageModel, OllamaChat};
use crate::memory::{ConversationMemory, MemorySummary};

// ============================================================================
// System Status
// ============================================================================

/// 전체 상태
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub store: StoreStats,
    pub vector_backend: &'static str,
    pub vector_count: usize,
    pub graph: GraphStats,
    pub memory: MemorySummary,
    pub embedding_model: String,
    pub llm_model: String,
}

// ============================================================================
// Pipeline
// ============================================================================

/// 조립된 시스템
pub struct Pipeline {
    settings: Settings,
    store: KnowledgeStore,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<RwLock<RelationshipGraph>>,
    memory: ConversationMemory,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LanguageModel>,
    graph_path: Option<PathBuf>,
}

impl Pipeline {
    /// 데이터 디렉토리에서 열기
    pub async fn open(settings: &Settings) -> Result<Self> {
        let paths = &settings.paths;
        std::fs::create_dir_all(&paths.data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", paths.data_dir))?;

        let store = KnowledgeStore::open(&paths.knowledge_db())?;
        let vectors: Arc<dyn VectorStore> = Arc::new(
            LanceVectorStore::open(&paths.vector_dir(), settings.ollama.embedding_dimension).await?,
        );
        let memory = ConversationMemory::open(&paths.memory_db(), settings.memory.max_turns)?;
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(OllamaEmbedding::from_settings(&settings.ollama)?);
        let llm: Arc<dyn LanguageModel> = Arc::new(OllamaChat::from_settings(&settings.ollama)?);

        let graph_path = paths.graph_file();
        let graph = load_or_rebuild_graph(&store, Some(&graph_path))?;

        Ok(Self {
            settings: settings.clone(),
            store,
            vectors,
            graph: Arc::new(RwLock::new(graph)),
            memory,
            embedder,
            llm,
            graph_path: Some(graph_path),
        })
    }

    /// 주어진 부품으로 조립 (그래프는 저장된 청크로 구성, 파일 저장 안 함)
    pub fn from_parts(
        settings: Settings,
        store: KnowledgeStore,
        vectors: Arc<dyn VectorStore>,
        memory: ConversationMemory,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let graph = load_or_rebuild_graph(&store, None)?;
        Ok(Self {
            settings,
            store,
            vectors,
            graph: Arc::new(RwLock::new(graph)),
            memory,
            embedder,
            llm,
            graph_path: None,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn graph(&self) -> Arc<RwLock<RelationshipGraph>> {
        Arc::clone(&self.graph)
    }

    /// 질의 오케스트레이터
    pub fn orchestrator(&self) -> QueryOrchestrator {
        QueryOrchestrator::new(
            Arc::clone(&self.embedder),
            Retriever::new(Arc::clone(&self.vectors), (&self.settings.retrieval).into()),
            GraphExpander::new((&self.settings.expansion).into()),
            Arc::clone(&self.graph),
            self.store.clone(),
            self.memory.clone(),
            Arc::clone(&self.llm),
            self.settings.memory.window,
        )
    }

    /// 배치 수집기
    pub fn ingestor(&self, force: bool) -> Ingestor {
        let chunker: Arc<dyn Chunker> =
            Arc::from(semantic_chunker(ChunkConfig::from(&self.settings.chunking)));
        let ingestor = Ingestor::new(
            self.store.clone(),
            Arc::clone(&self.vectors),
            Arc::clone(&self.embedder),
            Arc::clone(&self.graph),
            chunker,
        )
        .force(force)
        .with_max_chunks(self.settings.chunking.max_chunks_per_doc);

        match &self.graph_path {
            Some(path) => ingestor.with_graph_path(path.clone()),
            None => ingestor,
        }
    }

    /// 상태 집계
    pub async fn status(&self) -> Result<SystemStatus> {
        let store = self.store.stats()?;
        let vector_count = self.vectors.count().await?;
        let graph = self.graph.read().await.stats();
        let memory = self.memory.summary()?;

        Ok(SystemStatus {
            store,
            vector_backend: self.vectors.name(),
            vector_count,
            graph,
            memory,
            embedding_model: self.embedder.name().to_string(),
            llm_model: self.llm.name().to_string(),
        })
    }

    /// 모든 데이터 삭제
    pub async fn clear_all(&self) -> Result<()> {
        self.store.clear()?;
        self.vectors.clear().await?;
        self.memory.clear()?;

        let mut graph = self.graph.write().await;
        graph.clear();
        if let Some(path) = &self.graph_path {
            graph.save(path)?;
        }

        tracing::info!("Cleared all stored data");
        Ok(())
    }
}

/// 그래프 스냅샷 로드, 없거나 손상되면 저장된 청크로 재구성
fn load_or_rebuild_graph(
    store: &KnowledgeStore,
    path: Option<&std::path::Path>,
) -> Result<RelationshipGraph> {
    if let Some(path) = path {
        if path.exists() {
            match RelationshipGraph::load(path) {
                Ok(graph) => {
                    tracing::info!("Loaded relationship graph ({} nodes)", graph.node_count());
                    return Ok(graph);
                }
                Err(e) => {
                    tracing::warn!("Graph snapshot unreadable, rebuilding: {:#}", e);
                }
            }
        }
    }

    let chunks = store.all_chunks().context("Failed to load chunks for graph rebuild")?;
    let graph = RelationshipGraph::build(&chunks);
    tracing::info!(
        "Built relationship graph from {} stored chunks ({} nodes)",
        chunks.len(),
        graph.node_count()
    );

    if let Some(path) = path {
        if !chunks.is_empty() {
            graph.save(path)?;
        }
    }
    Ok(graph)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{DocumentMeta, MemoryVectorStore, SemanticChunker};
    use crate::llm::{ContextBundle, TextStream};
    use async_trait::async_trait;
    use futures::StreamExt;

    struct ConstEmbedder;

    #[async_trait]
    impl EmbeddingProvider for ConstEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "const"
        }
    }

    struct EchoModel;

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn generate(&self, bundle: &ContextBundle, _query: &str) -> Result<String> {
            Ok(format!("{} sources", bundle.chunks.len()))
        }

        async fn stream(&self, bundle: &ContextBundle, query: &str) -> Result<TextStream> {
            let text = self.generate(bundle, query).await?;
            Ok(futures::stream::iter(vec![Ok(text)]).boxed())
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn pipeline(store: KnowledgeStore) -> Pipeline {
        Pipeline::from_parts(
            Settings::default(),
            store,
            Arc::new(MemoryVectorStore::new()),
            ConversationMemory::open_in_memory(10).unwrap(),
            Arc::new(ConstEmbedder),
            Arc::new(EchoModel),
        )
        .unwrap()
    }

    fn document() -> SourceDocument {
        SourceDocument::new(
            "act",
            "CHAPTER I\n1. Short title\nThis Act is the Procurement Act.\n2. Tender security\nSee Schedule 1.\n",
        )
    }

    #[tokio::test]
    async fn test_ingest_query_status_reset() {
        let p = pipeline(KnowledgeStore::open_in_memory().unwrap());

        let report = p.ingestor(false).ingest(vec![document()], None).await.unwrap();
        assert_eq!(report.processed, vec!["act"]);

        let outcome = p
            .orchestrator()
            .answer("tender security", &QueryOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, QueryOutcome::Answered(_)));

        let status = p.status().await.unwrap();
        assert_eq!(status.store.document_count, 1);
        assert_eq!(status.vector_count, status.store.chunk_count);
        assert_eq!(status.vector_backend, "memory");
        assert_eq!(status.memory.turn_count, 1);
        assert_eq!(status.graph.documents, 1);
        assert_eq!(status.llm_model, "echo");

        p.clear_all().await.unwrap();
        let status = p.status().await.unwrap();
        assert_eq!(status.store.chunk_count, 0);
        assert_eq!(status.vector_count, 0);
        assert_eq!(status.memory.turn_count, 0);
        assert_eq!(status.graph, GraphStats::default());
    }

    #[test]
    fn test_graph_rebuilt_from_store() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        let doc = document();
        let chunks = SemanticChunker::with_defaults().chunk(&doc.text, &DocumentMeta::new("act"));
        store.replace_chunks("act", &chunks).unwrap();

        let p = pipeline(store);
        let graph = p.graph();
        let graph = graph.try_read().unwrap();
        assert_eq!(graph.stats(), RelationshipGraph::build(&chunks).stats());
    }

    #[test]
    fn test_corrupt_snapshot_rebuilds() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = KnowledgeStore::open_in_memory().unwrap();
        let doc = document();
        let chunks = SemanticChunker::with_defaults().chunk(&doc.text, &DocumentMeta::new("act"));
        store.replace_chunks("act", &chunks).unwrap();

        let graph = load_or_rebuild_graph(&store, Some(&path)).unwrap();
        assert_eq!(graph.stats().documents, 1);
        // 재구성한 그래프로 스냅샷 교체
        assert!(RelationshipGraph::load(&path).is_ok());
    }
}
