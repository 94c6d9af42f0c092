//! 질의 오케스트레이터
//!
//! 질의 → 임베딩 → 검색/리랭크 → 그래프 확장 → 청크 본문 + 대화 창
//! → `ContextBundle` → 언어 모델 → 대화 턴 기록.
//!
//! 컨텍스트 번들은 모델 호출(스트리밍 포함) 전에 완성됩니다.
//! 검색 결과가 없으면 모델을 부르지 않고 메모리에도 기록하지 않습니다.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::Settings;
use crate::embedding::EmbeddingProvider;
use crate::error::QueryError;
use crate::knowledge::{
    ChunkOrigin, ExpandedChunk, GraphExpander, KnowledgeStore, RelationshipGraph, Retriever,
    ScoredChunk,
};
use crate::llm::{ContextBundle, ContextChunk, LanguageModel, TextStream};
use crate::memory::{ConversationMemory, ConversationTurn};

/// 협력자 호출 재시도 횟수
const ADAPTER_RETRIES: u32 = 1;

// ============================================================================
// Types
// ============================================================================

/// 질의별 옵션
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub use_graph_expansion: bool,
    /// 컨텍스트 예산 (None이면 설정값)
    pub expansion_budget: Option<usize>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            use_graph_expansion: true,
            expansion_budget: None,
        }
    }
}

impl From<&Settings> for QueryOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            use_graph_expansion: settings.expansion.enabled,
            expansion_budget: Some(settings.expansion.budget_chars),
        }
    }
}

/// 모델 호출 직전까지 준비된 질의
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub query: String,
    pub bundle: ContextBundle,
    /// 리랭크된 직접 검색 결과
    pub hits: Vec<ScoredChunk>,
}

/// 메모리 기록 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum MemoryWrite {
    Persisted,
    Failed(String),
}

/// 완성된 응답
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub response: String,
    pub bundle: ContextBundle,
    pub chunk_ids: Vec<String>,
    pub memory: MemoryWrite,
}

/// 질의 결과
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// 임계값을 넘는 청크 없음 (에러 아님)
    NoContext,
    Answered(Answer),
}

/// 스트리밍 질의 결과
pub enum StreamOutcome {
    NoContext,
    /// 조각을 모두 읽은 뒤 `complete()`로 기록
    Streaming {
        prepared: PreparedQuery,
        fragments: TextStream,
    },
}

// ============================================================================
// QueryOrchestrator
// ============================================================================

/// 질의 오케스트레이터
///
/// 동시에 여러 질의를 처리할 수 있습니다. 그래프는 확장하는 동안만
/// 읽기 잠금을 잡고, 협력자 호출 중에는 잠금을 잡지 않습니다.
pub struct QueryOrchestrator {
    embedder: Arc<dyn EmbeddingProvider>,
    retriever: Retriever,
    expander: GraphExpander,
    graph: Arc<RwLock<RelationshipGraph>>,
    store: KnowledgeStore,
    memory: ConversationMemory,
    llm: Arc<dyn LanguageModel>,
    memory_window: usize,
}

impl QueryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        retriever: Retriever,
        expander: GraphExpander,
        graph: Arc<RwLock<RelationshipGraph>>,
        store: KnowledgeStore,
        memory: ConversationMemory,
        llm: Arc<dyn LanguageModel>,
        memory_window: usize,
    ) -> Self {
        Self {
            embedder,
            retriever,
            expander,
            graph,
            store,
            memory,
            llm,
            memory_window,
        }
    }

    /// 컨텍스트 번들 준비 (None이면 관련 컨텍스트 없음)
    pub async fn prepare(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Option<PreparedQuery>, QueryError> {
        // 1. 임베딩
        let embedder = &self.embedder;
        let embedding = with_retry("embedding", move || embedder.embed(query))
            .await
            .map_err(QueryError::Embedding)?;

        // 2. 검색 + 리랭크
        let retriever = &self.retriever;
        let vector = embedding.as_slice();
        let hits = with_retry("vector query", move || retriever.search(query, vector))
            .await
            .map_err(QueryError::VectorIndex)?;

        if hits.is_empty() {
            tracing::info!("No chunk above similarity threshold for query");
            return Ok(None);
        }

        // 3. 그래프 확장
        let selected: Vec<ExpandedChunk> = if options.use_graph_expansion {
            let graph = self.graph.read().await;
            self.expander.expand(&hits, &graph, options.expansion_budget)
        } else {
            hits.iter()
                .enumerate()
                .map(|(rank, hit)| ExpandedChunk {
                    chunk_id: hit.chunk_id.clone(),
                    origin: ChunkOrigin::Retrieved {
                        rank,
                        score: hit.score,
                    },
                })
                .collect()
        };

        // 4. 청크 본문
        let ids: Vec<String> = selected.iter().map(|c| c.chunk_id.clone()).collect();
        let mut stored: HashMap<String, _> = self
            .store
            .get_chunks(&ids)
            .map_err(QueryError::Store)?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut chunks = Vec::with_capacity(selected.len());
        for item in selected {
            let Some(chunk) = stored.remove(&item.chunk_id) else {
                tracing::warn!("Chunk {} missing from knowledge store, skipping", item.chunk_id);
                continue;
            };
            chunks.push(ContextChunk {
                section: (!chunk.path.is_empty()).then(|| chunk.path.join(" > ")),
                chunk_id: chunk.id,
                doc_id: chunk.doc_id,
                page: chunk.page,
                text: chunk.text,
                origin: item.origin,
            });
        }

        if chunks.is_empty() {
            return Err(QueryError::Store(anyhow::anyhow!(
                "none of {} selected chunks found in knowledge store",
                ids.len()
            )));
        }

        // 5. 대화 창
        let history = match self.memory.recent_window(self.memory_window) {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!("Failed to read conversation window: {:#}", e);
                vec![]
            }
        };

        tracing::debug!(
            "Prepared context: {} hits, {} chunks, {} history turns",
            hits.len(),
            chunks.len(),
            history.len()
        );

        Ok(Some(PreparedQuery {
            query: query.to_string(),
            bundle: ContextBundle { chunks, history },
            hits,
        }))
    }

    /// 질의 응답 (prepare + generate + complete)
    pub async fn answer(&self, query: &str, options: &QueryOptions) -> Result<QueryOutcome, QueryError> {
        let Some(prepared) = self.prepare(query, options).await? else {
            return Ok(QueryOutcome::NoContext);
        };

        let llm = &self.llm;
        let bundle = &prepared.bundle;
        let response = with_retry("language model", move || llm.generate(bundle, query))
            .await
            .map_err(QueryError::LanguageModel)?;

        Ok(QueryOutcome::Answered(self.complete(prepared, response)))
    }

    /// 스트리밍 질의 (번들 완성 후 스트림 시작)
    pub async fn answer_stream(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<StreamOutcome, QueryError> {
        let Some(prepared) = self.prepare(query, options).await? else {
            return Ok(StreamOutcome::NoContext);
        };

        let llm = &self.llm;
        let bundle = &prepared.bundle;
        let fragments = with_retry("language model stream", move || llm.stream(bundle, query))
            .await
            .map_err(QueryError::LanguageModel)?;

        Ok(StreamOutcome::Streaming {
            prepared,
            fragments,
        })
    }

    /// 응답을 대화 메모리에 기록
    pub fn complete(&self, prepared: PreparedQuery, response: String) -> Answer {
        let chunk_ids = prepared.bundle.chunk_ids();
        let turn = ConversationTurn::new(prepared.query, response.clone(), chunk_ids.clone());

        let memory = match self.memory.append(&turn) {
            Ok(()) => MemoryWrite::Persisted,
            Err(e) => {
                tracing::error!("Failed to persist conversation turn {}: {:#}", turn.id, e);
                MemoryWrite::Failed(format!("{:#}", e))
            }
        };

        Answer {
            response,
            bundle: prepared.bundle,
            chunk_ids,
            memory,
        }
    }
}

/// 실패 시 한 번 더 시도
async fn with_retry<T, F, Fut>(label: &str, mut call: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < ADAPTER_RETRIES => {
                attempt += 1;
                tracing::warn!("{} failed, retrying ({}/{}): {:#}", label, attempt, ADAPTER_RETRIES, e);
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{
        Chunker, DocumentMeta, ExpanderConfig, MemoryVectorStore, RetrieverConfig, SearchResult,
        SemanticChunker, VectorEntry, VectorStore,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 키워드별 고정 벡터
    struct KeywordEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.fail {
                anyhow::bail!("embedding service unavailable");
            }
            let text = text.to_lowercase();
            Ok(if text.contains("security") {
                vec![1.0, 0.0, 0.0]
            } else if text.contains("weak") {
                // 모든 청크와 유사도 0.4
                vec![0.4, 0.4, 0.824_621_1]
            } else {
                vec![0.0, 0.0, 1.0]
            })
        }

        fn dimension(&self) -> usize {
            3
        }

        fn name(&self) -> &str {
            "keyword"
        }
    }

    /// 받은 번들을 기록하는 모델
    #[derive(Default)]
    struct RecordingModel {
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl LanguageModel for RecordingModel {
        async fn generate(&self, bundle: &ContextBundle, query: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("model not loaded");
            }
            self.seen.lock().unwrap().push(bundle.chunk_ids());
            Ok(format!("answer to {}", query))
        }

        async fn stream(&self, bundle: &ContextBundle, _query: &str) -> Result<TextStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(bundle.chunk_ids());
            let parts: Vec<Result<String>> = vec![Ok("Section ".into()), Ok("14".into())];
            Ok(futures::stream::iter(parts).boxed())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    /// 조회할 때마다 실패하는 벡터 인덱스
    #[derive(Default)]
    struct UnreachableIndex {
        queries: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for UnreachableIndex {
        async fn upsert_batch(&self, entries: &[VectorEntry]) -> Result<usize> {
            Ok(entries.len())
        }

        async fn query(&self, _embedding: &[f32], _top_k: usize) -> Result<Vec<SearchResult>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("connection refused")
        }

        async fn content_hashes(&self, _doc_id: &str) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }

        async fn delete_chunks(&self, _chunk_ids: &[String]) -> Result<usize> {
            Ok(0)
        }

        async fn delete_by_doc_id(&self, _doc_id: &str) -> Result<usize> {
            Ok(0)
        }

        async fn count(&self) -> Result<usize> {
            Ok(0)
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "unreachable"
        }
    }

    struct Fixture {
        orchestrator: QueryOrchestrator,
        memory: ConversationMemory,
        llm: Arc<RecordingModel>,
    }

    #[derive(Default)]
    struct FixtureOptions {
        fail_embedding: bool,
        fail_model: bool,
        vectors: Option<Arc<dyn VectorStore>>,
        memory: Option<ConversationMemory>,
        store: Option<KnowledgeStore>,
    }

    fn corpus() -> String {
        let mut text = String::from("CHAPTER I\n");
        for n in 1..=6 {
            text.push_str(&format!("{}. Provision {}\n", n, n));
            text.push_str(&"General procurement text applies here. ".repeat(6));
            text.push('\n');
        }
        text.push_str("7. Tender security\nEvery bidder shall furnish tender security as in Schedule 1.\n");
        text.push_str("SCHEDULE 1\nRates of security deposit for works and goods.\n");
        text
    }

    async fn fixture(fail_embedding: bool) -> Fixture {
        fixture_with(FixtureOptions {
            fail_embedding,
            ..Default::default()
        })
        .await
    }

    async fn fixture_with(options: FixtureOptions) -> Fixture {
        let chunker = SemanticChunker::new(crate::knowledge::ChunkConfig {
            chunk_size: 200,
            chunk_overlap: 20,
            tolerance: 40,
        });
        let chunks = chunker.chunk(&corpus(), &DocumentMeta::new("act"));

        let store = match options.store {
            Some(store) => store,
            None => {
                let store = KnowledgeStore::open_in_memory().unwrap();
                store.replace_chunks("act", &chunks).unwrap();
                store
            }
        };

        // "security"를 포함한 청크만 질의 벡터와 정렬
        let vectors = Arc::new(MemoryVectorStore::new());
        let entries: Vec<VectorEntry> = chunks
            .iter()
            .map(|c| VectorEntry {
                chunk_id: c.id.clone(),
                doc_id: c.doc_id.clone(),
                seq: c.seq,
                chunk_text: c.text.clone(),
                content_hash: c.content_hash.clone(),
                embedding: if c.core_text().contains("tender security") {
                    vec![1.0, 0.0, 0.0]
                } else {
                    vec![0.0, 1.0, 0.0]
                },
            })
            .collect();
        vectors.upsert_batch(&entries).await.unwrap();
        let populated: Arc<dyn VectorStore> = vectors;
        let vectors = options.vectors.unwrap_or(populated);

        let graph = Arc::new(RwLock::new(RelationshipGraph::build(&chunks)));
        let memory = options
            .memory
            .unwrap_or_else(|| ConversationMemory::open_in_memory(10).unwrap());
        let llm = Arc::new(RecordingModel {
            fail: options.fail_model,
            ..Default::default()
        });

        let orchestrator = QueryOrchestrator::new(
            Arc::new(KeywordEmbedder {
                fail: options.fail_embedding,
            }),
            Retriever::new(
                vectors,
                RetrieverConfig {
                    top_k: 8,
                    rerank_top_k: 5,
                    similarity_threshold: 0.7,
                    rerank_weight: 0.3,
                },
            ),
            GraphExpander::new(ExpanderConfig {
                depth: 1,
                budget: 4000,
            }),
            graph,
            store,
            memory.clone(),
            llm.clone(),
            3,
        );

        Fixture {
            orchestrator,
            memory,
            llm,
        }
    }

    #[tokio::test]
    async fn test_no_context_skips_model_and_memory() {
        let fx = fixture(false).await;
        let outcome = fx
            .orchestrator
            .answer("weak question", &QueryOptions::default())
            .await
            .unwrap();

        assert!(matches!(outcome, QueryOutcome::NoContext));
        assert_eq!(fx.llm.calls.load(Ordering::SeqCst), 0);
        assert!(fx.memory.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_without_graph_context_equals_retrieval() {
        let fx = fixture(false).await;
        let options = QueryOptions {
            use_graph_expansion: false,
            expansion_budget: None,
        };
        let prepared = fx
            .orchestrator
            .prepare("tender security amount", &options)
            .await
            .unwrap()
            .unwrap();

        let hit_ids: Vec<String> = prepared.hits.iter().map(|h| h.chunk_id.clone()).collect();
        assert_eq!(prepared.bundle.chunk_ids(), hit_ids);
        assert!(prepared
            .bundle
            .chunks
            .iter()
            .all(|c| matches!(c.origin, ChunkOrigin::Retrieved { .. })));
    }

    #[tokio::test]
    async fn test_graph_expansion_adds_neighbors() {
        let fx = fixture(false).await;
        let prepared = fx
            .orchestrator
            .prepare("tender security amount", &QueryOptions::default())
            .await
            .unwrap()
            .unwrap();

        let retrieved = prepared.hits.len();
        assert!(prepared.bundle.chunks.len() > retrieved);
        // 직접 검색 결과가 먼저
        for (i, chunk) in prepared.bundle.chunks.iter().enumerate() {
            assert_eq!(matches!(chunk.origin, ChunkOrigin::Retrieved { .. }), i < retrieved);
        }
    }

    #[tokio::test]
    async fn test_answer_records_turn() {
        let fx = fixture(false).await;
        let outcome = fx
            .orchestrator
            .answer("What is tender security?", &QueryOptions::default())
            .await
            .unwrap();

        let QueryOutcome::Answered(answer) = outcome else {
            panic!("expected an answer");
        };
        assert_eq!(answer.memory, MemoryWrite::Persisted);
        assert_eq!(answer.response, "answer to What is tender security?");

        let turns = fx.memory.all().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].chunk_ids, answer.chunk_ids);
        assert_eq!(fx.llm.seen.lock().unwrap()[0], answer.chunk_ids);
    }

    #[tokio::test]
    async fn test_history_window_in_bundle() {
        let fx = fixture(false).await;
        for i in 0..5 {
            fx.memory
                .append(&ConversationTurn::new(format!("q{}", i), "a", vec![]))
                .unwrap();
        }
        let prepared = fx
            .orchestrator
            .prepare("tender security", &QueryOptions::default())
            .await
            .unwrap()
            .unwrap();

        let queries: Vec<&str> = prepared.bundle.history.iter().map(|t| t.query.as_str()).collect();
        assert_eq!(queries, vec!["q2", "q3", "q4"]);
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_memory_untouched() {
        let fx = fixture(true).await;
        let err = fx
            .orchestrator
            .answer("tender security", &QueryOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Embedding(_)));
        assert!(err.is_retrieval_failure());
        assert_eq!(fx.llm.calls.load(Ordering::SeqCst), 0);
        assert!(fx.memory.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_vector_index_failure_retried_once() {
        let index = Arc::new(UnreachableIndex::default());
        let fx = fixture_with(FixtureOptions {
            vectors: Some(index.clone() as Arc<dyn VectorStore>),
            ..Default::default()
        })
        .await;

        let err = fx
            .orchestrator
            .answer("tender security", &QueryOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::VectorIndex(_)));
        assert!(err.is_retrieval_failure());
        assert_eq!(index.queries.load(Ordering::SeqCst), 2);
        assert_eq!(fx.llm.calls.load(Ordering::SeqCst), 0);
        assert!(fx.memory.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_model_failure_leaves_memory_untouched() {
        let fx = fixture_with(FixtureOptions {
            fail_model: true,
            ..Default::default()
        })
        .await;

        let err = fx
            .orchestrator
            .answer("tender security", &QueryOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::LanguageModel(_)));
        assert!(!err.is_retrieval_failure());
        assert_eq!(fx.llm.calls.load(Ordering::SeqCst), 2);
        assert!(fx.memory.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_memory_write_failure_still_answers() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("memory.db");
        let memory = ConversationMemory::open(&path, 10).unwrap();
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE turns;")
            .unwrap();

        let fx = fixture_with(FixtureOptions {
            memory: Some(memory),
            ..Default::default()
        })
        .await;

        let outcome = fx
            .orchestrator
            .answer("What is tender security?", &QueryOptions::default())
            .await
            .unwrap();

        let QueryOutcome::Answered(answer) = outcome else {
            panic!("expected an answer");
        };
        assert_eq!(answer.response, "answer to What is tender security?");
        assert!(!answer.chunk_ids.is_empty());
        assert!(matches!(answer.memory, MemoryWrite::Failed(_)));
    }

    #[tokio::test]
    async fn test_missing_chunks_reported_as_store_error() {
        // 벡터 인덱스에는 있지만 지식 저장소는 비어 있음
        let fx = fixture_with(FixtureOptions {
            store: Some(KnowledgeStore::open_in_memory().unwrap()),
            ..Default::default()
        })
        .await;

        let err = fx
            .orchestrator
            .answer("tender security", &QueryOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Store(_)));
        assert_eq!(fx.llm.calls.load(Ordering::SeqCst), 0);
        assert!(fx.memory.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_stream_then_complete() {
        let fx = fixture(false).await;
        let outcome = fx
            .orchestrator
            .answer_stream("tender security", &QueryOptions::default())
            .await
            .unwrap();

        let StreamOutcome::Streaming {
            prepared,
            fragments,
        } = outcome
        else {
            panic!("expected a stream");
        };
        // 스트림 시작 전 번들 완성
        assert!(!prepared.bundle.is_empty());
        assert!(fx.memory.is_empty().unwrap());

        let text: String = fragments.map(|f| f.unwrap()).collect::<Vec<_>>().await.concat();
        let answer = fx.orchestrator.complete(prepared, text);
        assert_eq!(answer.response, "Section 14");
        assert_eq!(fx.memory.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_once() {
        let attempts = AtomicUsize::new(0);
        let result: anyhow::Result<u32> = with_retry("flaky", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    anyhow::bail!("transient")
                }
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);

        let attempts = AtomicUsize::new(0);
        let result: anyhow::Result<u32> = with_retry("broken", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("down") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
