//! 배치 수집 - 문서 → 청크 → {SQLite, 벡터 인덱스, 관계 그래프}
//!
//! 1. 콘텐츠 해시가 같으면 건너뜀 (`force`면 재처리)
//! 2. 문서별 청킹은 `spawn_blocking`으로 병렬 실행
//! 3. 문서별로 바뀐 청크만 임베딩한 뒤 청크 저장, 벡터 반영, 사라진 청크 벡터 삭제, 그래프 교체
//! 4. 모든 문서가 끝난 뒤 코퍼스 전체 인용 해석, 그래프 저장, 처리 완료 기록
//!
//! 문서 하나의 실패는 보고서에 남기고 배치는 계속 진행합니다.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use crate::embedding::EmbeddingProvider;
use crate::extractor::ExtractedDocument;
use crate::knowledge::{
    content_hash, Chunk, Chunker, DocumentMeta, DocumentStatus, KnowledgeStore,
    RelationshipGraph, VectorEntry, VectorStore,
};

// ============================================================================
// Types
// ============================================================================

/// 수집 대상 문서
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub doc_id: String,
    pub title: Option<String>,
    pub source_path: Option<String>,
    pub text: String,
}

impl SourceDocument {
    pub fn new(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            title: None,
            source_path: None,
            text: text.into(),
        }
    }
}

impl From<ExtractedDocument> for SourceDocument {
    fn from(doc: ExtractedDocument) -> Self {
        Self {
            doc_id: doc.doc_id,
            title: doc.title,
            source_path: Some(doc.source_path),
            text: doc.text,
        }
    }
}

/// 수집 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    /// 처리된 문서 ID
    pub processed: Vec<String>,
    /// 변경 없음으로 건너뛴 문서 수
    pub skipped: usize,
    /// (doc_id, 사유)
    pub failed: Vec<(String, String)>,
    /// 저장된 청크 수
    pub chunks: usize,
    /// 새로 임베딩한 청크 수
    pub embedded: usize,
    /// 전체 해석 단계에서 연결된 인용 엣지 수
    pub resolved_references: usize,
    pub cancelled: bool,
}

// ============================================================================
// Ingestor
// ============================================================================

/// 배치 수집기
pub struct Ingestor {
    store: KnowledgeStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    graph: Arc<RwLock<RelationshipGraph>>,
    chunker: Arc<dyn Chunker>,
    graph_path: Option<PathBuf>,
    force: bool,
    /// 문서당 최대 청크 수 (0이면 제한 없음)
    max_chunks: usize,
}

impl Ingestor {
    pub fn new(
        store: KnowledgeStore,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        graph: Arc<RwLock<RelationshipGraph>>,
        chunker: Arc<dyn Chunker>,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            graph,
            chunker,
            graph_path: None,
            force: false,
            max_chunks: 0,
        }
    }

    /// 처리 후 그래프 스냅샷 저장 위치
    pub fn with_graph_path(mut self, path: PathBuf) -> Self {
        self.graph_path = Some(path);
        self
    }

    /// 해시가 같아도 재처리
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// 문서당 청크 수 상한, 넘는 문서는 실패로 보고
    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    /// 문서 배치 수집
    ///
    /// `cancel`이 `true`가 되면 다음 문서로 넘어가기 전에 멈추고,
    /// 이미 처리한 문서까지는 해석/저장/완료 기록을 마칩니다.
    pub async fn ingest(
        &self,
        documents: Vec<SourceDocument>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        // 1. 변경 감지
        let mut pending: Vec<(SourceDocument, String)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for doc in documents {
            if !seen.insert(doc.doc_id.clone()) {
                tracing::warn!("Duplicate document id {}, keeping the first", doc.doc_id);
                continue;
            }
            let hash = content_hash(&doc.text);
            match self.store.needs_processing(&doc.doc_id, &hash) {
                Ok(true) => pending.push((doc, hash)),
                Ok(false) if self.force => pending.push((doc, hash)),
                Ok(false) => {
                    tracing::debug!("Unchanged document {}, skipping", doc.doc_id);
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to check status of {}: {:#}", doc.doc_id, e);
                    report.failed.push((doc.doc_id, format!("{:#}", e)));
                }
            }
        }

        if pending.is_empty() {
            tracing::info!("Nothing to ingest ({} unchanged)", report.skipped);
            return Ok(report);
        }

        // 2. 병렬 청킹
        let tasks = pending.iter().map(|(doc, _)| {
            let chunker = Arc::clone(&self.chunker);
            let text = doc.text.clone();
            let meta = DocumentMeta {
                title: doc.title.clone(),
                ..DocumentMeta::new(doc.doc_id.clone())
            };
            tokio::task::spawn_blocking(move || chunker.chunk(&text, &meta))
        });
        let chunked = futures::future::join_all(tasks).await;

        // 3. 문서별 반영
        let mut completed: Vec<DocumentStatus> = Vec::new();
        for ((doc, hash), chunks) in pending.into_iter().zip(chunked) {
            if is_cancelled(&cancel) {
                tracing::warn!("Ingestion cancelled before {}", doc.doc_id);
                report.cancelled = true;
                break;
            }

            let chunks = match chunks {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::warn!("Chunking task for {} failed: {}", doc.doc_id, e);
                    report.failed.push((doc.doc_id, format!("chunking failed: {}", e)));
                    continue;
                }
            };

            match self.apply_document(&doc.doc_id, &chunks).await {
                Ok(embedded) => {
                    tracing::info!(
                        "Ingested {} ({} chunks, {} embedded)",
                        doc.doc_id,
                        chunks.len(),
                        embedded
                    );
                    report.chunks += chunks.len();
                    report.embedded += embedded;
                    report.processed.push(doc.doc_id.clone());
                    completed.push(DocumentStatus {
                        doc_id: doc.doc_id,
                        title: doc.title,
                        source_path: doc.source_path,
                        content_hash: hash,
                        chunk_count: chunks.len(),
                        processed_at: Utc::now(),
                    });
                }
                Err(e) => {
                    tracing::warn!("Failed to ingest {}: {:#}", doc.doc_id, e);
                    report.failed.push((doc.doc_id, format!("{:#}", e)));
                }
            }
        }

        // 4. 전체 인용 해석 + 저장 + 완료 기록
        if !completed.is_empty() {
            report.resolved_references = self.graph.write().await.resolve_pending();
            self.save_graph().await?;

            for status in &completed {
                self.store
                    .mark_processed(status)
                    .with_context(|| format!("Failed to mark {} processed", status.doc_id))?;
            }
        }

        tracing::info!(
            "Ingestion finished: {} processed, {} skipped, {} failed",
            report.processed.len(),
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }

    /// 문서 하나를 저장소/벡터/그래프에 반영하고 임베딩한 청크 수 반환
    ///
    /// 임베딩이 모두 끝난 뒤에만 쓰기를 시작하므로, 임베딩 실패 시
    /// 저장소/벡터/그래프는 이전 버전 그대로 남습니다.
    async fn apply_document(&self, doc_id: &str, chunks: &[Chunk]) -> Result<usize> {
        if self.max_chunks > 0 && chunks.len() > self.max_chunks {
            anyhow::bail!(
                "Document produced {} chunks, exceeding the limit of {}",
                chunks.len(),
                self.max_chunks
            );
        }

        // 저장된 해시와 비교
        let existing = self
            .vectors
            .content_hashes(doc_id)
            .await
            .context("Failed to read stored vector hashes")?;

        let changed: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| existing.get(&c.id) != Some(&c.content_hash))
            .collect();

        let mut entries: Vec<VectorEntry> = Vec::with_capacity(changed.len());
        if !changed.is_empty() {
            let texts: Vec<String> = changed.iter().map(|c| c.text.clone()).collect();
            let embeddings = self
                .embedder
                .embed_batch(&texts)
                .await
                .context("Failed to embed chunks")?;

            if embeddings.len() != changed.len() {
                anyhow::bail!(
                    "Embedding count mismatch: {} chunks, {} vectors",
                    changed.len(),
                    embeddings.len()
                );
            }

            entries.extend(changed.iter().zip(embeddings).map(|(chunk, embedding)| {
                VectorEntry {
                    chunk_id: chunk.id.clone(),
                    doc_id: chunk.doc_id.clone(),
                    seq: chunk.seq,
                    chunk_text: chunk.text.clone(),
                    content_hash: chunk.content_hash.clone(),
                    embedding,
                }
            }));
        }

        // 쓰기 단계
        self.store.replace_chunks(doc_id, chunks)?;

        if !entries.is_empty() {
            self.vectors
                .upsert_batch(&entries)
                .await
                .context("Failed to store vectors")?;
        }

        let current: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let stale: Vec<String> = existing
            .keys()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect();
        if !stale.is_empty() {
            self.vectors
                .delete_chunks(&stale)
                .await
                .context("Failed to delete stale vectors")?;
        }

        self.graph.write().await.replace_document(doc_id, chunks);
        Ok(entries.len())
    }

    /// 문서를 모든 저장소에서 제거
    pub async fn remove_document(&self, doc_id: &str) -> Result<bool> {
        let existed = self.store.delete_document(doc_id)?;
        self.vectors
            .delete_by_doc_id(doc_id)
            .await
            .context("Failed to delete document vectors")?;
        {
            let mut graph = self.graph.write().await;
            graph.remove_document(doc_id);
            graph.resolve_pending();
        }
        self.save_graph().await?;

        if existed {
            tracing::info!("Removed document {}", doc_id);
        }
        Ok(existed)
    }

    async fn save_graph(&self) -> Result<()> {
        if let Some(path) = &self.graph_path {
            self.graph.read().await.save(path)?;
        }
        Ok(())
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{EdgeKind, MemoryVectorStore, SemanticChunker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// 호출 수를 세는 임베딩 (텍스트 길이 기반 벡터), `failing`이면 오류
    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("embedding service unavailable");
            }
            Ok(vec![text.len() as f32, 1.0, 0.5])
        }

        fn dimension(&self) -> usize {
            3
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    struct Fixture {
        store: KnowledgeStore,
        vectors: Arc<MemoryVectorStore>,
        embedder: Arc<CountingEmbedder>,
        graph: Arc<RwLock<RelationshipGraph>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: KnowledgeStore::open_in_memory().unwrap(),
                vectors: Arc::new(MemoryVectorStore::new()),
                embedder: Arc::new(CountingEmbedder::default()),
                graph: Arc::new(RwLock::new(RelationshipGraph::new())),
            }
        }

        fn ingestor(&self) -> Ingestor {
            Ingestor::new(
                self.store.clone(),
                self.vectors.clone(),
                self.embedder.clone(),
                Arc::clone(&self.graph),
                Arc::new(SemanticChunker::with_defaults()),
            )
        }

        fn calls(&self) -> usize {
            self.embedder.calls.load(Ordering::SeqCst)
        }
    }

    fn act() -> SourceDocument {
        SourceDocument::new(
            "act",
            "CHAPTER I\n1. Short title\nThis Act may be called the Procurement Act.\n\
             2. Definitions\nIn this Act, bid security means the deposit under Schedule 1.\n",
        )
    }

    fn schedule() -> SourceDocument {
        SourceDocument::new(
            "schedule",
            "SCHEDULE 1\nBid security shall be two percent of the estimated value.\n",
        )
    }

    #[tokio::test]
    async fn test_ingest_populates_all_stores() {
        let fx = Fixture::new();
        let report = fx.ingestor().ingest(vec![act(), schedule()], None).await.unwrap();

        assert_eq!(report.processed, vec!["act", "schedule"]);
        assert!(report.failed.is_empty());
        assert_eq!(report.chunks, report.embedded);

        let stored = fx.store.all_chunks().unwrap();
        assert_eq!(stored.len(), report.chunks);
        assert_eq!(fx.vectors.count().await.unwrap(), report.chunks);

        let graph = fx.graph.read().await;
        assert_eq!(graph.documents().len(), 2);
        assert!(fx.store.document_status("act").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cross_document_reference_resolved() {
        let fx = Fixture::new();
        fx.ingestor().ingest(vec![act(), schedule()], None).await.unwrap();

        let graph = fx.graph.read().await;
        let references: Vec<_> = graph
            .edges()
            .into_iter()
            .filter(|e| e.kind == EdgeKind::References)
            .collect();
        assert!(references
            .iter()
            .any(|e| e.from.starts_with("act#") && e.to.starts_with("schedule")));
    }

    #[tokio::test]
    async fn test_unchanged_documents_skipped() {
        let fx = Fixture::new();
        fx.ingestor().ingest(vec![act()], None).await.unwrap();
        let first_calls = fx.calls();

        let report = fx.ingestor().ingest(vec![act()], None).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(report.processed.is_empty());
        assert_eq!(fx.calls(), first_calls);

        // force: 재처리하지만 해시가 같은 청크는 다시 임베딩하지 않음
        let report = fx.ingestor().force(true).ingest(vec![act()], None).await.unwrap();
        assert_eq!(report.processed, vec!["act"]);
        assert_eq!(report.embedded, 0);
        assert_eq!(fx.calls(), first_calls);
    }

    #[tokio::test]
    async fn test_changed_document_replaces_stale_vectors() {
        let fx = Fixture::new();
        fx.ingestor().ingest(vec![act()], None).await.unwrap();

        let shorter = SourceDocument::new("act", "CHAPTER I\n1. Short title\nRenamed.\n");
        let report = fx.ingestor().ingest(vec![shorter], None).await.unwrap();

        assert_eq!(report.processed, vec!["act"]);
        let chunks = fx.store.chunks_for_document("act").unwrap();
        let hashes = fx.vectors.content_hashes("act").await.unwrap();
        assert_eq!(hashes.len(), chunks.len());
        for chunk in &chunks {
            assert_eq!(hashes.get(&chunk.id), Some(&chunk.content_hash));
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_keeps_previous_version() {
        let fx = Fixture::new();
        fx.ingestor().ingest(vec![act()], None).await.unwrap();

        let before_chunks = fx.store.chunks_for_document("act").unwrap();
        let before_hashes = fx.vectors.content_hashes("act").await.unwrap();
        let before_stats = fx.graph.read().await.stats();
        let before_len = fx.graph.read().await.chunk_len("act#0");
        let before_status = fx.store.document_status("act").unwrap().unwrap();

        fx.embedder.failing.store(true, Ordering::SeqCst);
        let changed = SourceDocument::new("act", "CHAPTER I\n1. Short title\nRenamed.\n");
        let report = fx.ingestor().ingest(vec![changed], None).await.unwrap();

        assert!(report.processed.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "act");

        assert_eq!(fx.store.chunks_for_document("act").unwrap(), before_chunks);
        assert_eq!(fx.vectors.content_hashes("act").await.unwrap(), before_hashes);
        assert_eq!(fx.graph.read().await.stats(), before_stats);
        assert_eq!(fx.graph.read().await.chunk_len("act#0"), before_len);
        assert_eq!(
            fx.store.document_status("act").unwrap().unwrap().content_hash,
            before_status.content_hash
        );

        // 복구 후 재수집하면 새 버전으로 일치
        fx.embedder.failing.store(false, Ordering::SeqCst);
        let changed = SourceDocument::new("act", "CHAPTER I\n1. Short title\nRenamed.\n");
        let report = fx.ingestor().ingest(vec![changed], None).await.unwrap();
        assert_eq!(report.processed, vec!["act"]);
        let chunks = fx.store.chunks_for_document("act").unwrap();
        let hashes = fx.vectors.content_hashes("act").await.unwrap();
        assert_eq!(hashes.len(), chunks.len());
        for chunk in &chunks {
            assert_eq!(hashes.get(&chunk.id), Some(&chunk.content_hash));
        }
    }

    #[tokio::test]
    async fn test_chunk_limit_fails_document() {
        let fx = Fixture::new();
        let report = fx
            .ingestor()
            .with_max_chunks(1)
            .ingest(vec![act(), schedule()], None)
            .await
            .unwrap();

        assert_eq!(report.processed, vec!["schedule"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "act");
        assert!(report.failed[0].1.contains("exceeding the limit"));
        assert!(fx.store.chunks_for_document("act").unwrap().is_empty());
        assert!(fx.vectors.content_hashes("act").await.unwrap().is_empty());
        assert!(!fx.graph.read().await.documents().contains("act"));
        assert_eq!(fx.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_documents() {
        let fx = Fixture::new();
        let (tx, rx) = watch::channel(true);
        let report = fx
            .ingestor()
            .ingest(vec![act(), schedule()], Some(rx))
            .await
            .unwrap();
        drop(tx);

        assert!(report.cancelled);
        assert!(report.processed.is_empty());
        assert!(fx.store.document_status("act").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_document() {
        let fx = Fixture::new();
        let ingestor = fx.ingestor();
        ingestor.ingest(vec![act(), schedule()], None).await.unwrap();

        assert!(ingestor.remove_document("schedule").await.unwrap());
        assert!(fx.vectors.content_hashes("schedule").await.unwrap().is_empty());
        assert!(fx.store.chunks_for_document("schedule").unwrap().is_empty());
        assert!(!fx.graph.read().await.documents().contains("schedule"));
        assert!(!ingestor.remove_document("schedule").await.unwrap());
    }

    #[tokio::test]
    async fn test_graph_snapshot_saved() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        let fx = Fixture::new();
        fx.ingestor()
            .with_graph_path(path.clone())
            .ingest(vec![act()], None)
            .await
            .unwrap();

        let loaded = RelationshipGraph::load(&path).unwrap();
        assert_eq!(loaded.stats(), fx.graph.read().await.stats());
    }
}
