//! Vector Store - 벡터 인덱스 트레이트 및 메모리 구현
//!
//! 청크 ID를 키로 upsert하며, 저장된 콘텐츠 해시로
//! 변경되지 않은 청크의 재임베딩을 건너뛸 수 있습니다.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// 벡터 임베딩 기본 차원 (nomic-embed-text)
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 768;

// ============================================================================
// Types
// ============================================================================

/// 벡터 엔트리 (저장용)
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    /// 청크 ID ("{doc_id}#{seq}")
    pub chunk_id: String,
    pub doc_id: String,
    pub seq: usize,
    pub chunk_text: String,
    /// 청크 텍스트 SHA-256
    pub content_hash: String,
    pub embedding: Vec<f32>,
}

/// 검색 결과
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub chunk_id: String,
    pub doc_id: String,
    pub seq: usize,
    pub chunk_text: String,
    /// 코사인 유사도 (0.0 ~ 1.0, 음수는 0으로)
    pub similarity: f32,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트 (async)
///
/// 벡터 저장소의 공통 인터페이스입니다.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 배치 upsert (같은 chunk_id는 교체)
    async fn upsert_batch(&self, entries: &[VectorEntry]) -> Result<usize>;

    /// 단건 upsert
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        self.upsert_batch(std::slice::from_ref(entry)).await?;
        Ok(())
    }

    /// 유사도 내림차순 상위 top_k
    async fn query(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<SearchResult>>;

    /// 문서의 청크별 저장된 콘텐츠 해시 (chunk_id → hash)
    async fn content_hashes(&self, doc_id: &str) -> Result<HashMap<String, String>>;

    /// 청크 ID로 삭제
    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<usize>;

    /// doc_id로 삭제
    async fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize>;

    /// 벡터 개수
    async fn count(&self) -> Result<usize>;

    /// 전체 삭제
    async fn clear(&self) -> Result<()>;

    /// 구현 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// MemoryVectorStore
// ============================================================================

/// 메모리 벡터 저장소 (테스트 및 일회성 실행용, 전수 검색)
#[derive(Default)]
pub struct MemoryVectorStore {
    entries: RwLock<BTreeMap<String, VectorEntry>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert_batch(&self, entries: &[VectorEntry]) -> Result<usize> {
        let mut map = self.entries.write().await;
        for entry in entries {
            map.insert(entry.chunk_id.clone(), entry.clone());
        }
        Ok(entries.len())
    }

    async fn query(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<SearchResult>> {
        let map = self.entries.read().await;

        let mut results: Vec<SearchResult> = map
            .values()
            .map(|entry| SearchResult {
                chunk_id: entry.chunk_id.clone(),
                doc_id: entry.doc_id.clone(),
                seq: entry.seq,
                chunk_text: entry.chunk_text.clone(),
                similarity: cosine_similarity(query_embedding, &entry.embedding).clamp(0.0, 1.0),
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        results.truncate(top_k);
        Ok(results)
    }

    async fn content_hashes(&self, doc_id: &str) -> Result<HashMap<String, String>> {
        let map = self.entries.read().await;
        Ok(map
            .values()
            .filter(|e| e.doc_id == doc_id)
            .map(|e| (e.chunk_id.clone(), e.content_hash.clone()))
            .collect())
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<usize> {
        let mut map = self.entries.write().await;
        Ok(chunk_ids.iter().filter(|id| map.remove(*id).is_some()).count())
    }

    async fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize> {
        let mut map = self.entries.write().await;
        let before = map.len();
        map.retain(|_, e| e.doc_id != doc_id);
        Ok(before - map.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 영벡터면 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(chunk_id: &str, embedding: Vec<f32>) -> VectorEntry {
        let (doc_id, seq) = chunk_id.split_once('#').unwrap();
        VectorEntry {
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            seq: seq.parse().unwrap(),
            chunk_text: format!("text of {}", chunk_id),
            content_hash: format!("hash-{}", chunk_id),
            embedding,
        }
    }

    #[test]
    fn test_cosine_similarity_same() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = vec![1.0, 0.0, 0.0];
        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - -1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_memory_store_query_order() {
        let store = MemoryVectorStore::new();
        store
            .upsert_batch(&[
                entry("a#0", vec![1.0, 0.0]),
                entry("a#1", vec![0.6, 0.8]),
                entry("b#0", vec![-1.0, 0.0]),
            ])
            .await
            .unwrap();

        let results = store.query(&[1.0, 0.0], 10).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a#0", "a#1", "b#0"]);
        assert!((results[1].similarity - 0.6).abs() < 0.0001);
        // 음수 코사인은 0으로
        assert_eq!(results[2].similarity, 0.0);

        assert_eq!(store.query(&[1.0, 0.0], 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_upsert_replaces() {
        let store = MemoryVectorStore::new();
        store.upsert(&entry("a#0", vec![1.0, 0.0])).await.unwrap();

        let mut changed = entry("a#0", vec![0.0, 1.0]);
        changed.content_hash = "new".to_string();
        store.upsert(&changed).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let hashes = store.content_hashes("a").await.unwrap();
        assert_eq!(hashes.get("a#0").map(String::as_str), Some("new"));
    }

    #[tokio::test]
    async fn test_memory_store_delete() {
        let store = MemoryVectorStore::new();
        store
            .upsert_batch(&[
                entry("a#0", vec![1.0]),
                entry("a#1", vec![1.0]),
                entry("b#0", vec![1.0]),
            ])
            .await
            .unwrap();

        assert_eq!(store.delete_chunks(&["a#1".to_string(), "zz#9".to_string()]).await.unwrap(), 1);
        assert_eq!(store.delete_by_doc_id("a").await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);

        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
