//! Retriever - 유사도 검색 + 임계값 필터 + 리랭크
//!
//! 1. 벡터 인덱스에서 코사인 유사도 상위 `top_k`
//! 2. `similarity_threshold` 미만 제거 (빈 결과도 정상)
//! 3. 벡터 점수와 질의어 겹침 비율을 섞어 다시 정렬 후 `rerank_top_k`만 유지

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::vector::VectorStore;
use crate::config::RetrievalSettings;

// ============================================================================
// Types
// ============================================================================

/// 검색/리랭크된 청크
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub seq: usize,
    pub text: String,
    /// 현재 순위 점수 (리랭크 후에는 결합 점수)
    pub score: f32,
    /// 벡터 유사도 (0.0 ~ 1.0)
    pub vector_score: f32,
    /// 벡터 검색 순위 (0-based)
    pub vector_rank: usize,
}

/// Retriever 설정
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub top_k: usize,
    pub rerank_top_k: usize,
    pub similarity_threshold: f32,
    pub rerank_weight: f32,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self::from(&RetrievalSettings::default())
    }
}

impl From<&RetrievalSettings> for RetrieverConfig {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            top_k: settings.top_k,
            rerank_top_k: settings.rerank_top_k,
            similarity_threshold: settings.similarity_threshold,
            rerank_weight: settings.rerank_weight,
        }
    }
}

// ============================================================================
// Retriever
// ============================================================================

/// 벡터 검색기
pub struct Retriever {
    store: Arc<dyn VectorStore>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(store: Arc<dyn VectorStore>, config: RetrieverConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// 임계값 이상인 후보를 유사도 내림차순으로 반환
    pub async fn retrieve(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>> {
        if top_k == 0 {
            return Ok(vec![]);
        }

        let mut results = self
            .store
            .query(query_embedding, top_k)
            .await
            .context("Vector index query failed")?;

        results.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
                .then_with(|| a.seq.cmp(&b.seq))
        });

        let candidates: Vec<ScoredChunk> = results
            .into_iter()
            .take(top_k)
            .map(|r| (r.similarity.clamp(0.0, 1.0), r))
            .filter(|(score, _)| *score >= threshold)
            .enumerate()
            .map(|(rank, (score, r))| ScoredChunk {
                chunk_id: r.chunk_id,
                doc_id: r.doc_id,
                seq: r.seq,
                text: r.chunk_text,
                score,
                vector_score: score,
                vector_rank: rank,
            })
            .collect();

        tracing::debug!(
            "Retrieved {} candidates (top_k={}, threshold={:.2})",
            candidates.len(),
            top_k,
            threshold
        );
        Ok(candidates)
    }

    /// 결합 점수로 다시 정렬하고 `rerank_top_k`개만 유지
    ///
    /// 점수 = (1 - w) * 벡터 유사도 + w * 질의어 겹침 비율.
    /// 동점이면 벡터 순위, 그다음 청크 순서.
    pub fn rerank(&self, query_text: &str, mut candidates: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        let weight = self.config.rerank_weight.clamp(0.0, 1.0);
        let query_terms = terms(query_text);

        for candidate in &mut candidates {
            let lexical = lexical_overlap(&query_terms, &candidate.text);
            candidate.score = (1.0 - weight) * candidate.vector_score + weight * lexical;
        }

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.vector_rank.cmp(&b.vector_rank))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        candidates.truncate(self.config.rerank_top_k);
        candidates
    }

    /// retrieve + rerank (설정값 사용)
    pub async fn search(&self, query_text: &str, query_embedding: &[f32]) -> Result<Vec<ScoredChunk>> {
        let candidates = self
            .retrieve(
                query_embedding,
                self.config.top_k,
                self.config.similarity_threshold,
            )
            .await?;
        Ok(self.rerank(query_text, candidates))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 소문자 영숫자 토큰 (2자 이상)
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// 질의어 중 청크에 나타나는 비율 (0.0 ~ 1.0)
fn lexical_overlap(query_terms: &HashSet<String>, text: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let chunk_terms = terms(text);
    let hits = query_terms.iter().filter(|t| chunk_terms.contains(*t)).count();
    hits as f32 / query_terms.len() as f32
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::vector::{MemoryVectorStore, VectorEntry};

    fn entry(chunk_id: &str, text: &str, embedding: Vec<f32>) -> VectorEntry {
        let (doc_id, seq) = chunk_id.split_once('#').unwrap();
        VectorEntry {
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            seq: seq.parse().unwrap(),
            chunk_text: text.to_string(),
            content_hash: String::new(),
            embedding,
        }
    }

    /// 쿼리 [1, 0]에 대해 유사도 1.0, 0.8, 0.6, 0.4를 갖는 저장소
    async fn populated() -> Arc<MemoryVectorStore> {
        let store = Arc::new(MemoryVectorStore::new());
        store
            .upsert_batch(&[
                entry("act#0", "general provisions", vec![1.0, 0.0]),
                entry("act#1", "tender security deposit rules", vec![0.8, 0.6]),
                entry("act#2", "tender security amount", vec![0.6, 0.8]),
                entry("act#3", "unrelated schedule", vec![0.4, 0.916_515_2]),
            ])
            .await
            .unwrap();
        store
    }

    fn retriever(store: Arc<MemoryVectorStore>, weight: f32, rerank_top_k: usize) -> Retriever {
        Retriever::new(
            store,
            RetrieverConfig {
                top_k: 8,
                rerank_top_k,
                similarity_threshold: 0.5,
                rerank_weight: weight,
            },
        )
    }

    #[tokio::test]
    async fn test_retrieve_threshold_and_order() {
        let r = retriever(populated().await, 0.0, 5);
        let results = r.retrieve(&[1.0, 0.0], 8, 0.5).await.unwrap();

        let ids: Vec<&str> = results.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["act#0", "act#1", "act#2"]);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(results.iter().all(|c| (0.0..=1.0).contains(&c.score)));
    }

    #[tokio::test]
    async fn test_retrieve_threshold_monotonic() {
        let r = retriever(populated().await, 0.0, 5);
        let mut previous = usize::MAX;
        for threshold in [0.0, 0.3, 0.5, 0.7, 0.9, 1.0] {
            let n = r.retrieve(&[1.0, 0.0], 8, threshold).await.unwrap().len();
            assert!(n <= previous, "threshold {} grew the result set", threshold);
            previous = n;
        }
    }

    #[tokio::test]
    async fn test_retrieve_empty_is_ok() {
        let r = retriever(populated().await, 0.0, 5);
        // 모든 코사인이 음수 → 0으로 잘림
        let results = r.retrieve(&[-1.0, 0.0], 8, 0.7).await.unwrap();
        assert!(results.is_empty());

        let empty = Retriever::new(Arc::new(MemoryVectorStore::new()), RetrieverConfig::default());
        assert!(empty.retrieve(&[1.0, 0.0], 8, 0.7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerank_promotes_lexical_match() {
        let r = retriever(populated().await, 0.5, 2);
        let candidates = r.retrieve(&[1.0, 0.0], 8, 0.5).await.unwrap();
        let reranked = r.rerank("tender security", candidates);

        // act#1: 0.5*0.8 + 0.5*1.0 = 0.9, act#2: 0.5*0.6 + 0.5 = 0.8, act#0: 0.5
        let ids: Vec<&str> = reranked.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["act#1", "act#2"]);
        assert!((reranked[0].score - 0.9).abs() < 0.001);
        assert!((reranked[0].vector_score - 0.8).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_rerank_ties_keep_vector_order() {
        let r = retriever(populated().await, 0.0, 5);
        let mut candidates = r.retrieve(&[1.0, 0.0], 8, 0.5).await.unwrap();
        for c in &mut candidates {
            c.vector_score = 0.7;
        }
        let reranked = r.rerank("anything", candidates);
        let ranks: Vec<usize> = reranked.iter().map(|c| c.vector_rank).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_search_uses_config() {
        let r = retriever(populated().await, 0.3, 1);
        let results = r.search("general", &[1.0, 0.0]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "act#0");
    }

    #[test]
    fn test_lexical_overlap() {
        let q = terms("Tender security, a deposit?");
        assert_eq!(q.len(), 3);
        assert!((lexical_overlap(&q, "The tender SECURITY clause") - 2.0 / 3.0).abs() < 0.001);
        assert_eq!(lexical_overlap(&HashSet::new(), "text"), 0.0);
    }
}
