//! 질의 경계 에러 타입
//!
//! 내부 모듈은 `anyhow::Result`를 사용하고, 오케스트레이터만 호출자가
//! 구분해야 하는 실패 유형을 `QueryError`로 노출합니다.
//! "관련 컨텍스트 없음"은 에러가 아니라 `QueryOutcome::NoContext`입니다.

use thiserror::Error;

/// 질의 처리 실패
#[derive(Debug, Error)]
pub enum QueryError {
    /// 임베딩 함수 호출 실패 (재시도 후)
    #[error("embedding provider failed: {0:#}")]
    Embedding(#[source] anyhow::Error),

    /// 벡터 인덱스 조회 실패 (재시도 후)
    #[error("vector index query failed: {0:#}")]
    VectorIndex(#[source] anyhow::Error),

    /// 청크 본문 조회 실패
    #[error("knowledge store lookup failed: {0:#}")]
    Store(#[source] anyhow::Error),

    /// 언어 모델 호출 실패
    #[error("language model failed: {0:#}")]
    LanguageModel(#[source] anyhow::Error),
}

impl QueryError {
    /// 검색 단계 실패인지 여부 (임베딩/벡터 인덱스)
    pub fn is_retrieval_failure(&self) -> bool {
        matches!(self, QueryError::Embedding(_) | QueryError::VectorIndex(_))
    }
}
