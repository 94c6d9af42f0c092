//! 임베딩 모듈 - Ollama를 통한 텍스트 벡터화
//!
//! 로컬 Ollama 서버의 임베딩 모델(기본 `nomic-embed-text`)을 사용합니다.
//! 같은 텍스트와 같은 모델이면 같은 벡터가 나온다고 가정합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = OllamaEmbedding::from_settings(&settings.ollama)?;
//! let embedding = embedder.embed("What is tender security?").await?;
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::OllamaSettings;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 벡터로 변환하는 인터페이스입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Ollama Embedding
// ============================================================================

/// 일시적 오류 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 500;

/// Ollama 임베딩 구현체
///
/// ref: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-embeddings
#[derive(Debug)]
pub struct OllamaEmbedding {
    base_url: String,
    model: String,
    client: reqwest::Client,
    dimension: usize,
}

impl OllamaEmbedding {
    /// 새 Ollama 임베딩 인스턴스 생성
    ///
    /// # Arguments
    /// * `base_url` - Ollama 서버 주소 (예: http://localhost:11434)
    /// * `model` - 임베딩 모델 이름
    /// * `dimension` - 기대하는 벡터 차원 (응답 검증용)
    pub fn new(base_url: &str, model: &str, dimension: usize, timeout: Duration) -> Result<Self> {
        if dimension == 0 {
            anyhow::bail!("Invalid embedding dimension: 0");
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            dimension,
        })
    }

    /// 설정에서 생성
    pub fn from_settings(settings: &OllamaSettings) -> Result<Self> {
        let embedder = Self::new(
            &settings.base_url,
            &settings.embedding_model,
            settings.embedding_dimension,
            Duration::from_secs(settings.timeout_secs),
        )?;
        tracing::info!(
            "Using Ollama embedding {} (dimension: {})",
            embedder.model,
            embedder.dimension
        );
        Ok(embedder)
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embeddings", self.base_url)
    }
}

/// Ollama 임베딩 요청 본문
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

/// Ollama 임베딩 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Ollama 에러 응답
#[derive(Debug, Deserialize)]
pub(crate) struct OllamaError {
    pub error: String,
}

/// 재시도할 만한 상태 코드 (429, 5xx)
pub(crate) fn is_retryable(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// 지수 백오프 간격
pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt))
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // 빈 텍스트 처리
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let request = EmbedRequest {
            model: &self.model,
            prompt: text,
        };

        let mut last_error: Option<anyhow::Error> = None;

        // 재시도 루프 (전송 실패, 429, 5xx 시 지수 백오프)
        for attempt in 0..=MAX_RETRIES {
            let response = match self.client.post(self.endpoint()).json(&request).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Failed to send embedding request: {}", e));
                    if attempt < MAX_RETRIES {
                        let wait = backoff(attempt);
                        tracing::warn!(
                            "Embedding request failed, retrying in {:?} (attempt {}/{})",
                            wait,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .context("Failed to read response body")?;

            // 성공
            if status.is_success() {
                let parsed: EmbedResponse =
                    serde_json::from_str(&body).context("Failed to parse embedding response")?;
                if parsed.embedding.len() != self.dimension {
                    anyhow::bail!(
                        "Embedding dimension mismatch: model {} returned {}, expected {}",
                        self.model,
                        parsed.embedding.len(),
                        self.dimension
                    );
                }
                return Ok(parsed.embedding);
            }

            if is_retryable(status) {
                last_error = Some(anyhow::anyhow!("Ollama embedding error ({}): {}", status, body));
                if attempt < MAX_RETRIES {
                    let wait = backoff(attempt);
                    tracing::warn!(
                        "Ollama returned {}, backing off {:?} (attempt {}/{})",
                        status,
                        wait,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
            } else {
                // 다른 에러 - 즉시 실패
                if let Ok(error) = serde_json::from_str::<OllamaError>(&body) {
                    anyhow::bail!("Ollama embedding error ({}): {}", status, error.error);
                }
                anyhow::bail!("Ollama embedding error ({}): {}", status, body);
            }
        }

        // 모든 재시도 실패
        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Embedding failed after {} retries", MAX_RETRIES)))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());

        for (i, text) in texts.iter().enumerate() {
            tracing::debug!("Embedding batch {}/{}", i + 1, texts.len());
            results.push(self.embed(text).await?);
        }

        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn embedder(base_url: &str) -> OllamaEmbedding {
        OllamaEmbedding::new(base_url, "nomic-embed-text:latest", 4, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_invalid_dimension() {
        let result = OllamaEmbedding::new("http://localhost:11434", "m", 0, Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let e = embedder("http://localhost:11434/");
        assert_eq!(e.endpoint(), "http://localhost:11434/api/embeddings");
        assert_eq!(e.name(), "nomic-embed-text:latest");
    }

    #[test]
    fn test_request_shape() {
        let json = serde_json::to_value(EmbedRequest {
            model: "nomic-embed-text",
            prompt: "hello",
        })
        .unwrap();
        assert_eq!(json["model"], "nomic-embed-text");
        assert_eq!(json["prompt"], "hello");
    }

    #[test]
    fn test_retry_policy() {
        assert!(is_retryable(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(reqwest::StatusCode::NOT_FOUND));
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_empty_text_skips_request() {
        // 연결할 수 없는 주소여도 빈 텍스트는 요청하지 않음
        let e = embedder("http://127.0.0.1:9");
        let v = e.embed("   ").await.unwrap();
        assert_eq!(v, vec![0.0; 4]);
    }
}
