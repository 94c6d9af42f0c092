//! 언어 모델 모듈 - 컨텍스트 번들과 Ollama 채팅 어댑터
//!
//! 오케스트레이터가 `ContextBundle`을 완성한 뒤에만 모델을 호출합니다.
//! 스트리밍은 텍스트 조각 스트림이며 중간부터 다시 시작할 수 없습니다.

use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::OllamaSettings;
use crate::embedding::OllamaError;
use crate::knowledge::ChunkOrigin;
use crate::memory::ConversationTurn;

/// 조각 스트림
pub type TextStream = BoxStream<'static, Result<String>>;

// ============================================================================
// Context Bundle
// ============================================================================

/// 컨텍스트에 들어가는 청크
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextChunk {
    pub chunk_id: String,
    pub doc_id: String,
    /// 구조 경로 (예: "Chapter 2 > Section 14")
    pub section: Option<String>,
    pub page: usize,
    pub text: String,
    pub origin: ChunkOrigin,
}

/// 모델에 넘기는 완성된 컨텍스트
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextBundle {
    /// 직접 검색 결과 먼저, 그다음 확장 청크
    pub chunks: Vec<ContextChunk>,
    /// 최근 대화 (오래된 순)
    pub history: Vec<ConversationTurn>,
}

impl ContextBundle {
    pub fn chunk_ids(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.chunk_id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 청크 텍스트 바이트 합계
    pub fn context_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.text.len()).sum()
    }
}

/// 시스템 프롬프트
pub const SYSTEM_PROMPT: &str = "You are a legal research assistant for a corpus of acts, rules and regulations.\n\
Answer strictly from the supplied document excerpts. Cite the chapter, section, rule or schedule \
you rely on. If the excerpts do not contain the answer, say: \"I don't have specific information \
about this in the available documents.\" If the question is ambiguous, ask for clarification. \
Use the previous conversation only to resolve references such as \"that section\".";

/// 사용자 프롬프트 조립
pub fn build_prompt(bundle: &ContextBundle, query: &str) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !bundle.history.is_empty() {
        parts.push("=== Previous Conversation ===".to_string());
        for turn in &bundle.history {
            parts.push(format!("User: {}", turn.query));
            parts.push(format!("Assistant: {}", turn.response));
        }
        parts.push(String::new());
    }

    parts.push("=== Relevant Information from Documents ===".to_string());
    for (i, chunk) in bundle.chunks.iter().enumerate() {
        let mut source = format!("[Source {}] ({}", i + 1, chunk.doc_id);
        if let Some(section) = &chunk.section {
            source.push_str(&format!(", {}", section));
        }
        source.push_str(&format!(", page {})", chunk.page));
        parts.push(source);
        parts.push(chunk.text.trim_end().to_string());
        parts.push(String::new());
    }

    parts.push("=== User Question ===".to_string());
    parts.push(query.to_string());
    parts.push(String::new());
    parts.push("=== Your Response ===".to_string());
    parts.push(
        "Based on the provided information and conversation history, answer the question accurately and concisely:"
            .to_string(),
    );

    parts.join("\n")
}

// ============================================================================
// LanguageModel Trait
// ============================================================================

/// 언어 모델 협력자
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// 전체 응답 생성
    async fn generate(&self, bundle: &ContextBundle, query: &str) -> Result<String>;

    /// 응답 조각 스트림 (연결 실패는 스트림 시작 전에 반환)
    async fn stream(&self, bundle: &ContextBundle, query: &str) -> Result<TextStream>;

    /// 모델 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Ollama Chat
// ============================================================================

/// Ollama `/api/chat` 어댑터
///
/// ref: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-a-chat-completion
#[derive(Debug)]
pub struct OllamaChat {
    base_url: String,
    model: String,
    client: reqwest::Client,
    options: ChatOptions,
}

#[derive(Debug, Clone, Serialize)]
struct ChatOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: &'a ChatOptions,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    content: String,
}

/// 응답 (비스트리밍 응답과 NDJSON 한 줄이 같은 형태)
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaChat {
    pub fn from_settings(settings: &OllamaSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        tracing::info!("Using Ollama chat model {}", settings.llm_model);

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.llm_model.clone(),
            client,
            options: ChatOptions {
                temperature: settings.temperature,
                top_p: settings.top_p,
                num_predict: settings.max_tokens,
            },
        })
    }

    fn messages(bundle: &ContextBundle, query: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage {
                role: "system".to_string(),
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: build_prompt(bundle, query),
            },
        ]
    }

    async fn send(&self, bundle: &ContextBundle, query: &str, stream: bool) -> Result<reqwest::Response> {
        let request = ChatRequest {
            model: &self.model,
            messages: Self::messages(bundle, query),
            stream,
            options: &self.options,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to send chat request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(error) = serde_json::from_str::<OllamaError>(&body) {
                anyhow::bail!("Ollama chat error ({}): {}", status, error.error);
            }
            anyhow::bail!("Ollama chat error ({}): {}", status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OllamaChat {
    async fn generate(&self, bundle: &ContextBundle, query: &str) -> Result<String> {
        let body = self
            .send(bundle, query, false)
            .await?
            .text()
            .await
            .context("Failed to read chat response")?;

        let chunk: ChatChunk = serde_json::from_str(&body).context("Failed to parse chat response")?;
        if let Some(error) = chunk.error {
            anyhow::bail!("Ollama chat error: {}", error);
        }
        chunk
            .message
            .map(|m| m.content)
            .ok_or_else(|| anyhow::anyhow!("Chat response has no message"))
    }

    async fn stream(&self, bundle: &ContextBundle, query: &str) -> Result<TextStream> {
        let response = self.send(bundle, query, true).await?;
        Ok(ndjson_fragments(
            response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        ))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// NDJSON Streaming
// ============================================================================

struct NdjsonState<S> {
    bytes: S,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> NdjsonState<S> {
    /// 완성된 줄을 조각으로 변환
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.push_line(&line);
        }
    }

    fn push_line(&mut self, line: &[u8]) {
        if self.finished {
            return;
        }
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match serde_json::from_str::<ChatChunk>(line) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    self.pending
                        .push_back(Err(anyhow::anyhow!("Ollama stream error: {}", error)));
                    self.finished = true;
                    return;
                }
                if let Some(message) = chunk.message {
                    if !message.content.is_empty() {
                        self.pending.push_back(Ok(message.content));
                    }
                }
                if chunk.done {
                    self.finished = true;
                }
            }
            Err(e) => {
                tracing::warn!("Skipping malformed stream line: {}", e);
            }
        }
    }
}

/// 바이트 스트림을 NDJSON 텍스트 조각 스트림으로 변환
fn ndjson_fragments<S, E>(bytes: S) -> TextStream
where
    S: Stream<Item = std::result::Result<Vec<u8>, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let state = NdjsonState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(anyhow::anyhow!("Stream error: {}", e)), state));
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    state.push_line(&rest);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(with_history: bool) -> ContextBundle {
        ContextBundle {
            chunks: vec![ContextChunk {
                chunk_id: "act#3".to_string(),
                doc_id: "act".to_string(),
                section: Some("Chapter II > Section 14".to_string()),
                page: 7,
                text: "14. Tender security\nEvery bidder shall furnish security.\n".to_string(),
                origin: ChunkOrigin::Retrieved { rank: 0, score: 0.9 },
            }],
            history: if with_history {
                vec![ConversationTurn::new("What is a bid?", "An offer.", vec![])]
            } else {
                vec![]
            },
        }
    }

    fn byte_stream(parts: Vec<&str>) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> + Send + Unpin + 'static {
        let owned: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            parts.into_iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures::stream::iter(owned)
    }

    #[test]
    fn test_prompt_sections() {
        let prompt = build_prompt(&bundle(true), "How much security?");

        let history = prompt.find("=== Previous Conversation ===").unwrap();
        let context = prompt.find("=== Relevant Information from Documents ===").unwrap();
        let question = prompt.find("=== User Question ===").unwrap();
        assert!(history < context && context < question);
        assert!(prompt.contains("User: What is a bid?"));
        assert!(prompt.contains("[Source 1] (act, Chapter II > Section 14, page 7)"));
        assert!(prompt.contains("How much security?"));
    }

    #[test]
    fn test_prompt_without_history() {
        let prompt = build_prompt(&bundle(false), "q");
        assert!(!prompt.contains("Previous Conversation"));
        assert!(prompt.starts_with("=== Relevant Information from Documents ==="));
    }

    #[test]
    fn test_bundle_accessors() {
        let b = bundle(false);
        assert_eq!(b.chunk_ids(), vec!["act#3"]);
        assert!(!b.is_empty());
        assert_eq!(b.context_bytes(), b.chunks[0].text.len());
    }

    #[tokio::test]
    async fn test_ndjson_split_across_chunks() {
        let stream = ndjson_fragments(byte_stream(vec![
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Sec",
            "tion 14\"},\"done\":false}\n{\"message\":{\"role\":\"assistant\",\"content\":\" applies.\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"ignored\"},\"done\":false}\n",
        ]));

        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments, vec!["Section 14", " applies."]);
    }

    #[tokio::test]
    async fn test_ndjson_error_line() {
        let stream = ndjson_fragments(byte_stream(vec![
            "{\"message\":{\"role\":\"assistant\",\"content\":\"a\"},\"done\":false}\n",
            "{\"error\":\"model not found\"}\n",
        ]));

        let items: Vec<Result<String>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "a");
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_ndjson_trailing_line_without_newline() {
        let stream = ndjson_fragments(byte_stream(vec![
            "{\"message\":{\"role\":\"assistant\",\"content\":\"end\"},\"done\":true}",
        ]));
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments, vec!["end"]);
    }
}
