//! 설정 모듈
//!
//! `<data_dir>/config.toml` 파일과 환경변수에서 설정을 읽습니다.
//! 파일이 없거나 키가 빠져 있으면 기본값을 사용합니다.
//!
//! ## 환경변수
//! - `LEXGRAPH_DATA_DIR`: 데이터 디렉토리
//! - `LEXGRAPH_DOCUMENTS_DIR`: 수집 대상 문서 디렉토리
//! - `OLLAMA_HOST`: Ollama 서버 주소
//! - `LEXGRAPH_LLM_MODEL`, `LEXGRAPH_EMBEDDING_MODEL`: 모델 이름

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 설정 파일 이름
pub const CONFIG_FILE_NAME: &str = "config.toml";

// ============================================================================
// Data Directory
// ============================================================================

/// 기본 데이터 디렉토리 경로 (~/.lexgraph-rag/)
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LEXGRAPH_DATA_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lexgraph-rag")
}

// ============================================================================
// Settings
// ============================================================================

/// 전체 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathSettings,
    pub ollama: OllamaSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub expansion: ExpansionSettings,
    pub memory: MemorySettings,
}

/// 경로 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// 영속 상태 (knowledge.db, vectors.lance, graph.json, memory.db)
    pub data_dir: PathBuf,
    /// 수집할 원문 문서 디렉토리
    pub documents_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        let data_dir = get_data_dir();
        Self {
            documents_dir: data_dir.join("documents"),
            data_dir,
        }
    }
}

impl PathSettings {
    pub fn knowledge_db(&self) -> PathBuf {
        self.data_dir.join("knowledge.db")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors.lance")
    }

    pub fn graph_file(&self) -> PathBuf {
        self.data_dir.join("graph.json")
    }

    pub fn memory_db(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }
}

/// Ollama 협력자 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub base_url: String,
    pub llm_model: String,
    pub embedding_model: String,
    /// 임베딩 벡터 차원
    pub embedding_dimension: usize,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            llm_model: "deepseek-r1:8b".to_string(),
            embedding_model: "nomic-embed-text:latest".to_string(),
            embedding_dimension: 768,
            timeout_secs: 120,
            temperature: 0.1,
            top_p: 0.9,
            max_tokens: 2048,
        }
    }
}

/// 청킹 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// 구조 경계를 찾기 위해 목표 길이를 넘어 허용하는 범위
    pub tolerance: usize,
    /// 문서당 최대 청크 수, 넘으면 해당 문서 수집 실패 (0이면 제한 없음)
    pub max_chunks_per_doc: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            tolerance: 200,
            max_chunks_per_doc: 0,
        }
    }
}

/// 검색 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub rerank_top_k: usize,
    pub similarity_threshold: f32,
    /// 리랭크 시 어휘 겹침 점수 가중치 (0.0 ~ 1.0)
    pub rerank_weight: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 8,
            rerank_top_k: 5,
            similarity_threshold: 0.7,
            rerank_weight: 0.3,
        }
    }
}

/// 그래프 확장 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionSettings {
    pub enabled: bool,
    pub depth: usize,
    /// 컨텍스트 예산 (청크 텍스트 바이트 합계)
    pub budget_chars: usize,
}

impl Default for ExpansionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            depth: 1,
            budget_chars: 6000,
        }
    }
}

/// 대화 메모리 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub max_turns: usize,
    pub window: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_turns: 100,
            window: 10,
        }
    }
}

impl Settings {
    /// 기본 위치에서 설정 로드 (+ 환경변수 오버라이드)
    pub fn load() -> Result<Self> {
        let path = get_data_dir().join(CONFIG_FILE_NAME);
        let mut settings = Self::load_file(&path)?;
        settings.apply_env();
        Ok(settings)
    }

    /// TOML 파일에서 로드 (파일이 없으면 기본값)
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// TOML 문자열 파싱
    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(raw).context("Failed to parse TOML settings")?;
        settings.validate()?;
        Ok(settings)
    }

    /// 환경변수 오버라이드 적용
    pub fn apply_env(&mut self) {
        if let Some(dir) = non_empty_env("LEXGRAPH_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env("LEXGRAPH_DOCUMENTS_DIR") {
            self.paths.documents_dir = PathBuf::from(dir);
        }
        if let Some(host) = non_empty_env("OLLAMA_HOST") {
            self.ollama.base_url = if host.starts_with("http") {
                host
            } else {
                format!("http://{}", host)
            };
        }
        if let Some(model) = non_empty_env("LEXGRAPH_LLM_MODEL") {
            self.ollama.llm_model = model;
        }
        if let Some(model) = non_empty_env("LEXGRAPH_EMBEDDING_MODEL") {
            self.ollama.embedding_model = model;
        }
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be greater than 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            anyhow::bail!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            anyhow::bail!("retrieval.similarity_threshold must be within 0.0..=1.0");
        }
        if !(0.0..=1.0).contains(&self.retrieval.rerank_weight) {
            anyhow::bail!("retrieval.rerank_weight must be within 0.0..=1.0");
        }
        if self.memory.max_turns == 0 {
            anyhow::bail!("memory.max_turns must be greater than 0");
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

// ============================================================================
// Tests
// ============================================================================
