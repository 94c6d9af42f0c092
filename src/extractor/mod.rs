//! 콘텐츠 추출 모듈
//!
//! 수집된 파일에서 청킹할 텍스트를 추출합니다.
//! - 텍스트 파일: 직접 읽기
//! - PDF 파일: pdf-extract로 페이지별 추출 후 폼피드(`\x0c`)로 연결
//!
//! 청커가 폼피드로 페이지 번호를 계산합니다.

pub mod pdf;

use std::path::Path;

use anyhow::{Context, Result};

use crate::collector::{CollectedFile, FileType};

/// 페이지 구분 문자
pub const PAGE_BREAK: char = '\x0c';

// ============================================================================
// Extracted Document
// ============================================================================

/// 추출된 문서
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub doc_id: String,
    pub title: Option<String>,
    pub source_path: String,
    /// 전체 텍스트 (페이지는 `PAGE_BREAK`로 구분)
    pub text: String,
    pub page_count: usize,
    pub source_type: FileType,
}

// ============================================================================
// Content Extractor
// ============================================================================

/// 콘텐츠 추출기
#[derive(Debug, Default, Clone)]
pub struct ContentExtractor;

impl ContentExtractor {
    pub fn new() -> Self {
        Self
    }

    /// 수집된 파일에서 문서 추출
    pub async fn extract(&self, file: &CollectedFile) -> Result<ExtractedDocument> {
        let (text, page_count) = match file.file_type {
            FileType::Text => {
                let text = self.extract_text(&file.path).await?;
                let pages = text.matches(PAGE_BREAK).count() + 1;
                (text, pages)
            }
            FileType::Pdf => {
                let pages = self.extract_pdf(&file.path).await?;
                let count = pages.len();
                (join_pages(&pages), count)
            }
        };

        Ok(ExtractedDocument {
            doc_id: file.doc_id.clone(),
            title: file.title(),
            source_path: file.path.display().to_string(),
            text,
            page_count,
            source_type: file.file_type,
        })
    }

    async fn extract_text(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read text file: {:?}", path))
    }

    async fn extract_pdf(&self, path: &Path) -> Result<Vec<String>> {
        // PDF 추출은 CPU 바운드이므로 spawn_blocking 사용
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || pdf::extract_pages_from_pdf(&path))
            .await
            .context("PDF extraction task failed")?
    }
}

/// 페이지 텍스트를 폼피드로 연결 (각 페이지는 줄바꿈으로 끝남)
pub fn join_pages(pages: &[String]) -> String {
    let mut text = String::new();
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            text.push(PAGE_BREAK);
        }
        text.push_str(page);
        if !page.ends_with('\n') {
            text.push('\n');
        }
    }
    text
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::FileCollector;

    #[test]
    fn test_join_pages() {
        let text = join_pages(&["CHAPTER I".to_string(), "CHAPTER II\n".to_string()]);
        assert_eq!(text, "CHAPTER I\n\x0cCHAPTER II\n");
        assert_eq!(join_pages(&[]), "");
    }

    #[tokio::test]
    async fn test_extract_text_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.txt");
        std::fs::write(&path, "1. Short title\n\x0c2. Definitions\n").unwrap();

        let file = FileCollector::with_defaults().collect_file(&path).unwrap().unwrap();
        let doc = ContentExtractor::new().extract(&file).await.unwrap();

        assert_eq!(doc.doc_id, "rules");
        assert_eq!(doc.page_count, 2);
        assert_eq!(doc.source_type, FileType::Text);
        assert!(doc.text.starts_with("1. Short title"));
    }
}
