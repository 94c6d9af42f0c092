//! PDF 텍스트 추출 모듈
//!
//! pdf-extract 크레이트를 사용하여 PDF에서 텍스트를 추출합니다.

use std::path::Path;

use anyhow::{Context, Result};

/// PDF에서 페이지별 텍스트 추출 (1페이지부터 순서대로)
pub fn extract_pages_from_pdf(path: &Path) -> Result<Vec<String>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read PDF: {:?}", path))?;

    let text = pdf_extract::extract_text_from_mem(&bytes)
        .with_context(|| format!("Failed to extract text from PDF: {:?}", path))?;

    if text.trim().is_empty() {
        tracing::warn!(
            "No text extracted from PDF: {:?}. It might be a scanned document.",
            path
        );
        return Ok(vec![]);
    }

    Ok(split_pdf_pages(&text))
}

/// PDF 텍스트를 페이지별로 분리
fn split_pdf_pages(text: &str) -> Vec<String> {
    // 폼피드 문자 (\x0c)
    let pages: Vec<String> = text
        .split('\x0c')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if pages.len() > 1 {
        return pages;
    }

    // 페이지 구분자 줄 (예: "--- Page 1 ---")
    let page_pattern = regex::Regex::new(r"(?m)^[\s]*[-=]+[\s]*(?:Page[\s]*)?(\d+)[\s]*[-=]+[\s]*$")
        .expect("Invalid regex");

    if page_pattern.is_match(text) {
        let pages: Vec<String> = page_pattern
            .split(text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if pages.len() > 1 {
            return pages;
        }
    }

    vec![text.trim().to_string()]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pdf_pages_with_formfeed() {
        let text = "CHAPTER I\x0cCHAPTER II\x0c\x0cSCHEDULE 1";
        let pages = split_pdf_pages(text);
        assert_eq!(pages, vec!["CHAPTER I", "CHAPTER II", "SCHEDULE 1"]);
    }

    #[test]
    fn test_split_pdf_pages_with_marker_lines() {
        let text = "first page\n--- Page 2 ---\nsecond page\n";
        let pages = split_pdf_pages(text);
        assert_eq!(pages, vec!["first page", "second page"]);
    }

    #[test]
    fn test_split_pdf_pages_no_separator() {
        let pages = split_pdf_pages("Just some text without page breaks\n");
        assert_eq!(pages, vec!["Just some text without page breaks"]);
    }

    #[test]
    fn test_missing_pdf_is_error() {
        assert!(extract_pages_from_pdf(Path::new("/nonexistent/act.pdf")).is_err());
    }
}
