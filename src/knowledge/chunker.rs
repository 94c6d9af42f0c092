//! Text Chunking Module
//!
//! 법령 문서 구조(장/절/조/규칙)를 인식하는 텍스트 분할을 제공합니다.
//!
//! - 구조 헤더에서 우선 분할
//! - 번호 붙은 하위 항목 `(a)`, `(iv)`, `(2)` 은 가능한 한 쪼개지 않음
//! - 인접 청크 사이 고정 길이 오버랩
//! - 오버랩을 제외한 본문(core)을 순서대로 이으면 원문이 정확히 복원됨

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ChunkingSettings;

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정 (단위: UTF-8 바이트)
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// 목표 청크 크기
    pub chunk_size: usize,
    /// 오버랩 크기 (상한)
    pub chunk_overlap: usize,
    /// 구조 경계를 찾기 위해 목표 크기를 넘어 허용하는 범위
    pub tolerance: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            tolerance: 200,
        }
    }
}

impl From<&ChunkingSettings> for ChunkConfig {
    fn from(settings: &ChunkingSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            chunk_overlap: settings.chunk_overlap,
            tolerance: settings.tolerance,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// 청킹 대상 문서 메타데이터
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub doc_id: String,
    pub title: Option<String>,
    /// 첫 페이지 번호 (보통 1)
    pub first_page: usize,
}

impl DocumentMeta {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            title: None,
            first_page: 1,
        }
    }
}

/// 검색 단위 청크
///
/// `text == document[start..end]` 이고, 앞쪽 `overlap` 바이트는
/// 이전 청크와 공유되는 영역입니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub seq: usize,
    pub text: String,
    /// 구조 경로 (예: ["Chapter 2", "Section 14"])
    pub path: Vec<String>,
    pub page: usize,
    pub start: usize,
    pub end: usize,
    pub overlap: usize,
    pub content_hash: String,
}

impl Chunk {
    /// 안정적인 청크 ID
    pub fn make_id(doc_id: &str, seq: usize) -> String {
        format!("{}#{}", doc_id, seq)
    }

    /// 오버랩을 제외한 본문
    pub fn core_text(&self) -> &str {
        &self.text[self.overlap..]
    }

    /// 이전 청크와 공유되는 텍스트가 있는지
    pub fn has_overlap(&self) -> bool {
        self.overlap > 0
    }

    /// 가장 깊은 구조 라벨
    pub fn section_label(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

/// 텍스트 SHA-256 (hex)
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

// ============================================================================
// Structural Labels
// ============================================================================

/// 부속서 계열 라벨 종류 (계층 밖의 인용 대상)
const ANNEX_KINDS: [&str; 4] = ["Schedule", "Annexure", "Appendix", "Form"];

/// 라벨 정규화: 종류는 첫 글자만 대문자, 번호는 대문자
///
/// 로마 숫자 번호는 아라비아 숫자로 바꿉니다 (`CHAPTER IV` → `Chapter 4`).
/// 한 글자 번호는 I, V, X만 로마 숫자로 보고 나머지(`Appendix C`)는 그대로 둡니다.
/// 헤더와 상호 참조가 같은 라벨로 만나도록 양쪽 모두 이 함수를 씁니다.
pub fn normalize_label(kind: &str, id: &str) -> String {
    let lower = kind.trim().to_lowercase();
    let kind = lower
        .strip_suffix('s')
        .filter(|k| !k.is_empty())
        .unwrap_or(lower.as_str());
    let mut chars = kind.chars();
    let kind = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    };
    let id = id.trim().to_uppercase();
    let id = match roman_value(&id) {
        Some(value) if id.len() > 1 || matches!(id.as_str(), "I" | "V" | "X") => value.to_string(),
        _ => id,
    };
    format!("{} {}", kind, id)
}

const ROMAN_TABLE: [(u32, &str); 13] = [
    (1000, "M"),
    (900, "CM"),
    (500, "D"),
    (400, "CD"),
    (100, "C"),
    (90, "XC"),
    (50, "L"),
    (40, "XL"),
    (10, "X"),
    (9, "IX"),
    (5, "V"),
    (4, "IV"),
    (1, "I"),
];

fn to_roman(mut value: u32) -> String {
    let mut out = String::new();
    for (unit, symbol) in ROMAN_TABLE {
        while value >= unit {
            out.push_str(symbol);
            value -= unit;
        }
    }
    out
}

/// 정규형 대문자 로마 숫자의 값 (`IV` → 4, `IIII`/`DID` → None)
pub(crate) fn roman_value(numeral: &str) -> Option<u32> {
    if numeral.is_empty() {
        return None;
    }
    let mut total = 0u32;
    let mut prev = 0u32;
    for c in numeral.chars().rev() {
        let value = match c {
            'I' => 1,
            'V' => 5,
            'X' => 10,
            'L' => 50,
            'C' => 100,
            'D' => 500,
            'M' => 1000,
            _ => return None,
        };
        if value < prev {
            total -= value;
        } else {
            total += value;
            prev = value;
        }
    }
    (to_roman(total) == numeral).then_some(total)
}

/// 부속서 계열 라벨인지 (Schedule, Annexure, Appendix, Form)
pub fn is_annex_label(label: &str) -> bool {
    ANNEX_KINDS
        .iter()
        .any(|kind| label.split_whitespace().next() == Some(*kind))
}

/// 인식된 구조 헤더
#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    /// 0 = 장/편/부속서, 1 = 조/규칙, 2 = 하위 조
    level: usize,
    label: String,
}

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("Invalid regex"))
}

static DIVISION_RE: OnceLock<Regex> = OnceLock::new();
static ANNEX_RE: OnceLock<Regex> = OnceLock::new();
static SUBSECTION_RE: OnceLock<Regex> = OnceLock::new();
static NUMBERED_SECTION_RE: OnceLock<Regex> = OnceLock::new();
static NAMED_SECTION_RE: OnceLock<Regex> = OnceLock::new();
static CLAUSE_RE: OnceLock<Regex> = OnceLock::new();

/// 헤더로 인정하는 최대 줄 길이
const MAX_HEADER_LINE: usize = 120;

fn parse_header(line: &str) -> Option<Header> {
    let line = line.trim();
    if line.is_empty() || line.len() > MAX_HEADER_LINE {
        return None;
    }

    let division = compiled(
        &DIVISION_RE,
        r"(?i)^(chapter|part)\s+([ivxlcdm]+|\d+[a-z]?)\s*(?:[.:\-–—]|$)",
    );
    if let Some(caps) = division.captures(line) {
        return Some(Header {
            level: 0,
            label: normalize_label(&caps[1], &caps[2]),
        });
    }

    let annex = compiled(
        &ANNEX_RE,
        r"(?i)^(schedule|annexure|appendix|form)\s*[-:]?\s*([ivxlcdm]+|\d+[a-z]?|[a-z])\s*(?:[.:\-–—(]|$)",
    );
    if let Some(caps) = annex.captures(line) {
        return Some(Header {
            level: 0,
            label: normalize_label(&caps[1], &caps[2]),
        });
    }

    let subsection = compiled(&SUBSECTION_RE, r"^(\d+)\.(\d+)\.?\s+[A-Z]");
    if let Some(caps) = subsection.captures(line) {
        return Some(Header {
            level: 2,
            label: normalize_label("section", &format!("{}.{}", &caps[1], &caps[2])),
        });
    }

    let numbered = compiled(&NUMBERED_SECTION_RE, r"^(\d+[A-Z]?)\.\s+[A-Z]");
    if let Some(caps) = numbered.captures(line) {
        return Some(Header {
            level: 1,
            label: normalize_label("section", &caps[1]),
        });
    }

    let named = compiled(
        &NAMED_SECTION_RE,
        r"(?i)^(section|rule)\s+(\d+[a-z]?)\s*(?:[.:\-–—]|$)",
    );
    if let Some(caps) = named.captures(line) {
        return Some(Header {
            level: 1,
            label: normalize_label(&caps[1], &caps[2]),
        });
    }

    None
}

/// 번호 붙은 하위 항목 시작 줄인지: `(a)`, `(iv)`, `(2)`
fn is_clause_start(line: &str) -> bool {
    compiled(&CLAUSE_RE, r"(?i)^\((?:[a-z]{1,2}|[ivxlc]+|\d{1,3})\)\s")
        .is_match(line.trim_start())
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 문서를 청크로 분할 (seq 순서)
    fn chunk(&self, text: &str, meta: &DocumentMeta) -> Vec<Chunk>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// SemanticChunker
// ============================================================================

/// 분할 후보의 선호도 (높을수록 우선)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BreakPriority {
    /// 하위 항목 내부의 줄 시작
    InsideClause = 0,
    /// 하위 항목 밖의 줄 시작
    Line = 1,
    /// 빈 줄 뒤 문단 시작
    Paragraph = 2,
    /// 하위 항목 시작
    Clause = 3,
}

#[derive(Debug)]
struct Line {
    start: usize,
    header: Option<Header>,
    clause_start: bool,
    blank: bool,
}

/// 헤더 단위 구간
#[derive(Debug, Clone)]
struct Segment {
    start: usize,
    end: usize,
    path: Vec<String>,
    /// 헤더 줄 외에 본문이 없음 (다음 구간에 병합 대상)
    weak: bool,
}

/// 법령 구조 인식 청커
///
/// 1. 구조 헤더마다 구간을 나누고 헤더만 있는 구간은 다음 구간에 병합
/// 2. 긴 구간은 하위 항목 > 문단 > 줄 > 공백 순으로 경계를 골라 분할
/// 3. 이전 청크 끝부분을 다음 청크 앞에 오버랩으로 붙임
#[derive(Debug, Clone)]
pub struct SemanticChunker {
    config: ChunkConfig,
}

impl SemanticChunker {
    /// 설정으로 생성
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// 기본 설정으로 생성
    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    fn scan_lines(text: &str) -> Vec<Line> {
        let mut lines = Vec::new();
        let mut offset = 0;
        for raw in text.split_inclusive('\n') {
            lines.push(Line {
                start: offset,
                header: parse_header(raw),
                clause_start: is_clause_start(raw),
                blank: raw.trim().is_empty(),
            });
            offset += raw.len();
        }
        lines
    }

    /// 헤더 경계로 구간 분할
    fn split_segments(text: &str, lines: &[Line]) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut stack: Vec<(usize, String)> = Vec::new();
        let mut current = Segment {
            start: 0,
            end: text.len(),
            path: Vec::new(),
            weak: true,
        };

        for line in lines {
            if let Some(ref header) = line.header {
                if line.start > current.start {
                    current.end = line.start;
                    segments.push(current.clone());
                }
                stack.retain(|(level, _)| *level < header.level);
                stack.push((header.level, header.label.clone()));
                current = Segment {
                    start: line.start,
                    end: text.len(),
                    path: stack.iter().map(|(_, label)| label.clone()).collect(),
                    weak: true,
                };
            } else if !line.blank {
                current.weak = false;
            }
        }
        current.end = text.len();
        segments.push(current);

        Self::merge_weak_segments(segments, text.len())
    }

    /// 본문 없는 구간을 다음 구간으로 병합 (마지막이면 이전 구간으로)
    fn merge_weak_segments(segments: Vec<Segment>, text_len: usize) -> Vec<Segment> {
        let mut result: Vec<Segment> = Vec::with_capacity(segments.len());
        let mut pending: Option<Segment> = None;

        for mut segment in segments {
            if let Some(weak) = pending.take() {
                segment.start = weak.start;
            }
            if segment.weak {
                pending = Some(segment);
                continue;
            }
            result.push(segment);
        }

        // 꼬리에 남은 구간
        if let Some(weak) = pending {
            match result.last_mut() {
                Some(last) => last.end = text_len,
                None => result.push(Segment {
                    end: text_len,
                    ..weak
                }),
            }
        }

        result
    }

    /// 구간 내부 분할 후보 (offset, 선호도)
    fn break_candidates(lines: &[Line], start: usize, end: usize) -> Vec<(usize, BreakPriority)> {
        let mut candidates = Vec::new();
        let mut in_clause = false;
        let mut prev_blank = false;

        for line in lines.iter().filter(|l| l.start >= start && l.start < end) {
            if line.start > start {
                let priority = if line.clause_start {
                    BreakPriority::Clause
                } else if prev_blank && !line.blank {
                    BreakPriority::Paragraph
                } else if in_clause {
                    BreakPriority::InsideClause
                } else {
                    BreakPriority::Line
                };
                candidates.push((line.start, priority));
            }

            if line.clause_start {
                in_clause = true;
            } else if line.blank {
                in_clause = false;
            }
            prev_blank = line.blank;
        }

        candidates
    }

    /// 긴 구간을 목표 크기 근처에서 분할
    fn split_long_segment(&self, text: &str, lines: &[Line], segment: &Segment) -> Vec<(usize, usize)> {
        let limit = self.config.chunk_size + self.config.tolerance;
        if segment.end - segment.start <= limit {
            return vec![(segment.start, segment.end)];
        }

        let candidates = Self::break_candidates(lines, segment.start, segment.end);
        let min_piece = (self.config.chunk_size / 4).max(1);
        let mut pieces = Vec::new();
        let mut pos = segment.start;

        while segment.end - pos > limit {
            let target = pos + self.config.chunk_size;
            let window_start = pos + min_piece;
            let window_end = pos + limit;

            let best = candidates
                .iter()
                .filter(|(offset, _)| *offset > window_start && *offset <= window_end)
                .max_by(|(a_off, a_pri), (b_off, b_pri)| {
                    a_pri
                        .cmp(b_pri)
                        .then_with(|| target.abs_diff(*b_off).cmp(&target.abs_diff(*a_off)))
                        .then_with(|| b_off.cmp(a_off))
                })
                .map(|(offset, _)| *offset);

            let cut = best
                .or_else(|| whitespace_cut(text, window_start, target))
                .unwrap_or_else(|| hard_cut(text, pos, target));

            pieces.push((pos, cut));
            pos = cut;
        }

        pieces.push((pos, segment.end));
        pieces
    }

    /// 이전 청크 본문 꼬리에서 오버랩 시작 위치 계산
    fn overlap_start(&self, text: &str, prev_start: usize, prev_end: usize) -> usize {
        if self.config.chunk_overlap == 0 || prev_end <= prev_start {
            return prev_end;
        }

        let raw_start = prev_end
            .saturating_sub(self.config.chunk_overlap)
            .max(prev_start);
        let raw_start = ceil_char_boundary(text, raw_start);
        let tail = &text[raw_start..prev_end];

        // 단어 경계에서 시작
        let word_start = match tail.find(char::is_whitespace) {
            Some(p) => {
                let after = &tail[p..];
                let skipped = after.len() - after.trim_start().len();
                raw_start + p + skipped
            }
            None => raw_start,
        };

        if text[word_start..prev_end].trim().is_empty() {
            prev_end
        } else {
            word_start
        }
    }
}

impl Chunker for SemanticChunker {
    fn chunk(&self, text: &str, meta: &DocumentMeta) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return vec![];
        }

        // 1. 줄 분석 + 헤더 구간
        let lines = Self::scan_lines(text);
        let segments = Self::split_segments(text, &lines);

        // 2. 긴 구간 분할
        let mut cores: Vec<(usize, usize, Vec<String>)> = Vec::new();
        for segment in &segments {
            for (start, end) in self.split_long_segment(text, &lines, segment) {
                cores.push((start, end, segment.path.clone()));
            }
        }

        // 3. 오버랩 + 메타데이터
        let page_breaks: Vec<usize> = text
            .match_indices('\x0c')
            .map(|(i, _)| i)
            .collect();

        let mut chunks = Vec::with_capacity(cores.len());
        let mut prev: Option<(usize, usize)> = None;

        for (seq, (core_start, core_end, path)) in cores.into_iter().enumerate() {
            let start = match prev {
                Some((prev_start, prev_end)) => self.overlap_start(text, prev_start, prev_end),
                None => core_start,
            };
            let chunk_text = &text[start..core_end];
            let page = meta.first_page + page_breaks.partition_point(|&b| b <= core_start);

            chunks.push(Chunk {
                id: Chunk::make_id(&meta.doc_id, seq),
                doc_id: meta.doc_id.clone(),
                seq,
                text: chunk_text.to_string(),
                path,
                page,
                start,
                end: core_end,
                overlap: core_start - start,
                content_hash: content_hash(chunk_text),
            });
            prev = Some((core_start, core_end));
        }

        tracing::debug!("Created {} chunks for document {}", chunks.len(), meta.doc_id);
        chunks
    }

    fn name(&self) -> &'static str {
        "SemanticChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// UTF-8 경계 조정 (인덱스 이하로)
#[inline]
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        s.len()
    } else {
        let mut i = index;
        while i > 0 && !s.is_char_boundary(i) {
            i -= 1;
        }
        i
    }
}

/// UTF-8 경계 조정 (인덱스 이상으로)
#[inline]
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        s.len()
    } else {
        let mut i = index;
        while i < s.len() && !s.is_char_boundary(i) {
            i += 1;
        }
        i
    }
}

/// (from, to] 범위의 마지막 공백 바로 뒤 위치
fn whitespace_cut(text: &str, from: usize, to: usize) -> Option<usize> {
    let to = floor_char_boundary(text, to);
    let from = ceil_char_boundary(text, from);
    if to <= from {
        return None;
    }
    text[from..to]
        .char_indices()
        .filter(|(_, c)| c.is_whitespace())
        .last()
        .map(|(i, c)| from + i + c.len_utf8())
        .filter(|&cut| cut > from)
}

/// 목표 위치에서 강제 분할 (최소 한 글자 전진 보장)
fn hard_cut(text: &str, pos: usize, target: usize) -> usize {
    let cut = floor_char_boundary(text, target);
    if cut > pos {
        cut
    } else {
        text[pos..]
            .chars()
            .next()
            .map(|c| pos + c.len_utf8())
            .unwrap_or(text.len())
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 설정 지정 청커 생성
pub fn semantic_chunker(config: ChunkConfig) -> Box<dyn Chunker> {
    Box::new(SemanticChunker::new(config))
}

// ============================================================================
// Tests
// ============================================================================
