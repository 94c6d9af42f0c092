//! Conversation Memory - 대화 턴 영속 저장소
//!
//! - 추가 전용: 기존 턴은 수정하지 않음
//! - 최대 `max_turns`개 유지, 추가가 끝난 뒤 가장 오래된 턴부터 제거
//! - `append`는 디스크 기록(`synchronous = FULL`)이 끝난 뒤 반환
//! - 열 때 초과분이 남아 있으면 정리
//!
//! 저장 위치: ~/.lexgraph-rag/memory.db

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::knowledge::parse_datetime;

// ============================================================================
// Types
// ============================================================================

/// 대화 턴
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// UUID v4
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub response: String,
    /// 응답에 사용된 청크 ID
    pub chunk_ids: Vec<String>,
}

impl ConversationTurn {
    pub fn new(query: impl Into<String>, response: impl Into<String>, chunk_ids: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            query: query.into(),
            response: response.into(),
            chunk_ids,
        }
    }
}

/// 메모리 요약
#[derive(Debug, Clone, Serialize)]
pub struct MemorySummary {
    pub turn_count: usize,
    pub max_turns: usize,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
    pub db_path: Option<PathBuf>,
}

// ============================================================================
// ConversationMemory
// ============================================================================

/// 대화 메모리 (단일 writer: 커넥션 Mutex 안에서 추가와 정리)
#[derive(Clone)]
pub struct ConversationMemory {
    conn: Arc<Mutex<Connection>>,
    max_turns: usize,
    db_path: Option<PathBuf>,
}

impl ConversationMemory {
    /// 메모리 DB 열기 (없으면 생성)
    pub fn open(path: &Path, max_turns: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create memory directory")?;
            }
        }

        let conn = Connection::open(path).context("Failed to open memory database")?;
        let memory = Self {
            conn: Arc::new(Mutex::new(conn)),
            max_turns: max_turns.max(1),
            db_path: Some(path.to_path_buf()),
        };
        memory.initialize()?;
        Ok(memory)
    }

    /// 메모리 DB로 열기 (테스트용)
    pub fn open_in_memory(max_turns: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let memory = Self {
            conn: Arc::new(Mutex::new(conn)),
            max_turns: max_turns.max(1),
            db_path: None,
        };
        memory.initialize()?;
        Ok(memory)
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS turns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                turn_id TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                query TEXT NOT NULL,
                response TEXT NOT NULL,
                chunk_ids TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create memory schema")?;

        // 이전 실행에서 남은 초과분 정리
        let evicted = evict_overflow(&conn, self.max_turns)?;
        if evicted > 0 {
            tracing::info!("Conversation memory: evicted {} stale turns on open", evicted);
        }
        Ok(())
    }

    /// 턴 추가 후 초과분 제거
    pub fn append(&self, turn: &ConversationTurn) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO turns (turn_id, created_at, query, response, chunk_ids)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                turn.id,
                turn.timestamp.to_rfc3339(),
                turn.query,
                turn.response,
                serde_json::to_string(&turn.chunk_ids)?,
            ],
        )
        .context("Failed to persist conversation turn")?;

        let evicted = evict_overflow(&conn, self.max_turns)?;
        if evicted > 0 {
            tracing::debug!("Conversation memory: evicted {} oldest turns", evicted);
        }
        Ok(())
    }

    /// 최근 w개 턴 (오래된 순)
    pub fn recent_window(&self, w: usize) -> Result<Vec<ConversationTurn>> {
        if w == 0 {
            return Ok(vec![]);
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY seq DESC LIMIT ?1", TURN_SELECT))?;
        let mut turns = stmt
            .query_map(params![w as i64], row_to_turn)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read recent turns")?;
        turns.reverse();
        Ok(turns)
    }

    /// 질의/응답 텍스트 부분 일치 검색 (대소문자 무시, 최신순)
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let needle = query.trim();
        if needle.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE LOWER(query) LIKE ?1 ESCAPE '\\' OR LOWER(response) LIKE ?1 ESCAPE '\\'
             ORDER BY seq DESC LIMIT ?2",
            TURN_SELECT
        ))?;
        let turns = stmt
            .query_map(params![pattern, limit as i64], row_to_turn)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to search conversation memory")?;
        Ok(turns)
    }

    /// 전체 턴 (오래된 순)
    pub fn all(&self) -> Result<Vec<ConversationTurn>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY seq ASC", TURN_SELECT))?;
        let turns = stmt
            .query_map([], row_to_turn)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read conversation memory")?;
        Ok(turns)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 전체 삭제
    pub fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM turns", [])
            .context("Failed to clear conversation memory")?;
        tracing::info!("Conversation memory cleared");
        Ok(())
    }

    /// 개수와 첫/마지막 시각
    pub fn summary(&self) -> Result<MemorySummary> {
        let conn = self.lock()?;
        let (count, first, last): (i64, Option<String>, Option<String>) = conn.query_row(
            "SELECT COUNT(*),
                    (SELECT created_at FROM turns ORDER BY seq ASC LIMIT 1),
                    (SELECT created_at FROM turns ORDER BY seq DESC LIMIT 1)
             FROM turns",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(MemorySummary {
            turn_count: count as usize,
            max_turns: self.max_turns,
            first_at: first.map(parse_datetime),
            last_at: last.map(parse_datetime),
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

const TURN_SELECT: &str = "SELECT turn_id, created_at, query, response, chunk_ids FROM turns";

fn row_to_turn(row: &Row<'_>) -> rusqlite::Result<ConversationTurn> {
    let chunk_ids: String = row.get(4)?;
    Ok(ConversationTurn {
        id: row.get(0)?,
        timestamp: parse_datetime(row.get::<_, String>(1)?),
        query: row.get(2)?,
        response: row.get(3)?,
        chunk_ids: serde_json::from_str(&chunk_ids).unwrap_or_default(),
    })
}

/// 최신 max_turns개만 남기고 삭제
fn evict_overflow(conn: &Connection, max_turns: usize) -> Result<usize> {
    let evicted = conn
        .execute(
            "DELETE FROM turns WHERE seq NOT IN
                (SELECT seq FROM turns ORDER BY seq DESC LIMIT ?1)",
            params![max_turns as i64],
        )
        .context("Failed to evict old turns")?;
    Ok(evicted)
}

/// LIKE 패턴 특수문자 이스케이프
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
