//! Knowledge Store - rusqlite 기반 동기 지식 저장소
//!
//! 청크 본문과 문서 처리 상태(콘텐츠 해시, 처리 시각)를 저장합니다.
//! 수집 단계는 상태 레코드로 변경되지 않은 문서를 건너뜁니다.
//! 저장 위치: ~/.lexgraph-rag/knowledge.db

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};

use super::chunker::Chunk;

// ============================================================================
// Types
// ============================================================================

/// 문서 처리 상태 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub doc_id: String,
    pub title: Option<String>,
    pub source_path: Option<String>,
    pub content_hash: String,
    pub chunk_count: usize,
    pub processed_at: DateTime<Utc>,
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub total_content_bytes: usize,
    pub db_path: Option<PathBuf>,
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// Knowledge Store - 동기 지식 저장소
///
/// 복제해도 같은 커넥션을 공유합니다.
#[derive(Clone)]
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl KnowledgeStore {
    /// 저장소 열기 (없으면 생성)
    ///
    /// # Arguments
    /// * `path` - DB 파일 경로 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        // 부모 디렉토리 생성
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(path.to_path_buf()),
        };

        store.initialize()?;
        Ok(store)
    }

    /// 메모리 DB로 열기 (테스트 및 일회성 실행용)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    /// DB 경로 반환 (메모리 DB면 None)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                doc_id TEXT PRIMARY KEY,
                title TEXT,
                source_path TEXT,
                content_hash TEXT NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                text TEXT NOT NULL,
                path TEXT NOT NULL,
                page INTEGER NOT NULL,
                span_start INTEGER NOT NULL,
                span_end INTEGER NOT NULL,
                overlap INTEGER NOT NULL,
                content_hash TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id, seq);
            "#,
        )
        .context("Failed to create knowledge schema")?;

        tracing::debug!("Knowledge store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Document status
    // ------------------------------------------------------------------------

    /// 문서 상태 조회
    pub fn document_status(&self, doc_id: &str) -> Result<Option<DocumentStatus>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc_id, title, source_path, content_hash, chunk_count, processed_at
             FROM documents WHERE doc_id = ?1",
        )?;

        let mut rows = stmt.query_map(params![doc_id], row_to_status)?;
        rows.next().transpose().context("Failed to read document status")
    }

    /// 재처리가 필요한지 (새 문서이거나 해시가 바뀐 경우)
    pub fn needs_processing(&self, doc_id: &str, content_hash: &str) -> Result<bool> {
        Ok(self
            .document_status(doc_id)?
            .map(|status| status.content_hash != content_hash)
            .unwrap_or(true))
    }

    /// 처리 완료 기록
    pub fn mark_processed(&self, status: &DocumentStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO documents
                (doc_id, title, source_path, content_hash, chunk_count, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                status.doc_id,
                status.title,
                status.source_path,
                status.content_hash,
                status.chunk_count as i64,
                status.processed_at.to_rfc3339(),
            ],
        )
        .context("Failed to record document status")?;
        Ok(())
    }

    /// 처리된 문서 목록
    pub fn list_documents(&self) -> Result<Vec<DocumentStatus>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc_id, title, source_path, content_hash, chunk_count, processed_at
             FROM documents ORDER BY doc_id",
        )?;
        let docs = stmt
            .query_map([], row_to_status)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list documents")?;
        Ok(docs)
    }

    /// 문서와 청크 삭제
    pub fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])?;
        let rows = tx.execute("DELETE FROM documents WHERE doc_id = ?1", params![doc_id])?;
        tx.commit()?;
        Ok(rows > 0)
    }

    // ------------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------------

    /// 문서의 청크 전체 교체 (이전 버전 청크는 폐기)
    pub fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])
            .context("Failed to delete superseded chunks")?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks
                    (chunk_id, doc_id, seq, text, path, page, span_start, span_end, overlap, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;

            for chunk in chunks {
                let path = serde_json::to_string(&chunk.path)?;
                stmt.execute(params![
                    chunk.id,
                    chunk.doc_id,
                    chunk.seq as i64,
                    chunk.text,
                    path,
                    chunk.page as i64,
                    chunk.start as i64,
                    chunk.end as i64,
                    chunk.overlap as i64,
                    chunk.content_hash,
                ])
                .with_context(|| format!("Failed to insert chunk {}", chunk.id))?;
            }
        }

        tx.commit().context("Failed to commit chunks")?;
        tracing::debug!("Stored {} chunks for {}", chunks.len(), doc_id);
        Ok(chunks.len())
    }

    /// ID로 청크 조회
    pub fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} WHERE chunk_id = ?1", CHUNK_SELECT))?;
        let mut rows = stmt.query_map(params![chunk_id], row_to_chunk)?;
        rows.next().transpose().context("Failed to read chunk")
    }

    /// 여러 청크를 요청 순서대로 조회 (없는 ID는 건너뜀)
    pub fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        if chunk_ids.is_empty() {
            return Ok(vec![]);
        }

        let conn = self.lock()?;
        let placeholders = vec!["?"; chunk_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "{} WHERE chunk_id IN ({})",
            CHUNK_SELECT, placeholders
        ))?;

        let mut by_id: HashMap<String, Chunk> = stmt
            .query_map(rusqlite::params_from_iter(chunk_ids.iter()), row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read chunks")?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        Ok(chunk_ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// 문서의 청크 (seq 순서)
    pub fn chunks_for_document(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} WHERE doc_id = ?1 ORDER BY seq", CHUNK_SELECT))?;
        let chunks = stmt
            .query_map(params![doc_id], row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read document chunks")?;
        Ok(chunks)
    }

    /// 전체 청크 (문서, seq 순서) - 그래프 재구성용
    pub fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY doc_id, seq", CHUNK_SELECT))?;
        let chunks = stmt
            .query_map([], row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read chunks")?;
        Ok(chunks)
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;

        let document_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .unwrap_or(0);

        let (chunk_count, total_size): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(CAST(text AS BLOB)) - overlap), 0) FROM chunks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap_or((0, 0));

        Ok(StoreStats {
            document_count: document_count as usize,
            chunk_count: chunk_count as usize,
            total_content_bytes: total_size as usize,
            db_path: self.db_path.clone(),
        })
    }

    /// 전체 삭제
    pub fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM chunks; DELETE FROM documents;")
            .context("Failed to clear knowledge store")?;
        tracing::info!("Knowledge store cleared");
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

const CHUNK_SELECT: &str = "SELECT chunk_id, doc_id, seq, text, path, page, span_start, span_end, overlap, content_hash FROM chunks";

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let path: String = row.get(4)?;
    Ok(Chunk {
        id: row.get(0)?,
        doc_id: row.get(1)?,
        seq: row.get::<_, i64>(2)? as usize,
        text: row.get(3)?,
        path: serde_json::from_str(&path).unwrap_or_default(),
        page: row.get::<_, i64>(5)? as usize,
        start: row.get::<_, i64>(6)? as usize,
        end: row.get::<_, i64>(7)? as usize,
        overlap: row.get::<_, i64>(8)? as usize,
        content_hash: row.get(9)?,
    })
}

fn row_to_status(row: &Row<'_>) -> rusqlite::Result<DocumentStatus> {
    Ok(DocumentStatus {
        doc_id: row.get(0)?,
        title: row.get(1)?,
        source_path: row.get(2)?,
        content_hash: row.get(3)?,
        chunk_count: row.get::<_, i64>(4)? as usize,
        processed_at: parse_datetime(row.get::<_, String>(5)?),
    })
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::chunker::{Chunker, DocumentMeta, SemanticChunker};
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, KnowledgeStore) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let store = KnowledgeStore::open(&db_path).unwrap();
        (dir, store)
    }

    fn sample_chunks(doc_id: &str) -> Vec<Chunk> {
        let text = "CHAPTER I\n1. Short title\nThis Act applies.\n2. Definitions\nSee Section 1.\n";
        SemanticChunker::with_defaults().chunk(text, &DocumentMeta::new(doc_id))
    }

    fn status(doc_id: &str, hash: &str) -> DocumentStatus {
        DocumentStatus {
            doc_id: doc_id.to_string(),
            title: Some("Act".to_string()),
            source_path: None,
            content_hash: hash.to_string(),
            chunk_count: 2,
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn test_replace_and_get_chunks() {
        let (_dir, store) = create_test_store();
        let chunks = sample_chunks("act");
        assert_eq!(chunks.len(), 2);

        store.replace_chunks("act", &chunks).unwrap();

        let loaded = store.chunks_for_document("act").unwrap();
        assert_eq!(loaded, chunks);

        let one = store.get_chunk("act#1").unwrap().unwrap();
        assert_eq!(one.path, vec!["Chapter 1", "Section 2"]);
        assert!(store.get_chunk("missing#0").unwrap().is_none());
    }

    #[test]
    fn test_get_chunks_preserves_request_order() {
        let (_dir, store) = create_test_store();
        store.replace_chunks("act", &sample_chunks("act")).unwrap();

        let ids = vec!["act#1".to_string(), "nope".to_string(), "act#0".to_string()];
        let chunks = store.get_chunks(&ids).unwrap();
        let got: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(got, vec!["act#1", "act#0"]);
    }

    #[test]
    fn test_replace_supersedes_old_version() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        store.replace_chunks("act", &sample_chunks("act")).unwrap();

        let newer = SemanticChunker::with_defaults().chunk("Only one chunk now.", &DocumentMeta::new("act"));
        store.replace_chunks("act", &newer).unwrap();

        assert_eq!(store.chunks_for_document("act").unwrap().len(), 1);
    }

    #[test]
    fn test_document_status_tracking() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        assert!(store.needs_processing("act", "h1").unwrap());

        store.mark_processed(&status("act", "h1")).unwrap();
        assert!(!store.needs_processing("act", "h1").unwrap());
        assert!(store.needs_processing("act", "h2").unwrap());

        let loaded = store.document_status("act").unwrap().unwrap();
        assert_eq!(loaded.content_hash, "h1");
        assert_eq!(loaded.chunk_count, 2);
    }

    #[test]
    fn test_delete_document() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        store.replace_chunks("act", &sample_chunks("act")).unwrap();
        store.mark_processed(&status("act", "h1")).unwrap();

        assert!(store.delete_document("act").unwrap());
        assert!(store.chunks_for_document("act").unwrap().is_empty());
        assert!(!store.delete_document("act").unwrap());
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = create_test_store();
        store.replace_chunks("act", &sample_chunks("act")).unwrap();
        store.mark_processed(&status("act", "h1")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.chunk_count, 2);
        assert!(stats.total_content_bytes > 0);
        assert!(stats.db_path.is_some());
    }

    #[test]
    fn test_all_chunks_and_clear() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        store.replace_chunks("b", &sample_chunks("b")).unwrap();
        store.replace_chunks("a", &sample_chunks("a")).unwrap();

        let all = store.all_chunks().unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].id, "a#0");

        store.clear().unwrap();
        assert!(store.all_chunks().unwrap().is_empty());
    }
}
