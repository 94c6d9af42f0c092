//! LanceDB Vector Store - 영속 벡터 인덱스
//!
//! 코사인 거리 ANN 검색을 사용하며, 유사도는 `1 - distance`를 0~1로 자른 값입니다.
//! ref: https://lancedb.github.io/lancedb/

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::table::Table;
use lancedb::DistanceType;

use super::vector::{SearchResult, VectorEntry, VectorStore};

/// 벡터 테이블 이름
const TABLE_NAME: &str = "chunks";

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소 구현
pub struct LanceVectorStore {
    db: Connection,
    dimension: usize,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    /// * `dimension` - 임베딩 차원 (테이블 스키마 고정값)
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        // 부모 디렉토리 생성
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self { db, dimension })
    }

    /// 벡터 테이블 스키마
    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("seq", DataType::Int32, false),
            Field::new("chunk_text", DataType::Utf8, false),
            Field::new("content_hash", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                false,
            ),
        ])
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn entries_to_batch(&self, entries: &[VectorEntry]) -> Result<RecordBatch> {
        if entries.is_empty() {
            anyhow::bail!("Cannot create batch from empty entries");
        }
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != self.dimension) {
            anyhow::bail!(
                "Embedding dimension mismatch for {}: expected {}, got {}",
                bad.chunk_id,
                self.dimension,
                bad.embedding.len()
            );
        }

        let chunk_ids: Vec<&str> = entries.iter().map(|e| e.chunk_id.as_str()).collect();
        let doc_ids: Vec<&str> = entries.iter().map(|e| e.doc_id.as_str()).collect();
        let seqs: Vec<i32> = entries.iter().map(|e| e.seq as i32).collect();
        let chunk_texts: Vec<&str> = entries.iter().map(|e| e.chunk_text.as_str()).collect();
        let hashes: Vec<&str> = entries.iter().map(|e| e.content_hash.as_str()).collect();

        // 임베딩을 FixedSizeList로 변환
        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        let batch = RecordBatch::try_new(
            Arc::new(self.schema()),
            vec![
                Arc::new(StringArray::from(chunk_ids)),
                Arc::new(StringArray::from(doc_ids)),
                Arc::new(Int32Array::from(seqs)),
                Arc::new(StringArray::from(chunk_texts)),
                Arc::new(StringArray::from(hashes)),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")?;

        Ok(batch)
    }

    /// 테이블 존재 여부 확인
    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.iter().any(|n| n == TABLE_NAME))
            .unwrap_or(false)
    }

    /// 테이블 열기 (없으면 None)
    async fn open_table(&self) -> Result<Option<Table>> {
        if !self.table_exists().await {
            return Ok(None);
        }
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open vector table")?;
        Ok(Some(table))
    }

    async fn delete_where(&self, filter: &str) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        let before = table.count_rows(None).await.context("Failed to count rows")?;
        table
            .delete(filter)
            .await
            .context("Failed to delete vectors")?;
        let after = table.count_rows(None).await.context("Failed to count rows")?;
        Ok(before.saturating_sub(after))
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert_batch(&self, entries: &[VectorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let batch = self.entries_to_batch(entries)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        match self.open_table().await? {
            Some(table) => {
                // 같은 chunk_id 교체
                let ids: Vec<String> = entries.iter().map(|e| e.chunk_id.clone()).collect();
                table
                    .delete(&in_filter("chunk_id", &ids))
                    .await
                    .context("Failed to delete replaced vectors")?;
                table
                    .add(batches)
                    .execute()
                    .await
                    .context("Failed to add vectors to table")?;
            }
            None => {
                self.db
                    .create_table(TABLE_NAME, batches)
                    .execute()
                    .await
                    .context("Failed to create table")?;
            }
        }

        Ok(entries.len())
    }

    async fn query(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<SearchResult>> {
        let Some(table) = self.open_table().await? else {
            return Ok(vec![]);
        };

        let results = table
            .vector_search(query_embedding.to_vec())
            .context("Failed to create vector search")?
            .distance_type(DistanceType::Cosine)
            .limit(top_k)
            .execute()
            .await
            .context("Failed to execute vector search")?;

        let batches: Vec<RecordBatch> = results.try_collect().await?;
        let mut search_results = Vec::new();

        for batch in batches {
            let chunk_ids = string_column(&batch, "chunk_id")?;
            let doc_ids = string_column(&batch, "doc_id")?;
            let chunk_texts = string_column(&batch, "chunk_text")?;
            let seqs = batch
                .column_by_name("seq")
                .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing seq column"))?;

            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                search_results.push(SearchResult {
                    chunk_id: chunk_ids.value(i).to_string(),
                    doc_id: doc_ids.value(i).to_string(),
                    seq: seqs.value(i).max(0) as usize,
                    chunk_text: chunk_texts.value(i).to_string(),
                    similarity: (1.0 - distances.value(i)).clamp(0.0, 1.0),
                });
            }
        }

        search_results.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(search_results)
    }

    async fn content_hashes(&self, doc_id: &str) -> Result<HashMap<String, String>> {
        let Some(table) = self.open_table().await? else {
            return Ok(HashMap::new());
        };

        let batches: Vec<RecordBatch> = table
            .query()
            .only_if(format!("doc_id = '{}'", escape_literal(doc_id)))
            .execute()
            .await
            .context("Failed to query content hashes")?
            .try_collect()
            .await?;

        let mut hashes = HashMap::new();
        for batch in batches {
            let chunk_ids = string_column(&batch, "chunk_id")?;
            let content_hashes = string_column(&batch, "content_hash")?;
            for i in 0..batch.num_rows() {
                hashes.insert(
                    chunk_ids.value(i).to_string(),
                    content_hashes.value(i).to_string(),
                );
            }
        }
        Ok(hashes)
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        self.delete_where(&in_filter("chunk_id", chunk_ids)).await
    }

    async fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize> {
        self.delete_where(&format!("doc_id = '{}'", escape_literal(doc_id)))
            .await
    }

    async fn count(&self) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };
        let count = table.count_rows(None).await.context("Failed to count rows")?;
        Ok(count)
    }

    async fn clear(&self) -> Result<()> {
        if self.table_exists().await {
            self.db
                .drop_table(TABLE_NAME)
                .await
                .context("Failed to drop vector table")?;
        }
        tracing::info!("Vector store cleared");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "lancedb"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

/// SQL 문자열 리터럴 이스케이프 (작은따옴표 이중화)
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// `column IN ('a', 'b')` 필터
fn in_filter(column: &str, values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("'{}'", escape_literal(v)))
        .collect();
    format!("{} IN ({})", column, quoted.join(", "))
}

// ============================================================================
// Tests
// ============================================================================
