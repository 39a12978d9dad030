use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::{ContentKind, Segment};
use crate::semantic::{
    SemanticModelConfig, cosine_similarity, decode_embedding_blob, embed_text_local,
    embedding_text_hash, encode_embedding_blob, segment_payload_for_embedding,
};
use crate::util::{ensure_directory, now_utc_string};

pub const DB_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DocStatus {
    Complete,
    Partial,
    Failed,
}

impl DocStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "complete" => Some(Self::Complete),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// What the store remembers about a document between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocState {
    pub filename: String,
    pub sha256: String,
    pub status: DocStatus,
    pub page_count: u32,
    pub pages_completed: u32,
}

#[derive(Debug, Clone)]
pub struct DocRecord<'a> {
    pub filename: &'a str,
    pub sha256: &'a str,
    pub status: DocStatus,
    pub page_count: u32,
    pub pages_completed: u32,
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub docs: i64,
    pub complete_docs: i64,
    pub partial_docs: i64,
    pub failed_docs: i64,
    pub segments: i64,
    pub text_segments: i64,
    pub image_segments: i64,
    pub embeddings: i64,
}

#[derive(Debug, Clone)]
pub struct ScoredSegment {
    pub segment: Segment,
    pub score: f64,
}

pub fn open_store(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_directory(parent)?;
    }

    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

/// Opens an existing store without creating it.
pub fn open_existing_store(db_path: &Path) -> Result<Connection> {
    if !db_path.is_file() {
        bail!(
            "segment database not found: {} (run `regdocs ingest` first)",
            db_path.display()
        );
    }
    open_store(db_path)
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS docs (
          filename TEXT PRIMARY KEY,
          sha256 TEXT NOT NULL,
          status TEXT NOT NULL,
          page_count INTEGER NOT NULL DEFAULT 0,
          pages_completed INTEGER NOT NULL DEFAULT 0,
          error TEXT,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS segments (
          segment_id TEXT PRIMARY KEY,
          filename TEXT NOT NULL,
          page_number INTEGER NOT NULL,
          ordinal_index INTEGER NOT NULL,
          content_kind TEXT NOT NULL,
          title TEXT,
          text TEXT NOT NULL,
          FOREIGN KEY(filename) REFERENCES docs(filename) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS embedding_models (
          model_id TEXT PRIMARY KEY,
          backend TEXT NOT NULL,
          dimensions INTEGER NOT NULL,
          created_at TEXT NOT NULL,
          config_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS segment_embeddings (
          segment_id TEXT NOT NULL,
          model_id TEXT NOT NULL,
          embedding BLOB NOT NULL,
          embedding_dim INTEGER NOT NULL,
          text_hash TEXT NOT NULL,
          generated_at TEXT NOT NULL,
          PRIMARY KEY (segment_id, model_id),
          FOREIGN KEY (segment_id) REFERENCES segments(segment_id) ON DELETE CASCADE,
          FOREIGN KEY (model_id) REFERENCES embedding_models(model_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_segments_doc_page ON segments(filename, page_number, ordinal_index);
        CREATE INDEX IF NOT EXISTS idx_segment_embeddings_model ON segment_embeddings(model_id);
        ",
        )
        .context("failed to create segment store schema")?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;

    Ok(())
}

pub fn ensure_model_entry(connection: &Connection, model: &SemanticModelConfig) -> Result<()> {
    let config_json =
        serde_json::to_string(model).context("failed to serialize embedding model config")?;

    connection.execute(
        "
        INSERT INTO embedding_models(model_id, backend, dimensions, created_at, config_json)
        VALUES(?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(model_id) DO UPDATE SET
          backend=excluded.backend,
          dimensions=excluded.dimensions,
          config_json=excluded.config_json
        ",
        params![
            model.model_id,
            model.backend,
            model.dimensions as i64,
            now_utc_string(),
            config_json,
        ],
    )?;

    Ok(())
}

pub fn clear_store(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        DELETE FROM segment_embeddings;
        DELETE FROM segments;
        DELETE FROM docs;
        ",
        )
        .context("failed to clear segment store")?;
    Ok(())
}

pub fn load_doc_states(connection: &Connection) -> Result<HashMap<String, DocState>> {
    let mut statement = connection.prepare(
        "
        SELECT filename, sha256, status, page_count, pages_completed
        FROM docs
        ORDER BY filename ASC
        ",
    )?;

    let mut rows = statement.query([])?;
    let mut out = HashMap::<String, DocState>::new();

    while let Some(row) = rows.next()? {
        let filename: String = row.get(0)?;
        let raw_status: String = row.get(2)?;
        let Some(status) = DocStatus::parse(&raw_status) else {
            bail!("unknown document status '{raw_status}' for {filename}");
        };

        out.insert(
            filename.clone(),
            DocState {
                filename,
                sha256: row.get(1)?,
                status,
                page_count: row.get::<_, i64>(3)?.max(0) as u32,
                pages_completed: row.get::<_, i64>(4)?.max(0) as u32,
            },
        );
    }

    Ok(out)
}

/// Replaces a document's segments from `start_page` onward and records its
/// status, all in one transaction. Returns the number of embeddings written.
pub fn write_document(
    connection: &mut Connection,
    record: &DocRecord<'_>,
    segments: &[Segment],
    start_page: u32,
    model: &SemanticModelConfig,
) -> Result<usize> {
    let tx = connection.transaction()?;
    let now = now_utc_string();

    tx.execute(
        "
        INSERT INTO docs(filename, sha256, status, page_count, pages_completed, error, updated_at)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(filename) DO UPDATE SET
          sha256=excluded.sha256,
          status=excluded.status,
          page_count=excluded.page_count,
          pages_completed=excluded.pages_completed,
          error=excluded.error,
          updated_at=excluded.updated_at
        ",
        params![
            record.filename,
            record.sha256,
            record.status.as_str(),
            i64::from(record.page_count),
            i64::from(record.pages_completed),
            record.error,
            now,
        ],
    )
    .with_context(|| format!("failed to record document {}", record.filename))?;

    tx.execute(
        "DELETE FROM segments WHERE filename = ?1 AND page_number >= ?2",
        params![record.filename, i64::from(start_page)],
    )?;

    let mut embedded = 0usize;
    {
        let mut insert_segment = tx.prepare(
            "
            INSERT INTO segments(segment_id, filename, page_number, ordinal_index, content_kind, title, text)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )?;
        let mut insert_embedding = tx.prepare(
            "
            INSERT INTO segment_embeddings(segment_id, model_id, embedding, embedding_dim, text_hash, generated_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )?;

        for segment in segments {
            let segment_id = segment.segment_id();
            insert_segment
                .execute(params![
                    segment_id,
                    segment.source_document,
                    i64::from(segment.page_number),
                    i64::from(segment.ordinal_index),
                    segment.content_kind.as_str(),
                    segment.title,
                    segment.text,
                ])
                .with_context(|| format!("failed to insert segment {segment_id}"))?;

            let Some(payload) =
                segment_payload_for_embedding(segment.title.as_deref(), &segment.text)
            else {
                continue;
            };
            let vector = embed_text_local(&payload, model.dimensions);
            insert_embedding.execute(params![
                segment_id,
                model.model_id,
                encode_embedding_blob(&vector),
                vector.len() as i64,
                embedding_text_hash(&payload),
                now,
            ])?;
            embedded += 1;
        }
    }

    tx.commit()
        .with_context(|| format!("failed to commit document {}", record.filename))?;
    Ok(embedded)
}

pub fn store_counts(connection: &Connection) -> Result<StoreCounts> {
    let count = |sql: &str| -> Result<i64> {
        connection
            .query_row(sql, [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to run count query: {sql}"))
    };

    Ok(StoreCounts {
        docs: count("SELECT COUNT(*) FROM docs")?,
        complete_docs: count("SELECT COUNT(*) FROM docs WHERE status = 'complete'")?,
        partial_docs: count("SELECT COUNT(*) FROM docs WHERE status = 'partial'")?,
        failed_docs: count("SELECT COUNT(*) FROM docs WHERE status = 'failed'")?,
        segments: count("SELECT COUNT(*) FROM segments")?,
        text_segments: count("SELECT COUNT(*) FROM segments WHERE content_kind = 'text'")?,
        image_segments: count("SELECT COUNT(*) FROM segments WHERE content_kind = 'image'")?,
        embeddings: count("SELECT COUNT(*) FROM segment_embeddings")?,
    })
}

pub fn read_metadata(connection: &Connection, key: &str) -> Result<Option<String>> {
    connection
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("failed to read metadata key {key}"))
}

/// Brute-force cosine ranking over every stored embedding of `model`.
pub fn top_k_segments(
    connection: &Connection,
    model: &SemanticModelConfig,
    query_vector: &[f32],
    limit: usize,
    document: Option<&str>,
) -> Result<Vec<ScoredSegment>> {
    let mut statement = connection.prepare(
        "
        SELECT s.filename, s.page_number, s.ordinal_index, s.content_kind, s.title, s.text,
               e.embedding, e.embedding_dim
        FROM segment_embeddings e
        JOIN segments s ON s.segment_id = e.segment_id
        WHERE e.model_id = ?1
          AND (?2 IS NULL OR s.filename = ?2)
        ",
    )?;

    let mut rows = statement.query(params![model.model_id, document])?;
    let mut scored = Vec::<ScoredSegment>::new();

    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(6)?;
        let dimensions = row.get::<_, i64>(7)?.max(0) as usize;
        let Some(vector) = decode_embedding_blob(&blob, dimensions) else {
            continue;
        };

        scored.push(ScoredSegment {
            segment: segment_from_row(row)?,
            score: cosine_similarity(query_vector, &vector),
        });
    }

    scored.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.segment.segment_id().cmp(&right.segment.segment_id()))
    });
    scored.truncate(limit);

    Ok(scored)
}

fn segment_from_row(row: &rusqlite::Row<'_>) -> Result<Segment> {
    let raw_kind: String = row.get(3)?;
    let Some(content_kind) = ContentKind::parse(&raw_kind) else {
        bail!("unknown segment content kind '{raw_kind}'");
    };

    Ok(Segment {
        source_document: row.get(0)?,
        page_number: row.get::<_, i64>(1)?.max(0) as u32,
        ordinal_index: row.get::<_, i64>(2)?.max(0) as u32,
        text: row.get(5)?,
        title: row.get(4)?,
        content_kind,
    })
}
