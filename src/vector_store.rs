use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::embeddings::cosine_similarity;
use crate::error::{Error, Result};

/// A stored unit of retrievable text. Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub source_id: String,
    /// Position of this chunk within the `append` batch that stored it.
    pub chunk_index: usize,
    pub text: String,
    pub vector: Vec<f32>,
}

impl Chunk {
    /// Provenance header used in citation blocks.
    pub fn provenance(&self) -> String {
        format!("{} (chunk {})", self.source_id, self.chunk_index)
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Arc<Chunk>,
    pub score: f32,
}

#[derive(Default)]
struct Snapshot {
    dimensions: Option<usize>,
    chunks: Arc<Vec<Arc<Chunk>>>,
}

/// Append-only store of `(source_id, text, vector)` triples.
///
/// Writes go through a single connection lock and are durable before the
/// in-memory snapshot is swapped; searches read whichever snapshot is current
/// and never wait on the database.
pub struct VectorStore {
    db: Mutex<Connection>,
    snapshot: RwLock<Snapshot>,
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

impl VectorStore {
    /// Open (or create) a persistent store at `db_path` and load its chunks.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY,
                source_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                vector BLOB NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let dimensions: Option<usize> = db
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'dimensions'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok());

        let chunks = {
            let mut stmt = db.prepare(
                "SELECT source_id, chunk_index, text, vector FROM chunks ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                let blob: Vec<u8> = row.get(3)?;
                Ok(Chunk {
                    source_id: row.get(0)?,
                    chunk_index: row.get::<_, i64>(1)? as usize,
                    text: row.get(2)?,
                    vector: decode_vector(&blob),
                })
            })?;
            rows.map(|r| r.map(Arc::new))
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        if let Some(expected) = dimensions {
            if let Some(bad) = chunks.iter().find(|c| c.vector.len() != expected) {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: bad.vector.len(),
                });
            }
        }

        tracing::info!("[VectorStore] Loaded {} chunks", chunks.len());

        Ok(Self {
            db: Mutex::new(db),
            snapshot: RwLock::new(Snapshot {
                dimensions,
                chunks: Arc::new(chunks),
            }),
        })
    }

    /// Append chunks for `source_id`. Never deduplicates, never touches
    /// existing rows. Returns the number of chunks stored.
    pub async fn append(
        &self,
        source_id: &str,
        chunks: &[String],
        vectors: &[Vec<f32>],
    ) -> Result<usize> {
        if chunks.len() != vectors.len() {
            return Err(Error::LengthMismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        let mut db = self.db.lock().await;

        let expected = self.dimensions().unwrap_or(vectors[0].len());
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(Error::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        let tx = db.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO store_meta (key, value) VALUES ('dimensions', ?1)",
            params![expected.to_string()],
        )?;
        for (i, (text, vector)) in chunks.iter().zip(vectors).enumerate() {
            tx.execute(
                "INSERT INTO chunks (source_id, chunk_index, text, vector) VALUES (?1, ?2, ?3, ?4)",
                params![source_id, i as i64, text, encode_vector(vector)],
            )?;
        }
        tx.commit()?;

        let added: Vec<Arc<Chunk>> = chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| {
                Arc::new(Chunk {
                    source_id: source_id.to_string(),
                    chunk_index: i,
                    text: text.clone(),
                    vector: vector.clone(),
                })
            })
            .collect();

        {
            let mut snapshot = self.write_snapshot();
            let mut next = Vec::with_capacity(snapshot.chunks.len() + added.len());
            next.extend(snapshot.chunks.iter().cloned());
            next.extend(added);
            snapshot.chunks = Arc::new(next);
            snapshot.dimensions = Some(expected);
        }

        drop(db);

        tracing::info!("[VectorStore] Added {} chunks from {}", chunks.len(), source_id);
        Ok(chunks.len())
    }

    /// Top-`k` chunks by cosine similarity, best first. Ties keep insertion
    /// order. An empty store yields an empty list for any query.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let (dimensions, chunks) = {
            let snapshot = self.read_snapshot();
            (snapshot.dimensions, snapshot.chunks.clone())
        };

        if chunks.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        if let Some(expected) = dimensions {
            if query.len() != expected {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }

        let mut hits: Vec<SearchHit> = chunks
            .iter()
            .map(|chunk| SearchHit {
                score: cosine_similarity(query, &chunk.vector),
                chunk: chunk.clone(),
            })
            .collect();

        // Stable: equal scores stay in insertion order.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    pub fn len(&self) -> usize {
        self.read_snapshot().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding dimensionality, fixed by the first append.
    pub fn dimensions(&self) -> Option<usize> {
        self.read_snapshot().dimensions
    }

    fn read_snapshot(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_snapshot(&self) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
