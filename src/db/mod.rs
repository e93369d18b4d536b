//! Content-addressed analysis cache.
//!
//! Analyses are stored as JSON keyed by the SHA-256 of the source file's
//! bytes, so a renamed or copied file is never analysed twice.

use std::io::Read;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::track::TrackAnalysis;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Cached analysis for {hash} is corrupt: {source}")]
    Corrupt {
        hash: String,
        source: serde_json::Error,
    },
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS analyses (
                    hash            TEXT PRIMARY KEY,
                    file_path       TEXT NOT NULL,
                    bpm             REAL,
                    musical_key     TEXT,
                    analysis_json   TEXT NOT NULL,
                    analyzed_at     TEXT NOT NULL DEFAULT (datetime('now'))
                );
                CREATE INDEX IF NOT EXISTS idx_analyses_path ON analyses(file_path);
                ",
            )?;
        }

        self.conn.pragma_update(None, "user_version", 1)?;
        Ok(())
    }

    /// Cached analysis for a content hash, if any.
    pub fn get_analysis(&self, hash: &str) -> Result<Option<TrackAnalysis>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT analysis_json FROM analyses WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|source| DbError::Corrupt {
                    hash: hash.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Insert or replace the analysis under its `hash`.
    pub fn store_analysis(&self, analysis: &TrackAnalysis) -> Result<()> {
        let json = serde_json::to_string(analysis)?;
        self.conn.execute(
            "INSERT INTO analyses (hash, file_path, bpm, musical_key, analysis_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(hash) DO UPDATE SET
                file_path = excluded.file_path,
                bpm = excluded.bpm,
                musical_key = excluded.musical_key,
                analysis_json = excluded.analysis_json,
                analyzed_at = datetime('now')",
            params![
                analysis.hash,
                analysis.path.to_string_lossy(),
                analysis.bpm,
                analysis.key,
                json
            ],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM analyses", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Drop every cached analysis. Returns how many were removed.
    pub fn clear(&self) -> Result<u64> {
        Ok(self.conn.execute("DELETE FROM analyses", [])? as u64)
    }
}

/// SHA-256 of a file's bytes as lowercase hex.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
