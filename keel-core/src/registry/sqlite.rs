use super::{MetadataBackend, Versioned};
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const VERSION_SEQ_KEY: &str = "version_seq";

/// SQLite backend. Several nodes on one host may point at the same file;
/// CAS runs inside an immediate transaction so writers are serialised by
/// SQLite's own lock.
pub struct SqliteBackend {
    db_path: Arc<PathBuf>,
}

impl SqliteBackend {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let this = Self {
            db_path: Arc::new(db_path),
        };
        this.init_schema()?;
        Ok(this)
    }

    fn open_connection(db_path: &Path) -> std::result::Result<Connection, rusqlite::Error> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(2000))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = Self::open_connection(&self.db_path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
              k TEXT PRIMARY KEY,
              v BLOB NOT NULL,
              version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
              k TEXT PRIMARY KEY,
              v INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> std::result::Result<T, rusqlite::Error> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::open_connection(&db_path)?;
            f(&mut conn)
        })
        .await
        .map_err(|error| KeelError::Internal(format!("sqlite task join failed: {}", error)))?
        .map_err(KeelError::from)
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, Versioned)> {
    Ok((
        row.get::<_, String>(0)?,
        Versioned {
            value: row.get::<_, Vec<u8>>(1)?,
            version: row.get::<_, i64>(2)? as u64,
        },
    ))
}

fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[async_trait]
impl MetadataBackend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT v, version FROM kv WHERE k=?1",
                params![key],
                |row| {
                    Ok(Versioned {
                        value: row.get::<_, Vec<u8>>(0)?,
                        version: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let lower = prefix.to_string();
        let upper = prefix_upper_bound(prefix);
        self.with_connection(move |conn| {
            match upper {
                Some(upper) => {
                    let mut stmt = conn.prepare(
                        "SELECT k, v, version FROM kv WHERE k >= ?1 AND k < ?2 ORDER BY k ASC",
                    )?;
                    let rows = stmt
                        .query_map(params![lower, upper], entry_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(rows)
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT k, v, version FROM kv WHERE k >= ?1 ORDER BY k ASC")?;
                    let rows = stmt
                        .query_map(params![lower], entry_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(rows)
                }
            }
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        new_value: Option<Vec<u8>>,
    ) -> Result<bool> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<i64> = tx
                .query_row("SELECT version FROM kv WHERE k=?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            if current.map(|version| version as u64) != expected_version {
                return Ok(false);
            }

            match new_value {
                Some(value) => {
                    tx.execute(
                        "INSERT INTO meta(k, v) VALUES (?1, 1)
                         ON CONFLICT(k) DO UPDATE SET v = v + 1",
                        params![VERSION_SEQ_KEY],
                    )?;
                    let version: i64 = tx.query_row(
                        "SELECT v FROM meta WHERE k=?1",
                        params![VERSION_SEQ_KEY],
                        |row| row.get(0),
                    )?;
                    tx.execute(
                        "INSERT INTO kv(k, v, version) VALUES (?1, ?2, ?3)
                         ON CONFLICT(k) DO UPDATE SET v=excluded.v, version=excluded.version",
                        params![key, value, version],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM kv WHERE k=?1", params![key])?;
                }
            }

            tx.commit()?;
            Ok(true)
        })
        .await
    }
}
