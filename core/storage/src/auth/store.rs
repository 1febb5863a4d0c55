//! Credential persistence.
//!
//! Credentials live in a key-value store shared by every process that talks
//! to the same accounts. One logical key per provider holds the serialized
//! [`Credential`].

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info};

use skyferry_common::{Error, Result};

use super::credential::Credential;

/// Key-value persistence for credentials.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Read the credential stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<Credential>>;

    /// Store `credential` under `key`, replacing any previous value.
    async fn save(&self, key: &str, credential: &Credential) -> Result<()>;
}

/// In-memory token store.
///
/// Values are kept serialized, the same as in a real external store.
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self, key: &str) -> Result<Option<Credential>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|json| serde_json::from_str(json).map_err(Error::from))
            .transpose()
    }

    async fn save(&self, key: &str, credential: &Credential) -> Result<()> {
        let json = serde_json::to_string(credential)?;
        self.entries.write().await.insert(key.to_string(), json);
        Ok(())
    }
}

/// SQLite-backed token store.
pub struct SqliteTokenStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTokenStore {
    /// Create or open a token database.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(sqlite_error)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sqlite_error)?;

        info!("Token store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::Storage("Token store lock poisoned".to_string()))?;
            f(&*guard).map_err(sqlite_error)
        })
        .await
        .map_err(|e| Error::Storage(format!("Token store task failed: {}", e)))?
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn load(&self, key: &str) -> Result<Option<Credential>> {
        let key = key.to_string();
        let payload: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT payload FROM credentials WHERE key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        payload
            .map(|json| serde_json::from_str(&json).map_err(Error::from))
            .transpose()
    }

    async fn save(&self, key: &str, credential: &Credential) -> Result<()> {
        debug!("Persisting credential under {}", key);
        let payload = serde_json::to_string(credential)?;
        let key = key.to_string();
        let updated_at = chrono::Utc::now().timestamp();

        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO credentials (key, payload, updated_at)
                VALUES (?1, ?2, ?3)
                "#,
                params![key, payload, updated_at],
            )
        })
        .await?;
        Ok(())
    }
}

fn sqlite_error(err: rusqlite::Error) -> Error {
    Error::Storage(format!("SQLite error: {}", err))
}
