// src/util/database.rs
// Local key-value persistence for the configured device endpoint

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Result, SyncError};

pub const ENDPOINT_KEY: &str = "device_endpoint";

/// Where the last validated endpoint is remembered between sessions.
pub trait EndpointStore: Send + Sync {
    fn load_endpoint(&self) -> Result<Option<String>>;
    fn save_endpoint(&self, endpoint: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

// Manual Debug implementation since Mutex<Connection> doesn't implement Debug
impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("conn", &"Arc<Mutex<Connection>>")
            .finish()
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Config("database connection poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, ?3)",
            params![key, value, timestamp],
        )?;
        Ok(())
    }
}

impl EndpointStore for Database {
    fn load_endpoint(&self) -> Result<Option<String>> {
        self.get_value(ENDPOINT_KEY)
    }

    fn save_endpoint(&self, endpoint: &str) -> Result<()> {
        self.set_value(ENDPOINT_KEY, endpoint)
    }
}

/// Non-persistent store, for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryEndpointStore {
    value: Mutex<Option<String>>,
}

impl MemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(endpoint: &str) -> Self {
        Self {
            value: Mutex::new(Some(endpoint.to_string())),
        }
    }
}

impl EndpointStore for MemoryEndpointStore {
    fn load_endpoint(&self) -> Result<Option<String>> {
        Ok(self.value.lock().ok().and_then(|v| v.clone()))
    }

    fn save_endpoint(&self, endpoint: &str) -> Result<()> {
        if let Ok(mut value) = self.value.lock() {
            *value = Some(endpoint.to_string());
        }
        Ok(())
    }
}
