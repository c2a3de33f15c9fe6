use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

const OBJECT_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    key TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL
);
"#;

const TEMP_MARKER: &str = ".tmp-";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache miss: {key}")]
    Miss { key: String },
    #[error("invalid object key: {key}")]
    InvalidKey { key: String },
    #[error("failed to read object {key}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode object {key}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("object store backend failed for {key}")]
    Sqlite {
        key: String,
        #[source]
        source: rusqlite::Error,
    },
}

impl StoreError {
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss { .. })
    }
}

/// Durable key -> JSON blob storage. Keys are POSIX-style relative paths.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, value: &Value) -> Result<()>;
    fn get(&self, key: &str) -> Result<Value, StoreError>;
    /// Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
    /// Every stored key starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

pub fn load_object<T: DeserializeOwned>(store: &dyn ObjectStore, key: &str) -> Result<T, StoreError> {
    let value = store.get(key)?;
    serde_json::from_value(value).map_err(|source| StoreError::Decode {
        key: key.to_string(),
        source,
    })
}

pub fn save_object<T: Serialize>(store: &dyn ObjectStore, key: &str, object: &T) -> Result<()> {
    let value =
        serde_json::to_value(object).with_context(|| format!("failed to serialize {key}"))?;
    store.put(key, &value)
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains(TEMP_MARKER)
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// One JSON file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        Ok(path)
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("object path has no parent: {}", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let body = serde_json::to_vec_pretty(value)
            .with_context(|| format!("failed to serialize {key}"))?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = parent.join(format!("{file_name}{TEMP_MARKER}{}", Uuid::new_v4()));
        fs::write(&temp_path, body)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        if let Err(error) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(error).with_context(|| format!("failed to replace {}", path.display()));
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Value, StoreError> {
        let path = self.path_for(key)?;
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Miss {
                    key: key.to_string(),
                });
            }
            Err(source) => {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    source,
                });
            }
        };
        serde_json::from_slice(&body).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry
                .with_context(|| format!("failed to walk {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .with_context(|| format!("failed to relativize {}", entry.path().display()))?;
            let key = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.contains(TEMP_MARKER) || !key.starts_with(prefix) {
                continue;
            }
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }
}

/// Single-table SQLite store; each put is one upsert statement.
pub struct SqliteObjectStore {
    connection: Mutex<Connection>,
}

impl SqliteObjectStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database parent directory {}", parent.display())
            })?;
        }
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::with_connection(connection)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(OBJECT_SCHEMA_SQL)
            .context("failed to initialize object store schema")?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ObjectStore for SqliteObjectStore {
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        validate_key(key)?;
        let body = serde_json::to_string(value).with_context(|| format!("failed to serialize {key}"))?;
        self.connection()
            .execute(
                "INSERT INTO objects (key, body, updated_at_unix) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET body = excluded.body,
                     updated_at_unix = excluded.updated_at_unix",
                params![key, body, unix_timestamp()],
            )
            .with_context(|| format!("failed to store {key}"))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Value, StoreError> {
        validate_key(key)?;
        let body: Option<String> = self
            .connection()
            .query_row("SELECT body FROM objects WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|source| StoreError::Sqlite {
                key: key.to_string(),
                source,
            })?;
        let Some(body) = body else {
            return Err(StoreError::Miss {
                key: key.to_string(),
            });
        };
        serde_json::from_str(&body).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.connection()
            .execute("DELETE FROM objects WHERE key = ?1", [key])
            .with_context(|| format!("failed to delete {key}"))?;
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let connection = self.connection();
        let mut statement = connection
            .prepare("SELECT key FROM objects WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .context("failed to prepare key listing")?;
        let rows = statement
            .query_map([prefix], |row| row.get::<_, String>(0))
            .context("failed to list object keys")?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("failed to decode object key")?);
        }
        Ok(keys)
    }
}

/// Process-local store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Value>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        validate_key(key)?;
        self.objects().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.objects()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::Miss {
                key: key.to_string(),
            })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Fs,
    Sqlite,
    Memory,
}

impl StoreBackend {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fs" | "filesystem" => Ok(Self::Fs),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown store backend: {other} (expected fs, sqlite or memory)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fs => "fs",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }
}
