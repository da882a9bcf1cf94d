use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::error::{ControllerError, ControllerResult};

pub const PENDING_KEY: &str = "pending";
pub const PROCESSED_KEY: &str = "processed";
pub const BUDGET_KEY: &str = "budget";
pub const PROXY_BLACKLIST_KEY: &str = "proxy-blacklist";
pub const SESSION_KEY: &str = "session";

/// Opaque record collections addressed by key.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn load(&self, key: &str) -> ControllerResult<Vec<Value>>;

    async fn save(&self, key: &str, records: &[Value]) -> ControllerResult<()>;

    async fn append(&self, key: &str, record: Value) -> ControllerResult<()>;
}

pub async fn load_typed<T: DeserializeOwned>(
    store: &dyn PersistenceStore,
    key: &str,
) -> ControllerResult<Vec<T>> {
    store
        .load(key)
        .await?
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(ControllerError::from))
        .collect()
}

pub async fn save_typed<T: Serialize>(
    store: &dyn PersistenceStore,
    key: &str,
    records: &[T],
) -> ControllerResult<()> {
    let values = records
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    store.save(key, &values).await
}

fn check_key(key: &str) -> ControllerResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ControllerError::Persistence(format!("invalid store key {key:?}")))
    }
}

/// One pretty-printed JSON array per key under a state directory.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    async fn read(&self, key: &str) -> ControllerResult<Vec<Value>> {
        check_key(key)?;
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|err| {
                ControllerError::Persistence(format!("corrupt record file {}: {err}", path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, key: &str, records: &[Value]) -> ControllerResult<()> {
        check_key(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let staging = self.dir.join(format!(".{key}.json.tmp"));
        let body = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn load(&self, key: &str) -> ControllerResult<Vec<Value>> {
        self.read(key).await
    }

    async fn save(&self, key: &str, records: &[Value]) -> ControllerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write(key, records).await
    }

    async fn append(&self, key: &str, record: Value) -> ControllerResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read(key).await?;
        records.push(record);
        self.write(key, &records).await
    }
}

/// In-process store; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load(&self, key: &str) -> ControllerResult<Vec<Value>> {
        check_key(key)?;
        Ok(self
            .collections
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, key: &str, records: &[Value]) -> ControllerResult<()> {
        check_key(key)?;
        self.collections
            .lock()
            .await
            .insert(key.to_string(), records.to_vec());
        Ok(())
    }

    async fn append(&self, key: &str, record: Value) -> ControllerResult<()> {
        check_key(key)?;
        self.collections
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .push(record);
        Ok(())
    }
}
