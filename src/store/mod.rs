use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub type Document = BTreeMap<String, String>;

pub mod keys {
    pub const ACCESS_TOKEN: &str = "AccessToken";
    pub const REFRESH_TOKEN: &str = "RefreshToken";
    pub const CLIENT_ID: &str = "ClientId";
    pub const CLIENT_SECRET: &str = "ClientSecret";
    pub const CHANNEL_ID: &str = "ChannelId";
    pub const BRIDGE_IP: &str = "bridgeIp";
    pub const APP_KEY: &str = "AppKey";
    pub const APPLICATION_VERSION: &str = "ApplicationVersion";

    pub const DEFAULTS: [&str; 8] = [
        ACCESS_TOKEN,
        REFRESH_TOKEN,
        CLIENT_ID,
        CLIENT_SECRET,
        CHANNEL_ID,
        BRIDGE_IP,
        APP_KEY,
        APPLICATION_VERSION,
    ];

    pub const SECRETS: [&str; 5] = [ACCESS_TOKEN, REFRESH_TOKEN, CLIENT_SECRET, CLIENT_ID, APP_KEY];
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("store encode error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    cache: RwLock<Option<Arc<Document>>>,
    write_guard: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.document().await.get(key).cloned()
    }

    pub async fn get_non_empty(&self, key: &str) -> Option<String> {
        self.get(key)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub async fn snapshot(&self) -> Document {
        self.document().await.as_ref().clone()
    }

    pub async fn update(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_guard.lock().await;
        let current = match self.cached() {
            Some(doc) => doc,
            None => Arc::new(self.load_locked().await),
        };

        let mut next = current.as_ref().clone();
        next.insert(key.to_string(), value.to_string());
        self.persist(&next).await?;
        self.set_cache(Arc::new(next));
        Ok(())
    }

    async fn document(&self) -> Arc<Document> {
        if let Some(doc) = self.cached() {
            return doc;
        }

        let _guard = self.write_guard.lock().await;
        // another caller may have loaded while we waited
        if let Some(doc) = self.cached() {
            return doc;
        }
        let doc = Arc::new(self.load_locked().await);
        self.set_cache(doc.clone());
        doc
    }

    fn cached(&self) -> Option<Arc<Document>> {
        match self.cache.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_cache(&self, doc: Arc<Document>) {
        match self.cache.write() {
            Ok(mut guard) => *guard = Some(doc),
            Err(poisoned) => *poisoned.into_inner() = Some(doc),
        }
    }

    // Must be called with `write_guard` held.
    async fn load_locked(&self) -> Document {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match parse_document(&raw) {
                Ok(doc) => doc,
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "store file unreadable, using empty document");
                    Document::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let doc = default_document();
                if let Err(err) = self.persist(&doc).await {
                    tracing::warn!(path = %self.path.display(), error = %err, "failed to create store file");
                } else {
                    tracing::info!(path = %self.path.display(), "created store file with default keys");
                }
                doc
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "store file unreadable, using empty document");
                Document::new()
            }
        }
    }

    async fn persist(&self, doc: &Document) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(doc)?;
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let tmp = temp_path(&self.path);
        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(&data).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

fn parse_document(raw: &str) -> Result<Document, serde_json::Error> {
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)?;
    Ok(map
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (k, value)
        })
        .collect())
}

fn default_document() -> Document {
    keys::DEFAULTS
        .iter()
        .map(|k| (k.to_string(), String::new()))
        .collect()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn masked(doc: &Document) -> Document {
    doc.iter()
        .map(|(k, v)| {
            let shown = if keys::SECRETS.contains(&k.as_str()) && !v.is_empty() {
                "*".repeat(10)
            } else {
                v.clone()
            };
            (k.clone(), shown)
        })
        .collect()
}
