//! Script store: where sessions and the REST front end look scripts up.
//!
//! Scripts are keyed by UUID with no versioning. A stored script may carry
//! the hash of the IPFS directory its `Ipfs` capability reads from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use uuid::Uuid;
use vigil_sandbox::ScriptSource;

/// File extension of script sources in a seed directory.
pub const SCRIPT_EXTENSION: &str = "js";

/// File extension of the sibling file naming a script's IPFS directory.
pub const IPFS_EXTENSION: &str = "ipfs";

/// A script as the store holds it.
#[derive(Debug, Clone)]
pub struct StoredScript {
    /// Store key.
    pub id: Uuid,
    /// Script text.
    pub source: ScriptSource,
    /// IPFS directory hash associated with the script.
    pub ipfs_directory: Option<String>,
}

/// Errors from seeding a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A directory or file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
}

/// Lookup and persistence of scripts.
#[async_trait::async_trait]
pub trait ScriptStore: Send + Sync {
    /// The script stored under `id`, if any.
    async fn load(&self, id: &Uuid) -> Option<StoredScript>;

    /// Store a new script under a fresh id.
    async fn store(&self, source: ScriptSource, ipfs_directory: Option<String>) -> StoredScript;
}

/// Process-local [`ScriptStore`].
#[derive(Default)]
pub struct InMemoryScriptStore {
    scripts: RwLock<HashMap<Uuid, StoredScript>>,
}

impl InMemoryScriptStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a script under its own id.
    pub fn insert(&self, script: StoredScript) {
        self.scripts.write().insert(script.id, script);
    }

    /// Number of stored scripts.
    pub fn len(&self) -> usize {
        self.scripts.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.scripts.read().is_empty()
    }

    /// Seed the store from `dir`.
    ///
    /// Every `<uuid>.js` file becomes a script with that id. A sibling
    /// `<uuid>.ipfs` file, when present and non-blank, names its IPFS
    /// directory. Files whose stem is not a UUID are skipped. Returns the
    /// number of scripts loaded.
    pub fn load_directory(&self, dir: &Path) -> Result<usize, StoreError> {
        let io_err = |path: &Path, source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut loaded = 0;
        for entry in std::fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
            let path = entry.map_err(|e| io_err(dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                tracing::warn!(path = %path.display(), "skipping script file without a UUID name");
                continue;
            };

            let source = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            let ipfs_path = path.with_extension(IPFS_EXTENSION);
            let ipfs_directory = match std::fs::read_to_string(&ipfs_path) {
                Ok(text) => Some(text.trim().to_string()).filter(|s| !s.is_empty()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(io_err(&ipfs_path, e)),
            };

            tracing::debug!(
                script_id = %id,
                source_len = source.len(),
                has_ipfs = ipfs_directory.is_some(),
                "script loaded"
            );
            self.insert(StoredScript {
                id,
                source: ScriptSource::from(source),
                ipfs_directory,
            });
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[async_trait::async_trait]
impl ScriptStore for InMemoryScriptStore {
    async fn load(&self, id: &Uuid) -> Option<StoredScript> {
        self.scripts.read().get(id).cloned()
    }

    async fn store(&self, source: ScriptSource, ipfs_directory: Option<String>) -> StoredScript {
        let script = StoredScript {
            id: Uuid::new_v4(),
            source,
            ipfs_directory,
        };
        self.insert(script.clone());
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stored_scripts_can_be_loaded_by_id() {
        let store = InMemoryScriptStore::new();
        let stored = store
            .store(ScriptSource::from("function audit() {}"), Some("QmDir".into()))
            .await;
        let loaded = store.load(&stored.id).await.unwrap();
        assert_eq!(loaded.source.as_str(), "function audit() {}");
        assert_eq!(loaded.ipfs_directory.as_deref(), Some("QmDir"));
        assert!(store.load(&Uuid::new_v4()).await.is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn load_directory_reads_scripts_and_ipfs_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let with_ipfs = Uuid::new_v4();
        let plain = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{with_ipfs}.js")), "// a").unwrap();
        std::fs::write(dir.path().join(format!("{with_ipfs}.ipfs")), " QmAudit \n").unwrap();
        std::fs::write(dir.path().join(format!("{plain}.js")), "// b").unwrap();
        std::fs::write(dir.path().join("helper.js"), "// skipped").unwrap();
        std::fs::write(dir.path().join("README.md"), "docs").unwrap();

        let store = InMemoryScriptStore::new();
        assert_eq!(store.load_directory(dir.path()).unwrap(), 2);

        let a = store.load(&with_ipfs).await.unwrap();
        assert_eq!(a.source.as_str(), "// a");
        assert_eq!(a.ipfs_directory.as_deref(), Some("QmAudit"));
        let b = store.load(&plain).await.unwrap();
        assert_eq!(b.ipfs_directory, None);
    }

    #[test]
    fn load_directory_reports_missing_dir() {
        let store = InMemoryScriptStore::new();
        let err = store
            .load_directory(Path::new("/nonexistent/vigil/scripts"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/vigil/scripts"));
    }
}
