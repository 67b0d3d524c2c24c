//! Logical model names mapped to files on disk, guarded by content checksums.

use crate::error::{Error, Result};
use crate::runtime::ModelType;
use crate::store::{ChatStore, ModelRecord};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lowercase hex SHA-256 of the file at `path`, read in streaming fashion.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| Error::io(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Registry of models backed by the chat store, with a read-through cache.
pub struct ModelRegistry<S> {
    store: Arc<S>,
    cache: Mutex<HashMap<String, ModelRecord>>,
}

impl<S: ChatStore> ModelRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register `name` at `path`, recording the file's checksum.
    pub fn register(&self, name: &str, path: &Path, model_type: ModelType) -> Result<ModelRecord> {
        if name.trim().is_empty() {
            return Err(Error::invalid("model name cannot be empty"));
        }
        if path.as_os_str().is_empty() {
            return Err(Error::invalid("model path cannot be empty"));
        }
        if self.cache.lock().contains_key(name) || self.store.get_model(name)?.is_some() {
            return Err(Error::ModelExists(name.to_string()));
        }

        let record = ModelRecord {
            name: name.to_string(),
            path: path.to_path_buf(),
            checksum: file_checksum(path)?,
            model_type,
        };
        self.store.insert_model(&record)?;
        self.cache.lock().insert(name.to_string(), record.clone());
        tracing::info!(
            model = name,
            path = %path.display(),
            %model_type,
            checksum = %record.checksum,
            "Model registered"
        );
        Ok(record)
    }

    /// Full record for `name`, cache first.
    pub fn record(&self, name: &str) -> Result<ModelRecord> {
        if let Some(record) = self.cache.lock().get(name) {
            return Ok(record.clone());
        }
        let record = self
            .store
            .get_model(name)?
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        self.cache.lock().insert(name.to_string(), record.clone());
        Ok(record)
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        self.record(name).map(|r| r.path)
    }

    /// Point `name` at `new_path`. The new file must hash to the registered
    /// checksum; otherwise nothing changes.
    pub fn update_path(&self, name: &str, new_path: &Path) -> Result<()> {
        let current = self.record(name)?;
        let checksum = file_checksum(new_path)?;
        if checksum != current.checksum {
            tracing::warn!(
                model = name,
                path = %new_path.display(),
                "Refusing model path update: checksum differs"
            );
            return Err(Error::ChecksumMismatch {
                name: name.to_string(),
                path: new_path.to_path_buf(),
            });
        }

        self.store.update_model_path(name, new_path)?;
        let mut cache = self.cache.lock();
        cache.insert(
            name.to_string(),
            ModelRecord {
                path: new_path.to_path_buf(),
                ..current
            },
        );
        tracing::info!(model = name, path = %new_path.display(), "Model path updated");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ModelRecord>> {
        self.store.list_models()
    }

    /// Require `name` to be registered with `expected` type.
    pub fn expect_type(&self, name: &str, expected: ModelType) -> Result<ModelRecord> {
        let record = self.record(name)?;
        if record.model_type != expected {
            return Err(Error::ModelTypeMismatch {
                name: name.to_string(),
                expected: expected.as_str(),
                actual: record.model_type.as_str(),
            });
        }
        Ok(record)
    }
}
