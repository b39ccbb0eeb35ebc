//! History token side table
//!
//! Persists the reconciler's cursor for every physical store in a small
//! JSON file kept next to (but outside of) the store files, so erasing or
//! swapping a store does not rewind its consumers.

use coffer_core::{
    error::{CofferError, Result},
    traits::{token_key, TokenTable},
    types::{HistoryToken, StoreIdentity},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk token file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenFile {
    /// `HistoryToken<store identity>` to last consumed token
    pub tokens: BTreeMap<String, HistoryToken>,

    /// RFC 3339 timestamp of the last write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Token table backed by a JSON file.
///
/// Every write replaces the file atomically (write to a temporary file in
/// the same directory, then rename).
pub struct FileTokenTable {
    path: PathBuf,
    tokens: Mutex<BTreeMap<String, HistoryToken>>,
}

impl FileTokenTable {
    /// Open the table at `path`, creating parent directories. A missing
    /// file is an empty table.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tokens = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: TokenFile = serde_json::from_str(&content)
                .map_err(|e| CofferError::Serialization(e.to_string()))?;
            file.tokens
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            tokens: Mutex::new(tokens),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, tokens: &BTreeMap<String, HistoryToken>) -> Result<()> {
        let file = TokenFile {
            tokens: tokens.clone(),
            updated_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| CofferError::Serialization(e.to_string()))?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| CofferError::Io(e.error))?;

        debug!("Wrote token table: {}", self.path.display());
        Ok(())
    }
}

impl TokenTable for FileTokenTable {
    fn load(&self, store: &StoreIdentity) -> Result<Option<HistoryToken>> {
        Ok(self.tokens.lock().get(&token_key(store)).copied())
    }

    fn store(&self, store: &StoreIdentity, token: HistoryToken) -> Result<()> {
        let mut tokens = self.tokens.lock();
        let previous = tokens.insert(token_key(store), token);
        if let Err(e) = self.persist(&tokens) {
            // Keep memory and disk in agreement.
            match previous {
                Some(previous) => tokens.insert(token_key(store), previous),
                None => tokens.remove(&token_key(store)),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, store: &StoreIdentity) -> Result<()> {
        let mut tokens = self.tokens.lock();
        if tokens.remove(&token_key(store)).is_some() {
            self.persist(&tokens)?;
        }
        Ok(())
    }
}

/// Token table that lives only as long as the process.
#[derive(Default)]
pub struct MemoryTokenTable {
    tokens: Mutex<BTreeMap<String, HistoryToken>>,
}

impl MemoryTokenTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenTable for MemoryTokenTable {
    fn load(&self, store: &StoreIdentity) -> Result<Option<HistoryToken>> {
        Ok(self.tokens.lock().get(&token_key(store)).copied())
    }

    fn store(&self, store: &StoreIdentity, token: HistoryToken) -> Result<()> {
        self.tokens.lock().insert(token_key(store), token);
        Ok(())
    }

    fn remove(&self, store: &StoreIdentity) -> Result<()> {
        self.tokens.lock().remove(&token_key(store));
        Ok(())
    }
}
