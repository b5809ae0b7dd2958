//! Flat JSON file backed store.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info, trace};

use crate::{Change, ChangeHook, DbError};

/// A key/value store persisted as a single JSON object.
///
/// The whole file is rewritten on every change, through a temporary file
/// in the same directory so a crash never leaves a truncated store behind.
pub struct FlatFileDb {
    path: Option<PathBuf>,
    data: BTreeMap<String, Value>,
    hooks: Vec<Box<dyn ChangeHook>>,
}

impl FlatFileDb {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DbError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "store file missing, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), keys = data.len(), "opened store");
        Ok(Self {
            path: Some(path),
            data,
            hooks: Vec::new(),
        })
    }

    /// Create a store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: BTreeMap::new(),
            hooks: Vec::new(),
        }
    }

    /// Register a hook to be invoked after every committed change.
    pub fn on_change(&mut self, hook: impl ChangeHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Look up a key.
    pub fn request(&self, key: &str) -> Result<&Value, DbError> {
        self.data
            .get(key)
            .ok_or_else(|| DbError::NotFound(key.to_string()))
    }

    /// Write a key, persist, then notify hooks.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), DbError> {
        validate_key(key)?;
        let previous = self.data.insert(key.to_string(), value.clone());
        if let Err(e) = self.save() {
            // Keep memory consistent with disk
            match previous {
                Some(previous) => self.data.insert(key.to_string(), previous),
                None => self.data.remove(key),
            };
            return Err(e);
        }

        trace!(key, "store key set");
        self.notify(&Change::Set {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Remove a key, persist, then notify hooks. Returns the removed value.
    pub fn delete(&mut self, key: &str) -> Result<Value, DbError> {
        let removed = self
            .data
            .remove(key)
            .ok_or_else(|| DbError::NotFound(key.to_string()))?;
        if let Err(e) = self.save() {
            self.data.insert(key.to_string(), removed);
            return Err(e);
        }

        trace!(key, "store key deleted");
        self.notify(&Change::Delete {
            key: key.to_string(),
        });
        Ok(removed)
    }

    /// All entries, ordered by key.
    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    /// Published form of the store: a map of every key.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn notify(&mut self, change: &Change) {
        for hook in &mut self.hooks {
            hook.on_change(change);
        }
    }

    fn save(&self) -> Result<(), DbError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let file = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(file.as_file());
            serde_json::to_writer_pretty(&mut writer, &self.data)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        file.persist(path).map_err(|e| DbError::Io(e.error))?;
        Ok(())
    }
}

impl fmt::Debug for FlatFileDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatFileDb")
            .field("path", &self.path)
            .field("keys", &self.data.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

fn validate_key(key: &str) -> Result<(), DbError> {
    if key.trim().is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".to_string()));
    }
    if key.chars().any(char::is_control) {
        return Err(DbError::InvalidArgument(format!(
            "key contains control characters: {key:?}"
        )));
    }
    Ok(())
}
