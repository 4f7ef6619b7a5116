//! Fact store persistence.
//!
//! The blob is a JSON object:
//!
//! ```json
//! { "savedValues": { "sleva": 21 }, "lastResult": "21", "lastExpression": null }
//! ```
//!
//! Numbers keep the exact digits they were written with. Blobs written with
//! PascalCase keys (`SavedValues`, ...) are read as well.

use std::io;
use std::path::Path;

use serde_json::Value;
use tally_types::{Decimal, FactStore};
use thiserror::Error;

use crate::atomic_write::atomic_write;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persisted memory is corrupt: {0}")]
    Corrupt(String),
    #[error("failed to access session file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[must_use]
pub fn serialize(store: &FactStore) -> String {
    serde_json::to_string(store).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to serialize fact store");
        "{}".to_string()
    })
}

/// Strictly parse a blob.
///
/// Anything but a JSON object of the expected shape is
/// [`PersistenceError::Corrupt`]. Blank keys are dropped, not rejected.
pub fn try_deserialize(blob: &str) -> Result<FactStore, PersistenceError> {
    let trimmed = blob.trim();
    if trimmed.is_empty() {
        return Err(PersistenceError::Corrupt("blob is empty".to_string()));
    }

    let mut value: Value =
        serde_json::from_str(trimmed).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
    if !value.is_object() {
        return Err(PersistenceError::Corrupt(
            "blob is not a JSON object".to_string(),
        ));
    }

    let unrepresentable = drop_unrepresentable_values(&mut value);
    if !unrepresentable.is_empty() {
        tracing::warn!(
            names = ?unrepresentable,
            "Dropped persisted values outside decimal range"
        );
    }

    // Decode from text so decimals keep their exact digits.
    let text = value.to_string();
    let mut store: FactStore =
        serde_json::from_str(&text).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
    let dropped = store.remove_blank_keys();
    if dropped > 0 {
        tracing::warn!(dropped, "Dropped blank keys from persisted memory");
    }
    Ok(store)
}

/// Remove numeric saved values that do not fit a `Decimal`.
///
/// Non-numeric entries are left for the store decoder to reject.
fn drop_unrepresentable_values(blob: &mut Value) -> Vec<String> {
    let mut dropped = Vec::new();
    for key in ["savedValues", "SavedValues"] {
        let Some(values) = blob.get_mut(key).and_then(Value::as_object_mut) else {
            continue;
        };
        values.retain(|name, value| {
            let fits = !value.is_number()
                || serde_json::from_str::<Decimal>(&value.to_string()).is_ok();
            if !fits {
                dropped.push(name.clone());
            }
            fits
        });
    }
    dropped
}

/// Restore a store, falling back to an empty one.
///
/// `None` is a new session. Any unreadable blob is logged and replaced with
/// an empty store; this never fails.
#[must_use]
pub fn deserialize(blob: Option<&str>) -> FactStore {
    let Some(blob) = blob else {
        tracing::debug!("No persisted memory; starting empty");
        return FactStore::new();
    };

    match try_deserialize(blob) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring persisted memory");
            FactStore::new()
        }
    }
}

/// Load a session file. A missing file is a new session.
pub fn load_session(path: &Path) -> Result<FactStore, PersistenceError> {
    match std::fs::read_to_string(path) {
        Ok(blob) => Ok(deserialize(Some(&blob))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(deserialize(None)),
        Err(source) => Err(PersistenceError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Write a session file atomically, creating parent directories.
pub fn save_session(path: &Path, store: &FactStore) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    atomic_write(path, serialize(store).as_bytes()).map_err(io_err)?;
    tracing::debug!(path = %path.display(), values = store.saved_values().len(), "Saved session");
    Ok(())
}
