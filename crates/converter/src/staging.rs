use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{ConvertError, Result};

/// Which side of an invocation a staged entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedRole {
    Input,
    Output,
}

/// A single entry in the staging store
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub name: String,
    pub bytes: Bytes,
    pub role: StagedRole,
}

/// Map a user-supplied filename to a shell-safe staging token.
///
/// Every character outside `[A-Za-z0-9.]` becomes `_`.
pub fn sanitize_name(display_name: &str) -> String {
    display_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

/// Staged output name for a staged input: same stem, `.mp4` extension.
///
/// Falls back to `<stem>.converted.mp4` when the input already is an `.mp4`,
/// so the engine never overwrites its own input.
pub fn output_name_for(input_name: &str) -> String {
    let stem = Path::new(input_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(input_name);

    let candidate = format!("{}.mp4", stem);
    if candidate == input_name {
        format!("{}.converted.mp4", stem)
    } else {
        candidate
    }
}

/// Shared, cheaply cloneable name -> bytes map used to hand files to and from the engine.
///
/// Sessions stage through a [`StagingScope`] rather than calling `remove`
/// themselves; the scope purges its names when dropped.
#[derive(Debug, Clone, Default)]
pub struct StagingStore {
    entries: Arc<Mutex<HashMap<String, StagedFile>>>,
}

impl StagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` under `name`, replacing any previous entry
    pub fn put(&self, name: &str, bytes: impl Into<Bytes>, role: StagedRole) {
        let bytes = bytes.into();
        debug!("staging {} ({} bytes, {:?})", name, bytes.len(), role);
        self.entries.lock().insert(
            name.to_string(),
            StagedFile {
                name: name.to_string(),
                bytes,
                role,
            },
        );
    }

    pub fn get(&self, name: &str) -> Result<Bytes> {
        self.entries
            .lock()
            .get(name)
            .map(|entry| entry.bytes.clone())
            .ok_or_else(|| ConvertError::NotFound(name.to_string()))
    }

    /// Best-effort delete; a missing name is not an error
    pub fn remove(&self, name: &str) {
        if self.entries.lock().remove(name).is_some() {
            debug!("unstaged {}", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Names currently staged, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Scoped acquisition of staged entries with guaranteed release.
pub struct StagingScope {
    store: StagingStore,
    names: Vec<String>,
    settle: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl StagingScope {
    pub fn new(store: StagingStore) -> Self {
        Self {
            store,
            names: Vec::new(),
            settle: None,
        }
    }

    /// Scope whose cleanup is repeated once the engine's invocation lock is free.
    pub(crate) fn with_settle(store: StagingStore, settle: Arc<tokio::sync::Mutex<()>>) -> Self {
        Self {
            store,
            names: Vec::new(),
            settle: Some(settle),
        }
    }

    /// Put an input file into the store and own its removal
    pub fn stage_input(&mut self, name: &str, bytes: impl Into<Bytes>) {
        self.store.put(name, bytes, StagedRole::Input);
        self.track(name);
    }

    /// Own the removal of a name the engine is expected to write
    pub fn claim_output(&mut self, name: &str) {
        self.track(name);
    }

    pub fn store(&self) -> &StagingStore {
        &self.store
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    fn track(&mut self, name: &str) {
        if !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }
}

impl Drop for StagingScope {
    fn drop(&mut self) {
        for name in &self.names {
            self.store.remove(name);
        }

        // An abandoned invocation may still write its output after this point.
        let Some(settle) = self.settle.take() else {
            return;
        };
        if settle.try_lock().is_ok() || self.names.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = self.store.clone();
        let names = std::mem::take(&mut self.names);
        debug!("engine still busy, deferring cleanup of {:?}", names);
        handle.spawn(async move {
            let _idle = settle.lock().await;
            for name in &names {
                store.remove(name);
            }
        });
    }
}
