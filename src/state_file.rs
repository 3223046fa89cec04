//! JSON file state store
//!
//! One file per stack holds every [`ProvisionRecord`]. Each write serializes
//! the whole document to a temporary file in the same directory and renames it
//! over the previous one, so a crash mid-write leaves the old state intact.
//! The in-memory document only changes once the new file is in place.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reconcile::{ProvisionRecord, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Current on-disk format version
pub const STATE_VERSION: u32 = 1;

// ============================================================================
// State Document
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,

    /// Last time any record was written
    pub last_updated: DateTime<Utc>,

    #[serde(default)]
    pub records: BTreeMap<String, ProvisionRecord>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_updated: Utc::now(),
            records: BTreeMap::new(),
        }
    }
}

// ============================================================================
// FileStateStore
// ============================================================================

#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl FileStateStore {
    /// Open the state file at `path`; a missing file is an empty state
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read state file: {}", path.display()))?;
            let doc: StateDocument = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
            if doc.version > STATE_VERSION {
                bail!(
                    "State file {} has version {}, this build supports up to {STATE_VERSION}",
                    path.display(),
                    doc.version
                );
            }
            log::debug!(
                "Loaded {} records from {}",
                doc.records.len(),
                path.display()
            );
            doc
        } else {
            log::debug!("State file does not exist, starting empty: {}", path.display());
            StateDocument::default()
        };

        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current document
    pub fn snapshot(&self) -> StateDocument {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, StateDocument> {
        match self.doc.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply `change` to a copy of the document, persist it, then swap it in
    fn write<T>(&self, change: impl FnOnce(&mut StateDocument) -> T) -> reconcile::Result<T> {
        let mut doc = self.lock();
        let mut next = doc.clone();
        let result = change(&mut next);
        next.last_updated = Utc::now();
        self.persist(&next)
            .map_err(|e| reconcile::Error::store(format!("{e:#}")))?;
        *doc = next;
        Ok(result)
    }

    fn persist(&self, doc: &StateDocument) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let content = serde_json::to_vec_pretty(doc).context("Failed to serialize state")?;
        let mut file = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        file.write_all(&content)
            .and_then(|()| file.as_file().sync_all())
            .context("Failed to write temporary state file")?;
        file.persist(&self.path)
            .with_context(|| format!("Failed to write state file: {}", self.path.display()))?;

        log::trace!("Saved state to {}", self.path.display());
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, id: &str) -> reconcile::Result<Option<ProvisionRecord>> {
        Ok(self.lock().records.get(id).cloned())
    }

    fn put(&self, record: ProvisionRecord) -> reconcile::Result<()> {
        self.write(|doc| {
            doc.records.insert(record.id.clone(), record);
        })
    }

    fn remove(&self, id: &str) -> reconcile::Result<Option<ProvisionRecord>> {
        if !self.lock().records.contains_key(id) {
            return Ok(None);
        }
        self.write(|doc| doc.records.remove(id))
    }

    fn list_all(&self) -> reconcile::Result<Vec<ProvisionRecord>> {
        Ok(self.lock().records.values().cloned().collect())
    }

    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(Option<ProvisionRecord>) -> Option<ProvisionRecord>,
    ) -> reconcile::Result<Option<ProvisionRecord>> {
        self.write(|doc| {
            let next = f(doc.records.remove(id));
            if let Some(record) = &next {
                doc.records.insert(id.to_string(), record.clone());
            }
            next
        })
    }
}
