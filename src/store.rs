//! Persistence port: load/save of the full server state.
//!
//! The snapshot is the same JSON envelope the management API speaks, so a
//! database file is readable (and editable, server stopped) by hand. Pool
//! bitmaps are never written; they are rebuilt from the lease lists on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::subnet::SubnetDto;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub subnets: BTreeMap<String, SubnetDto>,
}

/// Two-method capability the tracker persists through. Production uses
/// [`FileStore`]; tests inject [`MemoryStore`].
pub trait Store: Send + Sync {
    /// Reads the last saved snapshot. A store with no prior state returns
    /// the empty snapshot, not an error.
    fn load(&self) -> Result<Snapshot>;

    /// Durably commits `snapshot` before returning.
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// JSON file store with atomic replace: the snapshot is written to a
/// temporary file in the same directory and renamed over the target, so a
/// crash mid-save never leaves a torn database.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }
}

impl Store for FileStore {
    fn load(&self) -> Result<Snapshot> {
        if !self.path.exists() {
            return Ok(Snapshot::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Snapshot> {
        Ok(self.snapshot.lock().expect("snapshot lock poisoned").clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.lock().expect("snapshot lock poisoned") = snapshot.clone();
        Ok(())
    }
}
