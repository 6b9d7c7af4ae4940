//! Filesystem-backed hierarchical persistence adapter.
//!
//! Layout under `<root>/<prefix>`:
//!
//! ```text
//! consumers/<sourceId>/<partition>   ASCII decimal offset
//! requests/<identifier>/<partition>  JSON sideline request payload
//! ```
//!
//! Empty parent nodes are pruned on clear, up to and including the
//! sourceId/identifier directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::messaging::SourceId;
use crate::sideline::SidelineId;

use super::{PersistenceAdapter, PersistenceError, SidelineRequestRecord};

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(5);

pub struct FsPersistenceAdapter {
    base: PathBuf,
    opened: AtomicBool,
    // Serializes mutations; reads go straight to the filesystem.
    write_lock: Mutex<()>,
}

impl FsPersistenceAdapter {
    pub fn new(root: impl AsRef<Path>, prefix: &str) -> Self {
        Self {
            base: root.as_ref().join(prefix),
            opened: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    fn ensure_opened(&self) -> Result<(), PersistenceError> {
        if self.opened.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PersistenceError::NotOpened)
        }
    }

    fn consumer_path(&self, source_id: &SourceId, partition: i32) -> PathBuf {
        self.base
            .join("consumers")
            .join(source_id.as_str())
            .join(partition.to_string())
    }

    fn request_path(&self, id: &SidelineId, partition: i32) -> PathBuf {
        self.base
            .join("requests")
            .join(id.as_str())
            .join(partition.to_string())
    }

    /// Write with bounded retries; transient filesystem errors are common on
    /// the coordination volumes this adapter targets.
    fn write_value(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut last_err = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match fs::write(path, bytes) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        "persistence write to {} failed (attempt {attempt}/{WRITE_ATTEMPTS}): {err}",
                        path.display()
                    );
                    last_err = Some(err);
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
            }
        }
        Err(last_err.expect("at least one attempt").into())
    }

    fn read_value(&self, path: &Path) -> Result<Option<Vec<u8>>, PersistenceError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a leaf and prune its parent directory if now empty.
    fn remove_value(&self, path: &Path) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = path.parent() {
            // Only prunes when empty; a racing write keeps the node alive.
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, PersistenceError> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

impl PersistenceAdapter for FsPersistenceAdapter {
    fn open(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(self.base.join("consumers"))?;
        fs::create_dir_all(self.base.join("requests"))?;
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        self.opened.store(false, Ordering::Release);
    }

    fn persist_consumer_offset(
        &self,
        source_id: &SourceId,
        partition: i32,
        offset: i64,
    ) -> Result<(), PersistenceError> {
        self.ensure_opened()?;
        let path = self.consumer_path(source_id, partition);
        self.write_value(&path, offset.to_string().as_bytes())
    }

    fn retrieve_consumer_offset(
        &self,
        source_id: &SourceId,
        partition: i32,
    ) -> Result<Option<i64>, PersistenceError> {
        self.ensure_opened()?;
        let path = self.consumer_path(source_id, partition);
        let Some(bytes) = self.read_value(&path)? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        text.trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|err| PersistenceError::Corrupt {
                key: path.display().to_string(),
                detail: err.to_string(),
            })
    }

    fn clear_consumer_offset(
        &self,
        source_id: &SourceId,
        partition: i32,
    ) -> Result<(), PersistenceError> {
        self.ensure_opened()?;
        self.remove_value(&self.consumer_path(source_id, partition))
    }

    fn persist_sideline_request(
        &self,
        id: &SidelineId,
        partition: i32,
        record: &SidelineRequestRecord,
    ) -> Result<(), PersistenceError> {
        self.ensure_opened()?;
        let path = self.request_path(id, partition);
        let bytes = record.encode(&path.display().to_string())?;
        self.write_value(&path, &bytes)
    }

    fn retrieve_sideline_request(
        &self,
        id: &SidelineId,
        partition: i32,
    ) -> Result<Option<SidelineRequestRecord>, PersistenceError> {
        self.ensure_opened()?;
        let path = self.request_path(id, partition);
        match self.read_value(&path)? {
            Some(bytes) => {
                SidelineRequestRecord::decode(&bytes, &path.display().to_string()).map(Some)
            }
            None => Ok(None),
        }
    }

    fn clear_sideline_request(
        &self,
        id: &SidelineId,
        partition: i32,
    ) -> Result<(), PersistenceError> {
        self.ensure_opened()?;
        self.remove_value(&self.request_path(id, partition))
    }

    fn list_sideline_requests(&self) -> Result<Vec<SidelineId>, PersistenceError> {
        self.ensure_opened()?;
        Ok(self
            .list_dir(&self.base.join("requests"))?
            .into_iter()
            .map(|name| SidelineId::from(name.as_str()))
            .collect())
    }

    fn list_sideline_request_partitions(
        &self,
        id: &SidelineId,
    ) -> Result<Vec<i32>, PersistenceError> {
        self.ensure_opened()?;
        let mut partitions: Vec<i32> = self
            .list_dir(&self.base.join("requests").join(id.as_str()))?
            .into_iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        partitions.sort_unstable();
        Ok(partitions)
    }
}
