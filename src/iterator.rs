//! # On-Disk Iterators
//!
//! A durable cursor over a query result set too large for one response. An
//! iterator is a pair of files under deterministic namespaces inside the
//! database directory:
//!
//! ```text
//! iterator.<id>.grim   newline-delimited matched paths (the data file)
//! itermeta.<id>.grim   JSON: data file name, position, total count
//! ```
//!
//! The position lives in the meta file, not in any snapshot: a pop is
//! immediately visible to every later reader. That is why pops must hold the
//! iterator lock, and why the lock covers exactly one pop, since it is
//! released when the popping task commits.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::DatabaseName;

/// Namespace of iterator data files.
pub const ITERATOR_NAMESPACE: &str = "iterator";
/// Namespace of iterator metadata files.
pub const ITERMETA_NAMESPACE: &str = "itermeta";

// =============================================================================
// Metadata Format
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct IteratorMeta {
    data_file: String,
    position: u64,
    total_files: u64,
}

// =============================================================================
// OnDiskIterator
// =============================================================================

/// A loaded iterator, bound to its files in the database directory.
#[derive(Debug)]
pub struct OnDiskIterator {
    db_dir: PathBuf,
    meta_name: DatabaseName,
    data_name: DatabaseName,
    position: u64,
    total_files: u64,
}

impl OnDiskIterator {
    /// Materializes the metadata for a freshly written data file.
    ///
    /// The data file must already exist (the select executor streams into it
    /// first); the meta file must not.
    pub fn construct(
        db_dir: &Path,
        meta_name: &DatabaseName,
        data_name: &DatabaseName,
        total_files: u64,
    ) -> Result<()> {
        let meta = IteratorMeta {
            data_file: data_name.filename(),
            position: 0,
            total_files,
        };
        let encoded = serde_json::to_vec(&meta)
            .map_err(|e| Error::CorruptedMeta(e.to_string()))?;
        let path = meta_name.full_path(db_dir);
        if path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("iterator metadata already exists: {}", meta_name),
            )));
        }
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Loads an iterator from its metadata file.
    pub fn load(db_dir: &Path, meta_name: &DatabaseName) -> Result<Self> {
        let raw = fs::read(meta_name.full_path(db_dir))?;
        let meta: IteratorMeta = serde_json::from_slice(&raw)
            .map_err(|e| Error::CorruptedMeta(e.to_string()))?;
        let data_name = DatabaseName::from_filename(&meta.data_file)
            .ok_or_else(|| Error::CorruptedMeta(format!("bad data file name: {}", meta.data_file)))?;
        Ok(Self {
            db_dir: db_dir.to_path_buf(),
            meta_name: meta_name.clone(),
            data_name,
            position: meta.position,
            total_files: meta.total_files,
        })
    }

    /// Current position (entries consumed so far). Monotonically
    /// non-decreasing over the iterator's lifetime.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total entry count, fixed at creation.
    pub fn total_files(&self) -> u64 {
        self.total_files
    }

    /// Pops up to `count` entries, advancing and persisting the position.
    ///
    /// Popping past the end returns the remaining entries (possibly none);
    /// it is not an error.
    pub fn pop(&mut self, count: u64) -> Result<Vec<String>> {
        let data = fs::read_to_string(self.data_name.full_path(&self.db_dir))?;
        let entries: Vec<String> = data
            .lines()
            .skip(self.position as usize)
            .take(count as usize)
            .map(str::to_string)
            .collect();

        self.position += entries.len() as u64;
        self.persist()?;
        Ok(entries)
    }

    /// Rewrites the meta file. Rename makes the update atomic: readers see
    /// either the old position or the new one, never a torn file.
    fn persist(&self) -> Result<()> {
        let meta = IteratorMeta {
            data_file: self.data_name.filename(),
            position: self.position,
            total_files: self.total_files,
        };
        let encoded = serde_json::to_vec(&meta)
            .map_err(|e| Error::CorruptedMeta(e.to_string()))?;
        let final_path = self.meta_name.full_path(&self.db_dir);
        let tmp_path = final_path.with_extension("grim.tmp");
        fs::write(&tmp_path, encoded)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
