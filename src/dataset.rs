//! # Datasets
//!
//! A dataset is an immutable collection of indexed content: a stable id, the
//! list of files it covers, a taint set for coarse query-time filtering, and
//! one descriptor per secondary index. Datasets never change once published;
//! every mutation (reindex, compact, taint flip) produces a new value that
//! replaces the old one at task commit.
//!
//! This module also hosts the indexing walk and the content scan backing
//! query execution. Both stand in for the real storage engine behind the
//! same interface the snapshot exposes.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::response::QueryCounters;
use crate::results::ResultWriter;
use crate::types::{DatasetId, IndexType};

// =============================================================================
// Index Descriptors
// =============================================================================

/// One secondary index over a dataset: its kind and on-disk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRef {
    pub index_type: IndexType,
    pub size: u64,
}

// =============================================================================
// Dataset
// =============================================================================

/// An immutable, published collection of indexed files.
#[derive(Debug, Clone)]
pub struct Dataset {
    id: DatasetId,
    files: Vec<PathBuf>,
    taints: BTreeSet<String>,
    indexes: Vec<IndexRef>,
}

impl Dataset {
    /// Assembles a dataset from already-collected parts.
    pub fn new(
        id: DatasetId,
        files: Vec<PathBuf>,
        taints: BTreeSet<String>,
        indexes: Vec<IndexRef>,
    ) -> Self {
        Self {
            id,
            files,
            taints,
            indexes,
        }
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn file_count(&self) -> u64 {
        self.files.len() as u64
    }

    pub fn taints(&self) -> &BTreeSet<String> {
        &self.taints
    }

    pub fn has_taint(&self, taint: &str) -> bool {
        self.taints.contains(taint)
    }

    pub fn indexes(&self) -> &[IndexRef] {
        &self.indexes
    }

    /// Sum of the contained index sizes, as reported by `topology`.
    pub fn total_index_size(&self) -> u64 {
        self.indexes.iter().map(|ix| ix.size).sum()
    }

    /// Whether this dataset already covers the given file.
    pub fn contains_file(&self, path: &Path) -> bool {
        self.files.iter().any(|f| f == path)
    }

    /// A copy of this dataset with the taint's membership flipped.
    ///
    /// Applied at commit; the id is unchanged because a taint flip does not
    /// re-derive content.
    pub fn with_taint_toggled(&self, taint: &str) -> Self {
        let mut copy = self.clone();
        if !copy.taints.remove(taint) {
            copy.taints.insert(taint.to_string());
        }
        copy
    }

    /// Scans this dataset's files for the needle, reporting matches to the
    /// writer and updating the counters.
    ///
    /// Files that vanished since indexing are skipped, not errors: the index
    /// outlives its inputs by design.
    pub fn scan(
        &self,
        needle: &[u8],
        writer: &mut dyn ResultWriter,
        counters: &mut QueryCounters,
    ) -> Result<()> {
        counters.datasets_scanned += 1;
        for file in &self.files {
            let contents = match fs::read(file) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            counters.files_scanned += 1;
            if contains_needle(&contents, needle) {
                counters.files_matched += 1;
                writer.append_file_match(&file.to_string_lossy())?;
            }
        }
        Ok(())
    }
}

fn contains_needle(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

// =============================================================================
// Building
// =============================================================================

/// Allocates a fresh dataset id (`set_<hex>`).
pub fn allocate_dataset_id() -> DatasetId {
    DatasetId::new(format!("set_{:016x}", rand::random::<u64>()))
}

/// Recursively collects regular files under each path, in stable order.
///
/// A path that is itself a regular file is taken as-is. A missing path is an
/// I/O error: indexing something that isn't there is a client mistake.
pub fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        let meta = fs::metadata(path)?;
        if meta.is_dir() {
            walk_dir(path, &mut files)?;
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn walk_dir(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();
    for entry in entries {
        if entry.is_dir() {
            walk_dir(&entry, files)?;
        } else {
            files.push(entry);
        }
    }
    Ok(())
}

/// Builds a dataset over the given files with the requested index types and
/// taints.
///
/// Each index descriptor's size is the total number of bytes it covers. The
/// real index encoding is the storage layer's business; the descriptor is
/// what the coordination layer needs for topology and compaction decisions.
pub fn build_dataset(
    files: Vec<PathBuf>,
    index_types: &[IndexType],
    taints: &[String],
) -> Result<Dataset> {
    let mut indexed_bytes = 0u64;
    for file in &files {
        indexed_bytes += fs::metadata(file)?.len();
    }

    let indexes = index_types
        .iter()
        .map(|&index_type| IndexRef {
            index_type,
            size: indexed_bytes,
        })
        .collect();

    Ok(Dataset::new(
        allocate_dataset_id(),
        files,
        taints.iter().cloned().collect(),
        indexes,
    ))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::InMemoryResultWriter;

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("a.bin"), b"hello world").unwrap();
        fs::write(dir.path().join("b.bin"), b"nothing here").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.bin"), b"hello again").unwrap();
        dir
    }

    #[test]
    fn test_collect_files_recurses_in_order() {
        let dir = fixture_dir();
        let files = collect_files(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.bin", "b.bin", "c.bin"]);
    }

    #[test]
    fn test_collect_files_missing_path_errors() {
        let err = collect_files(&[PathBuf::from("/definitely/not/here")]).unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }

    #[test]
    fn test_build_dataset_descriptors() {
        let dir = fixture_dir();
        let files = collect_files(&[dir.path().to_path_buf()]).unwrap();
        let ds = build_dataset(
            files,
            &[IndexType::Gram3, IndexType::Text4],
            &["fresh".to_string()],
        )
        .unwrap();

        assert!(ds.id().as_str().starts_with("set_"));
        assert_eq!(ds.file_count(), 3);
        assert!(ds.has_taint("fresh"));
        assert_eq!(ds.indexes().len(), 2);
        // Both indexes cover the same bytes.
        assert_eq!(ds.indexes()[0].size, ds.indexes()[1].size);
        assert_eq!(ds.total_index_size(), ds.indexes()[0].size * 2);
    }

    #[test]
    fn test_scan_matches_contents() {
        let dir = fixture_dir();
        let files = collect_files(&[dir.path().to_path_buf()]).unwrap();
        let ds = build_dataset(files, &[IndexType::Gram3], &[]).unwrap();

        let mut writer = InMemoryResultWriter::new();
        let mut counters = QueryCounters::default();
        ds.scan(b"hello", &mut writer, &mut counters).unwrap();

        assert_eq!(counters.datasets_scanned, 1);
        assert_eq!(counters.files_scanned, 3);
        assert_eq!(counters.files_matched, 2);
        let matched = writer.into_files();
        assert!(matched[0].ends_with("a.bin"));
        assert!(matched[1].ends_with("c.bin"));
    }

    #[test]
    fn test_taint_toggle_is_an_involution() {
        let ds = Dataset::new(
            DatasetId::new("set_x"),
            vec![],
            BTreeSet::new(),
            vec![],
        );
        let tainted = ds.with_taint_toggled("evil");
        assert!(tainted.has_taint("evil"));
        let untainted = tainted.with_taint_toggled("evil");
        assert!(!untainted.has_taint("evil"));
        assert_eq!(untainted.id(), ds.id());
    }
}
