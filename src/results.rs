//! # Result Writers
//!
//! Query results flow through a [`ResultWriter`] capability object so the
//! same execution path can serve both response styles: small result sets go
//! to an in-memory writer and straight into the reply; iterator-backed
//! selects stream matches to a file that later becomes the iterator's data
//! file.
//!
//! The file format is deliberately plain: one matched path per line. The
//! iterator reads it back positionally (see [`crate::iterator`]).

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

// =============================================================================
// Capability Trait
// =============================================================================

/// Sink for file matches produced by query execution.
pub trait ResultWriter {
    /// Records one matched file path.
    fn append_file_match(&mut self, path: &str) -> Result<()>;

    /// Number of matches recorded so far.
    fn file_count(&self) -> u64;

    /// Flushes buffered state. Must be called before the results are read
    /// by anyone else.
    fn finalize(&mut self) -> Result<()>;
}

// =============================================================================
// In-Memory Writer
// =============================================================================

/// Collects matches in memory for direct inclusion in a `select` reply.
#[derive(Debug, Default)]
pub struct InMemoryResultWriter {
    files: Vec<String>,
}

impl InMemoryResultWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the writer, yielding the collected matches in match order.
    pub fn into_files(self) -> Vec<String> {
        self.files
    }
}

impl ResultWriter for InMemoryResultWriter {
    fn append_file_match(&mut self, path: &str) -> Result<()> {
        self.files.push(path.to_string());
        Ok(())
    }

    fn file_count(&self) -> u64 {
        self.files.len() as u64
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// File-Backed Writer
// =============================================================================

/// Streams matches to a newline-delimited file, the future iterator data
/// file.
#[derive(Debug)]
pub struct FileResultWriter {
    path: PathBuf,
    out: BufWriter<File>,
    count: u64,
}

impl FileResultWriter {
    /// Creates the data file. Refuses to overwrite an existing one; name
    /// allocation is random, so a collision means something is wrong.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            count: 0,
        })
    }

    /// The path this writer streams to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultWriter for FileResultWriter {
    fn append_file_match(&mut self, path: &str) -> Result<()> {
        self.out.write_all(path.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    fn file_count(&self) -> u64 {
        self.count
    }

    fn finalize(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
