// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! File-system abstraction over the cluster's shared storage root.
//!
//! All paths handed to a [`FileSystem`] are relative to its root. The local
//! implementation maps them onto a directory; a tiered or object-store
//! backend can implement the same trait.

use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// How a file should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only; the file must exist.
    Read,
    /// Read and write; the file is created if missing.
    ReadWrite,
    /// Append only; the file is created if missing.
    Append,
}

/// Operations the storage layer needs from the durable file system.
pub trait FileSystem: Send + Sync {
    /// Opens an existing file read-only.
    fn open(&self, path: &Path) -> io::Result<File> {
        self.open_file(path, OpenMode::Read)
    }

    /// Opens a file with the given mode.
    fn open_file(&self, path: &Path, mode: OpenMode) -> io::Result<File>;

    /// Reads a whole file.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replaces a file's contents durably.
    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Removes a file. Missing files are not an error.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Returns file metadata, or `None` if the file does not exist.
    fn stat(&self, path: &Path) -> io::Result<Option<Metadata>>;

    /// Creates a directory and all parents.
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;

    /// Lists the file names inside a directory. Missing directories are empty.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Returns true if the file exists.
    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.stat(path)?.is_some())
    }
}

/// A [`FileSystem`] backed by a local (or network-mounted) directory.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    /// Creates a file system rooted at `root`, creating the directory.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a relative path against the root.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl FileSystem for LocalFileSystem {
    fn open_file(&self, path: &Path, mode: OpenMode) -> io::Result<File> {
        let full = self.resolve(path);
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::ReadWrite => options.read(true).write(true).create(true),
            OpenMode::Append => options.append(true).create(true),
        };
        options.open(full)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        use std::io::Write;

        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write to a sibling temp file and rename so readers never see a torn file.
        let tmp = full.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &full)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn stat(&self, path: &Path) -> io::Result<Option<Metadata>> {
        match std::fs::metadata(self.resolve(path)) {
            Ok(m) => Ok(Some(m)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(self.resolve(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(self.resolve(path)) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
