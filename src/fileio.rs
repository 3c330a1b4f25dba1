/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 */

//! Scoped file access for in-progress downloads.
//!
//! A [`FileSlot`] wraps the open descriptor of a download destination (or its
//! `.pdpart` sibling) and guarantees release on every exit path. All errors
//! surface as [`DownloadError`] values; dropping a slot closes quietly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{DownloadError, DownloadResult, ErrorCode};

/// Extension of the partial-download sibling next to the destination.
pub const PART_EXT: &str = ".pdpart";

const COPY_BUFSIZE: usize = 2048;

/// The in-progress file for `dest`: `<dest>.pdpart` in the same directory.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PART_EXT);
    PathBuf::from(name)
}

/// Open mode for a [`FileSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only.
    Read,
    /// Write, truncating any existing content.
    WriteTruncate,
    /// Read + write, truncating any existing content.
    WriteUpdate,
    /// Read + write, preserving content, positioned for appending.
    AppendUpdate,
}

/// Scoped open file with seek/truncate/copy helpers.
#[derive(Debug)]
pub struct FileSlot {
    file: File,
    path: PathBuf,
}

impl FileSlot {
    pub fn open(path: &Path, mode: OpenMode) -> DownloadResult<Self> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::WriteTruncate => {
                options.write(true).create(true).truncate(true);
            }
            OpenMode::WriteUpdate => {
                options.read(true).write(true).create(true).truncate(true);
            }
            OpenMode::AppendUpdate => {
                options.read(true).write(true).create(true);
            }
        }
        let mut file = options.open(path).map_err(|e| {
            DownloadError::fatal(
                ErrorCode::File,
                format!("could not open {}: {e}", path.display()),
            )
        })?;
        if mode == OpenMode::AppendUpdate {
            file.seek(SeekFrom::End(0)).map_err(|e| io_error(path, &e))?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seek(&mut self, pos: SeekFrom) -> DownloadResult<u64> {
        self.file.seek(pos).map_err(|e| io_error(&self.path, &e))
    }

    pub fn tell(&mut self) -> DownloadResult<u64> {
        self.file
            .stream_position()
            .map_err(|e| io_error(&self.path, &e))
    }

    pub fn read(&mut self, buf: &mut [u8]) -> DownloadResult<usize> {
        self.file.read(buf).map_err(|e| io_error(&self.path, &e))
    }

    pub fn write_all(&mut self, buf: &[u8]) -> DownloadResult<()> {
        self.file
            .write_all(buf)
            .map_err(|e| DownloadError::from_file_io(&e, &self.path))
    }

    pub fn truncate(&mut self, len: u64) -> DownloadResult<()> {
        self.file
            .set_len(len)
            .map_err(|e| io_error(&self.path, &e))
    }

    pub fn flush(&mut self) -> DownloadResult<()> {
        self.file.flush().map_err(|e| io_error(&self.path, &e))
    }

    pub fn len(&self) -> DownloadResult<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| io_error(&self.path, &e))?
            .len())
    }

    pub fn is_empty(&self) -> DownloadResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Apply a modification time to the file.
    pub fn set_modified(&self, mtime: std::time::SystemTime) -> DownloadResult<()> {
        self.file
            .set_modified(mtime)
            .map_err(|e| io_error(&self.path, &e))
    }

    /// Flush and close, surfacing any pending write-back error.
    pub fn close(mut self) -> DownloadResult<()> {
        self.file.flush().map_err(|e| io_error(&self.path, &e))?;
        self.file
            .sync_all()
            .map_err(|e| io_error(&self.path, &e))
    }

    /// Stream `other`'s content from its current position into this slot.
    pub fn copy_from(&mut self, other: &mut FileSlot) -> DownloadResult<u64> {
        let mut buf = [0u8; COPY_BUFSIZE];
        let mut copied = 0u64;
        loop {
            let n = other.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write_all(&buf[..n])?;
            copied += n as u64;
        }
        self.flush()?;
        Ok(copied)
    }

    /// Replace this slot's content with `other`'s entire content.
    ///
    /// Truncates to zero, copies from the start of `other`, truncates to the
    /// source length and rewinds both slots.
    pub fn replace_from(&mut self, other: &mut FileSlot) -> DownloadResult<()> {
        self.truncate(0)?;
        self.seek(SeekFrom::Start(0))?;
        other.seek(SeekFrom::Start(0))?;
        self.copy_from(other)?;
        let source_len = other.seek(SeekFrom::End(0))?;
        self.truncate(source_len)?;
        self.flush()?;
        self.seek(SeekFrom::Start(0))?;
        other.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl Drop for FileSlot {
    fn drop(&mut self) {
        if let Err(e) = self.file.flush() {
            tracing::error!("could not flush {} on close: {}", self.path.display(), e);
        }
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> DownloadError {
    DownloadError::serious(
        ErrorCode::Io,
        format!("i/o error for {}: {err}", path.display()),
    )
}
