/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 */

//! Streaming file checksums (SHA-256, SHA-1, MD5) with hex encoding.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{DownloadError, DownloadResult, ErrorCode};

const HASH_BUFSIZE: usize = 64 * 1024;

/// Supported checksum kinds, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumKind {
    Sha256,
    Sha1,
    Md5,
}

impl ChecksumKind {
    /// Verification preference order.
    pub const PREFERENCE: [ChecksumKind; 3] =
        [ChecksumKind::Sha256, ChecksumKind::Sha1, ChecksumKind::Md5];
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Sha256 => write!(f, "sha256"),
            ChecksumKind::Sha1 => write!(f, "sha1"),
            ChecksumKind::Md5 => write!(f, "md5"),
        }
    }
}

/// An expected digest for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub kind: ChecksumKind,
    pub hex: String,
}

impl Checksum {
    pub fn new(kind: ChecksumKind, hex: impl Into<String>) -> Self {
        Self {
            kind,
            hex: hex.into().to_lowercase(),
        }
    }
}

fn hash_reader<D: Digest>(mut reader: impl Read) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; HASH_BUFSIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file on disk, streaming it through the requested digest.
pub fn hash_file(path: &Path, kind: ChecksumKind) -> DownloadResult<String> {
    let file = File::open(path).map_err(|e| {
        DownloadError::serious(
            ErrorCode::File,
            format!("cannot open {} for hashing: {e}", path.display()),
        )
    })?;
    let result = match kind {
        ChecksumKind::Sha256 => hash_reader::<Sha256>(file),
        ChecksumKind::Sha1 => hash_reader::<Sha1>(file),
        ChecksumKind::Md5 => hash_reader::<Md5>(file),
    };
    result.map_err(|e| {
        DownloadError::serious(
            ErrorCode::Io,
            format!("error reading {} for hashing: {e}", path.display()),
        )
    })
}

/// Validate a file against the strongest provided checksum kind.
///
/// Tries SHA-256, then SHA-1, then MD5. Returns `Ok(true)` when the first
/// available kind matches, `Ok(false)` on mismatch and an error when the list
/// is empty or the file cannot be read.
pub fn validate_checksum(path: &Path, checksums: &[Checksum]) -> DownloadResult<bool> {
    for kind in ChecksumKind::PREFERENCE {
        let Some(expected) = checksums.iter().find(|c| c.kind == kind) else {
            continue;
        };
        let actual = hash_file(path, kind)?;
        if actual == expected.hex {
            return Ok(true);
        }
        tracing::warn!(
            "{} sum of {} is wrong: is {}, should be {}",
            kind,
            path.display(),
            actual,
            expected.hex
        );
        return Ok(false);
    }
    Err(DownloadError::serious(
        ErrorCode::UnknownChecksum,
        format!("no usable checksum provided for {}", path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn test_sha256_known_vector() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "empty", b"");
        assert_eq!(
            hash_file(&path, ChecksumKind::Sha256).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha1_and_md5_known_vectors() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "abc", b"abc");
        assert_eq!(
            hash_file(&path, ChecksumKind::Sha1).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hash_file(&path, ChecksumKind::Md5).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_validate_prefers_strongest() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "data", b"abc");
        // Correct sha256, bogus md5: sha256 wins, so validation passes.
        let checksums = vec![
            Checksum::new(ChecksumKind::Md5, "00000000000000000000000000000000"),
            Checksum::new(
                ChecksumKind::Sha256,
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            ),
        ];
        assert!(validate_checksum(&path, &checksums).unwrap());
    }

    #[test]
    fn test_validate_mismatch() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "data", b"abc");
        let checksums = vec![Checksum::new(ChecksumKind::Sha256, "ff".repeat(32))];
        assert!(!validate_checksum(&path, &checksums).unwrap());
    }

    #[test]
    fn test_validate_empty_list_errors() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "data", b"abc");
        let err = validate_checksum(&path, &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownChecksum);
    }

    #[test]
    fn test_checksum_hex_lowercased() {
        let c = Checksum::new(ChecksumKind::Sha256, "ABCDEF");
        assert_eq!(c.hex, "abcdef");
    }
}
