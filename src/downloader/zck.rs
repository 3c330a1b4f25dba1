/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Zchunk reassembly coordination.
//!
//! The zchunk wire format itself stays external: an engine implementing
//! [`ZckEngine`] / [`ZckDownload`] parses headers, tracks the chunk map and
//! places chunk bytes. This module drives the five-state reassembly machine
//! on top of that contract, salvages headers and chunks from local `.zck`
//! files under the cache directory, and builds the range requests for
//! whatever is still missing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checksum::Checksum;
use crate::error::{DownloadError, DownloadResult, ErrorCode};
use crate::fileio::{FileSlot, OpenMode};
use crate::mirror::{Mirror, Protocol};

use super::target::Target;

/// Estimated multipart overhead per downloaded chunk, in bytes.
pub const CHUNK_MULTIPART_OVERHEAD: u64 = 92;

/// Fetching the header lead (when header size/hash are unknown up front) is
/// kept as a state but not wired to an actual fetch yet.
pub(crate) const HEADER_LEAD_FETCH_SUPPORTED: bool = false;

/// Substate of a zchunk target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZckState {
    /// Waiting to download the header lead (header size/hash unknown).
    HeaderLead,
    /// Waiting to check whether the header is available locally.
    HeaderCk,
    /// Waiting to download the header.
    Header,
    /// Waiting to check which chunks are available locally.
    BodyCk,
    /// Waiting for body chunks to be downloaded.
    Body,
    /// Fully downloaded.
    Finished,
}

/// What the header of the target file is expected to look like.
#[derive(Debug, Clone)]
pub struct ZckHeaderSpec {
    /// Known header size, when the caller learned it out of band.
    pub header_size: Option<u64>,
    /// Candidate header digests (tried in order).
    pub checksums: Vec<Checksum>,
}

/// Factory for per-target download contexts.
pub trait ZckEngine: Send + Sync {
    fn new_download(&self) -> Box<dyn ZckDownload>;
}

/// Narrow contract over an external zchunk implementation.
///
/// All file arguments are the slot of the reassembled target unless named
/// otherwise. Chunk-map queries are only meaningful once a header was parsed
/// (`has_context`).
pub trait ZckDownload: Send {
    /// Ingest header bytes arriving from a ranged fetch.
    fn write_header(&mut self, buf: &[u8], file: &mut FileSlot) -> DownloadResult<usize>;

    /// Parse and validate the downloaded header against `spec`.
    fn finish_header(&mut self, spec: &ZckHeaderSpec, file: &mut FileSlot) -> DownloadResult<()>;

    /// Adopt header and content from `other` when its header matches `spec`.
    ///
    /// On success the candidate's content has been copied into `file` and the
    /// handle holds a parsed context.
    fn adopt_header_from(
        &mut self,
        spec: &ZckHeaderSpec,
        other: &mut FileSlot,
        file: &mut FileSlot,
    ) -> DownloadResult<bool>;

    /// Whether a parsed header context is available.
    fn has_context(&self) -> bool;

    /// Ingest body bytes (a multipart range response) and place chunks.
    fn write_body(&mut self, buf: &[u8], file: &mut FileSlot) -> DownloadResult<usize>;

    /// Announce the byte ranges the next body fetch will cover.
    fn set_ranges(&mut self, ranges: &[(u64, u64)]) -> DownloadResult<()>;

    /// Reset per-fetch download state.
    fn reset(&mut self);

    fn missing_chunks(&self) -> usize;
    fn failed_chunks(&self) -> usize;
    fn reset_failed_chunks(&mut self);

    /// Re-scan `file`, marking chunks whose digests validate. Returns true
    /// when every chunk is valid.
    fn find_valid_chunks(&mut self, file: &mut FileSlot) -> DownloadResult<bool>;

    /// Copy any matching chunks from `src` into `file`; returns how many.
    fn copy_chunks_from(&mut self, src: &mut FileSlot, file: &mut FileSlot)
        -> DownloadResult<usize>;

    /// Byte ranges of at most `max_ranges` missing chunks.
    fn missing_ranges(&self, max_ranges: usize) -> Vec<(u64, u64)>;

    /// Compressed sizes of the chunks still missing.
    fn missing_comp_sizes(&self) -> Vec<u64>;

    /// Validate the digests of the fully reassembled file.
    fn validate_checksums(&mut self, file: &mut FileSlot) -> DownloadResult<bool>;

    /// Extract the reassembled file to `dest`.
    fn extract_to(&mut self, file: &mut FileSlot, dest: &Path) -> DownloadResult<()>;
}

/// Zchunk state carried by a [`crate::DownloadTarget`].
pub struct ZckTargetState {
    pub engine: Arc<dyn ZckEngine>,
    pub dl: Option<Box<dyn ZckDownload>>,
    /// Header size, when known up front.
    pub header_size: Option<u64>,
    /// Header checksum, when known up front.
    pub header_checksum: Option<Checksum>,
    pub total_to_download: u64,
    pub downloaded: u64,
}

impl ZckTargetState {
    pub fn new(engine: Arc<dyn ZckEngine>) -> Self {
        Self {
            engine,
            dl: None,
            header_size: None,
            header_checksum: None,
            total_to_download: 0,
            downloaded: 0,
        }
    }

    pub fn with_header(mut self, size: u64, checksum: Checksum) -> Self {
        self.header_size = Some(size);
        self.header_checksum = Some(checksum);
        self
    }

    /// The header expectation: the dedicated header checksum when known,
    /// otherwise the target's full-file checksums as candidates.
    pub(crate) fn header_spec(&self, target_checksums: &[Checksum]) -> ZckHeaderSpec {
        let checksums = match &self.header_checksum {
            Some(c) => vec![c.clone()],
            None => target_checksums.to_vec(),
        };
        ZckHeaderSpec {
            header_size: self.header_size,
            checksums,
        }
    }
}

/// Render ranges as a `Range` header payload: `a-b,c-d`.
pub fn range_string(ranges: &[(u64, u64)]) -> String {
    ranges
        .iter()
        .map(|(start, end)| format!("{start}-{end}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Recursively collect `.zck` files under `dir`.
fn zck_cache_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".zck"))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

fn zck_error(reason: impl Into<String>) -> DownloadError {
    DownloadError::serious(ErrorCode::Zchunk, reason)
}

/// Run the pre-transfer zchunk check and advance the substate.
///
/// Decides what the next fetch must cover: nothing (finished), the header, or
/// a batch of missing body chunks. When the mirror cannot serve ranges the
/// target falls back to a whole-file fetch.
pub(crate) fn check_zck(
    target: &mut Target,
    mirror: Option<&Mirror>,
    cache_dir: &Path,
) -> DownloadResult<()> {
    if let Some(mirror) = mirror {
        if mirror.stats.max_ranges == 0 || mirror.protocol() != Protocol::Http {
            tracing::info!("zck: mirror {} does not support ranged reassembly", mirror.url());
            target.zck_state = ZckState::Body;
            target.zck_fallback = true;
            target.target.expected_size = target.target.orig_size;
            target.target.range.clear();
            return Ok(());
        }
    }
    target.zck_fallback = false;
    // Ranged reassembly drives its own offsets; resume does not apply.
    target.resume = false;
    target.target.resume = false;

    let dl_missing = target
        .target
        .zck
        .as_ref()
        .is_some_and(|zck| zck.dl.is_none());
    if dl_missing {
        let header_known = {
            let zck = require_zck_mut(target)?;
            zck.dl = Some(zck.engine.new_download());
            zck.header_size.is_some()
        };
        target.zck_state = if header_known {
            ZckState::HeaderCk
        } else {
            ZckState::HeaderLead
        };
    }

    target.range_fail = false;

    if target.zck_state == ZckState::Finished {
        return Ok(());
    }

    if target.zck_state == ZckState::HeaderLead && !HEADER_LEAD_FETCH_SUPPORTED {
        tracing::error!(
            "zck: downloading {} without a known header size, probing local files instead",
            target.target.path
        );
        target.zck_state = ZckState::HeaderCk;
    }

    if target.zck_state == ZckState::HeaderCk {
        find_local_zck_header(target, cache_dir)?;
    }

    if target.zck_state == ZckState::Header {
        prepare_zck_header(target)?;
        if target.zck_state == ZckState::Header {
            return Ok(());
        }
    }

    if target.zck_state == ZckState::BodyCk {
        check_zck_body(target, cache_dir)?;
        if target.zck_state == ZckState::Finished {
            return Ok(());
        }
    }

    prepare_zck_body(target, mirror)
}

/// Satisfy the header from any `.zck` file under the cache directory.
fn find_local_zck_header(target: &mut Target, cache_dir: &Path) -> DownloadResult<()> {
    let own_path = target.target.filename.clone();
    let spec = {
        let zck = require_zck(target)?;
        zck.header_spec(&target.target.checksums)
    };

    if cache_dir.exists() {
        for candidate in zck_cache_files(cache_dir) {
            if candidate == own_path {
                continue;
            }
            let Ok(mut other) = FileSlot::open(&candidate, OpenMode::Read) else {
                tracing::warn!("zck: unable to open {}", candidate.display());
                continue;
            };
            let (zck, outfile) = split_zck_outfile(target)?;
            let dl = zck
                .dl
                .as_mut()
                .ok_or_else(|| zck_error("zchunk download context missing"))?;
            match dl.adopt_header_from(&spec, &mut other, outfile) {
                Ok(true) => {
                    tracing::info!(
                        "zck: found file with matching header at {}",
                        candidate.display()
                    );
                    target.zck_state = ZckState::BodyCk;
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => tracing::debug!("zck: no valid header in {}: {e}", candidate.display()),
            }
        }
    } else {
        tracing::info!("zck: no cache directory set");
    }

    target.zck_state = ZckState::Header;
    Ok(())
}

/// Prepare the ranged header fetch (or adopt an already-valid local header).
fn prepare_zck_header(target: &mut Target) -> DownloadResult<()> {
    {
        let spec = {
            let zck = require_zck(target)?;
            zck.header_spec(&target.target.checksums)
        };
        let (zck, outfile) = split_zck_outfile(target)?;
        let dl = zck
            .dl
            .as_mut()
            .ok_or_else(|| zck_error("zchunk download context missing"))?;

        // A resumed file may already carry the full header.
        if !outfile.is_empty()? && dl.finish_header(&spec, outfile).is_ok() {
            target.zck_state = ZckState::BodyCk;
            return Ok(());
        }
    }

    let header_size = {
        let zck = require_zck(target)?;
        zck.header_size
            .ok_or_else(|| zck_error("zchunk header size unknown"))?
    };

    target.target.range = format!("0-{}", header_size.saturating_sub(1));
    target.zck_range_count = 1;
    {
        let zck = require_zck_mut(target)?;
        zck.total_to_download = header_size;
    }
    target.zck_state = ZckState::Header;

    // Remove stale bytes so the header lands at offset zero.
    let (_, outfile) = split_zck_outfile(target)?;
    outfile.truncate(0)?;
    outfile.seek(std::io::SeekFrom::Start(0))?;
    tracing::info!("zck: header download prepared ({} bytes)", header_size);
    Ok(())
}

/// Check chunk validity, salvage chunks from the cache, update accounting.
fn check_zck_body(target: &mut Target, cache_dir: &Path) -> DownloadResult<()> {
    let all_good = {
        let (zck, outfile) = split_zck_outfile(target)?;
        let dl = zck
            .dl
            .as_mut()
            .ok_or_else(|| zck_error("zchunk download context missing"))?;

        tracing::info!("zck: checking data checksums of {}", outfile.path().display());
        let good = dl.find_valid_chunks(outfile)?;
        if !good {
            dl.reset_failed_chunks();
        }
        good
    };
    if all_good {
        target.zck_state = ZckState::Finished;
        return Ok(());
    }

    find_local_zck_chunks(target, cache_dir)?;

    let complete = {
        let (zck, outfile) = split_zck_outfile(target)?;
        let dl = zck
            .dl
            .as_mut()
            .ok_or_else(|| zck_error("zchunk download context missing"))?;
        let complete = dl.find_valid_chunks(outfile)?;
        if !complete {
            let missing_cost: u64 = dl
                .missing_comp_sizes()
                .iter()
                .map(|size| size + CHUNK_MULTIPART_OVERHEAD)
                .sum();
            zck.total_to_download += missing_cost;
            zck.downloaded = zck.total_to_download - missing_cost;
        }
        complete
    };
    target.zck_state = if complete {
        ZckState::Finished
    } else {
        ZckState::Body
    };
    Ok(())
}

/// Pull chunks out of local `.zck` files under the cache directory.
fn find_local_zck_chunks(target: &mut Target, cache_dir: &Path) -> DownloadResult<()> {
    if !cache_dir.exists() {
        return Ok(());
    }
    let own_path = target.target.filename.clone();
    for candidate in zck_cache_files(cache_dir) {
        if candidate == own_path {
            continue;
        }
        let Ok(mut other) = FileSlot::open(&candidate, OpenMode::Read) else {
            tracing::warn!("zck: unable to open {}", candidate.display());
            continue;
        };
        let (zck, outfile) = split_zck_outfile(target)?;
        let dl = zck
            .dl
            .as_mut()
            .ok_or_else(|| zck_error("zchunk download context missing"))?;
        match dl.copy_chunks_from(&mut other, outfile) {
            Ok(copied) if copied > 0 => {
                tracing::info!("zck: copied {copied} chunks from {}", candidate.display());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("zck: error copying chunks from {}: {e}", candidate.display()),
        }
    }
    Ok(())
}

/// Build the range request for at most `max_ranges` missing chunks.
fn prepare_zck_body(target: &mut Target, mirror: Option<&Mirror>) -> DownloadResult<()> {
    let max_ranges = mirror.map_or(usize::MAX, |m| m.stats.max_ranges as usize);

    let ranges = {
        let (zck, _) = split_zck_outfile(target)?;
        let dl = zck
            .dl
            .as_mut()
            .ok_or_else(|| zck_error("zchunk download context missing"))?;

        dl.reset_failed_chunks();
        if dl.missing_chunks() == 0 {
            None
        } else {
            tracing::info!(
                "zck: {} chunks still need to be downloaded",
                dl.missing_chunks()
            );
            dl.reset();
            let ranges = dl.missing_ranges(max_ranges);
            dl.set_ranges(&ranges)?;
            Some(ranges)
        }
    };

    match ranges {
        None => target.zck_state = ZckState::Finished,
        Some(ranges) => {
            target.target.range = range_string(&ranges);
            target.zck_range_count = ranges.len() as u32;
            target.zck_state = ZckState::Body;
        }
    }
    Ok(())
}

/// Advance the substate after a successful fetch completed.
pub(crate) fn finish_zck_transfer(
    target: &mut Target,
    mirror: Option<&Mirror>,
) -> DownloadResult<()> {
    // Direct-URL fetches (no mirror) are assumed range-capable, matching the
    // pre-transfer check.
    let ranged_mirror =
        mirror.map_or(true, |m| m.stats.max_ranges > 0 && m.protocol() == Protocol::Http);

    match target.zck_state {
        ZckState::HeaderLead => {
            // Lead fetches are gated off; nothing to read back yet.
        }
        ZckState::Header => {
            if ranged_mirror {
                let spec = {
                    let zck = require_zck(target)?;
                    zck.header_spec(&target.target.checksums)
                };
                let (zck, outfile) = split_zck_outfile(target)?;
                let dl = zck
                    .dl
                    .as_mut()
                    .ok_or_else(|| zck_error("zchunk download context missing"))?;
                dl.finish_header(&spec, outfile)?;
                target.zck_state = ZckState::BodyCk;
            }
        }
        ZckState::Body => {
            if ranged_mirror {
                let (zck, _) = split_zck_outfile(target)?;
                let dl = zck
                    .dl
                    .as_mut()
                    .ok_or_else(|| zck_error("zchunk download context missing"))?;
                if dl.failed_chunks() == 0 && dl.missing_chunks() == 0 {
                    target.zck_state = ZckState::Finished;
                }
            } else {
                target.zck_state = ZckState::Finished;
            }
        }
        _ => {}
    }

    if target.zck_state == ZckState::Finished {
        let (zck, outfile) = split_zck_outfile(target)?;
        // Whole-file fallbacks never built a download context; validation
        // works on a fresh one.
        let engine = Arc::clone(&zck.engine);
        let dl = zck.dl.get_or_insert_with(|| engine.new_download());
        if !dl.validate_checksums(outfile)? {
            return Err(DownloadError::serious(
                ErrorCode::BadChecksum,
                format!(
                    "at least one of the zchunk checksums doesn't match in {}",
                    target.target.path
                ),
            ));
        }
    }
    Ok(())
}

fn require_zck<'t>(target: &'t Target) -> DownloadResult<&'t ZckTargetState> {
    target
        .target
        .zck
        .as_ref()
        .ok_or_else(|| zck_error("zchunk target has no engine state"))
}

fn require_zck_mut<'t>(target: &'t mut Target) -> DownloadResult<&'t mut ZckTargetState> {
    target
        .target
        .zck
        .as_mut()
        .ok_or_else(|| zck_error("zchunk target has no engine state"))
}

/// Split-borrow the zchunk state and the open output slot.
fn split_zck_outfile<'t>(
    target: &'t mut Target,
) -> DownloadResult<(&'t mut ZckTargetState, &'t mut FileSlot)> {
    let dl_target = &mut target.target;
    let zck = dl_target
        .zck
        .as_mut()
        .ok_or_else(|| zck_error("zchunk target has no engine state"))?;
    let outfile = dl_target
        .outfile
        .as_mut()
        .ok_or_else(|| zck_error("zchunk target has no open output file"))?;
    Ok((zck, outfile))
}


#[cfg(test)]
mod tests {
    use super::mock::MockZckEngine;
    use super::*;
    use crate::target::DownloadTarget;
    use tempfile::tempdir;

    fn mock_content() -> Vec<u8> {
        // 8-byte header + 4 chunks of 8 bytes
        let mut content = b"HEADER!!".to_vec();
        for chunk in [b"chunk-00", b"chunk-01", b"chunk-02", b"chunk-03"] {
            content.extend_from_slice(chunk);
        }
        content
    }

    fn make_target(dir: &tempfile::TempDir, engine: &Arc<MockZckEngine>) -> Target {
        let state = ZckTargetState::new(Arc::new(Arc::clone(engine)))
            .with_header(8, engine.header_checksum());
        let dl_target = DownloadTarget::new("data.zck", "", dir.path().join("data.zck"))
            .with_zck(state);
        let mut target = Target::new(dl_target, Vec::new());
        target.open_target_file().unwrap();
        target
    }

    #[test]
    fn test_range_string() {
        assert_eq!(range_string(&[(0, 9), (20, 29)]), "0-9,20-29");
        assert_eq!(range_string(&[]), "");
    }

    #[test]
    fn test_cache_scan_recursive() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("a.zck"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/deeper/b.zck"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/not-zck.tar"), b"x").unwrap();

        let files = zck_cache_files(dir.path());
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_header_fetch_prepared_when_cache_empty() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();

        let engine = Arc::new(MockZckEngine::new(mock_content(), 8, 8));
        let mut target = make_target(&dir, &engine);

        check_zck(&mut target, None, &cache).unwrap();
        assert_eq!(target.zck_state, ZckState::Header);
        assert_eq!(target.target.range, "0-7");
        assert!(!target.target.resume);
        assert_eq!(target.target.zck.as_ref().unwrap().total_to_download, 8);
    }

    #[test]
    fn test_header_salvage_from_cache() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        // a different .zck in the cache shares the header
        std::fs::write(cache.join("other.zck"), mock_content()).unwrap();

        let engine = Arc::new(MockZckEngine::new(mock_content(), 8, 8));
        let mut target = make_target(&dir, &engine);

        check_zck(&mut target, None, &cache).unwrap();
        // header and all chunks salvaged: straight to finished
        assert_eq!(target.zck_state, ZckState::Finished);
    }

    #[test]
    fn test_partial_salvage_requests_missing_ranges() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();

        // cache holds header + chunks 0 and 2; chunks 1 and 3 corrupted
        let mut partial = mock_content();
        partial[16..24].fill(0); // chunk 1
        partial[32..40].fill(0); // chunk 3
        std::fs::write(cache.join("partial.zck"), &partial).unwrap();

        let engine = Arc::new(MockZckEngine::new(mock_content(), 8, 8));
        let mut target = make_target(&dir, &engine);

        check_zck(&mut target, None, &cache).unwrap();
        assert_eq!(target.zck_state, ZckState::Body);
        // ranges for chunks 1 (bytes 16-23) and 3 (bytes 32-39)
        assert_eq!(target.target.range, "16-23,32-39");
        let zck = target.target.zck.as_ref().unwrap();
        assert_eq!(zck.total_to_download, 2 * (8 + CHUNK_MULTIPART_OVERHEAD));
        assert_eq!(zck.downloaded, 0);
    }

    #[test]
    fn test_finish_body_validates_checksums() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("full.zck"), mock_content()).unwrap();

        let engine = Arc::new(MockZckEngine::new(mock_content(), 8, 8));
        let mut target = make_target(&dir, &engine);

        check_zck(&mut target, None, &cache).unwrap();
        assert_eq!(target.zck_state, ZckState::Finished);
        finish_zck_transfer(&mut target, None).unwrap();
        assert_eq!(target.zck_state, ZckState::Finished);
    }

    #[test]
    fn test_fallback_when_mirror_has_no_ranges() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();

        let engine = Arc::new(MockZckEngine::new(mock_content(), 8, 8));
        let mut target = make_target(&dir, &engine);
        target.target.orig_size = 40;
        target.target.range = "0-7".into();

        let mut mirror = crate::mirror::Mirror::http("https://a");
        mirror.change_max_ranges(0);

        check_zck(&mut target, Some(&mirror), &cache).unwrap();
        assert_eq!(target.zck_state, ZckState::Body);
        assert!(target.zck_fallback);
        assert_eq!(target.target.expected_size, 40);
        assert!(target.target.range.is_empty());

        // a whole-file fetch completes the fallback immediately
        finish_zck_transfer(&mut target, Some(&mirror)).unwrap_err();
        // (the empty file fails validation: nothing was downloaded)
    }
}
