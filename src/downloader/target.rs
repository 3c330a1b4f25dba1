/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Per-file download lifecycle.
//!
//! A [`Target`] wraps one [`DownloadTarget`] with everything the scheduler
//! tracks per attempt: the current mirror, the set of tried mirrors, resume
//! offsets, the zchunk substate, and the last response. State transitions are
//! always driven by the scheduler.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::PathBuf;

use crate::context::Context;
use crate::error::{DownloadError, DownloadResult, ErrorCode};
use crate::fileio::{part_path, FileSlot, OpenMode};
use crate::mirror::{Mirror, MirrorId, Protocol};
use crate::target::{CbReturnCode, DownloadTarget, TransferResponse, TransferStatus};
use crate::transfer::{RangeWindow, TransferJob, TransferSink};

use super::zck::{self, ZckState};

/// Lifecycle state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Waiting to be processed.
    Waiting,
    /// A preparation request (e.g. for auth) is running.
    Preparation,
    /// The transfer is running.
    Running,
    /// Finished successfully.
    Finished,
    /// Finished without success.
    Failed,
}

/// Scheduler-side state for one download.
pub struct Target {
    pub target: DownloadTarget,

    pub state: DownloadState,
    /// Mirror serving the current attempt.
    pub mirror: Option<MirrorId>,
    /// Candidate mirrors, in preference order.
    pub mirrors: Vec<MirrorId>,
    /// Mirrors already tried for this target.
    pub tried_mirrors: HashSet<MirrorId>,
    pub retries: u32,

    pub(crate) resume: bool,
    pub(crate) resume_count: u32,
    /// Offset the current attempt started from; -1 until determined.
    pub(crate) original_offset: i64,

    pub(crate) temp_file: PathBuf,
    pub(crate) protocol: Protocol,

    /// The server ignored a ranged request (zchunk only).
    pub(crate) range_fail: bool,
    pub(crate) zck_state: ZckState,
    /// Mirror cannot serve ranges; fetch the whole file instead.
    pub(crate) zck_fallback: bool,
    /// Number of ranges in the last zchunk body request.
    pub(crate) zck_range_count: u32,

    /// Response of the last finished transfer.
    pub(crate) response: TransferResponse,
}

impl Target {
    pub fn new(target: DownloadTarget, mirrors: Vec<MirrorId>) -> Self {
        let temp_file = part_path(&target.filename);
        let resume = target.resume;
        Self {
            target,
            state: DownloadState::Waiting,
            mirror: None,
            mirrors,
            tried_mirrors: HashSet::new(),
            retries: 0,
            resume,
            resume_count: 0,
            original_offset: -1,
            temp_file,
            protocol: Protocol::Http,
            range_fail: false,
            zck_state: ZckState::HeaderLead,
            zck_fallback: false,
            zck_range_count: 0,
            response: TransferResponse::default(),
        }
    }

    fn zck_running(&self) -> bool {
        self.target.is_zchunk && self.target.zck.is_some() && self.zck_state != ZckState::Finished
    }

    /// Open the `.pdpart` slot next to the destination.
    pub(crate) fn open_target_file(&mut self) -> DownloadResult<()> {
        let temp = part_path(&self.target.filename);
        if let Some(parent) = temp.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DownloadError::fatal(
                        ErrorCode::CannotCreateDir,
                        format!("cannot create {}: {e}", parent.display()),
                    )
                })?;
            }
        }
        tracing::info!("opening file {}", temp.display());

        let open_mode = if temp.exists() && self.resume {
            OpenMode::AppendUpdate
        } else {
            OpenMode::WriteUpdate
        };
        let slot = FileSlot::open(&temp, open_mode).map_err(|e| {
            DownloadError::fatal(ErrorCode::CannotCreateTmp, e.reason)
        })?;
        self.temp_file = temp;
        self.target.outfile = Some(slot);
        Ok(())
    }

    /// Close the output slot (kept open while zchunk reassembly continues).
    pub(crate) fn reset(&mut self) {
        if self.zck_running() {
            return;
        }
        if let Some(slot) = self.target.outfile.take() {
            if let Err(e) = slot.close() {
                tracing::error!("could not close file: {e}");
            }
        }
    }

    /// Truncate the partial file back to the offset this attempt started
    /// from, removing downloaded garbage (error pages etc.).
    pub(crate) fn truncate_transfer_file(&mut self) -> DownloadResult<()> {
        let offset = if self.original_offset >= 0 {
            self.original_offset as u64
        } else {
            0
        };
        if let Some(slot) = self.target.outfile.as_mut() {
            slot.truncate(offset)?;
            slot.seek(SeekFrom::Start(offset))?;
        }
        Ok(())
    }

    /// Finalize the on-disk file for a terminal status: rename into place on
    /// success, delete the partial on error.
    fn reset_file(&mut self, status: TransferStatus, ctx: &Context) {
        match status {
            TransferStatus::Successful => {
                self.reset();
                if let Err(e) = std::fs::rename(&self.temp_file, &self.target.filename) {
                    tracing::error!(
                        "could not rename {} to {}: {e}",
                        self.temp_file.display(),
                        self.target.filename.display()
                    );
                    return;
                }
                if ctx.preserve_filetime {
                    if let Some(filetime) = self.response.filetime {
                        match std::fs::File::options().write(true).open(&self.target.filename) {
                            Ok(file) => {
                                if let Err(e) = file.set_modified(filetime) {
                                    tracing::debug!("unable to set file time: {e}");
                                }
                            }
                            Err(e) => tracing::debug!("unable to reopen for file time: {e}"),
                        }
                    } else {
                        tracing::debug!("unable to get remote time of retrieved document");
                    }
                }
            }
            TransferStatus::AlreadyExists => {
                self.reset();
            }
            TransferStatus::Error => {
                self.reset();
                if self.temp_file.exists() {
                    tracing::error!("removing file {}", self.temp_file.display());
                    if let Err(e) = std::fs::remove_file(&self.temp_file) {
                        tracing::error!("could not remove {}: {e}", self.temp_file.display());
                    }
                }
            }
        }
    }

    /// Finalize the file and fire the end callback (exactly once per
    /// terminal state).
    pub(crate) fn call_end_callback(&mut self, status: TransferStatus, ctx: &Context) -> CbReturnCode {
        self.reset_file(status, ctx);

        let rc = match self.target.end_callback.as_mut() {
            Some(cb) => cb(status, &self.response),
            None => CbReturnCode::Ok,
        };
        if rc == CbReturnCode::Error {
            tracing::error!("end-callback returned an error");
        }
        rc
    }

    pub(crate) fn set_failed(&mut self, error: DownloadError, ctx: &Context) -> CbReturnCode {
        error.log();
        self.state = DownloadState::Failed;
        self.target.set_error(error);
        self.call_end_callback(TransferStatus::Error, ctx)
    }

    /// Shortcut for destinations that already exist with a valid checksum.
    pub(crate) fn check_if_already_finished(&mut self, ctx: &Context) -> bool {
        if self.target.already_downloaded() {
            tracing::info!("found already downloaded file {}", self.target.filename.display());
            self.call_end_callback(TransferStatus::AlreadyExists, ctx);
            self.state = DownloadState::Finished;
            return true;
        }
        false
    }

    /// Put the target back into the waiting queue after a retriable error.
    pub(crate) fn set_retrying(&mut self) -> DownloadResult<()> {
        self.state = DownloadState::Waiting;
        self.retries += 1;

        if !self.target.is_zchunk || self.zck_state == ZckState::Header {
            self.truncate_transfer_file()?;
        }
        Ok(())
    }

    /// Non-fatal error but the mirror serves others fine: it may simply
    /// accept fewer parallel connections.
    pub(crate) fn can_retry_transfer_with_fewer_connections(&self, mirror: &Mirror) -> bool {
        mirror.has_running_transfers()
            || (mirror.stats.successful_transfers > 0
                && mirror.stats.failed_transfers < mirror.stats.max_tried_parallel_connections)
    }

    /// Reduce the mirror's connection cap and give it another chance.
    pub(crate) fn lower_mirror_parallel_connections(&mut self, mirror: &mut Mirror) {
        let reduced = if mirror.has_running_transfers() {
            i64::from(mirror.stats.running_transfers)
        } else {
            1
        };
        mirror.set_allowed_parallel_connections(reduced);
        self.tried_mirrors.remove(mirror.id());
    }

    fn check_filesize(&self) -> DownloadResult<()> {
        if self.target.expected_size == 0 {
            return Ok(());
        }
        let actual = std::fs::metadata(&self.temp_file)
            .map(|m| m.len())
            .map_err(|e| {
                DownloadError::serious(
                    ErrorCode::File,
                    format!("cannot stat {}: {e}", self.temp_file.display()),
                )
            })?;
        if actual != self.target.expected_size {
            return Err(DownloadError::serious(
                ErrorCode::BadChecksum,
                format!(
                    "filesize of {} ({actual}) does not match expected filesize ({})",
                    self.temp_file.display(),
                    self.target.expected_size
                ),
            ));
        }
        Ok(())
    }

    fn check_checksums(&self, ctx: &Context) -> DownloadResult<()> {
        if !ctx.validate_checksum || self.target.checksums.is_empty() {
            return Ok(());
        }
        if !self.target.validate_checksum(&self.temp_file)? {
            return Err(DownloadError::serious(
                ErrorCode::BadChecksum,
                "result file does not have expected checksum",
            ));
        }
        Ok(())
    }

    /// Verify a successful transfer: zchunk substate advance + final
    /// validation, or size/hash checks for plain targets.
    ///
    /// On error the partial file has already been removed.
    pub(crate) fn finish_transfer(
        &mut self,
        mirror: Option<&Mirror>,
        ctx: &Context,
    ) -> DownloadResult<()> {
        if self.target.is_zchunk && self.target.zck.is_some() {
            return zck::finish_zck_transfer(self, mirror);
        }

        if self.target.outfile.is_some() {
            let result = self.check_filesize().and_then(|()| self.check_checksums(ctx));
            if let Err(e) = result {
                self.reset_file(TransferStatus::Error, ctx);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Advance the target after a successful transfer: either queue the next
    /// zchunk step or finish, rename and fire the end callback.
    pub(crate) fn finalize_transfer(
        &mut self,
        effective_url: Option<String>,
        ctx: &Context,
    ) -> DownloadResult<()> {
        if self.zck_running() {
            // More zchunk substates to fetch: back to the waiting queue, and
            // the same mirror may serve the next step.
            self.state = DownloadState::Waiting;
            self.original_offset = -1;
            if let Some(mirror) = &self.mirror {
                self.tried_mirrors.remove(mirror);
            }
        } else {
            if self.state == DownloadState::Running {
                self.state = DownloadState::Finished;
            } else if self.state == DownloadState::Preparation {
                self.state = DownloadState::Waiting;
            }

            if self.state == DownloadState::Finished {
                let rc = self.call_end_callback(TransferStatus::Successful, ctx);
                if rc == CbReturnCode::Error {
                    return Err(DownloadError::fatal(
                        ErrorCode::CallbackInterrupted,
                        "interrupted by error from end callback",
                    ));
                }
            }
        }

        if let Some(mirror) = &self.mirror {
            self.target.used_mirror = Some(mirror.clone());
        }
        self.target.effective_url = effective_url;
        Ok(())
    }

    /// Configure the next fetch for this target.
    ///
    /// Mirrors the original handle preparation: open (or keep) the partial
    /// file, work out resume/range behavior, collect headers, and build the
    /// job the transfer layer executes. Returns `None` when the target
    /// completed without needing a fetch (zchunk satisfied locally).
    pub(crate) fn prepare_transfer(
        &mut self,
        index: usize,
        full_url: &str,
        mirror: Option<&Mirror>,
        ctx: &Context,
    ) -> DownloadResult<Option<TransferJob>> {
        self.target.check_transfer_constraints()?;
        self.protocol = Protocol::detect(full_url);

        let zck_active = self.target.is_zchunk && self.target.zck.is_some();
        if !zck_active {
            self.open_target_file()?;
        } else {
            if self.target.outfile.is_none() {
                tracing::info!("zck: opening file {}", self.temp_file.display());
                self.open_target_file()?;
            }
            zck::check_zck(self, mirror, &ctx.cache_dir).map_err(|e| {
                DownloadError::new(
                    e.level,
                    ErrorCode::Zchunk,
                    format!("unable to initialize zchunk file: {}", e.reason),
                )
            })?;

            if self.zck_state == ZckState::Finished {
                tracing::info!("target fully downloaded: {}", self.target.path);
                self.state = DownloadState::Finished;
                self.call_end_callback(TransferStatus::Successful, ctx);
                return Ok(None);
            }
        }

        if self.resume && self.resume_count >= ctx.max_resume_count {
            self.resume = false;
            tracing::info!("download resume ignored, maximal number of attempts has been reached");
        }

        let mut resume_from = None;
        if self.resume {
            self.resume_count += 1;
            if self.original_offset == -1 {
                let offset = match self.target.outfile.as_mut() {
                    Some(slot) => slot.seek(SeekFrom::End(0)).map(|n| n as i64).unwrap_or(0),
                    None => 0,
                };
                self.original_offset = offset;
            }
            tracing::info!("trying to resume from offset {}", self.original_offset);
            resume_from = Some(self.original_offset.max(0) as u64);
        } else if self.target.byterange_start > 0 {
            resume_from = Some(self.target.byterange_start);
        }

        let range = if resume_from.is_none() && !self.target.range.is_empty() {
            Some(self.target.range.clone())
        } else {
            None
        };

        // Collected request headers: mirror auth, caller extras, caching.
        let mut headers = Vec::new();
        let mut basic_auth = None;
        if let Some(mirror) = mirror {
            headers.extend(mirror.auth_headers(&self.target.path)?);
            basic_auth = mirror.credentials();
        }
        for raw in &ctx.additional_httpheaders {
            if let Some((key, value)) = raw.split_once(':') {
                headers.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        if self.target.no_cache {
            headers.push(("Cache-Control".to_string(), "no-cache".to_string()));
            headers.push(("Pragma".to_string(), "no-cache".to_string()));
        } else {
            headers.extend(self.target.cache_headers());
        }

        let use_zck_sink =
            zck_active && !self.zck_fallback && !self.range_fail && self.protocol == Protocol::Http;
        let sink = if use_zck_sink {
            TransferSink::Zck {
                state: self.zck_state,
            }
        } else if self.target.byterange_start > 0 || self.target.byterange_end > 0 {
            let base_offset = if self.target.byterange_start > 0 {
                self.target.byterange_start
            } else {
                self.original_offset.max(0) as u64
            };
            TransferSink::Plain {
                window: Some(RangeWindow::new(
                    self.target.byterange_start,
                    self.target.byterange_end,
                    base_offset,
                )),
            }
        } else {
            TransferSink::Plain { window: None }
        };

        let (progress_total, progress_offset) = match &self.target.zck {
            Some(zck) if use_zck_sink => (zck.total_to_download, zck.downloaded),
            _ => (self.target.expected_size, 0),
        };

        let expected_size = if use_zck_sink { 0 } else { self.target.expected_size };

        let job = TransferJob {
            index,
            url: full_url.to_string(),
            headers,
            basic_auth,
            resume_from,
            range,
            range_count: self.zck_range_count,
            expected_size,
            sink,
            outfile: self.target.outfile.take(),
            zck_dl: self.target.zck.as_mut().and_then(|z| z.dl.take()),
            progress: self.target.progress_callback.clone(),
            progress_total,
            progress_offset,
            stall_timeout: ctx.low_speed_time,
            max_speed_limit: ctx.max_speed_limit,
            buffersize: ctx.transfer_buffersize,
        };

        self.state = DownloadState::Running;
        Ok(Some(job))
    }

    /// Hand the moved-out file slot and zchunk handle back to the target.
    pub(crate) fn restore_io(
        &mut self,
        outfile: Option<FileSlot>,
        zck_dl: Option<Box<dyn zck::ZckDownload>>,
    ) {
        if let Some(slot) = outfile {
            self.target.outfile = Some(slot);
        }
        if let Some(dl) = zck_dl {
            if let Some(zck) = self.target.zck.as_mut() {
                zck.dl = Some(dl);
            }
        }
    }
}
