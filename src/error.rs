/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Error taxonomy shared by the scheduler, mirrors and transfers.

use std::fmt;
use thiserror::Error;

/// Severity of a download error.
///
/// Transient errors are recovered by rotating mirrors, serious errors
/// additionally penalize the mirror that produced them, and fatal errors
/// terminate the target (and the whole run when failfast is on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorLevel {
    Transient,
    Serious,
    Fatal,
}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bad function argument (programmer error).
    BadFuncArg,
    /// Bad argument for an option (programmer error).
    BadOptArg,
    /// Unknown option (programmer error).
    UnknownOption,
    /// The HTTP client reported an error.
    Transport,
    /// HTTP/FTP status code outside the 2xx range.
    BadStatus,
    /// Temporary server-side condition (5xx, timeout); next try may work.
    Temporary,
    /// A non-local URL was requested in offline mode.
    NotLocal,
    /// Could not create a directory in the output path.
    CannotCreateDir,
    /// Could not create the temporary `.pdpart` file.
    CannotCreateTmp,
    /// Generic input/output error.
    Io,
    /// File operation error (permissions, bad descriptor, ...).
    File,
    /// The mirror list is unusable.
    Mirrors,
    /// No usable URL could be derived for a target.
    NoUrl,
    /// A checksum did not match.
    BadChecksum,
    /// A checksum of an unsupported kind was requested.
    UnknownChecksum,
    /// The URL could not be parsed.
    BadUrl,
    /// The download was interrupted by a signal.
    Interrupted,
    /// A user callback aborted the download.
    CallbackInterrupted,
    /// The zchunk library reported an error.
    Zchunk,
    /// The file already exists with a valid checksum.
    AlreadyDownloaded,
    /// The download was not (or cannot be) finished.
    Unfinished,
    /// Anything else.
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error value carried through the downloader: `(level, code, reason)`.
#[derive(Debug, Clone, Error)]
#[error("{code}: {reason}")]
pub struct DownloadError {
    pub level: ErrorLevel,
    pub code: ErrorCode,
    pub reason: String,
}

impl DownloadError {
    pub fn new(level: ErrorLevel, code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            level,
            code,
            reason: reason.into(),
        }
    }

    pub fn transient(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::new(ErrorLevel::Transient, code, reason)
    }

    pub fn serious(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::new(ErrorLevel::Serious, code, reason)
    }

    pub fn fatal(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::new(ErrorLevel::Fatal, code, reason)
    }

    /// Serious or fatal: the mirror that produced it should be penalized.
    pub fn is_serious(&self) -> bool {
        self.level >= ErrorLevel::Serious
    }

    /// No recovery possible for the target.
    pub fn is_fatal(&self) -> bool {
        self.level == ErrorLevel::Fatal
    }

    pub fn log(&self) {
        match self.level {
            ErrorLevel::Fatal => tracing::error!("{}", self),
            ErrorLevel::Serious => tracing::warn!("{}", self),
            ErrorLevel::Transient => tracing::debug!("{}", self),
        }
    }

    /// Classify an HTTP client error.
    ///
    /// Timeouts are serious (the mirror is reachable but useless right now),
    /// request-builder misuse is fatal, everything else is transient and
    /// recoverable through another mirror.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::serious(ErrorCode::Temporary, format!("operation timed out: {err}"))
        } else if err.is_builder() {
            Self::fatal(ErrorCode::BadFuncArg, format!("invalid request: {err}"))
        } else {
            Self::transient(ErrorCode::Transport, format!("transfer error: {err}"))
        }
    }

    /// Classify an HTTP status code outside the 2xx range.
    pub fn from_status(status: u16, url: &str) -> Self {
        let reason = format!("status code: {status} for {url}");
        match status {
            500 | 502..=504 => Self::transient(ErrorCode::Temporary, reason),
            _ => Self::transient(ErrorCode::BadStatus, reason),
        }
    }

    /// A local file error: writing to disk cannot be recovered by retrying.
    pub fn from_file_io(err: &std::io::Error, path: &std::path::Path) -> Self {
        Self::fatal(
            ErrorCode::File,
            format!("file error for {}: {err}", path.display()),
        )
    }
}

/// Result type used across the crate.
pub type DownloadResult<T> = std::result::Result<T, DownloadError>;
