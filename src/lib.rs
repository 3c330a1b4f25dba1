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

//! Parallel mirror-aware artifact downloader.
//!
//! fetchpool pulls files identified by a logical path from one of several
//! interchangeable mirrors (HTTP(S), plain files, S3-compatible stores,
//! OCI registries), verifies them against cryptographic checksums, supports
//! byte ranges and resumable transfers, and can incrementally reconstruct
//! zchunk files from local caches plus ranged fetches.
//!
//! ```no_run
//! use fetchpool::{Context, ContextOptions, DownloadOptions, DownloadTarget, Downloader, Mirror};
//!
//! # async fn run() -> Result<(), fetchpool::DownloadError> {
//! let mut ctx = Context::new(ContextOptions::default())?;
//! ctx.add_mirrors(
//!     "conda-forge",
//!     vec![Mirror::http("https://conda.anaconda.org/conda-forge")],
//! );
//!
//! let mut downloader = Downloader::new(&ctx)?;
//! downloader.add(DownloadTarget::new(
//!     "linux-64/xtensor-0.23.10-h4bd325d_0.tar.bz2",
//!     "conda-forge",
//!     "xtensor.tar.bz2",
//! ));
//! downloader.download(DownloadOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod context;
pub mod downloader;
pub mod error;
pub mod fileio;
pub mod logging;
pub mod mirror;
pub mod target;
pub mod transfer;

pub use checksum::{Checksum, ChecksumKind};
pub use context::{Context, ContextOptions};
pub use downloader::zck::{ZckDownload, ZckEngine, ZckHeaderSpec, ZckState, ZckTargetState};
pub use downloader::{
    is_sig_interrupted, request_interrupt, reset_interrupt, DownloadOptions, DownloadState,
    Downloader,
};
pub use error::{DownloadError, DownloadResult, ErrorCode, ErrorLevel};
pub use fileio::{FileSlot, OpenMode};
pub use mirror::{Mirror, MirrorId, MirrorStats, OciMirror, Protocol};
pub use target::{
    CacheControl, CbReturnCode, DownloadTarget, EndCallback, ProgressCallback, TransferResponse,
    TransferStatus,
};

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serializes tests that construct a [`crate::Context`]: the process
    /// allows only one live instance.
    pub fn context_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
