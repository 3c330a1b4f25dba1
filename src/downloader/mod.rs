/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! The multi-slot transfer scheduler and the per-target state machine.

pub mod benchmark;
mod scheduler;
mod target;
pub mod zck;

pub use scheduler::{is_sig_interrupted, request_interrupt, reset_interrupt, Downloader};
pub use target::{DownloadState, Target};

/// Options for one [`Downloader::download`] run.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Extract finished zchunk files next to their destination.
    pub extract_zchunk_files: bool,
    /// Abort the whole run on the first failed target.
    pub failfast: bool,
    /// Individual failures do not abort the run even with failfast.
    pub allow_failure: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            extract_zchunk_files: true,
            failfast: false,
            allow_failure: false,
        }
    }
}
