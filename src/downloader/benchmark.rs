/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 */

//! Fastest-mirror probing.
//!
//! Times a small probe fetch against each mirror URL and returns the URLs
//! ordered by measured speed, so callers can pre-order mirror lists before
//! scheduling real downloads.

use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::{DownloadError, DownloadResult, ErrorCode};

/// Measured performance of one probed mirror.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub url: String,
    pub latency: Option<Duration>,
    pub throughput_bytes_per_sec: f64,
    pub error: Option<String>,
}

impl ProbeResult {
    fn failure(url: String, error: String) -> Self {
        Self {
            url,
            latency: None,
            throughput_bytes_per_sec: 0.0,
            error: Some(error),
        }
    }
}

/// Probe every URL and return the list sorted fastest-first.
///
/// Unreachable mirrors sort last and carry their error message.
pub async fn fastest_mirrors(ctx: &Context, urls: &[String]) -> DownloadResult<Vec<ProbeResult>> {
    let client = reqwest::Client::builder()
        .connect_timeout(ctx.connect_timeout)
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| {
            DownloadError::fatal(ErrorCode::BadOptArg, format!("failed to build HTTP client: {e}"))
        })?;

    let mut results = Vec::with_capacity(urls.len());
    for url in urls {
        results.push(probe_mirror(&client, url).await);
    }

    results.sort_by(|a, b| {
        b.throughput_bytes_per_sec
            .partial_cmp(&a.throughput_bytes_per_sec)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(results)
}

async fn probe_mirror(client: &reqwest::Client, url: &str) -> ProbeResult {
    let start = Instant::now();

    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => return ProbeResult::failure(url.to_string(), e.to_string()),
    };
    let latency = start.elapsed();

    if !response.status().is_success() {
        return ProbeResult::failure(
            url.to_string(),
            format!("status code: {}", response.status().as_u16()),
        );
    }

    match response.bytes().await {
        Ok(bytes) => {
            let elapsed = start.elapsed().as_secs_f64();
            let throughput = if elapsed > 0.0 {
                bytes.len() as f64 / elapsed
            } else {
                0.0
            };
            ProbeResult {
                url: url.to_string(),
                latency: Some(latency),
                throughput_bytes_per_sec: throughput,
                error: None,
            }
        }
        Err(e) => ProbeResult::failure(url.to_string(), e.to_string()),
    }
}
