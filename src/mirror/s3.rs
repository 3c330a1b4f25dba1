/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 */

//! S3-compatible mirror signing each fetch with AWS Signature V4.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use super::{join_url, EndpointOps};
use crate::error::{DownloadError, DownloadResult, ErrorCode};
use crate::target::DownloadTarget;

/// SHA-256 of an empty payload.
pub const EMPTY_SHA: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

type HmacSha256 = Hmac<Sha256>;

fn get_yyyymmdd(t: &DateTime<Utc>) -> String {
    t.format("%Y%m%d").to_string()
}

fn get_iso8601(t: &DateTime<Utc>) -> String {
    t.format("%Y%m%dT%H%M%SZ").to_string()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// The canonical request feeding the SigV4 signature.
pub(crate) struct S3CanonicalRequest {
    http_verb: String,
    resource: String,
    hashed_payload: String,
    pub date: DateTime<Utc>,
    /// Canonical headers; a BTreeMap keeps them in signing order.
    pub headers: BTreeMap<String, String>,
}

impl S3CanonicalRequest {
    pub fn new(http_verb: &str, bucket_url: &str, path: &str, sha256sum: &str) -> DownloadResult<Self> {
        Self::new_at(http_verb, bucket_url, path, sha256sum, Utc::now())
    }

    pub fn new_at(
        http_verb: &str,
        bucket_url: &str,
        path: &str,
        sha256sum: &str,
        date: DateTime<Utc>,
    ) -> DownloadResult<Self> {
        let parsed = Url::parse(&join_url(bucket_url, path)).map_err(|e| {
            DownloadError::fatal(ErrorCode::BadUrl, format!("invalid bucket url: {e}"))
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| DownloadError::fatal(ErrorCode::BadUrl, "bucket url has no host"))?
            .to_string();
        let resource = parsed.path().trim_start_matches('/').to_string();

        let hashed_payload = if sha256sum.is_empty() {
            EMPTY_SHA.to_string()
        } else {
            sha256sum.to_string()
        };

        let mut headers = BTreeMap::new();
        headers.insert("x-amz-date".to_string(), get_iso8601(&date));
        headers.insert("x-amz-content-sha256".to_string(), hashed_payload.clone());
        headers.insert("Host".to_string(), host);
        headers.insert(
            "Content-Type".to_string(),
            "application/octet-stream".to_string(),
        );

        Ok(Self {
            http_verb: http_verb.to_string(),
            resource,
            hashed_payload,
            date,
            headers,
        })
    }

    pub fn signed_headers(&self) -> String {
        self.headers
            .keys()
            .map(|k| k.to_lowercase())
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn canonical_request(&self) -> String {
        let canonical_headers: String = self
            .headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k.to_lowercase(), v))
            .collect();

        format!(
            "{}\n/{}\n\n{}\n{}\n{}",
            self.http_verb,
            self.resource,
            canonical_headers,
            self.signed_headers(),
            self.hashed_payload
        )
    }

    pub fn string_to_sign(&self, region: &str, service: &str) -> String {
        format!(
            "AWS4-HMAC-SHA256\n{}\n{}/{}/{}/aws4_request\n{}",
            get_iso8601(&self.date),
            get_yyyymmdd(&self.date),
            region,
            service,
            hex::encode(Sha256::digest(self.canonical_request()))
        )
    }
}

/// Derive the request signature through the SigV4 HMAC chain.
pub(crate) fn s3_calculate_signature(
    request_date: &DateTime<Utc>,
    secret: &str,
    region: &str,
    service: &str,
    string_to_sign: &str,
) -> String {
    let date_key = hmac_sha256(
        format!("AWS4{secret}").as_bytes(),
        get_yyyymmdd(request_date).as_bytes(),
    );
    let date_region_key = hmac_sha256(&date_key, region.as_bytes());
    let date_region_service_key = hmac_sha256(&date_region_key, service.as_bytes());
    let signing_key = hmac_sha256(&date_region_service_key, b"aws4_request");
    hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()))
}

/// Mirror kind for S3-compatible object stores.
#[derive(Debug, Clone)]
pub struct S3Mirror {
    region: String,
    aws_access_key_id: String,
    aws_secret_access_key: String,
}

impl S3Mirror {
    pub fn new(
        region: impl Into<String>,
        aws_access_key_id: impl Into<String>,
        aws_secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            aws_access_key_id: aws_access_key_id.into(),
            aws_secret_access_key: aws_secret_access_key.into(),
        }
    }

    fn auth_headers_for(&self, request: &S3CanonicalRequest) -> Vec<(String, String)> {
        let signature = s3_calculate_signature(
            &request.date,
            &self.aws_secret_access_key,
            &self.region,
            "s3",
            &request.string_to_sign(&self.region, "s3"),
        );

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}/{}/s3/aws4_request, SignedHeaders={}, Signature={}",
            self.aws_access_key_id,
            get_yyyymmdd(&request.date),
            self.region,
            request.signed_headers(),
            signature
        );

        let mut headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.push(("Authorization".to_string(), authorization));
        headers
    }
}

impl EndpointOps for S3Mirror {
    fn format_url(&self, base: &str, target: &DownloadTarget) -> DownloadResult<String> {
        Ok(join_url(base, &target.path))
    }

    fn auth_headers(&self, base: &str, path: &str) -> DownloadResult<Vec<(String, String)>> {
        let request = S3CanonicalRequest::new("GET", base, path, "")?;
        Ok(self.auth_headers_for(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 5, 24, 12, 30, 45).unwrap()
    }

    fn fixed_request() -> S3CanonicalRequest {
        S3CanonicalRequest::new_at(
            "GET",
            "https://bucket.example.com",
            "noarch/pkg.tar.bz2",
            "",
            fixed_date(),
        )
        .unwrap()
    }

    #[test]
    fn test_date_formats() {
        assert_eq!(get_yyyymmdd(&fixed_date()), "20210524");
        assert_eq!(get_iso8601(&fixed_date()), "20210524T123045Z");
    }

    #[test]
    fn test_canonical_request_shape() {
        let req = fixed_request();
        let canonical = req.canonical_request();
        let lines: Vec<&str> = canonical.split('\n').collect();
        assert_eq!(lines[0], "GET");
        assert_eq!(lines[1], "/noarch/pkg.tar.bz2");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "content-type:application/octet-stream");
        assert_eq!(lines[4], "host:bucket.example.com");
        assert_eq!(lines[5], format!("x-amz-content-sha256:{EMPTY_SHA}"));
        assert_eq!(lines[6], "x-amz-date:20210524T123045Z");
        assert_eq!(
            req.signed_headers(),
            "content-type;host;x-amz-content-sha256;x-amz-date"
        );
        assert_eq!(*lines.last().unwrap(), EMPTY_SHA);
    }

    #[test]
    fn test_string_to_sign_scope() {
        let req = fixed_request();
        let sts = req.string_to_sign("eu-central-1", "s3");
        assert!(sts.starts_with("AWS4-HMAC-SHA256\n20210524T123045Z\n"));
        assert!(sts.contains("20210524/eu-central-1/s3/aws4_request\n"));
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let req = fixed_request();
        let sts = req.string_to_sign("eu-central-1", "s3");
        let sig1 = s3_calculate_signature(&req.date, "secret", "eu-central-1", "s3", &sts);
        let sig2 = s3_calculate_signature(&req.date, "secret", "eu-central-1", "s3", &sts);
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));

        let other = s3_calculate_signature(&req.date, "other-secret", "eu-central-1", "s3", &sts);
        assert_ne!(sig1, other);
    }

    #[test]
    fn test_auth_headers_contain_authorization() {
        let mirror = S3Mirror::new("eu-central-1", "AKIDEXAMPLE", "secret");
        let headers = mirror
            .auth_headers("https://bucket.example.com", "noarch/pkg.tar.bz2")
            .unwrap();

        let auth = headers
            .iter()
            .find(|(k, _)| k == "Authorization")
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("/eu-central-1/s3/aws4_request, SignedHeaders="));
        assert!(auth.contains(", Signature="));

        assert!(headers.iter().any(|(k, _)| k == "x-amz-date"));
        assert!(headers.iter().any(|(k, v)| k == "x-amz-content-sha256" && v == EMPTY_SHA));
        assert!(headers.iter().any(|(k, _)| k == "Host"));
    }
}
