//! AWS Signature Version 4 query presigning
//!
//! Produces time-limited URLs for S3-compatible stores. The same signer backs
//! the redirect URLs handed to clients and the adapter's own HEAD/GET/PUT
//! requests, so credentials never travel in headers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Longest expiry SigV4 accepts.
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Credentials and scope for presigning.
#[derive(Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
}

impl std::fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Presign `method` against `url`.
    ///
    /// `url` must already carry the object path; any query it holds is
    /// replaced. `extra_query` pairs (response overrides) are signed along
    /// with the SigV4 parameters. Expiry is clamped to `1..=7 days`.
    pub fn presign(
        &self,
        method: &str,
        url: &Url,
        expires_in: Duration,
        extra_query: &[(&str, String)],
        now: DateTime<Utc>,
    ) -> Result<Url> {
        let host = canonical_host(url)?;
        let canonical_uri = canonical_uri(url)?;

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SERVICE);
        let expires = expires_in.as_secs().clamp(1, MAX_PRESIGN_EXPIRY.as_secs());

        let mut params: Vec<(String, String)> = vec![
            ("X-Amz-Algorithm".into(), ALGORITHM.into()),
            (
                "X-Amz-Credential".into(),
                format!("{}/{}", self.access_key, scope),
            ),
            ("X-Amz-Date".into(), amz_date.clone()),
            ("X-Amz-Expires".into(), expires.to_string()),
            ("X-Amz-SignedHeaders".into(), "host".into()),
        ];
        params.extend(extra_query.iter().map(|(k, v)| (k.to_string(), v.clone())));

        let mut encoded: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        encoded.sort();
        let canonical_query = join_query(&encoded);

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
            method, canonical_uri, canonical_query, host, UNSIGNED_PAYLOAD
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = self.signing_key(&date)?;
        let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes())?);

        let mut signed = url.clone();
        signed.set_query(Some(&format!(
            "{}&X-Amz-Signature={}",
            canonical_query, signature
        )));
        Ok(signed)
    }

    fn signing_key(&self, date: &str) -> Result<Vec<u8>> {
        let k_date = hmac(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date.as_bytes(),
        )?;
        let k_region = hmac(&k_date, self.region.as_bytes())?;
        let k_service = hmac(&k_region, SERVICE.as_bytes())?;
        hmac(&k_service, b"aws4_request")
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| Error::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn canonical_host(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Signing(format!("url has no host: {}", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Path as the server canonicalizes it: each segment decoded, then strictly
/// re-encoded.
fn canonical_uri(url: &Url) -> Result<String> {
    let mut segments = Vec::new();
    for segment in url.path().split('/') {
        let decoded = urlencoding::decode(segment)
            .map_err(|e| Error::Signing(format!("bad path segment {:?}: {}", segment, e)))?;
        segments.push(uri_encode(&decoded));
    }
    let uri = segments.join("/");
    Ok(if uri.is_empty() { "/".into() } else { uri })
}

fn join_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// RFC 3986 encoding with uppercase hex, keeping only unreserved characters.
/// Slashes are encoded too; callers split paths into segments first.
fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
