//! Origin engine
//!
//! The component the front door hands a request to when it is not answered
//! by a redirect. [`UpstreamEngine`] forwards to an upstream Go module proxy
//! and sum databases, serving and populating the cache through a [`Cacher`].
//!
//! [`Cacher`]: crate::domain::Cacher

pub mod upstream;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Method, Response};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub use upstream::{UpstreamConfig, UpstreamEngine};

/// `Cache-Control` for responses that must never be reused.
pub const NO_CACHE: &str = "must-revalidate, no-cache, no-store";

/// `Cache-Control` for immutable module artifacts.
pub const IMMUTABLE: &str = "max-age=31536000";

/// Request as seen by the origin engine
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    /// Normalized cache name, without a leading slash
    pub name: String,
    pub headers: HeaderMap,
}

impl OriginRequest {
    pub fn get(name: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            name: name.into(),
            headers: HeaderMap::new(),
        }
    }
}

/// Port for whatever produces the response when no redirect is issued.
#[async_trait]
pub trait OriginEngine: Send + Sync {
    async fn serve(
        &self,
        cx: &CancellationToken,
        req: &OriginRequest,
    ) -> Result<Response<Full<Bytes>>>;
}

/// Map a response builder failure (bad header value) into the crate error.
pub(crate) fn finish<E: std::fmt::Display>(
    built: std::result::Result<Response<Full<Bytes>>, E>,
) -> Result<Response<Full<Bytes>>> {
    built.map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}
