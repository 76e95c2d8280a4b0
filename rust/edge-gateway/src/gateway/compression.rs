//! Response compression.
//!
//! Bodies are compressed whole so the gateway can report original and
//! compressed sizes and keep the uncompressed body when compression does not
//! help. Bodies of unknown length are streamed through untouched.

use std::io::Write;

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use flate2::{
    Compression,
    write::{GzEncoder, ZlibEncoder},
};

use crate::AppState;
use crate::error::{GatewayError, UpstreamFailure};

/// Bodies smaller than this are sent as-is.
pub const MIN_COMPRESS_BYTES: usize = 1024;

/// Bodies larger than this are not buffered for compression.
pub const MAX_COMPRESS_BYTES: usize = 8 * 1024 * 1024;

/// Supported content codings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

/// Pick a coding from `Accept-Encoding`. Gzip wins whenever it is acceptable.
#[must_use]
pub fn negotiate(accept_encoding: &str) -> Option<Encoding> {
    let mut deflate = false;
    for item in accept_encoding.split(',') {
        let mut parts = item.split(';');
        let coding = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let refused = parts.any(|p| {
            p.trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        });
        if refused {
            continue;
        }
        match coding.as_str() {
            "gzip" | "x-gzip" => return Some(Encoding::Gzip),
            "deflate" => deflate = true,
            _ => {}
        }
    }
    deflate.then_some(Encoding::Deflate)
}

/// Text and JSON-like types benefit from compression.
#[must_use]
pub fn is_compressible(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/") || ct.contains("json") || ct.contains("xml") || ct.contains("javascript")
}

/// Compress a buffer with the chosen coding.
pub fn compress(body: &[u8], encoding: Encoding) -> std::io::Result<Vec<u8>> {
    match encoding {
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
    }
}

/// Percentage of bytes saved, one decimal place.
#[must_use]
#[allow(clippy::cast_precision_loss, reason = "sizes are far below f64 precision")]
pub fn compression_ratio(original: usize, compressed: usize) -> String {
    if original == 0 {
        return "0.0%".to_string();
    }
    let saved = (1.0 - compressed as f64 / original as f64) * 100.0;
    format!("{saved:.1}%")
}

/// Middleware applying [`transcode`] to every response.
pub async fn compression_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let encoding = req
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|h| h.to_str().ok())
        .and_then(negotiate);

    let response = next.run(req).await;
    match encoding {
        Some(encoding) => transcode(response, encoding)
            .await
            .unwrap_or_else(|e| e.render(&state.error_policy())),
        None => response,
    }
}

/// Compress `response` if its type, size and current encoding allow it.
///
/// A compression failure sends the original body. A body that cannot be read
/// is gone, so it becomes an upstream protocol error instead.
pub async fn transcode(response: Response, encoding: Encoding) -> Result<Response, GatewayError> {
    if response.headers().contains_key(header::CONTENT_ENCODING) {
        return Ok(response);
    }
    let compressible = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .is_some_and(is_compressible);
    if !compressible {
        return Ok(response);
    }

    let Some(size) = axum::body::HttpBody::size_hint(response.body())
        .exact()
        .and_then(|n| usize::try_from(n).ok())
    else {
        return Ok(response);
    };
    if !(MIN_COMPRESS_BYTES..=MAX_COMPRESS_BYTES).contains(&size) {
        return Ok(response);
    }

    let (mut parts, body) = response.into_parts();
    let original: Bytes = match to_bytes(body, MAX_COMPRESS_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, status = parts.status.as_u16(), "Failed to buffer response for compression");
            return Err(GatewayError::UpstreamUnavailable {
                kind: UpstreamFailure::Protocol,
                detail: e.to_string(),
            });
        }
    };

    let compressed = match compress(&original, encoding) {
        Ok(compressed) if compressed.len() < original.len() => compressed,
        Ok(_) => return Ok(Response::from_parts(parts, Body::from(original))),
        Err(e) => {
            tracing::warn!(error = %e, encoding = encoding.as_str(), "Compression failed, sending uncompressed");
            return Ok(Response::from_parts(parts, Body::from(original)));
        }
    };

    let headers = &mut parts.headers;
    headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(compressed.len()));
    headers.insert("x-original-size", HeaderValue::from(original.len()));
    headers.insert("x-compressed-size", HeaderValue::from(compressed.len()));
    if let Ok(ratio) = HeaderValue::from_str(&compression_ratio(original.len(), compressed.len())) {
        headers.insert("x-compression-ratio", ratio);
    }
    headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
    // The weak form survives re-encoding; strong ETags describe the identity body.
    if let Some(etag) = headers.get(header::ETAG).and_then(|h| h.to_str().ok())
        && !etag.starts_with("W/")
        && let Ok(weak) = HeaderValue::from_str(&format!("W/{etag}"))
    {
        headers.insert(header::ETAG, weak);
    }

    Ok(Response::from_parts(parts, Body::from(compressed)))
}
