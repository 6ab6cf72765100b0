//! Shared HTTP plumbing for provider transports.
//!
//! All transports issue requests through a single lazily-initialised
//! [`reqwest`] client so TLS sessions and DNS lookups stay warm across
//! providers, and share the line-framing helper used to adapt streaming
//! response bodies (NDJSON for Ollama, SSE for OpenAI-compatible servers)
//! into per-line strings.

use crate::devflow::provider::ProviderError;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use std::pin::Pin;
use std::time::Duration;

/// Default connect timeout for local LLM servers.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default end-to-end request timeout; generation can be slow.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Strip trailing slashes so path joining stays predictable.
pub fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Surface a non-2xx response as a [`ProviderError::Api`] carrying the status
/// and body text.
pub async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Api(format!("HTTP {}: {}", status, body)))
}

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Re-frame a streaming response body into trimmed, non-empty lines.
///
/// Chunks can split lines at arbitrary byte offsets, so a carry-over buffer
/// accumulates bytes until a newline arrives. Any buffered remainder is
/// flushed as a final line when the body ends.
pub fn response_lines(resp: reqwest::Response) -> LineStream {
    struct State {
        body: Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>,
        buf: Vec<u8>,
        done: bool,
    }

    let state = State {
        body: Box::pin(resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()))),
        buf: Vec::new(),
        done: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = st.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                return Some((Ok(line), st));
            }
            if st.done {
                if st.buf.is_empty() {
                    return None;
                }
                let line = String::from_utf8_lossy(&st.buf).trim().to_string();
                st.buf.clear();
                if line.is_empty() {
                    return None;
                }
                return Some((Ok(line), st));
            }
            match st.body.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(ProviderError::Http(e.to_string())), st));
                }
                None => st.done = true,
            }
        }
    }))
}
