//! HTTP reverse proxy shim: `desktop`, `control`, and
//! general service mounts. Grounded on the request/response bridging
//! shape of `examples/ZingerLittleBee-EXLO/apps/tunnl/src/proxy.rs`, but
//! implemented with `reqwest` instead of hand-parsed HTTP since the
//! tunnel already presents an ordinary loopback TCP port.

use std::time::Duration;

use crate::core::error::CoreError;

/// Hop-by-hop headers that must not be copied between the proxied
/// request/response pair (RFC 7230 §6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxiedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Stream `method`/`path` (with its query string) plus headers and body
/// to `http://127.0.0.1:<local_port><rewritten_path>`, and return the
/// response with hop-by-hop headers stripped.
pub async fn forward(
    local_port: u16,
    method: &str,
    rewritten_path: &str,
    headers: &[(String, String)],
    body: Vec<u8>,
) -> Result<ProxiedResponse, CoreError> {
    let url = format!("http://127.0.0.1:{local_port}{rewritten_path}");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| CoreError::Internal(format!("failed to build proxy client: {e}")))?;

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| CoreError::InvalidInput(format!("invalid HTTP method {method}")))?;

    let mut request = client.request(method, &url);
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(&name.to_lowercase().as_str()) {
            request = request.header(name, value);
        }
    }
    request = request.body(body);

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            CoreError::UpstreamTimeout(format!("proxy request to {url} timed out"))
        } else {
            CoreError::UpstreamUnreachable(format!("proxy dial to {url} failed: {e}"))
        }
    })?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str().to_lowercase().as_str()))
        .map(|(name, value)| {
            (
                name.to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|e| CoreError::UpstreamUnreachable(format!("reading proxy response body: {e}")))?
        .to_vec();

    Ok(ProxiedResponse {
        status,
        headers,
        body,
    })
}

/// HTML placeholder body for a browser navigation that hit a
/// not-yet-ready tunnel, accompanied by `Retry-After: 1`.
pub fn connecting_placeholder_html() -> &'static str {
    "<!doctype html><html><head><meta http-equiv=\"refresh\" content=\"1\"></head>\
     <body>connecting…</body></html>"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(HOP_BY_HOP.contains(&"connection"));
        assert!(HOP_BY_HOP.contains(&"transfer-encoding"));
        assert!(!HOP_BY_HOP.contains(&"content-type"));
    }

    #[test]
    fn placeholder_contains_refresh_meta() {
        assert!(connecting_placeholder_html().contains("refresh"));
    }
}
