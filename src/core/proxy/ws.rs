//! WebSocket relay shim. Upgrades the client connection,
//! dials the backend over the resolved tunnel, and copies frames in
//! each direction preserving type and boundaries, capped at a
//! configurable per-frame read limit, using a bidirectional
//! `tokio::select!` copy loop over WebSocket frames rather than raw
//! TCP bytes.

use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message as ClientMessage, WebSocketStream};
use tokio_tungstenite::tungstenite::Message as BackendMessage;

use crate::core::error::CoreError;

/// Truncate a close reason to at most `max_bytes`, cutting at the last
/// valid UTF-8 character boundary at or before that length rather than
/// a raw byte offset that could split a multi-byte character.
pub fn truncate_reason(reason: &str, max_bytes: usize) -> String {
    if reason.len() <= max_bytes {
        return reason.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Relay frames between a poem-side client WebSocket and a
/// tungstenite-side backend WebSocket until either side closes.
pub async fn relay(
    client_ws: WebSocketStream,
    backend_ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    read_limit: usize,
) -> Result<(), CoreError> {
    let (mut client_sink, mut client_stream) = client_ws.split();
    let (mut backend_sink, mut backend_stream) = backend_ws.split();

    let client_to_backend = async {
        while let Some(Ok(msg)) = client_stream.next().await {
            let frame = match msg {
                ClientMessage::Text(t) => {
                    if t.len() > read_limit {
                        continue;
                    }
                    BackendMessage::Text(t.into())
                }
                ClientMessage::Binary(b) => {
                    if b.len() > read_limit {
                        continue;
                    }
                    BackendMessage::Binary(b.into())
                }
                ClientMessage::Ping(p) => BackendMessage::Ping(p.into()),
                ClientMessage::Pong(p) => BackendMessage::Pong(p.into()),
                ClientMessage::Close(_) => break,
            };
            if backend_sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = backend_sink.close().await;
    };

    let backend_to_client = async {
        while let Some(Ok(msg)) = backend_stream.next().await {
            let frame = match msg {
                BackendMessage::Text(t) => ClientMessage::Text(t.to_string()),
                BackendMessage::Binary(b) => ClientMessage::Binary(b.to_vec()),
                BackendMessage::Ping(p) => ClientMessage::Ping(p.to_vec()),
                BackendMessage::Pong(p) => ClientMessage::Pong(p.to_vec()),
                BackendMessage::Close(_) | BackendMessage::Frame(_) => break,
            };
            if client_sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = client_sink.close().await;
    };

    tokio::select! {
        _ = client_to_backend => {}
        _ = backend_to_client => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reason_is_unchanged() {
        assert_eq!(truncate_reason("bad token", 120), "bad token");
    }

    #[test]
    fn truncates_at_char_boundary_not_mid_character() {
        // 'é' is 2 bytes in UTF-8; force a boundary right in the middle.
        let reason = format!("{}{}", "a".repeat(119), "é");
        let truncated = truncate_reason(&reason, 120);
        assert!(truncated.is_char_boundary(truncated.len()));
        assert!(String::from_utf8(truncated.clone().into_bytes()).is_ok());
        assert_eq!(truncated.len(), 119);
    }

    #[test]
    fn exact_length_is_unchanged() {
        let reason = "x".repeat(120);
        assert_eq!(truncate_reason(&reason, 120), reason);
    }
}
