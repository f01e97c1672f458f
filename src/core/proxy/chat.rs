//! Chat-gateway adapter: opens a direct SSH channel to the
//! gateway's chat port, wraps it as a stream speaking a small
//! newline-delimited JSON protocol, runs the gateway handshake, then
//! bridges the channel stream to the browser WebSocket, translating
//! browser frames into gateway requests, the same bridging idiom the
//! raw tunnel relay uses but with the stream framed as JSON instead of
//! opaque bytes so the handshake can be inspected in flight.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message as ClientMessage, WebSocketStream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::core::error::CoreError;
use crate::core::proxy::ws::truncate_reason;
use crate::core::ssh::manager::ClientHandle;
use crate::core::tunnel::manager::TunnelManager;

const MAX_CLOSE_REASON_BYTES: usize = 120;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_PROTOCOL: u32 = 3;
const MAX_PROTOCOL: u32 = 3;

/// Frame envelope the gateway speaks over the raw channel stream,
/// newline-delimited. Mirrors the gateway's own `req`/`res`/`event`
/// shape rather than inventing a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ResError>,
    },
    Event {
        event: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResError {
    pub message: String,
}

/// Build a `chat.send` or `sessions.reset` request out of a browser's
/// `{type:"chat", content}` frame. `/new` and `/reset` reset the
/// session instead of sending a chat message. Returns `None` for any
/// browser frame that isn't a chat frame.
fn translate_browser_frame(text: &str) -> Option<ChatFrame> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type").and_then(|t| t.as_str()) != Some("chat") {
        return None;
    }
    let content = value
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let id = format!("req-{}", Uuid::new_v4());

    if content == "/new" || content == "/reset" {
        Some(ChatFrame::Req {
            id,
            method: "sessions.reset".to_string(),
            params: serde_json::json!({}),
        })
    } else {
        Some(ChatFrame::Req {
            id,
            method: "chat.send".to_string(),
            params: serde_json::json!({
                "content": content,
                "idempotencyKey": Uuid::new_v4().to_string(),
            }),
        })
    }
}

fn nanos_since_epoch() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Read one newline-delimited frame, pulling more bytes off `reader`
/// into `line_buf` until a full line is available. Leftover bytes past
/// the line stay in `line_buf` for the next call.
async fn read_frame(
    reader: &mut (impl AsyncReadExt + Unpin),
    line_buf: &mut Vec<u8>,
    timeout: Duration,
    read_limit: usize,
) -> Result<ChatFrame, CoreError> {
    tokio::time::timeout(timeout, async {
        loop {
            if let Some(pos) = line_buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = line_buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                return serde_json::from_slice::<ChatFrame>(line).map_err(|e| {
                    CoreError::UpstreamProtocol(format!("malformed gateway frame: {e}"))
                });
            }
            if line_buf.len() > read_limit {
                return Err(CoreError::UpstreamProtocol(
                    "gateway frame exceeded read limit".to_string(),
                ));
            }
            let mut chunk = [0u8; 4096];
            let n = reader.read(&mut chunk).await.map_err(|e| {
                CoreError::UpstreamUnreachable(format!("reading gateway frame: {e}"))
            })?;
            if n == 0 {
                return Err(CoreError::UpstreamUnreachable(
                    "gateway closed the connection".to_string(),
                ));
            }
            line_buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .map_err(|_| CoreError::UpstreamTimeout("timed out waiting for gateway frame".to_string()))?
}

async fn write_frame(
    writer: &mut (impl AsyncWriteExt + Unpin),
    frame: &ChatFrame,
) -> Result<(), CoreError> {
    let mut line = serde_json::to_vec(frame)
        .map_err(|e| CoreError::Internal(format!("encoding gateway frame: {e}")))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| CoreError::UpstreamUnreachable(format!("writing gateway frame: {e}")))
}

/// Runs the gateway handshake: wait for the `connect.challenge` event,
/// send `connect`, wait for the matching `res`. Any `event` frame seen
/// while waiting for the `res` is ignored, not forwarded.
async fn run_handshake(
    remote_read: &mut (impl AsyncReadExt + Unpin),
    remote_write: &mut (impl AsyncWriteExt + Unpin),
    line_buf: &mut Vec<u8>,
    gateway_token: Option<&str>,
    read_limit: usize,
) -> Result<(), CoreError> {
    match read_frame(remote_read, line_buf, HANDSHAKE_TIMEOUT, read_limit).await? {
        ChatFrame::Event { event }
            if event.get("type").and_then(|t| t.as_str()) == Some("connect.challenge") => {}
        other => {
            return Err(CoreError::UpstreamProtocol(format!(
                "expected connect.challenge event, got {other:?}"
            )));
        }
    }

    let id = format!("connect-{}", nanos_since_epoch());
    let req = ChatFrame::Req {
        id: id.clone(),
        method: "connect".to_string(),
        params: serde_json::json!({
            "minProtocol": MIN_PROTOCOL,
            "maxProtocol": MAX_PROTOCOL,
            "client": {
                "id": "sshcore",
                "version": env!("CARGO_PKG_VERSION"),
                "platform": "linux",
                "mode": "webchat",
            },
            "role": "operator",
            "scopes": ["operator.admin"],
            "auth": { "token": gateway_token.unwrap_or_default() },
        }),
    };
    write_frame(remote_write, &req).await?;

    loop {
        match read_frame(remote_read, line_buf, HANDSHAKE_TIMEOUT, read_limit).await? {
            ChatFrame::Event { .. } => continue,
            ChatFrame::Res { id: res_id, ok, error } if res_id == id => {
                if ok {
                    return Ok(());
                }
                let message = error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "connect rejected".to_string());
                return Err(CoreError::UpstreamAuth(message));
            }
            _ => continue,
        }
    }
}

/// Relay chat frames between `client_ws` and the chat-gateway channel
/// opened against `remote_port` on `client`, after completing the
/// gateway handshake. `gateway_token` is the instance's decrypted
/// gateway auth token, if any.
pub async fn relay(
    client_ws: WebSocketStream,
    ssh_client: &ClientHandle,
    tunnels: &TunnelManager,
    remote_port: u16,
    gateway_token: Option<&str>,
    read_limit: usize,
) -> Result<(), CoreError> {
    let stream = tunnels.open_direct_channel(ssh_client, remote_port).await?;
    let (mut remote_read, mut remote_write) = tokio::io::split(stream);

    let (mut client_sink, mut client_stream) = client_ws.split();

    let mut line_buf = Vec::new();

    if let Err(e) = run_handshake(&mut remote_read, &mut remote_write, &mut line_buf, gateway_token, read_limit).await {
        let reason = match &e {
            CoreError::UpstreamAuth(message) => truncate_reason(message, MAX_CLOSE_REASON_BYTES),
            other => truncate_reason(&other.detail(), MAX_CLOSE_REASON_BYTES),
        };
        let _ = client_sink
            .send(ClientMessage::Close(Some((e.ws_close_code(), reason))))
            .await;
        return Err(e);
    }

    if client_sink
        .send(ClientMessage::Text(r#"{"type":"connected"}"#.to_string()))
        .await
        .is_err()
    {
        return Ok(());
    }

    let mut read_chunk = [0u8; 8192];

    loop {
        tokio::select! {
            client_msg = client_stream.next() => {
                match client_msg {
                    Some(Ok(ClientMessage::Text(text))) => {
                        match translate_browser_frame(&text) {
                            Some(frame) => {
                                if write_frame(&mut remote_write, &frame).await.is_err() {
                                    break;
                                }
                            }
                            None => debug!("dropping non-chat browser frame"),
                        }
                    }
                    Some(Ok(ClientMessage::Binary(_))) => {
                        debug!("dropping non-text browser frame on chat relay");
                    }
                    Some(Ok(ClientMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            n = remote_read.read(&mut read_chunk) => {
                match n {
                    Ok(0) => break,
                    Ok(n) => {
                        line_buf.extend_from_slice(&read_chunk[..n]);
                        if line_buf.len() > read_limit && !line_buf.contains(&b'\n') {
                            let reason = truncate_reason("gateway frame exceeded read limit", MAX_CLOSE_REASON_BYTES);
                            let _ = client_sink
                                .send(ClientMessage::Close(Some((4502, reason))))
                                .await;
                            return Err(CoreError::UpstreamProtocol(
                                "chat gateway frame exceeded read limit".to_string(),
                            ));
                        }
                        while let Some(pos) = line_buf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = line_buf.drain(..=pos).collect();
                            let line = &line[..line.len() - 1];
                            match serde_json::from_slice::<ChatFrame>(line) {
                                Ok(frame) => {
                                    let text = serde_json::to_string(&frame)
                                        .unwrap_or_else(|_| "{}".to_string());
                                    if client_sink.send(ClientMessage::Text(text)).await.is_err() {
                                        return Ok(());
                                    }
                                }
                                Err(e) => {
                                    let reason = truncate_reason(
                                        &format!("gateway sent malformed frame: {e}"),
                                        MAX_CLOSE_REASON_BYTES,
                                    );
                                    let _ = client_sink
                                        .send(ClientMessage::Close(Some((4502, reason))))
                                        .await;
                                    return Err(CoreError::UpstreamProtocol(
                                        "chat gateway framing error".to_string(),
                                    ));
                                }
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    let _ = client_sink.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_challenge_event_round_trips_through_json() {
        let frame = ChatFrame::Event {
            event: serde_json::json!({"type": "connect.challenge"}),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ChatFrame = serde_json::from_str(&json).unwrap();
        match back {
            ChatFrame::Event { event } => {
                assert_eq!(event.get("type").unwrap(), "connect.challenge")
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn res_frame_parses_ok_and_error() {
        let ok: ChatFrame = serde_json::from_str(r#"{"type":"res","id":"connect-1","ok":true}"#).unwrap();
        matches!(ok, ChatFrame::Res { ok: true, .. });

        let rejected: ChatFrame = serde_json::from_str(
            r#"{"type":"res","id":"connect-1","ok":false,"error":{"message":"bad token"}}"#,
        )
        .unwrap();
        match rejected {
            ChatFrame::Res { ok: false, error: Some(e), .. } => assert_eq!(e.message, "bad token"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn translates_reset_commands() {
        let frame = translate_browser_frame(r#"{"type":"chat","content":"/reset"}"#).unwrap();
        match frame {
            ChatFrame::Req { method, .. } => assert_eq!(method, "sessions.reset"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn translates_plain_chat_with_idempotency_key() {
        let frame = translate_browser_frame(r#"{"type":"chat","content":"hello"}"#).unwrap();
        match frame {
            ChatFrame::Req { method, params, .. } => {
                assert_eq!(method, "chat.send");
                assert_eq!(params["content"], "hello");
                assert!(params["idempotencyKey"].is_string());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn non_chat_browser_frames_are_dropped() {
        assert!(translate_browser_frame(r#"{"type":"ping"}"#).is_none());
        assert!(translate_browser_frame("not json").is_none());
    }
}
