//! SSE log streamer: runs `tail -n <n> [-f] <path>` over a
//! channel-exec and emits each line as a server-sent event. Cancelling
//! the stream (client disconnect, handler drop) tears down the remote
//! `tail` process by closing the channel rather than leaving it to exit
//! on its own. Uses the same channel-exec read loop as the terminal
//! shell, adapted from a broadcast channel to a one-shot SSE stream.

use std::path::Path;

use futures::Stream;
use poem::web::sse::Event;
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::core::error::CoreError;
use crate::core::ssh::manager::ClientHandle;

/// Characters that would let a path argument escape the quoted shell
/// word passed to `tail`.
fn is_safe_log_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains(['\'', '\0', '\n'])
        && Path::new(path).is_absolute()
}

/// Open a channel-exec'd `tail` against `path` on `client` and stream
/// its stdout as SSE events, one per line. `follow` maps to `tail -f`;
/// `lines` maps to `-n`. Dropping the returned stream (e.g. because the
/// HTTP handler future is cancelled) closes the channel, which ends the
/// remote `tail` process.
pub async fn stream_log(
    client: &ClientHandle,
    path: &str,
    lines: u32,
    follow: bool,
) -> Result<impl Stream<Item = Event> + Send + 'static, CoreError> {
    if !is_safe_log_path(path) {
        return Err(CoreError::InvalidInput(format!(
            "log path {path} is not an absolute, shell-safe path"
        )));
    }

    let mut command = format!("tail -n {lines}");
    if follow {
        command.push_str(" -f");
    }
    command.push_str(&format!(" '{path}'"));

    let mut channel = client
        .channel_open_session()
        .await
        .map_err(|e| CoreError::UpstreamUnreachable(format!("open session channel: {e}")))?;

    channel
        .exec(true, command.as_str())
        .await
        .map_err(|e| CoreError::UpstreamUnreachable(format!("exec tail failed: {e}")))?;

    let (tx, rx) = mpsc::channel::<Event>(256);

    tokio::spawn(async move {
        let mut carry = Vec::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    carry.extend_from_slice(&data);
                    while let Some(pos) = carry.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = carry.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                        if tx.send(Event::message(line)).await.is_err() {
                            let _ = channel.close().await;
                            return;
                        }
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        if !carry.is_empty() {
            let line = String::from_utf8_lossy(&carry).to_string();
            let _ = tx.send(Event::message(line)).await;
        }
        let _ = channel.close().await;
    });

    Ok(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_paths() {
        assert!(!is_safe_log_path("relative/log.txt"));
    }

    #[test]
    fn rejects_paths_with_quotes() {
        assert!(!is_safe_log_path("/var/log/app'; rm -rf /; echo '.log"));
    }

    #[test]
    fn accepts_a_plain_absolute_path() {
        assert!(is_safe_log_path("/var/log/agent/stdout.log"));
    }
}
