//! File operations shim: list/read/write/mkdir/upload
//! against the agent's filesystem over SFTP. Follows the usual
//! channel-lifecycle pattern (open a channel, hand it to a protocol
//! session, tear it down on drop) applied to `russh-sftp`'s
//! `SftpSession` instead of a raw exec channel.

use chrono::{DateTime, Utc};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::core::error::CoreError;
use crate::core::ssh::manager::ClientHandle;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Open an SFTP subsystem channel against `client`. Each call opens a
/// fresh channel; callers that perform several operations in sequence
/// should reuse one `SftpSession` rather than calling this per-op.
pub async fn open_sftp(client: &ClientHandle) -> Result<SftpSession, CoreError> {
    let channel = client
        .channel_open_session()
        .await
        .map_err(|e| CoreError::UpstreamUnreachable(format!("open sftp channel: {e}")))?;

    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| CoreError::UpstreamUnreachable(format!("request sftp subsystem: {e}")))?;

    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| CoreError::UpstreamProtocol(format!("sftp handshake failed: {e}")))
}

/// Classifies an SFTP error by its message the same way
/// `core::ssh::client` classifies dial failures, since the error codes
/// `russh-sftp` surfaces are protocol-level status names that show up
/// verbatim in `Display` output (`"No such file"`, `"Permission denied"`).
fn map_sftp_error(op: &str, path: &str, error: impl std::fmt::Display) -> CoreError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("no such file") || lower.contains("not found") {
        CoreError::NotFound(format!("{path} does not exist"))
    } else if lower.contains("permission denied") {
        CoreError::Forbidden(format!("permission denied: {path}"))
    } else {
        CoreError::Internal(format!("{op} failed for {path}: {message}"))
    }
}

pub async fn list_dir(sftp: &SftpSession, path: &str) -> Result<Vec<FileEntry>, CoreError> {
    let entries = sftp
        .read_dir(path)
        .await
        .map_err(|e| map_sftp_error("list", path, e))?;

    Ok(entries
        .map(|entry| {
            let metadata = entry.metadata();
            FileEntry {
                name: entry.file_name(),
                is_dir: metadata.is_dir(),
                size: metadata.size.unwrap_or(0),
                modified: metadata
                    .mtime
                    .and_then(|t| DateTime::from_timestamp(t as i64, 0)),
            }
        })
        .collect())
}

pub async fn read_file(sftp: &SftpSession, path: &str) -> Result<Vec<u8>, CoreError> {
    let mut file = sftp
        .open(path)
        .await
        .map_err(|e| map_sftp_error("read", path, e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .await
        .map_err(|e| CoreError::Internal(format!("reading {path}: {e}")))?;
    Ok(buf)
}

pub async fn write_file(sftp: &SftpSession, path: &str, contents: &[u8]) -> Result<(), CoreError> {
    let mut file = sftp
        .create(path)
        .await
        .map_err(|e| map_sftp_error("write", path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| CoreError::Internal(format!("writing {path}: {e}")))?;
    file.shutdown()
        .await
        .map_err(|e| CoreError::Internal(format!("flushing {path}: {e}")))?;
    Ok(())
}

pub async fn make_dir(sftp: &SftpSession, path: &str) -> Result<(), CoreError> {
    sftp.create_dir(path)
        .await
        .map_err(|e| map_sftp_error("mkdir", path, e))
}

/// Upload is identical to `write_file` from the core's perspective; the
/// distinction (multipart vs JSON body) lives entirely in the HTTP layer.
pub async fn upload(sftp: &SftpSession, path: &str, contents: &[u8]) -> Result<(), CoreError> {
    write_file(sftp, path, contents).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_entry_serializes_with_expected_fields() {
        let entry = FileEntry {
            name: "app.log".to_string(),
            is_dir: false,
            size: 1024,
            modified: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["name"], "app.log");
        assert_eq!(json["size"], 1024);
    }
}
