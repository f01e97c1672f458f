//! Terminal `TerminalManager`: interactive PTY sessions,
//! either one-shot (tied to a single WS connection, not tracked here)
//! or managed (tracked by session id, survive WS disconnect). Built
//! around a `RunningShell`/`ChannelWriter` pair, a status `watch`
//! channel, and a `CancellationToken` per session, with idle timeout,
//! rate limiting, resize clamping, and recording layered on top.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use russh::ChannelWriteHalf;
use russh::client;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::error::CoreError;
use crate::core::models::{RecordingDirection, RecordingEntry, TerminalSessionInfo, TerminalState};
use crate::core::ssh::manager::ClientHandle;
use crate::core::terminal::ratelimit::InputRateLimiter;

pub const ALLOWED_SHELLS: &[&str] = &["/bin/bash", "/bin/sh", "/bin/zsh"];
pub const MAX_SESSIONS_PER_INSTANCE: usize = 10;

pub struct ChannelWriter {
    write_half: ChannelWriteHalf<client::Msg>,
}

impl ChannelWriter {
    pub async fn write(&self, data: &[u8]) -> Result<(), String> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| format!("failed to write to terminal: {e}"))
    }

    pub async fn window_change(&self, cols: u32, rows: u32) -> Result<(), String> {
        self.write_half
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(|e| format!("failed to send window-change: {e}"))
    }

    pub async fn close(&self) -> Result<(), String> {
        self.write_half
            .close()
            .await
            .map_err(|e| format!("failed to close terminal channel: {e}"))
    }
}

pub struct TerminalSession {
    pub info: RwLock<TerminalSessionInfo>,
    pub cancel_token: CancellationToken,
    pub channel_writer: Arc<Mutex<ChannelWriter>>,
    pub output_tx: broadcast::Sender<Vec<u8>>,
    pub status_tx: watch::Sender<TerminalState>,
    pub status_rx: watch::Receiver<TerminalState>,
    pub rate_limiter: InputRateLimiter,
    pub recording: Option<Mutex<Vec<RecordingEntry>>>,
    started_at: std::time::Instant,
}

impl TerminalSession {
    pub async fn record(&self, direction: RecordingDirection, bytes: &[u8]) {
        if let Some(recording) = &self.recording {
            let mut buf = recording.lock().await;
            buf.push(RecordingEntry {
                delta_ms: self.started_at.elapsed().as_millis() as u64,
                direction,
                bytes: bytes.to_vec(),
            });
        }
    }

    pub async fn export_recording(&self) -> Option<Vec<RecordingEntry>> {
        match &self.recording {
            Some(r) => Some(r.lock().await.clone()),
            None => None,
        }
    }
}

pub struct TerminalManager {
    settings: Arc<Settings>,
    sessions: DashMap<String, Arc<TerminalSession>>,
    by_instance: DashMap<u64, Vec<String>>,
}

impl TerminalManager {
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            sessions: DashMap::new(),
            by_instance: DashMap::new(),
        })
    }

    pub fn clamp_size(&self, cols: u16, rows: u16) -> (u16, u16) {
        (
            cols.min(self.settings.max_term_cols),
            rows.min(self.settings.max_term_rows),
        )
    }

    pub async fn open(
        self: &Arc<Self>,
        instance_id: u64,
        user_id: &str,
        shell: &str,
        cols: u16,
        rows: u16,
        recording: bool,
        client: Arc<ClientHandle>,
    ) -> Result<Arc<TerminalSession>, CoreError> {
        if !ALLOWED_SHELLS.contains(&shell) {
            return Err(CoreError::InvalidInput(format!(
                "shell {shell} is not in the allow-list"
            )));
        }

        let per_instance_count = self
            .by_instance
            .get(&instance_id)
            .map(|v| v.len())
            .unwrap_or(0);
        if per_instance_count >= MAX_SESSIONS_PER_INSTANCE {
            return Err(CoreError::Unavailable(format!(
                "instance {instance_id} already has {MAX_SESSIONS_PER_INSTANCE} terminal sessions"
            )));
        }

        let (cols, rows) = self.clamp_size(cols, rows);

        let mut channel = client
            .channel_open_session()
            .await
            .map_err(|e| CoreError::UpstreamUnreachable(format!("open session channel: {e}")))?;

        channel
            .request_pty(
                true,
                "xterm",
                cols as u32,
                rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| CoreError::UpstreamUnreachable(format!("request_pty failed: {e}")))?;

        channel
            .exec(true, shell)
            .await
            .map_err(|e| CoreError::UpstreamUnreachable(format!("starting shell failed: {e}")))?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let info = TerminalSessionInfo {
            id: id.clone(),
            instance_id,
            user_id: user_id.to_string(),
            shell: shell.to_string(),
            state: TerminalState::Starting,
            created_at: now,
            closed_at: None,
            last_activity: now,
            recording,
            cols,
            rows,
        };

        let (output_tx, _) = broadcast::channel(1024);
        let (status_tx, status_rx) = watch::channel(TerminalState::Starting);

        let (read_half, write_half) = channel.split();
        let session = Arc::new(TerminalSession {
            info: RwLock::new(info),
            cancel_token: CancellationToken::new(),
            channel_writer: Arc::new(Mutex::new(ChannelWriter { write_half })),
            output_tx,
            status_tx,
            status_rx,
            rate_limiter: InputRateLimiter::new(
                self.settings.message_rate_limit,
                self.settings.message_rate_burst,
            ),
            recording: recording.then(|| Mutex::new(Vec::new())),
            started_at: std::time::Instant::now(),
        });

        session.status_tx.send_replace(TerminalState::Active);
        session.info.write().await.state = TerminalState::Active;

        self.spawn_reader(id.clone(), read_half, session.clone());
        self.spawn_idle_watchdog(id.clone(), session.clone());

        self.sessions.insert(id.clone(), session.clone());
        self.by_instance.entry(instance_id).or_default().push(id);

        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub async fn list_sessions(&self, instance_id: u64, active_only: bool) -> Vec<TerminalSessionInfo> {
        let ids = self
            .by_instance
            .get(&instance_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for id in ids {
            if let Some(session) = self.sessions.get(&id) {
                let info = session.info.read().await.clone();
                if !active_only || info.state == TerminalState::Active {
                    out.push(info);
                }
            }
        }
        out
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), CoreError> {
        let session = self
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("terminal session {id}")))?;
        let (cols, rows) = self.clamp_size(cols, rows);
        session
            .channel_writer
            .lock()
            .await
            .window_change(cols as u32, rows as u32)
            .await
            .map_err(CoreError::UpstreamUnreachable)?;
        let mut info = session.info.write().await;
        info.cols = cols;
        info.rows = rows;
        info.last_activity = Utc::now();
        Ok(())
    }

    pub async fn close_session(&self, id: &str) -> Result<(), CoreError> {
        let session = self
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("terminal session {id}")))?;
        session.cancel_token.cancel();
        let _ = session.channel_writer.lock().await.close().await;
        session.status_tx.send_replace(TerminalState::Closed);
        let mut info = session.info.write().await;
        info.state = TerminalState::Closed;
        info.closed_at = Some(Utc::now());
        Ok(())
    }

    pub fn remove_session(&self, id: &str) {
        self.sessions.remove(id);
    }

    fn spawn_reader(
        &self,
        id: String,
        mut read_half: russh::ChannelReadHalf<client::Msg>,
        session: Arc<TerminalSession>,
    ) {
        let cancel = session.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = read_half.wait() => match msg {
                        Some(russh::ChannelMsg::Data { data }) => {
                            session.record(RecordingDirection::Output, &data).await;
                            let _ = session.output_tx.send(data.to_vec());
                        }
                        Some(russh::ChannelMsg::ExtendedData { data, .. }) => {
                            session.record(RecordingDirection::Output, &data).await;
                            let _ = session.output_tx.send(data.to_vec());
                        }
                        Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    }
                }
            }
            session.status_tx.send_replace(TerminalState::Closed);
            session.info.write().await.state = TerminalState::Closed;
            debug!("terminal session {id} reader loop ended");
        });
    }

    fn spawn_idle_watchdog(self: &Arc<Self>, id: String, session: Arc<TerminalSession>) {
        let idle_timeout = self.settings.idle_timeout;
        let cancel = session.cancel_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let last_activity = session.info.read().await.last_activity;
                let idle_for = Utc::now().signed_duration_since(last_activity);
                if idle_for.to_std().unwrap_or(Duration::ZERO) >= idle_timeout {
                    warn!("terminal session {id} idle timeout, closing");
                    let _ = session.channel_writer.lock().await.close().await;
                    session.status_tx.send_replace(TerminalState::Closed);
                    let mut info = session.info.write().await;
                    info.state = TerminalState::Closed;
                    info.closed_at = Some(Utc::now());
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings::from_env())
    }

    #[test]
    fn clamp_size_enforces_spec_limits() {
        let manager = TerminalManager::new(test_settings());
        assert_eq!(manager.clamp_size(1000, 500), (512, 256));
        assert_eq!(manager.clamp_size(80, 24), (80, 24));
    }

    #[test]
    fn allowed_shells_matches_spec() {
        assert_eq!(ALLOWED_SHELLS, &["/bin/bash", "/bin/sh", "/bin/zsh"]);
    }

    #[tokio::test]
    async fn list_sessions_empty_for_unknown_instance() {
        let manager = TerminalManager::new(test_settings());
        assert!(manager.list_sessions(999, false).await.is_empty());
    }

    #[tokio::test]
    async fn resize_errors_for_unknown_session() {
        let manager = TerminalManager::new(test_settings());
        let err = manager.resize("ghost", 10, 10).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}
