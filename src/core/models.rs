//! Data model shared by every component.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Handle to a managed agent, read from persistence per request. The
/// core never owns this; it is handed in by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRef {
    pub id: u64,
    pub name: String,
    pub ssh_key_path: Option<String>,
    pub gateway_token: Option<String>,
    pub custom_log_paths: Option<std::collections::HashMap<String, String>>,
}

/// State-machine value for an `SSHSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Unhealthy,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Unhealthy => "unhealthy",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Observability record appended on every state-machine transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Bounded ring buffer, oldest evicted first. Used for `transitions[]`
/// (cap 100) and the per-instance event log.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    cap: usize,
    items: VecDeque<T>,
}

impl<T> Ring<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            items: VecDeque::with_capacity(cap),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.cap {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn last_n(&self, n: usize) -> Vec<&T>
    where
        T: Clone,
    {
        let len = self.items.len();
        let start = len.saturating_sub(n);
        self.items.iter().skip(start).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Lifecycle event emitted by the SSH manager, tunnel manager, rotation,
/// etc. and recorded into the per-instance `Ring<SessionEvent>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub name: String,
    pub kind: String,
    pub details: String,
    pub at: DateTime<Utc>,
}

/// A named service a tunnel exposes, e.g. `vnc`, `gateway`, `logs`.
pub type ServiceName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Reverse,
    Local,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Opening,
    Active,
    Closed,
}

/// Local TCP listener bound to a remote service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub label: String,
    pub service: ServiceName,
    pub kind: TunnelKind,
    pub local_port: u16,
    pub remote_port: u16,
    pub status: TunnelStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    pub successful_checks: u64,
    pub failed_checks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    Starting,
    Active,
    Idle,
    Closed,
}

/// Metadata for a managed PTY session. The
/// live I/O handles live in `core::terminal::manager::TerminalSession`,
/// not here — this is the serializable projection returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSessionInfo {
    pub id: String,
    pub instance_id: u64,
    pub user_id: String,
    pub shell: String,
    pub state: TerminalState,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub recording: bool,
    pub cols: u16,
    pub rows: u16,
}

/// One entry of a terminal recording: milliseconds since session start,
/// direction, and the raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEntry {
    pub delta_ms: u64,
    pub direction: RecordingDirection,
    #[serde(with = "bytes_as_base64")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingDirection {
    Input,
    Output,
}

mod bytes_as_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Append-only security record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub instance_id: u64,
    pub instance_name: String,
    pub event_type: AuditEventType,
    pub username: String,
    pub source_ip: Option<String>,
    pub details: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Connect,
    Disconnect,
    Exec,
    FileOp,
    Resize,
    Rotation,
    HealthFail,
}

/// SSH identity replaced atomically by rotation.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub private_pem: String,
    pub public_authorized_line: String,
    pub fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let mut ring: Ring<u32> = Ring::new(3);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        ring.push(4);
        let items: Vec<_> = ring.iter().copied().collect();
        assert_eq!(items, vec![2, 3, 4]);
    }

    #[test]
    fn ring_last_n_caps_at_len() {
        let mut ring: Ring<u32> = Ring::new(10);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.last_n(5), vec![&1, &2]);
    }

    #[test]
    fn session_state_serializes_lowercase() {
        let json = serde_json::to_string(&SessionState::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
    }

    #[test]
    fn terminal_state_orders_monotonically() {
        assert!(TerminalState::Starting < TerminalState::Active);
        assert!(TerminalState::Active < TerminalState::Idle);
        assert!(TerminalState::Idle < TerminalState::Closed);
    }

    #[test]
    fn recording_entry_round_trips_through_json() {
        let entry = RecordingEntry {
            delta_ms: 42,
            direction: RecordingDirection::Output,
            bytes: b"hello world".to_vec(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: RecordingEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes, b"hello world");
        assert_eq!(back.delta_ms, 42);
    }
}
