//! SSH tunnel and proxy core for the control plane.
//!
//! This crate owns the hard, stateful part of talking to a fleet of
//! agent containers over SSH: connection lifecycle, port tunnels,
//! terminal sessions, the HTTP/WebSocket proxy shims that bridge
//! browser traffic onto those tunnels, key rotation, and audit
//! logging. Everything that lives outside that boundary (the HTTP
//! router's own auth middleware, persistence, the orchestrator
//! backends) is consumed through small traits defined here.

pub mod core;
pub mod http;
