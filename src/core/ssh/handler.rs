//! The russh client handler.
//!
//! Accepts every server host key, mirroring `StrictHostKeyChecking=no`.
//! Agents are ephemeral containers with orchestrator-issued host keys
//! that rotate on every recreate, so there is no stable known_hosts
//! entry to check against; this is a deliberate simplification, not an
//! oversight.
//!
//! Also routes inbound `forwarded-tcpip` channels (reverse-forward
//! connections the agent opens back to us after we've asked it to
//! listen on a port via `tcpip_forward`) to whichever tunnel registered
//! interest in that remote port.

use std::sync::Arc;

use dashmap::DashMap;
use russh::{Channel, client, keys};
use tokio::sync::mpsc;
use tracing::debug;

/// Keyed by the remote port a reverse tunnel asked the agent to listen
/// on; each entry receives every `forwarded-tcpip` channel opened for
/// that port for the lifetime of the underlying SSH connection.
pub type ForwardRoutes = Arc<DashMap<u32, mpsc::UnboundedSender<Channel<client::Msg>>>>;

pub fn new_forward_routes() -> ForwardRoutes {
    Arc::new(DashMap::new())
}

pub struct ControlPlaneHandler {
    routes: ForwardRoutes,
}

impl ControlPlaneHandler {
    pub fn new(routes: ForwardRoutes) -> Self {
        Self { routes }
    }
}

impl client::Handler for ControlPlaneHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        match self.routes.get(&connected_port) {
            Some(tx) => {
                debug!(
                    "forwarded-tcpip channel for {connected_address}:{connected_port} from {originator_address}:{originator_port}"
                );
                if tx.send(channel).is_err() {
                    debug!(
                        "no receiver left for reverse tunnel on port {connected_port}, dropping channel"
                    );
                }
            }
            None => {
                debug!(
                    "forwarded-tcpip channel for unregistered port {connected_port}, dropping"
                );
            }
        }
        Ok(())
    }
}
