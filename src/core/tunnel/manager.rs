//! `TunnelManager`: maintains local-port tunnels per SSH
//! session for named services. Local-forward data path uses a
//! `channel_open_direct_tcpip` plus bidirectional `tokio::io::copy`.
//! Reverse forwards ask the agent
//! to forward a remote port back to us via `tcpip_forward`; inbound
//! `forwarded-tcpip` channels are handed to us by
//! `core::ssh::handler::ControlPlaneHandler` and bridged to a local
//! listener the same way.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use russh::{Channel, client::Msg};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::core::error::CoreError;
use crate::core::models::{ServiceName, Tunnel, TunnelKind, TunnelStatus};
use crate::core::ssh::handler::ForwardRoutes;
use crate::core::ssh::manager::ClientHandle;
use crate::core::tunnel::ports::PortAllocator;

const HEALTH_FAIL_THRESHOLD: u32 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A service's well-known remote port and preferred tunnel kind.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSpec {
    pub remote_port: u16,
    pub kind: TunnelKind,
}

pub fn well_known_service(service: &str) -> Option<ServiceSpec> {
    match service {
        "vnc" | "desktop" => Some(ServiceSpec {
            remote_port: 3000,
            kind: TunnelKind::Local,
        }),
        "gateway" | "control" | "chat" => Some(ServiceSpec {
            remote_port: 8080,
            kind: TunnelKind::Local,
        }),
        _ => None,
    }
}

struct OpenTunnel {
    info: RwLock<Tunnel>,
    shutdown: tokio_util::sync::CancellationToken,
    /// Set only for `TunnelKind::Reverse`, so `close()` can drop the
    /// route registration the agent's forwarded channels would
    /// otherwise keep being pushed into.
    reverse_route: Option<(ForwardRoutes, u32)>,
}

pub struct TunnelManager {
    ports: PortAllocator,
    per_instance: DashMap<u64, DashMap<ServiceName, Arc<OpenTunnel>>>,
}

impl TunnelManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: PortAllocator::default_range(),
            per_instance: DashMap::new(),
        })
    }

    /// Clones the `Arc<OpenTunnel>` for a service, if any, without
    /// holding the DashMap shard lock across an `.await`.
    fn existing_tunnel(&self, instance_id: u64, service: &str) -> Option<Arc<OpenTunnel>> {
        self.per_instance
            .get(&instance_id)
            .and_then(|services| services.get(service).map(|e| e.value().clone()))
    }

    fn insert_tunnel(&self, instance_id: u64, service: &str, open: Arc<OpenTunnel>) {
        self.per_instance
            .entry(instance_id)
            .or_insert_with(DashMap::new)
            .insert(service.to_string(), open);
    }

    /// Looks up an existing, non-closed tunnel or opens a new one.
    /// `forward_routes` is only consulted for [`TunnelKind::Reverse`]
    /// services; callers exposing only local/direct services may pass
    /// any routing table, including an empty one.
    pub async fn ensure_tunnel(
        self: &Arc<Self>,
        instance_id: u64,
        service: &str,
        client: Arc<ClientHandle>,
        forward_routes: ForwardRoutes,
    ) -> Result<Tunnel, CoreError> {
        if let Some(existing) = self.existing_tunnel(instance_id, service) {
            let info = existing.info.read().await;
            if info.status != TunnelStatus::Closed {
                return Ok(info.clone());
            }
        }

        let spec = well_known_service(service)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown service {service}")))?;

        let local_port = self.ports.acquire()?;
        let bind_addr: SocketAddr = format!("127.0.0.1:{local_port}")
            .parse()
            .expect("127.0.0.1 with a valid port always parses");
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            self.ports.release(local_port);
            CoreError::Internal(format!("failed to bind tunnel listener: {e}"))
        })?;

        let tunnel = Tunnel {
            label: format!("{instance_id}:{service}"),
            service: service.to_string(),
            kind: spec.kind,
            local_port,
            remote_port: spec.remote_port,
            status: TunnelStatus::Active,
            error: None,
            created_at: Utc::now(),
            last_check: None,
            successful_checks: 0,
            failed_checks: 0,
        };

        let reverse_rx = if spec.kind == TunnelKind::Reverse {
            let (tx, rx) = mpsc::unbounded_channel();
            forward_routes.insert(spec.remote_port as u32, tx);
            client
                .tcpip_forward("0.0.0.0", spec.remote_port as u32)
                .await
                .map_err(|e| {
                    self.ports.release(local_port);
                    forward_routes.remove(&(spec.remote_port as u32));
                    CoreError::UpstreamUnreachable(format!(
                        "tcpip_forward request for port {} failed: {e}",
                        spec.remote_port
                    ))
                })?;
            Some(rx)
        } else {
            None
        };

        let open = Arc::new(OpenTunnel {
            info: RwLock::new(tunnel.clone()),
            shutdown: tokio_util::sync::CancellationToken::new(),
            reverse_route: (spec.kind == TunnelKind::Reverse)
                .then(|| (forward_routes.clone(), spec.remote_port as u32)),
        });

        match (spec.kind, reverse_rx) {
            (TunnelKind::Reverse, Some(rx)) => {
                self.spawn_reverse_accept_loop(listener, rx, open.clone());
            }
            _ => {
                self.spawn_accept_loop(listener, client.clone(), spec.remote_port, open.clone());
            }
        }
        self.spawn_health_loop(instance_id, service.to_string(), open.clone(), self.clone());

        self.insert_tunnel(instance_id, service, open);

        Ok(tunnel)
    }

    /// Returns the local port only for an active, health-positive tunnel.
    pub async fn resolve_port(&self, instance_id: u64, service: &str) -> Result<u16, CoreError> {
        let open = self
            .existing_tunnel(instance_id, service)
            .ok_or_else(|| CoreError::NotFound(format!("no tunnel for {service}")))?;
        let info = open.info.read().await;
        if info.status != TunnelStatus::Active {
            return Err(CoreError::UpstreamUnreachable(format!(
                "tunnel for {service} is not active"
            )));
        }
        Ok(info.local_port)
    }

    /// Opens a single-stream direct channel bypassing any local
    /// listener, for protocols (chat-gateway) that prefer a stream
    /// transport over a TCP-tunnel round trip.
    pub async fn open_direct_channel(
        &self,
        client: &ClientHandle,
        remote_port: u16,
    ) -> Result<russh::ChannelStream<russh::client::Msg>, CoreError> {
        let channel = client
            .channel_open_direct_tcpip("127.0.0.1", remote_port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| CoreError::UpstreamUnreachable(format!("direct channel failed: {e}")))?;
        Ok(channel.into_stream())
    }

    pub async fn tunnels_for_instance(&self, instance_id: u64) -> Vec<Tunnel> {
        let opens: Vec<Arc<OpenTunnel>> = match self.per_instance.get(&instance_id) {
            Some(services) => services.iter().map(|e| e.value().clone()).collect(),
            None => return Vec::new(),
        };
        let mut out = Vec::with_capacity(opens.len());
        for open in opens {
            out.push(open.info.read().await.clone());
        }
        out
    }

    pub async fn close(&self, instance_id: u64) {
        if let Some((_, services)) = self.per_instance.remove(&instance_id) {
            for (_, open) in services.into_iter() {
                open.shutdown.cancel();
                if let Some((routes, port)) = &open.reverse_route {
                    routes.remove(port);
                }
                let mut info = open.info.write().await;
                self.ports.release(info.local_port);
                info.status = TunnelStatus::Closed;
            }
        }
    }

    fn spawn_accept_loop(
        &self,
        listener: TcpListener,
        client: Arc<ClientHandle>,
        remote_port: u16,
        open: Arc<OpenTunnel>,
    ) {
        let shutdown = open.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!("tunnel accepted connection from {addr}");
                                let client = client.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = bridge_local(client, stream, remote_port).await {
                                        debug!("tunnel bridge ended: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("tunnel listener accept error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Pairs each locally-accepted connection (from a proxy shim
    /// dialing `127.0.0.1:local_port`) with the next `forwarded-tcpip`
    /// channel the agent opens for this tunnel's remote port, and
    /// bridges the two. Connections queue on whichever side arrives
    /// first via the listener backlog / the unbounded channel buffer.
    fn spawn_reverse_accept_loop(
        &self,
        listener: TcpListener,
        mut channels: mpsc::UnboundedReceiver<Channel<Msg>>,
        open: Arc<OpenTunnel>,
    ) {
        let shutdown = open.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!("reverse tunnel accepted local connection from {addr}");
                                match channels.recv().await {
                                    Some(channel) => {
                                        tokio::spawn(async move {
                                            if let Err(e) = bridge_reverse(channel, stream).await {
                                                debug!("reverse tunnel bridge ended: {e}");
                                            }
                                        });
                                    }
                                    None => {
                                        warn!("reverse tunnel forward-route channel closed, dropping connection");
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("reverse tunnel listener accept error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_health_loop(
        self: &Arc<Self>,
        instance_id: u64,
        service: String,
        open: Arc<OpenTunnel>,
        manager: Arc<TunnelManager>,
    ) {
        let shutdown = open.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let local_port = open.info.read().await.local_port;
                let ok = tokio::time::timeout(
                    PROBE_TIMEOUT,
                    tokio::net::TcpStream::connect(format!("127.0.0.1:{local_port}")),
                )
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);

                let mut info = open.info.write().await;
                info.last_check = Some(Utc::now());
                if ok {
                    info.successful_checks += 1;
                    info.failed_checks = 0;
                } else {
                    info.failed_checks += 1;
                    if info.failed_checks >= HEALTH_FAIL_THRESHOLD as u64 {
                        info.status = TunnelStatus::Closed;
                        manager.ports.release(local_port);
                        warn!(
                            "tunnel {service} for instance {instance_id} closed after {} failed probes",
                            info.failed_checks
                        );
                        drop(info);
                        break;
                    }
                }
            }
        });
    }
}

async fn bridge_local(
    client: Arc<ClientHandle>,
    local_stream: tokio::net::TcpStream,
    remote_port: u16,
) -> Result<(), String> {
    let channel = client
        .channel_open_direct_tcpip("127.0.0.1", remote_port as u32, "127.0.0.1", 0)
        .await
        .map_err(|e| format!("failed to open direct-tcpip channel: {e}"))?;

    let channel_stream = channel.into_stream();
    let (mut local_read, mut local_write) = tokio::io::split(local_stream);
    let (mut channel_read, mut channel_write) = tokio::io::split(channel_stream);

    let local_to_remote = tokio::io::copy(&mut local_read, &mut channel_write);
    let remote_to_local = tokio::io::copy(&mut channel_read, &mut local_write);

    tokio::select! {
        result = local_to_remote => { if let Err(e) = result { debug!("local->remote copy ended: {e}"); } }
        result = remote_to_local => { if let Err(e) = result { debug!("remote->local copy ended: {e}"); } }
    }

    Ok(())
}

async fn bridge_reverse(
    channel: Channel<Msg>,
    local_stream: tokio::net::TcpStream,
) -> Result<(), String> {
    let channel_stream = channel.into_stream();
    let (mut local_read, mut local_write) = tokio::io::split(local_stream);
    let (mut channel_read, mut channel_write) = tokio::io::split(channel_stream);

    let local_to_remote = tokio::io::copy(&mut local_read, &mut channel_write);
    let remote_to_local = tokio::io::copy(&mut channel_read, &mut local_write);

    tokio::select! {
        result = local_to_remote => { if let Err(e) = result { debug!("local->remote copy ended: {e}"); } }
        result = remote_to_local => { if let Err(e) = result { debug!("remote->local copy ended: {e}"); } }
    }

    Ok(())
}

#[derive(Default)]
pub struct TunnelMetricsSnapshot {
    pub by_service: HashMap<String, Tunnel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_services_map_to_expected_ports() {
        assert_eq!(well_known_service("vnc").unwrap().remote_port, 3000);
        assert_eq!(well_known_service("gateway").unwrap().remote_port, 8080);
        assert!(well_known_service("bogus").is_none());
    }

    #[tokio::test]
    async fn resolve_port_errors_without_a_tunnel() {
        let manager = TunnelManager::new();
        let err = manager.resolve_port(1, "vnc").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn tunnels_for_instance_is_empty_initially() {
        let manager = TunnelManager::new();
        assert!(manager.tunnels_for_instance(1).await.is_empty());
    }
}
