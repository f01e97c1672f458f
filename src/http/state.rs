//! Shared application state, handed to every route handler via poem's
//! `Data` extractor. One instance lives for the life of the process.

use std::sync::Arc;

use crate::core::audit::SharedAuditSink;
use crate::core::config::Settings;
use crate::core::orchestrator::Orchestrator;
use crate::core::rotation::KeyRotation;
use crate::core::ssh::manager::SshManager;
use crate::core::ssh::signer::Signer;
use crate::core::store::SharedInstanceStore;
use crate::core::terminal::manager::TerminalManager;
use crate::core::tunnel::manager::TunnelManager;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub ssh: Arc<SshManager>,
    pub tunnels: Arc<TunnelManager>,
    pub terminals: Arc<TerminalManager>,
    pub store: SharedInstanceStore,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub audit: SharedAuditSink,
    pub signer: Arc<Signer>,
    pub rotation: Arc<KeyRotation>,
}
