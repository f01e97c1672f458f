#![deny(clippy::unwrap_used)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use poem::{Server, listener::TcpListener};
use tracing::info;

use sshcore::core::audit::InMemoryAuditSink;
use sshcore::core::config::Settings;
use sshcore::core::orchestrator::DockerOrchestrator;
use sshcore::core::rotation::KeyRotation;
use sshcore::core::ssh::manager::SshManager;
use sshcore::core::ssh::signer::Signer;
use sshcore::core::store::InMemoryInstanceStore;
use sshcore::core::terminal::manager::TerminalManager;
use sshcore::core::tunnel::manager::TunnelManager;
use sshcore::http::{AppState, build_route};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let settings = Arc::new(Settings::from_env());

    let key_path = Path::new(&settings.data_dir).join("ssh_key");
    let signer = Arc::new(match Signer::load(&key_path) {
        Ok(signer) => signer,
        Err(e) => {
            tracing::warn!(
                "no usable SSH key at {key_path:?} ({e}), generating a fresh one"
            );
            generate_initial_keypair(&key_path)?;
            Signer::load(&key_path)?
        }
    });

    let ssh = SshManager::new(settings.clone(), signer.clone());
    let tunnels = TunnelManager::new();
    let terminals = TerminalManager::new(settings.clone());
    let store: Arc<dyn sshcore::core::store::InstanceStore> = Arc::new(InMemoryInstanceStore::new());
    let orchestrator: Arc<dyn sshcore::core::orchestrator::Orchestrator> =
        Arc::new(DockerOrchestrator {
            docker_host: std::env::var("DOCKER_HOST").unwrap_or_else(|_| "unix:///var/run/docker.sock".to_string()),
        });
    let audit = InMemoryAuditSink::new();
    let rotation = Arc::new(KeyRotation::new(signer.clone(), store.clone(), key_path));

    let state = AppState {
        settings: settings.clone(),
        ssh,
        tunnels,
        terminals,
        store,
        orchestrator,
        audit,
        signer,
        rotation,
    };

    if settings.key_rotation_policy_days > 0 {
        spawn_scheduled_rotation(state.clone());
    }

    let route = build_route(state);

    info!("sshcore listening on {}", settings.bind_addr);
    Server::new(TcpListener::bind(settings.bind_addr.clone()))
        .name("sshcore")
        .run(route)
        .await?;

    Ok(())
}

/// Runs the scheduled-rotation variant of key rotation: a background
/// loop that fires `KeyRotation::rotate` once every
/// `key_rotation_policy_days`, independent of the on-demand
/// `/rotate-ssh-key` endpoint. The first tick is deferred by a full
/// interval so rotation doesn't fire immediately on process start.
fn spawn_scheduled_rotation(state: AppState) {
    let policy_days = state.settings.key_rotation_policy_days as u64;
    let interval = Duration::from_secs(policy_days * 24 * 60 * 60);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            info!("scheduled key rotation starting ({policy_days}-day policy)");
            match state.rotation.rotate(state.orchestrator.as_ref()).await {
                Ok(report) => info!(
                    "scheduled key rotation complete: {} -> {}",
                    report.old_fingerprint, report.fingerprint
                ),
                Err(e) => tracing::warn!("scheduled key rotation failed: {e}"),
            }
        }
    });
}

/// Write a fresh Ed25519 keypair to `key_path` (mode 0600) the first
/// time the process starts with no key on disk yet.
fn generate_initial_keypair(key_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    use russh::keys::{Algorithm, PrivateKey, LineEnding};

    if let Some(dir) = key_path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)?;
    let pem = key.to_openssh(LineEnding::LF)?;
    std::fs::write(key_path, pem.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let public = key.public_key().to_openssh()?;
    let pub_path = key_path.with_extension("pub");
    std::fs::write(&pub_path, format!("{public}\n"))?;

    Ok(())
}
