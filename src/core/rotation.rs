//! `KeyRotation`: generates a fresh keypair, probes every
//! currently-running instance with it, and only swaps the on-disk files
//! and the in-memory `Signer` once the probe pass completes — reporting
//! partial success rather than failing the whole rotation if some
//! instances are unreachable. Generalizes the usual reconnect-and-probe
//! idiom from one connection to a fleet-wide pass, and persists the
//! new key with an atomic temp-file-then-rename swap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use russh::keys::{Algorithm, HashAlg, LineEnding, PrivateKey};
use tracing::{info, warn};

use crate::core::error::CoreError;
use crate::core::orchestrator::Orchestrator;
use crate::core::ssh::client::{connect_with_key, probe};
use crate::core::ssh::signer::Signer;
use crate::core::store::SharedInstanceStore;

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub instance_id: u64,
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct RotationReport {
    pub fingerprint: String,
    pub old_fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub probes: Vec<ProbeResult>,
}

impl RotationReport {
    pub fn all_succeeded(&self) -> bool {
        self.probes.iter().all(|p| p.ok)
    }

    pub fn failures(&self) -> Vec<&ProbeResult> {
        self.probes.iter().filter(|p| !p.ok).collect()
    }
}

pub struct KeyRotation {
    signer: Arc<Signer>,
    store: SharedInstanceStore,
    key_path: PathBuf,
}

impl KeyRotation {
    pub fn new(signer: Arc<Signer>, store: SharedInstanceStore, key_path: impl Into<PathBuf>) -> Self {
        Self {
            signer,
            store,
            key_path: key_path.into(),
        }
    }

    /// Generate a new Ed25519 key, probe every instance the store knows
    /// about over its SSH endpoint, and — if at least one instance
    /// accepted the new key, or there were no instances to probe at all
    /// — write the new key to disk and swap it into the signer.
    ///
    /// An instance that fails the probe keeps authenticating with the
    /// previous key until its own reconnect picks up the rotated one;
    /// rotation does not force a reconnect.
    pub async fn rotate(
        &self,
        orchestrator: &dyn Orchestrator,
    ) -> Result<RotationReport, CoreError> {
        let old_fingerprint = fingerprint_of(&self.signer.current().await);

        let new_key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .map_err(|e| CoreError::Internal(format!("failed to generate rotation key: {e}")))?;

        let instance_ids = self.store.list_ids().await;
        let mut probes = Vec::with_capacity(instance_ids.len());

        for id in instance_ids {
            let Some(instance) = self.store.get(id).await else {
                continue;
            };
            let probe_result = match orchestrator.ssh_endpoint(&instance.name).await {
                Ok((host, port)) => {
                    let address = format!("{host}:{port}");
                    probe_new_key(&address, &new_key).await
                }
                Err(e) => Err(e.to_string()),
            };
            probes.push(match probe_result {
                Ok(()) => ProbeResult {
                    instance_id: id,
                    name: instance.name,
                    ok: true,
                    detail: "probe succeeded".to_string(),
                },
                Err(detail) => ProbeResult {
                    instance_id: id,
                    name: instance.name,
                    ok: false,
                    detail,
                },
            });
        }

        let any_reachable = probes.is_empty() || probes.iter().any(|p| p.ok);
        if !any_reachable {
            warn!("key rotation aborted: no instance accepted the new key");
            return Err(CoreError::Unavailable(
                "no running instance accepted the rotated key".to_string(),
            ));
        }

        persist_key(&self.key_path, &new_key)?;
        self.signer.swap(new_key).await;

        let fingerprint = fingerprint_of(&self.signer.current().await);
        let timestamp = Utc::now();
        info!("key rotation complete, fingerprint {fingerprint}");

        Ok(RotationReport {
            fingerprint,
            old_fingerprint,
            timestamp,
            probes,
        })
    }
}

async fn probe_new_key(address: &str, key: &PrivateKey) -> Result<(), String> {
    let connected = connect_with_key(
        address,
        "root",
        Arc::new(key.clone()),
        Duration::from_secs(10),
    )
    .await?;
    probe(&connected.handle, Duration::from_secs(2)).await
}

/// Write the new keypair (private and public) to temp files in the
/// same directory, `fsync` each, then `rename` both over their real
/// paths and `fsync` the directory, so a crash mid-rotation never
/// leaves a half-written or mismatched keypair in place.
fn persist_key(path: &Path, key: &PrivateKey) -> Result<(), CoreError> {
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| CoreError::Internal(format!("failed to encode rotated key: {e}")))?;
    let public = key
        .public_key()
        .to_openssh()
        .map_err(|e| CoreError::Internal(format!("failed to encode rotated public key: {e}")))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let pub_path = path.with_extension("pub");
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("key")
    ));
    let pub_tmp_path = dir.join(format!(
        ".{}.tmp",
        pub_path.file_name().and_then(|n| n.to_str()).unwrap_or("key.pub")
    ));

    std::fs::write(&tmp_path, pem.as_bytes())
        .map_err(|e| CoreError::Internal(format!("writing temp key file: {e}")))?;
    fsync_path(&tmp_path)?;
    std::fs::write(&pub_tmp_path, format!("{public}\n"))
        .map_err(|e| CoreError::Internal(format!("writing temp public key file: {e}")))?;
    fsync_path(&pub_tmp_path)?;

    std::fs::rename(&tmp_path, path)
        .map_err(|e| CoreError::Internal(format!("renaming rotated key into place: {e}")))?;
    std::fs::rename(&pub_tmp_path, &pub_path)
        .map_err(|e| CoreError::Internal(format!("renaming rotated public key into place: {e}")))?;
    fsync_path(dir)?;
    Ok(())
}

fn fsync_path(path: &Path) -> Result<(), CoreError> {
    std::fs::File::open(path)
        .and_then(|f| f.sync_all())
        .map_err(|e| CoreError::Internal(format!("fsync {path:?}: {e}")))
}

fn fingerprint_of(key: &PrivateKey) -> String {
    key.public_key().fingerprint(HashAlg::Sha256).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_report_all_succeeded_when_empty() {
        let report = RotationReport {
            fingerprint: "x".to_string(),
            old_fingerprint: "y".to_string(),
            timestamp: Utc::now(),
            probes: Vec::new(),
        };
        assert!(report.all_succeeded());
        assert!(report.failures().is_empty());
    }

    #[test]
    fn rotation_report_flags_partial_failure() {
        let report = RotationReport {
            fingerprint: "x".to_string(),
            old_fingerprint: "y".to_string(),
            timestamp: Utc::now(),
            probes: vec![
                ProbeResult {
                    instance_id: 1,
                    name: "a".to_string(),
                    ok: true,
                    detail: "ok".to_string(),
                },
                ProbeResult {
                    instance_id: 2,
                    name: "b".to_string(),
                    ok: false,
                    detail: "unreachable".to_string(),
                },
            ],
        };
        assert!(!report.all_succeeded());
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].name, "b");
    }
}
