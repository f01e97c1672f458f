//! Authentication using an in-memory private key (the shared signer).
//!
//! Uses an already-loaded `Arc<PrivateKey>` rather than a key file path,
//! since the key here comes from `core::ssh::signer::Signer`, not a
//! per-call path.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::keys::PrivateKey;
use tracing::debug;

use crate::core::ssh::handler::ControlPlaneHandler;

use super::traits::AuthStrategy;

pub struct KeyAuth {
    key: Arc<PrivateKey>,
}

impl KeyAuth {
    pub fn new(key: Arc<PrivateKey>) -> Self {
        Self { key }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ControlPlaneHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = russh::keys::PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {e}"))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
