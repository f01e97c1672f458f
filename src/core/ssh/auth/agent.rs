//! SSH agent authentication: tries every identity the agent offers until
//! one is accepted. Used as a fallback strategy during key migrations
//! (normally the signer's key is used directly via `KeyAuth`).

use async_trait::async_trait;
use russh::client;
use russh::keys::agent::client::AgentClient;
use tracing::debug;

use crate::core::ssh::handler::ControlPlaneHandler;

use super::traits::AuthStrategy;

pub struct AgentAuth;

impl AgentAuth {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AgentAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ControlPlaneHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = AgentClient::connect_env()
            .await
            .map_err(|e| format!("Failed to connect to SSH agent: {e}"))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("Failed to get identities from SSH agent: {e}"))?;

        if identities.is_empty() {
            return Err("No identities found in SSH agent".to_string());
        }

        for identity in identities {
            debug!("Trying SSH agent identity: {:?}", identity.comment());

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => continue,
                Err(e) => {
                    debug!("Agent authentication error: {e}, trying next...");
                    continue;
                }
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}
