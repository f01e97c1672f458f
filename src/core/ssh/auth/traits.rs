//! Authentication strategy trait (Strategy pattern).

use async_trait::async_trait;
use russh::client;

use crate::core::ssh::handler::ControlPlaneHandler;

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ControlPlaneHandler>,
        username: &str,
    ) -> Result<bool, String>;

    fn name(&self) -> &'static str;
}
