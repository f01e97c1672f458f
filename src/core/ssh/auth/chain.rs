//! Authentication chain that tries multiple strategies in order, the
//! first success wins.

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::core::ssh::handler::ControlPlaneHandler;

use super::traits::AuthStrategy;

pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn AuthStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ControlPlaneHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFail;

    #[async_trait]
    impl AuthStrategy for AlwaysFail {
        async fn authenticate(
            &self,
            _handle: &mut client::Handle<ControlPlaneHandler>,
            _username: &str,
        ) -> Result<bool, String> {
            Ok(false)
        }

        fn name(&self) -> &'static str {
            "always-fail"
        }
    }

    #[test]
    fn empty_chain_reports_empty() {
        let chain = AuthChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
    }

    #[test]
    fn with_strategy_grows_len() {
        let chain = AuthChain::new().with_strategy(Box::new(AlwaysFail));
        assert_eq!(chain.len(), 1);
        assert!(!chain.is_empty());
    }

    #[test]
    fn default_is_empty() {
        assert!(AuthChain::default().is_empty());
    }
}
