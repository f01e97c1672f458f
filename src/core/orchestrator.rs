//! The container orchestrator boundary. The core consumes only this
//! capability set; Docker and Kubernetes-API-proxy adapters are
//! variants outside this crate's concern. A mock is provided for tests.

use async_trait::async_trait;

use super::error::CoreError;

#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub running: bool,
    pub detail: String,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Resolve the SSH endpoint for a named instance.
    async fn ssh_endpoint(&self, name: &str) -> Result<(String, u16), CoreError>;

    /// Current orchestrator-level status of the instance (not the SSH
    /// session state — whether the container itself is running).
    async fn status(&self, name: &str) -> Result<InstanceStatus, CoreError>;

    /// Execute a one-off command through the orchestrator's own exec
    /// facility (distinct from an SSH-channel exec).
    async fn exec(&self, name: &str, argv: &[String]) -> Result<String, CoreError>;

    /// URL of the in-agent gateway WebSocket service.
    async fn gateway_url(&self, name: &str) -> Result<String, CoreError>;
}

/// Minimal Docker-backed orchestrator. Resolution of the actual
/// container inspection logic is left to the deployment; this adapter
/// only shapes the trait boundary the rest of the core depends on.
pub struct DockerOrchestrator {
    pub docker_host: String,
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn ssh_endpoint(&self, name: &str) -> Result<(String, u16), CoreError> {
        Err(CoreError::Unavailable(format!(
            "docker orchestrator endpoint resolution not wired for {name} (host {})",
            self.docker_host
        )))
    }

    async fn status(&self, name: &str) -> Result<InstanceStatus, CoreError> {
        Err(CoreError::Unavailable(format!(
            "docker orchestrator status not wired for {name}"
        )))
    }

    async fn exec(&self, name: &str, _argv: &[String]) -> Result<String, CoreError> {
        Err(CoreError::Unavailable(format!(
            "docker orchestrator exec not wired for {name}"
        )))
    }

    async fn gateway_url(&self, name: &str) -> Result<String, CoreError> {
        Err(CoreError::Unavailable(format!(
            "docker orchestrator gateway_url not wired for {name}"
        )))
    }
}

/// Orchestrator test double driven entirely by in-memory maps.
#[derive(Default)]
pub struct MockOrchestrator {
    pub endpoints: dashmap::DashMap<String, (String, u16)>,
    pub statuses: dashmap::DashMap<String, InstanceStatus>,
    pub gateway_urls: dashmap::DashMap<String, String>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(self, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        self.endpoints.insert(name.into(), (host.into(), port));
        self
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn ssh_endpoint(&self, name: &str) -> Result<(String, u16), CoreError> {
        self.endpoints
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("no endpoint for {name}")))
    }

    async fn status(&self, name: &str) -> Result<InstanceStatus, CoreError> {
        self.statuses
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("no status for {name}")))
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<String, CoreError> {
        Ok(format!("mock exec on {name}: {}", argv.join(" ")))
    }

    async fn gateway_url(&self, name: &str) -> Result<String, CoreError> {
        self.gateway_urls
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("no gateway url for {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_resolves_registered_endpoint() {
        let orch = MockOrchestrator::new().with_endpoint("agent-1", "10.0.0.5", 22);
        let (host, port) = orch.ssh_endpoint("agent-1").await.unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 22);
    }

    #[tokio::test]
    async fn mock_errors_on_unknown_instance() {
        let orch = MockOrchestrator::new();
        let err = orch.ssh_endpoint("ghost").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}
