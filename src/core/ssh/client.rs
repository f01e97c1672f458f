//! Low-level dial/authenticate/probe/exec primitives for the control
//! plane's SSH connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::{ChannelMsg, client};
use tracing::{info, warn};

use crate::core::error::is_retryable_error;
use crate::core::ssh::auth::KeyAuth;
use crate::core::ssh::handler::{ControlPlaneHandler, ForwardRoutes, new_forward_routes};
use crate::core::ssh::signer::Signer;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

pub(crate) fn build_client_config(timeout: Duration) -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: Some(timeout),
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Parse `host:port`, defaulting to port 22. Uses `rsplit_once` so
/// bracketed IPv6 addresses (`[::1]:22`) parse correctly.
pub(crate) fn parse_address(address: &str) -> Result<(String, u16), String> {
    if let Some((host, port_str)) = address.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {e}"))?;
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), 22))
    }
}

pub struct ConnectOutcome {
    pub handle: client::Handle<ControlPlaneHandler>,
    pub forward_routes: ForwardRoutes,
    pub retry_count: u32,
}

/// Dial and authenticate with the signer's current key, retrying
/// transient failures with exponential backoff and jitter. Never
/// retries an authentication failure.
pub(crate) async fn connect_with_retry(
    address: &str,
    username: &str,
    signer: &Signer,
    connect_timeout: Duration,
    max_retries: u32,
    min_delay: Duration,
) -> Result<ConnectOutcome, String> {
    let attempt_counter = AtomicU32::new(0);
    let address = address.to_string();
    let username = username.to_string();

    let backoff = ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if current_attempt > 0 {
            warn!(
                "SSH connection retry attempt {} to {}@{}",
                current_attempt, username, address
            );
        }
        connect_once(&address, &username, signer, connect_timeout).await
    })
    .retry(backoff)
    .when(|e| is_retryable_error(e))
    .notify(|err, dur| {
        warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_count = total_attempts.saturating_sub(1);

    match result {
        Ok(connected) => {
            if retry_count > 0 {
                info!(
                    "SSH connection to {}@{} succeeded after {} retry attempt(s)",
                    username, address, retry_count
                );
            }
            Ok(ConnectOutcome {
                handle: connected.handle,
                forward_routes: connected.forward_routes,
                retry_count,
            })
        }
        Err(e) => Err(format!(
            "SSH connection failed after {total_attempts} attempt(s). Last error: {e}"
        )),
    }
}

pub(crate) struct Connected {
    pub handle: client::Handle<ControlPlaneHandler>,
    pub forward_routes: ForwardRoutes,
}

async fn connect_once(
    address: &str,
    username: &str,
    signer: &Signer,
    timeout: Duration,
) -> Result<Connected, String> {
    let key = signer.current().await;
    connect_with_key(address, username, key, timeout).await
}

/// Dial and authenticate with an explicit key rather than the shared
/// signer's current one, for callers (key rotation) that need to probe
/// a candidate key before it is installed.
pub(crate) async fn connect_with_key(
    address: &str,
    username: &str,
    key: Arc<russh::keys::PrivateKey>,
    timeout: Duration,
) -> Result<Connected, String> {
    let config = build_client_config(timeout);
    let forward_routes = new_forward_routes();
    let handler = ControlPlaneHandler::new(forward_routes.clone());

    let (host, port) = parse_address(address)?;

    let connect_future = client::connect(config, (host.as_str(), port), handler);
    let mut handle = tokio::time::timeout(timeout, connect_future)
        .await
        .map_err(|_| format!("Connection timed out after {timeout:?}"))?
        .map_err(|e| format!("Failed to connect: {e}"))?;

    let auth = KeyAuth::new(key);
    let ok = {
        use crate::core::ssh::auth::AuthStrategy;
        auth.authenticate(&mut handle, username)
            .await
            .map_err(|e| format!("Authentication failed: {e}"))?
    };

    if !ok {
        return Err("Authentication failed: key rejected".to_string());
    }

    Ok(Connected {
        handle,
        forward_routes,
    })
}

/// Run `echo ok` as the liveness probe used both by `EnsureConnected`
/// and the health loop.
pub(crate) async fn probe(
    handle: &client::Handle<ControlPlaneHandler>,
    timeout: Duration,
) -> Result<(), String> {
    let output = exec(handle, "echo ok", timeout).await?;
    if output.exit_code == Some(0) && output.stdout.trim() == "ok" {
        Ok(())
    } else {
        Err(format!(
            "probe failed: exit_code={:?} stdout={:?}",
            output.exit_code, output.stdout
        ))
    }
}

pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
    pub timed_out: bool,
}

/// Execute a command, collecting stdout/stderr. On timeout, returns
/// partial output with `timed_out: true` instead of erroring, keeping
/// the session alive.
pub(crate) async fn exec(
    handle: &client::Handle<ControlPlaneHandler>,
    command: &str,
    timeout: Duration,
) -> Result<ExecOutput, String> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| format!("Failed to open channel: {e}"))?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| format!("Failed to execute command: {e}"))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code: Option<u32> = None;
    let mut timed_out = false;

    let result = tokio::time::timeout(timeout, async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Eof) => {
                    if exit_code.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) => break,
                Some(_) => {}
                None => break,
            }
        }
    })
    .await;

    if result.is_err() {
        timed_out = true;
    }

    let _ = channel.close().await;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let (host, port) = parse_address("192.168.1.1:22").unwrap();
        assert_eq!(host, "192.168.1.1");
        assert_eq!(port, 22);
    }

    #[test]
    fn defaults_to_port_22_without_colon() {
        let (host, port) = parse_address("example.com").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 22);
    }

    #[test]
    fn handles_bracketed_ipv6() {
        let (host, port) = parse_address("[::1]:2222").unwrap();
        assert_eq!(host, "[::1]");
        assert_eq!(port, 2222);
    }

    #[test]
    fn rejects_invalid_port() {
        assert!(parse_address("host:notaport").is_err());
    }
}
