//! Configuration resolution.
//!
//! Every knob follows the same three-tier priority: an explicit
//! parameter wins, then an environment variable, then a built-in
//! default. Each `resolve_*` function is a free function so call sites
//! can override a single value (e.g. in tests) without touching the
//! rest of `Settings`.

use std::time::Duration;

const HEALTH_INTERVAL_ENV_VAR: &str = "SSHCORE_HEALTH_INTERVAL_SECS";
const HEALTH_FAIL_THRESHOLD_ENV_VAR: &str = "SSHCORE_HEALTH_FAIL_THRESHOLD";
const IDLE_TIMEOUT_ENV_VAR: &str = "SSHCORE_IDLE_TIMEOUT_SECS";
const MAX_TERM_COLS_ENV_VAR: &str = "SSHCORE_MAX_TERM_COLS";
const MAX_TERM_ROWS_ENV_VAR: &str = "SSHCORE_MAX_TERM_ROWS";
const MAX_INPUT_MESSAGE_SIZE_ENV_VAR: &str = "SSHCORE_MAX_INPUT_MESSAGE_SIZE";
const MESSAGE_RATE_LIMIT_ENV_VAR: &str = "SSHCORE_MESSAGE_RATE_LIMIT";
const MESSAGE_RATE_BURST_ENV_VAR: &str = "SSHCORE_MESSAGE_RATE_BURST";
const KEY_ROTATION_POLICY_DAYS_ENV_VAR: &str = "SSHCORE_KEY_ROTATION_POLICY_DAYS";
const AUDIT_RETENTION_DAYS_ENV_VAR: &str = "SSHCORE_AUDIT_RETENTION_DAYS";
const WS_READ_LIMIT_ENV_VAR: &str = "SSHCORE_WS_READ_LIMIT";
const DATA_DIR_ENV_VAR: &str = "SSHCORE_DATA_DIR";
const BIND_ADDR_ENV_VAR: &str = "SSHCORE_BIND_ADDR";
const CONNECT_TIMEOUT_ENV_VAR: &str = "SSHCORE_CONNECT_TIMEOUT_SECS";

fn resolve_u64(param: Option<u64>, env_var: &str, default: u64) -> u64 {
    if let Some(v) = param {
        return v;
    }
    std::env::var(env_var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn resolve_usize(param: Option<usize>, env_var: &str, default: usize) -> usize {
    if let Some(v) = param {
        return v;
    }
    std::env::var(env_var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn resolve_string(param: Option<String>, env_var: &str, default: &str) -> String {
    param
        .or_else(|| std::env::var(env_var).ok())
        .unwrap_or_else(|| default.to_string())
}

pub fn resolve_health_interval(param: Option<Duration>) -> Duration {
    param.unwrap_or_else(|| {
        Duration::from_secs(resolve_u64(None, HEALTH_INTERVAL_ENV_VAR, 30))
    })
}

pub fn resolve_health_fail_threshold(param: Option<u32>) -> u32 {
    resolve_u64(param.map(u64::from), HEALTH_FAIL_THRESHOLD_ENV_VAR, 3) as u32
}

pub fn resolve_idle_timeout(param: Option<Duration>) -> Duration {
    param.unwrap_or_else(|| {
        Duration::from_secs(resolve_u64(None, IDLE_TIMEOUT_ENV_VAR, 30 * 60))
    })
}

pub fn resolve_max_term_cols(param: Option<u16>) -> u16 {
    resolve_u64(param.map(u64::from), MAX_TERM_COLS_ENV_VAR, 512) as u16
}

pub fn resolve_max_term_rows(param: Option<u16>) -> u16 {
    resolve_u64(param.map(u64::from), MAX_TERM_ROWS_ENV_VAR, 256) as u16
}

pub fn resolve_max_input_message_size(param: Option<usize>) -> usize {
    resolve_usize(param, MAX_INPUT_MESSAGE_SIZE_ENV_VAR, 128 * 1024)
}

pub fn resolve_message_rate_limit(param: Option<u32>) -> u32 {
    resolve_u64(param.map(u64::from), MESSAGE_RATE_LIMIT_ENV_VAR, 100) as u32
}

pub fn resolve_message_rate_burst(param: Option<u32>) -> u32 {
    resolve_u64(param.map(u64::from), MESSAGE_RATE_BURST_ENV_VAR, 200) as u32
}

pub fn resolve_key_rotation_policy_days(param: Option<u32>) -> u32 {
    resolve_u64(param.map(u64::from), KEY_ROTATION_POLICY_DAYS_ENV_VAR, 0) as u32
}

pub fn resolve_audit_retention_days(param: Option<u32>) -> u32 {
    resolve_u64(param.map(u64::from), AUDIT_RETENTION_DAYS_ENV_VAR, 90) as u32
}

pub fn resolve_ws_read_limit(param: Option<usize>) -> usize {
    resolve_usize(param, WS_READ_LIMIT_ENV_VAR, 4 * 1024 * 1024)
}

pub fn resolve_connect_timeout(param: Option<Duration>) -> Duration {
    param.unwrap_or_else(|| Duration::from_secs(resolve_u64(None, CONNECT_TIMEOUT_ENV_VAR, 10)))
}

pub fn resolve_data_dir(param: Option<String>) -> String {
    resolve_string(param, DATA_DIR_ENV_VAR, "./data")
}

pub fn resolve_bind_addr(param: Option<String>) -> String {
    resolve_string(param, BIND_ADDR_ENV_VAR, "0.0.0.0:8000")
}

/// Resolved configuration, read once at startup and handed out as an
/// `Arc<Settings>` to every component that needs a knob.
#[derive(Debug, Clone)]
pub struct Settings {
    pub health_interval: Duration,
    pub health_fail_threshold: u32,
    pub idle_timeout: Duration,
    pub max_term_cols: u16,
    pub max_term_rows: u16,
    pub max_input_message_size: usize,
    pub message_rate_limit: u32,
    pub message_rate_burst: u32,
    pub key_rotation_policy_days: u32,
    pub audit_retention_days: u32,
    pub ws_read_limit: usize,
    pub connect_timeout: Duration,
    pub data_dir: String,
    pub bind_addr: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            health_interval: resolve_health_interval(None),
            health_fail_threshold: resolve_health_fail_threshold(None),
            idle_timeout: resolve_idle_timeout(None),
            max_term_cols: resolve_max_term_cols(None),
            max_term_rows: resolve_max_term_rows(None),
            max_input_message_size: resolve_max_input_message_size(None),
            message_rate_limit: resolve_message_rate_limit(None),
            message_rate_burst: resolve_message_rate_burst(None),
            key_rotation_policy_days: resolve_key_rotation_policy_days(None),
            audit_retention_days: resolve_audit_retention_days(None),
            ws_read_limit: resolve_ws_read_limit(None),
            connect_timeout: resolve_connect_timeout(None),
            data_dir: resolve_data_dir(None),
            bind_addr: resolve_bind_addr(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes tests that mutate process env vars.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F: FnOnce()>(key: &str, value: &str, f: F) {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var(key, value);
        }
        f();
        unsafe {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn explicit_param_wins_over_env_and_default() {
        with_env(HEALTH_FAIL_THRESHOLD_ENV_VAR, "9", || {
            assert_eq!(resolve_health_fail_threshold(Some(1)), 1);
        });
    }

    #[test]
    fn env_wins_over_default() {
        with_env(HEALTH_FAIL_THRESHOLD_ENV_VAR, "7", || {
            assert_eq!(resolve_health_fail_threshold(None), 7);
        });
    }

    #[test]
    fn default_when_nothing_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var(HEALTH_FAIL_THRESHOLD_ENV_VAR);
        }
        assert_eq!(resolve_health_fail_threshold(None), 3);
    }

    #[test]
    fn defaults_match_spec_table() {
        assert_eq!(resolve_idle_timeout(None), Duration::from_secs(1800));
        assert_eq!(resolve_max_term_cols(None), 512);
        assert_eq!(resolve_max_term_rows(None), 256);
        assert_eq!(resolve_max_input_message_size(None), 131072);
        assert_eq!(resolve_message_rate_limit(None), 100);
        assert_eq!(resolve_message_rate_burst(None), 200);
        assert_eq!(resolve_audit_retention_days(None), 90);
        assert_eq!(resolve_ws_read_limit(None), 4 * 1024 * 1024);
    }
}
