//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `AUTOROBOT_MAX_SEQUENCES`, `AUTOROBOT_LOOP`,
//!    `AUTOROBOT_STOP_ON_FAILURE`
//! 2. **Config file** — path via `--config <path>`, or `autorobot.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below, taken
//!    from the tunables the original tool shipped with
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [run]
//! max_sequences = 5
//! loop_iterations = 1
//! stop_on_failure = false
//! log_enabled = false
//!
//! [timeouts]
//! ssh_connect_secs = 30.0
//! telnet_connect_secs = 20.0
//! connect_host_secs = 5.0
//! default_connect_secs = 15.0
//! local_command_secs = 60.0
//! remote_command_secs = 120.0
//! intershell_command_secs = 300.0
//!
//! [retry]
//! session_connect_retry = 3
//! session_recover_retry = 3
//! session_prompt_retry = 4
//! session_prompt_retry_timeout_secs = 5.0
//!
//! [master]
//! window_refresh_interval_secs = 5.0
//! ipc_send_retry_secs = 90.0
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Top-level run behavior, overridable per-invocation by CLI flags.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Maximum concurrently tracked worker processes (default 5).
    #[serde(default = "default_max_sequences")]
    pub max_sequences: usize,
    /// Default loop count when `-l` is not given (default 1).
    #[serde(default = "default_loop_iterations")]
    pub loop_iterations: u32,
    /// Stop the worker on the first expect failure (default false).
    #[serde(default)]
    pub stop_on_failure: bool,
    /// Enable per-worker transcript file logging (default false).
    #[serde(default)]
    pub log_enabled: bool,
    /// Offset range used when jittering prompt probe retries (default 16).
    #[serde(default = "default_prompt_offset_range")]
    pub prompt_offset_range: u32,
}

/// Per-connect-method and per-command-kind timeouts, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_ssh_timeout")]
    pub ssh_connect_secs: f64,
    #[serde(default = "default_telnet_timeout")]
    pub telnet_connect_secs: f64,
    #[serde(default = "default_connect_host_timeout")]
    pub connect_host_secs: f64,
    #[serde(default = "default_connect_timeout")]
    pub default_connect_secs: f64,
    #[serde(default = "default_local_command_timeout")]
    pub local_command_secs: f64,
    #[serde(default = "default_remote_command_timeout")]
    pub remote_command_secs: f64,
    #[serde(default = "default_intershell_command_timeout")]
    pub intershell_command_secs: f64,
    #[serde(default = "default_host_ping_timeout")]
    pub host_ping_secs: f64,
    #[serde(default = "default_send_intr_timeout")]
    pub send_intr_secs: f64,
    #[serde(default = "default_wait_passphrase_timeout")]
    pub wait_passphrase_secs: f64,
    #[serde(default = "default_delay_after_quit")]
    pub delay_after_quit_secs: f64,
    #[serde(default = "default_delay_before_prompt_flush")]
    pub delay_before_prompt_flush_secs: f64,
    #[serde(default = "default_bootup_watch_period")]
    pub bootup_watch_period_secs: f64,
    #[serde(default = "default_bootup_watch_timeout")]
    pub bootup_watch_timeout_secs: f64,
}

/// Retry budgets for connect/recover/prompt-probe loops.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_session_connect_retry")]
    pub session_connect_retry: u32,
    #[serde(default = "default_session_recover_retry")]
    pub session_recover_retry: u32,
    #[serde(default = "default_session_prompt_retry")]
    pub session_prompt_retry: u32,
    #[serde(default = "default_session_prompt_retry_timeout")]
    pub session_prompt_retry_timeout_secs: f64,
}

/// Master scheduler tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    #[serde(default = "default_window_refresh_interval")]
    pub window_refresh_interval_secs: f64,
    #[serde(default = "default_ipc_send_retry")]
    pub ipc_send_retry_secs: f64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_sequences() -> usize {
    5
}
fn default_loop_iterations() -> u32 {
    1
}
fn default_prompt_offset_range() -> u32 {
    16
}
fn default_ssh_timeout() -> f64 {
    30.0
}
fn default_telnet_timeout() -> f64 {
    20.0
}
fn default_connect_host_timeout() -> f64 {
    5.0
}
fn default_connect_timeout() -> f64 {
    15.0
}
fn default_local_command_timeout() -> f64 {
    60.0
}
fn default_remote_command_timeout() -> f64 {
    120.0
}
fn default_intershell_command_timeout() -> f64 {
    300.0
}
fn default_host_ping_timeout() -> f64 {
    8.0
}
fn default_send_intr_timeout() -> f64 {
    0.6
}
fn default_wait_passphrase_timeout() -> f64 {
    5.0
}
fn default_delay_after_quit() -> f64 {
    0.8
}
fn default_delay_before_prompt_flush() -> f64 {
    0.2
}
fn default_bootup_watch_period() -> f64 {
    30.0
}
fn default_bootup_watch_timeout() -> f64 {
    600.0
}
fn default_session_connect_retry() -> u32 {
    3
}
fn default_session_recover_retry() -> u32 {
    3
}
fn default_session_prompt_retry() -> u32 {
    4
}
fn default_session_prompt_retry_timeout() -> f64 {
    5.0
}
fn default_window_refresh_interval() -> f64 {
    5.0
}
fn default_ipc_send_retry() -> f64 {
    90.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_sequences: default_max_sequences(),
            loop_iterations: default_loop_iterations(),
            stop_on_failure: false,
            log_enabled: false,
            prompt_offset_range: default_prompt_offset_range(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ssh_connect_secs: default_ssh_timeout(),
            telnet_connect_secs: default_telnet_timeout(),
            connect_host_secs: default_connect_host_timeout(),
            default_connect_secs: default_connect_timeout(),
            local_command_secs: default_local_command_timeout(),
            remote_command_secs: default_remote_command_timeout(),
            intershell_command_secs: default_intershell_command_timeout(),
            host_ping_secs: default_host_ping_timeout(),
            send_intr_secs: default_send_intr_timeout(),
            wait_passphrase_secs: default_wait_passphrase_timeout(),
            delay_after_quit_secs: default_delay_after_quit(),
            delay_before_prompt_flush_secs: default_delay_before_prompt_flush(),
            bootup_watch_period_secs: default_bootup_watch_period(),
            bootup_watch_timeout_secs: default_bootup_watch_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            session_connect_retry: default_session_connect_retry(),
            session_recover_retry: default_session_recover_retry(),
            session_prompt_retry: default_session_prompt_retry(),
            session_prompt_retry_timeout_secs: default_session_prompt_retry_timeout(),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            window_refresh_interval_secs: default_window_refresh_interval(),
            ipc_send_retry_secs: default_ipc_send_retry(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            master: MasterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure, since the
    /// user asked for it explicitly). Otherwise looks for `autorobot.toml`
    /// in the current directory, falling back to compiled defaults.
    #[must_use]
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("autorobot.toml").exists() {
            let content =
                std::fs::read_to_string("autorobot.toml").expect("Failed to read autorobot.toml");
            toml::from_str(&content).expect("Failed to parse autorobot.toml")
        } else {
            Config::default()
        };

        if let Ok(v) = std::env::var("AUTOROBOT_MAX_SEQUENCES") {
            if let Ok(n) = v.parse() {
                config.run.max_sequences = n;
            }
        }
        if let Ok(v) = std::env::var("AUTOROBOT_LOOP") {
            if let Ok(n) = v.parse() {
                config.run.loop_iterations = n;
            }
        }
        if let Ok(v) = std::env::var("AUTOROBOT_STOP_ON_FAILURE") {
            config.run.stop_on_failure = v == "1" || v.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Validate the loaded configuration, returning a list of human-readable
    /// problems (empty if none). Callers print these and exit non-zero.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.run.max_sequences == 0 {
            errors.push("run.max_sequences must be at least 1".to_string());
        }
        if self.retry.session_prompt_retry_timeout_secs <= 0.0 {
            errors.push("retry.session_prompt_retry_timeout_secs must be positive".to_string());
        }
        if self.master.window_refresh_interval_secs <= 0.0 {
            errors.push("master.window_refresh_interval_secs must be positive".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_expected_tunables() {
        let config = Config::default();
        assert_eq!(config.run.max_sequences, 5);
        assert_eq!(config.retry.session_connect_retry, 3);
        assert_eq!(config.retry.session_prompt_retry, 4);
    }

    #[test]
    fn test_validate_rejects_zero_max_sequences() {
        let mut config = Config::default();
        config.run.max_sequences = 0;
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn test_validate_passes_on_defaults() {
        assert!(Config::default().validate().is_empty());
    }
}
