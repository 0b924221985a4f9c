//! Connect FSM: derive target/timeout from a `Connect` step, negotiate
//! login over up to `session_connect_retry` attempts, then probe the new
//! frame's line separator and prompt before pushing it.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{ErrorKind, Result};
use crate::prompt;
use crate::sequence::{CommandKind, ConnectInfo, ParsedCommand};

use super::{Frame, SessionAgent};

static LOGIN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r": {0,3}$", r"\? {0,3}$"]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
});
static INPUT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"\$ {0,3}$", r"# {0,3}$", r"> {0,3}$"]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
});

static TIMEOUT_EXPIRED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timeout.*expired").expect("valid regex"));
static CONNECTION_REFUSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)connection refused").expect("valid regex"));
static YES_NO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(yes/no\)\?\s*$").expect("valid regex"));
static HOST_KEY_CHANGED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)remote host identification has changed").expect("valid regex"));
static LOGIN_PROMPT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(login|user):\s*$").expect("valid regex"));
static PASSWORD_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(password|pass ?phrase):\s*$").expect("valid regex"));

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConnectMethod {
    Ssh,
    Telnet,
    ConnectHost,
}

struct Derived {
    method: ConnectMethod,
    target_host: String,
    serial_port_mode: bool,
    connect_timeout: f64,
}

fn derive(agent: &SessionAgent, cmd: &ParsedCommand) -> Derived {
    let argv = &cmd.argv;
    let method = match argv.first().map(String::as_str) {
        Some("ssh") => ConnectMethod::Ssh,
        Some("telnet") => ConnectMethod::Telnet,
        _ => ConnectMethod::ConnectHost,
    };
    let target_host = match method {
        ConnectMethod::Ssh => argv
            .get(1)
            .and_then(|a| a.split('@').next_back())
            .unwrap_or_default()
            .to_string(),
        ConnectMethod::Telnet => argv.get(1).cloned().unwrap_or_default(),
        ConnectMethod::ConnectHost => argv.get(2).cloned().unwrap_or_default(),
    };
    let serial_port_mode = method == ConnectMethod::Telnet
        && argv
            .get(2)
            .and_then(|p| p.parse::<u32>().ok())
            .is_some_and(|port| port >= 2003);
    let default_timeout = match method {
        ConnectMethod::Ssh => agent.config().timeouts.ssh_connect_secs,
        ConnectMethod::Telnet => agent.config().timeouts.telnet_connect_secs,
        ConnectMethod::ConnectHost => agent.config().timeouts.connect_host_secs,
    };
    let connect_timeout = cmd.timeout.unwrap_or(default_timeout);
    Derived {
        method,
        target_host,
        serial_port_mode,
        connect_timeout,
    }
}

enum StepOutcome {
    Connected(String),
    RsaRetry,
    Refused,
}

/// Run the Connect FSM for one `Connect` step, pushing a new `Frame` on
/// success.
pub async fn connect(agent: &mut SessionAgent, cmd: &ParsedCommand) -> Result<()> {
    let CommandKind::Connect(info) = &cmd.kind else {
        return Err(ErrorKind::Connection {
            detail: "connect() called on a non-connect step".into(),
        });
    };
    let info = info.clone();
    let derived = derive(agent, cmd);
    let retry_budget = agent.config().retry.session_connect_retry;

    let mut attempts_used = 0;
    let mut password_sent = false;
    loop {
        match attempt_once(agent, cmd, &derived, &info, &mut password_sent).await {
            Ok(StepOutcome::Connected(prompt_candidate)) => {
                finish_connect(agent, &derived, &info, cmd, prompt_candidate).await?;
                return Ok(());
            }
            Ok(StepOutcome::RsaRetry) => continue, // does not consume budget
            Ok(StepOutcome::Refused) | Err(_) => {
                attempts_used += 1;
                if attempts_used >= retry_budget {
                    return Err(ErrorKind::Connection {
                        detail: format!("exhausted {retry_budget} connect attempts to {}", derived.target_host),
                    });
                }
            }
        }
    }
}

async fn attempt_once(
    agent: &mut SessionAgent,
    cmd: &ParsedCommand,
    derived: &Derived,
    info: &ConnectInfo,
    password_sent: &mut bool,
) -> Result<StepOutcome> {
    if agent.stack.is_empty() {
        agent.spawn_pty(&cmd.argv, ".")?;
    } else {
        let ping_cmd = format!("ping -c 2 {}", derived.target_host);
        let out = agent
            .run_command(&ping_cmd, &[], &[], agent.config().timeouts.host_ping_secs)
            .await?;
        if !ping_succeeded(&out.text) {
            return Err(ErrorKind::Connection {
                detail: format!("host {} unreachable", derived.target_host),
            });
        }
        agent.ensure_send_line(&cmd.argv.join(" "), true).await?;
    }

    let use_input_prompts = derived.serial_port_mode || derived.method == ConnectMethod::ConnectHost;
    if use_input_prompts {
        agent.ensure_send_line("", false).await?;
    }

    negotiate(agent, derived, info, password_sent).await
}

fn ping_succeeded(out: &str) -> bool {
    let lower = out.to_ascii_lowercase();
    (lower.contains("seq") && lower.contains("ttl") && lower.contains("time")) || lower.contains("alive")
}

async fn negotiate(
    agent: &mut SessionAgent,
    derived: &Derived,
    info: &ConnectInfo,
    password_sent: &mut bool,
) -> Result<StepOutcome> {
    let boot_watch = derived.serial_port_mode;
    let deadline_secs = derived.connect_timeout;
    let mut elapsed = 0.0_f64;
    let step = 1.0_f64.min(deadline_secs);

    loop {
        let out = agent.read_until(&[String::new()], step, true).await?;
        elapsed += step;

        if TIMEOUT_EXPIRED.is_match(&out) {
            agent.ensure_send_line("", false).await?;
        } else if CONNECTION_REFUSED.is_match(&out) {
            return Ok(StepOutcome::Refused);
        } else if YES_NO.is_match(&out) {
            agent.ensure_send_line("yes", true).await?;
        } else if HOST_KEY_CHANGED.is_match(&out) {
            let _ = agent.run_command("rm -f ~/.ssh/known_hosts", &[], &[], 5.0).await;
            return Ok(StepOutcome::RsaRetry);
        } else if LOGIN_PROMPT.is_match(&out) {
            let user = info.user.clone().or_else(|| info.password.clone());
            match user {
                Some(u) => agent.ensure_send_line(&u, true).await?,
                None => {
                    return Err(ErrorKind::Connection {
                        detail: "login prompt seen but no user or password configured".into(),
                    })
                }
            }
        } else if PASSWORD_PROMPT.is_match(&out) {
            let pass = info.password.clone().or_else(|| info.user.clone());
            match pass {
                Some(p) => {
                    agent.ensure_send_line(&p, true).await?;
                    *password_sent = true;
                }
                None => {
                    return Err(ErrorKind::Connection {
                        detail: "password prompt seen but no password or user configured".into(),
                    })
                }
            }
        } else if terminator_matches(&out) {
            let candidate = prompt::last_non_blank_line(&prompt::strip_ansi(&out)).to_string();
            if prompt_is_valid(&candidate, info, derived.serial_port_mode) {
                return Ok(StepOutcome::Connected(candidate));
            }
            if boot_watch {
                if let Some(result) = boot_watch_loop(agent, info).await? {
                    return Ok(StepOutcome::Connected(result));
                }
            }
        }

        if elapsed >= deadline_secs {
            return Err(ErrorKind::Connection {
                detail: format!("no login prompt seen within {deadline_secs}s"),
            });
        }
    }
}

fn terminator_matches(out: &str) -> bool {
    LOGIN_PATTERNS.iter().any(|p| p.is_match(out)) || INPUT_PATTERNS.iter().any(|p| p.is_match(out))
}

fn prompt_is_valid(candidate: &str, info: &ConnectInfo, serial_mode: bool) -> bool {
    if !prompt::has_terminator_char(candidate) {
        return false;
    }
    if serial_mode {
        return true;
    }
    let user_ok = info
        .user
        .as_ref()
        .is_some_and(|u| candidate.contains(u.as_str()));
    user_ok || candidate.contains("IBMC-SLOT")
}

/// Send CRLF every `bootup_watch_period_secs` up to
/// `bootup_watch_timeout_secs` total, succeeding when either a
/// `boot_expect` pattern shows up or a small well-formed prompt line
/// appears; a `boot_escape` hit aborts the watch outright.
async fn boot_watch_loop(agent: &mut SessionAgent, info: &ConnectInfo) -> Result<Option<String>> {
    let period = agent.config().timeouts.bootup_watch_period_secs;
    let total = agent.config().timeouts.bootup_watch_timeout_secs;
    let mut waited = 0.0_f64;
    while waited < total {
        agent.ensure_send_line("", false).await?;
        let out = agent.read_until(&[String::new()], period, true).await?;

        if info.boot_escape.iter().any(|p| !p.is_empty() && out.contains(p.as_str())) {
            return Err(ErrorKind::Connection {
                detail: "boot-watch escape pattern matched".into(),
            });
        }
        if info.boot_expect.iter().any(|p| !p.is_empty() && out.contains(p.as_str())) {
            let candidate = prompt::last_non_blank_line(&prompt::strip_ansi(&out)).to_string();
            return Ok(Some(candidate));
        }

        let candidate = prompt::last_non_blank_line(&prompt::strip_ansi(&out)).to_string();
        if !candidate.is_empty() && candidate.len() < 40 && prompt::has_terminator_char(&candidate) {
            return Ok(Some(candidate));
        }
        waited += period;
    }
    Ok(None)
}

async fn finish_connect(
    agent: &mut SessionAgent,
    derived: &Derived,
    info: &ConnectInfo,
    cmd: &ParsedCommand,
    initial_prompt: String,
) -> Result<()> {
    let line_sep = probe_line_separator(agent).await?;
    let prompt_value = probe_prompt(agent, initial_prompt, derived.method == ConnectMethod::Telnet).await?;

    let timeout = cmd
        .timeout
        .unwrap_or(agent.config().timeouts.remote_command_secs);

    agent.stack.push(Frame {
        target_host: derived.target_host.clone(),
        session_label: cmd.argv.join(" "),
        user: info.user.clone(),
        password: info.password.clone(),
        prompt: prompt_value,
        line_separator: line_sep,
        serial_port_mode: derived.serial_port_mode,
        cisco_sol_mode: false,
        command_timeout: timeout,
    });
    Ok(())
}

/// Line-separator probe: flush, send `\r\n`, read until a terminator
/// prompt. Exactly one newline in the response means `\r\n` is the frame's
/// separator (the `\r` was consumed by the terminal); exactly two means
/// plain `\n`.
async fn probe_line_separator(agent: &mut SessionAgent) -> Result<String> {
    agent.flush(Duration::from_millis(0)).await;
    let handle_timeout = agent.config().retry.session_prompt_retry_timeout_secs;
    let mut last = String::new();
    for _ in 0..agent.config().retry.session_prompt_retry {
        let _ = agent.read_until(&[], 0.0, true).await;
        let out = agent.read_until(&[String::new()], handle_timeout, true).await?;
        last = out;
        if last.matches('\n').count() == 2 {
            return Ok("\n".to_string());
        }
        if last.matches('\n').count() == 1 {
            return Ok("\r\n".to_string());
        }
    }
    Ok("\r\n".to_string())
}

/// Prompt probe: send an empty line twice, accepting the prompt only when
/// two consecutive reads agree ("postly verify" — on disagreement, shift
/// the first reading forward and retry rather than failing immediately).
async fn probe_prompt(agent: &mut SessionAgent, seed: String, strip_timestamp: bool) -> Result<String> {
    let mut prior = seed;
    let budget = agent.config().retry.session_prompt_retry;
    let timeout = agent.config().retry.session_prompt_retry_timeout_secs;
    for _ in 0..budget {
        agent.ensure_send_line("", false).await?;
        let out = agent.read_until(&[String::new()], timeout, true).await?;
        let mut candidate = prompt::last_non_blank_line(&prompt::strip_ansi(&out)).to_string();
        if strip_timestamp {
            candidate = prompt::strip_leading_timestamp(&candidate);
        }
        if candidate == prior && prompt::has_terminator_char(&candidate) {
            return Ok(candidate);
        }
        prior = candidate;
    }
    Err(ErrorKind::Connection {
        detail: "prompt probe did not converge".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_succeeded_matches_seq_ttl_time() {
        assert!(ping_succeeded("64 bytes: icmp_seq=1 ttl=64 time=0.04 ms"));
    }

    #[test]
    fn test_ping_succeeded_matches_alive_fallback() {
        assert!(ping_succeeded("host 10.0.0.1 is alive"));
    }

    #[test]
    fn test_ping_failed_on_plain_unreachable() {
        assert!(!ping_succeeded("Destination Host Unreachable"));
    }

    #[test]
    fn test_prompt_is_valid_with_user_token() {
        let info = ConnectInfo {
            user: Some("admin".into()),
            password: None,
            boot_expect: vec![],
            boot_escape: vec![],
        };
        assert!(prompt_is_valid("admin@host# ", &info, false));
    }

    #[test]
    fn test_prompt_is_valid_ibmc_slot() {
        let info = ConnectInfo::default();
        assert!(prompt_is_valid("IBMC-SLOT1# ", &info, false));
    }

    #[test]
    fn test_prompt_invalid_without_terminator() {
        let info = ConnectInfo::default();
        assert!(!prompt_is_valid("no terminator here", &info, true));
    }

    #[test]
    fn test_serial_mode_skips_user_check() {
        let info = ConnectInfo::default();
        assert!(prompt_is_valid("random# ", &info, true));
    }
}
