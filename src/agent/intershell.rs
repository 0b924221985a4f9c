//! Intershell sub-mode: a diagnostic executable that, once launched,
//! replaces the host shell's command interpreter with its own until an
//! explicit exit. Does not push a new frame — the current frame stays, only
//! its effective terminator/timeout/exit sequence change.

use std::sync::LazyLock;

use regex::Regex;

use super::SessionAgent;

/// One registered intershell kind: image-name pattern, terminator regex
/// text, exit sequence, and initial settle wait. The command timeout while
/// in this mode comes from the shared `intershell_command_secs` config
/// value, not the kind itself.
#[derive(Debug, Clone)]
pub struct IntershellKind {
    pub name: &'static str,
    pub image_regex: &'static str,
    pub terminator: &'static str,
    pub exit_cmd: &'static str,
    pub exit_is_control: bool,
    pub init_wait_secs: f64,
}

/// Active intershell state for the current frame.
#[derive(Debug, Clone)]
pub struct IntershellState {
    pub kind: &'static str,
    pub terminator: String,
    pub exit_cmd: String,
    pub exit_is_control: bool,
    pub init_wait_secs: f64,
    pub command_timeout_secs: f64,
}

/// Registered diagnostic-image patterns. `i2c_uart.*` is a supplemental
/// entry not present in the retrieved original source but named as an
/// example pattern; kept alongside the two the original ships.
pub const INTERSHELL_KINDS: &[IntershellKind] = &[
    IntershellKind {
        name: "bmc_diag",
        image_regex: r"udibmc_.*(\.stripped)?$",
        terminator: r"% {0,3}$",
        exit_cmd: "exit",
        exit_is_control: false,
        init_wait_secs: 5.0,
    },
    IntershellKind {
        name: "efi_diag",
        image_regex: r"Dsh\.efi$",
        terminator: r"> {0,3}$",
        exit_cmd: "exit",
        exit_is_control: false,
        init_wait_secs: 3.0,
    },
    IntershellKind {
        name: "i2c_uart",
        image_regex: r"i2c_uart.*$",
        terminator: r"# {0,3}$",
        exit_cmd: "ctrl+p+d",
        exit_is_control: true,
        init_wait_secs: 3.0,
    },
];

static KIND_PATTERNS: LazyLock<Vec<(Regex, &'static IntershellKind)>> = LazyLock::new(|| {
    INTERSHELL_KINDS
        .iter()
        .map(|k| (Regex::new(k.image_regex).expect("valid regex"), k))
        .collect()
});

fn image_basename(command: &str) -> &str {
    command.rsplit('/').next().unwrap_or(command)
}

/// Check whether `command` should transition the current frame into
/// intershell mode, and do so if it should. Only triggers for single-token
/// commands on a non-empty frame stack (matching the original's
/// `len(cmd.split(' ')) == 1` guard). Returns whether this call performed
/// the transition (false if already in intershell, or no pattern matched).
pub fn maybe_trigger(agent: &mut SessionAgent, command: &str) -> bool {
    if agent.stack.is_empty() || command.split_whitespace().count() != 1 {
        return false;
    }
    if agent.intershell.is_some() {
        return false;
    }
    let basename = image_basename(command.trim());
    for (pattern, kind) in KIND_PATTERNS.iter() {
        if pattern.is_match(basename) {
            agent.intershell = Some(IntershellState {
                kind: kind.name,
                terminator: kind.terminator.to_string(),
                exit_cmd: kind.exit_cmd.to_string(),
                exit_is_control: kind.exit_is_control,
                init_wait_secs: kind.init_wait_secs,
                command_timeout_secs: agent.config.timeouts.intershell_command_secs,
            });
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn agent_with_frame() -> SessionAgent {
        let mut agent = SessionAgent::new(Arc::new(Config::default()));
        agent.stack.push(super::super::Frame {
            target_host: "10.0.0.1".into(),
            session_label: "ssh 10.0.0.1".into(),
            user: None,
            password: None,
            prompt: "# ".into(),
            line_separator: "\n".into(),
            serial_port_mode: false,
            cisco_sol_mode: false,
            command_timeout: 60.0,
        });
        agent
    }

    #[test]
    fn test_bmc_image_triggers_intershell() {
        let mut agent = agent_with_frame();
        assert!(maybe_trigger(&mut agent, "/tmp/udibmc_v3.stripped"));
        assert_eq!(agent.intershell.as_ref().unwrap().kind, "bmc_diag");
    }

    #[test]
    fn test_multi_token_command_never_triggers() {
        let mut agent = agent_with_frame();
        assert!(!maybe_trigger(&mut agent, "udibmc_v3.stripped --flag"));
    }

    #[test]
    fn test_already_in_intershell_does_not_retrigger() {
        let mut agent = agent_with_frame();
        assert!(maybe_trigger(&mut agent, "udibmc_v3.stripped"));
        assert!(!maybe_trigger(&mut agent, "Dsh.efi"));
    }

    #[test]
    fn test_unmatched_command_does_not_trigger() {
        let mut agent = agent_with_frame();
        assert!(!maybe_trigger(&mut agent, "show"));
    }
}
