//! Quit: pop the current frame (or exit intershell) and re-probe that the
//! stack landed where it should.

use crate::error::{ErrorKind, Result};
use crate::prompt;

use super::SessionAgent;

const HOST_PROBE_CMD: &str = "ifconfig | awk '/inet addr/{print substr($2,6)}'";

/// Run the Quit builtin against the agent's current state.
pub async fn quit(agent: &mut SessionAgent) -> Result<()> {
    if agent.running_locally()? {
        agent.close_pty();
        return Ok(());
    }

    if let Some(state) = agent.intershell.take() {
        if state.exit_is_control {
            let letter = state.exit_cmd.chars().find(char::is_ascii_alphabetic).unwrap_or('c');
            agent.send_control(letter).await?;
        } else {
            agent.ensure_send_line(&state.exit_cmd, true).await?;
        }
        agent.flush(std::time::Duration::from_millis(200)).await;
        return Ok(());
    }

    let serial_mode = agent.current_frame().is_some_and(|f| f.serial_port_mode);
    let sol_mode = agent.current_frame().is_some_and(|f| f.cisco_sol_mode);

    if serial_mode {
        agent.send_control('c').await?;
        agent.send_control(']').await?;
        let _ = agent.read_until(&["telnet>".to_string()], 5.0, true).await;
        agent.ensure_send_line("q", true).await?;
        pop_while(agent, |f| f.serial_port_mode);
    } else if sol_mode {
        agent.send_control('x').await?;
        pop_while(agent, |f| f.cisco_sol_mode);
    } else {
        agent.send_control('c').await?;
        agent.ensure_send_line("exit", true).await?;
        agent.stack.pop();
    }

    verify_landed(agent).await
}

fn pop_while(agent: &mut SessionAgent, pred: impl Fn(&super::Frame) -> bool) {
    while agent.stack.last().is_some_and(&pred) {
        agent.stack.pop();
    }
}

/// Re-probe host and prompt against the frame quit landed on; raise
/// `Context` only when both disagree with what's expected there.
async fn verify_landed(agent: &mut SessionAgent) -> Result<()> {
    let Some(expected_host) = agent.current_frame().map(|f| f.target_host.clone()) else {
        return Ok(());
    };
    let expected_prompt = agent.current_frame().map(|f| f.prompt.clone()).unwrap_or_default();

    let host_out = agent
        .run_command(HOST_PROBE_CMD, &[], &[], agent.config().timeouts.local_command_secs)
        .await
        .map(|o| o.text)
        .unwrap_or_default();
    let host_mismatch = !expected_host.is_empty() && !host_out.contains(&expected_host);

    agent.set_pty_prompt().await?;
    let observed_prompt = agent.current_frame().map(|f| f.prompt.clone()).unwrap_or_default();
    let prompt_mismatch = !prompt::has_terminator_char(&observed_prompt) || observed_prompt != expected_prompt;

    if host_mismatch && prompt_mismatch {
        return Err(ErrorKind::Context {
            prompt: expected_prompt,
            output: host_out,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn test_agent() -> SessionAgent {
        SessionAgent::new(Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_quit_on_local_stack_closes_pty_and_is_noop() {
        let mut agent = test_agent();
        assert!(quit(&mut agent).await.is_ok());
        assert!(agent.stack.is_empty());
    }

    #[test]
    fn test_pop_while_serial_pops_only_matching_frames() {
        let mut agent = test_agent();
        agent.stack.push(super::super::Frame {
            target_host: "a".into(),
            session_label: "ssh a".into(),
            user: None,
            password: None,
            prompt: "# ".into(),
            line_separator: "\n".into(),
            serial_port_mode: false,
            cisco_sol_mode: false,
            command_timeout: 60.0,
        });
        agent.stack.push(super::super::Frame {
            target_host: "b".into(),
            session_label: "telnet b 2003".into(),
            user: None,
            password: None,
            prompt: "> ".into(),
            line_separator: "\n".into(),
            serial_port_mode: true,
            cisco_sol_mode: false,
            command_timeout: 60.0,
        });
        pop_while(&mut agent, |f| f.serial_port_mode);
        assert_eq!(agent.stack.len(), 1);
        assert_eq!(agent.stack[0].target_host, "a");
    }
}
