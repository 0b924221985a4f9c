//! Session Agent: one PTY plus a stack of nested login frames.
//!
//! The agent models local shell -> ssh -> telnet-to-serial -> internal
//! diagnostic shell as a stack of `Frame`s, auto-detects prompts and line
//! terminators, negotiates logins with retry, and reads command output
//! until a prompt reappears.

pub mod connect;
pub mod intershell;
pub mod quit;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;

use crate::config::Config;
use crate::error::{ErrorKind, Result};
use crate::prompt;
use crate::pty::{self, PtyPair};

pub use intershell::IntershellState;

/// One nested shell in the agent's session stack.
#[derive(Debug, Clone)]
pub struct Frame {
    pub target_host: String,
    pub session_label: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub prompt: String,
    pub line_separator: String,
    pub serial_port_mode: bool,
    pub cisco_sol_mode: bool,
    pub command_timeout: f64,
}

/// Command-error lexicon checked by `check_cmd_output`.
const COMMAND_ERRORS: &[&str] = &[
    "command not found",
    "no such file or directory",
    "Is a directory",
    "not recognized as an internal or external command",
    "invalid input detected",
    "invalid pass phrase",
    "permission denied",
];

/// Commands exempt from the error-lexicon check (their normal output can
/// legitimately contain lexicon substrings, e.g. `ls` listing a file named
/// `permission denied.txt`).
const ERROR_BYPASS_COMMANDS: &[&str] = &["rm", "ls", ""];

/// The one lexicon entry that is a pattern rather than a literal substring
/// (a kernel module name varies per invocation).
static MODULE_NOT_FOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Module .* is not found").expect("valid regex"));

struct PtyHandle {
    #[allow(dead_code)]
    master: OwnedFd,
    reader: tokio::fs::File,
    writer: tokio::fs::File,
    child: Child,
}

/// Outcome of `run_command` for a remote `Send`/`Connect` step.
pub struct CommandOutput {
    pub text: String,
}

/// One PTY plus the stack of frames currently nested on it.
pub struct SessionAgent {
    pub stack: Vec<Frame>,
    pty: Option<PtyHandle>,
    pub intershell: Option<IntershellState>,
    read_leftover: String,
    pub last_command: String,
    config: Arc<Config>,
}

impl SessionAgent {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            stack: Vec::new(),
            pty: None,
            intershell: None,
            read_leftover: String::new(),
            last_command: String::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// I1: empty stack iff no live child. A dead child with a non-empty
    /// stack is an error state the caller must resolve (`PtyDied`); entering
    /// local mode with a stray child present closes it.
    pub fn running_locally(&mut self) -> Result<bool> {
        let alive = self.pty_alive();
        if self.stack.is_empty() {
            if self.pty.is_some() {
                self.close_pty();
            }
            return Ok(true);
        }
        if !alive {
            return Err(ErrorKind::PtyDied);
        }
        Ok(false)
    }

    fn pty_alive(&mut self) -> bool {
        match &mut self.pty {
            Some(handle) => matches!(handle.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.stack.last_mut()
    }

    fn current_prompt(&self) -> String {
        self.current_frame().map_or_else(String::new, |f| f.prompt.clone())
    }

    fn current_line_sep(&self) -> String {
        self.current_frame()
            .map_or_else(|| "\n".to_string(), |f| f.line_separator.clone())
    }

    fn current_timeout(&self) -> f64 {
        self.effective_command_timeout()
    }

    /// The command timeout that applies right now: intershell mode's longer
    /// timeout while active, otherwise the current frame's (or, locally, the
    /// configured local-command default).
    #[must_use]
    pub fn effective_command_timeout(&self) -> f64 {
        if let Some(state) = &self.intershell {
            return state.command_timeout_secs;
        }
        self.current_frame()
            .map_or(self.config.timeouts.local_command_secs, |f| f.command_timeout)
    }

    /// Spawn a new PTY running `argv` (used for the very first connect
    /// command, when the stack is empty and there is no running shell yet).
    pub fn spawn_pty(&mut self, argv: &[String], working_dir: &str) -> Result<()> {
        let pair: PtyPair = pty::allocate_pty(24, 80).map_err(|e| ErrorKind::Connection {
            detail: format!("openpty failed: {e}"),
        })?;
        let child = pty::spawn_pty_child(&pair, argv, working_dir).map_err(|e| ErrorKind::Connection {
            detail: format!("spawn failed: {e}"),
        })?;

        let master_fd = pair.master.as_raw_fd();
        // SAFETY: dup()'d fd is independently owned; File takes ownership of it.
        let reader_fd = unsafe { libc::dup(master_fd) };
        let writer_fd = unsafe { libc::dup(master_fd) };
        let reader = unsafe { tokio::fs::File::from_raw_fd(reader_fd) };
        let writer = unsafe { tokio::fs::File::from_raw_fd(writer_fd) };

        self.pty = Some(PtyHandle {
            master: pair.master,
            reader,
            writer,
            child,
        });
        Ok(())
    }

    /// Tear everything down; the agent becomes local-only (I1).
    pub fn close_pty(&mut self) {
        if let Some(mut handle) = self.pty.take() {
            if let Some(pid) = handle.child.id() {
                #[allow(clippy::cast_possible_wrap)]
                pty::signal_pgroup(pid as i32, libc::SIGTERM);
            }
            let _ = handle.child.start_kill();
        }
        self.read_leftover.clear();
        self.intershell = None;
    }

    /// Drain any pending output to the (currently discarded) log. Used
    /// after a quit/intershell-exit before the next command.
    pub async fn flush(&mut self, delay: Duration) {
        tokio::time::sleep(delay).await;
        let _ = self.read_leftover_plus_drain().await;
    }

    async fn read_leftover_plus_drain(&mut self) -> String {
        let mut out = std::mem::take(&mut self.read_leftover);
        if let Some(handle) = &mut self.pty {
            let mut buf = [0u8; 1024];
            // Non-blocking-ish: one short read attempt with a deadline.
            let fut = handle.reader.read(&mut buf);
            if let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(30), fut).await {
                if n > 0 {
                    out.push_str(&String::from_utf8_lossy(&buf[..n]));
                }
            }
        }
        out
    }

    async fn write_raw(&mut self, text: &str) -> Result<()> {
        let handle = self.pty.as_mut().ok_or(ErrorKind::PtyDied)?;
        handle
            .writer
            .write_all(text.as_bytes())
            .await
            .map_err(|_| ErrorKind::PtyDied)?;
        handle.writer.flush().await.map_err(|_| ErrorKind::PtyDied)?;
        Ok(())
    }

    /// Send one ASCII control letter (e.g. `c` for Ctrl-C, `x` for Ctrl-X).
    pub async fn send_control(&mut self, letter: char) -> Result<()> {
        let code = (letter.to_ascii_uppercase() as u8).wrapping_sub(b'A').wrapping_add(1);
        self.write_raw(&(code as char).to_string()).await?;
        if letter.eq_ignore_ascii_case(&'c') {
            let prompt = self.current_prompt();
            let _ = self
                .read_until(&[prompt], self.config.timeouts.send_intr_secs, true)
                .await;
        }
        Ok(())
    }

    /// `atomicRead`: read in ~30ms polls, accumulating until the prompt
    /// reappears or the timeout elapses.
    pub async fn atomic_read(&mut self, timeout: f64) -> Result<String> {
        if timeout <= 0.0 {
            return Ok(String::new());
        }
        let deadline = Instant::now() + Duration::from_secs_f64(timeout);
        let stray_send_at = Instant::now() + Duration::from_secs_f64(timeout * 0.6);
        let mut sent_stray = false;
        let mut buf = String::new();
        buf.push_str(&std::mem::take(&mut self.read_leftover));
        let prompt = self.current_prompt();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let chunk = self.poll_once().await;
            match chunk {
                Some(text) if !text.is_empty() => {
                    buf.push_str(&text);
                }
                _ => {
                    if !buf.is_empty() {
                        let stripped = prompt::strip_ansi(&buf);
                        let mut tail_start = stripped.len().saturating_sub(prompt.len() + 10);
                        while tail_start > 0 && !stripped.is_char_boundary(tail_start) {
                            tail_start -= 1;
                        }
                        if !prompt.is_empty() && stripped[tail_start..].contains(&prompt) {
                            if let Some(pos) = stripped.rfind(&prompt) {
                                let (prefix, rest) = stripped.split_at(pos + prompt.len());
                                self.read_leftover = rest.to_string();
                                return Ok(prefix.to_string());
                            }
                        }
                    }
                    if !sent_stray && now >= stray_send_at {
                        let sep = self.current_line_sep();
                        let _ = self.write_raw(&sep).await;
                        sent_stray = true;
                    }
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
            }
        }

        if self.running_locally().unwrap_or(false) {
            return Ok(buf);
        }
        Err(ErrorKind::Timeout {
            prompt,
            output: buf,
        })
    }

    /// `readUntil`: same polling loop, but completes on first match of any
    /// pattern rather than testing the current prompt.
    pub async fn read_until(&mut self, patterns: &[String], timeout: f64, ignore_error: bool) -> Result<String> {
        let deadline = Instant::now() + Duration::from_secs_f64(timeout.max(0.0));
        let mut buf = String::new();
        buf.push_str(&std::mem::take(&mut self.read_leftover));
        loop {
            if patterns.iter().any(|p| !p.is_empty() && buf.contains(p.as_str())) {
                return Ok(buf);
            }
            if Instant::now() >= deadline {
                if ignore_error {
                    return Ok(buf);
                }
                return Err(ErrorKind::Timeout {
                    prompt: patterns.join("|"),
                    output: buf,
                });
            }
            match self.poll_once().await {
                Some(text) => buf.push_str(&text),
                None => tokio::time::sleep(Duration::from_millis(30)).await,
            }
        }
    }

    async fn poll_once(&mut self) -> Option<String> {
        let handle = self.pty.as_mut()?;
        let mut buf = [0u8; 1024];
        match tokio::time::timeout(Duration::from_millis(30), handle.reader.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => None,
            Ok(Ok(n)) => Some(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Ok(Err(_)) => None,
        }
    }

    /// `ensureSendLine`: write `text`, confirm the echo (retrying with the
    /// fuzzy complement on a partial echo), then terminate with the frame's
    /// line separator.
    pub async fn ensure_send_line(&mut self, text: &str, visible: bool) -> Result<()> {
        let _ = self.flush(Duration::ZERO).await;
        self.write_raw(text).await?;
        if visible {
            self.last_command = text.to_string();
            let confirm_timeout = self.current_timeout().min(10.0);
            let mut pending = text.to_string();
            loop {
                match self.wait_for_echo(&pending, confirm_timeout).await {
                    Ok(()) => break,
                    Err(ErrorKind::Timeout { output, .. }) => {
                        let complement = prompt::fuzzy_complement(&pending, &output);
                        if complement.is_empty() {
                            break;
                        }
                        self.write_raw(&complement).await?;
                        pending = complement;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        let sep = self.current_line_sep();
        self.write_raw(&sep).await
    }

    async fn wait_for_echo(&mut self, text: &str, timeout: f64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(timeout);
        let mut buf = String::new();
        loop {
            if prompt::search_command_in_echo(text, &buf) {
                self.read_leftover = buf;
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ErrorKind::Timeout {
                    prompt: text.to_string(),
                    output: buf,
                });
            }
            match self.poll_once().await {
                Some(chunk) => buf.push_str(&chunk),
                None => tokio::time::sleep(Duration::from_millis(30)).await,
            }
        }
    }

    /// `checkCommandOutput`: validate the echo is present and the output
    /// does not contain a command-error lexicon hit.
    pub fn check_cmd_output(&self, out: &str) -> Result<()> {
        if self.last_command.is_empty() || out.is_empty() {
            return Ok(());
        }
        if !prompt::search_command_in_echo(&self.last_command, out) {
            return Err(ErrorKind::SendMiswrite {
                prompt: self.current_prompt(),
                output: out.to_string(),
            });
        }
        let word = self.last_command.split_whitespace().next().unwrap_or("");
        if ERROR_BYPASS_COMMANDS.contains(&word) {
            return Ok(());
        }
        for lexicon in COMMAND_ERRORS {
            if out.contains(lexicon) {
                return Err(ErrorKind::InvalidCommand {
                    prompt: self.current_prompt(),
                    output: out.to_string(),
                });
            }
        }
        if MODULE_NOT_FOUND.is_match(out) {
            return Err(ErrorKind::InvalidCommand {
                prompt: self.current_prompt(),
                output: out.to_string(),
            });
        }
        Ok(())
    }

    /// `readExpect`: read until silence/prompt, validate the echo, then
    /// check the declared expect/escape assertions in order.
    pub async fn read_expect(&mut self, expect: &[String], escape: &[String], timeout: f64) -> Result<String> {
        let out = self.atomic_read(timeout).await?;
        self.check_cmd_output(&out)?;
        self.check_expect_escape(&out, expect, escape)?;
        Ok(out)
    }

    fn check_expect_escape(&self, out: &str, expect: &[String], escape: &[String]) -> Result<()> {
        let mut remainder = out;
        for pattern in expect {
            let needle = if pattern == "PROMPT" {
                self.current_prompt()
            } else {
                pattern.clone()
            };
            if needle.is_empty() {
                continue;
            }
            match remainder.find(needle.as_str()) {
                Some(pos) => remainder = &remainder[pos + needle.len()..],
                None => {
                    return Err(ErrorKind::Expect {
                        prompt: self.current_prompt(),
                        output: out.to_string(),
                    })
                }
            }
        }
        for pattern in escape {
            if !pattern.is_empty() && out.contains(pattern.as_str()) {
                return Err(ErrorKind::Expect {
                    prompt: self.current_prompt(),
                    output: out.to_string(),
                });
            }
        }
        Ok(())
    }

    /// `runCommand` for a remote `Send` step. `cd`, an intershell-entry
    /// transition, and `FIND` short-circuit the normal output check and
    /// just re-probe the prompt instead.
    pub async fn run_command(
        &mut self,
        command: &str,
        expect: &[String],
        escape: &[String],
        timeout: f64,
    ) -> Result<CommandOutput> {
        if self.running_locally()? {
            return self.run_local_command(command, expect, escape, timeout).await;
        }

        let is_cd = command.split_whitespace().next() == Some("cd");
        let entered_intershell = intershell::maybe_trigger(self, command);

        self.ensure_send_line(command, true).await?;

        if entered_intershell {
            let settle = self.intershell.as_ref().map_or(0.0, |s| s.init_wait_secs);
            self.flush(Duration::from_secs_f64(settle)).await;
        }

        if is_cd || entered_intershell {
            self.set_pty_prompt().await?;
            return Ok(CommandOutput { text: String::new() });
        }

        let out = self.read_expect(expect, escape, timeout).await?;
        Ok(CommandOutput { text: out })
    }

    async fn run_local_command(
        &mut self,
        command: &str,
        expect: &[String],
        escape: &[String],
        timeout: f64,
    ) -> Result<CommandOutput> {
        let dur = if timeout > 0.0 {
            Duration::from_secs_f64(timeout)
        } else {
            Duration::from_secs_f64(self.config.timeouts.local_command_secs)
        };
        let output = tokio::time::timeout(
            dur,
            tokio::process::Command::new("sh").arg("-c").arg(command).output(),
        )
        .await
        .map_err(|_| ErrorKind::Timeout {
            prompt: String::new(),
            output: String::new(),
        })?
        .map_err(|e| ErrorKind::InvalidCommand {
            prompt: String::new(),
            output: e.to_string(),
        })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        self.check_expect_escape(&text, expect, escape)?;
        Ok(CommandOutput { text })
    }

    /// Trailing-`&` background send: write the command, let it run for
    /// `timeout` seconds, then send an empty line and stop waiting on it —
    /// the worker does not block on its output.
    pub async fn run_background(&mut self, command: &str, timeout: f64) -> Result<()> {
        if self.running_locally()? {
            let _ = self.run_local_command(command, &[], &[], 0.0).await;
            return Ok(());
        }
        self.ensure_send_line(command, true).await?;
        tokio::time::sleep(Duration::from_secs_f64(timeout.max(0.0))).await;
        self.ensure_send_line("", false).await?;
        let _ = self.atomic_read(0.0).await;
        Ok(())
    }

    /// `waitPassphrase` send: write the command and read until `expect`
    /// appears (bounded by `wait_passphrase_secs`) rather than the normal
    /// echo/lexicon check, retrying once with the fuzzy complement of the
    /// command if the first read caught only a partial echo.
    pub async fn run_wait_passphrase(
        &mut self,
        command: &str,
        expect: &[String],
        escape: &[String],
    ) -> Result<CommandOutput> {
        let timeout = self.config.timeouts.wait_passphrase_secs;
        if self.running_locally()? {
            return self.run_local_command(command, expect, escape, timeout).await;
        }
        self.ensure_send_line(command, true).await?;
        let mut out = self.read_until(expect, timeout, true).await?;
        if !expect.iter().all(|p| p.is_empty() || out.contains(p.as_str())) {
            let complement = prompt::fuzzy_complement(command, &out);
            if !complement.is_empty() {
                self.write_raw(&complement).await?;
                out = self.read_until(expect, timeout, true).await?;
            }
        }
        self.check_expect_escape(&out, expect, escape)?;
        Ok(CommandOutput { text: out })
    }

    /// Re-probe the prompt after `cd`, an intershell transition, or `FIND`
    /// (the three cases the worker never runs the normal expect/output
    /// path for) and store it as the frame's prompt.
    pub async fn set_pty_prompt(&mut self) -> Result<()> {
        let _ = self.ensure_send_line("", false).await;
        let first = self.atomic_read(self.config.retry.session_prompt_retry_timeout_secs).await?;
        let candidate = prompt::last_non_blank_line(&prompt::strip_ansi(&first)).to_string();
        if let Some(frame) = self.current_frame_mut() {
            frame.prompt = candidate;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent() -> SessionAgent {
        SessionAgent::new(Arc::new(Config::default()))
    }

    #[test]
    fn test_running_locally_true_on_empty_stack() {
        let mut agent = test_agent();
        assert!(agent.running_locally().unwrap());
    }

    #[test]
    fn test_check_cmd_output_skips_when_no_prior_command() {
        let agent = test_agent();
        assert!(agent.check_cmd_output("permission denied").is_ok());
    }

    #[test]
    fn test_check_cmd_output_bypasses_rm() {
        let mut agent = test_agent();
        agent.last_command = "rm -rf /tmp/x".to_string();
        assert!(agent.check_cmd_output("rm: permission denied").is_ok());
    }

    #[test]
    fn test_check_cmd_output_flags_lexicon_hit() {
        let mut agent = test_agent();
        agent.last_command = "frobnicate".to_string();
        let err = agent.check_cmd_output("frobnicate\nbash: frobnicate: command not found");
        assert!(matches!(err, Err(ErrorKind::InvalidCommand { .. })));
    }

    #[test]
    fn test_check_cmd_output_flags_module_not_found_pattern() {
        let mut agent = test_agent();
        agent.last_command = "modprobe foo".to_string();
        let err = agent.check_cmd_output("modprobe foo\nModule foo is not found.");
        assert!(matches!(err, Err(ErrorKind::InvalidCommand { .. })));
    }

    #[test]
    fn test_check_cmd_output_flags_miswrite_on_bad_echo() {
        let mut agent = test_agent();
        agent.last_command = "show version".to_string();
        let err = agent.check_cmd_output("totally different output");
        assert!(matches!(err, Err(ErrorKind::SendMiswrite { .. })));
    }
}
