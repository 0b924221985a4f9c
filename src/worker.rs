//! Sequence Worker: runs one sequence file's commands for a fixed number of
//! loop iterations, recovering from transient PTY failures and reporting
//! loop-level status to the Master over IPC.

use std::ops::Range;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};

use crate::agent::{connect, quit, SessionAgent};
use crate::config::Config;
use crate::error::{ErrorKind, Result};
use crate::ipc::{self, IpcMessage, LOOP_FAIL, LOOP_PASS, LOOP_UNKNOWN};
use crate::sequence::{parser, BuiltinAction, CommandKind, ParsedCommand};
use crate::util;

const PULSE_COMMAND: &str = "while :; do echo 'Hit CTRL+C'; sleep 240; done";

/// A UEFI shell filesystem handle (`FS0:`, `FS1:`, ...), sent to `FIND` as-is
/// rather than prefixed with `cd `.
static UEFI_FS_HANDLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^FS\d+:$").expect("valid regex"));

enum IterationOutcome {
    Pass,
    Fail(Vec<String>),
    Recover(Vec<String>),
}

/// One sequence file's runtime: its parsed commands, the worker's own
/// agent, and bookkeeping for the master IPC channel and child workers
/// spawned for `NEW_WORKER`.
pub struct SequenceWorker {
    name: String,
    sequence_file: String,
    total_loops: u32,
    commands: Vec<ParsedCommand>,
    subsequences: Vec<(String, Range<usize>)>,
    agent: SessionAgent,
    config: Arc<Config>,
    master_socket: Option<String>,
    children: Vec<tokio::process::Child>,
}

impl SequenceWorker {
    /// Parse `sequence_file` and build a worker ready to run it
    /// `total_loops` times. `master_socket` is `None` in standalone
    /// (debug, single-process) mode.
    pub fn load(sequence_file: &str, total_loops: u32, config: Arc<Config>, master_socket: Option<String>) -> Result<Self> {
        let (commands, subsequences) = parser::sequence_reader(sequence_file)?;
        Ok(Self {
            name: util::sequence_base(sequence_file),
            sequence_file: sequence_file.to_string(),
            total_loops: total_loops.max(1),
            commands,
            subsequences,
            agent: SessionAgent::new(Arc::clone(&config)),
            config,
            master_socket,
            children: Vec::new(),
        })
    }

    async fn report(&self, message: IpcMessage) {
        if let Some(socket) = &self.master_socket {
            if let Err(e) = ipc::send(socket, &message, self.config.master.ipc_send_retry_secs).await {
                warn!(sequence = %self.name, error = %e, "failed to report status to master");
            }
        }
    }

    /// Run every loop iteration, reporting `SEQUENCE_START`/`SEQUENCE_COMPLETE`
    /// and per-iteration `LOOP_PASS`/`LOOP_FAIL`/`LOOP_UNKNOWN` as it goes.
    pub async fn run_all(&mut self) -> Result<()> {
        self.report(IpcMessage::sequence_start(&self.name, self.total_loops)).await;

        let mut pending_error: Option<ErrorKind> = None;
        for loop_number in 1..=self.total_loops {
            let mut recover_budget = self.config.retry.session_recover_retry;
            loop {
                match self.run_iteration(0, self.commands.len()).await {
                    Ok(IterationOutcome::Pass) => {
                        info!(sequence = %self.name, loop_number, "loop passed");
                        self.report(IpcMessage::loop_status(LOOP_PASS, &self.name, loop_number, vec![]))
                            .await;
                        break;
                    }
                    Ok(IterationOutcome::Fail(failures)) => {
                        warn!(sequence = %self.name, loop_number, ?failures, "loop failed");
                        self.report(IpcMessage::loop_status(LOOP_FAIL, &self.name, loop_number, failures))
                            .await;
                        break;
                    }
                    Ok(IterationOutcome::Recover(messages)) => {
                        self.report(IpcMessage::loop_status(LOOP_UNKNOWN, &self.name, loop_number, messages))
                            .await;
                        self.kill_children();
                        self.agent.close_pty();
                        if recover_budget == 0 {
                            pending_error = Some(ErrorKind::Recovery { loop_number });
                            break;
                        }
                        recover_budget -= 1;
                        continue;
                    }
                    Err(e) => {
                        pending_error = Some(e);
                        break;
                    }
                }
            }
            if pending_error.is_some() {
                break;
            }
        }

        self.stop(pending_error).await
    }

    /// Run `commands[start..end]` once, dispatching builtins and
    /// classifying any error per the worker's fatal/recoverable/conditional
    /// rules. Returns `Ok` with the aggregate outcome unless a step raised
    /// an always-fatal error, in which case it propagates.
    async fn run_iteration(&mut self, start: usize, end: usize) -> Result<IterationOutcome> {
        let mut failures = Vec::new();
        let mut idx = start;
        while idx < end {
            let cmd = self.commands[idx].clone();
            match self.run_step(&cmd).await {
                Ok(()) => {}
                Err(e) if e.triggers_recovery() => {
                    failures.push(e.to_string());
                    return Ok(IterationOutcome::Recover(failures));
                }
                Err(e @ ErrorKind::Expect { .. }) => {
                    failures.push(e.to_string());
                    if self.config.run.stop_on_failure {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
            idx += 1;
        }
        if failures.is_empty() {
            Ok(IterationOutcome::Pass)
        } else {
            Ok(IterationOutcome::Fail(failures))
        }
    }

    async fn run_step(&mut self, cmd: &ParsedCommand) -> Result<()> {
        match &cmd.kind {
            CommandKind::Connect(_) => connect::connect(&mut self.agent, cmd).await,
            CommandKind::Send => self.run_send(cmd).await,
            CommandKind::Builtin(action) => self.run_builtin(action, cmd).await,
        }
    }

    /// Dispatch a `Send` step: a plain blocking send, a trailing-`&`
    /// background send, or a `waitPassphrase` send, each honoring the
    /// frame's (or intershell's) effective command timeout when the sequence
    /// file didn't pin one explicitly.
    async fn run_send(&mut self, cmd: &ParsedCommand) -> Result<()> {
        let timeout = cmd.timeout.unwrap_or_else(|| self.agent.effective_command_timeout());
        if cmd.bg_run {
            return self.agent.run_background(&cmd.command, timeout).await;
        }
        if cmd.wait_passphrase {
            return self
                .agent
                .run_wait_passphrase(&cmd.command, &cmd.expect, &cmd.escape)
                .await
                .map(|_| ());
        }
        self.agent
            .run_command(&cmd.command, &cmd.expect, &cmd.escape, timeout)
            .await
            .map(|_| ())
    }

    async fn run_builtin(&mut self, action: &BuiltinAction, cmd: &ParsedCommand) -> Result<()> {
        match action {
            BuiltinAction::Intr => self.agent.send_control('c').await,
            BuiltinAction::Quit => quit::quit(&mut self.agent).await,
            BuiltinAction::Close => {
                self.agent.close_pty();
                Ok(())
            }
            BuiltinAction::Pulse => self.agent.ensure_send_line(PULSE_COMMAND, true).await,
            BuiltinAction::Wait => {
                let secs = cmd.argv.get(1).map(|s| util::parse_time_to_sec(s)).unwrap_or(1.0);
                tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
                Ok(())
            }
            BuiltinAction::SetPrompt => self.agent.set_pty_prompt().await,
            BuiltinAction::Enter => self.agent.ensure_send_line("", false).await,
            BuiltinAction::Find { target_file, search_dirs } => self.run_find(target_file, search_dirs).await,
            BuiltinAction::Monitor { inner_command, watch, interval } => {
                self.run_monitor(inner_command, watch, *interval).await
            }
            BuiltinAction::NewWorker { sequence_file, loops, wait_for_child } => {
                self.spawn_child_worker(sequence_file, *loops, *wait_for_child).await
            }
            BuiltinAction::Subsequence { .. } | BuiltinAction::EndSubsequence { .. } => Ok(()),
            BuiltinAction::Loop { sub, n } => self.run_loop(sub, *n).await,
        }
    }

    async fn run_find(&mut self, target_file: &str, search_dirs: &[String]) -> Result<()> {
        let timeout = self.config.timeouts.remote_command_secs;
        for dir in search_dirs {
            let nav = if UEFI_FS_HANDLE.is_match(dir) || dir.contains("cd") {
                dir.clone()
            } else {
                format!("cd {dir}")
            };
            self.agent.run_command(&nav, &[], &[], timeout).await?;
            let listing = self.agent.run_command("ls", &[], &[], timeout).await?;
            if listing.text.contains(target_file) {
                return Ok(());
            }
        }
        Err(ErrorKind::FileNotFound { file: target_file.to_string() })
    }

    async fn run_monitor(&mut self, inner_command: &str, watch: &[String], interval: f64) -> Result<()> {
        let timeout = self.config.timeouts.remote_command_secs;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs_f64(timeout);
        loop {
            let out = self.agent.run_command(inner_command, &[], &[], timeout).await?;
            if watch.iter().any(|w| !w.is_empty() && out.text.contains(w.as_str())) {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(ErrorKind::Timeout { prompt: inner_command.to_string(), output: out.text });
            }
            tokio::time::sleep(std::time::Duration::from_secs_f64(interval)).await;
        }
    }

    async fn spawn_child_worker(&mut self, sequence_file: &str, loops: u32, wait_for_child: bool) -> Result<()> {
        let exe = std::env::current_exe().map_err(|e| ErrorKind::Connection { detail: e.to_string() })?;
        let mut child = tokio::process::Command::new(exe)
            .arg("run")
            .arg("-f")
            .arg(sequence_file)
            .arg("-l")
            .arg(loops.to_string())
            .spawn()
            .map_err(|e| ErrorKind::Connection { detail: format!("spawning child worker: {e}") })?;

        if wait_for_child {
            let status = child
                .wait()
                .await
                .map_err(|e| ErrorKind::Connection { detail: e.to_string() })?;
            if !status.success() {
                return Err(ErrorKind::Connection {
                    detail: format!("child worker for {sequence_file} exited with {status}"),
                });
            }
        } else {
            self.children.push(child);
        }
        Ok(())
    }

    /// Re-run the named `SUBSEQUENCE`/`END-SUBSEQUENCE` range `n` further
    /// times (the range already ran once inline when execution first
    /// reached it).
    async fn run_loop(&mut self, sub: &str, n: u32) -> Result<()> {
        let Some((_, range)) = self.subsequences.iter().find(|(name, _)| name == sub).cloned() else {
            return Err(ErrorKind::SequenceParse { detail: format!("LOOP references unknown subsequence {sub}") });
        };
        for _ in 0..n {
            match self.run_iteration(range.start, range.end).await? {
                IterationOutcome::Pass => {}
                IterationOutcome::Fail(failures) => {
                    return Err(ErrorKind::Expect { prompt: sub.to_string(), output: failures.join("; ") })
                }
                IterationOutcome::Recover(_) => return Err(ErrorKind::Recovery { loop_number: 0 }),
            }
        }
        Ok(())
    }

    fn kill_children(&mut self) {
        for child in &mut self.children {
            let _ = child.start_kill();
        }
        self.children.clear();
    }

    /// Tear down: dump any pending fatal error, close the PTY, report
    /// `SEQUENCE_COMPLETE`.
    async fn stop(&mut self, pending_error: Option<ErrorKind>) -> Result<()> {
        if let Some(err) = &pending_error {
            self.dump_error(err);
        }
        self.kill_children();
        self.agent.close_pty();
        self.report(IpcMessage::sequence_complete(&self.name)).await;
        match pending_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dump_error(&self, err: &ErrorKind) {
        let path = util::new_log_path(&self.sequence_file, Some("errordump"));
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&path, format!("{err}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_sequence(body: &str) -> String {
        let path = std::env::temp_dir().join(format!("autorobotd-worker-test-{}.seq", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_load_parses_sequence_and_defaults_loops_to_at_least_one() {
        let path = write_temp_sequence("echo hi ; hi ; ; 2\n");
        let worker = SequenceWorker::load(&path, 0, Arc::new(Config::default()), None).unwrap();
        assert_eq!(worker.total_loops, 1);
        assert_eq!(worker.commands.len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_run_all_passes_on_local_echo_sequence() {
        let path = write_temp_sequence("echo hi ; hi ; ; 2\n");
        let mut worker = SequenceWorker::load(&path, 1, Arc::new(Config::default()), None).unwrap();
        assert!(worker.run_all().await.is_ok());
        let _ = std::fs::remove_file(&path);
    }
}
