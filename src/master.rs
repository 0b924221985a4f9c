//! Master Scheduler: spawns the entry sequence as a worker process, tracks
//! every worker's status over the IPC socket, and drives the live display
//! until nothing is left running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::display::{Display, WorkerLine};
use crate::ipc::{self, IpcMessage, LOOP_FAIL, LOOP_PASS, LOOP_UNKNOWN, SEQUENCE_COMPLETE, SEQUENCE_START};
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Running,
    Complete,
}

struct WorkerRecord {
    status: Status,
    loop_number: u32,
    loops: u32,
    pass_loops: u32,
    fail_loops: u32,
    failures: Vec<String>,
}

/// Spawns and supervises worker processes for one top-level sequence run.
pub struct Master {
    socket_path: String,
    listener: tokio::net::UnixListener,
    entry_child: tokio::process::Child,
    workers: HashMap<String, WorkerRecord>,
    config: Arc<Config>,
    failure_log_path: std::path::PathBuf,
}

impl Master {
    /// Bind the IPC socket, spawn the entry sequence's worker process with
    /// the socket path in its environment, and synthesize a local bootstrap
    /// `SEQUENCE_START` record before any real IPC message arrives.
    pub fn spawn(sequence_file: &str, loops: u32, config: Arc<Config>) -> std::io::Result<Self> {
        let socket_path = util::new_uds_name(sequence_file).to_string_lossy().into_owned();
        let listener = ipc::bind(&socket_path)?;
        let entry_name = util::sequence_base(sequence_file);

        let exe = std::env::current_exe()?;
        let entry_child = tokio::process::Command::new(exe)
            .arg("run")
            .arg("-f")
            .arg(sequence_file)
            .arg("-l")
            .arg(loops.to_string())
            .env("AUTOROBOT_MASTER_SOCKET", &socket_path)
            .spawn()?;

        let mut workers = HashMap::new();
        workers.insert(
            entry_name.clone(),
            WorkerRecord {
                status: Status::Running,
                loop_number: 0,
                loops,
                pass_loops: 0,
                fail_loops: 0,
                failures: Vec::new(),
            },
        );

        let failure_log_path = util::new_log_path(sequence_file, Some("failure"));

        Ok(Self { socket_path, listener, entry_child, workers, config, failure_log_path })
    }

    /// Drive the refresh loop until every tracked worker has completed and
    /// the entry process has exited, then print the final summary and
    /// remove the socket file.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let tick = Duration::from_secs_f64(self.config.master.window_refresh_interval_secs);
        loop {
            self.drain_messages().await;
            self.render();

            let entry_exited = matches!(self.entry_child.try_wait(), Ok(Some(_)));
            let anything_running = self.workers.values().any(|w| w.status == Status::Running);
            if entry_exited && !anything_running {
                break;
            }
            tokio::time::sleep(tick).await;
        }

        self.drain_messages().await;
        Display::render_summary(&self.lines());
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    async fn drain_messages(&mut self) {
        loop {
            match ipc::try_recv(&self.listener).await {
                Ok(Some(message)) => self.apply(message),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "ipc accept error");
                    break;
                }
            }
        }
    }

    fn apply(&mut self, message: IpcMessage) {
        match message.msg {
            SEQUENCE_START => {
                if self.active_count() >= self.config.run.max_sequences && !self.workers.contains_key(&message.name) {
                    error!(name = %message.name, "rejecting sequence start: max_sequences exceeded");
                    return;
                }
                self.workers.insert(
                    message.name.clone(),
                    WorkerRecord {
                        status: Status::Running,
                        loop_number: 0,
                        loops: message.loops.unwrap_or(1),
                        pass_loops: 0,
                        fail_loops: 0,
                        failures: Vec::new(),
                    },
                );
            }
            SEQUENCE_COMPLETE => {
                if let Some(record) = self.workers.get_mut(&message.name) {
                    record.status = Status::Complete;
                }
            }
            LOOP_PASS | LOOP_FAIL | LOOP_UNKNOWN => {
                let loop_number = message.loop_number.unwrap_or(0);
                if let Some(record) = self.workers.get_mut(&message.name) {
                    record.loop_number = loop_number;
                    match message.msg {
                        LOOP_PASS => record.pass_loops += 1,
                        LOOP_FAIL => record.fail_loops += 1,
                        _ => {}
                    }
                    if let Some(failures) = &message.msg_q {
                        record.failures.extend(failures.iter().cloned());
                    }
                }
                if message.msg == LOOP_FAIL || message.msg == LOOP_UNKNOWN {
                    warn!(name = %message.name, "loop failed");
                    self.append_failure_log(&message.name, loop_number, message.msg, message.msg_q.as_deref());
                } else {
                    info!(name = %message.name, code = message.msg, "loop status");
                }
            }
            other => warn!(code = other, "unrecognized ipc message code"),
        }
    }

    fn active_count(&self) -> usize {
        self.workers.values().filter(|w| w.status == Status::Running).count()
    }

    /// Append one `LOOP_FAIL`/`LOOP_UNKNOWN` block to the per-run failure
    /// log (spec §7: "a master-written failure log aggregating
    /// `LOOP_FAIL`/`LOOP_UNKNOWN` blocks per worker").
    fn append_failure_log(&self, name: &str, loop_number: u32, code: u8, messages: Option<&[String]>) {
        if let Some(parent) = self.failure_log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let kind = if code == LOOP_FAIL { "LOOP_FAIL" } else { "LOOP_UNKNOWN" };
        let mut block = format!("[{name}] loop {loop_number} {kind}\n");
        for message in messages.unwrap_or_default() {
            block.push_str(&format!("  {message}\n"));
        }
        use std::io::Write;
        if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&self.failure_log_path) {
            let _ = file.write_all(block.as_bytes());
        }
    }

    fn lines(&self) -> Vec<WorkerLine> {
        let mut lines: Vec<_> = self
            .workers
            .iter()
            .map(|(name, record)| WorkerLine {
                name: name.clone(),
                status: format!("{:?}", record.status),
                loops: record.loops,
                pass_loops: record.pass_loops,
                fail_loops: record.fail_loops,
                failures: record.failures.clone(),
            })
            .collect();
        lines.sort_by(|a, b| a.name.cmp(&b.name));
        lines
    }

    fn render(&self) {
        // Display is stateless across ticks here; a fresh Display per call
        // keeps render() free of &mut self, which self.run()'s borrow
        // pattern (holding &mut self.listener across the tick) prefers.
        let mut display = Display::new();
        display.render(&self.lines());
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_count_counts_only_running() {
        let mut workers = HashMap::new();
        workers.insert(
            "a".to_string(),
            WorkerRecord { status: Status::Running, loop_number: 1, loops: 3, pass_loops: 1, fail_loops: 0, failures: vec![] },
        );
        workers.insert(
            "b".to_string(),
            WorkerRecord { status: Status::Complete, loop_number: 3, loops: 3, pass_loops: 2, fail_loops: 1, failures: vec![] },
        );
        let count = workers.values().filter(|w| w.status == Status::Running).count();
        assert_eq!(count, 1);
    }
}
