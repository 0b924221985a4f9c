//! Worker -> Master IPC: a one-shot connect/write/close JSON message over a
//! filesystem-named Unix stream socket.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

pub const SEQUENCE_START: u8 = 1;
pub const SEQUENCE_COMPLETE: u8 = 2;
pub const LOOP_UNKNOWN: u8 = 3;
pub const LOOP_PASS: u8 = 4;
pub const LOOP_FAIL: u8 = 5;

/// Wire shape for one status message a worker reports to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    pub msg: u8,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub loop_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub loops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub msg_q: Option<Vec<String>>,
}

impl IpcMessage {
    #[must_use]
    pub fn sequence_start(name: &str, loops: u32) -> Self {
        Self {
            msg: SEQUENCE_START,
            name: name.to_string(),
            loop_number: None,
            loops: Some(loops),
            msg_q: None,
        }
    }

    #[must_use]
    pub fn sequence_complete(name: &str) -> Self {
        Self {
            msg: SEQUENCE_COMPLETE,
            name: name.to_string(),
            loop_number: None,
            loops: None,
            msg_q: None,
        }
    }

    #[must_use]
    pub fn loop_status(msg: u8, name: &str, loop_number: u32, failures: Vec<String>) -> Self {
        Self {
            msg,
            name: name.to_string(),
            loop_number: Some(loop_number),
            loops: None,
            msg_q: if failures.is_empty() { None } else { Some(failures) },
        }
    }
}

/// Errno classes worth retrying a send on: the master hasn't started
/// listening yet, or the connection briefly dropped mid-handshake.
fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN)
            | Some(libc::EWOULDBLOCK)
            | Some(libc::ECONNREFUSED)
            | Some(libc::ECONNABORTED)
            | Some(libc::EBADF)
            | Some(libc::ENOTCONN)
            | Some(libc::EPIPE)
    )
}

/// Send one message to the master's socket, opening a fresh connection for
/// each attempt and retrying retryable errors for up to `retry_budget_secs`.
pub async fn send(socket_path: &str, message: &IpcMessage, retry_budget_secs: f64) -> std::io::Result<()> {
    let deadline = Instant::now() + Duration::from_secs_f64(retry_budget_secs);
    let payload = serde_json::to_vec(message).expect("IpcMessage always serializes");

    loop {
        match try_send_once(socket_path, &payload).await {
            Ok(()) => return Ok(()),
            Err(e) if is_retryable(&e) && Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_send_once(socket_path: &str, payload: &[u8]) -> std::io::Result<()> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(payload).await?;
    stream.write_all(b"\n").await?;
    stream.shutdown().await?;
    Ok(())
}

/// Master-side listener: binds `socket_path`, removing any stale file left
/// over from a prior run at the same name.
pub fn bind(socket_path: &str) -> std::io::Result<UnixListener> {
    let _ = std::fs::remove_file(socket_path);
    UnixListener::bind(socket_path)
}

/// Non-blocking accept-and-read: returns `Ok(None)` if nothing is pending.
pub async fn try_recv(listener: &UnixListener) -> std::io::Result<Option<IpcMessage>> {
    let accepted = tokio::time::timeout(Duration::from_millis(10), listener.accept()).await;
    let (mut stream, _addr) = match accepted {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Ok(None),
    };
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let trimmed: &[u8] = buf
        .split(|&b| b == b'\n')
        .find(|line| !line.is_empty())
        .unwrap_or(&[]);
    if trimmed.is_empty() {
        return Ok(None);
    }
    let message = serde_json::from_slice(trimmed)?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_start_omits_loop_number() {
        let m = IpcMessage::sequence_start("boot.seq", 3);
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("loop_number"));
        assert!(json.contains("\"loops\":3"));
    }

    #[test]
    fn test_loop_status_includes_failures_when_present() {
        let m = IpcMessage::loop_status(LOOP_FAIL, "boot.seq", 2, vec!["expect mismatch".to_string()]);
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("expect mismatch"));
    }

    #[test]
    fn test_loop_status_omits_msg_q_when_empty() {
        let m = IpcMessage::loop_status(LOOP_PASS, "boot.seq", 1, vec![]);
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("msg_q"));
    }

    #[tokio::test]
    async fn test_round_trip_over_real_socket() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("autorobotd-ipc-test-{}.sock", std::process::id()));
        let path_str = path.to_string_lossy().into_owned();
        let listener = bind(&path_str).unwrap();

        let sent = IpcMessage::sequence_start("demo.seq", 5);
        let sent_clone = sent.clone();
        let path_for_send = path_str.clone();
        let sender = tokio::spawn(async move {
            send(&path_for_send, &sent_clone, 5.0).await.unwrap();
        });

        let mut received = None;
        for _ in 0..50 {
            if let Some(msg) = try_recv(&listener).await.unwrap() {
                received = Some(msg);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        sender.await.unwrap();
        let received = received.expect("message should have arrived");
        assert_eq!(received.name, sent.name);
        assert_eq!(received.loops, sent.loops);
        let _ = std::fs::remove_file(&path_str);
    }
}
