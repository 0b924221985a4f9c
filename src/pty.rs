//! PTY allocation, child spawning, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The master fd outlives the child
//! process so the agent can keep polling it after the child under it has
//! exited (to drain any trailing output before the handle is torn down).

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let OpenptyResult { master, slave } = openpty(&winsize, None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn `argv[0] argv[1..]` on the slave side of the PTY.
///
/// Used for the very first connect command when the frame stack is empty:
/// the agent has no running shell yet, so the connect command itself (e.g.
/// `ssh user@host`, `telnet host 2003`) becomes the PTY's child. The child
/// becomes a session leader with the PTY slave as its controlling terminal.
pub fn spawn_pty_child(pty: &PtyPair, argv: &[String], working_dir: &str) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let Some((prog, args)) = argv.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty argv",
        ));
    };

    let mut cmd = Command::new(prog);
    cmd.args(args);
    cmd.current_dir(working_dir).kill_on_drop(true);

    // Stdio is handled by pre_exec (dup2 to the PTY slave); tell tokio not to
    // set up pipes of its own.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: all syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that writes a Winsize struct.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(winsize),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Send a signal to the child's entire process group (the child called
/// `setsid`, so its pgid equals its pid).
pub fn signal_pgroup(pid: i32, signal: libc::c_int) {
    unsafe {
        libc::kill(-pid, signal);
    }
}
