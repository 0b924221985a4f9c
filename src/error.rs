//! Error taxonomy for the session agent and sequence worker.
//!
//! Mirrors the original tool's exception hierarchy as a plain sum type
//! instead of a class hierarchy: each variant carries the same prompt/output
//! context the corresponding exception carried, and callers match on the
//! variant explicitly rather than relying on an "is fatal" trait method.

use std::fmt;

/// One taxonomy entry, with whatever context was available when it was
/// raised. `prompt`/`output` snapshots are used to build error-dump files
/// and log messages; they are not meant to be parsed.
#[derive(Debug, Clone)]
pub enum ErrorKind {
    /// Sequence file failed to parse.
    SequenceParse { detail: String },
    /// Frame verification mismatch after `Quit`.
    Context { prompt: String, output: String },
    /// Connect FSM exhausted its retry budget.
    Connection { detail: String },
    /// Declared expect/escape assertion failed.
    Expect { prompt: String, output: String },
    /// A read completed with no prompt match before the timeout elapsed.
    Timeout { prompt: String, output: String },
    /// Command output matched the command-error lexicon.
    InvalidCommand { prompt: String, output: String },
    /// Command echo validation failed (likely dropped/garbled bytes).
    SendMiswrite { prompt: String, output: String },
    /// `FIND` exhausted every search directory.
    FileNotFound { file: String },
    /// Recovery budget exceeded for a loop number.
    Recovery { loop_number: u32 },
    /// The PTY handle was not alive when an operation expected it to be.
    PtyDied,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceParse { detail } => write!(f, "sequence parse error: {detail}"),
            Self::Context { prompt, output } => {
                write!(f, "context mismatch after quit (prompt={prompt:?}, output={output:?})")
            }
            Self::Connection { detail } => write!(f, "connection failed: {detail}"),
            Self::Expect { prompt, output } => {
                write!(f, "expect mismatch (prompt={prompt:?}, output={output:?})")
            }
            Self::Timeout { prompt, output } => {
                write!(f, "timed out waiting for prompt {prompt:?} (output={output:?})")
            }
            Self::InvalidCommand { prompt, output } => {
                write!(f, "command error detected (prompt={prompt:?}, output={output:?})")
            }
            Self::SendMiswrite { prompt, output } => {
                write!(f, "command echo mismatch (prompt={prompt:?}, output={output:?})")
            }
            Self::FileNotFound { file } => write!(f, "file not found: {file}"),
            Self::Recovery { loop_number } => {
                write!(f, "recovery budget exceeded at loop {loop_number}")
            }
            Self::PtyDied => write!(f, "pty is not alive"),
        }
    }
}

impl std::error::Error for ErrorKind {}

impl ErrorKind {
    /// Whether this kind is always fatal to the worker, independent of
    /// `stop_on_failure`. Matches the classification table in the worker's
    /// `run_item`: `Timeout`, `Context`, `Connection`, `Recovery` and
    /// `PtyDied` always stop the worker; `Expect` is conditional; everything
    /// else triggers recovery instead of stopping outright.
    #[must_use]
    pub fn always_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Context { .. }
                | Self::Connection { .. }
                | Self::Recovery { .. }
                | Self::PtyDied
                | Self::SequenceParse { .. }
        )
    }

    /// Whether this kind should trigger the worker's recovery path
    /// (kill children, close PTY, restart the iteration) rather than being
    /// recorded as a plain expect failure.
    #[must_use]
    pub fn triggers_recovery(&self) -> bool {
        matches!(
            self,
            Self::SendMiswrite { .. } | Self::InvalidCommand { .. } | Self::FileNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_always_fatal() {
        let e = ErrorKind::Timeout {
            prompt: "$ ".into(),
            output: String::new(),
        };
        assert!(e.always_fatal());
        assert!(!e.triggers_recovery());
    }

    #[test]
    fn test_send_miswrite_triggers_recovery_not_always_fatal() {
        let e = ErrorKind::SendMiswrite {
            prompt: "$ ".into(),
            output: "gar bled".into(),
        };
        assert!(!e.always_fatal());
        assert!(e.triggers_recovery());
    }

    #[test]
    fn test_expect_is_conditional() {
        let e = ErrorKind::Expect {
            prompt: "$ ".into(),
            output: "WORLD".into(),
        };
        assert!(!e.always_fatal());
        assert!(!e.triggers_recovery());
    }
}
