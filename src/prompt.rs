//! Prompt heuristics: pure string functions for classifying terminal output.
//!
//! Hardware consoles do not give clean line editing: they emit CR-wrap,
//! insert timestamps, double-echo prompts, and occasionally drop bytes.
//! These routines exist to cope with that, not to parse well-formed output.

use std::sync::LazyLock;

use regex::Regex;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B(?:[@-Z\\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid regex"));

static LEADING_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]{3} [A-Za-z]{3} \d{2} \d{2}:\d{2}:\d{2} ").expect("valid regex")
});

static TERMINATOR_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[$#>] {0,3}$").expect("valid regex"));

/// Strip ANSI CSI escape sequences from `s`.
#[must_use]
pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").into_owned()
}

/// Return the last non-blank line of `s`, with trailing whitespace trimmed
/// from the buffer first and leading whitespace trimmed from the line.
#[must_use]
pub fn last_non_blank_line(s: &str) -> &str {
    let trimmed = s.trim_end();
    for line in trimmed.rsplit('\n') {
        let candidate = line.trim_start();
        if !candidate.trim().is_empty() {
            return candidate;
        }
    }
    ""
}

/// Strip a leading `"Xxx Xxx DD HH:MM:SS "` timestamp, if present.
#[must_use]
pub fn strip_leading_timestamp(s: &str) -> String {
    LEADING_TIMESTAMP.replace(s, "").into_owned()
}

/// Whether the tail of `s` matches `$`, `#`, or `>` followed by ≤3 spaces at
/// end of string.
#[must_use]
pub fn has_terminator_char(s: &str) -> bool {
    let mut tail_start = s.len().saturating_sub(10);
    while tail_start > 0 && !s.is_char_boundary(tail_start) {
        tail_start -= 1;
    }
    TERMINATOR_TAIL.is_match(&s[tail_start..])
}

/// Whether `s`, split near its midpoint, has equal left/right halves after
/// trimming spaces. Rejects garbled double-echo.
#[must_use]
pub fn is_duplicated_half(s: &str) -> bool {
    let bytes = s.as_bytes();
    let len = bytes.len();
    if len < 2 {
        return false;
    }
    let mid = len / 2;
    let lo = mid.saturating_sub(3);
    let hi = (mid + 3).min(len);
    for split in lo..=hi {
        let left = s[..split].trim();
        let right = s[split..].trim();
        if !left.is_empty() && left == right {
            return true;
        }
    }
    false
}

/// Return the portion of `sent` not yet present in `echoed`, tolerating one
/// embedded `\r` (serial consoles insert a CR when the 1-line console
/// buffer overflows). Returns an empty string if `sent` is already fully
/// accounted for, or if no alignment can be found at all.
#[must_use]
pub fn fuzzy_complement(sent: &str, echoed: &str) -> String {
    if echoed.contains(sent) || sent.is_empty() {
        return String::new();
    }
    if let Some(stripped) = strip_prefix_overlap(sent, echoed) {
        return stripped;
    }
    if let Some(cr_pos) = sent.find('\r') {
        let (left, right) = (&sent[..cr_pos], &sent[cr_pos + 1..]);
        if echoed.ends_with(left) || echoed.contains(left) {
            if let Some(found) = echoed.find(right) {
                let consumed_end = found + right.len();
                if consumed_end <= echoed.len() {
                    return String::new();
                }
            }
            // right not found in remainder: nothing of sent was echoed past
            // the CR split point, so everything after the split is unsent.
            if !echoed.contains(right) {
                return right.to_string();
            }
        }
    }
    String::new()
}

/// Find the longest prefix of `sent` that is a suffix of `echoed` and return
/// the remainder of `sent` after it. `None` if `sent` itself is a prefix of
/// nothing useful (caller falls through to the CR-aware path).
fn strip_prefix_overlap(sent: &str, echoed: &str) -> Option<String> {
    for take in (1..=sent.len()).rev() {
        if !sent.is_char_boundary(take) {
            continue;
        }
        let prefix = &sent[..take];
        if echoed.ends_with(prefix) {
            return Some(sent[take..].to_string());
        }
    }
    None
}

/// Walk `cmd` and `output` character by character, skipping over `\r` (and
/// `" \r"`) insertions in the output; allow one backtrack after a CR.
/// Returns true iff every character of `cmd` was consumed.
#[must_use]
pub fn search_command_in_echo(cmd: &str, output: &str) -> bool {
    let cmd_chars: Vec<char> = cmd.chars().collect();
    let out_chars: Vec<char> = output.chars().collect();
    let mut ci = 0usize;
    let mut oi = 0usize;
    let mut backtracked_after_cr = false;

    while ci < cmd_chars.len() {
        if oi >= out_chars.len() {
            return false;
        }
        if out_chars[oi] == '\r' {
            oi += 1;
            if oi < out_chars.len() && out_chars[oi] == ' ' && !backtracked_after_cr {
                // tolerate a stray " \r" pair by allowing the space too
                backtracked_after_cr = true;
            }
            continue;
        }
        if out_chars[oi] == cmd_chars[ci] {
            ci += 1;
            oi += 1;
            continue;
        }
        if !backtracked_after_cr && oi > 0 && out_chars[oi - 1] == '\r' {
            // one backtrack after a CR insertion: retry this cmd char
            // against the next output char without consuming cmd.
            backtracked_after_cr = true;
            oi += 1;
            continue;
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_removes_csi() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
    }

    #[test]
    fn test_strip_ansi_idempotent() {
        let s = "\x1b[1;32mhello\x1b[0m world";
        let once = strip_ansi(s);
        assert_eq!(strip_ansi(&once), once);
    }

    #[test]
    fn test_last_non_blank_line() {
        assert_eq!(last_non_blank_line("a\nb\n\n  \nc\n"), "c");
    }

    #[test]
    fn test_strip_leading_timestamp() {
        assert_eq!(
            strip_leading_timestamp("Mon Jan 02 15:04:05 user@host$ "),
            "user@host$ "
        );
    }

    #[test]
    fn test_strip_leading_timestamp_idempotent() {
        let s = "no timestamp here";
        assert_eq!(strip_leading_timestamp(s), strip_leading_timestamp(s));
    }

    #[test]
    fn test_has_terminator_char() {
        assert!(has_terminator_char("user@host$ "));
        assert!(has_terminator_char("user@host# "));
        assert!(has_terminator_char("user@host> "));
        assert!(!has_terminator_char("user@host: "));
    }

    #[test]
    fn test_is_duplicated_half() {
        assert!(is_duplicated_half("hello hello"));
        assert!(!is_duplicated_half("hello world"));
    }

    #[test]
    fn test_fuzzy_complement_identical_returns_empty() {
        assert_eq!(fuzzy_complement("show version", "show version"), "");
    }

    #[test]
    fn test_fuzzy_complement_partial_echo() {
        assert_eq!(fuzzy_complement("show version", "show ver"), "sion");
    }

    #[test]
    fn test_search_command_in_echo_exact() {
        assert!(search_command_in_echo("ls -la", "ls -la"));
    }

    #[test]
    fn test_search_command_in_echo_cr_insertion() {
        assert!(search_command_in_echo("ls -la", "ls\r -la"));
    }

    #[test]
    fn test_search_command_in_echo_dropped_char_fails() {
        assert!(!search_command_in_echo("ls -la", "ls -l"));
    }
}
