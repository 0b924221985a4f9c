//! Small helpers shared across modules: path expansion, log naming, and
//! duration string parsing.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Local;
use regex::Regex;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Basename of a sequence file path with its extension stripped, used to
/// build log and socket names.
#[must_use]
pub fn sequence_base(sequence_file: &str) -> String {
    Path::new(sequence_file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(sequence_file)
        .to_string()
}

/// Build a log path under `./log[/suffix_dir]/<mon>-<DD>-<HHMM>-<YYYY>_<sequence>[_<suffix>].log`.
///
/// `suffix` names both the subdirectory (`failure`, `errordump`) and the
/// filename suffix; pass `None` for the plain per-worker transcript log.
#[must_use]
pub fn new_log_path(sequence_file: &str, suffix: Option<&str>) -> PathBuf {
    let now = Local::now();
    let stamp = now.format("%b-%d-%H%M-%Y").to_string();
    let base = sequence_base(sequence_file);
    let (dir, name) = match suffix {
        Some(s) => (
            PathBuf::from("log").join(s),
            format!("{stamp}_{base}_{s}.log"),
        ),
        None => (PathBuf::from("log"), format!("{stamp}_{base}.log")),
    };
    dir.join(name)
}

/// Build a Unix domain socket path `./.uds_<seqbase>[_<timestamp>].sock`,
/// appending a timestamp suffix if the bare name is already taken.
#[must_use]
pub fn new_uds_name(sequence_file: &str) -> PathBuf {
    let base = sequence_base(sequence_file);
    let plain = PathBuf::from(format!(".uds_{base}.sock"));
    if !plain.exists() {
        return plain;
    }
    let stamp = Local::now().format("%H%M%S").to_string();
    PathBuf::from(format!(".uds_{base}_{stamp}.sock"))
}

static DURATION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)([A-Za-z]*)").expect("valid regex"));

/// Parse a duration string like `"1h30m"`, `"90s"`, or a bare number of
/// seconds (`"45"`) into seconds. Unknown or missing unit letters default to
/// seconds, matching the loosely-typed original parser.
#[must_use]
pub fn parse_time_to_sec(s: &str) -> f64 {
    let mut total = 0.0_f64;
    for cap in DURATION_TOKEN.captures_iter(s) {
        let Ok(value) = cap[1].parse::<f64>() else {
            continue;
        };
        let unit = &cap[2];
        let mult = match unit.to_ascii_lowercase().as_str() {
            "h" | "hr" | "hour" | "hours" => 3600.0,
            "m" | "min" | "minute" | "minutes" => 60.0,
            "" | "s" | "sec" | "second" | "seconds" => 1.0,
            _ => 1.0,
        };
        total += value * mult;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_to_sec_bare_seconds() {
        assert_eq!(parse_time_to_sec("90"), 90.0);
    }

    #[test]
    fn test_parse_time_to_sec_hours_minutes() {
        assert_eq!(parse_time_to_sec("1h30m"), 5400.0);
    }

    #[test]
    fn test_parse_time_to_sec_seconds_suffix() {
        assert_eq!(parse_time_to_sec("90s"), 90.0);
    }

    #[test]
    fn test_sequence_base_strips_extension() {
        assert_eq!(sequence_base("./test_sequences/boot.seq"), "boot");
    }

    #[test]
    fn test_new_log_path_shape() {
        let p = new_log_path("boot.seq", Some("failure"));
        assert!(p.starts_with("log/failure"));
        assert!(p.to_string_lossy().ends_with("_boot_failure.log"));
    }
}
