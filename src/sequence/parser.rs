//! Sequence file reading: splits delimiter-escaped fields, resolves builtin
//! command tokens, and walks continuation/comment lines.
//!
//! Sequence-file parsing itself sits outside this engine's core scope; this
//! module exists because the Sequence Worker needs a concrete `ParsedCommand`
//! to dispatch on, and the field layout is part of the external interface.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ErrorKind, Result};
use crate::sequence::{BuiltinAction, CommandKind, ConnectInfo, ParsedCommand};

const SEQ_COMMENT_HEADER: char = '#';
const SEQ_CONTINUE_NEXTLINE: char = '\\';
const SEQ_ITEM_DELIMITER: char = ';';
const SEQ_SUBITEM_DELIMITER: char = ',';

/// Split `line` on `delimiter`, treating a delimiter preceded by a backslash
/// as a literal character rather than a field boundary. The backslash
/// itself is dropped from the resulting item.
#[must_use]
pub fn sequence_item_split(line: &str, delimiter: char) -> Vec<String> {
    let mut items: Vec<String> = vec![String::new()];
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == delimiter {
                    items.last_mut().expect("non-empty").push(next);
                    chars.next();
                    continue;
                }
            }
            items.last_mut().expect("non-empty").push(c);
            continue;
        }
        if c == delimiter {
            items.push(String::new());
            continue;
        }
        items.last_mut().expect("non-empty").push(c);
    }
    items.into_iter().map(|s| s.trim().to_string()).collect()
}

fn split_subitems(field: &str) -> Vec<String> {
    if field.is_empty() {
        return Vec::new();
    }
    sequence_item_split(field, SEQ_SUBITEM_DELIMITER)
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_command_args(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

static CONNECT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"^ssh$", r"^telnet$", r"^connect host$"]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
});

fn is_connect_command(argv: &[String]) -> bool {
    let head = argv.join(" ");
    let first = argv.first().map(String::as_str).unwrap_or("");
    CONNECT_PATTERNS
        .iter()
        .any(|re| re.is_match(first) || re.is_match(&head))
}

/// `(pattern, action tag)` table, in declaration order. A command word can
/// match more than one pattern; the *last* match in table order wins, not
/// the first — ported as-is from the original builtin registry.
static BUILTIN_TABLE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"^CTRL-C$").unwrap(), "INTR"),
        (Regex::new(r"^RUN-SEQUENCE(-WAIT)?$").unwrap(), "NEW_WORKER"),
        (Regex::new(r"^(quit|exit|ctrl-\]|ctrl-x)$").unwrap(), "QUIT"),
        (Regex::new(r"^CLOSE$").unwrap(), "CLOSE"),
        (Regex::new(r"^SEND-PULSE$").unwrap(), "PULSE"),
        (Regex::new(r"^END-PULSE$").unwrap(), "INTR"),
        (Regex::new(r"^WAIT$").unwrap(), "WAIT"),
        (Regex::new(r"^SET-PROMPT$").unwrap(), "SET_PROMPT"),
        (Regex::new(r"^SEND-ENTER$").unwrap(), "ENTER"),
        (Regex::new(r"^FIND$").unwrap(), "FIND"),
        (Regex::new(r"^MONITOR$").unwrap(), "MONITOR"),
        (Regex::new(r"^SUBSEQUENCE$").unwrap(), "SUBSEQUENCE"),
        (Regex::new(r"^END-SUBSEQUENCE$").unwrap(), "END_SUBSEQUENCE"),
        (Regex::new(r"^LOOP$").unwrap(), "LOOP"),
    ]
});

/// Return the action tag for `word`, or `None` if it matches nothing —
/// keeps scanning after the first hit so a word matching multiple patterns
/// resolves to the last one listed.
fn match_builtin_command(word: &str) -> Option<&'static str> {
    let mut found = None;
    for (pattern, action) in BUILTIN_TABLE.iter() {
        if pattern.is_match(word) {
            found = Some(*action);
        }
    }
    found
}

/// Parse one logical (continuation-joined, comment-stripped) line into a
/// `ParsedCommand`.
pub fn sequence_line_parser(line: &str, entry_dir: &Path) -> Result<ParsedCommand> {
    let fields = sequence_item_split(line, SEQ_ITEM_DELIMITER);
    let first = fields.first().cloned().unwrap_or_default();
    let argv = split_command_args(&first);
    let keyword = argv.first().cloned().unwrap_or_default();

    let builtin_tag = match_builtin_command(&keyword);

    if let Some(tag) = builtin_tag {
        return build_builtin(tag, &keyword, &first, &argv, &fields, entry_dir);
    }

    if is_connect_command(&argv) {
        return Ok(build_connect(first, argv, &fields));
    }

    Ok(build_send(first, argv, &fields))
}

fn parse_timeout(fields: &[String], idx: usize) -> Option<f64> {
    fields.get(idx).and_then(|s| {
        if s.is_empty() {
            None
        } else {
            s.parse::<f64>().ok()
        }
    })
}

fn build_send(first: String, argv: Vec<String>, fields: &[String]) -> ParsedCommand {
    let expect = fields.get(1).map(|s| split_subitems(s)).unwrap_or_default();
    let escape = fields.get(2).map(|s| split_subitems(s)).unwrap_or_default();
    let timeout = parse_timeout(fields, 3);
    ParsedCommand {
        kind: CommandKind::Send,
        argv,
        command: first,
        expect,
        escape,
        timeout,
        bg_run: false,
        wait_passphrase: false,
        text_invisible: false,
    }
}

fn build_connect(first: String, argv: Vec<String>, fields: &[String]) -> ParsedCommand {
    let login = fields.get(1).map(|s| split_subitems(s)).unwrap_or_default();
    let user = login.first().cloned();
    let password = login.get(1).cloned();
    let boot_expect = fields.get(2).map(|s| split_subitems(s)).unwrap_or_default();
    let boot_escape = fields.get(3).map(|s| split_subitems(s)).unwrap_or_default();
    let timeout = parse_timeout(fields, 4);
    ParsedCommand {
        kind: CommandKind::Connect(ConnectInfo {
            user,
            password,
            boot_expect,
            boot_escape,
        }),
        argv,
        command: first,
        expect: Vec::new(),
        escape: Vec::new(),
        timeout,
        bg_run: false,
        wait_passphrase: false,
        text_invisible: false,
    }
}

fn build_builtin(
    tag: &str,
    keyword: &str,
    first: &str,
    argv: &[String],
    fields: &[String],
    entry_dir: &Path,
) -> Result<ParsedCommand> {
    let action = match tag {
        "INTR" => BuiltinAction::Intr,
        "QUIT" => BuiltinAction::Quit,
        "CLOSE" => BuiltinAction::Close,
        "PULSE" => BuiltinAction::Pulse,
        "WAIT" => BuiltinAction::Wait,
        "SET_PROMPT" => BuiltinAction::SetPrompt,
        "ENTER" => BuiltinAction::Enter,
        "FIND" => BuiltinAction::Find {
            target_file: fields.get(1).cloned().unwrap_or_default(),
            search_dirs: fields.get(2).map(|s| split_subitems(s)).unwrap_or_default(),
        },
        "MONITOR" => BuiltinAction::Monitor {
            inner_command: argv.get(1..).map(|a| a.join(" ")).unwrap_or_default(),
            watch: fields.get(1).map(|s| split_subitems(s)).unwrap_or_default(),
            interval: parse_timeout(fields, 2).unwrap_or(5.0),
        },
        "NEW_WORKER" => {
            let raw_file = argv.get(1).cloned().ok_or_else(|| ErrorKind::SequenceParse {
                detail: format!("{keyword} missing sequence file argument"),
            })?;
            let sequence_file = resolve_relative(entry_dir, &raw_file);
            let loops = argv
                .get(2)
                .and_then(|s| s.parse::<u32>().ok())
                .or_else(|| parse_timeout(fields, 1).map(|f| f as u32))
                .unwrap_or(1);
            BuiltinAction::NewWorker {
                sequence_file,
                loops,
                wait_for_child: keyword.contains("WAIT"),
            }
        }
        "SUBSEQUENCE" => BuiltinAction::Subsequence {
            name: argv.get(1).cloned().unwrap_or_default(),
        },
        "END_SUBSEQUENCE" => BuiltinAction::EndSubsequence {
            name: argv.get(1).cloned().unwrap_or_default(),
        },
        "LOOP" => BuiltinAction::Loop {
            sub: argv.get(1).cloned().unwrap_or_default(),
            n: argv
                .get(2)
                .and_then(|s| s.parse::<u32>().ok())
                .or_else(|| parse_timeout(fields, 1).map(|f| f as u32))
                .unwrap_or(1),
        },
        _ => unreachable!("every BUILTIN_TABLE tag is handled above"),
    };

    Ok(ParsedCommand {
        kind: CommandKind::Builtin(action),
        argv: argv.to_vec(),
        command: first.to_string(),
        expect: Vec::new(),
        escape: Vec::new(),
        timeout: None,
        bg_run: false,
        wait_passphrase: false,
        text_invisible: false,
    })
}

fn resolve_relative(entry_dir: &Path, raw: &str) -> String {
    let p = Path::new(raw);
    if p.is_absolute() {
        raw.to_string()
    } else {
        entry_dir.join(p).to_string_lossy().into_owned()
    }
}

static WAITPASSPHRASE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i).*(password|pass ?phrase).*:\s{0,2}$").expect("valid regex"));

/// Post-pass over a fully parsed sequence: marks trailing-`&` background
/// sends, flags the item *after* a single waitpassphrase-matching expect as
/// invisible/wait-passphrase, and resolves `SUBSEQUENCE`/`END-SUBSEQUENCE`
/// pairs into named ranges consumed by `LOOP`.
pub fn sequence_finalize(commands: &mut [ParsedCommand]) -> Vec<(String, std::ops::Range<usize>)> {
    for cmd in commands.iter_mut() {
        if matches!(cmd.kind, CommandKind::Send) && cmd.command.trim_end().ends_with('&') {
            cmd.bg_run = true;
            cmd.command = cmd.command.trim_end().trim_end_matches('&').trim_end().to_string();
        }
        if cmd.expect.len() == 1 && WAITPASSPHRASE_PATTERN.is_match(&cmd.expect[0]) {
            cmd.wait_passphrase = true;
        }
    }

    let mut ranges = Vec::new();
    let mut open: Option<(String, usize)> = None;
    for (idx, cmd) in commands.iter().enumerate() {
        if let CommandKind::Builtin(BuiltinAction::Subsequence { name }) = &cmd.kind {
            open = Some((name.clone(), idx + 1));
        }
        if let CommandKind::Builtin(BuiltinAction::EndSubsequence { name }) = &cmd.kind {
            if let Some((open_name, start)) = open.take() {
                let resolved_name = if name.is_empty() { open_name } else { name.clone() };
                ranges.push((resolved_name, start..idx));
            }
        }
    }
    ranges
}

/// Read a sequence file: strips `#` comments, joins `\`-continued lines,
/// parses each logical line, and runs the finalize pass.
pub fn sequence_reader(
    sequence_file: &str,
) -> Result<(Vec<ParsedCommand>, Vec<(String, std::ops::Range<usize>)>)> {
    let path = PathBuf::from(sequence_file);
    let entry_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let raw = std::fs::read_to_string(&path).map_err(|e| ErrorKind::SequenceParse {
        detail: format!("cannot read {sequence_file}: {e}"),
    })?;

    let mut logical_lines: Vec<String> = Vec::new();
    let mut pending = String::new();
    for raw_line in raw.lines() {
        let without_comment = strip_comment(raw_line);
        let trimmed = without_comment.trim_end();
        if let Some(continued) = trimmed.strip_suffix(SEQ_CONTINUE_NEXTLINE) {
            pending.push_str(continued);
            continue;
        }
        pending.push_str(trimmed);
        if !pending.trim().is_empty() {
            logical_lines.push(std::mem::take(&mut pending));
        } else {
            pending.clear();
        }
    }

    let mut commands = Vec::new();
    for line in &logical_lines {
        commands.push(sequence_line_parser(line, &entry_dir)?);
    }

    let ranges = sequence_finalize(&mut commands);
    Ok((commands, ranges))
}

fn strip_comment(line: &str) -> &str {
    match line.find(SEQ_COMMENT_HEADER) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_split_respects_escaped_delimiter() {
        let items = sequence_item_split(r"echo a\;b ; expect ; ; 5", ';');
        assert_eq!(items, vec!["echo a;b", "expect", "", "5"]);
    }

    #[test]
    fn test_builtin_matches_last_wins_when_ambiguous() {
        assert_eq!(match_builtin_command("SEND-PULSE"), Some("PULSE"));
        assert_eq!(match_builtin_command("END-PULSE"), Some("INTR"));
        assert_eq!(match_builtin_command("CTRL-C"), Some("INTR"));
    }

    #[test]
    fn test_quit_tokens_recognized() {
        for tok in ["quit", "exit", "ctrl-]", "ctrl-x"] {
            assert_eq!(match_builtin_command(tok), Some("QUIT"));
        }
    }

    #[test]
    fn test_send_line_parses_expect_escape_timeout() {
        let cmd = sequence_line_parser("echo hello ; WORLD ; ; 5", Path::new(".")).unwrap();
        assert!(matches!(cmd.kind, CommandKind::Send));
        assert_eq!(cmd.expect, vec!["WORLD"]);
        assert_eq!(cmd.timeout, Some(5.0));
    }

    #[test]
    fn test_connect_line_extracts_user_password() {
        let cmd = sequence_line_parser("ssh user@10.0.0.1 ; user,secret", Path::new(".")).unwrap();
        match cmd.kind {
            CommandKind::Connect(info) => {
                assert_eq!(info.user.as_deref(), Some("user"));
                assert_eq!(info.password.as_deref(), Some("secret"));
            }
            _ => panic!("expected connect command"),
        }
    }

    #[test]
    fn test_new_worker_resolves_relative_path() {
        let cmd = sequence_line_parser(
            "RUN-SEQUENCE-WAIT child.seq 3",
            Path::new("test_sequences"),
        )
        .unwrap();
        match cmd.kind {
            CommandKind::Builtin(BuiltinAction::NewWorker {
                sequence_file,
                loops,
                wait_for_child,
            }) => {
                assert_eq!(sequence_file, "test_sequences/child.seq");
                assert_eq!(loops, 3);
                assert!(wait_for_child);
            }
            _ => panic!("expected NEW_WORKER"),
        }
    }

    #[test]
    fn test_finalize_marks_bg_run() {
        let mut commands = vec![build_send("echo hi &".into(), vec!["echo".into(), "hi".into(), "&".into()], &[])];
        sequence_finalize(&mut commands);
        assert!(commands[0].bg_run);
        assert_eq!(commands[0].command, "echo hi");
    }

    #[test]
    fn test_finalize_resolves_subsequence_range() {
        let mut commands = vec![
            build_builtin("SUBSEQUENCE", "SUBSEQUENCE", "SUBSEQUENCE retry", &["SUBSEQUENCE".into(), "retry".into()], &[], Path::new(".")).unwrap(),
            build_send("echo a".into(), vec!["echo".into(), "a".into()], &[]),
            build_builtin("END_SUBSEQUENCE", "END-SUBSEQUENCE", "END-SUBSEQUENCE", &["END-SUBSEQUENCE".into()], &[], Path::new(".")).unwrap(),
        ];
        let ranges = sequence_finalize(&mut commands);
        assert_eq!(ranges, vec![("retry".to_string(), 1..2)]);
    }
}
