//! Thin live-display abstraction for the Master Scheduler: render one frame
//! of per-worker status lines, then erase them before the next frame.

use std::io::Write;

/// One worker's status line.
pub struct WorkerLine {
    pub name: String,
    pub status: String,
    pub loops: u32,
    pub pass_loops: u32,
    pub fail_loops: u32,
    pub failures: Vec<String>,
}

/// Renders successive frames to a writer, erasing the previous frame's
/// lines first. Tracks only how many lines it printed last time.
pub struct Display {
    last_line_count: usize,
}

/// Spec §7's display line shape: `<name>: <total> loops, <pass> PASS, <fail> FAIL`.
fn format_line(line: &WorkerLine) -> String {
    format!(
        "{} [{}]: {} loops, {} PASS, {} FAIL",
        line.name, line.status, line.loops, line.pass_loops, line.fail_loops
    )
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

impl Display {
    #[must_use]
    pub fn new() -> Self {
        Self { last_line_count: 0 }
    }

    /// Draw one frame: move the cursor up over the previous frame's lines,
    /// clear them, then print the new status lines.
    pub fn render(&mut self, lines: &[WorkerLine]) {
        let mut out = std::io::stdout();
        for _ in 0..self.last_line_count {
            let _ = write!(out, "\x1B[1A\x1B[2K");
        }
        for line in lines {
            let _ = writeln!(out, "{}", format_line(line));
        }
        let _ = out.flush();
        self.last_line_count = lines.len();
    }

    /// Print a final summary after the Master stops tracking any worker.
    pub fn render_summary(lines: &[WorkerLine]) {
        println!("--- summary ---");
        for line in lines {
            println!("{}", format_line(line));
            for failure in &line.failures {
                println!("  - {failure}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_tracks_line_count() {
        let mut display = Display::new();
        display.render(&[WorkerLine { name: "a.seq".into(), status: "Running".into(), loops: 3, pass_loops: 1, fail_loops: 0, failures: vec![] }]);
        assert_eq!(display.last_line_count, 1);
    }

    #[test]
    fn test_format_line_matches_spec_shape() {
        let line = WorkerLine { name: "boot.seq".into(), status: "Running".into(), loops: 5, pass_loops: 2, fail_loops: 1, failures: vec![] };
        assert_eq!(format_line(&line), "boot.seq [Running]: 5 loops, 2 PASS, 1 FAIL");
    }
}
