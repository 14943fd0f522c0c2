//! Log trimming ahead of the model call.

use spool_db::TruncateStrategy;

/// Fraction of the budget given to the leading lines under `smart`.
const SMART_HEAD_FRACTION: f64 = 0.4;

/// Reduces `lines` to at most `max_lines`, inserting a synthetic marker
/// where content was dropped. Logs within budget pass through joined as-is.
pub fn truncate_lines(lines: &[String], max_lines: usize, strategy: TruncateStrategy) -> String {
    if lines.len() <= max_lines {
        return lines.join("\n");
    }

    let omitted = lines.len() - max_lines;
    let mut out = String::new();

    match strategy {
        TruncateStrategy::Head => {
            for line in &lines[..max_lines] {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str(&format!("\n... [{omitted} lines omitted] ...\n"));
        }
        TruncateStrategy::Tail => {
            out.push_str(&format!("... [{omitted} lines omitted] ...\n\n"));
            for line in &lines[lines.len() - max_lines..] {
                out.push_str(line);
                out.push('\n');
            }
        }
        TruncateStrategy::Smart => {
            let head = (max_lines as f64 * SMART_HEAD_FRACTION) as usize;
            let tail = max_lines - head;

            for line in &lines[..head] {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str(&format!("\n... [{omitted} lines omitted] ...\n\n"));
            for line in &lines[lines.len() - tail..] {
                out.push_str(line);
                out.push('\n');
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("line-{i}")).collect()
    }

    #[test]
    fn within_budget_passes_through() {
        let lines = numbered(3);
        let out = truncate_lines(&lines, 10, TruncateStrategy::Smart);
        assert_eq!(out, "line-0\nline-1\nline-2");
    }

    #[test]
    fn head_keeps_the_start_and_appends_the_marker() {
        let lines = numbered(10);
        let out = truncate_lines(&lines, 4, TruncateStrategy::Head);

        assert!(out.starts_with("line-0\nline-1\nline-2\nline-3\n"));
        assert!(out.ends_with("\n... [6 lines omitted] ...\n"));
        assert!(!out.contains("line-4"));
    }

    #[test]
    fn tail_keeps_the_end_and_prepends_the_marker() {
        let lines = numbered(10);
        let out = truncate_lines(&lines, 4, TruncateStrategy::Tail);

        assert!(out.starts_with("... [6 lines omitted] ...\n\n"));
        assert!(out.ends_with("line-6\nline-7\nline-8\nline-9\n"));
        assert!(!out.contains("line-5"));
    }

    #[test]
    fn smart_splits_forty_sixty_around_the_marker() {
        let lines = numbered(20);
        let out = truncate_lines(&lines, 10, TruncateStrategy::Smart);

        // 40% of 10 = 4 leading lines, 6 trailing.
        assert!(out.starts_with("line-0\nline-1\nline-2\nline-3\n"));
        assert!(out.contains("\n... [10 lines omitted] ...\n\n"));
        assert!(out.ends_with("line-14\nline-15\nline-16\nline-17\nline-18\nline-19\n"));
    }

    #[test]
    fn unknown_strategy_strings_degrade_to_tail() {
        // The lossy parser is the only path strategy strings enter through.
        assert_eq!(
            TruncateStrategy::parse_lossy("mystery"),
            TruncateStrategy::Tail
        );
        assert_eq!(TruncateStrategy::parse_lossy("head"), TruncateStrategy::Head);
        assert_eq!(
            TruncateStrategy::parse_lossy("smart"),
            TruncateStrategy::Smart
        );
    }

    #[test]
    fn marker_counts_the_omitted_lines_exactly() {
        let lines = numbered(1_000);
        let out = truncate_lines(&lines, 100, TruncateStrategy::Tail);
        assert!(out.starts_with("... [900 lines omitted] ...\n\n"));
    }
}
