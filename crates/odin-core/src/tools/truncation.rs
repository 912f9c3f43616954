//! Output truncation for planner-facing tool results.

/// Ceiling on tool output surfaced to the planner.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 30_000;

/// Truncate at a UTF-8 boundary, preferring the last full line, with an
/// explicit marker recording what was dropped.
pub fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_TOOL_OUTPUT_CHARS {
        return output.to_string();
    }

    let truncated_len = floor_char_boundary(output, MAX_TOOL_OUTPUT_CHARS);
    let truncated = &output[..truncated_len];
    let break_point = truncated.rfind('\n').unwrap_or(truncated_len);
    let clean = &output[..break_point];
    format!(
        "{}\n\n[... OUTPUT TRUNCATED: {} chars -> {} chars ...]",
        clean,
        output.len(),
        clean.len()
    )
}

pub fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut boundary = index.min(text.len());
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

/// Strip ANSI escape sequences from command output.
pub fn strip_ansi(text: &str) -> String {
    use once_cell::sync::Lazy;
    use regex::Regex;
    static ANSI: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]|\x1b\][^\x07]*\x07|\x1b\[[\?0-9;]*[a-zA-Z]")
            .expect("valid regex")
    });
    ANSI.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_passes_through() {
        assert_eq!(truncate_output("hello"), "hello");
    }

    #[test]
    fn long_output_truncates_at_line_boundary_with_marker() {
        let line = "x".repeat(100);
        let big = std::iter::repeat(line).take(400).collect::<Vec<_>>().join("\n");
        let out = truncate_output(&big);
        assert!(out.len() < big.len());
        assert!(out.contains("OUTPUT TRUNCATED"));
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let big = "é".repeat(MAX_TOOL_OUTPUT_CHARS);
        let out = truncate_output(&big);
        assert!(out.contains("OUTPUT TRUNCATED"));
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        let colored = "\x1b[31mred\x1b[0m plain";
        assert_eq!(strip_ansi(colored), "red plain");
    }
}
