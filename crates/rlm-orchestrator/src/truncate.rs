//! What the model sees of a step's captured output.

/// Prefix for output shown in full.
pub const FULL_OUTPUT_MARKER: &str = "[Full output shown]";

/// Shown instead of output when the code printed nothing.
pub const EMPTY_OUTPUT_MARKER: &str = "[Empty output: the code printed nothing]";

/// Applies the truncation policy to captured output.
///
/// Lengths are counted in `char`s. Output longer than `truncate_len` keeps
/// only its last `truncate_len` characters, behind a marker naming the limit.
pub fn truncate_output(output: &str, truncate_len: usize) -> String {
    let len = output.chars().count();

    if len == 0 {
        return EMPTY_OUTPUT_MARKER.to_string();
    }
    if len <= truncate_len {
        return format!("{FULL_OUTPUT_MARKER}\n{output}");
    }

    let tail: String = output.chars().skip(len - truncate_len).collect();
    format!("[Output truncated: last {truncate_len} chars shown]\n{tail}")
}
