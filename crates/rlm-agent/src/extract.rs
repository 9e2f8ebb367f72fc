use regex::Regex;
use std::sync::OnceLock;

/// Fence tags recognized as sandbox code.
pub const CODE_FENCE_TAGS: &[&str] = &["repl", "lua"];

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        let tags = CODE_FENCE_TAGS.join("|");
        #[allow(clippy::expect_used)]
        Regex::new(&format!(r"(?s)```(?:{tags})[ \t]*\r?\n(.*?)```"))
            .expect("code fence pattern is valid")
    })
}

/// Concatenates, in order, every fenced block tagged `repl` or `lua`.
///
/// Returns `None` when the content has no such block or every block is blank.
/// Blocks with any other tag (or no tag) are ignored.
pub fn extract_code(content: &str) -> Option<String> {
    let blocks: Vec<&str> = fence_regex()
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end())
        .filter(|block| !block.trim().is_empty())
        .collect();

    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block() {
        let content = "Let me look.\n```repl\nprint(#context)\n```\nDone.";
        assert_eq!(extract_code(content).as_deref(), Some("print(#context)"));
    }

    #[test]
    fn test_multiple_blocks_concatenated_in_order() {
        let content = "```repl\nlocal a = 1\n```\ntext\n```lua\nprint(a)\n```";
        assert_eq!(
            extract_code(content).as_deref(),
            Some("local a = 1\nprint(a)")
        );
    }

    #[test]
    fn test_other_languages_ignored() {
        let content = "```python\nprint(1)\n```\n```\nplain\n```";
        assert_eq!(extract_code(content), None);
    }

    #[test]
    fn test_no_block() {
        assert_eq!(extract_code("The answer is 4."), None);
        assert_eq!(extract_code(""), None);
    }

    #[test]
    fn test_blank_block_is_no_code() {
        assert_eq!(extract_code("```repl\n   \n```"), None);
    }

    #[test]
    fn test_crlf_fence() {
        let content = "```repl\r\nFINAL(\"4\")\r\n```";
        assert_eq!(extract_code(content).as_deref(), Some("FINAL(\"4\")"));
    }
}
