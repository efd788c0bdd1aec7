//! Fenced code block extraction.
//!
//! Total over any input: text without a complete fence simply yields no
//! blocks.

use once_cell::sync::Lazy;
use regex::Regex;

/// A fenced code block found in text.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CodeBlock {
    /// Tag written after the opening fence; empty when absent.
    pub language: String,
    /// Body with trailing whitespace removed.
    pub code: String,
}

static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```([A-Za-z0-9_+#.\-]*)\r?\n((?s:.*?))```")
        .expect("code block pattern should compile")
});

/// Returns every fenced code block in document order.
pub fn parse_code_blocks(text: &str) -> Vec<CodeBlock> {
    CODE_BLOCK.captures_iter(text).map(to_block).collect()
}

/// Returns the first fenced code block, if any.
pub fn extract_first(text: &str) -> Option<CodeBlock> {
    CODE_BLOCK.captures(text).map(to_block)
}

/// Returns the body of the first fenced code block, if any.
pub fn extract_first_code(text: &str) -> Option<String> {
    extract_first(text).map(|block| block.code)
}

fn to_block(captures: regex::Captures<'_>) -> CodeBlock {
    CodeBlock {
        language: captures
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        code: captures
            .get(2)
            .map(|m| m.as_str().trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_tagged_block() {
        let blocks = parse_code_blocks("```ts\nconst x = 1;\n```");
        assert_eq!(
            blocks,
            vec![CodeBlock {
                language: "ts".into(),
                code: "const x = 1;".into(),
            }]
        );
    }

    #[test]
    fn no_fence_yields_nothing() {
        let text = "just some prose about code";
        assert!(parse_code_blocks(text).is_empty());
        assert_eq!(extract_first(text), None);
        assert_eq!(extract_first_code(text), None);
    }

    #[test]
    fn multiple_blocks_in_document_order() {
        let text = "first:\n```rust\nfn a() {}\n```\nthen:\n```\nplain\n```\n";
        let blocks = parse_code_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].language, "rust");
        assert_eq!(blocks[0].code, "fn a() {}");
        assert_eq!(blocks[1].language, "");
        assert_eq!(blocks[1].code, "plain");
        assert_eq!(extract_first(text), Some(blocks[0].clone()));
    }

    #[test]
    fn keeps_leading_whitespace_and_trims_trailing() {
        let block = extract_first("```py\n    indented()\n\n  \n```").unwrap();
        assert_eq!(block.code, "    indented()");
    }

    #[test]
    fn unterminated_or_inline_fences_do_not_match() {
        assert_eq!(extract_first("```rust\nfn open() {"), None);
        assert_eq!(extract_first("inline ```code``` only"), None);
    }

    #[test]
    fn accepts_crlf_and_symbolic_tags() {
        let block = extract_first("```c++\r\nint main() {}\r\n```").unwrap();
        assert_eq!(block.language, "c++");
        assert_eq!(block.code, "int main() {}");
    }
}
