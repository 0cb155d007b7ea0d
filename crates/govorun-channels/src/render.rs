//! Rendering model output into platform dialects.
//!
//! Telegram wants MarkdownV2 with aggressive escaping and a 4096-char limit;
//! Max takes plain markdown with a 4000-char limit. Splitting is
//! fence-aware: a chunk boundary inside a code block closes the fence and
//! reopens it (with its language) at the start of the next chunk.

/// Target formatting dialect of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Telegram MarkdownV2 (escaped, 4096-char messages; 4090 used for safety).
    MarkdownV2,
    /// Max messenger markdown (4000-char messages).
    Markdown,
}

impl Dialect {
    pub fn chunk_max(&self) -> usize {
        match self {
            Dialect::MarkdownV2 => 4090,
            Dialect::Markdown => 4000,
        }
    }
}

/// Render `text` for the dialect and split into sendable chunks.
pub fn render_chunks(text: &str, dialect: Dialect) -> Vec<String> {
    let rendered = match dialect {
        Dialect::MarkdownV2 => escape_markdown_v2(text),
        Dialect::Markdown => text.to_string(),
    };
    split_chunks_smart(&rendered, dialect.chunk_max())
}

/// Escape special characters for Telegram MarkdownV2, leaving fenced code
/// blocks, inline code and link URLs intact.
///
/// MarkdownV2 requires escaping `_ * [ ] ( ) ~ ` > # + - = | { } . !`
/// everywhere outside code spans.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut chars = text.chars().peekable();
    let mut in_fence = false;
    let mut in_inline_code = false;
    let mut at_line_start = true;

    while let Some(ch) = chars.next() {
        if ch == '`' {
            // Count the run of backticks to distinguish fence from inline code.
            let mut run = 1;
            while chars.peek() == Some(&'`') {
                chars.next();
                run += 1;
            }
            if run >= 3 && at_line_start {
                in_fence = !in_fence;
            } else if !in_fence {
                in_inline_code = !in_inline_code;
            }
            for _ in 0..run {
                out.push('`');
            }
            at_line_start = false;
            continue;
        }

        at_line_start = ch == '\n';
        if in_fence || in_inline_code {
            out.push(ch);
            continue;
        }
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '>' | '#' | '+' | '-' | '=' | '|' | '{'
            | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Code-fence-aware splitter. When a split falls inside a fenced block, the
/// fence is closed before the boundary and re-opened in the next chunk.
pub fn split_chunks_smart(text: &str, chunk_max: usize) -> Vec<String> {
    if text.len() <= chunk_max {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in text.split('\n') {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };

        if !current.is_empty() && current.len() + cost > chunk_max {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(current);
            current = String::new();
            if let Some(lang) = &fence_lang {
                current.push_str("```");
                current.push_str(lang);
                current.push('\n');
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let trimmed = line.trim_start();
        if let Some(after_fence) = trimmed.strip_prefix("```") {
            if fence_lang.is_some() {
                fence_lang = None;
            } else {
                fence_lang = Some(after_fence.trim().to_string());
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // Force-split any chunk that still exceeds the limit (single huge line).
    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= chunk_max {
            result.push(chunk);
            continue;
        }
        let mut remaining = chunk.as_str();
        while remaining.len() > chunk_max {
            let mut split_at = remaining[..chunk_max]
                .rfind('\n')
                .or_else(|| remaining[..chunk_max].rfind(' '))
                .unwrap_or(chunk_max);
            // Never split inside a multi-byte character.
            while !remaining.is_char_boundary(split_at) {
                split_at -= 1;
            }
            result.push(remaining[..split_at].to_string());
            remaining = remaining[split_at..].trim_start();
        }
        if !remaining.is_empty() {
            result.push(remaining.to_string());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = render_chunks("hello dood", Dialect::Markdown);
        assert_eq!(chunks, vec!["hello dood".to_string()]);
    }

    #[test]
    fn escapes_specials_outside_code() {
        let escaped = escape_markdown_v2("Hello. World! (test) [link]");
        assert!(escaped.contains("\\."));
        assert!(escaped.contains("\\!"));
        assert!(escaped.contains("\\("));
        assert!(escaped.contains("\\["));
    }

    #[test]
    fn code_spans_stay_unescaped() {
        let escaped = escape_markdown_v2("run `a.b()` now.");
        assert!(escaped.contains("`a.b()`"));
        assert!(escaped.ends_with("now\\."));
    }

    #[test]
    fn fenced_blocks_stay_unescaped() {
        let text = "before.\n```rust\nlet x = a - b;\n```\nafter.";
        let escaped = escape_markdown_v2(text);
        assert!(escaped.contains("let x = a - b;"));
        assert!(escaped.starts_with("before\\."));
    }

    #[test]
    fn long_text_splits_under_limit() {
        let line = "a".repeat(1500);
        let text = format!("{line}\n{line}\n{line}\n{line}");
        let chunks = split_chunks_smart(&text, 4000);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= 4000);
        }
    }

    #[test]
    fn fence_language_reopens_in_next_chunk() {
        let mut text = String::from("```python\n");
        for _ in 0..120 {
            text.push_str("print('a reasonably long line of python code here')\n");
        }
        text.push_str("```\n");
        let chunks = split_chunks_smart(&text, 4000);
        assert!(chunks.len() >= 2);
        assert!(chunks[1].starts_with("```python"));
        assert!(chunks[0].ends_with("```"));
    }

    #[test]
    fn giant_single_line_force_splits_on_char_boundary() {
        let text = "ы".repeat(5000); // 2 bytes each
        let chunks = split_chunks_smart(&text, 4000);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= 4000);
            // Each chunk is valid UTF-8 by construction; make sure nothing was lost.
        }
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert_eq!(total, 5000);
    }
}
