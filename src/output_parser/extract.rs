//! Text extraction helpers used before any JSON decoding.
//!
//! Think-block stripping, markdown fence removal and balanced-bracket
//! scanning. Everything here is a pure function over `&str`.

const THINK_TAGS: [(&str, &str); 2] = [("<think>", "</think>"), ("<thinking>", "</thinking>")];

/// Strip `<think>` blocks and trim whitespace.
///
/// Applied to every raw LM response before adapter-specific parsing.
pub fn preprocess(text: &str) -> String {
    strip_think_tags(text).trim().to_string()
}

/// Remove every `<think>...</think>` and `<thinking>...</thinking>` block.
///
/// An unclosed block swallows the rest of the text.
///
/// ```
/// use signature_pipeline::output_parser::strip_think_tags;
///
/// assert_eq!(strip_think_tags("<think>plan</think>Answer: 4"), "Answer: 4");
/// assert_eq!(strip_think_tags("<thinking>plan</thinking>{}"), "{}");
/// ```
pub fn strip_think_tags(text: &str) -> String {
    THINK_TAGS
        .iter()
        .fold(text.to_string(), |acc, (open, close)| remove_blocks(&acc, open, close))
}

fn remove_blocks(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        match rest[start..].find(close) {
            Some(end) => rest = &rest[start + end + close.len()..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Body of the first complete markdown code fence, language hint dropped.
///
/// ```
/// use signature_pipeline::output_parser::extract::strip_code_fence;
///
/// assert_eq!(strip_code_fence("Here:\n```json\n{\"a\": 1}\n```"), Some("{\"a\": 1}"));
/// assert_eq!(strip_code_fence("{\"a\": 1}"), None);
/// ```
pub fn strip_code_fence(text: &str) -> Option<&str> {
    let (_, after_open) = text.split_once("```")?;
    let (_hint, body) = after_open.split_once('\n')?;
    let (content, _) = body.split_once("```")?;
    Some(content.trim())
}

/// Tracks whether a left-to-right scan is inside a double-quoted string.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct QuoteState {
    in_string: bool,
    escaped: bool,
}

impl QuoteState {
    /// Feed the next character. Returns `true` when it is structural, i.e.
    /// outside every string and not itself a quote.
    pub fn structural(&mut self, ch: char) -> bool {
        if self.in_string {
            match ch {
                _ if self.escaped => self.escaped = false,
                '\\' => self.escaped = true,
                '"' => self.in_string = false,
                _ => {}
            }
            return false;
        }
        if ch == '"' {
            self.in_string = true;
            return false;
        }
        true
    }
}

/// The first `[` or `{` outside double-quoted strings.
///
/// ```
/// use signature_pipeline::output_parser::extract::first_opening;
///
/// assert_eq!(first_opening(r#"Here: [{"a": 1}]"#), Some('['));
/// assert_eq!(first_opening(r#""[x]" then {"a": 1}"#), Some('{'));
/// assert_eq!(first_opening("no json"), None);
/// ```
pub fn first_opening(text: &str) -> Option<char> {
    let mut quotes = QuoteState::default();
    text.chars()
        .find(|&ch| quotes.structural(ch) && matches!(ch, '[' | '{'))
}

/// The first complete top-level `open ... close` region.
///
/// Delimiters inside double-quoted strings are ignored, so a wrapper object
/// wins over anything it contains.
///
/// ```
/// use signature_pipeline::output_parser::extract::find_outermost;
///
/// let reply = r#"Sure! {"plan": {"steps": [1]}} Hope that helps."#;
/// assert_eq!(find_outermost(reply, '{', '}'), Some(r#"{"plan": {"steps": [1]}}"#));
/// ```
pub fn find_outermost(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut quotes = QuoteState::default();
    let mut depth = 0usize;

    for (offset, ch) in text[start..].char_indices() {
        if !quotes.structural(ch) {
            continue;
        }
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(&text[start..start + offset + ch.len_utf8()]);
            }
        }
    }
    None
}
