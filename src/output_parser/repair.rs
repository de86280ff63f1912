//! Deterministic JSON repair for near-valid LM output.
//!
//! Two textual repairs, applied in stages and only while the text still
//! fails to parse:
//!
//! 1. remove trailing commas before `}` or `]`
//! 2. rewrite single-quoted keys/strings as double-quoted
//!
//! Input that already parses is never touched. No regex is used; both
//! repairs are string-aware character scans.

use super::extract::QuoteState;
use serde_json::Value;

/// Attempt to repair common LM JSON mistakes without calling the model again.
///
/// Returns `Some(repaired)` when a repair stage produced valid JSON, `None`
/// when the input was already valid or no stage could fix it.
///
/// # Examples
///
/// ```
/// use signature_pipeline::output_parser::try_repair_json;
///
/// assert_eq!(try_repair_json(r#"{"a": 1,}"#).as_deref(), Some(r#"{"a": 1}"#));
/// assert_eq!(try_repair_json(r#"{"a": 1}"#), None);
/// ```
pub fn try_repair_json(broken: &str) -> Option<String> {
    if parses(broken) {
        return None;
    }

    let stage_one = remove_trailing_commas(broken);
    if parses(&stage_one) {
        return Some(stage_one);
    }

    let stage_two = replace_single_quotes(&stage_one);
    if parses(&stage_two) {
        return Some(stage_two);
    }

    None
}

fn parses(s: &str) -> bool {
    serde_json::from_str::<Value>(s).is_ok()
}

/// Drop commas whose next significant character closes a container.
fn remove_trailing_commas(s: &str) -> String {
    let mut quotes = QuoteState::default();
    let mut out = String::with_capacity(s.len());
    for (i, ch) in s.char_indices() {
        if quotes.structural(ch)
            && ch == ','
            && matches!(next_significant(&s[i + 1..]), Some('}' | ']'))
        {
            continue;
        }
        out.push(ch);
    }
    out
}

fn next_significant(s: &str) -> Option<char> {
    s.chars().find(|c| !c.is_whitespace())
}

/// Rewrite single-quoted keys and strings as double-quoted JSON strings.
///
/// Only quotes sitting at a token boundary (after `{ [ : ,`, before
/// `} ] : ,`) are rewritten, so apostrophes inside prose stay intact.
fn replace_single_quotes(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut quotes = QuoteState::default();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if quotes.structural(ch) && ch == '\'' {
            if let Some(close) = single_quoted_end(&chars, i) {
                push_double_quoted(&mut out, &chars[i + 1..close]);
                i = close + 1;
                continue;
            }
        }
        out.push(ch);
        i += 1;
    }
    out
}

/// Index of the quote closing the single-quoted string opened at `open`,
/// when both quotes sit at token boundaries.
fn single_quoted_end(chars: &[char], open: usize) -> Option<usize> {
    let before = chars[..open].iter().rev().find(|c| !c.is_whitespace());
    if !matches!(before, None | Some('{' | '[' | ':' | ',')) {
        return None;
    }

    let mut i = open + 1;
    let close = loop {
        match chars.get(i)? {
            '\\' => i += 2,
            '\'' => break i,
            _ => i += 1,
        }
    };

    let after = chars[close + 1..].iter().find(|c| !c.is_whitespace());
    matches!(after, None | Some('}' | ']' | ':' | ',')).then_some(close)
}

/// Copy single-quoted content as a double-quoted JSON string body.
fn push_double_quoted(out: &mut String, content: &[char]) {
    out.push('"');
    let mut chars = content.iter().copied();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\'') => out.push('\''),
                Some(escaped) => {
                    out.push('\\');
                    out.push(escaped);
                }
                None => out.push('\\'),
            },
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out.push('"');
}
