//! Repairs model output into text that parses as JSON.
//!
//! Models asked for "only a JSON array" still wrap it in code fences, append
//! commentary after the closing bracket, leave raw newlines inside string
//! literals, escape markdown punctuation with backslashes and use typographic
//! quotes. `normalize` undoes each of those in a fixed order:
//!
//! 1. trim and strip a leading code fence (and its closing fence);
//! 2. cut the text down to the first balanced array or object, closing it up
//!    when the output was truncated mid-way (a leading object that does not
//!    parse gives way to the first array);
//! 3. inside string literals: escape raw control characters, turn illegal
//!    backslash escapes into literal backslashes, drop the backslash from
//!    escaped markdown punctuation, and replace typographic quotes and dashes
//!    with ASCII.
//!
//! Anything that still fails to parse comes back as a `NormalizeError`
//! carrying both texts for diagnostics.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Characters that may legally follow a backslash in a JSON string.
const LEGAL_ESCAPES: &[char] = &['"', '\\', '/', 'b', 'f', 'n', 'r', 't'];

/// Punctuation that models escape as if writing markdown. `\*` is not a JSON
/// escape; the punctuation itself is what was meant.
const MARKDOWN_ESCAPES: &[char] = &[
    '*', '_', '#', '-', '.', '!', '(', ')', '[', ']', '`', '>', '+', '~', '|', '\'', '{', '}',
];

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```[A-Za-z0-9_+-]*[ \t]*\r?\n?").expect("valid regex"));
static FENCE_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n?[ \t]*```\s*$").expect("valid regex"));

#[derive(Debug, Clone, thiserror::Error)]
#[error("response could not be normalized: {reason}")]
pub struct NormalizeError {
    pub reason: String,
    /// Text as received from the provider.
    pub raw: String,
    /// Text after every repair was applied.
    pub cleaned: String,
}

pub fn normalize(raw: &str) -> Result<String, NormalizeError> {
    let unfenced = strip_code_fence(raw.trim());

    let Some(start) = unfenced.find(['[', '{']) else {
        return Err(NormalizeError {
            reason: "no JSON array or object found".to_string(),
            raw: raw.to_string(),
            cleaned: unfenced,
        });
    };

    let mut outcome = repair_from(&unfenced[start..]);
    // A brace in leading commentary ("your {5} cards") is not the payload.
    if outcome.is_err() && unfenced[start..].starts_with('{') {
        if let Some(array_start) = unfenced.find('[') {
            if array_start > start {
                if let Ok(cleaned) = repair_from(&unfenced[array_start..]) {
                    outcome = Ok(cleaned);
                }
            }
        }
    }

    match outcome {
        Ok(cleaned) => {
            if cleaned.len() != raw.len() {
                debug!(
                    raw_len = raw.len(),
                    cleaned_len = cleaned.len(),
                    "normalized model response"
                );
            }
            Ok(cleaned)
        }
        Err((reason, cleaned)) => Err(NormalizeError {
            reason,
            raw: raw.to_string(),
            cleaned,
        }),
    }
}

/// Bounds and repairs `text`, which starts at an opening bracket. On failure
/// returns the parse error and the repaired text.
fn repair_from(text: &str) -> Result<String, (String, String)> {
    let cleaned = repair_literals(&extract_balanced(text));
    match serde_json::from_str::<serde_json::Value>(&cleaned) {
        Ok(_) => Ok(cleaned),
        Err(e) => Err((e.to_string(), cleaned)),
    }
}

fn strip_code_fence(text: &str) -> String {
    if !text.starts_with("```") {
        return text.to_string();
    }
    let opened = FENCE_OPEN.replace(text, "");
    FENCE_CLOSE.replace(&opened, "").into_owned()
}

/// `text` starts at an opening `[` or `{`. Returns the prefix up to the
/// matching closer. Brackets inside string literals do not count, whether the
/// literal opened with `"` or with a typographic quote.
fn extract_balanced(text: &str) -> String {
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut curly = false;
    let mut backslashes = 0usize;
    // End offset of the last element completed directly inside a top-level array.
    let mut last_element_end: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if in_string {
            if c == '\\' {
                backslashes += 1;
                continue;
            }
            let closes = if curly {
                matches!(c, '\u{201C}' | '\u{201D}')
            } else {
                c == '"' && backslashes % 2 == 0
            };
            if closes {
                in_string = false;
                if closers.len() == 1 && closers[0] == ']' {
                    last_element_end = Some(i + c.len_utf8());
                }
            }
            backslashes = 0;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                curly = false;
            }
            '\u{201C}' | '\u{201D}' => {
                in_string = true;
                curly = true;
            }
            '[' => closers.push(']'),
            '{' => closers.push('}'),
            ']' | '}' => {
                closers.pop();
                let end = i + c.len_utf8();
                if closers.is_empty() {
                    return text[..end].to_string();
                }
                if closers.len() == 1 && closers[0] == ']' {
                    last_element_end = Some(end);
                }
            }
            _ => {}
        }
    }

    let open_quote = match (in_string, curly) {
        (false, _) => None,
        (true, false) => Some('"'),
        (true, true) => Some('\u{201D}'),
    };
    close_truncated(text, open_quote, backslashes, &closers, last_element_end)
}

/// The text ran out with brackets still open: the model hit its output limit.
/// Prefer dropping the partial trailing element of a top-level array; fall
/// back to closing whatever is open.
fn close_truncated(
    text: &str,
    open_quote: Option<char>,
    trailing_backslashes: usize,
    closers: &[char],
    last_element_end: Option<usize>,
) -> String {
    if let Some(end) = last_element_end {
        debug!(kept = end, dropped = text.len() - end, "dropping truncated trailing element");
        let mut out = text[..end].trim_end().to_string();
        out.push(']');
        return out;
    }

    let mut out = text.to_string();
    if let Some(quote) = open_quote {
        if trailing_backslashes % 2 == 1 {
            out.pop();
        }
        out.push(quote);
    }
    let trimmed_len = out.trim_end().trim_end_matches(',').trim_end().len();
    out.truncate(trimmed_len);
    for closer in closers.iter().rev() {
        out.push(*closer);
    }
    out
}

fn repair_literals(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut opened_by_curly = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if !in_string {
            match c {
                '"' => {
                    in_string = true;
                    opened_by_curly = false;
                    out.push('"');
                }
                // Typographic quotes used as delimiters.
                '\u{201C}' | '\u{201D}' => {
                    in_string = true;
                    opened_by_curly = true;
                    out.push('"');
                }
                _ => out.push(c),
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => match chars.get(i + 1) {
                Some('u') if is_unicode_escape(&chars[i + 2..]) => {
                    out.push_str("\\u");
                    i += 2;
                    continue;
                }
                Some(next) if LEGAL_ESCAPES.contains(next) => {
                    out.push('\\');
                    out.push(*next);
                    i += 2;
                    continue;
                }
                Some(next) if MARKDOWN_ESCAPES.contains(next) => {
                    out.push(*next);
                    i += 2;
                    continue;
                }
                _ => out.push_str("\\\\"),
            },
            '"' if opened_by_curly => out.push_str("\\\""),
            '"' => {
                in_string = false;
                out.push('"');
            }
            '\u{201C}' | '\u{201D}' if opened_by_curly => {
                in_string = false;
                out.push('"');
            }
            '\u{201C}' | '\u{201D}' => out.push_str("\\\""),
            '\u{2018}' | '\u{2019}' => out.push('\''),
            '\u{2013}' | '\u{2014}' => out.push('-'),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
        i += 1;
    }

    out
}

fn is_unicode_escape(rest: &[char]) -> bool {
    rest.len() >= 4 && rest[..4].iter().all(|c| c.is_ascii_hexdigit())
}
