//! Command templating.
//!
//! Tool commands are written with `INPUT<n>` placeholders (`convert INPUT1 -resize INPUT2 out.png`).
//! [`render_command`] replaces each placeholder with its resolved value. It is a
//! plain textual substitution: the result is handed to `sh -c` unchanged, so
//! literal values that the shell would otherwise split or interpret are quoted.

use std::collections::BTreeMap;

use crate::error::{DispatchError, Result};

const PLACEHOLDER_PREFIX: &str = "INPUT";

/// Returns the placeholder names referenced by `template`, in order of first use.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut found = Vec::new();
    for_each_placeholder(template, |name| {
        if !found.iter().any(|f: &String| f == name) {
            found.push(name.to_string());
        }
    });
    found
}

/// Substitute every `INPUT<n>` placeholder in `template` with its value from `inputs`.
///
/// A placeholder always consumes the longest run of digits, so `INPUT10` is never
/// rendered as the value of `INPUT1` followed by `0`.
pub fn render_command(template: &str, inputs: &BTreeMap<String, String>) -> Result<String> {
    if template.trim().is_empty() {
        return Err(DispatchError::InvalidTemplate(
            "command template is empty".to_string(),
        ));
    }

    let mut rendered = String::with_capacity(template.len());
    let mut missing = None;
    let mut last = 0;
    for_each_placeholder_span(template, |start, end| {
        let name = &template[start..end];
        rendered.push_str(&template[last..start]);
        match inputs.get(name) {
            Some(value) => rendered.push_str(&quote_value(value)),
            None => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
            }
        }
        last = end;
    });

    if let Some(name) = missing {
        return Err(DispatchError::MissingInput(name));
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

/// Quote a value for the shell if it would not survive as a single word.
pub fn quote_value(value: &str) -> String {
    if !value.is_empty() && !value.chars().any(needs_quoting) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn needs_quoting(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            '\'' | '"'
                | '\\'
                | '$'
                | '`'
                | ';'
                | '&'
                | '|'
                | '<'
                | '>'
                | '('
                | ')'
                | '*'
                | '?'
                | '['
                | ']'
                | '{'
                | '}'
                | '~'
                | '#'
                | '!'
        )
}

fn for_each_placeholder(template: &str, mut f: impl FnMut(&str)) {
    for_each_placeholder_span(template, |start, end| f(&template[start..end]));
}

fn for_each_placeholder_span(template: &str, mut f: impl FnMut(usize, usize)) {
    let bytes = template.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = template[search_from..].find(PLACEHOLDER_PREFIX) {
        let start = search_from + offset;
        let digits_start = start + PLACEHOLDER_PREFIX.len();
        let mut end = digits_start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }

        let preceded_by_word = start > 0 && is_word_byte(bytes[start - 1]);
        let followed_by_word = end < bytes.len() && is_word_byte(bytes[end]);
        if end > digits_start && !preceded_by_word && !followed_by_word {
            f(start, end);
            search_from = end;
        } else {
            search_from = digits_start;
        }
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Returns true if `id` has the `INPUT<n>` form used for input slots.
pub fn is_placeholder(id: &str) -> bool {
    id.strip_prefix(PLACEHOLDER_PREFIX)
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}
