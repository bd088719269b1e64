//! Markup stripping with a zero-tag allowlist.
//!
//! Every tag is removed; text between tags is kept, except inside elements
//! whose content is executable or invisible (`script`, `style`, ...), which
//! are dropped whole. Stripping repeats until the text stops changing so that
//! tags reassembled from fragments (`<scr<b>ipt>`) do not survive.
//!
//! Limitation: a `<` directly followed by a letter, `/`, `!` or `?` and later
//! closed by `>` is treated as a tag, so plain text such as `a<b>c` loses
//! `<b>`. A lone `<` (as in `a < b`) is left alone.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AnonymizeError;

const MAX_PASSES: usize = 8;

const DROPPED_ELEMENTS: [&str; 6] = ["script", "style", "iframe", "object", "noscript", "template"];

static COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static ELEMENT_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    DROPPED_ELEMENTS
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</\s*{tag}\s*>")).unwrap())
        .collect()
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<(?:/?[A-Za-z]|!|\?)[^<>]*>").unwrap());

fn strip_once(text: &str) -> String {
    let mut out = COMMENT_RE.replace_all(text, "").into_owned();
    for element in ELEMENT_RES.iter() {
        out = element.replace_all(&out, "").into_owned();
    }
    TAG_RE.replace_all(&out, "").into_owned()
}

/// Removes all markup from `text`.
pub fn sanitize(text: &str) -> Result<String, AnonymizeError> {
    if !text.contains('<') {
        return Ok(text.to_string());
    }

    let mut current = text.to_string();
    for pass in 1..=MAX_PASSES {
        let next = strip_once(&current);
        if next == current {
            debug!("Sanitizer reached a fixpoint after {} pass(es)", pass);
            return Ok(next);
        }
        current = next;
    }

    if TAG_RE.is_match(&current) || COMMENT_RE.is_match(&current) {
        warn!("Sanitizer gave up after {} passes with markup still present", MAX_PASSES);
        return Err(AnonymizeError::sanitize("markup is nested too deeply to strip")
            .with_details(format!("still contains tags after {} passes", MAX_PASSES)));
    }

    Ok(current)
}

/// Coerces a loosely-typed value to text and sanitizes it.
///
/// `null` becomes an empty string, scalars use their display form, arrays
/// and objects their JSON text.
pub fn sanitize_input(input: &Value) -> Result<String, AnonymizeError> {
    match input {
        Value::Null => Ok(String::new()),
        Value::String(s) => sanitize(s),
        Value::Bool(b) => sanitize(&b.to_string()),
        Value::Number(n) => sanitize(&n.to_string()),
        other => sanitize(&other.to_string()),
    }
}
