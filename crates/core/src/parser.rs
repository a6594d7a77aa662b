//! S-expression encode/decode for the wire payloads used by every topic
//! in the system.
//!
//! Payloads are whitespace-separated tokens wrapped in a single pair of
//! parentheses, with one level of nested sub-list supported (tokens
//! starting with `"("` open a sublist, tokens ending with `")"` close
//! it). Quoted strings and deeper nesting are not supported; a sub-list
//! collapses back into a single joined parameter token for callers that
//! don't care about the nesting.

use crate::error::{Error, Result};

/// A parsed command payload: the command name and its flat parameter
/// tokens. A single nested sub-list, if present, is serialized back into
/// one parameter token of the form `"(a b c)"` so callers that don't care
/// about nesting can treat every parameter as a plain string.
pub type Params = Vec<String>;

/// Encode a command and its parameters into the wire format `"(cmd p1 p2 ...)"`.
pub fn generate(command: &str, params: &[impl AsRef<str>]) -> String {
    let mut out = String::from("(");
    out.push_str(command);
    for param in params {
        out.push(' ');
        out.push_str(param.as_ref());
    }
    out.push(')');
    out
}

/// Decode a wire payload into `(command, params)`.
///
/// An empty payload decodes to `("", [])`. A payload that isn't wrapped
/// in parentheses at all is treated as a single bare command with no
/// parameters.
pub fn parse(payload: &str) -> Result<(String, Params)> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let inner = if let Some(stripped) = trimmed.strip_prefix('(') {
        stripped
            .strip_suffix(')')
            .ok_or_else(|| Error::Protocol(format!("unbalanced parentheses in payload: {payload}")))?
    } else {
        trimmed
    };

    let tokens = tokenize(inner)?;
    let mut iter = tokens.into_iter();
    let command = iter.next().unwrap_or_default();
    let params: Params = iter.collect();
    Ok((command, params))
}

/// Split whitespace-separated tokens, collapsing one level of `(...)`
/// nesting back into a single token.
fn tokenize(inner: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut words = inner.split_whitespace().peekable();

    while let Some(word) = words.next() {
        if word.starts_with('(') {
            let mut sublist = vec![word.to_string()];
            if word.ends_with(')') && word.len() > 1 {
                // Single-token sublist, e.g. "(x)".
                tokens.push(sublist.remove(0));
                continue;
            }
            let mut closed = false;
            for next in words.by_ref() {
                sublist.push(next.to_string());
                if next.ends_with(')') {
                    closed = true;
                    break;
                }
            }
            if !closed {
                return Err(Error::Protocol(format!(
                    "unterminated sub-list in payload fragment starting at: {word}"
                )));
            }
            tokens.push(sublist.join(" "));
        } else {
            tokens.push(word.to_string());
        }
    }

    Ok(tokens)
}
