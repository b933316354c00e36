//! Confirmation code extraction

use std::sync::LazyLock;

use regex::Regex;

static CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{5,6})\b").expect("static regex is valid"));

/// First standalone 5–6 digit number in a message.
pub fn extract_code(text: &str) -> Option<&str> {
    CODE_PATTERN
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}
