//! Redaction of sensitive flag values before anything is logged or
//! journaled.

use std::sync::LazyLock;

use regex::Regex;

/// Flags whose values must never reach a log line or journal entry.
pub const SENSITIVE_FLAGS: &[&str] = &[
    "token",
    "password",
    "registry-password",
    "license",
    "encryption-key",
    "ops-token",
    "ops-tunnel-token",
];

const MASK: &str = "<redacted>";

static FLAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // --token=value | --token value | token=value
    let names = SENSITIVE_FLAGS.join("|");
    Regex::new(&format!(r"(--?(?:{names})[=\s]+)(\S+)")).expect("valid redaction pattern")
});

static JSON_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let names = SENSITIVE_FLAGS.join("|");
    Regex::new(&format!(r#"("(?:{names})"\s*:\s*)"[^"]*""#)).expect("valid redaction pattern")
});

/// Replace every sensitive flag value in the text with a mask. The flag
/// names stay visible so the operator can still see what was passed.
pub fn redact(text: &str) -> String {
    let masked = FLAG_PATTERN.replace_all(text, |caps: &regex::Captures<'_>| {
        format!("{}{MASK}", &caps[1])
    });
    JSON_PATTERN
        .replace_all(&masked, |caps: &regex::Captures<'_>| {
            format!("{}\"{MASK}\"", &caps[1])
        })
        .into_owned()
}
