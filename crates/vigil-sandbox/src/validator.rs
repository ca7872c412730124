//! Pre-execution validator for auditing scripts.
//!
//! The isolate and the host allow-list are the real boundary. These checks
//! catch common escape patterns early and give script authors a clear error
//! before anything reaches V8.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::EvaluationError;

/// Default maximum script size in bytes (256 KB).
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 256 * 1024;

/// Prefix reserved for the host's own globals.
pub const RESERVED_PREFIX: &str = "__vigil";

/// Escape patterns banned from script source, keyed by the text reported
/// back. Each must start an identifier, so `helperFunction(` or
/// `retrieval(` are fine while `eval (` is not.
static BANNED_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("eval(", r"eval\s*\("),
        ("Function(", r"Function\s*\("),
        ("import(", r"import\s*\("),
        ("require(", r"require\s*\("),
        ("Deno.", r"Deno\s*\."),
        ("__proto__", r"__proto__"),
        ("constructor[", r"constructor\s*\["),
        ("constructor.constructor", r"constructor\s*\.\s*constructor"),
        ("Reflect.", r"Reflect\s*\."),
        ("globalThis[", r"globalThis\s*\["),
        ("String.fromCharCode", r"String\s*\.\s*fromCharCode"),
        (RESERVED_PREFIX, RESERVED_PREFIX),
    ]
    .into_iter()
    .map(|(name, body)| {
        let re = Regex::new(&format!(r"(?:^|[^\w$]){body}")).expect("banned pattern is valid");
        (name, re)
    })
    .collect()
});

/// Validate script source before evaluation.
pub fn validate_script(source: &str, max_size: Option<usize>) -> Result<(), EvaluationError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_SCRIPT_SIZE);

    if source.len() > max {
        return Err(EvaluationError::CodeTooLarge {
            max,
            actual: source.len(),
        });
    }

    if source.trim().is_empty() {
        return Err(EvaluationError::ValidationFailed {
            reason: "script is empty".into(),
        });
    }

    if source.contains('\0') {
        return Err(EvaluationError::ValidationFailed {
            reason: "script contains a NUL byte".into(),
        });
    }

    for (pattern, re) in BANNED_PATTERNS.iter() {
        if re.is_match(source) {
            return Err(EvaluationError::BannedPattern {
                pattern: (*pattern).to_string(),
            });
        }
    }

    Ok(())
}
