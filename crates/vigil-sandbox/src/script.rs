//! Script sources and the terminal audit result.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Source text of an auditing script. Immutable and cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct ScriptSource(Arc<str>);

impl ScriptSource {
    /// Wrap script text.
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    /// The script text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the source is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ScriptSource {
    // Sources can be large; log the size rather than the text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptSource")
            .field("len", &self.0.len())
            .finish()
    }
}

impl From<&str> for ScriptSource {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for ScriptSource {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// The outcome an auditing script reports.
///
/// Scripts can only produce this through the `AuditResult` capability
/// (`success()`, `failure(message)`, `aborted(message)`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditResult {
    /// The audit passed.
    Successful,
    /// The audit ran and found a problem.
    Failed {
        /// Explanation from the script.
        message: String,
    },
    /// The audit could not be carried out.
    Aborted {
        /// Explanation from the script.
        message: String,
    },
}

impl AuditResult {
    /// Short lowercase label for logs and audit entries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Successful => "successful",
            Self::Failed { .. } => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audit_result_wire_form() {
        assert_eq!(
            serde_json::to_value(AuditResult::Successful).unwrap(),
            json!({"type": "Successful"})
        );
        assert_eq!(
            serde_json::to_value(AuditResult::Failed {
                message: "x".into()
            })
            .unwrap(),
            json!({"type": "Failed", "message": "x"})
        );
        let aborted: AuditResult =
            serde_json::from_value(json!({"type": "Aborted", "message": "no rpc"})).unwrap();
        assert_eq!(
            aborted,
            AuditResult::Aborted {
                message: "no rpc".into()
            }
        );
    }

    #[test]
    fn source_debug_hides_text() {
        let source = ScriptSource::from("function audit() { return secret; }");
        let debug = format!("{source:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("len"));
    }
}
