//! Error types for script evaluation.

use thiserror::Error;

/// A capability call received an argument that violates its contract.
///
/// Identified by the call site (e.g. `HttpClient.get()`) and the zero-based
/// argument index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid value for argument {index} of {call_site}: {reason}")]
pub struct InvalidInputValue {
    /// The capability function that was called.
    pub call_site: String,
    /// Zero-based index of the offending argument.
    pub index: usize,
    /// What was wrong with it.
    pub reason: String,
}

impl InvalidInputValue {
    /// Build a contract violation.
    pub fn new(call_site: impl Into<String>, index: usize, reason: impl Into<String>) -> Self {
        Self {
            call_site: call_site.into(),
            index,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while evaluating an auditing script.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvaluationError {
    /// `audit` returned something other than an `AuditResult`.
    #[error("audit() must return an AuditResult, got {actual_type}")]
    InvalidReturnValue {
        /// Runtime type of the value that was returned.
        actual_type: String,
    },

    /// A capability call received a malformed argument.
    #[error(transparent)]
    InvalidInputValue(#[from] InvalidInputValue),

    /// The engine raised an error (syntax error, runtime exception, uncaught throw).
    #[error("script execution failed: {cause}")]
    ScriptExecution {
        /// The script that failed.
        script: String,
        /// The engine's description of the failure.
        cause: String,
    },

    /// Code failed validation checks.
    #[error("script validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("script exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned code pattern was detected during validation.
    #[error("banned pattern detected: `{pattern}`. Scripts reach the host only through HttpClient, Ipfs, Properties, Converters, AuditResult, Input and Output.")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// The bootstrap asked for a host binding outside the allow-list.
    #[error("host binding '{binding}' is not on the allow-list")]
    HostAccessDenied {
        /// The binding that was refused.
        binding: String,
    },

    /// Execution exceeded its wall-clock budget.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A prompt stayed unanswered for too long.
    #[error("prompt was not answered within {timeout_ms}ms")]
    PromptTimeout {
        /// Configured prompt timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// The evaluation was cancelled because its session went away.
    #[error("evaluation cancelled")]
    Cancelled,

    /// Too many concurrent evaluations.
    #[error("concurrency limit reached (max {max} concurrent evaluations)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent evaluations.
        max: usize,
    },

    /// Generic host-side failure.
    #[error("evaluation failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Serialization across the op boundary failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EvaluationError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidReturnValue { .. } => "INVALID_RETURN_VALUE",
            Self::InvalidInputValue(_) => "INVALID_INPUT_VALUE",
            Self::ScriptExecution { .. } => "SCRIPT_EXECUTION_ERROR",
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::CodeTooLarge { .. } => "CODE_TOO_LARGE",
            Self::BannedPattern { .. } => "BANNED_PATTERN",
            Self::HostAccessDenied { .. } => "HOST_ACCESS_DENIED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::PromptTimeout { .. } => "PROMPT_TIMEOUT",
            Self::HeapLimitExceeded => "HEAP_LIMIT_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            Self::Execution(_) => "INTERNAL",
            Self::Serialization(_) => "SERIALIZATION",
        }
    }

    /// Whether the caller's script is at fault (as opposed to the host).
    pub fn is_script_fault(&self) -> bool {
        matches!(
            self,
            Self::InvalidReturnValue { .. }
                | Self::InvalidInputValue(_)
                | Self::ScriptExecution { .. }
                | Self::ValidationFailed { .. }
                | Self::CodeTooLarge { .. }
                | Self::BannedPattern { .. }
                | Self::Timeout { .. }
                | Self::HeapLimitExceeded
        )
    }

    /// Convert to a structured JSON error for clients.
    ///
    /// The message is redacted: engine stack frames, credentials and host
    /// paths never reach the client.
    pub fn to_structured_error(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": crate::redact::redact_error_message(&self.to_string()),
        });
        if let Self::InvalidInputValue(invalid) = self {
            obj["callSite"] = serde_json::Value::String(invalid.call_site.clone());
            obj["argumentIndex"] = serde_json::Value::from(invalid.index);
        }
        obj
    }
}
