//! The process-wide host allow-list.
//!
//! Scripts reach the host only through ops the bootstrap captured before
//! `Deno` was removed. The bootstrap is generated from this list: asking for
//! an op or a global that is not on it fails with
//! [`EvaluationError::HostAccessDenied`] before any script code runs.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::context::CONTEXT_BINDINGS;
use crate::error::EvaluationError;

/// Globals provided by the capability package itself.
pub const CAPABILITY_BINDINGS: &[&str] =
    &["HttpClient", "Ipfs", "Properties", "Converters", "AuditResult"];

/// Host ops the bootstrap may capture.
pub const HOST_OPS: &[&str] = &[
    "op_vigil_log",
    "op_vigil_settle",
    "op_vigil_http",
    "op_vigil_ipfs_get_file",
    "op_vigil_convert",
    "op_vigil_input",
    "op_vigil_input_read_fields",
    "op_vigil_output",
];

static ALLOW_LIST: LazyLock<HostAllowList> = LazyLock::new(HostAllowList::standard);

/// Immutable set of host ops and script globals that evaluations may use.
#[derive(Debug, Clone)]
pub struct HostAllowList {
    ops: BTreeSet<String>,
    globals: BTreeSet<String>,
}

impl HostAllowList {
    /// The list every evaluation uses.
    pub fn global() -> &'static HostAllowList {
        &ALLOW_LIST
    }

    fn standard() -> Self {
        Self::new(
            HOST_OPS.iter().copied(),
            CAPABILITY_BINDINGS
                .iter()
                .chain(CONTEXT_BINDINGS)
                .chain(&["console"])
                .copied(),
        )
    }

    /// An explicit list.
    pub fn new<'a>(
        ops: impl IntoIterator<Item = &'a str>,
        globals: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            ops: ops.into_iter().map(str::to_string).collect(),
            globals: globals.into_iter().map(str::to_string).collect(),
        }
    }

    /// Whether `op` may be captured.
    pub fn permits_op(&self, op: &str) -> bool {
        self.ops.contains(op)
    }

    /// Whether `name` may be defined as a script global.
    pub fn permits_global(&self, name: &str) -> bool {
        self.globals.contains(name)
    }

    /// Fail with `HostAccessDenied` unless `op` is permitted.
    pub fn require_op(&self, op: &str) -> Result<(), EvaluationError> {
        if self.permits_op(op) {
            Ok(())
        } else {
            tracing::warn!(op = %op, "host op refused by allow-list");
            Err(EvaluationError::HostAccessDenied {
                binding: op.to_string(),
            })
        }
    }

    /// Fail with `HostAccessDenied` unless `name` is permitted.
    pub fn require_global(&self, name: &str) -> Result<(), EvaluationError> {
        if self.permits_global(name) {
            Ok(())
        } else {
            tracing::warn!(global = %name, "script global refused by allow-list");
            Err(EvaluationError::HostAccessDenied {
                binding: name.to_string(),
            })
        }
    }

    /// Permitted ops in name order.
    pub fn ops(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().map(String::as_str)
    }

    /// Permitted globals in name order.
    pub fn globals(&self) -> impl Iterator<Item = &str> {
        self.globals.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_list_covers_every_binding() {
        let list = HostAllowList::global();
        for name in CAPABILITY_BINDINGS.iter().chain(CONTEXT_BINDINGS) {
            assert!(list.permits_global(name), "{name}");
        }
        for op in HOST_OPS {
            assert!(list.permits_op(op), "{op}");
        }
    }

    #[test]
    fn unknown_names_are_denied() {
        let list = HostAllowList::global();
        let err = list.require_op("op_fs_read").unwrap_err();
        assert_eq!(err.code(), "HOST_ACCESS_DENIED");
        assert!(err.to_string().contains("op_fs_read"));
        assert!(list.require_global("Deno").is_err());
        assert!(list.require_global("HttpClient").is_ok());
    }

    #[test]
    fn explicit_list_is_exact() {
        let list = HostAllowList::new(["op_vigil_log"], ["Output"]);
        assert!(list.permits_op("op_vigil_log"));
        assert!(!list.permits_op("op_vigil_http"));
        assert_eq!(list.globals().collect::<Vec<_>>(), vec!["Output"]);
    }
}
