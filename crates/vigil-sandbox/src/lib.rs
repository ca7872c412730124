#![warn(missing_docs)]

//! # vigil-sandbox
//!
//! V8 sandbox and capability API for Vigil auditing scripts.
//!
//! An auditing script defines `function audit(payload)` and returns an
//! `AuditResult`. It runs in a deno_core isolate with no filesystem, network,
//! or environment access of its own. Everything it can do goes through the
//! globals the bootstrap installs: `HttpClient`, `Ipfs`, `Properties`,
//! `Converters`, `AuditResult`, `Input` and `Output`.
//!
//! ## Security model
//!
//! - **V8 isolate**: fresh runtime per evaluation, nothing shared
//! - **Host allow-list**: only listed ops and globals reach the script
//! - **Pre-execution validation**: banned patterns caught before reaching V8
//! - **Timeout and heap guards**: runaway scripts are terminated
//! - **Redacted errors**: host details never leak back into messages

pub mod allowlist;
pub mod audit;
pub mod bootstrap;
pub mod bridge;
pub mod context;
pub mod error;
pub mod gateway;
pub mod http;
pub mod ipfs;
pub mod ops;
pub mod redact;
pub mod script;
pub mod termination;
pub mod validator;

pub use bridge::{ListApi, MapApi, ScriptValue};
pub use context::{ExecutionContext, FieldType, FieldValue, Input, InputError, InputField, Output};
pub use error::{EvaluationError, InvalidInputValue};
pub use gateway::{EvaluationOptions, GatewayConfig, ScriptGateway};
pub use http::{HttpRequest, RawHttpResponse, ReqwestTransport};
pub use ipfs::{GatewayIpfsFetcher, TextFile};
pub use script::{AuditResult, ScriptSource};
pub use termination::{Termination, TerminationReason};

/// Sends HTTP requests on behalf of `HttpClient`.
///
/// Called on the evaluation thread, so implementations block. The sandbox
/// never sees the implementation, only the normalized response.
pub trait HttpTransport: Send + Sync {
    /// Send one request.
    fn send(&self, request: &HttpRequest) -> Result<RawHttpResponse, vigil_error::TransportError>;
}

/// Fetches text files from IPFS directories for the `Ipfs` capability.
pub trait IpfsFetcher: Send + Sync {
    /// Fetch `file_name` from the directory identified by `directory`.
    fn fetch_text_file_from_directory(
        &self,
        directory: &str,
        file_name: &str,
    ) -> Result<TextFile, vigil_error::IpfsError>;
}
