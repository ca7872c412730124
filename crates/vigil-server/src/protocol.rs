//! Session wire protocol.
//!
//! Outbound commands are colon-delimited text frames, one per capability
//! call. Info and response messages are JSON records tagged by
//! `messageType`. Inbound frames are either the script id, the start signal,
//! or answers.

use serde::Serialize;
use vigil_sandbox::{AuditResult, EvaluationError, InputField};

/// A prompt or render the running script issued.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `Input.readBoolean`.
    ReadBoolean(String),
    /// `Input.readNumber`.
    ReadNumber(String),
    /// `Input.readString`.
    ReadString(String),
    /// `Input.readFields`.
    ReadFields {
        /// Prompt text.
        message: String,
        /// Validated descriptors, in order.
        fields: Vec<InputField>,
    },
    /// `Input.button`.
    Button(String),
    /// `Output.renderText`.
    RenderText(String),
    /// `Output.renderHtml`.
    RenderHtml(String),
    /// `Output.renderMarkdown`.
    RenderMarkdown(String),
}

impl Command {
    /// The text frames this command is sent as.
    pub fn frames(&self) -> Vec<String> {
        match self {
            Self::ReadBoolean(m) => vec![format!("readBoolean:{m}")],
            Self::ReadNumber(m) => vec![format!("readNumber:{m}")],
            Self::ReadString(m) => vec![format!("readString:{m}")],
            Self::ReadFields { message, fields } => {
                let mut frames = Vec::with_capacity(fields.len() + 1);
                frames.push(format!("readFields:{}:{message}", fields.len()));
                frames.extend(fields.iter().map(|f| {
                    format!(
                        "field:{}:{}:{}",
                        f.field_type.wire_name(),
                        f.name,
                        f.description
                    )
                }));
                frames
            }
            Self::Button(m) => vec![format!("button:{m}")],
            Self::RenderText(t) => vec![format!("renderText:{t}")],
            Self::RenderHtml(h) => vec![format!("renderHtml:{h}")],
            Self::RenderMarkdown(md) => vec![format!("renderMarkdown:{md}")],
        }
    }

    /// How many answers the peer owes for this command.
    pub fn expected_answers(&self) -> usize {
        match self {
            Self::ReadBoolean(_) | Self::ReadNumber(_) | Self::ReadString(_) | Self::Button(_) => 1,
            Self::ReadFields { fields, .. } => fields.len(),
            Self::RenderText(_) | Self::RenderHtml(_) | Self::RenderMarkdown(_) => 0,
        }
    }
}

/// Session lifecycle notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "messageType")]
pub enum InfoMessage {
    /// The connection is open and waiting for a script id.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Identifier of this session, for log correlation.
        session_id: String,
    },
    /// No script is stored under the id the peer sent.
    #[serde(rename_all = "camelCase")]
    NotFound {
        /// The id as received.
        script_id: String,
    },
    /// The script started running.
    #[serde(rename_all = "camelCase")]
    Executing {
        /// The running script.
        script_id: String,
    },
}

/// The final message of a session that ran its script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "messageType")]
pub enum Response {
    /// The script returned an `AuditResult`.
    AuditResultResponse {
        /// What the script reported.
        result: AuditResult,
    },
    /// The evaluation failed.
    ErrorResponse {
        /// Stable error code.
        code: String,
        /// Redacted message.
        message: String,
    },
}

impl Response {
    /// The response for an evaluation outcome.
    pub fn from_outcome(outcome: &Result<AuditResult, EvaluationError>) -> Self {
        match outcome {
            Ok(result) => Self::AuditResultResponse {
                result: result.clone(),
            },
            Err(e) => {
                let structured = e.to_structured_error();
                Self::ErrorResponse {
                    code: e.code().to_string(),
                    message: structured["message"].as_str().unwrap_or_default().to_string(),
                }
            }
        }
    }
}

/// What the controller hands the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send one text frame.
    Frame(String),
    /// Close the connection.
    Close,
}

/// Encode an info or response record as a frame.
pub fn record_frame<T: Serialize>(record: &T) -> Outbound {
    match serde_json::to_string(record) {
        Ok(json) => Outbound::Frame(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode session record");
            Outbound::Frame(r#"{"messageType":"ErrorResponse","code":"SERIALIZATION","message":"record encoding failed"}"#.to_string())
        }
    }
}

/// Parse a start signal: `start` or `start:<json payload>`.
///
/// Returns `None` for anything else, including a payload that is not JSON.
pub fn parse_start(frame: &str) -> Option<Option<serde_json::Value>> {
    let frame = frame.trim();
    if frame == "start" {
        return Some(None);
    }
    let payload = frame.strip_prefix("start:")?;
    match serde_json::from_str(payload) {
        Ok(value) => Some(Some(value)),
        Err(e) => {
            tracing::warn!(error = %e, "start signal carries invalid JSON payload");
            None
        }
    }
}
