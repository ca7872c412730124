//! deno_core op definitions for the Vigil sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; the functions and types below are documented.
//!
//! Every op is synchronous. Values cross the boundary as JSON strings: script
//! arguments arrive as encoded [`ScriptValue`]s, results leave as plain JSON
//! with bridge wrappers marked for the bootstrap's reviver.
#![allow(missing_docs)]

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use serde::Serialize;

use crate::bridge::{array_to_list, object_to_map, ScriptValue};
use crate::context::{ExecutionContext, InputError, InputField};
use crate::error::InvalidInputValue;
use crate::http::{HttpCall, HttpClient, HttpClientError};
use crate::ipfs::{Ipfs, IpfsCallError};
use crate::redact::redact_error_message;
use crate::termination::{Termination, TerminationReason, WaitClock};

/// What the entry-point trailer reported about the value `audit` returned.
///
/// `kind` is an [`AuditResult`](crate::AuditResult) variant name for branded
/// results, or `"invalid"` with the script-side type name in `detail`.
/// Only primitives cross here so a script cannot shape the report through
/// `toJSON` or prototype tricks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledValue {
    /// Variant name or `"invalid"`.
    pub kind: String,
    /// Result message or observed type name.
    pub detail: String,
}

/// The first capability contract violation of an evaluation.
///
/// Kept even if the script catches the `TypeError`, so the gateway still
/// reports it.
#[derive(Default)]
pub struct ContractViolation(pub Option<InvalidInputValue>);

fn record_violation(state: &mut OpState, invalid: InvalidInputValue) -> JsErrorBox {
    tracing::debug!(
        call_site = %invalid.call_site,
        index = invalid.index,
        "capability contract violation"
    );
    let message = invalid.to_string();
    let slot = state.borrow_mut::<ContractViolation>();
    if slot.0.is_none() {
        slot.0 = Some(invalid);
    }
    JsErrorBox::type_error(message)
}

fn interrupt(state: &OpState, err: InputError) -> JsErrorBox {
    let reason = match err {
        InputError::Disconnected => TerminationReason::Disconnected,
        InputError::TimedOut { timeout } => TerminationReason::PromptTimeout(timeout),
    };
    state.borrow::<Termination>().terminate(reason);
    JsErrorBox::generic(err.to_string())
}

/// Run a blocking `Input` call with the wait clock paused.
fn blocking<T>(
    state: &OpState,
    ask: impl FnOnce() -> Result<T, InputError>,
) -> Result<T, JsErrorBox> {
    let clock = state.borrow::<WaitClock>().clone();
    if !clock.begin() {
        return Err(JsErrorBox::generic("execution time limit reached"));
    }
    let answer = ask();
    clock.end();
    answer.map_err(|e| interrupt(state, e))
}

fn decode_value(json: &str) -> Result<ScriptValue, JsErrorBox> {
    serde_json::from_str(json).map_err(|e| JsErrorBox::generic(format!("invalid value: {e}")))
}

fn decode_args(json: &str) -> Result<Vec<ScriptValue>, JsErrorBox> {
    serde_json::from_str(json).map_err(|e| JsErrorBox::generic(format!("invalid arguments: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<String, JsErrorBox> {
    serde_json::to_string(value)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

/// Forward a `console.*` call to the host log.
#[op2(fast)]
pub fn op_vigil_log(#[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::error!(target: "vigil::script", "{}", msg),
        "warn" => tracing::warn!(target: "vigil::script", "{}", msg),
        "debug" => tracing::debug!(target: "vigil::script", "{}", msg),
        _ => tracing::info!(target: "vigil::script", "{}", msg),
    }
}

/// Store what `audit` returned. The last call wins.
#[op2(fast)]
pub fn op_vigil_settle(state: &mut OpState, #[string] kind: &str, #[string] detail: &str) {
    state.put(SettledValue {
        kind: kind.to_string(),
        detail: detail.to_string(),
    });
}

/// `HttpClient.get/post/request`. Enforces the per-evaluation call budget
/// held by the [`HttpClient`] in `OpState`.
#[op2]
#[string]
pub fn op_vigil_http(
    state: &mut OpState,
    #[string] call: &str,
    #[string] args_json: &str,
) -> Result<String, JsErrorBox> {
    let call = HttpCall::from_name(call)
        .ok_or_else(|| JsErrorBox::type_error(format!("unknown HttpClient call '{call}'")))?;
    let args = decode_args(args_json)?;

    let result = state.borrow_mut::<HttpClient>().call(call, &args);
    match result {
        Ok(response) => encode(&response),
        Err(HttpClientError::InvalidInput(invalid)) => Err(record_violation(state, invalid)),
        Err(e) => Err(JsErrorBox::generic(redact_error_message(&e.to_string()))),
    }
}

/// `Ipfs.getFile(name)`: file content or `null`.
#[op2]
#[string]
pub fn op_vigil_ipfs_get_file(
    state: &mut OpState,
    #[string] args_json: &str,
) -> Result<String, JsErrorBox> {
    let args = decode_args(args_json)?;
    let name = args.first().unwrap_or(&ScriptValue::Undefined);

    let ipfs = state.borrow::<Ipfs>().clone();
    match ipfs.get_file(name) {
        Ok(content) => encode(&content),
        Err(IpfsCallError::InvalidInput(invalid)) => Err(record_violation(state, invalid)),
        Err(e) => Err(JsErrorBox::generic(redact_error_message(&e.to_string()))),
    }
}

/// `Converters.arrayToList` / `Converters.objectToMap`.
#[op2]
#[string]
pub fn op_vigil_convert(
    #[string] kind: &str,
    #[string] value_json: &str,
) -> Result<String, JsErrorBox> {
    let value = decode_value(value_json)?;
    match kind {
        "arrayToList" => encode(&array_to_list(&value).map(|v| v.to_json())),
        "objectToMap" => encode(&object_to_map(&value).map_values(|v| v.to_json())),
        other => Err(JsErrorBox::type_error(format!(
            "unknown conversion '{other}'"
        ))),
    }
}

/// `Input.readBoolean/readNumber/readString/button`. Blocks in interactive
/// contexts.
#[op2]
#[string]
pub fn op_vigil_input(
    state: &mut OpState,
    #[string] kind: &str,
    #[string] message: &str,
) -> Result<String, JsErrorBox> {
    let input = state.borrow::<ExecutionContext>().input().clone();
    let answer = match kind {
        "readBoolean" => blocking(state, || input.read_boolean(message))?.map(serde_json::Value::from),
        "readNumber" => blocking(state, || input.read_number(message))?.map(serde_json::Value::from),
        "readString" => blocking(state, || input.read_string(message))?.map(serde_json::Value::from),
        "button" => {
            blocking(state, || input.button(message))?;
            None
        }
        other => {
            return Err(JsErrorBox::type_error(format!(
                "unknown Input call '{other}'"
            )))
        }
    };
    Ok(answer.unwrap_or(serde_json::Value::Null).to_string())
}

/// `Input.readFields(fields, message)`. Malformed descriptors yield `null`
/// without prompting.
#[op2]
#[string]
pub fn op_vigil_input_read_fields(
    state: &mut OpState,
    #[string] message: &str,
    #[string] fields_json: &str,
) -> Result<String, JsErrorBox> {
    let Some(fields) = InputField::list_from_script(&decode_value(fields_json)?) else {
        tracing::debug!("readFields: malformed field descriptors, returning null");
        return Ok("null".to_string());
    };

    let input = state.borrow::<ExecutionContext>().input().clone();
    let answers = blocking(state, || input.read_fields(message, &fields))?;
    encode(&answers)
}

/// `Output.renderText/renderHtml/renderMarkdown`. Never blocks.
#[op2(fast)]
pub fn op_vigil_output(
    state: &mut OpState,
    #[string] kind: &str,
    #[string] content: &str,
) -> Result<(), JsErrorBox> {
    let output = state.borrow::<ExecutionContext>().output();
    match kind {
        "renderText" => output.render_text(content),
        "renderHtml" => output.render_html(content),
        "renderMarkdown" => output.render_markdown(content),
        other => {
            return Err(JsErrorBox::type_error(format!(
                "unknown Output call '{other}'"
            )))
        }
    }
    Ok(())
}

deno_core::extension!(
    vigil_ext,
    ops = [
        op_vigil_log,
        op_vigil_settle,
        op_vigil_http,
        op_vigil_ipfs_get_file,
        op_vigil_convert,
        op_vigil_input,
        op_vigil_input_read_fields,
        op_vigil_output
    ],
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::HOST_OPS;

    #[test]
    fn every_registered_op_is_allow_listed() {
        let ext = vigil_ext::init();
        let names: Vec<&str> = ext.ops.iter().map(|decl| decl.name).collect();
        assert_eq!(names.len(), HOST_OPS.len());
        for name in names {
            assert!(HOST_OPS.contains(&name), "{name} missing from allow-list");
        }
    }

    #[test]
    fn decode_args_reads_encoded_values() {
        let args = decode_args(r#"[{"kind":"string","value":"https://x"},{"kind":"undefined"}]"#)
            .unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].as_str(), Some("https://x"));
        assert!(args[1].is_absent());
        assert!(decode_args("not json").is_err());
    }
}
