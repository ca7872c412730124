//! Execution contexts: the `Input` and `Output` capabilities bound to one
//! evaluation.
//!
//! The no-op context answers every read with an absent value and discards
//! every render. Interactive front ends supply their own implementations
//! that block the evaluation thread until a remote peer answers.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::bridge::{MapApi, ScriptValue};

/// Names of the globals an execution context contributes to the script.
pub const CONTEXT_BINDINGS: &[&str] = &["Input", "Output"];

/// Why a blocking read could not produce an answer.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum InputError {
    /// The peer that would answer has gone away.
    #[error("input source disconnected")]
    Disconnected,
    /// Nobody answered within the prompt timeout.
    #[error("no answer within {}ms", .timeout.as_millis())]
    TimedOut {
        /// The prompt timeout that expired.
        timeout: Duration,
    },
}

/// Declared type of one [`InputField`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// `true` / `false`.
    Boolean,
    /// An IEEE-754 double.
    Number,
    /// Free text.
    String,
}

impl FieldType {
    /// Parse a type name, ignoring case.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "boolean" => Some(Self::Boolean),
            "number" => Some(Self::Number),
            "string" => Some(Self::String),
            _ => None,
        }
    }

    /// The upper-case name used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Boolean => "BOOLEAN",
            Self::Number => "NUMBER",
            Self::String => "STRING",
        }
    }

    /// Coerce a raw answer. `None` means the answer does not parse.
    pub fn coerce(self, raw: &str) -> Option<FieldValue> {
        match self {
            Self::Boolean => parse_boolean(raw).map(FieldValue::Boolean),
            Self::Number => parse_number(raw).map(FieldValue::Number),
            Self::String => Some(FieldValue::String(raw.to_string())),
        }
    }
}

/// Strict boolean parse: `true` or `false`, any case.
pub fn parse_boolean(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Finite double parse.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// A coerced answer to one field of a `readFields` prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Answer to a `Boolean` field.
    Boolean(bool),
    /// Answer to a `Number` field.
    Number(f64),
    /// Answer to a `String` field.
    String(String),
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::String(s) => serializer.serialize_str(s),
        }
    }
}

/// One slot of a multi-field prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputField {
    /// Declared answer type.
    pub field_type: FieldType,
    /// Key under which the answer is returned.
    pub name: String,
    /// Text shown to the person answering.
    pub description: String,
}

impl InputField {
    /// Build a field descriptor.
    pub fn new(field_type: FieldType, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            field_type,
            name: name.into(),
            description: description.into(),
        }
    }

    /// Validate a script-side descriptor `{ type, name, description }`.
    ///
    /// All three members must be present as strings, empty ones included,
    /// and `type` must name a known [`FieldType`].
    pub fn from_script(value: &ScriptValue) -> Option<Self> {
        let text = |key: &str| value.member(key).and_then(ScriptValue::as_str);
        let field_type = FieldType::parse(text("type")?)?;
        Some(Self::new(field_type, text("name")?, text("description")?))
    }

    /// Validate a whole descriptor list. One malformed entry rejects the
    /// list, and so does an empty one.
    pub fn list_from_script(value: &ScriptValue) -> Option<Vec<Self>> {
        if !value.has_indexed_elements() || value.items().is_empty() {
            return None;
        }
        value.items().iter().map(Self::from_script).collect()
    }
}

/// Blocking reads issued by a script.
///
/// Every read returns `Ok(None)` when no usable answer is available. An
/// `Err` means the evaluation cannot continue.
pub trait Input: Send + Sync {
    /// Ask a yes/no question.
    fn read_boolean(&self, message: &str) -> Result<Option<bool>, InputError>;

    /// Ask for a number.
    fn read_number(&self, message: &str) -> Result<Option<f64>, InputError>;

    /// Ask for free text.
    fn read_string(&self, message: &str) -> Result<Option<String>, InputError>;

    /// Ask several typed questions at once. Unparseable answers are left out
    /// of the returned map.
    fn read_fields(
        &self,
        message: &str,
        fields: &[InputField],
    ) -> Result<Option<MapApi<String, FieldValue>>, InputError>;

    /// Show a message and wait for any acknowledgement.
    fn button(&self, message: &str) -> Result<(), InputError>;
}

/// One-way renders issued by a script. Never block.
pub trait Output: Send + Sync {
    /// Render plain text.
    fn render_text(&self, text: &str);

    /// Render HTML.
    fn render_html(&self, html: &str);

    /// Render Markdown.
    fn render_markdown(&self, markdown: &str);
}

/// `Input` that never has an answer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInput;

impl Input for NoopInput {
    fn read_boolean(&self, _message: &str) -> Result<Option<bool>, InputError> {
        Ok(None)
    }

    fn read_number(&self, _message: &str) -> Result<Option<f64>, InputError> {
        Ok(None)
    }

    fn read_string(&self, _message: &str) -> Result<Option<String>, InputError> {
        Ok(None)
    }

    fn read_fields(
        &self,
        _message: &str,
        _fields: &[InputField],
    ) -> Result<Option<MapApi<String, FieldValue>>, InputError> {
        Ok(None)
    }

    fn button(&self, _message: &str) -> Result<(), InputError> {
        Ok(())
    }
}

/// `Output` that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOutput;

impl Output for NoopOutput {
    fn render_text(&self, _text: &str) {}
    fn render_html(&self, _html: &str) {}
    fn render_markdown(&self, _markdown: &str) {}
}

static NOOP_CONTEXT: LazyLock<ExecutionContext> = LazyLock::new(|| ExecutionContext {
    input: Arc::new(NoopInput),
    output: Arc::new(NoopOutput),
    interactive: false,
});

/// The `Input` / `Output` pair bound to one evaluation.
#[derive(Clone)]
pub struct ExecutionContext {
    input: Arc<dyn Input>,
    output: Arc<dyn Output>,
    interactive: bool,
}

impl ExecutionContext {
    /// Context backed by caller-supplied implementations.
    pub fn new(input: Arc<dyn Input>, output: Arc<dyn Output>) -> Self {
        Self {
            input,
            output,
            interactive: true,
        }
    }

    /// The process-wide no-op context.
    pub fn noop() -> &'static ExecutionContext {
        &NOOP_CONTEXT
    }

    /// The `Input` capability.
    pub fn input(&self) -> &Arc<dyn Input> {
        &self.input
    }

    /// The `Output` capability.
    pub fn output(&self) -> &Arc<dyn Output> {
        &self.output
    }

    /// Whether a remote peer drives this context.
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Global names this context contributes.
    pub fn bindings(&self) -> &'static [&'static str] {
        CONTEXT_BINDINGS
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_type_parse_ignores_case() {
        assert_eq!(FieldType::parse("Boolean"), Some(FieldType::Boolean));
        assert_eq!(FieldType::parse("NUMBER"), Some(FieldType::Number));
        assert_eq!(FieldType::parse("string"), Some(FieldType::String));
        assert_eq!(FieldType::parse("date"), None);
        assert_eq!(FieldType::Number.wire_name(), "NUMBER");
    }

    #[test]
    fn coercion_drops_unparseable_answers() {
        assert_eq!(
            FieldType::Boolean.coerce("TRUE"),
            Some(FieldValue::Boolean(true))
        );
        assert_eq!(FieldType::Boolean.coerce("yes"), None);
        assert_eq!(
            FieldType::Number.coerce(" 2.5 "),
            Some(FieldValue::Number(2.5))
        );
        assert_eq!(FieldType::Number.coerce("abc"), None);
        assert_eq!(FieldType::Number.coerce("NaN"), None);
        assert_eq!(
            FieldType::String.coerce("hello"),
            Some(FieldValue::String("hello".into()))
        );
    }

    #[test]
    fn descriptor_list_rejects_any_malformed_entry() {
        let good = ScriptValue::from_json(&json!([
            {"type": "Boolean", "name": "field1", "description": "first"},
            {"type": "String", "name": "field2", "description": "second"}
        ]));
        let fields = InputField::list_from_script(&good).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1], InputField::new(FieldType::String, "field2", "second"));

        for bad in [
            json!([{"type": "Color", "name": "a", "description": "b"}]),
            json!([{"type": "Number", "name": "a"}]),
            json!([{"type": "Number", "name": 5, "description": "b"}]),
            json!([{"type": "", "name": "a", "description": "b"}]),
            json!([{"type": "Number", "name": "a", "description": "b"}, 7]),
            json!({"type": "Number", "name": "a", "description": "b"}),
            json!([]),
        ] {
            assert!(
                InputField::list_from_script(&ScriptValue::from_json(&bad)).is_none(),
                "{bad}"
            );
        }
    }

    #[test]
    fn empty_names_and_descriptions_are_allowed() {
        let fields = InputField::list_from_script(&ScriptValue::from_json(&json!([
            {"type": "string", "name": "", "description": ""}
        ])))
        .unwrap();
        assert_eq!(fields, vec![InputField::new(FieldType::String, "", "")]);
    }

    #[test]
    fn noop_context_is_a_singleton_with_absent_reads() {
        let a = ExecutionContext::noop();
        let b = ExecutionContext::noop();
        assert!(std::ptr::eq(a, b));
        assert!(!a.is_interactive());
        assert_eq!(a.input().read_boolean("q"), Ok(None));
        assert_eq!(a.input().read_number("q"), Ok(None));
        assert_eq!(a.input().read_fields("q", &[]), Ok(None));
        assert_eq!(a.input().button("ok"), Ok(()));
        assert_eq!(a.bindings(), &["Input", "Output"]);
    }

    #[test]
    fn field_values_serialize_as_plain_json() {
        let map: MapApi<String, FieldValue> = [
            ("a".to_string(), FieldValue::Boolean(true)),
            ("b".to_string(), FieldValue::String("x".into())),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            serde_json::to_value(&map).unwrap(),
            json!({"@@vigil": "map", "entries": [["a", true], ["b", "x"]]})
        );
    }
}
