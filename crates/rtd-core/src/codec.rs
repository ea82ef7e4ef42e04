//! CRUD value codecs.
//!
//! A CRUD message names the type of its `Value` in `ValueType`. Components that
//! own an entity type register a codec for that name; values of unregistered
//! types travel as opaque strings.

use crate::error::{RtdError, RtdResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Type names always treated as plain text.
const STRING_TYPE_NAMES: &[&str] = &["string", "system.string", "nullable", "system.nullable"];

/// Decodes the textual form of a CRUD value into a structured value.
pub trait ValueCodec: Send + Sync {
    fn decode(&self, text: &str) -> RtdResult<Value>;
}

/// Parses the text as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn decode(&self, text: &str) -> RtdResult<Value> {
        serde_json::from_str(text).map_err(|e| RtdError::Codec(e.to_string()))
    }
}

/// A CRUD value after type resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum CrudValue {
    Opaque(String),
    Typed { type_name: String, value: Value },
}

impl CrudValue {
    pub fn into_json(self) -> Value {
        match self {
            CrudValue::Opaque(s) => Value::String(s),
            CrudValue::Typed { value, .. } => value,
        }
    }
}

/// Registry of codecs keyed by type name.
#[derive(Default, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn ValueCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: impl Into<String>, codec: Arc<dyn ValueCodec>) {
        self.codecs.insert(type_name.into(), codec);
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.codecs.contains_key(type_name)
    }

    /// Resolve a raw CRUD value against its declared type.
    ///
    /// No type, a string-like type, or an unregistered type yields
    /// `CrudValue::Opaque` with the filtered text. A registered codec that
    /// rejects the text is an error.
    pub fn resolve(&self, value_type: Option<&str>, raw: &Value) -> RtdResult<CrudValue> {
        let text = filter_value_text(raw);
        let Some(type_name) = value_type else {
            return Ok(CrudValue::Opaque(text));
        };
        if STRING_TYPE_NAMES.contains(&type_name.to_ascii_lowercase().as_str()) {
            return Ok(CrudValue::Opaque(text));
        }
        match self.codecs.get(type_name) {
            Some(codec) => Ok(CrudValue::Typed {
                type_name: type_name.to_string(),
                value: codec.decode(&text)?,
            }),
            None => Ok(CrudValue::Opaque(text)),
        }
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("types", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Textual form of a stored value with its control-character escapes undone.
///
/// Stores encode `"` as ESC (0x1b) and `'` as SUB (0x1a). A value wrapped in
/// double quotes loses the quotes and has its `\"` escapes removed.
pub fn filter_value_text(raw: &Value) -> String {
    let text = match raw {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    let filtered: String = text
        .chars()
        .map(|c| match c {
            '\u{1b}' => '"',
            '\u{1a}' => '\'',
            other => other,
        })
        .collect();
    if filtered.len() >= 2 && filtered.starts_with('"') && filtered.ends_with('"') {
        filtered[1..filtered.len() - 1].replace("\\\"", "\"")
    } else {
        filtered
    }
}
