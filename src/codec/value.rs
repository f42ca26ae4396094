//! Wire value model.
//!
//! `Value` is the generic, class-tagged representation every message passes
//! through on its way to and from the wire: primitives, sequences, maps,
//! nested `Envelope`s, and enumerated members as `EnumToken`s. The JSON text
//! mapping at the bottom of this module is the actual frame format.

use std::collections::BTreeMap;

use crate::codec::CodecError;

/// Field map of an [`Envelope`]. Key order is irrelevant on the wire; a
/// `BTreeMap` keeps frames deterministic.
pub type Fields = BTreeMap<String, Value>;

/// A recursively defined wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(Envelope),
    Enum(EnumToken),
}

impl Value {
    /// Human-readable kind, used in type-mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Enum(_) => "enum",
        }
    }
}

/// Class-tagged generic representation of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub class_name: String,
    pub data: Fields,
}

/// Wire form of one enumerated-type member.
///
/// Equality ignores `module_hint`: a token compares by enum name, member name,
/// and member value, which makes the token itself usable as an opaque proxy
/// for a member of an enum the receiving process never registered.
#[derive(Debug, Clone)]
pub struct EnumToken {
    pub enum_name: String,
    pub module_hint: String,
    pub member_name: String,
    pub member_value: i64,
}

impl PartialEq for EnumToken {
    fn eq(&self, other: &Self) -> bool {
        self.enum_name == other.enum_name
            && self.member_name == other.member_name
            && self.member_value == other.member_value
    }
}

/// Conversion of one field into its wire [`Value`].
pub trait ToValue {
    fn to_value(&self) -> Value;
}

/// Conversion of one wire [`Value`] back into a field.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, CodecError>;

    /// Called when the field key is absent from the envelope. Only optional
    /// fields accept this.
    fn from_missing(field: &str) -> Result<Self, CodecError> {
        Err(CodecError::MissingField(field.to_string()))
    }
}

/// Looks up and decodes one envelope field.
pub fn field<T: FromValue>(fields: &Fields, name: &'static str) -> Result<T, CodecError> {
    match fields.get(name) {
        Some(value) => T::from_value(value),
        None => T::from_missing(name),
    }
}

fn mismatch<T>(expected: &'static str, found: &Value) -> Result<T, CodecError> {
    Err(CodecError::TypeMismatch {
        expected,
        found: found.kind(),
    })
}

impl ToValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => mismatch("bool", other),
        }
    }
}

impl ToValue for i64 {
    fn to_value(&self) -> Value {
        Value::Int(*self)
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Int(n) => Ok(*n),
            other => mismatch("int", other),
        }
    }
}

impl ToValue for i32 {
    fn to_value(&self) -> Value {
        Value::Int(i64::from(*self))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Int(n) => i32::try_from(*n).map_err(|_| CodecError::TypeMismatch {
                expected: "i32",
                found: "int",
            }),
            other => mismatch("int", other),
        }
    }
}

impl ToValue for u32 {
    fn to_value(&self) -> Value {
        Value::Int(i64::from(*self))
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Int(n) => u32::try_from(*n).map_err(|_| CodecError::TypeMismatch {
                expected: "u32",
                found: "int",
            }),
            other => mismatch("int", other),
        }
    }
}

impl ToValue for f64 {
    fn to_value(&self) -> Value {
        Value::Float(*self)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Float(f) => Ok(*f),
            // JSON does not distinguish 1.0 from 1.
            Value::Int(n) => Ok(*n as f64),
            other => mismatch("float", other),
        }
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::Str(self.clone())
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Str(s) => Ok(s.clone()),
            other => mismatch("string", other),
        }
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        Ok(value.clone())
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(inner) => inner.to_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }

    fn from_missing(_field: &str) -> Result<Self, CodecError> {
        Ok(None)
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn to_value(&self) -> Value {
        Value::Seq(self.iter().map(ToValue::to_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Seq(items) => items.iter().map(T::from_value).collect(),
            other => mismatch("sequence", other),
        }
    }
}

impl<T: ToValue> ToValue for BTreeMap<String, T> {
    fn to_value(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(key, value)| (key.clone(), value.to_value()))
                .collect(),
        )
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Map(entries) => entries
                .iter()
                .map(|(key, value)| Ok((key.clone(), T::from_value(value)?)))
                .collect(),
            other => mismatch("map", other),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON text mapping
// ---------------------------------------------------------------------------

/// Class tag key, kept byte-compatible with the pre-existing frames.
pub const CLASS_KEY: &str = "__class__";
/// Enum tag key.
pub const ENUM_KEY: &str = "__enum__";
const DATA_KEY: &str = "data";
const MODULE_KEY: &str = "module";
const MEMBER_KEY: &str = "member";
const VALUE_KEY: &str = "value";

pub(crate) fn envelope_to_json(envelope: &Envelope) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    object.insert(
        CLASS_KEY.to_string(),
        serde_json::Value::String(envelope.class_name.clone()),
    );
    object.insert(DATA_KEY.to_string(), fields_to_json(&envelope.data));
    serde_json::Value::Object(object)
}

fn fields_to_json(fields: &Fields) -> serde_json::Value {
    serde_json::Value::Object(
        fields
            .iter()
            .map(|(key, value)| (key.clone(), value_to_json(value)))
            .collect(),
    )
}

pub(crate) fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Seq(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), value_to_json(value)))
                .collect(),
        ),
        Value::Object(envelope) => envelope_to_json(envelope),
        Value::Enum(token) => {
            let mut object = serde_json::Map::new();
            object.insert(
                ENUM_KEY.to_string(),
                serde_json::Value::String(token.enum_name.clone()),
            );
            object.insert(
                MODULE_KEY.to_string(),
                serde_json::Value::String(token.module_hint.clone()),
            );
            object.insert(
                MEMBER_KEY.to_string(),
                serde_json::Value::String(token.member_name.clone()),
            );
            object.insert(VALUE_KEY.to_string(), serde_json::Value::from(token.member_value));
            serde_json::Value::Object(object)
        }
    }
}

pub(crate) fn json_to_envelope(json: &serde_json::Value) -> Result<Envelope, CodecError> {
    match json_to_value(json)? {
        Value::Object(envelope) => Ok(envelope),
        other => Err(CodecError::Malformed(format!(
            "expected a class-tagged object at the top level, found {}",
            other.kind()
        ))),
    }
}

pub(crate) fn json_to_value(json: &serde_json::Value) -> Result<Value, CodecError> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(CodecError::Malformed(format!("unrepresentable number {n}")))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_json::Value::Array(items) => Ok(Value::Seq(
            items.iter().map(json_to_value).collect::<Result<_, _>>()?,
        )),
        serde_json::Value::Object(object) => json_object_to_value(object),
    }
}

fn json_object_to_value(
    object: &serde_json::Map<String, serde_json::Value>,
) -> Result<Value, CodecError> {
    if let Some(class_name) = object.get(CLASS_KEY).and_then(serde_json::Value::as_str) {
        let data = match object.get(DATA_KEY) {
            Some(serde_json::Value::Object(fields)) => fields
                .iter()
                .map(|(key, value)| Ok((key.clone(), json_to_value(value)?)))
                .collect::<Result<Fields, CodecError>>()?,
            _ => {
                return Err(CodecError::Malformed(format!(
                    "class-tagged object {class_name} has no data map"
                )))
            }
        };
        return Ok(Value::Object(Envelope {
            class_name: class_name.to_string(),
            data,
        }));
    }

    if let Some(enum_name) = object.get(ENUM_KEY).and_then(serde_json::Value::as_str) {
        let member_name = object
            .get(MEMBER_KEY)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                CodecError::Malformed(format!("enum token {enum_name} has no member name"))
            })?;
        let member_value = object
            .get(VALUE_KEY)
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                CodecError::Malformed(format!("enum token {enum_name} has no member value"))
            })?;
        let module_hint = object
            .get(MODULE_KEY)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        return Ok(Value::Enum(EnumToken {
            enum_name: enum_name.to_string(),
            module_hint: module_hint.to_string(),
            member_name: member_name.to_string(),
            member_value,
        }));
    }

    Ok(Value::Map(
        object
            .iter()
            .map(|(key, value)| Ok((key.clone(), json_to_value(value)?)))
            .collect::<Result<_, CodecError>>()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        let mut data = Fields::new();
        data.insert("price".to_string(), Value::Float(101.25));
        data.insert("qty".to_string(), Value::Int(4));
        data.insert(
            "tags".to_string(),
            Value::Seq(vec![Value::Str("a".into()), Value::Str("b".into())]),
        );
        data.insert(
            "side".to_string(),
            Value::Enum(EnumToken {
                enum_name: "OrderSide".to_string(),
                module_hint: "tests".to_string(),
                member_name: "Buy".to_string(),
                member_value: 1,
            }),
        );
        Envelope {
            class_name: "Order".to_string(),
            data,
        }
    }

    #[test]
    fn json_mapping_round_trips() {
        let envelope = sample_envelope();
        let json = envelope_to_json(&envelope);
        let back = json_to_envelope(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn enum_token_equality_ignores_module_hint() {
        let a = EnumToken {
            enum_name: "Side".into(),
            module_hint: "here".into(),
            member_name: "Buy".into(),
            member_value: 1,
        };
        let b = EnumToken {
            module_hint: "elsewhere".into(),
            ..a.clone()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn nested_plain_map_stays_a_map() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": 1, "b": {"c": true}}"#).unwrap();
        match json_to_value(&json).unwrap() {
            Value::Map(entries) => {
                assert_eq!(entries.get("a"), Some(&Value::Int(1)));
                assert!(matches!(entries.get("b"), Some(Value::Map(_))));
            }
            other => panic!("expected map, got {}", other.kind()),
        }
    }

    #[test]
    fn missing_optional_field_decodes_to_none() {
        let fields = Fields::new();
        let decoded: Option<String> = field(&fields, "absent").unwrap();
        assert_eq!(decoded, None);

        let required: Result<String, _> = field(&fields, "absent");
        assert!(matches!(required, Err(CodecError::MissingField(_))));
    }
}
