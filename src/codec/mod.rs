//! Self-describing object serialization.
//!
//! Every message that crosses a connection implements [`Wire`], which turns it
//! into a class-tagged [`Envelope`] and back. The [`CodecRegistry`] maps class
//! names to decoders so a receiver can reconstruct concrete types from data
//! alone. The registry is an explicit object shared by reference (`Arc`)
//! among the connections that need it; decoding an unregistered class is a
//! hard failure, so every wire type must be registered before first use.

pub mod enums;
pub mod value;

pub use enums::{EnumResolution, WireEnum};
pub use value::{field, Envelope, EnumToken, Fields, FromValue, ToValue, Value};

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use thiserror::Error;

use enums::{resolve_shim, EnumResolveFn};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown class: {0}")]
    UnknownClass(String),
    #[error("expected class {expected}, found {found}")]
    ClassMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("unknown member {member_name} (value {member_value}) for enum {enum_name}")]
    UnknownEnumMember {
        enum_name: &'static str,
        member_name: String,
        member_value: i64,
    },
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// The encodable capability. Implemented by every cross-connection message
/// type, normally through the [`wire_message!`](crate::wire_message) macro.
///
/// Decoding constructs the value by raw field assignment: `from_fields` runs
/// no constructor or validation logic beyond per-field conversion.
pub trait Wire: Send + Sized + 'static {
    const CLASS_NAME: &'static str;

    fn to_fields(&self) -> Fields;
    fn from_fields(fields: &Fields) -> Result<Self, CodecError>;
}

type DecodeFn = fn(&Fields) -> Result<Box<dyn Any + Send>, CodecError>;

fn decode_shim<T: Wire>(fields: &Fields) -> Result<Box<dyn Any + Send>, CodecError> {
    T::from_fields(fields).map(|decoded| Box::new(decoded) as Box<dyn Any + Send>)
}

/// Process-lifetime map from class/enum name to decoder.
#[derive(Default)]
pub struct CodecRegistry {
    classes: Mutex<HashMap<String, DecodeFn>>,
    enums: Mutex<HashMap<String, EnumResolveFn>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class decoder. Idempotent.
    pub fn register<T: Wire>(&self) {
        let mut classes = self.classes.lock().unwrap();
        if classes
            .insert(T::CLASS_NAME.to_string(), decode_shim::<T>)
            .is_none()
        {
            debug!("registered wire class {}", T::CLASS_NAME);
        }
    }

    /// Registers an enum resolver. Idempotent.
    pub fn register_enum<E: WireEnum>(&self) {
        let mut enums = self.enums.lock().unwrap();
        if enums
            .insert(E::ENUM_NAME.to_string(), resolve_shim::<E>)
            .is_none()
        {
            debug!("registered wire enum {}", E::ENUM_NAME);
        }
    }

    pub fn is_registered(&self, class_name: &str) -> bool {
        self.classes.lock().unwrap().contains_key(class_name)
    }

    /// Registered class names, sorted. Mainly useful for startup validation
    /// and tests.
    pub fn registered_classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Encodes a message into its class-tagged representation, registering
    /// the message's own class as a side effect.
    pub fn encode<T: Wire>(&self, message: &T) -> Envelope {
        self.register::<T>();
        Envelope {
            class_name: T::CLASS_NAME.to_string(),
            data: message.to_fields(),
        }
    }

    /// Reconstructs the concrete type named by the envelope. Fails with
    /// [`CodecError::UnknownClass`] (leaving the registry untouched) when the
    /// class was never registered.
    pub fn decode(&self, envelope: &Envelope) -> Result<Box<dyn Any + Send>, CodecError> {
        let decode = self
            .classes
            .lock()
            .unwrap()
            .get(&envelope.class_name)
            .copied()
            .ok_or_else(|| CodecError::UnknownClass(envelope.class_name.clone()))?;
        decode(&envelope.data)
    }

    /// Typed decode for receivers that already know what they expect.
    pub fn decode_as<T: Wire>(&self, envelope: &Envelope) -> Result<T, CodecError> {
        if envelope.class_name != T::CLASS_NAME {
            return Err(CodecError::ClassMismatch {
                expected: T::CLASS_NAME,
                found: envelope.class_name.clone(),
            });
        }
        T::from_fields(&envelope.data)
    }

    /// Resolves an enum token: a registered enum matched by member name then
    /// value, or the token itself as a comparable proxy. Never an error.
    pub fn resolve_enum(&self, token: &EnumToken) -> EnumResolution {
        let resolve = self.enums.lock().unwrap().get(&token.enum_name).copied();
        match resolve.and_then(|resolve| resolve(token)) {
            Some(member) => EnumResolution::Typed(member),
            None => EnumResolution::Proxy(token.clone()),
        }
    }

    /// Encodes a message as one JSON text frame.
    pub fn to_wire<T: Wire>(&self, message: &T) -> Result<String, CodecError> {
        let envelope = self.encode(message);
        serde_json::to_string(&value::envelope_to_json(&envelope))
            .map_err(|err| CodecError::Malformed(err.to_string()))
    }

    /// Parses a text frame into its envelope without decoding it.
    pub fn parse_wire(&self, text: &str) -> Result<Envelope, CodecError> {
        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|err| CodecError::Malformed(err.to_string()))?;
        value::json_to_envelope(&json)
    }

    /// Parses and decodes a text frame in one step.
    pub fn from_wire(&self, text: &str) -> Result<Box<dyn Any + Send>, CodecError> {
        let envelope = self.parse_wire(text)?;
        self.decode(&envelope)
    }

    /// Removes every class and enum entry. Intended for test isolation only;
    /// production registries live for the whole process.
    pub fn clear(&self) {
        self.classes.lock().unwrap().clear();
        self.enums.lock().unwrap().clear();
    }
}
