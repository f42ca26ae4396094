/// Defines a wire message: the struct plus its [`Wire`](crate::codec::Wire),
/// [`ToValue`](crate::codec::ToValue), and [`FromValue`](crate::codec::FromValue)
/// implementations, so the type can cross connections and nest inside other
/// wire messages.
///
/// ```
/// use trading_wire::wire_message;
///
/// wire_message! {
///     /// A fill reported by a gateway.
///     pub struct Fill {
///         pub order_id: String,
///         pub price: f64,
///         pub quantity: i64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! wire_message {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                pub $field:ident : $field_type:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $field_type,
            )*
        }

        impl $crate::codec::Wire for $name {
            const CLASS_NAME: &'static str = stringify!($name);

            fn to_fields(&self) -> $crate::codec::Fields {
                let mut fields = $crate::codec::Fields::new();
                $(
                    fields.insert(
                        stringify!($field).to_string(),
                        $crate::codec::ToValue::to_value(&self.$field),
                    );
                )*
                fields
            }

            fn from_fields(
                fields: &$crate::codec::Fields,
            ) -> Result<Self, $crate::codec::CodecError> {
                Ok(Self {
                    $(
                        $field: $crate::codec::field(fields, stringify!($field))?,
                    )*
                })
            }
        }

        impl $crate::codec::ToValue for $name {
            fn to_value(&self) -> $crate::codec::Value {
                $crate::codec::Value::Object($crate::codec::Envelope {
                    class_name: <Self as $crate::codec::Wire>::CLASS_NAME.to_string(),
                    data: $crate::codec::Wire::to_fields(self),
                })
            }
        }

        impl $crate::codec::FromValue for $name {
            fn from_value(
                value: &$crate::codec::Value,
            ) -> Result<Self, $crate::codec::CodecError> {
                match value {
                    $crate::codec::Value::Object(envelope) => {
                        if envelope.class_name != <Self as $crate::codec::Wire>::CLASS_NAME {
                            return Err($crate::codec::CodecError::ClassMismatch {
                                expected: <Self as $crate::codec::Wire>::CLASS_NAME,
                                found: envelope.class_name.clone(),
                            });
                        }
                        <Self as $crate::codec::Wire>::from_fields(&envelope.data)
                    }
                    other => Err($crate::codec::CodecError::TypeMismatch {
                        expected: "object",
                        found: other.kind(),
                    }),
                }
            }
        }
    };
}

/// Defines an enumerated wire type: the enum plus its
/// [`WireEnum`](crate::codec::WireEnum) and value-conversion implementations.
/// Members carry explicit integer values so renamed members still resolve.
///
/// ```
/// use trading_wire::wire_enum;
///
/// wire_enum! {
///     pub enum OrderSide {
///         Buy = 1,
///         Sell = 2,
///     }
/// }
/// ```
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$member_meta:meta])*
                $member:ident = $value:expr
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
                $(#[$member_meta])*
                $member = $value,
            )+
        }

        impl $crate::codec::WireEnum for $name {
            const ENUM_NAME: &'static str = stringify!($name);
            const MODULE_HINT: &'static str = module_path!();

            fn members() -> &'static [Self] {
                &[$(Self::$member,)+]
            }

            fn member_name(&self) -> &'static str {
                match self {
                    $(Self::$member => stringify!($member),)+
                }
            }

            fn member_value(&self) -> i64 {
                match self {
                    $(Self::$member => $value,)+
                }
            }
        }

        impl $crate::codec::ToValue for $name {
            fn to_value(&self) -> $crate::codec::Value {
                $crate::codec::Value::Enum($crate::codec::WireEnum::to_token(self))
            }
        }

        impl $crate::codec::FromValue for $name {
            fn from_value(
                value: &$crate::codec::Value,
            ) -> Result<Self, $crate::codec::CodecError> {
                match value {
                    $crate::codec::Value::Enum(token) => {
                        <Self as $crate::codec::WireEnum>::from_member(
                            &token.member_name,
                            token.member_value,
                        )
                        .ok_or_else(|| $crate::codec::CodecError::UnknownEnumMember {
                            enum_name: <Self as $crate::codec::WireEnum>::ENUM_NAME,
                            member_name: token.member_name.clone(),
                            member_value: token.member_value,
                        })
                    }
                    other => Err($crate::codec::CodecError::TypeMismatch {
                        expected: "enum",
                        found: other.kind(),
                    }),
                }
            }
        }
    };
}
