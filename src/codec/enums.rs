//! Enumerated wire types.
//!
//! A `WireEnum` carries its members as (name, value) pairs on the wire. The
//! receiver resolves a token against its registered enums by member name
//! first, then by member value; a token for an enum the process never
//! registered resolves to the token itself, which compares by name and value
//! and so still behaves as the member for equality purposes.

use std::any::Any;

use crate::codec::value::EnumToken;

/// Capability implemented by every enumerated wire type. Generated by the
/// [`wire_enum!`](crate::wire_enum) macro.
pub trait WireEnum: Copy + Send + Sized + 'static {
    const ENUM_NAME: &'static str;
    /// Defining module, recorded on the wire for diagnostics only.
    const MODULE_HINT: &'static str;

    fn members() -> &'static [Self];
    fn member_name(&self) -> &'static str;
    fn member_value(&self) -> i64;

    /// Resolves a member by name first, then by value.
    fn from_member(member_name: &str, member_value: i64) -> Option<Self> {
        Self::members()
            .iter()
            .copied()
            .find(|member| member.member_name() == member_name)
            .or_else(|| {
                Self::members()
                    .iter()
                    .copied()
                    .find(|member| member.member_value() == member_value)
            })
    }

    fn to_token(&self) -> EnumToken {
        EnumToken {
            enum_name: Self::ENUM_NAME.to_string(),
            module_hint: Self::MODULE_HINT.to_string(),
            member_name: self.member_name().to_string(),
            member_value: self.member_value(),
        }
    }
}

impl EnumToken {
    /// Token form of a concrete member.
    pub fn of<E: WireEnum>(member: E) -> Self {
        member.to_token()
    }

    /// Name+value equality against a concrete member, usable whether or not
    /// the member's enum is registered in this process.
    pub fn matches<E: WireEnum>(&self, member: &E) -> bool {
        *self == member.to_token()
    }
}

/// Outcome of resolving an [`EnumToken`] against the registry.
pub enum EnumResolution {
    /// A registered enum matched; the box holds the concrete member.
    Typed(Box<dyn Any + Send>),
    /// No registered enum matched; the token stands in as a comparable proxy.
    Proxy(EnumToken),
}

impl EnumResolution {
    pub fn downcast_ref<E: WireEnum>(&self) -> Option<&E> {
        match self {
            EnumResolution::Typed(member) => member.downcast_ref::<E>(),
            EnumResolution::Proxy(_) => None,
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, EnumResolution::Proxy(_))
    }
}

pub(crate) type EnumResolveFn = fn(&EnumToken) -> Option<Box<dyn Any + Send>>;

pub(crate) fn resolve_shim<E: WireEnum>(token: &EnumToken) -> Option<Box<dyn Any + Send>> {
    if token.enum_name != E::ENUM_NAME {
        return None;
    }
    E::from_member(&token.member_name, token.member_value)
        .map(|member| Box::new(member) as Box<dyn Any + Send>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_enum;

    wire_enum! {
        pub enum Venue {
            Primary = 1,
            Backup = 2,
        }
    }

    #[test]
    fn resolves_by_name_before_value() {
        // Name wins even when the value points at a different member.
        let member = Venue::from_member("Backup", 1).unwrap();
        assert_eq!(member, Venue::Backup);
    }

    #[test]
    fn falls_back_to_value_for_renamed_member() {
        let member = Venue::from_member("Secondary", 2).unwrap();
        assert_eq!(member, Venue::Backup);
    }

    #[test]
    fn unknown_name_and_value_resolve_to_none() {
        assert!(Venue::from_member("Tertiary", 9).is_none());
    }

    #[test]
    fn token_matches_fresh_member() {
        let token = EnumToken::of(Venue::Primary);
        assert!(token.matches(&Venue::Primary));
        assert!(!token.matches(&Venue::Backup));
    }
}
