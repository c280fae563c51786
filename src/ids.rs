//! Opaque identifiers for zones, animations and parameters.
//!
//! All three are closed enumerations loaded from config at startup (spec
//! §3): the type itself doesn't constrain membership, but nothing in this
//! crate ever *constructs* one except by copying it out of `StaticConfig`
//! or an incoming `Command`.

use std::fmt;
use std::sync::Arc;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(raw: impl Into<Arc<str>>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self::new(raw)
            }
        }
    };
}

opaque_id!(ZoneId);
opaque_id!(AnimationId);
opaque_id!(ParameterId);
opaque_id!(StripId);
opaque_id!(ClientId);
opaque_id!(RequestId);
