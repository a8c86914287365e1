//! Identity values for aggregate and saga instances, and command source ids.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when an identity or source id cannot be constructed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The backing string was empty.
    #[error("identity value must not be empty")]
    Empty,
}

/// An opaque, string-backed value identifying one aggregate or saga instance.
///
/// Two identities are equal iff their string values match. The value is used
/// as the routing key for hosts and as the event journal partition key.
///
/// Implement it with [`define_identity!`](crate::define_identity) rather
/// than by hand.
pub trait Identity:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Build an identity from its string value.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Empty`] if `value` is empty.
    fn from_value(value: String) -> Result<Self, IdentityError>;

    /// The stable string representation of this identity.
    fn value(&self) -> &str;
}

/// Define a string-backed newtype implementing [`Identity`].
///
/// The generated type has a fallible `new`, a `generate` constructor backed by
/// a random UUID, `Display`, and string (de)serialization that re-validates
/// on the way in.
///
/// ```
/// aggregate_host::define_identity!(pub OrderId);
///
/// let id = OrderId::new("order-1").unwrap();
/// assert_eq!(id.to_string(), "order-1");
/// assert!(OrderId::new("").is_err());
/// ```
#[macro_export]
macro_rules! define_identity {
    ($(#[$meta:meta])* $vis:vis $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $name(String);

        impl $name {
            /// Create an identity from a non-empty string.
            #[allow(dead_code)]
            $vis fn new(
                value: impl Into<String>,
            ) -> ::std::result::Result<Self, $crate::IdentityError> {
                let value = value.into();
                if value.is_empty() {
                    return Err($crate::IdentityError::Empty);
                }
                Ok(Self(value))
            }

            /// Create an identity backed by a random UUID.
            #[allow(dead_code)]
            $vis fn generate() -> Self {
                Self($crate::__private::uuid::Uuid::new_v4().to_string())
            }
        }

        impl $crate::Identity for $name {
            fn from_value(
                value: ::std::string::String,
            ) -> ::std::result::Result<Self, $crate::IdentityError> {
                Self::new(value)
            }

            fn value(&self) -> &str {
                &self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl ::std::convert::AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl $crate::__private::serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error>
            where
                S: $crate::__private::serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> $crate::__private::serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> ::std::result::Result<Self, D::Error>
            where
                D: $crate::__private::serde::Deserializer<'de>,
            {
                let value = <::std::string::String as $crate::__private::serde::Deserialize>::deserialize(
                    deserializer,
                )?;
                Self::new(value)
                    .map_err(<D::Error as $crate::__private::serde::de::Error>::custom)
            }
        }
    };
}

/// Fixed namespace for source ids derived from a causing event.
const SOURCE_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x81, 0x0e, 0x52, 0x6a, 0x9d, 0x4f, 0x17, 0xa2, 0x44, 0x5b, 0xe0, 0x19, 0xc7, 0x8d, 0x36,
]);

/// De-duplication token carried by a command and copied onto the events it
/// causes.
///
/// A host remembers the source ids of recently applied commands and
/// acknowledges a repeated delivery without re-executing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    /// Create a source id from a non-empty string.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Empty`] if `value` is empty.
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(value))
    }

    /// A fresh random source id, for commands issued from outside the system.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// A deterministic source id for the `index`-th command caused by `cause`.
    ///
    /// Re-running the same reaction to the same event yields the same ids, so
    /// the receiving host can drop the repeat.
    pub fn derived(cause: Uuid, index: usize) -> Self {
        let name = format!("{cause}-c{index}");
        Self(Uuid::new_v5(&SOURCE_ID_NAMESPACE, name.as_bytes()).to_string())
    }

    /// The source id recorded on events caused by the event `event_id`.
    pub fn from_event_id(event_id: Uuid) -> Self {
        Self(event_id.to_string())
    }

    /// The string value.
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SourceId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
