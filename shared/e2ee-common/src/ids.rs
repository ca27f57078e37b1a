//! Identifier Types
//!
//! Validated newtypes for user, device and room identifiers. Users and rooms
//! use the `<sigil>localpart:server` shape; device ids are opaque tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $check:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse and validate an identifier.
            pub fn parse(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                let check: fn(&str) -> bool = $check;
                if check(&value) {
                    Ok(Self(value))
                } else {
                    Err(Error::InvalidId { kind: $kind, value })
                }
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::parse(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

fn is_sigil_id(value: &str, sigil: char) -> bool {
    let Some(rest) = value.strip_prefix(sigil) else {
        return false;
    };
    match rest.split_once(':') {
        Some((local, server)) => {
            !local.is_empty() && !server.is_empty() && !value.contains(char::is_whitespace)
        }
        None => false,
    }
}

string_id!(
    /// A user identifier such as `@alice:example.org`.
    UserId,
    "user",
    |v| is_sigil_id(v, '@')
);

string_id!(
    /// A room identifier such as `!abc123:example.org`.
    RoomId,
    "room",
    |v| is_sigil_id(v, '!')
);

string_id!(
    /// An opaque device identifier.
    DeviceId,
    "device",
    |v| !v.is_empty() && v.len() <= 255 && !v.contains(char::is_whitespace)
);
