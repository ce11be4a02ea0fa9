//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `must()`, `as_str()`, Display, Serialize,
/// Deserialize. Optionally generates `new()` (UUID v4) and `Default` if the
/// `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            /// Construct from anything string-like, panicking on empty input.
            /// Intended for tests and for call sites that already validated
            /// the value (e.g. a freshly-generated id).
            pub fn must(s: impl Into<String>) -> Self {
                Self::from_string(s.into()).expect("id must be non-empty")
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            /// Construct from anything string-like, panicking on empty input.
            pub fn must(s: impl Into<String>) -> Self {
                Self::from_string(s.into()).expect("id must be non-empty")
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ProcessId, uuid);
define_id!(EnvelopeId, uuid);
define_id!(RequestId, uuid);
define_id!(SessionId, uuid);
define_id!(InterruptId, uuid);
define_id!(UserId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_string_rejects_empty() {
        assert!(UserId::from_string(String::new()).is_err());
    }

    #[test]
    fn must_panics_on_empty() {
        let result = std::panic::catch_unwind(|| UserId::must(""));
        assert!(result.is_err());
    }

    #[test]
    fn must_accepts_str_and_string() {
        assert_eq!(ProcessId::must("pid-1").as_str(), "pid-1");
        assert_eq!(ProcessId::must(String::from("pid-2")).as_str(), "pid-2");
    }

    #[test]
    fn uuid_ids_are_unique() {
        assert_ne!(ProcessId::new(), ProcessId::new());
    }

    #[test]
    fn display_matches_as_str() {
        let id = SessionId::must("sess-7");
        assert_eq!(format!("{id}"), "sess-7");
    }
}
