//! Strongly-typed identifiers.
//!
//! Two flavors: named ids (`AgentId`, `PolicyId`) wrap caller-chosen names,
//! while record ids (`EventId`, `MemoryId`, ...) are generated UUIDs. The
//! fallible `from_string` path is the one to use on untrusted input; `new`
//! is for literals the caller already knows are good.

use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Define a strongly-typed ID newtype.
///
/// `define_id!(Name)` wraps an explicit name; `define_id!(Name, generated)`
/// additionally gets a `generate()` constructor backed by UUID v4 and a
/// `Default` that generates.
macro_rules! define_id {
    (@common $name:ident) => {
        impl $name {
            /// Wrap a known-good name.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Validating constructor for untrusted input.
            pub fn from_string(s: String) -> Result<Self> {
                if s.trim().is_empty() {
                    return Err(Error::validation(concat!(
                        stringify!($name),
                        " cannot be empty"
                    )));
                }
                Ok(Self(s))
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

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_string(s.to_string())
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        define_id!(@common $name);
    };
    ($name:ident, generated) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        define_id!(@common $name);

        impl $name {
            /// A fresh UUID-backed id.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::generate()
            }
        }
    };
}

define_id!(AgentId);
define_id!(PolicyId);
define_id!(EventId, generated);
define_id!(MemoryId, generated);
define_id!(DecisionId, generated);
define_id!(SubscriptionId, generated);
