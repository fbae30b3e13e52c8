use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Generates a 26-char sortable identifier newtype backed by a ULID.
macro_rules! sortable_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            pub fn as_str(&self) -> String {
                self.0.to_string()
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

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Ulid::from_str(s)?))
            }
        }

        impl From<Ulid> for $name {
            fn from(value: Ulid) -> Self {
                Self(value)
            }
        }

        // kept so call sites can name the id kind in logs/errors, e.g. RunId::KIND == "run"
        #[allow(dead_code)]
        impl $name {
            pub const KIND: &'static str = $prefix;
        }
    };
}

sortable_id!(RunId, "run");
sortable_id!(DocumentId, "document");
sortable_id!(TaskId, "task");
sortable_id!(ArtifactId, "artifact");

/// Tenants are provisioned by an external auth system, not minted here, so this
/// wraps an opaque caller-supplied string rather than a ULID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > 128 {
            return Err("tenant_id must be 1..=128 characters".to_string());
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_26_chars_and_sortable() {
        let a = RunId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = RunId::new();
        assert_eq!(a.as_str().len(), 26);
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn round_trips_through_string() {
        let id = DocumentId::new();
        let parsed: DocumentId = id.as_str().parse().expect("parse");
        assert_eq!(id, parsed);
    }
}
