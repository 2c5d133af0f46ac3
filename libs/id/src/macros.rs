//! The `define_id!` macro behind every identifier type.

/// Defines a prefixed, UUID-backed identifier.
///
/// The generated newtype provides:
/// - a `PREFIX` constant and `new()` minting a UUIDv7
/// - `from_uuid()` / `uuid()` for raw access
/// - `parse()`, `Display` and `FromStr` over `{prefix}_{uuid}`
/// - string-form `Serialize` / `Deserialize`
///
/// # Example
///
/// ```ignore
/// define_id!(NodeId, "node");
///
/// let node = NodeId::new();
/// let parsed: NodeId = node.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Mints a fresh, time-ordered identifier.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::now_v7())
            }

            #[must_use]
            pub const fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }

            #[must_use]
            pub const fn uuid(&self) -> $crate::Uuid {
                self.0
            }

            /// Parses `{prefix}_{uuid}`. A bare UUID is rejected so ids of
            /// different resource types cannot be confused.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let (prefix, raw) = s
                    .split_once('_')
                    .ok_or($crate::IdError::MissingSeparator)?;

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                raw.parse::<$crate::Uuid>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUuid(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0.hyphenated())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<$crate::Uuid> for $name {
            fn from(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
