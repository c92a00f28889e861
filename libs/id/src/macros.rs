//! Macros for defining typed ID types.

/// Macro to define a typed, string-backed ID with a generation prefix.
///
/// This generates a newtype wrapper around `String` with:
/// - A `PREFIX` constant used by `generate()`
/// - `parse()` accepting any valid opaque ID
/// - `Display`, `FromStr`, `AsRef<str>` and `Borrow<str>` implementations
/// - `Serialize` and `Deserialize` as a plain string
///
/// # Example
///
/// ```ignore
/// define_id!(JobId, "job");
///
/// let generated = JobId::generate();
/// let chosen: JobId = "web-1".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix used for generated IDs.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh `{prefix}_{ulid}` ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}_{}", Self::PREFIX, $crate::Ulid::new()))
            }

            /// Parses an ID from a string.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::validate_id(s)?;
                Ok(Self(s.to_string()))
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the ID, returning the inner string.
            #[must_use]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
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
