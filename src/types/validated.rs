//! Validated string types that enforce invariants at construction time

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Validation errors for string types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("hostname cannot be empty or whitespace")]
    EmptyHostName,

    #[error("origin name cannot be empty or whitespace")]
    EmptyOriginName,

    #[error("filter name cannot be empty or whitespace")]
    EmptyFilterName,

    #[error("invalid hostname: {0}")]
    InvalidHostName(String),

    #[error("port cannot be 0")]
    InvalidPort,

    #[error("invalid port number '{0}'")]
    InvalidPortNumber(String),
}

/// Macro to generate validated string newtypes.
///
/// This macro eliminates boilerplate by generating all the standard implementations
/// for validated string types. Each type gets:
/// - A `new()` constructor that validates
/// - `as_str()` getter
/// - `AsRef<str>`, `Deref`, `Display`, `TryFrom<String>` impls
/// - Serde `Serialize` and `Deserialize` with validation
macro_rules! validated_string {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident(String) {
            validation: |$s_param:ident| $validation:expr,
            error_variant: $error_variant:ident,
            error_message: $error_msg:literal,
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
        #[serde(transparent)]
        $vis struct $name(String);

        impl $name {
            #[doc = concat!("Create a new ", stringify!($name), " after validation")]
            pub fn new($s_param: String) -> Result<Self, ValidationError> {
                let validate = || $validation;
                validate()?;
                Ok(Self($s_param))
            }

            #[doc = concat!("Get the ", stringify!($name), " as a string slice")]
            #[must_use]
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from($s_param: String) -> Result<Self, Self::Error> {
                Self::new($s_param)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::new(s).map_err(serde::de::Error::custom)
            }
        }
    };
}

validated_string! {
    /// A validated hostname that cannot be empty or whitespace-only
    ///
    /// This type enforces at construction that a hostname is always usable,
    /// eliminating the need for runtime validation checks downstream.
    ///
    /// # Examples
    /// ```
    /// use edge_proxy::types::HostName;
    ///
    /// let host = HostName::new("api.example.com".to_string()).unwrap();
    /// assert_eq!(host.as_str(), "api.example.com");
    ///
    /// // Empty strings are rejected
    /// assert!(HostName::new("".to_string()).is_err());
    /// assert!(HostName::new("   ".to_string()).is_err());
    /// ```
    #[doc(alias = "host")]
    #[doc(alias = "domain")]
    pub struct HostName(String) {
        validation: |s| {
            if s.trim().is_empty() {
                Err(ValidationError::EmptyHostName)
            } else {
                Ok(())
            }
        },
        error_variant: EmptyHostName,
        error_message: "hostname cannot be empty or whitespace",
    }
}

validated_string! {
    /// A validated origin (upstream service) name
    pub struct OriginName(String) {
        validation: |s| {
            if s.trim().is_empty() {
                Err(ValidationError::EmptyOriginName)
            } else {
                Ok(())
            }
        },
        error_variant: EmptyOriginName,
        error_message: "origin name cannot be empty or whitespace",
    }
}

validated_string! {
    /// A validated filter identifier
    ///
    /// Filter names key the per-filter dynamic properties
    /// (`zuul.<name>.<type>.disable` and friends), so an empty name would
    /// silently collapse distinct filters onto the same property keys.
    pub struct FilterName(String) {
        validation: |s| {
            if s.trim().is_empty() {
                Err(ValidationError::EmptyFilterName)
            } else {
                Ok(())
            }
        },
        error_variant: EmptyFilterName,
        error_message: "filter name cannot be empty or whitespace",
    }
}
