//! Error types for configuration registry operations.
//!
//! # Design
//! - Constant error messages; context travels in structured fields.
//! - Source errors are preserved rather than interpolated into messages.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::schema::SchemaId;
use crate::token::Role;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No live entry exists for the schema.
    #[error("configuration schema not registered")]
    NotRegistered {
        /// Schema that was looked up.
        schema: SchemaId,
    },
    /// The schema already has a live entry.
    #[error("configuration schema already registered")]
    AlreadyRegistered {
        /// Schema that was registered twice.
        schema: SchemaId,
    },
    /// The presented capability token does not grant the required role, or
    /// the setting itself forbids the access.
    #[error("unauthorized configuration access")]
    Unauthorized {
        /// Schema the access targeted.
        schema: SchemaId,
        /// Role that was required.
        role: Role,
        /// Setting name when the refusal came from the record flags.
        key: Option<String>,
        /// Machine-readable refusal reason.
        reason: &'static str,
    },
    /// The setting name is not declared by the schema.
    #[error("configuration key not found")]
    KeyNotFound {
        /// Schema that was searched.
        schema: SchemaId,
        /// Missing setting name.
        key: String,
    },
    /// A structured source could not be parsed.
    #[error("malformed configuration source")]
    MalformedSource {
        /// Source file that failed to parse.
        path: PathBuf,
        /// Machine-readable reason for the failure.
        reason: &'static str,
        /// Underlying parse error when available.
        source: Option<serde_json::Error>,
    },
    /// A value could not be serialized to or from its JSON representation.
    #[error("configuration serialization failed")]
    Serialization {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// A secure record was requested as a plain type, or a plain record as a
    /// secure value.
    #[error("secure setting type mismatch")]
    SecureTypeMismatch {
        /// Schema containing the record.
        schema: SchemaId,
        /// Setting name.
        key: String,
        /// Whether the record is secure.
        secure: bool,
    },
    /// A stored value could not be converted to the requested type.
    #[error("configuration value conversion failed")]
    ConversionFailed {
        /// Schema containing the record.
        schema: SchemaId,
        /// Setting name.
        key: String,
        /// Requested Rust type.
        target: &'static str,
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// A caller-provided argument was invalid.
    #[error("invalid configuration argument")]
    InvalidArgument {
        /// Argument or field that failed validation.
        field: String,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// A secure value was used after it was disposed.
    #[error("secure value disposed")]
    Disposed,
    /// Encrypting or decrypting a secure payload failed.
    #[error("secure payload encryption failed")]
    Encryption {
        /// Operation identifier.
        operation: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
    },
    /// File system operation failed.
    #[error("filesystem operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
    /// Installing a change watcher on a source failed.
    #[error("source watch failed")]
    Watch {
        /// Path that could not be watched.
        path: PathBuf,
        /// Underlying notify error.
        source: notify::Error,
    },
    /// A background task driving persistence panicked or was aborted.
    #[error("background task failed")]
    BackgroundTask {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying join error.
        source: tokio::task::JoinError,
    },
    /// The operation was cancelled before it started writing.
    #[error("configuration operation cancelled")]
    Cancelled {
        /// Operation identifier.
        operation: &'static str,
    },
    /// A detached operation was requested outside of a tokio runtime.
    #[error("no async runtime available")]
    RuntimeUnavailable {
        /// Operation identifier.
        operation: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(operation: &'static str, source: serde_json::Error) -> Self {
        Self::Serialization { operation, source }
    }

    pub(crate) fn invalid(field: impl Into<String>, reason: &'static str, value: Option<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason,
            value,
        }
    }

    pub(crate) fn key_not_found(schema: SchemaId, key: &str) -> Self {
        Self::KeyNotFound {
            schema,
            key: key.to_string(),
        }
    }
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    const SCHEMA: SchemaId = SchemaId::new("errors");

    #[test]
    fn helpers_build_variants_with_sources() {
        let io_err = ConfigError::io("source.read", "settings.json", io::Error::other("io"));
        assert!(matches!(io_err, ConfigError::Io { .. }));
        assert!(io_err.source().is_some());

        let Err(json_err) = serde_json::from_str::<serde_json::Value>("}{") else {
            panic!("expected invalid json");
        };
        let ser = ConfigError::serialization("value.encode", json_err);
        assert!(ser.source().is_some());

        let missing = ConfigError::key_not_found(SCHEMA, "FieldZ");
        assert!(matches!(missing, ConfigError::KeyNotFound { ref key, .. } if key == "FieldZ"));
        assert_eq!(missing.to_string(), "configuration key not found");
    }

    #[test]
    fn malformed_source_without_parse_error_has_no_source() {
        let err = ConfigError::MalformedSource {
            path: PathBuf::from("defaults/editor.json"),
            reason: "root must be an object",
            source: None,
        };
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "malformed configuration source");
    }
}
