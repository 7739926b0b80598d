//! Default identifiers and timing constants for the registry.
//!
//! # Design
//! - Centralize on-disk naming so sources, tooling and tests agree.
//! - Keep the reload debounce window explicit.

use std::time::Duration;

/// Quiet window after the last change notification before a reload runs.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
/// Directory (under the registry root) holding default sources.
pub const DEFAULT_SOURCE_DIR: &str = "defaults";
/// Directory (under the registry root) holding user-override sources.
pub const USER_SOURCE_DIR: &str = "user";
/// Extension of every structured source file.
pub const SOURCE_EXTENSION: &str = "json";
/// Field name wrapping an encrypted payload in the object form.
pub const ENCRYPTED_FIELD: &str = "EncryptedBase64";
/// Placeholder emitted in events instead of secure values.
pub const REDACTED: &str = "<redacted>";
/// Instance id used when registration does not supply one.
pub const DEFAULT_INSTANCE_ID: &str = "default";
