//! Typed options for the registry and for individual registrations.
//!
//! # Design
//! - Pure data carriers consumed by the registry.
//! - Path derivation lives here so tooling can locate sources without a
//!   running registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_DEBOUNCE, DEFAULT_INSTANCE_ID, DEFAULT_SOURCE_DIR, SOURCE_EXTENSION, USER_SOURCE_DIR,
};
use crate::token::CapabilityToken;

/// Registry-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Root directory holding the default and user source trees.
    pub root: PathBuf,
    /// Quiet window applied to change notifications.
    #[serde(with = "duration_millis")]
    pub debounce: Duration,
    /// Directory under `root` for default sources.
    pub default_dir: String,
    /// Directory under `root` for user sources.
    pub user_dir: String,
    /// File extension for both sources.
    pub file_extension: String,
}

impl RegistryConfig {
    /// Settings rooted at `root` with the stock layout.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debounce: DEFAULT_DEBOUNCE,
            default_dir: DEFAULT_SOURCE_DIR.to_string(),
            user_dir: USER_SOURCE_DIR.to_string(),
            file_extension: SOURCE_EXTENSION.to_string(),
        }
    }

    /// Override the debounce window.
    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Source paths derived for the schema named `schema`.
    #[must_use]
    pub fn source_paths(&self, schema: &str) -> SourcePaths {
        let file = format!("{schema}.{}", self.file_extension);
        SourcePaths {
            default_source: self.root.join(&self.default_dir).join(&file),
            user_source: self.root.join(&self.user_dir).join(file),
        }
    }
}

/// Locations of a schema's two structured sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePaths {
    /// Source holding default values.
    pub default_source: PathBuf,
    /// Source holding user overrides.
    pub user_source: PathBuf,
}

impl SourcePaths {
    /// Explicit pair of paths.
    #[must_use]
    pub fn new(default_source: impl Into<PathBuf>, user_source: impl Into<PathBuf>) -> Self {
        Self {
            default_source: default_source.into(),
            user_source: user_source.into(),
        }
    }

    /// Both paths, default source first.
    #[must_use]
    pub fn iter(&self) -> [&Path; 2] {
        [&self.default_source, &self.user_source]
    }
}

/// How source documents are rendered when written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializationOptions {
    /// Indent nested values.
    pub pretty: bool,
    /// End the file with a newline.
    pub trailing_newline: bool,
}

impl Default for SerializationOptions {
    fn default() -> Self {
        Self {
            pretty: true,
            trailing_newline: true,
        }
    }
}

/// Per-registration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Owner token; minted when absent.
    pub owner: Option<CapabilityToken>,
    /// Read token; minted when absent.
    pub read: Option<CapabilityToken>,
    /// Write token; minted when absent.
    pub write: Option<CapabilityToken>,
    /// Rendering options for saves.
    pub serialization: SerializationOptions,
    /// Rebuild from disk when either source changes.
    pub reload_enabled: bool,
    /// Instance id mixed into the encryption key.
    pub instance_id: String,
    /// Explicit source locations; derived from the registry root when absent.
    pub sources: Option<SourcePaths>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            owner: None,
            read: None,
            write: None,
            serialization: SerializationOptions::default(),
            reload_enabled: false,
            instance_id: DEFAULT_INSTANCE_ID.to_string(),
            sources: None,
        }
    }
}

impl RegisterOptions {
    /// Options with every token minted and reload disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options where every role is public.
    #[must_use]
    pub fn public() -> Self {
        Self::default().with_tokens(
            Some(CapabilityToken::Public),
            Some(CapabilityToken::Public),
            Some(CapabilityToken::Public),
        )
    }

    /// Supply any of the three tokens.
    #[must_use]
    pub const fn with_tokens(
        mut self,
        owner: Option<CapabilityToken>,
        read: Option<CapabilityToken>,
        write: Option<CapabilityToken>,
    ) -> Self {
        self.owner = owner;
        self.read = read;
        self.write = write;
        self
    }

    /// Enable or disable change-driven reloads.
    #[must_use]
    pub const fn with_reload(mut self, enabled: bool) -> Self {
        self.reload_enabled = enabled;
        self
    }

    /// Override rendering options.
    #[must_use]
    pub const fn with_serialization(mut self, serialization: SerializationOptions) -> Self {
        self.serialization = serialization;
        self
    }

    /// Override the encryption instance id.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Use explicit source locations.
    #[must_use]
    pub fn with_sources(mut self, sources: SourcePaths) -> Self {
        self.sources = Some(sources);
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaId;
    use serde_json::json;

    #[test]
    fn source_paths_follow_the_stock_layout() {
        let config = RegistryConfig::new("/etc/app");
        let paths = config.source_paths(SchemaId::new("editor").as_str());
        assert_eq!(paths.default_source, PathBuf::from("/etc/app/defaults/editor.json"));
        assert_eq!(paths.user_source, PathBuf::from("/etc/app/user/editor.json"));
        assert_eq!(paths.iter()[0], paths.default_source.as_path());
    }

    #[test]
    fn registry_config_serializes_debounce_as_millis() {
        let config = RegistryConfig::new("/tmp/cfg").with_debounce(Duration::from_millis(50));
        let value = serde_json::to_value(&config).expect("serialize");
        assert_eq!(value["debounce"], json!(50));
        let back: RegistryConfig = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, config);
    }

    #[test]
    fn register_options_builders_compose() {
        let options = RegisterOptions::public()
            .with_reload(true)
            .with_instance_id("secondary")
            .with_sources(SourcePaths::new("a.json", "b.json"));
        assert_eq!(options.read, Some(CapabilityToken::Public));
        assert!(options.reload_enabled);
        assert_eq!(options.instance_id, "secondary");
        assert_eq!(
            options.sources.map(|paths| paths.user_source),
            Some(PathBuf::from("b.json"))
        );
        assert!(SerializationOptions::default().pretty);
    }
}
