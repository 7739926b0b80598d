//! Temporary configuration roots and registries wired for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use latchkey_config::{ConfigRegistry, KeyedEncryptionService, RegistryConfig, SchemaId};
use tempfile::TempDir;
use zeroize::Zeroizing;

/// Debounce window used by test registries.
pub const TEST_DEBOUNCE: Duration = Duration::from_millis(75);

/// Fixed master key so secure payloads stay readable across registries.
pub const TEST_MASTER_KEY: [u8; 32] = [7; 32];

/// Temporary directory laid out like a registry root.
pub struct ConfigRoot {
    dir: TempDir,
    config: RegistryConfig,
}

impl ConfigRoot {
    /// Create an empty root.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("failed to create temporary config root")?;
        let config = RegistryConfig::new(dir.path()).with_debounce(TEST_DEBOUNCE);
        Ok(Self { dir, config })
    }

    /// Root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Registry settings for this root.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Default source location for `schema`.
    #[must_use]
    pub fn default_source(&self, schema: SchemaId) -> PathBuf {
        self.config.source_paths(schema.as_str()).default_source
    }

    /// User source location for `schema`.
    #[must_use]
    pub fn user_source(&self, schema: SchemaId) -> PathBuf {
        self.config.source_paths(schema.as_str()).user_source
    }

    /// Write raw text to the default source, creating directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_default(&self, schema: SchemaId, text: &str) -> Result<()> {
        write_file(&self.default_source(schema), text)
    }

    /// Write raw text to the user source, creating directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_user(&self, schema: SchemaId, text: &str) -> Result<()> {
        write_file(&self.user_source(schema), text)
    }

    /// Parse the user source.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not JSON.
    pub fn read_user(&self, schema: SchemaId) -> Result<serde_json::Value> {
        read_json(&self.user_source(schema))
    }

    /// Parse the default source.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not JSON.
    pub fn read_default(&self, schema: SchemaId) -> Result<serde_json::Value> {
        read_json(&self.default_source(schema))
    }

    /// Registry over this root using the fixed test master key.
    #[must_use]
    pub fn registry(&self) -> ConfigRegistry {
        ConfigRegistry::builder(self.path())
            .config(self.config.clone())
            .encryption(Arc::new(KeyedEncryptionService::new(Zeroizing::new(TEST_MASTER_KEY))))
            .build()
    }
}

fn write_file(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid json in {}", path.display()))
}

/// Poll `check` until it returns `true` or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: SchemaId = SchemaId::new("fixture");

    #[test]
    fn root_lays_out_sources_under_the_temp_dir() -> Result<()> {
        let root = ConfigRoot::new()?;
        assert!(root.default_source(SCHEMA).starts_with(root.path()));
        root.write_user(SCHEMA, r#"{"FieldA": 1}"#)?;
        assert_eq!(root.read_user(SCHEMA)?["FieldA"], 1);
        assert!(root.read_default(SCHEMA).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn wait_until_reports_timeouts() {
        assert!(wait_until(Duration::from_millis(50), || true).await);
        assert!(!wait_until(Duration::from_millis(50), || false).await);
    }
}
