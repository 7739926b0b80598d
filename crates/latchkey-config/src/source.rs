//! Structured JSON sources backing a schema.
//!
//! Each source is a flat JSON object mapping setting name to value. Writes
//! go through a temporary file in the same directory followed by a rename,
//! so readers never observe a partially written document.

use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::model::SerializationOptions;

/// Parsed source document.
pub type SourceDocument = Map<String, Value>;

/// One structured source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonSource {
    path: PathBuf,
}

impl JsonSource {
    /// Source stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the source file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory containing the source file.
    #[must_use]
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Create the file with `seed` when it does not exist yet. Returns `true`
    /// when the file was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created, or if the
    /// seed document fails to build.
    pub fn ensure<F>(&self, options: SerializationOptions, seed: F) -> ConfigResult<bool>
    where
        F: FnOnce() -> ConfigResult<SourceDocument>,
    {
        if self.path.is_file() {
            return Ok(false);
        }
        let document = seed()?;
        self.write_document(&document, options)?;
        debug!(path = %self.path.display(), "seeded configuration source");
        Ok(true)
    }

    /// Read the raw text of the source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read.
    pub fn read_text(&self) -> ConfigResult<String> {
        fs::read_to_string(&self.path).map_err(|err| ConfigError::io("source.read", &self.path, err))
    }

    /// Read and parse the source. A missing file is an IO error; an empty
    /// file parses as an empty document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for read failures and
    /// [`ConfigError::MalformedSource`] for invalid documents.
    pub fn load(&self) -> ConfigResult<SourceDocument> {
        let text = self.read_text()?;
        parse_document(&self.path, &text)
    }

    /// Render and atomically write `document`.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or any filesystem step fails.
    pub fn write_document(
        &self,
        document: &SourceDocument,
        options: SerializationOptions,
    ) -> ConfigResult<()> {
        let text = render_document(document, options)?;
        self.write_text(&text)
    }

    /// Atomically replace the file contents with `text`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the temporary file cannot be created,
    /// written, synced or renamed into place.
    pub fn write_text(&self, text: &str) -> ConfigResult<()> {
        let directory = self.directory();
        fs::create_dir_all(directory)
            .map_err(|err| ConfigError::io("source.create_dir", directory, err))?;
        let mut staged = tempfile::Builder::new()
            .prefix(".latchkey-")
            .suffix(".tmp")
            .tempfile_in(directory)
            .map_err(|err| ConfigError::io("source.stage", directory, err))?;
        staged
            .write_all(text.as_bytes())
            .map_err(|err| ConfigError::io("source.write", staged.path().to_path_buf(), err))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|err| ConfigError::io("source.sync", staged.path().to_path_buf(), err))?;
        staged
            .persist(&self.path)
            .map_err(|err| ConfigError::io("source.persist", &self.path, err.error))?;
        Ok(())
    }

    /// Whether the directory holding the source exists.
    #[must_use]
    pub fn directory_exists(&self) -> bool {
        self.directory().is_dir()
    }
}

/// Parse source text into a document.
///
/// # Errors
///
/// Returns [`ConfigError::MalformedSource`] when the text is not a JSON
/// object.
pub fn parse_document(path: &Path, text: &str) -> ConfigResult<SourceDocument> {
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ConfigError::MalformedSource {
            path: path.to_path_buf(),
            reason: "root must be an object",
            source: None,
        }),
        Err(err) => Err(ConfigError::MalformedSource {
            path: path.to_path_buf(),
            reason: "invalid json",
            source: Some(err),
        }),
    }
}

/// Render a document with the given options.
///
/// # Errors
///
/// Returns [`ConfigError::Serialization`] if rendering fails.
pub fn render_document(
    document: &SourceDocument,
    options: SerializationOptions,
) -> ConfigResult<String> {
    let mut text = if options.pretty {
        serde_json::to_string_pretty(document)
    } else {
        serde_json::to_string(document)
    }
    .map_err(|err| ConfigError::serialization("source.render", err))?;
    if options.trailing_newline {
        text.push('\n');
    }
    Ok(text)
}

/// Whether an IO error means the file or its directory is absent.
#[must_use]
pub fn is_missing(error: &ConfigError) -> bool {
    matches!(error, ConfigError::Io { source, .. } if source.kind() == ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn source_in(dir: &TempDir) -> JsonSource {
        JsonSource::new(dir.path().join("nested").join("editor.json"))
    }

    #[test]
    fn ensure_seeds_only_once() -> ConfigResult<()> {
        let dir = tempfile::tempdir().map_err(|err| ConfigError::io("test", "tmp", err))?;
        let source = source_in(&dir);
        let seed = || {
            let mut doc = Map::new();
            doc.insert("FieldA".into(), json!(50));
            Ok(doc)
        };
        assert!(source.ensure(SerializationOptions::default(), seed)?);
        assert!(!source.ensure(SerializationOptions::default(), || Ok(Map::new()))?);
        assert_eq!(source.load()?.get("FieldA"), Some(&json!(50)));
        assert!(source.read_text()?.ends_with('\n'));
        Ok(())
    }

    #[test]
    fn load_reports_malformed_documents() -> ConfigResult<()> {
        let dir = tempfile::tempdir().map_err(|err| ConfigError::io("test", "tmp", err))?;
        let source = source_in(&dir);
        source.write_text("}{ not json")?;
        assert!(matches!(
            source.load(),
            Err(ConfigError::MalformedSource { reason: "invalid json", .. })
        ));
        source.write_text("[1, 2]")?;
        assert!(matches!(
            source.load(),
            Err(ConfigError::MalformedSource { reason: "root must be an object", .. })
        ));
        source.write_text("  \n")?;
        assert!(source.load()?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_files_are_reported_as_not_found() {
        let source = JsonSource::new("/definitely/not/here/editor.json");
        let err = source.load().expect_err("missing file");
        assert!(is_missing(&err));
        assert!(!source.directory_exists());
    }

    #[test]
    fn compact_rendering_omits_whitespace() -> ConfigResult<()> {
        let mut doc = Map::new();
        doc.insert("b".into(), json!([1, 2]));
        doc.insert("a".into(), json!({"x": true}));
        let options = SerializationOptions {
            pretty: false,
            trailing_newline: false,
        };
        assert_eq!(render_document(&doc, options)?, r#"{"a":{"x":true},"b":[1,2]}"#);
        Ok(())
    }

    #[test]
    fn writes_leave_no_staging_files_behind() -> ConfigResult<()> {
        let dir = tempfile::tempdir().map_err(|err| ConfigError::io("test", "tmp", err))?;
        let source = source_in(&dir);
        for round in 0..5 {
            let mut doc = Map::new();
            doc.insert("round".into(), json!(round));
            source.write_document(&doc, SerializationOptions::default())?;
        }
        let entries = fs::read_dir(source.directory())
            .map_err(|err| ConfigError::io("test", source.directory(), err))?
            .count();
        assert_eq!(entries, 1);
        assert_eq!(source.load()?.get("round"), Some(&json!(4)));
        Ok(())
    }
}
