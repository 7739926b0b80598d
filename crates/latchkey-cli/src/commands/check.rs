//! `latchkey check`: parse source files without registering anything.

use std::path::{Path, PathBuf};

use latchkey_config::JsonSource;
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::{CheckArgs, OutputFormat};
use crate::error::{CliError, CliResult};
use crate::output::render_check;

/// Outcome of validating a single file.
#[derive(Debug, Serialize)]
pub(crate) struct CheckReport {
    pub(crate) path: PathBuf,
    pub(crate) keys: Option<usize>,
    pub(crate) error: Option<String>,
}

pub(crate) fn handle_check(args: &CheckArgs, format: OutputFormat) -> CliResult<()> {
    let reports: Vec<CheckReport> = args.files.iter().map(|path| check_source(path)).collect();
    render_check(&reports, format)?;

    let failed = reports.iter().filter(|report| report.error.is_some()).count();
    if failed > 0 {
        return Err(CliError::validation(format!(
            "{failed} of {} sources failed validation",
            reports.len()
        )));
    }
    info!(count = reports.len(), "all sources valid");
    Ok(())
}

pub(crate) fn check_source(path: &Path) -> CheckReport {
    match JsonSource::new(path).load() {
        Ok(document) => CheckReport {
            path: path.to_path_buf(),
            keys: Some(document.len()),
            error: None,
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "source failed validation");
            CheckReport {
                path: path.to_path_buf(),
                keys: None,
                error: Some(err.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, text).expect("write source");
        path
    }

    #[test]
    fn valid_and_empty_sources_pass() {
        let dir = TempDir::new().expect("tempdir");
        let valid = check_source(&write(&dir, "a.json", r#"{"FieldA": 1, "FieldB": true}"#));
        assert_eq!(valid.keys, Some(2));
        assert!(valid.error.is_none());

        let empty = check_source(&write(&dir, "b.json", ""));
        assert_eq!(empty.keys, Some(0));
    }

    #[test]
    fn malformed_missing_and_non_object_sources_fail() {
        let dir = TempDir::new().expect("tempdir");
        for report in [
            check_source(&write(&dir, "broken.json", "{ not json")),
            check_source(&write(&dir, "array.json", "[1, 2]")),
            check_source(&dir.path().join("absent.json")),
        ] {
            assert!(report.keys.is_none(), "{report:?}");
            assert!(report.error.is_some());
        }
    }

    #[test]
    fn any_failure_fails_the_command() {
        let dir = TempDir::new().expect("tempdir");
        let args = CheckArgs {
            files: vec![
                write(&dir, "good.json", "{}"),
                write(&dir, "bad.json", "{"),
            ],
        };
        let err = handle_check(&args, OutputFormat::Json).expect_err("must fail");
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.display_message(), "1 of 2 sources failed validation");
    }
}
