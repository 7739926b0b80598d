//! `latchkey defaults`: print a schema's default source as stored on disk.

use std::path::Path;

use latchkey_config::source::is_missing;
use latchkey_config::{JsonSource, RegistryConfig};

use crate::cli::DefaultsArgs;
use crate::error::{CliError, CliResult};

pub(crate) fn handle_defaults(args: &DefaultsArgs) -> CliResult<()> {
    let text = default_source_text(&args.root, &args.schema)?;
    if text.ends_with('\n') {
        print!("{text}");
    } else {
        println!("{text}");
    }
    Ok(())
}

pub(crate) fn default_source_text(root: &Path, schema: &str) -> CliResult<String> {
    let schema = schema.trim();
    if schema.is_empty() {
        return Err(CliError::validation("schema id must not be empty"));
    }
    let paths = RegistryConfig::new(root).source_paths(schema);
    JsonSource::new(&paths.default_source)
        .read_text()
        .map_err(|err| {
            if is_missing(&err) {
                CliError::validation(format!(
                    "no default source for `{schema}` at {}",
                    paths.default_source.display()
                ))
            } else {
                CliError::failure(err)
            }
        })
}
