//! Command handlers, one module per subcommand.

pub(crate) mod check;
pub(crate) mod defaults;
pub(crate) mod inspect;
pub(crate) mod seal;

use latchkey_config::SchemaId;

use crate::error::{CliError, CliResult};

/// Schema ids borrow `'static` names; each invocation leaks at most one.
pub(crate) fn schema_id(name: &str) -> CliResult<SchemaId> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CliError::validation("schema id must not be empty"));
    }
    Ok(SchemaId::new(Box::leak(trimmed.to_owned().into_boxed_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_ids_are_trimmed_and_must_not_be_blank() {
        assert_eq!(schema_id(" editor ").expect("id").as_str(), "editor");
        assert!(matches!(schema_id("  "), Err(CliError::Validation(_))));
    }
}
