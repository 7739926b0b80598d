//! `latchkey inspect`: list the keys of a source file and their kinds.
//!
//! Object-form secure values are always recognised. Bare encoded strings
//! look like plain text, so they are only reported as secure when a master
//! key is supplied and the payload opens under the schema's context.

use latchkey_config::defaults::REDACTED;
use latchkey_config::source::SourceDocument;
use latchkey_config::store::parse_secure;
use latchkey_config::{
    EncryptionContext, EncryptionService, JsonSource, KeyedEncryptionService, ValueKind,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cli::{InspectArgs, OutputFormat};
use crate::commands::schema_id;
use crate::error::{CliError, CliResult};
use crate::output::render_inspect;

/// One key of an inspected document.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct InspectRow {
    pub(crate) key: String,
    pub(crate) kind: ValueKind,
    pub(crate) value: Value,
}

pub(crate) fn handle_inspect(args: &InspectArgs, format: OutputFormat) -> CliResult<()> {
    let document = JsonSource::new(&args.file)
        .load()
        .map_err(CliError::failure)?;
    let context = load_context(args)?;
    let rows = inspect_document(&document, context.as_ref());
    debug!(path = %args.file.display(), keys = rows.len(), "inspected source");
    render_inspect(&rows, format)
}

pub(crate) fn inspect_document(
    document: &SourceDocument,
    context: Option<&EncryptionContext>,
) -> Vec<InspectRow> {
    document
        .iter()
        .map(|(key, value)| {
            if is_sealed(value, context) {
                InspectRow {
                    key: key.clone(),
                    kind: ValueKind::Secure,
                    value: Value::String(REDACTED.to_string()),
                }
            } else {
                InspectRow {
                    key: key.clone(),
                    kind: ValueKind::of(value),
                    value: value.clone(),
                }
            }
        })
        .collect()
}

fn is_sealed(value: &Value, context: Option<&EncryptionContext>) -> bool {
    match (value, parse_secure(value)) {
        (Value::Object(_), Some(_)) => true,
        (Value::String(_), Some(payload)) => {
            context.is_some_and(|context| context.decrypt(&payload).is_ok())
        }
        _ => false,
    }
}

fn load_context(args: &InspectArgs) -> CliResult<Option<EncryptionContext>> {
    let Some(key_file) = &args.key_file else {
        return Ok(None);
    };
    if !key_file.is_file() {
        return Err(CliError::validation(format!(
            "key file {} does not exist",
            key_file.display()
        )));
    }
    let name = match &args.schema {
        Some(name) => name.clone(),
        None => args
            .file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_owned)
            .ok_or_else(|| CliError::validation("cannot derive a schema id; pass --schema"))?,
    };
    let service = KeyedEncryptionService::load_or_create(key_file).map_err(CliError::failure)?;
    service
        .encryption_context(schema_id(&name)?, &args.instance)
        .map(Some)
        .map_err(CliError::failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_config::{SchemaId, SecureValue};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;
    use zeroize::Zeroizing;

    const SCHEMA: SchemaId = SchemaId::new("editor");

    fn document(value: Value) -> SourceDocument {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn context() -> EncryptionContext {
        KeyedEncryptionService::new(Zeroizing::new([9; 32]))
            .encryption_context(SCHEMA, "default")
            .expect("context")
    }

    #[test]
    fn plain_values_report_their_kind() {
        let rows = inspect_document(
            &document(json!({"FieldA": 5, "Ratio": 0.5, "Tags": ["a"], "Label": "x", "Nothing": null})),
            None,
        );
        let kinds: Vec<_> = rows.iter().map(|row| (row.key.as_str(), row.kind)).collect();
        assert!(kinds.contains(&("FieldA", ValueKind::Integer)));
        assert!(kinds.contains(&("Ratio", ValueKind::Float)));
        assert!(kinds.contains(&("Tags", ValueKind::List)));
        assert!(kinds.contains(&("Label", ValueKind::Text)));
        assert!(kinds.contains(&("Nothing", ValueKind::Any)));
    }

    #[test]
    fn object_form_is_secure_without_a_key() {
        let rows = inspect_document(&document(json!({"ApiKey": {"EncryptedBase64": "AAAA"}})), None);
        assert_eq!(rows[0].kind, ValueKind::Secure);
        assert_eq!(rows[0].value, json!(REDACTED));
    }

    #[test]
    fn bare_payloads_need_the_matching_key() {
        let context = context();
        let sealed = SecureValue::seal("hunter2", &context).expect("seal");
        let bare = sealed.payload().expect("payload").as_str().to_owned();
        let source = document(json!({"ApiKey": bare, "Label": "plain"}));

        let with_key = inspect_document(&source, Some(&context));
        let secure: Vec<_> = with_key
            .iter()
            .filter(|row| row.kind == ValueKind::Secure)
            .map(|row| row.key.as_str())
            .collect();
        assert_eq!(secure, vec!["ApiKey"]);

        let without_key = inspect_document(&source, None);
        assert!(without_key.iter().all(|row| row.kind == ValueKind::Text));
    }

    #[test]
    fn missing_key_file_is_a_validation_error() {
        let dir = TempDir::new().expect("tempdir");
        let file = dir.path().join("editor.json");
        fs::write(&file, "{}").expect("write");
        let args = InspectArgs {
            file,
            key_file: Some(dir.path().join("absent.key")),
            schema: None,
            instance: "default".to_string(),
        };
        assert!(matches!(load_context(&args), Err(CliError::Validation(_))));
        assert!(!dir.path().join("absent.key").exists());
    }
}
