//! `latchkey seal`: encrypt a value so it can be pasted into a source file.

use latchkey_config::defaults::ENCRYPTED_FIELD;
use latchkey_config::{EncryptionService, KeyedEncryptionService, SchemaId, SecureValue};
use serde_json::{Map, Value};
use tracing::info;

use crate::cli::SealArgs;
use crate::commands::schema_id;
use crate::error::{CliError, CliResult};

pub(crate) fn handle_seal(args: &SealArgs) -> CliResult<()> {
    let plain = if args.json {
        serde_json::from_str(&args.value)
            .map_err(|err| CliError::validation(format!("value is not valid JSON: {err}")))?
    } else {
        Value::String(args.value.clone())
    };
    let schema = schema_id(&args.schema)?;
    let service = KeyedEncryptionService::load_or_create(&args.key_file).map_err(CliError::failure)?;
    let sealed = seal_value(&service, schema, &args.instance, &plain, args.bare)?;
    info!(schema = %schema, instance = %args.instance, "sealed value");
    let text = serde_json::to_string(&sealed).map_err(CliError::failure)?;
    println!("{text}");
    Ok(())
}

/// Seal `plain` for `schema`/`instance`, in bare or object form.
pub(crate) fn seal_value(
    service: &dyn EncryptionService,
    schema: SchemaId,
    instance: &str,
    plain: &Value,
    bare: bool,
) -> CliResult<Value> {
    let context = service
        .encryption_context(schema, instance)
        .map_err(CliError::failure)?;
    let sealed = SecureValue::seal(plain, &context).map_err(CliError::failure)?;
    let encoded = Value::String(sealed.payload().map_err(CliError::failure)?.as_str().to_owned());
    if bare {
        return Ok(encoded);
    }
    let mut wrapper = Map::new();
    wrapper.insert(ENCRYPTED_FIELD.to_string(), encoded);
    Ok(Value::Object(wrapper))
}
