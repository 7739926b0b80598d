//! Per-schema setting records and the layering rules that build them.
//!
//! Precedence for every declared setting: user source, then default source,
//! then the compiled default. A user value equal to the default collapses to
//! "no override". For secure settings equality is decided on plaintext, so
//! the store briefly decrypts both payloads through
//! `SecureValue::same_plaintext`; nothing decrypted is retained.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

use crate::crypto::{EncryptionContext, SealedPayload};
use crate::defaults::{ENCRYPTED_FIELD, REDACTED};
use crate::error::{ConfigError, ConfigResult};
use crate::schema::{SchemaDescriptor, SchemaId, SettingSpec};
use crate::secure::SecureValue;
use crate::validate::ValueKind;

/// Value held by a record: plain JSON or an encrypted payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// Plain JSON value.
    Plain(Value),
    /// Encrypted payload; decrypted by the store only to compare with the
    /// default.
    Secure(SealedPayload),
}

impl StoredValue {
    /// Representation written to source files.
    #[must_use]
    pub fn to_source(&self) -> Value {
        match self {
            Self::Plain(value) => value.clone(),
            Self::Secure(payload) => {
                let mut wrapper = Map::new();
                wrapper.insert(
                    ENCRYPTED_FIELD.to_string(),
                    Value::String(payload.as_str().to_string()),
                );
                Value::Object(wrapper)
            }
        }
    }

    /// Representation safe to broadcast in events.
    #[must_use]
    pub fn redacted(&self) -> Value {
        match self {
            Self::Plain(value) => value.clone(),
            Self::Secure(_) => Value::String(REDACTED.to_string()),
        }
    }

    fn equivalent(&self, other: &Self, context: &EncryptionContext) -> bool {
        match (self, other) {
            (Self::Plain(left), Self::Plain(right)) => left == right,
            (Self::Secure(left), Self::Secure(right)) => {
                SecureValue::same_plaintext(left, right, context)
            }
            _ => false,
        }
    }
}

/// Parse a secure source value in either accepted form: a bare encoded
/// string or `{"EncryptedBase64": "<string>"}`.
#[must_use]
pub fn parse_secure(value: &Value) -> Option<SealedPayload> {
    match value {
        Value::String(encoded) => Some(SealedPayload::new(encoded.clone())),
        Value::Object(map) => map
            .get(ENCRYPTED_FIELD)
            .and_then(Value::as_str)
            .map(SealedPayload::new),
        _ => None,
    }
}

/// One declared setting with its layered values.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingRecord {
    pub(crate) kind: ValueKind,
    pub(crate) default: StoredValue,
    pub(crate) user: Option<StoredValue>,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

impl SettingRecord {
    /// Declared kind.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Whether the record holds an encrypted payload.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.kind == ValueKind::Secure
    }

    /// Default value (default source, else compiled default).
    #[must_use]
    pub const fn default_value(&self) -> &StoredValue {
        &self.default
    }

    /// User override, if any.
    #[must_use]
    pub const fn user_value(&self) -> Option<&StoredValue> {
        self.user.as_ref()
    }

    /// User override if present, else the default.
    #[must_use]
    pub fn effective(&self) -> &StoredValue {
        self.user.as_ref().unwrap_or(&self.default)
    }

    /// Whether reads are allowed.
    #[must_use]
    pub const fn readable(&self) -> bool {
        self.readable
    }

    /// Whether writes are allowed.
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.writable
    }

    /// Store `value` as the user override, collapsing it to "no override"
    /// when it matches the default. Returns `true` when collapsed.
    pub(crate) fn assign(&mut self, value: StoredValue, context: &EncryptionContext) -> bool {
        let is_default = value.equivalent(&self.default, context);
        self.user = if is_default { None } else { Some(value) };
        is_default
    }

    pub(crate) fn clear_override(&mut self) {
        self.user = None;
    }
}

/// Map from setting name to record for one schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingStore {
    records: BTreeMap<String, SettingRecord>,
}

impl SettingStore {
    /// Build the store from parsed default and user documents.
    ///
    /// Values that do not fit the declared kind are logged and ignored, so
    /// the next layer down applies.
    ///
    /// # Errors
    ///
    /// Returns an error if a compiled secure default cannot be sealed.
    pub fn build(
        descriptor: &SchemaDescriptor,
        default_doc: &Map<String, Value>,
        user_doc: &Map<String, Value>,
        context: &EncryptionContext,
    ) -> ConfigResult<Self> {
        let schema = descriptor.id();
        let mut records = BTreeMap::new();
        for spec in descriptor.settings() {
            let default = match read_layer(schema, spec, default_doc.get(spec.name), "default") {
                Some(value) => value,
                None => compiled_default(spec, context)?,
            };
            let user = read_layer(schema, spec, user_doc.get(spec.name), "user")
                .filter(|value| !value.equivalent(&default, context));
            records.insert(
                spec.name.to_string(),
                SettingRecord {
                    kind: spec.kind,
                    default,
                    user,
                    readable: spec.readable,
                    writable: spec.writable,
                },
            );
        }
        Ok(Self { records })
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingRecord> {
        self.records.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut SettingRecord> {
        self.records.get_mut(key)
    }

    /// Declared setting names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Full default-value set as a source document.
    #[must_use]
    pub fn defaults_document(&self) -> Map<String, Value> {
        self.records
            .iter()
            .map(|(key, record)| (key.clone(), record.default.to_source()))
            .collect()
    }

    /// Non-empty user overrides as a source document.
    #[must_use]
    pub fn overrides_document(&self) -> Map<String, Value> {
        self.records
            .iter()
            .filter_map(|(key, record)| {
                record
                    .user
                    .as_ref()
                    .map(|value| (key.clone(), value.to_source()))
            })
            .collect()
    }
}

/// Compiled defaults as a source document, sealing secure settings.
///
/// # Errors
///
/// Returns an error if a secure default cannot be serialized or sealed.
pub fn seed_document(
    descriptor: &SchemaDescriptor,
    context: &EncryptionContext,
) -> ConfigResult<Map<String, Value>> {
    descriptor
        .settings()
        .iter()
        .map(|spec| Ok((spec.name.to_string(), compiled_default(spec, context)?.to_source())))
        .collect()
}

fn compiled_default(spec: &SettingSpec, context: &EncryptionContext) -> ConfigResult<StoredValue> {
    if !spec.is_secure() {
        return Ok(StoredValue::Plain(spec.default.clone()));
    }
    let plaintext = serde_json::to_vec(&spec.default)
        .map_err(|err| ConfigError::serialization("secure.seed", err))?;
    context.encrypt(&plaintext).map(StoredValue::Secure)
}

fn read_layer(
    schema: SchemaId,
    spec: &SettingSpec,
    raw: Option<&Value>,
    layer: &'static str,
) -> Option<StoredValue> {
    let raw = raw?;
    let parsed = if spec.is_secure() {
        parse_secure(raw).map(StoredValue::Secure)
    } else {
        spec.kind.coerce(raw.clone()).map(StoredValue::Plain)
    };
    if parsed.is_none() {
        warn!(
            schema = %schema,
            key = spec.name,
            layer,
            "source value does not match the declared kind; ignoring"
        );
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionService, KeyedEncryptionService};
    use serde_json::json;
    use zeroize::Zeroizing;

    const ID: SchemaId = SchemaId::new("store.tests");

    fn context() -> EncryptionContext {
        KeyedEncryptionService::new(Zeroizing::new([5; 32]))
            .encryption_context(ID, "default")
            .expect("context")
    }

    fn descriptor() -> SchemaDescriptor {
        SchemaDescriptor::builder(ID)
            .setting("FieldA", 50)
            .setting("FieldB", false)
            .secure("ApiKey", "changeme")
            .build()
    }

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn layers_apply_in_precedence_order() -> ConfigResult<()> {
        let ctx = context();
        let store = SettingStore::build(
            &descriptor(),
            &as_map(json!({"FieldA": 80})),
            &as_map(json!({"FieldB": true})),
            &ctx,
        )?;
        let field_a = store.get("FieldA").expect("declared");
        assert_eq!(field_a.effective(), &StoredValue::Plain(json!(80)));
        assert!(field_a.user_value().is_none());
        let field_b = store.get("FieldB").expect("declared");
        assert_eq!(field_b.effective(), &StoredValue::Plain(json!(true)));
        assert_eq!(field_b.default_value(), &StoredValue::Plain(json!(false)));
        Ok(())
    }

    #[test]
    fn user_values_equal_to_default_collapse() -> ConfigResult<()> {
        let ctx = context();
        let mut store = SettingStore::build(
            &descriptor(),
            &Map::new(),
            &as_map(json!({"FieldA": 50})),
            &ctx,
        )?;
        assert!(store.overrides_document().is_empty());

        let record = store.get_mut("FieldA").expect("declared");
        assert!(!record.assign(StoredValue::Plain(json!(85)), &ctx));
        assert_eq!(record.effective(), &StoredValue::Plain(json!(85)));
        assert!(record.assign(StoredValue::Plain(json!(50)), &ctx));
        assert!(record.user_value().is_none());
        Ok(())
    }

    #[test]
    fn secure_values_accept_both_source_forms() -> ConfigResult<()> {
        let ctx = context();
        let sealed = ctx.encrypt(b"\"token\"")?;
        let bare = SettingStore::build(
            &descriptor(),
            &as_map(json!({"ApiKey": sealed.as_str()})),
            &Map::new(),
            &ctx,
        )?;
        let wrapped = SettingStore::build(
            &descriptor(),
            &as_map(json!({"ApiKey": {"EncryptedBase64": sealed.as_str()}})),
            &Map::new(),
            &ctx,
        )?;
        assert_eq!(
            bare.get("ApiKey").map(SettingRecord::effective),
            Some(&StoredValue::Secure(sealed.clone()))
        );
        assert_eq!(bare.get("ApiKey"), wrapped.get("ApiKey"));
        assert_eq!(
            bare.defaults_document().get("ApiKey"),
            Some(&json!({"EncryptedBase64": sealed.as_str()}))
        );
        Ok(())
    }

    #[test]
    fn secure_override_with_same_plaintext_collapses() -> ConfigResult<()> {
        let ctx = context();
        let mut store = SettingStore::build(&descriptor(), &Map::new(), &Map::new(), &ctx)?;
        let resealed = ctx.encrypt(b"\"changeme\"")?;
        let record = store.get_mut("ApiKey").expect("declared");
        assert!(record.assign(StoredValue::Secure(resealed), &ctx));
        assert_eq!(record.effective().redacted(), json!(REDACTED));
        Ok(())
    }

    #[test]
    fn mismatched_source_values_fall_through() -> ConfigResult<()> {
        let ctx = context();
        let store = SettingStore::build(
            &descriptor(),
            &as_map(json!({"FieldA": [1, 2], "Unknown": 1})),
            &as_map(json!({"FieldB": {"nested": true}})),
            &ctx,
        )?;
        assert_eq!(
            store.get("FieldA").map(SettingRecord::effective),
            Some(&StoredValue::Plain(json!(50)))
        );
        assert_eq!(
            store.get("FieldB").map(SettingRecord::effective),
            Some(&StoredValue::Plain(json!(false)))
        );
        assert_eq!(store.len(), 3);
        assert!(store.get("Unknown").is_none());
        Ok(())
    }

    #[test]
    fn seed_document_seals_secure_defaults() -> ConfigResult<()> {
        let ctx = context();
        let seeded = seed_document(&descriptor(), &ctx)?;
        assert_eq!(seeded.get("FieldA"), Some(&json!(50)));
        let sealed = seeded
            .get("ApiKey")
            .and_then(parse_secure)
            .expect("sealed default");
        assert_eq!(ctx.decrypt(&sealed)?.as_slice(), b"\"changeme\"");
        Ok(())
    }
}
