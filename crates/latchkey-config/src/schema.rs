//! Compile-time schema descriptors and instance binding.
//!
//! A schema is a plain Rust struct paired with an explicit table of
//! `(name, kind, default)` entries. Binding between the struct and the
//! registry goes through [`SettingsReader`] and [`SettingsWriter`]; there is
//! no runtime introspection.

use std::fmt::{self, Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

use crate::crypto::SealedPayload;
use crate::error::{ConfigError, ConfigResult};
use crate::secure::SecureValue;
use crate::store::{SettingStore, StoredValue};
use crate::validate::{ValueKind, convert};

/// Stable identity of a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(&'static str);

impl SchemaId {
    /// Wrap a schema name. Names double as source file stems.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Schema name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }

    /// Identity of a schema type.
    #[must_use]
    pub const fn of<S: ConfigSchema>() -> Self {
        S::ID
    }
}

impl Display for SchemaId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.0)
    }
}

impl Serialize for SchemaId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0)
    }
}

/// Declaration of a single setting.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingSpec {
    /// Setting name as it appears in source files.
    pub name: &'static str,
    /// Declared value kind.
    pub kind: ValueKind,
    /// Compiled default. For secure settings this is the plaintext sealed at
    /// seeding time.
    pub default: Value,
    /// Whether reads are allowed.
    pub readable: bool,
    /// Whether writes are allowed.
    pub writable: bool,
}

impl SettingSpec {
    /// Whether the setting holds an encrypted payload.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.kind == ValueKind::Secure
    }
}

/// Ordered table of the settings a schema declares.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDescriptor {
    id: SchemaId,
    settings: Vec<SettingSpec>,
}

impl SchemaDescriptor {
    /// Start building a descriptor.
    #[must_use]
    pub const fn builder(id: SchemaId) -> SchemaDescriptorBuilder {
        SchemaDescriptorBuilder {
            id,
            settings: Vec::new(),
        }
    }

    /// Schema identity.
    #[must_use]
    pub const fn id(&self) -> SchemaId {
        self.id
    }

    /// Declared settings in declaration order.
    #[must_use]
    pub fn settings(&self) -> &[SettingSpec] {
        &self.settings
    }

    /// Look up a declared setting.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SettingSpec> {
        self.settings.iter().find(|spec| spec.name == name)
    }
}

/// Builder for [`SchemaDescriptor`]. Declaring a name twice replaces the
/// earlier declaration.
#[derive(Debug)]
pub struct SchemaDescriptorBuilder {
    id: SchemaId,
    settings: Vec<SettingSpec>,
}

impl SchemaDescriptorBuilder {
    /// Declare a plain setting; its kind is inferred from the default.
    #[must_use]
    pub fn setting(self, name: &'static str, default: impl Into<Value>) -> Self {
        let default = default.into();
        let kind = ValueKind::of(&default);
        self.push(SettingSpec {
            name,
            kind,
            default,
            readable: true,
            writable: true,
        })
    }

    /// Declare a setting with an explicit kind.
    #[must_use]
    pub fn typed(self, name: &'static str, kind: ValueKind, default: impl Into<Value>) -> Self {
        self.push(SettingSpec {
            name,
            kind,
            default: default.into(),
            readable: true,
            writable: true,
        })
    }

    /// Declare a secure setting with a plaintext default.
    #[must_use]
    pub fn secure(self, name: &'static str, plaintext_default: impl Into<Value>) -> Self {
        self.typed(name, ValueKind::Secure, plaintext_default)
    }

    /// Forbid writes to an already declared setting.
    #[must_use]
    pub fn read_only(mut self, name: &str) -> Self {
        if let Some(spec) = self.settings.iter_mut().find(|spec| spec.name == name) {
            spec.writable = false;
        }
        self
    }

    /// Forbid reads of an already declared setting.
    #[must_use]
    pub fn write_only(mut self, name: &str) -> Self {
        if let Some(spec) = self.settings.iter_mut().find(|spec| spec.name == name) {
            spec.readable = false;
        }
        self
    }

    /// Finish the descriptor.
    #[must_use]
    pub fn build(self) -> SchemaDescriptor {
        SchemaDescriptor {
            id: self.id,
            settings: self.settings,
        }
    }

    fn push(mut self, spec: SettingSpec) -> Self {
        if let Some(existing) = self.settings.iter_mut().find(|s| s.name == spec.name) {
            *existing = spec;
        } else {
            self.settings.push(spec);
        }
        self
    }
}

/// A structurally typed configuration schema.
pub trait ConfigSchema: Default + Send + Sync + 'static {
    /// Stable schema identity.
    const ID: SchemaId;

    /// Settings table for this schema.
    fn descriptor() -> SchemaDescriptor;

    /// Build an instance from effective values. Unconvertible fields keep
    /// their zero value.
    fn from_settings(reader: &SettingsReader<'_>) -> Self;

    /// Capture every field of the instance.
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be serialized.
    fn to_settings(&self, writer: &mut SettingsWriter) -> ConfigResult<()>;
}

/// Read-only view over effective values used to build instances.
pub struct SettingsReader<'a> {
    schema: SchemaId,
    store: &'a SettingStore,
}

impl<'a> SettingsReader<'a> {
    pub(crate) const fn new(schema: SchemaId, store: &'a SettingStore) -> Self {
        Self { schema, store }
    }

    /// Effective value of `name` converted to `T`, or `T::default()` when the
    /// setting is missing, unreadable, secure, or unconvertible.
    #[must_use]
    pub fn field<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let Some(record) = self.store.get(name) else {
            warn!(schema = %self.schema, key = name, "instance field has no declared setting");
            return T::default();
        };
        if !record.readable {
            return T::default();
        }
        match record.effective() {
            StoredValue::Plain(value) => convert(value).unwrap_or_else(|err| {
                warn!(
                    schema = %self.schema,
                    key = name,
                    target = std::any::type_name::<T>(),
                    error = %err,
                    "instance field could not be converted; using zero value"
                );
                T::default()
            }),
            StoredValue::Secure(_) => {
                warn!(schema = %self.schema, key = name, "secure setting bound to a plain field");
                T::default()
            }
        }
    }

    /// Secure setting wrapped without decrypting.
    #[must_use]
    pub fn secure(&self, name: &str) -> SecureValue {
        match self.store.get(name).filter(|record| record.readable) {
            Some(record) => match record.effective() {
                StoredValue::Secure(payload) => SecureValue::from_payload(payload.clone()),
                StoredValue::Plain(_) => {
                    warn!(schema = %self.schema, key = name, "plain setting bound to a secure field");
                    SecureValue::empty()
                }
            },
            None => SecureValue::empty(),
        }
    }
}

/// Collector for instance field values.
#[derive(Debug, Default)]
pub struct SettingsWriter {
    values: Vec<(String, StoredValue)>,
}

impl SettingsWriter {
    /// Empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture a plain field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialization`] if the value cannot be encoded.
    pub fn field<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> ConfigResult<()> {
        let encoded = serde_json::to_value(value)
            .map_err(|err| ConfigError::serialization("instance.encode", err))?;
        self.values.push((name.to_string(), StoredValue::Plain(encoded)));
        Ok(())
    }

    /// Capture a secure field. Empty values (never populated) are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Disposed`] if the value was disposed.
    pub fn secure(&mut self, name: &str, value: &SecureValue) -> ConfigResult<()> {
        let payload: &SealedPayload = value.payload()?;
        if !payload.is_empty() {
            self.values
                .push((name.to_string(), StoredValue::Secure(payload.clone())));
        }
        Ok(())
    }

    pub(crate) fn into_values(self) -> Vec<(String, StoredValue)> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ID: SchemaId = SchemaId::new("schema.tests");

    #[test]
    fn builder_infers_kinds_and_flags() {
        let descriptor = SchemaDescriptor::builder(ID)
            .setting("FieldA", 50)
            .setting("FieldB", false)
            .secure("ApiKey", "changeme")
            .setting("Label", "x")
            .read_only("Label")
            .write_only("ApiKey")
            .build();

        assert_eq!(descriptor.id(), ID);
        assert_eq!(descriptor.settings().len(), 4);
        assert_eq!(descriptor.get("FieldA").map(|s| s.kind), Some(ValueKind::Integer));
        let api = descriptor.get("ApiKey").expect("declared");
        assert!(api.is_secure());
        assert!(!api.readable);
        assert!(!descriptor.get("Label").expect("declared").writable);
        assert!(descriptor.get("Missing").is_none());
    }

    #[test]
    fn redeclaring_replaces_the_setting() {
        let descriptor = SchemaDescriptor::builder(ID)
            .setting("FieldA", 1)
            .setting("FieldA", "one")
            .build();
        assert_eq!(descriptor.settings().len(), 1);
        assert_eq!(descriptor.settings()[0].default, json!("one"));
    }

    #[test]
    fn writer_skips_empty_secure_values() -> ConfigResult<()> {
        let mut writer = SettingsWriter::new();
        writer.field("FieldA", &7)?;
        writer.secure("ApiKey", &SecureValue::empty())?;
        let values = writer.into_values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].1, StoredValue::Plain(json!(7)));

        let mut disposed = SecureValue::empty();
        disposed.dispose();
        assert!(matches!(
            SettingsWriter::new().secure("ApiKey", &disposed),
            Err(ConfigError::Disposed)
        ));
        Ok(())
    }
}
