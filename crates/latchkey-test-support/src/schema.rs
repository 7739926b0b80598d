//! Sample schema shared by integration suites.

use latchkey_config::{
    ConfigResult, ConfigSchema, SchemaDescriptor, SchemaId, SecureValue, SettingsReader,
    SettingsWriter,
};
use serde_json::json;

/// Default of `FieldA`.
pub const FIELD_A_DEFAULT: i64 = 50;

/// Plaintext default of the secure `ApiKey` setting.
pub const API_KEY_DEFAULT: &str = "changeme";

/// Settings used by the registry scenarios.
#[derive(Debug, Clone, Default)]
pub struct SampleSettings {
    /// `FieldA`, integer.
    pub field_a: i64,
    /// `FieldB`, boolean.
    pub field_b: bool,
    /// `Label`, text.
    pub label: String,
    /// `Tags`, list of text.
    pub tags: Vec<String>,
    /// `ApiKey`, encrypted.
    pub api_key: SecureValue,
    /// `BuildId`, read-only.
    pub build_id: String,
}

impl ConfigSchema for SampleSettings {
    const ID: SchemaId = SchemaId::new("sample");

    fn descriptor() -> SchemaDescriptor {
        SchemaDescriptor::builder(Self::ID)
            .setting("FieldA", FIELD_A_DEFAULT)
            .setting("FieldB", false)
            .setting("Label", "untitled")
            .setting("Tags", json!(["alpha"]))
            .secure("ApiKey", API_KEY_DEFAULT)
            .setting("BuildId", "dev")
            .read_only("BuildId")
            .build()
    }

    fn from_settings(reader: &SettingsReader<'_>) -> Self {
        Self {
            field_a: reader.field("FieldA"),
            field_b: reader.field("FieldB"),
            label: reader.field("Label"),
            tags: reader.field("Tags"),
            api_key: reader.secure("ApiKey"),
            build_id: reader.field("BuildId"),
        }
    }

    fn to_settings(&self, writer: &mut SettingsWriter) -> ConfigResult<()> {
        writer.field("FieldA", &self.field_a)?;
        writer.field("FieldB", &self.field_b)?;
        writer.field("Label", &self.label)?;
        writer.field("Tags", &self.tags)?;
        writer.secure("ApiKey", &self.api_key)?;
        writer.field("BuildId", &self.build_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_config::ValueKind;

    #[test]
    fn descriptor_declares_every_field() {
        let descriptor = SampleSettings::descriptor();
        assert_eq!(descriptor.id(), SampleSettings::ID);
        assert_eq!(descriptor.settings().len(), 6);
        assert_eq!(descriptor.get("FieldA").map(|spec| spec.kind), Some(ValueKind::Integer));
        assert!(descriptor.get("ApiKey").is_some_and(|spec| spec.is_secure()));
        assert!(descriptor.get("BuildId").is_some_and(|spec| !spec.writable));
    }
}
