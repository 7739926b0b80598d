//! Event payload types carried across the workspace.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Identifier assigned to each event emitted by the bus.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Persistence path that produced a save notification.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SaveOperation {
    /// Default and user value sets written back to their sources.
    Settings,
    /// A bound configuration instance applied and persisted.
    Instance,
    /// Raw default-source text replaced by migration tooling.
    DefaultSource,
}

impl SaveOperation {
    /// Stable label used in logs and event payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::Instance => "instance",
            Self::DefaultSource => "default_source",
        }
    }
}

/// Typed configuration events surfaced across the system.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A schema was registered and its sources loaded.
    ConfigRegistered {
        /// Schema identifier.
        schema: String,
    },
    /// A schema was removed from the registry.
    ConfigUnregistered {
        /// Schema identifier.
        schema: String,
    },
    /// The effective value of a setting changed through a write.
    SettingChanged {
        /// Schema identifier.
        schema: String,
        /// Setting name within the schema.
        key: String,
        /// Effective value before the write (redacted for secure settings).
        old: Value,
        /// Effective value after the write (redacted for secure settings).
        new: Value,
    },
    /// A schema was rebuilt from its on-disk sources.
    ConfigReloaded {
        /// Schema identifier.
        schema: String,
    },
    /// A save finished writing every source it touched.
    SaveCompleted {
        /// Schema identifier.
        schema: String,
        /// Save path that completed.
        operation: SaveOperation,
    },
    /// A save failed; in-memory state is unaffected.
    SaveFailed {
        /// Schema identifier.
        schema: String,
        /// Rendered error chain.
        error: String,
        /// Save path that failed.
        operation: SaveOperation,
    },
}

impl Event {
    /// Machine-friendly discriminator for subscribers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConfigRegistered { .. } => "config_registered",
            Self::ConfigUnregistered { .. } => "config_unregistered",
            Self::SettingChanged { .. } => "setting_changed",
            Self::ConfigReloaded { .. } => "config_reloaded",
            Self::SaveCompleted { .. } => "save_completed",
            Self::SaveFailed { .. } => "save_failed",
        }
    }

    /// Schema the event refers to.
    #[must_use]
    pub fn schema(&self) -> &str {
        match self {
            Self::ConfigRegistered { schema }
            | Self::ConfigUnregistered { schema }
            | Self::SettingChanged { schema, .. }
            | Self::ConfigReloaded { schema }
            | Self::SaveCompleted { schema, .. }
            | Self::SaveFailed { schema, .. } => schema,
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Sequential identifier assigned by the bus.
    pub id: EventId,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = Event::SettingChanged {
            schema: "editor".into(),
            key: "FieldA".into(),
            old: json!(50),
            new: json!(85),
        };
        let value = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(value["type"], "setting_changed");
        assert_eq!(value["old"], 50);

        let failed = Event::SaveFailed {
            schema: "editor".into(),
            error: "disk full".into(),
            operation: SaveOperation::Instance,
        };
        let value = serde_json::to_value(&failed).expect("serialize event");
        assert_eq!(value["operation"], "instance");
    }

    #[test]
    fn schema_accessor_covers_every_variant() {
        let events = [
            Event::ConfigRegistered { schema: "a".into() },
            Event::ConfigUnregistered { schema: "a".into() },
            Event::ConfigReloaded { schema: "a".into() },
            Event::SaveCompleted {
                schema: "a".into(),
                operation: SaveOperation::Settings,
            },
        ];
        assert!(events.iter().all(|event| event.schema() == "a"));
        let kinds: Vec<_> = events.iter().map(Event::kind).collect();
        assert_eq!(
            kinds,
            [
                "config_registered",
                "config_unregistered",
                "config_reloaded",
                "save_completed"
            ]
        );
        assert_eq!(SaveOperation::DefaultSource.as_str(), "default_source");
    }
}
