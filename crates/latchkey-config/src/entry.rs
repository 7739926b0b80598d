//! Per-schema registry state guarded by the schema's reader/writer lock.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};
use tokio::sync::Mutex as AsyncMutex;

use crate::crypto::EncryptionContext;
use crate::error::{ConfigError, ConfigResult};
use crate::model::SerializationOptions;
use crate::reload::ReloadSubscription;
use crate::schema::{SchemaDescriptor, SchemaId};
use crate::source::JsonSource;
use crate::store::{SettingRecord, SettingStore, seed_document};
use crate::token::{Access, Role, TokenAuthority, TokenTriple};

/// Lock-protected slot for one schema identity.
#[derive(Default)]
pub(crate) struct SchemaSlot {
    state: RwLock<SlotState>,
}

/// Lifecycle of a slot. `Retired` slots have been detached from the registry
/// map and must not be reused.
#[derive(Default)]
pub(crate) enum SlotState {
    #[default]
    Vacant,
    Live(Box<ConfigEntry>),
    Retired,
}

impl SchemaSlot {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SlotState {
    pub(crate) fn live(&self, schema: SchemaId) -> ConfigResult<&ConfigEntry> {
        match self {
            Self::Live(entry) => Ok(entry),
            Self::Vacant | Self::Retired => Err(ConfigError::NotRegistered { schema }),
        }
    }

    pub(crate) fn live_mut(&mut self, schema: SchemaId) -> ConfigResult<&mut ConfigEntry> {
        match self {
            Self::Live(entry) => Ok(entry),
            Self::Vacant | Self::Retired => Err(ConfigError::NotRegistered { schema }),
        }
    }
}

/// Live registration of one schema.
pub(crate) struct ConfigEntry {
    pub(crate) tokens: TokenTriple,
    pub(crate) descriptor: Arc<SchemaDescriptor>,
    pub(crate) default_source: JsonSource,
    pub(crate) user_source: JsonSource,
    pub(crate) settings: SettingStore,
    pub(crate) context: EncryptionContext,
    pub(crate) serialization: SerializationOptions,
    pub(crate) reload: Option<ReloadSubscription>,
    /// Generation handed to the most recent save snapshot.
    pub(crate) generation: u64,
    /// Highest generation already written to disk.
    pub(crate) written: Arc<AsyncMutex<u64>>,
}

impl ConfigEntry {
    pub(crate) fn schema(&self) -> SchemaId {
        self.descriptor.id()
    }

    /// Check `access` against the recorded tokens for `role`.
    pub(crate) fn authorize(
        &self,
        authority: &dyn TokenAuthority,
        access: &Access,
        role: Role,
    ) -> ConfigResult<()> {
        authority
            .allow_access(
                self.tokens.owner,
                self.tokens.for_role(role),
                access.supplied_owner(),
                access.supplied_role(role),
            )
            .map_err(|denied| ConfigError::Unauthorized {
                schema: self.schema(),
                role,
                key: None,
                reason: denied.reason,
            })
    }

    pub(crate) fn record(&self, key: &str) -> ConfigResult<&SettingRecord> {
        self.settings
            .get(key)
            .ok_or_else(|| ConfigError::key_not_found(self.schema(), key))
    }

    /// Record for `key`, refusing records marked non-readable.
    pub(crate) fn readable_record(&self, key: &str) -> ConfigResult<&SettingRecord> {
        let record = self.record(key)?;
        if record.readable() {
            Ok(record)
        } else {
            Err(ConfigError::Unauthorized {
                schema: self.schema(),
                role: Role::Read,
                key: Some(key.to_string()),
                reason: "setting is not readable",
            })
        }
    }

    /// Mutable record for `key`, refusing records marked non-writable.
    pub(crate) fn writable_record(&mut self, key: &str) -> ConfigResult<&mut SettingRecord> {
        let schema = self.schema();
        let record = self
            .settings
            .get_mut(key)
            .ok_or_else(|| ConfigError::key_not_found(schema, key))?;
        if record.writable() {
            Ok(record)
        } else {
            Err(ConfigError::Unauthorized {
                schema,
                role: Role::Write,
                key: Some(key.to_string()),
                reason: "setting is not writable",
            })
        }
    }

    /// Everything a rebuild needs, detached from the lock.
    pub(crate) fn loader(&self) -> SourceLoader {
        SourceLoader::new(
            Arc::clone(&self.descriptor),
            self.default_source.clone(),
            self.user_source.clone(),
            self.context.clone(),
            self.serialization,
        )
    }

    /// Default and override documents plus their destinations. Each
    /// snapshot carries a fresh generation so older ones never overwrite it.
    pub(crate) fn snapshot(&mut self) -> SaveSnapshot {
        self.generation += 1;
        SaveSnapshot {
            schema: self.schema(),
            generation: self.generation,
            written: Arc::clone(&self.written),
            defaults: self.settings.defaults_document(),
            overrides: self.settings.overrides_document(),
            default_source: self.default_source.clone(),
            user_source: self.user_source.clone(),
            serialization: self.serialization,
        }
    }
}

/// Reads both sources and builds a fresh store outside any lock.
pub(crate) struct SourceLoader {
    descriptor: Arc<SchemaDescriptor>,
    default_source: JsonSource,
    user_source: JsonSource,
    context: EncryptionContext,
    serialization: SerializationOptions,
}

impl SourceLoader {
    pub(crate) fn new(
        descriptor: Arc<SchemaDescriptor>,
        default_source: JsonSource,
        user_source: JsonSource,
        context: EncryptionContext,
        serialization: SerializationOptions,
    ) -> Self {
        Self {
            descriptor,
            default_source,
            user_source,
            context,
            serialization,
        }
    }

    pub(crate) fn into_entry(self, tokens: TokenTriple, settings: SettingStore) -> ConfigEntry {
        ConfigEntry {
            tokens,
            descriptor: self.descriptor,
            default_source: self.default_source,
            user_source: self.user_source,
            settings,
            context: self.context,
            serialization: self.serialization,
            reload: None,
            generation: 0,
            written: Arc::new(AsyncMutex::new(0)),
        }
    }

    /// Create missing sources: the default source seeded with compiled
    /// defaults, the user source empty.
    pub(crate) fn ensure_sources(&self) -> ConfigResult<()> {
        self.default_source.ensure(self.serialization, || {
            seed_document(&self.descriptor, &self.context)
        })?;
        self.user_source
            .ensure(self.serialization, || Ok(Map::new()))?;
        Ok(())
    }

    pub(crate) fn load(&self) -> ConfigResult<SettingStore> {
        let defaults = self.default_source.load()?;
        let overrides = self.user_source.load()?;
        SettingStore::build(&self.descriptor, &defaults, &overrides, &self.context)
    }
}

/// Values captured under the lock for writing after it is released.
#[derive(Debug, Clone)]
pub(crate) struct SaveSnapshot {
    pub(crate) schema: SchemaId,
    pub(crate) generation: u64,
    pub(crate) written: Arc<AsyncMutex<u64>>,
    pub(crate) defaults: Map<String, Value>,
    pub(crate) overrides: Map<String, Value>,
    pub(crate) default_source: JsonSource,
    pub(crate) user_source: JsonSource,
    pub(crate) serialization: SerializationOptions,
}

impl SaveSnapshot {
    /// Write both documents. Each write is atomic on its own.
    pub(crate) fn write(&self) -> ConfigResult<()> {
        self.default_source
            .write_document(&self.defaults, self.serialization)?;
        self.user_source
            .write_document(&self.overrides, self.serialization)
    }
}
