//! Token-gated configuration registry.
//!
//! # Design
//! - `ConfigRegistry` is a cheaply cloneable handle; all clones share one
//!   registry. There is no process-wide instance.
//! - Every schema owns one reader/writer lock (`SchemaSlot`). Lookups take
//!   the shared lock, mutations the exclusive lock. Operations on different
//!   schemas never contend.
//! - The registry map is only held briefly to find or detach a slot. A slot
//!   lock may be held while taking the map lock, never the reverse.
//! - Events and disk writes happen after the slot lock is released.
//! - Reload rebuilds the whole store from disk, so writes that were not yet
//!   saved are discarded when a source changes.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use latchkey_events::{Event, EventBus, EventStream, SaveOperation};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::crypto::{EncryptionContext, EncryptionService, KeyedEncryptionService};
use crate::entry::{ConfigEntry, SaveSnapshot, SchemaSlot, SlotState, SourceLoader};
use crate::error::{ConfigError, ConfigResult};
use crate::model::{RegisterOptions, RegistryConfig};
use crate::reload::{ReloadCallback, ReloadSubscription};
use crate::schema::{ConfigSchema, SchemaDescriptor, SchemaId, SettingsReader, SettingsWriter};
use crate::secure::SecureValue;
use crate::source::{JsonSource, is_missing, parse_document};
use crate::store::StoredValue;
use crate::token::{Access, CapabilityAuthority, Role, TokenAuthority, TokenTriple};
use crate::validate::convert;

/// Registry binding schemas to their layered sources.
#[derive(Clone)]
pub struct ConfigRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    authority: Arc<dyn TokenAuthority>,
    encryption: Arc<dyn EncryptionService>,
    events: EventBus,
    slots: Mutex<HashMap<SchemaId, Arc<SchemaSlot>>>,
    shut_down: AtomicBool,
}

/// Builder for [`ConfigRegistry`].
pub struct ConfigRegistryBuilder {
    config: RegistryConfig,
    authority: Option<Arc<dyn TokenAuthority>>,
    encryption: Option<Arc<dyn EncryptionService>>,
    events: Option<EventBus>,
}

impl ConfigRegistryBuilder {
    /// Replace the registry settings wholesale.
    #[must_use]
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the reload debounce window.
    #[must_use]
    pub fn debounce(mut self, debounce: std::time::Duration) -> Self {
        self.config.debounce = debounce;
        self
    }

    /// Use a custom token authority.
    #[must_use]
    pub fn authority(mut self, authority: Arc<dyn TokenAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Use a custom encryption service.
    #[must_use]
    pub fn encryption(mut self, encryption: Arc<dyn EncryptionService>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Publish to an existing event bus.
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the registry. Without an explicit encryption service a random
    /// in-memory master key is used, so secure values sealed by this
    /// registry cannot be opened after the process exits.
    #[must_use]
    pub fn build(self) -> ConfigRegistry {
        let encryption = self.encryption.unwrap_or_else(|| {
            debug!("no encryption service configured; using an ephemeral master key");
            Arc::new(KeyedEncryptionService::ephemeral())
        });
        ConfigRegistry::new(
            self.config,
            self.authority.unwrap_or_else(|| Arc::new(CapabilityAuthority)),
            encryption,
            self.events.unwrap_or_default(),
        )
    }
}

impl ConfigRegistry {
    /// Construct a registry from explicit collaborators.
    #[must_use]
    pub fn new(
        config: RegistryConfig,
        authority: Arc<dyn TokenAuthority>,
        encryption: Arc<dyn EncryptionService>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                authority,
                encryption,
                events,
                slots: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Start building a registry rooted at `root`.
    #[must_use]
    pub fn builder(root: impl Into<std::path::PathBuf>) -> ConfigRegistryBuilder {
        ConfigRegistryBuilder {
            config: RegistryConfig::new(root),
            authority: None,
            encryption: None,
            events: None,
        }
    }

    /// Registry settings.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Bus receiving registry events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribe to registry events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Register a typed schema.
    ///
    /// # Errors
    ///
    /// See [`ConfigRegistry::register_descriptor`]. Additionally fails with
    /// [`ConfigError::InvalidArgument`] when the descriptor does not carry
    /// `S::ID`.
    pub fn register<S: ConfigSchema>(&self, options: RegisterOptions) -> ConfigResult<TokenTriple> {
        let descriptor = S::descriptor();
        if descriptor.id() != S::ID {
            return Err(ConfigError::invalid(
                "descriptor.id",
                "descriptor does not match the schema identity",
                Some(descriptor.id().to_string()),
            ));
        }
        self.register_descriptor(descriptor, options)
    }

    /// Register a schema from its descriptor, creating and loading both
    /// sources. Missing tokens are minted; the full triple is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AlreadyRegistered`] for a live schema,
    /// [`ConfigError::MalformedSource`] if an existing source cannot be
    /// parsed, and IO, encryption or watch errors from setup.
    #[instrument(name = "config_registry.register", skip(self, descriptor, options), fields(schema = %descriptor.id()))]
    pub fn register_descriptor(
        &self,
        descriptor: SchemaDescriptor,
        options: RegisterOptions,
    ) -> ConfigResult<TokenTriple> {
        let schema = descriptor.id();
        let inner = &self.inner;
        let tokens = inner
            .authority
            .create_token_triple(options.owner, options.read, options.write);
        let paths = options
            .sources
            .clone()
            .unwrap_or_else(|| inner.config.source_paths(schema.as_str()));
        let context = inner
            .encryption
            .encryption_context(schema, &options.instance_id)?;

        loop {
            let slot = inner.claim_slot(schema)?;
            let mut state = slot.write();
            match &*state {
                SlotState::Live(_) => return Err(ConfigError::AlreadyRegistered { schema }),
                SlotState::Retired => continue,
                SlotState::Vacant => {}
            }

            let loader = SourceLoader::new(
                Arc::new(descriptor),
                JsonSource::new(&paths.default_source),
                JsonSource::new(&paths.user_source),
                context,
                options.serialization,
            );
            match self.build_entry(loader, tokens, options.reload_enabled) {
                Ok(entry) => *state = SlotState::Live(Box::new(entry)),
                Err(err) => {
                    *state = SlotState::Retired;
                    inner.detach(schema, &slot);
                    return Err(err);
                }
            }
            drop(state);

            info!(schema = %schema, reload = options.reload_enabled, "configuration schema registered");
            inner.events.send(Event::ConfigRegistered {
                schema: schema.to_string(),
            });
            return Ok(tokens);
        }
    }

    fn build_entry(
        &self,
        loader: SourceLoader,
        tokens: TokenTriple,
        reload_enabled: bool,
    ) -> ConfigResult<ConfigEntry> {
        loader.ensure_sources()?;
        let settings = loader.load()?;
        let mut entry = loader.into_entry(tokens, settings);
        if reload_enabled {
            let schema = entry.schema();
            let sources = [entry.default_source.path(), entry.user_source.path()];
            entry.reload = Some(ReloadSubscription::start(
                schema,
                &sources,
                self.inner.config.debounce,
                reload_callback(Arc::downgrade(&self.inner), schema),
            )?);
        }
        Ok(entry)
    }

    /// Remove a schema. Requires the owner role.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotRegistered`] or [`ConfigError::Unauthorized`].
    #[instrument(name = "config_registry.unregister", skip(self, access))]
    pub fn unregister(&self, schema: SchemaId, access: &Access) -> ConfigResult<()> {
        let slot = self.inner.slot(schema)?;
        let mut state = slot.write();
        let entry = state.live(schema)?;
        entry.authorize(self.inner.authority.as_ref(), access, Role::Owner)?;
        let watched = entry.reload.is_some();
        let retired = mem::replace(&mut *state, SlotState::Retired);
        self.inner.detach(schema, &slot);
        drop(state);
        drop(retired);

        info!(schema = %schema, watched, "configuration schema unregistered");
        self.inner.events.send(Event::ConfigUnregistered {
            schema: schema.to_string(),
        });
        Ok(())
    }

    /// Whether `schema` has a live registration.
    #[must_use]
    pub fn is_registered(&self, schema: SchemaId) -> bool {
        self.inner
            .slot(schema)
            .is_ok_and(|slot| matches!(&*slot.read(), SlotState::Live(_)))
    }

    /// Effective value of `key` converted to `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotRegistered`], [`ConfigError::Unauthorized`],
    /// [`ConfigError::KeyNotFound`], [`ConfigError::SecureTypeMismatch`] for
    /// secure records, and [`ConfigError::ConversionFailed`] when the value
    /// does not convert.
    pub fn get_setting<T: DeserializeOwned>(
        &self,
        schema: SchemaId,
        key: &str,
        access: &Access,
    ) -> ConfigResult<T> {
        self.with_entry(schema, Role::Read, access, |entry| {
            let record = entry.readable_record(key)?;
            plain_value(schema, key, record.effective())
        })
    }

    /// Like [`ConfigRegistry::get_setting`], but a value that does not
    /// convert yields `T::default()` instead of an error.
    ///
    /// # Errors
    ///
    /// Returns every error of [`ConfigRegistry::get_setting`] except
    /// [`ConfigError::ConversionFailed`].
    pub fn get_setting_or_default<T: DeserializeOwned + Default>(
        &self,
        schema: SchemaId,
        key: &str,
        access: &Access,
    ) -> ConfigResult<T> {
        match self.get_setting(schema, key, access) {
            Err(ConfigError::ConversionFailed { target, source, .. }) => {
                warn!(
                    schema = %schema,
                    key,
                    target,
                    error = %source,
                    "setting could not be converted; using zero value"
                );
                Ok(T::default())
            }
            other => other,
        }
    }

    /// Default value of `key`, ignoring any user override.
    ///
    /// # Errors
    ///
    /// Same as [`ConfigRegistry::get_setting`].
    pub fn get_default<T: DeserializeOwned>(
        &self,
        schema: SchemaId,
        key: &str,
        access: &Access,
    ) -> ConfigResult<T> {
        self.with_entry(schema, Role::Read, access, |entry| {
            let record = entry.readable_record(key)?;
            plain_value(schema, key, record.default_value())
        })
    }

    /// Secure setting wrapped without decrypting.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SecureTypeMismatch`] when `key` is a plain
    /// setting, plus the lookup errors of [`ConfigRegistry::get_setting`].
    pub fn get_secure(
        &self,
        schema: SchemaId,
        key: &str,
        access: &Access,
    ) -> ConfigResult<SecureValue> {
        self.with_entry(schema, Role::Read, access, |entry| {
            match entry.readable_record(key)?.effective() {
                StoredValue::Secure(payload) => Ok(SecureValue::from_payload(payload.clone())),
                StoredValue::Plain(_) => Err(ConfigError::SecureTypeMismatch {
                    schema,
                    key: key.to_string(),
                    secure: false,
                }),
            }
        })
    }

    /// Set the user override of a plain setting. A value equal to the
    /// default clears the override. Publishes `SettingChanged`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] when the value does not fit
    /// the declared kind, [`ConfigError::SecureTypeMismatch`] for secure
    /// records, and the lookup and authorization errors.
    pub fn set_setting<T: Serialize + ?Sized>(
        &self,
        schema: SchemaId,
        key: &str,
        value: &T,
        access: &Access,
    ) -> ConfigResult<()> {
        let encoded = serde_json::to_value(value)
            .map_err(|err| ConfigError::serialization("setting.encode", err))?;
        let (old, new) = self.with_entry_mut(schema, Role::Write, access, |entry| {
            let context = entry.context.clone();
            let record = entry.writable_record(key)?;
            if record.is_secure() {
                return Err(ConfigError::SecureTypeMismatch {
                    schema,
                    key: key.to_string(),
                    secure: true,
                });
            }
            let coerced = record.kind().coerce(encoded.clone()).ok_or_else(|| {
                ConfigError::invalid(
                    key,
                    "value does not match the declared kind",
                    Some(encoded.to_string()),
                )
            })?;
            let old = record.effective().redacted();
            record.assign(StoredValue::Plain(coerced), &context);
            Ok((old, record.effective().redacted()))
        })?;
        self.publish_change(schema, key, old, new);
        Ok(())
    }

    /// Set the user override of a secure setting.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Disposed`] for a disposed value,
    /// [`ConfigError::InvalidArgument`] for an empty one, and
    /// [`ConfigError::SecureTypeMismatch`] when `key` is a plain setting.
    pub fn set_secure(
        &self,
        schema: SchemaId,
        key: &str,
        value: &SecureValue,
        access: &Access,
    ) -> ConfigResult<()> {
        let payload = value.payload()?.clone();
        if payload.is_empty() {
            return Err(ConfigError::invalid(key, "secure value is empty", None));
        }
        let (old, new) = self.with_entry_mut(schema, Role::Write, access, |entry| {
            let context = entry.context.clone();
            let record = entry.writable_record(key)?;
            if !record.is_secure() {
                return Err(ConfigError::SecureTypeMismatch {
                    schema,
                    key: key.to_string(),
                    secure: false,
                });
            }
            let old = record.effective().redacted();
            record.assign(StoredValue::Secure(payload), &context);
            Ok((old, record.effective().redacted()))
        })?;
        self.publish_change(schema, key, old, new);
        Ok(())
    }

    /// Drop the user override of `key`.
    ///
    /// # Errors
    ///
    /// Returns the lookup and authorization errors of
    /// [`ConfigRegistry::set_setting`].
    pub fn reset_setting(&self, schema: SchemaId, key: &str, access: &Access) -> ConfigResult<()> {
        let change = self.with_entry_mut(schema, Role::Write, access, |entry| {
            let record = entry.writable_record(key)?;
            if record.user_value().is_none() {
                return Ok(None);
            }
            let old = record.effective().redacted();
            record.clear_override();
            Ok(Some((old, record.effective().redacted())))
        })?;
        if let Some((old, new)) = change {
            self.publish_change(schema, key, old, new);
        }
        Ok(())
    }

    /// Seal `plain` with the schema's encryption context. Requires the
    /// write role.
    ///
    /// # Errors
    ///
    /// Returns serialization or encryption errors plus the lookup and
    /// authorization errors.
    pub fn seal_value<T: Serialize + ?Sized>(
        &self,
        schema: SchemaId,
        plain: &T,
        access: &Access,
    ) -> ConfigResult<SecureValue> {
        let context = self.with_entry(schema, Role::Write, access, |entry| Ok(entry.context.clone()))?;
        SecureValue::seal(plain, &context)
    }

    /// Encryption context for revealing the schema's secure values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotRegistered`] or [`ConfigError::Unauthorized`].
    pub fn encryption_context(
        &self,
        schema: SchemaId,
        access: &Access,
    ) -> ConfigResult<EncryptionContext> {
        self.with_entry(schema, Role::Read, access, |entry| Ok(entry.context.clone()))
    }

    /// Declared setting names in sorted order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotRegistered`] or [`ConfigError::Unauthorized`].
    pub fn setting_keys(&self, schema: SchemaId, access: &Access) -> ConfigResult<Vec<String>> {
        self.with_entry(schema, Role::Read, access, |entry| {
            Ok(entry.settings.keys().map(str::to_string).collect())
        })
    }

    /// Build a fresh instance of `S` from the effective values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotRegistered`] or [`ConfigError::Unauthorized`].
    /// Fields that do not convert are logged and left at their default.
    pub fn get_config_instance<S: ConfigSchema>(&self, access: &Access) -> ConfigResult<S> {
        self.with_entry(S::ID, Role::Read, access, |entry| {
            Ok(S::from_settings(&SettingsReader::new(S::ID, &entry.settings)))
        })
    }

    /// Apply every field of `instance` under one exclusive lock, then save
    /// both sources. Fields bound to non-writable or non-readable settings
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] when a field names an
    /// undeclared setting or does not fit its kind; nothing is applied in
    /// that case. Persistence errors are returned after the in-memory update.
    #[instrument(name = "config_registry.save_instance", skip(self, instance, access), fields(schema = %S::ID))]
    pub async fn save_config_instance<S: ConfigSchema>(
        &self,
        instance: &S,
        access: &Access,
    ) -> ConfigResult<()> {
        let schema = S::ID;
        let mut writer = SettingsWriter::new();
        instance.to_settings(&mut writer)?;
        let values = writer.into_values();

        let (changes, snapshot) = self.with_entry_mut(schema, Role::Write, access, |entry| {
            let prepared = prepare_instance(entry, values)?;
            let context = entry.context.clone();
            let mut changes = Vec::new();
            for (key, value) in prepared {
                if let Some(record) = entry.settings.get_mut(&key) {
                    let old = record.effective().clone();
                    record.assign(value, &context);
                    if record.effective() != &old {
                        changes.push((key, old.redacted(), record.effective().redacted()));
                    }
                }
            }
            Ok((changes, entry.snapshot()))
        })?;
        for (key, old, new) in changes {
            self.publish_change(schema, &key, old, new);
        }
        let result = persist(snapshot).await;
        self.report_save(schema, SaveOperation::Instance, &result);
        result
    }

    /// Write the default and override sets to their sources. The
    /// cancellation token is checked before the lock and before writing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Cancelled`], lookup and authorization errors,
    /// and IO errors from the write.
    #[instrument(name = "config_registry.save_settings", skip(self, access, cancel))]
    pub async fn save_settings(
        &self,
        schema: SchemaId,
        access: &Access,
        cancel: &CancellationToken,
    ) -> ConfigResult<()> {
        let result = self.save_settings_inner(schema, access, cancel).await;
        self.report_save(schema, SaveOperation::Settings, &result);
        result
    }

    async fn save_settings_inner(
        &self,
        schema: SchemaId,
        access: &Access,
        cancel: &CancellationToken,
    ) -> ConfigResult<()> {
        ensure_live(cancel, "save_settings.lock")?;
        let snapshot = self.with_entry_mut(schema, Role::Write, access, |entry| Ok(entry.snapshot()))?;
        ensure_live(cancel, "save_settings.write")?;
        persist(snapshot).await
    }

    /// Run [`ConfigRegistry::save_settings`] on the current runtime. The
    /// outcome is published as `SaveCompleted` or `SaveFailed` and is also
    /// available through the returned handle.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RuntimeUnavailable`] outside a tokio runtime.
    pub fn save_settings_detached(
        &self,
        schema: SchemaId,
        access: Access,
        cancel: CancellationToken,
    ) -> ConfigResult<JoinHandle<ConfigResult<()>>> {
        let handle = Handle::try_current().map_err(|_| ConfigError::RuntimeUnavailable {
            operation: "save_settings_detached",
        })?;
        let registry = self.clone();
        Ok(handle.spawn(async move { registry.save_settings(schema, &access, &cancel).await }))
    }

    /// Raw text of the default source.
    ///
    /// # Errors
    ///
    /// Returns lookup and authorization errors, or IO errors reading the file.
    pub fn default_source_contents(&self, schema: SchemaId, access: &Access) -> ConfigResult<String> {
        let source = self.with_entry(schema, Role::Read, access, |entry| {
            Ok(entry.default_source.clone())
        })?;
        source.read_text()
    }

    /// Replace the default source with `text` and rebuild the schema from
    /// disk. Requires the owner role.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedSource`] when `text` is not a JSON
    /// object; nothing is written in that case.
    #[instrument(name = "config_registry.save_default_source", skip(self, text, access))]
    pub async fn save_default_source_contents(
        &self,
        schema: SchemaId,
        text: &str,
        access: &Access,
    ) -> ConfigResult<()> {
        let result = self.replace_default_source(schema, text, access).await;
        self.report_save(schema, SaveOperation::DefaultSource, &result);
        result
    }

    async fn replace_default_source(
        &self,
        schema: SchemaId,
        text: &str,
        access: &Access,
    ) -> ConfigResult<()> {
        let source = self.with_entry(schema, Role::Owner, access, |entry| {
            Ok(entry.default_source.clone())
        })?;
        parse_document(source.path(), text)?;
        let text = text.to_string();
        tokio::task::spawn_blocking(move || source.write_text(&text))
            .await
            .map_err(|source| ConfigError::BackgroundTask {
                operation: "default_source.write",
                source,
            })??;
        self.inner.reload(schema)
    }

    /// Rebuild `schema` from its sources. On failure the previous settings
    /// stay in place and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotRegistered`], IO errors for missing sources
    /// and [`ConfigError::MalformedSource`] for unparsable ones.
    pub fn reload(&self, schema: SchemaId) -> ConfigResult<()> {
        self.inner.reload(schema)
    }

    /// Retire every schema. Subsequent operations fail with
    /// [`ConfigError::NotRegistered`]. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn with_entry<R>(
        &self,
        schema: SchemaId,
        role: Role,
        access: &Access,
        operation: impl FnOnce(&ConfigEntry) -> ConfigResult<R>,
    ) -> ConfigResult<R> {
        let slot = self.inner.slot(schema)?;
        let state = slot.read();
        let entry = state.live(schema)?;
        entry.authorize(self.inner.authority.as_ref(), access, role)?;
        operation(entry)
    }

    fn with_entry_mut<R>(
        &self,
        schema: SchemaId,
        role: Role,
        access: &Access,
        operation: impl FnOnce(&mut ConfigEntry) -> ConfigResult<R>,
    ) -> ConfigResult<R> {
        let slot = self.inner.slot(schema)?;
        let mut state = slot.write();
        let entry = state.live_mut(schema)?;
        entry.authorize(self.inner.authority.as_ref(), access, role)?;
        operation(entry)
    }

    fn publish_change(&self, schema: SchemaId, key: &str, old: Value, new: Value) {
        debug!(schema = %schema, key, "setting changed");
        self.inner.events.send(Event::SettingChanged {
            schema: schema.to_string(),
            key: key.to_string(),
            old,
            new,
        });
    }

    fn report_save(&self, schema: SchemaId, operation: SaveOperation, result: &ConfigResult<()>) {
        let event = match result {
            Ok(()) => {
                info!(schema = %schema, operation = operation.as_str(), "configuration saved");
                Event::SaveCompleted {
                    schema: schema.to_string(),
                    operation,
                }
            }
            Err(err) => {
                let error = error_chain(err);
                warn!(schema = %schema, operation = operation.as_str(), error = %error, "configuration save failed");
                Event::SaveFailed {
                    schema: schema.to_string(),
                    error,
                    operation,
                }
            }
        };
        self.inner.events.send(event);
    }
}

impl RegistryInner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<SchemaId, Arc<SchemaSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, schema: SchemaId) -> ConfigResult<Arc<SchemaSlot>> {
        self.lock_slots()
            .get(&schema)
            .cloned()
            .ok_or(ConfigError::NotRegistered { schema })
    }

    /// Existing slot for `schema`, or a fresh vacant one. Fails once the
    /// registry has shut down.
    fn claim_slot(&self, schema: SchemaId) -> ConfigResult<Arc<SchemaSlot>> {
        let mut slots = self.lock_slots();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ConfigError::NotRegistered { schema });
        }
        Ok(Arc::clone(slots.entry(schema).or_default()))
    }

    /// Remove `slot` from the map if it is still the one registered there.
    fn detach(&self, schema: SchemaId, slot: &Arc<SchemaSlot>) {
        let mut slots = self.lock_slots();
        if slots.get(&schema).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(&schema);
        }
    }

    fn reload(&self, schema: SchemaId) -> ConfigResult<()> {
        let slot = self.slot(schema)?;
        let loader = slot.read().live(schema)?.loader();
        let settings = match loader.load() {
            Ok(settings) => settings,
            Err(err) => {
                warn!(
                    schema = %schema,
                    missing = is_missing(&err),
                    error = %error_chain(&err),
                    "configuration sources unusable; keeping last good settings"
                );
                return Err(err);
            }
        };
        slot.write().live_mut(schema)?.settings = settings;

        debug!(schema = %schema, "configuration reloaded");
        self.events.send(Event::ConfigReloaded {
            schema: schema.to_string(),
        });
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut slots: Vec<(SchemaId, Arc<SchemaSlot>)> = self.lock_slots().drain().collect();
        slots.sort_by_key(|(schema, _)| *schema);

        let mut guards: Vec<_> = slots.iter().map(|(_, slot)| slot.write()).collect();
        let retired: Vec<SlotState> = guards
            .iter_mut()
            .map(|state| mem::replace(&mut **state, SlotState::Retired))
            .collect();
        drop(guards);
        let count = retired
            .iter()
            .filter(|state| matches!(state, SlotState::Live(_)))
            .count();
        drop(retired);
        info!(schemas = count, "configuration registry shut down");
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reload_callback(registry: Weak<RegistryInner>, schema: SchemaId) -> ReloadCallback {
    Box::new(move || {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        if registry.reload(schema).is_err() {
            debug!(schema = %schema, "debounced reload skipped");
        }
    })
}

fn plain_value<T: DeserializeOwned>(
    schema: SchemaId,
    key: &str,
    value: &StoredValue,
) -> ConfigResult<T> {
    match value {
        StoredValue::Plain(value) => {
            convert(value).map_err(|source| ConfigError::ConversionFailed {
                schema,
                key: key.to_string(),
                target: std::any::type_name::<T>(),
                source,
            })
        }
        StoredValue::Secure(_) => Err(ConfigError::SecureTypeMismatch {
            schema,
            key: key.to_string(),
            secure: true,
        }),
    }
}

/// Validate instance values against the entry without applying them.
fn prepare_instance(
    entry: &ConfigEntry,
    values: Vec<(String, StoredValue)>,
) -> ConfigResult<Vec<(String, StoredValue)>> {
    let mut prepared = Vec::with_capacity(values.len());
    for (key, value) in values {
        let record = entry.record(&key).map_err(|_| {
            ConfigError::invalid(key.clone(), "instance field has no declared setting", None)
        })?;
        // Unreadable fields were bound as zero values, never from the store.
        if !record.writable() || !record.readable() {
            continue;
        }
        let value = match (value, record.is_secure()) {
            (StoredValue::Plain(plain), false) => record
                .kind()
                .coerce(plain)
                .map(StoredValue::Plain)
                .ok_or_else(|| {
                    ConfigError::invalid(key.clone(), "value does not match the declared kind", None)
                })?,
            (StoredValue::Secure(payload), true) => StoredValue::Secure(payload),
            (_, secure) => {
                return Err(ConfigError::invalid(
                    key,
                    if secure {
                        "secure setting bound to a plain field"
                    } else {
                        "plain setting bound to a secure field"
                    },
                    None,
                ));
            }
        };
        prepared.push((key, value));
    }
    Ok(prepared)
}

fn ensure_live(cancel: &CancellationToken, operation: &'static str) -> ConfigResult<()> {
    if cancel.is_cancelled() {
        Err(ConfigError::Cancelled { operation })
    } else {
        Ok(())
    }
}

/// Write `snapshot` unless a newer snapshot of the same schema already
/// reached disk. Writes for one schema are serialized.
async fn persist(snapshot: SaveSnapshot) -> ConfigResult<()> {
    let schema = snapshot.schema;
    let generation = snapshot.generation;
    let ledger = Arc::clone(&snapshot.written);
    let mut written = ledger.lock().await;
    if *written >= generation {
        debug!(schema = %schema, generation, written = *written, "newer snapshot already written");
        return Ok(());
    }
    tokio::task::spawn_blocking(move || snapshot.write())
        .await
        .map_err(|source| ConfigError::BackgroundTask {
            operation: "save.write",
            source,
        })??;
    *written = generation;
    debug!(schema = %schema, generation, "sources written");
    Ok(())
}

fn error_chain(error: &ConfigError) -> String {
    let mut rendered = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
