#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Token-gated configuration store backed by layered JSON sources.
//!
//! Each registered schema combines compiled defaults, a default source file
//! and a user source file. Every operation presents capability tokens that
//! are checked against the tokens recorded at registration. Secure settings
//! are stored encrypted and only decrypted on explicit request.
//!
//! Layout: `service.rs` (`ConfigRegistry`), `entry.rs` (per-schema lock and
//! state), `store.rs` (setting records and layering), `schema.rs`
//! (descriptors and instance binding), `token.rs` (capability tokens),
//! `crypto.rs` + `secure.rs` (encryption and `SecureValue`), `source.rs`
//! (atomic JSON files), `reload.rs` (watch + debounce), `model.rs`
//! (registry and registration options), `validate.rs` (kinds and coercion).

pub mod crypto;
pub mod defaults;
mod entry;
pub mod error;
pub mod model;
mod reload;
pub mod schema;
pub mod secure;
pub mod service;
pub mod source;
pub mod store;
pub mod token;
pub mod validate;

pub use crypto::{EncryptionContext, EncryptionService, KeyedEncryptionService, SealedPayload};
pub use error::{ConfigError, ConfigResult};
pub use model::{RegisterOptions, RegistryConfig, SerializationOptions, SourcePaths};
pub use schema::{
    ConfigSchema, SchemaDescriptor, SchemaDescriptorBuilder, SchemaId, SettingSpec, SettingsReader,
    SettingsWriter,
};
pub use secure::SecureValue;
pub use service::{ConfigRegistry, ConfigRegistryBuilder};
pub use source::JsonSource;
pub use store::{SettingRecord, SettingStore, StoredValue};
pub use token::{
    Access, AccessDenied, CapabilityAuthority, CapabilityToken, Role, TokenAuthority, TokenTriple,
};
pub use validate::ValueKind;
