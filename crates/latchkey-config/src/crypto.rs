//! Per-schema encryption contexts for secure settings.
//!
//! # Design
//! - Keys are derived deterministically from a master key, the schema id and
//!   an instance id, so the same schema always reopens its own payloads.
//! - Payloads are `base64(nonce || ciphertext)` sealed with ChaCha20-Poly1305.
//! - Key material lives in `Zeroizing` buffers and is wiped on drop.

use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use zeroize::Zeroizing;

use crate::error::{ConfigError, ConfigResult};
use crate::schema::SchemaId;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encrypted payload as stored in a source file.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedPayload(String);

impl SealedPayload {
    /// Wrap an encoded payload read from a source.
    #[must_use]
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encoded payload text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the payload carries no ciphertext at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for SealedPayload {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_tuple("SealedPayload")
            .field(&format_args!("{} bytes", self.0.len()))
            .finish()
    }
}

/// Supplies encryption contexts for registered schemas.
pub trait EncryptionService: Send + Sync {
    /// Context used to seal and open the secure fields of `schema`.
    ///
    /// # Errors
    ///
    /// Returns an error if key material for the schema cannot be produced.
    fn encryption_context(
        &self,
        schema: SchemaId,
        instance_id: &str,
    ) -> ConfigResult<EncryptionContext>;
}

/// Key material bound to one schema instance.
#[derive(Clone)]
pub struct EncryptionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    schema: SchemaId,
    instance_id: String,
    key: Zeroizing<[u8; KEY_LEN]>,
    key_id: u64,
}

impl EncryptionContext {
    /// Build a context from raw key material.
    #[must_use]
    pub fn new(schema: SchemaId, instance_id: impl Into<String>, key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        let digest = Sha256::digest(key.as_slice());
        let mut id_bytes = [0_u8; 8];
        id_bytes.copy_from_slice(&digest[..8]);
        Self {
            inner: Arc::new(ContextInner {
                schema,
                instance_id: instance_id.into(),
                key,
                key_id: u64::from_le_bytes(id_bytes),
            }),
        }
    }

    /// Schema this context belongs to.
    #[must_use]
    pub fn schema(&self) -> SchemaId {
        self.inner.schema
    }

    /// Instance identifier mixed into the key.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Non-secret fingerprint of the key; equal keys share a fingerprint.
    #[must_use]
    pub fn key_id(&self) -> u64 {
        self.inner.key_id
    }

    /// Seal `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Encryption`] if the cipher rejects the input.
    pub fn encrypt(&self, plaintext: &[u8]) -> ConfigResult<SealedPayload> {
        let cipher = self.cipher()?;
        let mut nonce = [0_u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ConfigError::Encryption {
                operation: "payload.encrypt",
                reason: "cipher rejected plaintext",
            })?;
        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(SealedPayload(general_purpose::STANDARD.encode(framed)))
    }

    /// Open a payload produced by [`Self::encrypt`] with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Encryption`] for malformed, truncated, tampered
    /// or foreign payloads.
    pub fn decrypt(&self, payload: &SealedPayload) -> ConfigResult<Zeroizing<Vec<u8>>> {
        let framed = general_purpose::STANDARD
            .decode(payload.as_str().trim())
            .map_err(|_| ConfigError::Encryption {
                operation: "payload.decode",
                reason: "payload is not valid base64",
            })?;
        if framed.len() <= NONCE_LEN {
            return Err(ConfigError::Encryption {
                operation: "payload.decode",
                reason: "payload is truncated",
            });
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        let cipher = self.cipher()?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| ConfigError::Encryption {
                operation: "payload.decrypt",
                reason: "authentication failed",
            })
    }

    fn cipher(&self) -> ConfigResult<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(self.inner.key.as_slice()).map_err(|_| {
            ConfigError::Encryption {
                operation: "cipher.init",
                reason: "invalid key length",
            }
        })
    }
}

impl Debug for EncryptionContext {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EncryptionContext")
            .field("schema", &self.inner.schema)
            .field("instance_id", &self.inner.instance_id)
            .field("key_id", &format_args!("{:016x}", self.inner.key_id))
            .finish_non_exhaustive()
    }
}

/// Encryption service deriving per-schema keys from a single master key.
pub struct KeyedEncryptionService {
    master: Zeroizing<[u8; KEY_LEN]>,
}

impl KeyedEncryptionService {
    /// Use the provided master key. The buffer is wiped when the service
    /// is dropped.
    #[must_use]
    pub const fn new(master: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self { master }
    }

    /// Generate a random, process-local master key.
    #[must_use]
    pub fn ephemeral() -> Self {
        let mut master = Zeroizing::new([0_u8; KEY_LEN]);
        rand::rng().fill(master.as_mut_slice());
        Self { master }
    }

    /// Load the master key stored at `path`, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the key file cannot be read or written, and
    /// [`ConfigError::Encryption`] if an existing file has the wrong size.
    pub fn load_or_create(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            let bytes = Zeroizing::new(
                fs::read(path).map_err(|err| ConfigError::io("master_key.read", path, err))?,
            );
            if bytes.len() != KEY_LEN {
                return Err(ConfigError::Encryption {
                    operation: "master_key.read",
                    reason: "master key must be 32 bytes",
                });
            }
            let mut master = Zeroizing::new([0_u8; KEY_LEN]);
            master.copy_from_slice(&bytes);
            return Ok(Self::new(master));
        }

        let service = Self::ephemeral();
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|err| ConfigError::io("master_key.create_dir", parent, err))?;
        let mut file = tempfile::NamedTempFile::new_in(parent)
            .map_err(|err| ConfigError::io("master_key.temp", parent, err))?;
        file.write_all(service.master.as_slice())
            .map_err(|err| ConfigError::io("master_key.write", path, err))?;
        restrict_permissions(file.path())?;
        file.persist(path)
            .map_err(|err| ConfigError::io("master_key.persist", path, err.error))?;
        info!(path = %path.display(), "generated configuration master key");
        Ok(service)
    }

    fn derive(&self, schema: SchemaId, instance_id: &str) -> Zeroizing<[u8; KEY_LEN]> {
        let mut hasher = Sha256::new();
        hasher.update(self.master.as_slice());
        hasher.update([0]);
        hasher.update(schema.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(instance_id.as_bytes());
        let mut key = Zeroizing::new([0_u8; KEY_LEN]);
        key.copy_from_slice(&hasher.finalize());
        key
    }
}

impl EncryptionService for KeyedEncryptionService {
    fn encryption_context(
        &self,
        schema: SchemaId,
        instance_id: &str,
    ) -> ConfigResult<EncryptionContext> {
        Ok(EncryptionContext::new(
            schema,
            instance_id,
            self.derive(schema, instance_id),
        ))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> ConfigResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|err| ConfigError::io("master_key.chmod", path, err))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> ConfigResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: SchemaId = SchemaId::new("crypto.tests");

    fn context(service: &KeyedEncryptionService, instance: &str) -> EncryptionContext {
        service
            .encryption_context(SCHEMA, instance)
            .expect("context")
    }

    #[test]
    fn seal_and_open_round_trip_uses_fresh_nonces() {
        let service = KeyedEncryptionService::new(Zeroizing::new([7; KEY_LEN]));
        let ctx = context(&service, "default");
        let first = ctx.encrypt(b"hunter2").expect("encrypt");
        let second = ctx.encrypt(b"hunter2").expect("encrypt");
        assert_ne!(first, second);
        assert_eq!(ctx.decrypt(&first).expect("decrypt").as_slice(), b"hunter2");
    }

    #[test]
    fn foreign_and_tampered_payloads_fail() {
        let service = KeyedEncryptionService::new(Zeroizing::new([7; KEY_LEN]));
        let ctx = context(&service, "default");
        let other = context(&service, "secondary");
        assert_ne!(ctx.key_id(), other.key_id());

        let sealed = ctx.encrypt(b"payload").expect("encrypt");
        assert!(matches!(
            other.decrypt(&sealed),
            Err(ConfigError::Encryption { reason: "authentication failed", .. })
        ));

        let mut raw = general_purpose::STANDARD
            .decode(sealed.as_str())
            .expect("base64");
        if let Some(last) = raw.last_mut() {
            *last ^= 0xff;
        }
        let tampered = SealedPayload::new(general_purpose::STANDARD.encode(raw));
        assert!(ctx.decrypt(&tampered).is_err());
        assert!(ctx.decrypt(&SealedPayload::new("not base64!")).is_err());
        assert!(ctx.decrypt(&SealedPayload::default()).is_err());
    }

    #[test]
    fn derivation_is_deterministic_per_schema_instance() {
        let a = KeyedEncryptionService::new(Zeroizing::new([1; KEY_LEN]));
        let b = KeyedEncryptionService::new(Zeroizing::new([1; KEY_LEN]));
        assert_eq!(context(&a, "x").key_id(), context(&b, "x").key_id());
        let sealed = context(&a, "x").encrypt(b"shared").expect("encrypt");
        assert_eq!(
            context(&b, "x").decrypt(&sealed).expect("decrypt").as_slice(),
            b"shared"
        );
    }

    #[test]
    fn master_key_file_is_created_then_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys").join("master.key");
        let created = KeyedEncryptionService::load_or_create(&path).expect("create");
        let sealed = context(&created, "i").encrypt(b"persisted").expect("encrypt");
        let loaded = KeyedEncryptionService::load_or_create(&path).expect("load");
        assert_eq!(
            context(&loaded, "i").decrypt(&sealed).expect("decrypt").as_slice(),
            b"persisted"
        );

        fs::write(&path, b"short").expect("truncate key");
        assert!(matches!(
            KeyedEncryptionService::load_or_create(&path),
            Err(ConfigError::Encryption { .. })
        ));
    }

    #[test]
    fn stored_key_matches_the_same_key_held_in_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("master.key");
        fs::write(&path, [2_u8; KEY_LEN]).expect("write key");
        let loaded = KeyedEncryptionService::load_or_create(&path).expect("load");
        let held = KeyedEncryptionService::new(Zeroizing::new([2; KEY_LEN]));
        assert_eq!(context(&loaded, "i").key_id(), context(&held, "i").key_id());
        assert_eq!(fs::read(&path).expect("key").len(), KEY_LEN);
    }

    #[test]
    fn debug_output_hides_key_material() {
        let service = KeyedEncryptionService::new(Zeroizing::new([9; KEY_LEN]));
        let rendered = format!("{:?}", context(&service, "i"));
        assert!(rendered.contains("crypto.tests"));
        assert!(!rendered.contains("[9"));
    }
}
