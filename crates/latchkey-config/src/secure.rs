//! Disposable wrapper around an encrypted setting payload.
//!
//! A [`SecureValue`] never decrypts on construction from a stored payload.
//! Plaintext only appears inside [`SecureValue::reveal`], is cached in a
//! zeroizing buffer for repeated reads, and is wiped by [`SecureValue::dispose`]
//! or on drop.
//!
//! One exception: the store compares two payloads when deciding whether a
//! secure override equals its default. Both plaintexts are decrypted into
//! zeroizing buffers, compared, and wiped before the comparison returns.
//! Only the boolean leaves; no `SecureValue` is revealed by it.

use std::fmt::{self, Debug, Formatter};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::crypto::{EncryptionContext, SealedPayload};
use crate::error::{ConfigError, ConfigResult};

enum SecureState {
    Live {
        buffer: Option<DecryptedBuffer>,
    },
    Disposed,
}

struct DecryptedBuffer {
    key_id: u64,
    bytes: Zeroizing<Vec<u8>>,
}

/// Encrypted setting value with an ephemeral decrypted buffer.
pub struct SecureValue {
    payload: SealedPayload,
    state: SecureState,
}

impl SecureValue {
    /// Encrypt `plain` with `context`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized or sealed.
    pub fn seal<T: Serialize + ?Sized>(plain: &T, context: &EncryptionContext) -> ConfigResult<Self> {
        let bytes = Zeroizing::new(
            serde_json::to_vec(plain)
                .map_err(|err| ConfigError::serialization("secure.encode", err))?,
        );
        let payload = context.encrypt(&bytes)?;
        Ok(Self::from_payload(payload))
    }

    /// Wrap a stored payload without decrypting it.
    #[must_use]
    pub const fn from_payload(payload: SealedPayload) -> Self {
        Self {
            payload,
            state: SecureState::Live { buffer: None },
        }
    }

    /// Value that carries no payload; revealing it fails.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_payload(SealedPayload::default())
    }

    /// Decrypt (once per key) and deserialize the payload as `T`.
    ///
    /// Payloads that were sealed as raw text rather than JSON are accepted for
    /// string-like targets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Disposed`] after disposal,
    /// [`ConfigError::Encryption`] when the payload cannot be opened, and
    /// [`ConfigError::Serialization`] when the plaintext does not fit `T`.
    pub fn reveal<T: DeserializeOwned>(&mut self, context: &EncryptionContext) -> ConfigResult<T> {
        let SecureState::Live { buffer } = &mut self.state else {
            return Err(ConfigError::Disposed);
        };
        let stale = buffer
            .as_ref()
            .is_none_or(|cached| cached.key_id != context.key_id());
        if stale {
            let bytes = context.decrypt(&self.payload)?;
            *buffer = Some(DecryptedBuffer {
                key_id: context.key_id(),
                bytes,
            });
        }
        let Some(cached) = buffer.as_ref() else {
            return Err(ConfigError::Disposed);
        };
        decode_plaintext(&cached.bytes)
    }

    /// Encrypted payload backing this value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Disposed`] after disposal.
    pub fn payload(&self) -> ConfigResult<&SealedPayload> {
        match self.state {
            SecureState::Live { .. } => Ok(&self.payload),
            SecureState::Disposed => Err(ConfigError::Disposed),
        }
    }

    /// Whether a decrypted buffer is currently held.
    #[must_use]
    pub const fn is_revealed(&self) -> bool {
        matches!(self.state, SecureState::Live { buffer: Some(_) })
    }

    /// Whether [`Self::dispose`] has been called.
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        matches!(self.state, SecureState::Disposed)
    }

    /// Wipe the decrypted buffer and mark the value disposed. Idempotent.
    pub fn dispose(&mut self) {
        self.state = SecureState::Disposed;
    }

    /// Compare the plaintext of two values under one context. Identical
    /// payloads short-circuit without decrypting.
    pub(crate) fn same_plaintext(
        left: &SealedPayload,
        right: &SealedPayload,
        context: &EncryptionContext,
    ) -> bool {
        if left == right {
            return true;
        }
        match (context.decrypt(left), context.decrypt(right)) {
            (Ok(a), Ok(b)) => a.as_slice() == b.as_slice(),
            _ => false,
        }
    }
}

fn decode_plaintext<T: DeserializeOwned>(bytes: &[u8]) -> ConfigResult<T> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(json_err) => {
            let Ok(text) = std::str::from_utf8(bytes) else {
                return Err(ConfigError::serialization("secure.decode", json_err));
            };
            serde_json::from_value(Value::String(text.to_string()))
                .map_err(|_| ConfigError::serialization("secure.decode", json_err))
        }
    }
}

impl Default for SecureValue {
    fn default() -> Self {
        Self::empty()
    }
}

impl Clone for SecureValue {
    fn clone(&self) -> Self {
        let state = match self.state {
            SecureState::Live { .. } => SecureState::Live { buffer: None },
            SecureState::Disposed => SecureState::Disposed,
        };
        Self {
            payload: self.payload.clone(),
            state,
        }
    }
}

impl Debug for SecureValue {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SecureValue")
            .field("payload", &self.payload)
            .field("revealed", &self.is_revealed())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionService, KeyedEncryptionService};
    use crate::schema::SchemaId;
    use serde::Deserialize;

    fn context(instance: &str) -> EncryptionContext {
        KeyedEncryptionService::new(Zeroizing::new([3; 32]))
            .encryption_context(SchemaId::new("secure.tests"), instance)
            .expect("context")
    }

    #[test]
    fn reveal_round_trips_and_caches() {
        let ctx = context("default");
        let mut value = SecureValue::seal("super-secret", &ctx).expect("seal");
        assert!(!value.is_revealed());
        let plain: String = value.reveal(&ctx).expect("reveal");
        assert_eq!(plain, "super-secret");
        assert!(value.is_revealed());
    }

    #[test]
    fn dispose_is_idempotent_and_blocks_reveal() {
        let ctx = context("default");
        let mut value = SecureValue::seal("super-secret", &ctx).expect("seal");
        let _: String = value.reveal(&ctx).expect("reveal");
        value.dispose();
        assert!(!value.is_revealed());
        assert!(matches!(
            value.reveal::<String>(&ctx),
            Err(ConfigError::Disposed)
        ));
        value.dispose();
        assert!(value.is_disposed());
        assert!(matches!(value.payload(), Err(ConfigError::Disposed)));
    }

    #[test]
    fn structured_values_survive_sealing() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Credentials {
            user: String,
            port: u16,
        }
        let ctx = context("default");
        let creds = Credentials {
            user: "svc".into(),
            port: 5432,
        };
        let mut value = SecureValue::seal(&creds, &ctx).expect("seal");
        assert_eq!(value.reveal::<Credentials>(&ctx).expect("reveal"), creds);
    }

    #[test]
    fn raw_text_payloads_are_read_as_strings() {
        let ctx = context("default");
        let payload = ctx.encrypt(b"legacy plaintext").expect("encrypt");
        let mut value = SecureValue::from_payload(payload);
        let text: String = value.reveal(&ctx).expect("reveal raw text");
        assert_eq!(text, "legacy plaintext");
    }

    #[test]
    fn foreign_context_cannot_reveal() {
        let mut value = SecureValue::seal("secret", &context("a")).expect("seal");
        assert!(matches!(
            value.reveal::<String>(&context("b")),
            Err(ConfigError::Encryption { .. })
        ));
        assert!(matches!(
            SecureValue::empty().reveal::<String>(&context("a")),
            Err(ConfigError::Encryption { .. })
        ));
    }

    #[test]
    fn clones_drop_the_decrypted_buffer() {
        let ctx = context("default");
        let mut value = SecureValue::seal("secret", &ctx).expect("seal");
        let _: String = value.reveal(&ctx).expect("reveal");
        let copy = value.clone();
        assert!(!copy.is_revealed());
        assert!(SecureValue::same_plaintext(
            copy.payload().expect("live"),
            value.payload().expect("live"),
            &ctx
        ));
        let rendered = format!("{value:?}");
        assert!(!rendered.contains("secret\""));
    }
}
