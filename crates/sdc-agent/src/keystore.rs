//! Per-session resource key store.
//!
//! Written exactly once by the registration handler, then sealed. Every
//! other component only asks the membership question. Keys never survive
//! their session.

use std::sync::RwLock;

use sdc_proto::ResourceKey;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("key store is sealed")]
    Sealed,

    #[error("key store already holds keys for this session")]
    AlreadyStored,
}

#[derive(Debug, Default)]
struct Inner {
    keys: Vec<ResourceKey>,
    stored: bool,
    sealed: bool,
}

/// Session-scoped store of `(host, port, secret)` tuples.
#[derive(Debug, Default)]
pub struct KeyStore {
    inner: RwLock<Inner>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot write of the session's minted keys.
    pub fn store_keys(&self, keys: Vec<ResourceKey>) -> Result<(), KeyStoreError> {
        let mut inner = self.inner.write().expect("key store lock poisoned");
        if inner.sealed {
            return Err(KeyStoreError::Sealed);
        }
        if inner.stored {
            return Err(KeyStoreError::AlreadyStored);
        }
        inner.keys = keys;
        inner.stored = true;
        Ok(())
    }

    /// Forbid further writes for the rest of the session.
    pub fn seal(&self) {
        self.inner.write().expect("key store lock poisoned").sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.read().expect("key store lock poisoned").sealed
    }

    /// Whether traffic to `(host, port)` is gated open. Host comparison is
    /// case-insensitive ASCII; port is exact.
    pub fn is_allowed(&self, host: &str, port: u16) -> bool {
        let inner = self.inner.read().expect("key store lock poisoned");
        inner
            .keys
            .iter()
            .any(|key| key.port == port && key.host.eq_ignore_ascii_case(host))
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("key store lock poisoned").keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
