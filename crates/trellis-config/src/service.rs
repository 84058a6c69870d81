// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Config port: named raw blobs, decoded as JSON documents.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Storage port for raw config documents, keyed by logical name
/// (`"engine"`, ...).
pub trait ConfigStore {
    /// Bytes stored under `key`, or [`ConfigError::NotFound`].
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replaces the bytes stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

impl<S: ConfigStore + ?Sized> ConfigStore for &S {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        (**self).load_raw(key)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        (**self).save_raw(key, data)
    }
}

/// Config failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("config key not found")]
    NotFound,
    /// The store could not be read or written.
    #[error("config i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// The stored document is not valid JSON for the requested type.
    #[error("malformed config document: {0}")]
    Serde(#[from] serde_json::Error),
    /// Store-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Serde front of a [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Service over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The wrapped store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Unwraps the store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Decodes the document under `key`. A missing key or a blank document
    /// yields `Ok(None)`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let bytes = match self.store.load_raw(key) {
            Ok(bytes) => bytes,
            Err(ConfigError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Like [`Self::load`], falling back to `T::default()`. Fields missing
    /// from the document are only filled in when `T` is `#[serde(default)]`.
    pub fn load_or_default<T: DeserializeOwned + Default>(
        &self,
        key: &str,
    ) -> Result<T, ConfigError> {
        Ok(self.load(key)?.unwrap_or_default())
    }

    /// Stores `value` under `key` as pretty JSON with a trailing newline.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let mut data = serde_json::to_vec_pretty(value)?;
        data.push(b'\n');
        self.store.save_raw(key, &data)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Default)]
    struct Blobs(RefCell<BTreeMap<String, Vec<u8>>>);

    impl ConfigStore for Blobs {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.0.borrow().get(key).cloned().ok_or(ConfigError::NotFound)
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.0.borrow_mut().insert(key.to_owned(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn blank_documents_read_as_missing() {
        let blobs = Blobs::default();
        blobs.save_raw("engine", b"  \n").unwrap();
        let service = ConfigService::new(&blobs);
        assert_eq!(service.load::<u32>("engine").unwrap(), None);
        assert_eq!(service.load_or_default::<u32>("absent").unwrap(), 0);
    }

    #[test]
    fn saved_documents_end_with_a_newline() {
        let service = ConfigService::new(Blobs::default());
        service.save("sizes", &[1, 2, 3]).unwrap();
        let raw = service.store().load_raw("sizes").unwrap();
        assert_eq!(raw.last(), Some(&b'\n'));
        assert_eq!(service.load::<Vec<u8>>("sizes").unwrap(), Some(vec![1, 2, 3]));
    }
}
