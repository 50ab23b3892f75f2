//! A small string-keyed wrapper around the byte-oriented `storage::Engine`,
//! used for the replica's committed and temp stores. Both are "black-box
//! persistent maps" per the durable KV store module -- this just narrows
//! the `Engine` trait's byte-string interface to the `String` keys and
//! values the rest of the system works with.

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;

/// Joins a transaction id and a key into the temp store's composite key.
pub fn temp_key(tx_id: &str, key: &str) -> String {
    format!("{}__{}", tx_id, key)
}

/// A durable string-to-string map backed by any `Engine`.
pub struct KvStore<E: Engine> {
    engine: E,
}

impl<E: Engine> KvStore<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// Stores `value` under `key`. Durable before returning, per section 4.1.
    pub fn put(&mut self, key: &str, value: &str) -> CResult<()> {
        self.engine.set(key.as_bytes(), value.as_bytes().to_vec())
    }

    /// Reads the value for `key`, or `Error::KeyNotFound` if absent.
    pub fn get(&mut self, key: &str) -> CResult<String> {
        match self.engine.get(key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes).map_err(|e| Error::InvalidData(e.to_string())),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Like `get`, but returns `Ok(None)` instead of `Error::KeyNotFound`.
    pub fn try_get(&mut self, key: &str) -> CResult<Option<String>> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(Error::KeyNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Deletes `key`. A no-op, not an error, if it does not exist.
    pub fn del(&mut self, key: &str) -> CResult<()> {
        self.engine.delete(key.as_bytes())
    }

    /// Returns every currently-stored key.
    pub fn list(&mut self) -> CResult<Vec<String>> {
        self.engine
            .list()?
            .into_iter()
            .map(|bytes| String::from_utf8(bytes).map_err(|e| Error::InvalidData(e.to_string())))
            .collect()
    }

    pub fn flush(&mut self) -> CResult<()> {
        self.engine.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Memory;

    #[test]
    fn put_get_del_round_trip() -> CResult<()> {
        let mut store = KvStore::new(Memory::new());
        assert_eq!(store.try_get("foo")?, None);

        store.put("foo", "bar")?;
        assert_eq!(store.get("foo")?, "bar");

        store.del("foo")?;
        assert_eq!(store.try_get("foo")?, None);

        // Deleting a missing key is a no-op, not an error.
        store.del("foo")?;

        Ok(())
    }

    #[test]
    fn list_returns_all_keys() -> CResult<()> {
        let mut store = KvStore::new(Memory::new());
        store.put("a", "1")?;
        store.put("b", "2")?;
        let mut keys = store.list()?;
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[test]
    fn temp_key_joins_tx_id_and_key() {
        assert_eq!(temp_key("tx1", "foo"), "tx1__foo");
    }
}
