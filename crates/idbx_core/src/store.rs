//! Object-store operations within a transaction.

use serde_json::Value;

use idbx_engine as engine;
use idbx_engine::{IndexParams, Key, KeyPath, KeyRange};

use crate::error::IdbResult;
use crate::index::Index;
use crate::request::{
    dispatch, expect_count, expect_done, expect_found_key, expect_key, expect_keys, expect_value,
    expect_values,
};
use crate::transaction::Transaction;

/// Converts a caller-facing limit into the engine's form.
///
/// Negative limits mean "no limit"; zero means zero results.
pub(crate) fn record_limit(limit: i64) -> Option<usize> {
    usize::try_from(limit).ok()
}

/// Operations on one object store, scoped to one transaction.
///
/// Every operation delivers its result through a continuation that fires
/// exactly once. Mutations become durable when the owning transaction
/// commits, not when the operation's continuation runs.
#[derive(Clone)]
pub struct Store {
    transaction: Transaction,
    raw: engine::ObjectStore,
}

impl Store {
    pub(crate) fn new(transaction: Transaction, raw: engine::ObjectStore) -> Self {
        Self { transaction, raw }
    }

    /// Name of the object store.
    #[must_use]
    pub fn name(&self) -> &str {
        self.raw.name()
    }

    /// The in-line key path, if the store has one.
    #[must_use]
    pub fn key_path(&self) -> Option<&KeyPath> {
        self.raw.key_path()
    }

    /// Returns `true` if the store generates keys.
    #[must_use]
    pub fn auto_increment(&self) -> bool {
        self.raw.auto_increment()
    }

    /// The transaction this store handle belongs to.
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    // === Writes ===

    /// Inserts a record; fails if the primary key is already present.
    ///
    /// The continuation receives the key the record landed under, which
    /// for generated keys is the interesting part.
    pub fn add(
        &self,
        value: Value,
        key: Option<Key>,
        continuation: impl FnOnce(IdbResult<Key>) + 'static,
    ) {
        dispatch(
            || {
                self.transaction.ensure_live("add a record")?;
                Ok(self.raw.add(value, key)?)
            },
            expect_key,
            continuation,
        );
    }

    /// Inserts or overwrites a record.
    pub fn put(
        &self,
        value: Value,
        key: Option<Key>,
        continuation: impl FnOnce(IdbResult<Key>) + 'static,
    ) {
        dispatch(
            || {
                self.transaction.ensure_live("put a record")?;
                Ok(self.raw.put(value, key)?)
            },
            expect_key,
            continuation,
        );
    }

    /// Deletes every record in `range`. The all-range clears the store.
    pub fn delete(&self, range: &KeyRange, continuation: impl FnOnce(IdbResult<()>) + 'static) {
        dispatch(
            || {
                self.transaction.ensure_live("delete records")?;
                if range.is_all() {
                    Ok(self.raw.clear()?)
                } else {
                    Ok(self.raw.delete(range.clone())?)
                }
            },
            expect_done,
            continuation,
        );
    }

    // === Reads ===

    /// Counts the records in `range`.
    pub fn count(&self, range: &KeyRange, continuation: impl FnOnce(IdbResult<u64>) + 'static) {
        dispatch(
            || {
                self.transaction.ensure_live("count records")?;
                Ok(self.raw.count(range.clone())?)
            },
            expect_count,
            continuation,
        );
    }

    /// The first record in `range`, by key order, if any.
    pub fn get_one(
        &self,
        range: &KeyRange,
        continuation: impl FnOnce(IdbResult<Option<Value>>) + 'static,
    ) {
        if range.is_all() {
            // Over the whole store this fetches everything and keeps the
            // first record.
            dispatch(
                || {
                    self.transaction.ensure_live("get a record")?;
                    Ok(self.raw.get_all(KeyRange::all(), None)?)
                },
                |payload| Ok(expect_values(payload)?.into_iter().next()),
                continuation,
            );
        } else {
            dispatch(
                || {
                    self.transaction.ensure_live("get a record")?;
                    Ok(self.raw.get(range.clone())?)
                },
                expect_value,
                continuation,
            );
        }
    }

    /// Every record in `range`, in key order.
    pub fn get(
        &self,
        range: &KeyRange,
        continuation: impl FnOnce(IdbResult<Vec<Value>>) + 'static,
    ) {
        dispatch(
            || {
                self.transaction.ensure_live("get records")?;
                Ok(self.raw.get_all(range.clone(), None)?)
            },
            expect_values,
            continuation,
        );
    }

    /// Like [`Store::get`] but keeps at most `limit` records. A negative
    /// limit means no limit.
    pub fn get_with_limit(
        &self,
        range: &KeyRange,
        limit: i64,
        continuation: impl FnOnce(IdbResult<Vec<Value>>) + 'static,
    ) {
        dispatch(
            || {
                self.transaction.ensure_live("get records")?;
                Ok(self.raw.get_all(range.clone(), record_limit(limit))?)
            },
            expect_values,
            continuation,
        );
    }

    /// The first primary key in `range`, if any.
    pub fn get_one_key(
        &self,
        range: &KeyRange,
        continuation: impl FnOnce(IdbResult<Option<Key>>) + 'static,
    ) {
        dispatch(
            || {
                self.transaction.ensure_live("get a key")?;
                Ok(self.raw.get_key(range.clone())?)
            },
            expect_found_key,
            continuation,
        );
    }

    /// Every primary key in `range`, in order.
    pub fn get_keys(
        &self,
        range: &KeyRange,
        continuation: impl FnOnce(IdbResult<Vec<Key>>) + 'static,
    ) {
        dispatch(
            || {
                self.transaction.ensure_live("get keys")?;
                Ok(self.raw.get_all_keys(range.clone(), None)?)
            },
            expect_keys,
            continuation,
        );
    }

    /// Like [`Store::get_keys`] but keeps at most `limit` keys. A
    /// negative limit means no limit.
    pub fn get_keys_with_limit(
        &self,
        range: &KeyRange,
        limit: i64,
        continuation: impl FnOnce(IdbResult<Vec<Key>>) + 'static,
    ) {
        dispatch(
            || {
                self.transaction.ensure_live("get keys")?;
                Ok(self.raw.get_all_keys(range.clone(), record_limit(limit))?)
            },
            expect_keys,
            continuation,
        );
    }

    // === Indexes ===

    /// Looks up an index on this store.
    pub fn index(&self, name: &str) -> IdbResult<Index> {
        self.transaction
            .ensure_live(&format!("look up index '{name}'"))?;
        let raw = self.raw.index(name)?;
        Ok(Index::new(self.transaction.clone(), raw))
    }

    /// Names of the indexes on this store.
    pub fn index_names(&self) -> IdbResult<Vec<String>> {
        self.transaction.ensure_live("list indexes")?;
        Ok(self.raw.index_names()?)
    }

    /// Creates an index, backfilling existing records. Legal only within
    /// the upgrade transaction; fails if backfill hits a uniqueness
    /// violation.
    pub fn create_index(
        &self,
        name: &str,
        key_path: KeyPath,
        params: IndexParams,
    ) -> IdbResult<Index> {
        self.transaction
            .ensure_live(&format!("create index '{name}'"))?;
        let raw = self.raw.create_index(name, key_path, params)?;
        Ok(Index::new(self.transaction.clone(), raw))
    }

    /// Deletes an index. Upgrade transactions only.
    pub fn delete_index(&self, name: &str) -> IdbResult<()> {
        self.transaction
            .ensure_live(&format!("delete index '{name}'"))?;
        self.raw.delete_index(name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_limits_are_unbounded() {
        assert_eq!(record_limit(-1), None);
        assert_eq!(record_limit(i64::MIN), None);
        assert_eq!(record_limit(0), Some(0));
        assert_eq!(record_limit(25), Some(25));
    }
}
