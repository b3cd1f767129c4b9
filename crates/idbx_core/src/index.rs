//! Index reads within a transaction.

use serde_json::Value;

use idbx_engine as engine;
use idbx_engine::{Key, KeyPath, KeyRange};

use crate::error::IdbResult;
use crate::request::{
    dispatch, expect_count, expect_found_key, expect_keys, expect_value, expect_values,
};
use crate::store::record_limit;
use crate::transaction::Transaction;

/// Read access to one secondary index, scoped to one transaction.
///
/// Ranges select on the indexed value; results come back in index-key
/// order. Key results are the primary keys of the matching records.
#[derive(Clone)]
pub struct Index {
    transaction: Transaction,
    raw: engine::Index,
}

impl Index {
    pub(crate) fn new(transaction: Transaction, raw: engine::Index) -> Self {
        Self { transaction, raw }
    }

    /// Name of the index.
    #[must_use]
    pub fn name(&self) -> &str {
        self.raw.name()
    }

    /// Name of the store the index belongs to.
    #[must_use]
    pub fn store_name(&self) -> &str {
        self.raw.store_name()
    }

    /// The path producing the indexed key.
    #[must_use]
    pub fn key_path(&self) -> &KeyPath {
        self.raw.key_path()
    }

    /// Returns `true` if the index enforces distinct keys.
    #[must_use]
    pub fn unique(&self) -> bool {
        self.raw.unique()
    }

    /// Returns `true` if array values index one entry per element.
    #[must_use]
    pub fn multi_entry(&self) -> bool {
        self.raw.multi_entry()
    }

    /// Counts index entries in `range`.
    pub fn count(&self, range: &KeyRange, continuation: impl FnOnce(IdbResult<u64>) + 'static) {
        dispatch(
            || {
                self.transaction.ensure_live("count index entries")?;
                Ok(self.raw.count(range.clone())?)
            },
            expect_count,
            continuation,
        );
    }

    /// The first matching record in index order, if any.
    pub fn get_one(
        &self,
        range: &KeyRange,
        continuation: impl FnOnce(IdbResult<Option<Value>>) + 'static,
    ) {
        if range.is_all() {
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

    /// Every matching record, in index order.
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

    /// Like [`Index::get`] but keeps at most `limit` records. A negative
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

    /// Primary key of the first match, if any.
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

    /// Primary keys of every match, in index order.
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

    /// Like [`Index::get_keys`] but keeps at most `limit` keys. A
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
}
