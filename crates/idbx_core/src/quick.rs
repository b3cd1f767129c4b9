//! Single-operation conveniences.
//!
//! Each helper opens a single-store transaction, performs one operation,
//! and folds transaction setup failure, operation failure, and a later
//! transaction abort into one continuation that fires exactly once. The
//! first error wins; the duplicate abort notification that follows a
//! failed operation is suppressed.
//!
//! Mutations still become durable only when the implicit transaction
//! commits, which happens right after the one operation finishes.

use serde_json::Value;

use idbx_engine::{Key, KeyRange, TransactionMode};

use crate::connection::Connection;
use crate::error::IdbResult;
use crate::index::Index;
use crate::request::OnceCont;
use crate::store::Store;

fn single_store<T: 'static>(
    connection: &Connection,
    store: &str,
    mode: TransactionMode,
    continuation: impl FnOnce(IdbResult<T>) + 'static,
    run: impl FnOnce(&Store, OnceCont<T>),
) {
    let cont = OnceCont::new(continuation);
    let terminal = cont.clone();
    let opened = connection.transaction(&[store], mode, move |outcome| {
        // Success reaches the caller through the operation itself; only
        // a failure travels the terminal channel.
        if let Err(error) = outcome {
            terminal.resolve(Err(error));
        }
    });
    let transaction = match opened {
        Ok(transaction) => transaction,
        Err(error) => {
            cont.resolve(Err(error));
            return;
        }
    };
    match transaction.store(store) {
        Ok(store) => run(&store, cont),
        Err(error) => cont.resolve(Err(error)),
    }
}

fn single_index<T: 'static>(
    connection: &Connection,
    store: &str,
    index: &str,
    continuation: impl FnOnce(IdbResult<T>) + 'static,
    run: impl FnOnce(&Index, OnceCont<T>),
) {
    let index = index.to_owned();
    single_store(
        connection,
        store,
        TransactionMode::ReadOnly,
        continuation,
        move |store, cont| match store.index(&index) {
            Ok(index) => run(&index, cont),
            Err(error) => cont.resolve(Err(error)),
        },
    );
}

// === Store operations ===

/// Inserts one record in its own read-write transaction; fails if the
/// key is taken.
pub fn add(
    connection: &Connection,
    store: &str,
    value: Value,
    key: Option<Key>,
    continuation: impl FnOnce(IdbResult<Key>) + 'static,
) {
    single_store(
        connection,
        store,
        TransactionMode::ReadWrite,
        continuation,
        move |store, cont| store.add(value, key, move |result| cont.resolve(result)),
    );
}

/// Inserts or overwrites one record in its own read-write transaction.
pub fn put(
    connection: &Connection,
    store: &str,
    value: Value,
    key: Option<Key>,
    continuation: impl FnOnce(IdbResult<Key>) + 'static,
) {
    single_store(
        connection,
        store,
        TransactionMode::ReadWrite,
        continuation,
        move |store, cont| store.put(value, key, move |result| cont.resolve(result)),
    );
}

/// Deletes every record in `range` in its own read-write transaction.
pub fn delete(
    connection: &Connection,
    store: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<()>) + 'static,
) {
    let range = range.clone();
    single_store(
        connection,
        store,
        TransactionMode::ReadWrite,
        continuation,
        move |store, cont| store.delete(&range, move |result| cont.resolve(result)),
    );
}

/// Counts records in `range`.
pub fn count(
    connection: &Connection,
    store: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<u64>) + 'static,
) {
    let range = range.clone();
    single_store(
        connection,
        store,
        TransactionMode::ReadOnly,
        continuation,
        move |store, cont| store.count(&range, move |result| cont.resolve(result)),
    );
}

/// The first record in `range`, if any.
pub fn get_one(
    connection: &Connection,
    store: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<Option<Value>>) + 'static,
) {
    let range = range.clone();
    single_store(
        connection,
        store,
        TransactionMode::ReadOnly,
        continuation,
        move |store, cont| store.get_one(&range, move |result| cont.resolve(result)),
    );
}

/// Every record in `range`, in key order.
pub fn get(
    connection: &Connection,
    store: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<Vec<Value>>) + 'static,
) {
    let range = range.clone();
    single_store(
        connection,
        store,
        TransactionMode::ReadOnly,
        continuation,
        move |store, cont| store.get(&range, move |result| cont.resolve(result)),
    );
}

/// Like [`get`] but keeps at most `limit` records; negative means no
/// limit.
pub fn get_with_limit(
    connection: &Connection,
    store: &str,
    range: &KeyRange,
    limit: i64,
    continuation: impl FnOnce(IdbResult<Vec<Value>>) + 'static,
) {
    let range = range.clone();
    single_store(
        connection,
        store,
        TransactionMode::ReadOnly,
        continuation,
        move |store, cont| {
            store.get_with_limit(&range, limit, move |result| cont.resolve(result));
        },
    );
}

/// The first primary key in `range`, if any.
pub fn get_one_key(
    connection: &Connection,
    store: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<Option<Key>>) + 'static,
) {
    let range = range.clone();
    single_store(
        connection,
        store,
        TransactionMode::ReadOnly,
        continuation,
        move |store, cont| store.get_one_key(&range, move |result| cont.resolve(result)),
    );
}

/// Every primary key in `range`, in order.
pub fn get_keys(
    connection: &Connection,
    store: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<Vec<Key>>) + 'static,
) {
    let range = range.clone();
    single_store(
        connection,
        store,
        TransactionMode::ReadOnly,
        continuation,
        move |store, cont| store.get_keys(&range, move |result| cont.resolve(result)),
    );
}

/// Like [`get_keys`] but keeps at most `limit` keys; negative means no
/// limit.
pub fn get_keys_with_limit(
    connection: &Connection,
    store: &str,
    range: &KeyRange,
    limit: i64,
    continuation: impl FnOnce(IdbResult<Vec<Key>>) + 'static,
) {
    let range = range.clone();
    single_store(
        connection,
        store,
        TransactionMode::ReadOnly,
        continuation,
        move |store, cont| {
            store.get_keys_with_limit(&range, limit, move |result| cont.resolve(result));
        },
    );
}

// === Index operations ===

/// Counts index entries in `range`.
pub fn index_count(
    connection: &Connection,
    store: &str,
    index: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<u64>) + 'static,
) {
    let range = range.clone();
    single_index(connection, store, index, continuation, move |index, cont| {
        index.count(&range, move |result| cont.resolve(result));
    });
}

/// The first matching record in index order, if any.
pub fn index_get_one(
    connection: &Connection,
    store: &str,
    index: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<Option<Value>>) + 'static,
) {
    let range = range.clone();
    single_index(connection, store, index, continuation, move |index, cont| {
        index.get_one(&range, move |result| cont.resolve(result));
    });
}

/// Every matching record, in index order.
pub fn index_get(
    connection: &Connection,
    store: &str,
    index: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<Vec<Value>>) + 'static,
) {
    let range = range.clone();
    single_index(connection, store, index, continuation, move |index, cont| {
        index.get(&range, move |result| cont.resolve(result));
    });
}

/// Like [`index_get`] but keeps at most `limit` records; negative means
/// no limit.
pub fn index_get_with_limit(
    connection: &Connection,
    store: &str,
    index: &str,
    range: &KeyRange,
    limit: i64,
    continuation: impl FnOnce(IdbResult<Vec<Value>>) + 'static,
) {
    let range = range.clone();
    single_index(connection, store, index, continuation, move |index, cont| {
        index.get_with_limit(&range, limit, move |result| cont.resolve(result));
    });
}

/// Primary key of the first match, if any.
pub fn index_get_one_key(
    connection: &Connection,
    store: &str,
    index: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<Option<Key>>) + 'static,
) {
    let range = range.clone();
    single_index(connection, store, index, continuation, move |index, cont| {
        index.get_one_key(&range, move |result| cont.resolve(result));
    });
}

/// Primary keys of every match, in index order.
pub fn index_get_keys(
    connection: &Connection,
    store: &str,
    index: &str,
    range: &KeyRange,
    continuation: impl FnOnce(IdbResult<Vec<Key>>) + 'static,
) {
    let range = range.clone();
    single_index(connection, store, index, continuation, move |index, cont| {
        index.get_keys(&range, move |result| cont.resolve(result));
    });
}

/// Like [`index_get_keys`] but keeps at most `limit` keys; negative
/// means no limit.
pub fn index_get_keys_with_limit(
    connection: &Connection,
    store: &str,
    index: &str,
    range: &KeyRange,
    limit: i64,
    continuation: impl FnOnce(IdbResult<Vec<Key>>) + 'static,
) {
    let range = range.clone();
    single_index(connection, store, index, continuation, move |index, cont| {
        index.get_keys_with_limit(&range, limit, move |result| cont.resolve(result));
    });
}
