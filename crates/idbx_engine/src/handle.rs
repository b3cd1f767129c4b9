//! Client-facing handles into engine state.
//!
//! Handles are cheap clones around the engine plus an id. They never own
//! lifecycle state themselves; every call consults the engine, so a stale
//! handle fails with a deterministic error instead of acting on a
//! transaction that has moved on.

use std::rc::Rc;

use serde_json::Value;

use crate::engine::{Engine, Operation, RequestSource, TransactionMode, TransactionState};
use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyPath, KeyRange};
use crate::request::{OpResult, Request};
use crate::store::{IndexParams, StoreParams};

struct ConnectionCore {
    engine: Engine,
    id: u64,
}

impl Drop for ConnectionCore {
    fn drop(&mut self) {
        // Dropping the last clone of a connection closes it.
        self.engine.close_connection(self.id);
    }
}

/// An open connection to one database.
///
/// Clones share the connection; it closes when the last clone drops or
/// when [`Connection::close`] is called, whichever comes first. A closed
/// connection refuses new transactions but lets running ones finish.
#[derive(Clone)]
pub struct Connection {
    core: Rc<ConnectionCore>,
}

impl Connection {
    pub(crate) fn new(engine: Engine, id: u64) -> Self {
        Self {
            core: Rc::new(ConnectionCore { engine, id }),
        }
    }

    fn engine(&self) -> &Engine {
        &self.core.engine
    }

    /// Name of the connected database.
    #[must_use]
    pub fn name(&self) -> String {
        self.engine().connection_name(self.core.id)
    }

    /// Version the database had when this connection opened.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.engine().connection_version(self.core.id)
    }

    /// Returns `false` once the connection has closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.engine().connection_is_open(self.core.id)
    }

    /// Names of the database's object stores, in name order.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.engine().connection_store_names(self.core.id)
    }

    /// Starts a transaction over the named stores.
    ///
    /// The transaction accepts requests during the current turn and
    /// during callbacks of its own requests, then commits on its own.
    /// Requesting [`TransactionMode::Upgrade`] directly is refused.
    pub fn transaction(
        &self,
        scope: &[&str],
        mode: TransactionMode,
    ) -> EngineResult<Transaction> {
        let id = self
            .engine()
            .begin_transaction(self.core.id, scope, mode)?;
        Ok(self.engine().transaction_handle(id))
    }

    /// Registers the hook consulted when another open wants this
    /// connection gone. Receives the current version and the requested
    /// one, or `None` when the database is being deleted.
    pub fn set_on_version_change(&self, hook: impl Fn(u32, Option<u32>) + 'static) {
        self.engine().set_version_change_hook(self.core.id, hook);
    }

    /// Registers the hook fired if the engine terminates this connection.
    /// A deliberate [`Connection::close`] does not fire it.
    pub fn set_on_close(&self, hook: impl FnOnce() + 'static) {
        self.engine().set_close_hook(self.core.id, hook);
    }

    /// Closes the connection. Safe to call more than once.
    pub fn close(&self) {
        self.engine().close_connection(self.core.id);
    }
}

/// A transaction handle.
#[derive(Clone)]
pub struct Transaction {
    engine: Engine,
    id: u64,
}

impl Transaction {
    pub(crate) fn new(engine: Engine, id: u64) -> Self {
        Self { engine, id }
    }

    /// Access mode fixed at creation.
    #[must_use]
    pub fn mode(&self) -> TransactionMode {
        self.engine.transaction_mode(self.id)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.engine.transaction_state(self.id)
    }

    /// Stores reachable through this transaction. For an upgrade
    /// transaction this tracks schema changes as they happen.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.engine.transaction_store_names(self.id)
    }

    /// Looks up a store in scope.
    ///
    /// Fails if the transaction has finished or the store is not part of
    /// its scope.
    pub fn object_store(&self, name: &str) -> EngineResult<ObjectStore> {
        let params = self.engine.store_params(self.id, name)?;
        Ok(ObjectStore {
            engine: self.engine.clone(),
            transaction: self.id,
            name: name.to_owned(),
            params,
        })
    }

    /// Creates an object store. Upgrade transactions only.
    pub fn create_object_store(
        &self,
        name: &str,
        params: StoreParams,
    ) -> EngineResult<ObjectStore> {
        self.engine.create_store(self.id, name, params.clone())?;
        Ok(ObjectStore {
            engine: self.engine.clone(),
            transaction: self.id,
            name: name.to_owned(),
            params,
        })
    }

    /// Deletes an object store and its indexes. Upgrade transactions
    /// only.
    pub fn delete_object_store(&self, name: &str) -> EngineResult<()> {
        self.engine.delete_store(self.id, name)
    }

    /// Aborts the transaction, rolling back everything it did.
    ///
    /// Pending requests fail with an abort error. Fails if the
    /// transaction already finished.
    pub fn abort(&self) -> EngineResult<()> {
        self.engine.abort_requested(self.id)
    }

    /// Registers the hook fired after a successful commit.
    pub fn set_on_complete(&self, hook: impl FnOnce() + 'static) {
        self.engine.set_complete_hook(self.id, hook);
    }

    /// Registers the hook fired after an abort, with its cause.
    pub fn set_on_abort(&self, hook: impl FnOnce(EngineError) + 'static) {
        self.engine.set_abort_hook(self.id, hook);
    }
}

/// An object store viewed through one transaction.
///
/// Key-handling parameters are captured at lookup time; they cannot
/// change while a store exists.
#[derive(Clone)]
pub struct ObjectStore {
    engine: Engine,
    transaction: u64,
    name: String,
    params: StoreParams,
}

impl ObjectStore {
    /// Store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// In-line key location, if the store uses one.
    #[must_use]
    pub fn key_path(&self) -> Option<&KeyPath> {
        self.params.key_path.as_ref()
    }

    /// Whether the store generates keys.
    #[must_use]
    pub fn auto_increment(&self) -> bool {
        self.params.auto_increment
    }

    fn submit(&self, operation: Operation) -> EngineResult<Request<OpResult>> {
        self.engine.submit(
            self.transaction,
            RequestSource::Store(self.name.clone()),
            operation,
        )
    }

    /// Stores a record, failing if its key is already taken.
    ///
    /// `key` is the explicit out-of-line key; stores with a key path
    /// refuse it. The request succeeds with the key the record landed
    /// under.
    pub fn add(&self, value: Value, key: Option<Key>) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::Add { value, key })
    }

    /// Stores a record, overwriting any existing one under the same key.
    pub fn put(&self, value: Value, key: Option<Key>) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::Put { value, key })
    }

    /// First record value in `range`, by key order.
    pub fn get(&self, range: KeyRange) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::Get { range })
    }

    /// Record values in `range`, by key order, up to `limit`.
    pub fn get_all(
        &self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::GetAll { range, limit })
    }

    /// First primary key in `range`.
    pub fn get_key(&self, range: KeyRange) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::GetKey { range })
    }

    /// Primary keys in `range`, up to `limit`.
    pub fn get_all_keys(
        &self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::GetAllKeys { range, limit })
    }

    /// Number of records in `range`.
    pub fn count(&self, range: KeyRange) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::Count { range })
    }

    /// Deletes every record in `range`.
    pub fn delete(&self, range: KeyRange) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::Delete { range })
    }

    /// Deletes every record in the store.
    pub fn clear(&self) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::Clear)
    }

    /// Looks up an index of this store.
    pub fn index(&self, name: &str) -> EngineResult<Index> {
        let (key_path, params) = self.engine.index_meta(self.transaction, &self.name, name)?;
        Ok(Index {
            engine: self.engine.clone(),
            transaction: self.transaction,
            store: self.name.clone(),
            name: name.to_owned(),
            key_path,
            params,
        })
    }

    /// Names of this store's indexes, in name order.
    pub fn index_names(&self) -> EngineResult<Vec<String>> {
        self.engine.store_index_names(self.transaction, &self.name)
    }

    /// Creates an index over this store, backfilling existing records.
    /// Upgrade transactions only.
    pub fn create_index(
        &self,
        name: &str,
        key_path: KeyPath,
        params: IndexParams,
    ) -> EngineResult<Index> {
        self.engine.create_index(
            self.transaction,
            &self.name,
            name,
            key_path.clone(),
            params,
        )?;
        Ok(Index {
            engine: self.engine.clone(),
            transaction: self.transaction,
            store: self.name.clone(),
            name: name.to_owned(),
            key_path,
            params,
        })
    }

    /// Deletes an index. Upgrade transactions only.
    pub fn delete_index(&self, name: &str) -> EngineResult<()> {
        self.engine.delete_index(self.transaction, &self.name, name)
    }
}

/// An index viewed through one transaction. Read-only.
#[derive(Clone)]
pub struct Index {
    engine: Engine,
    transaction: u64,
    store: String,
    name: String,
    key_path: KeyPath,
    params: IndexParams,
}

impl Index {
    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the store the index belongs to.
    #[must_use]
    pub fn store_name(&self) -> &str {
        &self.store
    }

    /// Where index keys come from inside record values.
    #[must_use]
    pub fn key_path(&self) -> &KeyPath {
        &self.key_path
    }

    /// Whether two records may share an index key.
    #[must_use]
    pub fn unique(&self) -> bool {
        self.params.unique
    }

    /// Whether arrays at the key path expand to one entry per element.
    #[must_use]
    pub fn multi_entry(&self) -> bool {
        self.params.multi_entry
    }

    fn submit(&self, operation: Operation) -> EngineResult<Request<OpResult>> {
        self.engine.submit(
            self.transaction,
            RequestSource::Index {
                store: self.store.clone(),
                index: self.name.clone(),
            },
            operation,
        )
    }

    /// First record value whose index key falls in `range`.
    pub fn get(&self, range: KeyRange) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::Get { range })
    }

    /// Record values in index key order, up to `limit`. A multi-entry
    /// index may yield a record once per matching entry.
    pub fn get_all(
        &self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::GetAll { range, limit })
    }

    /// First primary key whose index key falls in `range`.
    pub fn get_key(&self, range: KeyRange) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::GetKey { range })
    }

    /// Primary keys in index key order, up to `limit`.
    pub fn get_all_keys(
        &self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::GetAllKeys { range, limit })
    }

    /// Number of index entries in `range`.
    pub fn count(&self, range: KeyRange) -> EngineResult<Request<OpResult>> {
        self.submit(Operation::Count { range })
    }
}
