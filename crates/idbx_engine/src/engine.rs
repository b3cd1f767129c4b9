//! Engine state and lifecycle orchestration.
//!
//! One [`Engine`] owns every database, connection, and transaction. All
//! externally visible progress happens on the engine's task queue:
//! opening a database, running a request, committing a transaction. The
//! embedding program drives the queue with [`Engine::run_until_idle`] and
//! observes results through completion handlers.
//!
//! Transactions auto-commit. Each one accepts requests during the turn
//! that created it and during callbacks of its own requests; when the
//! gate is shut and no work remains queued, the transaction commits. A
//! failed request aborts the whole transaction after its failure handler
//! has run.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::handle::{Connection, Transaction};
use crate::key::{Key, KeyPath, KeyRange};
use crate::request::{OpResult, OpenRequest, Request, UpgradeEvent};
use crate::store::{IndexParams, StoreParams, StoreState};
use crate::task::TaskQueue;

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Reads only; runs concurrently with other read-only transactions.
    ReadOnly,
    /// Reads and writes; exclusive over its scope.
    ReadWrite,
    /// Schema changes during a version upgrade; exclusive over the whole
    /// database. Only the engine starts these.
    Upgrade,
}

impl TransactionMode {
    /// Returns `true` if the mode permits mutation.
    #[must_use]
    pub fn is_write(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, waiting for conflicting earlier transactions to finish.
    Pending,
    /// Executing requests.
    Running,
    /// Finished; every effect is durable.
    Committed,
    /// Finished; every effect was rolled back.
    Aborted,
}

impl TransactionState {
    /// Returns `true` once the transaction can no longer change state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Name and version of an existing database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    /// Database name.
    pub name: String,
    /// Current version, at least 1.
    pub version: u32,
}

pub(crate) struct EngineShared {
    state: RefCell<EngineState>,
    tasks: TaskQueue,
}

#[derive(Default)]
struct EngineState {
    databases: BTreeMap<String, DatabaseRecord>,
    connections: BTreeMap<u64, ConnectionRecord>,
    transactions: BTreeMap<u64, TransactionRecord>,
    waiting: BTreeMap<String, VecDeque<OpenWaiter>>,
    next_connection: u64,
    next_transaction: u64,
}

struct DatabaseRecord {
    version: u32,
    stores: BTreeMap<String, StoreState>,
}

struct ConnectionRecord {
    database: String,
    version: u32,
    open: bool,
    on_version_change: Option<Rc<dyn Fn(u32, Option<u32>)>>,
    on_close: Option<Box<dyn FnOnce()>>,
}

struct TransactionRecord {
    connection: u64,
    database: String,
    scope: BTreeSet<String>,
    mode: TransactionMode,
    state: TransactionState,
    /// Whether the transaction currently accepts requests. Open during
    /// the creating turn and during callbacks of its own requests.
    gate: bool,
    queue: VecDeque<QueuedRequest>,
    pump_scheduled: bool,
    rollback: Option<Rollback>,
    on_complete: Option<Box<dyn FnOnce()>>,
    on_abort: Option<Box<dyn FnOnce(EngineError)>>,
    upgrade_open: Option<UpgradeOpen>,
}

/// Ties an upgrade transaction back to the open request it serves.
struct UpgradeOpen {
    request: OpenRequest,
    connection: u64,
}

struct QueuedRequest {
    source: RequestSource,
    operation: Operation,
    request: Request<OpResult>,
}

/// What a request runs against.
pub(crate) enum RequestSource {
    /// The store itself, by name.
    Store(String),
    /// An index of a store.
    Index {
        /// Owning store.
        store: String,
        /// Index name.
        index: String,
    },
}

impl RequestSource {
    fn store_name(&self) -> &str {
        match self {
            Self::Store(name) | Self::Index { store: name, .. } => name,
        }
    }
}

/// A deferred store or index operation.
pub(crate) enum Operation {
    Add { value: Value, key: Option<Key> },
    Put { value: Value, key: Option<Key> },
    Get { range: KeyRange },
    GetAll { range: KeyRange, limit: Option<usize> },
    GetKey { range: KeyRange },
    GetAllKeys { range: KeyRange, limit: Option<usize> },
    Count { range: KeyRange },
    Delete { range: KeyRange },
    Clear,
}

impl Operation {
    fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Add { .. } | Self::Put { .. } | Self::Delete { .. } | Self::Clear
        )
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Put { .. } => "put",
            Self::Get { .. } => "get",
            Self::GetAll { .. } => "get_all",
            Self::GetKey { .. } => "get_key",
            Self::GetAllKeys { .. } => "get_all_keys",
            Self::Count { .. } => "count",
            Self::Delete { .. } => "delete",
            Self::Clear => "clear",
        }
    }
}

/// What to restore if the transaction aborts.
enum Rollback {
    /// Pre-transaction copies of the scoped stores.
    Stores(BTreeMap<String, StoreState>),
    /// Pre-upgrade state of the whole database.
    Database {
        existed: bool,
        version: u32,
        stores: BTreeMap<String, StoreState>,
    },
}

/// An upgrade or deletion parked behind open connections.
enum OpenWaiter {
    Upgrade {
        version: u32,
        request: OpenRequest,
        notified: BTreeSet<u64>,
    },
    Delete {
        request: Request<()>,
        notified: BTreeSet<u64>,
    },
}

/// A single-threaded object-store engine.
///
/// Cloning shares the underlying state; handles hold clones internally,
/// so an engine lives as long as any handle into it. Nothing here is
/// `Send`: the engine, its handles, and every callback stay on one
/// thread.
#[derive(Clone)]
pub struct Engine {
    pub(crate) shared: Rc<EngineShared>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an empty engine with an idle task queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Rc::new(EngineShared {
                state: RefCell::new(EngineState::default()),
                tasks: TaskQueue::new(),
            }),
        }
    }

    /// Runs queued jobs until none remain.
    ///
    /// Jobs push further jobs; a single call drains everything reachable,
    /// including transaction commits triggered by the last callback.
    pub fn run_until_idle(&self) {
        while let Some(job) = self.shared.tasks.pop() {
            job();
        }
    }

    /// Returns `true` when no work is queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.tasks.is_empty()
    }

    /// Lists existing databases with their versions, in name order.
    pub fn databases(&self) -> Request<Vec<DatabaseInfo>> {
        let request = Request::new();
        let reply = request.clone();
        self.push_job(move |engine| {
            let infos: Vec<DatabaseInfo> = engine
                .shared
                .state
                .borrow()
                .databases
                .iter()
                .map(|(name, db)| DatabaseInfo {
                    name: name.clone(),
                    version: db.version,
                })
                .collect();
            reply.fire_success(infos);
        });
        request
    }

    /// Opens a database, creating or upgrading it to `version`.
    ///
    /// Fails immediately for version zero. Everything else is reported
    /// through the returned request: an upgrade event when the stored
    /// version is lower, a blocked notification when open connections
    /// hold the upgrade back, then success with a connection or an error.
    pub fn open(&self, name: &str, version: u32) -> EngineResult<OpenRequest> {
        if version == 0 {
            return Err(EngineError::data("database version must be at least 1"));
        }
        let request = OpenRequest::new();
        let job_request = request.clone();
        let name = name.to_owned();
        self.push_job(move |engine| {
            engine.open_attempt(name, version, job_request, BTreeSet::new());
        });
        Ok(request)
    }

    /// Deletes a database outright.
    ///
    /// Waits for open connections to go away, asking each to step aside
    /// through its version-change hook. Deleting a database that does not
    /// exist succeeds.
    pub fn delete_database(&self, name: &str) -> Request<()> {
        let request = Request::new();
        let job_request = request.clone();
        let name = name.to_owned();
        self.push_job(move |engine| {
            engine.delete_attempt(name, job_request, BTreeSet::new());
        });
        request
    }

    /// Forcibly closes every connection to a database.
    ///
    /// Live transactions on those connections abort, then each
    /// connection's close hook fires. Models the engine evicting clients
    /// on its own initiative.
    pub fn terminate(&self, name: &str) {
        let name = name.to_owned();
        self.push_job(move |engine| engine.terminate_database(&name));
    }

    // === Job plumbing ===

    fn push_job(&self, job: impl FnOnce(Engine) + 'static) {
        let weak = Rc::downgrade(&self.shared);
        self.shared.tasks.push(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                job(Engine { shared });
            }
        }));
    }

    fn push_settle(&self, transaction: u64) {
        self.push_job(move |engine| engine.settle_transaction(transaction));
    }

    fn push_pump(&self, transaction: u64) {
        self.push_job(move |engine| engine.pump_transaction(transaction));
    }

    // === Opening and upgrades ===

    fn open_attempt(
        &self,
        name: String,
        version: u32,
        request: OpenRequest,
        mut notified: BTreeSet<u64>,
    ) {
        enum Outcome {
            Fail(EngineError),
            Connected(u64),
            Upgrade(u32),
            Blocked {
                current: u32,
                holders: Vec<(u64, Option<Rc<dyn Fn(u32, Option<u32>)>>)>,
            },
        }

        let outcome = {
            let mut state = self.shared.state.borrow_mut();
            let current = state.databases.get(&name).map_or(0, |db| db.version);
            if version < current {
                Outcome::Fail(EngineError::version(format!(
                    "requested version {version} but '{name}' is already at {current}"
                )))
            } else if version == current {
                Outcome::Connected(create_connection(&mut state, &name, current))
            } else if database_busy(&state, &name) {
                let holders = state
                    .connections
                    .iter()
                    .filter(|(id, conn)| {
                        conn.open && conn.database == name && !notified.contains(id)
                    })
                    .map(|(id, conn)| (*id, conn.on_version_change.clone()))
                    .collect();
                Outcome::Blocked { current, holders }
            } else {
                Outcome::Upgrade(current)
            }
        };

        match outcome {
            Outcome::Fail(error) => {
                debug!(database = %name, version, %error, "open rejected");
                request.fire_error(error);
                self.schedule_retry(&name);
            }
            Outcome::Connected(connection) => {
                debug!(database = %name, version, "database opened");
                request.fire_success(self.connection_handle(connection));
            }
            Outcome::Blocked { current, holders } => {
                for (id, hook) in holders {
                    notified.insert(id);
                    if let Some(hook) = hook {
                        hook(current, Some(version));
                    }
                }
                // A version-change hook may have closed the last holder.
                let still_busy = database_busy(&self.shared.state.borrow(), &name);
                if still_busy {
                    debug!(
                        database = %name,
                        current,
                        requested = version,
                        "open blocked by existing connections"
                    );
                    request.fire_blocked(current, version);
                    self.shared
                        .state
                        .borrow_mut()
                        .waiting
                        .entry(name)
                        .or_default()
                        .push_back(OpenWaiter::Upgrade {
                            version,
                            request,
                            notified,
                        });
                } else {
                    self.begin_upgrade(name, version, current, request);
                }
            }
            Outcome::Upgrade(current) => self.begin_upgrade(name, version, current, request),
        }
    }

    fn begin_upgrade(&self, name: String, version: u32, old: u32, request: OpenRequest) {
        let (transaction, event) = {
            let mut state = self.shared.state.borrow_mut();
            let connection = create_connection(&mut state, &name, version);
            let existed = state.databases.contains_key(&name);
            let snapshot = state
                .databases
                .get(&name)
                .map(|db| db.stores.clone())
                .unwrap_or_default();
            let db = state
                .databases
                .entry(name.clone())
                .or_insert_with(|| DatabaseRecord {
                    version,
                    stores: BTreeMap::new(),
                });
            db.version = version;
            let id = state.next_transaction;
            state.next_transaction += 1;
            state.transactions.insert(
                id,
                TransactionRecord {
                    connection,
                    database: name.clone(),
                    scope: BTreeSet::new(),
                    mode: TransactionMode::Upgrade,
                    state: TransactionState::Running,
                    gate: true,
                    queue: VecDeque::new(),
                    pump_scheduled: false,
                    rollback: Some(Rollback::Database {
                        existed,
                        version: old,
                        stores: snapshot,
                    }),
                    on_complete: None,
                    on_abort: None,
                    upgrade_open: Some(UpgradeOpen {
                        request: request.clone(),
                        connection,
                    }),
                },
            );
            (
                id,
                UpgradeEvent {
                    transaction: self.transaction_handle(id),
                    old_version: old,
                    new_version: version,
                },
            )
        };
        debug!(database = %name, from = old, to = version, "upgrade transaction started");
        self.push_settle(transaction);
        request.fire_upgrade(event);
    }

    fn delete_attempt(&self, name: String, request: Request<()>, mut notified: BTreeSet<u64>) {
        enum Outcome {
            Absent,
            Deleted,
            Blocked {
                current: u32,
                holders: Vec<(u64, Option<Rc<dyn Fn(u32, Option<u32>)>>)>,
            },
        }

        let outcome = {
            let mut state = self.shared.state.borrow_mut();
            match state.databases.get(&name) {
                None => Outcome::Absent,
                Some(db) => {
                    let current = db.version;
                    if database_busy(&state, &name) {
                        let holders = state
                            .connections
                            .iter()
                            .filter(|(id, conn)| {
                                conn.open && conn.database == name && !notified.contains(id)
                            })
                            .map(|(id, conn)| (*id, conn.on_version_change.clone()))
                            .collect();
                        Outcome::Blocked { current, holders }
                    } else {
                        state.databases.remove(&name);
                        Outcome::Deleted
                    }
                }
            }
        };

        match outcome {
            Outcome::Absent => {
                debug!(database = %name, "delete of missing database is a no-op");
                request.fire_success(());
            }
            Outcome::Deleted => {
                debug!(database = %name, "database deleted");
                request.fire_success(());
                self.schedule_retry(&name);
            }
            Outcome::Blocked { current, holders } => {
                for (id, hook) in holders {
                    notified.insert(id);
                    if let Some(hook) = hook {
                        hook(current, None);
                    }
                }
                let still_busy = database_busy(&self.shared.state.borrow(), &name);
                if still_busy {
                    debug!(database = %name, "delete waiting for open connections");
                    self.shared
                        .state
                        .borrow_mut()
                        .waiting
                        .entry(name)
                        .or_default()
                        .push_back(OpenWaiter::Delete { request, notified });
                } else {
                    self.delete_attempt(name, request, notified);
                }
            }
        }
    }

    fn terminate_database(&self, name: &str) {
        let (doomed, hooks) = {
            let mut state = self.shared.state.borrow_mut();
            let doomed: Vec<u64> = state
                .transactions
                .iter()
                .filter(|(_, tx)| tx.database == name && !tx.state.is_terminal())
                .map(|(id, _)| *id)
                .collect();
            let mut hooks = Vec::new();
            for conn in state.connections.values_mut() {
                if conn.open && conn.database == name {
                    conn.open = false;
                    conn.on_version_change = None;
                    if let Some(hook) = conn.on_close.take() {
                        hooks.push(hook);
                    }
                }
            }
            (doomed, hooks)
        };
        debug!(database = %name, "terminating all connections");
        for id in doomed {
            self.abort_transaction(id, EngineError::abort("the engine terminated the connection"));
        }
        for hook in hooks {
            hook();
        }
        self.schedule_retry(name);
    }

    /// Queues another look at parked upgrades or deletions for `name`.
    fn schedule_retry(&self, name: &str) {
        let parked = self.shared.state.borrow().waiting.contains_key(name);
        if !parked {
            return;
        }
        let name = name.to_owned();
        self.push_job(move |engine| engine.retry_waiters(&name));
    }

    fn retry_waiters(&self, name: &str) {
        let waiter = {
            let mut state = self.shared.state.borrow_mut();
            if database_busy(&state, name) {
                return;
            }
            let Some(queue) = state.waiting.get_mut(name) else {
                return;
            };
            let waiter = queue.pop_front();
            if queue.is_empty() {
                state.waiting.remove(name);
            }
            waiter
        };
        match waiter {
            Some(OpenWaiter::Upgrade {
                version,
                request,
                notified,
            }) => self.open_attempt(name.to_owned(), version, request, notified),
            Some(OpenWaiter::Delete { request, notified }) => {
                self.delete_attempt(name.to_owned(), request, notified)
            }
            None => {}
        }
    }

    // === Connections ===

    pub(crate) fn connection_handle(&self, id: u64) -> Connection {
        Connection::new(self.clone(), id)
    }

    pub(crate) fn close_connection(&self, id: u64) {
        let database = {
            let mut state = self.shared.state.borrow_mut();
            let Some(conn) = state.connections.get_mut(&id) else {
                return;
            };
            if !conn.open {
                return;
            }
            conn.open = false;
            conn.on_version_change = None;
            conn.on_close = None;
            conn.database.clone()
        };
        debug!(connection = id, database = %database, "connection closed");
        self.schedule_retry(&database);
    }

    pub(crate) fn connection_name(&self, id: u64) -> String {
        self.shared
            .state
            .borrow()
            .connections
            .get(&id)
            .map(|conn| conn.database.clone())
            .unwrap_or_default()
    }

    pub(crate) fn connection_version(&self, id: u64) -> u32 {
        self.shared
            .state
            .borrow()
            .connections
            .get(&id)
            .map_or(0, |conn| conn.version)
    }

    pub(crate) fn connection_is_open(&self, id: u64) -> bool {
        self.shared
            .state
            .borrow()
            .connections
            .get(&id)
            .is_some_and(|conn| conn.open)
    }

    pub(crate) fn connection_store_names(&self, id: u64) -> Vec<String> {
        let state = self.shared.state.borrow();
        state
            .connections
            .get(&id)
            .and_then(|conn| state.databases.get(&conn.database))
            .map(|db| db.stores.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn set_version_change_hook(
        &self,
        id: u64,
        hook: impl Fn(u32, Option<u32>) + 'static,
    ) {
        if let Some(conn) = self.shared.state.borrow_mut().connections.get_mut(&id) {
            conn.on_version_change = Some(Rc::new(hook));
        }
    }

    pub(crate) fn set_close_hook(&self, id: u64, hook: impl FnOnce() + 'static) {
        if let Some(conn) = self.shared.state.borrow_mut().connections.get_mut(&id) {
            conn.on_close = Some(Box::new(hook));
        }
    }

    // === Transactions ===

    pub(crate) fn transaction_handle(&self, id: u64) -> Transaction {
        Transaction::new(self.clone(), id)
    }

    pub(crate) fn begin_transaction(
        &self,
        connection: u64,
        scope: &[&str],
        mode: TransactionMode,
    ) -> EngineResult<u64> {
        let (id, database) = {
            let mut state = self.shared.state.borrow_mut();
            let conn = state
                .connections
                .get(&connection)
                .ok_or_else(|| EngineError::invalid_state("connection no longer exists"))?;
            if !conn.open {
                return Err(EngineError::invalid_state("connection is closed"));
            }
            if mode == TransactionMode::Upgrade {
                return Err(EngineError::invalid_access(
                    "upgrade transactions are started by version upgrades, not directly",
                ));
            }
            let database = conn.database.clone();
            let scope_set: BTreeSet<String> = scope.iter().map(|s| (*s).to_owned()).collect();
            if scope_set.is_empty() {
                return Err(EngineError::invalid_access(
                    "transaction scope must name at least one store",
                ));
            }
            let db = state
                .databases
                .get(&database)
                .ok_or_else(|| EngineError::invalid_state("database no longer exists"))?;
            for name in &scope_set {
                if !db.stores.contains_key(name) {
                    return Err(EngineError::not_found(format!(
                        "object store '{name}' does not exist"
                    )));
                }
            }
            let id = state.next_transaction;
            state.next_transaction += 1;
            state.transactions.insert(
                id,
                TransactionRecord {
                    connection,
                    database: database.clone(),
                    scope: scope_set,
                    mode,
                    state: TransactionState::Pending,
                    gate: true,
                    queue: VecDeque::new(),
                    pump_scheduled: false,
                    rollback: None,
                    on_complete: None,
                    on_abort: None,
                    upgrade_open: None,
                },
            );
            (id, database)
        };
        trace!(transaction = id, ?mode, "transaction created");
        self.push_settle(id);
        self.try_start_transactions(&database);
        Ok(id)
    }

    pub(crate) fn transaction_mode(&self, id: u64) -> TransactionMode {
        self.shared
            .state
            .borrow()
            .transactions
            .get(&id)
            .map_or(TransactionMode::ReadOnly, |tx| tx.mode)
    }

    pub(crate) fn transaction_state(&self, id: u64) -> TransactionState {
        self.shared
            .state
            .borrow()
            .transactions
            .get(&id)
            .map_or(TransactionState::Aborted, |tx| tx.state)
    }

    pub(crate) fn transaction_store_names(&self, id: u64) -> Vec<String> {
        let state = self.shared.state.borrow();
        let Some(tx) = state.transactions.get(&id) else {
            return Vec::new();
        };
        if tx.mode == TransactionMode::Upgrade {
            state
                .databases
                .get(&tx.database)
                .map(|db| db.stores.keys().cloned().collect())
                .unwrap_or_default()
        } else {
            tx.scope.iter().cloned().collect()
        }
    }

    pub(crate) fn set_complete_hook(&self, id: u64, hook: impl FnOnce() + 'static) {
        if let Some(tx) = self.shared.state.borrow_mut().transactions.get_mut(&id) {
            tx.on_complete = Some(Box::new(hook));
        }
    }

    pub(crate) fn set_abort_hook(&self, id: u64, hook: impl FnOnce(EngineError) + 'static) {
        if let Some(tx) = self.shared.state.borrow_mut().transactions.get_mut(&id) {
            tx.on_abort = Some(Box::new(hook));
        }
    }

    /// Explicit abort requested through a handle.
    pub(crate) fn abort_requested(&self, id: u64) -> EngineResult<()> {
        {
            let state = self.shared.state.borrow();
            let tx = state
                .transactions
                .get(&id)
                .ok_or_else(|| EngineError::invalid_state("transaction no longer exists"))?;
            if tx.state.is_terminal() {
                return Err(EngineError::invalid_state(
                    "transaction has already finished",
                ));
            }
        }
        self.abort_transaction(id, EngineError::abort("transaction aborted by request"));
        Ok(())
    }

    /// Starts every pending transaction on `database` that no earlier
    /// conflicting transaction still blocks.
    fn try_start_transactions(&self, database: &str) {
        let started = {
            let mut state = self.shared.state.borrow_mut();
            let pending: Vec<u64> = state
                .transactions
                .iter()
                .filter(|(_, tx)| tx.database == database && tx.state == TransactionState::Pending)
                .map(|(id, _)| *id)
                .collect();
            let mut started = Vec::new();
            for id in pending {
                if !startable(&state, id) {
                    continue;
                }
                let snapshot = state.transactions.get(&id).and_then(|tx| {
                    if !tx.mode.is_write() {
                        return None;
                    }
                    let db = state.databases.get(&tx.database);
                    Some(
                        tx.scope
                            .iter()
                            .filter_map(|name| {
                                let store = db.and_then(|db| db.stores.get(name))?;
                                Some((name.clone(), store.clone()))
                            })
                            .collect::<BTreeMap<_, _>>(),
                    )
                });
                if let Some(tx) = state.transactions.get_mut(&id) {
                    tx.state = TransactionState::Running;
                    tx.rollback = snapshot.map(Rollback::Stores);
                    trace!(transaction = id, "transaction started");
                    if !tx.queue.is_empty() && !tx.pump_scheduled {
                        tx.pump_scheduled = true;
                        self.push_pump(id);
                    }
                }
                started.push(id);
            }
            started
        };
        // A transaction started with nothing queued and its gate already
        // shut commits straight away.
        for id in started {
            self.maybe_finish(id);
        }
    }

    /// End-of-turn job: shuts the activation gate opened at creation.
    fn settle_transaction(&self, id: u64) {
        {
            let mut state = self.shared.state.borrow_mut();
            let Some(tx) = state.transactions.get_mut(&id) else {
                return;
            };
            tx.gate = false;
        }
        self.maybe_finish(id);
    }

    /// Runs the next queued request of a transaction, then fires its
    /// completion handler with the gate reopened for follow-up requests.
    fn pump_transaction(&self, id: u64) {
        let executed = {
            let mut state = self.shared.state.borrow_mut();
            let Some(tx) = state.transactions.get_mut(&id) else {
                return;
            };
            tx.pump_scheduled = false;
            if tx.state != TransactionState::Running {
                return;
            }
            let Some(next) = tx.queue.pop_front() else {
                return;
            };
            let database = tx.database.clone();
            let result = execute_operation(&mut state, &database, &next.source, next.operation);
            if let Some(tx) = state.transactions.get_mut(&id) {
                // Reopen the gate for the duration of the callback.
                tx.gate = true;
                if !tx.queue.is_empty() && !tx.pump_scheduled {
                    tx.pump_scheduled = true;
                    self.push_pump(id);
                }
            }
            (next.request, result)
        };
        let (request, result) = executed;
        match result {
            Ok(payload) => {
                request.fire_success(payload);
                if let Some(tx) = self.shared.state.borrow_mut().transactions.get_mut(&id) {
                    tx.gate = false;
                }
                self.maybe_finish(id);
            }
            Err(error) => {
                trace!(transaction = id, %error, "request failed; aborting transaction");
                request.fire_error(error.clone());
                if let Some(tx) = self.shared.state.borrow_mut().transactions.get_mut(&id) {
                    tx.gate = false;
                }
                // The failure handler may have aborted explicitly already;
                // abort_transaction is a no-op on finished transactions.
                self.abort_transaction(id, error);
            }
        }
    }

    /// Commits if the transaction is running with nothing left to do.
    fn maybe_finish(&self, id: u64) {
        let ready = {
            let state = self.shared.state.borrow();
            state.transactions.get(&id).is_some_and(|tx| {
                tx.state == TransactionState::Running
                    && !tx.gate
                    && tx.queue.is_empty()
                    && !tx.pump_scheduled
            })
        };
        if ready {
            self.commit_transaction(id);
        }
    }

    fn commit_transaction(&self, id: u64) {
        let finished = {
            let mut state = self.shared.state.borrow_mut();
            let Some(tx) = state.transactions.get_mut(&id) else {
                return;
            };
            if tx.state != TransactionState::Running {
                return;
            }
            tx.state = TransactionState::Committed;
            tx.rollback = None;
            (
                tx.database.clone(),
                tx.on_complete.take(),
                tx.upgrade_open.take(),
            )
        };
        let (database, on_complete, upgrade_open) = finished;
        debug!(transaction = id, database = %database, "transaction committed");
        if let Some(hook) = on_complete {
            hook();
        }
        if let Some(open) = upgrade_open {
            debug!(database = %database, "upgrade complete; delivering connection");
            open.request.fire_success(self.connection_handle(open.connection));
        }
        self.try_start_transactions(&database);
        self.schedule_retry(&database);
    }

    /// Aborts a live transaction: rolls state back, fails queued
    /// requests, fires the abort hook with `cause`.
    pub(crate) fn abort_transaction(&self, id: u64, cause: EngineError) {
        let mut state = self.shared.state.borrow_mut();
        let Some(tx) = state.transactions.get_mut(&id) else {
            return;
        };
        if tx.state.is_terminal() {
            return;
        }
        tx.state = TransactionState::Aborted;
        tx.gate = false;
        let database = tx.database.clone();
        let drained: Vec<Request<OpResult>> = tx.queue.drain(..).map(|q| q.request).collect();
        let on_abort = tx.on_abort.take();
        let upgrade_open = tx.upgrade_open.take();
        match tx.rollback.take() {
            Some(Rollback::Stores(snapshot)) => {
                if let Some(db) = state.databases.get_mut(&database) {
                    for (name, store) in snapshot {
                        db.stores.insert(name, store);
                    }
                }
            }
            Some(Rollback::Database {
                existed,
                version,
                stores,
            }) => {
                if existed {
                    if let Some(db) = state.databases.get_mut(&database) {
                        db.version = version;
                        db.stores = stores;
                    }
                } else {
                    state.databases.remove(&database);
                }
            }
            None => {}
        }
        if let Some(open) = &upgrade_open {
            if let Some(conn) = state.connections.get_mut(&open.connection) {
                conn.open = false;
            }
        }
        drop(state);

        debug!(transaction = id, database = %database, %cause, "transaction aborted");
        for request in drained {
            request.fire_error(EngineError::abort("transaction aborted"));
        }
        if let Some(hook) = on_abort {
            hook(cause.clone());
        }
        if let Some(open) = upgrade_open {
            open.request.fire_error(cause);
        }
        self.try_start_transactions(&database);
        self.schedule_retry(&database);
    }

    // === Requests ===

    pub(crate) fn submit(
        &self,
        transaction: u64,
        source: RequestSource,
        operation: Operation,
    ) -> EngineResult<Request<OpResult>> {
        let (request, pump) = {
            let mut state = self.shared.state.borrow_mut();
            let tx = state
                .transactions
                .get_mut(&transaction)
                .ok_or_else(|| EngineError::invalid_state("transaction no longer exists"))?;
            if tx.state.is_terminal() {
                return Err(EngineError::inactive("transaction has finished"));
            }
            if !tx.gate {
                return Err(EngineError::inactive(
                    "transaction is no longer accepting requests",
                ));
            }
            if operation.is_mutation() && !tx.mode.is_write() {
                return Err(EngineError::read_only(format!(
                    "cannot {} through a read-only transaction",
                    operation.verb()
                )));
            }
            if tx.mode != TransactionMode::Upgrade && !tx.scope.contains(source.store_name()) {
                return Err(EngineError::not_found(format!(
                    "object store '{}' is not in the transaction scope",
                    source.store_name()
                )));
            }
            trace!(transaction, op = operation.verb(), "request queued");
            let request = Request::new();
            tx.queue.push_back(QueuedRequest {
                source,
                operation,
                request: request.clone(),
            });
            let pump = tx.state == TransactionState::Running && !tx.pump_scheduled;
            if pump {
                tx.pump_scheduled = true;
            }
            (request, pump)
        };
        if pump {
            self.push_pump(transaction);
        }
        Ok(request)
    }

    // === Stores and schema ===

    /// Validates a store lookup and returns parameters for the handle.
    pub(crate) fn store_params(&self, transaction: u64, name: &str) -> EngineResult<StoreParams> {
        let state = self.shared.state.borrow();
        let tx = state
            .transactions
            .get(&transaction)
            .ok_or_else(|| EngineError::invalid_state("transaction no longer exists"))?;
        if tx.state.is_terminal() {
            return Err(EngineError::invalid_state("transaction has finished"));
        }
        if tx.mode != TransactionMode::Upgrade && !tx.scope.contains(name) {
            return Err(EngineError::not_found(format!(
                "object store '{name}' is not in the transaction scope"
            )));
        }
        let store = state
            .databases
            .get(&tx.database)
            .and_then(|db| db.stores.get(name))
            .ok_or_else(|| {
                EngineError::not_found(format!("object store '{name}' does not exist"))
            })?;
        Ok(store.params().clone())
    }

    /// Validates an index lookup and returns metadata for the handle.
    pub(crate) fn index_meta(
        &self,
        transaction: u64,
        store: &str,
        index: &str,
    ) -> EngineResult<(KeyPath, IndexParams)> {
        let state = self.shared.state.borrow();
        let tx = state
            .transactions
            .get(&transaction)
            .ok_or_else(|| EngineError::invalid_state("transaction no longer exists"))?;
        if tx.state.is_terminal() {
            return Err(EngineError::invalid_state("transaction has finished"));
        }
        let found = state
            .databases
            .get(&tx.database)
            .and_then(|db| db.stores.get(store))
            .ok_or_else(|| EngineError::not_found(format!("object store '{store}' does not exist")))?
            .index(index)?;
        Ok((found.key_path.clone(), found.params))
    }

    pub(crate) fn store_index_names(
        &self,
        transaction: u64,
        store: &str,
    ) -> EngineResult<Vec<String>> {
        let state = self.shared.state.borrow();
        let tx = state
            .transactions
            .get(&transaction)
            .ok_or_else(|| EngineError::invalid_state("transaction no longer exists"))?;
        if tx.state.is_terminal() {
            return Err(EngineError::invalid_state("transaction has finished"));
        }
        let found = state
            .databases
            .get(&tx.database)
            .and_then(|db| db.stores.get(store))
            .ok_or_else(|| {
                EngineError::not_found(format!("object store '{store}' does not exist"))
            })?;
        Ok(found.index_names())
    }

    pub(crate) fn create_store(
        &self,
        transaction: u64,
        name: &str,
        params: StoreParams,
    ) -> EngineResult<()> {
        let mut state = self.shared.state.borrow_mut();
        let tx = upgrade_transaction(&state, transaction)?;
        let database = tx.database.clone();
        if let Some(path) = &params.key_path {
            path.validate()?;
            if params.auto_increment && path.is_compound() {
                return Err(EngineError::invalid_access(
                    "a key generator cannot fill a compound key path",
                ));
            }
        }
        let db = state
            .databases
            .get_mut(&database)
            .ok_or_else(|| EngineError::invalid_state("database no longer exists"))?;
        if db.stores.contains_key(name) {
            return Err(EngineError::constraint(format!(
                "object store '{name}' already exists"
            )));
        }
        db.stores.insert(name.to_owned(), StoreState::new(params));
        debug!(store = name, database = %database, "object store created");
        Ok(())
    }

    pub(crate) fn delete_store(&self, transaction: u64, name: &str) -> EngineResult<()> {
        let mut state = self.shared.state.borrow_mut();
        let tx = upgrade_transaction(&state, transaction)?;
        let database = tx.database.clone();
        let db = state
            .databases
            .get_mut(&database)
            .ok_or_else(|| EngineError::invalid_state("database no longer exists"))?;
        if db.stores.remove(name).is_none() {
            return Err(EngineError::not_found(format!(
                "object store '{name}' does not exist"
            )));
        }
        debug!(store = name, database = %database, "object store deleted");
        Ok(())
    }

    pub(crate) fn create_index(
        &self,
        transaction: u64,
        store: &str,
        name: &str,
        key_path: KeyPath,
        params: IndexParams,
    ) -> EngineResult<()> {
        let mut state = self.shared.state.borrow_mut();
        let tx = upgrade_transaction(&state, transaction)?;
        let database = tx.database.clone();
        let found = state
            .databases
            .get_mut(&database)
            .and_then(|db| db.stores.get_mut(store))
            .ok_or_else(|| {
                EngineError::not_found(format!("object store '{store}' does not exist"))
            })?;
        found.create_index(name, key_path, params)?;
        debug!(index = name, store, "index created");
        Ok(())
    }

    pub(crate) fn delete_index(
        &self,
        transaction: u64,
        store: &str,
        name: &str,
    ) -> EngineResult<()> {
        let mut state = self.shared.state.borrow_mut();
        let tx = upgrade_transaction(&state, transaction)?;
        let database = tx.database.clone();
        let found = state
            .databases
            .get_mut(&database)
            .and_then(|db| db.stores.get_mut(store))
            .ok_or_else(|| {
                EngineError::not_found(format!("object store '{store}' does not exist"))
            })?;
        found.delete_index(name)?;
        debug!(index = name, store, "index deleted");
        Ok(())
    }
}

/// Checks that `id` is a live, active upgrade transaction.
fn upgrade_transaction(state: &EngineState, id: u64) -> EngineResult<&TransactionRecord> {
    let tx = state
        .transactions
        .get(&id)
        .ok_or_else(|| EngineError::invalid_state("transaction no longer exists"))?;
    if tx.state.is_terminal() {
        return Err(EngineError::invalid_state("transaction has finished"));
    }
    if tx.mode != TransactionMode::Upgrade {
        return Err(EngineError::invalid_state(
            "schema changes require an upgrade transaction",
        ));
    }
    if !tx.gate {
        return Err(EngineError::inactive(
            "upgrade transaction is no longer active",
        ));
    }
    Ok(tx)
}

fn create_connection(state: &mut EngineState, database: &str, version: u32) -> u64 {
    let id = state.next_connection;
    state.next_connection += 1;
    state.connections.insert(
        id,
        ConnectionRecord {
            database: database.to_owned(),
            version,
            open: true,
            on_version_change: None,
            on_close: None,
        },
    );
    id
}

/// A database is busy while any connection to it is open or any of its
/// transactions is still live.
fn database_busy(state: &EngineState, name: &str) -> bool {
    state
        .connections
        .values()
        .any(|conn| conn.open && conn.database == name)
        || state
            .transactions
            .values()
            .any(|tx| tx.database == name && !tx.state.is_terminal())
}

/// A pending transaction may start when no conflicting transaction is
/// running and no conflicting earlier transaction is still pending.
fn startable(state: &EngineState, id: u64) -> bool {
    let Some(me) = state.transactions.get(&id) else {
        return false;
    };
    state.transactions.iter().all(|(other_id, other)| {
        *other_id == id
            || other.database != me.database
            || other.state.is_terminal()
            || (other.state == TransactionState::Pending && *other_id > id)
            || !conflicts(me, other)
    })
}

fn conflicts(a: &TransactionRecord, b: &TransactionRecord) -> bool {
    if !a.mode.is_write() && !b.mode.is_write() {
        return false;
    }
    if a.mode == TransactionMode::Upgrade || b.mode == TransactionMode::Upgrade {
        return true;
    }
    a.scope.intersection(&b.scope).next().is_some()
}

fn execute_operation(
    state: &mut EngineState,
    database: &str,
    source: &RequestSource,
    operation: Operation,
) -> EngineResult<OpResult> {
    let db = state
        .databases
        .get_mut(database)
        .ok_or_else(|| EngineError::invalid_state("database no longer exists"))?;
    match source {
        RequestSource::Store(name) => {
            let store = db.stores.get_mut(name).ok_or_else(|| {
                EngineError::not_found(format!("object store '{name}' does not exist"))
            })?;
            match operation {
                Operation::Add { value, key } => store.insert(value, key, false).map(OpResult::Key),
                Operation::Put { value, key } => store.insert(value, key, true).map(OpResult::Key),
                Operation::Get { range } => store.get(&range).map(OpResult::Value),
                Operation::GetAll { range, limit } => {
                    store.get_all(&range, limit).map(OpResult::Values)
                }
                Operation::GetKey { range } => store.get_key(&range).map(OpResult::FoundKey),
                Operation::GetAllKeys { range, limit } => {
                    store.get_all_keys(&range, limit).map(OpResult::Keys)
                }
                Operation::Count { range } => store.count(&range).map(OpResult::Count),
                Operation::Delete { range } => store.delete(&range).map(|()| OpResult::Done),
                Operation::Clear => {
                    store.clear();
                    Ok(OpResult::Done)
                }
            }
        }
        RequestSource::Index { store, index } => {
            let found = db.stores.get(store).ok_or_else(|| {
                EngineError::not_found(format!("object store '{store}' does not exist"))
            })?;
            match operation {
                Operation::Get { range } => found.index_get(index, &range).map(OpResult::Value),
                Operation::GetAll { range, limit } => found
                    .index_get_all(index, &range, limit)
                    .map(OpResult::Values),
                Operation::GetKey { range } => {
                    found.index_get_key(index, &range).map(OpResult::FoundKey)
                }
                Operation::GetAllKeys { range, limit } => found
                    .index_get_all_keys(index, &range, limit)
                    .map(OpResult::Keys),
                Operation::Count { range } => found.index_count(index, &range).map(OpResult::Count),
                _ => Err(EngineError::invalid_access("indexes are read-only")),
            }
        }
    }
}
