//! Opening, listing and deleting databases.

use tracing::debug;

use idbx_engine as engine;
use idbx_engine::{DatabaseInfo, Engine, TransactionMode};

use crate::error::IdbResult;
use crate::request::OnceCont;
use crate::transaction::Transaction;

/// Event hooks observed while a connection is opened and afterwards held.
///
/// All slots are optional. Hooks are registered before the open request
/// is issued, so no event can slip past an unregistered slot.
#[derive(Default)]
pub struct OpenHooks {
    on_upgrade: Option<Box<dyn FnOnce(&Transaction, u32, u32)>>,
    on_blocked: Option<Box<dyn FnOnce(u32, u32)>>,
    on_version_change: Option<Box<dyn Fn(u32, Option<u32>)>>,
    on_close: Option<Box<dyn FnOnce()>>,
}

impl OpenHooks {
    /// No hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when the open must upgrade the database. Receives the
    /// running upgrade transaction and the old and new versions; all
    /// schema changes happen here.
    #[must_use]
    pub fn with_upgrade(mut self, hook: impl FnOnce(&Transaction, u32, u32) + 'static) -> Self {
        self.on_upgrade = Some(Box::new(hook));
        self
    }

    /// Called when connections elsewhere hold the open back. Receives
    /// the current and requested versions.
    #[must_use]
    pub fn with_blocked(mut self, hook: impl FnOnce(u32, u32) + 'static) -> Self {
        self.on_blocked = Some(Box::new(hook));
        self
    }

    /// Called on the held connection when another open wants it gone.
    /// Receives the current version and the requested one, or `None`
    /// when the database is being deleted.
    #[must_use]
    pub fn with_version_change(mut self, hook: impl Fn(u32, Option<u32>) + 'static) -> Self {
        self.on_version_change = Some(Box::new(hook));
        self
    }

    /// Called when the engine terminates the connection on its own
    /// initiative. An orderly local close does not fire it.
    #[must_use]
    pub fn with_close(mut self, hook: impl FnOnce() + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

/// Client connection to one database.
///
/// Clones share the engine connection; it closes when the last clone is
/// dropped. There is no explicit close operation.
#[derive(Clone)]
pub struct Connection {
    raw: engine::Connection,
}

impl Connection {
    /// Name of the connected database.
    #[must_use]
    pub fn name(&self) -> String {
        self.raw.name()
    }

    /// Version the database had when this connection opened.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.raw.version()
    }

    /// Returns `true` until the engine closes the connection.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.raw.is_open()
    }

    /// Names of the database's object stores, sorted.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.raw.store_names()
    }

    /// Starts a transaction over `scope`.
    ///
    /// Setup failures (empty scope, unknown store, upgrade mode, closed
    /// connection) surface synchronously. The outcome continuation fires
    /// exactly once after every per-operation continuation: `Ok(())` on
    /// commit, the abort cause on abort.
    pub fn transaction(
        &self,
        scope: &[&str],
        mode: TransactionMode,
        outcome: impl FnOnce(IdbResult<()>) + 'static,
    ) -> IdbResult<Transaction> {
        let raw = self.raw.transaction(scope, mode)?;
        Ok(Transaction::attach(raw, Some(Box::new(outcome))))
    }
}

/// Lists existing databases with their versions.
pub fn list_databases(
    engine: &Engine,
    continuation: impl FnOnce(IdbResult<Vec<DatabaseInfo>>) + 'static,
) {
    let request = engine.databases();
    let cont = OnceCont::new(continuation);
    {
        let cont = cont.clone();
        request.on_success(move |infos| cont.resolve(Ok(infos)));
    }
    request.on_error(move |error| cont.resolve(Err(error.into())));
}

/// Opens a database, creating or upgrading it to `version`.
///
/// A requested version of 0 is treated as 1. The continuation fires
/// exactly once with the connection or the reason the open failed; an
/// upgrade abort is such a failure. Upgrade and blocked notifications
/// go through `hooks` beforehand.
pub fn open(
    engine: &Engine,
    name: &str,
    version: u32,
    hooks: OpenHooks,
    continuation: impl FnOnce(IdbResult<Connection>) + 'static,
) {
    let version = version.max(1);
    debug!(database = name, version, "opening database");
    let cont = OnceCont::new(continuation);
    let request = match engine.open(name, version) {
        Ok(request) => request,
        Err(error) => {
            cont.resolve(Err(error.into()));
            return;
        }
    };
    if let Some(hook) = hooks.on_upgrade {
        request.on_upgrade_needed(move |event| {
            let transaction = Transaction::attach(event.transaction, None);
            hook(&transaction, event.old_version, event.new_version);
        });
    }
    if let Some(hook) = hooks.on_blocked {
        request.on_blocked(hook);
    }
    let on_version_change = hooks.on_version_change;
    let on_close = hooks.on_close;
    {
        let cont = cont.clone();
        request.on_success(move |raw| {
            if let Some(hook) = on_version_change {
                raw.set_on_version_change(move |old, new| hook(old, new));
            }
            if let Some(hook) = on_close {
                raw.set_on_close(hook);
            }
            cont.resolve(Ok(Connection { raw }));
        });
    }
    request.on_error(move |error| cont.resolve(Err(error.into())));
}

/// Deletes a database outright, waiting for its connections to go away.
/// Deleting a database that does not exist succeeds.
pub fn delete_database(
    engine: &Engine,
    name: &str,
    continuation: impl FnOnce(IdbResult<()>) + 'static,
) {
    debug!(database = name, "deleting database");
    let request = engine.delete_database(name);
    let cont = OnceCont::new(continuation);
    {
        let cont = cont.clone();
        request.on_success(move |()| cont.resolve(Ok(())));
    }
    request.on_error(move |error| cont.resolve(Err(error.into())));
}
