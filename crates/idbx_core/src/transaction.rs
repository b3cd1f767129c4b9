//! Client-side transaction handles.
//!
//! A [`Transaction`] wraps an engine transaction and tracks its terminal
//! outcome in a phase cell, so stale handles fail with a setup error
//! before they ever reach the engine. The terminal continuation supplied
//! at creation fires exactly once, after every per-operation continuation
//! of the transaction: `Ok(())` for commit, the abort cause otherwise.

use std::cell::Cell;
use std::rc::Rc;

use tracing::trace;

use idbx_engine as engine;
use idbx_engine::{StoreParams, TransactionMode};

use crate::error::{IdbError, IdbResult};
use crate::request::OnceCont;
use crate::store::Store;

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    /// Still running; operations may be accepted.
    Active,
    /// Committed; every effect is durable.
    Committed,
    /// Aborted; every effect was rolled back.
    Aborted,
}

struct TransactionInner {
    raw: engine::Transaction,
    phase: Rc<Cell<TransactionPhase>>,
    mode: TransactionMode,
}

/// Handle to one transaction.
///
/// Clones share the underlying transaction. Dropping handles does not
/// affect it; the engine commits or aborts on its own schedule.
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<TransactionInner>,
}

impl Transaction {
    /// Wraps `raw`, wiring its terminal events into the phase cell and
    /// the optional outcome continuation.
    pub(crate) fn attach(
        raw: engine::Transaction,
        outcome: Option<Box<dyn FnOnce(IdbResult<()>)>>,
    ) -> Self {
        let mode = raw.mode();
        let phase = Rc::new(Cell::new(TransactionPhase::Active));
        let cont = outcome.map(OnceCont::new);
        {
            let phase = phase.clone();
            let cont = cont.clone();
            raw.set_on_complete(move || {
                phase.set(TransactionPhase::Committed);
                if let Some(cont) = cont {
                    cont.resolve(Ok(()));
                }
            });
        }
        {
            let phase = phase.clone();
            raw.set_on_abort(move |cause| {
                trace!(%cause, "transaction aborted");
                phase.set(TransactionPhase::Aborted);
                if let Some(cont) = cont {
                    cont.resolve(Err(IdbError::aborted(cause)));
                }
            });
        }
        Self {
            inner: Rc::new(TransactionInner { raw, phase, mode }),
        }
    }

    /// Access mode this transaction was opened with.
    #[must_use]
    pub fn mode(&self) -> TransactionMode {
        self.inner.mode
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> TransactionPhase {
        self.inner.phase.get()
    }

    /// Returns `true` while the transaction has not finished.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase() == TransactionPhase::Active
    }

    /// Names of the object stores in scope.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.inner.raw.store_names()
    }

    /// Looks up an object store in this transaction's scope.
    ///
    /// Fails on a finished transaction and on names outside the scope.
    pub fn store(&self, name: &str) -> IdbResult<Store> {
        self.ensure_live(&format!("look up object store '{name}'"))?;
        let raw = self.inner.raw.object_store(name)?;
        Ok(Store::new(self.clone(), raw))
    }

    /// Creates an object store. Legal only on the upgrade transaction
    /// handed to the open hook.
    pub fn create_store(&self, name: &str, params: StoreParams) -> IdbResult<Store> {
        self.ensure_live(&format!("create object store '{name}'"))?;
        let raw = self.inner.raw.create_object_store(name, params)?;
        Ok(Store::new(self.clone(), raw))
    }

    /// Deletes an object store with its indexes and records. Upgrade
    /// transactions only.
    pub fn delete_store(&self, name: &str) -> IdbResult<()> {
        self.ensure_live(&format!("delete object store '{name}'"))?;
        self.inner.raw.delete_object_store(name)?;
        Ok(())
    }

    /// Aborts the transaction, rolling back everything it did.
    ///
    /// The abort is immediate: still-queued operations fail, then the
    /// terminal continuation fires with the abort error.
    pub fn abort(&self) -> IdbResult<()> {
        self.ensure_live("abort")?;
        self.inner.raw.abort()?;
        Ok(())
    }

    /// Setup guard: operations on a finished transaction fail without
    /// reaching the engine.
    pub(crate) fn ensure_live(&self, doing: &str) -> IdbResult<()> {
        match self.phase() {
            TransactionPhase::Active => Ok(()),
            TransactionPhase::Committed => Err(IdbError::finished(format!(
                "cannot {doing}: the transaction has committed"
            ))),
            TransactionPhase::Aborted => Err(IdbError::finished(format!(
                "cannot {doing}: the transaction was aborted"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open;
    use crate::connection::OpenHooks;
    use idbx_engine::{Engine, Key, KeyPath};
    use serde_json::json;
    use std::cell::RefCell;

    fn cats_connection(engine: &Engine) -> crate::connection::Connection {
        let slot = Rc::new(RefCell::new(None));
        let hooks = OpenHooks::new().with_upgrade(|tx, _, _| {
            tx.create_store(
                "cats",
                StoreParams {
                    key_path: Some(KeyPath::single("id")),
                    auto_increment: false,
                },
            )
            .unwrap();
        });
        {
            let slot = slot.clone();
            open(engine, "pets", 1, hooks, move |result| {
                *slot.borrow_mut() = Some(result.unwrap());
            });
        }
        engine.run_until_idle();
        let connection = slot.borrow_mut().take();
        connection.expect("connection delivered")
    }

    #[test]
    fn commit_reports_through_the_outcome_continuation() {
        let engine = Engine::new();
        let connection = cats_connection(&engine);
        let outcomes: Rc<RefCell<Vec<String>>> = Rc::default();

        let tx = {
            let outcomes = outcomes.clone();
            connection
                .transaction(&["cats"], TransactionMode::ReadWrite, move |outcome| {
                    assert!(outcome.is_ok());
                    outcomes.borrow_mut().push("finished".to_owned());
                })
                .unwrap()
        };
        assert!(tx.is_active());
        assert_eq!(tx.mode(), TransactionMode::ReadWrite);

        let store = tx.store("cats").unwrap();
        {
            let outcomes = outcomes.clone();
            store.add(json!({"id": 1, "name": "tom"}), None, move |result| {
                assert_eq!(result.unwrap(), Key::integer(1));
                outcomes.borrow_mut().push("added".to_owned());
            });
        }

        engine.run_until_idle();
        // Per-operation continuations come before the terminal one.
        assert_eq!(*outcomes.borrow(), ["added", "finished"]);
        assert_eq!(tx.phase(), TransactionPhase::Committed);
    }

    #[test]
    fn abort_reports_its_cause() {
        let engine = Engine::new();
        let connection = cats_connection(&engine);
        let aborted = Rc::new(Cell::new(false));

        let tx = {
            let aborted = aborted.clone();
            connection
                .transaction(&["cats"], TransactionMode::ReadWrite, move |outcome| {
                    match outcome {
                        Err(IdbError::TransactionAborted { cause }) => {
                            assert!(cause.is_abort());
                            aborted.set(true);
                        }
                        other => panic!("expected an abort, got {other:?}"),
                    }
                })
                .unwrap()
        };
        tx.abort().unwrap();
        engine.run_until_idle();

        assert!(aborted.get());
        assert_eq!(tx.phase(), TransactionPhase::Aborted);
    }

    #[test]
    fn finished_transactions_refuse_setup() {
        let engine = Engine::new();
        let connection = cats_connection(&engine);
        let tx = connection
            .transaction(&["cats"], TransactionMode::ReadOnly, |_| {})
            .unwrap();
        engine.run_until_idle();

        assert_eq!(tx.phase(), TransactionPhase::Committed);
        assert!(matches!(
            tx.store("cats"),
            Err(IdbError::TransactionFinished { .. })
        ));
        assert!(matches!(
            tx.abort(),
            Err(IdbError::TransactionFinished { .. })
        ));
    }

    #[test]
    fn schema_changes_outside_upgrade_are_engine_errors() {
        let engine = Engine::new();
        let connection = cats_connection(&engine);
        let tx = connection
            .transaction(&["cats"], TransactionMode::ReadWrite, |_| {})
            .unwrap();

        assert!(matches!(
            tx.create_store("dogs", StoreParams::default()),
            Err(IdbError::Engine(_))
        ));
        assert!(matches!(
            tx.delete_store("cats"),
            Err(IdbError::Engine(_))
        ));
        engine.run_until_idle();
    }
}
