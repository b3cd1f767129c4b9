//! End-to-end scenarios through the public client surface.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::{json, Value};

use idbx_core::{
    open, quick, Connection, Engine, EngineError, IdbError, IdbResult, IndexParams, Key, KeyPath,
    KeyRange, OpenHooks, StoreParams, TransactionMode, TransactionPhase,
};

/// Captures the single result a continuation delivers, panicking if it
/// is ever delivered twice.
struct Expect<T> {
    slot: Rc<RefCell<Option<IdbResult<T>>>>,
}

impl<T: 'static> Expect<T> {
    fn new() -> Self {
        Self {
            slot: Rc::new(RefCell::new(None)),
        }
    }

    fn cont(&self) -> impl FnOnce(IdbResult<T>) + 'static {
        let slot = self.slot.clone();
        move |result| {
            let prior = slot.borrow_mut().replace(result);
            assert!(prior.is_none(), "continuation fired twice");
        }
    }

    fn take(&self) -> IdbResult<T> {
        self.slot
            .borrow_mut()
            .take()
            .expect("continuation never fired")
    }
}

fn open_now(engine: &Engine, name: &str, version: u32, hooks: OpenHooks) -> Connection {
    let slot = Rc::new(RefCell::new(None));
    {
        let slot = slot.clone();
        open(engine, name, version, hooks, move |result| {
            *slot.borrow_mut() = Some(result);
        });
    }
    engine.run_until_idle();
    let result = slot.borrow_mut().take().expect("open settled");
    result.expect("open succeeded")
}

fn cats_hooks() -> OpenHooks {
    OpenHooks::new().with_upgrade(|tx, _, _| {
        tx.create_store(
            "cats",
            StoreParams {
                key_path: Some(KeyPath::single("id")),
                auto_increment: false,
            },
        )
        .unwrap();
    })
}

fn cat(id: i64, name: &str) -> Value {
    json!({ "id": id, "name": name })
}

#[test]
fn creates_schema_and_round_trips_records() {
    let engine = Engine::new();
    let connection = open_now(&engine, "pets", 1, cats_hooks());
    assert_eq!(connection.store_names(), ["cats"]);

    // Insert three records, each in its own implicit transaction.
    for (id, name) in [(1, "tom"), (2, "ada"), (3, "brie")] {
        let added = Expect::new();
        quick::add(&connection, "cats", cat(id, name), None, added.cont());
        engine.run_until_idle();
        assert_eq!(added.take().unwrap(), Key::integer(id));
    }

    let fetched = Expect::new();
    quick::get_one(
        &connection,
        "cats",
        &KeyRange::only(Key::integer(2)),
        fetched.cont(),
    );
    engine.run_until_idle();
    let record = fetched.take().unwrap().expect("record exists");
    assert_eq!(record["name"], "ada");

    let all = Expect::new();
    quick::get(&connection, "cats", &KeyRange::all(), all.cont());
    engine.run_until_idle();
    let names: Vec<String> = all
        .take()
        .unwrap()
        .iter()
        .map(|record| record["name"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(names, ["tom", "ada", "brie"]);

    let removed = Expect::new();
    quick::delete(
        &connection,
        "cats",
        &KeyRange::only(Key::integer(1)),
        removed.cont(),
    );
    engine.run_until_idle();
    removed.take().unwrap();

    let total = Expect::new();
    quick::count(&connection, "cats", &KeyRange::all(), total.cont());
    engine.run_until_idle();
    assert_eq!(total.take().unwrap(), 2);
}

#[test]
fn version_zero_opens_version_one() {
    let engine = Engine::new();
    {
        let connection = open_now(&engine, "pets", 0, cats_hooks());
        assert_eq!(connection.version(), 1);
    }

    // An explicit open at version 1 finds the database version 0 made.
    let again = open_now(&engine, "pets", 1, OpenHooks::new());
    assert_eq!(again.version(), 1);
    assert_eq!(again.store_names(), ["cats"]);
}

#[test]
fn upgrade_recreates_store_with_unique_index() {
    let engine = Engine::new();
    {
        let connection = open_now(&engine, "pets", 1, cats_hooks());
        let seeded = Expect::new();
        quick::add(&connection, "cats", cat(1, "tom"), None, seeded.cont());
        engine.run_until_idle();
        seeded.take().unwrap();
    }

    // Version 2 drops the store and recreates it with a unique index on
    // the name field.
    let upgraded = Rc::new(Cell::new(false));
    let hooks = {
        let upgraded = upgraded.clone();
        OpenHooks::new().with_upgrade(move |tx, old, new| {
            assert_eq!((old, new), (1, 2));
            tx.delete_store("cats").unwrap();
            let store = tx
                .create_store(
                    "cats",
                    StoreParams {
                        key_path: Some(KeyPath::single("id")),
                        auto_increment: false,
                    },
                )
                .unwrap();
            store
                .create_index(
                    "name_index",
                    KeyPath::single("name"),
                    IndexParams {
                        unique: true,
                        multi_entry: false,
                    },
                )
                .unwrap();
            upgraded.set(true);
        })
    };
    let connection = open_now(&engine, "pets", 2, hooks);
    assert!(upgraded.get());
    assert_eq!(connection.version(), 2);

    // Recreating the store discarded the old records.
    let total = Expect::new();
    quick::count(&connection, "cats", &KeyRange::all(), total.cont());
    engine.run_until_idle();
    assert_eq!(total.take().unwrap(), 0);

    let first = Expect::new();
    quick::add(&connection, "cats", cat(1, "tom"), None, first.cont());
    engine.run_until_idle();
    first.take().unwrap();

    // A different primary key with the same name trips the unique
    // index, one transaction later.
    let second = Expect::new();
    quick::add(&connection, "cats", cat(2, "tom"), None, second.cont());
    engine.run_until_idle();
    match second.take().unwrap_err() {
        IdbError::Engine(EngineError::Constraint { message }) => {
            assert!(message.contains("name_index"), "unattributed: {message}");
        }
        other => panic!("expected a constraint error, got {other:?}"),
    }

    let by_name = Expect::new();
    quick::index_get_one_key(
        &connection,
        "cats",
        "name_index",
        &KeyRange::only(Key::text("tom")),
        by_name.cont(),
    );
    engine.run_until_idle();
    assert_eq!(by_name.take().unwrap(), Some(Key::integer(1)));
}

#[test]
fn failed_quick_operation_reports_once() {
    let engine = Engine::new();
    let connection = open_now(&engine, "pets", 1, cats_hooks());

    let seeded = Expect::new();
    quick::add(&connection, "cats", cat(1, "tom"), None, seeded.cont());
    engine.run_until_idle();
    seeded.take().unwrap();

    // The duplicate fails the operation and aborts the implicit
    // transaction; Expect panics if both failures reach the caller.
    let duplicate = Expect::new();
    quick::add(&connection, "cats", cat(1, "tom again"), None, duplicate.cont());
    engine.run_until_idle();
    assert!(matches!(
        duplicate.take().unwrap_err(),
        IdbError::Engine(EngineError::Constraint { .. })
    ));

    // The failed transaction left nothing behind.
    let total = Expect::new();
    quick::count(&connection, "cats", &KeyRange::all(), total.cont());
    engine.run_until_idle();
    assert_eq!(total.take().unwrap(), 1);
}

#[test]
fn add_rejects_duplicates_but_put_overwrites() {
    let engine = Engine::new();
    let connection = open_now(&engine, "pets", 1, cats_hooks());

    let added = Expect::new();
    quick::add(&connection, "cats", cat(1, "tom"), None, added.cont());
    engine.run_until_idle();
    added.take().unwrap();

    let replaced = Expect::new();
    quick::put(&connection, "cats", cat(1, "brie"), None, replaced.cont());
    engine.run_until_idle();
    assert_eq!(replaced.take().unwrap(), Key::integer(1));

    let fetched = Expect::new();
    quick::get_one(
        &connection,
        "cats",
        &KeyRange::only(Key::integer(1)),
        fetched.cont(),
    );
    engine.run_until_idle();
    assert_eq!(fetched.take().unwrap().expect("record exists")["name"], "brie");

    let total = Expect::new();
    quick::count(&connection, "cats", &KeyRange::all(), total.cont());
    engine.run_until_idle();
    assert_eq!(total.take().unwrap(), 1);
}

#[test]
fn negative_limit_matches_unbounded_get() {
    let engine = Engine::new();
    let connection = open_now(&engine, "pets", 1, cats_hooks());
    for id in 1..=4 {
        let added = Expect::new();
        quick::add(&connection, "cats", cat(id, "cat"), None, added.cont());
        engine.run_until_idle();
        added.take().unwrap();
    }

    let unbounded = Expect::new();
    quick::get_with_limit(&connection, "cats", &KeyRange::all(), -3, unbounded.cont());
    let plain = Expect::new();
    quick::get(&connection, "cats", &KeyRange::all(), plain.cont());
    engine.run_until_idle();
    assert_eq!(unbounded.take().unwrap(), plain.take().unwrap());

    let capped = Expect::new();
    quick::get_keys_with_limit(&connection, "cats", &KeyRange::all(), 2, capped.cont());
    engine.run_until_idle();
    assert_eq!(
        capped.take().unwrap(),
        [Key::integer(1), Key::integer(2)]
    );

    let none = Expect::new();
    quick::get_with_limit(&connection, "cats", &KeyRange::all(), 0, none.cont());
    engine.run_until_idle();
    assert!(none.take().unwrap().is_empty());
}

#[test]
fn operations_resolve_before_the_transaction_outcome() {
    let engine = Engine::new();
    let connection = open_now(&engine, "pets", 1, cats_hooks());
    let log: Rc<RefCell<Vec<String>>> = Rc::default();

    let tx = {
        let log = log.clone();
        connection
            .transaction(&["cats"], TransactionMode::ReadWrite, move |outcome| {
                outcome.unwrap();
                log.borrow_mut().push("done".to_owned());
            })
            .unwrap()
    };
    let store = tx.store("cats").unwrap();
    {
        let log = log.clone();
        store.add(cat(1, "tom"), None, move |result| {
            result.unwrap();
            log.borrow_mut().push("one".to_owned());
        });
    }
    {
        let log = log.clone();
        store.add(cat(2, "ada"), None, move |result| {
            result.unwrap();
            log.borrow_mut().push("two".to_owned());
        });
    }
    {
        let log = log.clone();
        store.get(&KeyRange::all(), move |result| {
            let records = result.unwrap();
            log.borrow_mut().push(format!("saw {}", records.len()));
        });
    }

    engine.run_until_idle();
    assert_eq!(*log.borrow(), ["one", "two", "saw 2", "done"]);
    assert_eq!(tx.phase(), TransactionPhase::Committed);
}

#[test]
fn stale_handles_fail_without_reaching_the_engine() {
    let engine = Engine::new();
    let connection = open_now(&engine, "pets", 1, cats_hooks());

    let tx = connection
        .transaction(&["cats"], TransactionMode::ReadOnly, |_| {})
        .unwrap();
    let store = tx.store("cats").unwrap();
    engine.run_until_idle();
    assert_eq!(tx.phase(), TransactionPhase::Committed);

    // No run_until_idle needed: the setup error resolves synchronously.
    let late = Expect::new();
    store.count(&KeyRange::all(), late.cont());
    assert!(matches!(
        late.take().unwrap_err(),
        IdbError::TransactionFinished { .. }
    ));

    assert!(matches!(
        tx.store("cats"),
        Err(IdbError::TransactionFinished { .. })
    ));
}

#[test]
fn multi_entry_index_flattens_tags() {
    let engine = Engine::new();
    let hooks = OpenHooks::new().with_upgrade(|tx, _, _| {
        let store = tx
            .create_store(
                "articles",
                StoreParams {
                    key_path: Some(KeyPath::single("id")),
                    auto_increment: false,
                },
            )
            .unwrap();
        store
            .create_index(
                "by_tag",
                KeyPath::single("tags"),
                IndexParams {
                    unique: false,
                    multi_entry: true,
                },
            )
            .unwrap();
    });
    let connection = open_now(&engine, "library", 1, hooks);

    // Repeated tags within one record collapse to a single entry.
    for value in [
        json!({ "id": 1, "tags": ["rust", "db", "rust"] }),
        json!({ "id": 2, "tags": ["db"] }),
    ] {
        let added = Expect::new();
        quick::add(&connection, "articles", value, None, added.cont());
        engine.run_until_idle();
        added.take().unwrap();
    }

    let db_tagged = Expect::new();
    quick::index_get_keys(
        &connection,
        "articles",
        "by_tag",
        &KeyRange::only(Key::text("db")),
        db_tagged.cont(),
    );
    engine.run_until_idle();
    assert_eq!(
        db_tagged.take().unwrap(),
        [Key::integer(1), Key::integer(2)]
    );

    let rust_tagged = Expect::new();
    quick::index_get_keys(
        &connection,
        "articles",
        "by_tag",
        &KeyRange::only(Key::text("rust")),
        rust_tagged.cont(),
    );
    engine.run_until_idle();
    assert_eq!(rust_tagged.take().unwrap(), [Key::integer(1)]);

    let entries = Expect::new();
    quick::index_count(&connection, "articles", "by_tag", &KeyRange::all(), entries.cont());
    engine.run_until_idle();
    assert_eq!(entries.take().unwrap(), 3);
}

#[test]
fn databases_can_be_listed_and_deleted() {
    let engine = Engine::new();
    {
        let _alpha = open_now(&engine, "alpha", 1, OpenHooks::new());
        let _beta = open_now(&engine, "beta", 2, OpenHooks::new());
    }

    let removed = Expect::new();
    idbx_core::delete_database(&engine, "beta", removed.cont());
    engine.run_until_idle();
    removed.take().unwrap();

    let listed = Expect::new();
    idbx_core::list_databases(&engine, listed.cont());
    engine.run_until_idle();
    let seen: Vec<(String, u32)> = listed
        .take()
        .unwrap()
        .into_iter()
        .map(|info| (info.name, info.version))
        .collect();
    assert_eq!(seen, [("alpha".to_owned(), 1)]);
}
