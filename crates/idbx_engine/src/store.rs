//! Object store state: records, key generation, and index maintenance.
//!
//! A store is an ordered map from primary key to JSON record value, plus
//! any number of secondary indexes kept in lockstep with the records.
//! Everything here is synchronous; transactional scheduling lives in the
//! engine, which snapshots and restores whole `StoreState` values.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::key::{lookup, Key, KeyPath, KeyRange};

/// Key handling configuration of an object store, fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreParams {
    /// Where primary keys live inside record values. `None` means keys
    /// are passed alongside values (out-of-line).
    pub key_path: Option<KeyPath>,
    /// Whether the store generates keys for records that bring none.
    pub auto_increment: bool,
}

/// Behaviour of an index, fixed at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexParams {
    /// Reject two records sharing an index key.
    pub unique: bool,
    /// Treat an array at the key path as one entry per element.
    pub multi_entry: bool,
}

/// A secondary index: index key to the set of primary keys holding it.
#[derive(Debug, Clone)]
pub(crate) struct IndexState {
    pub(crate) key_path: KeyPath,
    pub(crate) params: IndexParams,
    entries: BTreeMap<Key, BTreeSet<Key>>,
}

impl IndexState {
    /// Index keys a record value contributes under this index.
    ///
    /// Multi-entry indexes flatten an array at the key path into one
    /// deduplicated entry per key-shaped element; elements without a key
    /// shape are skipped. Everything else indexes as a single key, or not
    /// at all when the path yields nothing.
    fn keys_for(&self, value: &Value) -> Vec<Key> {
        if self.params.multi_entry {
            let KeyPath::Single(path) = &self.key_path else {
                return Vec::new();
            };
            match lookup(value, path) {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Key::from_value)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect(),
                Some(other) => Key::from_value(other).into_iter().collect(),
                None => Vec::new(),
            }
        } else {
            self.key_path.evaluate(value).into_iter().collect()
        }
    }

    /// Entries within `range`, in index key order, then primary key order.
    fn pairs<'a>(&'a self, range: &'a KeyRange) -> impl Iterator<Item = (&'a Key, &'a Key)> + 'a {
        self.entries
            .range(range.bounds())
            .flat_map(|(index_key, primaries)| {
                primaries.iter().map(move |primary| (index_key, primary))
            })
    }
}

/// Mutable state of one object store.
#[derive(Debug, Clone)]
pub(crate) struct StoreState {
    params: StoreParams,
    records: BTreeMap<Key, Value>,
    indexes: BTreeMap<String, IndexState>,
    next_generated: i64,
}

impl StoreState {
    pub(crate) fn new(params: StoreParams) -> Self {
        Self {
            params,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
            next_generated: 1,
        }
    }

    pub(crate) fn params(&self) -> &StoreParams {
        &self.params
    }

    pub(crate) fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    pub(crate) fn index(&self, name: &str) -> EngineResult<&IndexState> {
        self.indexes
            .get(name)
            .ok_or_else(|| EngineError::not_found(format!("index '{name}' does not exist")))
    }

    /// Stores a record, resolving its primary key first.
    ///
    /// With `overwrite` unset, an existing record under the same key is a
    /// constraint violation. Index maintenance is atomic: uniqueness is
    /// checked across every index before any entry or record is written.
    pub(crate) fn insert(
        &mut self,
        mut value: Value,
        explicit: Option<Key>,
        overwrite: bool,
    ) -> EngineResult<Key> {
        if explicit.is_some() && self.params.key_path.is_some() {
            return Err(EngineError::data(
                "store uses in-line keys; an explicit key must not be passed",
            ));
        }
        let key_path = self.params.key_path.clone();
        let key = match (explicit, &key_path) {
            (Some(key), _) => {
                key.validate()?;
                self.bump_generator(&key);
                key
            }
            (None, Some(path)) => match path.evaluate(&value) {
                Some(key) => {
                    key.validate()?;
                    self.bump_generator(&key);
                    key
                }
                None if self.params.auto_increment => {
                    let generated = self.generate_key();
                    path.inject(&mut value, &generated)?;
                    generated
                }
                None => {
                    return Err(EngineError::data(
                        "record value yields no key at the store key path",
                    ))
                }
            },
            (None, None) => {
                if self.params.auto_increment {
                    self.generate_key()
                } else {
                    return Err(EngineError::data(
                        "store has no key generator; a key must be passed",
                    ));
                }
            }
        };
        if !overwrite && self.records.contains_key(&key) {
            return Err(EngineError::constraint(format!(
                "a record with key {key} already exists in the object store"
            )));
        }

        let mut additions: Vec<(String, Vec<Key>)> = Vec::new();
        for (name, index) in &self.indexes {
            let index_keys = index.keys_for(&value);
            if index.params.unique {
                for index_key in &index_keys {
                    let taken = index
                        .entries
                        .get(index_key)
                        .is_some_and(|holders| holders.iter().any(|holder| holder != &key));
                    if taken {
                        return Err(EngineError::constraint(format!(
                            "unique index '{name}' already has an entry for key {index_key}"
                        )));
                    }
                }
            }
            additions.push((name.clone(), index_keys));
        }

        if let Some(displaced) = self.records.get(&key).cloned() {
            self.unlink(&key, &displaced);
        }
        self.records.insert(key.clone(), value);
        for (name, index_keys) in additions {
            if let Some(index) = self.indexes.get_mut(&name) {
                for index_key in index_keys {
                    index.entries.entry(index_key).or_default().insert(key.clone());
                }
            }
        }
        Ok(key)
    }

    /// First record within `range`, in key order.
    pub(crate) fn get(&self, range: &KeyRange) -> EngineResult<Option<Value>> {
        range.validate()?;
        if range.is_empty() {
            return Ok(None);
        }
        Ok(self
            .records
            .range(range.bounds())
            .next()
            .map(|(_, value)| value.clone()))
    }

    /// Records within `range` in key order, up to `limit`.
    pub(crate) fn get_all(
        &self,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Vec<Value>> {
        range.validate()?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .records
            .range(range.bounds())
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, value)| value.clone())
            .collect())
    }

    /// First primary key within `range`.
    pub(crate) fn get_key(&self, range: &KeyRange) -> EngineResult<Option<Key>> {
        range.validate()?;
        if range.is_empty() {
            return Ok(None);
        }
        Ok(self
            .records
            .range(range.bounds())
            .next()
            .map(|(key, _)| key.clone()))
    }

    /// Primary keys within `range` in order, up to `limit`.
    pub(crate) fn get_all_keys(
        &self,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Vec<Key>> {
        range.validate()?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .records
            .range(range.bounds())
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// Number of records within `range`.
    pub(crate) fn count(&self, range: &KeyRange) -> EngineResult<u64> {
        range.validate()?;
        if range.is_empty() {
            return Ok(0);
        }
        Ok(self.records.range(range.bounds()).count() as u64)
    }

    /// Removes every record within `range`, maintaining indexes.
    pub(crate) fn delete(&mut self, range: &KeyRange) -> EngineResult<()> {
        range.validate()?;
        if range.is_empty() {
            return Ok(());
        }
        let doomed: Vec<Key> = self
            .records
            .range(range.bounds())
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            if let Some(value) = self.records.remove(&key) {
                self.unlink(&key, &value);
            }
        }
        Ok(())
    }

    /// Removes every record and index entry.
    pub(crate) fn clear(&mut self) {
        self.records.clear();
        for index in self.indexes.values_mut() {
            index.entries.clear();
        }
    }

    /// Creates an index and backfills it from existing records.
    ///
    /// Fails without side effects if the name is taken, the parameters
    /// are contradictory, or backfilling a unique index finds a
    /// duplicate.
    pub(crate) fn create_index(
        &mut self,
        name: &str,
        key_path: KeyPath,
        params: IndexParams,
    ) -> EngineResult<()> {
        key_path.validate()?;
        if params.multi_entry && key_path.is_compound() {
            return Err(EngineError::invalid_access(
                "a multi-entry index cannot use a compound key path",
            ));
        }
        if self.indexes.contains_key(name) {
            return Err(EngineError::constraint(format!(
                "index '{name}' already exists"
            )));
        }
        let mut index = IndexState {
            key_path,
            params,
            entries: BTreeMap::new(),
        };
        for (primary, value) in &self.records {
            for index_key in index.keys_for(value) {
                let holders = index.entries.entry(index_key.clone()).or_default();
                if params.unique && !holders.is_empty() {
                    return Err(EngineError::constraint(format!(
                        "cannot create unique index '{name}': key {index_key} is not unique"
                    )));
                }
                holders.insert(primary.clone());
            }
        }
        self.indexes.insert(name.to_owned(), index);
        Ok(())
    }

    /// Drops an index and all its entries.
    pub(crate) fn delete_index(&mut self, name: &str) -> EngineResult<()> {
        if self.indexes.remove(name).is_none() {
            return Err(EngineError::not_found(format!(
                "index '{name}' does not exist"
            )));
        }
        Ok(())
    }

    /// First record reachable through an index within `range`.
    pub(crate) fn index_get(&self, name: &str, range: &KeyRange) -> EngineResult<Option<Value>> {
        let index = self.index(name)?;
        range.validate()?;
        if range.is_empty() {
            return Ok(None);
        }
        Ok(index
            .pairs(range)
            .next()
            .and_then(|(_, primary)| self.records.get(primary))
            .cloned())
    }

    /// Records reachable through an index, in index key order.
    ///
    /// A multi-entry index can yield the same record several times, once
    /// per matching entry.
    pub(crate) fn index_get_all(
        &self,
        name: &str,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Vec<Value>> {
        let index = self.index(name)?;
        range.validate()?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        Ok(index
            .pairs(range)
            .take(limit.unwrap_or(usize::MAX))
            .filter_map(|(_, primary)| self.records.get(primary).cloned())
            .collect())
    }

    /// First primary key reachable through an index within `range`.
    pub(crate) fn index_get_key(&self, name: &str, range: &KeyRange) -> EngineResult<Option<Key>> {
        let index = self.index(name)?;
        range.validate()?;
        if range.is_empty() {
            return Ok(None);
        }
        Ok(index.pairs(range).next().map(|(_, primary)| primary.clone()))
    }

    /// Primary keys reachable through an index, in index key order.
    pub(crate) fn index_get_all_keys(
        &self,
        name: &str,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Vec<Key>> {
        let index = self.index(name)?;
        range.validate()?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        Ok(index
            .pairs(range)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, primary)| primary.clone())
            .collect())
    }

    /// Number of index entries within `range`.
    pub(crate) fn index_count(&self, name: &str, range: &KeyRange) -> EngineResult<u64> {
        let index = self.index(name)?;
        range.validate()?;
        if range.is_empty() {
            return Ok(0);
        }
        Ok(index.pairs(range).count() as u64)
    }

    /// Hands out the next generated key and advances the generator.
    fn generate_key(&mut self) -> Key {
        let key = Key::Integer(self.next_generated);
        self.next_generated = self.next_generated.saturating_add(1);
        key
    }

    /// Advances the generator past an explicitly supplied numeric key, so
    /// later generated keys never collide with it.
    fn bump_generator(&mut self, key: &Key) {
        if !self.params.auto_increment {
            return;
        }
        let hint = match key {
            Key::Integer(integer) => Some(*integer),
            Key::Real(real) if real.is_finite() => {
                let floor = real.floor();
                if floor >= i64::MAX as f64 {
                    Some(i64::MAX)
                } else if floor < i64::MIN as f64 {
                    None
                } else {
                    Some(floor as i64)
                }
            }
            _ => None,
        };
        if let Some(hint) = hint {
            if hint >= self.next_generated {
                self.next_generated = hint.saturating_add(1);
            }
        }
    }

    /// Removes a record's index entries, given the value it held.
    fn unlink(&mut self, key: &Key, value: &Value) {
        for index in self.indexes.values_mut() {
            for index_key in index.keys_for(value) {
                if let Some(holders) = index.entries.get_mut(&index_key) {
                    holders.remove(key);
                    if holders.is_empty() {
                        index.entries.remove(&index_key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn out_of_line() -> StoreState {
        StoreState::new(StoreParams::default())
    }

    fn with_key_path(path: &str) -> StoreState {
        StoreState::new(StoreParams {
            key_path: Some(KeyPath::single(path)),
            auto_increment: false,
        })
    }

    fn generated(path: Option<&str>) -> StoreState {
        StoreState::new(StoreParams {
            key_path: path.map(KeyPath::single),
            auto_increment: true,
        })
    }

    // === Key resolution ===

    #[test]
    fn explicit_keys_store_and_read_back() {
        let mut store = out_of_line();
        let key = store
            .insert(json!({"name": "whiskers"}), Some(Key::integer(7)), false)
            .unwrap();
        assert_eq!(key, Key::integer(7));
        let found = store.get(&KeyRange::only(Key::integer(7))).unwrap();
        assert_eq!(found, Some(json!({"name": "whiskers"})));
    }

    #[test]
    fn in_line_key_comes_from_the_value() {
        let mut store = with_key_path("id");
        let key = store.insert(json!({"id": 3, "name": "tom"}), None, false).unwrap();
        assert_eq!(key, Key::integer(3));
    }

    #[test]
    fn explicit_key_rejected_for_in_line_store() {
        let mut store = with_key_path("id");
        let err = store
            .insert(json!({"id": 3}), Some(Key::integer(9)), false)
            .unwrap_err();
        assert!(matches!(err, EngineError::Data { .. }));
    }

    #[test]
    fn missing_key_without_generator_is_a_data_error() {
        let mut out = out_of_line();
        assert!(matches!(
            out.insert(json!({"name": "x"}), None, false),
            Err(EngineError::Data { .. })
        ));
        let mut inline = with_key_path("id");
        assert!(matches!(
            inline.insert(json!({"name": "x"}), None, false),
            Err(EngineError::Data { .. })
        ));
    }

    #[test]
    fn nested_key_path_resolves_dots() {
        let mut store = with_key_path("meta.id");
        let key = store
            .insert(json!({"meta": {"id": "k1"}, "name": "a"}), None, false)
            .unwrap();
        assert_eq!(key, Key::text("k1"));
    }

    // === Key generation ===

    #[test]
    fn generator_starts_at_one_and_counts_up() {
        let mut store = generated(None);
        assert_eq!(store.insert(json!("a"), None, false).unwrap(), Key::integer(1));
        assert_eq!(store.insert(json!("b"), None, false).unwrap(), Key::integer(2));
    }

    #[test]
    fn generator_injects_into_in_line_values() {
        let mut store = generated(Some("id"));
        store.insert(json!({"name": "a"}), None, false).unwrap();
        let found = store.get(&KeyRange::only(Key::integer(1))).unwrap();
        assert_eq!(found, Some(json!({"id": 1, "name": "a"})));
    }

    #[test]
    fn explicit_integral_keys_bump_the_generator() {
        let mut store = generated(None);
        store.insert(json!("a"), Some(Key::integer(10)), false).unwrap();
        assert_eq!(store.insert(json!("b"), None, false).unwrap(), Key::integer(11));
        // A fractional key bumps past its integral part.
        store.insert(json!("c"), Some(Key::real(15.5)), false).unwrap();
        assert_eq!(store.insert(json!("d"), None, false).unwrap(), Key::integer(16));
        // Non-numeric keys leave the generator alone.
        store.insert(json!("e"), Some(Key::text("zz")), false).unwrap();
        assert_eq!(store.insert(json!("f"), None, false).unwrap(), Key::integer(17));
    }

    #[test]
    fn in_line_explicit_key_bumps_too() {
        let mut store = generated(Some("id"));
        store.insert(json!({"id": 5}), None, false).unwrap();
        let key = store.insert(json!({"name": "next"}), None, false).unwrap();
        assert_eq!(key, Key::integer(6));
    }

    #[test]
    fn low_keys_do_not_rewind_the_generator() {
        let mut store = generated(None);
        store.insert(json!("a"), None, false).unwrap();
        store.insert(json!("b"), None, false).unwrap();
        store.insert(json!("c"), Some(Key::integer(-5)), false).unwrap();
        assert_eq!(store.insert(json!("d"), None, false).unwrap(), Key::integer(3));
    }

    // === Add versus put ===

    #[test]
    fn add_rejects_duplicates_put_overwrites() {
        let mut store = out_of_line();
        store.insert(json!("first"), Some(Key::integer(1)), false).unwrap();
        let err = store
            .insert(json!("second"), Some(Key::integer(1)), false)
            .unwrap_err();
        assert!(err.is_constraint());
        assert!(err.to_string().contains("object store"));

        store.insert(json!("second"), Some(Key::integer(1)), true).unwrap();
        assert_eq!(
            store.get(&KeyRange::only(Key::integer(1))).unwrap(),
            Some(json!("second"))
        );
        assert_eq!(store.count(&KeyRange::all()).unwrap(), 1);
    }

    #[test]
    fn integer_and_real_forms_are_the_same_key() {
        let mut store = out_of_line();
        store.insert(json!("a"), Some(Key::integer(2)), false).unwrap();
        let err = store
            .insert(json!("b"), Some(Key::real(2.0)), false)
            .unwrap_err();
        assert!(err.is_constraint());
    }

    // === Reads ===

    fn seeded() -> StoreState {
        let mut store = out_of_line();
        for (key, name) in [(1, "ada"), (3, "brie"), (5, "cleo"), (7, "dot")] {
            store
                .insert(json!({ "name": name }), Some(Key::integer(key)), false)
                .unwrap();
        }
        store
    }

    #[test]
    fn reads_come_back_in_key_order() {
        let store = seeded();
        let all = store.get_all(&KeyRange::all(), None).unwrap();
        let names: Vec<_> = all.iter().map(|v| v["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["ada", "brie", "cleo", "dot"]);
        assert_eq!(
            store.get_all_keys(&KeyRange::all(), None).unwrap(),
            vec![Key::integer(1), Key::integer(3), Key::integer(5), Key::integer(7)]
        );
    }

    #[test]
    fn limits_truncate_in_order() {
        let store = seeded();
        let two = store.get_all(&KeyRange::all(), Some(2)).unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(two[0]["name"], "ada");
        assert!(store.get_all(&KeyRange::all(), Some(0)).unwrap().is_empty());
        assert_eq!(store.get_all(&KeyRange::all(), Some(99)).unwrap().len(), 4);
    }

    #[test]
    fn range_reads_respect_bounds() {
        let store = seeded();
        let range = KeyRange::bound(Key::integer(3), Key::integer(7), false, true);
        assert_eq!(
            store.get_all_keys(&range, None).unwrap(),
            vec![Key::integer(3), Key::integer(5)]
        );
        assert_eq!(store.count(&range).unwrap(), 2);
        assert_eq!(store.get(&range).unwrap(), Some(json!({"name": "brie"})));
        assert_eq!(store.get_key(&range).unwrap(), Some(Key::integer(3)));
    }

    #[test]
    fn empty_and_inverted_ranges_read_as_empty() {
        let store = seeded();
        let inverted = KeyRange::bound(Key::integer(9), Key::integer(1), false, false);
        assert_eq!(store.get(&inverted).unwrap(), None);
        assert_eq!(store.count(&inverted).unwrap(), 0);
        assert!(store.get_all(&inverted, None).unwrap().is_empty());
        assert_eq!(store.get(&KeyRange::only(Key::integer(2))).unwrap(), None);
    }

    #[test]
    fn nan_range_bounds_are_data_errors() {
        let store = seeded();
        let range = KeyRange::lower_bound(Key::real(f64::NAN));
        assert!(matches!(store.get(&range), Err(EngineError::Data { .. })));
        assert!(matches!(store.count(&range), Err(EngineError::Data { .. })));
    }

    // === Deletion ===

    #[test]
    fn delete_removes_a_span() {
        let mut store = seeded();
        store
            .delete(&KeyRange::bound(Key::integer(1), Key::integer(5), true, false))
            .unwrap();
        assert_eq!(
            store.get_all_keys(&KeyRange::all(), None).unwrap(),
            vec![Key::integer(1), Key::integer(7)]
        );
    }

    #[test]
    fn clear_empties_the_store() {
        let mut store = seeded();
        store.clear();
        assert_eq!(store.count(&KeyRange::all()).unwrap(), 0);
    }

    // === Indexes ===

    fn cat_store() -> StoreState {
        let mut store = with_key_path("id");
        store
            .insert(json!({"id": 1, "name": "tom", "color": "grey"}), None, false)
            .unwrap();
        store
            .insert(json!({"id": 2, "name": "whiskers", "color": "black"}), None, false)
            .unwrap();
        store
            .insert(json!({"id": 3, "name": "ada", "color": "grey"}), None, false)
            .unwrap();
        store
    }

    #[test]
    fn index_backfills_existing_records() {
        let mut store = cat_store();
        store
            .create_index("by_name", KeyPath::single("name"), IndexParams::default())
            .unwrap();
        assert_eq!(store.index_count("by_name", &KeyRange::all()).unwrap(), 3);
        let first = store.index_get("by_name", &KeyRange::all()).unwrap();
        // Index order is by name: ada first.
        assert_eq!(first.unwrap()["id"], 3);
    }

    #[test]
    fn index_reads_follow_index_key_order() {
        let mut store = cat_store();
        store
            .create_index("by_name", KeyPath::single("name"), IndexParams::default())
            .unwrap();
        let keys = store
            .index_get_all_keys("by_name", &KeyRange::all(), None)
            .unwrap();
        assert_eq!(keys, vec![Key::integer(3), Key::integer(1), Key::integer(2)]);
        let some = store
            .index_get_all("by_name", &KeyRange::only(Key::text("tom")), None)
            .unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0]["id"], 1);
        assert_eq!(
            store
                .index_get_key("by_name", &KeyRange::only(Key::text("tom")))
                .unwrap(),
            Some(Key::integer(1))
        );
    }

    #[test]
    fn unique_index_rejects_duplicates_and_names_itself() {
        let mut store = cat_store();
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
        let err = store
            .insert(json!({"id": 9, "name": "tom"}), None, false)
            .unwrap_err();
        assert!(err.is_constraint());
        assert!(err.to_string().contains("name_index"));
        // The failed insert left nothing behind.
        assert_eq!(store.count(&KeyRange::all()).unwrap(), 3);
        assert_eq!(store.index_count("name_index", &KeyRange::all()).unwrap(), 3);
    }

    #[test]
    fn unique_index_allows_overwriting_the_same_record() {
        let mut store = cat_store();
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
        store
            .insert(json!({"id": 1, "name": "tom", "color": "brown"}), None, true)
            .unwrap();
        assert_eq!(store.index_count("name_index", &KeyRange::all()).unwrap(), 3);
    }

    #[test]
    fn unique_backfill_failure_leaves_no_index() {
        let mut store = cat_store();
        store
            .insert(json!({"id": 4, "name": "tom"}), None, false)
            .unwrap();
        let err = store
            .create_index(
                "by_name",
                KeyPath::single("name"),
                IndexParams {
                    unique: true,
                    multi_entry: false,
                },
            )
            .unwrap_err();
        assert!(err.is_constraint());
        assert!(store.index("by_name").is_err());
    }

    #[test]
    fn overwrite_and_delete_maintain_index_entries() {
        let mut store = cat_store();
        store
            .create_index("by_color", KeyPath::single("color"), IndexParams::default())
            .unwrap();
        assert_eq!(
            store
                .index_count("by_color", &KeyRange::only(Key::text("grey")))
                .unwrap(),
            2
        );
        store
            .insert(json!({"id": 1, "name": "tom", "color": "white"}), None, true)
            .unwrap();
        assert_eq!(
            store
                .index_count("by_color", &KeyRange::only(Key::text("grey")))
                .unwrap(),
            1
        );
        store.delete(&KeyRange::only(Key::integer(3))).unwrap();
        assert_eq!(
            store
                .index_count("by_color", &KeyRange::only(Key::text("grey")))
                .unwrap(),
            0
        );
    }

    #[test]
    fn records_without_an_index_key_stay_unindexed() {
        let mut store = cat_store();
        store
            .insert(json!({"id": 10, "color": "grey"}), None, false)
            .unwrap();
        store
            .create_index("by_name", KeyPath::single("name"), IndexParams::default())
            .unwrap();
        assert_eq!(store.index_count("by_name", &KeyRange::all()).unwrap(), 3);
    }

    #[test]
    fn compound_index_assembles_composite_keys() {
        let mut store = cat_store();
        store
            .create_index(
                "by_color_name",
                KeyPath::compound(["color", "name"]),
                IndexParams::default(),
            )
            .unwrap();
        let first = store
            .index_get_key("by_color_name", &KeyRange::all())
            .unwrap();
        // black sorts before grey.
        assert_eq!(first, Some(Key::integer(2)));
        let greys = store
            .index_get_all_keys(
                "by_color_name",
                &KeyRange::bound(
                    Key::composite(vec![Key::text("grey")]),
                    Key::composite(vec![Key::text("grey"), Key::composite(vec![])]),
                    false,
                    false,
                ),
                None,
            )
            .unwrap();
        assert_eq!(greys, vec![Key::integer(3), Key::integer(1)]);
    }

    #[test]
    fn multi_entry_index_flattens_arrays() {
        let mut store = with_key_path("id");
        store
            .insert(json!({"id": 1, "tags": ["black", "small", "black"]}), None, false)
            .unwrap();
        store
            .insert(json!({"id": 2, "tags": ["white", null, "small"]}), None, false)
            .unwrap();
        store.insert(json!({"id": 3, "tags": "plain"}), None, false).unwrap();
        store.insert(json!({"id": 4}), None, false).unwrap();
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
        // Record 1 dedups to two entries, record 2 skips the null, record 3
        // indexes its single value, record 4 contributes nothing.
        assert_eq!(store.index_count("by_tag", &KeyRange::all()).unwrap(), 5);
        let smalls = store
            .index_get_all_keys("by_tag", &KeyRange::only(Key::text("small")), None)
            .unwrap();
        assert_eq!(smalls, vec![Key::integer(1), Key::integer(2)]);
    }

    #[test]
    fn index_creation_rejects_bad_shapes() {
        let mut store = cat_store();
        let err = store
            .create_index(
                "bad",
                KeyPath::compound(["a", "b"]),
                IndexParams {
                    unique: false,
                    multi_entry: true,
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidAccess { .. }));

        store
            .create_index("by_name", KeyPath::single("name"), IndexParams::default())
            .unwrap();
        let dup = store
            .create_index("by_name", KeyPath::single("name"), IndexParams::default())
            .unwrap_err();
        assert!(dup.is_constraint());

        assert!(matches!(
            store.create_index("empty", KeyPath::single(""), IndexParams::default()),
            Err(EngineError::Data { .. })
        ));
    }

    #[test]
    fn delete_index_forgets_the_name() {
        let mut store = cat_store();
        store
            .create_index("by_name", KeyPath::single("name"), IndexParams::default())
            .unwrap();
        assert_eq!(store.index_names(), vec!["by_name".to_owned()]);
        store.delete_index("by_name").unwrap();
        assert!(store.index_names().is_empty());
        assert!(matches!(
            store.delete_index("by_name"),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            store.index_get("by_name", &KeyRange::all()),
            Err(EngineError::NotFound { .. })
        ));
    }
}
