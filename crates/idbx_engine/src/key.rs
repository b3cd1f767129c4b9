//! Keys, key paths, and key ranges.
//!
//! Every record in an object store is addressed by a [`Key`]. Keys collate
//! in a fixed order across types: numbers first, then text, then composite
//! keys. Numbers compare by value regardless of representation, so the
//! integer `1` and the real `1.0` are the same key.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};

/// A storable key.
///
/// Constructors are total: any value of this type can be built, including
/// keys that the engine will refuse to store (a NaN real). Storage entry
/// points run [`Key::validate`] before use.
#[derive(Debug, Clone)]
pub enum Key {
    /// UTF-8 text, compared lexicographically by code point.
    Text(String),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit floating point number.
    Real(f64),
    /// Ordered sequence of keys, compared element-wise.
    Composite(Vec<Key>),
}

impl Key {
    /// Creates a text key.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Creates an integer key.
    #[must_use]
    pub fn integer(value: i64) -> Self {
        Self::Integer(value)
    }

    /// Creates a floating point key.
    #[must_use]
    pub fn real(value: f64) -> Self {
        Self::Real(value)
    }

    /// Creates a composite key from parts.
    #[must_use]
    pub fn composite(parts: Vec<Key>) -> Self {
        Self::Composite(parts)
    }

    /// Checks that the key is storable.
    ///
    /// NaN is rejected, anywhere in a composite key. Infinities are fine.
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Self::Real(r) if r.is_nan() => Err(EngineError::data("NaN is not a storable key")),
            Self::Composite(parts) => {
                for part in parts {
                    part.validate()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Converts a JSON value into a key, if it has a key shape.
    ///
    /// Strings, numbers, and arrays of key-shaped values qualify. Objects,
    /// booleans, and null do not. Numbers that fit `i64` become integer
    /// keys; everything else numeric becomes a real key.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::String(text) => Some(Key::Text(text.clone())),
            Value::Number(number) => {
                if let Some(integer) = number.as_i64() {
                    Some(Key::Integer(integer))
                } else {
                    number.as_f64().map(Key::Real)
                }
            }
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Composite),
            _ => None,
        }
    }

    /// Renders the key as a JSON value.
    ///
    /// Valid keys round-trip through [`Key::from_value`] up to numeric
    /// representation. A NaN real, which no store accepts, maps to null.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Integer(integer) => Value::Number((*integer).into()),
            Self::Real(real) => serde_json::Number::from_f64(*real)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Composite(parts) => Value::Array(parts.iter().map(Key::to_value).collect()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Integer(_) | Self::Real(_) => 0,
            Self::Text(_) => 1,
            Self::Composite(_) => 2,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Real(a), Self::Real(b)) => cmp_real(*a, *b),
            (Self::Integer(a), Self::Real(b)) => cmp_integer_real(*a, *b),
            (Self::Real(a), Self::Integer(b)) => cmp_integer_real(*b, *a).reverse(),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Composite(a), Self::Composite(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// Orders reals by numeric value, with `-0.0 == 0.0`.
///
/// NaN never survives validation, but the order must stay total anyway:
/// unvalidated keys flow through comparisons in range checks.
fn cmp_real(a: f64, b: f64) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if a < b {
        return Ordering::Less;
    }
    if a > b {
        return Ordering::Greater;
    }
    a.total_cmp(&b)
}

/// Exact comparison of an integer against a real.
///
/// Casting the integer to `f64` would lose precision past 2^53, so the
/// real is split into integral part and fraction instead.
fn cmp_integer_real(integer: i64, real: f64) -> Ordering {
    if real.is_nan() {
        // Mirror total_cmp: negative NaN sorts below every number,
        // positive NaN above.
        return if real.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if real == f64::INFINITY {
        return Ordering::Less;
    }
    if real == f64::NEG_INFINITY {
        return Ordering::Greater;
    }
    let floor = real.floor();
    if floor < i64::MIN as f64 {
        return Ordering::Greater;
    }
    // i64::MAX as f64 rounds up to 2^63, so `>=` covers the whole band
    // of reals past the largest integer.
    if floor >= i64::MAX as f64 {
        return Ordering::Less;
    }
    // Integral f64 values in [-2^63, 2^63) convert exactly.
    let floor_int = floor as i64;
    match integer.cmp(&floor_int) {
        Ordering::Equal => {
            if real > floor {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        }
        unequal => unequal,
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Integer(integer) => write!(f, "{integer}"),
            Self::Real(real) => write!(f, "{real}"),
            Self::Composite(parts) => {
                f.write_str("[")?;
                for (position, part) in parts.iter().enumerate() {
                    if position > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Key {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Key {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Key {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<Vec<Key>> for Key {
    fn from(parts: Vec<Key>) -> Self {
        Self::Composite(parts)
    }
}

/// Location of the key inside a record value.
///
/// A single path is a dotted traversal of nested objects (`"address.city"`).
/// A compound path evaluates several single paths and assembles their
/// results into one composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPath {
    /// One dotted path.
    Single(String),
    /// Several dotted paths yielding a composite key.
    Compound(Vec<String>),
}

impl KeyPath {
    /// Creates a single dotted path.
    pub fn single(path: impl Into<String>) -> Self {
        Self::Single(path.into())
    }

    /// Creates a compound path from several dotted paths.
    pub fn compound<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Compound(paths.into_iter().map(Into::into).collect())
    }

    /// Returns `true` for compound paths.
    #[must_use]
    pub fn is_compound(&self) -> bool {
        matches!(self, Self::Compound(_))
    }

    /// Checks that the path is usable: no empty path strings, and a
    /// compound path names at least one member.
    pub(crate) fn validate(&self) -> EngineResult<()> {
        match self {
            Self::Single(path) if path.is_empty() => {
                Err(EngineError::data("key path must not be empty"))
            }
            Self::Compound(paths) if paths.is_empty() => Err(EngineError::data(
                "compound key path must name at least one path",
            )),
            Self::Compound(paths) if paths.iter().any(String::is_empty) => {
                Err(EngineError::data("key path must not be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Extracts the key this path selects from a record value.
    ///
    /// Returns `None` when any traversed field is missing or the value
    /// found there has no key shape. A compound path yields a key only if
    /// every member path does.
    #[must_use]
    pub fn evaluate(&self, value: &Value) -> Option<Key> {
        match self {
            Self::Single(path) => Key::from_value(lookup(value, path)?),
            Self::Compound(paths) => paths
                .iter()
                .map(|path| Key::from_value(lookup(value, path)?))
                .collect::<Option<Vec<_>>>()
                .map(Key::Composite),
        }
    }

    /// Writes a key into a record value at this path, creating missing
    /// intermediate objects.
    ///
    /// Only single paths support injection. Fails if the traversal crosses
    /// a value that is not an object.
    pub(crate) fn inject(&self, target: &mut Value, key: &Key) -> EngineResult<()> {
        let Self::Single(path) = self else {
            return Err(EngineError::data(
                "cannot inject a generated key through a compound key path",
            ));
        };
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop().unwrap_or(path);
        let mut cursor = target;
        for segment in segments {
            let map = match cursor {
                Value::Object(map) => map,
                _ => {
                    return Err(EngineError::data(format!(
                        "key path '{path}' crosses a non-object value"
                    )))
                }
            };
            cursor = map
                .entry(segment.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        match cursor {
            Value::Object(map) => {
                map.insert(last.to_owned(), key.to_value());
                Ok(())
            }
            _ => Err(EngineError::data(format!(
                "key path '{path}' crosses a non-object value"
            ))),
        }
    }
}

/// Follows a dotted path through nested objects.
pub(crate) fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = value;
    for segment in path.split('.') {
        cursor = cursor.as_object()?.get(segment)?;
    }
    Some(cursor)
}

/// A contiguous span of keys, with optional open bounds on either side.
///
/// Every read and delete takes a range; a single-key lookup is the
/// degenerate range [`KeyRange::only`]. A range whose lower bound exceeds
/// its upper bound is legal to build and matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Option<Key>,
    upper: Option<Key>,
    lower_excluded: bool,
    upper_excluded: bool,
}

impl KeyRange {
    /// The range matching every key.
    #[must_use]
    pub fn all() -> Self {
        Self {
            lower: None,
            upper: None,
            lower_excluded: false,
            upper_excluded: false,
        }
    }

    /// The range matching exactly one key.
    #[must_use]
    pub fn only(key: Key) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_excluded: false,
            upper_excluded: false,
        }
    }

    /// Keys at or above `key`.
    #[must_use]
    pub fn lower_bound(key: Key) -> Self {
        Self {
            lower: Some(key),
            upper: None,
            lower_excluded: false,
            upper_excluded: false,
        }
    }

    /// Keys strictly above `key`.
    #[must_use]
    pub fn lower_bound_excluded(key: Key) -> Self {
        Self {
            lower: Some(key),
            upper: None,
            lower_excluded: true,
            upper_excluded: false,
        }
    }

    /// Keys at or below `key`.
    #[must_use]
    pub fn upper_bound(key: Key) -> Self {
        Self {
            lower: None,
            upper: Some(key),
            lower_excluded: false,
            upper_excluded: false,
        }
    }

    /// Keys strictly below `key`.
    #[must_use]
    pub fn upper_bound_excluded(key: Key) -> Self {
        Self {
            lower: None,
            upper: Some(key),
            lower_excluded: false,
            upper_excluded: true,
        }
    }

    /// Keys between `lower` and `upper`, with either end optionally
    /// excluded.
    #[must_use]
    pub fn bound(lower: Key, upper: Key, lower_excluded: bool, upper_excluded: bool) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_excluded,
            upper_excluded,
        }
    }

    /// Lower bound, if any.
    #[must_use]
    pub fn lower(&self) -> Option<&Key> {
        self.lower.as_ref()
    }

    /// Upper bound, if any.
    #[must_use]
    pub fn upper(&self) -> Option<&Key> {
        self.upper.as_ref()
    }

    /// Whether the lower bound itself is outside the range.
    #[must_use]
    pub fn lower_excluded(&self) -> bool {
        self.lower_excluded
    }

    /// Whether the upper bound itself is outside the range.
    #[must_use]
    pub fn upper_excluded(&self) -> bool {
        self.upper_excluded
    }

    /// Returns `true` for the unbounded range.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    /// Returns `true` if the key falls within the range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            match key.cmp(lower) {
                Ordering::Less => return false,
                Ordering::Equal if self.lower_excluded => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match key.cmp(upper) {
                Ordering::Greater => return false,
                Ordering::Equal if self.upper_excluded => return false,
                _ => {}
            }
        }
        true
    }

    /// Checks that the bounds are storable keys.
    pub(crate) fn validate(&self) -> EngineResult<()> {
        if let Some(lower) = &self.lower {
            lower.validate()?;
        }
        if let Some(upper) = &self.upper {
            upper.validate()?;
        }
        Ok(())
    }

    /// Returns `true` when no key can satisfy the range.
    pub(crate) fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper)) => match lower.cmp(upper) {
                Ordering::Greater => true,
                Ordering::Equal => self.lower_excluded || self.upper_excluded,
                Ordering::Less => false,
            },
            _ => false,
        }
    }

    /// Bounds in the form ordered-map range scans take.
    ///
    /// Callers must check [`KeyRange::is_empty`] first: the standard
    /// collections panic on inverted ranges.
    pub(crate) fn bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        let lower = match &self.lower {
            None => Bound::Unbounded,
            Some(key) if self.lower_excluded => Bound::Excluded(key),
            Some(key) => Bound::Included(key),
        };
        let upper = match &self.upper {
            None => Bound::Unbounded,
            Some(key) if self.upper_excluded => Bound::Excluded(key),
            Some(key) => Bound::Included(key),
        };
        (lower, upper)
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        Self::only(key)
    }
}
