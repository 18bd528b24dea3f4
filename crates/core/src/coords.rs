//! Coordinates identifying one point in an N-dimensional acquisition space.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A single axis position: an integer index or a named position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisValue {
    /// Integer index along the axis (e.g. a time point or z slice).
    Int(i64),
    /// Named position along the axis (e.g. a channel name).
    Str(String),
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisValue::Int(v) => write!(f, "{v}"),
            AxisValue::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for AxisValue {
    fn from(v: i64) -> Self {
        AxisValue::Int(v)
    }
}

impl From<i32> for AxisValue {
    fn from(v: i32) -> Self {
        AxisValue::Int(i64::from(v))
    }
}

impl From<u32> for AxisValue {
    fn from(v: u32) -> Self {
        AxisValue::Int(i64::from(v))
    }
}

impl From<&str> for AxisValue {
    fn from(v: &str) -> Self {
        AxisValue::Str(v.to_string())
    }
}

impl From<String> for AxisValue {
    fn from(v: String) -> Self {
        AxisValue::Str(v)
    }
}

/// An ordered mapping from axis name to axis value.
///
/// Identity (equality and hashing) is defined over the unordered set of
/// `(name, value)` pairs; insertion order is preserved for iteration and
/// display only. Serializes to a plain JSON object and back without loss.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataCoordinates {
    axes: IndexMap<String, AxisValue>,
}

impl DataCoordinates {
    /// An empty coordinate set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build coordinates from `(name, value)` pairs, preserving order.
    pub fn from_pairs<N, V, I>(pairs: I) -> Self
    where
        N: Into<String>,
        V: Into<AxisValue>,
        I: IntoIterator<Item = (N, V)>,
    {
        let axes = pairs
            .into_iter()
            .map(|(n, v)| (n.into(), v.into()))
            .collect();
        Self { axes }
    }

    /// Add or replace one axis. Axes may be added after construction.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AxisValue>) {
        self.axes.insert(name.into(), value.into());
    }

    /// Value of the named axis, if present.
    pub fn get(&self, name: &str) -> Option<&AxisValue> {
        self.axes.get(name)
    }

    /// Whether the named axis is present.
    pub fn contains_axis(&self, name: &str) -> bool {
        self.axes.contains_key(name)
    }

    /// Number of axes.
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    /// Whether there are no axes.
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Iterate `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AxisValue)> {
        self.axes.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Axis names in insertion order.
    pub fn axis_names(&self) -> impl Iterator<Item = &str> {
        self.axes.keys().map(String::as_str)
    }

    /// The coordinates as a JSON object (round-trips through `Deserialize`).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl PartialEq for DataCoordinates {
    fn eq(&self, other: &Self) -> bool {
        // IndexMap equality ignores order.
        self.axes == other.axes
    }
}

impl Eq for DataCoordinates {}

impl Hash for DataCoordinates {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Commutative combination so hash agrees with order-insensitive equality.
        let mut acc: u64 = 0;
        for (name, value) in &self.axes {
            let mut pair = DefaultHasher::new();
            name.hash(&mut pair);
            value.hash(&mut pair);
            acc = acc.wrapping_add(pair.finish());
        }
        state.write_u64(acc);
        state.write_usize(self.axes.len());
    }
}

impl fmt::Display for DataCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.axes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, "}}")
    }
}

impl<N: Into<String>, V: Into<AxisValue>> FromIterator<(N, V)> for DataCoordinates {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

/// A finite or lazy sequence of coordinates an acquisition may produce.
///
/// `may_produce` must be answerable without forcing enumeration past
/// already-seen entries; it is consulted to prove that a requested
/// coordinate can never appear.
pub trait CoordinateSequence: Send + Sync {
    /// Whether `coords` could appear somewhere in the sequence.
    fn may_produce(&self, coords: &DataCoordinates) -> bool;

    /// Whether the sequence is finite.
    fn is_finite(&self) -> bool;

    /// Exact length, when finite and cheaply computable.
    fn length(&self) -> Option<usize>;
}

/// An explicit, finite list of coordinates.
#[derive(Debug, Clone, Default)]
pub struct CoordinateList {
    coords: Vec<DataCoordinates>,
}

impl CoordinateList {
    /// Build from an explicit list.
    pub fn new(coords: Vec<DataCoordinates>) -> Self {
        Self { coords }
    }

    /// Iterate the listed coordinates in order.
    pub fn iter(&self) -> impl Iterator<Item = &DataCoordinates> {
        self.coords.iter()
    }
}

impl CoordinateSequence for CoordinateList {
    fn may_produce(&self, coords: &DataCoordinates) -> bool {
        self.coords.contains(coords)
    }

    fn is_finite(&self) -> bool {
        true
    }

    fn length(&self) -> Option<usize> {
        Some(self.coords.len())
    }
}

/// The domain of one axis of an [`AxisSpace`].
#[derive(Debug, Clone)]
pub enum AxisDomain {
    /// Contiguous integer range, open-ended when `end` is `None`.
    Range {
        /// First value (inclusive).
        start: i64,
        /// One past the last value; `None` means unbounded.
        end: Option<i64>,
    },
    /// Explicit set of values.
    Values(Vec<AxisValue>),
}

impl AxisDomain {
    fn contains(&self, value: &AxisValue) -> bool {
        match self {
            AxisDomain::Range { start, end } => match value {
                AxisValue::Int(v) => *v >= *start && end.is_none_or(|e| *v < e),
                AxisValue::Str(_) => false,
            },
            AxisDomain::Values(values) => values.contains(value),
        }
    }

    fn len(&self) -> Option<usize> {
        match self {
            AxisDomain::Range { start, end } => {
                end.map(|e| usize::try_from(e.saturating_sub(*start)).unwrap_or(0))
            }
            AxisDomain::Values(values) => Some(values.len()),
        }
    }

    fn value_at(&self, index: usize) -> Option<AxisValue> {
        match self {
            AxisDomain::Range { start, end } => {
                let v = start.checked_add(i64::try_from(index).ok()?)?;
                match end {
                    Some(e) if v >= *e => None,
                    _ => Some(AxisValue::Int(v)),
                }
            }
            AxisDomain::Values(values) => values.get(index).cloned(),
        }
    }
}

/// A lazy cartesian product of per-axis domains.
///
/// Finite when every axis is finite. Iteration is row-major with the last
/// axis fastest; only the first axis may be open-ended.
#[derive(Debug, Clone, Default)]
pub struct AxisSpace {
    axes: Vec<(String, AxisDomain)>,
}

impl AxisSpace {
    /// An empty space (produces nothing).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an axis with the given domain.
    pub fn axis(mut self, name: impl Into<String>, domain: AxisDomain) -> Self {
        self.axes.push((name.into(), domain));
        self
    }

    /// Append an axis over the integer range `start..end`.
    pub fn axis_range(self, name: impl Into<String>, start: i64, end: i64) -> Self {
        self.axis(name, AxisDomain::Range { start, end: Some(end) })
    }

    /// Append an axis over an explicit value set.
    pub fn axis_values<V: Into<AxisValue>>(
        self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.axis(
            name,
            AxisDomain::Values(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Lazily iterate the product, row-major, last axis fastest.
    pub fn iter(&self) -> AxisSpaceIter<'_> {
        AxisSpaceIter {
            space: self,
            odometer: vec![0; self.axes.len()],
            exhausted: self.axes.is_empty(),
        }
    }
}

impl CoordinateSequence for AxisSpace {
    fn may_produce(&self, coords: &DataCoordinates) -> bool {
        if coords.len() != self.axes.len() {
            return false;
        }
        self.axes.iter().all(|(name, domain)| {
            coords.get(name).is_some_and(|value| domain.contains(value))
        })
    }

    fn is_finite(&self) -> bool {
        self.axes.iter().all(|(_, d)| d.len().is_some())
    }

    fn length(&self) -> Option<usize> {
        self.axes
            .iter()
            .map(|(_, d)| d.len())
            .try_fold(1usize, |acc, len| acc.checked_mul(len?))
    }
}

/// Lazy iterator over an [`AxisSpace`] product.
#[derive(Debug)]
pub struct AxisSpaceIter<'a> {
    space: &'a AxisSpace,
    odometer: Vec<usize>,
    exhausted: bool,
}

impl Iterator for AxisSpaceIter<'_> {
    type Item = DataCoordinates;

    fn next(&mut self) -> Option<DataCoordinates> {
        if self.exhausted {
            return None;
        }

        let mut coords = DataCoordinates::new();
        for ((name, domain), index) in self.space.axes.iter().zip(&self.odometer) {
            coords.insert(name.clone(), domain.value_at(*index)?);
        }

        // Advance, last axis fastest; carry into open-ended first axes forever.
        let mut pos = self.odometer.len();
        loop {
            if pos == 0 {
                self.exhausted = true;
                break;
            }
            pos -= 1;
            self.odometer[pos] += 1;
            let (_, domain) = &self.space.axes[pos];
            let in_range = domain.value_at(self.odometer[pos]).is_some();
            if in_range {
                break;
            }
            if pos == 0 {
                self.exhausted = true;
                break;
            }
            self.odometer[pos] = 0;
        }

        Some(coords)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    use super::*;

    #[test]
    fn test_identity_ignores_order() {
        let a = DataCoordinates::from_pairs([("t", AxisValue::from(1)), ("z", AxisValue::from(2))]);
        let b = DataCoordinates::from_pairs([("z", AxisValue::from(2)), ("t", AxisValue::from(1))]);
        assert_eq!(a, b);
        let state = RandomState::new();
        assert_eq!(state.hash_one(&a), state.hash_one(&b));
    }

    #[test]
    fn test_display_preserves_order() {
        let mut c = DataCoordinates::new();
        c.insert("t", 3);
        c.insert("channel", "DAPI");
        assert_eq!(c.to_string(), "{t=3, channel=DAPI}");
    }

    #[test]
    fn test_distinct_values_distinct_identity() {
        let a = DataCoordinates::from_pairs([("t", 1i64)]);
        let b = DataCoordinates::from_pairs([("t", 2i64)]);
        assert_ne!(a, b);
        let state = RandomState::new();
        assert_ne!(state.hash_one(&a), state.hash_one(&b));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut c = DataCoordinates::new();
        c.insert("t", 5);
        c.insert("channel", "GFP");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"t":5,"channel":"GFP"}"#);
        let back: DataCoordinates = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_axis_space_product() {
        let space = AxisSpace::new()
            .axis_range("t", 0, 2)
            .axis_values("channel", ["A", "B"]);
        assert!(space.is_finite());
        assert_eq!(space.length(), Some(4));

        let all: Vec<_> = space.iter().collect();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0], DataCoordinates::from_pairs([("t", AxisValue::from(0)), ("channel", AxisValue::from("A"))]));
        assert_eq!(all[1], DataCoordinates::from_pairs([("t", AxisValue::from(0)), ("channel", AxisValue::from("B"))]));
        assert_eq!(all[3], DataCoordinates::from_pairs([("t", AxisValue::from(1)), ("channel", AxisValue::from("B"))]));

        assert!(space.may_produce(&all[2]));
        let outside = DataCoordinates::from_pairs([("t", AxisValue::from(7)), ("channel", AxisValue::from("A"))]);
        assert!(!space.may_produce(&outside));
    }

    #[test]
    fn test_open_ended_axis() {
        let space = AxisSpace::new()
            .axis("t", AxisDomain::Range { start: 0, end: None })
            .axis_values("channel", ["A"]);
        assert!(!space.is_finite());
        assert_eq!(space.length(), None);
        assert!(space.may_produce(&DataCoordinates::from_pairs([
            ("t", AxisValue::from(1_000_000)),
            ("channel", AxisValue::from("A")),
        ])));

        let first3: Vec<_> = space.iter().take(3).collect();
        assert_eq!(first3[2].get("t"), Some(&AxisValue::Int(2)));
    }
}
