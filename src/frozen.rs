//! Frozen data values (spec.md §3, §4.1).
//!
//! `Value` is the canonical, immutable datum an [`crate::env::Environment`]
//! stores: strings, bools, null, ordered tuples, and unordered sets, all
//! built from the same five variants all the way down. `Raw` is the shape
//! callers build before freezing; in a duck-typed host, `freeze` must also
//! reject the "neither ordered nor unordered" case, but Rust's type system
//! already rules that case out statically, so `freeze` here is a total,
//! infallible conversion rather than the original's fallible one.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A canonical frozen datum.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Bool(bool),
    Null,
    /// Order-preserving sequence.
    Tuple(Vec<Value>),
    /// Unordered collection; `BTreeSet` gives us a canonical iteration
    /// order for free, which the digest step in `env.rs` relies on.
    Set(BTreeSet<Value>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(items.into_iter().collect())
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Set(items.into_iter().collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Every value that reaches this type is already frozen by
    /// construction; kept as an explicit predicate for parity with
    /// callers crossing a serialization boundary (e.g. values that came
    /// in as JSON), where nothing statically guarantees the shape.
    pub fn is_frozen(&self) -> bool {
        true
    }

    /// Renders a value for splicing into a `$name` template substitution.
    /// Strings pass through; composite values are rendered the way the
    /// one example the spec gives for a custom readout does (space-joined
    /// elements), generalized into the default so an un-readout'd
    /// sequence key still produces something usable in a template rather
    /// than a debug dump.
    pub fn template_repr(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            Value::Tuple(items) => items.iter().map(Value::template_repr).collect::<Vec<_>>().join(" "),
            Value::Set(items) => items.iter().map(Value::template_repr).collect::<Vec<_>>().join(" "),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.template_repr())
    }
}

/// Converts any `Set` nodes, at any depth, into sorted `Tuple` nodes.
/// Used only when computing a digest: two environments that happen to
/// store the same elements as a `Set` vs. a `Tuple` should not digest
/// differently due to the tag alone once the *contents* are the same
/// sorted sequence. `BTreeSet` iteration is already sorted, so this is
/// just a tag rewrite, not a re-sort.
pub fn normalise(v: &Value) -> Value {
    match v {
        Value::Str(_) | Value::Bool(_) | Value::Null => v.clone(),
        Value::Tuple(items) => Value::Tuple(items.iter().map(normalise).collect()),
        Value::Set(items) => Value::Tuple(items.iter().map(normalise).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_is_idempotent() {
        let v = Value::tuple([Value::str("a"), Value::Bool(true)]);
        assert_eq!(normalise(&v), normalise(&normalise(&v)));
    }

    #[test]
    fn is_frozen_holds_for_every_shape() {
        assert!(Value::Null.is_frozen());
        assert!(Value::str("x").is_frozen());
        assert!(Value::set([Value::str("a")]).is_frozen());
    }

    #[test]
    fn normalise_collapses_sets_to_sorted_tuples() {
        let set = Value::set([Value::str("b"), Value::str("a")]);
        assert_eq!(normalise(&set), Value::tuple([Value::str("a"), Value::str("b")]));
    }

    #[test]
    fn template_repr_joins_composite_values_with_spaces() {
        let t = Value::tuple([Value::str("1"), Value::str("2")]);
        assert_eq!(t.template_repr(), "1 2");
    }
}
