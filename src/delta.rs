//! Deltas: the four ways an environment can be transformed into another
//! (spec.md §3, §4.4).

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::env::Environment;
use crate::error::CobbleError;
use crate::frozen::Value;

/// A pure transformation `Environment -> Environment`. Single-threaded and
/// synchronous (spec.md §5), so `Rc` rather than `Arc` is the right
/// sharing type for the boxed closure.
pub type DeltaFn = Rc<dyn Fn(&Environment) -> Result<Environment, CobbleError>>;

#[derive(Clone)]
pub enum Delta {
    /// The identity delta.
    None,
    /// Literal key/value pairs, coerced and merged one key at a time
    /// through each key's registered shape.
    Map(BTreeMap<String, Value>),
    /// An arbitrary pure function. Concrete targets' `down` delta must be
    /// this variant (spec.md §4.5).
    Func(DeltaFn),
    /// A left-to-right sequence of deltas, applied one after another.
    Seq(Vec<Delta>),
}

impl fmt::Debug for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delta::None => write!(f, "Delta::None"),
            Delta::Map(m) => f.debug_tuple("Delta::Map").field(m).finish(),
            Delta::Func(_) => write!(f, "Delta::Func(..)"),
            Delta::Seq(s) => f.debug_tuple("Delta::Seq").field(s).finish(),
        }
    }
}

impl Delta {
    pub fn map(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Delta::Map(pairs.into_iter().collect())
    }

    pub fn func(f: impl Fn(&Environment) -> Result<Environment, CobbleError> + 'static) -> Self {
        Delta::Func(Rc::new(f))
    }

    pub fn seq(deltas: impl IntoIterator<Item = Delta>) -> Self {
        Delta::Seq(deltas.into_iter().collect())
    }

    /// Statically, every value of this type already has one of the four
    /// accepted shapes; kept for parity with callers that assembled a
    /// `Delta` from data crossing a serialization boundary.
    pub fn is_delta(&self) -> bool {
        true
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Delta::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::KeyRegistry;
    use std::rc::Rc;

    #[test]
    fn none_delta_is_identity() {
        let reg = Rc::new(KeyRegistry::with_reserved_keys());
        let env = Environment::empty(reg);
        let out = env.derive(&Delta::None).unwrap();
        assert!(env.equal(&out));
    }

    #[test]
    fn seq_applies_left_to_right() {
        let mut reg = KeyRegistry::with_reserved_keys();
        reg.define(crate::registry::EnvKey::overrideable_string("CC")).unwrap();
        let reg = Rc::new(reg);
        let env = Environment::empty(reg);
        let delta = Delta::seq([
            Delta::map([("CC".to_string(), Value::str("gcc"))]),
            Delta::map([("CC".to_string(), Value::str("clang"))]),
        ]);
        let out = env.derive(&delta).unwrap();
        assert_eq!(out.get("CC").unwrap(), Value::str("clang"));
    }
}
