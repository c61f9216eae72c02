//! Environment keys and the closed registry that defines them (spec.md §3,
//! §4.2).
//!
//! An [`EnvKey`] is built from one of a fixed set of shapes rather than an
//! arbitrary pair of closures (the spec's Design Notes call this out
//! explicitly): an overrideable scalar, an appending string sequence, a
//! prepending string sequence, or an unordered set of strings, plus a
//! `Custom` escape hatch for anything else. Each shape fixes how a literal
//! is coerced, how two values for the same key combine on merge, and how a
//! stored value reads out to callers.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::error::CobbleError;
use crate::frozen::Value;

type FromLiteral = Rc<dyn Fn(&str, &Value) -> Result<Value, CobbleError>>;
type Combine = Rc<dyn Fn(&str, &Value, &Value) -> Result<Option<Value>, CobbleError>>;
type Readout = Rc<dyn Fn(&Value) -> Value>;

#[derive(Clone)]
enum KeyShape {
    OverrideableScalar,
    AppendingStringSeq,
    PrependingStringSeq,
    StringSet,
    Custom { from_literal: FromLiteral, combine: Option<Combine>, readout: Option<Readout> },
}

/// A single environment key: its name, its shape, an optional default, and
/// an optional `help` string (carried through from the original's
/// `EnvKey(name, help=...)` for the two reserved keys, spec.md §3).
#[derive(Clone)]
pub struct EnvKey {
    pub name: String,
    pub help: Option<String>,
    default: Option<Value>,
    shape: KeyShape,
}

fn expect_string_seq(key: &str, v: &Value) -> Result<Vec<Value>, CobbleError> {
    match v {
        Value::Tuple(items) => {
            for item in items {
                if !matches!(item, Value::Str(_)) {
                    return Err(CobbleError::BadLiteral {
                        key: key.to_string(),
                        reason: "expected a sequence of strings".into(),
                    });
                }
            }
            Ok(items.clone())
        }
        Value::Str(_) => Err(CobbleError::BadLiteral {
            key: key.to_string(),
            reason: "expected a sequence of strings, got a bare string".into(),
        }),
        _ => Err(CobbleError::BadLiteral { key: key.to_string(), reason: "expected a sequence of strings".into() }),
    }
}

impl EnvKey {
    pub fn overrideable_string(name: impl Into<String>) -> Self {
        Self { name: name.into(), help: None, default: None, shape: KeyShape::OverrideableScalar }
    }

    pub fn overrideable_bool(name: impl Into<String>, default: bool) -> Self {
        Self {
            name: name.into(),
            help: None,
            default: Some(Value::Bool(default)),
            shape: KeyShape::OverrideableScalar,
        }
    }

    pub fn appending_string_seq(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: None,
            default: Some(Value::Tuple(Vec::new())),
            shape: KeyShape::AppendingStringSeq,
        }
    }

    pub fn prepending_string_seq(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: None,
            default: Some(Value::Tuple(Vec::new())),
            shape: KeyShape::PrependingStringSeq,
        }
    }

    pub fn string_set(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: None,
            default: Some(Value::Set(BTreeSet::new())),
            shape: KeyShape::StringSet,
        }
    }

    pub fn custom(
        name: impl Into<String>,
        default: Option<Value>,
        from_literal: FromLiteral,
        combine: Option<Combine>,
        readout: Option<Readout>,
    ) -> Self {
        Self { name: name.into(), help: None, default, shape: KeyShape::Custom { from_literal, combine, readout } }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Coerces a raw literal into this key's canonical shape.
    pub fn from_literal(&self, v: &Value) -> Result<Value, CobbleError> {
        match &self.shape {
            KeyShape::OverrideableScalar => Ok(v.clone()),
            KeyShape::AppendingStringSeq | KeyShape::PrependingStringSeq => {
                Ok(Value::Tuple(expect_string_seq(&self.name, v)?))
            }
            KeyShape::StringSet => {
                let items = expect_string_seq(&self.name, v)?;
                Ok(Value::Set(items.into_iter().collect()))
            }
            KeyShape::Custom { from_literal, .. } => from_literal(&self.name, v),
        }
    }

    /// Combines an existing value with an incoming one for the same key.
    /// `Ok(None)` means the key is deleted by the merge (reserved for
    /// custom shapes); `Err(MergeConflict)` means the shape disallows
    /// overriding and the two values differ.
    pub fn combine(&self, old: &Value, new: &Value) -> Result<Option<Value>, CobbleError> {
        match &self.shape {
            KeyShape::OverrideableScalar => Ok(Some(new.clone())),
            KeyShape::AppendingStringSeq => {
                let (Value::Tuple(a), Value::Tuple(b)) = (old, new) else {
                    return Err(CobbleError::BadLiteral { key: self.name.clone(), reason: "not a sequence".into() });
                };
                let mut merged = a.clone();
                merged.extend(b.iter().cloned());
                Ok(Some(Value::Tuple(merged)))
            }
            KeyShape::PrependingStringSeq => {
                let (Value::Tuple(a), Value::Tuple(b)) = (old, new) else {
                    return Err(CobbleError::BadLiteral { key: self.name.clone(), reason: "not a sequence".into() });
                };
                let mut merged = b.clone();
                merged.extend(a.iter().cloned());
                Ok(Some(Value::Tuple(merged)))
            }
            KeyShape::StringSet => {
                let (Value::Set(a), Value::Set(b)) = (old, new) else {
                    return Err(CobbleError::BadLiteral { key: self.name.clone(), reason: "not a set".into() });
                };
                Ok(Some(Value::Set(a.union(b).cloned().collect())))
            }
            KeyShape::Custom { combine, .. } => match combine {
                Some(f) => f(&self.name, old, new),
                None => {
                    if old == new {
                        Ok(Some(old.clone()))
                    } else {
                        Err(CobbleError::MergeConflict {
                            key: self.name.clone(),
                            old: old.to_string(),
                            new: new.to_string(),
                        })
                    }
                }
            },
        }
    }

    /// Applies this key's readout transform to a stored value, e.g. a
    /// join-by-space reduction of a sequence for template substitution.
    /// Defaults to identity.
    pub fn readout(&self, v: &Value) -> Value {
        match &self.shape {
            KeyShape::Custom { readout: Some(f), .. } => f(v),
            _ => v.clone(),
        }
    }
}

/// `__implicit__`: extra build inputs that do not appear on the command
/// line but must be listed as Ninja implicit dependencies (spec.md §4.7).
pub const IMPLICIT: &str = "__implicit__";
/// `__order_only__`: inputs that must be built first but aren't true
/// dependencies for freshness checks.
pub const ORDER_ONLY: &str = "__order_only__";

pub fn reserved_keys() -> Vec<EnvKey> {
    vec![
        EnvKey::string_set(IMPLICIT)
            .with_help("extra inputs that participate in staleness checks but aren't named on the command line"),
        EnvKey::string_set(ORDER_ONLY)
            .with_help("inputs that must exist before the build step runs but don't affect staleness"),
    ]
}

/// The closed set of keys an evaluation run is allowed to reference.
/// Read-only once loading finishes; only the per-target memo caches
/// mutate after that point (spec.md §5).
pub struct KeyRegistry {
    keys: BTreeMap<String, Rc<EnvKey>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self { keys: BTreeMap::new() }
    }

    /// A registry pre-populated with the two reserved keys, matching
    /// `cobble.env.KEYS`/`cobble.target.KEYS` being defined unconditionally
    /// by the loader before any plugin keys.
    pub fn with_reserved_keys() -> Self {
        let mut reg = Self::new();
        for k in reserved_keys() {
            reg.define(k).expect("reserved keys never collide");
        }
        reg
    }

    pub fn define(&mut self, key: EnvKey) -> Result<(), CobbleError> {
        if self.keys.contains_key(&key.name) {
            return Err(CobbleError::DuplicateKey(key.name));
        }
        self.keys.insert(key.name.clone(), Rc::new(key));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Rc<EnvKey>> {
        self.keys.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<EnvKey>> {
        self.keys.values()
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::with_reserved_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defining_the_same_key_twice_is_fatal() {
        let mut reg = KeyRegistry::new();
        reg.define(EnvKey::overrideable_string("CC")).unwrap();
        let err = reg.define(EnvKey::overrideable_string("CC")).unwrap_err();
        assert!(matches!(err, CobbleError::DuplicateKey(ref k) if k == "CC"));
    }

    #[test]
    fn reserved_keys_carry_help_text() {
        let reg = KeyRegistry::with_reserved_keys();
        let k = reg.get(IMPLICIT).unwrap();
        assert!(k.help.is_some());
    }

    #[test]
    fn appending_seq_rejects_bare_strings() {
        let key = EnvKey::appending_string_seq("C_FLAGS");
        let err = key.from_literal(&Value::str("-O2")).unwrap_err();
        assert!(matches!(err, CobbleError::BadLiteral { .. }));
    }

    #[test]
    fn appending_seq_combine_appends_in_order() {
        let key = EnvKey::appending_string_seq("C_FLAGS");
        let a = Value::tuple([Value::str("-O2")]);
        let b = Value::tuple([Value::str("-Wall")]);
        let merged = key.combine(&a, &b).unwrap().unwrap();
        assert_eq!(merged, Value::tuple([Value::str("-O2"), Value::str("-Wall")]));
    }

    #[test]
    fn prepending_seq_combine_prepends() {
        let key = EnvKey::prepending_string_seq("INCLUDE");
        let a = Value::tuple([Value::str("/usr/include")]);
        let b = Value::tuple([Value::str("/opt/include")]);
        let merged = key.combine(&a, &b).unwrap().unwrap();
        assert_eq!(merged, Value::tuple([Value::str("/opt/include"), Value::str("/usr/include")]));
    }

    #[test]
    fn overrideable_scalar_conflict_free_by_construction() {
        let key = EnvKey::overrideable_string("CC");
        let merged = key.combine(&Value::str("gcc"), &Value::str("clang")).unwrap().unwrap();
        assert_eq!(merged, Value::str("clang"));
    }

    #[test]
    fn string_set_combine_unions() {
        let key = EnvKey::string_set(IMPLICIT);
        let a = Value::set([Value::str("a")]);
        let b = Value::set([Value::str("b")]);
        let merged = key.combine(&a, &b).unwrap().unwrap();
        assert_eq!(merged, Value::set([Value::str("a"), Value::str("b")]));
    }
}
