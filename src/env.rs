//! Frozen environments keyed by a closed registry (spec.md §3, §4.2, §4.3).

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use sha1::{Digest, Sha1};

use crate::delta::Delta;
use crate::error::CobbleError;
use crate::frozen::{normalise, Value};
use crate::registry::KeyRegistry;

/// Either a predicate over key names or an explicit set of names, for
/// `Environment::without` (`cobble/env.py::Env.without` accepts both a
/// callable and a container).
pub enum Matcher<'a> {
    Names(&'a BTreeSet<String>),
    Pred(&'a dyn Fn(&str) -> bool),
}

impl<'a> Matcher<'a> {
    fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Names(set) => set.contains(name),
            Matcher::Pred(f) => f(name),
        }
    }
}

/// An immutable mapping from key name to frozen value, tied to one
/// [`KeyRegistry`]. Two environments are equal only if they share a
/// registry (by identity), and their contents and digest both match — a
/// deliberate strengthening over registry+digest alone (spec.md §4.3).
#[derive(Clone)]
pub struct Environment {
    registry: Rc<KeyRegistry>,
    dict: BTreeMap<String, Value>,
    digest: RefCell<Option<String>>,
}

impl Environment {
    pub fn empty(registry: Rc<KeyRegistry>) -> Self {
        Self { registry, dict: BTreeMap::new(), digest: RefCell::new(None) }
    }

    /// Builds an environment directly from already-coerced values. Every
    /// key must be known to the registry; this is the entry point a
    /// loader uses to seed the root environment (`ROOT`, `BUILD_DIR`,
    /// ...), and the one `derive` uses internally once each key's
    /// from_literal/combine step has already run.
    pub fn new(registry: Rc<KeyRegistry>, dict: BTreeMap<String, Value>) -> Result<Self, CobbleError> {
        for key in dict.keys() {
            if !registry.contains(key) {
                return Err(CobbleError::UnknownKey(key.clone()));
            }
        }
        Ok(Self { registry, dict, digest: RefCell::new(None) })
    }

    pub fn registry(&self) -> &Rc<KeyRegistry> {
        &self.registry
    }

    /// Raw stored value, with no readout applied. A key with no stored
    /// value and no default reads out as `Value::Null` rather than
    /// erroring -- the only failure mode `get`/`get_raw` have is
    /// referencing a key the registry doesn't know about at all
    /// (spec.md §4.3; `cobble/env.py::Env.__getitem__` never raises here
    /// either, it just returns `readout(None)`). Use `subset_require`
    /// when an absent-and-default-less key should be fatal.
    pub fn get_raw(&self, name: &str) -> Result<Value, CobbleError> {
        if !self.registry.contains(name) {
            return Err(CobbleError::UnknownKey(name.to_string()));
        }
        match self.dict.get(name) {
            Some(v) => Ok(v.clone()),
            None => {
                let key = self.registry.get(name).unwrap();
                Ok(key.default().cloned().unwrap_or(Value::Null))
            }
        }
    }

    /// The key's readout applied to the stored (or default, or `Null`)
    /// value.
    pub fn get(&self, name: &str) -> Result<Value, CobbleError> {
        let key = self.registry.get(name).ok_or_else(|| CobbleError::UnknownKey(name.to_string()))?;
        let raw = self.get_raw(name)?;
        Ok(key.readout(&raw))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dict.contains_key(name)
    }

    /// Restrict to just the named keys that are actually present; missing
    /// names are silently skipped (use `subset_require` to demand them).
    pub fn subset(&self, names: &BTreeSet<String>) -> Self {
        let dict = self.dict.iter().filter(|(k, _)| names.contains(*k)).map(|(k, v)| (k.clone(), v.clone())).collect();
        Self { registry: self.registry.clone(), dict, digest: RefCell::new(None) }
    }

    /// Like `subset`, but every named key must be present (with a value
    /// or a default), or `MissingRequired` is raised. Unlike `get_raw`,
    /// this is the one place in this type where a default-less absent
    /// key is actually fatal.
    pub fn subset_require(&self, names: &BTreeSet<String>) -> Result<Self, CobbleError> {
        let mut dict = BTreeMap::new();
        for name in names {
            let key = self.registry.get(name).ok_or_else(|| CobbleError::UnknownKey(name.clone()))?;
            match self.dict.get(name) {
                Some(v) => {
                    dict.insert(name.clone(), v.clone());
                }
                None => match key.default() {
                    Some(d) => {
                        dict.insert(name.clone(), d.clone());
                    }
                    None => return Err(CobbleError::MissingRequired(name.clone())),
                },
            }
        }
        Ok(Self { registry: self.registry.clone(), dict, digest: RefCell::new(None) })
    }

    /// All keys currently present, minus those the matcher selects.
    pub fn without(&self, matcher: Matcher<'_>) -> Self {
        let dict = self.dict.iter().filter(|(k, _)| !matcher.matches(k)).map(|(k, v)| (k.clone(), v.clone())).collect();
        Self { registry: self.registry.clone(), dict, digest: RefCell::new(None) }
    }

    /// Copies in the registry's defaults for any of `names` not already
    /// present, without requiring them.
    pub fn copy_defaults(&self, names: &BTreeSet<String>) -> Result<Self, CobbleError> {
        let mut dict = self.dict.clone();
        for name in names {
            if !dict.contains_key(name) {
                let key = self.registry.get(name).ok_or_else(|| CobbleError::UnknownKey(name.clone()))?;
                if let Some(d) = key.default() {
                    dict.insert(name.clone(), d.clone());
                }
            }
        }
        Ok(Self { registry: self.registry.clone(), dict, digest: RefCell::new(None) })
    }

    /// Applies a delta, producing a new environment. `Map` entries are
    /// coerced through each key's `from_literal` then merged into any
    /// existing value through `combine`; `Func` is called directly;
    /// `Seq` folds left to right; `None` is the identity.
    pub fn derive(&self, delta: &Delta) -> Result<Self, CobbleError> {
        match delta {
            Delta::None => Ok(self.clone()),
            Delta::Map(pairs) => {
                let mut dict = self.dict.clone();
                for (name, literal) in pairs {
                    let key = self.registry.get(name).ok_or_else(|| CobbleError::UnknownKey(name.clone()))?;
                    let coerced = key.from_literal(literal)?;
                    match dict.get(name) {
                        Some(existing) => match key.combine(existing, &coerced)? {
                            Some(merged) => {
                                dict.insert(name.clone(), merged);
                            }
                            None => {
                                dict.remove(name);
                            }
                        },
                        None => {
                            dict.insert(name.clone(), coerced);
                        }
                    }
                }
                Ok(Self { registry: self.registry.clone(), dict, digest: RefCell::new(None) })
            }
            Delta::Func(f) => f(self),
            Delta::Seq(deltas) => {
                let mut cur = self.clone();
                for d in deltas {
                    cur = cur.derive(d)?;
                }
                Ok(cur)
            }
        }
    }

    /// `$name` / `${name}` substitution of this environment's values into
    /// a literal string, recursing through tuples and sets (spec.md
    /// §4.2). `$$` escapes to a literal `$`.
    pub fn rewrite(&self, lit: &Value) -> Result<Value, CobbleError> {
        match lit {
            Value::Str(s) => Ok(Value::Str(self.rewrite_str(s)?)),
            Value::Tuple(items) => Ok(Value::Tuple(items.iter().map(|v| self.rewrite(v)).collect::<Result<_, _>>()?)),
            Value::Set(items) => {
                Ok(Value::Set(items.iter().map(|v| self.rewrite(v)).collect::<Result<BTreeSet<_>, _>>()?))
            }
            other => Ok(other.clone()),
        }
    }

    fn rewrite_str(&self, s: &str) -> Result<String, CobbleError> {
        let chars: Vec<char> = s.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c != '$' {
                out.push(c);
                i += 1;
                continue;
            }
            if chars.get(i + 1) == Some(&'$') {
                out.push('$');
                i += 2;
                continue;
            }
            if chars.get(i + 1) == Some(&'{') {
                let close = chars[i + 2..].iter().position(|&c| c == '}').ok_or_else(|| CobbleError::BadLiteral {
                    key: "<template>".into(),
                    reason: format!("unterminated ${{ in {s:?}"),
                })?;
                let name: String = chars[i + 2..i + 2 + close].iter().collect();
                out.push_str(&self.get(&name)?.template_repr());
                i = i + 2 + close + 1;
                continue;
            }
            let start = i + 1;
            let mut j = start;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            if j == start {
                return Err(CobbleError::BadLiteral {
                    key: "<template>".into(),
                    reason: format!("bare '$' with no identifier in {s:?}"),
                });
            }
            let name: String = chars[start..j].iter().collect();
            out.push_str(&self.get(&name)?.template_repr());
            i = j;
        }
        Ok(out)
    }

    /// The SHA-1 hex digest of this environment's canonical encoding,
    /// memoized on first access (spec.md §4.3). Two environments with the
    /// same digest are *probably* the same contents; `equal` also checks
    /// the contents directly rather than trusting the digest alone.
    pub fn digest(&self) -> String {
        if let Some(d) = self.digest.borrow().as_ref() {
            return d.clone();
        }
        let mut buf = Vec::new();
        buf.extend((self.dict.len() as u64).to_le_bytes());
        for (k, v) in &self.dict {
            buf.extend((k.len() as u64).to_le_bytes());
            buf.extend(k.as_bytes());
            encode_value(&normalise(v), &mut buf);
        }
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let digest = hex::encode(hasher.finalize());
        *self.digest.borrow_mut() = Some(digest.clone());
        digest
    }

    /// Registry identity, digest, and raw contents must all agree.
    pub fn equal(&self, other: &Environment) -> bool {
        Rc::ptr_eq(&self.registry, &other.registry) && self.digest() == other.digest() && self.dict == other.dict
    }

    pub fn readout_all(&self) -> BTreeMap<String, Value> {
        self.dict
            .keys()
            .map(|k| {
                let key = self.registry.get(k).expect("dict keys are always registered");
                (k.clone(), key.readout(&self.dict[k]))
            })
            .collect()
    }

    pub fn raw_keys(&self) -> impl Iterator<Item = &String> {
        self.dict.keys()
    }
}

fn encode_value(v: &Value, buf: &mut Vec<u8>) {
    match v {
        Value::Null => buf.push(0),
        Value::Bool(b) => {
            buf.push(1);
            buf.push(*b as u8);
        }
        Value::Str(s) => {
            buf.push(2);
            buf.extend((s.len() as u64).to_le_bytes());
            buf.extend(s.as_bytes());
        }
        Value::Tuple(items) => {
            buf.push(3);
            buf.extend((items.len() as u64).to_le_bytes());
            for item in items {
                encode_value(item, buf);
            }
        }
        Value::Set(items) => {
            // `normalise` converts every Set to a Tuple before digesting,
            // so this arm only fires for un-normalised callers.
            buf.push(3);
            buf.extend((items.len() as u64).to_le_bytes());
            for item in items {
                encode_value(item, buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EnvKey;

    fn registry_with(keys: Vec<EnvKey>) -> Rc<KeyRegistry> {
        let mut reg = KeyRegistry::with_reserved_keys();
        for k in keys {
            reg.define(k).unwrap();
        }
        Rc::new(reg)
    }

    #[test]
    fn digest_is_sensitive_to_every_key_and_value() {
        let reg = registry_with(vec![EnvKey::overrideable_string("CC"), EnvKey::overrideable_string("CXX")]);
        let base = Environment::empty(reg.clone());
        let a = base.derive(&Delta::map([("CC".to_string(), Value::str("gcc"))])).unwrap();
        let b = base.derive(&Delta::map([("CC".to_string(), Value::str("clang"))])).unwrap();
        assert_ne!(a.digest(), b.digest());

        let c = base.derive(&Delta::map([("CXX".to_string(), Value::str("gcc"))])).unwrap();
        assert_ne!(a.digest(), c.digest(), "key identity, not just value, must affect the digest");
    }

    #[test]
    fn digest_is_stable_across_construction_order() {
        let reg = registry_with(vec![EnvKey::overrideable_string("A"), EnvKey::overrideable_string("B")]);
        let base = Environment::empty(reg);
        let ab = base
            .derive(&Delta::seq([
                Delta::map([("A".to_string(), Value::str("1"))]),
                Delta::map([("B".to_string(), Value::str("2"))]),
            ]))
            .unwrap();
        let ba = base
            .derive(&Delta::seq([
                Delta::map([("B".to_string(), Value::str("2"))]),
                Delta::map([("A".to_string(), Value::str("1"))]),
            ]))
            .unwrap();
        assert_eq!(ab.digest(), ba.digest());
    }

    #[test]
    fn equal_requires_same_registry_identity() {
        let reg_a = registry_with(vec![EnvKey::overrideable_string("CC")]);
        let reg_b = registry_with(vec![EnvKey::overrideable_string("CC")]);
        let a = Environment::empty(reg_a).derive(&Delta::map([("CC".to_string(), Value::str("gcc"))])).unwrap();
        let b = Environment::empty(reg_b).derive(&Delta::map([("CC".to_string(), Value::str("gcc"))])).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert!(!a.equal(&b), "same digest but different registries must not be equal");
    }

    #[test]
    fn without_deletes_named_keys() {
        let reg = registry_with(vec![EnvKey::overrideable_string("CC"), EnvKey::overrideable_string("CXX")]);
        let env = Environment::empty(reg)
            .derive(&Delta::map([
                ("CC".to_string(), Value::str("gcc")),
                ("CXX".to_string(), Value::str("g++")),
            ]))
            .unwrap();
        let set: BTreeSet<String> = ["CC".to_string()].into_iter().collect();
        let out = env.without(Matcher::Names(&set));
        assert!(!out.contains("CC"));
        assert!(out.contains("CXX"));
    }

    #[test]
    fn rewrite_substitutes_and_escapes() {
        let reg = registry_with(vec![EnvKey::overrideable_string("NAME")]);
        let env = Environment::empty(reg).derive(&Delta::map([("NAME".to_string(), Value::str("world"))])).unwrap();
        let out = env.rewrite(&Value::str("hello $NAME, cost is $$5 via ${NAME}")).unwrap();
        assert_eq!(out, Value::str("hello world, cost is $5 via world"));
    }

    #[test]
    fn get_of_unset_defaultless_key_returns_null() {
        let reg = registry_with(vec![EnvKey::overrideable_string("CC")]);
        let env = Environment::empty(reg);
        assert_eq!(env.get("CC").unwrap(), Value::Null);
    }

    #[test]
    fn subset_require_of_unset_defaultless_key_is_an_error() {
        let reg = registry_with(vec![EnvKey::overrideable_string("CC")]);
        let env = Environment::empty(reg);
        let names: BTreeSet<String> = ["CC".to_string()].into_iter().collect();
        assert!(matches!(env.subset_require(&names), Err(CobbleError::MissingRequired(_))));
    }

    #[test]
    fn unknown_key_is_an_error() {
        let reg = registry_with(vec![]);
        let env = Environment::empty(reg);
        assert!(matches!(env.get("NOPE"), Err(CobbleError::UnknownKey(_))));
    }
}
