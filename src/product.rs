//! Build products: the data a target's evaluation contributes toward the
//! eventual Ninja file (spec.md §3, §4.7).

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::env::{Environment, Matcher};
use crate::error::CobbleError;
use crate::registry::{IMPLICIT, ORDER_ONLY};

/// One build step: a rule invocation producing some outputs from some
/// inputs, plus any exposed sub-outputs other targets can reference by
/// name through `:target#output` syntax.
#[derive(Clone)]
pub struct Product {
    pub env: Rc<Environment>,
    pub rule: String,
    pub outputs: Vec<String>,
    pub inputs: Vec<String>,
    pub implicit: Vec<String>,
    pub order_only: Vec<String>,
    pub implicit_outputs: Vec<String>,
    pub variables: BTreeMap<String, String>,
    pub symlink_as: Option<String>,
    pub dyndep: Option<String>,
    exposed: BTreeMap<String, String>,
}

/// Builder for [`Product`], in the teacher's builder style
/// (`ProverBuilder`/`VerifierBuilder` in `api.rs`): most fields are
/// optional and default to empty.
pub struct ProductBuilder {
    env: Rc<Environment>,
    rule: String,
    outputs: Vec<String>,
    inputs: Vec<String>,
    implicit_outputs: Vec<String>,
    variables: BTreeMap<String, String>,
    symlink_as: Option<String>,
    dyndep: Option<String>,
}

impl ProductBuilder {
    pub fn new(env: Rc<Environment>, rule: impl Into<String>, outputs: Vec<String>) -> Self {
        Self {
            env,
            rule: rule.into(),
            outputs,
            inputs: Vec::new(),
            implicit_outputs: Vec::new(),
            variables: BTreeMap::new(),
            symlink_as: None,
            dyndep: None,
        }
    }

    pub fn inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn implicit_outputs(mut self, outs: Vec<String>) -> Self {
        self.implicit_outputs = outs;
        self
    }

    /// Overrides or adds to the variables auto-derived from the
    /// environment in [`ProductBuilder::build`].
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn symlink_as(mut self, path: impl Into<String>) -> Self {
        self.symlink_as = Some(path.into());
        self
    }

    pub fn dyndep(mut self, path: impl Into<String>) -> Self {
        self.dyndep = Some(path.into());
        self
    }

    /// Reads `__implicit__`/`__order_only__` out of the product's
    /// environment: these two reserved keys steer Ninja edge shape rather
    /// than ending up as ordinary rule variables, so they're pulled out
    /// of `variables` here instead of being readout through the normal
    /// path (spec.md §4.7). Every other key in the environment is
    /// readout and becomes a rule variable; `.variable(...)` calls are
    /// overlaid on top of that derived set.
    pub fn build(self) -> Result<Product, CobbleError> {
        let implicit = match self.env.get_raw(IMPLICIT) {
            Ok(v) => v.as_set().map(|s| s.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let order_only = match self.env.get_raw(ORDER_ONLY) {
            Ok(v) => v.as_set().map(|s| s.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        let reserved: BTreeSet<String> = [IMPLICIT.to_string(), ORDER_ONLY.to_string()].into_iter().collect();
        let mut variables: BTreeMap<String, String> = self
            .env
            .without(Matcher::Names(&reserved))
            .readout_all()
            .into_iter()
            .map(|(k, v)| (k, v.template_repr()))
            .collect();
        variables.extend(self.variables);

        Ok(Product {
            env: self.env,
            rule: self.rule,
            outputs: self.outputs,
            inputs: self.inputs,
            implicit,
            order_only,
            implicit_outputs: self.implicit_outputs,
            variables,
            symlink_as: self.symlink_as,
            dyndep: self.dyndep,
            exposed: BTreeMap::new(),
        })
    }
}

impl Product {
    /// Exposes one of this product's outputs under a name other targets
    /// can reference via `:this_target#name` (spec.md §4.6 step 11).
    pub fn expose(&mut self, path: impl Into<String>, name: impl Into<String>) -> Result<(), CobbleError> {
        let path = path.into();
        if !self.outputs.contains(&path) && !self.implicit_outputs.contains(&path) {
            return Err(CobbleError::ShapeError(format!("cannot expose {path:?}: not one of this product's outputs")));
        }
        self.exposed.insert(name.into(), path);
        Ok(())
    }

    pub fn find_output(&self, name: &str) -> Option<&str> {
        self.exposed.get(name).map(String::as_str)
    }

    pub fn exposed_outputs(&self) -> &BTreeMap<String, String> {
        &self.exposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Delta;
    use crate::registry::KeyRegistry;

    #[test]
    fn expose_requires_a_real_output() {
        let reg = Rc::new(KeyRegistry::with_reserved_keys());
        let env = Rc::new(Environment::empty(reg).derive(&Delta::None).unwrap());
        let mut p = ProductBuilder::new(env, "compile", vec!["out.o".into()]).build().unwrap();
        assert!(p.expose("out.o", "object").is_ok());
        assert!(p.expose("missing.o", "object").is_err());
    }
}
