//! Targets and the memoized graph-evaluation algorithm (spec.md §3, §4.5,
//! §4.6).

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::delta::{Delta, DeltaFn};
use crate::env::Environment;
use crate::error::{CobbleError, EvaluationError};
use crate::product::Product;
use crate::project::Package;

/// Wraps an `Option<Rc<Environment>>` so it can be used as a `HashMap` key:
/// equality and hashing go through [`Environment::equal`]/`digest`, not
/// pointer identity, matching the original's `self._evaluate_memos`
/// keying on `env_up` by value.
#[derive(Clone)]
pub struct EnvKeyed(pub Option<Rc<Environment>>);

impl PartialEq for EnvKeyed {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => a.equal(b),
            _ => false,
        }
    }
}
impl Eq for EnvKeyed {}
impl Hash for EnvKeyed {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            None => 0u8.hash(state),
            Some(e) => {
                1u8.hash(state);
                e.digest().hash(state);
            }
        }
    }
}

/// Identifies one `(target, env)` pair in a rank map or product map by
/// target pointer identity plus environment content equality.
#[derive(Clone)]
pub struct EvalKey {
    pub target: Rc<Target>,
    pub env: EnvKeyed,
}
impl PartialEq for EvalKey {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.target, &other.target) && self.env == other.env
    }
}
impl Eq for EvalKey {}
impl Hash for EvalKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.target) as usize).hash(state);
        self.env.hash(state);
    }
}

/// Rank-map entry: how many hops deep this `(target, env)` pair sits below
/// the evaluation root, and the `using` delta that target produced for
/// whichever parent sits directly above it in the graph.
#[derive(Clone)]
pub struct RankEntry {
    pub rank: u32,
    pub using_delta: Delta,
}

pub type RankMap = HashMap<EvalKey, RankEntry>;
pub type ProductMap = HashMap<EvalKey, Rc<Vec<Product>>>;

/// The result of evaluating one target in one environment: the merged
/// rank map and product map visible from that point in the graph
/// (spec.md §4.6).
pub struct EvalResult {
    pub rank_map: RankMap,
    pub product_map: ProductMap,
}

enum CacheSlot {
    InProgress,
    Done(Rc<EvalResult>),
    Failed(EvaluationError),
}

/// What a target's `using` step is handed once its dependencies have been
/// evaluated: the merged product map (so it can find deps' outputs) and a
/// rank-ordered lookup from target identity to the environment it was
/// evaluated in (spec.md §4.6 step 11).
pub struct UsingContext {
    pub package: Rc<Package>,
    pub env: Rc<Environment>,
    product_map: ProductMap,
    rank_lookup: HashMap<usize, Rc<Environment>>,
}

impl UsingContext {
    /// Resolves a list of source strings: `:name#output` and
    /// `//pkg:name#output` resolve against the rank/product maps built so
    /// far; anything else is a package-relative path, rewritten through
    /// this context's environment (spec.md §4.6 step 11,
    /// `cobble/target/__init__.py::UsingContext.rewrite_sources`).
    pub fn rewrite_sources(&self, sources: &[String]) -> Result<Vec<String>, CobbleError> {
        sources.iter().map(|s| self.rewrite_one(s)).collect()
    }

    fn rewrite_one(&self, s: &str) -> Result<String, CobbleError> {
        if let Some(hash) = s.find('#') {
            if s.starts_with(':') || s.starts_with("//") {
                let (ident_part, output_part) = (&s[..hash], &s[hash + 1..]);
                let target = if let Some(name) = ident_part.strip_prefix(':') {
                    self.package.find_target_local(name)?
                } else {
                    self.package.project().find_target(ident_part)?
                };
                let env = self
                    .rank_lookup
                    .get(&(Rc::as_ptr(&target) as usize))
                    .ok_or_else(|| CobbleError::UnknownTarget(ident_part.to_string()))?;
                let key = EvalKey { target: target.clone(), env: EnvKeyed(Some(env.clone())) };
                let products = self
                    .product_map
                    .get(&key)
                    .ok_or_else(|| CobbleError::UnknownTarget(ident_part.to_string()))?;
                for product in products.iter() {
                    if let Some(path) = product.find_output(output_part) {
                        return Ok(path.to_string());
                    }
                }
                return Err(CobbleError::OutputNotFound {
                    target: ident_part.to_string(),
                    output: output_part.to_string(),
                });
            }
        }
        let rewritten = self.env.rewrite(&crate::frozen::Value::str(s))?;
        Ok(self.package.inpath(rewritten.as_str().unwrap_or(s)))
    }
}

pub type UsingFn = Rc<dyn Fn(&UsingContext) -> Result<(Delta, Vec<Product>), CobbleError>>;

/// One node in the build graph (spec.md §3, §4.5).
pub struct Target {
    pub package: Rc<Package>,
    pub name: String,
    down: Delta,
    local: Delta,
    pub deps: Vec<String>,
    pub concrete: bool,
    pub transparent: bool,
    using_and_products: UsingFn,
    memo: RefCell<HashMap<EnvKeyed, CacheSlot>>,
}

impl Target {
    /// Concrete targets must carry a `Func` `down` delta (they replace
    /// rather than mutate the incoming environment); non-concrete targets
    /// may use any delta shape.
    pub fn new(
        package: Rc<Package>,
        name: impl Into<String>,
        down: Delta,
        local: Delta,
        deps: Vec<String>,
        concrete: bool,
        transparent: bool,
        using_and_products: UsingFn,
    ) -> Result<Rc<Self>, CobbleError> {
        if concrete && !matches!(down, Delta::Func(_)) {
            return Err(CobbleError::ShapeError("concrete targets must define `down` as a function".into()));
        }
        Ok(Rc::new(Self {
            package,
            name: name.into(),
            down,
            local,
            deps,
            concrete,
            transparent,
            using_and_products,
            memo: RefCell::new(HashMap::new()),
        }))
    }

    pub fn ident(&self) -> String {
        self.package.target_ident(&self.name)
    }

    /// Entry point: evaluate this target under `env_up`, memoizing by
    /// content-equal environment. Replays a cached failure without
    /// recomputing, and turns in-progress re-entry into a cycle error
    /// (spec.md §4.6 steps 1-3, §4.5 memoization).
    pub fn evaluate(self: &Rc<Self>, env_up: Option<Rc<Environment>>) -> Result<Rc<EvalResult>, EvaluationError> {
        let key = EnvKeyed(env_up.clone());
        if let Some(slot) = self.memo.borrow().get(&key) {
            match slot {
                CacheSlot::Done(result) => return Ok(result.clone()),
                CacheSlot::Failed(err) => return Err(err.clone()),
                CacheSlot::InProgress => {
                    return Err(EvaluationError::new(
                        CobbleError::CycleDetected(self.ident()),
                        self.ident(),
                        env_up.as_ref().map(|e| e.digest()),
                    ))
                }
            }
        }
        self.memo.borrow_mut().insert(key.clone(), CacheSlot::InProgress);
        trace!(target = %self.ident(), "evaluating target");

        match self.evaluate_uncached(env_up.as_ref()) {
            Ok(result) => {
                self.memo.borrow_mut().insert(key, CacheSlot::Done(result.clone()));
                Ok(result)
            }
            Err(mut e) => {
                e.add_dep(self.ident(), env_up.as_ref().map(|e| e.digest()));
                self.memo.borrow_mut().insert(key, CacheSlot::Failed(e.clone()));
                Err(e)
            }
        }
    }

    fn evaluate_uncached(self: &Rc<Self>, env_up: Option<&Rc<Environment>>) -> Result<Rc<EvalResult>, EvaluationError> {
        let env_down = Rc::new(self.derive_down(env_up).map_err(EvaluationError::from)?);
        let local0 = env_down.derive(&self.local).map_err(EvaluationError::from)?;

        let mut merged_rank = RankMap::new();
        let mut merged_products = ProductMap::new();

        for dep_ident in &self.deps {
            let resolved = local0.rewrite(&crate::frozen::Value::str(dep_ident.as_str())).map_err(EvaluationError::from)?;
            let ident = resolved.as_str().unwrap_or(dep_ident).to_string();
            let dep_target = if let Some(name) = ident.strip_prefix(':') {
                self.package.find_target_local(name).map_err(EvaluationError::from)?
            } else {
                self.package.project().find_target(&ident).map_err(EvaluationError::from)?
            };
            let dep_result = dep_target.evaluate(Some(env_down.clone()))?;
            merge_rank_maps(&mut merged_rank, &dep_result.rank_map);
            merge_product_maps(&mut merged_products, &dep_result.product_map)?;
        }

        // Topological order: deepest (highest rank) first, then target
        // identifier, then env digest. Ties beyond that fall back to
        // merge-insertion order via a stable sort -- the original's
        // fourth tie-break component is the using-delta itself, which has
        // no total order once it can be an arbitrary closure, so a stable
        // sort over the already-deterministic first three keys takes its
        // place (see DESIGN.md).
        let mut ordered: Vec<(&EvalKey, &RankEntry)> = merged_rank.iter().collect();
        ordered.sort_by(|a, b| {
            b.1.rank
                .cmp(&a.1.rank)
                .then_with(|| a.0.target.ident().cmp(&b.0.target.ident()))
                .then_with(|| digest_or_empty(&a.0.env).cmp(&digest_or_empty(&b.0.env)))
        });

        let mut by_target_identity: HashMap<usize, Rc<Environment>> = HashMap::new();
        for (key, _) in &ordered {
            if let EnvKeyed(Some(e)) = &key.env {
                by_target_identity.insert(Rc::as_ptr(&key.target) as usize, e.clone());
            }
        }

        let fold = Delta::Seq(ordered.iter().map(|(_, entry)| entry.using_delta.clone()).collect());
        let local1 = Rc::new(local0.derive(&fold).map_err(EvaluationError::from)?);

        let ctx = UsingContext {
            package: self.package.clone(),
            env: local1.clone(),
            product_map: merged_products.clone(),
            rank_lookup: by_target_identity,
        };
        let (using_delta, products) = (self.using_and_products)(&ctx).map_err(EvaluationError::from)?;

        // Transparency: a non-transparent target hides its dependency
        // subgraph's rank map from further up the tree (spec.md §4.6
        // step 12; §9's main text resolves the default as "concrete =>
        // non-transparent, non-concrete => transparent").
        if !self.transparent {
            merged_rank.clear();
        }

        let self_key = EvalKey { target: self.clone(), env: EnvKeyed(env_up.cloned()) };
        merged_rank.insert(self_key.clone(), RankEntry { rank: 0, using_delta });
        merged_products.insert(self_key, Rc::new(products));

        debug!(target = %self.ident(), rank_entries = merged_rank.len(), "evaluation complete");
        Ok(Rc::new(EvalResult { rank_map: merged_rank, product_map: merged_products }))
    }

    fn derive_down(&self, env_up: Option<&Rc<Environment>>) -> Result<Environment, CobbleError> {
        match (&self.down, env_up) {
            (Delta::Func(f), Some(up)) => f(up),
            (Delta::Func(f), None) => {
                warn!(target = %self.ident(), "concrete target evaluated with no incoming environment");
                f(&Environment::empty(self.package.project().base_registry()))
            }
            (other, Some(up)) => up.derive(other),
            (other, None) => Environment::empty(self.package.project().base_registry()).derive(other),
        }
    }
}

fn digest_or_empty(env: &EnvKeyed) -> String {
    match &env.0 {
        Some(e) => e.digest(),
        None => String::new(),
    }
}

fn merge_rank_maps(into: &mut RankMap, from: &RankMap) {
    for (key, entry) in from {
        let bumped = entry.rank + 1;
        into.entry(key.clone())
            .and_modify(|existing| {
                if bumped > existing.rank {
                    existing.rank = bumped;
                    existing.using_delta = entry.using_delta.clone();
                }
            })
            .or_insert_with(|| RankEntry { rank: bumped, using_delta: entry.using_delta.clone() });
    }
}

fn merge_product_maps(into: &mut ProductMap, from: &ProductMap) -> Result<(), EvaluationError> {
    for (key, products) in from {
        match into.get(key) {
            Some(existing) if !products_equal(existing, products) => {
                return Err(EvaluationError::from(CobbleError::ConflictingOutput {
                    target: key.target.ident(),
                    env_digest: digest_or_empty(&key.env),
                }));
            }
            _ => {
                into.insert(key.clone(), products.clone());
            }
        }
    }
    Ok(())
}

fn products_equal(a: &[Product], b: &[Product]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|(x, y)| {
            x.rule == y.rule
                && x.outputs == y.outputs
                && x.inputs == y.inputs
                && x.implicit == y.implicit
                && x.order_only == y.order_only
                && x.env.equal(&y.env)
        })
}

/// Convenience for target constructors that don't need a custom
/// `using_and_products`: emits no delta and no products.
pub fn no_products() -> UsingFn {
    Rc::new(|_ctx: &UsingContext| Ok((Delta::None, Vec::new())))
}

pub fn identity_down() -> DeltaFn {
    Rc::new(|env: &Environment| Ok(env.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Delta;
    use crate::product::ProductBuilder;
    use crate::project::Project;
    use crate::registry::EnvKey;

    fn test_project() -> Rc<Project> {
        let mut project = Project::new("/root", "/root/build");
        project.registry_mut().define(EnvKey::overrideable_string("CC")).unwrap();
        Rc::new(project)
    }

    #[test]
    fn leaf_target_evaluates_and_memoizes() {
        let project = test_project();
        let pkg = project.clone().add_package("lib").unwrap();
        let base = Rc::new(Environment::empty(project.base_registry()));

        let target = Target::new(pkg.clone(), "leaf", Delta::None, Delta::None, Vec::new(), false, true, no_products())
            .unwrap();
        pkg.add_target(target.clone()).unwrap();

        let r1 = target.evaluate(Some(base.clone())).unwrap();
        let r2 = target.evaluate(Some(base.clone())).unwrap();
        assert_eq!(r1.rank_map.len(), 1);
        assert_eq!(r2.rank_map.len(), 1);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let project = test_project();
        let pkg = project.clone().add_package("lib").unwrap();
        let base = Rc::new(Environment::empty(project.base_registry()));

        let target =
            Target::new(pkg.clone(), "cyclic", Delta::None, Delta::None, vec![":cyclic".into()], false, true, no_products())
                .unwrap();
        pkg.add_target(target.clone()).unwrap();

        let err = target.evaluate(Some(base)).unwrap_err();
        assert!(matches!(*err.cause, CobbleError::CycleDetected(_)));
    }

    #[test]
    fn dependency_ranks_increase_with_depth() {
        let project = test_project();
        let pkg = project.clone().add_package("lib").unwrap();
        let base = Rc::new(Environment::empty(project.base_registry()));

        let leaf = Target::new(pkg.clone(), "leaf", Delta::None, Delta::None, Vec::new(), false, true, no_products()).unwrap();
        pkg.add_target(leaf.clone()).unwrap();
        let mid = Target::new(pkg.clone(), "mid", Delta::None, Delta::None, vec![":leaf".into()], false, true, no_products())
            .unwrap();
        pkg.add_target(mid.clone()).unwrap();

        let result = mid.evaluate(Some(base)).unwrap();
        let leaf_rank = result
            .rank_map
            .iter()
            .find(|(k, _)| k.target.name == "leaf")
            .map(|(_, v)| v.rank)
            .unwrap();
        let mid_rank = result
            .rank_map
            .iter()
            .find(|(k, _)| k.target.name == "mid")
            .map(|(_, v)| v.rank)
            .unwrap();
        assert!(leaf_rank > mid_rank);
    }

    #[test]
    fn dependency_products_propagate_to_consumer() {
        let project = test_project();
        let pkg = project.clone().add_package("lib").unwrap();
        let base = Rc::new(Environment::empty(project.base_registry()));

        let shared = Target::new(
            pkg.clone(),
            "shared",
            Delta::None,
            Delta::None,
            Vec::new(),
            false,
            true,
            Rc::new(|ctx: &UsingContext| {
                let p = ProductBuilder::new(ctx.env.clone(), "touch", vec!["out".into()]).build()?;
                Ok((Delta::None, vec![p]))
            }),
        )
        .unwrap();
        pkg.add_target(shared.clone()).unwrap();

        let a = Target::new(
            pkg.clone(),
            "a",
            Delta::None,
            Delta::None,
            vec![":shared".into()],
            false,
            true,
            no_products(),
        )
        .unwrap();
        pkg.add_target(a.clone()).unwrap();

        let result = a.evaluate(Some(base)).unwrap();
        assert!(result.product_map.values().any(|v| !v.is_empty()));
    }
}
