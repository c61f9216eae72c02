//! Error kinds for the evaluator (spec §7).
//!
//! Each variant of [`CobbleError`] corresponds to one of the named error
//! kinds; [`EvaluationError`] is the breadcrumb-accumulating wrapper that
//! `Target::evaluate` builds as a failure unwinds through the dependency
//! graph, the way the teacher splits a narrow library error
//! (`DomainError`, `StreamError`, ...) from the `anyhow` context its CLI
//! binaries add at the edge.

use std::fmt;

/// Errors raised by the frozen-datum, registry, environment, delta, and
/// target machinery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CobbleError {
    #[error("use of undefined environment key {0:?}")]
    UnknownKey(String),

    #[error("environment key {key:?} requires a unique value, got two: {old} and {new}")]
    MergeConflict { key: String, old: String, new: String },

    #[error("bad literal for key {key:?}: {reason}")]
    BadLiteral { key: String, reason: String },

    #[error("required key {0:?} missing from environment and has no default")]
    MissingRequired(String),

    #[error("cycle detected in build graph evaluation: {0}")]
    CycleDetected(String),

    #[error("key {0:?} defined twice")]
    DuplicateKey(String),

    #[error("duplicate target {name:?} in package {package:?}")]
    DuplicateTarget { package: String, name: String },

    #[error("reference to unknown target: {0:?}")]
    UnknownTarget(String),

    #[error("using_and_products returned a malformed shape: {0}")]
    ShapeError(String),

    #[error("output {output:?} not found on target {target}")]
    OutputNotFound { target: String, output: String },

    #[error("target {target} produced conflicting products for the same (target, env) pair at digest {env_digest}")]
    ConflictingOutput { target: String, env_digest: String },

    #[error("ninja rule {0:?} defined incompatibly in multiple places")]
    ConflictingRule(String),

    #[error("malformed target identifier: {0:?}")]
    BadIdentifier(String),
}

/// Wraps a [`CobbleError`] with the `(target, env)` chain that was active
/// when it was raised, innermost first, matching the original
/// `EvaluationError`/`RecursionDetector` pairing: the evaluator caches this
/// value in the failing cache slot so a second `evaluate()` of the same
/// `(target, env)` deterministically replays the same failure instead of
/// recomputing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct EvaluationError {
    pub cause: Box<CobbleError>,
    /// `(target identifier, env digest)` breadcrumbs, innermost first.
    pub breadcrumbs: Vec<(String, Option<String>)>,
}

impl EvaluationError {
    pub fn new(cause: CobbleError, target: impl Into<String>, env_digest: Option<String>) -> Self {
        Self { cause: Box::new(cause), breadcrumbs: vec![(target.into(), env_digest)] }
    }

    /// Prepends a breadcrumb as the error unwinds further up the graph.
    pub fn add_dep(&mut self, target: impl Into<String>, env_digest: Option<String>) {
        self.breadcrumbs.push((target.into(), env_digest));
    }
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        write!(f, " (while evaluating:")?;
        for (ident, digest) in &self.breadcrumbs {
            match digest {
                Some(d) => write!(f, " {ident}@{d} <-")?,
                None => write!(f, " {ident} <-")?,
            }
        }
        write!(f, " root)")
    }
}

impl From<CobbleError> for EvaluationError {
    fn from(cause: CobbleError) -> Self {
        Self { cause: Box::new(cause), breadcrumbs: Vec::new() }
    }
}
