//! Error types with declaration-site context and fix suggestions
//!
//! Compile failures ([`CompileError`]) carry the call site of the
//! offending declaration, captured with `#[track_caller]` when the node
//! was authored. Resolution failures ([`ResolveError`]) belong to the
//! runtime side and carry the chain of slots being resolved. Both fail
//! fast: the first error in a scope aborts compilation, no declaration
//! is partially applied.

use std::panic::Location;

use thiserror::Error;

/// Call-site of a declaration, captured at node/option construction.
pub type Site = &'static Location<'static>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// Compilation errors.
///
/// Code families: HEDDLE-1xx malformed declarations, HEDDLE-2xx
/// unsatisfiable overrides, HEDDLE-3xx arity/signature mismatches,
/// HEDDLE-4xx unsupported node combinations, HEDDLE-5xx configuration
/// resolution.
#[derive(Error, Debug)]
pub enum CompileError {
    // ─────────────────────────────────────────────────────────────
    // Malformed declarations (HEDDLE-100..)
    // ─────────────────────────────────────────────────────────────
    #[error("HEDDLE-100: empty {kind} on binding at {site}")]
    EmptyTag { kind: &'static str, site: Site },

    #[error("HEDDLE-101: invalid {kind} '{value}' at {site}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        site: Site,
    },

    #[error("HEDDLE-102: export at {site} is both named and grouped")]
    NamedAndGrouped { site: Site },

    #[error("HEDDLE-103: second pending {kind} '{value}' at {site} (only one standalone {kind} is allowed before an export)")]
    DuplicatePendingTag {
        kind: &'static str,
        value: String,
        site: Site,
    },

    #[error("HEDDLE-104: visibility set twice on binding at {site}")]
    VisibilityTwice { site: Site },

    #[error("HEDDLE-105: export cast at {site} expects source type {expected}, binding produces {found}")]
    ExportSourceMismatch {
        expected: String,
        found: String,
        site: Site,
    },

    // ─────────────────────────────────────────────────────────────
    // Unsatisfiable overrides (HEDDLE-200..)
    // ─────────────────────────────────────────────────────────────
    #[error("HEDDLE-200: replace at {site} matched no binding (targets: {targets})")]
    OverrideUnmatched { targets: String, site: Site },

    #[error("HEDDLE-201: option '{option}' is not allowed on a replace/fallback declaration at {site}")]
    OverrideForbiddenOption { option: &'static str, site: Site },

    #[error("HEDDLE-202: replacement at {site} produces {found} but displaces {target} and declares no contract cast for it")]
    OverrideCastMissing {
        target: String,
        found: String,
        site: Site,
    },

    // ─────────────────────────────────────────────────────────────
    // Arity / signature mismatches (HEDDLE-300..)
    // ─────────────────────────────────────────────────────────────
    #[error("HEDDLE-300: {found} param tag(s) at {site} for a callable with {expected} parameter(s)")]
    ParamTagArity {
        expected: usize,
        found: usize,
        site: Site,
    },

    #[error("HEDDLE-301: unrecognized param tag '{tag}' at {site}")]
    InvalidParamTag { tag: String, site: Site },

    #[error("HEDDLE-302: collection parameter #{index} at {site} carries no group tag")]
    CollectionWithoutGroup { index: usize, site: Site },

    #[error("HEDDLE-303: decorator at {site} takes no parameters")]
    DecoratorNoParams { site: Site },

    #[error("HEDDLE-304: decorator at {site} transforms {param} but returns {result}")]
    DecoratorResultMismatch {
        param: String,
        result: String,
        site: Site,
    },

    #[error("HEDDLE-305: predicate at {site} must return {expected}, returns {found}")]
    PredicateType {
        expected: &'static str,
        found: String,
        site: Site,
    },

    #[error("HEDDLE-306: decorator at {site} takes a collection as its first parameter")]
    DecoratorCollectionParam { site: Site },

    // ─────────────────────────────────────────────────────────────
    // Unsupported node combinations (HEDDLE-400..)
    // ─────────────────────────────────────────────────────────────
    #[error("HEDDLE-400: option '{option}' cannot be applied to {node} at {site}")]
    OptionOnWrongNode {
        option: &'static str,
        node: &'static str,
        site: Site,
    },

    // ─────────────────────────────────────────────────────────────
    // Configuration resolution (HEDDLE-500..)
    // ─────────────────────────────────────────────────────────────
    #[error("HEDDLE-500: predicate at {site} takes parameters but no config resolver is registered")]
    MissingConfigResolver { site: Site },

    #[error("HEDDLE-501: config resolver failed for {key} needed by predicate at {site}")]
    ConfigResolve {
        key: String,
        site: Site,
        #[source]
        source: anyhow::Error,
    },

    #[error("HEDDLE-502: predicate at {site} failed")]
    PredicateFailed {
        site: Site,
        #[source]
        source: anyhow::Error,
    },
}

impl FixSuggestion for CompileError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            CompileError::EmptyTag { .. } => Some("Provide a non-empty name/group string"),
            CompileError::InvalidIdentifier { .. } => {
                Some("Use letters, digits, '_', '.' or '-'; start with a letter or '_'")
            }
            CompileError::NamedAndGrouped { .. } => {
                Some("Split into two exports: one named, one grouped")
            }
            CompileError::DuplicatePendingTag { .. } => {
                Some("Add an export_as between the two tags, or drop one")
            }
            CompileError::VisibilityTwice { .. } => Some("Remove the duplicate private() call"),
            CompileError::ExportSourceMismatch { .. } => {
                Some("The cast closure's input type must be the binding's result type")
            }
            CompileError::OverrideUnmatched { .. } => {
                Some("Check the replace target's type, name, and group against declared bindings")
            }
            CompileError::OverrideForbiddenOption { .. } => {
                Some("Replace/fallback declarations take only a target selector")
            }
            CompileError::OverrideCastMissing { .. } => {
                Some("Add implements(..) on the replacement for the displaced contract")
            }
            CompileError::ParamTagArity { .. } => {
                Some("Pass exactly one tag per parameter; use \"\" for untagged positions")
            }
            CompileError::InvalidParamTag { .. } => {
                Some("Use \"\", \"name=x\", \"group=g\" or \"optional\"")
            }
            CompileError::CollectionWithoutGroup { .. } => {
                Some("Tag the collection parameter with group=... via param_tags")
            }
            CompileError::DecoratorNoParams { .. } => {
                Some("A decorator's first parameter is the value being decorated")
            }
            CompileError::DecoratorResultMismatch { .. } => {
                Some("Return the same type the first parameter consumes")
            }
            CompileError::PredicateType { .. } => None,
            CompileError::DecoratorCollectionParam { .. } => {
                Some("Use decorate_group for whole-collection transforms")
            }
            CompileError::OptionOnWrongNode { .. } => {
                Some("Binding options apply only to provide/supply declarations")
            }
            CompileError::MissingConfigResolver { .. } => {
                Some("Register a resolver with App::with_config_resolver, or use a parameterless predicate")
            }
            CompileError::ConfigResolve { .. } => {
                Some("Make the resolver return a value for every type the predicate takes")
            }
            CompileError::PredicateFailed { .. } => None,
        }
    }
}

/// Runtime-side resolution errors, produced by the reference injector.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no binding satisfies {slot} (resolving {chain})")]
    MissingBinding { slot: String, chain: String },

    #[error("duplicate binding for {tag_set}: declared at {first} and {second}")]
    DuplicateBinding {
        tag_set: String,
        first: Site,
        second: Site,
    },

    #[error("dependency cycle: {chain}")]
    Cycle { chain: String },

    #[error("contract cast for {target} failed")]
    Cast {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("constructor for {binding} (declared at {site}) failed")]
    Constructor {
        binding: String,
        site: Site,
        #[source]
        source: anyhow::Error,
    },

    #[error("decorator for {target} failed")]
    Decorator {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invoke at {site} failed")]
    Invoke {
        site: Site,
        #[source]
        source: anyhow::Error,
    },

    #[error("populate at {site} failed")]
    Populate {
        site: Site,
        #[source]
        source: anyhow::Error,
    },

    #[error("stop hook at {site} failed")]
    StopHook {
        site: Site,
        #[source]
        source: anyhow::Error,
    },

    #[error("stop hook at {site} exceeded the shutdown timeout")]
    StopTimeout { site: Site },
}
