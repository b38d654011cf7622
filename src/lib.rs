//! Heddle - declarative dependency-graph compiler
//!
//! A tree of composable node declarations (bind a constructor, bind a
//! value, group into modules, branch on conditions, decorate, replace,
//! run lifecycle hooks) compiles in one deterministic pass into a flat,
//! normalized set of binding instructions an injection runtime wires
//! and instantiates. The compiler never executes user constructors: the
//! hard work is resolving which tags each declaration produces,
//! propagating scoped rules (auto-group, auto-inject) down the tree,
//! resolving replace/fallback overrides by specificity, and composing
//! decorators into synthesized wrappers.
//!
//! ```
//! use heddle::{provide, supply, App, Dep};
//!
//! #[derive(Clone)]
//! struct Port(u16);
//!
//! #[derive(Clone)]
//! struct Server {
//!     port: u16,
//! }
//!
//! let graph = App::new()
//!     .node(supply(Port(8080)))
//!     .node(provide(|p: Dep<Port>| anyhow::Ok(Server { port: p.0 .0 })))
//!     .build()
//!     .expect("compiles");
//! assert_eq!(graph.instructions.len(), 2);
//! ```

pub mod build;
pub mod config;
pub mod error;
pub mod instruction;
pub mod key;
pub mod metadata;
pub mod node;
pub mod runtime;
pub mod value;

mod autogroup;
mod autoinject;
mod decorate;
mod intern;
mod lower;
mod options;
mod order;
mod plan;
mod replace;

pub use build::{App, CompiledGraph};
pub use config::{config_resolver, ConfigResolver};
pub use error::{CompileError, FixSuggestion, ResolveError, Site};
pub use key::{Tag, TagSet, TypeKey};
pub use metadata::{MetaEntry, MetadataRegistry};
pub use node::{
    auto_group, auto_inject, case, case_default, decorate, decorate_group, fallback,
    fallback_ctor, invoke, module, on_stop, options, populate, populate_group, populate_named,
    provide, replace, replace_after, replace_before, replace_ctor, supply, switch, when, when_fn,
    Case, Node, PopulateHandle,
};
pub use order::Priority;
pub use runtime::{
    Injector, RunControl, RunError, RunOptions, Runner, Runtime, RuntimeFactory,
};
pub use value::{
    field, field_group, All, Callable, ContractCast, Dep, FieldSlot, IntoCallable, Opt,
    ResolvedArg, Slot, Value,
};
