//! Compilation driver
//!
//! [`App`] holds the authored node tree and the registered config
//! resolver. `build()` runs the pass pipeline — lowering, auto-group,
//! auto-inject, replace/fallback resolution, order assignment,
//! decorator composition — and flattens the result into the normalized
//! instruction list a runtime consumes. `plan()` renders the resolved
//! tree for inspection. Compilation is single-threaded and purely
//! computational; the only state threaded through is the counter set.

use std::sync::Arc;

use tracing::debug;

use crate::autogroup;
use crate::autoinject;
use crate::config::ConfigResolver;
use crate::decorate;
use crate::error::CompileError;
use crate::instruction::{
    ExportInstr, HookInstr, Instruction, InvokeInstr, PopulateInstr, ProvideInstr,
};
use crate::lower::{lower, Counters, WItem, WScope};
use crate::metadata::MetadataRegistry;
use crate::node::Node;
use crate::order;
use crate::plan;
use crate::replace;

/// The authored dependency tree, ready to compile.
#[derive(Default)]
pub struct App {
    nodes: Vec<Node>,
    resolver: Option<ConfigResolver>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration.
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add several declarations.
    pub fn nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Register the resolver used for `when_fn`/`switch` predicate
    /// parameters.
    pub fn with_config_resolver(mut self, resolver: ConfigResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Compile the tree into a flat instruction list. Deterministic,
    /// no user constructor runs. Fails fast on the first error.
    pub fn build(&self) -> Result<CompiledGraph, CompileError> {
        let mut counters = Counters::default();
        let mut root = lower(&self.nodes, self.resolver.as_ref(), &mut counters)?;
        autogroup::run(&mut root);
        autoinject::run(&mut root);
        replace::run(&mut root, &mut counters)?;
        let has_priority = order::assign_order(&mut root, &mut counters);
        let plan = plan::render(&root);
        let decorations = decorate::run(&mut root, has_priority)?;

        let mut instructions = Vec::new();
        flatten(&root, &mut instructions);
        instructions.extend(decorations.into_iter().map(Instruction::Decorate));
        debug!(
            instructions = instructions.len(),
            "graph compiled"
        );
        Ok(CompiledGraph {
            instructions,
            metadata: Arc::new(MetadataRegistry::new()),
            plan,
        })
    }

    /// Render the resolved node tree without handing anything to a
    /// runtime.
    pub fn plan(&self) -> Result<String, CompileError> {
        Ok(self.build()?.plan)
    }
}

/// The compiled output: flat instructions plus the metadata side-table
/// whose lifetime matches this graph.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub instructions: Vec<Instruction>,
    pub metadata: Arc<MetadataRegistry>,
    plan: String,
}

impl CompiledGraph {
    pub fn render_plan(&self) -> &str {
        &self.plan
    }
}

fn flatten(scope: &WScope, out: &mut Vec<Instruction>) {
    flatten_items(&scope.items, out);
}

fn flatten_items(items: &[WItem], out: &mut Vec<Instruction>) {
    for item in items {
        match item {
            WItem::Bind(bind) => {
                out.push(Instruction::Provide(ProvideInstr {
                    id: bind.id,
                    invoke: Arc::clone(&bind.invoke),
                    result: bind.result,
                    slots: bind.slots.clone(),
                    exports: bind
                        .exports
                        .iter()
                        .map(|e| ExportInstr {
                            tag_set: e.tag_set.clone(),
                            cast: e.cast.clone(),
                        })
                        .collect(),
                    private: bind.private,
                    metadata: bind.metadata.clone(),
                    site: bind.site,
                }));
            }
            WItem::Invoke(inv) => out.push(Instruction::Invoke(InvokeInstr {
                invoke: Arc::clone(&inv.invoke),
                slots: inv.slots.clone(),
                site: inv.site,
            })),
            WItem::Populate(pop) => out.push(Instruction::Populate(PopulateInstr {
                slot: pop.slot.clone(),
                sink: Arc::clone(&pop.sink),
                site: pop.site,
            })),
            WItem::OnStop(hook) => out.push(Instruction::OnStop(HookInstr {
                invoke: Arc::clone(&hook.invoke),
                slots: hook.slots.clone(),
                site: hook.site,
            })),
            WItem::Group(group) => flatten_items(&group.items, out),
            WItem::Scope(inner) => flatten_items(&inner.items, out),
            WItem::Decorate(_)
            | WItem::AutoGroup(_)
            | WItem::AutoInject
            | WItem::Skipped(_)
            | WItem::Override(_)
            | WItem::Pending(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{module, provide, replace, supply, when};
    use crate::value::Dep;

    #[derive(Clone, Debug, PartialEq)]
    struct Port(u16);

    #[derive(Clone)]
    struct Server {
        port: u16,
    }

    #[test]
    fn build_emits_provides_in_declaration_order() {
        let graph = App::new()
            .node(supply(Port(1)))
            .node(provide(|p: Dep<Port>| anyhow::Ok(Server { port: p.0 .0 })))
            .build()
            .unwrap();
        let provides: Vec<_> = graph
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Provide(p) => Some(p.result),
                _ => None,
            })
            .collect();
        assert_eq!(provides.len(), 2);
        assert_eq!(provides[0], crate::key::TypeKey::of::<Port>());
        assert_eq!(provides[1], crate::key::TypeKey::of::<Server>());
    }

    #[test]
    fn plan_shows_resolved_replacements() {
        let app = App::new()
            .node(supply(Port(1)))
            .node(replace(Port(9)));
        let plan = app.plan().unwrap();
        assert!(plan.contains("#r0"));
        assert!(plan.contains("replacement"));
    }

    #[test]
    fn build_is_repeatable() {
        let app = App::new()
            .node(module("m", vec![supply(Port(1)).named("p")]))
            .node(when(true, vec![supply(Port(2))]));
        let first = app.build().unwrap();
        let second = app.build().unwrap();
        assert_eq!(first.instructions.len(), second.instructions.len());
    }

    #[test]
    fn compile_error_propagates_from_nested_scope() {
        let app = App::new().node(module("m", vec![supply(Port(1)).named("")]));
        let err = app.build().unwrap_err();
        assert!(matches!(err, CompileError::EmptyTag { .. }));
    }
}
