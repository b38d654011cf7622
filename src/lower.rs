//! Lowering: the authored node tree becomes the working IR
//!
//! One recursive descent that evaluates conditionals (memoized once per
//! node), parses binding options into resolved specs, validates
//! decorator and override shapes, and assigns monotonic binding/scope
//! ids. Later passes rewrite the IR in place; nothing here escapes the
//! compilation.

use std::sync::Arc;

use serde_json::Value as Json;
use tracing::{debug, trace};

use crate::config::ConfigResolver;
use crate::error::{CompileError, Site};
use crate::key::{Tag, TagSelector, TypeKey};
use crate::node::{
    BindKind, BindNode, Condition, DecorateForm, GroupFilter, Node, NodeKind, OverrideMode,
    SwitchNode, WhenNode,
};
use crate::options::{effective_slots, parse_bind_options, ExportSpec};
use crate::order::Priority;
use crate::value::{
    Callable, CollectionFn, ContractCast, FieldSlot, InvokeFn, ResolvedArg, SinkFn, Slot, Value,
};

// ============================================================================
// WORKING IR
// ============================================================================

#[derive(Default)]
pub(crate) struct Counters {
    pub binding: u64,
    pub scope: u64,
    pub replacement: u64,
    pub seq: u64,
    pub order: u64,
}

impl Counters {
    pub(crate) fn next_binding(&mut self) -> u64 {
        let id = self.binding;
        self.binding += 1;
        id
    }

    pub(crate) fn next_scope(&mut self) -> u64 {
        let id = self.scope;
        self.scope += 1;
        id
    }

    pub(crate) fn next_replacement(&mut self) -> u64 {
        let id = self.replacement;
        self.replacement += 1;
        id
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        let id = self.seq;
        self.seq += 1;
        id
    }

    pub(crate) fn next_order(&mut self) -> u64 {
        let id = self.order;
        self.order += 1;
        id
    }
}

/// A module scope: boundary for rule inheritance and override depth.
#[derive(Debug)]
pub(crate) struct WScope {
    pub name: Option<Arc<str>>,
    pub id: u64,
    pub depth: usize,
    pub items: Vec<WItem>,
    pub site: Option<Site>,
}

/// Transparent container: groups, surviving conditional branches.
#[derive(Debug)]
pub(crate) struct WGroup {
    pub label: Option<String>,
    pub items: Vec<WItem>,
}

#[derive(Debug)]
pub(crate) enum WItem {
    Bind(WBind),
    Scope(WScope),
    Group(WGroup),
    Override(WOverride),
    Decorate(WDecorate),
    AutoGroup(WAutoGroupRule),
    AutoInject,
    Invoke(WInvoke),
    Populate(WPopulate),
    OnStop(WHook),
    /// Pruned conditional branch, kept for plan rendering.
    Skipped(String),
    /// Slot left behind by a consumed override, filled with its
    /// expansions once resolution completes.
    Pending(usize),
}

#[derive(Clone)]
pub(crate) struct WBind {
    pub id: u64,
    pub kind: BindKind,
    pub invoke: InvokeFn,
    pub result: TypeKey,
    pub slots: Vec<Slot>,
    pub exports: Vec<ExportSpec>,
    pub private: bool,
    pub metadata: serde_json::Map<String, Json>,
    pub priority: Option<Priority>,
    pub order: Option<u64>,
    pub casts: Vec<ContractCast>,
    pub fields: Vec<FieldSlot>,
    pub auto_group_ignore: bool,
    pub auto_group_ignore_types: Vec<(TypeKey, Arc<str>)>,
    pub auto_inject_ignore: bool,
    pub site: Site,
}

impl WBind {
    /// Find the cast that produces `contract`, if declared.
    pub(crate) fn cast_for(&self, contract: TypeKey) -> Option<&ContractCast> {
        self.casts.iter().find(|c| c.contract == contract)
    }
}

impl std::fmt::Debug for WBind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WBind")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("result", &self.result)
            .field("exports", &self.exports)
            .field("private", &self.private)
            .field("priority", &self.priority)
            .field("site", &self.site)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct WOverride {
    pub bind: WBind,
    pub mode: OverrideMode,
    pub is_fallback: bool,
    pub selector: TagSelector,
    pub site: Site,
}

pub(crate) enum WDecorateForm {
    Element {
        invoke: InvokeFn,
        slots: Vec<Slot>,
        result: TypeKey,
    },
    Collection {
        element: TypeKey,
        transform: CollectionFn,
    },
}

impl std::fmt::Debug for WDecorateForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WDecorateForm::Element { slots, result, .. } => f
                .debug_struct("Element")
                .field("slots", slots)
                .field("result", result)
                .finish_non_exhaustive(),
            WDecorateForm::Collection { element, .. } => f
                .debug_struct("Collection")
                .field("element", element)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct WDecorate {
    pub form: WDecorateForm,
    pub selector: TagSelector,
    pub site: Site,
}

#[derive(Clone)]
pub(crate) struct WAutoGroupRule {
    pub contract: TypeKey,
    pub group: Arc<str>,
    pub filter: Option<GroupFilter>,
    pub export_self: bool,
    pub site: Site,
}

pub(crate) struct WInvoke {
    pub invoke: InvokeFn,
    pub slots: Vec<Slot>,
    pub site: Site,
}

pub(crate) struct WPopulate {
    pub slot: Slot,
    pub sink: SinkFn,
    pub site: Site,
}

pub(crate) struct WHook {
    pub invoke: InvokeFn,
    pub slots: Vec<Slot>,
    pub site: Site,
}

impl std::fmt::Debug for WAutoGroupRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WAutoGroupRule")
            .field("contract", &self.contract)
            .field("group", &self.group)
            .field("has_filter", &self.filter.is_some())
            .field("export_self", &self.export_self)
            .field("site", &self.site)
            .finish()
    }
}

impl std::fmt::Debug for WInvoke {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WInvoke")
            .field("slots", &self.slots)
            .field("site", &self.site)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for WPopulate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WPopulate")
            .field("slot", &self.slot)
            .field("site", &self.site)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for WHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WHook")
            .field("slots", &self.slots)
            .field("site", &self.site)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// LOWERING
// ============================================================================

pub(crate) fn lower(
    nodes: &[Node],
    resolver: Option<&ConfigResolver>,
    counters: &mut Counters,
) -> Result<WScope, CompileError> {
    let ctx = LowerCtx { resolver };
    let id = counters.next_scope();
    let items = lower_children(nodes, &ctx, counters, 0)?;
    Ok(WScope {
        name: None,
        id,
        depth: 0,
        items,
        site: None,
    })
}

struct LowerCtx<'a> {
    resolver: Option<&'a ConfigResolver>,
}

fn lower_children(
    nodes: &[Node],
    ctx: &LowerCtx<'_>,
    counters: &mut Counters,
    depth: usize,
) -> Result<Vec<WItem>, CompileError> {
    let mut items = Vec::with_capacity(nodes.len());
    for node in nodes {
        lower_node(node, ctx, counters, depth, &mut items)?;
    }
    Ok(items)
}

fn lower_node(
    node: &Node,
    ctx: &LowerCtx<'_>,
    counters: &mut Counters,
    depth: usize,
    out: &mut Vec<WItem>,
) -> Result<(), CompileError> {
    match &node.kind {
        NodeKind::Bind(bind) => {
            lower_bind(bind, false, ctx, counters, out)?;
        }
        NodeKind::Module(module) => {
            let id = counters.next_scope();
            trace!(module = %module.name, scope_id = id, "entering module scope");
            let items = lower_children(&module.children, ctx, counters, depth + 1)?;
            out.push(WItem::Scope(WScope {
                name: Some(Arc::clone(&module.name)),
                id,
                depth: depth + 1,
                items,
                site: Some(module.site),
            }));
        }
        NodeKind::Options(children) => {
            let items = lower_children(children, ctx, counters, depth)?;
            out.push(WItem::Group(WGroup { label: None, items }));
        }
        NodeKind::When(when) => {
            if eval_when(when, ctx)? {
                let items = lower_children(&when.children, ctx, counters, depth)?;
                out.push(WItem::Group(WGroup {
                    label: Some("when".to_string()),
                    items,
                }));
            } else {
                debug!(site = %when.site, "condition false, branch skipped");
                out.push(WItem::Skipped("when".to_string()));
            }
        }
        NodeKind::Switch(switch) => {
            let selected = eval_switch(switch, ctx)?;
            for (index, arm) in switch.cases.iter().enumerate() {
                let label = match &arm.label {
                    Some(v) => format!("case \"{v}\""),
                    None => "default case".to_string(),
                };
                if selected == Some(index) {
                    let items = lower_children(&arm.children, ctx, counters, depth)?;
                    out.push(WItem::Group(WGroup {
                        label: Some(label),
                        items,
                    }));
                } else {
                    out.push(WItem::Skipped(label));
                }
            }
        }
        NodeKind::Override(over) => {
            let bind = lower_bind_payload(&over.bind, true, counters)?;
            out.push(WItem::Override(WOverride {
                bind,
                mode: over.mode,
                is_fallback: over.is_fallback,
                selector: over.selector.clone(),
                site: over.site,
            }));
        }
        NodeKind::Decorate(dec) => {
            let form = lower_decorate_form(&dec.form, dec.site)?;
            out.push(WItem::Decorate(WDecorate {
                form,
                selector: dec.selector.clone(),
                site: dec.site,
            }));
        }
        NodeKind::AutoGroup(rule) => {
            out.push(WItem::AutoGroup(WAutoGroupRule {
                contract: rule.contract,
                group: Arc::clone(&rule.group),
                filter: rule.filter.clone(),
                export_self: rule.export_self,
                site: rule.site,
            }));
        }
        NodeKind::AutoInject(_) => out.push(WItem::AutoInject),
        NodeKind::Invoke(inv) => {
            let tags = match &inv.tags {
                Some(raw) => Some(crate::options::parse_raw_param_tags(
                    raw,
                    &inv.callable,
                    inv.site,
                )?),
                None => None,
            };
            let slots = effective_slots(&inv.callable, tags.as_deref(), inv.site)?;
            out.push(WItem::Invoke(WInvoke {
                invoke: Arc::clone(&inv.callable.invoke),
                slots,
                site: inv.site,
            }));
        }
        NodeKind::Populate(pop) => {
            out.push(WItem::Populate(WPopulate {
                slot: pop.slot.clone(),
                sink: Arc::clone(&pop.sink),
                site: pop.site,
            }));
        }
        NodeKind::OnStop(hook) => {
            let tags = match &hook.tags {
                Some(raw) => Some(crate::options::parse_raw_param_tags(
                    raw,
                    &hook.callable,
                    hook.site,
                )?),
                None => None,
            };
            let slots = effective_slots(&hook.callable, tags.as_deref(), hook.site)?;
            out.push(WItem::OnStop(WHook {
                invoke: Arc::clone(&hook.callable.invoke),
                slots,
                site: hook.site,
            }));
        }
        NodeKind::Invalid(poison) => {
            return Err(CompileError::OptionOnWrongNode {
                option: poison.option,
                node: poison.node,
                site: poison.site,
            });
        }
    }
    Ok(())
}

/// Lower a bind node and emit it plus any embedded decorator/stop-hook
/// sub-nodes.
fn lower_bind(
    bind: &BindNode,
    for_override: bool,
    _ctx: &LowerCtx<'_>,
    counters: &mut Counters,
    out: &mut Vec<WItem>,
) -> Result<(), CompileError> {
    let spec = parse_bind_options(bind, for_override)?;
    let slots = effective_slots(&bind.callable, spec.param_tags.as_deref(), bind.site)?;
    let wbind = WBind {
        id: counters.next_binding(),
        kind: bind.kind,
        invoke: Arc::clone(&bind.callable.invoke),
        result: bind.callable.result,
        slots,
        exports: spec.exports,
        private: spec.private,
        metadata: spec.metadata,
        priority: spec.priority,
        order: None,
        casts: bind.casts.clone(),
        fields: bind.fields.clone(),
        auto_group_ignore: spec.auto_group_ignore,
        auto_group_ignore_types: spec.auto_group_ignore_types,
        auto_inject_ignore: spec.auto_inject_ignore,
        site: bind.site,
    };

    // embedded decorators target the export matching their first
    // parameter type
    let mut embedded: Vec<WItem> = Vec::new();
    for (callable, site) in &spec.decorators {
        let form = lower_decorate_form(&DecorateForm::Element(callable.clone()), *site)?;
        let param_key = match &form {
            WDecorateForm::Element { slots, .. } => slots[0].key,
            WDecorateForm::Collection { element, .. } => *element,
        };
        let export = wbind
            .exports
            .iter()
            .find(|e| e.tag_set.key == param_key)
            .ok_or_else(|| CompileError::DecoratorResultMismatch {
                param: param_key.type_name().to_string(),
                result: wbind.result.type_name().to_string(),
                site: *site,
            })?;
        let selector = match &export.tag_set.tag {
            Tag::None => TagSelector::default(),
            Tag::Name(n) => TagSelector {
                name: Some(Arc::clone(n)),
                ..Default::default()
            },
            Tag::Group(g) => TagSelector {
                group: Some(Arc::clone(g)),
                ..Default::default()
            },
        };
        embedded.push(WItem::Decorate(WDecorate {
            form,
            selector,
            site: *site,
        }));
    }
    for (callable, site) in &spec.stop_hooks {
        let slots = effective_slots(callable, None, *site)?;
        embedded.push(WItem::OnStop(WHook {
            invoke: Arc::clone(&callable.invoke),
            slots,
            site: *site,
        }));
    }

    out.push(WItem::Bind(wbind));
    out.extend(embedded);
    Ok(())
}

/// Lower an override's replacement payload (no emission of embedded
/// sub-nodes: the option parser already rejected them).
pub(crate) fn lower_bind_payload(
    bind: &BindNode,
    for_override: bool,
    counters: &mut Counters,
) -> Result<WBind, CompileError> {
    let spec = parse_bind_options(bind, for_override)?;
    let slots = effective_slots(&bind.callable, spec.param_tags.as_deref(), bind.site)?;
    Ok(WBind {
        id: counters.next_binding(),
        kind: bind.kind,
        invoke: Arc::clone(&bind.callable.invoke),
        result: bind.callable.result,
        slots,
        exports: Vec::new(),
        private: spec.private,
        metadata: spec.metadata,
        priority: spec.priority,
        order: None,
        casts: bind.casts.clone(),
        fields: bind.fields.clone(),
        auto_group_ignore: true,
        auto_group_ignore_types: Vec::new(),
        auto_inject_ignore: true,
        site: bind.site,
    })
}

fn lower_decorate_form(
    form: &DecorateForm,
    site: Site,
) -> Result<WDecorateForm, CompileError> {
    match form {
        DecorateForm::Element(callable) => {
            if callable.params.is_empty() {
                return Err(CompileError::DecoratorNoParams { site });
            }
            if callable.params[0].many {
                return Err(CompileError::DecoratorCollectionParam { site });
            }
            if callable.result != callable.params[0].key {
                return Err(CompileError::DecoratorResultMismatch {
                    param: callable.params[0].key.type_name().to_string(),
                    result: callable.result.type_name().to_string(),
                    site,
                });
            }
            // extra dependencies may not be untagged collections
            for (index, slot) in callable.params.iter().enumerate().skip(1) {
                if slot.many && !matches!(slot.tag, Tag::Group(_)) {
                    return Err(CompileError::CollectionWithoutGroup { index, site });
                }
            }
            Ok(WDecorateForm::Element {
                invoke: Arc::clone(&callable.invoke),
                slots: callable.params.clone(),
                result: callable.result,
            })
        }
        DecorateForm::Collection { element, transform } => Ok(WDecorateForm::Collection {
            element: *element,
            transform: Arc::clone(transform),
        }),
    }
}

// ============================================================================
// CONDITION EVALUATION
// ============================================================================

fn eval_when(when: &WhenNode, ctx: &LowerCtx<'_>) -> Result<bool, CompileError> {
    when.memo
        .get_or_try_init(|| match &when.cond {
            Condition::Bool(b) => Ok(*b),
            Condition::Pred(callable) => {
                let result = eval_predicate(callable, ctx, when.site)?;
                result
                    .extract::<bool>()
                    .ok_or_else(|| CompileError::PredicateType {
                        expected: "bool",
                        found: callable.result.type_name().to_string(),
                        site: when.site,
                    })
            }
        })
        .copied()
}

fn eval_switch(switch: &SwitchNode, ctx: &LowerCtx<'_>) -> Result<Option<usize>, CompileError> {
    switch
        .memo
        .get_or_try_init(|| {
            let result = eval_predicate(&switch.selector, ctx, switch.site)?;
            let selected: String =
                result
                    .extract::<String>()
                    .ok_or_else(|| CompileError::PredicateType {
                        expected: "String",
                        found: switch.selector.result.type_name().to_string(),
                        site: switch.site,
                    })?;
            let arm = switch
                .cases
                .iter()
                .position(|c| c.label.as_deref() == Some(selected.as_str()))
                .or_else(|| switch.cases.iter().position(|c| c.label.is_none()));
            debug!(selected = %selected, arm = ?arm, "switch evaluated");
            Ok(arm)
        })
        .copied()
}

/// Run a `when`/`switch` predicate, resolving its parameters through the
/// registered config resolver.
fn eval_predicate(
    callable: &Callable,
    ctx: &LowerCtx<'_>,
    site: Site,
) -> Result<Value, CompileError> {
    let args: Vec<ResolvedArg> = if callable.params.is_empty() {
        Vec::new()
    } else {
        let resolver = ctx
            .resolver
            .ok_or(CompileError::MissingConfigResolver { site })?;
        callable
            .params
            .iter()
            .map(|slot| {
                resolver(&slot.key)
                    .map(ResolvedArg::One)
                    .or_else(|err| {
                        if slot.optional {
                            Ok(ResolvedArg::Missing)
                        } else {
                            Err(CompileError::ConfigResolve {
                                key: slot.key.type_name().to_string(),
                                site,
                                source: err,
                            })
                        }
                    })
            })
            .collect::<Result<_, _>>()?
    };
    (callable.invoke)(args).map_err(|source| CompileError::PredicateFailed { site, source })
}

// ============================================================================
// TREE WALK HELPERS (shared by the passes)
// ============================================================================

/// Walk every item in a scope, descending through transparent groups but
/// NOT into child scopes. The callback receives each item with its
/// position path within the scope.
pub(crate) fn walk_scope_items<'a>(
    items: &'a mut [WItem],
    f: &mut impl FnMut(&mut WItem, &[u32]),
) {
    fn inner<'a>(
        items: &'a mut [WItem],
        prefix: &mut Vec<u32>,
        f: &mut impl FnMut(&mut WItem, &[u32]),
    ) {
        for (index, item) in items.iter_mut().enumerate() {
            prefix.push(index as u32);
            if let WItem::Group(group) = item {
                inner(&mut group.items, prefix, f);
            } else {
                f(item, prefix);
            }
            prefix.pop();
        }
    }
    let mut prefix = Vec::new();
    inner(items, &mut prefix, f);
}

/// Child scopes of a scope, with their position paths.
pub(crate) fn child_scopes<'a>(
    items: &'a mut [WItem],
    f: &mut impl FnMut(&mut WScope, &[u32]),
) {
    walk_scope_items(items, &mut |item, pos| {
        if let WItem::Scope(scope) = item {
            f(scope, pos);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config_resolver;
    use crate::node::{
        case, case_default, module, provide, supply, switch, when, when_fn,
    };
    use crate::value::Dep;

    #[derive(Clone, Debug, PartialEq)]
    struct Svc(u32);

    #[derive(Clone)]
    struct Flags {
        fancy: bool,
    }

    fn lower_ok(nodes: Vec<Node>) -> WScope {
        let mut counters = Counters::default();
        lower(&nodes, None, &mut counters).unwrap()
    }

    fn bind_count(scope: &WScope) -> usize {
        fn count(items: &[WItem]) -> usize {
            items
                .iter()
                .map(|i| match i {
                    WItem::Bind(_) => 1,
                    WItem::Group(g) => count(&g.items),
                    WItem::Scope(s) => count(&s.items),
                    _ => 0,
                })
                .sum()
        }
        count(&scope.items)
    }

    #[test]
    fn modules_open_scopes_with_fresh_ids() {
        let root = lower_ok(vec![
            supply(Svc(1)),
            module("inner", vec![supply(Svc(2)).named("two")]),
        ]);
        assert_eq!(root.id, 0);
        let inner = root
            .items
            .iter()
            .find_map(|i| match i {
                WItem::Scope(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(inner.depth, 1);
        assert!(inner.id > root.id);
        assert_eq!(bind_count(&root), 2);
    }

    #[test]
    fn false_branch_is_skipped_but_rendered() {
        let root = lower_ok(vec![
            when(false, vec![supply(Svc(1))]),
            when(true, vec![supply(Svc(2))]),
        ]);
        assert!(matches!(&root.items[0], WItem::Skipped(label) if label == "when"));
        assert_eq!(bind_count(&root), 1);
    }

    #[test]
    fn when_fn_without_resolver_fails_if_parameterized() {
        let mut counters = Counters::default();
        let nodes = vec![when_fn(
            |flags: Dep<Flags>| anyhow::Ok(flags.0.fancy),
            vec![supply(Svc(1))],
        )];
        let err = lower(&nodes, None, &mut counters).unwrap_err();
        assert!(matches!(err, CompileError::MissingConfigResolver { .. }));
    }

    #[test]
    fn when_fn_resolves_parameters_through_config() {
        let resolver = config_resolver(|key| {
            if *key == TypeKey::of::<Flags>() {
                Ok(Value::new(Flags { fancy: true }))
            } else {
                anyhow::bail!("no config for {key}")
            }
        });
        let mut counters = Counters::default();
        let nodes = vec![when_fn(
            |flags: Dep<Flags>| anyhow::Ok(flags.0.fancy),
            vec![supply(Svc(1))],
        )];
        let root = lower(&nodes, Some(&resolver), &mut counters).unwrap();
        assert_eq!(bind_count(&root), 1);
    }

    #[test]
    fn parameterless_predicate_needs_no_resolver() {
        let root = lower_ok(vec![when_fn(|| anyhow::Ok(true), vec![supply(Svc(1))])]);
        assert_eq!(bind_count(&root), 1);
    }

    #[test]
    fn when_memoized_across_lowerings() {
        let node = when_fn(|| anyhow::Ok(true), vec![]);
        let memo = match &node.kind {
            NodeKind::When(w) => Arc::clone(&w.memo),
            _ => unreachable!(),
        };
        let mut counters = Counters::default();
        lower(std::slice::from_ref(&node), None, &mut counters).unwrap();
        assert_eq!(memo.get(), Some(&true));
        // second lowering reuses the memo (no second evaluation)
        lower(std::slice::from_ref(&node), None, &mut counters).unwrap();
    }

    #[test]
    fn switch_selects_matching_case() {
        let root = lower_ok(vec![switch(
            || anyhow::Ok("b".to_string()),
            vec![
                case("a", vec![supply(Svc(1))]),
                case("b", vec![supply(Svc(2))]),
                case_default(vec![supply(Svc(3))]),
            ],
        )]);
        assert_eq!(bind_count(&root), 1);
        let skipped: Vec<_> = root
            .items
            .iter()
            .filter(|i| matches!(i, WItem::Skipped(_)))
            .collect();
        assert_eq!(skipped.len(), 2);
    }

    #[test]
    fn switch_falls_back_to_default_arm() {
        let root = lower_ok(vec![switch(
            || anyhow::Ok("zzz".to_string()),
            vec![
                case("a", vec![supply(Svc(1))]),
                case_default(vec![supply(Svc(9))]),
            ],
        )]);
        assert_eq!(bind_count(&root), 1);
    }

    #[test]
    fn poisoned_node_surfaces_as_compile_error() {
        let mut counters = Counters::default();
        let nodes = vec![module("m", vec![]).priority(Priority::Later)];
        let err = lower(&nodes, None, &mut counters).unwrap_err();
        assert!(matches!(
            err,
            CompileError::OptionOnWrongNode {
                option: "priority",
                node: "module",
                ..
            }
        ));
    }

    #[test]
    fn decorator_without_params_rejected() {
        let mut counters = Counters::default();
        let nodes = vec![crate::node::decorate(|| anyhow::Ok(Svc(0)))];
        let err = lower(&nodes, None, &mut counters).unwrap_err();
        assert!(matches!(err, CompileError::DecoratorNoParams { .. }));
    }

    #[test]
    fn decorator_result_must_match_target() {
        let mut counters = Counters::default();
        let nodes = vec![crate::node::decorate(|s: Dep<Svc>| anyhow::Ok(s.0 .0))];
        let err = lower(&nodes, None, &mut counters).unwrap_err();
        assert!(matches!(err, CompileError::DecoratorResultMismatch { .. }));
    }

    #[test]
    fn provide_lowered_with_effective_slots() {
        let root = lower_ok(vec![provide(|n: Dep<u32>| anyhow::Ok(Svc(n.0)))
            .param_tags(["name=port"])]);
        match &root.items[0] {
            WItem::Bind(b) => {
                assert_eq!(b.slots[0].tag.name(), Some("port"));
                assert_eq!(b.result, TypeKey::of::<Svc>());
            }
            _ => panic!("expected bind"),
        }
    }
}
