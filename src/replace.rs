//! Replace/fallback resolution
//!
//! Overrides are collected per scope with their position, nesting depth,
//! and a fresh replacement id, then matched against binding exports by
//! specificity: `(name+group) > group > name > type-only`, ties broken
//! by deeper nesting, then by later declaration. A winning override
//! displaces the matched tag set, is expanded once per distinct
//! displaced tag set under a scope-unique suffixed tag, and dependent
//! consumer slots (provide/invoke/populate) are rewritten to the
//! suffixed tag — the indirection that makes replace-everywhere work on
//! a runtime with no true rebinding.
//!
//! Positional modes are scope-local: `Before`/`After` affect only
//! consumers declared on the matching side of the override; once a spec
//! is inherited by a child scope (reachable from its declaration
//! position) it is unconditionally active. Fallbacks join in a second
//! phase and only apply where nothing else satisfies the tag set.

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::error::{CompileError, Site};
use crate::key::{TagSet, TypeKey};
use crate::lower::{
    child_scopes, walk_scope_items, Counters, WBind, WGroup, WItem, WScope,
};
use crate::node::OverrideMode;
use crate::options::{ExportOrigin, ExportSpec};

pub(crate) struct SpecEntry {
    bind: WBind,
    mode: OverrideMode,
    is_fallback: bool,
    candidates: Vec<TagSet>,
    specificity: u8,
    depth: usize,
    seq: u64,
    replacement_id: u64,
    home_scope: u64,
    site: Site,
    /// Distinct tag sets this spec takes over (producers displaced
    /// and/or consumers rewritten).
    displaced: Vec<TagSet>,
}

pub(crate) fn run(root: &mut WScope, counters: &mut Counters) -> Result<(), CompileError> {
    let mut specs: Vec<SpecEntry> = Vec::new();
    resolve_scope(root, &[], &mut specs, counters)?;
    apply_fallbacks(root, &mut specs, counters)?;
    prune_dead_binds(&mut root.items);
    Ok(())
}

struct Active {
    idx: usize,
    /// Declaration position in the current scope; `None` once inherited
    /// (position-independent).
    pos: Option<Vec<u32>>,
}

fn applicable(active: &Active, specs: &[SpecEntry], item_pos: &[u32]) -> bool {
    match &active.pos {
        None => true,
        Some(p) => match specs[active.idx].mode {
            OverrideMode::All => true,
            OverrideMode::Before => item_pos < p.as_slice(),
            OverrideMode::After => item_pos > p.as_slice(),
        },
    }
}

/// Pick the winning spec for one tag set at one position:
/// highest specificity, then deepest nesting, then latest declaration.
fn best_match<'a>(
    active: &'a [Active],
    specs: &[SpecEntry],
    tag_set: &TagSet,
    item_pos: &[u32],
    producers_only_unconditional: bool,
) -> Option<&'a Active> {
    active
        .iter()
        .filter(|a| {
            let spec = &specs[a.idx];
            if !spec.candidates.contains(tag_set) {
                return false;
            }
            if producers_only_unconditional
                && a.pos.is_some()
                && spec.mode != OverrideMode::All
            {
                // positional overrides never displace producers in
                // their own scope; they only retarget consumers
                return false;
            }
            applicable(a, specs, item_pos)
        })
        .max_by_key(|a| {
            let spec = &specs[a.idx];
            (spec.specificity, spec.depth, spec.seq)
        })
}

fn push_displaced(spec: &mut SpecEntry, tag_set: &TagSet) {
    if !spec.displaced.contains(tag_set) {
        spec.displaced.push(tag_set.clone());
    }
}

fn resolve_scope(
    scope: &mut WScope,
    inherited: &[usize],
    specs: &mut Vec<SpecEntry>,
    counters: &mut Counters,
) -> Result<(), CompileError> {
    let scope_id = scope.id;
    let scope_depth = scope.depth;

    // 1. extract local override declarations, leaving expansion slots
    let mut local: Vec<(usize, Vec<u32>)> = Vec::new();
    let mut first_err: Option<CompileError> = None;
    walk_scope_items(&mut scope.items, &mut |item, pos| {
        if first_err.is_some() || !matches!(item, WItem::Override(_)) {
            return;
        }
        let over = match std::mem::replace(item, WItem::Skipped(String::new())) {
            WItem::Override(o) => o,
            _ => return,
        };
        let target_key = over.selector.key.unwrap_or(over.bind.result);
        if target_key != over.bind.result && over.bind.cast_for(target_key).is_none() {
            first_err = Some(CompileError::OverrideCastMissing {
                target: target_key.type_name().to_string(),
                found: over.bind.result.type_name().to_string(),
                site: over.site,
            });
            return;
        }
        let idx = specs.len();
        specs.push(SpecEntry {
            specificity: over.selector.specificity(),
            candidates: over.selector.candidates(over.bind.result),
            bind: over.bind,
            mode: over.mode,
            is_fallback: over.is_fallback,
            depth: scope_depth,
            seq: counters.next_seq(),
            replacement_id: counters.next_replacement(),
            home_scope: scope_id,
            site: over.site,
            displaced: Vec::new(),
        });
        *item = WItem::Pending(idx);
        local.push((idx, pos.to_vec()));
    });
    if let Some(err) = first_err {
        return Err(err);
    }

    // 2. active list: inherited specs are unconditional, local ones
    //    positional; fallbacks wait for the second phase
    let mut active: Vec<Active> = inherited
        .iter()
        .map(|&idx| Active { idx, pos: None })
        .collect();
    active.extend(
        local
            .iter()
            .filter(|(idx, _)| !specs[*idx].is_fallback)
            .map(|(idx, pos)| Active {
                idx: *idx,
                pos: Some(pos.clone()),
            }),
    );

    // 3. displace producers and rewrite consumers in this scope
    walk_scope_items(&mut scope.items, &mut |item, pos| match item {
        WItem::Bind(bind) => {
            let mut kept = Vec::with_capacity(bind.exports.len());
            for export in bind.exports.drain(..) {
                match best_match(&active, specs, &export.tag_set, pos, true) {
                    Some(winner) => {
                        debug!(
                            binding = %bind.result,
                            tag_set = %export.tag_set,
                            replacement = specs[winner.idx].replacement_id,
                            "export displaced by override"
                        );
                        push_displaced(&mut specs[winner.idx], &export.tag_set);
                    }
                    None => kept.push(export),
                }
            }
            bind.exports = kept;
            for slot in &mut bind.slots {
                rewrite_slot(slot, &active, specs, pos);
            }
        }
        WItem::Invoke(inv) => {
            for slot in &mut inv.slots {
                rewrite_slot(slot, &active, specs, pos);
            }
        }
        WItem::Populate(pop) => {
            rewrite_slot(&mut pop.slot, &active, specs, pos);
        }
        _ => {}
    });

    // 4. recurse, passing down only the specs applicable at each child
    //    scope's declaration position
    let mut child_err: Option<CompileError> = None;
    child_scopes(&mut scope.items, &mut |child, pos| {
        if child_err.is_some() {
            return;
        }
        let pass: Vec<usize> = active
            .iter()
            .filter(|a| applicable(a, specs, pos))
            .map(|a| a.idx)
            .collect();
        if let Err(err) = resolve_scope(child, &pass, specs, counters) {
            child_err = Some(err);
        }
    });
    if let Some(err) = child_err {
        return Err(err);
    }

    // 5. materialize local non-fallback expansions in place
    for (idx, _) in &local {
        if specs[*idx].is_fallback {
            continue;
        }
        if specs[*idx].displaced.is_empty() {
            let spec = &specs[*idx];
            return Err(CompileError::OverrideUnmatched {
                targets: spec
                    .candidates
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                site: spec.site,
            });
        }
        let expansions = build_expansions(&specs[*idx], counters)?;
        fill_pending(&mut scope.items, *idx, expansions);
    }
    Ok(())
}

fn rewrite_slot(
    slot: &mut crate::value::Slot,
    active: &[Active],
    specs: &mut [SpecEntry],
    pos: &[u32],
) {
    let tag_set = TagSet {
        key: slot.key,
        tag: slot.tag.clone(),
    };
    if let Some(winner) = best_match(active, specs, &tag_set, pos, false) {
        let spec = &mut specs[winner.idx];
        slot.tag = slot.tag.suffixed(spec.replacement_id);
        push_displaced(spec, &tag_set);
    }
}

/// One expansion binding per distinct displaced tag set, published under
/// the suffixed tag so it cannot collide with the original inside the
/// runtime.
fn build_expansions(
    spec: &SpecEntry,
    counters: &mut Counters,
) -> Result<Vec<WItem>, CompileError> {
    let mut items = Vec::with_capacity(spec.displaced.len());
    for tag_set in &spec.displaced {
        let cast = if tag_set.key == spec.bind.result {
            None
        } else {
            match spec.bind.cast_for(tag_set.key) {
                Some(c) => Some(c.clone()),
                None => {
                    return Err(CompileError::OverrideCastMissing {
                        target: tag_set.key.type_name().to_string(),
                        found: spec.bind.result.type_name().to_string(),
                        site: spec.site,
                    })
                }
            }
        };
        let mut bind = spec.bind.clone();
        bind.id = counters.next_binding();
        bind.exports = vec![ExportSpec {
            tag_set: TagSet {
                key: tag_set.key,
                tag: tag_set.tag.suffixed(spec.replacement_id),
            },
            cast,
            origin: ExportOrigin::Explicit,
        }];
        items.push(WItem::Bind(bind));
    }
    Ok(items)
}

fn fill_pending(items: &mut [WItem], idx: usize, expansions: Vec<WItem>) {
    let mut expansions = Some(expansions);
    walk_scope_items(items, &mut |item, _| {
        if matches!(item, WItem::Pending(i) if *i == idx) {
            if let Some(exp) = expansions.take() {
                *item = WItem::Group(WGroup {
                    label: Some("replacement".to_string()),
                    items: exp,
                });
            }
        }
    });
}

// ============================================================================
// FALLBACKS
// ============================================================================

fn apply_fallbacks(
    root: &mut WScope,
    specs: &mut [SpecEntry],
    counters: &mut Counters,
) -> Result<(), CompileError> {
    // a tag set is satisfied by a surviving export or by a replace that
    // claimed it (the replacement now serves it under its suffixed tag)
    let mut satisfied: FxHashSet<TagSet> = FxHashSet::default();
    collect_exports(root, &mut satisfied);
    for spec in specs.iter().filter(|s| !s.is_fallback) {
        for tag_set in &spec.displaced {
            satisfied.insert(tag_set.clone());
        }
    }

    // first match wins by specificity, ties by declaration order
    let mut order: Vec<usize> = (0..specs.len()).filter(|&i| specs[i].is_fallback).collect();
    order.sort_by_key(|&i| (std::cmp::Reverse(specs[i].specificity), specs[i].seq));

    for idx in order {
        let unsatisfied: Vec<TagSet> = specs[idx]
            .candidates
            .iter()
            .filter(|c| !satisfied.contains(c))
            .cloned()
            .collect();
        let home = specs[idx].home_scope;
        if unsatisfied.is_empty() {
            // something else already serves every candidate slot
            debug!(site = %specs[idx].site, "fallback dropped, targets satisfied");
            with_scope(root, home, &mut |scope| {
                fill_pending(&mut scope.items, idx, Vec::new());
            });
            continue;
        }
        for tag_set in &unsatisfied {
            specs[idx].displaced.push(tag_set.clone());
            satisfied.insert(tag_set.clone());
        }
        let replacement_id = specs[idx].replacement_id;
        with_scope(root, home, &mut |scope| {
            rewrite_consumers_rec(scope, &unsatisfied, replacement_id);
        });
        let mut expansions = Some(build_expansions(&specs[idx], counters)?);
        with_scope(root, home, &mut |scope| {
            if let Some(exp) = expansions.take() {
                fill_pending(&mut scope.items, idx, exp);
            }
        });
    }
    Ok(())
}

fn collect_exports(scope: &WScope, out: &mut FxHashSet<TagSet>) {
    fn visit(items: &[WItem], out: &mut FxHashSet<TagSet>) {
        for item in items {
            match item {
                WItem::Bind(b) => {
                    for e in &b.exports {
                        out.insert(e.tag_set.clone());
                    }
                }
                WItem::Group(g) => visit(&g.items, out),
                WItem::Scope(s) => visit(&s.items, out),
                _ => {}
            }
        }
    }
    visit(&scope.items, out);
}

fn rewrite_consumers_rec(scope: &mut WScope, targets: &[TagSet], replacement_id: u64) {
    fn visit(items: &mut [WItem], targets: &[TagSet], replacement_id: u64) {
        for item in items {
            match item {
                WItem::Bind(b) => {
                    for slot in &mut b.slots {
                        rewrite(slot, targets, replacement_id);
                    }
                }
                WItem::Invoke(inv) => {
                    for slot in &mut inv.slots {
                        rewrite(slot, targets, replacement_id);
                    }
                }
                WItem::Populate(pop) => rewrite(&mut pop.slot, targets, replacement_id),
                WItem::Group(g) => visit(&mut g.items, targets, replacement_id),
                WItem::Scope(s) => visit(&mut s.items, targets, replacement_id),
                _ => {}
            }
        }
    }
    fn rewrite(slot: &mut crate::value::Slot, targets: &[TagSet], replacement_id: u64) {
        let tag_set = TagSet {
            key: slot.key,
            tag: slot.tag.clone(),
        };
        if targets.contains(&tag_set) {
            slot.tag = slot.tag.suffixed(replacement_id);
        }
    }
    visit(&mut scope.items, targets, replacement_id);
}

fn with_scope(scope: &mut WScope, id: u64, f: &mut impl FnMut(&mut WScope)) -> bool {
    if scope.id == id {
        f(scope);
        return true;
    }
    let mut found = false;
    child_scopes(&mut scope.items, &mut |child, _| {
        if !found {
            found = with_scope(child, id, f);
        }
    });
    found
}

/// A binding whose every export was displaced serves nothing; drop it.
fn prune_dead_binds(items: &mut Vec<WItem>) {
    items.retain_mut(|item| match item {
        WItem::Bind(b) => !b.exports.is_empty(),
        WItem::Group(g) => {
            prune_dead_binds(&mut g.items);
            true
        }
        WItem::Scope(s) => {
            prune_dead_binds(&mut s.items);
            true
        }
        _ => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TypeKey;
    use crate::lower::{lower, Counters};
    use crate::node::{
        fallback, invoke, module, provide, replace, replace_after, replace_before, supply, Node,
    };
    use crate::value::Dep;

    #[derive(Clone, Debug, PartialEq)]
    struct Port(u16);

    #[derive(Clone, Debug, PartialEq)]
    struct Host(&'static str);

    fn resolve(nodes: Vec<Node>) -> Result<WScope, CompileError> {
        let mut counters = Counters::default();
        let mut root = lower(&nodes, None, &mut counters)?;
        crate::autogroup::run(&mut root);
        run(&mut root, &mut counters)?;
        Ok(root)
    }

    fn all_binds(scope: &WScope) -> Vec<&WBind> {
        fn visit<'a>(items: &'a [WItem], out: &mut Vec<&'a WBind>) {
            for item in items {
                match item {
                    WItem::Bind(b) => out.push(b),
                    WItem::Group(g) => visit(&g.items, out),
                    WItem::Scope(s) => visit(&s.items, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        visit(&scope.items, &mut out);
        out
    }

    fn exports_of(scope: &WScope) -> Vec<String> {
        all_binds(scope)
            .iter()
            .flat_map(|b| b.exports.iter().map(|e| e.tag_set.to_string()))
            .collect()
    }

    #[test]
    fn type_only_replace_displaces_untagged_slot_only() {
        let root = resolve(vec![
            supply(Port(1)),
            supply(Port(2)).named("admin"),
            replace(Port(9)),
        ])
        .unwrap();
        let exports = exports_of(&root);
        // untagged original is gone, named survives, replacement carries
        // a suffixed name
        assert!(exports.iter().any(|e| e.contains("admin")));
        assert!(exports.iter().any(|e| e.contains("#r0")));
        assert_eq!(all_binds(&root).len(), 2);
    }

    #[test]
    fn named_replace_leaves_grouped_slot_serving_original() {
        // binding exported both named "x" and (explicitly) grouped "g"
        let root = resolve(vec![
            supply(Port(1)).named("x"),
            supply(Port(1)).grouped("g"),
            replace(Port(9)).named("x"),
        ])
        .unwrap();
        let exports = exports_of(&root);
        assert!(exports.iter().any(|e| e.contains("group=\"g\"")));
        assert!(!exports.iter().any(|e| e.contains("name=\"x\"") && !e.contains("#r")));
        assert!(exports.iter().any(|e| e.contains("x#r0")));
    }

    #[test]
    fn consumers_retargeted_to_suffixed_tag() {
        let root = resolve(vec![
            supply(Port(1)),
            provide(|p: Dep<Port>| anyhow::Ok(Host(if p.0 .0 == 9 { "nine" } else { "one" }))),
            replace(Port(9)),
        ])
        .unwrap();
        let binds = all_binds(&root);
        let consumer = binds
            .iter()
            .find(|b| b.result == TypeKey::of::<Host>())
            .unwrap();
        assert_eq!(consumer.slots[0].tag.name(), Some("#r0"));
    }

    #[test]
    fn replace_before_affects_only_earlier_consumers() {
        let root = resolve(vec![
            invoke(|p: Dep<Port>| {
                let _ = &p;
                anyhow::Ok(())
            }), // consumer A (before)
            replace_before(Port(9)),
            invoke(|p: Dep<Port>| {
                let _ = &p;
                anyhow::Ok(())
            }), // consumer B (after)
            supply(Port(1)),
        ])
        .unwrap();
        let mut invoke_tags = Vec::new();
        fn visit(items: &[WItem], out: &mut Vec<Option<String>>) {
            for item in items {
                match item {
                    WItem::Invoke(inv) => {
                        out.push(inv.slots[0].tag.name().map(String::from));
                    }
                    WItem::Group(g) => visit(&g.items, out),
                    WItem::Scope(s) => visit(&s.items, out),
                    _ => {}
                }
            }
        }
        visit(&root.items, &mut invoke_tags);
        assert_eq!(invoke_tags[0].as_deref(), Some("#r0")); // A retargeted
        assert_eq!(invoke_tags[1], None); // B untouched
        // producer keeps its untagged export for B
        assert!(exports_of(&root).iter().any(|e| !e.contains("#r")));
    }

    #[test]
    fn replace_after_affects_only_later_consumers() {
        let root = resolve(vec![
            invoke(|p: Dep<Port>| {
                let _ = &p;
                anyhow::Ok(())
            }),
            replace_after(Port(9)),
            invoke(|p: Dep<Port>| {
                let _ = &p;
                anyhow::Ok(())
            }),
            supply(Port(1)),
        ])
        .unwrap();
        let mut invoke_tags = Vec::new();
        fn visit(items: &[WItem], out: &mut Vec<Option<String>>) {
            for item in items {
                match item {
                    WItem::Invoke(inv) => out.push(inv.slots[0].tag.name().map(String::from)),
                    WItem::Group(g) => visit(&g.items, out),
                    WItem::Scope(s) => visit(&s.items, out),
                    _ => {}
                }
            }
        }
        visit(&root.items, &mut invoke_tags);
        assert_eq!(invoke_tags[0], None);
        assert_eq!(invoke_tags[1].as_deref(), Some("#r0"));
    }

    #[test]
    fn specificity_prefers_named_over_type_only() {
        let root = resolve(vec![
            supply(Port(1)).named("x"),
            replace(Port(8)), // type-only: matches nothing named
            replace(Port(9)).named("x"),
            supply(Port(2)), // untagged, displaced by the type-only replace
        ])
        .unwrap();
        let exports = exports_of(&root);
        // both overrides land on their own slots
        assert!(exports.iter().any(|e| e.contains("x#r1")));
        assert!(exports.iter().any(|e| e.contains("#r0") && !e.contains("x#r")));
    }

    #[test]
    fn tied_overrides_later_wins_and_earlier_is_unmatched() {
        // both replaces target the same untagged slot; the later
        // declaration wins everywhere, leaving the earlier one with
        // nothing to displace
        let err = resolve(vec![
            supply(Port(1)),
            replace(Port(8)),
            replace(Port(9)),
            invoke(|p: Dep<Port>| {
                let _ = &p;
                anyhow::Ok(())
            }),
        ])
        .unwrap_err();
        assert!(matches!(err, CompileError::OverrideUnmatched { .. }));
    }

    #[test]
    fn unmatched_replace_is_an_error() {
        let err = resolve(vec![replace(Port(9)).named("ghost")]).unwrap_err();
        assert!(matches!(err, CompileError::OverrideUnmatched { .. }));
    }

    #[test]
    fn replace_in_module_does_not_escape_scope() {
        let root = resolve(vec![
            module("inner", vec![supply(Port(1)), replace(Port(9))]),
            supply(Port(2)),
        ])
        .unwrap();
        // the outer untagged Port survives
        let binds = all_binds(&root);
        let outer_untagged = binds
            .iter()
            .filter(|b| {
                b.exports
                    .iter()
                    .any(|e| e.tag_set == TagSet::untagged(TypeKey::of::<Port>()))
            })
            .count();
        assert_eq!(outer_untagged, 1);
    }

    #[test]
    fn parent_replace_reaches_child_module() {
        let root = resolve(vec![
            replace(Port(9)),
            module("inner", vec![supply(Port(1))]),
        ])
        .unwrap();
        let exports = exports_of(&root);
        assert!(exports.iter().all(|e| e.contains("#r0")));
    }

    #[test]
    fn fallback_applies_when_slot_unsatisfied() {
        let root = resolve(vec![
            fallback(Port(42)),
            invoke(|p: Dep<Port>| {
                let _ = &p;
                anyhow::Ok(())
            }),
        ])
        .unwrap();
        let exports = exports_of(&root);
        assert_eq!(exports.len(), 1);
        assert!(exports[0].contains("#r0"));
    }

    #[test]
    fn fallback_dropped_when_slot_satisfied() {
        let root = resolve(vec![supply(Port(1)), fallback(Port(42))]).unwrap();
        let binds = all_binds(&root);
        assert_eq!(binds.len(), 1);
        let out = (binds[0].invoke)(Vec::new()).unwrap();
        assert_eq!(out.extract::<Port>(), Some(Port(1)));
    }

    #[test]
    fn fallback_dropped_when_replace_satisfies_slot() {
        let root = resolve(vec![
            supply(Port(1)),
            replace(Port(9)),
            fallback(Port(42)),
        ])
        .unwrap();
        // only the replacement expansion remains
        let binds = all_binds(&root);
        assert_eq!(binds.len(), 1);
        let out = (binds[0].invoke)(Vec::new()).unwrap();
        assert_eq!(out.extract::<Port>(), Some(Port(9)));
    }

    #[test]
    fn auto_group_derived_export_stripped_by_group_replace() {
        use crate::node::auto_group;
        use std::sync::Arc as StdArc;

        trait Handler: Send + Sync {}
        #[derive(Clone)]
        struct H1;
        impl Handler for H1 {}
        type Contract = StdArc<dyn Handler>;

        #[derive(Clone)]
        struct H2;
        impl Handler for H2 {}

        let root = resolve(vec![
            auto_group::<Contract>("handlers"),
            supply(H1).implements(|h: &H1| StdArc::new(h.clone()) as Contract),
            replace(H2)
                .implements(|h: &H2| StdArc::new(h.clone()) as Contract)
                .for_type::<Contract>()
                .grouped("handlers"),
        ])
        .unwrap();
        let binds = all_binds(&root);
        // H1's auto-grouped export is displaced; its self export remains
        let h1 = binds
            .iter()
            .find(|b| b.result == TypeKey::of::<H1>())
            .unwrap();
        assert!(h1.exports.iter().all(|e| e.tag_set.tag.group().is_none()));
        // the replacement serves the suffixed group
        let replacement = binds
            .iter()
            .find(|b| b.result == TypeKey::of::<H2>())
            .unwrap();
        assert_eq!(
            replacement.exports[0].tag_set.tag.group(),
            Some("handlers#r0")
        );
    }
}
