//! Decorator collection and composition
//!
//! Decorate declarations are drained from the resolved tree in
//! declaration order and bucketed by target tag set. Runs of
//! element-level decorators in a bucket compose into one wrapper that
//! takes the target plus the deduplicated union of every decorator's
//! extra dependencies, invokes each in order, threads the value
//! through, and short-circuits on the first failure. Collection-level
//! transforms keep their place in the chain. Groups containing a
//! prioritized member get a synthesized sort transform appended last.

use std::sync::Arc;

use tracing::debug;

use crate::error::{CompileError, Site};
use crate::instruction::{DecorateInstr, DecorateStep};
use crate::key::{Tag, TagSet};
use crate::lower::{WDecorate, WDecorateForm, WItem, WScope};
use crate::order::group_sort_fn;
use crate::value::{InvokeFn, ResolvedArg, Slot};

pub(crate) fn run(
    root: &mut WScope,
    has_priority: bool,
) -> Result<Vec<DecorateInstr>, CompileError> {
    let mut decorators: Vec<WDecorate> = Vec::new();
    drain(&mut root.items, &mut decorators);

    struct Bucket {
        target: TagSet,
        steps: Vec<DecorateStep>,
        site: Site,
    }
    let mut buckets: Vec<Bucket> = Vec::new();
    for dec in decorators {
        let (target, step) = bucket_entry(dec)?;
        match buckets.iter_mut().find(|b| b.target == target) {
            Some(bucket) => bucket.steps.push(step.1),
            None => buckets.push(Bucket {
                target,
                steps: vec![step.1],
                site: step.0,
            }),
        }
    }

    // synthesized group sort: every group with a prioritized member
    if has_priority {
        for (target, ranks, site) in prioritized_groups(root) {
            debug!(group = %target, members = ranks.len(), "group sort decorator synthesized");
            let sort = group_sort_fn(ranks);
            let transform: crate::value::CollectionFn = Arc::new(move |values| {
                match sort(values)? {
                    ResolvedArg::Many(vs) => Ok(vs),
                    _ => anyhow::bail!("group sort produced a non-collection"),
                }
            });
            let step = DecorateStep::Collection { transform };
            match buckets.iter_mut().find(|b| b.target == target) {
                Some(bucket) => bucket.steps.push(step),
                None => buckets.push(Bucket {
                    target,
                    steps: vec![step],
                    site,
                }),
            }
        }
    }

    Ok(buckets
        .into_iter()
        .map(|bucket| DecorateInstr {
            target: bucket.target,
            steps: compose(bucket.steps),
            site: bucket.site,
        })
        .collect())
}

fn drain(items: &mut Vec<WItem>, out: &mut Vec<WDecorate>) {
    let mut index = 0;
    while index < items.len() {
        match &mut items[index] {
            WItem::Decorate(_) => {
                if let WItem::Decorate(dec) =
                    std::mem::replace(&mut items[index], WItem::Skipped(String::new()))
                {
                    out.push(dec);
                }
                items.remove(index);
            }
            WItem::Group(group) => {
                drain(&mut group.items, out);
                index += 1;
            }
            WItem::Scope(scope) => {
                drain(&mut scope.items, out);
                index += 1;
            }
            _ => index += 1,
        }
    }
}

type Entry = (Site, DecorateStep);

fn bucket_entry(dec: WDecorate) -> Result<(TagSet, Entry), CompileError> {
    match dec.form {
        WDecorateForm::Element {
            invoke,
            slots,
            result: _,
        } => {
            let key = slots[0].key;
            let tag = if let Some(name) = &dec.selector.name {
                Tag::Name(Arc::clone(name))
            } else if let Some(group) = &dec.selector.group {
                Tag::Group(Arc::clone(group))
            } else {
                Tag::None
            };
            let extras = slots[1..].to_vec();
            Ok((
                TagSet { key, tag },
                (dec.site, DecorateStep::Element { invoke, extras }),
            ))
        }
        WDecorateForm::Collection { element, transform } => {
            let group = dec
                .selector
                .group
                .ok_or(CompileError::CollectionWithoutGroup {
                    index: 0,
                    site: dec.site,
                })?;
            Ok((
                TagSet::grouped(element, group),
                (dec.site, DecorateStep::Collection { transform }),
            ))
        }
    }
}

/// Merge every run of consecutive element steps into one composite.
fn compose(steps: Vec<DecorateStep>) -> Vec<DecorateStep> {
    let mut out: Vec<DecorateStep> = Vec::with_capacity(steps.len());
    let mut run: Vec<(InvokeFn, Vec<Slot>)> = Vec::new();
    for step in steps {
        match step {
            DecorateStep::Element { invoke, extras } => run.push((invoke, extras)),
            DecorateStep::Collection { transform } => {
                flush_run(&mut run, &mut out);
                out.push(DecorateStep::Collection { transform });
            }
        }
    }
    flush_run(&mut run, &mut out);
    out
}

fn flush_run(run: &mut Vec<(InvokeFn, Vec<Slot>)>, out: &mut Vec<DecorateStep>) {
    if run.len() == 1 {
        if let Some((invoke, extras)) = run.pop() {
            out.push(DecorateStep::Element { invoke, extras });
        }
    } else if !run.is_empty() {
        out.push(composite(std::mem::take(run)));
    }
}

/// One wrapper for a multi-decorator run: the deduplicated union of
/// extra dependencies, invoked in declaration order, threading the
/// value, short-circuiting on the first failure.
fn composite(parts: Vec<(InvokeFn, Vec<Slot>)>) -> DecorateStep {
    let mut extras: Vec<Slot> = Vec::new();
    let mut wired: Vec<(InvokeFn, Vec<usize>)> = Vec::with_capacity(parts.len());
    for (invoke, part_extras) in parts {
        let map = part_extras
            .into_iter()
            .map(|slot| match extras.iter().position(|s| *s == slot) {
                Some(found) => found,
                None => {
                    extras.push(slot);
                    extras.len() - 1
                }
            })
            .collect();
        wired.push((invoke, map));
    }
    let invoke: InvokeFn = Arc::new(move |args: Vec<ResolvedArg>| {
        let mut current = args
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("composite decorator called without a target"))?;
        for (part, map) in &wired {
            let mut part_args = Vec::with_capacity(1 + map.len());
            part_args.push(current);
            for &index in map {
                part_args.push(args.get(index + 1).cloned().unwrap_or(ResolvedArg::Missing));
            }
            current = ResolvedArg::One(part(part_args)?);
        }
        match current {
            ResolvedArg::One(value) => Ok(value),
            _ => anyhow::bail!("composite decorator lost its value"),
        }
    });
    DecorateStep::Element { invoke, extras }
}

/// Groups whose members include an explicit priority, with `(rank,
/// order)` pairs aligned to collection order.
fn prioritized_groups(root: &WScope) -> Vec<(TagSet, Vec<(i32, u64)>, Site)> {
    struct GroupInfo {
        target: TagSet,
        ranks: Vec<(i32, u64)>,
        any_priority: bool,
        site: Site,
    }
    fn visit(items: &[WItem], groups: &mut Vec<GroupInfo>) {
        for item in items {
            match item {
                WItem::Bind(bind) => {
                    for export in &bind.exports {
                        if !export.tag_set.is_grouped() {
                            continue;
                        }
                        let rank = bind.priority.map(|p| p.rank()).unwrap_or(0);
                        let order = bind.order.unwrap_or(bind.id);
                        match groups.iter_mut().find(|g| g.target == export.tag_set) {
                            Some(info) => {
                                info.ranks.push((rank, order));
                                info.any_priority |= bind.priority.is_some();
                            }
                            None => groups.push(GroupInfo {
                                target: export.tag_set.clone(),
                                ranks: vec![(rank, order)],
                                any_priority: bind.priority.is_some(),
                                site: bind.site,
                            }),
                        }
                    }
                }
                WItem::Group(g) => visit(&g.items, groups),
                WItem::Scope(s) => visit(&s.items, groups),
                _ => {}
            }
        }
    }
    let mut groups = Vec::new();
    visit(&root.items, &mut groups);
    groups
        .into_iter()
        .filter(|g| g.any_priority)
        .map(|g| (g.target, g.ranks, g.site))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::{lower, Counters};
    use crate::node::{decorate, decorate_group, supply, Node};
    use crate::value::{Dep, Value};

    #[derive(Clone, Debug, PartialEq)]
    struct Greeting(String);

    fn compile(nodes: Vec<Node>) -> Vec<DecorateInstr> {
        let mut counters = Counters::default();
        let mut root = lower(&nodes, None, &mut counters).unwrap();
        run(&mut root, false).unwrap()
    }

    #[test]
    fn single_decorator_emitted_directly() {
        let instrs = compile(vec![
            supply(Greeting("hi".into())),
            decorate(|g: Dep<Greeting>| anyhow::Ok(Greeting(format!("<{}>", g.0 .0)))),
        ]);
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].steps.len(), 1);
        match &instrs[0].steps[0] {
            DecorateStep::Element { invoke, extras } => {
                assert!(extras.is_empty());
                let out = invoke(vec![ResolvedArg::One(Value::new(Greeting("x".into())))])
                    .unwrap();
                assert_eq!(out.extract::<Greeting>().unwrap().0, "<x>");
            }
            _ => panic!("expected element step"),
        }
    }

    #[test]
    fn chain_applies_in_declaration_order() {
        let instrs = compile(vec![
            decorate(|g: Dep<Greeting>| anyhow::Ok(Greeting(format!("{}-d1", g.0 .0)))),
            decorate(|g: Dep<Greeting>| anyhow::Ok(Greeting(format!("{}-d2", g.0 .0)))),
        ]);
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].steps.len(), 1); // composed
        match &instrs[0].steps[0] {
            DecorateStep::Element { invoke, .. } => {
                let out = invoke(vec![ResolvedArg::One(Value::new(Greeting("x".into())))])
                    .unwrap();
                // D2(D1(x))
                assert_eq!(out.extract::<Greeting>().unwrap().0, "x-d1-d2");
            }
            _ => panic!("expected element step"),
        }
    }

    #[test]
    fn chain_short_circuits_on_failure() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;
        let second_ran = StdArc::new(AtomicBool::new(false));
        let flag = StdArc::clone(&second_ran);
        let instrs = compile(vec![
            decorate(|_g: Dep<Greeting>| -> anyhow::Result<Greeting> {
                anyhow::bail!("d1 failed")
            }),
            decorate(move |g: Dep<Greeting>| {
                flag.store(true, Ordering::SeqCst);
                anyhow::Ok(g.into_inner())
            }),
        ]);
        match &instrs[0].steps[0] {
            DecorateStep::Element { invoke, .. } => {
                let err = invoke(vec![ResolvedArg::One(Value::new(Greeting("x".into())))])
                    .unwrap_err();
                assert!(err.to_string().contains("d1 failed"));
                assert!(!second_ran.load(Ordering::SeqCst));
            }
            _ => panic!("expected element step"),
        }
    }

    #[test]
    fn shared_extra_dependency_deduplicated() {
        #[derive(Clone)]
        struct Prefix(String);
        let instrs = compile(vec![
            decorate(|g: Dep<Greeting>, p: Dep<Prefix>| {
                anyhow::Ok(Greeting(format!("{}{}", p.0 .0, g.0 .0)))
            }),
            decorate(|g: Dep<Greeting>, p: Dep<Prefix>| {
                anyhow::Ok(Greeting(format!("{}|{}", g.0 .0, p.0 .0)))
            }),
        ]);
        match &instrs[0].steps[0] {
            DecorateStep::Element { invoke, extras } => {
                // both decorators request (Prefix, untagged): one slot
                assert_eq!(extras.len(), 1);
                let out = invoke(vec![
                    ResolvedArg::One(Value::new(Greeting("x".into()))),
                    ResolvedArg::One(Value::new(Prefix("p:".into()))),
                ])
                .unwrap();
                assert_eq!(out.extract::<Greeting>().unwrap().0, "p:x|p:");
            }
            _ => panic!("expected element step"),
        }
    }

    #[test]
    fn named_targets_bucket_separately() {
        let instrs = compile(vec![
            decorate(|g: Dep<Greeting>| anyhow::Ok(g.into_inner())).target_named("a"),
            decorate(|g: Dep<Greeting>| anyhow::Ok(g.into_inner())).target_named("b"),
        ]);
        assert_eq!(instrs.len(), 2);
        assert_ne!(instrs[0].target, instrs[1].target);
    }

    #[test]
    fn collection_transform_keeps_chain_position() {
        let instrs = compile(vec![
            decorate(|g: Dep<Greeting>| anyhow::Ok(Greeting(format!("e:{}", g.0 .0))))
                .grouped("gs"),
            decorate_group::<Greeting>("gs", |mut gs| {
                gs.reverse();
                Ok(gs)
            }),
        ]);
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].steps.len(), 2);
        assert!(matches!(instrs[0].steps[0], DecorateStep::Element { .. }));
        assert!(matches!(
            instrs[0].steps[1],
            DecorateStep::Collection { .. }
        ));
    }
}
