//! Auto-group propagation
//!
//! Walks the scope tree top-down accumulating auto-group rules: a
//! scope's local rule set is its parent's set plus the rules declared
//! anywhere in the scope. Binds in the current scope are rewritten with
//! the local set; child scopes inherit it. Rules declared inside a
//! module never leak to siblings; a child rule with the same
//! `(contract, group)` key overrides the inherited filter/self-export
//! without removing the parent rule elsewhere.

use std::sync::Arc;

use tracing::debug;

use crate::key::TagSet;
use crate::lower::{child_scopes, walk_scope_items, WAutoGroupRule, WBind, WItem, WScope};
use crate::options::{ExportOrigin, ExportSpec};

pub(crate) fn run(root: &mut WScope) {
    apply(root, &[]);
}

fn apply(scope: &mut WScope, inherited: &[WAutoGroupRule]) {
    let mut local: Vec<WAutoGroupRule> = inherited.to_vec();
    walk_scope_items(&mut scope.items, &mut |item, _| {
        if let WItem::AutoGroup(rule) = item {
            match local
                .iter_mut()
                .find(|r| r.contract == rule.contract && r.group == rule.group)
            {
                Some(existing) => *existing = rule.clone(),
                None => local.push(rule.clone()),
            }
        }
    });

    if !local.is_empty() {
        walk_scope_items(&mut scope.items, &mut |item, _| {
            if let WItem::Bind(bind) = item {
                apply_rules(bind, &local);
            }
        });
    }

    child_scopes(&mut scope.items, &mut |child, _| apply(child, &local));
}

fn apply_rules(bind: &mut WBind, rules: &[WAutoGroupRule]) {
    if bind.auto_group_ignore {
        return;
    }
    for rule in rules {
        if bind
            .auto_group_ignore_types
            .iter()
            .any(|(c, g)| *c == rule.contract && *g == rule.group)
        {
            continue;
        }
        if let Some(filter) = &rule.filter {
            if !filter(bind.result) {
                continue;
            }
        }
        // the binding satisfies the contract if it produces it outright
        // or declares a cast for it
        let cast = if bind.result == rule.contract {
            None
        } else {
            match bind.cast_for(rule.contract) {
                Some(c) => Some(c.clone()),
                None => continue,
            }
        };
        let target = TagSet::grouped(rule.contract, Arc::clone(&rule.group));
        if bind.exports.iter().any(|e| e.tag_set == target) {
            continue;
        }
        debug!(binding = %bind.result, group = %rule.group, "auto-grouped export added");
        bind.exports.push(ExportSpec {
            tag_set: target,
            cast,
            origin: ExportOrigin::AutoGroup,
        });
        // a node with no explicit exports already carries its untagged
        // self export (the parser's default), keeping the concrete value
        // independently resolvable; export_self forces it even when
        // explicit exports pushed it out
        if rule.export_self {
            let self_ts = TagSet::untagged(bind.result);
            if !bind.exports.iter().any(|e| e.tag_set == self_ts) {
                bind.exports.push(ExportSpec {
                    tag_set: self_ts,
                    cast: None,
                    origin: ExportOrigin::SelfType,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TypeKey;
    use crate::lower::{lower, Counters};
    use crate::node::{auto_group, module, supply};
    use std::sync::Arc as StdArc;

    trait Handler: Send + Sync {
        fn name(&self) -> &'static str;
    }

    #[derive(Clone)]
    struct Alpha;
    impl Handler for Alpha {
        fn name(&self) -> &'static str {
            "alpha"
        }
    }

    #[derive(Clone)]
    struct Beta;
    impl Handler for Beta {
        fn name(&self) -> &'static str {
            "beta"
        }
    }

    type Contract = StdArc<dyn Handler>;

    fn grouped_exports(scope: &WScope) -> Vec<(TypeKey, String)> {
        let mut out = Vec::new();
        fn visit(items: &[WItem], out: &mut Vec<(TypeKey, String)>) {
            for item in items {
                match item {
                    WItem::Bind(b) => {
                        for e in &b.exports {
                            if let Some(g) = e.tag_set.tag.group() {
                                out.push((b.result, g.to_string()));
                            }
                        }
                    }
                    WItem::Group(g) => visit(&g.items, out),
                    WItem::Scope(s) => visit(&s.items, out),
                    _ => {}
                }
            }
        }
        visit(&scope.items, &mut out);
        out
    }

    fn compile(nodes: Vec<crate::node::Node>) -> WScope {
        let mut counters = Counters::default();
        let mut root = lower(&nodes, None, &mut counters).unwrap();
        run(&mut root);
        root
    }

    #[test]
    fn rule_groups_bindings_with_matching_cast() {
        let root = compile(vec![
            auto_group::<Contract>("handlers"),
            supply(Alpha).implements(|a: &Alpha| StdArc::new(a.clone()) as Contract),
            supply(Beta), // no cast declared, not grouped
        ]);
        let groups = grouped_exports(&root);
        assert_eq!(groups, vec![(TypeKey::of::<Alpha>(), "handlers".to_string())]);
    }

    #[test]
    fn rule_in_child_module_does_not_leak_to_parent() {
        let root = compile(vec![
            supply(Alpha).implements(|a: &Alpha| StdArc::new(a.clone()) as Contract),
            module(
                "child",
                vec![
                    auto_group::<Contract>("handlers"),
                    supply(Beta).implements(|b: &Beta| StdArc::new(b.clone()) as Contract),
                ],
            ),
        ]);
        let groups = grouped_exports(&root);
        assert_eq!(groups, vec![(TypeKey::of::<Beta>(), "handlers".to_string())]);
    }

    #[test]
    fn parent_rule_visible_inside_child_module() {
        let root = compile(vec![
            auto_group::<Contract>("handlers"),
            module(
                "child",
                vec![supply(Alpha).implements(|a: &Alpha| StdArc::new(a.clone()) as Contract)],
            ),
        ]);
        let groups = grouped_exports(&root);
        assert_eq!(groups, vec![(TypeKey::of::<Alpha>(), "handlers".to_string())]);
    }

    #[test]
    fn same_key_child_rule_overrides_filter() {
        // parent rule filters everything out; child re-declares the same
        // (contract, group) with no filter, so the child binding groups
        let root = compile(vec![
            auto_group::<Contract>("handlers").filter(|_| false),
            supply(Alpha).implements(|a: &Alpha| StdArc::new(a.clone()) as Contract),
            module(
                "child",
                vec![
                    auto_group::<Contract>("handlers"),
                    supply(Beta).implements(|b: &Beta| StdArc::new(b.clone()) as Contract),
                ],
            ),
        ]);
        let groups = grouped_exports(&root);
        assert_eq!(groups, vec![(TypeKey::of::<Beta>(), "handlers".to_string())]);
    }

    #[test]
    fn per_node_opt_outs_respected() {
        let root = compile(vec![
            auto_group::<Contract>("handlers"),
            supply(Alpha)
                .implements(|a: &Alpha| StdArc::new(a.clone()) as Contract)
                .auto_group_ignore(),
            supply(Beta)
                .implements(|b: &Beta| StdArc::new(b.clone()) as Contract)
                .auto_group_ignore_type::<Contract>("handlers"),
        ]);
        assert!(grouped_exports(&root).is_empty());
    }

    #[test]
    fn untagged_self_export_survives_grouping() {
        let root = compile(vec![
            auto_group::<Contract>("handlers"),
            supply(Alpha).implements(|a: &Alpha| StdArc::new(a.clone()) as Contract),
        ]);
        let mut self_exports = 0;
        walk_all(&root, &mut |b: &WBind| {
            if b.exports
                .iter()
                .any(|e| e.tag_set == TagSet::untagged(b.result))
            {
                self_exports += 1;
            }
        });
        assert_eq!(self_exports, 1);
    }

    fn walk_all(scope: &WScope, f: &mut impl FnMut(&WBind)) {
        fn visit(items: &[WItem], f: &mut impl FnMut(&WBind)) {
            for item in items {
                match item {
                    WItem::Bind(b) => f(b),
                    WItem::Group(g) => visit(&g.items, f),
                    WItem::Scope(s) => visit(&s.items, f),
                    _ => {}
                }
            }
        }
        visit(&scope.items, f);
    }

    #[test]
    fn explicit_export_not_duplicated() {
        let root = compile(vec![
            auto_group::<Contract>("handlers"),
            supply(Alpha)
                .export_as(|a: &Alpha| StdArc::new(a.clone()) as Contract)
                .grouped("handlers"),
        ]);
        let groups = grouped_exports(&root);
        assert_eq!(groups.len(), 1);
    }
}
