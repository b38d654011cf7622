//! Auto-inject propagation
//!
//! When a scope enables field injection, every eligible bind node whose
//! result descriptor declares injectable fields gets a synthesized
//! wrapper: the original parameter slots plus one synthetic slot per
//! field. After the original constructor returns, each resolved
//! synthetic argument is written through the field's setter before the
//! value is published. Bindings without fields (or opted out) pass
//! through untouched.

use std::sync::Arc;

use tracing::debug;

use crate::lower::{child_scopes, walk_scope_items, WBind, WItem, WScope};
use crate::value::ResolvedArg;

pub(crate) fn run(root: &mut WScope) {
    apply(root, false);
}

fn apply(scope: &mut WScope, inherited: bool) {
    let mut enabled = inherited;
    walk_scope_items(&mut scope.items, &mut |item, _| {
        if matches!(item, WItem::AutoInject) {
            enabled = true;
        }
    });

    if enabled {
        walk_scope_items(&mut scope.items, &mut |item, _| {
            if let WItem::Bind(bind) = item {
                wrap(bind);
            }
        });
    }

    child_scopes(&mut scope.items, &mut |child, _| apply(child, enabled));
}

fn wrap(bind: &mut WBind) {
    if bind.auto_inject_ignore || bind.fields.is_empty() {
        return;
    }
    let original_arity = bind.slots.len();
    let fields = std::mem::take(&mut bind.fields);
    for field in &fields {
        bind.slots.push(field.slot.clone());
    }
    debug!(
        binding = %bind.result,
        fields = fields.len(),
        "field-injection wrapper synthesized"
    );
    let original = Arc::clone(&bind.invoke);
    bind.invoke = Arc::new(move |mut args: Vec<ResolvedArg>| {
        let injected = args.split_off(original_arity.min(args.len()));
        let mut value = original(args)?;
        for (field, arg) in fields.iter().zip(injected) {
            if matches!(arg, ResolvedArg::Missing) {
                continue;
            }
            value = (field.set)(value, arg)?;
        }
        Ok(value)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::{lower, Counters};
    use crate::node::{auto_inject, module, provide, supply};
    use crate::value::{field, Value};

    #[derive(Clone, Debug, PartialEq)]
    struct Logger(&'static str);

    #[derive(Clone)]
    struct Server {
        logger: Option<Logger>,
    }

    fn lowered(nodes: Vec<crate::node::Node>) -> WScope {
        let mut counters = Counters::default();
        let mut root = lower(&nodes, None, &mut counters).unwrap();
        run(&mut root);
        root
    }

    fn first_bind(scope: &WScope) -> &WBind {
        fn find<'a>(items: &'a [WItem]) -> Option<&'a WBind> {
            for item in items {
                match item {
                    WItem::Bind(b) => return Some(b),
                    WItem::Group(g) => {
                        if let Some(b) = find(&g.items) {
                            return Some(b);
                        }
                    }
                    WItem::Scope(s) => {
                        if let Some(b) = find(&s.items) {
                            return Some(b);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        find(&scope.items).unwrap()
    }

    #[test]
    fn wrapper_adds_field_slots_and_injects() {
        let root = lowered(vec![
            auto_inject(),
            provide(|| anyhow::Ok(Server { logger: None }))
                .inject(field("logger", |s: &mut Server, l: Logger| s.logger = Some(l))),
        ]);
        let bind = first_bind(&root);
        assert_eq!(bind.slots.len(), 1);
        let out = (bind.invoke)(vec![ResolvedArg::One(Value::new(Logger("txt")))]).unwrap();
        assert_eq!(
            out.extract::<Server>().unwrap().logger,
            Some(Logger("txt"))
        );
    }

    #[test]
    fn no_fields_is_a_no_op() {
        let root = lowered(vec![auto_inject(), supply(Logger("plain"))]);
        let bind = first_bind(&root);
        assert!(bind.slots.is_empty());
        let out = (bind.invoke)(Vec::new()).unwrap();
        assert_eq!(out.extract::<Logger>(), Some(Logger("plain")));
    }

    #[test]
    fn opt_out_suppresses_wrapping() {
        let root = lowered(vec![
            auto_inject(),
            provide(|| anyhow::Ok(Server { logger: None }))
                .inject(field("logger", |s: &mut Server, l: Logger| s.logger = Some(l)))
                .auto_inject_ignore(),
        ]);
        let bind = first_bind(&root);
        assert!(bind.slots.is_empty());
    }

    #[test]
    fn disabled_scope_leaves_fields_alone() {
        let root = lowered(vec![provide(|| anyhow::Ok(Server { logger: None }))
            .inject(field("logger", |s: &mut Server, l: Logger| s.logger = Some(l)))]);
        let bind = first_bind(&root);
        assert!(bind.slots.is_empty());
        assert_eq!(bind.fields.len(), 1);
    }

    #[test]
    fn toggle_in_parent_reaches_child_module() {
        let root = lowered(vec![
            auto_inject(),
            module(
                "child",
                vec![provide(|| anyhow::Ok(Server { logger: None }))
                    .inject(field("logger", |s: &mut Server, l: Logger| s.logger = Some(l)))],
            ),
        ]);
        let bind = first_bind(&root);
        assert_eq!(bind.slots.len(), 1);
    }

    #[test]
    fn toggle_in_child_does_not_leak_to_parent() {
        let root = lowered(vec![
            provide(|| anyhow::Ok(Server { logger: None }))
                .inject(field("logger", |s: &mut Server, l: Logger| s.logger = Some(l))),
            module("child", vec![auto_inject()]),
        ]);
        let bind = first_bind(&root);
        assert!(bind.slots.is_empty());
    }

    #[test]
    fn missing_optional_field_skips_setter() {
        let root = lowered(vec![
            auto_inject(),
            provide(|| anyhow::Ok(Server { logger: None })).inject(
                field("logger", |s: &mut Server, l: Logger| s.logger = Some(l)).optional(),
            ),
        ]);
        let bind = first_bind(&root);
        assert!(bind.slots[0].optional);
        let out = (bind.invoke)(vec![ResolvedArg::Missing]).unwrap();
        assert_eq!(out.extract::<Server>().unwrap().logger, None);
    }
}
