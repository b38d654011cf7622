//! Plan rendering
//!
//! A human-readable indented tree of the resolved graph: module names,
//! resolved tag sets per binding, skipped conditional branches,
//! replacement expansions. A debugging surface, not a machine format.

use std::fmt::Write as _;

use crate::lower::{WItem, WScope};
use crate::node::BindKind;

pub(crate) fn render(root: &WScope) -> String {
    let mut out = String::new();
    render_items(&root.items, 0, &mut out);
    out
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("  ");
    }
}

fn render_items(items: &[WItem], level: usize, out: &mut String) {
    for item in items {
        match item {
            WItem::Scope(scope) => {
                indent(out, level);
                match &scope.name {
                    Some(name) => {
                        let _ = writeln!(out, "module {name}");
                    }
                    None => {
                        let _ = writeln!(out, "module");
                    }
                }
                render_items(&scope.items, level + 1, out);
            }
            WItem::Group(group) => match &group.label {
                Some(label) => {
                    indent(out, level);
                    let _ = writeln!(out, "{label}");
                    render_items(&group.items, level + 1, out);
                }
                None => render_items(&group.items, level, out),
            },
            WItem::Bind(bind) => {
                indent(out, level);
                let verb = match bind.kind {
                    BindKind::Constructor => "provide",
                    BindKind::Value => "supply",
                };
                let tags: Vec<String> = bind
                    .exports
                    .iter()
                    .map(|e| e.tag_set.to_string())
                    .collect();
                let _ = write!(out, "{verb} {} [{}]", bind.result, tags.join(", "));
                if bind.private {
                    out.push_str(" (private)");
                }
                if let Some(priority) = bind.priority {
                    let _ = write!(out, " priority={}", priority.rank());
                }
                out.push('\n');
            }
            WItem::Decorate(dec) => {
                indent(out, level);
                let _ = writeln!(out, "decorate {}", describe_selector(dec));
            }
            WItem::AutoGroup(rule) => {
                indent(out, level);
                let _ = writeln!(out, "auto_group {} -> group \"{}\"", rule.contract, rule.group);
            }
            WItem::AutoInject => {
                indent(out, level);
                out.push_str("auto_inject\n");
            }
            WItem::Invoke(_) => {
                indent(out, level);
                out.push_str("invoke\n");
            }
            WItem::Populate(pop) => {
                indent(out, level);
                let _ = writeln!(out, "populate {}", pop.slot);
            }
            WItem::OnStop(_) => {
                indent(out, level);
                out.push_str("on_stop\n");
            }
            WItem::Skipped(label) => {
                indent(out, level);
                let _ = writeln!(out, "{label} (skipped)");
            }
            WItem::Override(_) | WItem::Pending(_) => {
                // overrides are consumed before rendering; nothing to show
            }
        }
    }
}

fn describe_selector(dec: &crate::lower::WDecorate) -> String {
    use crate::lower::WDecorateForm;
    let key = match &dec.form {
        WDecorateForm::Element { slots, .. } => slots[0].key,
        WDecorateForm::Collection { element, .. } => *element,
    };
    if let Some(name) = &dec.selector.name {
        format!("{key}[name=\"{name}\"]")
    } else if let Some(group) = &dec.selector.group {
        format!("{key}[group=\"{group}\"]")
    } else {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::lower::{lower, Counters};
    use crate::node::{module, supply, when};

    #[derive(Clone)]
    struct Port(u16);

    #[test]
    fn renders_modules_bindings_and_skipped_branches() {
        let nodes = vec![
            supply(Port(1)).named("main"),
            module("net", vec![supply(Port(2))]),
            when(false, vec![supply(Port(3))]),
        ];
        let mut counters = Counters::default();
        let root = lower(&nodes, None, &mut counters).unwrap();
        let plan = super::render(&root);
        assert!(plan.contains("supply Port [Port[name=\"main\"]]"));
        assert!(plan.contains("module net"));
        assert!(plan.contains("  supply Port [Port]"));
        assert!(plan.contains("when (skipped)"));
    }
}
