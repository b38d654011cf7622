//! Priority and order metadata
//!
//! Groups preserve declaration order. When any binding in the tree
//! declares an explicit [`Priority`], every bind node receives a
//! monotonic order index, and each group containing a prioritized
//! member gets a synthesized group-level decorator that stable-sorts
//! the group by `(priority, order index)`: prioritized entries move to
//! their requested relative position, unprioritized entries keep
//! insertion order among themselves.

use std::sync::Arc;

use crate::lower::{Counters, WItem, WScope};
use crate::value::{ResolvedArg, Value};

/// Explicit ordering rank for a binding within its groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Earliest,
    Earlier,
    Normal,
    Later,
    Latest,
    /// Author-supplied rank; `Normal` is 0, lower sorts first.
    Custom(i32),
}

impl Priority {
    pub fn rank(&self) -> i32 {
        match self {
            Priority::Earliest => -200,
            Priority::Earlier => -100,
            Priority::Normal => 0,
            Priority::Later => 100,
            Priority::Latest => 200,
            Priority::Custom(n) => *n,
        }
    }
}

/// Assign monotonic order indices once any binding declares an explicit
/// priority. Indices follow traversal order; a binding that already
/// carries one (from a prior pass) keeps it. Returns whether any
/// priority was declared.
pub(crate) fn assign_order(root: &mut WScope, counters: &mut Counters) -> bool {
    fn any_priority(items: &[WItem]) -> bool {
        items.iter().any(|item| match item {
            WItem::Bind(b) => b.priority.is_some(),
            WItem::Group(g) => any_priority(&g.items),
            WItem::Scope(s) => any_priority(&s.items),
            _ => false,
        })
    }
    fn assign(items: &mut [WItem], counters: &mut Counters) {
        for item in items {
            match item {
                WItem::Bind(b) => {
                    if b.order.is_none() {
                        b.order = Some(counters.next_order());
                    }
                }
                WItem::Group(g) => assign(&mut g.items, counters),
                WItem::Scope(s) => assign(&mut s.items, counters),
                _ => {}
            }
        }
    }
    let has_priority = any_priority(&root.items);
    if has_priority {
        assign(&mut root.items, counters);
    }
    has_priority
}

/// Synthesize the sort transform for one group.
///
/// `ranks` is aligned with the group's collection order at resolution
/// time (the runtime collects members in declaration order): one
/// `(priority rank, order index)` pair per member.
pub(crate) fn group_sort_fn(
    ranks: Vec<(i32, u64)>,
) -> Arc<dyn Fn(Vec<Value>) -> anyhow::Result<ResolvedArg> + Send + Sync> {
    Arc::new(move |values: Vec<Value>| {
        if values.len() != ranks.len() {
            anyhow::bail!(
                "group size changed between compile and resolve: expected {}, got {}",
                ranks.len(),
                values.len()
            );
        }
        let mut indexed: Vec<usize> = (0..values.len()).collect();
        indexed.sort_by_key(|&i| ranks[i]);
        let mut slots: Vec<Option<Value>> = values.into_iter().map(Some).collect();
        Ok(ResolvedArg::Many(
            indexed
                .into_iter()
                .map(|i| slots[i].take().expect("index permutation is a bijection"))
                .collect(),
        ))
    })
}
