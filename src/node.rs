//! Declarative node tree
//!
//! The authoring surface of the crate: a closed set of node variants,
//! built with free constructors (`provide`, `supply`, `module`, ...) and
//! shaped with fluent methods (`named`, `grouped`, `export_as`, ...).
//! Nothing here executes; the tree is handed to [`crate::App::build`]
//! which compiles it into flat binding instructions.
//!
//! Every constructor and option captures its call site with
//! `#[track_caller]`, so compile errors point at the declaration that
//! caused them. Applying an option to a node kind that cannot carry it
//! poisons the node; the poison surfaces as a compile error instead of
//! being silently ignored.

use std::panic::Location;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use serde_json::Value as Json;

use crate::error::Site;
use crate::intern::intern;
use crate::key::{TagSelector, TypeKey};
use crate::options::BindOpt;
use crate::order::Priority;
use crate::value::{
    Callable, CollectionFn, ContractCast, FieldSlot, IntoCallable, ResolvedArg, SinkFn, Slot,
    Value,
};

// ============================================================================
// NODE VARIANTS
// ============================================================================

/// A declaration in the dependency tree.
pub struct Node {
    pub(crate) kind: NodeKind,
}

pub(crate) enum NodeKind {
    Bind(BindNode),
    Module(ModuleNode),
    Options(Vec<Node>),
    When(WhenNode),
    Switch(SwitchNode),
    Override(OverrideNode),
    Decorate(DecorateNode),
    AutoGroup(AutoGroupNode),
    AutoInject(Site),
    Invoke(InvokeNode),
    Populate(PopulateNode),
    OnStop(HookNode),
    /// An option was applied to a node kind that cannot carry it.
    Invalid(PoisonedNode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BindKind {
    Constructor,
    Value,
}

pub(crate) struct BindNode {
    pub kind: BindKind,
    pub callable: Callable,
    pub opts: Vec<BindOpt>,
    pub casts: Vec<ContractCast>,
    pub fields: Vec<FieldSlot>,
    pub site: Site,
}

pub(crate) struct ModuleNode {
    pub name: Arc<str>,
    pub children: Vec<Node>,
    pub site: Site,
}

pub(crate) enum Condition {
    Bool(bool),
    Pred(Callable),
}

pub(crate) struct WhenNode {
    pub cond: Condition,
    pub children: Vec<Node>,
    /// Evaluated once per node, shared across rebuilds.
    pub memo: Arc<OnceCell<bool>>,
    pub site: Site,
}

pub(crate) struct SwitchNode {
    pub selector: Callable,
    pub cases: Vec<CaseArm>,
    /// Index of the selected arm, `None` when nothing matched.
    pub memo: Arc<OnceCell<Option<usize>>>,
    pub site: Site,
}

pub(crate) struct CaseArm {
    /// `None` is the default arm.
    pub label: Option<String>,
    pub children: Vec<Node>,
}

/// One arm of a [`switch`] declaration.
pub struct Case(pub(crate) CaseArm);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OverrideMode {
    All,
    Before,
    After,
}

pub(crate) struct OverrideNode {
    pub bind: BindNode,
    pub mode: OverrideMode,
    pub is_fallback: bool,
    pub selector: TagSelector,
    pub site: Site,
}

pub(crate) enum DecorateForm {
    /// Transforms one value (or, against a grouped target, each element).
    Element(Callable),
    /// Transforms a whole resolved collection.
    Collection {
        element: TypeKey,
        transform: CollectionFn,
    },
}

pub(crate) struct DecorateNode {
    pub form: DecorateForm,
    pub selector: TagSelector,
    pub site: Site,
}

pub(crate) type GroupFilter = Arc<dyn Fn(TypeKey) -> bool + Send + Sync>;

pub(crate) struct AutoGroupNode {
    pub contract: TypeKey,
    pub group: Arc<str>,
    pub filter: Option<GroupFilter>,
    pub export_self: bool,
    pub site: Site,
}

pub(crate) struct InvokeNode {
    pub callable: Callable,
    pub tags: Option<Vec<String>>,
    pub site: Site,
}

pub(crate) struct PopulateNode {
    pub slot: Slot,
    pub sink: SinkFn,
    pub site: Site,
}

pub(crate) struct HookNode {
    pub callable: Callable,
    pub tags: Option<Vec<String>>,
    pub site: Site,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PoisonedNode {
    pub option: &'static str,
    pub node: &'static str,
    pub site: Site,
}

impl NodeKind {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Bind(b) => match b.kind {
                BindKind::Constructor => "provide",
                BindKind::Value => "supply",
            },
            NodeKind::Module(_) => "module",
            NodeKind::Options(_) => "options",
            NodeKind::When(_) => "when",
            NodeKind::Switch(_) => "switch",
            NodeKind::Override(o) => {
                if o.is_fallback {
                    "fallback"
                } else {
                    "replace"
                }
            }
            NodeKind::Decorate(_) => "decorate",
            NodeKind::AutoGroup(_) => "auto_group",
            NodeKind::AutoInject(_) => "auto_inject",
            NodeKind::Invoke(_) => "invoke",
            NodeKind::Populate(_) => "populate",
            NodeKind::OnStop(_) => "on_stop",
            NodeKind::Invalid(_) => "invalid",
        }
    }
}

// ============================================================================
// CONSTRUCTORS
// ============================================================================

/// Bind a constructor. Its parameters are extractor wrappers
/// ([`crate::Dep`], [`crate::All`], [`crate::Opt`]); it returns
/// `anyhow::Result` of the produced value.
#[track_caller]
pub fn provide<Args>(ctor: impl IntoCallable<Args>) -> Node {
    Node {
        kind: NodeKind::Bind(BindNode {
            kind: BindKind::Constructor,
            callable: ctor.into_callable(),
            opts: Vec::new(),
            casts: Vec::new(),
            fields: Vec::new(),
            site: Location::caller(),
        }),
    }
}

/// Bind a literal value. Same option shape as [`provide`], no dependency
/// resolution.
#[track_caller]
pub fn supply<T: Clone + Send + Sync + 'static>(value: T) -> Node {
    Node {
        kind: NodeKind::Bind(value_bind(value, Location::caller())),
    }
}

fn value_bind<T: Clone + Send + Sync + 'static>(value: T, site: Site) -> BindNode {
    BindNode {
        kind: BindKind::Value,
        callable: Callable {
            params: Vec::new(),
            result: TypeKey::of::<T>(),
            invoke: Arc::new(move |_| Ok(Value::new(value.clone()))),
        },
        opts: Vec::new(),
        casts: Vec::new(),
        fields: Vec::new(),
        site,
    }
}

/// Group declarations under a named module. Modules introduce a scope
/// boundary: auto-group/auto-inject rules and override depth are scoped
/// to the module subtree.
#[track_caller]
pub fn module(name: &str, children: Vec<Node>) -> Node {
    Node {
        kind: NodeKind::Module(ModuleNode {
            name: intern(name),
            children,
            site: Location::caller(),
        }),
    }
}

/// Group declarations without introducing a scope boundary.
#[track_caller]
pub fn options(children: Vec<Node>) -> Node {
    Node {
        kind: NodeKind::Options(children),
    }
}

/// Include children only when the condition holds.
#[track_caller]
pub fn when(cond: bool, children: Vec<Node>) -> Node {
    Node {
        kind: NodeKind::When(WhenNode {
            cond: Condition::Bool(cond),
            children,
            memo: Arc::new(OnceCell::new()),
            site: Location::caller(),
        }),
    }
}

/// Include children only when the predicate returns true. Predicate
/// parameters are resolved through the registered config resolver;
/// evaluation happens once and is memoized.
#[track_caller]
pub fn when_fn<Args>(pred: impl IntoCallable<Args>, children: Vec<Node>) -> Node {
    Node {
        kind: NodeKind::When(WhenNode {
            cond: Condition::Pred(pred.into_callable()),
            children,
            memo: Arc::new(OnceCell::new()),
            site: Location::caller(),
        }),
    }
}

/// Branch on a string selector. The selector is evaluated once (its
/// parameters resolved like a `when_fn` predicate); the first matching
/// [`case`] is included, else the [`case_default`] arm if present.
#[track_caller]
pub fn switch<Args>(selector: impl IntoCallable<Args>, cases: Vec<Case>) -> Node {
    Node {
        kind: NodeKind::Switch(SwitchNode {
            selector: selector.into_callable(),
            cases: cases.into_iter().map(|c| c.0).collect(),
            memo: Arc::new(OnceCell::new()),
            site: Location::caller(),
        }),
    }
}

pub fn case(value: &str, children: Vec<Node>) -> Case {
    Case(CaseArm {
        label: Some(value.to_string()),
        children,
    })
}

pub fn case_default(children: Vec<Node>) -> Case {
    Case(CaseArm {
        label: None,
        children,
    })
}

#[track_caller]
fn override_node<T: Clone + Send + Sync + 'static>(
    value: T,
    mode: OverrideMode,
    is_fallback: bool,
) -> Node {
    let site = Location::caller();
    Node {
        kind: NodeKind::Override(OverrideNode {
            bind: value_bind(value, site),
            mode,
            is_fallback,
            selector: TagSelector::default(),
            site,
        }),
    }
}

/// Replace whatever binding currently serves the target tag set, in the
/// declaring scope and below. Select the slot with [`Node::named`] /
/// [`Node::grouped`] / [`Node::for_type`]; a bare `replace` targets the
/// untagged slot of the value's own type.
#[track_caller]
pub fn replace<T: Clone + Send + Sync + 'static>(value: T) -> Node {
    override_node(value, OverrideMode::All, false)
}

/// [`replace`] with a constructor instead of a literal value.
#[track_caller]
pub fn replace_ctor<Args>(ctor: impl IntoCallable<Args>) -> Node {
    let site = Location::caller();
    Node {
        kind: NodeKind::Override(OverrideNode {
            bind: BindNode {
                kind: BindKind::Constructor,
                callable: ctor.into_callable(),
                opts: Vec::new(),
                casts: Vec::new(),
                fields: Vec::new(),
                site,
            },
            mode: OverrideMode::All,
            is_fallback: false,
            selector: TagSelector::default(),
            site,
        }),
    }
}

/// Replace the target only for consumers declared before this node in
/// the same scope.
#[track_caller]
pub fn replace_before<T: Clone + Send + Sync + 'static>(value: T) -> Node {
    override_node(value, OverrideMode::Before, false)
}

/// Replace the target only for consumers declared after this node in
/// the same scope.
#[track_caller]
pub fn replace_after<T: Clone + Send + Sync + 'static>(value: T) -> Node {
    override_node(value, OverrideMode::After, false)
}

/// Bind the value only if nothing else satisfies the target tag set.
#[track_caller]
pub fn fallback<T: Clone + Send + Sync + 'static>(value: T) -> Node {
    override_node(value, OverrideMode::All, true)
}

/// [`fallback`] with a constructor instead of a literal value.
#[track_caller]
pub fn fallback_ctor<Args>(ctor: impl IntoCallable<Args>) -> Node {
    let site = Location::caller();
    Node {
        kind: NodeKind::Override(OverrideNode {
            bind: BindNode {
                kind: BindKind::Constructor,
                callable: ctor.into_callable(),
                opts: Vec::new(),
                casts: Vec::new(),
                fields: Vec::new(),
                site,
            },
            mode: OverrideMode::All,
            is_fallback: true,
            selector: TagSelector::default(),
            site,
        }),
    }
}

/// Decorate a previously bound value: the transform's first parameter is
/// the target (a collection parameter decorates the whole group), extra
/// parameters are ordinary dependencies. Target a named or grouped slot
/// with [`Node::named`] / [`Node::grouped`].
#[track_caller]
pub fn decorate<Args>(transform: impl IntoCallable<Args>) -> Node {
    Node {
        kind: NodeKind::Decorate(DecorateNode {
            form: DecorateForm::Element(transform.into_callable()),
            selector: TagSelector::default(),
            site: Location::caller(),
        }),
    }
}

/// Decorate a whole group with a collection-level transform: all
/// members in, the transformed collection out.
#[track_caller]
pub fn decorate_group<T: Clone + Send + Sync + 'static>(
    group: &str,
    transform: impl Fn(Vec<T>) -> anyhow::Result<Vec<T>> + Send + Sync + 'static,
) -> Node {
    let erased: CollectionFn = Arc::new(move |values: Vec<Value>| {
        let typed = values
            .iter()
            .map(|v| {
                v.extract::<T>().ok_or_else(|| {
                    anyhow::anyhow!(
                        "group member type mismatch: expected {}, got {}",
                        TypeKey::of::<T>(),
                        v.key()
                    )
                })
            })
            .collect::<anyhow::Result<Vec<T>>>()?;
        Ok(transform(typed)?.into_iter().map(Value::new).collect())
    });
    Node {
        kind: NodeKind::Decorate(DecorateNode {
            form: DecorateForm::Collection {
                element: TypeKey::of::<T>(),
                transform: erased,
            },
            selector: TagSelector {
                group: Some(intern(group)),
                ..Default::default()
            },
            site: Location::caller(),
        }),
    }
}

/// Declare that every binding in scope whose result satisfies contract
/// `C` is also exported into the given group. `C` is the contract value
/// type consumers see, typically `Arc<dyn Trait>`; a binding satisfies
/// it when it declares a matching [`Node::implements`] cast (or produces
/// `C` itself).
#[track_caller]
pub fn auto_group<C: 'static>(group: &str) -> Node {
    Node {
        kind: NodeKind::AutoGroup(AutoGroupNode {
            contract: TypeKey::of::<C>(),
            group: intern(group),
            filter: None,
            export_self: false,
            site: Location::caller(),
        }),
    }
}

/// Enable the field-injection pass for the declaring scope and below.
#[track_caller]
pub fn auto_inject() -> Node {
    Node {
        kind: NodeKind::AutoInject(Location::caller()),
    }
}

/// Run a function at startup, its parameters resolved from the graph.
#[track_caller]
pub fn invoke<Args>(f: impl IntoCallable<Args>) -> Node {
    Node {
        kind: NodeKind::Invoke(InvokeNode {
            callable: f.into_callable(),
            tags: None,
            site: Location::caller(),
        }),
    }
}

/// Run a cleanup hook at shutdown, its parameters resolved from the
/// graph. Hooks run in reverse declaration order.
#[track_caller]
pub fn on_stop<Args>(f: impl IntoCallable<Args>) -> Node {
    Node {
        kind: NodeKind::OnStop(HookNode {
            callable: f.into_callable(),
            tags: None,
            site: Location::caller(),
        }),
    }
}

// ============================================================================
// POPULATE
// ============================================================================

/// Receives the value a [`populate`] node resolved.
#[derive(Clone)]
pub struct PopulateHandle<T> {
    cell: Arc<Mutex<Option<T>>>,
}

impl<T: Clone> PopulateHandle<T> {
    pub fn get(&self) -> Option<T> {
        self.cell.lock().ok().and_then(|guard| guard.clone())
    }
}

impl<T> Default for PopulateHandle<T> {
    fn default() -> Self {
        Self {
            cell: Arc::new(Mutex::new(None)),
        }
    }
}

fn populate_node<T: Clone + Send + Sync + 'static>(
    slot: Slot,
    site: Site,
) -> (Node, PopulateHandle<T>) {
    let handle = PopulateHandle::<T>::default();
    let cell = Arc::clone(&handle.cell);
    let sink: SinkFn = Arc::new(move |arg: ResolvedArg| {
        let value = match arg {
            ResolvedArg::One(v) => v,
            ResolvedArg::Missing => return Ok(()),
            ResolvedArg::Many(_) => anyhow::bail!("populate slot resolved to a collection"),
        };
        let typed = value
            .extract::<T>()
            .ok_or_else(|| anyhow::anyhow!("populate type mismatch: got {}", value.key()))?;
        *cell.lock().expect("populate cell poisoned") = Some(typed);
        Ok(())
    });
    (
        Node {
            kind: NodeKind::Populate(PopulateNode { slot, sink, site }),
        },
        handle,
    )
}

/// Resolve the untagged slot of `T` at startup and expose it through the
/// returned handle.
#[track_caller]
pub fn populate<T: Clone + Send + Sync + 'static>() -> (Node, PopulateHandle<T>) {
    populate_node(Slot::single(TypeKey::of::<T>()), Location::caller())
}

/// [`populate`] for a named slot.
#[track_caller]
pub fn populate_named<T: Clone + Send + Sync + 'static>(name: &str) -> (Node, PopulateHandle<T>) {
    let mut slot = Slot::single(TypeKey::of::<T>());
    slot.tag = crate::key::Tag::Name(intern(name));
    populate_node(slot, Location::caller())
}

/// Collect every member of a group at startup.
#[track_caller]
pub fn populate_group<T: Clone + Send + Sync + 'static>(
    group: &str,
) -> (Node, PopulateHandle<Vec<T>>) {
    let site = Location::caller();
    let handle = PopulateHandle::<Vec<T>>::default();
    let cell = Arc::clone(&handle.cell);
    let sink: SinkFn = Arc::new(move |arg: ResolvedArg| {
        let values = match arg {
            ResolvedArg::Many(vs) => vs,
            ResolvedArg::Missing => Vec::new(),
            ResolvedArg::One(_) => anyhow::bail!("populate group slot resolved to a single value"),
        };
        let typed = values
            .iter()
            .map(|v| {
                v.extract::<T>()
                    .ok_or_else(|| anyhow::anyhow!("populate type mismatch: got {}", v.key()))
            })
            .collect::<anyhow::Result<Vec<T>>>()?;
        *cell.lock().expect("populate cell poisoned") = Some(typed);
        Ok(())
    });
    let slot = Slot {
        key: TypeKey::of::<T>(),
        tag: crate::key::Tag::Group(intern(group)),
        optional: false,
        many: true,
    };
    (
        Node {
            kind: NodeKind::Populate(PopulateNode { slot, sink, site }),
        },
        handle,
    )
}

// ============================================================================
// FLUENT OPTIONS
// ============================================================================

impl Node {
    #[track_caller]
    fn poison(self, option: &'static str) -> Node {
        let node = self.kind.kind_name();
        Node {
            kind: NodeKind::Invalid(PoisonedNode {
                option,
                node,
                site: Location::caller(),
            }),
        }
    }

    /// Name the binding's export. After an [`Node::export_as`] this names
    /// (or fans out) that export; standalone it names the base type's
    /// slot. On replace/fallback nodes it selects the named target slot.
    #[track_caller]
    pub fn named(mut self, name: &str) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::Name {
                    name: name.to_string(),
                    site,
                });
                self
            }
            NodeKind::Override(o) => {
                o.selector.name = Some(intern(name));
                self
            }
            _ => self.poison("named"),
        }
    }

    /// Export the binding into a group. Same positional rules as
    /// [`Node::named`]. On replace/fallback nodes it selects the grouped
    /// target slot.
    #[track_caller]
    pub fn grouped(mut self, group: &str) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::Group {
                    group: group.to_string(),
                    site,
                });
                self
            }
            NodeKind::Override(o) => {
                o.selector.group = Some(intern(group));
                self
            }
            NodeKind::Decorate(d) => {
                d.selector.group = Some(intern(group));
                self
            }
            _ => self.poison("grouped"),
        }
    }

    /// Select the target slot of a decorate node by name.
    #[track_caller]
    pub fn target_named(mut self, name: &str) -> Node {
        match &mut self.kind {
            NodeKind::Decorate(d) => {
                d.selector.name = Some(intern(name));
                self
            }
            _ => self.poison("target_named"),
        }
    }

    /// Explicit target type for a replace/fallback node, when it differs
    /// from the replacement value's own type.
    #[track_caller]
    pub fn for_type<T: 'static>(mut self) -> Node {
        match &mut self.kind {
            NodeKind::Override(o) => {
                o.selector.key = Some(TypeKey::of::<T>());
                self
            }
            _ => self.poison("for_type"),
        }
    }

    /// Additionally export the binding under the cast's output type. The
    /// cast's input type must be the binding's result type.
    #[track_caller]
    pub fn export_as<T, C>(mut self, cast: impl Fn(&T) -> C + Send + Sync + 'static) -> Node
    where
        T: 'static,
        C: Send + Sync + 'static,
    {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::ExportAs {
                    source: TypeKey::of::<T>(),
                    cast: ContractCast::new(cast),
                    site,
                });
                self
            }
            _ => self.poison("export_as"),
        }
    }

    /// Declare that the result satisfies a capability contract without
    /// exporting it: auto-group rules and override casts use this.
    #[track_caller]
    pub fn implements<T, C>(mut self, cast: impl Fn(&T) -> C + Send + Sync + 'static) -> Node
    where
        T: 'static,
        C: Send + Sync + 'static,
    {
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.casts.push(ContractCast::new(cast));
                self
            }
            NodeKind::Override(o) => {
                o.bind.casts.push(ContractCast::new(cast));
                self
            }
            _ => self.poison("implements"),
        }
    }

    /// Force the concrete type export even when other exports exist.
    #[track_caller]
    pub fn self_export(mut self) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::SelfExport { site });
                self
            }
            NodeKind::Override(o) => {
                o.bind.opts.push(BindOpt::SelfExport { site });
                self
            }
            _ => self.poison("self_export"),
        }
    }

    /// Mark the binding module-private (carried through to the runtime).
    #[track_caller]
    pub fn private(mut self) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::Private { site });
                self
            }
            NodeKind::Override(o) => {
                o.bind.opts.push(BindOpt::Private { site });
                self
            }
            _ => self.poison("private"),
        }
    }

    /// Attach a metadata entry, surfaced through the compiled graph's
    /// metadata registry once the value is constructed.
    #[track_caller]
    pub fn metadata(mut self, key: &str, value: Json) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::Metadata {
                    key: key.to_string(),
                    value,
                    site,
                });
                self
            }
            NodeKind::Override(o) => {
                o.bind.opts.push(BindOpt::Metadata {
                    key: key.to_string(),
                    value,
                    site,
                });
                self
            }
            _ => self.poison("metadata"),
        }
    }

    /// Explicit ordering priority within groups.
    #[track_caller]
    pub fn priority(mut self, priority: Priority) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::Priority { priority, site });
                self
            }
            _ => self.poison("priority"),
        }
    }

    /// Override the binding's parameter tags positionally. Entries:
    /// `""` (untagged), `"name=x"`, `"group=g"`, `"optional"`;
    /// combinations join with `,` (e.g. `"name=x,optional"`). The count
    /// must match the callable's parameter count.
    #[track_caller]
    pub fn param_tags<I, S>(mut self, tags: I) -> Node
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let site = Location::caller();
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::ParamTags { tags, site });
                self
            }
            NodeKind::Invoke(i) => {
                i.tags = Some(tags);
                self
            }
            NodeKind::OnStop(h) => {
                h.tags = Some(tags);
                self
            }
            _ => self.poison("param_tags"),
        }
    }

    /// Exempt the binding from every auto-group rule in scope.
    #[track_caller]
    pub fn auto_group_ignore(mut self) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::AutoGroupIgnore { site });
                self
            }
            _ => self.poison("auto_group_ignore"),
        }
    }

    /// Exempt the binding from one `(contract, group)` auto-group rule.
    #[track_caller]
    pub fn auto_group_ignore_type<C: 'static>(mut self, group: &str) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::AutoGroupIgnoreType {
                    contract: TypeKey::of::<C>(),
                    group: intern(group),
                    site,
                });
                self
            }
            _ => self.poison("auto_group_ignore_type"),
        }
    }

    /// Exempt the binding from the field-injection pass.
    #[track_caller]
    pub fn auto_inject_ignore(mut self) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::AutoInjectIgnore { site });
                self
            }
            _ => self.poison("auto_inject_ignore"),
        }
    }

    /// Declare an injectable field of the result type (see
    /// [`crate::field`] / [`crate::field_group`]).
    #[track_caller]
    pub fn inject(mut self, field: FieldSlot) -> Node {
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.fields.push(field);
                self
            }
            _ => self.poison("inject"),
        }
    }

    /// Embed a decorator that applies to this binding's exports.
    #[track_caller]
    pub fn with_decorator<Args>(mut self, transform: impl IntoCallable<Args>) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::Decorate {
                    callable: transform.into_callable(),
                    site,
                });
                self
            }
            NodeKind::Override(o) => {
                o.bind.opts.push(BindOpt::Decorate {
                    callable: transform.into_callable(),
                    site,
                });
                self
            }
            _ => self.poison("with_decorator"),
        }
    }

    /// Embed a stop hook emitted beside this binding.
    #[track_caller]
    pub fn with_stop<Args>(mut self, hook: impl IntoCallable<Args>) -> Node {
        let site = Location::caller();
        match &mut self.kind {
            NodeKind::Bind(b) => {
                b.opts.push(BindOpt::OnStop {
                    callable: hook.into_callable(),
                    site,
                });
                self
            }
            _ => self.poison("with_stop"),
        }
    }

    /// Restrict an [`auto_group`] rule to concrete types accepted by the
    /// predicate.
    #[track_caller]
    pub fn filter(mut self, pred: impl Fn(TypeKey) -> bool + Send + Sync + 'static) -> Node {
        match &mut self.kind {
            NodeKind::AutoGroup(r) => {
                r.filter = Some(Arc::new(pred));
                self
            }
            _ => self.poison("filter"),
        }
    }

    /// Make an [`auto_group`] rule also force the concrete type export
    /// on every binding it touches.
    #[track_caller]
    pub fn export_self(mut self) -> Node {
        match &mut self.kind {
            NodeKind::AutoGroup(r) => {
                r.export_self = true;
                self
            }
            _ => self.poison("export_self"),
        }
    }
}
