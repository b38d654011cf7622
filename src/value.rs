//! Type-erased values and callable descriptors
//!
//! The compiler never runs user constructors; it moves descriptors
//! around. A [`Callable`] is a type-erased closure plus the resolved
//! parameter/result slots the runtime needs to wire it. Dependencies are
//! declared with the extractor wrappers [`Dep`], [`All`], and [`Opt`],
//! the way DI containers wrap injected parameters.
//!
//! Contract membership ("this concrete type satisfies that capability
//! contract") and injectable fields are carried as explicit descriptors:
//! [`ContractCast`] and [`FieldSlot`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::key::{Tag, TypeKey};

// ============================================================================
// VALUE
// ============================================================================

/// A type-erased, shareable value. Cloning is an `Arc` clone.
#[derive(Clone)]
pub struct Value {
    key: TypeKey,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Value {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            key: TypeKey::of::<T>(),
            inner: Arc::new(value),
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Clone the payload out of the erased wrapper.
    pub fn extract<T: Clone + 'static>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Identity key for the metadata side-table: the address of the
    /// erased allocation. Stable for the lifetime of any clone.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.key)
    }
}

// ============================================================================
// SLOTS
// ============================================================================

/// A resolved parameter slot: what the runtime must supply for one
/// argument position. `many` marks a group collection (key is the
/// element type).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slot {
    pub key: TypeKey,
    pub tag: Tag,
    pub optional: bool,
    pub many: bool,
}

impl Slot {
    pub fn single(key: TypeKey) -> Self {
        Self { key, tag: Tag::None, optional: false, many: false }
    }

    pub fn collection(key: TypeKey) -> Self {
        Self { key, tag: Tag::None, optional: false, many: true }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.many {
            write!(f, "[{}]", self.key)?;
        } else {
            write!(f, "{}", self.key)?;
        }
        if !self.tag.is_none() {
            write!(f, "[{}]", self.tag)?;
        }
        if self.optional {
            write!(f, "?")?;
        }
        Ok(())
    }
}

/// One resolved argument handed to a callable.
#[derive(Clone, Debug)]
pub enum ResolvedArg {
    One(Value),
    Many(Vec<Value>),
    /// Optional slot with no binding available.
    Missing,
}

// ============================================================================
// EXTRACTORS
// ============================================================================

/// A required single dependency.
pub struct Dep<T>(pub T);

/// A grouped collection dependency: every binding exported into the
/// slot's group, in declaration order.
pub struct All<T>(pub Vec<T>);

/// An optional dependency: `None` when no binding satisfies the slot.
pub struct Opt<T>(pub Option<T>);

impl<T> std::ops::Deref for Dep<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> Dep<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> All<T> {
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T> Opt<T> {
    pub fn into_inner(self) -> Option<T> {
        self.0
    }
}

/// Conversion from a [`ResolvedArg`] into a typed constructor parameter.
pub trait Extract: Sized + Send + 'static {
    fn slot() -> Slot;
    fn extract(arg: ResolvedArg) -> Result<Self>;
}

fn mismatch(expected: TypeKey, value: &Value) -> anyhow::Error {
    anyhow!("argument type mismatch: expected {expected}, got {}", value.key())
}

impl<T: Clone + Send + Sync + 'static> Extract for Dep<T> {
    fn slot() -> Slot {
        Slot::single(TypeKey::of::<T>())
    }

    fn extract(arg: ResolvedArg) -> Result<Self> {
        match arg {
            ResolvedArg::One(v) => v
                .extract::<T>()
                .map(Dep)
                .ok_or_else(|| mismatch(TypeKey::of::<T>(), &v)),
            ResolvedArg::Many(_) => Err(anyhow!(
                "collection supplied for single slot {}",
                TypeKey::of::<T>()
            )),
            ResolvedArg::Missing => Err(anyhow!(
                "missing required argument {}",
                TypeKey::of::<T>()
            )),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Extract for All<T> {
    fn slot() -> Slot {
        Slot::collection(TypeKey::of::<T>())
    }

    fn extract(arg: ResolvedArg) -> Result<Self> {
        match arg {
            ResolvedArg::Many(values) => values
                .iter()
                .map(|v| {
                    v.extract::<T>()
                        .ok_or_else(|| mismatch(TypeKey::of::<T>(), v))
                })
                .collect::<Result<Vec<_>>>()
                .map(All),
            ResolvedArg::Missing => Ok(All(Vec::new())),
            ResolvedArg::One(_) => Err(anyhow!(
                "single value supplied for collection slot {}",
                TypeKey::of::<T>()
            )),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Extract for Opt<T> {
    fn slot() -> Slot {
        Slot {
            key: TypeKey::of::<T>(),
            tag: Tag::None,
            optional: true,
            many: false,
        }
    }

    fn extract(arg: ResolvedArg) -> Result<Self> {
        match arg {
            ResolvedArg::Missing => Ok(Opt(None)),
            ResolvedArg::One(v) => v
                .extract::<T>()
                .map(|t| Opt(Some(t)))
                .ok_or_else(|| mismatch(TypeKey::of::<T>(), &v)),
            ResolvedArg::Many(_) => Err(anyhow!(
                "collection supplied for optional slot {}",
                TypeKey::of::<T>()
            )),
        }
    }
}

// ============================================================================
// CALLABLE
// ============================================================================

/// Type-erased invocation function: resolved arguments in, erased value
/// out. Failures travel as `anyhow::Error`.
pub type InvokeFn = Arc<dyn Fn(Vec<ResolvedArg>) -> Result<Value> + Send + Sync>;

/// Whole-collection transform applied to a resolved group.
pub type CollectionFn = Arc<dyn Fn(Vec<Value>) -> Result<Vec<Value>> + Send + Sync>;

/// Receiver for a populate instruction's resolved value.
pub type SinkFn = Arc<dyn Fn(ResolvedArg) -> Result<()> + Send + Sync>;

/// A callable descriptor: parameter slots, result type, erased closure.
#[derive(Clone)]
pub struct Callable {
    pub params: Vec<Slot>,
    pub result: TypeKey,
    pub invoke: InvokeFn,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({} param(s) -> {})", self.params.len(), self.result)
    }
}

/// Conversion from a closure into a [`Callable`].
///
/// Implemented for `Fn(E1, .., En) -> anyhow::Result<R>` where every
/// `Ei` is an extractor ([`Dep`], [`All`], [`Opt`]). Constructors always
/// return `Result`; use `anyhow::Ok(..)` for infallible ones.
pub trait IntoCallable<Args> {
    fn into_callable(self) -> Callable;
}

macro_rules! impl_into_callable {
    ($(($E:ident, $arg:ident)),*) => {
        impl<Func, R, $($E,)*> IntoCallable<($($E,)*)> for Func
        where
            Func: Fn($($E),*) -> Result<R> + Send + Sync + 'static,
            R: Send + Sync + 'static,
            $($E: Extract,)*
        {
            #[allow(unused_mut, unused_variables)]
            fn into_callable(self) -> Callable {
                let params = vec![$($E::slot()),*];
                let invoke: InvokeFn = Arc::new(move |args: Vec<ResolvedArg>| {
                    let mut args = args.into_iter();
                    $(let $arg = $E::extract(args.next().unwrap_or(ResolvedArg::Missing))?;)*
                    (self)($($arg),*).map(Value::new)
                });
                Callable {
                    params,
                    result: TypeKey::of::<R>(),
                    invoke,
                }
            }
        }
    };
}

impl_into_callable!();
impl_into_callable!((E1, a1));
impl_into_callable!((E1, a1), (E2, a2));
impl_into_callable!((E1, a1), (E2, a2), (E3, a3));
impl_into_callable!((E1, a1), (E2, a2), (E3, a3), (E4, a4));
impl_into_callable!((E1, a1), (E2, a2), (E3, a3), (E4, a4), (E5, a5));
impl_into_callable!((E1, a1), (E2, a2), (E3, a3), (E4, a4), (E5, a5), (E6, a6));
impl_into_callable!((E1, a1), (E2, a2), (E3, a3), (E4, a4), (E5, a5), (E6, a6), (E7, a7));
impl_into_callable!(
    (E1, a1),
    (E2, a2),
    (E3, a3),
    (E4, a4),
    (E5, a5),
    (E6, a6),
    (E7, a7),
    (E8, a8)
);

// ============================================================================
// CONTRACT CASTS
// ============================================================================

/// Declares that a concrete result type satisfies a capability contract,
/// with the upcast the runtime applies when the value is consumed under
/// the contract's key.
#[derive(Clone)]
pub struct ContractCast {
    pub contract: TypeKey,
    pub cast: Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>,
}

impl ContractCast {
    /// Build a cast from concrete `T` to contract value `C` (typically
    /// `Arc<dyn Trait>`).
    pub fn new<T, C>(cast: impl Fn(&T) -> C + Send + Sync + 'static) -> Self
    where
        T: 'static,
        C: Send + Sync + 'static,
    {
        Self {
            contract: TypeKey::of::<C>(),
            cast: Arc::new(move |v: &Value| v.downcast_ref::<T>().map(|t| Value::new(cast(t)))),
        }
    }

    pub fn apply(&self, value: &Value) -> Result<Value> {
        (self.cast)(value).ok_or_else(|| {
            anyhow!(
                "contract cast to {} rejected value of type {}",
                self.contract,
                value.key()
            )
        })
    }
}

impl fmt::Debug for ContractCast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractCast(-> {})", self.contract)
    }
}

// ============================================================================
// INJECTABLE FIELDS
// ============================================================================

/// Setter applied by the synthesized field-injection wrapper: current
/// value + resolved argument in, updated value out.
pub type SetterFn = Arc<dyn Fn(Value, ResolvedArg) -> Result<Value> + Send + Sync>;

/// An injectable field of a result type: name, slot the runtime must
/// resolve, and the setter that writes the argument into the value.
#[derive(Clone)]
pub struct FieldSlot {
    pub field: &'static str,
    pub slot: Slot,
    pub set: SetterFn,
}

impl FieldSlot {
    /// Tag the field's slot with a binding name.
    pub fn named(mut self, name: &str) -> Self {
        self.slot.tag = Tag::Name(crate::intern::intern(name));
        self
    }

    /// Mark the field optional: skipped when no binding satisfies it.
    pub fn optional(mut self) -> Self {
        self.slot.optional = true;
        self
    }
}

impl fmt::Debug for FieldSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldSlot({}: {})", self.field, self.slot)
    }
}

/// Declare a single-value injectable field on result type `T`.
pub fn field<T, F>(name: &'static str, set: impl Fn(&mut T, F) + Send + Sync + 'static) -> FieldSlot
where
    T: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
{
    let setter: SetterFn = Arc::new(move |value: Value, arg: ResolvedArg| {
        let mut target = value
            .extract::<T>()
            .ok_or_else(|| mismatch(TypeKey::of::<T>(), &value))?;
        let arg = match arg {
            ResolvedArg::One(v) => v,
            _ => return Err(anyhow!("field '{name}' expects a single value")),
        };
        let arg = arg
            .extract::<F>()
            .ok_or_else(|| mismatch(TypeKey::of::<F>(), &arg))?;
        set(&mut target, arg);
        Ok(Value::new(target))
    });
    FieldSlot {
        field: name,
        slot: Slot::single(TypeKey::of::<F>()),
        set: setter,
    }
}

/// Declare a grouped-collection injectable field on result type `T`.
pub fn field_group<T, F>(
    name: &'static str,
    group: &str,
    set: impl Fn(&mut T, Vec<F>) + Send + Sync + 'static,
) -> FieldSlot
where
    T: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
{
    let setter: SetterFn = Arc::new(move |value: Value, arg: ResolvedArg| {
        let mut target = value
            .extract::<T>()
            .ok_or_else(|| mismatch(TypeKey::of::<T>(), &value))?;
        let members = match arg {
            ResolvedArg::Many(values) => values
                .iter()
                .map(|v| {
                    v.extract::<F>()
                        .ok_or_else(|| mismatch(TypeKey::of::<F>(), v))
                })
                .collect::<Result<Vec<_>>>()?,
            ResolvedArg::Missing => Vec::new(),
            ResolvedArg::One(_) => {
                return Err(anyhow!("field '{name}' expects a group collection"))
            }
        };
        set(&mut target, members);
        Ok(Value::new(target))
    });
    FieldSlot {
        field: name,
        slot: Slot {
            key: TypeKey::of::<F>(),
            tag: Tag::Group(crate::intern::intern(group)),
            optional: false,
            many: true,
        },
        set: setter,
    }
}
