//! Binding identity: type keys, tags, and tag sets
//!
//! A binding is published under one or more [`TagSet`]s: the result type
//! plus an optional name or group. Name and group are mutually exclusive
//! on a single tag set; override selectors may carry both and fan out.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

/// Runtime identity of a Rust type.
///
/// Carries the `TypeId` for equality/hashing and the type name for
/// diagnostics and plan output.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Key for a concrete type.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Full type name (`module::path::Type`).
    pub fn type_name(&self) -> &'static str {
        self.name
    }

    /// Short type name: the last path segment, generics preserved.
    pub fn short_name(&self) -> &str {
        // "a::b::Foo<c::d::Bar>" -> "Foo<c::d::Bar>" is wrong to cut at the
        // last "::", so cut at the last "::" before any generic bracket.
        let head_end = self.name.find('<').unwrap_or(self.name.len());
        match self.name[..head_end].rfind("::") {
            Some(idx) => &self.name[idx + 2..],
            None => self.name,
        }
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Name or group qualifier on a tag set. `None` is the untagged default
/// slot for the type.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum Tag {
    #[default]
    None,
    Name(Arc<str>),
    Group(Arc<str>),
}

impl Tag {
    pub fn is_none(&self) -> bool {
        matches!(self, Tag::None)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Tag::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn group(&self) -> Option<&str> {
        match self {
            Tag::Group(g) => Some(g),
            _ => None,
        }
    }

    /// Retag with a replacement suffix so the rewritten binding cannot
    /// collide with the original inside the runtime. An untagged slot
    /// becomes a bare suffix name.
    pub(crate) fn suffixed(&self, replacement_id: u64) -> Tag {
        match self {
            Tag::None => Tag::Name(Arc::from(format!("#r{replacement_id}"))),
            Tag::Name(n) => Tag::Name(Arc::from(format!("{n}#r{replacement_id}"))),
            Tag::Group(g) => Tag::Group(Arc::from(format!("{g}#r{replacement_id}"))),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::None => Ok(()),
            Tag::Name(n) => write!(f, "name=\"{n}\""),
            Tag::Group(g) => write!(f, "group=\"{g}\""),
        }
    }
}

/// The identity under which a constructed value is published.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TagSet {
    pub key: TypeKey,
    pub tag: Tag,
}

impl TagSet {
    pub fn untagged(key: TypeKey) -> Self {
        Self { key, tag: Tag::None }
    }

    pub fn named(key: TypeKey, name: Arc<str>) -> Self {
        Self { key, tag: Tag::Name(name) }
    }

    pub fn grouped(key: TypeKey, group: Arc<str>) -> Self {
        Self { key, tag: Tag::Group(group) }
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self.tag, Tag::Group(_))
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Tag::None => write!(f, "{}", self.key),
            tag => write!(f, "{}[{}]", self.key, tag),
        }
    }
}

/// Target selector on an override or decorator declaration.
///
/// Unlike a [`TagSet`], a selector may carry a name AND a group: the
/// override then fans out over both displaced slots. An explicit type
/// target overrides the replacement value's own result type.
#[derive(Clone, Debug, Default)]
pub struct TagSelector {
    pub key: Option<TypeKey>,
    pub name: Option<Arc<str>>,
    pub group: Option<Arc<str>>,
}

impl TagSelector {
    /// Specificity ranking used to pick among competing overrides:
    /// name+group > group > name > type-only.
    pub fn specificity(&self) -> u8 {
        match (&self.name, &self.group) {
            (Some(_), Some(_)) => 3,
            (None, Some(_)) => 2,
            (Some(_), None) => 1,
            (None, None) => 0,
        }
    }

    /// Candidate tag sets this selector produces for a replacement whose
    /// value has type `fallback_key`.
    pub(crate) fn candidates(&self, fallback_key: TypeKey) -> Vec<TagSet> {
        let key = self.key.unwrap_or(fallback_key);
        let mut out = Vec::new();
        if let Some(n) = &self.name {
            out.push(TagSet::named(key, Arc::clone(n)));
        }
        if let Some(g) = &self.group {
            out.push(TagSet::grouped(key, Arc::clone(g)));
        }
        if out.is_empty() {
            out.push(TagSet::untagged(key));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.name.is_none() && self.group.is_none()
    }
}
