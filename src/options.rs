//! Binding option parser
//!
//! Accumulates the ordered option list of a provide/supply declaration
//! into a resolved [`BindingSpec`]: export tag sets, visibility,
//! metadata, priority, param-tag overrides, opt-outs, and any embedded
//! decorator/stop-hook sub-nodes. Parsing is fail-fast: the first
//! structural error aborts and is reported deterministically.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;

use crate::error::{CompileError, Site};
use crate::intern::intern;
use crate::key::{Tag, TagSet, TypeKey};
use crate::node::BindNode;
use crate::order::Priority;
use crate::value::{Callable, ContractCast, Slot};

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("identifier regex"));

// ============================================================================
// OPTIONS
// ============================================================================

/// One option applied to a bind node, in declaration order.
pub(crate) enum BindOpt {
    ExportAs {
        source: TypeKey,
        cast: ContractCast,
        site: Site,
    },
    Name {
        name: String,
        site: Site,
    },
    Group {
        group: String,
        site: Site,
    },
    SelfExport {
        site: Site,
    },
    Private {
        site: Site,
    },
    Metadata {
        key: String,
        value: Json,
        site: Site,
    },
    Priority {
        priority: Priority,
        site: Site,
    },
    ParamTags {
        tags: Vec<String>,
        site: Site,
    },
    AutoGroupIgnore {
        site: Site,
    },
    AutoGroupIgnoreType {
        contract: TypeKey,
        group: Arc<str>,
        site: Site,
    },
    AutoInjectIgnore {
        site: Site,
    },
    Decorate {
        callable: Callable,
        site: Site,
    },
    OnStop {
        callable: Callable,
        site: Site,
    },
}

impl BindOpt {
    pub(crate) fn site(&self) -> Site {
        match self {
            BindOpt::ExportAs { site, .. }
            | BindOpt::Name { site, .. }
            | BindOpt::Group { site, .. }
            | BindOpt::SelfExport { site }
            | BindOpt::Private { site }
            | BindOpt::Metadata { site, .. }
            | BindOpt::Priority { site, .. }
            | BindOpt::ParamTags { site, .. }
            | BindOpt::AutoGroupIgnore { site }
            | BindOpt::AutoGroupIgnoreType { site, .. }
            | BindOpt::AutoInjectIgnore { site }
            | BindOpt::Decorate { site, .. }
            | BindOpt::OnStop { site, .. } => site,
        }
    }

    pub(crate) fn opt_name(&self) -> &'static str {
        match self {
            BindOpt::ExportAs { .. } => "export_as",
            BindOpt::Name { .. } => "named",
            BindOpt::Group { .. } => "grouped",
            BindOpt::SelfExport { .. } => "self_export",
            BindOpt::Private { .. } => "private",
            BindOpt::Metadata { .. } => "metadata",
            BindOpt::Priority { .. } => "priority",
            BindOpt::ParamTags { .. } => "param_tags",
            BindOpt::AutoGroupIgnore { .. } => "auto_group_ignore",
            BindOpt::AutoGroupIgnoreType { .. } => "auto_group_ignore_type",
            BindOpt::AutoInjectIgnore { .. } => "auto_inject_ignore",
            BindOpt::Decorate { .. } => "with_decorator",
            BindOpt::OnStop { .. } => "with_stop",
        }
    }
}

// ============================================================================
// RESOLVED SPEC
// ============================================================================

/// Where an export came from; replace resolution strips `AutoGroup`
/// exports that would shadow an override.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExportOrigin {
    Explicit,
    SelfType,
    AutoGroup,
}

#[derive(Clone, Debug)]
pub(crate) struct ExportSpec {
    pub tag_set: TagSet,
    pub cast: Option<ContractCast>,
    pub origin: ExportOrigin,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ParamTag {
    pub tag: Tag,
    pub optional: bool,
}

/// Fully resolved binding options.
#[derive(Debug)]
pub(crate) struct BindingSpec {
    pub exports: Vec<ExportSpec>,
    pub private: bool,
    pub metadata: serde_json::Map<String, Json>,
    pub priority: Option<Priority>,
    pub param_tags: Option<Vec<ParamTag>>,
    pub auto_group_ignore: bool,
    pub auto_group_ignore_types: Vec<(TypeKey, Arc<str>)>,
    pub auto_inject_ignore: bool,
    pub decorators: Vec<(Callable, Site)>,
    pub stop_hooks: Vec<(Callable, Site)>,
}

fn check_ident(kind: &'static str, value: &str, site: Site) -> Result<(), CompileError> {
    if value.is_empty() {
        return Err(CompileError::EmptyTag { kind, site });
    }
    if !IDENT_RE.is_match(value) {
        return Err(CompileError::InvalidIdentifier {
            kind,
            value: value.to_string(),
            site,
        });
    }
    Ok(())
}

/// Parse the ordered option list of a bind node.
///
/// `for_override` rejects every option: replace/fallback declarations
/// take only a target selector and contract casts.
pub(crate) fn parse_bind_options(
    bind: &BindNode,
    for_override: bool,
) -> Result<BindingSpec, CompileError> {
    // replace/fallback declarations carry only a target selector and
    // contract casts; any binding option on them is a hard error
    if for_override {
        if let Some(opt) = bind.opts.first() {
            return Err(CompileError::OverrideForbiddenOption {
                option: opt.opt_name(),
                site: opt.site(),
            });
        }
    }

    let result_key = bind.callable.result;

    // explicit exports authored via export_as, with their fan-out tags
    struct ExportDecl {
        cast: ContractCast,
        tags: Vec<Tag>,
    }
    let mut declared: Vec<ExportDecl> = Vec::new();
    let mut pending: Option<(Tag, Site)> = None;
    let mut self_export = false;
    let mut private: Option<Site> = None;
    let mut metadata = serde_json::Map::new();
    let mut priority = None;
    let mut param_tags: Option<Vec<ParamTag>> = None;
    let mut auto_group_ignore = false;
    let mut auto_group_ignore_types = Vec::new();
    let mut auto_inject_ignore = false;
    let mut decorators = Vec::new();
    let mut stop_hooks = Vec::new();

    for opt in &bind.opts {
        match opt {
            BindOpt::ExportAs { source, cast, site } => {
                if *source != result_key {
                    return Err(CompileError::ExportSourceMismatch {
                        expected: source.type_name().to_string(),
                        found: result_key.type_name().to_string(),
                        site: *site,
                    });
                }
                declared.push(ExportDecl {
                    cast: cast.clone(),
                    tags: Vec::new(),
                });
            }
            BindOpt::Name { name, site } => {
                check_ident("name", name, *site)?;
                let tag = Tag::Name(intern(name));
                if let Some(last) = declared.last_mut() {
                    // fan-out: each name/group after an export adds a tag set
                    last.tags.push(tag);
                } else {
                    match &pending {
                        None => pending = Some((tag, *site)),
                        Some((Tag::Name(_), _)) => {
                            return Err(CompileError::DuplicatePendingTag {
                                kind: "name",
                                value: name.clone(),
                                site: *site,
                            });
                        }
                        Some(_) => {
                            return Err(CompileError::NamedAndGrouped { site: *site });
                        }
                    }
                }
            }
            BindOpt::Group { group, site } => {
                check_ident("group", group, *site)?;
                let tag = Tag::Group(intern(group));
                if let Some(last) = declared.last_mut() {
                    last.tags.push(tag);
                } else {
                    match &pending {
                        None => pending = Some((tag, *site)),
                        Some((Tag::Group(_), _)) => {
                            return Err(CompileError::DuplicatePendingTag {
                                kind: "group",
                                value: group.clone(),
                                site: *site,
                            });
                        }
                        Some(_) => {
                            return Err(CompileError::NamedAndGrouped { site: *site });
                        }
                    }
                }
            }
            BindOpt::SelfExport { .. } => self_export = true,
            BindOpt::Private { site } => {
                if private.is_some() {
                    return Err(CompileError::VisibilityTwice { site: *site });
                }
                private = Some(*site);
            }
            BindOpt::Metadata { key, value, site: _ } => {
                metadata.insert(key.clone(), value.clone());
            }
            BindOpt::Priority { priority: p, .. } => priority = Some(*p),
            BindOpt::ParamTags { tags, site } => {
                param_tags = Some(parse_param_tags(tags, &bind.callable, *site)?);
            }
            BindOpt::AutoGroupIgnore { .. } => auto_group_ignore = true,
            BindOpt::AutoGroupIgnoreType {
                contract, group, ..
            } => auto_group_ignore_types.push((*contract, Arc::clone(group))),
            BindOpt::AutoInjectIgnore { .. } => auto_inject_ignore = true,
            BindOpt::Decorate { callable, site } => decorators.push((callable.clone(), *site)),
            BindOpt::OnStop { callable, site } => stop_hooks.push((callable.clone(), *site)),
        }
    }

    // resolve the export list
    let mut exports: Vec<ExportSpec> = Vec::new();
    for decl in declared {
        if decl.tags.is_empty() {
            exports.push(ExportSpec {
                tag_set: TagSet::untagged(decl.cast.contract),
                cast: Some(decl.cast),
                origin: ExportOrigin::Explicit,
            });
        } else {
            for tag in decl.tags {
                exports.push(ExportSpec {
                    tag_set: TagSet {
                        key: decl.cast.contract,
                        tag,
                    },
                    cast: Some(decl.cast.clone()),
                    origin: ExportOrigin::Explicit,
                });
            }
        }
    }
    if let Some((tag, _site)) = pending {
        exports.push(ExportSpec {
            tag_set: TagSet {
                key: result_key,
                tag,
            },
            cast: None,
            origin: ExportOrigin::Explicit,
        });
    }
    if exports.is_empty() {
        // invariant: every binding produces at least one tag set
        exports.push(ExportSpec {
            tag_set: TagSet::untagged(result_key),
            cast: None,
            origin: ExportOrigin::SelfType,
        });
    } else if self_export
        && !exports
            .iter()
            .any(|e| e.tag_set == TagSet::untagged(result_key))
    {
        exports.push(ExportSpec {
            tag_set: TagSet::untagged(result_key),
            cast: None,
            origin: ExportOrigin::SelfType,
        });
    }

    Ok(BindingSpec {
        exports,
        private: private.is_some(),
        metadata,
        priority,
        param_tags,
        auto_group_ignore,
        auto_group_ignore_types,
        auto_inject_ignore,
        decorators,
        stop_hooks,
    })
}

/// Parse raw param-tag strings against a callable's arity (shared with
/// invoke/stop-hook lowering).
pub(crate) fn parse_raw_param_tags(
    tags: &[String],
    callable: &Callable,
    site: Site,
) -> Result<Vec<ParamTag>, CompileError> {
    parse_param_tags(tags, callable, site)
}

fn parse_param_tags(
    tags: &[String],
    callable: &Callable,
    site: Site,
) -> Result<Vec<ParamTag>, CompileError> {
    if tags.len() != callable.params.len() {
        return Err(CompileError::ParamTagArity {
            expected: callable.params.len(),
            found: tags.len(),
            site,
        });
    }
    tags.iter().map(|raw| parse_param_tag(raw, site)).collect()
}

fn parse_param_tag(raw: &str, site: Site) -> Result<ParamTag, CompileError> {
    let mut tag = Tag::None;
    let mut optional = false;
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if part == "optional" {
            optional = true;
        } else if let Some(name) = part.strip_prefix("name=") {
            check_ident("name", name, site)?;
            tag = Tag::Name(intern(name));
        } else if let Some(group) = part.strip_prefix("group=") {
            check_ident("group", group, site)?;
            tag = Tag::Group(intern(group));
        } else {
            return Err(CompileError::InvalidParamTag {
                tag: raw.to_string(),
                site,
            });
        }
    }
    Ok(ParamTag { tag, optional })
}

/// Apply param-tag overrides to a callable's declared slots and validate
/// that every collection slot ends up group-tagged.
pub(crate) fn effective_slots(
    callable: &Callable,
    param_tags: Option<&[ParamTag]>,
    site: Site,
) -> Result<Vec<Slot>, CompileError> {
    let mut slots = callable.params.clone();
    if let Some(tags) = param_tags {
        for (slot, tag) in slots.iter_mut().zip(tags) {
            if !tag.tag.is_none() {
                slot.tag = tag.tag.clone();
            }
            slot.optional |= tag.optional;
        }
    }
    for (index, slot) in slots.iter().enumerate() {
        if slot.many && !matches!(slot.tag, Tag::Group(_)) {
            return Err(CompileError::CollectionWithoutGroup { index, site });
        }
    }
    Ok(slots)
}
