//! Reference injection runtime
//!
//! Interprets the compiled instruction list: singleton construction per
//! provide, tag-set lookup for single slots, declaration-ordered
//! collection for groups, decorator chains applied post-construction,
//! invoke/populate at start, stop hooks in reverse order with a bounded
//! per-hook timeout. Resolution is demand-driven with cycle detection;
//! values are cached so each constructor runs at most once.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::build::CompiledGraph;
use crate::error::ResolveError;
use crate::instruction::{
    DecorateStep, HookInstr, Instruction, ProvideInstr,
};
use crate::key::TagSet;
use crate::metadata::{MetaEntry, MetadataRegistry};
use crate::value::{ResolvedArg, Slot, Value};
use std::sync::Arc;

use super::Runtime;

pub struct Injector {
    instructions: Vec<Instruction>,
    provides: Vec<ProvideInstr>,
    singles: FxHashMap<TagSet, usize>,
    groups: FxHashMap<TagSet, Vec<usize>>,
    decorations: FxHashMap<TagSet, Vec<DecorateStep>>,
    hooks: Vec<HookInstr>,
    metadata: Arc<MetadataRegistry>,
    constructed: Mutex<FxHashMap<u64, Value>>,
    /// Post-decoration cache, keyed by tag set plus collection-ness so a
    /// single slot and a group slot over the same tags never alias.
    decorated: Mutex<FxHashMap<(TagSet, bool), ResolvedArg>>,
    resolving: Mutex<Vec<u64>>,
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("instructions", &self.instructions)
            .field("singles", &self.singles.len())
            .field("groups", &self.groups.len())
            .finish_non_exhaustive()
    }
}

impl Injector {
    pub fn new(graph: CompiledGraph) -> Result<Self, ResolveError> {
        let mut provides: Vec<ProvideInstr> = Vec::new();
        let mut singles: FxHashMap<TagSet, usize> = FxHashMap::default();
        let mut groups: FxHashMap<TagSet, Vec<usize>> = FxHashMap::default();
        let mut decorations: FxHashMap<TagSet, Vec<DecorateStep>> = FxHashMap::default();
        let mut hooks = Vec::new();

        for instruction in &graph.instructions {
            match instruction {
                Instruction::Provide(provide) => {
                    let index = provides.len();
                    for export in &provide.exports {
                        if export.tag_set.is_grouped() {
                            groups
                                .entry(export.tag_set.clone())
                                .or_default()
                                .push(index);
                        } else if let Some(previous) =
                            singles.insert(export.tag_set.clone(), index)
                        {
                            return Err(ResolveError::DuplicateBinding {
                                tag_set: export.tag_set.to_string(),
                                first: provides[previous].site,
                                second: provide.site,
                            });
                        }
                    }
                    provides.push(provide.clone());
                }
                Instruction::Decorate(decorate) => {
                    decorations
                        .entry(decorate.target.clone())
                        .or_default()
                        .extend(decorate.steps.iter().cloned());
                }
                Instruction::OnStop(hook) => hooks.push(hook.clone()),
                Instruction::Invoke(_) | Instruction::Populate(_) => {}
            }
        }

        Ok(Self {
            provides,
            singles,
            groups,
            decorations,
            hooks,
            metadata: Arc::clone(&graph.metadata),
            instructions: graph.instructions,
            constructed: Mutex::new(FxHashMap::default()),
            decorated: Mutex::new(FxHashMap::default()),
            resolving: Mutex::new(Vec::new()),
        })
    }

    /// Resolve one slot on demand, for callers outside the start
    /// sequence (tests, ad-hoc lookups).
    pub fn resolve(&self, slot: &Slot) -> Result<ResolvedArg, ResolveError> {
        let mut chain = Vec::new();
        self.resolve_slot(slot, &mut chain)
    }

    /// Typed convenience lookup for the untagged slot of `T`.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Result<T, ResolveError> {
        let slot = Slot::single(crate::key::TypeKey::of::<T>());
        match self.resolve(&slot)? {
            ResolvedArg::One(value) => value.extract::<T>().ok_or_else(|| {
                ResolveError::MissingBinding {
                    slot: slot.to_string(),
                    chain: String::new(),
                }
            }),
            _ => Err(ResolveError::MissingBinding {
                slot: slot.to_string(),
                chain: String::new(),
            }),
        }
    }

    pub fn metadata(&self) -> &MetadataRegistry {
        &self.metadata
    }

    fn resolve_slot(
        &self,
        slot: &Slot,
        chain: &mut Vec<String>,
    ) -> Result<ResolvedArg, ResolveError> {
        let tag_set = TagSet {
            key: slot.key,
            tag: slot.tag.clone(),
        };
        let cache_key = (tag_set.clone(), slot.many);
        if let Some(cached) = self
            .decorated
            .lock()
            .expect("decoration cache poisoned")
            .get(&cache_key)
        {
            return Ok(cached.clone());
        }

        let resolved = if slot.many {
            let members = self.groups.get(&tag_set).cloned().unwrap_or_default();
            let mut values = Vec::with_capacity(members.len());
            for index in members {
                let concrete = self.instantiate(index, chain)?;
                values.push(self.export_value(index, &tag_set, concrete)?);
            }
            ResolvedArg::Many(values)
        } else {
            match self.singles.get(&tag_set).copied() {
                None => {
                    if slot.optional {
                        return Ok(ResolvedArg::Missing);
                    }
                    return Err(ResolveError::MissingBinding {
                        slot: slot.to_string(),
                        chain: chain.join(" -> "),
                    });
                }
                Some(index) => {
                    let concrete = self.instantiate(index, chain)?;
                    ResolvedArg::One(self.export_value(index, &tag_set, concrete)?)
                }
            }
        };

        let decorated = self.apply_decorations(&tag_set, resolved, chain)?;
        self.decorated
            .lock()
            .expect("decoration cache poisoned")
            .insert(cache_key, decorated.clone());
        Ok(decorated)
    }

    /// Construct (or fetch) the provider's concrete value. Singleton per
    /// provide instruction.
    fn instantiate(&self, index: usize, chain: &mut Vec<String>) -> Result<Value, ResolveError> {
        let provide = &self.provides[index];
        if let Some(existing) = self
            .constructed
            .lock()
            .expect("construction cache poisoned")
            .get(&provide.id)
        {
            return Ok(existing.clone());
        }
        {
            let resolving = self.resolving.lock().expect("resolve stack poisoned");
            if resolving.contains(&provide.id) {
                let mut cycle = chain.clone();
                cycle.push(provide.result.to_string());
                return Err(ResolveError::Cycle {
                    chain: cycle.join(" -> "),
                });
            }
        }
        self.resolving
            .lock()
            .expect("resolve stack poisoned")
            .push(provide.id);
        chain.push(provide.result.to_string());

        let result = provide
            .slots
            .iter()
            .map(|slot| self.resolve_slot(slot, chain))
            .collect::<Result<Vec<_>, _>>()
            .and_then(|args| {
                (provide.invoke)(args).map_err(|source| ResolveError::Constructor {
                    binding: provide.result.to_string(),
                    site: provide.site,
                    source,
                })
            });

        chain.pop();
        self.resolving
            .lock()
            .expect("resolve stack poisoned")
            .pop();

        let value = result?;
        if !provide.metadata.is_empty() {
            self.metadata.attach(
                &value,
                MetaEntry {
                    values: provide.metadata.clone(),
                },
            );
        }
        debug!(binding = %provide.result, "constructed");
        self.constructed
            .lock()
            .expect("construction cache poisoned")
            .insert(provide.id, value.clone());
        Ok(value)
    }

    /// Apply the export's contract cast for the tag set being served.
    fn export_value(
        &self,
        index: usize,
        tag_set: &TagSet,
        concrete: Value,
    ) -> Result<Value, ResolveError> {
        let provide = &self.provides[index];
        let export = provide
            .exports
            .iter()
            .find(|e| e.tag_set == *tag_set)
            .ok_or_else(|| ResolveError::MissingBinding {
                slot: tag_set.to_string(),
                chain: String::new(),
            })?;
        match &export.cast {
            None => Ok(concrete),
            Some(cast) => cast.apply(&concrete).map_err(|source| ResolveError::Cast {
                target: tag_set.to_string(),
                source,
            }),
        }
    }

    fn apply_decorations(
        &self,
        tag_set: &TagSet,
        resolved: ResolvedArg,
        chain: &mut Vec<String>,
    ) -> Result<ResolvedArg, ResolveError> {
        let Some(steps) = self.decorations.get(tag_set) else {
            return Ok(resolved);
        };
        let mut current = resolved;
        for step in steps {
            current = match step {
                DecorateStep::Element { invoke, extras } => {
                    let extra_args = extras
                        .iter()
                        .map(|slot| self.resolve_slot(slot, chain))
                        .collect::<Result<Vec<_>, _>>()?;
                    let apply_one = |value: Value| {
                        let mut args = Vec::with_capacity(1 + extra_args.len());
                        args.push(ResolvedArg::One(value));
                        args.extend(extra_args.iter().cloned());
                        invoke(args).map_err(|source| ResolveError::Decorator {
                            target: tag_set.to_string(),
                            source,
                        })
                    };
                    match current {
                        ResolvedArg::One(value) => ResolvedArg::One(apply_one(value)?),
                        ResolvedArg::Many(values) => {
                            // element decorator adapted across the
                            // collection, first failure wins
                            let mut out = Vec::with_capacity(values.len());
                            for value in values {
                                out.push(apply_one(value)?);
                            }
                            ResolvedArg::Many(out)
                        }
                        ResolvedArg::Missing => ResolvedArg::Missing,
                    }
                }
                DecorateStep::Collection { transform } => match current {
                    ResolvedArg::Many(values) => ResolvedArg::Many(
                        transform(values).map_err(|source| ResolveError::Decorator {
                            target: tag_set.to_string(),
                            source,
                        })?,
                    ),
                    other => other,
                },
            };
        }
        Ok(current)
    }

    fn run_startups(&self) -> Result<(), ResolveError> {
        for instruction in &self.instructions {
            match instruction {
                Instruction::Invoke(inv) => {
                    let mut chain = Vec::new();
                    let args = inv
                        .slots
                        .iter()
                        .map(|slot| self.resolve_slot(slot, &mut chain))
                        .collect::<Result<Vec<_>, _>>()?;
                    (inv.invoke)(args).map_err(|source| ResolveError::Invoke {
                        site: inv.site,
                        source,
                    })?;
                }
                Instruction::Populate(pop) => {
                    let mut chain = Vec::new();
                    let arg = self.resolve_slot(&pop.slot, &mut chain)?;
                    (pop.sink)(arg).map_err(|source| ResolveError::Populate {
                        site: pop.site,
                        source,
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Runtime for Injector {
    async fn start(&mut self) -> Result<(), ResolveError> {
        self.run_startups()
    }

    async fn stop(&mut self, timeout: Duration) -> Result<(), ResolveError> {
        for hook in self.hooks.iter().rev() {
            let mut chain = Vec::new();
            let args = hook
                .slots
                .iter()
                .map(|slot| self.resolve_slot(slot, &mut chain))
                .collect::<Result<Vec<_>, _>>()?;
            let invoke = Arc::clone(&hook.invoke);
            let site = hook.site;
            let outcome =
                tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || invoke(args)))
                    .await;
            match outcome {
                Err(_) => {
                    warn!(site = %site, "stop hook timed out");
                    return Err(ResolveError::StopTimeout { site });
                }
                Ok(Err(join)) => {
                    return Err(ResolveError::StopHook {
                        site,
                        source: anyhow::anyhow!(join),
                    });
                }
                Ok(Ok(Err(source))) => {
                    return Err(ResolveError::StopHook { site, source });
                }
                Ok(Ok(Ok(_))) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::App;
    use crate::node::{provide, supply};
    use crate::value::Dep;

    #[derive(Clone, Debug, PartialEq)]
    struct Port(u16);

    #[derive(Clone, Debug)]
    struct Server {
        port: u16,
    }

    fn injector(app: App) -> Injector {
        Injector::new(app.build().unwrap()).unwrap()
    }

    #[test]
    fn constructor_runs_once_per_binding() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let inj = injector(
            App::new()
                .node(provide(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(Port(1))
                }))
                .node(provide(|p: Dep<Port>| anyhow::Ok(Server { port: p.0 .0 })))
                .node(provide(|p: Dep<Port>| anyhow::Ok(format!("port {}", p.0 .0)))),
        );
        let server: Server = inj.get().unwrap();
        let label: String = inj.get().unwrap();
        assert_eq!(server.port, 1);
        assert_eq!(label, "port 1");
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_binding_reports_chain() {
        let inj = injector(
            App::new().node(provide(|p: Dep<Port>| anyhow::Ok(Server { port: p.0 .0 }))),
        );
        let err = inj.get::<Server>().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no binding satisfies"));
        assert!(message.contains("Server"));
    }

    #[test]
    fn cycle_detected() {
        #[derive(Clone, Debug)]
        struct A;
        #[derive(Clone, Debug)]
        struct B;
        let inj = injector(
            App::new()
                .node(provide(|_b: Dep<B>| anyhow::Ok(A)))
                .node(provide(|_a: Dep<A>| anyhow::Ok(B))),
        );
        let err = inj.get::<A>().unwrap_err();
        assert!(matches!(err, ResolveError::Cycle { .. }));
    }

    #[test]
    fn duplicate_untagged_binding_rejected_at_load() {
        let graph = App::new()
            .node(supply(Port(1)))
            .node(supply(Port(2)))
            .build()
            .unwrap();
        let err = Injector::new(graph).unwrap_err();
        assert!(matches!(err, ResolveError::DuplicateBinding { .. }));
    }

    #[test]
    fn constructor_failure_carries_site_and_source() {
        let inj = injector(App::new().node(provide(|| -> anyhow::Result<Port> {
            anyhow::bail!("boom")
        })));
        let err = inj.get::<Port>().unwrap_err();
        match err {
            ResolveError::Constructor { source, .. } => {
                assert!(source.to_string().contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
