//! Normalized output instructions
//!
//! The flat form a compiled tree reduces to, consumed by an injection
//! runtime: provide a callable under these tag sets, decorate a tag
//! set, invoke/populate at startup, run a hook at shutdown. The
//! compiler never calls user constructors; every closure in here is
//! executed by the runtime.

use std::fmt;

use serde_json::Value as Json;

use crate::error::Site;
use crate::key::{TagSet, TypeKey};
use crate::value::{CollectionFn, ContractCast, InvokeFn, SinkFn, Slot};

/// One flat instruction for the runtime.
#[derive(Clone)]
pub enum Instruction {
    Provide(ProvideInstr),
    Decorate(DecorateInstr),
    Invoke(InvokeInstr),
    Populate(PopulateInstr),
    OnStop(HookInstr),
}

/// A published export of a provide instruction: the tag set plus the
/// contract upcast the runtime applies when serving it.
#[derive(Clone)]
pub struct ExportInstr {
    pub tag_set: TagSet,
    pub cast: Option<ContractCast>,
}

/// "Provide this callable's value under these tags."
#[derive(Clone)]
pub struct ProvideInstr {
    pub id: u64,
    pub invoke: InvokeFn,
    pub result: TypeKey,
    pub slots: Vec<Slot>,
    pub exports: Vec<ExportInstr>,
    pub private: bool,
    pub metadata: serde_json::Map<String, Json>,
    pub site: Site,
}

/// One link of a decoration chain.
#[derive(Clone)]
pub enum DecorateStep {
    /// Transforms a single value; against a grouped target the runtime
    /// applies it per element, short-circuiting on the first failure.
    /// `extras` are the decorator's dependencies beyond the target.
    Element { invoke: InvokeFn, extras: Vec<Slot> },
    /// Transforms the whole resolved collection.
    Collection { transform: CollectionFn },
}

/// "After resolving this tag set, thread the value through these steps."
#[derive(Clone)]
pub struct DecorateInstr {
    pub target: TagSet,
    pub steps: Vec<DecorateStep>,
    pub site: Site,
}

#[derive(Clone)]
pub struct InvokeInstr {
    pub invoke: InvokeFn,
    pub slots: Vec<Slot>,
    pub site: Site,
}

#[derive(Clone)]
pub struct PopulateInstr {
    pub slot: Slot,
    pub sink: SinkFn,
    pub site: Site,
}

#[derive(Clone)]
pub struct HookInstr {
    pub invoke: InvokeFn,
    pub slots: Vec<Slot>,
    pub site: Site,
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Provide(p) => {
                let tags: Vec<String> =
                    p.exports.iter().map(|e| e.tag_set.to_string()).collect();
                write!(f, "Provide({} -> [{}])", p.result, tags.join(", "))
            }
            Instruction::Decorate(d) => {
                write!(f, "Decorate({}, {} step(s))", d.target, d.steps.len())
            }
            Instruction::Invoke(_) => write!(f, "Invoke"),
            Instruction::Populate(p) => write!(f, "Populate({})", p.slot),
            Instruction::OnStop(_) => write!(f, "OnStop"),
        }
    }
}
