use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::LinkError;
use crate::oops::KlassId;
use crate::resolution::{
    ConstantValue, DynamicLink, FieldAccess, FieldLink, InvokeKind,
    LinkResolver, MethodLink,
};

#[derive(Debug, Clone)]
enum Target {
    Field(FieldLink),
    Method(MethodLink),
    CallSite(DynamicLink),
    Class(KlassId),
    Constant(ConstantValue),
    Failure(LinkError),
}

/// Table-driven linker: every `(holder, cp_index)` maps to a fixed answer.
///
/// Answers can be registered while the linker is in use, which is how a
/// class whose definition shows up late is modelled.
#[derive(Default)]
pub struct StaticLinker {
    table: RwLock<HashMap<(KlassId, u16), Target, ahash::RandomState>>,
    calls: AtomicUsize,
}

impl StaticLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_field(&self, holder: KlassId, cp_index: u16, link: FieldLink) {
        self.define(holder, cp_index, Target::Field(link));
    }

    pub fn define_method(&self, holder: KlassId, cp_index: u16, link: MethodLink) {
        self.define(holder, cp_index, Target::Method(link));
    }

    pub fn define_call_site(
        &self,
        holder: KlassId,
        cp_index: u16,
        link: DynamicLink,
    ) {
        self.define(holder, cp_index, Target::CallSite(link));
    }

    pub fn define_class(&self, holder: KlassId, cp_index: u16, klass: KlassId) {
        self.define(holder, cp_index, Target::Class(klass));
    }

    pub fn define_constant(
        &self,
        holder: KlassId,
        cp_index: u16,
        value: ConstantValue,
    ) {
        self.define(holder, cp_index, Target::Constant(value));
    }

    /// Make the reference fail with `err` until it is redefined.
    pub fn define_failure(&self, holder: KlassId, cp_index: u16, err: LinkError) {
        self.define(holder, cp_index, Target::Failure(err));
    }

    /// Number of resolution requests served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn define(&self, holder: KlassId, cp_index: u16, target: Target) {
        self.table.write().insert((holder, cp_index), target);
    }

    fn lookup(&self, holder: KlassId, cp_index: u16) -> Option<Target> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.table.read().get(&(holder, cp_index)).cloned()
    }
}

fn describe(holder: KlassId, cp_index: u16) -> String {
    format!("{holder} cp#{cp_index}")
}

impl LinkResolver for StaticLinker {
    fn resolve_field(
        &self,
        holder: KlassId,
        cp_index: u16,
        access: FieldAccess,
    ) -> Result<FieldLink, LinkError> {
        match self.lookup(holder, cp_index) {
            Some(Target::Field(link)) => {
                if access == FieldAccess::Put && link.is_final && link.holder != holder {
                    return Err(LinkError::IncompatibleClassChange(format!(
                        "write to final field {}",
                        describe(holder, cp_index)
                    )));
                }
                Ok(link)
            }
            Some(Target::Failure(err)) => Err(err),
            _ => Err(LinkError::NoSuchField(describe(holder, cp_index))),
        }
    }

    fn resolve_method(
        &self,
        holder: KlassId,
        cp_index: u16,
        kind: InvokeKind,
    ) -> Result<MethodLink, LinkError> {
        match self.lookup(holder, cp_index) {
            Some(Target::Method(link)) => Ok(link),
            Some(Target::Failure(err)) => Err(err),
            Some(Target::CallSite(_)) => Err(LinkError::IncompatibleClassChange(
                format!("{kind:?} of call site {}", describe(holder, cp_index)),
            )),
            _ => Err(LinkError::NoSuchMethod(describe(holder, cp_index))),
        }
    }

    fn resolve_call_site(
        &self,
        holder: KlassId,
        cp_index: u16,
        _kind: InvokeKind,
    ) -> Result<DynamicLink, LinkError> {
        match self.lookup(holder, cp_index) {
            Some(Target::CallSite(link)) => Ok(link),
            Some(Target::Failure(err)) => Err(err),
            _ => Err(LinkError::NoSuchMethod(describe(holder, cp_index))),
        }
    }

    fn resolve_class(
        &self,
        holder: KlassId,
        cp_index: u16,
    ) -> Result<KlassId, LinkError> {
        match self.lookup(holder, cp_index) {
            Some(Target::Class(klass)) => Ok(klass),
            Some(Target::Failure(err)) => Err(err),
            _ => Err(LinkError::NoClassDef(describe(holder, cp_index))),
        }
    }

    fn resolve_constant(
        &self,
        holder: KlassId,
        cp_index: u16,
    ) -> Result<ConstantValue, LinkError> {
        match self.lookup(holder, cp_index) {
            Some(Target::Constant(value)) => Ok(value),
            Some(Target::Class(klass)) => Ok(ConstantValue::Class(klass)),
            Some(Target::Failure(err)) => Err(err),
            _ => Err(LinkError::NoClassDef(describe(holder, cp_index))),
        }
    }
}
