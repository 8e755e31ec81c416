//! Constant-pool cache entries and their lazy, lock-free resolution.
//!
//! Every entry is resolved at most once in effect: threads racing on the
//! same unresolved site may all consult the linker, but only the first
//! publish sticks and the others adopt the winner's binding. A binding is
//! published as one boxed value through [`OnceBox`], so readers never see
//! a partially written entry. Linkage failures are not recorded; an
//! unresolved site retries on every execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;
use bytecode::{BasicType, Op};
use once_cell::race::OnceBox;

use crate::error::{Exception, ExceptionKind, LinkError, VmResult};
use crate::method::MethodId;
use crate::oops::{KlassId, ObjectRef};

bitflags! {
    /// Bytecode families an entry has been resolved for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResolvedBytecodes: u8 {
        const GET = 1 << 0;
        const PUT = 1 << 1;
        const INVOKE = 1 << 2;
        const CLASS = 1 << 3;
        const CONSTANT = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccess {
    Get,
    Put,
}

impl FieldAccess {
    fn bytecode(self) -> ResolvedBytecodes {
        match self {
            FieldAccess::Get => ResolvedBytecodes::GET,
            FieldAccess::Put => ResolvedBytecodes::PUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Virtual,
    Special,
    Static,
    Interface,
    Dynamic,
    Handle,
}

impl InvokeKind {
    pub fn from_op(op: Op) -> Option<Self> {
        Some(match op {
            Op::InvokeVirtual => InvokeKind::Virtual,
            Op::InvokeSpecial => InvokeKind::Special,
            Op::InvokeStatic => InvokeKind::Static,
            Op::InvokeInterface => InvokeKind::Interface,
            Op::InvokeDynamic => InvokeKind::Dynamic,
            Op::InvokeHandle => InvokeKind::Handle,
            _ => return None,
        })
    }

    /// Call-site linked kinds carry an appendix instead of a plain target.
    pub fn is_call_site(self) -> bool {
        matches!(self, InvokeKind::Dynamic | InvokeKind::Handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLink {
    pub holder: KlassId,
    pub offset: u32,
    pub field_type: BasicType,
    pub is_volatile: bool,
    pub is_final: bool,
    pub is_static: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Statically bound target.
    Direct,
    VTable(u32),
    ITable { interface: KlassId, index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodLink {
    pub target: MethodId,
    pub holder: KlassId,
    pub entry: usize,
    pub dispatch: Dispatch,
    /// Argument slots, receiver included.
    pub parameter_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicLink {
    pub adapter: MethodLink,
    pub appendix: Option<ObjectRef>,
}

impl DynamicLink {
    /// Argument slots the call consumes, counting the pushed appendix.
    pub fn parameter_size(&self) -> u16 {
        self.adapter.parameter_size + u16::from(self.appendix.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstantValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(ObjectRef),
    Class(KlassId),
}

/// A published binding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Binding {
    Field(FieldLink),
    Method(InvokeKind, MethodLink),
    Dynamic(InvokeKind, DynamicLink),
    Class(KlassId),
    Constant(ConstantValue),
}

impl Binding {
    pub fn as_field(&self) -> Option<&FieldLink> {
        match self {
            Binding::Field(link) => Some(link),
            _ => None,
        }
    }

    pub fn as_method(&self) -> Option<&MethodLink> {
        match self {
            Binding::Method(_, link) => Some(link),
            Binding::Dynamic(_, link) => Some(&link.adapter),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<KlassId> {
        match self {
            Binding::Class(klass) => Some(*klass),
            _ => None,
        }
    }
}

/// How a resolution call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The entry was already resolved for this bytecode; no linker call.
    Cached,
    /// This thread's binding was published.
    Published,
    /// Another binding was already published; ours was discarded.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolved {
    pub binding: Binding,
    pub outcome: Outcome,
}

/// One symbolic reference site.
pub struct CpCacheEntry {
    cp_index: u16,
    binding: OnceBox<Binding>,
    resolved: AtomicU8,
}

impl CpCacheEntry {
    pub fn new(cp_index: u16) -> Self {
        Self {
            cp_index,
            binding: OnceBox::new(),
            resolved: AtomicU8::new(0),
        }
    }

    #[inline]
    pub fn cp_index(&self) -> u16 {
        self.cp_index
    }

    /// The published binding, if any.
    #[inline]
    pub fn binding(&self) -> Option<&Binding> {
        self.binding.get()
    }

    #[inline]
    pub fn resolved_bytecodes(&self) -> ResolvedBytecodes {
        ResolvedBytecodes::from_bits_truncate(
            self.resolved.load(Ordering::Acquire),
        )
    }

    #[inline]
    pub fn is_resolved(&self, bytecode: ResolvedBytecodes) -> bool {
        self.resolved_bytecodes().contains(bytecode)
    }

    /// Publish `binding` unless one is already present, then mark
    /// `bytecode` resolved. The returned reference is the binding that won.
    fn publish(
        &self,
        binding: Binding,
        bytecode: ResolvedBytecodes,
    ) -> (&Binding, Outcome) {
        let outcome = match self.binding.set(Box::new(binding)) {
            Ok(()) => Outcome::Published,
            Err(_) => Outcome::Discarded,
        };
        // binding is set before the bit, so a reader that sees the bit also
        // sees the binding
        self.resolved.fetch_or(bytecode.bits(), Ordering::Release);
        // already initialized at this point, so the closure never runs
        (self.binding.get_or_init(|| Box::new(binding)), outcome)
    }
}

impl core::fmt::Debug for CpCacheEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpCacheEntry")
            .field("cp_index", &self.cp_index)
            .field("resolved", &self.resolved_bytecodes())
            .field("binding", &self.binding())
            .finish()
    }
}

/// Per-class table of cache entries, indexed by the bytecode operand.
#[derive(Debug)]
pub struct ConstantPoolCache {
    holder: KlassId,
    entries: Box<[CpCacheEntry]>,
}

impl ConstantPoolCache {
    pub fn new(
        holder: KlassId,
        cp_indices: impl IntoIterator<Item = u16>,
    ) -> Self {
        Self {
            holder,
            entries: cp_indices.into_iter().map(CpCacheEntry::new).collect(),
        }
    }

    #[inline]
    pub fn holder(&self) -> KlassId {
        self.holder
    }

    #[inline]
    pub fn entry(&self, index: u16) -> Option<&CpCacheEntry> {
        self.entries.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The symbol and linkage resolver.
pub trait LinkResolver: Send + Sync {
    fn resolve_field(
        &self,
        holder: KlassId,
        cp_index: u16,
        access: FieldAccess,
    ) -> Result<FieldLink, LinkError>;

    fn resolve_method(
        &self,
        holder: KlassId,
        cp_index: u16,
        kind: InvokeKind,
    ) -> Result<MethodLink, LinkError>;

    /// Link an `InvokeDynamic` or `InvokeHandle` site.
    fn resolve_call_site(
        &self,
        holder: KlassId,
        cp_index: u16,
        kind: InvokeKind,
    ) -> Result<DynamicLink, LinkError>;

    fn resolve_class(
        &self,
        holder: KlassId,
        cp_index: u16,
    ) -> Result<KlassId, LinkError>;

    fn resolve_constant(
        &self,
        holder: KlassId,
        cp_index: u16,
    ) -> Result<ConstantValue, LinkError>;
}

/// A bytecode location that references a cache entry.
#[derive(Clone, Copy)]
pub struct Site<'a> {
    pub cache: &'a ConstantPoolCache,
    pub index: u16,
    pub op: Op,
}

impl<'a> Site<'a> {
    fn entry(&self) -> VmResult<&'a CpCacheEntry> {
        self.cache.entry(self.index).ok_or_else(|| {
            Exception::new(
                ExceptionKind::InternalError,
                format!("cache index {} out of range", self.index),
            )
        })
    }
}

pub struct ResolutionCache {
    linker: Arc<dyn LinkResolver>,
}

impl ResolutionCache {
    pub fn new(linker: Arc<dyn LinkResolver>) -> Self {
        Self { linker }
    }

    /// Resolve the field referenced by a get/put site.
    pub fn resolve_field_access(&self, site: Site<'_>) -> VmResult<Resolved> {
        let (access, is_static) = match site.op {
            Op::GetField => (FieldAccess::Get, false),
            Op::PutField => (FieldAccess::Put, false),
            Op::GetStatic => (FieldAccess::Get, true),
            Op::PutStatic => (FieldAccess::Put, true),
            op => return Err(unexpected(op, "field access")),
        };
        let entry = site.entry()?;
        let bytecode = access.bytecode();
        if let Some(cached) = cached(entry, bytecode) {
            return Ok(cached);
        }

        let link = self.linker.resolve_field(
            site.cache.holder(),
            entry.cp_index(),
            access,
        )?;
        if link.is_static != is_static {
            return Err(Exception::new(
                ExceptionKind::IncompatibleClassChangeError,
                format!(
                    "expected {} field at cp#{}",
                    if is_static { "static" } else { "non-static" },
                    entry.cp_index()
                ),
            ));
        }
        Ok(self.publish(site, entry, Binding::Field(link), bytecode))
    }

    /// Resolve the target of an invoke site.
    pub fn resolve_invocation(&self, site: Site<'_>) -> VmResult<Resolved> {
        let Some(kind) = InvokeKind::from_op(site.op) else {
            return Err(unexpected(site.op, "invoke"));
        };
        let entry = site.entry()?;
        let bytecode = ResolvedBytecodes::INVOKE;
        if let Some(cached) = cached(entry, bytecode) {
            return Ok(cached);
        }

        let holder = site.cache.holder();
        let binding = if kind.is_call_site() {
            let link =
                self.linker.resolve_call_site(holder, entry.cp_index(), kind)?;
            Binding::Dynamic(kind, link)
        } else {
            let link =
                self.linker.resolve_method(holder, entry.cp_index(), kind)?;
            check_dispatch(kind, &link)?;
            Binding::Method(kind, link)
        };
        Ok(self.publish(site, entry, binding, bytecode))
    }

    /// Resolve the class operand of `New`, `ANewArray`, `MultiANewArray`,
    /// `CheckCast` or `InstanceOf`.
    pub fn resolve_class(&self, site: Site<'_>) -> VmResult<Resolved> {
        if !matches!(
            site.op,
            Op::New
                | Op::ANewArray
                | Op::MultiANewArray
                | Op::CheckCast
                | Op::InstanceOf
        ) {
            return Err(unexpected(site.op, "class reference"));
        }
        let entry = site.entry()?;
        let bytecode = ResolvedBytecodes::CLASS;
        if let Some(cached) = cached(entry, bytecode) {
            return Ok(cached);
        }
        let klass =
            self.linker.resolve_class(site.cache.holder(), entry.cp_index())?;
        Ok(self.publish(site, entry, Binding::Class(klass), bytecode))
    }

    /// Resolve the constant loaded by `Ldc`.
    pub fn resolve_constant(&self, site: Site<'_>) -> VmResult<Resolved> {
        if site.op != Op::Ldc {
            return Err(unexpected(site.op, "constant load"));
        }
        let entry = site.entry()?;
        let bytecode = ResolvedBytecodes::CONSTANT;
        if let Some(cached) = cached(entry, bytecode) {
            return Ok(cached);
        }
        let value = self
            .linker
            .resolve_constant(site.cache.holder(), entry.cp_index())?;
        Ok(self.publish(site, entry, Binding::Constant(value), bytecode))
    }

    /// Dispatch on the bytecode at the site.
    pub fn resolve_from_cache(&self, site: Site<'_>) -> VmResult<Resolved> {
        match site.op {
            op if op.is_field_access() => self.resolve_field_access(site),
            op if op.is_invoke() => self.resolve_invocation(site),
            Op::Ldc => self.resolve_constant(site),
            Op::New
            | Op::ANewArray
            | Op::MultiANewArray
            | Op::CheckCast
            | Op::InstanceOf => self.resolve_class(site),
            op => Err(unexpected(op, "cache-indexed instruction")),
        }
    }

    fn publish(
        &self,
        site: Site<'_>,
        entry: &CpCacheEntry,
        binding: Binding,
        bytecode: ResolvedBytecodes,
    ) -> Resolved {
        let (winner, outcome) = entry.publish(binding, bytecode);
        match outcome {
            Outcome::Published => log::trace!(
                "{:?} cp#{} resolved: {winner:?}",
                site.op,
                entry.cp_index()
            ),
            _ => log::trace!(
                "{:?} cp#{} lost publish race",
                site.op,
                entry.cp_index()
            ),
        }
        Resolved {
            binding: *winner,
            outcome,
        }
    }
}

fn cached(entry: &CpCacheEntry, bytecode: ResolvedBytecodes) -> Option<Resolved> {
    if !entry.is_resolved(bytecode) {
        return None;
    }
    entry.binding().map(|binding| Resolved {
        binding: *binding,
        outcome: Outcome::Cached,
    })
}

fn check_dispatch(kind: InvokeKind, link: &MethodLink) -> VmResult<()> {
    let ok = match (kind, link.dispatch) {
        (InvokeKind::Static | InvokeKind::Special, Dispatch::Direct) => true,
        (InvokeKind::Static | InvokeKind::Special, _) => false,
        (InvokeKind::Virtual, Dispatch::ITable { .. }) => false,
        (InvokeKind::Interface, Dispatch::VTable(_)) => false,
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(Exception::new(
            ExceptionKind::IncompatibleClassChangeError,
            format!("{kind:?} call linked with {:?} dispatch", link.dispatch),
        ))
    }
}

fn unexpected(op: Op, wanted: &str) -> Exception {
    Exception::new(
        ExceptionKind::InternalError,
        format!("{op:?} is not a {wanted}"),
    )
}
