use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use bytecode::{BasicType, parse_method_descriptor};
use once_cell::race::OnceBox;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::compile::CompiledCode;
use crate::error::ExceptionKind;
use crate::oops::KlassId;
use crate::profile::{MethodCounters, MethodData};
use crate::resolution::ConstantPoolCache;
use crate::signature::HandlerAddress;

static NEXT_METHOD_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl MethodId {
    fn next() -> Self {
        Self(NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u16 {
        const STATIC = 1 << 0;
        const NATIVE = 1 << 1;
        const SYNCHRONIZED = 1 << 2;
        const ABSTRACT = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<BasicType>,
    pub ret: BasicType,
}

impl Signature {
    pub fn new(params: Vec<BasicType>, ret: BasicType) -> Self {
        Self { params, ret }
    }

    /// Parse a descriptor such as `(IJ)V`.
    pub fn parse(descriptor: &str) -> Option<Self> {
        let (params, ret) = parse_method_descriptor(descriptor)?;
        Some(Self { params, ret })
    }

    /// Interpreter slots taken by the arguments, receiver included.
    pub fn parameter_slots(&self, is_static: bool) -> usize {
        let receiver = usize::from(!is_static);
        receiver + self.params.iter().map(|t| t.slots()).sum::<usize>()
    }
}

/// One row of a method's exception table. `catch: None` catches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_bci: usize,
    pub end_bci: usize,
    pub handler_bci: usize,
    pub catch: Option<ExceptionKind>,
}

impl ExceptionHandler {
    pub fn covers(&self, bci: usize, kind: ExceptionKind) -> bool {
        (self.start_bci..self.end_bci).contains(&bci)
            && self.catch.is_none_or(|catch| kind.is_subtype_of(catch))
    }
}

/// Installed compiled code of a method.
#[derive(Default)]
struct CodeSlots {
    standard: Option<Arc<CompiledCode>>,
    osr: Vec<Arc<CompiledCode>>,
}

pub struct Method {
    id: MethodId,
    name: String,
    holder: KlassId,
    flags: MethodFlags,
    signature: Signature,
    code: Vec<u8>,
    max_locals: usize,
    max_monitors: usize,
    cp_cache: Arc<ConstantPoolCache>,
    handlers: Vec<ExceptionHandler>,
    counters: OnceBox<MethodCounters>,
    data: OnceBox<MethodData>,
    native_handler: OnceCell<HandlerAddress>,
    compiled: RwLock<CodeSlots>,
}

impl Method {
    pub fn builder(
        name: impl Into<String>,
        signature: Signature,
    ) -> MethodBuilder {
        MethodBuilder::new(name, signature)
    }

    #[inline]
    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn holder(&self) -> KlassId {
        self.holder
    }

    #[inline]
    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    #[inline]
    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[inline]
    pub fn max_locals(&self) -> usize {
        self.max_locals
    }

    #[inline]
    pub fn max_monitors(&self) -> usize {
        self.max_monitors
    }

    pub fn cp_cache(&self) -> &Arc<ConstantPoolCache> {
        &self.cp_cache
    }

    pub fn exception_handlers(&self) -> &[ExceptionHandler] {
        &self.handlers
    }

    // ── profiling ──────────────────────────────────────────────────

    /// Counters, if they have been allocated.
    pub fn counters(&self) -> Option<&MethodCounters> {
        self.counters.get()
    }

    /// Attach `counters` unless another thread already did. Returns
    /// `false` if ours were dropped.
    pub(crate) fn install_counters(&self, counters: MethodCounters) -> bool {
        self.counters.set(Box::new(counters)).is_ok()
    }

    pub fn method_data(&self) -> Option<&MethodData> {
        self.data.get()
    }

    pub(crate) fn method_data_or_init(
        &self,
        init: impl FnOnce() -> MethodData,
    ) -> &MethodData {
        self.data.get_or_init(|| Box::new(init()))
    }

    // ── native calls ───────────────────────────────────────────────

    pub fn native_handler(&self) -> Option<HandlerAddress> {
        self.native_handler.get().copied()
    }

    /// Attach a signature handler. The first attached handler sticks;
    /// returns the handler the method ends up with.
    pub(crate) fn attach_native_handler(
        &self,
        handler: HandlerAddress,
    ) -> HandlerAddress {
        *self.native_handler.get_or_init(|| handler)
    }

    // ── compiled code ──────────────────────────────────────────────

    pub fn compiled_code(&self) -> Option<Arc<CompiledCode>> {
        self.compiled
            .read()
            .standard
            .as_ref()
            .filter(|code| code.is_in_use())
            .cloned()
    }

    /// In-use on-stack-replacement code entering at `bci`.
    pub fn osr_code_at(&self, bci: usize) -> Option<Arc<CompiledCode>> {
        self.compiled
            .read()
            .osr
            .iter()
            .find(|code| code.osr_bci() == Some(bci) && code.is_in_use())
            .cloned()
    }

    pub fn install_code(&self, code: Arc<CompiledCode>) {
        let mut slots = self.compiled.write();
        match code.osr_bci() {
            Some(bci) => {
                log::debug!("{self}: installed OSR code at bci {bci}");
                slots.osr.retain(|old| old.osr_bci() != Some(bci));
                slots.osr.push(code);
            }
            None => {
                log::debug!("{self}: installed {:?} code", code.tier());
                slots.standard = Some(code);
            }
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.holder, self.name)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

pub struct MethodBuilder {
    name: String,
    holder: KlassId,
    flags: MethodFlags,
    signature: Signature,
    code: Vec<u8>,
    max_locals: Option<usize>,
    max_monitors: usize,
    cp_cache: Option<Arc<ConstantPoolCache>>,
    handlers: Vec<ExceptionHandler>,
}

impl MethodBuilder {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: name.into(),
            holder: KlassId(0),
            flags: MethodFlags::empty(),
            signature,
            code: Vec::new(),
            max_locals: None,
            max_monitors: 0,
            cp_cache: None,
            handlers: Vec::new(),
        }
    }

    pub fn holder(mut self, holder: KlassId) -> Self {
        self.holder = holder;
        self
    }

    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.code = code;
        self
    }

    pub fn max_locals(mut self, max_locals: usize) -> Self {
        self.max_locals = Some(max_locals);
        self
    }

    pub fn max_monitors(mut self, max_monitors: usize) -> Self {
        self.max_monitors = max_monitors;
        self
    }

    pub fn cp_cache(mut self, cache: Arc<ConstantPoolCache>) -> Self {
        self.cp_cache = Some(cache);
        self
    }

    pub fn exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Arc<Method> {
        let is_static = self.flags.contains(MethodFlags::STATIC);
        let arg_slots = self.signature.parameter_slots(is_static);
        // a synchronized method holds its receiver lock in a slot too
        let max_monitors = self.max_monitors
            + usize::from(self.flags.contains(MethodFlags::SYNCHRONIZED));
        let holder = self.holder;
        Arc::new(Method {
            id: MethodId::next(),
            name: self.name,
            holder,
            flags: self.flags,
            signature: self.signature,
            code: self.code,
            max_locals: self.max_locals.unwrap_or(arg_slots).max(arg_slots),
            max_monitors,
            cp_cache: self.cp_cache.unwrap_or_else(|| {
                Arc::new(ConstantPoolCache::new(holder, []))
            }),
            handlers: self.handlers,
            counters: OnceBox::new(),
            data: OnceBox::new(),
            native_handler: OnceCell::new(),
            compiled: RwLock::new(CodeSlots::default()),
        })
    }
}
