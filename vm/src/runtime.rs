use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytecode::Instruction;

use crate::allocation::{AllocationRequest, HeapAllocator, array_length};
use crate::compile::{CompileQueue, CompiledCode};
use crate::error::{Exception, ExceptionKind, VmResult};
use crate::exceptions::{self, Unwind};
use crate::method::Method;
use crate::monitor::{MonitorManager, ObjectMonitor};
use crate::oops::{KlassId, ObjectRef};
use crate::profile::{CompilePolicy, Observation, ProfileController, TieredPolicy, TrapReason};
use crate::resolution::{Binding, ConstantValue, LinkResolver, ResolutionCache, Resolved};
use crate::safepoint::SafepointCoordinator;
use crate::settings::{RuntimeCreateInfo, RuntimeSettings, SettingsError};
use crate::signature::{HandlerAddress, SignatureGenerator, SignatureHandlerLibrary};
use crate::stubs::X64SignatureGenerator;
use crate::thread::{StackGuard, ThreadId, VMThread};

/// Collaborators and overrides for [`VM::new`].
pub struct VMCreateInfo {
    pub runtime: RuntimeCreateInfo,
    pub linker: Arc<dyn LinkResolver>,
    pub allocator: Arc<dyn HeapAllocator>,
    pub monitors: Arc<dyn ObjectMonitor>,
    pub compile_queue: Arc<dyn CompileQueue>,
    /// Defaults to [`TieredPolicy`].
    pub policy: Option<Arc<dyn CompilePolicy>>,
    /// Defaults to [`X64SignatureGenerator`].
    pub generator: Option<Box<dyn SignatureGenerator>>,
}

impl VMCreateInfo {
    pub fn new(
        linker: Arc<dyn LinkResolver>,
        allocator: Arc<dyn HeapAllocator>,
        monitors: Arc<dyn ObjectMonitor>,
        compile_queue: Arc<dyn CompileQueue>,
    ) -> Self {
        Self {
            runtime: RuntimeCreateInfo::default(),
            linker,
            allocator,
            monitors,
            compile_queue,
            policy: None,
            generator: None,
        }
    }
}

/// The slow-path runtime. One per process; shared by every attached thread.
///
/// Each entry point corresponds to a bytecode or event the dispatch loop
/// cannot handle inline and operates on the calling thread's top frame.
pub struct VM {
    settings: RuntimeSettings,
    resolution: ResolutionCache,
    signatures: SignatureHandlerLibrary,
    monitors: MonitorManager,
    profile: ProfileController,
    safepoints: Arc<SafepointCoordinator>,
    allocator: Arc<dyn HeapAllocator>,
    next_thread: AtomicU64,
}

impl VM {
    pub fn new(info: VMCreateInfo) -> Result<Self, SettingsError> {
        let settings = RuntimeSettings::new(info.runtime)?;
        let safepoints = Arc::new(SafepointCoordinator::new());
        let policy = info
            .policy
            .unwrap_or_else(|| Arc::new(TieredPolicy::new(&settings)));
        let generator = info
            .generator
            .unwrap_or_else(|| Box::new(X64SignatureGenerator));
        log::debug!("runtime settings: {settings:?}");

        Ok(Self {
            resolution: ResolutionCache::new(info.linker),
            signatures: SignatureHandlerLibrary::new(&settings, generator),
            monitors: MonitorManager::new(info.monitors, safepoints.clone()),
            profile: ProfileController::new(&settings, policy, info.compile_queue),
            safepoints,
            allocator: info.allocator,
            next_thread: AtomicU64::new(1),
            settings,
        })
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn resolution(&self) -> &ResolutionCache {
        &self.resolution
    }

    pub fn signatures(&self) -> &SignatureHandlerLibrary {
        &self.signatures
    }

    pub fn monitors(&self) -> &MonitorManager {
        &self.monitors
    }

    pub fn profile(&self) -> &ProfileController {
        &self.profile
    }

    pub fn safepoints(&self) -> &Arc<SafepointCoordinator> {
        &self.safepoints
    }

    /// Register a mutator thread. It stays attached until dropped.
    pub fn attach_thread(&self) -> VMThread {
        let id = ThreadId(self.next_thread.fetch_add(1, Ordering::Relaxed));
        log::debug!("{id} attached");
        VMThread::new(
            id,
            StackGuard::new(self.settings.stack_limit, self.settings.stack_reserve),
            self.safepoints.clone(),
        )
    }

    // ── calls ──────────────────────────────────────────────────────

    /// Push an activation of `method`, locking `lock_object` first if the
    /// method is synchronized. Returns compiled code to continue in, if the
    /// method has any.
    pub fn enter_method(
        &self,
        thread: &mut VMThread,
        method: Arc<Method>,
        lock_object: Option<ObjectRef>,
    ) -> VmResult<Option<Arc<CompiledCode>>> {
        thread.push_frame(method.clone())?;
        if method.is_synchronized() {
            if let Err(err) = self.monitor_enter(thread, lock_object) {
                thread.pop_frame();
                return Err(err);
            }
        }
        if self.profile.count_invocation(&method) {
            self.profile.record_overflow(thread, None)?;
        }
        Ok(method.compiled_code())
    }

    /// Pop the top activation, releasing its monitors. A frame that still
    /// holds monitors it did not take on entry raises
    /// `IllegalMonitorStateException` after they are released.
    pub fn exit_method(&self, thread: &mut VMThread) -> VmResult<()> {
        let id = thread.id();
        let Some(mut frame) = thread.pop_frame() else {
            return Err(Exception::new(
                ExceptionKind::InternalError,
                format!("{id}: return without a frame"),
            ));
        };
        let expected = usize::from(frame.method().is_synchronized());
        let released = self.monitors.release_frame_monitors(id, frame.locks_mut());
        if released.len() != expected {
            return Err(exceptions::illegal_monitor_state(format!(
                "{} returned with {} of {expected} expected monitors held",
                frame.method(),
                released.len()
            )));
        }
        Ok(())
    }

    // ── resolution ─────────────────────────────────────────────────

    pub fn resolve_field_access(&self, thread: &mut VMThread) -> VmResult<Resolved> {
        let view = thread.frame_view()?;
        self.resolution.resolve_field_access(view.site()?)
    }

    pub fn resolve_invocation(&self, thread: &mut VMThread) -> VmResult<Resolved> {
        let view = thread.frame_view()?;
        self.resolution.resolve_invocation(view.site()?)
    }

    /// Resolve whatever cache-indexed bytecode sits at the current bci.
    pub fn resolve_from_cache(&self, thread: &mut VMThread) -> VmResult<Resolved> {
        let view = thread.frame_view()?;
        self.resolution.resolve_from_cache(view.site()?)
    }

    pub fn resolve_ldc(&self, thread: &mut VMThread) -> VmResult<ConstantValue> {
        let view = thread.frame_view()?;
        match self.resolution.resolve_constant(view.site()?)?.binding {
            Binding::Constant(value) => Ok(value),
            other => Err(mismatched(other, "constant")),
        }
    }

    /// Class operand of `CheckCast`, `InstanceOf` or an allocation.
    pub fn quicken_class(&self, thread: &mut VMThread) -> VmResult<KlassId> {
        let view = thread.frame_view()?;
        let resolved = self.resolution.resolve_class(view.site()?)?;
        resolved
            .binding
            .as_class()
            .ok_or_else(|| mismatched(resolved.binding, "class"))
    }

    // ── native calls ───────────────────────────────────────────────

    /// Signature handler for a native method, generated on first use.
    pub fn prepare_native_call(&self, method: &Method) -> VmResult<HandlerAddress> {
        if !method.is_native() {
            return Err(Exception::new(
                ExceptionKind::InternalError,
                format!("{method} is not native"),
            ));
        }
        Ok(self.signatures.obtain_handler(method))
    }

    // ── monitors ───────────────────────────────────────────────────

    pub fn monitor_enter(
        &self,
        thread: &mut VMThread,
        object: Option<ObjectRef>,
    ) -> VmResult<()> {
        let id = thread.id();
        let mut view = thread.frame_view()?;
        let locks = view.locks_mut();
        let slot = locks.allocate().ok_or_else(|| {
            Exception::new(ExceptionKind::InternalError, "lock slots exhausted")
        })?;
        self.monitors.monitor_enter(id, locks, slot, object)
    }

    pub fn monitor_exit(
        &self,
        thread: &mut VMThread,
        object: Option<ObjectRef>,
    ) -> VmResult<()> {
        let Some(object) = object else {
            return Err(exceptions::null_pointer("monitorexit on null"));
        };
        let id = thread.id();
        let mut view = thread.frame_view()?;
        let Some(slot) = view.locks().find(object) else {
            return Err(exceptions::illegal_monitor_state(format!(
                "{object} is not locked in this frame"
            )));
        };
        self.monitors.monitor_exit(id, view.locks_mut(), slot)
    }

    // ── profiling ──────────────────────────────────────────────────

    /// Counter overflow at method entry (`branch_bci: None`) or on a taken
    /// back-edge. Returns on-stack-replacement code to migrate to.
    pub fn frequency_counter_overflow(
        &self,
        thread: &mut VMThread,
        branch_bci: Option<usize>,
    ) -> VmResult<Option<Arc<CompiledCode>>> {
        self.profile.record_overflow(thread, branch_bci)
    }

    /// Count a taken back-edge in the top frame and handle an overflow.
    pub fn backedge(
        &self,
        thread: &mut VMThread,
        branch_bci: usize,
    ) -> VmResult<Option<Arc<CompiledCode>>> {
        let method = thread.frame_view()?.method().clone();
        if !self.profile.count_backedge(&method) {
            return Ok(None);
        }
        self.profile.record_overflow(thread, Some(branch_bci))
    }

    pub fn record_profile(
        &self,
        thread: &mut VMThread,
        observation: Observation,
    ) -> VmResult<()> {
        self.profile.record_profile(thread, observation)
    }

    pub fn update_mdp_for_ret(
        &self,
        thread: &mut VMThread,
        target_bci: usize,
    ) -> VmResult<()> {
        self.profile.update_mdp_for_ret(thread, target_bci)
    }

    pub fn note_trap(&self, thread: &mut VMThread, reason: TrapReason) -> VmResult<u32> {
        self.profile.note_trap(thread, reason)
    }

    // ── safepoints and exceptions ─────────────────────────────────

    pub fn at_safepoint(&self, thread: &VMThread) -> bool {
        let parked = self.safepoints.poll();
        if parked {
            log::trace!("{}: resumed after safepoint", thread.id());
        }
        parked
    }

    /// Unwind the thread's pending exception to its handler.
    pub fn exception_handler_for_exception(
        &self,
        thread: &mut VMThread,
    ) -> VmResult<Unwind> {
        let Some(exception) = thread.take_pending_exception() else {
            return Err(Exception::new(
                ExceptionKind::InternalError,
                format!("{}: no pending exception", thread.id()),
            ));
        };
        Ok(exceptions::exception_handler_for_exception(
            thread,
            &self.monitors,
            exception,
        ))
    }

    // ── allocation ─────────────────────────────────────────────────

    pub fn new_instance(&self, thread: &mut VMThread) -> VmResult<ObjectRef> {
        let klass = self.quicken_class(thread)?;
        Ok(self.allocator.allocate(&AllocationRequest::Instance(klass))?)
    }

    pub fn new_array(&self, thread: &mut VMThread, length: i32) -> VmResult<ObjectRef> {
        let element = match thread.frame_view()?.instruction()? {
            Instruction::NewArray { elem } => elem,
            other => {
                return Err(Exception::new(
                    ExceptionKind::InternalError,
                    format!("{other} is not a primitive array allocation"),
                ));
            }
        };
        let length = array_length(length)?;
        Ok(self
            .allocator
            .allocate(&AllocationRequest::Array { element, length })?)
    }

    pub fn anew_array(&self, thread: &mut VMThread, length: i32) -> VmResult<ObjectRef> {
        let length = array_length(length)?;
        let element = self.quicken_class(thread)?;
        Ok(self
            .allocator
            .allocate(&AllocationRequest::ObjectArray { element, length })?)
    }

    /// `dims` are the popped dimension operands, outermost first.
    pub fn multi_anew_array(
        &self,
        thread: &mut VMThread,
        dims: &[i32],
    ) -> VmResult<ObjectRef> {
        let expected = thread.frame_view()?.number_of_dimensions()?;
        if dims.len() != usize::from(expected) {
            return Err(Exception::new(
                ExceptionKind::InternalError,
                format!("{} dimensions given, instruction has {expected}", dims.len()),
            ));
        }
        let dims = dims
            .iter()
            .map(|&d| array_length(d))
            .collect::<VmResult<Vec<_>>>()?;
        let klass = self.quicken_class(thread)?;
        Ok(self
            .allocator
            .allocate(&AllocationRequest::MultiArray { klass, dims })?)
    }
}

fn mismatched(binding: Binding, wanted: &str) -> Exception {
    Exception::new(
        ExceptionKind::InternalError,
        format!("expected {wanted} binding, found {binding:?}"),
    )
}
