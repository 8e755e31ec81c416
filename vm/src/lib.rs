pub mod allocation;
pub mod compile;
pub mod error;
pub mod exceptions;
pub mod frame;
pub mod linker;
pub mod method;
pub mod monitor;
pub mod oops;
pub mod profile;
pub mod resolution;
pub mod runtime;
pub mod safepoint;
pub mod settings;
pub mod signature;
pub mod stubs;
pub mod thread;

pub use allocation::{AllocationError, AllocationRequest, BumpAllocator, HeapAllocator};
pub use compile::{
    CompileBroker, CompileQueue, CompileRequest, CompileTier, CompiledCode,
    Submission,
};
pub use error::{Exception, ExceptionKind, LinkError, VmResult};
pub use exceptions::Unwind;
pub use frame::{FrameView, LockSlot, LockSlotId, LockStack};
pub use linker::StaticLinker;
pub use method::{ExceptionHandler, Method, MethodFlags, MethodId, Signature};
pub use monitor::{MonitorError, MonitorManager, MonitorTable, ObjectMonitor};
pub use oops::{KlassId, ObjectRef, Value};
pub use profile::{
    CompilePolicy, MethodCounters, MethodData, Observation, ProfileController,
    TieredPolicy, TrapReason,
};
pub use resolution::{
    Binding, ConstantPoolCache, ConstantValue, Dispatch, DynamicLink,
    FieldLink, LinkResolver, MethodLink, Outcome, ResolutionCache, Resolved,
};
pub use runtime::{VM, VMCreateInfo};
pub use safepoint::SafepointCoordinator;
pub use settings::{RuntimeCreateInfo, RuntimeSettings, SettingsError};
pub use signature::{
    Fingerprint, HandlerAddress, SignatureGenerator, SignatureHandlerLibrary,
};
pub use stubs::{OutgoingArgs, X64SignatureGenerator, slow_signature_handler};
pub use thread::{ThreadId, VMThread};
