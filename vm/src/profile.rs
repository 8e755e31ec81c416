//! Execution counters, per-bytecode profile data and escalation to the
//! compiler. Every update here is best effort: counters are bumped with
//! relaxed loads and stores and may lose increments under contention, and
//! a profile that cannot be allocated is simply not collected.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bytecode::{BytecodeDecoder, Instruction};

use crate::compile::{CompileQueue, CompileRequest, CompileTier, CompiledCode, Submission};
use crate::error::VmResult;
use crate::method::Method;
use crate::oops::KlassId;
use crate::settings::RuntimeSettings;
use crate::thread::VMThread;

/// Saturating event counter.
#[derive(Debug, Default)]
pub struct InvocationCounter(AtomicU32);

impl InvocationCounter {
    #[inline]
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Bump the counter and return the new count.
    #[inline]
    pub fn increment(&self) -> u32 {
        let next = self.count().saturating_add(1);
        self.0.store(next, Ordering::Relaxed);
        next
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct MethodCounters {
    pub invocations: InvocationCounter,
    pub backedges: InvocationCounter,
}

impl MethodCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// Call count of a statically bound call.
    Counter,
    Jump,
    Branch,
    /// Receiver or checked type rows of a virtual call or type check.
    Receiver,
    /// Return targets of a subroutine return.
    Ret,
}

const PROFILE_ROWS: usize = 2;

/// One keyed row. A key of zero marks an empty row.
#[derive(Debug, Default)]
struct Row {
    key: AtomicU64,
    count: AtomicU32,
}

/// Profile cell of one bytecode.
#[derive(Debug)]
pub struct DataCell {
    bci: usize,
    kind: CellKind,
    count: AtomicU32,
    /// Not-taken count for branches, row misses for keyed cells.
    other: AtomicU32,
    rows: [Row; PROFILE_ROWS],
}

impl DataCell {
    fn new(bci: usize, kind: CellKind) -> Self {
        Self {
            bci,
            kind,
            count: AtomicU32::new(0),
            other: AtomicU32::new(0),
            rows: Default::default(),
        }
    }

    #[inline]
    pub fn bci(&self) -> usize {
        self.bci
    }

    #[inline]
    pub fn kind(&self) -> CellKind {
        self.kind
    }

    /// Executions, or taken count for branches and jumps.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn not_taken(&self) -> u32 {
        self.other.load(Ordering::Relaxed)
    }

    /// Observations that found no free row.
    pub fn polymorphic(&self) -> u32 {
        self.other.load(Ordering::Relaxed)
    }

    pub fn receivers(&self) -> Vec<(KlassId, u32)> {
        self.rows()
            .map(|(key, count)| (KlassId((key - 1) as u32), count))
            .collect()
    }

    pub fn ret_targets(&self) -> Vec<(usize, u32)> {
        self.rows()
            .map(|(key, count)| ((key - 1) as usize, count))
            .collect()
    }

    fn rows(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.rows.iter().filter_map(|row| {
            let key = row.key.load(Ordering::Acquire);
            (key != 0).then(|| (key, row.count.load(Ordering::Relaxed)))
        })
    }

    fn bump(counter: &AtomicU32) {
        let next = counter.load(Ordering::Relaxed).saturating_add(1);
        counter.store(next, Ordering::Relaxed);
    }

    fn record_row(&self, key: u64) {
        let key = key + 1;
        for row in &self.rows {
            let current = row.key.load(Ordering::Acquire);
            let claimed = current == key
                || (current == 0
                    && match row.key.compare_exchange(
                        0,
                        key,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => true,
                        Err(winner) => winner == key,
                    });
            if claimed {
                Self::bump(&row.count);
                return;
            }
        }
        Self::bump(&self.other);
    }

    /// Apply `observation`. Returns `false` if it does not fit the cell.
    fn record(&self, observation: Observation) -> bool {
        match (self.kind, observation) {
            (CellKind::Branch, Observation::Branch { taken: true })
            | (CellKind::Jump, Observation::Jump)
            | (CellKind::Counter | CellKind::Receiver, Observation::Call) => {
                Self::bump(&self.count)
            }
            (CellKind::Branch, Observation::Branch { taken: false }) => {
                Self::bump(&self.other)
            }
            (CellKind::Receiver, Observation::Receiver(klass)) => {
                Self::bump(&self.count);
                self.record_row(u64::from(klass.0));
            }
            (CellKind::Ret, Observation::Ret { target_bci }) => {
                Self::bump(&self.count);
                self.record_row(target_bci as u64);
            }
            _ => return false,
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReason {
    NullCheck,
    RangeCheck,
    ClassCheck,
    /// Array store of an incompatible element.
    ArrayCheck,
    Division,
}

impl TrapReason {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-method profile, one cell per profiled bytecode in bci order. A
/// cell's position is its data index.
#[derive(Debug)]
pub struct MethodData {
    cells: Box<[DataCell]>,
    traps: [AtomicU32; TrapReason::COUNT],
}

impl MethodData {
    pub fn build(method: &Method) -> Self {
        let mut cells = Vec::new();
        let mut decoder = BytecodeDecoder::new(method.code());
        loop {
            let bci = decoder.offset();
            let Some(instr) = decoder.decode_next() else {
                break;
            };
            let kind = match instr {
                Instruction::IfZero { .. } | Instruction::IfNonZero { .. } => {
                    CellKind::Branch
                }
                Instruction::Goto { .. } | Instruction::Jsr { .. } => {
                    CellKind::Jump
                }
                Instruction::InvokeVirtual { .. }
                | Instruction::InvokeInterface { .. }
                | Instruction::CheckCast { .. }
                | Instruction::InstanceOf { .. } => CellKind::Receiver,
                Instruction::InvokeSpecial { .. }
                | Instruction::InvokeStatic { .. }
                | Instruction::InvokeDynamic { .. }
                | Instruction::InvokeHandle { .. } => CellKind::Counter,
                Instruction::Ret { .. } => CellKind::Ret,
                _ => continue,
            };
            cells.push(DataCell::new(bci, kind));
        }
        if !decoder.is_at_end() {
            log::warn!(
                "{method}: profile stops at undecodable bci {}",
                decoder.offset()
            );
        }
        Self {
            cells: cells.into_boxed_slice(),
            traps: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell(&self, di: usize) -> Option<&DataCell> {
        self.cells.get(di)
    }

    pub fn cells(&self) -> &[DataCell] {
        &self.cells
    }

    /// Data index of the first cell at or after `bci`.
    pub fn bci_to_di(&self, bci: usize) -> Option<usize> {
        let di = self.cells.partition_point(|cell| cell.bci < bci);
        (di < self.cells.len()).then_some(di)
    }

    /// Data index of the cell exactly at `bci`.
    pub fn di_at(&self, bci: usize) -> Option<usize> {
        self.bci_to_di(bci).filter(|&di| self.cells[di].bci == bci)
    }

    pub fn trap_count(&self, reason: TrapReason) -> u32 {
        self.traps[reason.index()].load(Ordering::Relaxed)
    }

    fn note_trap(&self, reason: TrapReason) -> u32 {
        let counter = &self.traps[reason.index()];
        let next = counter.load(Ordering::Relaxed).saturating_add(1);
        counter.store(next, Ordering::Relaxed);
        next
    }
}

/// What the dispatch loop observed at the current bci.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Branch { taken: bool },
    Jump,
    Call,
    Receiver(KlassId),
    Ret { target_bci: usize },
}

/// Decides when counters justify a compilation.
pub trait CompilePolicy: Send + Sync {
    fn on_invocation(
        &self,
        method: &Method,
        counters: &MethodCounters,
    ) -> Option<CompileTier>;

    /// Tier for an on-stack-replacement compile entering at `bci`.
    fn on_backedge(
        &self,
        method: &Method,
        bci: usize,
        counters: &MethodCounters,
    ) -> Option<CompileTier>;
}

/// Baseline first, optimized once baseline code keeps getting invoked.
#[derive(Debug, Clone)]
pub struct TieredPolicy {
    invocation_threshold: u32,
    osr_threshold: u32,
}

impl TieredPolicy {
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self {
            invocation_threshold: settings.invocation_threshold,
            osr_threshold: settings.osr_threshold,
        }
    }
}

impl CompilePolicy for TieredPolicy {
    fn on_invocation(
        &self,
        method: &Method,
        counters: &MethodCounters,
    ) -> Option<CompileTier> {
        let invocations = counters.invocations.count();
        match method.compiled_code().map(|code| code.tier()) {
            None if invocations >= self.invocation_threshold => {
                Some(CompileTier::Baseline)
            }
            Some(CompileTier::Baseline)
                if invocations >= self.invocation_threshold.saturating_mul(4) =>
            {
                Some(CompileTier::Optimized)
            }
            _ => None,
        }
    }

    fn on_backedge(
        &self,
        method: &Method,
        bci: usize,
        counters: &MethodCounters,
    ) -> Option<CompileTier> {
        (counters.backedges.count() >= self.osr_threshold
            && method.osr_code_at(bci).is_none())
        .then_some(CompileTier::Baseline)
    }
}

/// Counter maintenance, profile recording and overflow handling.
pub struct ProfileController {
    policy: Arc<dyn CompilePolicy>,
    queue: Arc<dyn CompileQueue>,
    invocation_threshold: u32,
    backedge_threshold: u32,
    counter_budget: usize,
    counters_allocated: AtomicUsize,
}

impl ProfileController {
    pub fn new(
        settings: &RuntimeSettings,
        policy: Arc<dyn CompilePolicy>,
        queue: Arc<dyn CompileQueue>,
    ) -> Self {
        Self {
            policy,
            queue,
            invocation_threshold: settings.invocation_threshold,
            backedge_threshold: settings.backedge_threshold,
            counter_budget: settings.counter_budget,
            counters_allocated: AtomicUsize::new(0),
        }
    }

    pub fn counters_allocated(&self) -> usize {
        self.counters_allocated.load(Ordering::Relaxed)
    }

    /// Counters of `method`, allocated on first use. `None` once the
    /// counter budget is spent; the method then runs unprofiled.
    pub fn ensure_counters<'m>(&self, method: &'m Method) -> Option<&'m MethodCounters> {
        if let Some(counters) = method.counters() {
            return Some(counters);
        }
        let reserved = self
            .counters_allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < self.counter_budget).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            log::trace!("{method}: counter budget exhausted");
            return None;
        }
        if !method.install_counters(MethodCounters::new()) {
            self.counters_allocated.fetch_sub(1, Ordering::Relaxed);
        }
        method.counters()
    }

    /// Count one invocation. Returns `true` when the counter overflowed and
    /// the caller should report it.
    pub fn count_invocation(&self, method: &Method) -> bool {
        self.ensure_counters(method).is_some_and(|counters| {
            counters.invocations.increment() >= self.invocation_threshold
        })
    }

    /// Count one taken back-edge. Returns `true` on overflow.
    pub fn count_backedge(&self, method: &Method) -> bool {
        self.ensure_counters(method).is_some_and(|counters| {
            counters.backedges.increment() >= self.backedge_threshold
        })
    }

    /// Handle a counter overflow in the top frame. `branch_bci` is set for a
    /// back-edge overflow, in which case the frame's bci is the loop entry
    /// and installed on-stack-replacement code for it is returned.
    pub fn record_overflow(
        &self,
        thread: &mut VMThread,
        branch_bci: Option<usize>,
    ) -> VmResult<Option<Arc<CompiledCode>>> {
        let view = thread.frame_view()?;
        let method = view.method().clone();
        let bci = view.bci();

        let Some(counters) = self.ensure_counters(&method) else {
            return Ok(None);
        };
        match branch_bci {
            None => {
                if let Some(tier) = self.policy.on_invocation(&method, counters) {
                    self.submit(&method, None, tier);
                }
                Ok(None)
            }
            Some(branch) => {
                if let Some(tier) = self.policy.on_backedge(&method, bci, counters) {
                    log::trace!("{method}: back-edge overflow at bci {branch}");
                    self.submit(&method, Some(bci), tier);
                }
                Ok(method.osr_code_at(bci))
            }
        }
    }

    fn submit(&self, method: &Arc<Method>, entry_bci: Option<usize>, tier: CompileTier) {
        let request = CompileRequest {
            method: method.clone(),
            entry_bci,
            tier,
        };
        if self.queue.submit(request) == Submission::AlreadyQueued {
            log::trace!("{method}: compile already queued");
        }
    }

    pub fn ensure_method_data<'m>(&self, method: &'m Method) -> &'m MethodData {
        method.method_data_or_init(|| MethodData::build(method))
    }

    /// Record `observation` at the top frame's bci, positioning the frame's
    /// profile cursor on the cell.
    pub fn record_profile(
        &self,
        thread: &mut VMThread,
        observation: Observation,
    ) -> VmResult<()> {
        let mut view = thread.frame_view()?;
        let method = view.method().clone();
        let data = self.ensure_method_data(&method);
        let bci = view.bci();

        let di = match view.mdp() {
            Some(di) if data.cell(di).is_some_and(|c| c.bci() == bci) => Some(di),
            _ => data.di_at(bci),
        };
        view.set_mdp(di);
        let Some(cell) = di.and_then(|di| data.cell(di)) else {
            return Ok(());
        };
        if !cell.record(observation) {
            log::trace!(
                "{method}: {observation:?} does not fit {:?} cell at bci {bci}",
                cell.kind()
            );
        }
        Ok(())
    }

    /// After a subroutine return to `target_bci`: note the target in the
    /// `ret` cell and move the cursor to the profile of the target.
    pub fn update_mdp_for_ret(
        &self,
        thread: &mut VMThread,
        target_bci: usize,
    ) -> VmResult<()> {
        let mut view = thread.frame_view()?;
        let method = view.method().clone();
        let data = self.ensure_method_data(&method);

        if let Some(cell) = data.di_at(view.bci()).and_then(|di| data.cell(di)) {
            cell.record(Observation::Ret { target_bci });
        }
        view.set_mdp(data.bci_to_di(target_bci));
        Ok(())
    }

    pub fn bci_to_di(&self, method: &Method, bci: usize) -> Option<usize> {
        self.ensure_method_data(method).bci_to_di(bci)
    }

    /// Count a trap of `reason` in the top frame's method.
    pub fn note_trap(&self, thread: &mut VMThread, reason: TrapReason) -> VmResult<u32> {
        let view = thread.frame_view()?;
        let method = view.method().clone();
        let count = self.ensure_method_data(&method).note_trap(reason);
        log::trace!("{method}: {reason:?} trap #{count} at bci {}", view.bci());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::CompileBroker;
    use crate::method::Signature;
    use crate::safepoint::SafepointCoordinator;
    use crate::settings::RuntimeCreateInfo;
    use crate::thread::{StackGuard, ThreadId};
    use bytecode::BytecodeBuilder;

    fn settings(info: RuntimeCreateInfo) -> RuntimeSettings {
        RuntimeSettings::new(info).unwrap()
    }

    fn controller(info: RuntimeCreateInfo) -> (Arc<CompileBroker>, ProfileController) {
        let settings = settings(info);
        let broker = Arc::new(CompileBroker::new());
        let policy = Arc::new(TieredPolicy::new(&settings));
        (broker.clone(), ProfileController::new(&settings, policy, broker))
    }

    fn thread() -> VMThread {
        VMThread::new(ThreadId(1), StackGuard::new(8, 2), Arc::new(SafepointCoordinator::new()))
    }

    /// 0: if_zero +.. 3: invokevirtual #0 6: goto 0 9: jsr .. 12: return
    /// 13: ret 0
    fn looping_method() -> Arc<Method> {
        let mut b = BytecodeBuilder::new();
        let exit = b.if_zero();
        b.invoke(bytecode::Op::InvokeVirtual, 0);
        b.goto_back(0);
        b.bind(exit);
        let sub = b.jsr();
        b.return_();
        b.bind(sub);
        b.ret(0);
        Method::builder("spin", Signature::parse("()V").unwrap())
            .max_locals(1)
            .code(b.into_bytes())
            .build()
    }

    #[test]
    fn counters_saturate() {
        let c = InvocationCounter::default();
        c.0.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(c.increment(), u32::MAX);
        assert_eq!(c.increment(), u32::MAX);
    }

    #[test]
    fn counter_budget_degrades_silently() {
        let (_, ctl) = controller(RuntimeCreateInfo {
            counter_budget: Some(1),
            ..Default::default()
        });
        let a = looping_method();
        let b = looping_method();
        assert!(ctl.ensure_counters(&a).is_some());
        assert!(ctl.ensure_counters(&a).is_some());
        assert!(ctl.ensure_counters(&b).is_none());
        assert!(!ctl.count_invocation(&b));
        assert!(b.counters().is_none());
        assert_eq!(ctl.counters_allocated(), 1);
    }

    #[test]
    fn method_data_cells_follow_bytecode() {
        let m = looping_method();
        let data = MethodData::build(&m);
        let layout: Vec<_> = data.cells().iter().map(|c| (c.bci(), c.kind())).collect();
        assert_eq!(layout, vec![
            (0, CellKind::Branch),
            (3, CellKind::Receiver),
            (6, CellKind::Jump),
            (9, CellKind::Jump),
            (13, CellKind::Ret),
        ]);
        assert_eq!(data.bci_to_di(4), Some(2));
        assert_eq!(data.di_at(4), None);
        assert_eq!(data.bci_to_di(14), None);
    }

    #[test]
    fn record_profile_positions_cursor() {
        let (_, ctl) = controller(RuntimeCreateInfo::default());
        let mut t = thread();
        t.push_frame(looping_method()).unwrap();

        ctl.record_profile(&mut t, Observation::Branch { taken: false }).unwrap();
        ctl.record_profile(&mut t, Observation::Branch { taken: true }).unwrap();
        assert_eq!(t.frame_view().unwrap().mdp(), Some(0));

        t.frame_view().unwrap().set_bci(3);
        for klass in [7, 7, 8, 9] {
            ctl.record_profile(&mut t, Observation::Receiver(KlassId(klass))).unwrap();
        }
        assert_eq!(t.frame_view().unwrap().mdp(), Some(1));

        let data = t.top_frame().unwrap().method().method_data().unwrap();
        let branch = data.cell(0).unwrap();
        assert_eq!((branch.count(), branch.not_taken()), (1, 1));
        let call = data.cell(1).unwrap();
        assert_eq!(call.count(), 4);
        assert_eq!(call.receivers(), vec![(KlassId(7), 2), (KlassId(8), 1)]);
        assert_eq!(call.polymorphic(), 1);
    }

    #[test]
    fn ret_moves_cursor_to_target() {
        let (_, ctl) = controller(RuntimeCreateInfo::default());
        let mut t = thread();
        t.push_frame(looping_method()).unwrap();
        t.frame_view().unwrap().set_bci(13);

        ctl.update_mdp_for_ret(&mut t, 12).unwrap();
        // nothing is profiled at 12, the cursor moves to the next cell
        assert_eq!(t.frame_view().unwrap().mdp(), Some(4));
        ctl.update_mdp_for_ret(&mut t, 6).unwrap();
        assert_eq!(t.frame_view().unwrap().mdp(), Some(2));

        let m = t.top_frame().unwrap().method().clone();
        let ret = m.method_data().unwrap().cell(4).unwrap();
        assert_eq!(ret.ret_targets(), vec![(12, 1), (6, 1)]);
        assert_eq!(ctl.bci_to_di(&m, 13), Some(4));
    }

    #[test]
    fn traps_are_counted_per_reason() {
        let (_, ctl) = controller(RuntimeCreateInfo::default());
        let mut t = thread();
        t.push_frame(looping_method()).unwrap();
        assert_eq!(ctl.note_trap(&mut t, TrapReason::NullCheck).unwrap(), 1);
        assert_eq!(ctl.note_trap(&mut t, TrapReason::NullCheck).unwrap(), 2);
        assert_eq!(ctl.note_trap(&mut t, TrapReason::ArrayCheck).unwrap(), 1);
        let data = t.top_frame().unwrap().method().method_data().unwrap();
        assert_eq!(data.trap_count(TrapReason::NullCheck), 2);
        assert_eq!(data.trap_count(TrapReason::Division), 0);
        assert_eq!(data.trap_count(TrapReason::ArrayCheck), 1);
        assert_eq!(data.trap_count(TrapReason::ClassCheck), 0);
    }

    #[test]
    fn racing_counter_creation_reserves_budget_once() {
        let (_, ctl) = controller(RuntimeCreateInfo::default());
        let methods: Vec<_> = (0..2_000).map(|_| looping_method()).collect();
        let barrier = std::sync::Barrier::new(8);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    for m in &methods {
                        assert!(ctl.ensure_counters(m).is_some());
                    }
                });
            }
        });

        assert_eq!(ctl.counters_allocated(), methods.len());
        assert!(methods.iter().all(|m| m.counters().is_some()));
    }

    #[test]
    fn invocation_overflow_submits_once() {
        let (broker, ctl) = controller(RuntimeCreateInfo {
            invocation_threshold: Some(3),
            ..Default::default()
        });
        let m = looping_method();
        let mut t = thread();
        t.push_frame(m.clone()).unwrap();

        let overflows = (0..5).filter(|_| ctl.count_invocation(&m)).count();
        assert_eq!(overflows, 3);
        for _ in 0..overflows {
            assert!(ctl.record_overflow(&mut t, None).unwrap().is_none());
        }
        assert_eq!(broker.accepted_count(), 1);
        assert_eq!(broker.pending_count(), 1);
    }

    #[test]
    fn backedge_overflow_returns_installed_osr_code() {
        let (broker, ctl) = controller(RuntimeCreateInfo {
            backedge_threshold: Some(2),
            osr_threshold: Some(2),
            ..Default::default()
        });
        let m = looping_method();
        let mut t = thread();
        t.push_frame(m.clone()).unwrap();

        assert!(!ctl.count_backedge(&m));
        assert!(ctl.count_backedge(&m));
        assert!(ctl.record_overflow(&mut t, Some(6)).unwrap().is_none());

        let request = broker.pop().unwrap();
        assert_eq!(request.entry_bci, Some(0));
        broker.finish(&request, Some(CompiledCode::new(0x7000, Some(0), request.tier)));

        let code = ctl.record_overflow(&mut t, Some(6)).unwrap().unwrap();
        assert_eq!(code.entry(), 0x7000);
        // code exists, so no new request
        assert_eq!(broker.accepted_count(), 1);
    }
}
