use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::method::{Method, MethodId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompileTier {
    Baseline,
    Optimized,
}

/// A request for background compilation. `entry_bci: Some(bci)` asks for
/// on-stack-replacement code entering at `bci`.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub method: Arc<Method>,
    pub entry_bci: Option<usize>,
    pub tier: CompileTier,
}

impl CompileRequest {
    fn key(&self) -> (MethodId, Option<usize>, CompileTier) {
        (self.method.id(), self.entry_bci, self.tier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    AlreadyQueued,
}

/// Non-blocking compile queue. Implementations de-duplicate requests.
pub trait CompileQueue: Send + Sync {
    fn submit(&self, request: CompileRequest) -> Submission;
}

/// Machine code produced by the compiler.
#[derive(Debug)]
pub struct CompiledCode {
    entry: usize,
    osr_bci: Option<usize>,
    tier: CompileTier,
    in_use: AtomicBool,
}

impl CompiledCode {
    pub fn new(entry: usize, osr_bci: Option<usize>, tier: CompileTier) -> Self {
        Self {
            entry,
            osr_bci,
            tier,
            in_use: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn entry(&self) -> usize {
        self.entry
    }

    #[inline]
    pub fn osr_bci(&self) -> Option<usize> {
        self.osr_bci
    }

    #[inline]
    pub fn tier(&self) -> CompileTier {
        self.tier
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Stop new activations from entering this code.
    pub fn make_not_entrant(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct BrokerState {
    pending: VecDeque<CompileRequest>,
    enqueued: HashSet<(MethodId, Option<usize>, CompileTier), ahash::RandomState>,
}

/// In-process compile queue. A key stays reserved from submission until
/// [`CompileBroker::finish`], so duplicate requests are refused meanwhile.
#[derive(Default)]
pub struct CompileBroker {
    state: Mutex<BrokerState>,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
}

impl CompileBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<CompileRequest> {
        self.state.lock().pending.pop_front()
    }

    /// Complete a popped request, installing `code` if compilation
    /// succeeded, and release its key.
    pub fn finish(&self, request: &CompileRequest, code: Option<CompiledCode>) {
        if let Some(code) = code {
            request.method.install_code(Arc::new(code));
        }
        self.state.lock().enqueued.remove(&request.key());
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl CompileQueue for CompileBroker {
    fn submit(&self, request: CompileRequest) -> Submission {
        let mut state = self.state.lock();
        if !state.enqueued.insert(request.key()) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Submission::AlreadyQueued;
        }
        log::debug!(
            "compile queued: {} tier={:?} entry_bci={:?}",
            request.method,
            request.tier,
            request.entry_bci
        );
        state.pending.push_back(request);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Submission::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Signature;

    fn method() -> Arc<Method> {
        Method::builder("hot", Signature::parse("()V").unwrap()).build()
    }

    fn request(m: &Arc<Method>, entry_bci: Option<usize>) -> CompileRequest {
        CompileRequest {
            method: m.clone(),
            entry_bci,
            tier: CompileTier::Baseline,
        }
    }

    #[test]
    fn keeps_key_reserved_until_finished() {
        let broker = CompileBroker::new();
        let m = method();

        assert_eq!(broker.submit(request(&m, None)), Submission::Accepted);
        assert_eq!(broker.submit(request(&m, None)), Submission::AlreadyQueued);

        let popped = broker.pop().expect("pending request");
        assert_eq!(broker.submit(request(&m, None)), Submission::AlreadyQueued);

        broker.finish(&popped, None);
        assert_eq!(broker.submit(request(&m, None)), Submission::Accepted);
        assert_eq!(broker.accepted_count(), 2);
        assert_eq!(broker.rejected_count(), 2);
    }

    #[test]
    fn osr_and_standard_requests_are_distinct() {
        let broker = CompileBroker::new();
        let m = method();
        assert_eq!(broker.submit(request(&m, None)), Submission::Accepted);
        assert_eq!(broker.submit(request(&m, Some(3))), Submission::Accepted);
        assert_eq!(broker.submit(request(&m, Some(7))), Submission::Accepted);
        assert_eq!(broker.pending_count(), 3);
    }

    #[test]
    fn finish_installs_code() {
        let broker = CompileBroker::new();
        let m = method();
        broker.submit(request(&m, Some(3)));
        let req = broker.pop().unwrap();
        broker.finish(&req, Some(CompiledCode::new(0xBEEF, Some(3), CompileTier::Baseline)));
        assert_eq!(m.osr_code_at(3).map(|c| c.entry()), Some(0xBEEF));
    }
}
