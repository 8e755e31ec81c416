use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytecode::BasicType;
use thiserror::Error;

use crate::error::{Exception, ExceptionKind, VmResult};
use crate::oops::{KlassId, ObjectRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationRequest {
    Instance(KlassId),
    Array { element: BasicType, length: u32 },
    ObjectArray { element: KlassId, length: u32 },
    /// Nested arrays of `klass`, outermost dimension first.
    MultiArray { klass: KlassId, dims: Vec<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("heap exhausted: {requested} bytes requested, {available} available")]
    Exhausted { requested: u64, available: u64 },
    #[error("{0} is not an array element type")]
    InvalidElement(BasicType),
}

impl From<AllocationError> for Exception {
    fn from(err: AllocationError) -> Self {
        let kind = match err {
            AllocationError::Exhausted { .. } => ExceptionKind::OutOfMemoryError,
            AllocationError::InvalidElement(_) => ExceptionKind::InternalError,
        };
        Exception::new(kind, err.to_string())
    }
}

/// Object allocation, as provided by the heap.
pub trait HeapAllocator: Send + Sync {
    fn allocate(&self, request: &AllocationRequest) -> Result<ObjectRef, AllocationError>;
}

/// Array length operand; negative lengths raise `NegativeArraySizeException`.
pub fn array_length(length: i32) -> VmResult<u32> {
    u32::try_from(length).map_err(|_| crate::exceptions::negative_array_size(length))
}

const HEADER_SIZE: u64 = 16;
const INSTANCE_SIZE: u64 = 32;
const OBJECT_ALIGNMENT: u64 = 8;

fn element_size(element: BasicType) -> u64 {
    match element {
        BasicType::Boolean | BasicType::Byte => 1,
        BasicType::Char | BasicType::Short => 2,
        BasicType::Int | BasicType::Float => 4,
        _ => 8,
    }
}

fn array_size(element_size: u64, length: u32) -> Option<u64> {
    let body = element_size.checked_mul(u64::from(length))?;
    Some(HEADER_SIZE.checked_add(body)?.next_multiple_of(OBJECT_ALIGNMENT))
}

/// Bytes taken by nested arrays with the given dimensions.
fn multi_array_size(dims: &[u32]) -> Option<u64> {
    match dims {
        [] => Some(0),
        [length] => array_size(8, *length),
        [length, rest @ ..] => {
            let inner = multi_array_size(rest)?.checked_mul(u64::from(*length))?;
            array_size(8, *length)?.checked_add(inner)
        }
    }
}

/// Lock-free bump allocator over an address range. Memory is never
/// reclaimed.
#[derive(Debug)]
pub struct BumpAllocator {
    base: u64,
    capacity: u64,
    top: AtomicU64,
    allocations: AtomicUsize,
}

impl BumpAllocator {
    const DEFAULT_BASE: u64 = 0x1000_0000;

    pub fn new(capacity: u64) -> Self {
        Self::with_base(Self::DEFAULT_BASE, capacity)
    }

    pub fn with_base(base: u64, capacity: u64) -> Self {
        debug_assert!(base != 0);
        Self {
            base,
            capacity,
            top: AtomicU64::new(0),
            allocations: AtomicUsize::new(0),
        }
    }

    pub fn used(&self) -> u64 {
        self.top.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    fn size_of(request: &AllocationRequest) -> Result<Option<u64>, AllocationError> {
        Ok(match request {
            AllocationRequest::Instance(_) => Some(INSTANCE_SIZE),
            AllocationRequest::Array { element, length } => {
                if !element.is_array_element() {
                    return Err(AllocationError::InvalidElement(*element));
                }
                array_size(element_size(*element), *length)
            }
            AllocationRequest::ObjectArray { length, .. } => array_size(8, *length),
            AllocationRequest::MultiArray { dims, .. } => multi_array_size(dims),
        })
    }
}

impl HeapAllocator for BumpAllocator {
    fn allocate(&self, request: &AllocationRequest) -> Result<ObjectRef, AllocationError> {
        let available = self.capacity - self.used();
        let Some(size) = Self::size_of(request)? else {
            return Err(AllocationError::Exhausted {
                requested: u64::MAX,
                available,
            });
        };
        let start = self
            .top
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |top| {
                top.checked_add(size).filter(|&end| end <= self.capacity)
            })
            .map_err(|top| AllocationError::Exhausted {
                requested: size,
                available: self.capacity - top,
            })?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        ObjectRef::new(self.base + start).ok_or(AllocationError::Exhausted {
            requested: size,
            available,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_lengths_are_rejected() {
        assert_eq!(array_length(3), Ok(3));
        let err = array_length(-1).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::NegativeArraySizeException);
    }

    #[test]
    fn sizes() {
        assert_eq!(array_size(1, 3), Some(24));
        assert_eq!(array_size(8, 0), Some(16));
        // 2 outer refs + 2 inner arrays of 3 refs
        assert_eq!(multi_array_size(&[2, 3]), Some(32 + 2 * 40));
        assert_eq!(multi_array_size(&[u32::MAX, u32::MAX, u32::MAX]), None);
    }

    #[test]
    fn bump_allocation_until_exhausted() {
        let heap = BumpAllocator::new(64);
        let a = heap.allocate(&AllocationRequest::Instance(KlassId(1))).unwrap();
        let b = heap.allocate(&AllocationRequest::Instance(KlassId(1))).unwrap();
        assert_eq!(b.addr() - a.addr(), INSTANCE_SIZE);

        let err = heap
            .allocate(&AllocationRequest::Array { element: BasicType::Int, length: 1 })
            .unwrap_err();
        assert_eq!(err, AllocationError::Exhausted { requested: 24, available: 0 });
        assert_eq!(Exception::from(err).kind, ExceptionKind::OutOfMemoryError);
        assert_eq!(heap.allocations(), 2);
    }

    #[test]
    fn void_arrays_are_invalid() {
        let heap = BumpAllocator::new(1024);
        let err = heap
            .allocate(&AllocationRequest::Array { element: BasicType::Void, length: 1 })
            .unwrap_err();
        assert_eq!(err, AllocationError::InvalidElement(BasicType::Void));
    }
}
