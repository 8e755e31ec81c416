use core::fmt;
use std::num::NonZeroU64;

/// Opaque reference to a heap object. Null is represented as `None` at the
/// use sites, never as a zero `ObjectRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroU64);

impl ObjectRef {
    pub const fn new(addr: u64) -> Option<Self> {
        match NonZeroU64::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    #[inline]
    pub const fn addr(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.0)
    }
}

/// Identifies a loaded class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KlassId(pub u32);

impl fmt::Display for KlassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "klass#{}", self.0)
    }
}

/// An interpreter value as held in locals and argument slots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(Option<ObjectRef>),
}

impl Value {
    pub const NULL: Value = Value::Ref(None);

    /// Raw 64-bit slot image. 32-bit values occupy the low half.
    pub fn to_slot(self) -> u64 {
        match self {
            Value::Int(v) => v as u32 as u64,
            Value::Long(v) => v as u64,
            Value::Float(v) => v.to_bits() as u64,
            Value::Double(v) => v.to_bits(),
            Value::Ref(r) => r.map_or(0, ObjectRef::addr),
        }
    }

    pub fn as_ref(self) -> Option<ObjectRef> {
        match self {
            Value::Ref(r) => r,
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}
