use core::fmt;

use thiserror::Error;

use crate::oops::ObjectRef;

/// Program-visible exception classes raised by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    Throwable,
    Error,
    LinkageError,
    IncompatibleClassChangeError,
    AbstractMethodError,
    NoSuchFieldError,
    NoSuchMethodError,
    NoClassDefFoundError,
    VirtualMachineError,
    StackOverflowError,
    OutOfMemoryError,
    InternalError,
    RuntimeException,
    ClassCastException,
    IndexOutOfBoundsException,
    ArrayIndexOutOfBoundsException,
    IllegalMonitorStateException,
    NullPointerException,
    NegativeArraySizeException,
    ArithmeticException,
}

impl ExceptionKind {
    /// Direct superclass, `None` for `Throwable`.
    pub const fn parent(self) -> Option<ExceptionKind> {
        use ExceptionKind::*;
        Some(match self {
            Throwable => return None,
            Error | RuntimeException => Throwable,
            LinkageError | VirtualMachineError => Error,
            IncompatibleClassChangeError | NoClassDefFoundError => {
                LinkageError
            }
            AbstractMethodError | NoSuchFieldError | NoSuchMethodError => {
                IncompatibleClassChangeError
            }
            StackOverflowError | OutOfMemoryError | InternalError => {
                VirtualMachineError
            }
            ClassCastException
            | IndexOutOfBoundsException
            | IllegalMonitorStateException
            | NullPointerException
            | NegativeArraySizeException
            | ArithmeticException => RuntimeException,
            ArrayIndexOutOfBoundsException => IndexOutOfBoundsException,
        })
    }

    pub fn is_subtype_of(self, other: ExceptionKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A pending language exception.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Exception {
    pub kind: ExceptionKind,
    pub message: String,
    /// The materialized exception object, if the allocator produced one.
    pub object: Option<ObjectRef>,
}

impl Exception {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            object: None,
        }
    }

    pub fn is(&self, kind: ExceptionKind) -> bool {
        self.kind.is_subtype_of(kind)
    }
}

pub type VmResult<T> = Result<T, Exception>;

/// Failures reported by the linkage resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("no such field: {0}")]
    NoSuchField(String),
    #[error("no such method: {0}")]
    NoSuchMethod(String),
    #[error("abstract method: {0}")]
    AbstractMethod(String),
    #[error("incompatible class change: {0}")]
    IncompatibleClassChange(String),
    #[error("class definition not found: {0}")]
    NoClassDef(String),
}

impl From<LinkError> for Exception {
    fn from(err: LinkError) -> Self {
        let kind = match &err {
            LinkError::NoSuchField(_) => ExceptionKind::NoSuchFieldError,
            LinkError::NoSuchMethod(_) => ExceptionKind::NoSuchMethodError,
            LinkError::AbstractMethod(_) => ExceptionKind::AbstractMethodError,
            LinkError::IncompatibleClassChange(_) => {
                ExceptionKind::IncompatibleClassChangeError
            }
            LinkError::NoClassDef(_) => ExceptionKind::NoClassDefFoundError,
        };
        Exception::new(kind, err.to_string())
    }
}

/// Report an unrecoverable runtime condition and abort the process.
#[cold]
pub fn fatal(message: fmt::Arguments<'_>) -> ! {
    log::error!("fatal runtime error: {message}");
    std::process::abort()
}
