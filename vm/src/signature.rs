//! Native-call signature handlers.
//!
//! A handler marshals interpreter argument slots into the platform's native
//! calling convention. Handlers depend only on the shape of a signature, so
//! they are generated once per [`Fingerprint`] and shared by every method
//! with that shape.

use core::fmt;
use std::collections::HashMap;

use assembler::x64::AssemblerError;
use bytecode::BasicType;
use heap::CodeBlob;
use parking_lot::Mutex;
use thiserror::Error;

use crate::error::fatal;
use crate::method::{Method, Signature};
use crate::settings::RuntimeSettings;

const STATIC_BIT: u64 = 1;
const RESULT_SHIFT: u32 = 1;
const PARAM_SHIFT: u32 = 5;
const FEATURE_BITS: u32 = 4;
const FEATURE_MASK: u64 = (1 << FEATURE_BITS) - 1;
const DONE: u64 = 0xF;

/// Packed summary of a signature: the static bit, a 4-bit result code and
/// one 4-bit code per parameter followed by a terminator.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Longest parameter list that fits the encoding.
    pub const MAX_PARAMETERS: usize = 13;
    /// Marks a signature too long to encode.
    pub const OVERFLOW: Fingerprint = Fingerprint(u64::MAX);

    pub fn of(signature: &Signature, is_static: bool) -> Self {
        Self::from_parts(is_static, signature.params.iter().copied(), signature.ret)
    }

    pub fn for_method(method: &Method) -> Self {
        Self::of(method.signature(), method.is_static())
    }

    pub fn from_parts(
        is_static: bool,
        params: impl IntoIterator<Item = BasicType>,
        ret: BasicType,
    ) -> Self {
        let mut bits = u64::from(is_static) | (type_code(ret) << RESULT_SHIFT);
        let mut shift = PARAM_SHIFT;
        for (i, param) in params.into_iter().enumerate() {
            if i == Self::MAX_PARAMETERS {
                return Self::OVERFLOW;
            }
            bits |= type_code(param) << shift;
            shift += FEATURE_BITS;
        }
        Self(bits | (DONE << shift))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_overflow(self) -> bool {
        self == Self::OVERFLOW
    }

    #[inline]
    pub fn is_static(self) -> bool {
        !self.is_overflow() && self.0 & STATIC_BIT != 0
    }

    pub fn result(self) -> Option<BasicType> {
        if self.is_overflow() {
            return None;
        }
        decode_type((self.0 >> RESULT_SHIFT) & FEATURE_MASK)
    }

    pub fn params(self) -> impl Iterator<Item = BasicType> {
        let mut bits = if self.is_overflow() {
            DONE
        } else {
            self.0 >> PARAM_SHIFT
        };
        std::iter::from_fn(move || {
            let code = bits & FEATURE_MASK;
            if code == DONE {
                return None;
            }
            bits >>= FEATURE_BITS;
            decode_type(code)
        })
    }

    /// Collapse parameter types the calling convention passes identically:
    /// sub-word integers travel as `int`. The result type is kept.
    pub fn normalize(self) -> Self {
        let Some(ret) = self.result() else {
            return self;
        };
        let params = self.params().map(|t| if t.is_subword() { BasicType::Int } else { t });
        Self::from_parts(self.is_static(), params, ret)
    }
}

fn type_code(t: BasicType) -> u64 {
    match t {
        BasicType::Boolean => 1,
        BasicType::Byte => 2,
        BasicType::Char => 3,
        BasicType::Short => 4,
        BasicType::Int => 5,
        BasicType::Long => 6,
        BasicType::Float => 7,
        BasicType::Double => 8,
        BasicType::Object | BasicType::Array => 9,
        BasicType::Void => 10,
    }
}

fn decode_type(code: u64) -> Option<BasicType> {
    Some(match code {
        1 => BasicType::Boolean,
        2 => BasicType::Byte,
        3 => BasicType::Char,
        4 => BasicType::Short,
        5 => BasicType::Int,
        6 => BasicType::Long,
        7 => BasicType::Float,
        8 => BasicType::Double,
        9 => BasicType::Object,
        10 => BasicType::Void,
        _ => return None,
    })
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(ret) = self.result() else {
            return f.write_str("<overflow>");
        };
        if self.is_static() {
            f.write_str("static ")?;
        }
        f.write_str("(")?;
        for param in self.params() {
            write!(f, "{}", param.descriptor())?;
        }
        write!(f, "){}", ret.descriptor())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self} = {:#x})", self.0)
    }
}

/// Location of a generated handler inside the library's blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle {
    blob: u32,
    offset: u32,
    len: u32,
}

impl HandlerHandle {
    #[inline]
    pub fn blob(self) -> usize {
        self.blob as usize
    }

    #[inline]
    pub fn offset(self) -> usize {
        self.offset as usize
    }

    #[inline]
    pub fn len(self) -> usize {
        self.len as usize
    }
}

/// What a native method calls to marshal its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerAddress {
    Generated(HandlerHandle),
    /// Code supplied at startup, outside the library's blobs.
    Prebuilt(usize),
    /// The interpreted marshaler, for signatures without a fingerprint.
    Slow,
}

#[derive(Debug, Error)]
pub enum CodeBufferError {
    #[error("{needed} bytes do not fit the {limit} byte scratch buffer")]
    TooLarge { needed: usize, limit: usize },
    #[error("no handler shape for {0}")]
    Unsupported(Fingerprint),
    #[error(transparent)]
    Assembler(#[from] AssemblerError),
}

/// Platform code generator for signature handlers.
pub trait SignatureGenerator: Send {
    /// Emit the handler for `fingerprint`, at most `limit` bytes long. The
    /// output must be position independent.
    fn generate(
        &mut self,
        fingerprint: Fingerprint,
        limit: usize,
    ) -> Result<Vec<u8>, CodeBufferError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LibraryStats {
    pub handlers: usize,
    pub generated: usize,
    pub blobs: usize,
    pub code_bytes: usize,
}

struct LibraryState {
    blobs: Vec<CodeBlob>,
    table: HashMap<Fingerprint, HandlerAddress, ahash::RandomState>,
    order: Vec<Fingerprint>,
    generator: Box<dyn SignatureGenerator>,
    generated: usize,
}

/// Process-wide cache of signature handlers keyed by fingerprint.
///
/// One lock covers lookup, code generation, blob growth and insertion, so
/// a fingerprint is never generated twice. Blobs are only ever appended to
/// and live as long as the library, which keeps every handed-out handle
/// valid.
pub struct SignatureHandlerLibrary {
    state: Mutex<LibraryState>,
    blob_size: usize,
    buffer_size: usize,
    max_blobs: usize,
    normalize: bool,
}

impl SignatureHandlerLibrary {
    pub fn new(
        settings: &RuntimeSettings,
        generator: Box<dyn SignatureGenerator>,
    ) -> Self {
        Self {
            state: Mutex::new(LibraryState {
                blobs: Vec::new(),
                table: HashMap::default(),
                order: Vec::new(),
                generator,
                generated: 0,
            }),
            blob_size: settings.blob_size,
            buffer_size: settings.buffer_size,
            max_blobs: settings.max_handler_blobs,
            normalize: settings.normalize_fingerprints,
        }
    }

    fn key(&self, fingerprint: Fingerprint) -> Fingerprint {
        if self.normalize {
            fingerprint.normalize()
        } else {
            fingerprint
        }
    }

    /// The handler for `method`, generating it on first use, attached to the
    /// method. Aborts the process if handler code space is exhausted.
    pub fn obtain_handler(&self, method: &Method) -> HandlerAddress {
        if let Some(handler) = method.native_handler() {
            return handler;
        }
        let fingerprint = Fingerprint::for_method(method);
        if fingerprint.is_overflow() {
            log::debug!("{method}: signature too long, using slow handler");
            return method.attach_native_handler(HandlerAddress::Slow);
        }
        let key = self.key(fingerprint);
        let handler = {
            let mut state = self.state.lock();
            let existing = state.table.get(&key).copied();
            match existing {
                Some(handler) => handler,
                None => self.install(&mut state, key),
            }
        };
        method.attach_native_handler(handler)
    }

    /// Bind `fingerprint` to code that exists outside the library. An
    /// existing binding is kept.
    pub fn register_prebuilt(
        &self,
        fingerprint: Fingerprint,
        address: usize,
    ) -> HandlerAddress {
        let key = self.key(fingerprint);
        let mut state = self.state.lock();
        if let Some(&existing) = state.table.get(&key) {
            return existing;
        }
        let handler = HandlerAddress::Prebuilt(address);
        state.table.insert(key, handler);
        state.order.push(key);
        log::debug!("prebuilt signature handler {key} at {address:#x}");
        handler
    }

    pub fn lookup(&self, fingerprint: Fingerprint) -> Option<HandlerAddress> {
        let key = self.key(fingerprint);
        self.state.lock().table.get(&key).copied()
    }

    /// Callable address of `handler`; `None` for the slow handler.
    pub fn entry_point(&self, handler: HandlerAddress) -> Option<usize> {
        match handler {
            HandlerAddress::Generated(handle) => {
                let state = self.state.lock();
                let blob = state.blobs.get(handle.blob())?;
                Some(blob.entry(handle.offset()) as usize)
            }
            HandlerAddress::Prebuilt(address) => Some(address),
            HandlerAddress::Slow => None,
        }
    }

    /// A copy of the machine code behind `handle`.
    pub fn code(&self, handle: HandlerHandle) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .blobs
            .get(handle.blob())?
            .bytes(handle.offset(), handle.len())
            .map(<[u8]>::to_vec)
    }

    /// Registered fingerprints and their handlers in insertion order.
    pub fn handlers(&self) -> Vec<(Fingerprint, HandlerAddress)> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|fp| state.table.get(fp).map(|&h| (*fp, h)))
            .collect()
    }

    pub fn stats(&self) -> LibraryStats {
        let state = self.state.lock();
        LibraryStats {
            handlers: state.table.len(),
            generated: state.generated,
            blobs: state.blobs.len(),
            code_bytes: state.blobs.iter().map(CodeBlob::used).sum(),
        }
    }

    fn install(
        &self,
        state: &mut LibraryState,
        fingerprint: Fingerprint,
    ) -> HandlerAddress {
        let code = match state.generator.generate(fingerprint, self.buffer_size)
        {
            Ok(code) => code,
            Err(err) => fatal(format_args!(
                "signature handler for {fingerprint}: {err}"
            )),
        };
        if code.is_empty() || code.len() > self.buffer_size {
            fatal(format_args!(
                "signature handler for {fingerprint} is {} bytes, scratch \
                 buffer holds {}",
                code.len(),
                self.buffer_size
            ));
        }

        if state.blobs.last().is_none_or(|blob| !blob.fits(code.len())) {
            if state.blobs.len() >= self.max_blobs {
                fatal(format_args!(
                    "signature handler space exhausted ({} blobs)",
                    self.max_blobs
                ));
            }
            let Some(blob) = CodeBlob::new(self.blob_size) else {
                fatal(format_args!("cannot map signature handler blob"));
            };
            log::debug!(
                "signature handler blob #{} allocated ({} bytes)",
                state.blobs.len(),
                blob.capacity()
            );
            state.blobs.push(blob);
        }

        let index = state.blobs.len() - 1;
        let Some(offset) =
            state.blobs.last_mut().and_then(|blob| blob.append(&code))
        else {
            fatal(format_args!("signature handler blob #{index} rejected append"));
        };
        let (Ok(blob), Ok(offset32), Ok(len)) = (
            u32::try_from(index),
            u32::try_from(offset),
            u32::try_from(code.len()),
        ) else {
            fatal(format_args!(
                "signature handler at blob #{index} +{offset} is not addressable"
            ));
        };
        let handler = HandlerAddress::Generated(HandlerHandle {
            blob,
            offset: offset32,
            len,
        });
        state.table.insert(fingerprint, handler);
        state.order.push(fingerprint);
        state.generated += 1;
        log::debug!(
            "signature handler {fingerprint}: {} bytes in blob #{index} at +{offset}",
            code.len()
        );
        handler
    }
}

impl fmt::Debug for SignatureHandlerLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureHandlerLibrary")
            .field("stats", &self.stats())
            .field("normalize", &self.normalize)
            .finish()
    }
}
