use core::fmt;

/// Basic value types as they appear in signatures and array operands.
///
/// The numeric codes of the primitive types are the ones used by the
/// [`NewArray`](crate::Op::NewArray) operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BasicType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
    Object = 12,
    Array = 13,
    Void = 14,
}

impl BasicType {
    /// Number of interpreter stack slots a value of this type occupies.
    pub const fn slots(self) -> usize {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void => 0,
            _ => 1,
        }
    }

    pub const fn is_reference(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }

    /// Types narrower than `int` that widen to it on the stack.
    pub const fn is_subword(self) -> bool {
        matches!(
            self,
            BasicType::Boolean
                | BasicType::Byte
                | BasicType::Char
                | BasicType::Short
        )
    }

    pub const fn is_floating(self) -> bool {
        matches!(self, BasicType::Float | BasicType::Double)
    }

    /// Whether the type may be the element type of a primitive array.
    pub const fn is_array_element(self) -> bool {
        !matches!(
            self,
            BasicType::Object | BasicType::Array | BasicType::Void
        )
    }

    pub const fn descriptor(self) -> char {
        match self {
            BasicType::Boolean => 'Z',
            BasicType::Char => 'C',
            BasicType::Float => 'F',
            BasicType::Double => 'D',
            BasicType::Byte => 'B',
            BasicType::Short => 'S',
            BasicType::Int => 'I',
            BasicType::Long => 'J',
            BasicType::Object => 'L',
            BasicType::Array => '[',
            BasicType::Void => 'V',
        }
    }
}

impl TryFrom<u8> for BasicType {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        Ok(match code {
            4 => BasicType::Boolean,
            5 => BasicType::Char,
            6 => BasicType::Float,
            7 => BasicType::Double,
            8 => BasicType::Byte,
            9 => BasicType::Short,
            10 => BasicType::Int,
            11 => BasicType::Long,
            12 => BasicType::Object,
            13 => BasicType::Array,
            14 => BasicType::Void,
            other => return Err(other),
        })
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BasicType::Boolean => "boolean",
            BasicType::Char => "char",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::Byte => "byte",
            BasicType::Short => "short",
            BasicType::Int => "int",
            BasicType::Long => "long",
            BasicType::Object => "object",
            BasicType::Array => "array",
            BasicType::Void => "void",
        };
        f.write_str(name)
    }
}

/// Parse a method descriptor such as `(IJLjava/lang/String;[I)V` into its
/// parameter types and return type.
pub fn parse_method_descriptor(
    descriptor: &str,
) -> Option<(Vec<BasicType>, BasicType)> {
    let rest = descriptor.strip_prefix('(')?;
    let (params, ret) = rest.split_once(')')?;

    let mut out = Vec::new();
    let mut chars = params.chars();
    while let Some(c) = chars.next() {
        out.push(parse_field_type(c, &mut chars)?);
    }

    let mut ret_chars = ret.chars();
    let ret_type = match ret_chars.next()? {
        'V' => BasicType::Void,
        c => parse_field_type(c, &mut ret_chars)?,
    };
    if ret_chars.next().is_some() {
        return None;
    }
    Some((out, ret_type))
}

fn parse_field_type(
    c: char,
    rest: &mut core::str::Chars<'_>,
) -> Option<BasicType> {
    Some(match c {
        'Z' => BasicType::Boolean,
        'C' => BasicType::Char,
        'F' => BasicType::Float,
        'D' => BasicType::Double,
        'B' => BasicType::Byte,
        'S' => BasicType::Short,
        'I' => BasicType::Int,
        'J' => BasicType::Long,
        'L' => {
            rest.find(|&c| c == ';')?;
            BasicType::Object
        }
        '[' => {
            // element type is consumed but the value is an array reference
            let elem = rest.next()?;
            parse_field_type(elem, rest)?;
            BasicType::Array
        }
        _ => return None,
    })
}
