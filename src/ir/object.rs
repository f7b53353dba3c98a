// Copyright (c) 2017-2019 Fabian Schuiki

//! Class ids and compile-time constant objects.

use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Number of payload bits of a small integer.
pub const SMI_BITS: u32 = 62;
/// The smallest small integer.
pub const SMI_MIN: i64 = -(1 << SMI_BITS);
/// The largest small integer.
pub const SMI_MAX: i64 = (1 << SMI_BITS) - 1;
/// The maximum number of elements in a fixed-length array.
pub const ARRAY_MAX_ELEMENTS: i64 = (1 << 28) - 1;
/// The maximum number of characters in a string.
pub const STRING_MAX_ELEMENTS: i64 = (1 << 28) - 1;

/// Check whether a value fits into a small integer.
pub fn is_valid_smi(value: i64) -> bool {
    value >= SMI_MIN && value <= SMI_MAX
}

/// A runtime type tag.
///
/// The first ids are reserved for the core library classes the optimizer
/// knows about. User classes start at `ClassId::FIRST_USER`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl ClassId {
    pub const ILLEGAL: ClassId = ClassId(0);
    pub const DYNAMIC: ClassId = ClassId(1);
    pub const NULL: ClassId = ClassId(2);
    pub const OBJECT: ClassId = ClassId(3);
    pub const BOOL: ClassId = ClassId(4);
    pub const SMI: ClassId = ClassId(5);
    pub const MINT: ClassId = ClassId(6);
    pub const BIGINT: ClassId = ClassId(7);
    pub const DOUBLE: ClassId = ClassId(8);
    pub const ONE_BYTE_STRING: ClassId = ClassId(9);
    pub const TWO_BYTE_STRING: ClassId = ClassId(10);
    pub const ARRAY: ClassId = ClassId(11);
    pub const IMMUTABLE_ARRAY: ClassId = ClassId(12);
    pub const GROWABLE_ARRAY: ClassId = ClassId(13);
    pub const INT8_ARRAY: ClassId = ClassId(14);
    pub const UINT8_ARRAY: ClassId = ClassId(15);
    pub const UINT8_CLAMPED_ARRAY: ClassId = ClassId(16);
    pub const INT16_ARRAY: ClassId = ClassId(17);
    pub const UINT16_ARRAY: ClassId = ClassId(18);
    pub const INT32_ARRAY: ClassId = ClassId(19);
    pub const UINT32_ARRAY: ClassId = ClassId(20);
    pub const FLOAT32_ARRAY: ClassId = ClassId(21);
    pub const FLOAT64_ARRAY: ClassId = ClassId(22);
    pub const EXTERNAL_UINT8_ARRAY: ClassId = ClassId(23);
    pub const TYPE_ARGUMENTS: ClassId = ClassId(24);
    pub const TYPE: ClassId = ClassId(25);
    pub const MATH: ClassId = ClassId(26);
    /// The abstract `int` interface, implemented by smi, mint and bigint.
    pub const INT: ClassId = ClassId(27);
    /// The abstract `num` interface, implemented by `int` and double.
    pub const NUM: ClassId = ClassId(28);
    /// The abstract `String` interface.
    pub const STRING: ClassId = ClassId(29);

    /// The first id handed out to user classes.
    pub const FIRST_USER: u32 = 64;

    /// Check whether this is an integer class.
    pub fn is_integer(self) -> bool {
        self == ClassId::SMI || self == ClassId::MINT || self == ClassId::BIGINT
    }

    /// Check whether values of this class are heap-boxed numbers, i.e. whether
    /// identity differs from numeric equality.
    pub fn is_boxed_number(self) -> bool {
        self == ClassId::MINT || self == ClassId::BIGINT || self == ClassId::DOUBLE
    }

    /// Check whether this is a string class.
    pub fn is_string(self) -> bool {
        self == ClassId::ONE_BYTE_STRING || self == ClassId::TWO_BYTE_STRING
    }

    /// Check whether this is a typed data class.
    pub fn is_typed_data(self) -> bool {
        self.0 >= ClassId::INT8_ARRAY.0 && self.0 <= ClassId::EXTERNAL_UINT8_ARRAY.0
    }

    /// Check whether arrays of this class cannot change their length.
    pub fn is_fixed_length_array(self) -> bool {
        match self {
            ClassId::ARRAY | ClassId::IMMUTABLE_ARRAY => true,
            c => c.is_typed_data() && c != ClassId::EXTERNAL_UINT8_ARRAY,
        }
    }

    /// Check whether this is a user-defined class.
    pub fn is_user(self) -> bool {
        self.0 >= ClassId::FIRST_USER
    }

    fn core_name(self) -> Option<&'static str> {
        Some(match self {
            ClassId::ILLEGAL => "Illegal",
            ClassId::DYNAMIC => "Dynamic",
            ClassId::NULL => "Null",
            ClassId::OBJECT => "Object",
            ClassId::BOOL => "Bool",
            ClassId::SMI => "Smi",
            ClassId::MINT => "Mint",
            ClassId::BIGINT => "Bigint",
            ClassId::DOUBLE => "Double",
            ClassId::ONE_BYTE_STRING => "OneByteString",
            ClassId::TWO_BYTE_STRING => "TwoByteString",
            ClassId::ARRAY => "Array",
            ClassId::IMMUTABLE_ARRAY => "ImmutableArray",
            ClassId::GROWABLE_ARRAY => "GrowableArray",
            ClassId::INT8_ARRAY => "Int8Array",
            ClassId::UINT8_ARRAY => "Uint8Array",
            ClassId::UINT8_CLAMPED_ARRAY => "Uint8ClampedArray",
            ClassId::INT16_ARRAY => "Int16Array",
            ClassId::UINT16_ARRAY => "Uint16Array",
            ClassId::INT32_ARRAY => "Int32Array",
            ClassId::UINT32_ARRAY => "Uint32Array",
            ClassId::FLOAT32_ARRAY => "Float32Array",
            ClassId::FLOAT64_ARRAY => "Float64Array",
            ClassId::EXTERNAL_UINT8_ARRAY => "ExternalUint8Array",
            ClassId::TYPE_ARGUMENTS => "TypeArguments",
            ClassId::TYPE => "Type",
            ClassId::MATH => "Math",
            ClassId::INT => "int",
            ClassId::NUM => "num",
            ClassId::STRING => "String",
            _ => return None,
        })
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.core_name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "cid{}", self.0),
        }
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A compile-time constant object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Bool(bool),
    Smi(i64),
    Mint(i64),
    Double(f64),
    Str(Arc<str>),
    /// An immutable array literal.
    Array(Arc<[Constant]>),
    /// An instantiated type argument vector.
    TypeArguments(Arc<[ClassId]>),
    /// A type object, used as the operand of type tests.
    Type(ClassId),
}

impl Constant {
    /// Create an integer constant, picking a small or wide representation.
    pub fn int(value: i64) -> Constant {
        if is_valid_smi(value) {
            Constant::Smi(value)
        } else {
            Constant::Mint(value)
        }
    }

    /// The class of the constant object.
    pub fn class_id(&self) -> ClassId {
        match self {
            Constant::Null => ClassId::NULL,
            Constant::Bool(_) => ClassId::BOOL,
            Constant::Smi(_) => ClassId::SMI,
            Constant::Mint(_) => ClassId::MINT,
            Constant::Double(_) => ClassId::DOUBLE,
            Constant::Str(s) if s.chars().all(|c| (c as u32) < 0x100) => ClassId::ONE_BYTE_STRING,
            Constant::Str(_) => ClassId::TWO_BYTE_STRING,
            Constant::Array(_) => ClassId::IMMUTABLE_ARRAY,
            Constant::TypeArguments(_) => ClassId::TYPE_ARGUMENTS,
            Constant::Type(_) => ClassId::TYPE,
        }
    }

    /// Return the small integer value, if this is one.
    pub fn as_smi(&self) -> Option<i64> {
        match *self {
            Constant::Smi(v) => Some(v),
            _ => None,
        }
    }

    /// Return the integer value of a small or wide integer constant.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Constant::Smi(v) | Constant::Mint(v) => Some(v),
            _ => None,
        }
    }

    /// Return the boolean value, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Constant::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Check whether this is the null object.
    pub fn is_null(&self) -> bool {
        match self {
            Constant::Null => true,
            _ => false,
        }
    }

    /// Check whether the constant can be rematerialized cheaply by the backend.
    pub fn is_cheap(&self) -> bool {
        match self {
            Constant::Null | Constant::Smi(_) | Constant::TypeArguments(_) => true,
            _ => false,
        }
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Constant) -> bool {
        use Constant::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Smi(a), Smi(b)) | (Mint(a), Mint(b)) => a == b,
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Str(a), Str(b)) => a == b,
            (Array(a), Array(b)) => Arc::ptr_eq(a, b),
            (TypeArguments(a), TypeArguments(b)) => a == b,
            (Type(a), Type(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Bool(v) => write!(f, "{}", v),
            Constant::Smi(v) => write!(f, "#{}", v),
            Constant::Mint(v) => write!(f, "#{}L", v),
            Constant::Double(v) => write!(f, "{:?}", v),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Array(a) => write!(f, "const[{}]", a.len()),
            Constant::TypeArguments(a) => write!(f, "<{:?}>", a),
            Constant::Type(c) => write!(f, "type {}", c),
        }
    }
}
