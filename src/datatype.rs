//! Element types, reduction operators and their substrate mappings.
//!
//! The registry is a pair of total functions from the caller-facing enums to
//! the substrate's native codes. Lookups for kinds the substrate has no
//! equivalent for fail with a validation error instead of faulting.
//!
//! # Element type mapping
//!
//! | Element type | Substrate kind | Tag Value |
//! |--------------|----------------|-----------|
//! | `U8`         | `Char`         | 0         |
//! | `I8`         | `Char`         | 0         |
//! | `I32`        | `Int`          | 1         |
//! | `BF16`       | `Bfp16`        | 2         |
//! | `F32`        | `Float`        | 3         |
//! | `F64`        | `Double`       | 4         |
//! | `I64`        | `Int64`        | 5         |
//!
//! `I16`, `F16` and `Bool` buffers can be described but not communicated.

use crate::error::{Error, Result};

/// Internal module to seal the trait so it cannot be implemented downstream.
mod sealed {
    pub trait Sealed {}
}

/// Logical element type of a [`Buffer`](crate::Buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// Unsigned byte
    U8,
    /// Signed byte
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// IEEE half precision
    F16,
    /// bfloat16 half precision
    BF16,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// Boolean stored as one byte
    Bool,
}

impl ElementType {
    /// Size of one element in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 | ElementType::Bool => 1,
            ElementType::I16 | ElementType::F16 | ElementType::BF16 => 2,
            ElementType::I32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::F64 => 8,
        }
    }

    /// Map to the substrate's native datatype code.
    pub fn to_substrate(self) -> Result<DatatypeTag> {
        match self {
            ElementType::U8 | ElementType::I8 => Ok(DatatypeTag::Char),
            ElementType::I32 => Ok(DatatypeTag::Int),
            ElementType::BF16 => Ok(DatatypeTag::Bfp16),
            ElementType::F32 => Ok(DatatypeTag::Float),
            ElementType::F64 => Ok(DatatypeTag::Double),
            ElementType::I64 => Ok(DatatypeTag::Int64),
            ElementType::I16 | ElementType::F16 | ElementType::Bool => {
                Err(Error::UnsupportedType(self))
            }
        }
    }
}

/// Substrate-native datatype codes.
///
/// These discriminants must stay in sync with the `#define FERROCOLL_DT_*`
/// values in `csrc/ferrocoll.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DatatypeTag {
    /// 8-bit character
    Char = 0,
    /// 32-bit integer
    Int = 1,
    /// bfloat16
    Bfp16 = 2,
    /// 32-bit float
    Float = 3,
    /// 64-bit float
    Double = 4,
    /// 64-bit integer
    Int64 = 5,
}

impl DatatypeTag {
    /// Size of one element of this kind in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            DatatypeTag::Char => 1,
            DatatypeTag::Bfp16 => 2,
            DatatypeTag::Int | DatatypeTag::Float => 4,
            DatatypeTag::Double | DatatypeTag::Int64 => 8,
        }
    }
}

/// Reduction operators accepted by reducing collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReduceOp {
    /// Elementwise sum
    #[default]
    Sum,
    /// Elementwise product
    Product,
    /// Elementwise minimum
    Min,
    /// Elementwise maximum
    Max,
    /// Elementwise mean
    Average,
    /// Bitwise and
    BitwiseAnd,
    /// Bitwise or
    BitwiseOr,
    /// Bitwise xor
    BitwiseXor,
}

impl ReduceOp {
    /// Map to the substrate's native reduction code.
    pub fn to_substrate(self) -> Result<ReductionTag> {
        match self {
            ReduceOp::Sum => Ok(ReductionTag::Sum),
            ReduceOp::Product => Ok(ReductionTag::Prod),
            ReduceOp::Min => Ok(ReductionTag::Min),
            ReduceOp::Max => Ok(ReductionTag::Max),
            _ => Err(Error::UnsupportedReduction(self)),
        }
    }
}

/// Substrate-native reduction codes (`FERROCOLL_OP_*` in `csrc/ferrocoll.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReductionTag {
    /// Sum of values
    Sum = 0,
    /// Product of values
    Prod = 1,
    /// Minimum value
    Min = 2,
    /// Maximum value
    Max = 3,
}

/// Rust scalar types that can back a [`Buffer`](crate::Buffer).
///
/// This is a **sealed trait**: it cannot be implemented outside this crate.
pub trait Element: sealed::Sealed + bytemuck::Pod + Send + Sync + 'static {
    /// Logical element type of this scalar.
    const DTYPE: ElementType;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl sealed::Sealed for $ty {}
        impl Element for $ty {
            const DTYPE: ElementType = $dtype;
        }
    };
}

impl_element!(u8, ElementType::U8);
impl_element!(i8, ElementType::I8);
impl_element!(i16, ElementType::I16);
impl_element!(i32, ElementType::I32);
impl_element!(i64, ElementType::I64);
impl_element!(half::f16, ElementType::F16);
impl_element!(half::bf16, ElementType::BF16);
impl_element!(f32, ElementType::F32);
impl_element!(f64, ElementType::F64);
