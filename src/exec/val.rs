//! Runtime values

use core::fmt;

use crate::module::{
    instr::Const,
    ty::{NumTy, RefTy, ValTy, VecTy},
};

use super::{ExternAddr, FuncAddr, GlobalAddr, MemAddr, TableAddr};

/// Number value
///
/// Floats are compared with IEEE semantics by `PartialEq`; use
/// [`Num::to_bits`] when the exact bit pattern matters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit floating point number
    F32(f32),
    /// 64-bit floating point number
    F64(f64),
}

impl Num {
    /// The raw bits, zero extended.
    #[must_use]
    pub fn to_bits(self) -> u64 {
        match self {
            Num::I32(n) => u64::from(n as u32),
            Num::I64(n) => n as u64,
            Num::F32(n) => u64::from(n.to_bits()),
            Num::F64(n) => n.to_bits(),
        }
    }
}

impl From<i32> for Num {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

impl From<i64> for Num {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<f32> for Num {
    fn from(value: f32) -> Self {
        Self::F32(value)
    }
}

impl From<f64> for Num {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

impl From<bool> for Num {
    fn from(value: bool) -> Self {
        Self::I32(i32::from(value))
    }
}

impl From<Const> for Num {
    fn from(value: Const) -> Self {
        match value {
            Const::I32(n) => Self::I32(n),
            Const::I64(n) => Self::I64(n),
            Const::F32(n) => Self::F32(n),
            Const::F64(n) => Self::F64(n),
        }
    }
}

impl From<Num> for NumTy {
    fn from(value: Num) -> Self {
        match value {
            Num::I32(_) => NumTy::I32,
            Num::I64(_) => NumTy::I64,
            Num::F32(_) => NumTy::F32,
            Num::F64(_) => NumTy::F64,
        }
    }
}

/// Vector value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vec {
    /// 128-bit vector
    V128(i128),
}

impl From<i128> for Vec {
    fn from(value: i128) -> Self {
        Self::V128(value)
    }
}

impl From<Vec> for VecTy {
    fn from(value: Vec) -> Self {
        match value {
            Vec::V128(_) => VecTy::V128,
        }
    }
}

/// Reference value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ref {
    /// Null reference of the given type
    Null(RefTy),
    /// Function in the store
    Func(FuncAddr),
    /// Opaque host reference
    Extern(ExternAddr),
}

impl From<FuncAddr> for Ref {
    fn from(value: FuncAddr) -> Self {
        Self::Func(value)
    }
}

impl From<ExternAddr> for Ref {
    fn from(value: ExternAddr) -> Self {
        Self::Extern(value)
    }
}

impl From<Ref> for RefTy {
    fn from(value: Ref) -> Self {
        match value {
            Ref::Null(ty) => ty,
            Ref::Func(_) => RefTy::FuncRef,
            Ref::Extern(_) => RefTy::ExternRef,
        }
    }
}

/// A value which can be an argument, a result, a local, or a global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    /// Number
    Num(Num),
    /// Vector
    Vec(Vec),
    /// Reference
    Ref(Ref),
}

impl Val {
    /// Returns the value if it is an `i32`.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Val::Num(Num::I32(n)) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value if it is an `i64`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Val::Num(Num::I64(n)) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value if it is an `f32`.
    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Val::Num(Num::F32(n)) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value if it is an `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Val::Num(Num::F64(n)) => Some(*n),
            _ => None,
        }
    }

    /// Returns the reference if the value is one.
    #[must_use]
    pub fn reference(&self) -> Option<Ref> {
        match self {
            Val::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// The type of the value.
    #[must_use]
    pub fn ty(&self) -> ValTy {
        ValTy::from(*self)
    }

    /// Parses a textual argument as a value of type `ty`.
    ///
    /// Integers accept decimal notation (signed, or unsigned up to the type's
    /// bit width) and `0x` prefixed hexadecimal bit patterns. Floats accept
    /// decimal notation, `nan`, `inf`, `-inf` and `0x` prefixed bit patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid value of the type, or if
    /// the type has no textual form.
    pub fn parse_as(ty: ValTy, s: &str) -> Result<Self, ParseValError> {
        let s = s.trim();
        let invalid = || ParseValError::Invalid {
            ty,
            input: s.to_string(),
        };
        let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"));

        let val = match ty {
            ValTy::Num(NumTy::I32) => match hex {
                Some(h) => u32::from_str_radix(h, 16).map(|n| n as i32).ok(),
                None => s
                    .parse::<i32>()
                    .ok()
                    .or_else(|| s.parse::<u32>().ok().map(|n| n as i32)),
            }
            .map(Val::from),
            ValTy::Num(NumTy::I64) => match hex {
                Some(h) => u64::from_str_radix(h, 16).map(|n| n as i64).ok(),
                None => s
                    .parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<u64>().ok().map(|n| n as i64)),
            }
            .map(Val::from),
            ValTy::Num(NumTy::F32) => match hex {
                Some(h) => u32::from_str_radix(h, 16).map(f32::from_bits).ok(),
                None => s.parse().ok(),
            }
            .map(Val::from),
            ValTy::Num(NumTy::F64) => match hex {
                Some(h) => u64::from_str_radix(h, 16).map(f64::from_bits).ok(),
                None => s.parse().ok(),
            }
            .map(Val::from),
            ValTy::Vec(_) | ValTy::Ref(_) => return Err(ParseValError::Unsupported(ty)),
        };

        val.ok_or_else(invalid)
    }
}

/// Error returned by [`Val::parse_as`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseValError {
    /// The text is not a value of the type.
    #[error("invalid {ty} value `{input}`")]
    Invalid {
        /// Requested type
        ty: ValTy,
        /// Text which failed to parse
        input: String,
    },
    /// Values of the type cannot be written as text.
    #[error("{0} values cannot be parsed")]
    Unsupported(ValTy),
}

fn fmt_float(f: &mut fmt::Formatter<'_>, ty: &str, n: f64) -> fmt::Result {
    if n.is_nan() {
        write!(f, "{ty}:nan")
    } else if n.is_infinite() {
        write!(f, "{ty}:{}inf", if n < 0.0 { "-" } else { "" })
    } else {
        write!(f, "{ty}:{n}")
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Num(Num::I32(n)) => write!(f, "i32:{n}"),
            Val::Num(Num::I64(n)) => write!(f, "i64:{n}"),
            Val::Num(Num::F32(n)) if n.is_finite() => write!(f, "f32:{n}"),
            Val::Num(Num::F32(n)) => fmt_float(f, "f32", f64::from(*n)),
            Val::Num(Num::F64(n)) => fmt_float(f, "f64", *n),
            Val::Vec(Vec::V128(n)) => write!(f, "v128:0x{:032x}", *n as u128),
            Val::Ref(Ref::Null(ty)) => write!(f, "{ty}:null"),
            Val::Ref(Ref::Func(addr)) => write!(f, "funcref:{}", usize::from(*addr)),
            Val::Ref(Ref::Extern(addr)) => write!(f, "externref:{}", usize::from(*addr)),
        }
    }
}

impl From<i32> for Val {
    fn from(value: i32) -> Self {
        Self::Num(Num::I32(value))
    }
}

impl From<i64> for Val {
    fn from(value: i64) -> Self {
        Self::Num(Num::I64(value))
    }
}

impl From<f32> for Val {
    fn from(value: f32) -> Self {
        Self::Num(Num::F32(value))
    }
}

impl From<f64> for Val {
    fn from(value: f64) -> Self {
        Self::Num(Num::F64(value))
    }
}

impl From<bool> for Val {
    fn from(value: bool) -> Self {
        Self::Num(Num::from(value))
    }
}

impl From<i128> for Val {
    fn from(value: i128) -> Self {
        Self::Vec(Vec::V128(value))
    }
}

impl From<FuncAddr> for Val {
    fn from(value: FuncAddr) -> Self {
        Self::Ref(Ref::Func(value))
    }
}

impl From<ExternAddr> for Val {
    fn from(value: ExternAddr) -> Self {
        Self::Ref(Ref::Extern(value))
    }
}

impl From<Num> for Val {
    fn from(value: Num) -> Self {
        Self::Num(value)
    }
}

impl From<Vec> for Val {
    fn from(value: Vec) -> Self {
        Self::Vec(value)
    }
}

impl From<Ref> for Val {
    fn from(value: Ref) -> Self {
        Self::Ref(value)
    }
}

impl From<Val> for ValTy {
    fn from(value: Val) -> Self {
        match value {
            Val::Num(n) => ValTy::Num(NumTy::from(n)),
            Val::Vec(v) => ValTy::Vec(VecTy::from(v)),
            Val::Ref(r) => ValTy::Ref(RefTy::from(r)),
        }
    }
}

/// Runtime object which can be imported or exported.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternVal {
    /// Function
    Func(FuncAddr),
    /// Table
    Table(TableAddr),
    /// Memory
    Mem(MemAddr),
    /// Global
    Global(GlobalAddr),
}

impl ExternVal {
    /// Returns the function address if this is a function.
    #[must_use]
    pub fn as_func(&self) -> Option<FuncAddr> {
        match self {
            ExternVal::Func(a) => Some(*a),
            _ => None,
        }
    }

    /// Name of the kind of external.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ExternVal::Func(_) => "func",
            ExternVal::Table(_) => "table",
            ExternVal::Mem(_) => "memory",
            ExternVal::Global(_) => "global",
        }
    }
}

impl From<FuncAddr> for ExternVal {
    fn from(value: FuncAddr) -> Self {
        Self::Func(value)
    }
}

impl From<TableAddr> for ExternVal {
    fn from(value: TableAddr) -> Self {
        Self::Table(value)
    }
}

impl From<MemAddr> for ExternVal {
    fn from(value: MemAddr) -> Self {
        Self::Mem(value)
    }
}

impl From<GlobalAddr> for ExternVal {
    fn from(value: GlobalAddr) -> Self {
        Self::Global(value)
    }
}
