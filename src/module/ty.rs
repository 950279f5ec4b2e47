//! Types describe the kind of objects in a program.

#![allow(clippy::module_name_repetitions)]

use core::fmt;

use crate::exec::val::{self, Num, Ref, Val};

/// Number type
///
/// Used to represent function parameter types and return types, local and
/// global variable types, and block parameter and return types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumTy {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit floating point number
    F32,
    /// 64-bit floating point number
    F64,
}

impl NumTy {
    pub(crate) const fn default_value(self) -> Num {
        match self {
            NumTy::I32 => Num::I32(0),
            NumTy::I64 => Num::I64(0),
            NumTy::F32 => Num::F32(0.0),
            NumTy::F64 => Num::F64(0.0),
        }
    }

    /// Width of the type in bytes.
    #[must_use]
    pub const fn byte_width(self) -> u32 {
        match self {
            NumTy::I32 | NumTy::F32 => 4,
            NumTy::I64 | NumTy::F64 => 8,
        }
    }
}

impl fmt::Display for NumTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NumTy::I32 => "i32",
            NumTy::I64 => "i64",
            NumTy::F32 => "f32",
            NumTy::F64 => "f64",
        })
    }
}

/// Vector type
///
/// Only carried through the type system; no vector instruction is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VecTy {
    /// 128-bit vector of packed data
    V128,
}

impl VecTy {
    pub(crate) const fn default_value(self) -> val::Vec {
        match self {
            VecTy::V128 => val::Vec::V128(0),
        }
    }
}

/// Reference type
///
/// Used to declare what type of reference a table stores and what type of
/// reference an element segment has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefTy {
    /// Function reference
    FuncRef,
    /// Embedder external reference
    ExternRef,
}

impl RefTy {
    pub(crate) const fn default_value(self) -> Ref {
        Ref::Null(self)
    }
}

impl fmt::Display for RefTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefTy::FuncRef => "funcref",
            RefTy::ExternRef => "externref",
        })
    }
}

/// Value type
///
/// Used to represent function parameter types and return types, local and
/// global variable types, and block parameter and return types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValTy {
    /// Number type
    Num(NumTy),
    /// Vector type
    Vec(VecTy),
    /// Reference type
    Ref(RefTy),
}

impl ValTy {
    /// 32-bit integer
    pub const I32: ValTy = ValTy::Num(NumTy::I32);
    /// 64-bit integer
    pub const I64: ValTy = ValTy::Num(NumTy::I64);
    /// 32-bit floating point number
    pub const F32: ValTy = ValTy::Num(NumTy::F32);
    /// 64-bit floating point number
    pub const F64: ValTy = ValTy::Num(NumTy::F64);

    /// The zero value of the type. References default to null.
    #[must_use]
    pub const fn default_value(self) -> Val {
        match self {
            ValTy::Num(n) => Val::Num(n.default_value()),
            ValTy::Vec(v) => Val::Vec(v.default_value()),
            ValTy::Ref(r) => Val::Ref(r.default_value()),
        }
    }
}

impl fmt::Display for ValTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValTy::Num(n) => fmt::Display::fmt(n, f),
            ValTy::Vec(VecTy::V128) => f.write_str("v128"),
            ValTy::Ref(r) => fmt::Display::fmt(r, f),
        }
    }
}

/// Used to list the types for function parameters and results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResultTy(pub Vec<ValTy>);

/// Function signatures consisting of a parameter type list and a result type
/// list.
///
/// Functions may contain the same signature but with different function names
/// and implementations. Listed in the type section and indexed by
/// [`super::TypeIndex`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FuncTy {
    /// Parameter types
    rt1: ResultTy,
    /// Result types
    rt2: ResultTy,
}

impl FuncTy {
    /// Function type from parameter and result types.
    #[inline]
    #[must_use]
    pub fn new(params: ResultTy, ret: ResultTy) -> Self {
        Self {
            rt1: params,
            rt2: ret,
        }
    }

    /// Returns the param value types.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &[ValTy] {
        &self.rt1.0
    }

    /// Returns the return value types.
    #[inline]
    #[must_use]
    pub fn ret(&self) -> &[ValTy] {
        &self.rt2.0
    }

    /// Function type copied from parameter and result slices.
    #[must_use]
    pub fn from_slices(params: &[ValTy], ret: &[ValTy]) -> Self {
        Self::new(ResultTy(params.to_vec()), ResultTy(ret.to_vec()))
    }

    /// True if the function type is `[] -> []`.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rt1.0.is_empty() && self.rt2.0.is_empty()
    }
}

impl fmt::Display for FuncTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, tys: &[ValTy]) -> fmt::Result {
            f.write_str("[")?;
            for (i, t) in tys.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                fmt::Display::fmt(t, f)?;
            }
            f.write_str("]")
        }

        list(f, self.params())?;
        f.write_str(" -> ")?;
        list(f, self.ret())
    }
}

#[must_use]
pub(crate) fn is_compatible(expected: &[ValTy], actual: &[Val]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }

    expected
        .iter()
        .copied()
        .zip(actual.iter().map(|val| ValTy::from(*val)))
        .all(|(expected, actual)| expected == actual)
}

/// Minimum and optional maximum limits of memories and tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limits {
    /// Minimum
    pub min: u32,
    /// Optional maximum. If no maximum, the size is unlimited.
    pub max: Option<u32>,
}

impl Limits {
    /// True if `max` is absent or not smaller than `min`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.max.map_or(true, |max| self.min <= max)
    }

    /// True if both bounds lie within `k`.
    #[must_use]
    pub fn is_within(&self, k: u32) -> bool {
        self.min <= k && self.max.map_or(true, |max| max <= k)
    }

    /// Import matching: `self` may stand in for `expected`.
    #[must_use]
    pub fn matches(&self, expected: &Limits) -> bool {
        if self.min < expected.min {
            return false;
        }
        match (self.max, expected.max) {
            (_, None) => true,
            (Some(max), Some(expected_max)) => max <= expected_max,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "min={} max={max}", self.min),
            None => write!(f, "min={}", self.min),
        }
    }
}

/// Memory type describes the limits of the linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemTy {
    /// Units are in page size
    pub lim: Limits,
}

/// Table type describes the type of element stored in the table and the size limit of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableTy {
    /// Element reference type
    pub elem_ty: RefTy,
    /// Units are number of entries
    pub lim: Limits,
}

/// Mutablity of a variable described by [`GlobalTy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mut {
    /// Immutable
    Const,
    /// Mutable
    Var,
}

/// Global type used in a [`super::Global`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalTy {
    /// Mutablity
    pub m: Mut,
    /// Value type
    pub t: ValTy,
}

impl fmt::Display for GlobalTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.m {
            Mut::Const => fmt::Display::fmt(&self.t, f),
            Mut::Var => write!(f, "mut {}", self.t),
        }
    }
}

/// Type information for an [`super::Import`] or [`super::Export`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternTy {
    /// Function
    Func(FuncTy),
    /// Table
    Table(TableTy),
    /// Memory
    Mem(MemTy),
    /// Global
    Global(GlobalTy),
}

impl ExternTy {
    /// Name of the kind of external.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ExternTy::Func(_) => "func",
            ExternTy::Table(_) => "table",
            ExternTy::Mem(_) => "memory",
            ExternTy::Global(_) => "global",
        }
    }

    /// Import matching: an external of type `self` may be supplied for an
    /// import of type `expected`.
    #[must_use]
    pub fn matches(&self, expected: &ExternTy) -> bool {
        match (self, expected) {
            (ExternTy::Func(a), ExternTy::Func(b)) => a == b,
            (ExternTy::Table(a), ExternTy::Table(b)) => {
                a.elem_ty == b.elem_ty && a.lim.matches(&b.lim)
            }
            (ExternTy::Mem(a), ExternTy::Mem(b)) => a.lim.matches(&b.lim),
            (ExternTy::Global(a), ExternTy::Global(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ExternTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternTy::Func(ty) => write!(f, "func {ty}"),
            ExternTy::Table(ty) => write!(f, "table {} {}", ty.elem_ty, ty.lim),
            ExternTy::Mem(ty) => write!(f, "memory {}", ty.lim),
            ExternTy::Global(ty) => write!(f, "global {ty}"),
        }
    }
}
