//! Instructions for code.
//!
//! Function bodies are kept as a flat sequence. Structured control
//! instructions (`block`, `loop`, `if`) are closed by explicit [`Control::Else`]
//! and [`Control::End`] instructions.

use super::{
    ty::{NumTy, ValTy},
    FuncIndex, GlobalIndex, LabelIndex, LocalIndex, TableIndex, TypeIndex,
};

/// Sign extension mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignExtension {
    /// Signed
    Signed,
    /// Unsigned
    Unsigned,
}

/// Storage size target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageSize {
    /// 8 bits
    Size8,
    /// 16 bits
    Size16,
    /// 32 bits
    Size32,
}

impl StorageSize {
    /// Width in bytes.
    #[must_use]
    pub const fn byte_width(self) -> u32 {
        match self {
            StorageSize::Size8 => 1,
            StorageSize::Size16 => 2,
            StorageSize::Size32 => 4,
        }
    }
}

/// Integer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntTy {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
}

impl From<IntTy> for NumTy {
    fn from(value: IntTy) -> Self {
        match value {
            IntTy::I32 => NumTy::I32,
            IntTy::I64 => NumTy::I64,
        }
    }
}

/// Floating point type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatTy {
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
}

impl From<FloatTy> for NumTy {
    fn from(value: FloatTy) -> Self {
        match value {
            FloatTy::F32 => NumTy::F32,
            FloatTy::F64 => NumTy::F64,
        }
    }
}

/// Numeric constant operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    /// 0x41
    I32(i32),
    /// 0x42
    I64(i64),
    /// 0x43
    F32(f32),
    /// 0x44
    F64(f64),
}

impl Const {
    /// Type of the pushed value.
    #[must_use]
    pub const fn ty(&self) -> NumTy {
        match self {
            Const::I32(_) => NumTy::I32,
            Const::I64(_) => NumTy::I64,
            Const::F32(_) => NumTy::F32,
            Const::F64(_) => NumTy::F64,
        }
    }
}

/// Integer unary operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IUnOp {
    /// Count leading zeroes bits
    Clz,
    /// Count trailing zero bits
    Ctz,
    /// Return count of non-zero bits
    PopCnt,
    /// 0xc0, 0xc1, 0xc2, 0xc3, 0xc4
    Extend(StorageSize),
}

/// Integer binary operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IBinOp {
    /// Add
    Add,
    /// Subtract
    Sub,
    /// Multiply
    Mul,
    /// Divide with sign extension
    Div(SignExtension),
    /// Remainder with sign extension
    Rem(SignExtension),
    /// And
    And,
    /// Or
    Or,
    /// Xor
    Xor,
    /// Shift left
    Shl,
    /// Shift right with sign extension
    Shr(SignExtension),
    /// Rotate left
    Rotl,
    /// Rotate right
    Rotr,
}

/// Floating point unary operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FUnOp {
    /// Absolute value
    Abs,
    /// Negate
    Neg,
    /// Square root
    Sqrt,
    /// Ceiling
    Ceil,
    /// Floor
    Floor,
    /// Truncate
    Trunc,
    /// Nearest
    Nearest,
}

/// Floating point binary operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FBinOp {
    /// Add
    Add,
    /// Subtract
    Sub,
    /// Multiply
    Mul,
    /// Divide
    Div,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Magnitude of the first operand with the sign of the second.
    CopySign,
}

/// Integer test operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ITestOp {
    /// Return 1 if value is zero, 0 otherwise.
    Eqz,
}

/// Integer comparision operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IRelOp {
    /// Equal
    Eq,
    /// Not Equal
    Ne,
    /// Less Than with Sign Extension
    Lt(SignExtension),
    /// Greater Than with Sign Extension
    Gt(SignExtension),
    /// Less Than or Equal with Sign Extension
    Le(SignExtension),
    /// Greater Than or Equal with Sign Extension
    Ge(SignExtension),
}

/// Floating point comparision operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FRelOp {
    /// Equal
    Eq,
    /// Not Equal
    Ne,
    /// Less Than
    Lt,
    /// Greater Than
    Gt,
    /// Less Than or Equal
    Le,
    /// Greater Than or Equal
    Ge,
}

/// Conversion operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvtOp {
    /// 0xa7
    I32WrapI64,
    /// 0xa8, 0xa9, 0xaa, 0xab, 0xae, 0xaf, 0xb0, 0xb1
    Trunc(IntTy, FloatTy, SignExtension),
    /// 0xac, 0xad
    I64ExtendI32(SignExtension),
    /// 0xb2, 0xb3, 0xb4, 0xb5, 0xb7, 0xb8, 0xb9, 0xba
    Convert(FloatTy, IntTy, SignExtension),
    /// 0xb6
    F32DemoteF64,
    /// 0xbb
    F64PromoteF32,
    /// 0xbc
    I32ReinterpretF32,
    /// 0xbd
    I64ReinterpretF64,
    /// 0xbe
    F32ReinterpretI32,
    /// 0xbf
    F64ReinterpretI64,
    /// 0xfc 0-7
    TruncSat(IntTy, FloatTy, SignExtension),
}

impl CvtOp {
    /// Operand and result types.
    #[must_use]
    pub fn tys(self) -> (NumTy, NumTy) {
        match self {
            CvtOp::I32WrapI64 => (NumTy::I64, NumTy::I32),
            CvtOp::Trunc(i, f, _) | CvtOp::TruncSat(i, f, _) => (f.into(), i.into()),
            CvtOp::I64ExtendI32(_) => (NumTy::I32, NumTy::I64),
            CvtOp::Convert(f, i, _) => (i.into(), f.into()),
            CvtOp::F32DemoteF64 => (NumTy::F64, NumTy::F32),
            CvtOp::F64PromoteF32 => (NumTy::F32, NumTy::F64),
            CvtOp::I32ReinterpretF32 => (NumTy::F32, NumTy::I32),
            CvtOp::I64ReinterpretF64 => (NumTy::F64, NumTy::I64),
            CvtOp::F32ReinterpretI32 => (NumTy::I32, NumTy::F32),
            CvtOp::F64ReinterpretI64 => (NumTy::I64, NumTy::F64),
        }
    }
}

/// Integer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumIOp {
    /// Unary operation
    Unary(IUnOp),
    /// Binary operation
    Binary(IBinOp),
    /// Test operation
    Test(ITestOp),
    /// Relative comparision
    Rel(IRelOp),
}

/// Floating point operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumFOp {
    /// Unary operation
    Unary(FUnOp),
    /// Binary operation
    Binary(FBinOp),
    /// Relative comparision
    Rel(FRelOp),
}

/// Numeric operation instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    /// Constant
    Constant(Const),
    /// Integer
    Int(IntTy, NumIOp),
    /// Floating point
    Float(FloatTy, NumFOp),
    /// Conversion operations
    Conversion(CvtOp),
}

/// Parametric instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parametric {
    /// 0x1a
    Drop,
    /// 0x1b
    Select,
}

/// Variable instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    /// 0x20
    LocalGet(LocalIndex),
    /// 0x21
    LocalSet(LocalIndex),
    /// 0x22
    LocalTee(LocalIndex),
    /// 0x23
    GlobalGet(GlobalIndex),
    /// 0x24
    GlobalSet(GlobalIndex),
}

/// Memory operation arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    /// Alignment hint as a power of two
    pub align: u32,
    /// Added to the dynamic address operand
    pub offset: u32,
}

/// Memory instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mem {
    /// 0x28, 0x29, 0x2a, 0x2b, 0x2c, 0x2d, 0x2e, 0x2f, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35
    Load(NumTy, MemArg, Option<(StorageSize, SignExtension)>),
    /// 0x36, 0x37, 0x38, 0x39, 0x3a, 0x3b, 0x3c, 0x3d, 0x3e
    Store(NumTy, MemArg, Option<StorageSize>),
    /// 0x3f
    MemorySize,
    /// 0x40
    MemoryGrow,
}

impl Mem {
    /// Number of bytes accessed by a load or store.
    #[must_use]
    pub fn access_width(&self) -> Option<u32> {
        match self {
            Mem::Load(t, _, None) | Mem::Store(t, _, None) => Some(t.byte_width()),
            Mem::Load(_, _, Some((s, _))) | Mem::Store(_, _, Some(s)) => Some(s.byte_width()),
            Mem::MemorySize | Mem::MemoryGrow => None,
        }
    }
}

/// Block type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTy {
    /// Empty
    Empty,
    /// Value
    Val(ValTy),
    /// Type Index
    Index(TypeIndex),
}

/// Control instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// 0x00
    Unreachable,
    /// 0x01
    Nop,
    /// 0x02
    Block(BlockTy),
    /// 0x03
    Loop(BlockTy),
    /// 0x04
    If(BlockTy),
    /// 0x05
    Else,
    /// 0x0b
    End,
    /// 0x0c
    Br(LabelIndex),
    /// 0x0d
    BrIf(LabelIndex),
    /// 0x0e
    BrTable {
        /// Targets selected by the operand
        table: Vec<LabelIndex>,
        /// Default target
        idx: LabelIndex,
    },
    /// 0x0f
    Return,
    /// 0x10
    Call(FuncIndex),
    /// 0x11
    CallIndirect {
        /// Expected function type
        y: TypeIndex,
        /// Table holding the callee
        x: TableIndex,
    },
}

/// Instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Control instruction
    Control(Control),
    /// Parametric instruction
    Parametric(Parametric),
    /// Variable instruction
    Var(Variable),
    /// Memory instruction
    Mem(Mem),
    /// Numeric instructions
    Num(Num),
}

impl Instr {
    /// True for the instructions permitted in an initializer expression.
    #[must_use]
    pub fn is_const(&self) -> bool {
        matches!(
            self,
            Instr::Num(Num::Constant(_)) | Instr::Var(Variable::GlobalGet(_))
        )
    }
}

impl From<Control> for Instr {
    fn from(value: Control) -> Self {
        Self::Control(value)
    }
}

impl From<Num> for Instr {
    fn from(value: Num) -> Self {
        Self::Num(value)
    }
}

/// Expressions terminated with an explicit 0x0b opcode for end.
///
/// The final [`Control::End`] is kept in `instrs`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expr {
    /// Instructions
    pub instrs: Vec<Instr>,
}

/// Initializer expression: one constant instruction and an implicit end.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstExpr {
    /// The instruction producing the value
    pub instr: Instr,
}
