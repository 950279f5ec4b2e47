//! WebAssembly Binary format
//!
//! Decoding produces a structural [`Module`]. No validation is performed
//! beyond what is needed to parse the bytes; see [`crate::validation`].
//!
//! # See Also
//!
//! * [Binary Format spec](https://www.w3.org/TR/wasm-core-1/#binary-format%E2%91%A0)

use std::{ffi::OsStr, io, path::Path, string::FromUtf8Error};

use tracing::debug;

use crate::module::{
    instr::{
        BlockTy, Const, ConstExpr, Control, CvtOp, Expr, FBinOp, FRelOp, FUnOp, FloatTy, IBinOp,
        IRelOp, ITestOp, IUnOp, Instr, IntTy, Mem, MemArg, Num, NumFOp, NumIOp, Parametric,
        SignExtension, StorageSize, Variable,
    },
    ty::{FuncTy, GlobalTy, Limits, MemTy, Mut, NumTy, RefTy, ResultTy, TableTy, ValTy, VecTy},
    Custom, Data, Elem, Export, ExportDesc, Func, FuncIndex, Global, GlobalIndex, Import,
    ImportDesc, LabelIndex, LocalIndex, Mem as MemDef, MemIndex, Module, SectionHeader,
    Table as TableDef, TableIndex, TypeIndex,
};

use super::{IoRead, Read, ReadError, SliceRead};

use self::leb128::{read_s32, read_s33, read_s64, read_u32, read_u32_le, read_u64_le};

pub mod leb128;

/// Recommended extension for files containing Wasm modules in binary format.
pub const EXTENSION: &str = "wasm";

/// Recommended media type for Wasm modules in binary format.
pub const MEDIA_TYPE: &str = "application/wasm";

/// Magic number in preamble
pub const MAGIC: &[u8] = &[0x00, 0x61, 0x73, 0x6D];

/// Version field
pub const VERSION: &[u8] = &[0x01, 0x00, 0x00, 0x00];

/// Upper bound on the number of locals of one function.
const MAX_LOCALS: u64 = 50_000;

/// Reason a binary could not be decoded.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The input ended in the middle of a construct.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// A LEB128 number is too long or does not fit its type.
    #[error("integer representation too long or out of range")]
    Overflow,
    /// The file does not start with `\0asm`.
    #[error("magic header not detected")]
    InvalidMagic,
    /// The version field is not 1.
    #[error("unknown binary version")]
    InvalidVersion,
    /// A section is malformed.
    #[error("malformed section: {0}")]
    MalformedSection(&'static str),
    /// Unknown opcode.
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),
    /// Unknown opcode after a prefix byte.
    #[error("invalid opcode 0x{0:02x} {1}")]
    InvalidPrefixedOpcode(u8, u32),
    /// An instruction immediate is out of range.
    #[error("invalid immediate: {0}")]
    InvalidImmediate(&'static str),
    /// Unknown value type encoding.
    #[error("invalid value type 0x{0:02x}")]
    InvalidValueTy(u8),
    /// The opcode belongs to a proposal which is not supported.
    #[error("{what} are not implemented (opcode 0x{opcode:02x})")]
    NotImplemented {
        /// Instruction family
        what: &'static str,
        /// First opcode byte
        opcode: u8,
    },
    /// Passive or declarative segments require the bulk memory proposal.
    #[error("segment kind {0} is not implemented")]
    UnsupportedSegment(u32),
    /// A name is not valid UTF-8.
    #[error("malformed UTF-8 encoding")]
    InvalidName(#[from] FromUtf8Error),
    /// The path does not have a `.wasm` extension.
    #[error("file extension is not .{EXTENSION}")]
    InvalidExtension,
    /// The underlying reader failed.
    #[error(transparent)]
    Io(io::Error),
}

impl From<ReadError> for DecodeError {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::Eof => Self::UnexpectedEof,
            ReadError::Io(e) => Self::Io(e),
        }
    }
}

/// Error during decoding
#[derive(Debug, thiserror::Error)]
#[error("{inner} at byte offset {pos}")]
pub struct Error {
    /// Inner error
    #[source]
    inner: DecodeError,
    /// Byte offset read
    pos: u64,
}

impl Error {
    fn new(inner: DecodeError, pos: u64) -> Self {
        Self { inner, pos }
    }

    /// Byte offset when the error occurred
    #[inline]
    #[must_use]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// The reason decoding failed
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &DecodeError {
        &self.inner
    }
}

#[inline]
fn expect_bytes<R>(reader: &mut R, expected: &[u8], err: fn() -> DecodeError) -> Result<(), DecodeError>
where
    R: Read,
{
    for e in expected {
        if *e != reader.next()? {
            return Err(err());
        }
    }

    Ok(())
}

fn decode_vec<R, T, F>(reader: &mut R, f: F) -> Result<Vec<T>, DecodeError>
where
    R: Read,
    F: Fn(&mut R) -> Result<T, DecodeError>,
{
    let n = read_u32(reader)?;
    // The count is untrusted, so the allocation grows as elements arrive.
    let mut x = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        x.push(f(reader)?);
    }

    Ok(x)
}

#[inline]
fn decode_bytes_vec<R>(reader: &mut R) -> Result<Vec<u8>, DecodeError>
where
    R: Read,
{
    let n = read_u32(reader)?;
    Ok(reader.take(n)?)
}

#[inline]
fn decode_f32<R>(reader: &mut R) -> Result<f32, DecodeError>
where
    R: Read,
{
    read_u32_le(reader).map(f32::from_bits)
}

#[inline]
fn decode_f64<R>(reader: &mut R) -> Result<f64, DecodeError>
where
    R: Read,
{
    read_u64_le(reader).map(f64::from_bits)
}

#[inline]
fn decode_name<R>(reader: &mut R) -> Result<String, DecodeError>
where
    R: Read,
{
    decode_bytes_vec(reader).and_then(|v| Ok(String::from_utf8(v)?))
}

impl RefTy {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        match reader.next()? {
            0x70 => Ok(Self::FuncRef),
            0x6f => Ok(Self::ExternRef),
            b => Err(DecodeError::InvalidValueTy(b)),
        }
    }
}

impl ValTy {
    #[inline]
    fn from_byte(ty: u8) -> Option<Self> {
        Some(match ty {
            0x7f => Self::Num(NumTy::I32),
            0x7e => Self::Num(NumTy::I64),
            0x7d => Self::Num(NumTy::F32),
            0x7c => Self::Num(NumTy::F64),
            0x7b => Self::Vec(VecTy::V128),
            0x70 => Self::Ref(RefTy::FuncRef),
            0x6f => Self::Ref(RefTy::ExternRef),
            _ => return None,
        })
    }

    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let b = reader.next()?;
        Self::from_byte(b).ok_or(DecodeError::InvalidValueTy(b))
    }
}

impl ResultTy {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        decode_vec(reader, ValTy::decode).map(Self)
    }
}

impl FuncTy {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        if reader.next()? != 0x60 {
            return Err(DecodeError::MalformedSection("expected function type 0x60"));
        }

        let rt1 = ResultTy::decode(reader)?;
        let rt2 = ResultTy::decode(reader)?;

        Ok(Self::new(rt1, rt2))
    }
}

impl Limits {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let max_present = match reader.next()? {
            0x00 => false,
            0x01 => true,
            _ => return Err(DecodeError::MalformedSection("invalid limits flag")),
        };

        let n = read_u32(reader)?;
        let m = max_present.then(|| read_u32(reader)).transpose()?;

        Ok(Self { min: n, max: m })
    }
}

impl MemTy {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        Ok(Self {
            lim: Limits::decode(reader)?,
        })
    }
}

impl TableTy {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let elem_ty = RefTy::decode(reader)?;
        let lim = Limits::decode(reader)?;

        Ok(Self { elem_ty, lim })
    }
}

impl Mut {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        match reader.next()? {
            0x00 => Ok(Self::Const),
            0x01 => Ok(Self::Var),
            _ => Err(DecodeError::MalformedSection("invalid mutability")),
        }
    }
}

impl GlobalTy {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let t = ValTy::decode(reader)?;
        let m = Mut::decode(reader)?;

        Ok(Self { m, t })
    }
}

impl BlockTy {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let peek = reader.peek()?;
        if peek == 0x40 {
            reader.next()?;
            return Ok(Self::Empty);
        }

        if let Some(val_ty) = ValTy::from_byte(peek) {
            reader.next()?;
            return Ok(Self::Val(val_ty));
        }

        let idx = read_s33(reader)?;
        u32::try_from(idx)
            .map(|idx| Self::Index(TypeIndex::new(idx)))
            .map_err(|_| DecodeError::InvalidImmediate("negative block type index"))
    }
}

impl MemArg {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let align = read_u32(reader)?;
        let offset = read_u32(reader)?;
        Ok(Self { align, offset })
    }
}

macro_rules! decode_idx {
    ($t:ty) => {
        impl $t {
            fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
            where
                R: Read,
            {
                Ok(Self::new(read_u32(reader)?))
            }
        }
    };
}

decode_idx!(TypeIndex);
decode_idx!(FuncIndex);
decode_idx!(TableIndex);
decode_idx!(MemIndex);
decode_idx!(GlobalIndex);
decode_idx!(LocalIndex);
decode_idx!(LabelIndex);

const IUNOPS: [IUnOp; 3] = [IUnOp::Clz, IUnOp::Ctz, IUnOp::PopCnt];

const IBINOPS: [IBinOp; 15] = [
    IBinOp::Add,
    IBinOp::Sub,
    IBinOp::Mul,
    IBinOp::Div(SignExtension::Signed),
    IBinOp::Div(SignExtension::Unsigned),
    IBinOp::Rem(SignExtension::Signed),
    IBinOp::Rem(SignExtension::Unsigned),
    IBinOp::And,
    IBinOp::Or,
    IBinOp::Xor,
    IBinOp::Shl,
    IBinOp::Shr(SignExtension::Signed),
    IBinOp::Shr(SignExtension::Unsigned),
    IBinOp::Rotl,
    IBinOp::Rotr,
];

const IRELOPS: [IRelOp; 10] = [
    IRelOp::Eq,
    IRelOp::Ne,
    IRelOp::Lt(SignExtension::Signed),
    IRelOp::Lt(SignExtension::Unsigned),
    IRelOp::Gt(SignExtension::Signed),
    IRelOp::Gt(SignExtension::Unsigned),
    IRelOp::Le(SignExtension::Signed),
    IRelOp::Le(SignExtension::Unsigned),
    IRelOp::Ge(SignExtension::Signed),
    IRelOp::Ge(SignExtension::Unsigned),
];

const FUNOPS: [FUnOp; 7] = [
    FUnOp::Abs,
    FUnOp::Neg,
    FUnOp::Ceil,
    FUnOp::Floor,
    FUnOp::Trunc,
    FUnOp::Nearest,
    FUnOp::Sqrt,
];

const FBINOPS: [FBinOp; 7] = [
    FBinOp::Add,
    FBinOp::Sub,
    FBinOp::Mul,
    FBinOp::Div,
    FBinOp::Min,
    FBinOp::Max,
    FBinOp::CopySign,
];

const FRELOPS: [FRelOp; 6] = [
    FRelOp::Eq,
    FRelOp::Ne,
    FRelOp::Lt,
    FRelOp::Gt,
    FRelOp::Le,
    FRelOp::Ge,
];

/// Integer and float operand of the truncation and conversion opcodes, in
/// opcode order.
const CVT_OPERANDS: [(IntTy, FloatTy, SignExtension); 8] = [
    (IntTy::I32, FloatTy::F32, SignExtension::Signed),
    (IntTy::I32, FloatTy::F32, SignExtension::Unsigned),
    (IntTy::I32, FloatTy::F64, SignExtension::Signed),
    (IntTy::I32, FloatTy::F64, SignExtension::Unsigned),
    (IntTy::I64, FloatTy::F32, SignExtension::Signed),
    (IntTy::I64, FloatTy::F32, SignExtension::Unsigned),
    (IntTy::I64, FloatTy::F64, SignExtension::Signed),
    (IntTy::I64, FloatTy::F64, SignExtension::Unsigned),
];

const LOADS: [(NumTy, Option<(StorageSize, SignExtension)>); 14] = [
    (NumTy::I32, None),
    (NumTy::I64, None),
    (NumTy::F32, None),
    (NumTy::F64, None),
    (NumTy::I32, Some((StorageSize::Size8, SignExtension::Signed))),
    (NumTy::I32, Some((StorageSize::Size8, SignExtension::Unsigned))),
    (NumTy::I32, Some((StorageSize::Size16, SignExtension::Signed))),
    (NumTy::I32, Some((StorageSize::Size16, SignExtension::Unsigned))),
    (NumTy::I64, Some((StorageSize::Size8, SignExtension::Signed))),
    (NumTy::I64, Some((StorageSize::Size8, SignExtension::Unsigned))),
    (NumTy::I64, Some((StorageSize::Size16, SignExtension::Signed))),
    (NumTy::I64, Some((StorageSize::Size16, SignExtension::Unsigned))),
    (NumTy::I64, Some((StorageSize::Size32, SignExtension::Signed))),
    (NumTy::I64, Some((StorageSize::Size32, SignExtension::Unsigned))),
];

const STORES: [(NumTy, Option<StorageSize>); 9] = [
    (NumTy::I32, None),
    (NumTy::I64, None),
    (NumTy::F32, None),
    (NumTy::F64, None),
    (NumTy::I32, Some(StorageSize::Size8)),
    (NumTy::I32, Some(StorageSize::Size16)),
    (NumTy::I64, Some(StorageSize::Size8)),
    (NumTy::I64, Some(StorageSize::Size16)),
    (NumTy::I64, Some(StorageSize::Size32)),
];

fn int(t: IntTy, op: NumIOp) -> Instr {
    Instr::Num(Num::Int(t, op))
}

fn float(t: FloatTy, op: NumFOp) -> Instr {
    Instr::Num(Num::Float(t, op))
}

fn cvt(op: CvtOp) -> Instr {
    Instr::Num(Num::Conversion(op))
}

/// `convert` opcodes come in runs of i32 signed, i32 unsigned, i64 signed and
/// i64 unsigned.
fn convert(f: FloatTy, n: usize) -> CvtOp {
    let i = if n < 2 { IntTy::I32 } else { IntTy::I64 };
    let s = if n % 2 == 0 {
        SignExtension::Signed
    } else {
        SignExtension::Unsigned
    };
    CvtOp::Convert(f, i, s)
}

impl Instr {
    #[allow(clippy::too_many_lines)]
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let op_code = reader.next()?;
        // Opcode ranges below index into the tables above.
        let at = |base: u8| usize::from(op_code - base);

        let instr = match op_code {
            // Control Instructions
            0x00 => Control::Unreachable.into(),
            0x01 => Control::Nop.into(),
            0x02 => Control::Block(BlockTy::decode(reader)?).into(),
            0x03 => Control::Loop(BlockTy::decode(reader)?).into(),
            0x04 => Control::If(BlockTy::decode(reader)?).into(),
            0x05 => Control::Else.into(),
            0x0b => Control::End.into(),
            0x0c => Control::Br(LabelIndex::decode(reader)?).into(),
            0x0d => Control::BrIf(LabelIndex::decode(reader)?).into(),
            0x0e => {
                let table = decode_vec(reader, LabelIndex::decode)?;
                let idx = LabelIndex::decode(reader)?;
                Control::BrTable { table, idx }.into()
            }
            0x0f => Control::Return.into(),
            0x10 => Control::Call(FuncIndex::decode(reader)?).into(),
            0x11 => {
                let y = TypeIndex::decode(reader)?;
                let x = TableIndex::decode(reader)?;
                Control::CallIndirect { y, x }.into()
            }

            // Parametric Instructions
            0x1a => Instr::Parametric(Parametric::Drop),
            0x1b => Instr::Parametric(Parametric::Select),
            0x1c => {
                return Err(DecodeError::NotImplemented {
                    what: "typed select instructions",
                    opcode: op_code,
                })
            }

            // Variable Instructions
            0x20 => Instr::Var(Variable::LocalGet(LocalIndex::decode(reader)?)),
            0x21 => Instr::Var(Variable::LocalSet(LocalIndex::decode(reader)?)),
            0x22 => Instr::Var(Variable::LocalTee(LocalIndex::decode(reader)?)),
            0x23 => Instr::Var(Variable::GlobalGet(GlobalIndex::decode(reader)?)),
            0x24 => Instr::Var(Variable::GlobalSet(GlobalIndex::decode(reader)?)),
            0x25 | 0x26 => {
                return Err(DecodeError::NotImplemented {
                    what: "table instructions",
                    opcode: op_code,
                })
            }

            // Memory Instructions
            0x28..=0x35 => {
                let (t, ext) = LOADS[at(0x28)];
                Instr::Mem(Mem::Load(t, MemArg::decode(reader)?, ext))
            }
            0x36..=0x3e => {
                let (t, size) = STORES[at(0x36)];
                Instr::Mem(Mem::Store(t, MemArg::decode(reader)?, size))
            }
            0x3f | 0x40 => {
                if reader.next()? != 0x00 {
                    return Err(DecodeError::InvalidImmediate("memory index must be zero"));
                }
                Instr::Mem(if op_code == 0x3f {
                    Mem::MemorySize
                } else {
                    Mem::MemoryGrow
                })
            }

            // Numeric Instructions
            0x41 => Num::Constant(Const::I32(read_s32(reader)?)).into(),
            0x42 => Num::Constant(Const::I64(read_s64(reader)?)).into(),
            0x43 => Num::Constant(Const::F32(decode_f32(reader)?)).into(),
            0x44 => Num::Constant(Const::F64(decode_f64(reader)?)).into(),

            0x45 => int(IntTy::I32, NumIOp::Test(ITestOp::Eqz)),
            0x46..=0x4f => int(IntTy::I32, NumIOp::Rel(IRELOPS[at(0x46)])),
            0x50 => int(IntTy::I64, NumIOp::Test(ITestOp::Eqz)),
            0x51..=0x5a => int(IntTy::I64, NumIOp::Rel(IRELOPS[at(0x51)])),
            0x5b..=0x60 => float(FloatTy::F32, NumFOp::Rel(FRELOPS[at(0x5b)])),
            0x61..=0x66 => float(FloatTy::F64, NumFOp::Rel(FRELOPS[at(0x61)])),

            0x67..=0x69 => int(IntTy::I32, NumIOp::Unary(IUNOPS[at(0x67)])),
            0x6a..=0x78 => int(IntTy::I32, NumIOp::Binary(IBINOPS[at(0x6a)])),
            0x79..=0x7b => int(IntTy::I64, NumIOp::Unary(IUNOPS[at(0x79)])),
            0x7c..=0x8a => int(IntTy::I64, NumIOp::Binary(IBINOPS[at(0x7c)])),
            0x8b..=0x91 => float(FloatTy::F32, NumFOp::Unary(FUNOPS[at(0x8b)])),
            0x92..=0x98 => float(FloatTy::F32, NumFOp::Binary(FBINOPS[at(0x92)])),
            0x99..=0x9f => float(FloatTy::F64, NumFOp::Unary(FUNOPS[at(0x99)])),
            0xa0..=0xa6 => float(FloatTy::F64, NumFOp::Binary(FBINOPS[at(0xa0)])),

            0xa7 => cvt(CvtOp::I32WrapI64),
            0xa8..=0xab => {
                let (i, f, s) = CVT_OPERANDS[at(0xa8)];
                cvt(CvtOp::Trunc(i, f, s))
            }
            0xac => cvt(CvtOp::I64ExtendI32(SignExtension::Signed)),
            0xad => cvt(CvtOp::I64ExtendI32(SignExtension::Unsigned)),
            0xae..=0xb1 => {
                let (i, f, s) = CVT_OPERANDS[at(0xae) + 4];
                cvt(CvtOp::Trunc(i, f, s))
            }
            0xb2..=0xb5 => cvt(convert(FloatTy::F32, at(0xb2))),
            0xb6 => cvt(CvtOp::F32DemoteF64),
            0xb7..=0xba => cvt(convert(FloatTy::F64, at(0xb7))),
            0xbb => cvt(CvtOp::F64PromoteF32),
            0xbc => cvt(CvtOp::I32ReinterpretF32),
            0xbd => cvt(CvtOp::I64ReinterpretF64),
            0xbe => cvt(CvtOp::F32ReinterpretI32),
            0xbf => cvt(CvtOp::F64ReinterpretI64),

            0xc0 => int(IntTy::I32, NumIOp::Unary(IUnOp::Extend(StorageSize::Size8))),
            0xc1 => int(IntTy::I32, NumIOp::Unary(IUnOp::Extend(StorageSize::Size16))),
            0xc2 => int(IntTy::I64, NumIOp::Unary(IUnOp::Extend(StorageSize::Size8))),
            0xc3 => int(IntTy::I64, NumIOp::Unary(IUnOp::Extend(StorageSize::Size16))),
            0xc4 => int(IntTy::I64, NumIOp::Unary(IUnOp::Extend(StorageSize::Size32))),

            0xd0..=0xd2 => {
                return Err(DecodeError::NotImplemented {
                    what: "reference instructions",
                    opcode: op_code,
                })
            }

            0xfc => match read_u32(reader)? {
                sub @ 0..=7 => {
                    let (i, f, s) = CVT_OPERANDS[sub as usize];
                    cvt(CvtOp::TruncSat(i, f, s))
                }
                8..=17 => {
                    return Err(DecodeError::NotImplemented {
                        what: "bulk memory instructions",
                        opcode: op_code,
                    })
                }
                sub => return Err(DecodeError::InvalidPrefixedOpcode(op_code, sub)),
            },
            0xfd => {
                return Err(DecodeError::NotImplemented {
                    what: "vector instructions",
                    opcode: op_code,
                })
            }
            _ => return Err(DecodeError::InvalidOpcode(op_code)),
        };

        Ok(instr)
    }
}

impl Expr {
    /// Decodes instructions up to and including the `end` which closes the
    /// expression.
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let mut instrs = Vec::new();
        let mut depth = 0usize;

        loop {
            let instr = Instr::decode(reader)?;
            match instr {
                Instr::Control(Control::Block(_) | Control::Loop(_) | Control::If(_)) => {
                    depth += 1;
                }
                Instr::Control(Control::End) => {
                    if depth == 0 {
                        instrs.push(instr);
                        return Ok(Self { instrs });
                    }
                    depth -= 1;
                }
                _ => {}
            }
            instrs.push(instr);
        }
    }
}

impl ConstExpr {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let instr = Instr::decode(reader)?;
        if instr == Instr::Control(Control::End) {
            return Err(DecodeError::MalformedSection("empty initializer expression"));
        }
        if Instr::decode(reader)? != Instr::Control(Control::End) {
            return Err(DecodeError::MalformedSection(
                "initializer expression must be a single instruction",
            ));
        }
        Ok(Self { instr })
    }
}

impl ImportDesc {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        match reader.next()? {
            0x00 => Ok(Self::Func(TypeIndex::decode(reader)?)),
            0x01 => Ok(Self::Table(TableTy::decode(reader)?)),
            0x02 => Ok(Self::Mem(MemTy::decode(reader)?)),
            0x03 => Ok(Self::Global(GlobalTy::decode(reader)?)),
            _ => Err(DecodeError::MalformedSection("invalid import kind")),
        }
    }
}

impl Import {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let module = decode_name(reader)?;
        let name = decode_name(reader)?;
        let desc = ImportDesc::decode(reader)?;

        Ok(Self { module, name, desc })
    }
}

impl Global {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let ty = GlobalTy::decode(reader)?;
        let init = ConstExpr::decode(reader)?;

        Ok(Self { ty, init })
    }
}

impl ExportDesc {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        match reader.next()? {
            0x00 => Ok(Self::Func(FuncIndex::decode(reader)?)),
            0x01 => Ok(Self::Table(TableIndex::decode(reader)?)),
            0x02 => Ok(Self::Mem(MemIndex::decode(reader)?)),
            0x03 => Ok(Self::Global(GlobalIndex::decode(reader)?)),
            _ => Err(DecodeError::MalformedSection("invalid export kind")),
        }
    }
}

impl Export {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let name = decode_name(reader)?;
        let desc = ExportDesc::decode(reader)?;

        Ok(Self { name, desc })
    }
}

impl Elem {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let flag = read_u32(reader)?;
        let table = match flag {
            0 => TableIndex::default(),
            2 => TableIndex::decode(reader)?,
            1 | 3..=7 => return Err(DecodeError::UnsupportedSegment(flag)),
            _ => return Err(DecodeError::MalformedSection("invalid element segment flag")),
        };
        let offset = ConstExpr::decode(reader)?;
        // An explicit table index is followed by the element kind.
        if flag == 2 && reader.next()? != 0x00 {
            return Err(DecodeError::MalformedSection("invalid element kind"));
        }
        let init = decode_vec(reader, FuncIndex::decode)?;

        Ok(Self {
            ty: RefTy::FuncRef,
            table,
            offset,
            init,
        })
    }
}

impl Data {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let mem = match read_u32(reader)? {
            0 => MemIndex::default(),
            2 => MemIndex::decode(reader)?,
            1 => return Err(DecodeError::UnsupportedSegment(1)),
            _ => return Err(DecodeError::MalformedSection("invalid data segment flag")),
        };
        let offset = ConstExpr::decode(reader)?;
        let init = decode_bytes_vec(reader)?;

        Ok(Self { mem, offset, init })
    }
}

/// Locals and body of one code section entry.
#[derive(Debug)]
struct Code {
    locals: Vec<ValTy>,
    body: Expr,
}

impl Code {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        let size = read_u32(reader)?;
        let expected_pos = reader.pos() + u64::from(size);

        let decls = decode_vec(reader, |r| Ok((read_u32(r)?, ValTy::decode(r)?)))?;
        let total = decls.iter().map(|(n, _)| u64::from(*n)).sum::<u64>();
        if total > MAX_LOCALS {
            return Err(DecodeError::MalformedSection("too many locals"));
        }
        let mut locals = Vec::with_capacity(total as usize);
        for (n, t) in decls {
            locals.resize(locals.len() + n as usize, t);
        }

        let body = Expr::decode(reader)?;

        if reader.pos() != expected_pos {
            return Err(DecodeError::MalformedSection("code entry size mismatch"));
        }

        Ok(Self { locals, body })
    }
}

/// Section Ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SectionId {
    Custom = 0,
    Type,
    Import,
    Function,
    Table,
    Memory,
    Global,
    Export,
    Start,
    Element,
    Code,
    Data,
}

impl SectionId {
    fn from_byte(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Custom,
            1 => Self::Type,
            2 => Self::Import,
            3 => Self::Function,
            4 => Self::Table,
            5 => Self::Memory,
            6 => Self::Global,
            7 => Self::Export,
            8 => Self::Start,
            9 => Self::Element,
            10 => Self::Code,
            11 => Self::Data,
            _ => return None,
        })
    }
}

impl Module {
    fn decode<R>(reader: &mut R) -> Result<Self, DecodeError>
    where
        R: Read,
    {
        expect_bytes(reader, MAGIC, || DecodeError::InvalidMagic)?;
        expect_bytes(reader, VERSION, || DecodeError::InvalidVersion)?;

        let mut module = Module::default();
        let mut last_sec_id = None;
        let mut type_idxs = Vec::new();
        let mut codes = Vec::new();

        loop {
            let sec_id = match reader.next() {
                Ok(id) => id,
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(DecodeError::from(e)),
            };
            let sec_size = read_u32(reader)?;
            let start_pos = reader.pos();
            let expected_pos = start_pos + u64::from(sec_size);

            module.sections.push(SectionHeader {
                id: sec_id,
                offset: start_pos,
                size: sec_size,
            });

            let Some(id) = SectionId::from_byte(sec_id) else {
                return Err(DecodeError::MalformedSection("unknown section id"));
            };

            if id != SectionId::Custom {
                if last_sec_id.is_some_and(|last| last >= id) {
                    return Err(DecodeError::MalformedSection(
                        "section out of order or duplicated",
                    ));
                }
                last_sec_id = Some(id);
            }

            match id {
                SectionId::Custom => {
                    let name = decode_name(reader)?;
                    let Some(remaining) = expected_pos.checked_sub(reader.pos()) else {
                        return Err(DecodeError::MalformedSection("custom section name too long"));
                    };
                    let data = reader.take(u32::try_from(remaining).unwrap_or(u32::MAX))?;
                    module.customs.push(Custom { name, data });
                }
                SectionId::Type => module.types = decode_vec(reader, FuncTy::decode)?,
                SectionId::Import => module.imports = decode_vec(reader, Import::decode)?,
                SectionId::Function => type_idxs = decode_vec(reader, TypeIndex::decode)?,
                SectionId::Table => {
                    module.tables = decode_vec(reader, |r| Ok(TableDef { ty: TableTy::decode(r)? }))?;
                }
                SectionId::Memory => {
                    module.mems = decode_vec(reader, |r| Ok(MemDef { ty: MemTy::decode(r)? }))?;
                }
                SectionId::Global => module.globals = decode_vec(reader, Global::decode)?,
                SectionId::Export => module.exports = decode_vec(reader, Export::decode)?,
                SectionId::Start => module.start = Some(FuncIndex::decode(reader)?),
                SectionId::Element => module.elems = decode_vec(reader, Elem::decode)?,
                SectionId::Code => {
                    codes = decode_vec(reader, Code::decode)?;
                    if type_idxs.len() != codes.len() {
                        return Err(DecodeError::MalformedSection(
                            "function and code section have inconsistent lengths",
                        ));
                    }
                }
                SectionId::Data => module.datas = decode_vec(reader, Data::decode)?,
            }

            if reader.pos() != expected_pos {
                return Err(DecodeError::MalformedSection("section size mismatch"));
            }
        }

        if type_idxs.len() != codes.len() {
            return Err(DecodeError::MalformedSection(
                "function and code section have inconsistent lengths",
            ));
        }

        module.funcs = type_idxs
            .into_iter()
            .zip(codes)
            .map(|(ty, code)| Func {
                ty,
                locals: code.locals,
                body: code.body,
            })
            .collect();

        debug!(
            types = module.types.len(),
            imports = module.imports.len(),
            funcs = module.funcs.len(),
            exports = module.exports.len(),
            "decoded module"
        );

        Ok(module)
    }
}

/// Decodes a Wasm module in binary format.
fn decode<R: Read>(mut reader: R) -> Result<Module, Error> {
    Module::decode(&mut reader).map_err(|e| Error::new(e, reader.pos()))
}

/// Decodes a Wasm module in binary format.
///
/// # Errors
///
/// Returns an error if the data is invalid.
pub fn from_slice(s: &[u8]) -> Result<Module, Error> {
    decode(SliceRead::new(s))
}

/// Decodes a Wasm module in binary format.
///
/// # Errors
///
/// Returns an error if the data is invalid or if a problem occurs when reading.
pub fn from_reader<R>(r: R) -> Result<Module, Error>
where
    R: io::Read,
{
    decode(IoRead::new(r))
}

/// Reads a `.wasm` file and decodes it.
///
/// # Errors
///
/// Returns an error if the path does not have the `.wasm` extension, if the
/// file cannot be read, or if the contents are invalid.
pub fn decode_file<P>(path: P) -> Result<Module, Error>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if path.extension().and_then(OsStr::to_str) != Some(EXTENSION) {
        return Err(Error::new(DecodeError::InvalidExtension, 0));
    }
    let bytes = std::fs::read(path).map_err(|e| Error::new(DecodeError::Io(e), 0))?;
    debug!(path = %path.display(), len = bytes.len(), "read module file");
    from_slice(&bytes)
}

/// Decodes a single instruction.
///
/// Returns the instruction and the number of bytes consumed.
///
/// # Errors
///
/// Returns an error if the opcode or an immediate is invalid, or if the
/// opcode belongs to an unsupported proposal.
pub fn decode_instr(bytes: &[u8]) -> Result<(Instr, usize), Error> {
    let mut reader = SliceRead::new(bytes);
    match Instr::decode(&mut reader) {
        Ok(instr) => Ok((instr, reader.pos() as usize)),
        Err(e) => Err(Error::new(e, reader.pos())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(sections: &[(u8, &[u8])]) -> Vec<u8> {
        let mut bytes = [MAGIC, VERSION].concat();
        for (id, payload) in sections {
            bytes.push(*id);
            bytes.extend(leb128::tests::encode_u32(payload.len() as u32));
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    #[test]
    fn empty_module() {
        let m = from_slice(&module_bytes(&[])).unwrap();
        assert_eq!(m, Module::default());
    }

    #[test]
    fn invalid_preamble() {
        let err = from_slice(b"\0asn\x01\0\0\0").unwrap_err();
        assert!(matches!(err.kind(), DecodeError::InvalidMagic));
        assert_eq!(err.pos(), 4);

        let err = from_slice(b"\0asm\x02\0\0\0").unwrap_err();
        assert!(matches!(err.kind(), DecodeError::InvalidVersion));

        let err = from_slice(b"\0as").unwrap_err();
        assert!(matches!(err.kind(), DecodeError::UnexpectedEof));
    }

    #[test]
    fn sections_must_be_ordered_and_unique() {
        let types: &[u8] = &[0x01, 0x60, 0x00, 0x00];
        let funcs: &[u8] = &[0x00];

        let err = from_slice(&module_bytes(&[(3, funcs), (1, types)])).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::MalformedSection(_)));

        let err = from_slice(&module_bytes(&[(1, types), (1, types)])).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::MalformedSection(_)));

        // Custom sections may appear anywhere.
        let custom: &[u8] = &[0x04, b'n', b'o', b't', b'e', 0xaa, 0xbb];
        let m = from_slice(&module_bytes(&[(0, custom), (1, types), (0, custom)])).unwrap();
        assert_eq!(m.types.len(), 1);
        assert_eq!(m.customs.len(), 2);
        assert_eq!(m.customs[0].name, "note");
        assert_eq!(m.customs[0].data, vec![0xaa, 0xbb]);
        assert_eq!(m.sections.len(), 3);
        assert_eq!(m.sections[1].name(), "type");
        assert_eq!(m.sections[1].offset, 19);
    }

    #[test]
    fn unknown_section_id() {
        let payload: &[u8] = &[0x00];
        let err = from_slice(&module_bytes(&[(12, payload)])).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::MalformedSection(_)));
    }

    #[test]
    fn truncated_section() {
        let mut bytes = [MAGIC, VERSION].concat();
        bytes.extend([0x01, 0x05, 0x01, 0x60]);
        let err = from_slice(&bytes).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::UnexpectedEof));
    }

    #[test]
    fn section_size_mismatch() {
        // Type section declares 5 bytes but the vector only needs 4.
        let mut bytes = [MAGIC, VERSION].concat();
        bytes.extend([0x01, 0x05, 0x01, 0x60, 0x00, 0x00, 0x00]);
        let err = from_slice(&bytes).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::MalformedSection(_)));
    }

    #[test]
    fn function_without_code() {
        let types: &[u8] = &[0x01, 0x60, 0x00, 0x00];
        let funcs: &[u8] = &[0x01, 0x00];
        let err = from_slice(&module_bytes(&[(1, types), (3, funcs)])).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::MalformedSection(_)));
    }

    #[test]
    fn nested_blocks_end_the_body_once() {
        let bytes = wat::parse_str(
            r#"(module
                (func (result i32)
                    (block (result i32)
                        (loop (result i32)
                            (if (result i32) (i32.const 1)
                                (then (i32.const 2))
                                (else (i32.const 3)))))))"#,
        )
        .unwrap();
        let m = from_slice(&bytes).unwrap();
        assert_eq!(m.funcs.len(), 1);

        let body = &m.funcs[0].body.instrs;
        let ends = body
            .iter()
            .filter(|i| **i == Instr::Control(Control::End))
            .count();
        assert_eq!(ends, 4);
        assert_eq!(body.last(), Some(&Instr::Control(Control::End)));
        assert!(body.contains(&Instr::Control(Control::Else)));
    }

    #[test]
    fn decode_with_reader() {
        let bytes = wat::parse_str(
            r#"(module
                (memory 1 2)
                (global $g (mut i64) (i64.const -5))
                (func $f (export "f") (param i32) (local f32 f32) nop)
                (data (i32.const 8) "hi"))"#,
        )
        .unwrap();
        let from_slice = from_slice(&bytes).unwrap();
        let from_reader = from_reader(bytes.as_slice()).unwrap();
        assert_eq!(from_slice, from_reader);

        assert_eq!(from_slice.mems[0].ty.lim, Limits { min: 1, max: Some(2) });
        assert_eq!(
            from_slice.globals[0].init.instr,
            Instr::Num(Num::Constant(Const::I64(-5)))
        );
        assert_eq!(from_slice.funcs[0].locals, vec![ValTy::F32, ValTy::F32]);
        assert_eq!(from_slice.exports[0].name, "f");
        assert_eq!(from_slice.datas[0].init, b"hi".to_vec());
    }

    #[test]
    fn single_instructions() {
        let (instr, len) = decode_instr(&[0x41, 0x7f]).unwrap();
        assert_eq!(instr, Instr::Num(Num::Constant(Const::I32(-1))));
        assert_eq!(len, 2);

        let (instr, len) = decode_instr(&[0x28, 0x02, 0x10]).unwrap();
        assert_eq!(
            instr,
            Instr::Mem(Mem::Load(
                NumTy::I32,
                MemArg {
                    align: 2,
                    offset: 16
                },
                None
            ))
        );
        assert_eq!(len, 3);

        let (instr, _) = decode_instr(&[0xfc, 0x03]).unwrap();
        assert_eq!(
            instr,
            cvt(CvtOp::TruncSat(
                IntTy::I32,
                FloatTy::F64,
                SignExtension::Unsigned
            ))
        );

        let (instr, _) = decode_instr(&[0xb8]).unwrap();
        assert_eq!(
            instr,
            cvt(CvtOp::Convert(
                FloatTy::F64,
                IntTy::I32,
                SignExtension::Unsigned
            ))
        );

        let (instr, _) = decode_instr(&[0xb4]).unwrap();
        assert_eq!(
            instr,
            cvt(CvtOp::Convert(FloatTy::F32, IntTy::I64, SignExtension::Signed))
        );

        let (instr, _) = decode_instr(&[0x0e, 0x02, 0x00, 0x01, 0x02]).unwrap();
        assert_eq!(
            instr,
            Instr::Control(Control::BrTable {
                table: vec![LabelIndex::new(0), LabelIndex::new(1)],
                idx: LabelIndex::new(2),
            })
        );
    }

    #[test]
    fn rejected_instructions() {
        let err = decode_instr(&[0x06]).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::InvalidOpcode(0x06)));

        let err = decode_instr(&[0xd0, 0x70]).unwrap_err();
        assert!(matches!(
            err.kind(),
            DecodeError::NotImplemented { opcode: 0xd0, .. }
        ));

        let err = decode_instr(&[0xfc, 0x0a, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::NotImplemented { .. }));

        let err = decode_instr(&[0xfc, 0x20]).unwrap_err();
        assert!(matches!(
            err.kind(),
            DecodeError::InvalidPrefixedOpcode(0xfc, 0x20)
        ));

        let err = decode_instr(&[0x3f, 0x01]).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::InvalidImmediate(_)));

        let err = decode_instr(&[0x42, 0x80]).unwrap_err();
        assert!(matches!(err.kind(), DecodeError::UnexpectedEof));
    }

    #[test]
    fn file_extension_is_checked() {
        let err = decode_file("module.wat").unwrap_err();
        assert!(matches!(err.kind(), DecodeError::InvalidExtension));

        let path = std::env::temp_dir().join(format!("wasmvp-{}.wasm", std::process::id()));
        std::fs::write(&path, module_bytes(&[])).unwrap();
        let m = decode_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(m, Module::default());
    }
}
