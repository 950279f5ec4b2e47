//! Numeric instruction semantics.
//!
//! Integers are two's complement with wrapping arithmetic. Floats follow
//! IEEE 754 with the Wasm rules for `min`, `max` and `nearest`.

use crate::module::instr::{
    self, CvtOp, FBinOp, FRelOp, FUnOp, FloatTy, IBinOp, IRelOp, ITestOp, IUnOp, IntTy,
    NumFOp, NumIOp, SignExtension, StorageSize,
};

use super::{
    val::{Num, Val},
    TrapKind,
};

const OPERAND: TrapKind = TrapKind::Internal("operand type does not match instruction");

macro_rules! pop_num {
    ($name:ident, $variant:ident, $t:ty) => {
        #[inline]
        fn $name(stack: &mut Vec<Val>) -> Result<$t, TrapKind> {
            match stack.pop() {
                Some(Val::Num(Num::$variant(n))) => Ok(n),
                _ => Err(OPERAND),
            }
        }
    };
}

pop_num!(pop_i32, I32, i32);
pop_num!(pop_i64, I64, i64);
pop_num!(pop_f32, F32, f32);
pop_num!(pop_f64, F64, f64);

macro_rules! int_ops {
    ($unop:ident, $binop:ident, $relop:ident, $t:ty, $ut:ty) => {
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        pub(crate) fn $unop(op: IUnOp, a: $t) -> $t {
            match op {
                IUnOp::Clz => a.leading_zeros() as $t,
                IUnOp::Ctz => a.trailing_zeros() as $t,
                IUnOp::PopCnt => a.count_ones() as $t,
                IUnOp::Extend(StorageSize::Size8) => a as i8 as $t,
                IUnOp::Extend(StorageSize::Size16) => a as i16 as $t,
                IUnOp::Extend(StorageSize::Size32) => a as i32 as $t,
            }
        }

        #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
        pub(crate) fn $binop(op: IBinOp, a: $t, b: $t) -> Result<$t, TrapKind> {
            // Shift and rotate counts are taken modulo the bit width.
            let k = b as u32;
            Ok(match op {
                IBinOp::Add => a.wrapping_add(b),
                IBinOp::Sub => a.wrapping_sub(b),
                IBinOp::Mul => a.wrapping_mul(b),
                IBinOp::Div(SignExtension::Signed) => {
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero);
                    }
                    if a == <$t>::MIN && b == -1 {
                        return Err(TrapKind::IntegerOverflow);
                    }
                    a / b
                }
                IBinOp::Div(SignExtension::Unsigned) => {
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero);
                    }
                    ((a as $ut) / (b as $ut)) as $t
                }
                IBinOp::Rem(SignExtension::Signed) => {
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero);
                    }
                    a.wrapping_rem(b)
                }
                IBinOp::Rem(SignExtension::Unsigned) => {
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero);
                    }
                    ((a as $ut) % (b as $ut)) as $t
                }
                IBinOp::And => a & b,
                IBinOp::Or => a | b,
                IBinOp::Xor => a ^ b,
                IBinOp::Shl => a.wrapping_shl(k),
                IBinOp::Shr(SignExtension::Signed) => a.wrapping_shr(k),
                IBinOp::Shr(SignExtension::Unsigned) => (a as $ut).wrapping_shr(k) as $t,
                IBinOp::Rotl => a.rotate_left(k),
                IBinOp::Rotr => a.rotate_right(k),
            })
        }

        #[allow(clippy::cast_sign_loss)]
        pub(crate) fn $relop(op: IRelOp, a: $t, b: $t) -> bool {
            match op {
                IRelOp::Eq => a == b,
                IRelOp::Ne => a != b,
                IRelOp::Lt(SignExtension::Signed) => a < b,
                IRelOp::Lt(SignExtension::Unsigned) => (a as $ut) < (b as $ut),
                IRelOp::Gt(SignExtension::Signed) => a > b,
                IRelOp::Gt(SignExtension::Unsigned) => (a as $ut) > (b as $ut),
                IRelOp::Le(SignExtension::Signed) => a <= b,
                IRelOp::Le(SignExtension::Unsigned) => (a as $ut) <= (b as $ut),
                IRelOp::Ge(SignExtension::Signed) => a >= b,
                IRelOp::Ge(SignExtension::Unsigned) => (a as $ut) >= (b as $ut),
            }
        }
    };
}

int_ops!(i32_unop, i32_binop, i32_relop, i32, u32);
int_ops!(i64_unop, i64_binop, i64_relop, i64, u64);

macro_rules! float_ops {
    ($unop:ident, $binop:ident, $relop:ident, $t:ty, $sign:expr) => {
        pub(crate) fn $unop(op: FUnOp, a: $t) -> $t {
            match op {
                FUnOp::Abs => <$t>::from_bits(a.to_bits() & !$sign),
                FUnOp::Neg => <$t>::from_bits(a.to_bits() ^ $sign),
                FUnOp::Sqrt => a.sqrt(),
                FUnOp::Ceil => a.ceil(),
                FUnOp::Floor => a.floor(),
                FUnOp::Trunc => a.trunc(),
                FUnOp::Nearest => a.round_ties_even(),
            }
        }

        pub(crate) fn $binop(op: FBinOp, a: $t, b: $t) -> $t {
            match op {
                FBinOp::Add => a + b,
                FBinOp::Sub => a - b,
                FBinOp::Mul => a * b,
                FBinOp::Div => a / b,
                FBinOp::Min => {
                    if a.is_nan() || b.is_nan() {
                        a + b
                    } else if a == b {
                        // -0 and +0 compare equal; the negative sign wins.
                        <$t>::from_bits(a.to_bits() | b.to_bits())
                    } else {
                        a.min(b)
                    }
                }
                FBinOp::Max => {
                    if a.is_nan() || b.is_nan() {
                        a + b
                    } else if a == b {
                        <$t>::from_bits(a.to_bits() & b.to_bits())
                    } else {
                        a.max(b)
                    }
                }
                FBinOp::CopySign => a.copysign(b),
            }
        }

        #[allow(clippy::float_cmp)]
        pub(crate) fn $relop(op: FRelOp, a: $t, b: $t) -> bool {
            match op {
                FRelOp::Eq => a == b,
                FRelOp::Ne => a != b,
                FRelOp::Lt => a < b,
                FRelOp::Gt => a > b,
                FRelOp::Le => a <= b,
                FRelOp::Ge => a >= b,
            }
        }
    };
}

float_ops!(f32_unop, f32_binop, f32_relop, f32, 1u32 << 31);
float_ops!(f64_unop, f64_binop, f64_relop, f64, 1u64 << 63);

/// Truncates toward zero, trapping on NaN and on results outside the target
/// range. The bounds are exact in `f64`, which also represents every `f32`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
fn trunc(i: IntTy, s: SignExtension, x: f64) -> Result<Num, TrapKind> {
    if x.is_nan() {
        return Err(TrapKind::InvalidConversionToInteger);
    }
    let n = match (i, s) {
        (IntTy::I32, SignExtension::Signed) if x > -2_147_483_649.0 && x < 2_147_483_648.0 => {
            Num::I32(x as i32)
        }
        (IntTy::I32, SignExtension::Unsigned) if x > -1.0 && x < 4_294_967_296.0 => {
            Num::I32(x as u32 as i32)
        }
        (IntTy::I64, SignExtension::Signed)
            if x >= -9_223_372_036_854_775_808.0 && x < 9_223_372_036_854_775_808.0 =>
        {
            Num::I64(x as i64)
        }
        (IntTy::I64, SignExtension::Unsigned) if x > -1.0 && x < 18_446_744_073_709_551_616.0 => {
            Num::I64(x as u64 as i64)
        }
        _ => return Err(TrapKind::IntegerOverflow),
    };
    Ok(n)
}

/// Saturating truncation: NaN becomes 0, out of range values clamp.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
fn trunc_sat(i: IntTy, s: SignExtension, x: f64) -> Num {
    match (i, s) {
        (IntTy::I32, SignExtension::Signed) => Num::I32(x as i32),
        (IntTy::I32, SignExtension::Unsigned) => Num::I32(x as u32 as i32),
        (IntTy::I64, SignExtension::Signed) => Num::I64(x as i64),
        (IntTy::I64, SignExtension::Unsigned) => Num::I64(x as u64 as i64),
    }
}

/// Applies a conversion operator.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]
pub(crate) fn convert(op: CvtOp, v: Num) -> Result<Num, TrapKind> {
    let float_operand = |f: FloatTy| match (f, v) {
        (FloatTy::F32, Num::F32(x)) => Ok(f64::from(x)),
        (FloatTy::F64, Num::F64(x)) => Ok(x),
        _ => Err(OPERAND),
    };

    Ok(match (op, v) {
        (CvtOp::I32WrapI64, Num::I64(n)) => Num::I32(n as i32),
        (CvtOp::Trunc(i, f, s), _) => trunc(i, s, float_operand(f)?)?,
        (CvtOp::TruncSat(i, f, s), _) => trunc_sat(i, s, float_operand(f)?),
        (CvtOp::I64ExtendI32(SignExtension::Signed), Num::I32(n)) => Num::I64(i64::from(n)),
        (CvtOp::I64ExtendI32(SignExtension::Unsigned), Num::I32(n)) => {
            Num::I64(i64::from(n as u32))
        }
        (CvtOp::Convert(FloatTy::F32, IntTy::I32, s), Num::I32(n)) => Num::F32(match s {
            SignExtension::Signed => n as f32,
            SignExtension::Unsigned => n as u32 as f32,
        }),
        (CvtOp::Convert(FloatTy::F32, IntTy::I64, s), Num::I64(n)) => Num::F32(match s {
            SignExtension::Signed => n as f32,
            SignExtension::Unsigned => n as u64 as f32,
        }),
        (CvtOp::Convert(FloatTy::F64, IntTy::I32, s), Num::I32(n)) => Num::F64(match s {
            SignExtension::Signed => f64::from(n),
            SignExtension::Unsigned => f64::from(n as u32),
        }),
        (CvtOp::Convert(FloatTy::F64, IntTy::I64, s), Num::I64(n)) => Num::F64(match s {
            SignExtension::Signed => n as f64,
            SignExtension::Unsigned => n as u64 as f64,
        }),
        (CvtOp::F32DemoteF64, Num::F64(x)) => Num::F32(x as f32),
        (CvtOp::F64PromoteF32, Num::F32(x)) => Num::F64(f64::from(x)),
        (CvtOp::I32ReinterpretF32, Num::F32(x)) => Num::I32(x.to_bits() as i32),
        (CvtOp::I64ReinterpretF64, Num::F64(x)) => Num::I64(x.to_bits() as i64),
        (CvtOp::F32ReinterpretI32, Num::I32(n)) => Num::F32(f32::from_bits(n as u32)),
        (CvtOp::F64ReinterpretI64, Num::I64(n)) => Num::F64(f64::from_bits(n as u64)),
        _ => return Err(OPERAND),
    })
}

macro_rules! int_exec {
    ($name:ident, $pop:ident, $unop:ident, $binop:ident, $relop:ident) => {
        fn $name(op: NumIOp, stack: &mut Vec<Val>) -> Result<Val, TrapKind> {
            Ok(match op {
                NumIOp::Unary(op) => Val::from($unop(op, $pop(stack)?)),
                NumIOp::Binary(op) => {
                    let b = $pop(stack)?;
                    let a = $pop(stack)?;
                    Val::from($binop(op, a, b)?)
                }
                NumIOp::Test(ITestOp::Eqz) => Val::from($pop(stack)? == 0),
                NumIOp::Rel(op) => {
                    let b = $pop(stack)?;
                    let a = $pop(stack)?;
                    Val::from($relop(op, a, b))
                }
            })
        }
    };
}

int_exec!(exec_i32, pop_i32, i32_unop, i32_binop, i32_relop);
int_exec!(exec_i64, pop_i64, i64_unop, i64_binop, i64_relop);

macro_rules! float_exec {
    ($name:ident, $pop:ident, $unop:ident, $binop:ident, $relop:ident) => {
        fn $name(op: NumFOp, stack: &mut Vec<Val>) -> Result<Val, TrapKind> {
            Ok(match op {
                NumFOp::Unary(op) => Val::from($unop(op, $pop(stack)?)),
                NumFOp::Binary(op) => {
                    let b = $pop(stack)?;
                    let a = $pop(stack)?;
                    Val::from($binop(op, a, b))
                }
                NumFOp::Rel(op) => {
                    let b = $pop(stack)?;
                    let a = $pop(stack)?;
                    Val::from($relop(op, a, b))
                }
            })
        }
    };
}

float_exec!(exec_f32, pop_f32, f32_unop, f32_binop, f32_relop);
float_exec!(exec_f64, pop_f64, f64_unop, f64_binop, f64_relop);

/// Executes a numeric instruction against the operand stack.
pub(crate) fn exec(op: instr::Num, stack: &mut Vec<Val>) -> Result<(), TrapKind> {
    let result = match op {
        instr::Num::Constant(c) => Val::Num(Num::from(c)),
        instr::Num::Int(IntTy::I32, op) => exec_i32(op, stack)?,
        instr::Num::Int(IntTy::I64, op) => exec_i64(op, stack)?,
        instr::Num::Float(FloatTy::F32, op) => exec_f32(op, stack)?,
        instr::Num::Float(FloatTy::F64, op) => exec_f64(op, stack)?,
        instr::Num::Conversion(op) => match stack.pop() {
            Some(Val::Num(n)) => Val::Num(convert(op, n)?),
            _ => return Err(OPERAND),
        },
    };
    stack.push(result);
    Ok(())
}
