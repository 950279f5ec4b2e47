//! Validation for a module.
//!
//! Validation checks a decoded [`Module`] against the typing rules without
//! executing anything. Function bodies are checked with an abstract
//! interpretation over operand types and control frames.

use core::{fmt, ops::Deref};
use std::collections::HashSet;

use tracing::debug;

use crate::module::{
    instr::{
        BlockTy, ConstExpr, Control, Instr, Mem, Num, NumFOp, NumIOp, Parametric, Variable,
    },
    ty::{self, FuncTy, GlobalTy, Limits, MemTy, Mut, NumTy, RefTy, TableTy, ValTy, VecTy},
    ExportDesc, FuncIndex, GlobalIndex, ImportDesc, LabelIndex, LocalIndex, MemIndex, Module,
    TableIndex, TypeIndex,
};

/// Largest number of pages a memory may declare.
const MAX_PAGES: u32 = 65_536;

/// Reason a module is invalid.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationErrorKind {
    /// An operand has the wrong type.
    #[error("type mismatch")]
    TypeMismatch,
    /// An instruction pops more operands than the block provides.
    #[error("operand stack underflow")]
    Underflow,
    /// A block ends with extra operands on the stack.
    #[error("values remaining on the operand stack")]
    UnbalancedStack,
    /// An `end` has no matching block, or the body is missing its final `end`.
    #[error("unbalanced end")]
    UnbalancedEnd,
    /// `else` outside of an `if` block.
    #[error("else without if")]
    ElseWithoutIf,
    /// Unknown type index.
    #[error("unknown type {0}")]
    UnknownType(TypeIndex),
    /// Unknown function index.
    #[error("unknown function {0}")]
    UnknownFunc(FuncIndex),
    /// Unknown table index.
    #[error("unknown table {0}")]
    UnknownTable(TableIndex),
    /// Unknown memory index.
    #[error("unknown memory {0}")]
    UnknownMem(MemIndex),
    /// Unknown global index.
    #[error("unknown global {0}")]
    UnknownGlobal(GlobalIndex),
    /// Unknown local index.
    #[error("unknown local {0}")]
    UnknownLocal(LocalIndex),
    /// Branch to a label outside the enclosing blocks.
    #[error("unknown label {0}")]
    UnknownLabel(LabelIndex),
    /// More than one table, imports included.
    #[error("multiple tables")]
    MultipleTables,
    /// More than one memory, imports included.
    #[error("multiple memories")]
    MultipleMemories,
    /// The minimum is greater than the maximum.
    #[error("size minimum must not be greater than maximum")]
    InvalidLimits,
    /// A memory declares more than 65536 pages.
    #[error("memory size must be at most 65536 pages (4GiB)")]
    MemoryTooLarge,
    /// An initializer is not a constant expression.
    #[error("constant expression required")]
    ConstExprRequired,
    /// `global.set` on an immutable global.
    #[error("global is immutable")]
    ImmutableGlobal,
    /// Two exports share a name.
    #[error("duplicate export name `{0}`")]
    DuplicateExport(String),
    /// The start function does not have type `[] -> []`.
    #[error("start function must have type [] -> []")]
    InvalidStartFunction,
    /// The alignment is larger than the natural alignment.
    #[error("alignment must not be larger than natural")]
    InvalidAlignment,
    /// The table does not hold function references.
    #[error("table element type must be funcref")]
    NotFuncRef,
    /// Vector types are not supported.
    #[error("unsupported value type {0}")]
    UnsupportedType(ValTy),
    /// A function type returns more than one value.
    #[error("function types may return at most one value")]
    MultipleResults,
}

/// Where a validation error was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Type section entry
    Type(TypeIndex),
    /// Import section entry
    Import(usize),
    /// Function declaration
    Func(FuncIndex),
    /// Table
    Table(TableIndex),
    /// Memory
    Mem(MemIndex),
    /// Global
    Global(GlobalIndex),
    /// Export section entry
    Export(usize),
    /// Start function
    Start,
    /// Element segment
    Elem(usize),
    /// Data segment
    Data(usize),
    /// Instruction in a function body
    Code {
        /// Function index, imports included
        func: FuncIndex,
        /// Position of the instruction in the body
        instr: usize,
    },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Type(idx) => write!(f, "type {idx}"),
            Location::Import(idx) => write!(f, "import {idx}"),
            Location::Func(idx) => write!(f, "function {idx}"),
            Location::Table(idx) => write!(f, "table {idx}"),
            Location::Mem(idx) => write!(f, "memory {idx}"),
            Location::Global(idx) => write!(f, "global {idx}"),
            Location::Export(idx) => write!(f, "export {idx}"),
            Location::Start => f.write_str("start function"),
            Location::Elem(idx) => write!(f, "element segment {idx}"),
            Location::Data(idx) => write!(f, "data segment {idx}"),
            Location::Code { func, instr } => write!(f, "function {func} instruction {instr}"),
        }
    }
}

/// Error during validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} in {location}")]
pub struct Error {
    kind: ValidationErrorKind,
    location: Location,
}

impl Error {
    fn new(kind: ValidationErrorKind, location: Location) -> Self {
        Self { kind, location }
    }

    /// The rule which was violated.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &ValidationErrorKind {
        &self.kind
    }

    /// Where the violation was found.
    #[inline]
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }
}

/// A module which passed [`validate`].
///
/// Only a validated module can be instantiated.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedModule(Module);

impl ValidatedModule {
    /// Validates the module.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn new(module: Module) -> Result<Self, Error> {
        validate(&module)?;
        Ok(Self(module))
    }

    /// Returns the underlying module.
    #[must_use]
    pub fn into_inner(self) -> Module {
        self.0
    }
}

impl Deref for ValidatedModule {
    type Target = Module;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Operand type
///
/// A value type, or `Unknown` for operands produced by unreachable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpdTy {
    /// Number type
    Num(NumTy),
    /// Vector type
    Vec(VecTy),
    /// Reference type
    Ref(RefTy),
    /// Unknown type
    Unknown,
}

impl From<ValTy> for OpdTy {
    fn from(value: ValTy) -> Self {
        match value {
            ty::ValTy::Num(n) => OpdTy::Num(n),
            ty::ValTy::Vec(v) => OpdTy::Vec(v),
            ty::ValTy::Ref(r) => OpdTy::Ref(r),
        }
    }
}

impl From<NumTy> for OpdTy {
    fn from(value: NumTy) -> Self {
        OpdTy::Num(value)
    }
}

impl OpdTy {
    const I32: OpdTy = OpdTy::Num(NumTy::I32);

    /// Return true if the type is a numeric type, false otherwise.
    #[inline]
    #[must_use]
    fn is_num(self) -> bool {
        matches!(self, OpdTy::Num(_) | OpdTy::Unknown)
    }

    /// Return true if the type is a vector type, false otherwise.
    #[inline]
    #[must_use]
    fn is_vec(self) -> bool {
        matches!(self, OpdTy::Vec(_) | OpdTy::Unknown)
    }
}

fn opd_tys(tys: &[ValTy]) -> Vec<OpdTy> {
    tys.iter().copied().map(OpdTy::from).collect()
}

const LOOP_OP_CODE: u8 = 0x03;
const IF_OP_CODE: u8 = 0x04;
const ELSE_OP_CODE: u8 = 0x05;

#[derive(Debug)]
struct CtrlFrame {
    op_code: u8,
    start_tys: Vec<OpdTy>,
    end_tys: Vec<OpdTy>,
    height: usize,
    unreachable: bool,
}

impl CtrlFrame {
    fn label_tys(&self) -> &[OpdTy] {
        if self.op_code == LOOP_OP_CODE {
            &self.start_tys
        } else {
            &self.end_tys
        }
    }
}

type ValStack = Vec<OpdTy>;
type CtrlStack = Vec<CtrlFrame>;

#[derive(Debug, Default)]
struct ExprContext {
    vals: ValStack,
    ctrls: CtrlStack,
}

impl ExprContext {
    fn push_val(&mut self, ty: OpdTy) {
        self.vals.push(ty);
    }

    fn pop_val(&mut self) -> Result<OpdTy, ValidationErrorKind> {
        let Some(cur_frame) = self.ctrls.last() else {
            return Err(ValidationErrorKind::UnbalancedEnd);
        };
        if self.vals.len() == cur_frame.height {
            if cur_frame.unreachable {
                return Ok(OpdTy::Unknown);
            }
            return Err(ValidationErrorKind::Underflow);
        }
        self.vals.pop().ok_or(ValidationErrorKind::Underflow)
    }

    fn pop_expect_val(&mut self, expect: OpdTy) -> Result<OpdTy, ValidationErrorKind> {
        let actual = self.pop_val()?;
        if actual != expect && actual != OpdTy::Unknown && expect != OpdTy::Unknown {
            return Err(ValidationErrorKind::TypeMismatch);
        }
        Ok(actual)
    }

    fn push_vals(&mut self, tys: &[OpdTy]) {
        self.vals.extend_from_slice(tys);
    }

    fn pop_expect_vals(&mut self, tys: &[OpdTy]) -> Result<Vec<OpdTy>, ValidationErrorKind> {
        let mut popped = Vec::with_capacity(tys.len());
        for ty in tys.iter().rev() {
            popped.push(self.pop_expect_val(*ty)?);
        }
        popped.reverse();
        Ok(popped)
    }

    fn push_ctrl(&mut self, op_code: u8, start_tys: Vec<OpdTy>, end_tys: Vec<OpdTy>) {
        let height = self.vals.len();
        self.push_vals(&start_tys);
        self.ctrls.push(CtrlFrame {
            op_code,
            start_tys,
            end_tys,
            height,
            unreachable: false,
        });
    }

    fn pop_ctrl(&mut self) -> Result<CtrlFrame, ValidationErrorKind> {
        let Some(frame) = self.ctrls.last() else {
            return Err(ValidationErrorKind::UnbalancedEnd);
        };
        let height = frame.height;
        let end_tys = frame.end_tys.clone();
        self.pop_expect_vals(&end_tys)?;
        if self.vals.len() != height {
            return Err(ValidationErrorKind::UnbalancedStack);
        }
        self.ctrls.pop().ok_or(ValidationErrorKind::UnbalancedEnd)
    }

    fn unreachable(&mut self) -> Result<(), ValidationErrorKind> {
        let Some(frame) = self.ctrls.last_mut() else {
            return Err(ValidationErrorKind::UnbalancedEnd);
        };
        self.vals.truncate(frame.height);
        frame.unreachable = true;
        Ok(())
    }

    fn label_tys(&self, label: LabelIndex) -> Result<Vec<OpdTy>, ValidationErrorKind> {
        let l = usize::from(label);
        if l >= self.ctrls.len() {
            return Err(ValidationErrorKind::UnknownLabel(label));
        }
        Ok(self.ctrls[self.ctrls.len() - 1 - l].label_tys().to_vec())
    }
}

/// Index spaces of the module, imports first.
#[derive(Debug)]
struct Context<'a> {
    module: &'a Module,
    funcs: Vec<TypeIndex>,
    tables: Vec<TableTy>,
    mems: Vec<MemTy>,
    globals: Vec<GlobalTy>,
    imported_globals: usize,
}

impl<'a> Context<'a> {
    fn new(module: &'a Module) -> Self {
        let imported_globals = module.imported_globals().count();
        Self {
            module,
            funcs: module.func_ty_idxs().collect(),
            tables: module.table_tys().collect(),
            mems: module.mem_tys().collect(),
            globals: module.global_tys().collect(),
            imported_globals,
        }
    }

    fn func_ty(&self, idx: TypeIndex) -> Result<&'a FuncTy, ValidationErrorKind> {
        self.module
            .types
            .get(usize::from(idx))
            .ok_or(ValidationErrorKind::UnknownType(idx))
    }

    fn func(&self, idx: FuncIndex) -> Result<&'a FuncTy, ValidationErrorKind> {
        let ty = self
            .funcs
            .get(usize::from(idx))
            .ok_or(ValidationErrorKind::UnknownFunc(idx))?;
        self.func_ty(*ty)
    }

    fn table(&self, idx: TableIndex) -> Result<TableTy, ValidationErrorKind> {
        self.tables
            .get(usize::from(idx))
            .copied()
            .ok_or(ValidationErrorKind::UnknownTable(idx))
    }

    fn mem(&self, idx: MemIndex) -> Result<MemTy, ValidationErrorKind> {
        self.mems
            .get(usize::from(idx))
            .copied()
            .ok_or(ValidationErrorKind::UnknownMem(idx))
    }

    fn global(&self, idx: GlobalIndex) -> Result<GlobalTy, ValidationErrorKind> {
        self.globals
            .get(usize::from(idx))
            .copied()
            .ok_or(ValidationErrorKind::UnknownGlobal(idx))
    }

    fn block_tys(&self, bt: BlockTy) -> Result<(Vec<OpdTy>, Vec<OpdTy>), ValidationErrorKind> {
        Ok(match bt {
            BlockTy::Empty => (Vec::new(), Vec::new()),
            BlockTy::Val(t) => (Vec::new(), vec![OpdTy::from(t)]),
            BlockTy::Index(idx) => {
                let ty = self.func_ty(idx)?;
                (opd_tys(ty.params()), opd_tys(ty.ret()))
            }
        })
    }

    /// An initializer is a constant of the expected type, or the value of an
    /// imported immutable global.
    fn const_expr(&self, expr: &ConstExpr, expected: ValTy) -> Result<(), ValidationErrorKind> {
        let actual = match &expr.instr {
            Instr::Num(Num::Constant(c)) => ValTy::Num(c.ty()),
            Instr::Var(Variable::GlobalGet(idx)) => {
                let global = self.global(*idx)?;
                if usize::from(*idx) >= self.imported_globals || global.m != Mut::Const {
                    return Err(ValidationErrorKind::ConstExprRequired);
                }
                global.t
            }
            _ => return Err(ValidationErrorKind::ConstExprRequired),
        };
        if actual != expected {
            return Err(ValidationErrorKind::TypeMismatch);
        }
        Ok(())
    }
}

fn check_val_ty(t: ValTy) -> Result<(), ValidationErrorKind> {
    match t {
        ValTy::Vec(_) => Err(ValidationErrorKind::UnsupportedType(t)),
        ValTy::Num(_) | ValTy::Ref(_) => Ok(()),
    }
}

fn check_limits(lim: &Limits) -> Result<(), ValidationErrorKind> {
    if lim.is_valid() {
        Ok(())
    } else {
        Err(ValidationErrorKind::InvalidLimits)
    }
}

fn check_mem_ty(ty: &MemTy) -> Result<(), ValidationErrorKind> {
    check_limits(&ty.lim)?;
    if !ty.lim.is_within(MAX_PAGES) {
        return Err(ValidationErrorKind::MemoryTooLarge);
    }
    Ok(())
}

/// Checks one function body.
struct FuncValidator<'c, 'a> {
    ctx: &'c Context<'a>,
    expr: ExprContext,
    locals: Vec<ValTy>,
    ret: Vec<OpdTy>,
}

impl<'c, 'a> FuncValidator<'c, 'a> {
    fn new(ctx: &'c Context<'a>, func_ty: &FuncTy, locals: &[ValTy]) -> Self {
        let mut expr = ExprContext::default();
        let ret = opd_tys(func_ty.ret());
        // The implicit function block starts with an empty operand stack.
        expr.ctrls.push(CtrlFrame {
            op_code: 0x02,
            start_tys: Vec::new(),
            end_tys: ret.clone(),
            height: 0,
            unreachable: false,
        });

        let mut all_locals = func_ty.params().to_vec();
        all_locals.extend_from_slice(locals);

        Self {
            ctx,
            expr,
            locals: all_locals,
            ret,
        }
    }

    fn local(&self, idx: LocalIndex) -> Result<OpdTy, ValidationErrorKind> {
        self.locals
            .get(usize::from(idx))
            .copied()
            .map(OpdTy::from)
            .ok_or(ValidationErrorKind::UnknownLocal(idx))
    }

    fn check_mem_access(&self, mem: &Mem) -> Result<(), ValidationErrorKind> {
        self.ctx.mem(MemIndex::new(0))?;
        if let (Mem::Load(_, arg, _) | Mem::Store(_, arg, _), Some(width)) =
            (mem, mem.access_width())
        {
            if arg.align >= 32 || (1u64 << arg.align) > u64::from(width) {
                return Err(ValidationErrorKind::InvalidAlignment);
            }
        }
        Ok(())
    }

    /// Checks a body. Returns the index of the offending instruction on error.
    fn validate(mut self, body: &[Instr]) -> Result<(), (ValidationErrorKind, usize)> {
        for (pos, instr) in body.iter().enumerate() {
            self.instr(instr).map_err(|e| (e, pos))?;
            if self.expr.ctrls.is_empty() && pos + 1 != body.len() {
                return Err((ValidationErrorKind::UnbalancedEnd, pos + 1));
            }
        }
        if !self.expr.ctrls.is_empty() {
            return Err((ValidationErrorKind::UnbalancedEnd, body.len()));
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn instr(&mut self, instr: &Instr) -> Result<(), ValidationErrorKind> {
        let e = &mut self.expr;
        match instr {
            Instr::Control(c) => match c {
                Control::Unreachable => e.unreachable()?,
                Control::Nop => {}
                Control::Block(bt) | Control::Loop(bt) => {
                    let (start, end) = self.ctx.block_tys(*bt)?;
                    e.pop_expect_vals(&start)?;
                    let op_code = if matches!(c, Control::Loop(_)) {
                        LOOP_OP_CODE
                    } else {
                        0x02
                    };
                    e.push_ctrl(op_code, start, end);
                }
                Control::If(bt) => {
                    let (start, end) = self.ctx.block_tys(*bt)?;
                    e.pop_expect_val(OpdTy::I32)?;
                    e.pop_expect_vals(&start)?;
                    e.push_ctrl(IF_OP_CODE, start, end);
                }
                Control::Else => {
                    if e.ctrls.last().map(|f| f.op_code) != Some(IF_OP_CODE) {
                        return Err(ValidationErrorKind::ElseWithoutIf);
                    }
                    let frame = e.pop_ctrl()?;
                    e.push_ctrl(ELSE_OP_CODE, frame.start_tys, frame.end_tys);
                }
                Control::End => {
                    let frame = e.pop_ctrl()?;
                    if frame.op_code == IF_OP_CODE && frame.start_tys != frame.end_tys {
                        return Err(ValidationErrorKind::TypeMismatch);
                    }
                    e.push_vals(&frame.end_tys);
                }
                Control::Br(l) => {
                    let tys = e.label_tys(*l)?;
                    e.pop_expect_vals(&tys)?;
                    e.unreachable()?;
                }
                Control::BrIf(l) => {
                    e.pop_expect_val(OpdTy::I32)?;
                    let tys = e.label_tys(*l)?;
                    e.pop_expect_vals(&tys)?;
                    e.push_vals(&tys);
                }
                Control::BrTable { table, idx } => {
                    e.pop_expect_val(OpdTy::I32)?;
                    let default_tys = e.label_tys(*idx)?;
                    for l in table {
                        let tys = e.label_tys(*l)?;
                        if tys.len() != default_tys.len() {
                            return Err(ValidationErrorKind::TypeMismatch);
                        }
                        let popped = e.pop_expect_vals(&tys)?;
                        e.push_vals(&popped);
                    }
                    e.pop_expect_vals(&default_tys)?;
                    e.unreachable()?;
                }
                Control::Return => {
                    e.pop_expect_vals(&self.ret)?;
                    e.unreachable()?;
                }
                Control::Call(f) => {
                    let ty = self.ctx.func(*f)?;
                    e.pop_expect_vals(&opd_tys(ty.params()))?;
                    e.push_vals(&opd_tys(ty.ret()));
                }
                Control::CallIndirect { y, x } => {
                    let table = self.ctx.table(*x)?;
                    if table.elem_ty != RefTy::FuncRef {
                        return Err(ValidationErrorKind::NotFuncRef);
                    }
                    let ty = self.ctx.func_ty(*y)?;
                    e.pop_expect_val(OpdTy::I32)?;
                    e.pop_expect_vals(&opd_tys(ty.params()))?;
                    e.push_vals(&opd_tys(ty.ret()));
                }
            },
            Instr::Parametric(Parametric::Drop) => {
                e.pop_val()?;
            }
            Instr::Parametric(Parametric::Select) => {
                e.pop_expect_val(OpdTy::I32)?;
                let t1 = e.pop_val()?;
                let t2 = e.pop_val()?;
                if !((t1.is_num() && t2.is_num()) || (t1.is_vec() && t2.is_vec())) {
                    return Err(ValidationErrorKind::TypeMismatch);
                }
                if t1 != t2 && t1 != OpdTy::Unknown && t2 != OpdTy::Unknown {
                    return Err(ValidationErrorKind::TypeMismatch);
                }
                e.push_val(if t1 == OpdTy::Unknown { t2 } else { t1 });
            }
            Instr::Var(v) => match v {
                Variable::LocalGet(x) => {
                    let t = self.local(*x)?;
                    self.expr.push_val(t);
                }
                Variable::LocalSet(x) => {
                    let t = self.local(*x)?;
                    self.expr.pop_expect_val(t)?;
                }
                Variable::LocalTee(x) => {
                    let t = self.local(*x)?;
                    self.expr.pop_expect_val(t)?;
                    self.expr.push_val(t);
                }
                Variable::GlobalGet(x) => {
                    let g = self.ctx.global(*x)?;
                    e.push_val(g.t.into());
                }
                Variable::GlobalSet(x) => {
                    let g = self.ctx.global(*x)?;
                    if g.m != Mut::Var {
                        return Err(ValidationErrorKind::ImmutableGlobal);
                    }
                    e.pop_expect_val(g.t.into())?;
                }
            },
            Instr::Mem(m) => {
                self.check_mem_access(m)?;
                let e = &mut self.expr;
                match m {
                    Mem::Load(t, _, _) => {
                        e.pop_expect_val(OpdTy::I32)?;
                        e.push_val((*t).into());
                    }
                    Mem::Store(t, _, _) => {
                        e.pop_expect_val((*t).into())?;
                        e.pop_expect_val(OpdTy::I32)?;
                    }
                    Mem::MemorySize => e.push_val(OpdTy::I32),
                    Mem::MemoryGrow => {
                        e.pop_expect_val(OpdTy::I32)?;
                        e.push_val(OpdTy::I32);
                    }
                }
            }
            Instr::Num(n) => match n {
                Num::Constant(c) => e.push_val(c.ty().into()),
                Num::Int(t, op) => {
                    let t = OpdTy::from(NumTy::from(*t));
                    match op {
                        NumIOp::Unary(_) => {
                            e.pop_expect_val(t)?;
                            e.push_val(t);
                        }
                        NumIOp::Binary(_) => {
                            e.pop_expect_val(t)?;
                            e.pop_expect_val(t)?;
                            e.push_val(t);
                        }
                        NumIOp::Test(_) => {
                            e.pop_expect_val(t)?;
                            e.push_val(OpdTy::I32);
                        }
                        NumIOp::Rel(_) => {
                            e.pop_expect_val(t)?;
                            e.pop_expect_val(t)?;
                            e.push_val(OpdTy::I32);
                        }
                    }
                }
                Num::Float(t, op) => {
                    let t = OpdTy::from(NumTy::from(*t));
                    match op {
                        NumFOp::Unary(_) => {
                            e.pop_expect_val(t)?;
                            e.push_val(t);
                        }
                        NumFOp::Binary(_) => {
                            e.pop_expect_val(t)?;
                            e.pop_expect_val(t)?;
                            e.push_val(t);
                        }
                        NumFOp::Rel(_) => {
                            e.pop_expect_val(t)?;
                            e.pop_expect_val(t)?;
                            e.push_val(OpdTy::I32);
                        }
                    }
                }
                Num::Conversion(op) => {
                    let (from, to) = op.tys();
                    e.pop_expect_val(from.into())?;
                    e.push_val(to.into());
                }
            },
        }
        Ok(())
    }
}

/// Validates a module.
///
/// # Errors
///
/// Returns the first violation found, with its location.
#[allow(clippy::too_many_lines)]
pub fn validate(module: &Module) -> Result<(), Error> {
    let ctx = Context::new(module);

    for (i, ty) in module.types.iter().enumerate() {
        ty.params()
            .iter()
            .chain(ty.ret())
            .try_for_each(|t| check_val_ty(*t))
            .and_then(|()| {
                if ty.ret().len() > 1 {
                    Err(ValidationErrorKind::MultipleResults)
                } else {
                    Ok(())
                }
            })
            .map_err(|e| Error::new(e, Location::Type(TypeIndex::new(i as u32))))?;
    }

    for (i, import) in module.imports.iter().enumerate() {
        match &import.desc {
            ImportDesc::Func(idx) => ctx.func_ty(*idx).map(|_| ()),
            ImportDesc::Table(ty) => check_limits(&ty.lim),
            ImportDesc::Mem(ty) => check_mem_ty(ty),
            ImportDesc::Global(ty) => check_val_ty(ty.t),
        }
        .map_err(|e| Error::new(e, Location::Import(i)))?;
    }

    if ctx.tables.len() > 1 {
        return Err(Error::new(
            ValidationErrorKind::MultipleTables,
            Location::Table(TableIndex::new(1)),
        ));
    }
    if ctx.mems.len() > 1 {
        return Err(Error::new(
            ValidationErrorKind::MultipleMemories,
            Location::Mem(MemIndex::new(1)),
        ));
    }

    let imported_tables = module.imported_tables().count();
    for (i, table) in module.tables.iter().enumerate() {
        check_limits(&table.ty.lim).map_err(|e| {
            Error::new(e, Location::Table(TableIndex::new((imported_tables + i) as u32)))
        })?;
    }

    let imported_mems = module.imported_mems().count();
    for (i, mem) in module.mems.iter().enumerate() {
        check_mem_ty(&mem.ty)
            .map_err(|e| Error::new(e, Location::Mem(MemIndex::new((imported_mems + i) as u32))))?;
    }

    for (i, global) in module.globals.iter().enumerate() {
        let loc = Location::Global(GlobalIndex::new((ctx.imported_globals + i) as u32));
        check_val_ty(global.ty.t)
            .and_then(|()| ctx.const_expr(&global.init, global.ty.t))
            .map_err(|e| Error::new(e, loc))?;
    }

    let imported_funcs = module.imported_funcs().count();
    for (i, func) in module.funcs.iter().enumerate() {
        let idx = FuncIndex::new((imported_funcs + i) as u32);
        let ty = ctx
            .func_ty(func.ty)
            .map_err(|e| Error::new(e, Location::Func(idx)))?;
        func.locals
            .iter()
            .try_for_each(|t| check_val_ty(*t))
            .map_err(|e| Error::new(e, Location::Func(idx)))?;

        FuncValidator::new(&ctx, ty, &func.locals)
            .validate(&func.body.instrs)
            .map_err(|(e, instr)| Error::new(e, Location::Code { func: idx, instr }))?;
    }

    let mut names = HashSet::with_capacity(module.exports.len());
    for (i, export) in module.exports.iter().enumerate() {
        let loc = Location::Export(i);
        if !names.insert(export.name.as_str()) {
            return Err(Error::new(
                ValidationErrorKind::DuplicateExport(export.name.clone()),
                loc,
            ));
        }
        match export.desc {
            ExportDesc::Func(idx) => ctx.func(idx).map(|_| ()),
            ExportDesc::Table(idx) => ctx.table(idx).map(|_| ()),
            ExportDesc::Mem(idx) => ctx.mem(idx).map(|_| ()),
            ExportDesc::Global(idx) => ctx.global(idx).map(|_| ()),
        }
        .map_err(|e| Error::new(e, loc))?;
    }

    if let Some(start) = module.start {
        let ty = ctx
            .func(start)
            .map_err(|e| Error::new(e, Location::Start))?;
        if !ty.is_empty() {
            return Err(Error::new(
                ValidationErrorKind::InvalidStartFunction,
                Location::Start,
            ));
        }
    }

    for (i, elem) in module.elems.iter().enumerate() {
        let check = || -> Result<(), ValidationErrorKind> {
            let table = ctx.table(elem.table)?;
            if table.elem_ty != RefTy::FuncRef || elem.ty != RefTy::FuncRef {
                return Err(ValidationErrorKind::NotFuncRef);
            }
            ctx.const_expr(&elem.offset, ValTy::I32)?;
            elem.init.iter().try_for_each(|f| ctx.func(*f).map(|_| ()))
        };
        check().map_err(|e| Error::new(e, Location::Elem(i)))?;
    }

    for (i, data) in module.datas.iter().enumerate() {
        ctx.mem(data.mem)
            .and_then(|_| ctx.const_expr(&data.offset, ValTy::I32))
            .map_err(|e| Error::new(e, Location::Data(i)))?;
    }

    debug!(
        funcs = ctx.funcs.len(),
        globals = ctx.globals.len(),
        "validated module"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::binary;

    fn module(wat: &str) -> Module {
        binary::from_slice(&wat::parse_str(wat).unwrap()).unwrap()
    }

    fn kind(wat: &str) -> ValidationErrorKind {
        validate(&module(wat)).unwrap_err().kind().clone()
    }

    #[test]
    fn well_typed_module() {
        let m = module(
            r#"(module
                (type $unary (func (param i32) (result i32)))
                (import "env" "g" (global $g i32))
                (table 2 funcref)
                (memory 1)
                (global $counter (mut i32) (global.get $g))
                (func $id (type $unary) local.get 0)
                (func (export "run") (param i32) (result i32) (local i64)
                    (block $out (result i32)
                        (loop $top
                            local.get 0
                            br_if $top
                            i32.const 1
                            local.get 0
                            br_table $out $out)
                        i32.const 0)
                    i32.const 1
                    local.get 0
                    select
                    i32.const 0
                    call_indirect (type $unary)
                    i32.load offset=4 align=4
                    f32.convert_i32_u
                    i32.trunc_sat_f32_s
                    global.get $counter
                    i32.add
                    global.set $counter
                    global.get $counter
                    memory.size
                    memory.grow
                    i32.add)
                (elem (i32.const 0) $id)
                (data (i32.const 16) "ok")
                (start 2)
                (func))"#,
        );
        validate(&m).unwrap();
        let validated = ValidatedModule::new(m.clone()).unwrap();
        assert_eq!(*validated, m);
    }

    #[test]
    fn unreachable_code_is_polymorphic() {
        let m = module(
            r#"(module
                (func (result i32) unreachable)
                (func (result i64) (block (br 0)) unreachable i32.add drop i64.const 1)
                (func (param i32) (result f32)
                    (block (result f32) f32.const 1 local.get 0 br_if 0)))"#,
        );
        validate(&m).unwrap();
    }

    #[test]
    fn type_mismatch() {
        let err = validate(&module("(module (func (result i32) i64.const 1))")).unwrap_err();
        assert_eq!(err.kind(), &ValidationErrorKind::TypeMismatch);
        assert_eq!(
            err.location(),
            Location::Code {
                func: FuncIndex::new(0),
                instr: 1
            }
        );

        assert_eq!(
            kind("(module (func i32.const 1 f32.const 2 i32.add drop))"),
            ValidationErrorKind::TypeMismatch
        );
        assert_eq!(
            kind("(module (func (result i32) i32.const 1 i64.const 2 i32.const 0 select))"),
            ValidationErrorKind::TypeMismatch
        );
    }

    #[test]
    fn stack_shape() {
        assert_eq!(
            kind("(module (func i32.add drop))"),
            ValidationErrorKind::Underflow
        );
        assert_eq!(
            kind("(module (func i32.const 1))"),
            ValidationErrorKind::UnbalancedStack
        );
    }

    #[test]
    fn if_without_else_must_not_change_types() {
        assert_eq!(
            kind("(module (func (result i32) i32.const 1 if (result i32) i32.const 2 end))"),
            ValidationErrorKind::TypeMismatch
        );
    }

    /// Validates `(func)` with the given body followed by `end`.
    fn body_kind(instrs: Vec<Instr>) -> ValidationErrorKind {
        let mut m = module("(module (func))");
        m.funcs[0].body.instrs = instrs;
        m.funcs[0].body.instrs.push(Control::End.into());
        validate(&m).unwrap_err().kind().clone()
    }

    #[test]
    fn unknown_indices() {
        use crate::module::instr::{Const, MemArg};

        assert_eq!(
            body_kind(vec![Control::Br(LabelIndex::new(1)).into()]),
            ValidationErrorKind::UnknownLabel(LabelIndex::new(1))
        );
        assert_eq!(
            body_kind(vec![
                Instr::Var(Variable::LocalGet(LocalIndex::new(0))),
                Instr::Parametric(Parametric::Drop),
            ]),
            ValidationErrorKind::UnknownLocal(LocalIndex::new(0))
        );
        assert_eq!(
            body_kind(vec![Control::Call(FuncIndex::new(3)).into()]),
            ValidationErrorKind::UnknownFunc(FuncIndex::new(3))
        );
        assert_eq!(
            body_kind(vec![
                Num::Constant(Const::I32(0)).into(),
                Instr::Mem(Mem::Load(NumTy::I32, MemArg { align: 2, offset: 0 }, None)),
                Instr::Parametric(Parametric::Drop),
            ]),
            ValidationErrorKind::UnknownMem(MemIndex::new(0))
        );
    }

    #[test]
    fn alignment() {
        assert_eq!(
            kind("(module (memory 1) (func i32.const 0 i32.load align=8 drop))"),
            ValidationErrorKind::InvalidAlignment
        );
        assert_eq!(
            kind("(module (memory 1) (func i32.const 0 i32.load16_u align=4 drop))"),
            ValidationErrorKind::InvalidAlignment
        );
        validate(&module(
            "(module (memory 1) (func i32.const 0 i64.load align=8 drop))",
        ))
        .unwrap();
    }

    #[test]
    fn globals() {
        assert_eq!(
            kind("(module (global i32 (i32.const 0)) (func i32.const 1 global.set 0))"),
            ValidationErrorKind::ImmutableGlobal
        );
        assert_eq!(
            kind("(module (global i32 (i32.const 1)) (global i32 (global.get 0)))"),
            ValidationErrorKind::ConstExprRequired
        );
        assert_eq!(
            kind(r#"(module (import "m" "g" (global (mut i32))) (global i32 (global.get 0)))"#),
            ValidationErrorKind::ConstExprRequired
        );
        assert_eq!(
            kind("(module (global i64 (i32.const 1)))"),
            ValidationErrorKind::TypeMismatch
        );
    }

    #[test]
    fn start_function_arity() {
        let err = validate(&module("(module (func $s (param i32)) (start $s))")).unwrap_err();
        assert_eq!(err.kind(), &ValidationErrorKind::InvalidStartFunction);
        assert_eq!(err.location(), Location::Start);
    }

    #[test]
    fn duplicate_export() {
        // Two functions exported as "f".
        let bytes: &[u8] = &[
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // preamble
            0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type [] -> []
            0x03, 0x03, 0x02, 0x00, 0x00, // two functions
            0x07, 0x09, 0x02, 0x01, b'f', 0x00, 0x00, 0x01, b'f', 0x00, 0x01, // exports
            0x0a, 0x07, 0x02, 0x02, 0x00, 0x0b, 0x02, 0x00, 0x0b, // bodies
        ];
        let m = binary::from_slice(bytes).unwrap();
        let err = validate(&m).unwrap_err();
        assert_eq!(
            err.kind(),
            &ValidationErrorKind::DuplicateExport("f".to_string())
        );
        assert_eq!(err.location(), Location::Export(1));
    }

    #[test]
    fn module_limits() {
        assert_eq!(
            kind("(module (memory 2 1))"),
            ValidationErrorKind::InvalidLimits
        );
        assert_eq!(
            kind("(module (memory 65537))"),
            ValidationErrorKind::MemoryTooLarge
        );
        assert_eq!(
            kind(r#"(module (import "m" "t" (table 1 funcref)) (table 1 funcref))"#),
            ValidationErrorKind::MultipleTables
        );
        assert_eq!(
            kind("(module (table 1 externref) (func i32.const 0 call_indirect))"),
            ValidationErrorKind::NotFuncRef
        );
        assert_eq!(
            kind("(module (type (func (result i32 i32))))"),
            ValidationErrorKind::MultipleResults
        );
    }

    #[test]
    fn structure() {
        validate(&module("(module (func (block nop)))")).unwrap();

        // Hand-built bodies exercise cases the text format cannot express.
        assert_eq!(
            body_kind(vec![Control::Else.into()]),
            ValidationErrorKind::ElseWithoutIf
        );
        assert_eq!(
            body_kind(vec![Control::End.into(), Control::Nop.into()]),
            ValidationErrorKind::UnbalancedEnd
        );
        assert_eq!(
            body_kind(vec![Control::Block(BlockTy::Empty).into()]),
            ValidationErrorKind::UnbalancedEnd
        );
    }
}
