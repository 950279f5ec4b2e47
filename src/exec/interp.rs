//! Stack machine executing module defined functions.
//!
//! Execution keeps three stacks: operand values, labels for structured
//! control and call frames. Branch targets come from a per-function table
//! built when the function is allocated.

use std::rc::Rc;

use tracing::trace;

use crate::{
    config::DebugLevel,
    module::{
        instr::{BlockTy, Control, Instr, Mem, MemArg, Parametric, SignExtension, StorageSize, Variable},
        ty::{is_compatible, NumTy},
        FuncIndex, LabelIndex,
    },
};

use super::{
    num,
    val::{Num, Ref, Val},
    FuncAddr, FuncCode, FuncInst, HostcodeError, MemInst, ModuleAddr, ModuleInst, Store, Trap,
    TrapKind,
};

const UNDERFLOW: TrapKind = TrapKind::Internal("operand stack underflow");
const OPERAND: TrapKind = TrapKind::Internal("operand type does not match instruction");
const NO_FRAME: TrapKind = TrapKind::Internal("no active frame");
const NO_TARGET: TrapKind = TrapKind::Internal("missing control target");

/// Matching `else` and `end` positions of a structured instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Jump {
    pub(crate) else_pos: Option<usize>,
    pub(crate) end: usize,
}

/// Scans a body once and records, for every `block`, `loop`, `if` and
/// `else`, where its construct ends.
pub(crate) fn jump_table(body: &[Instr]) -> Vec<Option<Jump>> {
    let mut jumps = vec![None; body.len()];
    let mut open: Vec<(usize, Option<usize>)> = Vec::new();

    for (pos, instr) in body.iter().enumerate() {
        match instr {
            Instr::Control(Control::Block(_) | Control::Loop(_) | Control::If(_)) => {
                open.push((pos, None));
            }
            Instr::Control(Control::Else) => {
                if let Some(top) = open.last_mut() {
                    top.1 = Some(pos);
                }
            }
            Instr::Control(Control::End) => {
                if let Some((start, else_pos)) = open.pop() {
                    jumps[start] = Some(Jump { else_pos, end: pos });
                    if let Some(e) = else_pos {
                        jumps[e] = Some(Jump {
                            else_pos: None,
                            end: pos,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    jumps
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelKind {
    Block,
    Loop,
    Func,
}

#[derive(Debug, Clone, Copy)]
struct Label {
    kind: LabelKind,
    /// Values carried by a branch to the label
    arity: usize,
    /// Position execution resumes at after a branch
    cont: usize,
    /// Operand stack height below the block's parameters
    height: usize,
}

#[derive(Debug)]
struct Frame {
    module: ModuleAddr,
    code: Rc<FuncCode>,
    locals: Vec<Val>,
    arity: usize,
    ip: usize,
    label_base: usize,
    value_base: usize,
}

struct Machine<'s> {
    store: &'s mut Store,
    stack: Vec<Val>,
    labels: Vec<Label>,
    frames: Vec<Frame>,
    fuel: Option<u64>,
}

/// Calls the function at `addr` with type checked arguments and runs it to
/// completion.
pub(crate) fn invoke(store: &mut Store, addr: FuncAddr, args: &[Val]) -> Result<Vec<Val>, Trap> {
    let fuel = store.config.fuel;
    let mut machine = Machine {
        store,
        stack: args.to_vec(),
        labels: Vec::new(),
        frames: Vec::new(),
        fuel,
    };
    machine
        .call(addr)
        .map_err(|kind| Trap::new(kind, None, 0))?;
    machine.run()?;
    Ok(machine.stack)
}

impl Machine<'_> {
    fn run(&mut self) -> Result<(), Trap> {
        while let Some(frame) = self.frames.last_mut() {
            let code = Rc::clone(&frame.code);
            let pos = frame.ip;
            frame.ip += 1;

            let located = |kind| Trap::new(kind, Some(code.idx), pos);
            let instr = code
                .body
                .get(pos)
                .ok_or_else(|| located(TrapKind::Internal("instruction pointer past end")))?;

            if let Some(fuel) = self.fuel.as_mut() {
                if *fuel == 0 {
                    return Err(located(TrapKind::OutOfFuel));
                }
                *fuel -= 1;
            }
            self.trace(code.idx, pos, instr);

            self.step(&code, pos, instr).map_err(located)?;
        }
        Ok(())
    }

    fn trace(&mut self, func: FuncIndex, pos: usize, instr: &Instr) {
        let level = self.store.config.debug;
        match level {
            DebugLevel::Silent => return,
            DebugLevel::Log => trace!(%func, pos, ?instr, "step"),
            DebugLevel::Context | DebugLevel::Interrupt => trace!(
                %func,
                pos,
                ?instr,
                stack = ?self.stack,
                labels = self.labels.len(),
                frames = self.frames.len(),
                "step"
            ),
        }
        if level == DebugLevel::Interrupt {
            if let Some(interrupt) = self.store.interrupt.as_mut() {
                interrupt.on_step(func, pos, instr);
            }
        }
    }

    fn step(&mut self, code: &FuncCode, pos: usize, instr: &Instr) -> Result<(), TrapKind> {
        match instr {
            Instr::Control(c) => self.control(code, pos, c),
            Instr::Parametric(Parametric::Drop) => self.pop().map(|_| ()),
            Instr::Parametric(Parametric::Select) => {
                let c = self.pop_i32()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(if c != 0 { a } else { b });
                Ok(())
            }
            Instr::Var(v) => self.variable(*v),
            Instr::Mem(m) => self.memory(*m),
            Instr::Num(n) => num::exec(*n, &mut self.stack),
        }
    }

    fn control(&mut self, code: &FuncCode, pos: usize, instr: &Control) -> Result<(), TrapKind> {
        let jump = || code.jumps.get(pos).copied().flatten().ok_or(NO_TARGET);

        match instr {
            Control::Unreachable => return Err(TrapKind::Unreachable),
            Control::Nop => {}
            Control::Block(bt) => {
                let (params, results) = self.block_arity(*bt)?;
                let end = jump()?.end;
                self.push_label(LabelKind::Block, results, end + 1, params)?;
            }
            Control::Loop(bt) => {
                let (params, _) = self.block_arity(*bt)?;
                self.push_label(LabelKind::Loop, params, pos, params)?;
            }
            Control::If(bt) => {
                let (params, results) = self.block_arity(*bt)?;
                let Jump { else_pos, end } = jump()?;
                if self.pop_i32()? != 0 {
                    self.push_label(LabelKind::Block, results, end + 1, params)?;
                } else if let Some(else_pos) = else_pos {
                    self.push_label(LabelKind::Block, results, end + 1, params)?;
                    self.frame()?.ip = else_pos + 1;
                } else {
                    self.frame()?.ip = end + 1;
                }
            }
            Control::Else => {
                // End of the taken branch.
                let end = jump()?.end;
                self.labels.pop().ok_or(NO_TARGET)?;
                self.frame()?.ip = end + 1;
            }
            Control::End => {
                let label = self.labels.pop().ok_or(NO_TARGET)?;
                if label.kind == LabelKind::Func {
                    return self.ret();
                }
            }
            Control::Br(l) => return self.branch(*l),
            Control::BrIf(l) => {
                if self.pop_i32()? != 0 {
                    return self.branch(*l);
                }
            }
            Control::BrTable { table, idx } => {
                let i = self.pop_i32()? as u32 as usize;
                return self.branch(table.get(i).copied().unwrap_or(*idx));
            }
            Control::Return => return self.ret(),
            Control::Call(f) => {
                let addr = *self
                    .module()?
                    .func_addrs
                    .get(usize::from(*f))
                    .ok_or(TrapKind::Internal("unknown function"))?;
                return self.call(addr);
            }
            Control::CallIndirect { y, x } => {
                let module = self.module()?;
                let expected = module
                    .types
                    .get(usize::from(*y))
                    .cloned()
                    .ok_or(TrapKind::Internal("unknown type"))?;
                let table = *module
                    .table_addrs
                    .get(usize::from(*x))
                    .ok_or(TrapKind::Internal("unknown table"))?;

                let i = self.pop_i32()? as u32 as usize;
                let entry = self
                    .store
                    .tables
                    .get(usize::from(table))
                    .ok_or(TrapKind::Internal("unknown table"))?
                    .elem
                    .get(i)
                    .copied()
                    .ok_or(TrapKind::UndefinedElement)?;
                let addr = match entry {
                    Ref::Func(addr) => addr,
                    Ref::Null(_) => return Err(TrapKind::UninitializedElement),
                    Ref::Extern(_) => return Err(TrapKind::IndirectCallTypeMismatch),
                };
                if self.store.func_ty(addr) != Some(&expected) {
                    return Err(TrapKind::IndirectCallTypeMismatch);
                }
                return self.call(addr);
            }
        }
        Ok(())
    }

    fn variable(&mut self, instr: Variable) -> Result<(), TrapKind> {
        const LOCAL: TrapKind = TrapKind::Internal("unknown local");
        const GLOBAL: TrapKind = TrapKind::Internal("unknown global");

        match instr {
            Variable::LocalGet(idx) => {
                let v = *self.frame()?.locals.get(usize::from(idx)).ok_or(LOCAL)?;
                self.stack.push(v);
            }
            Variable::LocalSet(idx) => {
                let v = self.pop()?;
                *self.frame()?.locals.get_mut(usize::from(idx)).ok_or(LOCAL)? = v;
            }
            Variable::LocalTee(idx) => {
                let v = *self.stack.last().ok_or(UNDERFLOW)?;
                *self.frame()?.locals.get_mut(usize::from(idx)).ok_or(LOCAL)? = v;
            }
            Variable::GlobalGet(idx) => {
                let addr = *self.module()?.global_addrs.get(usize::from(idx)).ok_or(GLOBAL)?;
                let v = self.store.global_read(addr).ok_or(GLOBAL)?;
                self.stack.push(v);
            }
            Variable::GlobalSet(idx) => {
                let addr = *self.module()?.global_addrs.get(usize::from(idx)).ok_or(GLOBAL)?;
                let v = self.pop()?;
                self.store
                    .globals
                    .get_mut(usize::from(addr))
                    .ok_or(GLOBAL)?
                    .value = v;
            }
        }
        Ok(())
    }

    fn memory(&mut self, instr: Mem) -> Result<(), TrapKind> {
        match instr {
            Mem::Load(ty, arg, ext) => {
                let width = instr.access_width().ok_or(OPERAND)? as usize;
                let base = self.pop_i32()?;
                let raw = load(self.mem()?, base, arg, width)?;
                let v = match (ty, ext) {
                    (NumTy::I32, None) => Val::from(raw as u32 as i32),
                    (NumTy::I64, None) => Val::from(raw as i64),
                    (NumTy::F32, None) => Val::from(f32::from_bits(raw as u32)),
                    (NumTy::F64, None) => Val::from(f64::from_bits(raw)),
                    (NumTy::I32, Some((size, sx))) => Val::from(extend(raw, size, sx) as i32),
                    (NumTy::I64, Some((size, sx))) => Val::from(extend(raw, size, sx)),
                    (NumTy::F32 | NumTy::F64, Some(_)) => return Err(OPERAND),
                };
                self.stack.push(v);
            }
            Mem::Store(ty, arg, _) => {
                let width = instr.access_width().ok_or(OPERAND)? as usize;
                let raw = match self.pop()? {
                    Val::Num(n) if NumTy::from(n) == ty => n.to_bits(),
                    _ => return Err(OPERAND),
                };
                let base = self.pop_i32()?;
                store(self.mem()?, base, arg, width, raw)?;
            }
            Mem::MemorySize => {
                let pages = self.mem()?.pages();
                self.stack.push(Val::from(pages as i32));
            }
            Mem::MemoryGrow => {
                let delta = self.pop_i32()? as u32;
                let cap = self.store.config.max_memory_pages;
                let old = self.mem()?.grow(delta, cap).map_or(-1, |old| old as i32);
                self.stack.push(Val::from(old));
            }
        }
        Ok(())
    }

    fn call(&mut self, addr: FuncAddr) -> Result<(), TrapKind> {
        let max_depth = self.store.config.max_call_depth;
        let func = self
            .store
            .funcs
            .get_mut(usize::from(addr))
            .ok_or(TrapKind::Internal("unknown function address"))?;

        match func {
            FuncInst::Host { ty, hostcode } => {
                let at = self
                    .stack
                    .len()
                    .checked_sub(ty.params().len())
                    .ok_or(UNDERFLOW)?;
                let args = self.stack.split_off(at);
                let results = hostcode(args.as_slice()).map_err(TrapKind::Host)?;
                if !is_compatible(ty.ret(), &results) {
                    return Err(TrapKind::Host(HostcodeError::new(format!(
                        "results do not match {ty}"
                    ))));
                }
                self.stack.extend(results);
                Ok(())
            }
            FuncInst::Module { ty, module, code } => {
                if self.frames.len() >= max_depth {
                    return Err(TrapKind::CallStackExhausted);
                }
                let arity = ty.ret().len();
                let at = self
                    .stack
                    .len()
                    .checked_sub(ty.params().len())
                    .ok_or(UNDERFLOW)?;
                let module = *module;
                let code = Rc::clone(code);

                let mut locals = self.stack.split_off(at);
                locals.extend(code.locals.iter().map(|t| t.default_value()));

                let height = self.stack.len();
                let end = code.body.len();
                self.frames.push(Frame {
                    module,
                    code,
                    locals,
                    arity,
                    ip: 0,
                    label_base: self.labels.len(),
                    value_base: height,
                });
                self.labels.push(Label {
                    kind: LabelKind::Func,
                    arity,
                    cont: end,
                    height,
                });
                Ok(())
            }
        }
    }

    fn branch(&mut self, l: LabelIndex) -> Result<(), TrapKind> {
        let target = self
            .labels
            .len()
            .checked_sub(usize::from(l) + 1)
            .ok_or(NO_TARGET)?;
        let label = self.labels[target];
        if label.kind == LabelKind::Func {
            return self.ret();
        }
        self.unwind(label.height, label.arity)?;
        self.labels.truncate(target);
        self.frame()?.ip = label.cont;
        Ok(())
    }

    fn ret(&mut self) -> Result<(), TrapKind> {
        let frame = self.frames.pop().ok_or(NO_FRAME)?;
        self.unwind(frame.value_base, frame.arity)?;
        self.labels.truncate(frame.label_base);
        Ok(())
    }

    /// Keeps the top `arity` values and drops everything above `height`
    /// beneath them.
    fn unwind(&mut self, height: usize, arity: usize) -> Result<(), TrapKind> {
        let from = self.stack.len().checked_sub(arity).ok_or(UNDERFLOW)?;
        if from < height {
            return Err(UNDERFLOW);
        }
        self.stack.drain(height..from);
        Ok(())
    }

    fn push_label(
        &mut self,
        kind: LabelKind,
        arity: usize,
        cont: usize,
        params: usize,
    ) -> Result<(), TrapKind> {
        let height = self.stack.len().checked_sub(params).ok_or(UNDERFLOW)?;
        self.labels.push(Label {
            kind,
            arity,
            cont,
            height,
        });
        Ok(())
    }

    /// Parameter and result counts of a block type.
    fn block_arity(&self, bt: BlockTy) -> Result<(usize, usize), TrapKind> {
        match bt {
            BlockTy::Empty => Ok((0, 0)),
            BlockTy::Val(_) => Ok((0, 1)),
            BlockTy::Index(idx) => self
                .module()?
                .types
                .get(usize::from(idx))
                .map(|ty| (ty.params().len(), ty.ret().len()))
                .ok_or(TrapKind::Internal("unknown block type")),
        }
    }

    fn frame(&mut self) -> Result<&mut Frame, TrapKind> {
        self.frames.last_mut().ok_or(NO_FRAME)
    }

    fn module(&self) -> Result<&ModuleInst, TrapKind> {
        let frame = self.frames.last().ok_or(NO_FRAME)?;
        self.store
            .modules
            .get(usize::from(frame.module))
            .ok_or(TrapKind::Internal("unknown module"))
    }

    fn mem(&mut self) -> Result<&mut MemInst, TrapKind> {
        let addr = *self
            .module()?
            .mem_addrs
            .first()
            .ok_or(TrapKind::Internal("no memory"))?;
        self.store
            .mems
            .get_mut(usize::from(addr))
            .ok_or(TrapKind::Internal("unknown memory"))
    }

    fn pop(&mut self) -> Result<Val, TrapKind> {
        self.stack.pop().ok_or(UNDERFLOW)
    }

    fn pop_i32(&mut self) -> Result<i32, TrapKind> {
        match self.pop()? {
            Val::Num(Num::I32(n)) => Ok(n),
            _ => Err(OPERAND),
        }
    }
}

/// Range of `width` bytes at the effective address `base + offset`.
fn effective_range(
    mem: &MemInst,
    base: i32,
    arg: MemArg,
    width: usize,
) -> Result<core::ops::Range<usize>, TrapKind> {
    let ea = u64::from(base as u32) + u64::from(arg.offset);
    let start = usize::try_from(ea).map_err(|_| TrapKind::OutOfBoundsMemory)?;
    let end = start
        .checked_add(width)
        .filter(|end| *end <= mem.data.len())
        .ok_or(TrapKind::OutOfBoundsMemory)?;
    Ok(start..end)
}

fn load(mem: &MemInst, base: i32, arg: MemArg, width: usize) -> Result<u64, TrapKind> {
    let range = effective_range(mem, base, arg, width)?;
    let mut buf = [0; 8];
    buf[..width].copy_from_slice(&mem.data[range]);
    Ok(u64::from_le_bytes(buf))
}

fn store(mem: &mut MemInst, base: i32, arg: MemArg, width: usize, raw: u64) -> Result<(), TrapKind> {
    let range = effective_range(mem, base, arg, width)?;
    mem.data[range].copy_from_slice(&raw.to_le_bytes()[..width]);
    Ok(())
}

/// Extends the low `size` bytes of `raw` to 64 bits.
fn extend(raw: u64, size: StorageSize, sx: SignExtension) -> i64 {
    let shift = 64 - size.byte_width() * 8;
    match sx {
        SignExtension::Signed => ((raw << shift) as i64) >> shift,
        SignExtension::Unsigned => raw as i64,
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use proptest::prelude::*;

    use super::*;
    use crate::{
        config::Config,
        exec::{InvokeError, ModuleAddr},
        fmt::binary,
        validation::ValidatedModule,
    };

    fn instantiate(store: &mut Store, wat: &str) -> ModuleAddr {
        let module = binary::from_slice(&wat::parse_str(wat).unwrap()).unwrap();
        store
            .instantiate(ValidatedModule::new(module).unwrap(), &[])
            .unwrap()
    }

    fn trap(result: Result<Vec<Val>, InvokeError>) -> TrapKind {
        match result {
            Err(InvokeError::Trap(trap)) => trap.kind().clone(),
            other => panic!("expected a trap, got {other:?}"),
        }
    }

    #[test]
    fn jump_targets() {
        let module = binary::from_slice(
            &wat::parse_str(
                r#"(module (func
                    block
                      i32.const 1
                      if
                        nop
                      else
                        loop
                        end
                      end
                    end))"#,
            )
            .unwrap(),
        )
        .unwrap();
        let jumps = jump_table(&module.funcs[0].body.instrs);
        // block, i32.const, if, nop, else, loop, end, end, end, end
        assert_eq!(jumps[0], Some(Jump { else_pos: None, end: 8 }));
        assert_eq!(jumps[2], Some(Jump { else_pos: Some(4), end: 7 }));
        assert_eq!(jumps[4], Some(Jump { else_pos: None, end: 7 }));
        assert_eq!(jumps[5], Some(Jump { else_pos: None, end: 6 }));
        assert_eq!(jumps[1], None);
    }

    #[test]
    fn control_flow() {
        let mut store = Store::new();
        let m = instantiate(
            &mut store,
            r#"(module
                (func (export "sum") (param $n i32) (result i32) (local $acc i32)
                    block $done
                      loop $top
                        local.get $n
                        i32.eqz
                        br_if $done
                        local.get $acc
                        local.get $n
                        i32.add
                        local.set $acc
                        local.get $n
                        i32.const 1
                        i32.sub
                        local.set $n
                        br $top
                      end
                    end
                    local.get $acc)
                (func (export "pick") (param i32) (result i32)
                    block $c
                      block $b
                        block $a
                          local.get 0
                          br_table $a $b $c
                        end
                        i32.const 10
                        return
                      end
                      i32.const 20
                      return
                    end
                    i32.const 30)
                (func (export "sign") (param i32) (result i32)
                    local.get 0
                    i32.const 0
                    i32.lt_s
                    if (result i32)
                      i32.const -1
                    else
                      local.get 0
                      i32.eqz
                      if (result i32) i32.const 0 else i32.const 1 end
                    end)
                (func (export "early") (result i32)
                    i32.const 1
                    block (result i32)
                      i32.const 2
                      i32.const 3
                      br 0
                    end
                    i32.add)
                (func (export "select") (param i32) (result i64)
                    i64.const 7
                    i64.const 9
                    local.get 0
                    select))"#,
        );

        let call = |store: &mut Store, name: &str, arg: i32| {
            store.invoke_export(m, name, &[Val::from(arg)]).unwrap()
        };
        assert_eq!(call(&mut store, "sum", 100), vec![Val::from(5050i32)]);
        assert_eq!(call(&mut store, "pick", 0), vec![Val::from(10i32)]);
        assert_eq!(call(&mut store, "pick", 1), vec![Val::from(20i32)]);
        assert_eq!(call(&mut store, "pick", 2), vec![Val::from(30i32)]);
        assert_eq!(call(&mut store, "pick", 99), vec![Val::from(30i32)]);
        assert_eq!(call(&mut store, "sign", -5), vec![Val::from(-1i32)]);
        assert_eq!(call(&mut store, "sign", 0), vec![Val::from(0i32)]);
        assert_eq!(call(&mut store, "sign", 8), vec![Val::from(1i32)]);
        assert_eq!(
            store.invoke_export(m, "early", &[]).unwrap(),
            vec![Val::from(4i32)]
        );
        assert_eq!(call(&mut store, "select", 1), vec![Val::from(7i64)]);
        assert_eq!(call(&mut store, "select", 0), vec![Val::from(9i64)]);
    }

    #[test]
    fn recursion_and_call_depth() {
        let wat = r#"(module
            (func $fac (export "fac") (param i64) (result i64)
                local.get 0
                i64.eqz
                if (result i64)
                  i64.const 1
                else
                  local.get 0
                  local.get 0
                  i64.const 1
                  i64.sub
                  call $fac
                  i64.mul
                end)
            (func $loop (export "forever") call $loop))"#;

        let mut store = Store::new();
        let m = instantiate(&mut store, wat);
        assert_eq!(
            store.invoke_export(m, "fac", &[Val::from(20i64)]).unwrap(),
            vec![Val::from(2_432_902_008_176_640_000i64)]
        );
        assert_eq!(
            trap(store.invoke_export(m, "forever", &[])),
            TrapKind::CallStackExhausted
        );

        let mut store = Store::with_config(Config::default().max_call_depth(5));
        let m = instantiate(&mut store, wat);
        assert!(store.invoke_export(m, "fac", &[Val::from(4i64)]).is_ok());
        assert_eq!(
            trap(store.invoke_export(m, "fac", &[Val::from(5i64)])),
            TrapKind::CallStackExhausted
        );
    }

    #[test]
    fn fuel_bounds_execution() {
        let mut store = Store::with_config(Config::default().fuel(Some(1_000)));
        let m = instantiate(
            &mut store,
            r#"(module
                (func (export "spin") (loop br 0))
                (func (export "two") (result i32) i32.const 2))"#,
        );
        let Err(InvokeError::Trap(t)) = store.invoke_export(m, "spin", &[]) else {
            panic!("loop must run out of fuel")
        };
        assert_eq!(t.kind(), &TrapKind::OutOfFuel);
        assert_eq!(t.func(), Some(FuncIndex::new(0)));

        // Fuel is per invocation.
        assert_eq!(
            store.invoke_export(m, "two", &[]).unwrap(),
            vec![Val::from(2i32)]
        );
    }

    #[test]
    fn traps_report_location() {
        let mut store = Store::new();
        let m = instantiate(
            &mut store,
            r#"(module
                (func (export "div") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.div_s)
                (func (export "trunc") (param f32) (result i32)
                    local.get 0
                    i32.trunc_f32_s))"#,
        );

        let Err(InvokeError::Trap(t)) =
            store.invoke_export(m, "div", &[Val::from(1i32), Val::from(0i32)])
        else {
            panic!("division by zero must trap")
        };
        assert_eq!(t.kind(), &TrapKind::IntegerDivideByZero);
        assert_eq!(t.func(), Some(FuncIndex::new(0)));
        assert_eq!(t.instr(), 2);
        assert_eq!(
            t.to_string(),
            "integer divide by zero in function 0 at instruction 2"
        );

        assert_eq!(
            trap(store.invoke_export(m, "div", &[Val::from(i32::MIN), Val::from(-1i32)])),
            TrapKind::IntegerOverflow
        );
        assert_eq!(
            trap(store.invoke_export(m, "trunc", &[Val::from(f32::NAN)])),
            TrapKind::InvalidConversionToInteger
        );
        assert_eq!(
            trap(store.invoke_export(m, "trunc", &[Val::from(3e9f32)])),
            TrapKind::IntegerOverflow
        );
        // The instance stays usable after a trap.
        assert_eq!(
            store
                .invoke_export(m, "div", &[Val::from(7i32), Val::from(2i32)])
                .unwrap(),
            vec![Val::from(3i32)]
        );
    }

    #[test]
    fn indirect_calls() {
        let mut store = Store::new();
        let m = instantiate(
            &mut store,
            r#"(module
                (type $unary (func (param i32) (result i32)))
                (type $nullary (func (result i32)))
                (table 3 funcref)
                (elem (i32.const 0) $inc $answer)
                (func $inc (type $unary) local.get 0 i32.const 1 i32.add)
                (func $answer (type $nullary) i32.const 42)
                (func (export "unary") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    call_indirect (type $unary))
                (func (export "nullary") (param i32) (result i32)
                    local.get 0
                    call_indirect (type $nullary)))"#,
        );

        assert_eq!(
            store
                .invoke_export(m, "unary", &[Val::from(5i32), Val::from(0i32)])
                .unwrap(),
            vec![Val::from(6i32)]
        );
        assert_eq!(
            store.invoke_export(m, "nullary", &[Val::from(1i32)]).unwrap(),
            vec![Val::from(42i32)]
        );
        assert_eq!(
            trap(store.invoke_export(m, "nullary", &[Val::from(0i32)])),
            TrapKind::IndirectCallTypeMismatch
        );
        assert_eq!(
            trap(store.invoke_export(m, "nullary", &[Val::from(2i32)])),
            TrapKind::UninitializedElement
        );
        assert_eq!(
            trap(store.invoke_export(m, "nullary", &[Val::from(3i32)])),
            TrapKind::UndefinedElement
        );
    }

    #[test]
    fn memory_access() {
        let mut store = Store::new();
        let m = instantiate(
            &mut store,
            r#"(module
                (memory 1 2)
                (data (i32.const 0) "\ff\fe\fd\fc\01\02\03\04")
                (func (export "load8_s") (param i32) (result i32)
                    local.get 0 i32.load8_s)
                (func (export "load8_u") (param i32) (result i32)
                    local.get 0 i32.load8_u)
                (func (export "load16_s64") (param i32) (result i64)
                    local.get 0 i64.load16_s)
                (func (export "load32_u64") (param i32) (result i64)
                    local.get 0 i64.load32_u)
                (func (export "offset") (param i32) (result i32)
                    local.get 0 i32.load offset=4)
                (func (export "store_f64") (param i32 f64) (result f64)
                    local.get 0
                    local.get 1
                    f64.store
                    local.get 0
                    f64.load)
                (func (export "store8") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.store8
                    local.get 0
                    i32.load)
                (func (export "size") (result i32) memory.size)
                (func (export "grow") (param i32) (result i32)
                    local.get 0 memory.grow))"#,
        );

        let one = |store: &mut Store, name: &str, arg: i32| {
            store.invoke_export(m, name, &[Val::from(arg)])
        };
        assert_eq!(one(&mut store, "load8_s", 0), Ok(vec![Val::from(-1i32)]));
        assert_eq!(one(&mut store, "load8_u", 0), Ok(vec![Val::from(255i32)]));
        assert_eq!(one(&mut store, "load16_s64", 0), Ok(vec![Val::from(-257i64)]));
        assert_eq!(
            one(&mut store, "load32_u64", 0),
            Ok(vec![Val::from(0xfcfd_feffi64)])
        );
        assert_eq!(one(&mut store, "offset", 0), Ok(vec![Val::from(0x0403_0201i32)]));
        assert_eq!(
            trap(one(&mut store, "offset", 65_530)),
            TrapKind::OutOfBoundsMemory
        );
        assert_eq!(trap(one(&mut store, "load8_u", -1)), TrapKind::OutOfBoundsMemory);

        assert_eq!(
            store.invoke_export(m, "store_f64", &[Val::from(16i32), Val::from(-2.5f64)]),
            Ok(vec![Val::from(-2.5f64)])
        );
        assert_eq!(
            store.invoke_export(m, "store8", &[Val::from(4i32), Val::from(0x1234i32)]),
            Ok(vec![Val::from(0x0403_0234i32)])
        );

        assert_eq!(store.invoke_export(m, "size", &[]), Ok(vec![Val::from(1i32)]));
        assert_eq!(one(&mut store, "grow", 1), Ok(vec![Val::from(1i32)]));
        assert_eq!(one(&mut store, "grow", 1), Ok(vec![Val::from(-1i32)]));
        assert_eq!(store.invoke_export(m, "size", &[]), Ok(vec![Val::from(2i32)]));
        assert_eq!(
            one(&mut store, "load8_u", 65_536 * 2 - 1),
            Ok(vec![Val::from(0i32)])
        );
    }

    #[test]
    fn globals() {
        let mut store = Store::new();
        let m = instantiate(
            &mut store,
            r#"(module
                (global $g (export "g") (mut f32) (f32.const 1.5))
                (func (export "bump") (result f32)
                    global.get $g
                    f32.const 2
                    f32.mul
                    global.set $g
                    global.get $g))"#,
        );
        assert_eq!(store.invoke_export(m, "bump", &[]), Ok(vec![Val::from(3.0f32)]));
        assert_eq!(store.invoke_export(m, "bump", &[]), Ok(vec![Val::from(6.0f32)]));
        let Some(crate::exec::val::ExternVal::Global(g)) = store.export(m, "g") else {
            panic!("global not exported")
        };
        assert_eq!(store.global_read(g), Some(Val::from(6.0f32)));
    }

    #[test]
    fn interrupt_sees_every_step() {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&steps);

        let mut store =
            Store::with_config(Config::default().debug(DebugLevel::Interrupt));
        store.set_interrupt(move |func: FuncIndex, pos: usize, _: &Instr| {
            seen.borrow_mut().push((usize::from(func), pos));
        });
        let m = instantiate(
            &mut store,
            r#"(module (func (export "f") (result i32) i32.const 1 i32.const 2 i32.add))"#,
        );
        assert_eq!(store.invoke_export(m, "f", &[]), Ok(vec![Val::from(3i32)]));
        assert_eq!(*steps.borrow(), vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
    }

    proptest! {
        #[test]
        fn results_match_declared_types(a in any::<i64>(), b in any::<i64>()) {
            let mut store = Store::new();
            let m = instantiate(
                &mut store,
                r#"(module
                    (func (export "rem") (param i64 i64) (result i64)
                        local.get 0
                        local.get 1
                        i64.rem_u))"#,
            );
            match store.invoke_export(m, "rem", &[Val::from(a), Val::from(b)]) {
                Ok(results) => {
                    prop_assert_eq!(results.len(), 1);
                    prop_assert_eq!(results[0], Val::from(((a as u64) % (b as u64)) as i64));
                }
                Err(InvokeError::Trap(t)) => {
                    prop_assert_eq!(b, 0);
                    prop_assert_eq!(t.kind(), &TrapKind::IntegerDivideByZero);
                }
                Err(e) => prop_assert!(false, "unexpected error {}", e),
            }
        }
    }
}
