//! Execution related code.
//!
//! The [`Store`] owns every runtime instance. Hosts allocate the externals a
//! module imports, instantiate the module against their addresses and then
//! invoke its exported functions.

use core::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::{
    config::Config,
    module::{
        instr::{self, ConstExpr, Instr, Variable},
        ty::{is_compatible, ExternTy, FuncTy, GlobalTy, Limits, MemTy, Mut, RefTy, TableTy, ValTy},
        ExportDesc, FuncIndex, Module,
    },
    validation::ValidatedModule,
};

use self::{
    interp::Jump,
    val::{ExternVal, Num, Ref, Val},
};

mod interp;
pub(crate) mod num;
pub mod val;

/// Size of a memory page in bytes.
pub const PAGE_SIZE: usize = 65_536;

/// Maximum number of pages of a memory.
pub const MAX_PAGES: u32 = 65_536;

macro_rules! impl_addr {
    ($ty:ident) => {
        impl From<$ty> for usize {
            fn from(value: $ty) -> Self {
                value.0
            }
        }
    };
}

/// Address of a function instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncAddr(usize);

impl_addr!(FuncAddr);

/// Address of a table instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableAddr(usize);

impl_addr!(TableAddr);

/// Address of a memory instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAddr(usize);

impl_addr!(MemAddr);

/// Address of a global instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalAddr(usize);

impl_addr!(GlobalAddr);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ElemAddr(usize);

impl_addr!(ElemAddr);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataAddr(usize);

impl_addr!(DataAddr);

/// Opaque host reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternAddr(usize);

impl_addr!(ExternAddr);

/// Handle of an instantiated module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleAddr(usize);

impl_addr!(ModuleAddr);

/// Failure reported by a host function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("host function failed: {message}")]
pub struct HostcodeError {
    message: String,
}

impl HostcodeError {
    /// Error with a description of the failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Description of the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Host function implementation.
pub type Hostcode = Box<dyn FnMut(&[Val]) -> Result<Vec<Val>, HostcodeError>>;

/// Reason execution stopped abnormally.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrapKind {
    /// `unreachable` was executed.
    #[error("unreachable executed")]
    Unreachable,
    /// A load or store accessed bytes outside the memory.
    #[error("out of bounds memory access")]
    OutOfBoundsMemory,
    /// `call_indirect` used an index outside the table.
    #[error("undefined element")]
    UndefinedElement,
    /// `call_indirect` found a null entry.
    #[error("uninitialized element")]
    UninitializedElement,
    /// `call_indirect` found a function of another type.
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    /// Integer division or remainder by zero.
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    /// Signed division overflow or float to integer truncation out of range.
    #[error("integer overflow")]
    IntegerOverflow,
    /// Truncation of a NaN to an integer.
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,
    /// The configured call depth was exceeded.
    #[error("call stack exhausted")]
    CallStackExhausted,
    /// The configured instruction budget ran out.
    #[error("out of fuel")]
    OutOfFuel,
    /// A host function failed or returned ill-typed results.
    #[error(transparent)]
    Host(HostcodeError),
    /// The interpreter reached a state a validated module cannot produce.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// A trap with the location where it occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trap {
    kind: TrapKind,
    func: Option<FuncIndex>,
    instr: usize,
}

impl Trap {
    pub(crate) fn new(kind: TrapKind, func: Option<FuncIndex>, instr: usize) -> Self {
        Self { kind, func, instr }
    }

    /// Reason for the trap.
    #[must_use]
    pub fn kind(&self) -> &TrapKind {
        &self.kind
    }

    /// Index of the executing function in its module, if any was executing.
    #[must_use]
    pub fn func(&self) -> Option<FuncIndex> {
        self.func
    }

    /// Position of the trapping instruction in the function body.
    #[must_use]
    pub fn instr(&self) -> usize {
        self.instr
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.func {
            Some(func) => write!(
                f,
                "{} in function {func} at instruction {}",
                self.kind, self.instr
            ),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Trap {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Imports could not be resolved.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The number of externals differs from the number of imports.
    #[error("expected {expected} imports, got {actual}")]
    ImportCount {
        /// Imports declared by the module
        expected: usize,
        /// Externals supplied
        actual: usize,
    },
    /// An external does not match the import's type.
    #[error("import {index} ({module}.{name}) has an incompatible type")]
    ImportMismatch {
        /// Position of the import
        index: usize,
        /// Import module name
        module: String,
        /// Import name
        name: String,
    },
    /// An external refers to nothing in the store.
    #[error("import {index} refers to an unknown address")]
    UnknownAddress {
        /// Position of the import
        index: usize,
    },
}

/// Instantiation failed after linking succeeded.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstantiationTrap {
    /// An element segment does not fit its table.
    #[error("element segment {segment} out of bounds")]
    ElementOutOfBounds {
        /// Segment index
        segment: usize,
    },
    /// A data segment does not fit its memory.
    #[error("data segment {segment} out of bounds")]
    DataOutOfBounds {
        /// Segment index
        segment: usize,
    },
    /// The start function trapped.
    #[error("start function trapped: {0}")]
    Start(Trap),
    /// A table or memory of the module could not be allocated.
    #[error("cannot allocate instance: {0}")]
    Allocation(StoreError),
    /// The module refers to something instantiation did not produce.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Error returned by [`Store::instantiate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstantiateError {
    /// Imports did not match.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Initialization trapped.
    #[error(transparent)]
    Trap(#[from] InstantiationTrap),
}

/// Error returned by [`Store::invoke`] and [`Store::invoke_export`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    /// No export has the name.
    #[error("export `{0}` not found")]
    ExportNotFound(String),
    /// The export is not a function.
    #[error("export `{0}` is not a function")]
    NotAFunction(String),
    /// The address does not refer to a function.
    #[error("unknown function address")]
    UnknownFunction,
    /// Arguments do not match the parameter types.
    #[error("arguments do not match {0}")]
    ArgumentMismatch(FuncTy),
    /// Execution trapped.
    #[error(transparent)]
    Trap(#[from] Trap),
}

/// Error returned by direct store accessors.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The address refers to nothing.
    #[error("unknown address")]
    UnknownAddress,
    /// The index or range lies outside the instance.
    #[error("out of bounds")]
    OutOfBounds,
    /// The global is immutable.
    #[error("global is immutable")]
    Immutable,
    /// The value does not have the instance's type.
    #[error("value type mismatch")]
    TypeMismatch,
    /// The size exceeds the type's maximum or the configured cap.
    #[error("size limit exceeded")]
    LimitExceeded,
    /// The allocator could not provide the storage.
    #[error("out of memory")]
    OutOfMemory,
}

/// Hook called before each executed instruction when the debug level is
/// [`crate::config::DebugLevel::Interrupt`].
pub trait Interrupt {
    /// Called with the executing function, the instruction position and the
    /// instruction about to run.
    fn on_step(&mut self, func: FuncIndex, pos: usize, instr: &Instr);
}

impl<F> Interrupt for F
where
    F: FnMut(FuncIndex, usize, &Instr),
{
    fn on_step(&mut self, func: FuncIndex, pos: usize, instr: &Instr) {
        self(func, pos, instr);
    }
}

/// Stores state for an instantiated Wasm program.
///
/// The store is somewhat analogous to a process's memory. For instance, a
/// decoded function is read from a validated module and placed somewhere in
/// the store and assigned an address.
///
/// The consumer of the API creates a new store. If the Wasm module declares any
/// imports, then the API consumer must allocate function(s), table(s),
/// memories, and/or globals in the store before instantiating the module. As
/// each instance is allocated, the API consumer should keep the returned
/// addresses. Finally, when instantiating the module, the addresses for the
/// instances matching the import's types are passed along with the validated module.
#[derive(Default)]
pub struct Store {
    funcs: Vec<FuncInst>,
    tables: Vec<TableInst>,
    mems: Vec<MemInst>,
    globals: Vec<GlobalInst>,
    elems: Vec<ElemInst>,
    datas: Vec<DataInst>,
    modules: Vec<ModuleInst>,
    config: Config,
    interrupt: Option<Box<dyn Interrupt>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("funcs", &self.funcs)
            .field("tables", &self.tables.len())
            .field("mems", &self.mems.len())
            .field("globals", &self.globals)
            .field("modules", &self.modules.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Lengths of the store's arenas before an instantiation.
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    funcs: usize,
    tables: usize,
    mems: usize,
    globals: usize,
    elems: usize,
    datas: usize,
    modules: usize,
}

/// Segment writes and start function of an allocated instance.
#[derive(Debug)]
struct Init {
    elems: Vec<(TableAddr, usize, ElemAddr)>,
    datas: Vec<(MemAddr, usize, DataAddr)>,
    start: Option<FuncAddr>,
}

impl Store {
    /// Empty store with the default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store with the given configuration.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Current configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replaces the configuration used by later invocations.
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    /// Installs the hook called between steps at the interrupt debug level.
    pub fn set_interrupt<I>(&mut self, interrupt: I)
    where
        I: Interrupt + 'static,
    {
        self.interrupt = Some(Box::new(interrupt));
    }

    /// Allocates a host function.
    pub fn host_func_alloc<F>(&mut self, ty: FuncTy, code: F) -> FuncAddr
    where
        F: FnMut(&[Val]) -> Result<Vec<Val>, HostcodeError> + 'static,
    {
        let a = FuncAddr(self.funcs.len());
        self.funcs.push(FuncInst::Host {
            ty,
            hostcode: Box::new(code),
        });
        a
    }

    fn func_alloc(&mut self, ty: FuncTy, module: ModuleAddr, code: Rc<FuncCode>) -> FuncAddr {
        let a = FuncAddr(self.funcs.len());
        self.funcs.push(FuncInst::Module { ty, module, code });
        a
    }

    /// Type of a function.
    #[must_use]
    pub fn func_ty(&self, addr: FuncAddr) -> Option<&FuncTy> {
        self.funcs.get(addr.0).map(FuncInst::ty)
    }

    /// Allocates a table of `ty.lim.min` entries set to `init`.
    ///
    /// # Errors
    ///
    /// Returns an error if the size exceeds the configured cap or the
    /// entries cannot be allocated.
    pub fn table_alloc(&mut self, ty: TableTy, init: Ref) -> Result<TableAddr, StoreError> {
        if ty.lim.min > self.config.max_table_size {
            return Err(StoreError::LimitExceeded);
        }
        let mut elem = Vec::new();
        filled(&mut elem, ty.lim.min as usize, init).ok_or(StoreError::OutOfMemory)?;
        let a = TableAddr(self.tables.len());
        self.tables.push(TableInst { ty, elem });
        Ok(a)
    }

    /// Type of a table.
    #[must_use]
    pub fn table_ty(&self, addr: TableAddr) -> Option<TableTy> {
        self.tables.get(addr.0).map(|t| t.ty)
    }

    /// Reads a table entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the address or the index is invalid.
    pub fn table_read(&self, addr: TableAddr, i: u32) -> Result<Ref, StoreError> {
        let table = self.tables.get(addr.0).ok_or(StoreError::UnknownAddress)?;
        table
            .elem
            .get(i as usize)
            .copied()
            .ok_or(StoreError::OutOfBounds)
    }

    /// Writes a table entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the address or the index is invalid, or if the
    /// reference has another type than the table's entries.
    pub fn table_write(&mut self, addr: TableAddr, i: u32, r: Ref) -> Result<(), StoreError> {
        let table = self
            .tables
            .get_mut(addr.0)
            .ok_or(StoreError::UnknownAddress)?;
        if RefTy::from(r) != table.ty.elem_ty {
            return Err(StoreError::TypeMismatch);
        }
        let entry = table.elem.get_mut(i as usize).ok_or(StoreError::OutOfBounds)?;
        *entry = r;
        Ok(())
    }

    /// Number of entries in a table.
    #[must_use]
    pub fn table_size(&self, addr: TableAddr) -> Option<u32> {
        self.tables
            .get(addr.0)
            .and_then(|t| u32::try_from(t.elem.len()).ok())
    }

    /// Grows a table by `delta` entries set to `init`.
    ///
    /// Returns the previous size, or `None` if the table would exceed its
    /// maximum or the configured cap, or if the entries cannot be allocated.
    /// A failed grow leaves the table unchanged.
    pub fn table_grow(&mut self, addr: TableAddr, delta: u32, init: Ref) -> Option<u32> {
        let cap = self.config.max_table_size;
        let table = self.tables.get_mut(addr.0)?;
        let old = u32::try_from(table.elem.len()).ok()?;
        let new = old.checked_add(delta)?;
        if new > cap || table.ty.lim.max.is_some_and(|max| new > max) {
            return None;
        }
        filled(&mut table.elem, new as usize, init)?;
        Some(old)
    }

    /// Allocates a zeroed memory of `ty.lim.min` pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the size exceeds the configured cap or the bytes
    /// cannot be allocated.
    pub fn mem_alloc(&mut self, ty: MemTy) -> Result<MemAddr, StoreError> {
        if ty.lim.min > self.config.max_memory_pages.min(MAX_PAGES) {
            return Err(StoreError::LimitExceeded);
        }
        let mut data = Vec::new();
        filled(&mut data, ty.lim.min as usize * PAGE_SIZE, 0).ok_or(StoreError::OutOfMemory)?;
        let a = MemAddr(self.mems.len());
        self.mems.push(MemInst { ty, data });
        Ok(a)
    }

    /// Type of a memory.
    #[must_use]
    pub fn mem_ty(&self, addr: MemAddr) -> Option<MemTy> {
        self.mems.get(addr.0).map(|m| m.ty)
    }

    /// Copies bytes starting at `offset` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the range lies outside
    /// the memory.
    pub fn mem_read(&self, addr: MemAddr, offset: u32, buf: &mut [u8]) -> Result<(), StoreError> {
        let mem = self.mems.get(addr.0).ok_or(StoreError::UnknownAddress)?;
        let start = offset as usize;
        let bytes = start
            .checked_add(buf.len())
            .and_then(|end| mem.data.get(start..end))
            .ok_or(StoreError::OutOfBounds)?;
        buf.copy_from_slice(bytes);
        Ok(())
    }

    /// Copies `bytes` into memory starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the range lies outside
    /// the memory.
    pub fn mem_write(&mut self, addr: MemAddr, offset: u32, bytes: &[u8]) -> Result<(), StoreError> {
        let mem = self.mems.get_mut(addr.0).ok_or(StoreError::UnknownAddress)?;
        let start = offset as usize;
        let dest = start
            .checked_add(bytes.len())
            .and_then(|end| mem.data.get_mut(start..end))
            .ok_or(StoreError::OutOfBounds)?;
        dest.copy_from_slice(bytes);
        Ok(())
    }

    /// Size of a memory in pages.
    #[must_use]
    pub fn mem_size(&self, addr: MemAddr) -> Option<u32> {
        self.mems.get(addr.0).map(MemInst::pages)
    }

    /// Grows a memory by `delta` pages.
    ///
    /// Returns the previous size in pages, or `None` if the memory would
    /// exceed its maximum. A failed grow leaves the memory unchanged.
    pub fn mem_grow(&mut self, addr: MemAddr, delta: u32) -> Option<u32> {
        let cap = self.config.max_memory_pages;
        self.mems.get_mut(addr.0)?.grow(delta, cap)
    }

    /// Allocates a global holding `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not have the global's type.
    pub fn global_alloc(&mut self, ty: GlobalTy, value: Val) -> Result<GlobalAddr, StoreError> {
        if value.ty() != ty.t {
            return Err(StoreError::TypeMismatch);
        }
        let a = GlobalAddr(self.globals.len());
        self.globals.push(GlobalInst { ty, value });
        Ok(a)
    }

    /// Type of a global.
    #[must_use]
    pub fn global_ty(&self, addr: GlobalAddr) -> Option<GlobalTy> {
        self.globals.get(addr.0).map(|g| g.ty)
    }

    /// Current value of a global.
    #[must_use]
    pub fn global_read(&self, addr: GlobalAddr) -> Option<Val> {
        self.globals.get(addr.0).map(|g| g.value)
    }

    /// Sets a mutable global.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid, the global is immutable,
    /// or the value has another type.
    pub fn global_write(&mut self, addr: GlobalAddr, val: Val) -> Result<(), StoreError> {
        let g = self
            .globals
            .get_mut(addr.0)
            .ok_or(StoreError::UnknownAddress)?;
        if g.ty.m == Mut::Const {
            return Err(StoreError::Immutable);
        }
        if val.ty() != g.ty.t {
            return Err(StoreError::TypeMismatch);
        }
        g.value = val;
        Ok(())
    }

    fn elem_alloc(&mut self, elem: Vec<Ref>) -> ElemAddr {
        let a = ElemAddr(self.elems.len());
        self.elems.push(ElemInst { elem });
        a
    }

    fn elem_drop(&mut self, addr: ElemAddr) {
        if let Some(elem) = self.elems.get_mut(addr.0) {
            elem.elem = Vec::new();
        }
    }

    fn data_alloc(&mut self, data: Vec<u8>) -> DataAddr {
        let a = DataAddr(self.datas.len());
        self.datas.push(DataInst { data });
        a
    }

    fn data_drop(&mut self, addr: DataAddr) {
        if let Some(data) = self.datas.get_mut(addr.0) {
            data.data = Vec::new();
        }
    }

    /// Writes an element instance into a table at `offset`.
    fn table_init(&mut self, table: TableAddr, offset: usize, elem: ElemAddr) -> Option<()> {
        let src = &self.elems.get(elem.0)?.elem;
        let dest = self
            .tables
            .get_mut(table.0)?
            .elem
            .get_mut(offset..offset.checked_add(src.len())?)?;
        dest.copy_from_slice(src);
        Some(())
    }

    /// Writes a data instance into a memory at `offset`.
    fn mem_init(&mut self, mem: MemAddr, offset: usize, data: DataAddr) -> Option<()> {
        let src = &self.datas.get(data.0)?.data;
        let dest = self
            .mems
            .get_mut(mem.0)?
            .data
            .get_mut(offset..offset.checked_add(src.len())?)?;
        dest.copy_from_slice(src);
        Some(())
    }

    /// Type of an external as seen by import matching.
    ///
    /// Tables and memories report their current size as the minimum.
    #[must_use]
    pub fn extern_ty(&self, val: ExternVal) -> Option<ExternTy> {
        Some(match val {
            ExternVal::Func(a) => ExternTy::Func(self.funcs.get(a.0)?.ty().clone()),
            ExternVal::Table(a) => {
                let table = self.tables.get(a.0)?;
                ExternTy::Table(TableTy {
                    elem_ty: table.ty.elem_ty,
                    lim: Limits {
                        min: u32::try_from(table.elem.len()).ok()?,
                        max: table.ty.lim.max,
                    },
                })
            }
            ExternVal::Mem(a) => {
                let mem = self.mems.get(a.0)?;
                ExternTy::Mem(MemTy {
                    lim: Limits {
                        min: mem.pages(),
                        max: mem.ty.lim.max,
                    },
                })
            }
            ExternVal::Global(a) => ExternTy::Global(self.globals.get(a.0)?.ty),
        })
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            funcs: self.funcs.len(),
            tables: self.tables.len(),
            mems: self.mems.len(),
            globals: self.globals.len(),
            elems: self.elems.len(),
            datas: self.datas.len(),
            modules: self.modules.len(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.funcs.truncate(snapshot.funcs);
        self.tables.truncate(snapshot.tables);
        self.mems.truncate(snapshot.mems);
        self.globals.truncate(snapshot.globals);
        self.elems.truncate(snapshot.elems);
        self.datas.truncate(snapshot.datas);
        self.modules.truncate(snapshot.modules);
    }

    /// Instantiates a validated module.
    ///
    /// `externs` supplies one address per import, in import order. If
    /// linking, allocation or a segment bounds check fails, every instance
    /// allocated by the instantiation is released. Once the segments are
    /// written the instance stays in the store, even if the start function
    /// then traps, since imported tables may already refer to its functions.
    ///
    /// # Errors
    ///
    /// Returns an error if the externals do not match the imports, if a
    /// table or memory cannot be allocated, if a segment does not fit, or if
    /// the start function traps.
    pub fn instantiate(
        &mut self,
        module: ValidatedModule,
        externs: &[ExternVal],
    ) -> Result<ModuleAddr, InstantiateError> {
        self.link(&module, externs)?;

        let snapshot = self.snapshot();
        let (addr, init) = match self.build(module.into_inner(), externs) {
            Ok(built) => built,
            Err(error) => {
                debug!(%error, "instantiation failed");
                self.restore(snapshot);
                return Err(error);
            }
        };

        if let Err(error) = self.initialize(addr, init) {
            debug!(module = addr.0, %error, "initialization failed");
            return Err(error);
        }
        debug!(
            module = addr.0,
            funcs = self.funcs.len() - snapshot.funcs,
            "instantiated module"
        );
        Ok(addr)
    }

    fn link(&self, module: &Module, externs: &[ExternVal]) -> Result<(), LinkError> {
        if module.imports.len() != externs.len() {
            return Err(LinkError::ImportCount {
                expected: module.imports.len(),
                actual: externs.len(),
            });
        }

        for (index, ((m, name, expected), ext)) in
            module.import_external_tys().zip(externs).enumerate()
        {
            let actual = self
                .extern_ty(*ext)
                .ok_or(LinkError::UnknownAddress { index })?;
            if !actual.matches(&expected) {
                return Err(LinkError::ImportMismatch {
                    index,
                    module: m.to_string(),
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Allocates the instance and checks its segments without writing them.
    fn build(
        &mut self,
        module: Module,
        externs: &[ExternVal],
    ) -> Result<(ModuleAddr, Init), InstantiateError> {
        let Module {
            types,
            funcs,
            tables,
            mems,
            globals,
            exports,
            start,
            elems,
            datas,
            ..
        } = module;

        let addr = ModuleAddr(self.modules.len());
        let mut inst = ModuleInst {
            types,
            ..ModuleInst::default()
        };

        for ext in externs {
            match *ext {
                ExternVal::Func(a) => inst.func_addrs.push(a),
                ExternVal::Table(a) => inst.table_addrs.push(a),
                ExternVal::Mem(a) => inst.mem_addrs.push(a),
                ExternVal::Global(a) => inst.global_addrs.push(a),
            }
        }

        let imported = inst.func_addrs.len();
        for (i, func) in funcs.into_iter().enumerate() {
            let ty = inst
                .types
                .get(usize::from(func.ty))
                .cloned()
                .ok_or(InstantiationTrap::Internal("unknown function type"))?;
            let idx = u32::try_from(imported + i)
                .map(FuncIndex::new)
                .map_err(|_| InstantiationTrap::Internal("too many functions"))?;
            let body = func.body.instrs;
            let code = FuncCode {
                idx,
                locals: func.locals,
                jumps: interp::jump_table(&body),
                body,
            };
            inst.func_addrs.push(self.func_alloc(ty, addr, Rc::new(code)));
        }

        for table in tables {
            let init = Ref::Null(table.ty.elem_ty);
            let a = self
                .table_alloc(table.ty, init)
                .map_err(InstantiationTrap::Allocation)?;
            inst.table_addrs.push(a);
        }

        for mem in mems {
            let a = self.mem_alloc(mem.ty).map_err(InstantiationTrap::Allocation)?;
            inst.mem_addrs.push(a);
        }

        for global in globals {
            let value = self.const_eval(&inst, &global.init)?;
            let a = self
                .global_alloc(global.ty, value)
                .map_err(|_| InstantiationTrap::Internal("global initializer has the wrong type"))?;
            inst.global_addrs.push(a);
        }

        // Every segment is checked before the first one is written.
        let mut elem_inits = Vec::with_capacity(elems.len());
        for (segment, elem) in elems.into_iter().enumerate() {
            let offset = self.const_offset(&inst, &elem.offset)?;
            let table = *inst
                .table_addrs
                .get(usize::from(elem.table))
                .ok_or(InstantiationTrap::Internal("unknown table"))?;
            let refs = elem
                .init
                .iter()
                .map(|f| inst.func_addrs.get(usize::from(*f)).copied().map(Ref::Func))
                .collect::<Option<Vec<_>>>()
                .ok_or(InstantiationTrap::Internal("unknown function in element segment"))?;
            let size = self.tables.get(table.0).map_or(0, |t| t.elem.len());
            if offset.checked_add(refs.len()).map_or(true, |end| end > size) {
                return Err(InstantiationTrap::ElementOutOfBounds { segment }.into());
            }
            let a = self.elem_alloc(refs);
            inst.elem_addrs.push(a);
            elem_inits.push((table, offset, a));
        }

        let mut data_inits = Vec::with_capacity(datas.len());
        for (segment, data) in datas.into_iter().enumerate() {
            let offset = self.const_offset(&inst, &data.offset)?;
            let mem = *inst
                .mem_addrs
                .get(usize::from(data.mem))
                .ok_or(InstantiationTrap::Internal("unknown memory"))?;
            let size = self.mems.get(mem.0).map_or(0, |m| m.data.len());
            if offset.checked_add(data.init.len()).map_or(true, |end| end > size) {
                return Err(InstantiationTrap::DataOutOfBounds { segment }.into());
            }
            let a = self.data_alloc(data.init);
            inst.data_addrs.push(a);
            data_inits.push((mem, offset, a));
        }

        for export in exports {
            let value = match export.desc {
                ExportDesc::Func(idx) => lookup(&inst.func_addrs, idx).map(ExternVal::Func),
                ExportDesc::Table(idx) => lookup(&inst.table_addrs, idx).map(ExternVal::Table),
                ExportDesc::Mem(idx) => lookup(&inst.mem_addrs, idx).map(ExternVal::Mem),
                ExportDesc::Global(idx) => lookup(&inst.global_addrs, idx).map(ExternVal::Global),
            }
            .ok_or(InstantiationTrap::Internal("unknown export"))?;
            inst.exports.push(ExportInst {
                name: export.name,
                value,
            });
        }

        let start = match start {
            Some(idx) => Some(
                *inst
                    .func_addrs
                    .get(usize::from(idx))
                    .ok_or(InstantiationTrap::Internal("unknown start function"))?,
            ),
            None => None,
        };

        self.modules.push(inst);

        Ok((
            addr,
            Init {
                elems: elem_inits,
                datas: data_inits,
                start,
            },
        ))
    }

    /// Writes the checked segments and runs the start function.
    fn initialize(&mut self, addr: ModuleAddr, init: Init) -> Result<(), InstantiateError> {
        for (table, offset, elem) in init.elems {
            self.table_init(table, offset, elem)
                .ok_or(InstantiationTrap::Internal("element segment write failed"))?;
            self.elem_drop(elem);
        }
        for (mem, offset, data) in init.datas {
            self.mem_init(mem, offset, data)
                .ok_or(InstantiationTrap::Internal("data segment write failed"))?;
            self.data_drop(data);
        }

        if let Some(func) = init.start {
            debug!(module = addr.0, "running start function");
            interp::invoke(self, func, &[]).map_err(InstantiationTrap::Start)?;
        }
        Ok(())
    }

    fn const_eval(&self, inst: &ModuleInst, expr: &ConstExpr) -> Result<Val, InstantiationTrap> {
        match &expr.instr {
            Instr::Num(instr::Num::Constant(c)) => Ok(Val::Num(Num::from(*c))),
            Instr::Var(Variable::GlobalGet(idx)) => inst
                .global_addrs
                .get(usize::from(*idx))
                .and_then(|a| self.global_read(*a))
                .ok_or(InstantiationTrap::Internal("unknown global in initializer")),
            _ => Err(InstantiationTrap::Internal("initializer is not constant")),
        }
    }

    fn const_offset(&self, inst: &ModuleInst, expr: &ConstExpr) -> Result<usize, InstantiationTrap> {
        self.const_eval(inst, expr)?
            .as_i32()
            .map(|n| n as u32 as usize)
            .ok_or(InstantiationTrap::Internal("segment offset is not an i32"))
    }

    /// Looks up an export of an instantiated module.
    #[must_use]
    pub fn export(&self, module: ModuleAddr, name: &str) -> Option<ExternVal> {
        self.modules
            .get(module.0)?
            .exports
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value)
    }

    /// Exports of an instantiated module, in declaration order.
    #[must_use]
    pub fn exports(&self, module: ModuleAddr) -> &[ExportInst] {
        self.modules
            .get(module.0)
            .map_or(&[], |m| m.exports.as_slice())
    }

    /// Calls a function with arguments matching its parameter types.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is unknown, the arguments do not match,
    /// or execution traps.
    pub fn invoke(&mut self, addr: FuncAddr, args: &[Val]) -> Result<Vec<Val>, InvokeError> {
        let ty = self.func_ty(addr).ok_or(InvokeError::UnknownFunction)?;
        if !is_compatible(ty.params(), args) {
            return Err(InvokeError::ArgumentMismatch(ty.clone()));
        }
        debug!(func = addr.0, ?args, "invoke");
        let results = interp::invoke(self, addr, args)?;
        debug!(?results, "returned");
        Ok(results)
    }

    /// Calls an exported function by name.
    ///
    /// # Errors
    ///
    /// Returns an error if no function is exported under the name, the
    /// arguments do not match, or execution traps.
    pub fn invoke_export(
        &mut self,
        module: ModuleAddr,
        name: &str,
        args: &[Val],
    ) -> Result<Vec<Val>, InvokeError> {
        let func = self
            .export(module, name)
            .ok_or_else(|| InvokeError::ExportNotFound(name.to_string()))?
            .as_func()
            .ok_or_else(|| InvokeError::NotAFunction(name.to_string()))?;
        self.invoke(func, args)
    }
}

/// Resizes `v` to `len` with copies of `value`, or leaves it unchanged if
/// the storage cannot be reserved.
fn filled<T: Clone>(v: &mut Vec<T>, len: usize, value: T) -> Option<()> {
    v.try_reserve_exact(len.saturating_sub(v.len())).ok()?;
    v.resize(len, value);
    Some(())
}

fn lookup<T: Copy, I: Into<usize>>(addrs: &[T], idx: I) -> Option<T> {
    addrs.get(idx.into()).copied()
}

/// Module defined function code prepared for execution.
#[derive(Debug)]
pub(crate) struct FuncCode {
    /// Index in the defining module
    pub(crate) idx: FuncIndex,
    /// Declared locals after the parameters
    pub(crate) locals: Vec<ValTy>,
    pub(crate) body: Vec<Instr>,
    /// Matching `else`/`end` of each structured instruction
    pub(crate) jumps: Vec<Option<Jump>>,
}

pub(crate) enum FuncInst {
    Module {
        ty: FuncTy,
        module: ModuleAddr,
        code: Rc<FuncCode>,
    },
    Host {
        ty: FuncTy,
        hostcode: Hostcode,
    },
}

impl fmt::Debug for FuncInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module { ty, module, code } => f
                .debug_struct("Module")
                .field("ty", ty)
                .field("module", module)
                .field("idx", &code.idx)
                .finish_non_exhaustive(),
            Self::Host { ty, hostcode: _ } => f
                .debug_struct("Host")
                .field("ty", ty)
                .finish_non_exhaustive(),
        }
    }
}

impl FuncInst {
    fn ty(&self) -> &FuncTy {
        match self {
            FuncInst::Module { ty, .. } | FuncInst::Host { ty, .. } => ty,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TableInst {
    pub(crate) ty: TableTy,
    pub(crate) elem: Vec<Ref>,
}

#[derive(Debug)]
pub(crate) struct MemInst {
    pub(crate) ty: MemTy,
    pub(crate) data: Vec<u8>,
}

impl MemInst {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn pages(&self) -> u32 {
        (self.data.len() / PAGE_SIZE) as u32
    }

    /// Grows by `delta` pages, never beyond `cap` pages.
    pub(crate) fn grow(&mut self, delta: u32, cap: u32) -> Option<u32> {
        let old = self.pages();
        let new = old.checked_add(delta)?;
        let max = self.ty.lim.max.map_or(MAX_PAGES, |max| max.min(MAX_PAGES));
        if new > max.min(cap) {
            return None;
        }
        filled(&mut self.data, new as usize * PAGE_SIZE, 0)?;
        Some(old)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GlobalInst {
    pub(crate) ty: GlobalTy,
    pub(crate) value: Val,
}

#[derive(Debug)]
pub(crate) struct ElemInst {
    pub(crate) elem: Vec<Ref>,
}

#[derive(Debug)]
pub(crate) struct DataInst {
    pub(crate) data: Vec<u8>,
}

/// Exported external of a module instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInst {
    /// Export name
    pub name: String,
    /// Exported external
    pub value: ExternVal,
}

/// Addresses owned by an instantiated module.
#[derive(Debug, Default)]
pub(crate) struct ModuleInst {
    pub(crate) types: Vec<FuncTy>,
    pub(crate) func_addrs: Vec<FuncAddr>,
    pub(crate) table_addrs: Vec<TableAddr>,
    pub(crate) mem_addrs: Vec<MemAddr>,
    pub(crate) global_addrs: Vec<GlobalAddr>,
    pub(crate) elem_addrs: Vec<ElemAddr>,
    pub(crate) data_addrs: Vec<DataAddr>,
    pub(crate) exports: Vec<ExportInst>,
}
