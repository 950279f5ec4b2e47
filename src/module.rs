//! Abstract model of a WebAssembly module.
//!
//! A [`Module`] is produced by the decoder in [`crate::fmt::binary`] and is not
//! modified afterwards.

use core::fmt;

use self::{
    instr::{ConstExpr, Expr},
    ty::{ExternTy, FuncTy, GlobalTy, MemTy, RefTy, TableTy, ValTy},
};

pub mod instr;
pub mod ty;

macro_rules! impl_index {
    ($ty:ident) => {
        impl $ty {
            /// Wraps a raw index.
            #[inline]
            #[must_use]
            pub const fn new(idx: u32) -> Self {
                Self(idx)
            }
        }

        impl From<$ty> for usize {
            fn from(value: $ty) -> Self {
                value.0 as usize
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

/// Index for a [`FuncTy`] in the type section.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeIndex(pub u32);

impl_index!(TypeIndex);

/// Index for a function. Imported functions come first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncIndex(pub u32);

impl_index!(FuncIndex);

/// Index for a table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableIndex(pub u32);

impl_index!(TableIndex);

/// Index for memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemIndex(pub u32);

impl_index!(MemIndex);

/// Index for a global variable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalIndex(pub u32);

impl_index!(GlobalIndex);

/// Index for a local variable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalIndex(pub u32);

impl_index!(LocalIndex);

/// Index for a label, counted outwards from the innermost block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelIndex(pub u32);

impl_index!(LabelIndex);

/// Module defined function.
#[derive(Debug, Clone, PartialEq)]
pub struct Func {
    /// Signature
    pub ty: TypeIndex,
    /// Declared locals, not including the parameters
    pub locals: Vec<ValTy>,
    /// Body including the final `end`
    pub body: Expr,
}

/// Table definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    /// Type
    pub ty: TableTy,
}

/// Memory definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    /// Type
    pub ty: MemTy,
}

/// Global
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    /// Type
    pub ty: GlobalTy,
    /// Initial value
    pub init: ConstExpr,
}

/// Active element segment which initializes a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Elem {
    /// Reference type of the entries
    pub ty: RefTy,
    /// Table to initialize
    pub table: TableIndex,
    /// Position of the first entry
    pub offset: ConstExpr,
    /// Functions written to the table
    pub init: Vec<FuncIndex>,
}

/// Active data segment which initializes a memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    /// Memory to initialize
    pub mem: MemIndex,
    /// Position of the first byte
    pub offset: ConstExpr,
    /// Bytes written to memory
    pub init: Vec<u8>,
}

/// Export description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportDesc {
    /// Function index
    Func(FuncIndex),
    /// Table index
    Table(TableIndex),
    /// Memory index
    Mem(MemIndex),
    /// Global index
    Global(GlobalIndex),
}

/// Export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Unique name
    pub name: String,
    /// Exported entity
    pub desc: ExportDesc,
}

/// Import description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportDesc {
    /// Function type index
    Func(TypeIndex),
    /// Table type
    Table(TableTy),
    /// Memory type
    Mem(MemTy),
    /// Global type
    Global(GlobalTy),
}

/// Import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Module
    pub module: String,
    /// Name
    pub name: String,
    /// Description
    pub desc: ImportDesc,
}

/// Custom section kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Custom {
    /// Name
    pub name: String,
    /// Payload after the name
    pub data: Vec<u8>,
}

/// Location of a section in the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Section id
    pub id: u8,
    /// Byte offset of the payload
    pub offset: u64,
    /// Payload size in bytes
    pub size: u32,
}

impl SectionHeader {
    /// Name of the section kind.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self.id {
            0 => "custom",
            1 => "type",
            2 => "import",
            3 => "function",
            4 => "table",
            5 => "memory",
            6 => "global",
            7 => "export",
            8 => "start",
            9 => "element",
            10 => "code",
            11 => "data",
            _ => "unknown",
        }
    }
}

/// Decoded module
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    /// Function types
    pub types: Vec<FuncTy>,
    /// Imports
    pub imports: Vec<Import>,
    /// Module defined functions
    pub funcs: Vec<Func>,
    /// Tables
    pub tables: Vec<Table>,
    /// Memory
    pub mems: Vec<Mem>,
    /// Globals
    pub globals: Vec<Global>,
    /// Exports
    pub exports: Vec<Export>,
    /// Start function index
    pub start: Option<FuncIndex>,
    /// Element segments
    pub elems: Vec<Elem>,
    /// Data
    pub datas: Vec<Data>,
    /// Custom sections
    pub customs: Vec<Custom>,
    /// Sections in the order they were read
    pub sections: Vec<SectionHeader>,
}

impl Module {
    /// Type indices of the imported functions.
    pub fn imported_funcs(&self) -> impl Iterator<Item = TypeIndex> + '_ {
        self.imports.iter().filter_map(|i| match i.desc {
            ImportDesc::Func(idx) => Some(idx),
            _ => None,
        })
    }

    /// Types of the imported tables.
    pub fn imported_tables(&self) -> impl Iterator<Item = TableTy> + '_ {
        self.imports.iter().filter_map(|i| match i.desc {
            ImportDesc::Table(ty) => Some(ty),
            _ => None,
        })
    }

    /// Types of the imported memories.
    pub fn imported_mems(&self) -> impl Iterator<Item = MemTy> + '_ {
        self.imports.iter().filter_map(|i| match i.desc {
            ImportDesc::Mem(ty) => Some(ty),
            _ => None,
        })
    }

    /// Types of the imported globals.
    pub fn imported_globals(&self) -> impl Iterator<Item = GlobalTy> + '_ {
        self.imports.iter().filter_map(|i| match i.desc {
            ImportDesc::Global(ty) => Some(ty),
            _ => None,
        })
    }

    /// Type index of every function, imports first.
    pub fn func_ty_idxs(&self) -> impl Iterator<Item = TypeIndex> + '_ {
        self.imported_funcs().chain(self.funcs.iter().map(|f| f.ty))
    }

    /// Type of every table, imports first.
    pub fn table_tys(&self) -> impl Iterator<Item = TableTy> + '_ {
        self.imported_tables()
            .chain(self.tables.iter().map(|t| t.ty))
    }

    /// Type of every memory, imports first.
    pub fn mem_tys(&self) -> impl Iterator<Item = MemTy> + '_ {
        self.imported_mems().chain(self.mems.iter().map(|m| m.ty))
    }

    /// Type of every global, imports first.
    pub fn global_tys(&self) -> impl Iterator<Item = GlobalTy> + '_ {
        self.imported_globals()
            .chain(self.globals.iter().map(|g| g.ty))
    }

    /// True if the function index refers to an imported function.
    #[must_use]
    pub fn is_imported_func(&self, idx: FuncIndex) -> bool {
        usize::from(idx) < self.imported_funcs().count()
    }

    /// Type index of a function.
    #[must_use]
    pub fn func_ty_idx(&self, idx: FuncIndex) -> Option<TypeIndex> {
        self.func_ty_idxs().nth(usize::from(idx))
    }

    /// Type of a function.
    #[must_use]
    pub fn func_ty(&self, idx: FuncIndex) -> Option<&FuncTy> {
        self.func_ty_idx(idx)
            .and_then(|ty| self.types.get(usize::from(ty)))
    }

    /// External type of each import, in order.
    pub fn import_external_tys(&self) -> impl Iterator<Item = (&str, &str, ExternTy)> + '_ {
        self.imports.iter().filter_map(|i| {
            let ty = match i.desc {
                ImportDesc::Func(idx) => ExternTy::Func(self.types.get(usize::from(idx))?.clone()),
                ImportDesc::Table(ty) => ExternTy::Table(ty),
                ImportDesc::Mem(ty) => ExternTy::Mem(ty),
                ImportDesc::Global(ty) => ExternTy::Global(ty),
            };
            Some((i.module.as_str(), i.name.as_str(), ty))
        })
    }

    /// External type of each export, in order.
    pub fn export_external_tys(&self) -> impl Iterator<Item = (&str, ExternTy)> + '_ {
        self.exports.iter().filter_map(|e| {
            let ty = match e.desc {
                ExportDesc::Func(idx) => ExternTy::Func(self.func_ty(idx)?.clone()),
                ExportDesc::Table(idx) => ExternTy::Table(self.table_tys().nth(usize::from(idx))?),
                ExportDesc::Mem(idx) => ExternTy::Mem(self.mem_tys().nth(usize::from(idx))?),
                ExportDesc::Global(idx) => {
                    ExternTy::Global(self.global_tys().nth(usize::from(idx))?)
                }
            };
            Some((e.name.as_str(), ty))
        })
    }
}
