//! Embedding API as described in Appendix A.1
//!
//! Thin functions over [`Store`] and the decoder and validator, sharing one
//! [`Error`] type which reports an [`ErrorKind`].

use core::fmt;

use crate::{
    exec::{
        val::{ExternVal, Ref, Val},
        FuncAddr, GlobalAddr, HostcodeError, InstantiateError, InvokeError, MemAddr, ModuleAddr,
        Store, StoreError, TableAddr, TrapKind,
    },
    fmt::binary,
    module::{
        ty::{ExternTy, FuncTy, GlobalTy, MemTy, TableTy},
        Module,
    },
    validation::{self, ValidatedModule},
};

#[derive(Debug, thiserror::Error)]
enum InnerError {
    #[error(transparent)]
    Decode(#[from] binary::Error),
    #[error(transparent)]
    Validation(#[from] validation::Error),
    #[error(transparent)]
    Instantiate(#[from] InstantiateError),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The binary could not be decoded.
    MalformedBinary,
    /// The module is invalid.
    Validation,
    /// Imports, exports, arguments or addresses could not be resolved.
    Link,
    /// Instantiation trapped while initializing the instance.
    InstantiationTrap,
    /// Execution trapped, or the store could not provide a table or memory
    /// of the requested size.
    Trap,
    /// A host function failed.
    Host,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::MalformedBinary => "malformed binary",
            ErrorKind::Validation => "invalid module",
            ErrorKind::Link => "link error",
            ErrorKind::InstantiationTrap => "instantiation trap",
            ErrorKind::Trap => "trap",
            ErrorKind::Host => "host error",
        })
    }
}

/// Generic error
#[derive(Debug)]
pub struct Error {
    inner: InnerError,
}

macro_rules! impl_from {
    ($ty:ty) => {
        impl From<$ty> for Error {
            fn from(value: $ty) -> Self {
                Self {
                    inner: InnerError::from(value),
                }
            }
        }
    };
}

impl_from!(binary::Error);
impl_from!(validation::Error);
impl_from!(InstantiateError);
impl_from!(InvokeError);
impl_from!(StoreError);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.inner)
    }
}

impl Error {
    /// Category of the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            InnerError::Decode(_) => ErrorKind::MalformedBinary,
            InnerError::Validation(_) => ErrorKind::Validation,
            InnerError::Instantiate(InstantiateError::Link(_))
            | InnerError::Invoke(
                InvokeError::ExportNotFound(_)
                | InvokeError::NotAFunction(_)
                | InvokeError::UnknownFunction
                | InvokeError::ArgumentMismatch(_),
            )
            | InnerError::Store(
                StoreError::UnknownAddress
                | StoreError::OutOfBounds
                | StoreError::Immutable
                | StoreError::TypeMismatch,
            ) => ErrorKind::Link,
            InnerError::Store(StoreError::LimitExceeded | StoreError::OutOfMemory) => {
                ErrorKind::Trap
            }
            InnerError::Instantiate(InstantiateError::Trap(_)) => ErrorKind::InstantiationTrap,
            InnerError::Invoke(InvokeError::Trap(trap)) => match trap.kind() {
                TrapKind::Host(_) => ErrorKind::Host,
                _ => ErrorKind::Trap,
            },
        }
    }

    /// The trap kind, if execution trapped.
    #[must_use]
    pub fn trap(&self) -> Option<&TrapKind> {
        match &self.inner {
            InnerError::Invoke(InvokeError::Trap(trap)) => Some(trap.kind()),
            _ => None,
        }
    }

    /// The validation failure, if the module was invalid.
    #[must_use]
    pub fn validation(&self) -> Option<&validation::Error> {
        match &self.inner {
            InnerError::Validation(e) => Some(e),
            _ => None,
        }
    }
}

/// Creates an empty store.
#[must_use]
pub fn store_init() -> Store {
    Store::new()
}

/// Decodes a Wasm module in binary format.
///
/// # Errors
///
/// Returns an error if the data is invalid or if a problem occurs when reading.
#[inline]
pub fn module_decode(bytes: &[u8]) -> Result<Module, Error> {
    Ok(binary::from_slice(bytes)?)
}

/// Validates a Wasm module.
///
/// # Errors
///
/// Returns an error if the module is invalid.
#[inline]
pub fn module_validate(m: Module) -> Result<ValidatedModule, Error> {
    Ok(ValidatedModule::new(m)?)
}

/// Instantiates a validated module with one external per import.
///
/// # Errors
///
/// Returns an error if the externals do not match the imports or if
/// initialization traps.
pub fn module_instantiate(
    s: &mut Store,
    m: ValidatedModule,
    externs: &[ExternVal],
) -> Result<ModuleAddr, Error> {
    Ok(s.instantiate(m, externs)?)
}

/// Returns a module's imports.
#[must_use]
pub fn module_imports(m: &Module) -> Vec<(String, String, ExternTy)> {
    m.import_external_tys()
        .map(|(module, name, ty)| (module.to_string(), name.to_string(), ty))
        .collect()
}

/// Returns a module's exports.
#[must_use]
pub fn module_exports(m: &Module) -> Vec<(String, ExternTy)> {
    m.export_external_tys()
        .map(|(name, ty)| (name.to_string(), ty))
        .collect()
}

/// Looks up an export of an instance.
///
/// # Errors
///
/// Returns an error if nothing is exported under the name.
pub fn instance_export(s: &Store, i: ModuleAddr, name: &str) -> Result<ExternVal, Error> {
    s.export(i, name)
        .ok_or_else(|| InvokeError::ExportNotFound(name.to_string()).into())
}

/// Allocates a host function.
pub fn func_alloc<F>(s: &mut Store, ty: FuncTy, code: F) -> FuncAddr
where
    F: FnMut(&[Val]) -> Result<Vec<Val>, HostcodeError> + 'static,
{
    s.host_func_alloc(ty, code)
}

/// Type of a function.
///
/// # Errors
///
/// Returns an error if the address is unknown.
pub fn func_type(s: &Store, a: FuncAddr) -> Result<FuncTy, Error> {
    s.func_ty(a)
        .cloned()
        .ok_or_else(|| InvokeError::UnknownFunction.into())
}

/// Invokes a function.
///
/// # Errors
///
/// Returns an error if the arguments do not match the function's parameters
/// or if execution traps.
pub fn func_invoke(s: &mut Store, a: FuncAddr, args: &[Val]) -> Result<Vec<Val>, Error> {
    Ok(s.invoke(a, args)?)
}

/// Allocates a table filled with `r`.
///
/// # Errors
///
/// Returns an error if the table exceeds the configured size or cannot be
/// allocated.
pub fn table_alloc(s: &mut Store, ty: TableTy, r: Ref) -> Result<TableAddr, Error> {
    Ok(s.table_alloc(ty, r)?)
}

/// Type of a table.
///
/// # Errors
///
/// Returns an error if the address is unknown.
pub fn table_type(s: &Store, a: TableAddr) -> Result<TableTy, Error> {
    Ok(s.table_ty(a).ok_or(StoreError::UnknownAddress)?)
}

/// Reads a table entry.
///
/// # Errors
///
/// Returns an error if the address or index is invalid.
pub fn table_read(s: &Store, a: TableAddr, i: u32) -> Result<Ref, Error> {
    Ok(s.table_read(a, i)?)
}

/// Writes a table entry.
///
/// # Errors
///
/// Returns an error if the address or index is invalid.
pub fn table_write(s: &mut Store, a: TableAddr, i: u32, r: Ref) -> Result<(), Error> {
    Ok(s.table_write(a, i, r)?)
}

/// Number of entries in a table.
///
/// # Errors
///
/// Returns an error if the address is unknown.
pub fn table_size(s: &Store, a: TableAddr) -> Result<u32, Error> {
    Ok(s.table_size(a).ok_or(StoreError::UnknownAddress)?)
}

/// Grows a table by `n` entries set to `r`.
///
/// Returns the previous size, or `None` if the table cannot grow.
///
/// # Errors
///
/// Returns an error if the address is unknown.
pub fn table_grow(s: &mut Store, a: TableAddr, n: u32, r: Ref) -> Result<Option<u32>, Error> {
    s.table_size(a).ok_or(StoreError::UnknownAddress)?;
    Ok(s.table_grow(a, n, r))
}

/// Allocates a zeroed memory.
///
/// # Errors
///
/// Returns an error if the memory exceeds the configured size or cannot be
/// allocated.
pub fn mem_alloc(s: &mut Store, ty: MemTy) -> Result<MemAddr, Error> {
    Ok(s.mem_alloc(ty)?)
}

/// Type of a memory.
///
/// # Errors
///
/// Returns an error if the address is unknown.
pub fn mem_type(s: &Store, a: MemAddr) -> Result<MemTy, Error> {
    Ok(s.mem_ty(a).ok_or(StoreError::UnknownAddress)?)
}

/// Reads one byte of memory.
///
/// # Errors
///
/// Returns an error if the address or index is invalid.
pub fn mem_read(s: &Store, a: MemAddr, i: u32) -> Result<u8, Error> {
    let mut b = [0];
    s.mem_read(a, i, &mut b)?;
    Ok(b[0])
}

/// Writes one byte of memory.
///
/// # Errors
///
/// Returns an error if the address or index is invalid.
pub fn mem_write(s: &mut Store, a: MemAddr, i: u32, b: u8) -> Result<(), Error> {
    Ok(s.mem_write(a, i, &[b])?)
}

/// Size of a memory in pages.
///
/// # Errors
///
/// Returns an error if the address is unknown.
pub fn mem_size(s: &Store, a: MemAddr) -> Result<u32, Error> {
    Ok(s.mem_size(a).ok_or(StoreError::UnknownAddress)?)
}

/// Grows a memory by `n` pages.
///
/// Returns the previous size in pages, or `None` if the memory cannot grow.
///
/// # Errors
///
/// Returns an error if the address is unknown.
pub fn mem_grow(s: &mut Store, a: MemAddr, n: u32) -> Result<Option<u32>, Error> {
    s.mem_size(a).ok_or(StoreError::UnknownAddress)?;
    Ok(s.mem_grow(a, n))
}

/// Allocates a global.
///
/// # Errors
///
/// Returns an error if the value does not have the global's type.
pub fn global_alloc(s: &mut Store, ty: GlobalTy, val: Val) -> Result<GlobalAddr, Error> {
    Ok(s.global_alloc(ty, val)?)
}

/// Type of a global.
///
/// # Errors
///
/// Returns an error if the address is unknown.
pub fn global_type(s: &Store, a: GlobalAddr) -> Result<GlobalTy, Error> {
    Ok(s.global_ty(a).ok_or(StoreError::UnknownAddress)?)
}

/// Reads a global.
///
/// # Errors
///
/// Returns an error if the address is unknown.
pub fn global_read(s: &Store, a: GlobalAddr) -> Result<Val, Error> {
    Ok(s.global_read(a).ok_or(StoreError::UnknownAddress)?)
}

/// Writes a mutable global.
///
/// # Errors
///
/// Returns an error if the global is immutable or the value has another type.
pub fn global_write(s: &mut Store, a: GlobalAddr, val: Val) -> Result<(), Error> {
    Ok(s.global_write(a, val)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        module::ty::{Limits, Mut, ValTy},
        validation::ValidationErrorKind,
    };

    fn instantiate(s: &mut Store, wat: &str) -> ModuleAddr {
        let m = module_decode(&wat::parse_str(wat).unwrap()).unwrap();
        module_instantiate(s, module_validate(m).unwrap(), &[]).unwrap()
    }

    fn invoke(s: &mut Store, i: ModuleAddr, name: &str, args: &[Val]) -> Result<Vec<Val>, Error> {
        let ExternVal::Func(f) = instance_export(s, i, name)? else {
            panic!("`{name}` is not a function")
        };
        func_invoke(s, f, args)
    }

    #[test]
    fn add_wraps() {
        let mut s = store_init();
        let i = instantiate(
            &mut s,
            r#"(module
                (func (export "add") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add))"#,
        );
        assert_eq!(
            invoke(&mut s, i, "add", &[Val::from(3i32), Val::from(4i32)]).unwrap(),
            vec![Val::from(7i32)]
        );
        assert_eq!(
            invoke(&mut s, i, "add", &[Val::from(0x7fff_ffffi32), Val::from(1i32)]).unwrap(),
            vec![Val::from(i32::MIN)]
        );
    }

    #[test]
    fn call_between_functions() {
        let mut s = store_init();
        let i = instantiate(
            &mut s,
            r#"(module
                (func $getAnswer (result i32) i32.const 42)
                (func (export "getAnswerPlus1") (result i32)
                    call $getAnswer
                    i32.const 1
                    i32.add))"#,
        );
        assert_eq!(
            invoke(&mut s, i, "getAnswerPlus1", &[]).unwrap(),
            vec![Val::from(43i32)]
        );
    }

    #[test]
    fn locals_start_at_zero() {
        let mut s = store_init();
        let i = instantiate(
            &mut s,
            r#"(module
                (func (export "f") (result i32) (local i32) local.get 0)
                (func (export "g") (result f64) (local i64 f64) local.get 1))"#,
        );
        assert_eq!(invoke(&mut s, i, "f", &[]).unwrap(), vec![Val::from(0i32)]);
        assert_eq!(invoke(&mut s, i, "g", &[]).unwrap(), vec![Val::from(0.0f64)]);
    }

    #[test]
    fn memory_bounds() {
        let mut s = store_init();
        let i = instantiate(
            &mut s,
            r#"(module
                (memory 1)
                (func (export "load16") (param i32) (result i32)
                    local.get 0
                    i32.load16_u)
                (func (export "load32") (param i32) (result i32)
                    local.get 0
                    i32.load))"#,
        );
        let at = |s: &mut Store, name: &str, addr: i32| invoke(s, i, name, &[Val::from(addr)]);

        assert_eq!(at(&mut s, "load16", 65_533).unwrap(), vec![Val::from(0i32)]);
        let err = at(&mut s, "load16", 65_535).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Trap);
        assert_eq!(err.trap(), Some(&TrapKind::OutOfBoundsMemory));

        assert_eq!(at(&mut s, "load32", 65_532).unwrap(), vec![Val::from(0i32)]);
        assert_eq!(
            at(&mut s, "load32", 65_533).unwrap_err().trap(),
            Some(&TrapKind::OutOfBoundsMemory)
        );
    }

    #[test]
    fn indirect_call_type_mismatch() {
        let mut s = store_init();
        let i = instantiate(
            &mut s,
            r#"(module
                (type $nullary (func (result i32)))
                (table 1 funcref)
                (elem (i32.const 0) $inc)
                (func $inc (param i32) (result i32) local.get 0 i32.const 1 i32.add)
                (func (export "call") (result i32)
                    i32.const 0
                    call_indirect (type $nullary)))"#,
        );
        let err = invoke(&mut s, i, "call", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Trap);
        assert_eq!(err.trap(), Some(&TrapKind::IndirectCallTypeMismatch));
    }

    #[test]
    fn start_function_runs() {
        let mut s = store_init();
        let i = instantiate(
            &mut s,
            r#"(module
                (global $g (mut i32) (i32.const 0))
                (func $init i32.const 0x2a global.set $g)
                (func (export "get") (result i32) global.get $g)
                (start $init))"#,
        );
        assert_eq!(invoke(&mut s, i, "get", &[]).unwrap(), vec![Val::from(0x2ai32)]);
    }

    #[test]
    fn duplicate_export_is_rejected() {
        let bytes = [
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // preamble
            0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type: [] -> []
            0x03, 0x02, 0x01, 0x00, // function: type 0
            0x07, 0x09, 0x02, 0x01, b'a', 0x00, 0x00, 0x01, b'a', 0x00, 0x00, // export "a" twice
            0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b, // code: empty body
        ];
        let m = module_decode(&bytes).unwrap();
        assert_eq!(module_exports(&m).len(), 2);

        let err = module_validate(m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            err.validation().map(validation::Error::kind),
            Some(&ValidationErrorKind::DuplicateExport("a".into()))
        );
        assert_eq!(
            err.to_string(),
            "invalid module: duplicate export name `a` in export 1"
        );
    }

    #[test]
    fn error_kinds() {
        let err = module_decode(b"\0asm\x02\0\0\0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedBinary);

        let mut s = store_init();
        let m = module_decode(
            &wat::parse_str(
                r#"(module
                    (import "env" "log" (func $log (param i32)))
                    (memory 1)
                    (data (i32.const 65536) "x")
                    (func (export "run") i32.const 1 call $log))"#,
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(module_imports(&m)[0].1, "log");

        let err = module_instantiate(&mut s, module_validate(m.clone()).unwrap(), &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Link);

        let log = func_alloc(&mut s, FuncTy::from_slices(&[ValTy::I32], &[]), |_| {
            Err(HostcodeError::new("no output"))
        });
        let err = module_instantiate(&mut s, module_validate(m).unwrap(), &[log.into()])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstantiationTrap);

        let m = module_decode(
            &wat::parse_str(
                r#"(module
                    (import "env" "log" (func $log (param i32)))
                    (func (export "run") i32.const 1 call $log))"#,
            )
            .unwrap(),
        )
        .unwrap();
        let i = module_instantiate(&mut s, module_validate(m).unwrap(), &[log.into()]).unwrap();
        let err = invoke(&mut s, i, "run", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Host);
        assert!(err.to_string().starts_with("host error: "));

        assert_eq!(instance_export(&s, i, "nope").unwrap_err().kind(), ErrorKind::Link);
        assert_eq!(
            invoke(&mut s, i, "run", &[Val::from(1i32)]).unwrap_err().kind(),
            ErrorKind::Link
        );
    }

    #[test]
    fn store_objects() {
        let mut s = store_init();
        let mem = mem_alloc(
            &mut s,
            MemTy {
                lim: Limits {
                    min: 1,
                    max: Some(2),
                },
            },
        )
        .unwrap();
        mem_write(&mut s, mem, 10, 0xab).unwrap();
        assert_eq!(mem_read(&s, mem, 10).unwrap(), 0xab);
        assert!(mem_read(&s, mem, 65_536).is_err());
        assert_eq!(mem_grow(&mut s, mem, 1).unwrap(), Some(1));
        assert_eq!(mem_size(&s, mem).unwrap(), 2);
        assert_eq!(mem_grow(&mut s, mem, 1).unwrap(), None);
        assert_eq!(mem_size(&s, mem).unwrap(), 2);
        assert_eq!(mem_type(&s, mem).unwrap().lim.max, Some(2));

        let g = global_alloc(
            &mut s,
            GlobalTy {
                m: Mut::Var,
                t: ValTy::F32,
            },
            Val::from(1.0f32),
        )
        .unwrap();
        global_write(&mut s, g, Val::from(2.0f32)).unwrap();
        assert_eq!(global_read(&s, g).unwrap(), Val::from(2.0f32));
        assert!(global_write(&mut s, g, Val::from(2i32)).is_err());
        assert_eq!(global_type(&s, g).unwrap().t, ValTy::F32);

        let ty = TableTy {
            elem_ty: crate::module::ty::RefTy::FuncRef,
            lim: Limits { min: 2, max: None },
        };
        let t = table_alloc(&mut s, ty, Ref::Null(ty.elem_ty)).unwrap();
        let f = func_alloc(&mut s, FuncTy::default(), |_| Ok(Vec::new()));
        table_write(&mut s, t, 1, Ref::Func(f)).unwrap();
        assert_eq!(table_read(&s, t, 1).unwrap(), Ref::Func(f));
        assert_eq!(table_grow(&mut s, t, 3, Ref::Null(ty.elem_ty)).unwrap(), Some(2));
        assert_eq!(table_size(&s, t).unwrap(), 5);
        assert_eq!(table_type(&s, t).unwrap(), ty);
        assert_eq!(func_type(&s, f).unwrap(), FuncTy::default());
        assert!(func_invoke(&mut s, f, &[]).unwrap().is_empty());
    }

    #[test]
    fn grow_and_alloc_errors() {
        let mut s = store_init();
        s.set_config(Config::default().max_memory_pages(1).max_table_size(2));
        let mem = mem_alloc(
            &mut s,
            MemTy {
                lim: Limits { min: 1, max: None },
            },
        )
        .unwrap();
        assert_eq!(mem_grow(&mut s, mem, 1).unwrap(), None);

        let err = mem_alloc(
            &mut s,
            MemTy {
                lim: Limits { min: 2, max: None },
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Trap);

        let ty = TableTy {
            elem_ty: crate::module::ty::RefTy::ExternRef,
            lim: Limits { min: 3, max: None },
        };
        let err = table_alloc(&mut s, ty, Ref::Null(ty.elem_ty)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Trap);

        let mut other = store_init();
        let empty = MemTy {
            lim: Limits { min: 0, max: None },
        };
        mem_alloc(&mut other, empty).unwrap();
        let stray = mem_alloc(&mut other, empty).unwrap();
        assert_eq!(mem_grow(&mut s, stray, 1).unwrap_err().kind(), ErrorKind::Link);
    }
}
