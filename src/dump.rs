//! Human readable summaries of a decoded module.

use core::fmt;

use crate::module::{ImportDesc, Module};

/// Summary of a module's contents, one entity per line.
#[derive(Debug, Clone, Copy)]
pub struct Summary<'a>(&'a Module);

/// Table of the sections in the binary with payload offsets and sizes.
#[derive(Debug, Clone, Copy)]
pub struct Sections<'a>(&'a Module);

/// Formats the contents of `module`.
#[must_use]
pub fn summary(module: &Module) -> Summary<'_> {
    Summary(module)
}

/// Formats the section layout of `module`.
#[must_use]
pub fn sections(module: &Module) -> Sections<'_> {
    Sections(module)
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;

        writeln!(f, "types: {}", m.types.len())?;
        for (i, ty) in m.types.iter().enumerate() {
            writeln!(f, "  {i}: {ty}")?;
        }

        writeln!(f, "imports: {}", m.imports.len())?;
        for (i, (module, name, ty)) in m.import_external_tys().enumerate() {
            writeln!(f, "  {i}: {module}.{name} {ty}")?;
        }

        let imported = m.imported_funcs().count();
        writeln!(f, "functions: {} ({imported} imported)", imported + m.funcs.len())?;
        for (i, func) in m.funcs.iter().enumerate() {
            writeln!(
                f,
                "  {}: type {}, {} locals, {} instructions",
                imported + i,
                func.ty,
                func.locals.len(),
                func.body.instrs.len()
            )?;
        }

        writeln!(f, "tables: {}", m.table_tys().count())?;
        for (i, ty) in m.table_tys().enumerate() {
            writeln!(f, "  {i}: {} {}", ty.elem_ty, ty.lim)?;
        }

        writeln!(f, "memories: {}", m.mem_tys().count())?;
        for (i, ty) in m.mem_tys().enumerate() {
            writeln!(f, "  {i}: {}", ty.lim)?;
        }

        let imported_globals = m
            .imports
            .iter()
            .filter(|i| matches!(i.desc, ImportDesc::Global(_)))
            .count();
        writeln!(f, "globals: {}", imported_globals + m.globals.len())?;
        for (i, global) in m.globals.iter().enumerate() {
            writeln!(f, "  {}: {}", imported_globals + i, global.ty)?;
        }

        writeln!(f, "exports: {}", m.exports.len())?;
        for (name, ty) in m.export_external_tys() {
            writeln!(f, "  \"{name}\" {ty}")?;
        }

        if let Some(start) = m.start {
            writeln!(f, "start: {start}")?;
        }
        writeln!(f, "elements: {}", m.elems.len())?;
        writeln!(f, "data: {}", m.datas.len())?;
        for custom in &m.customs {
            writeln!(f, "custom \"{}\": {} bytes", custom.name, custom.data.len())?;
        }
        Ok(())
    }
}

impl fmt::Display for Sections<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>2}  {:<8}  {:>10}  {:>10}", "id", "name", "offset", "size")?;
        for section in &self.0.sections {
            writeln!(
                f,
                "{:>2}  {:<8}  {:>#10x}  {:>10}",
                section.id,
                section.name(),
                section.offset,
                section.size
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::binary;

    fn module(wat: &str) -> Module {
        binary::from_slice(&wat::parse_str(wat).unwrap()).unwrap()
    }

    #[test]
    fn summary_lists_entities() {
        let m = module(
            r#"(module
                (import "env" "log" (func))
                (memory 1 2)
                (global i64 (i64.const 3))
                (func (export "add") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add)
                (start 0))"#,
        );
        let text = summary(&m).to_string();

        assert!(text.contains("types: 2\n"), "{text}");
        assert!(text.contains("  0: env.log func [] -> []\n"), "{text}");
        assert!(text.contains("functions: 2 (1 imported)\n"), "{text}");
        assert!(text.contains("  1: type 1, 0 locals, 4 instructions\n"), "{text}");
        assert!(text.contains("memories: 1\n  0: min=1 max=2\n"), "{text}");
        assert!(text.contains("globals: 1\n  0: i64\n"), "{text}");
        assert!(text.contains("  \"add\" func [i32 i32] -> [i32]\n"), "{text}");
        assert!(text.contains("start: 0\n"), "{text}");
    }

    #[test]
    fn section_table() {
        let bytes = [
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // preamble
            0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type
            0x03, 0x02, 0x01, 0x00, // function
            0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b, // code
        ];
        let m = binary::from_slice(&bytes).unwrap();
        let text = sections(&m).to_string();
        let lines = text.lines().collect::<Vec<_>>();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], " 1  type             0xa           4");
        assert_eq!(lines[2], " 3  function        0x10           2");
        assert_eq!(lines[3], "10  code            0x14           4");
    }
}
