//! Module-level AST: sections, expressions, function bodies, and segments.

use crate::aot::ModuleCtor;

use super::types::{
    Export, FuncIdx, FuncType, GlobalType, Import, MemIdx, MemoryType, TableIdx, TableType,
    TypeIdx, ValType,
};

/// Local declarations inside a function body: `count` repetitions of one
/// value type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalDecl {
    pub count: u32,
    pub val_type: ValType,
}

/// Raw initializer expression: the instruction bytes including the
/// terminating `end`. Decoded by the constant evaluator at instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Expr {
    pub body: Vec<u8>,
}

/// Body of a locally defined function: local declarations plus raw
/// instruction bytes terminated by `end`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Code {
    pub locals: Vec<LocalDecl>,
    pub body: Vec<u8>,
}

/// Global definition: type plus initializer expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub ty: GlobalType,
    pub init: Expr,
}

/// Active element segment: writes function indices into a table at an offset
/// computed from the initializer expression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ElementSegment {
    pub table: TableIdx,
    pub offset: Expr,
    pub init: Vec<FuncIdx>,
}

/// Active data segment: writes bytes into a memory at an offset computed from
/// the initializer expression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataSegment {
    pub memory: MemIdx,
    pub offset: Expr,
    pub init: Vec<u8>,
}

/// A parsed module: a bag of optional sections, immutable after loading.
///
/// Section order within each vector matches the binary. An empty vector means
/// the section was absent; the accessors surface that as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    /// Type indices for each locally defined function, in declaration order.
    pub func_type_indices: Vec<TypeIdx>,
    pub tables: Vec<TableType>,
    pub memories: Vec<MemoryType>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<FuncIdx>,
    pub elements: Vec<ElementSegment>,
    /// Bodies for locally defined functions; length equals
    /// `func_type_indices.len()`.
    pub codes: Vec<Code>,
    pub data: Vec<DataSegment>,

    // Import counts per kind, precomputed by the loader for index-space
    // arithmetic.
    pub imported_funcs: u32,
    pub imported_tables: u32,
    pub imported_memories: u32,
    pub imported_globals: u32,

    /// Constructor of an ahead-of-time-compiled rendition of this module, if
    /// one was attached by a compilation backend.
    pub ctor: Option<ModuleCtor>,
}

impl Module {
    pub fn get_type_section(&self) -> Option<&[FuncType]> {
        non_empty(&self.types)
    }

    pub fn get_import_section(&self) -> Option<&[Import]> {
        non_empty(&self.imports)
    }

    pub fn get_function_section(&self) -> Option<&[TypeIdx]> {
        non_empty(&self.func_type_indices)
    }

    pub fn get_code_section(&self) -> Option<&[Code]> {
        non_empty(&self.codes)
    }

    pub fn get_table_section(&self) -> Option<&[TableType]> {
        non_empty(&self.tables)
    }

    pub fn get_memory_section(&self) -> Option<&[MemoryType]> {
        non_empty(&self.memories)
    }

    pub fn get_global_section(&self) -> Option<&[Global]> {
        non_empty(&self.globals)
    }

    pub fn get_export_section(&self) -> Option<&[Export]> {
        non_empty(&self.exports)
    }

    pub fn get_element_section(&self) -> Option<&[ElementSegment]> {
        non_empty(&self.elements)
    }

    pub fn get_data_section(&self) -> Option<&[DataSegment]> {
        non_empty(&self.data)
    }

    pub fn get_start_section(&self) -> Option<FuncIdx> {
        self.start
    }

    pub fn get_ctor(&self) -> Option<ModuleCtor> {
        self.ctor
    }

    /// Total function count including imports.
    pub fn total_funcs(&self) -> u32 {
        self.imported_funcs + self.func_type_indices.len() as u32
    }

    pub fn total_tables(&self) -> u32 {
        self.imported_tables + self.tables.len() as u32
    }

    pub fn total_memories(&self) -> u32 {
        self.imported_memories + self.memories.len() as u32
    }

    pub fn total_globals(&self) -> u32 {
        self.imported_globals + self.globals.len() as u32
    }
}

fn non_empty<T>(v: &[T]) -> Option<&[T]> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}
