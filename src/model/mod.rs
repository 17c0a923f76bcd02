//! AST surface: the types and module representation produced by the loader.

pub mod module;
pub mod types;

pub use module::{Code, DataSegment, ElementSegment, Expr, Global, LocalDecl, Module};
pub use types::{
    Export, ExportDesc, ExternKind, FuncIdx, FuncType, GlobalIdx, GlobalType, Import, ImportDesc,
    Limits, MemIdx, MemoryType, RefType, TableIdx, TableType, TypeIdx, ValType, Value,
};
