//! Crate-level error types for validation, instantiation, and execution.

use thiserror::Error;

/// A store lookup hit an address that is not populated. This indicates a
/// broken engine invariant rather than a user error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no {space} instance at address {addr}")]
pub struct BadAddress {
    pub space: &'static str,
    pub addr: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{space} index {index} out of range")]
    IndexOutOfRange { space: &'static str, index: u32 },

    #[error("duplicate export name `{0}`")]
    DuplicateExportName(String),

    #[error("at most one memory is supported")]
    MultipleMemories,

    #[error("function and code section lengths differ")]
    FunctionCodeMismatch,

    #[error("limit minimum {min} exceeds maximum {max}")]
    LimitInverted { min: u32, max: u32 },

    #[error("start function must take no parameters and return nothing")]
    StartSignature,

    #[error("function body missing terminating end opcode")]
    UnterminatedBody,
}

/// Failure of the instantiation pipeline. Any of these leaves the store in
/// the state it held before the call: the module name stays unbound and every
/// entity allocated on behalf of the failed instance is reclaimed.
#[derive(Debug, Error)]
pub enum InstantiateError {
    #[error("module name `{0}` already exists in the store")]
    ModuleNameConflict(String),

    #[error("unknown import {module}.{name}")]
    UnknownImport { module: String, name: String },

    #[error("incompatible import type for {module}.{name}: expected {expected}, found {found}")]
    IncompatibleImportType {
        module: String,
        name: String,
        expected: String,
        found: String,
    },

    #[error("invalid initializer expression: {0}")]
    InvalidInitializer(&'static str),

    #[error("element segment out of range: offset {offset} + {len} exceeds table size {size}")]
    TableOutOfRange { offset: u32, len: u32, size: u32 },

    #[error("data segment out of range: offset {offset} + {len} exceeds memory size {size}")]
    MemoryOutOfRange { offset: u32, len: u32, size: u64 },

    #[error("duplicate export name `{0}`")]
    DuplicateExportName(String),

    #[error(transparent)]
    BadAddress(#[from] BadAddress),

    #[error("start function trapped")]
    StartTrap(#[source] Trap),
}

/// Runtime trap raised by the interpreter or by stack discipline violations.
#[derive(Debug, Error)]
pub enum Trap {
    #[error("unreachable executed")]
    Unreachable,

    #[error("out of bounds memory access")]
    MemoryOutOfBounds,

    #[error("integer divide by zero")]
    DivideByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("undefined table element")]
    UndefinedElement,

    #[error("uninitialized table element")]
    UninitializedElement,

    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,

    #[error("value stack underflow")]
    StackUnderflow,

    #[error("no active call frame")]
    NoActiveFrame,

    #[error("type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("argument count mismatch: expected {expected}, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("write to immutable global")]
    ImmutableGlobal,

    #[error("unknown module or export `{0}`")]
    UnknownExport(String),

    #[error("export `{0}` is not a function")]
    NotAFunction(String),

    #[error("malformed code: {0}")]
    MalformedCode(&'static str),

    #[error(transparent)]
    BadAddress(#[from] BadAddress),
}
