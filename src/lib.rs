//! reefwasm: a stack-based WebAssembly MVP execution engine.
//!
//! Loads binary modules, validates them, instantiates them against a store of
//! host and previously instantiated modules, and executes their functions.
//! The store owns every runtime entity; module instances link to each other
//! only through stable store addresses, so instantiation can roll back a
//! failed module without disturbing anything already published.

pub mod aot;
pub mod binary;
pub mod error;
pub mod host;
pub mod instantiate;
pub mod model;
pub mod runtime;
pub mod validate;
pub mod vm;

pub use binary::LoadError;
pub use error::{InstantiateError, Trap, ValidationError};
pub use host::HostModuleBuilder;
pub use instantiate::InstantiateMode;
pub use model::{Module, ValType, Value};
pub use runtime::{ModuleAddr, Store};

use model::ExternKind;
use vm::Stack;

/// Parse a binary module into its AST.
pub fn parse(bytes: &[u8]) -> Result<Module, LoadError> {
    binary::decode_module(bytes)
}

/// Structurally validate a parsed module.
pub fn validate(module: &Module) -> Result<(), ValidationError> {
    validate::validate_module(module)
}

/// Instantiate a module under `name`. On success the instance is published
/// and its address returned; on failure the store is left untouched.
pub fn instantiate(
    store: &mut Store,
    module: &Module,
    name: &str,
) -> Result<ModuleAddr, InstantiateError> {
    instantiate::instantiate_module(store, module, name, InstantiateMode::Instantiate)
}

/// Instantiate a module and publish it through the registration bucket, so
/// other modules can import against it. Behaviorally identical to
/// [`instantiate`] apart from the name bucket.
pub fn register_module(
    store: &mut Store,
    module: &Module,
    name: &str,
) -> Result<ModuleAddr, InstantiateError> {
    instantiate::instantiate_module(store, module, name, InstantiateMode::Import)
}

/// Invoke an exported function of a published module by name.
pub fn invoke_export(
    store: &mut Store,
    module: &str,
    export: &str,
    args: &[Value],
) -> Result<Option<Value>, Trap> {
    let addr = store
        .find_module(module)
        .ok_or_else(|| Trap::UnknownExport(module.to_string()))?;
    let (kind, faddr) = store
        .get_module(addr)?
        .export_addr(export)
        .ok_or_else(|| Trap::UnknownExport(format!("{module}.{export}")))?;
    if kind != ExternKind::Func {
        return Err(Trap::NotAFunction(export.to_string()));
    }
    let mut stack = Stack::new();
    vm::run_function(store, &mut stack, faddr, args)
}
