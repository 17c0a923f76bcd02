//! Function and module instance records owned by the store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::host::HostFunc;
use crate::model::{ExternKind, FuncIdx, FuncType, LocalDecl, TypeIdx, ValType};

use super::{FuncAddr, GlobalAddr, MemAddr, ModuleAddr, TableAddr};

/// Executable payload of a function instance.
#[derive(Clone)]
pub enum FuncBody {
    /// Locally defined body: declared locals plus raw instruction bytes.
    Wasm {
        locals: Vec<LocalDecl>,
        code: Arc<[u8]>,
    },
    /// Host-provided callable.
    Host(Arc<HostFunc>),
}

/// A function instance: its resolved signature, the module it belongs to, and
/// the body to execute.
#[derive(Clone)]
pub struct FunctionInstance {
    ty: FuncType,
    module: ModuleAddr,
    body: FuncBody,
}

impl FunctionInstance {
    pub fn new(ty: FuncType, module: ModuleAddr, body: FuncBody) -> Self {
        Self { ty, module, body }
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    pub fn module(&self) -> ModuleAddr {
        self.module
    }

    pub fn body(&self) -> &FuncBody {
        &self.body
    }
}

impl std::fmt::Debug for FunctionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("FunctionInstance");
        d.field("ty", &self.ty).field("module", &self.module);
        match &self.body {
            FuncBody::Wasm { code, .. } => d.field("code_len", &code.len()).finish(),
            FuncBody::Host(_) => d.field("body", &"host").finish(),
        }
    }
}

/// Export record inside a module instance: the kind tag plus the local index
/// into the instance's address space for that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportEntry {
    pub kind: ExternKind,
    pub index: u32,
}

/// The runtime image of a module: resolved imports, allocated entities, and
/// published exports. Cross-entity links are store addresses; the store owns
/// everything.
#[derive(Debug, Clone, Default)]
pub struct ModuleInstance {
    pub name: String,
    /// This instance's own address in the store's module arena.
    pub addr: ModuleAddr,
    /// Function-type table copied from the module's type section.
    pub types: Vec<FuncType>,
    /// Address spaces, imports first, locally defined entities after.
    pub func_addrs: Vec<FuncAddr>,
    pub table_addrs: Vec<TableAddr>,
    pub mem_addrs: Vec<MemAddr>,
    pub global_addrs: Vec<GlobalAddr>,
    /// Export name to (kind, local index).
    pub exports: HashMap<String, ExportEntry>,
    pub start: Option<FuncIdx>,
    /// True when the instance entered the store through the registration
    /// bucket; decides which name index publication uses.
    pub(crate) registered: bool,
}

impl ModuleInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Append one signature to the instance's function-type table.
    pub fn add_func_type(&mut self, params: Vec<ValType>, results: Vec<ValType>) {
        self.types.push(FuncType { params, results });
    }

    pub fn func_type(&self, idx: TypeIdx) -> Option<&FuncType> {
        self.types.get(idx as usize)
    }

    pub fn export(&self, name: &str) -> Option<&ExportEntry> {
        self.exports.get(name)
    }

    /// Resolve an export name to the store address of the exported entity.
    pub fn export_addr(&self, name: &str) -> Option<(ExternKind, u32)> {
        let entry = self.exports.get(name)?;
        let space = match entry.kind {
            ExternKind::Func => &self.func_addrs,
            ExternKind::Table => &self.table_addrs,
            ExternKind::Memory => &self.mem_addrs,
            ExternKind::Global => &self.global_addrs,
        };
        space.get(entry.index as usize).map(|&a| (entry.kind, a))
    }
}
