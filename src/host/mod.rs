//! Host module construction and registration.
//!
//! A host module enters the store through the registration bucket so other
//! modules can import against it; its functions are native callables and its
//! tables, memories, and globals are allocated like any other instance's.

use std::sync::Arc;

use crate::error::{InstantiateError, Trap};
use crate::model::{ExternKind, FuncType, GlobalType, MemoryType, TableType, Value};
use crate::runtime::{ExportEntry, FuncBody, ModuleAddr, ModuleInstance, Store};

/// Native callable exposed to module code. At most one return value.
pub type HostFunc = dyn Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync;

/// Builder collecting named host entities; [`HostModuleBuilder::register`]
/// allocates them and publishes the module.
pub struct HostModuleBuilder {
    name: String,
    funcs: Vec<(String, FuncType, Arc<HostFunc>)>,
    tables: Vec<(String, TableType)>,
    memories: Vec<(String, MemoryType)>,
    globals: Vec<(String, GlobalType, Value)>,
}

impl HostModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn func<F>(mut self, name: impl Into<String>, ty: FuncType, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync + 'static,
    {
        self.funcs.push((name.into(), ty, Arc::new(f)));
        self
    }

    pub fn table(mut self, name: impl Into<String>, ty: TableType) -> Self {
        self.tables.push((name.into(), ty));
        self
    }

    pub fn memory(mut self, name: impl Into<String>, ty: MemoryType) -> Self {
        self.memories.push((name.into(), ty));
        self
    }

    pub fn global(mut self, name: impl Into<String>, ty: GlobalType, value: Value) -> Self {
        self.globals.push((name.into(), ty, value));
        self
    }

    /// Allocate every collected entity, publish the exports, and bind the
    /// module name through the registration bucket. Rolls the store back on
    /// any failure.
    pub fn register(self, store: &mut Store) -> Result<ModuleAddr, InstantiateError> {
        if store.find_module(&self.name).is_some() {
            return Err(InstantiateError::ModuleNameConflict(self.name));
        }
        let checkpoint = store.checkpoint();
        match self.build(store) {
            Ok(addr) => {
                store.publish_module_name(addr)?;
                Ok(addr)
            }
            Err(err) => {
                store.rollback(checkpoint);
                Err(err)
            }
        }
    }

    fn build(self, store: &mut Store) -> Result<ModuleAddr, InstantiateError> {
        let addr = store.import_module(ModuleInstance::new(&self.name));

        for (name, ty, f) in self.funcs {
            let faddr = store.allocate_function(ty, addr, FuncBody::Host(f));
            let inst = store.get_module_mut(addr)?;
            let index = inst.func_addrs.len() as u32;
            inst.func_addrs.push(faddr);
            insert_export(inst, name, ExternKind::Func, index)?;
        }
        for (name, ty) in self.tables {
            let taddr = store.allocate_table(&ty);
            let inst = store.get_module_mut(addr)?;
            let index = inst.table_addrs.len() as u32;
            inst.table_addrs.push(taddr);
            insert_export(inst, name, ExternKind::Table, index)?;
        }
        for (name, ty) in self.memories {
            let maddr = store.allocate_memory(&ty);
            let inst = store.get_module_mut(addr)?;
            let index = inst.mem_addrs.len() as u32;
            inst.mem_addrs.push(maddr);
            insert_export(inst, name, ExternKind::Memory, index)?;
        }
        for (name, ty, value) in self.globals {
            let gaddr = store.allocate_global(ty, value);
            let inst = store.get_module_mut(addr)?;
            let index = inst.global_addrs.len() as u32;
            inst.global_addrs.push(gaddr);
            insert_export(inst, name, ExternKind::Global, index)?;
        }

        Ok(addr)
    }
}

fn insert_export(
    inst: &mut ModuleInstance,
    name: String,
    kind: ExternKind,
    index: u32,
) -> Result<(), InstantiateError> {
    if inst
        .exports
        .insert(name.clone(), ExportEntry { kind, index })
        .is_some()
    {
        return Err(InstantiateError::DuplicateExportName(name));
    }
    Ok(())
}
