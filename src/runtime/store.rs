//! The store: global registry owning every runtime instance.
//!
//! Entities live in monotonically indexed arenas and never move once
//! allocated; cross-entity links are plain addresses into these arenas.

use std::collections::HashMap;

use log::debug;

use crate::error::BadAddress;
use crate::model::{FuncType, GlobalType, MemoryType, TableType, Value};

use super::{
    global::GlobalInstance,
    instances::{FuncBody, FunctionInstance, ModuleInstance},
    memory::MemoryInstance,
    table::TableInstance,
    FuncAddr, GlobalAddr, MemAddr, ModuleAddr, TableAddr,
};

/// Arena lengths at a point in time; used to unwind a failed instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    funcs: usize,
    tables: usize,
    mems: usize,
    globals: usize,
    modules: usize,
}

#[derive(Debug, Default)]
pub struct Store {
    funcs: Vec<FunctionInstance>,
    tables: Vec<TableInstance>,
    mems: Vec<MemoryInstance>,
    globals: Vec<GlobalInstance>,
    modules: Vec<ModuleInstance>,
    /// Names published by user-facing instantiation.
    named: HashMap<String, ModuleAddr>,
    /// Names published by host/import registration.
    registered: HashMap<String, ModuleAddr>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Purge every arena and both name indices. Used between top-level
    /// instantiations of a fresh program.
    pub fn reset(&mut self) {
        debug!("store reset: purging {} modules", self.modules.len());
        self.funcs.clear();
        self.tables.clear();
        self.mems.clear();
        self.globals.clear();
        self.modules.clear();
        self.named.clear();
        self.registered.clear();
    }

    /* ---------- Module arena ---------- */

    /// Append an instance destined for the instantiation name bucket.
    pub fn push_module(&mut self, inst: ModuleInstance) -> ModuleAddr {
        self.insert_module(inst, false)
    }

    /// Append an instance destined for the registration name bucket.
    pub fn import_module(&mut self, inst: ModuleInstance) -> ModuleAddr {
        self.insert_module(inst, true)
    }

    fn insert_module(&mut self, mut inst: ModuleInstance, registered: bool) -> ModuleAddr {
        let addr = self.modules.len() as ModuleAddr;
        inst.addr = addr;
        inst.registered = registered;
        self.modules.push(inst);
        addr
    }

    /// Bind the instance's name into the bucket chosen when it entered the
    /// arena. Called once the instance is fully formed.
    pub fn publish_module_name(&mut self, addr: ModuleAddr) -> Result<(), BadAddress> {
        let inst = self.get_module(addr)?;
        let (name, registered) = (inst.name.clone(), inst.registered);
        if registered {
            self.registered.insert(name, addr);
        } else {
            self.named.insert(name, addr);
        }
        Ok(())
    }

    /// O(1) lookup across both name buckets.
    pub fn find_module(&self, name: &str) -> Option<ModuleAddr> {
        self.named
            .get(name)
            .or_else(|| self.registered.get(name))
            .copied()
    }

    /* ---------- Allocation ---------- */

    pub fn allocate_function(
        &mut self,
        ty: FuncType,
        module: ModuleAddr,
        body: FuncBody,
    ) -> FuncAddr {
        let addr = self.funcs.len() as FuncAddr;
        self.funcs.push(FunctionInstance::new(ty, module, body));
        addr
    }

    pub fn allocate_table(&mut self, ty: &TableType) -> TableAddr {
        let addr = self.tables.len() as TableAddr;
        self.tables.push(TableInstance::new(ty));
        addr
    }

    pub fn allocate_memory(&mut self, ty: &MemoryType) -> MemAddr {
        let addr = self.mems.len() as MemAddr;
        self.mems.push(MemoryInstance::new(ty));
        addr
    }

    pub fn allocate_global(&mut self, ty: GlobalType, init: Value) -> GlobalAddr {
        let addr = self.globals.len() as GlobalAddr;
        self.globals.push(GlobalInstance::new(ty, init));
        addr
    }

    /* ---------- Checked access ---------- */

    pub fn get_module(&self, addr: ModuleAddr) -> Result<&ModuleInstance, BadAddress> {
        self.modules.get(addr as usize).ok_or(BadAddress {
            space: "module",
            addr,
        })
    }

    pub fn get_module_mut(&mut self, addr: ModuleAddr) -> Result<&mut ModuleInstance, BadAddress> {
        self.modules.get_mut(addr as usize).ok_or(BadAddress {
            space: "module",
            addr,
        })
    }

    pub fn get_function(&self, addr: FuncAddr) -> Result<&FunctionInstance, BadAddress> {
        self.funcs.get(addr as usize).ok_or(BadAddress {
            space: "function",
            addr,
        })
    }

    pub fn get_table(&self, addr: TableAddr) -> Result<&TableInstance, BadAddress> {
        self.tables.get(addr as usize).ok_or(BadAddress {
            space: "table",
            addr,
        })
    }

    pub fn get_table_mut(&mut self, addr: TableAddr) -> Result<&mut TableInstance, BadAddress> {
        self.tables.get_mut(addr as usize).ok_or(BadAddress {
            space: "table",
            addr,
        })
    }

    pub fn get_memory(&self, addr: MemAddr) -> Result<&MemoryInstance, BadAddress> {
        self.mems.get(addr as usize).ok_or(BadAddress {
            space: "memory",
            addr,
        })
    }

    pub fn get_memory_mut(&mut self, addr: MemAddr) -> Result<&mut MemoryInstance, BadAddress> {
        self.mems.get_mut(addr as usize).ok_or(BadAddress {
            space: "memory",
            addr,
        })
    }

    pub fn get_global(&self, addr: GlobalAddr) -> Result<&GlobalInstance, BadAddress> {
        self.globals.get(addr as usize).ok_or(BadAddress {
            space: "global",
            addr,
        })
    }

    pub fn get_global_mut(&mut self, addr: GlobalAddr) -> Result<&mut GlobalInstance, BadAddress> {
        self.globals.get_mut(addr as usize).ok_or(BadAddress {
            space: "global",
            addr,
        })
    }

    /* ---------- Transaction support ---------- */

    /// Record current arena lengths. Entities allocated after the checkpoint
    /// can be reclaimed with [`Store::rollback`] as long as no address has
    /// been published.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            funcs: self.funcs.len(),
            tables: self.tables.len(),
            mems: self.mems.len(),
            globals: self.globals.len(),
            modules: self.modules.len(),
        }
    }

    /// Discard every entity allocated since `cp`. Name buckets are untouched;
    /// publication only ever happens after the transaction commits.
    pub fn rollback(&mut self, cp: Checkpoint) {
        debug!(
            "store rollback: reclaiming {} functions, {} tables, {} memories, {} globals, {} modules",
            self.funcs.len() - cp.funcs,
            self.tables.len() - cp.tables,
            self.mems.len() - cp.mems,
            self.globals.len() - cp.globals,
            self.modules.len() - cp.modules,
        );
        self.funcs.truncate(cp.funcs);
        self.tables.truncate(cp.tables);
        self.mems.truncate(cp.mems);
        self.globals.truncate(cp.globals);
        self.modules.truncate(cp.modules);
    }

    /* ---------- Observability ---------- */

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn function_count(&self) -> usize {
        self.funcs.len()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn memory_count(&self) -> usize {
        self.mems.len()
    }

    pub fn global_count(&self) -> usize {
        self.globals.len()
    }
}
