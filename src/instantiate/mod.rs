//! The module instantiation pipeline.
//!
//! Consumes a parsed module plus a target instance name and populates the
//! store: type installation, import resolution, entity allocation,
//! initializer evaluation, segment application, export publication, the
//! compiled-constructor hook, and the start function. The whole pipeline is
//! one transaction: on any failure the store is rewound to its state before
//! the call and the instance name is never bound.

mod eval;
mod matcher;

use log::debug;

use crate::aot;
use crate::error::{BadAddress, InstantiateError};
use crate::model::{ExternKind, Module, Value};
use crate::runtime::{FuncAddr, FuncBody, MemAddr, ModuleAddr, ModuleInstance, Store, TableAddr};
use crate::vm::{self, Stack};

/// Which name bucket publication uses. `Instantiate` is the user-facing
/// entry; `Import` registers a module for others to import against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstantiateMode {
    Instantiate,
    Import,
}

/// Run the pipeline. Returns the fresh instance's module address; on error
/// the store is left exactly as it was.
pub fn instantiate_module(
    store: &mut Store,
    module: &Module,
    name: &str,
    mode: InstantiateMode,
) -> Result<ModuleAddr, InstantiateError> {
    // Transient execution state is private to this call; the store is
    // deliberately left alone.
    let mut stack = Stack::new();

    if store.find_module(name).is_some() {
        return Err(InstantiateError::ModuleNameConflict(name.to_string()));
    }

    debug!("instantiating module `{name}`");
    let checkpoint = store.checkpoint();
    match build(store, &mut stack, module, name, mode) {
        Ok(addr) => {
            store.publish_module_name(addr)?;
            debug!("module `{name}` instantiated at address {addr}");
            Ok(addr)
        }
        Err(err) => {
            debug!("instantiation of `{name}` failed, rolling back: {err}");
            store.rollback(checkpoint);
            stack.reset();
            Err(err)
        }
    }
}

fn build(
    store: &mut Store,
    stack: &mut Stack,
    module: &Module,
    name: &str,
    mode: InstantiateMode,
) -> Result<ModuleAddr, InstantiateError> {
    let inst = ModuleInstance::new(name);
    let addr = match mode {
        InstantiateMode::Instantiate => store.push_module(inst),
        InstantiateMode::Import => store.import_module(inst),
    };

    install_types(store, addr, module)?;
    matcher::resolve_imports(store, addr, module)?;
    allocate_functions(store, addr, module)?;
    allocate_globals(store, stack, addr, module)?;
    allocate_tables(store, addr, module)?;
    allocate_memories(store, addr, module)?;

    let (elem_offsets, data_offsets) = resolve_offsets(store, stack, addr, module)?;

    // Every segment is bounds-checked before the first write so a failure
    // leaves no partial write observable, including through imported targets.
    let elem_writes = plan_element_segments(store, addr, module, &elem_offsets)?;
    let data_writes = plan_data_segments(store, addr, module, &data_offsets)?;
    commit_element_segments(store, elem_writes)?;
    commit_data_segments(store, data_writes)?;

    publish_exports(store, addr, module)?;

    if let Some(ctor) = module.get_ctor() {
        aot::invoke_ctor(store, stack, addr, ctor);
    }

    run_start(store, stack, addr, module)?;
    Ok(addr)
}

/// Copy every signature from the type section into the instance, preserving
/// the index order used throughout the module.
fn install_types(
    store: &mut Store,
    addr: ModuleAddr,
    module: &Module,
) -> Result<(), InstantiateError> {
    let Some(types) = module.get_type_section() else {
        return Ok(());
    };
    let inst = store.get_module_mut(addr)?;
    for ty in types {
        inst.add_func_type(ty.params.clone(), ty.results.clone());
    }
    Ok(())
}

fn allocate_functions(
    store: &mut Store,
    addr: ModuleAddr,
    module: &Module,
) -> Result<(), InstantiateError> {
    let Some(type_indices) = module.get_function_section() else {
        return Ok(());
    };
    let codes = module.get_code_section().unwrap_or(&[]);
    if type_indices.len() != codes.len() {
        return Err(BadAddress {
            space: "code",
            addr: codes.len() as u32,
        }
        .into());
    }

    for (&type_idx, code) in type_indices.iter().zip(codes) {
        let ty = store
            .get_module(addr)?
            .func_type(type_idx)
            .cloned()
            .ok_or(BadAddress {
                space: "type",
                addr: type_idx,
            })?;
        let body = FuncBody::Wasm {
            locals: code.locals.clone(),
            code: code.body.clone().into(),
        };
        let faddr = store.allocate_function(ty, addr, body);
        store.get_module_mut(addr)?.func_addrs.push(faddr);
    }
    Ok(())
}

/// Evaluate each global's initializer against the partially built instance
/// and allocate the global with the result.
fn allocate_globals(
    store: &mut Store,
    stack: &mut Stack,
    addr: ModuleAddr,
    module: &Module,
) -> Result<(), InstantiateError> {
    let Some(globals) = module.get_global_section() else {
        return Ok(());
    };

    stack.push_frame(addr, 0, 0);
    let result = (|| {
        for global in globals {
            let value = eval::eval_const_expr(store, stack, module.imported_globals, &global.init)?;
            if value.ty() != global.ty.val_type {
                return Err(InstantiateError::InvalidInitializer(
                    "initializer type does not match declared global type",
                ));
            }
            let gaddr = store.allocate_global(global.ty, value);
            store.get_module_mut(addr)?.global_addrs.push(gaddr);
        }
        Ok(())
    })();
    stack.pop_frame();
    result
}

fn allocate_tables(
    store: &mut Store,
    addr: ModuleAddr,
    module: &Module,
) -> Result<(), InstantiateError> {
    let Some(tables) = module.get_table_section() else {
        return Ok(());
    };
    for ty in tables {
        let taddr = store.allocate_table(ty);
        store.get_module_mut(addr)?.table_addrs.push(taddr);
    }
    Ok(())
}

fn allocate_memories(
    store: &mut Store,
    addr: ModuleAddr,
    module: &Module,
) -> Result<(), InstantiateError> {
    let Some(memories) = module.get_memory_section() else {
        return Ok(());
    };
    for ty in memories {
        let maddr = store.allocate_memory(ty);
        store.get_module_mut(addr)?.mem_addrs.push(maddr);
    }
    Ok(())
}

/// Evaluate every element and data offset under one synthetic frame for the
/// instance under construction. Each offset must produce a single i32, taken
/// as unsigned.
fn resolve_offsets(
    store: &mut Store,
    stack: &mut Stack,
    addr: ModuleAddr,
    module: &Module,
) -> Result<(Vec<u32>, Vec<u32>), InstantiateError> {
    stack.push_frame(addr, 0, 0);
    let result = (|| {
        let mut elem_offsets = Vec::new();
        if let Some(segments) = module.get_element_section() {
            for seg in segments {
                match eval::eval_const_expr(store, stack, module.imported_globals, &seg.offset)? {
                    Value::I32(v) => elem_offsets.push(v as u32),
                    _ => {
                        return Err(InstantiateError::InvalidInitializer(
                            "element offset must be i32",
                        ))
                    }
                }
            }
        }

        let mut data_offsets = Vec::new();
        if let Some(segments) = module.get_data_section() {
            for seg in segments {
                match eval::eval_const_expr(store, stack, module.imported_globals, &seg.offset)? {
                    Value::I32(v) => data_offsets.push(v as u32),
                    _ => {
                        return Err(InstantiateError::InvalidInitializer(
                            "data offset must be i32",
                        ))
                    }
                }
            }
        }
        Ok((elem_offsets, data_offsets))
    })();
    stack.pop_frame();
    result
}

/// Bounds-check every element segment and resolve its function indices to
/// store addresses. Nothing is written yet.
fn plan_element_segments(
    store: &Store,
    addr: ModuleAddr,
    module: &Module,
    offsets: &[u32],
) -> Result<Vec<(TableAddr, u32, Vec<FuncAddr>)>, InstantiateError> {
    let Some(segments) = module.get_element_section() else {
        return Ok(Vec::new());
    };
    let inst = store.get_module(addr)?;
    let mut writes = Vec::with_capacity(segments.len());

    for (seg, &offset) in segments.iter().zip(offsets) {
        let taddr = *inst
            .table_addrs
            .get(seg.table as usize)
            .ok_or(BadAddress {
                space: "table",
                addr: seg.table,
            })?;
        let size = store.get_table(taddr)?.size();
        let len = seg.init.len() as u32;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(InstantiateError::TableOutOfRange { offset, len, size });
        }
        let funcs = seg
            .init
            .iter()
            .map(|&fidx| {
                inst.func_addrs
                    .get(fidx as usize)
                    .copied()
                    .ok_or(BadAddress {
                        space: "function",
                        addr: fidx,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        writes.push((taddr, offset, funcs));
    }
    Ok(writes)
}

fn commit_element_segments(
    store: &mut Store,
    writes: Vec<(TableAddr, u32, Vec<FuncAddr>)>,
) -> Result<(), InstantiateError> {
    for (taddr, offset, funcs) in writes {
        store.get_table_mut(taddr)?.fill(offset, &funcs);
    }
    Ok(())
}

/// Bounds-check every data segment. Nothing is written yet.
fn plan_data_segments<'m>(
    store: &Store,
    addr: ModuleAddr,
    module: &'m Module,
    offsets: &[u32],
) -> Result<Vec<(MemAddr, u32, &'m [u8])>, InstantiateError> {
    let Some(segments) = module.get_data_section() else {
        return Ok(Vec::new());
    };
    let inst = store.get_module(addr)?;
    let mut writes = Vec::with_capacity(segments.len());

    for (seg, &offset) in segments.iter().zip(offsets) {
        let maddr = *inst.mem_addrs.get(seg.memory as usize).ok_or(BadAddress {
            space: "memory",
            addr: seg.memory,
        })?;
        let size = store.get_memory(maddr)?.byte_len() as u64;
        let len = seg.init.len() as u32;
        if offset as u64 + len as u64 > size {
            return Err(InstantiateError::MemoryOutOfRange { offset, len, size });
        }
        writes.push((maddr, offset, seg.init.as_slice()));
    }
    Ok(writes)
}

fn commit_data_segments(
    store: &mut Store,
    writes: Vec<(MemAddr, u32, &[u8])>,
) -> Result<(), InstantiateError> {
    for (maddr, offset, bytes) in writes {
        store.get_memory_mut(maddr)?.fill(offset, bytes);
    }
    Ok(())
}

/// Record `(kind, local index)` for every export. Indices are checked
/// against the instance's address spaces; duplicate names fail.
fn publish_exports(
    store: &mut Store,
    addr: ModuleAddr,
    module: &Module,
) -> Result<(), InstantiateError> {
    let Some(exports) = module.get_export_section() else {
        return Ok(());
    };
    let inst = store.get_module_mut(addr)?;
    for export in exports {
        let kind = export.desc.kind();
        let index = export.desc.index();
        let space_len = match kind {
            ExternKind::Func => inst.func_addrs.len(),
            ExternKind::Table => inst.table_addrs.len(),
            ExternKind::Memory => inst.mem_addrs.len(),
            ExternKind::Global => inst.global_addrs.len(),
        };
        if index as usize >= space_len {
            return Err(BadAddress {
                space: kind.name(),
                addr: index,
            }
            .into());
        }
        if inst
            .exports
            .insert(
                export.name.clone(),
                crate::runtime::ExportEntry { kind, index },
            )
            .is_some()
        {
            return Err(InstantiateError::DuplicateExportName(export.name.clone()));
        }
    }
    Ok(())
}

/// Record the start index on the instance and run the function through the
/// interpreter. A trap surfaces as `StartTrap` and aborts the transaction.
fn run_start(
    store: &mut Store,
    stack: &mut Stack,
    addr: ModuleAddr,
    module: &Module,
) -> Result<(), InstantiateError> {
    let Some(start_idx) = module.get_start_section() else {
        return Ok(());
    };
    store.get_module_mut(addr)?.start = Some(start_idx);

    let faddr = store
        .get_module(addr)?
        .func_addrs
        .get(start_idx as usize)
        .copied()
        .ok_or(BadAddress {
            space: "function",
            addr: start_idx,
        })?;
    vm::run_function(store, stack, faddr, &[]).map_err(InstantiateError::StartTrap)?;
    Ok(())
}
