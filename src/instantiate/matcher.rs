//! Import resolution and declared-versus-actual type matching.
//!
//! Each import is looked up by (module name, external name) against the
//! store's published modules, its kind and concrete type are matched against
//! the declaration, and the exporter's address is copied into the importing
//! instance's address space.

use log::trace;

use crate::error::{BadAddress, InstantiateError};
use crate::model::{ExternKind, Import, ImportDesc, Limits, Module};
use crate::runtime::{ModuleAddr, Store};

/// The limits rule shared by table and memory imports: the actual entity must
/// provide at least the declared minimum, and when the declaration bounds the
/// entity from above, the actual must be bounded at least as tightly.
pub(crate) fn limits_compatible(declared: &Limits, actual: &Limits) -> bool {
    if declared.min > actual.min {
        return false;
    }
    match declared.max {
        None => true,
        Some(dmax) => matches!(actual.max, Some(amax) if amax <= dmax),
    }
}

fn unknown(imp: &Import) -> InstantiateError {
    InstantiateError::UnknownImport {
        module: imp.module.clone(),
        name: imp.name.clone(),
    }
}

fn incompatible(imp: &Import, expected: String, found: String) -> InstantiateError {
    InstantiateError::IncompatibleImportType {
        module: imp.module.clone(),
        name: imp.name.clone(),
        expected,
        found,
    }
}

/// Resolve every entry of the import section into the instance at `addr`.
/// Imports land at the low end of each address space, in section order.
pub(crate) fn resolve_imports(
    store: &mut Store,
    addr: ModuleAddr,
    module: &Module,
) -> Result<(), InstantiateError> {
    let Some(imports) = module.get_import_section() else {
        return Ok(());
    };

    for imp in imports {
        let actual_addr = match_one(store, addr, imp)?;
        trace!(
            "import {}.{} resolved to {} address {actual_addr}",
            imp.module,
            imp.name,
            imp.desc.kind().name(),
        );
        let inst = store.get_module_mut(addr)?;
        match imp.desc.kind() {
            ExternKind::Func => inst.func_addrs.push(actual_addr),
            ExternKind::Table => inst.table_addrs.push(actual_addr),
            ExternKind::Memory => inst.mem_addrs.push(actual_addr),
            ExternKind::Global => inst.global_addrs.push(actual_addr),
        }
    }
    Ok(())
}

/// Locate and type-check a single import, returning the exporter's store
/// address for the entity.
fn match_one(store: &Store, addr: ModuleAddr, imp: &Import) -> Result<u32, InstantiateError> {
    let exporter_addr = store.find_module(&imp.module).ok_or_else(|| unknown(imp))?;
    let exporter = store.get_module(exporter_addr)?;
    let entry = exporter.export(&imp.name).ok_or_else(|| unknown(imp))?;

    let declared_kind = imp.desc.kind();
    if entry.kind != declared_kind {
        return Err(incompatible(
            imp,
            declared_kind.name().to_string(),
            entry.kind.name().to_string(),
        ));
    }

    let (_, actual_addr) = exporter
        .export_addr(&imp.name)
        .ok_or(BadAddress {
            space: declared_kind.name(),
            addr: entry.index,
        })?;

    match &imp.desc {
        ImportDesc::Func(type_idx) => {
            let declared = store
                .get_module(addr)?
                .func_type(*type_idx)
                .cloned()
                .ok_or(BadAddress {
                    space: "type",
                    addr: *type_idx,
                })?;
            let actual = store.get_function(actual_addr)?.ty();
            if *actual != declared {
                return Err(incompatible(
                    imp,
                    format!("{declared:?}"),
                    format!("{actual:?}"),
                ));
            }
        }
        ImportDesc::Table(tt) => {
            let table = store.get_table(actual_addr)?;
            if table.elem_type() != tt.elem || !limits_compatible(&tt.limits, &table.limits()) {
                return Err(incompatible(
                    imp,
                    format!("{tt:?}"),
                    format!("table {:?} {:?}", table.elem_type(), table.limits()),
                ));
            }
        }
        ImportDesc::Memory(mt) => {
            let mem = store.get_memory(actual_addr)?;
            if !limits_compatible(&mt.limits, &mem.limits()) {
                return Err(incompatible(
                    imp,
                    format!("{mt:?}"),
                    format!("memory {:?}", mem.limits()),
                ));
            }
        }
        ImportDesc::Global(gt) => {
            let global = store.get_global(actual_addr)?;
            if global.ty() != gt {
                return Err(incompatible(
                    imp,
                    format!("{gt:?}"),
                    format!("{:?}", global.ty()),
                ));
            }
        }
    }

    Ok(actual_addr)
}
