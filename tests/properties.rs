//! Property tests over import limit matching and segment bounds checking.

use proptest::prelude::*;

use reefwasm::error::InstantiateError;
use reefwasm::model::{
    DataSegment, Expr, Import, ImportDesc, Limits, MemoryType, Module, RefType, TableType,
};
use reefwasm::{instantiate, HostModuleBuilder, Store};

fn i32_const(v: i32) -> Expr {
    let mut body = vec![0x41];
    let mut v = v as i64;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0) {
            body.push(byte);
            break;
        }
        body.push(byte | 0x80);
    }
    body.push(0x0B);
    Expr { body }
}

/// The matching rule the import resolver must implement for table and memory
/// limits.
fn limits_should_match(declared: &Limits, actual: &Limits) -> bool {
    declared.min <= actual.min
        && match declared.max {
            None => true,
            Some(dmax) => actual.max.is_some_and(|amax| amax <= dmax),
        }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64, .. ProptestConfig::default()
    })]

    /// Instantiation accepts a table import exactly when the limits rule
    /// holds, and a rejected import never changes the store.
    #[test]
    fn table_import_matches_iff_limits_compatible(
        actual_min in 0u32..40,
        declared_min in 0u32..40,
        actual_max_seed in 0u32..50,
        declared_max_seed in 0u32..50,
        actual_has_max in any::<bool>(),
        declared_has_max in any::<bool>(),
    ) {
        let actual = Limits::new(
            actual_min,
            actual_has_max.then(|| actual_min + actual_max_seed),
        );
        let declared = Limits::new(
            declared_min,
            declared_has_max.then(|| declared_min + declared_max_seed),
        );

        let mut store = Store::new();
        HostModuleBuilder::new("env")
            .table("t", TableType { elem: RefType::FuncRef, limits: actual })
            .register(&mut store)
            .unwrap();
        let modules_before = store.module_count();
        let tables_before = store.table_count();

        let module = Module {
            imports: vec![Import {
                module: "env".into(),
                name: "t".into(),
                desc: ImportDesc::Table(TableType { elem: RefType::FuncRef, limits: declared }),
            }],
            imported_tables: 1,
            ..Module::default()
        };
        let result = instantiate(&mut store, &module, "m");

        if limits_should_match(&declared, &actual) {
            prop_assert!(result.is_ok(), "expected match: {declared:?} vs {actual:?}");
        } else {
            prop_assert!(
                matches!(result, Err(InstantiateError::IncompatibleImportType { .. })),
                "expected mismatch: {declared:?} vs {actual:?}"
            );
            prop_assert_eq!(store.module_count(), modules_before);
            prop_assert_eq!(store.table_count(), tables_before);
            prop_assert!(store.find_module("m").is_none());
        }
    }

    /// A data segment lands exactly when `offset + len` fits in the memory;
    /// otherwise instantiation fails and reclaims the memory.
    #[test]
    fn data_segment_bounds(offset in 0u32..70_000, len in 0usize..80) {
        let mut store = Store::new();
        let module = Module {
            memories: vec![MemoryType { limits: Limits::new(1, None) }],
            data: vec![DataSegment {
                memory: 0,
                offset: i32_const(offset as i32),
                init: vec![0x5A; len],
            }],
            ..Module::default()
        };
        let result = instantiate(&mut store, &module, "m");

        if offset as u64 + len as u64 <= 65_536 {
            let addr = result.unwrap();
            let maddr = store.get_module(addr).unwrap().mem_addrs[0];
            let data = store.get_memory(maddr).unwrap().data();
            prop_assert!(data[offset as usize..offset as usize + len]
                .iter()
                .all(|&b| b == 0x5A));
        } else {
            let is_out_of_range = matches!(result, Err(InstantiateError::MemoryOutOfRange { .. }));
            prop_assert!(is_out_of_range);
            prop_assert_eq!(store.memory_count(), 0);
            prop_assert!(store.find_module("m").is_none());
        }
    }
}
