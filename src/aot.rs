//! C ABI for ahead-of-time-compiled module constructors.
//!
//! A compiled module may carry a constructor that binds its globals and
//! per-entity symbol handles. The runtime hands it exactly four callbacks;
//! those four signatures are the entire surface compiled code can reach. The
//! callbacks resolve their module context through a thread-local installed
//! for the duration of the constructor call.

use std::cell::Cell;
use std::ptr;

use log::warn;

use crate::model::{ValType, Value};
use crate::runtime::{MemAddr, ModuleAddr, Store};
use crate::vm::{run_function, Stack};

/// Raise a trap with a backend-defined status code.
pub type TrapCallback = extern "C" fn(status: u32);
/// Invoke the function at a local index; argument and result scalars travel
/// as raw 64-bit words.
pub type CallCallback = extern "C" fn(func_index: u32, args: *const u64, rets: *mut u64);
/// Grow memory 0 by a page count; returns the previous page count, or
/// `u32::MAX` on failure.
pub type MemGrowCallback = extern "C" fn(pages: u32) -> u32;
/// Current page count of memory 0.
pub type MemSizeCallback = extern "C" fn() -> u32;

/// Constructor entry point of a compiled module.
pub type ModuleCtor = extern "C" fn(TrapCallback, CallCallback, MemGrowCallback, MemSizeCallback);

/// Status recorded when a callback itself fails, as opposed to compiled code
/// raising a trap of its own.
const STATUS_INTERNAL: u32 = u32::MAX;

struct CtorContext {
    store: *mut Store,
    stack: *mut Stack,
    module: ModuleAddr,
    trap: Cell<Option<u32>>,
}

thread_local! {
    static ACTIVE: Cell<*const CtorContext> = const { Cell::new(ptr::null()) };
}

fn with_active<T>(f: impl FnOnce(&CtorContext) -> T) -> Option<T> {
    ACTIVE.with(|slot| {
        let p = slot.get();
        if p.is_null() {
            None
        } else {
            // SAFETY: the pointer was installed by `invoke_ctor` and stays
            // valid until it clears the slot on the same thread.
            Some(f(unsafe { &*p }))
        }
    })
}

/// Run a compiled module's constructor with the four runtime callbacks. A
/// trap raised during the constructor is recorded and logged; the hook is
/// optional and does not abort instantiation.
pub(crate) fn invoke_ctor(
    store: &mut Store,
    stack: &mut Stack,
    module: ModuleAddr,
    ctor: ModuleCtor,
) {
    let ctx = CtorContext {
        store,
        stack,
        module,
        trap: Cell::new(None),
    };
    ACTIVE.with(|slot| slot.set(&ctx));
    ctor(
        trap_callback,
        call_callback,
        mem_grow_callback,
        mem_size_callback,
    );
    ACTIVE.with(|slot| slot.set(ptr::null()));

    if let Some(status) = ctx.trap.get() {
        warn!("compiled constructor of module {module} trapped with status {status}");
    }
}

fn module_memory(store: &Store, module: ModuleAddr) -> Option<MemAddr> {
    store.get_module(module).ok()?.mem_addrs.first().copied()
}

fn value_from_word(ty: ValType, word: u64) -> Value {
    match ty {
        ValType::I32 => Value::I32(word as u32 as i32),
        ValType::I64 => Value::I64(word as i64),
        ValType::F32 => Value::F32(word as u32),
        ValType::F64 => Value::F64(word),
    }
}

fn value_to_word(v: Value) -> u64 {
    match v {
        Value::I32(x) => x as u32 as u64,
        Value::I64(x) => x as u64,
        Value::F32(b) => b as u64,
        Value::F64(b) => b,
    }
}

extern "C" fn trap_callback(status: u32) {
    with_active(|ctx| ctx.trap.set(Some(status)));
}

extern "C" fn mem_size_callback() -> u32 {
    with_active(|ctx| {
        // SAFETY: see `with_active`; the store pointer is live for the whole
        // constructor call and nothing else touches it meanwhile.
        let store = unsafe { &*ctx.store };
        match module_memory(store, ctx.module) {
            Some(maddr) => store
                .get_memory(maddr)
                .map(|m| m.size_pages())
                .unwrap_or(0),
            None => 0,
        }
    })
    .unwrap_or(0)
}

extern "C" fn mem_grow_callback(pages: u32) -> u32 {
    with_active(|ctx| {
        // SAFETY: see `mem_size_callback`.
        let store = unsafe { &mut *ctx.store };
        let Some(maddr) = module_memory(store, ctx.module) else {
            return STATUS_INTERNAL;
        };
        match store.get_memory_mut(maddr).ok().and_then(|m| m.grow(pages)) {
            Some(prev) => prev,
            None => STATUS_INTERNAL,
        }
    })
    .unwrap_or(STATUS_INTERNAL)
}

extern "C" fn call_callback(func_index: u32, args: *const u64, rets: *mut u64) {
    with_active(|ctx| {
        // SAFETY: see `mem_size_callback`; `args`/`rets` validity is the
        // compiled caller's contract.
        let (store, stack) = unsafe { (&mut *ctx.store, &mut *ctx.stack) };

        let Some(faddr) = store
            .get_module(ctx.module)
            .ok()
            .and_then(|inst| inst.func_addrs.get(func_index as usize).copied())
        else {
            ctx.trap.set(Some(STATUS_INTERNAL));
            return;
        };
        let params: Vec<ValType> = match store.get_function(faddr) {
            Ok(f) => f.ty().params.clone(),
            Err(_) => {
                ctx.trap.set(Some(STATUS_INTERNAL));
                return;
            }
        };

        let mut vals = Vec::with_capacity(params.len());
        for (i, &ty) in params.iter().enumerate() {
            if args.is_null() {
                ctx.trap.set(Some(STATUS_INTERNAL));
                return;
            }
            let word = unsafe { *args.add(i) };
            vals.push(value_from_word(ty, word));
        }

        match run_function(store, stack, faddr, &vals) {
            Ok(Some(v)) => {
                if !rets.is_null() {
                    unsafe { *rets = value_to_word(v) };
                }
            }
            Ok(None) => {}
            Err(_) => ctx.trap.set(Some(STATUS_INTERNAL)),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    use crate::model::{FuncType, Limits, MemoryType};
    use crate::runtime::{FuncBody, ModuleInstance};

    static SEEN_PAGES: AtomicU32 = AtomicU32::new(u32::MAX);
    static CALL_RESULT: AtomicU64 = AtomicU64::new(0);

    extern "C" fn probing_ctor(
        _trap: TrapCallback,
        call: CallCallback,
        grow: MemGrowCallback,
        size: MemSizeCallback,
    ) {
        SEEN_PAGES.store(size(), Ordering::SeqCst);
        grow(1);
        let mut ret = 0u64;
        call(0, ptr::null(), &mut ret);
        CALL_RESULT.store(ret, Ordering::SeqCst);
    }

    #[test]
    fn ctor_reaches_memory_and_functions() {
        let mut store = Store::new();
        let addr = store.push_module(ModuleInstance::new("compiled"));
        let maddr = store.allocate_memory(&MemoryType {
            limits: Limits::new(2, None),
        });
        store.get_module_mut(addr).unwrap().mem_addrs.push(maddr);

        let ty = FuncType {
            params: vec![],
            results: vec![crate::model::ValType::I32],
        };
        let faddr = store.allocate_function(
            ty,
            addr,
            FuncBody::Wasm {
                locals: vec![],
                code: vec![0x41, 0x2A, 0x0B].into(), // i32.const 42; end
            },
        );
        store.get_module_mut(addr).unwrap().func_addrs.push(faddr);

        let mut stack = Stack::new();
        invoke_ctor(&mut store, &mut stack, addr, probing_ctor);

        assert_eq!(SEEN_PAGES.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_memory(maddr).unwrap().size_pages(), 3);
        assert_eq!(CALL_RESULT.load(Ordering::SeqCst), 42);
    }
}
