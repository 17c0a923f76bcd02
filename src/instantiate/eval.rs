//! Constant-expression evaluation for initializer expressions.
//!
//! The dialect is fixed: the four constants plus `global.get` of an imported,
//! immutable global. Evaluation is side-effect free on the store and runs on
//! the shared stack, popping to a single result.

use crate::binary::Reader;
use crate::error::InstantiateError;
use crate::model::{Expr, Value};
use crate::vm::instructions::op;
use crate::vm::Stack;
use crate::runtime::Store;

/// Evaluate one initializer expression against the instance referenced by the
/// current frame. `imported_globals` is the count of imported globals in that
/// instance; `global.get` may only name one of those.
pub(crate) fn eval_const_expr(
    store: &Store,
    stack: &mut Stack,
    imported_globals: u32,
    expr: &Expr,
) -> Result<Value, InstantiateError> {
    use InstantiateError::InvalidInitializer;

    let mut r = Reader::new(&expr.body);
    let base = stack.value_height();

    loop {
        let opcode = r
            .read_u8()
            .map_err(|_| InvalidInitializer("truncated expression"))?;
        match opcode {
            op::END => break,
            op::I32_CONST => {
                let v = r
                    .read_var_i32()
                    .map_err(|_| InvalidInitializer("bad i32 immediate"))?;
                stack.push_value(Value::I32(v));
            }
            op::I64_CONST => {
                let v = r
                    .read_var_i64()
                    .map_err(|_| InvalidInitializer("bad i64 immediate"))?;
                stack.push_value(Value::I64(v));
            }
            op::F32_CONST => {
                let b = r
                    .read_bytes(4)
                    .map_err(|_| InvalidInitializer("bad f32 immediate"))?;
                stack.push_value(Value::F32(u32::from_le_bytes([b[0], b[1], b[2], b[3]])));
            }
            op::F64_CONST => {
                let b = r
                    .read_bytes(8)
                    .map_err(|_| InvalidInitializer("bad f64 immediate"))?;
                stack.push_value(Value::F64(u64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ])));
            }
            op::GLOBAL_GET => {
                let idx = r
                    .read_var_u32()
                    .map_err(|_| InvalidInitializer("bad global index"))?;
                if idx >= imported_globals {
                    return Err(InvalidInitializer(
                        "global.get must reference an imported global",
                    ));
                }
                let module = stack
                    .current_frame()
                    .map_err(|_| InvalidInitializer("no active frame for global.get"))?
                    .module;
                let inst = store.get_module(module)?;
                let gaddr = *inst
                    .global_addrs
                    .get(idx as usize)
                    .ok_or(InvalidInitializer("global index out of range"))?;
                let global = store.get_global(gaddr)?;
                if global.ty().mutable {
                    return Err(InvalidInitializer("global.get of a mutable global"));
                }
                stack.push_value(global.value());
            }
            _ => return Err(InvalidInitializer("non-constant opcode")),
        }
    }

    if !r.is_eof() {
        return Err(InvalidInitializer("trailing bytes after end"));
    }
    if stack.value_height() != base + 1 {
        stack.truncate_values(base);
        return Err(InvalidInitializer(
            "expression must produce exactly one value",
        ));
    }
    stack
        .pop_value()
        .map_err(|_| InvalidInitializer("expression produced no value"))
}
