//! Interpreter main loop: structured control flow with a forward scanner for
//! matching else/end, direct and indirect calls, and the MVP memory ops.
//!
//! Code runs off a seekable cursor over the function instance's owned body
//! bytes; the module context for globals, memories, tables, and callees is
//! resolved through the current frame on the shared [`Stack`].

use std::sync::Arc;

use crate::binary::Reader;
use crate::error::Trap;
use crate::model::Value;
use crate::runtime::{FuncAddr, FuncBody, MemAddr, Store};
use crate::vm::instructions::op;
use crate::vm::stack::Stack;

/// Seekable cursor over owned bytecode.
struct SeekCursor {
    data: Arc<[u8]>,
    pos: usize,
}

impl SeekCursor {
    fn new(data: Arc<[u8]>) -> Self {
        Self { data, pos: 0 }
    }

    /// A second cursor over the same bytes, used for forward scanning.
    fn scanner(&self) -> SeekCursor {
        SeekCursor {
            data: self.data.clone(),
            pos: self.pos,
        }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn set_pos(&mut self, p: usize) -> Result<(), Trap> {
        if p > self.data.len() {
            return Err(Trap::MalformedCode("jump out of bounds"));
        }
        self.pos = p;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u8(&mut self) -> Result<u8, Trap> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(Trap::MalformedCode("unexpected end of code"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], Trap> {
        let end = self
            .pos
            .checked_add(N)
            .filter(|&e| e <= self.data.len())
            .ok_or(Trap::MalformedCode("unexpected end of code"))?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn read_var_u32(&mut self) -> Result<u32, Trap> {
        let mut r = Reader::new(&self.data[self.pos.min(self.data.len())..]);
        let v = r
            .read_var_u32()
            .map_err(|_| Trap::MalformedCode("bad u32 immediate"))?;
        self.pos += r.offset();
        Ok(v)
    }

    fn read_var_i32(&mut self) -> Result<i32, Trap> {
        let mut r = Reader::new(&self.data[self.pos.min(self.data.len())..]);
        let v = r
            .read_var_i32()
            .map_err(|_| Trap::MalformedCode("bad i32 immediate"))?;
        self.pos += r.offset();
        Ok(v)
    }

    fn read_var_i64(&mut self) -> Result<i64, Trap> {
        let mut r = Reader::new(&self.data[self.pos.min(self.data.len())..]);
        let v = r
            .read_var_i64()
            .map_err(|_| Trap::MalformedCode("bad i64 immediate"))?;
        self.pos += r.offset();
        Ok(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Block,
    Loop,
    If,
    Func,
}

/// Structured control record. `target` is the branch destination (loop body
/// start for loops, otherwise unused), `end` the offset just past the
/// construct's END.
#[derive(Debug, Clone, Copy)]
struct ControlFrame {
    kind: BlockKind,
    height: usize,
    target: usize,
    end: usize,
}

/// Per-call execution context.
struct FuncCtx {
    cur: SeekCursor,
    ctrl: Vec<ControlFrame>,
    locals: Vec<Value>,
    results: usize,
}

/* ---------- Forward scanning ---------- */

fn skip_blocktype(cur: &mut SeekCursor) -> Result<(), Trap> {
    match cur.read_u8()? {
        0x40 | 0x7F | 0x7E | 0x7D | 0x7C => Ok(()),
        _ => {
            // First byte of a type-index immediate; re-read it as LEB128.
            cur.pos -= 1;
            cur.read_var_u32()?;
            Ok(())
        }
    }
}

/// Skip the immediates of one opcode so the scanner never mistakes an
/// immediate byte for a control opcode.
fn skip_immediates(cur: &mut SeekCursor, opcode: u8) -> Result<(), Trap> {
    match opcode {
        op::BLOCK | op::LOOP | op::IF => skip_blocktype(cur)?,
        op::I32_CONST => {
            cur.read_var_i32()?;
        }
        op::I64_CONST => {
            cur.read_var_i64()?;
        }
        op::F32_CONST => {
            cur.read_bytes::<4>()?;
        }
        op::F64_CONST => {
            cur.read_bytes::<8>()?;
        }
        op::BR | op::BR_IF | op::CALL => {
            cur.read_var_u32()?;
        }
        op::BR_TABLE => {
            let count = cur.read_var_u32()?;
            for _ in 0..=count {
                cur.read_var_u32()?;
            }
        }
        op::CALL_INDIRECT => {
            cur.read_var_u32()?;
            cur.read_u8()?;
        }
        op::LOCAL_GET..=op::GLOBAL_SET => {
            cur.read_var_u32()?;
        }
        op::I32_LOAD..=op::I64_STORE32 => {
            cur.read_var_u32()?;
            cur.read_var_u32()?;
        }
        op::MEMORY_SIZE | op::MEMORY_GROW => {
            cur.read_u8()?;
        }
        _ => {}
    }
    Ok(())
}

/// Scan forward from just inside a construct to its matching ELSE (if the
/// construct is an If) and END. Returns offsets just past the respective
/// opcode bytes.
fn find_else_end(
    cur: &mut SeekCursor,
    initial_kind: BlockKind,
) -> Result<(Option<usize>, usize), Trap> {
    let mut depth = 1usize;
    let mut else_at = None;

    while !cur.is_eof() {
        let opcode = cur.read_u8()?;
        match opcode {
            op::BLOCK | op::LOOP | op::IF => {
                skip_blocktype(cur)?;
                depth += 1;
            }
            op::ELSE => {
                if depth == 1 && initial_kind == BlockKind::If {
                    else_at = Some(cur.pos());
                }
            }
            op::END => {
                depth -= 1;
                if depth == 0 {
                    return Ok((else_at, cur.pos()));
                }
            }
            _ => skip_immediates(cur, opcode)?,
        }
    }
    Err(Trap::MalformedCode("unmatched end"))
}

/* ---------- Typed pops and operator helpers ---------- */

fn pop_i32(stack: &mut Stack) -> Result<i32, Trap> {
    match stack.pop_value()? {
        Value::I32(v) => Ok(v),
        _ => Err(Trap::TypeMismatch { expected: "i32" }),
    }
}

fn pop_i64(stack: &mut Stack) -> Result<i64, Trap> {
    match stack.pop_value()? {
        Value::I64(v) => Ok(v),
        _ => Err(Trap::TypeMismatch { expected: "i64" }),
    }
}

fn pop_f32(stack: &mut Stack) -> Result<f32, Trap> {
    match stack.pop_value()? {
        Value::F32(b) => Ok(f32::from_bits(b)),
        _ => Err(Trap::TypeMismatch { expected: "f32" }),
    }
}

fn pop_f64(stack: &mut Stack) -> Result<f64, Trap> {
    match stack.pop_value()? {
        Value::F64(b) => Ok(f64::from_bits(b)),
        _ => Err(Trap::TypeMismatch { expected: "f64" }),
    }
}

fn bool_i32(b: bool) -> Value {
    Value::I32(b as i32)
}

fn binop_i32(stack: &mut Stack, f: impl Fn(i32, i32) -> Result<i32, Trap>) -> Result<(), Trap> {
    let rhs = pop_i32(stack)?;
    let lhs = pop_i32(stack)?;
    stack.push_value(Value::I32(f(lhs, rhs)?));
    Ok(())
}

fn binop_i64(stack: &mut Stack, f: impl Fn(i64, i64) -> Result<i64, Trap>) -> Result<(), Trap> {
    let rhs = pop_i64(stack)?;
    let lhs = pop_i64(stack)?;
    stack.push_value(Value::I64(f(lhs, rhs)?));
    Ok(())
}

fn binop_f32(stack: &mut Stack, f: impl Fn(f32, f32) -> f32) -> Result<(), Trap> {
    let rhs = pop_f32(stack)?;
    let lhs = pop_f32(stack)?;
    stack.push_value(Value::F32(f(lhs, rhs).to_bits()));
    Ok(())
}

fn binop_f64(stack: &mut Stack, f: impl Fn(f64, f64) -> f64) -> Result<(), Trap> {
    let rhs = pop_f64(stack)?;
    let lhs = pop_f64(stack)?;
    stack.push_value(Value::F64(f(lhs, rhs).to_bits()));
    Ok(())
}

fn cmpop_i32(stack: &mut Stack, f: impl Fn(i32, i32) -> bool) -> Result<(), Trap> {
    let rhs = pop_i32(stack)?;
    let lhs = pop_i32(stack)?;
    stack.push_value(bool_i32(f(lhs, rhs)));
    Ok(())
}

fn cmpop_i64(stack: &mut Stack, f: impl Fn(i64, i64) -> bool) -> Result<(), Trap> {
    let rhs = pop_i64(stack)?;
    let lhs = pop_i64(stack)?;
    stack.push_value(bool_i32(f(lhs, rhs)));
    Ok(())
}

fn cmpop_f32(stack: &mut Stack, f: impl Fn(f32, f32) -> bool) -> Result<(), Trap> {
    let rhs = pop_f32(stack)?;
    let lhs = pop_f32(stack)?;
    stack.push_value(bool_i32(f(lhs, rhs)));
    Ok(())
}

fn cmpop_f64(stack: &mut Stack, f: impl Fn(f64, f64) -> bool) -> Result<(), Trap> {
    let rhs = pop_f64(stack)?;
    let lhs = pop_f64(stack)?;
    stack.push_value(bool_i32(f(lhs, rhs)));
    Ok(())
}

/* ---------- Module context helpers ---------- */

fn memory_addr(store: &Store, stack: &Stack) -> Result<MemAddr, Trap> {
    let module = stack.current_frame()?.module;
    store
        .get_module(module)?
        .mem_addrs
        .first()
        .copied()
        .ok_or(Trap::MalformedCode("module has no memory"))
}

fn global_addr(store: &Store, stack: &Stack, idx: u32) -> Result<u32, Trap> {
    let module = stack.current_frame()?.module;
    store
        .get_module(module)?
        .global_addrs
        .get(idx as usize)
        .copied()
        .ok_or(Trap::MalformedCode("global index out of range"))
}

/// Read a memarg (alignment hint + offset) and combine the offset with the
/// popped base address.
fn effective_addr(cur: &mut SeekCursor, stack: &mut Stack) -> Result<u32, Trap> {
    let _align = cur.read_var_u32()?;
    let offset = cur.read_var_u32()?;
    let base = pop_i32(stack)? as u32;
    base.checked_add(offset).ok_or(Trap::MemoryOutOfBounds)
}

/* ---------- Call discipline ---------- */

/// Invoke the function at `faddr`. Host bodies run to completion and leave
/// their result on the stack; locally defined bodies pop their arguments,
/// push a frame, and enter the call stack.
fn push_call(
    store: &Store,
    stack: &mut Stack,
    call_stack: &mut Vec<FuncCtx>,
    faddr: FuncAddr,
) -> Result<(), Trap> {
    let func = store.get_function(faddr)?;
    let ty = func.ty().clone();
    let module = func.module();

    match func.body() {
        FuncBody::Host(h) => {
            let h = h.clone();
            let mut args = vec![Value::I32(0); ty.params.len()];
            for slot in args.iter_mut().rev() {
                *slot = stack.pop_value()?;
            }
            let ret = h(&args)?;
            match (ty.results.len(), ret) {
                (0, _) => {}
                (_, Some(v)) => stack.push_value(v),
                (n, None) => {
                    return Err(Trap::ArityMismatch {
                        expected: n,
                        got: 0,
                    })
                }
            }
        }
        FuncBody::Wasm { locals, code } => {
            let code = code.clone();
            let locals_decl = locals.clone();

            let mut frame_locals = vec![Value::I32(0); ty.params.len()];
            for slot in frame_locals.iter_mut().rev() {
                *slot = stack.pop_value()?;
            }
            for d in &locals_decl {
                for _ in 0..d.count {
                    frame_locals.push(Value::zero(d.val_type));
                }
            }

            stack.push_frame(module, ty.params.len() as u32, ty.results.len() as u32);
            let ctrl = vec![ControlFrame {
                kind: BlockKind::Func,
                height: stack.value_height(),
                target: 0,
                end: code.len(),
            }];
            call_stack.push(FuncCtx {
                cur: SeekCursor::new(code),
                ctrl,
                locals: frame_locals,
                results: ty.results.len(),
            });
        }
    }
    Ok(())
}

/// Unwind the current function: collect its result, pop the frame (which
/// truncates the value region), and hand the result to the caller.
fn pop_function(stack: &mut Stack, call_stack: &mut Vec<FuncCtx>) -> Result<Option<Value>, Trap> {
    let results = call_stack.last().ok_or(Trap::NoActiveFrame)?.results;
    let ret = if results > 0 {
        Some(stack.pop_value()?)
    } else {
        None
    };
    stack.pop_frame().ok_or(Trap::NoActiveFrame)?;
    call_stack.pop();
    if !call_stack.is_empty() {
        if let Some(v) = ret {
            stack.push_value(v);
        }
    }
    Ok(ret)
}

enum BranchExit {
    Continue,
    Return,
}

fn branch_to(ctx: &mut FuncCtx, stack: &mut Stack, depth: usize) -> Result<BranchExit, Trap> {
    if depth >= ctx.ctrl.len() {
        return Err(Trap::MalformedCode("branch depth out of range"));
    }
    let target_index = ctx.ctrl.len() - 1 - depth;
    let target = ctx.ctrl[target_index];
    match target.kind {
        BlockKind::Loop => {
            ctx.ctrl.truncate(target_index + 1);
            stack.truncate_values(target.height);
            ctx.cur.set_pos(target.target)?;
            Ok(BranchExit::Continue)
        }
        BlockKind::Block | BlockKind::If => {
            ctx.ctrl.truncate(target_index);
            stack.truncate_values(target.height);
            ctx.cur.set_pos(target.end)?;
            Ok(BranchExit::Continue)
        }
        BlockKind::Func => Ok(BranchExit::Return),
    }
}

/* ---------- Main loop ---------- */

/// Execute the function at `func_addr` with `args`, using `stack` for values
/// and frames. Returns the single result for one-result signatures, `None`
/// otherwise.
pub fn run_function(
    store: &mut Store,
    stack: &mut Stack,
    func_addr: FuncAddr,
    args: &[Value],
) -> Result<Option<Value>, Trap> {
    let (nparams, nresults) = {
        let ty = store.get_function(func_addr)?.ty();
        (ty.params.len(), ty.results.len())
    };
    if nparams != args.len() {
        return Err(Trap::ArityMismatch {
            expected: nparams,
            got: args.len(),
        });
    }

    for v in args {
        stack.push_value(*v);
    }
    let mut call_stack: Vec<FuncCtx> = Vec::new();
    push_call(store, stack, &mut call_stack, func_addr)?;
    if call_stack.is_empty() {
        // Host function: already ran to completion through its callback.
        return Ok(if nresults > 0 {
            Some(stack.pop_value()?)
        } else {
            None
        });
    }

    loop {
        let ctx = call_stack.last_mut().ok_or(Trap::NoActiveFrame)?;
        let opcode = ctx.cur.read_u8()?;

        match opcode {
            op::UNREACHABLE => return Err(Trap::Unreachable),
            op::NOP => {}

            op::BLOCK => {
                skip_blocktype(&mut ctx.cur)?;
                let body_start = ctx.cur.pos();
                let (_, end) = find_else_end(&mut ctx.cur.scanner(), BlockKind::Block)?;
                ctx.ctrl.push(ControlFrame {
                    kind: BlockKind::Block,
                    height: stack.value_height(),
                    target: body_start,
                    end,
                });
            }
            op::LOOP => {
                skip_blocktype(&mut ctx.cur)?;
                let body_start = ctx.cur.pos();
                let (_, end) = find_else_end(&mut ctx.cur.scanner(), BlockKind::Loop)?;
                ctx.ctrl.push(ControlFrame {
                    kind: BlockKind::Loop,
                    height: stack.value_height(),
                    target: body_start,
                    end,
                });
            }
            op::IF => {
                skip_blocktype(&mut ctx.cur)?;
                let cond = pop_i32(stack)?;
                let (else_at, end) = find_else_end(&mut ctx.cur.scanner(), BlockKind::If)?;
                if cond != 0 {
                    ctx.ctrl.push(ControlFrame {
                        kind: BlockKind::If,
                        height: stack.value_height(),
                        target: 0,
                        end,
                    });
                } else if let Some(else_at) = else_at {
                    ctx.ctrl.push(ControlFrame {
                        kind: BlockKind::If,
                        height: stack.value_height(),
                        target: 0,
                        end,
                    });
                    ctx.cur.set_pos(else_at)?;
                } else {
                    // No else branch and a false condition: nothing executes,
                    // so no control frame is entered at all.
                    ctx.cur.set_pos(end)?;
                }
            }
            op::ELSE => {
                // Reached by falling off the then branch: the construct is
                // finished.
                let frame = ctx
                    .ctrl
                    .pop()
                    .ok_or(Trap::MalformedCode("else without if"))?;
                if frame.kind != BlockKind::If {
                    return Err(Trap::MalformedCode("else without if"));
                }
                stack.truncate_values(frame.height);
                ctx.cur.set_pos(frame.end)?;
            }
            op::END => {
                let frame = ctx
                    .ctrl
                    .pop()
                    .ok_or(Trap::MalformedCode("unbalanced end"))?;
                if frame.kind == BlockKind::Func {
                    let ret = pop_function(stack, &mut call_stack)?;
                    if call_stack.is_empty() {
                        return Ok(ret);
                    }
                } else {
                    stack.truncate_values(frame.height);
                }
            }

            op::BR => {
                let depth = ctx.cur.read_var_u32()? as usize;
                if let BranchExit::Return = branch_to(ctx, stack, depth)? {
                    let ret = pop_function(stack, &mut call_stack)?;
                    if call_stack.is_empty() {
                        return Ok(ret);
                    }
                }
            }
            op::BR_IF => {
                let depth = ctx.cur.read_var_u32()? as usize;
                if pop_i32(stack)? != 0 {
                    if let BranchExit::Return = branch_to(ctx, stack, depth)? {
                        let ret = pop_function(stack, &mut call_stack)?;
                        if call_stack.is_empty() {
                            return Ok(ret);
                        }
                    }
                }
            }
            op::BR_TABLE => {
                let count = ctx.cur.read_var_u32()? as usize;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(ctx.cur.read_var_u32()? as usize);
                }
                let default = ctx.cur.read_var_u32()? as usize;
                let index = pop_i32(stack)? as usize;
                let depth = targets.get(index).copied().unwrap_or(default);
                if let BranchExit::Return = branch_to(ctx, stack, depth)? {
                    let ret = pop_function(stack, &mut call_stack)?;
                    if call_stack.is_empty() {
                        return Ok(ret);
                    }
                }
            }
            op::RETURN => {
                let ret = pop_function(stack, &mut call_stack)?;
                if call_stack.is_empty() {
                    return Ok(ret);
                }
            }

            op::CALL => {
                let fidx = ctx.cur.read_var_u32()?;
                let module = stack.current_frame()?.module;
                let faddr = store
                    .get_module(module)?
                    .func_addrs
                    .get(fidx as usize)
                    .copied()
                    .ok_or(Trap::MalformedCode("function index out of range"))?;
                push_call(store, stack, &mut call_stack, faddr)?;
            }
            op::CALL_INDIRECT => {
                let type_idx = ctx.cur.read_var_u32()?;
                let _reserved = ctx.cur.read_u8()?;
                let index = pop_i32(stack)? as u32;
                let module = stack.current_frame()?.module;
                let faddr = {
                    let inst = store.get_module(module)?;
                    let taddr = inst
                        .table_addrs
                        .first()
                        .copied()
                        .ok_or(Trap::MalformedCode("module has no table"))?;
                    let expected = inst
                        .func_type(type_idx)
                        .cloned()
                        .ok_or(Trap::MalformedCode("type index out of range"))?;
                    let slot = store
                        .get_table(taddr)?
                        .get(index)
                        .ok_or(Trap::UndefinedElement)?;
                    let faddr = slot.ok_or(Trap::UninitializedElement)?;
                    if store.get_function(faddr)?.ty() != &expected {
                        return Err(Trap::IndirectCallTypeMismatch);
                    }
                    faddr
                };
                push_call(store, stack, &mut call_stack, faddr)?;
            }

            op::DROP => {
                stack.pop_value()?;
            }
            op::SELECT => {
                let cond = pop_i32(stack)?;
                let b = stack.pop_value()?;
                let a = stack.pop_value()?;
                stack.push_value(if cond != 0 { a } else { b });
            }

            op::LOCAL_GET => {
                let idx = ctx.cur.read_var_u32()? as usize;
                let v = *ctx
                    .locals
                    .get(idx)
                    .ok_or(Trap::MalformedCode("local index out of range"))?;
                stack.push_value(v);
            }
            op::LOCAL_SET => {
                let idx = ctx.cur.read_var_u32()? as usize;
                let v = stack.pop_value()?;
                *ctx.locals
                    .get_mut(idx)
                    .ok_or(Trap::MalformedCode("local index out of range"))? = v;
            }
            op::LOCAL_TEE => {
                let idx = ctx.cur.read_var_u32()? as usize;
                let v = stack.pop_value()?;
                stack.push_value(v);
                *ctx.locals
                    .get_mut(idx)
                    .ok_or(Trap::MalformedCode("local index out of range"))? = v;
            }
            op::GLOBAL_GET => {
                let idx = ctx.cur.read_var_u32()?;
                let gaddr = global_addr(store, stack, idx)?;
                let v = store.get_global(gaddr)?.value();
                stack.push_value(v);
            }
            op::GLOBAL_SET => {
                let idx = ctx.cur.read_var_u32()?;
                let v = stack.pop_value()?;
                let gaddr = global_addr(store, stack, idx)?;
                if !store.get_global_mut(gaddr)?.set(v) {
                    return Err(Trap::ImmutableGlobal);
                }
            }

            op::I32_LOAD => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<4>(ea)?;
                stack.push_value(Value::I32(i32::from_le_bytes(b)));
            }
            op::I64_LOAD => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<8>(ea)?;
                stack.push_value(Value::I64(i64::from_le_bytes(b)));
            }
            op::F32_LOAD => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<4>(ea)?;
                stack.push_value(Value::F32(u32::from_le_bytes(b)));
            }
            op::F64_LOAD => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<8>(ea)?;
                stack.push_value(Value::F64(u64::from_le_bytes(b)));
            }
            op::I32_LOAD8_S => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<1>(ea)?;
                stack.push_value(Value::I32(b[0] as i8 as i32));
            }
            op::I32_LOAD8_U => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<1>(ea)?;
                stack.push_value(Value::I32(b[0] as i32));
            }
            op::I32_LOAD16_S => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<2>(ea)?;
                stack.push_value(Value::I32(i16::from_le_bytes(b) as i32));
            }
            op::I32_LOAD16_U => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<2>(ea)?;
                stack.push_value(Value::I32(u16::from_le_bytes(b) as i32));
            }
            op::I64_LOAD8_S => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<1>(ea)?;
                stack.push_value(Value::I64(b[0] as i8 as i64));
            }
            op::I64_LOAD8_U => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<1>(ea)?;
                stack.push_value(Value::I64(b[0] as i64));
            }
            op::I64_LOAD16_S => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<2>(ea)?;
                stack.push_value(Value::I64(i16::from_le_bytes(b) as i64));
            }
            op::I64_LOAD16_U => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<2>(ea)?;
                stack.push_value(Value::I64(u16::from_le_bytes(b) as i64));
            }
            op::I64_LOAD32_S => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<4>(ea)?;
                stack.push_value(Value::I64(i32::from_le_bytes(b) as i64));
            }
            op::I64_LOAD32_U => {
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                let b = store.get_memory(maddr)?.load::<4>(ea)?;
                stack.push_value(Value::I64(u32::from_le_bytes(b) as i64));
            }

            op::I32_STORE => {
                let v = pop_i32(stack)?;
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                store.get_memory_mut(maddr)?.store(ea, v.to_le_bytes())?;
            }
            op::I64_STORE => {
                let v = pop_i64(stack)?;
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                store.get_memory_mut(maddr)?.store(ea, v.to_le_bytes())?;
            }
            op::F32_STORE => {
                let v = match stack.pop_value()? {
                    Value::F32(b) => b,
                    _ => return Err(Trap::TypeMismatch { expected: "f32" }),
                };
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                store.get_memory_mut(maddr)?.store(ea, v.to_le_bytes())?;
            }
            op::F64_STORE => {
                let v = match stack.pop_value()? {
                    Value::F64(b) => b,
                    _ => return Err(Trap::TypeMismatch { expected: "f64" }),
                };
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                store.get_memory_mut(maddr)?.store(ea, v.to_le_bytes())?;
            }
            op::I32_STORE8 => {
                let v = pop_i32(stack)?;
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                store
                    .get_memory_mut(maddr)?
                    .store(ea, [(v as u32 & 0xFF) as u8])?;
            }
            op::I32_STORE16 => {
                let v = pop_i32(stack)?;
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                store
                    .get_memory_mut(maddr)?
                    .store(ea, ((v as u32 & 0xFFFF) as u16).to_le_bytes())?;
            }
            op::I64_STORE8 => {
                let v = pop_i64(stack)?;
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                store
                    .get_memory_mut(maddr)?
                    .store(ea, [(v as u64 & 0xFF) as u8])?;
            }
            op::I64_STORE16 => {
                let v = pop_i64(stack)?;
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                store
                    .get_memory_mut(maddr)?
                    .store(ea, ((v as u64 & 0xFFFF) as u16).to_le_bytes())?;
            }
            op::I64_STORE32 => {
                let v = pop_i64(stack)?;
                let ea = effective_addr(&mut ctx.cur, stack)?;
                let maddr = memory_addr(store, stack)?;
                store
                    .get_memory_mut(maddr)?
                    .store(ea, ((v as u64 & 0xFFFF_FFFF) as u32).to_le_bytes())?;
            }

            op::MEMORY_SIZE => {
                let _reserved = ctx.cur.read_u8()?;
                let maddr = memory_addr(store, stack)?;
                let pages = store.get_memory(maddr)?.size_pages();
                stack.push_value(Value::I32(pages as i32));
            }
            op::MEMORY_GROW => {
                let _reserved = ctx.cur.read_u8()?;
                let delta = pop_i32(stack)?;
                let maddr = memory_addr(store, stack)?;
                let prev = store
                    .get_memory_mut(maddr)?
                    .grow(delta as u32)
                    .map(|p| p as i32)
                    .unwrap_or(-1);
                stack.push_value(Value::I32(prev));
            }

            op::I32_CONST => {
                let v = ctx.cur.read_var_i32()?;
                stack.push_value(Value::I32(v));
            }
            op::I64_CONST => {
                let v = ctx.cur.read_var_i64()?;
                stack.push_value(Value::I64(v));
            }
            op::F32_CONST => {
                let b = ctx.cur.read_bytes::<4>()?;
                stack.push_value(Value::F32(u32::from_le_bytes(b)));
            }
            op::F64_CONST => {
                let b = ctx.cur.read_bytes::<8>()?;
                stack.push_value(Value::F64(u64::from_le_bytes(b)));
            }

            op::I32_EQ => cmpop_i32(stack, |a, b| a == b)?,
            op::I32_LT_S => cmpop_i32(stack, |a, b| a < b)?,
            op::I32_LT_U => cmpop_i32(stack, |a, b| (a as u32) < (b as u32))?,
            op::I64_EQ => cmpop_i64(stack, |a, b| a == b)?,
            op::I64_LT_S => cmpop_i64(stack, |a, b| a < b)?,
            op::I64_LT_U => cmpop_i64(stack, |a, b| (a as u64) < (b as u64))?,
            op::F32_EQ => cmpop_f32(stack, |a, b| a == b)?,
            op::F32_LT => cmpop_f32(stack, |a, b| a < b)?,
            op::F64_EQ => cmpop_f64(stack, |a, b| a == b)?,
            op::F64_LT => cmpop_f64(stack, |a, b| a < b)?,

            op::I32_ADD => binop_i32(stack, |a, b| Ok(a.wrapping_add(b)))?,
            op::I32_SUB => binop_i32(stack, |a, b| Ok(a.wrapping_sub(b)))?,
            op::I32_MUL => binop_i32(stack, |a, b| Ok(a.wrapping_mul(b)))?,
            op::I32_DIV_S => binop_i32(stack, |a, b| {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                a.checked_div(b).ok_or(Trap::IntegerOverflow)
            })?,
            op::I32_DIV_U => binop_i32(stack, |a, b| {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                Ok(((a as u32) / (b as u32)) as i32)
            })?,
            op::I64_ADD => binop_i64(stack, |a, b| Ok(a.wrapping_add(b)))?,
            op::I64_SUB => binop_i64(stack, |a, b| Ok(a.wrapping_sub(b)))?,
            op::I64_MUL => binop_i64(stack, |a, b| Ok(a.wrapping_mul(b)))?,
            op::I64_DIV_S => binop_i64(stack, |a, b| {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                a.checked_div(b).ok_or(Trap::IntegerOverflow)
            })?,
            op::I64_DIV_U => binop_i64(stack, |a, b| {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                Ok(((a as u64) / (b as u64)) as i64)
            })?,

            op::F32_ADD => binop_f32(stack, |a, b| a + b)?,
            op::F32_SUB => binop_f32(stack, |a, b| a - b)?,
            op::F32_MUL => binop_f32(stack, |a, b| a * b)?,
            op::F32_DIV => binop_f32(stack, |a, b| a / b)?,
            op::F64_ADD => binop_f64(stack, |a, b| a + b)?,
            op::F64_SUB => binop_f64(stack, |a, b| a - b)?,
            op::F64_MUL => binop_f64(stack, |a, b| a * b)?,
            op::F64_DIV => binop_f64(stack, |a, b| a / b)?,

            _ => return Err(Trap::MalformedCode("unsupported opcode")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FuncType, GlobalType, Limits, LocalDecl, MemoryType, RefType, TableType, ValType};
    use crate::runtime::{ModuleAddr, ModuleInstance};

    fn instance(store: &mut Store) -> ModuleAddr {
        store.push_module(ModuleInstance::new("t"))
    }

    fn add_func(
        store: &mut Store,
        module: ModuleAddr,
        ty: FuncType,
        locals: Vec<LocalDecl>,
        code: &[u8],
    ) -> FuncAddr {
        let faddr = store.allocate_function(
            ty,
            module,
            FuncBody::Wasm {
                locals,
                code: code.to_vec().into(),
            },
        );
        store.get_module_mut(module).unwrap().func_addrs.push(faddr);
        faddr
    }

    fn run(store: &mut Store, faddr: FuncAddr, args: &[Value]) -> Result<Option<Value>, Trap> {
        let mut stack = Stack::new();
        let out = run_function(store, &mut stack, faddr, args);
        if out.is_ok() {
            assert_eq!(stack.value_height(), 0, "stack not drained");
            assert_eq!(stack.frame_depth(), 0, "frames not drained");
        }
        out
    }

    fn ty(params: &[ValType], results: &[ValType]) -> FuncType {
        FuncType {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }

    #[test]
    fn const_return() {
        let mut store = Store::new();
        let m = instance(&mut store);
        let f = add_func(&mut store, m, ty(&[], &[ValType::I32]), vec![], &[0x41, 0x2A, 0x0B]);
        assert_eq!(run(&mut store, f, &[]).unwrap(), Some(Value::I32(42)));
    }

    #[test]
    fn param_addition() {
        let mut store = Store::new();
        let m = instance(&mut store);
        // local.get 0; local.get 1; i32.add; end
        let f = add_func(
            &mut store,
            m,
            ty(&[ValType::I32, ValType::I32], &[ValType::I32]),
            vec![],
            &[0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B],
        );
        let out = run(&mut store, f, &[Value::I32(2), Value::I32(40)]).unwrap();
        assert_eq!(out, Some(Value::I32(42)));
    }

    #[test]
    fn direct_call() {
        let mut store = Store::new();
        let m = instance(&mut store);
        // func 0: call 1; i32.const 1; i32.add; end
        let f0 = add_func(
            &mut store,
            m,
            ty(&[], &[ValType::I32]),
            vec![],
            &[0x10, 0x01, 0x41, 0x01, 0x6A, 0x0B],
        );
        // func 1: i32.const 7; end
        add_func(&mut store, m, ty(&[], &[ValType::I32]), vec![], &[0x41, 0x07, 0x0B]);
        assert_eq!(run(&mut store, f0, &[]).unwrap(), Some(Value::I32(8)));
    }

    #[test]
    fn host_call_from_bytecode() {
        let mut store = Store::new();
        let m = instance(&mut store);
        // func 0: i32.const 2; call 1; end
        let f0 = add_func(
            &mut store,
            m,
            ty(&[], &[ValType::I32]),
            vec![],
            &[0x41, 0x02, 0x10, 0x01, 0x0B],
        );
        let host = store.allocate_function(
            ty(&[ValType::I32], &[ValType::I32]),
            m,
            FuncBody::Host(std::sync::Arc::new(|args: &[Value]| {
                let Value::I32(v) = args[0] else {
                    return Err(Trap::TypeMismatch { expected: "i32" });
                };
                Ok(Some(Value::I32(v * 10)))
            })),
        );
        store.get_module_mut(m).unwrap().func_addrs.push(host);
        assert_eq!(run(&mut store, f0, &[]).unwrap(), Some(Value::I32(20)));
    }

    #[test]
    fn if_with_early_return() {
        let mut store = Store::new();
        let m = instance(&mut store);
        // local.get 0; if; i32.const 10; return; end; i32.const 20; end
        let f = add_func(
            &mut store,
            m,
            ty(&[ValType::I32], &[ValType::I32]),
            vec![],
            &[0x20, 0x00, 0x04, 0x40, 0x41, 0x0A, 0x0F, 0x0B, 0x41, 0x14, 0x0B],
        );
        assert_eq!(run(&mut store, f, &[Value::I32(1)]).unwrap(), Some(Value::I32(10)));
        assert_eq!(run(&mut store, f, &[Value::I32(0)]).unwrap(), Some(Value::I32(20)));
    }

    #[test]
    fn if_else_branches() {
        let mut store = Store::new();
        let m = instance(&mut store);
        // local.get 0; if; i32.const 1; local.set 1; else; i32.const 2;
        // local.set 1; end; local.get 1; end
        let f = add_func(
            &mut store,
            m,
            ty(&[ValType::I32], &[ValType::I32]),
            vec![LocalDecl { count: 1, val_type: ValType::I32 }],
            &[
                0x20, 0x00, 0x04, 0x40, 0x41, 0x01, 0x21, 0x01, 0x05, 0x41, 0x02, 0x21, 0x01,
                0x0B, 0x20, 0x01, 0x0B,
            ],
        );
        assert_eq!(run(&mut store, f, &[Value::I32(5)]).unwrap(), Some(Value::I32(1)));
        assert_eq!(run(&mut store, f, &[Value::I32(0)]).unwrap(), Some(Value::I32(2)));
    }

    #[test]
    fn loop_countdown_sums() {
        let mut store = Store::new();
        let m = instance(&mut store);
        // loop: acc += n; n -= 1; br_if 0; end; local.get acc; end
        let f = add_func(
            &mut store,
            m,
            ty(&[ValType::I32], &[ValType::I32]),
            vec![LocalDecl { count: 1, val_type: ValType::I32 }],
            &[
                0x03, 0x40, // loop (empty)
                0x20, 0x01, 0x20, 0x00, 0x6A, 0x21, 0x01, // acc += n
                0x20, 0x00, 0x41, 0x01, 0x6B, 0x22, 0x00, // n -= 1 (tee)
                0x0D, 0x00, // br_if 0
                0x0B, // end loop
                0x20, 0x01, // local.get acc
                0x0B, // end func
            ],
        );
        assert_eq!(run(&mut store, f, &[Value::I32(4)]).unwrap(), Some(Value::I32(10)));
    }

    #[test]
    fn memory_store_then_load() {
        let mut store = Store::new();
        let m = instance(&mut store);
        let maddr = store.allocate_memory(&MemoryType { limits: Limits::new(1, None) });
        store.get_module_mut(m).unwrap().mem_addrs.push(maddr);
        // i32.const 4; i32.const 0x11223344; i32.store; i32.const 4;
        // i32.load; end
        let f = add_func(
            &mut store,
            m,
            ty(&[], &[ValType::I32]),
            vec![],
            &[
                0x41, 0x04, 0x41, 0xC4, 0xE6, 0x88, 0x89, 0x01, 0x36, 0x02, 0x00, //
                0x41, 0x04, 0x28, 0x02, 0x00, 0x0B,
            ],
        );
        assert_eq!(run(&mut store, f, &[]).unwrap(), Some(Value::I32(0x11223344)));
    }

    #[test]
    fn out_of_bounds_load_traps() {
        let mut store = Store::new();
        let m = instance(&mut store);
        let maddr = store.allocate_memory(&MemoryType { limits: Limits::new(1, None) });
        store.get_module_mut(m).unwrap().mem_addrs.push(maddr);
        // i32.const 65533; i32.load; end -- 4-byte read past the page end
        let f = add_func(
            &mut store,
            m,
            ty(&[], &[ValType::I32]),
            vec![],
            &[0x41, 0xFD, 0xFF, 0x03, 0x28, 0x02, 0x00, 0x0B],
        );
        assert!(matches!(run(&mut store, f, &[]), Err(Trap::MemoryOutOfBounds)));
    }

    #[test]
    fn global_read_modify_write() {
        let mut store = Store::new();
        let m = instance(&mut store);
        let gaddr = store.allocate_global(GlobalType::new(ValType::I32, true), Value::I32(5));
        store.get_module_mut(m).unwrap().global_addrs.push(gaddr);
        // global.get 0; i32.const 1; i32.add; global.set 0; global.get 0; end
        let f = add_func(
            &mut store,
            m,
            ty(&[], &[ValType::I32]),
            vec![],
            &[0x23, 0x00, 0x41, 0x01, 0x6A, 0x24, 0x00, 0x23, 0x00, 0x0B],
        );
        assert_eq!(run(&mut store, f, &[]).unwrap(), Some(Value::I32(6)));
        assert_eq!(store.get_global(gaddr).unwrap().value(), Value::I32(6));
    }

    #[test]
    fn indirect_call_through_table() {
        let mut store = Store::new();
        let m = instance(&mut store);
        store.get_module_mut(m).unwrap().add_func_type(vec![], vec![ValType::I32]);
        let taddr = store.allocate_table(&TableType {
            elem: RefType::FuncRef,
            limits: Limits::new(2, None),
        });
        store.get_module_mut(m).unwrap().table_addrs.push(taddr);

        // callee at table slot 1
        let callee = add_func(&mut store, m, ty(&[], &[ValType::I32]), vec![], &[0x41, 0x09, 0x0B]);
        store.get_table_mut(taddr).unwrap().set(1, Some(callee));

        // i32.const 1; call_indirect (type 0); end
        let f = add_func(
            &mut store,
            m,
            ty(&[], &[ValType::I32]),
            vec![],
            &[0x41, 0x01, 0x11, 0x00, 0x00, 0x0B],
        );
        assert_eq!(run(&mut store, f, &[]).unwrap(), Some(Value::I32(9)));
    }

    #[test]
    fn indirect_call_uninitialized_slot_traps() {
        let mut store = Store::new();
        let m = instance(&mut store);
        store.get_module_mut(m).unwrap().add_func_type(vec![], vec![]);
        let taddr = store.allocate_table(&TableType {
            elem: RefType::FuncRef,
            limits: Limits::new(1, None),
        });
        store.get_module_mut(m).unwrap().table_addrs.push(taddr);
        let f = add_func(&mut store, m, ty(&[], &[]), vec![], &[0x41, 0x00, 0x11, 0x00, 0x00, 0x0B]);
        assert!(matches!(run(&mut store, f, &[]), Err(Trap::UninitializedElement)));
    }

    #[test]
    fn unreachable_traps() {
        let mut store = Store::new();
        let m = instance(&mut store);
        let f = add_func(&mut store, m, ty(&[], &[]), vec![], &[0x00, 0x0B]);
        assert!(matches!(run(&mut store, f, &[]), Err(Trap::Unreachable)));
    }

    #[test]
    fn division_traps() {
        let mut store = Store::new();
        let m = instance(&mut store);
        // i32.const 1; i32.const 0; i32.div_s; end
        let f = add_func(
            &mut store,
            m,
            ty(&[], &[ValType::I32]),
            vec![],
            &[0x41, 0x01, 0x41, 0x00, 0x6D, 0x0B],
        );
        assert!(matches!(run(&mut store, f, &[]), Err(Trap::DivideByZero)));

        // i32.const INT_MIN; i32.const -1; i32.div_s; end
        let g = add_func(
            &mut store,
            m,
            ty(&[], &[ValType::I32]),
            vec![],
            &[0x41, 0x80, 0x80, 0x80, 0x80, 0x78, 0x41, 0x7F, 0x6D, 0x0B],
        );
        assert!(matches!(run(&mut store, g, &[]), Err(Trap::IntegerOverflow)));
    }

    #[test]
    fn arity_mismatch_rejected() {
        let mut store = Store::new();
        let m = instance(&mut store);
        let f = add_func(&mut store, m, ty(&[ValType::I32], &[]), vec![], &[0x0B]);
        assert!(matches!(
            run(&mut store, f, &[]),
            Err(Trap::ArityMismatch { expected: 1, got: 0 })
        ));
    }
}
