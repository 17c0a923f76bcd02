//! Section decoder: section ids, tag-dispatched payload decoders, and the
//! top-level module decoder.

use super::{reader::Reader, LoadError, Result};
use crate::model::{
    Code, DataSegment, ElementSegment, Export, ExportDesc, Expr, FuncIdx, FuncType, Global,
    GlobalType, Import, ImportDesc, Limits, LocalDecl, MemoryType, Module, RefType, TableType,
    TypeIdx, ValType,
};

/// Standard section identifiers of the binary format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
}

impl SectionId {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => SectionId::Custom,
            1 => SectionId::Type,
            2 => SectionId::Import,
            3 => SectionId::Function,
            4 => SectionId::Table,
            5 => SectionId::Memory,
            6 => SectionId::Global,
            7 => SectionId::Export,
            8 => SectionId::Start,
            9 => SectionId::Element,
            10 => SectionId::Code,
            11 => SectionId::Data,
            _ => return None,
        })
    }
}

/* ---------- Type decoders ---------- */

fn decode_val_type(r: &mut Reader) -> Result<ValType> {
    match r.read_u8()? {
        0x7F => Ok(ValType::I32),
        0x7E => Ok(ValType::I64),
        0x7D => Ok(ValType::F32),
        0x7C => Ok(ValType::F64),
        _ => Err(LoadError::Malformed {
            offset: r.offset(),
            msg: "invalid value type",
        }),
    }
}

fn decode_ref_type(r: &mut Reader) -> Result<RefType> {
    match r.read_u8()? {
        0x70 => Ok(RefType::FuncRef),
        _ => Err(LoadError::Malformed {
            offset: r.offset(),
            msg: "invalid element type (expected funcref)",
        }),
    }
}

fn decode_limits(r: &mut Reader) -> Result<Limits> {
    match r.read_u8()? {
        0x00 => Ok(Limits::new(r.read_var_u32()?, None)),
        0x01 => {
            let min = r.read_var_u32()?;
            let max = r.read_var_u32()?;
            if max < min {
                return Err(LoadError::Malformed {
                    offset: r.offset(),
                    msg: "limit max below min",
                });
            }
            Ok(Limits::new(min, Some(max)))
        }
        _ => Err(LoadError::Malformed {
            offset: r.offset(),
            msg: "invalid limits tag",
        }),
    }
}

fn decode_func_type(r: &mut Reader) -> Result<FuncType> {
    if r.read_u8()? != 0x60 {
        return Err(LoadError::Malformed {
            offset: r.offset(),
            msg: "expected function type tag",
        });
    }
    let params = r.read_vec(decode_val_type)?;
    let results = r.read_vec(decode_val_type)?;
    Ok(FuncType { params, results })
}

fn decode_table_type(r: &mut Reader) -> Result<TableType> {
    let elem = decode_ref_type(r)?;
    let limits = decode_limits(r)?;
    Ok(TableType { elem, limits })
}

fn decode_memory_type(r: &mut Reader) -> Result<MemoryType> {
    Ok(MemoryType {
        limits: decode_limits(r)?,
    })
}

fn decode_global_type(r: &mut Reader) -> Result<GlobalType> {
    let val_type = decode_val_type(r)?;
    let mutable = match r.read_u8()? {
        0x00 => false,
        0x01 => true,
        _ => {
            return Err(LoadError::Malformed {
                offset: r.offset(),
                msg: "invalid global mutability",
            })
        }
    };
    Ok(GlobalType { val_type, mutable })
}

/// Decode an initializer expression through the terminating `end`.
///
/// Only the initializer dialect is accepted here: the four constants and
/// `global.get`. Immediates are decoded so a `0x0B` byte inside an immediate
/// is never mistaken for `end`.
fn decode_init_expr(r: &mut Reader) -> Result<Expr> {
    let start = r.offset();
    loop {
        match r.read_u8()? {
            0x0B => break,
            0x41 => {
                r.read_var_i32()?;
            }
            0x42 => {
                r.read_var_i64()?;
            }
            0x43 => {
                r.read_bytes(4)?;
            }
            0x44 => {
                r.read_bytes(8)?;
            }
            0x23 => {
                r.read_var_u32()?;
            }
            _ => {
                return Err(LoadError::Malformed {
                    offset: r.offset(),
                    msg: "unsupported opcode in initializer expression",
                })
            }
        }
    }
    Ok(Expr {
        body: r.taken_since(start).to_vec(),
    })
}

/* ---------- Section payload decoders ---------- */

fn decode_type_section(r: &mut Reader) -> Result<Vec<FuncType>> {
    r.read_vec(decode_func_type)
}

fn decode_import_section(r: &mut Reader) -> Result<(Vec<Import>, [u32; 4])> {
    let mut counts = [0u32; 4];
    let imports = r.read_vec(|r| {
        let module = r.read_name()?;
        let name = r.read_name()?;
        let desc = match r.read_u8()? {
            0x00 => {
                counts[0] += 1;
                ImportDesc::Func(r.read_var_u32()?)
            }
            0x01 => {
                counts[1] += 1;
                ImportDesc::Table(decode_table_type(r)?)
            }
            0x02 => {
                counts[2] += 1;
                ImportDesc::Memory(decode_memory_type(r)?)
            }
            0x03 => {
                counts[3] += 1;
                ImportDesc::Global(decode_global_type(r)?)
            }
            _ => {
                return Err(LoadError::Malformed {
                    offset: r.offset(),
                    msg: "invalid import descriptor tag",
                })
            }
        };
        Ok(Import { module, name, desc })
    })?;
    Ok((imports, counts))
}

fn decode_function_section(r: &mut Reader) -> Result<Vec<TypeIdx>> {
    r.read_vec(|r| r.read_var_u32())
}

fn decode_table_section(r: &mut Reader) -> Result<Vec<TableType>> {
    r.read_vec(decode_table_type)
}

fn decode_memory_section(r: &mut Reader) -> Result<Vec<MemoryType>> {
    r.read_vec(decode_memory_type)
}

fn decode_global_section(r: &mut Reader) -> Result<Vec<Global>> {
    r.read_vec(|r| {
        let ty = decode_global_type(r)?;
        let init = decode_init_expr(r)?;
        Ok(Global { ty, init })
    })
}

fn decode_export_section(r: &mut Reader) -> Result<Vec<Export>> {
    r.read_vec(|r| {
        let name = r.read_name()?;
        let desc = match r.read_u8()? {
            0x00 => ExportDesc::Func(r.read_var_u32()?),
            0x01 => ExportDesc::Table(r.read_var_u32()?),
            0x02 => ExportDesc::Memory(r.read_var_u32()?),
            0x03 => ExportDesc::Global(r.read_var_u32()?),
            _ => {
                return Err(LoadError::Malformed {
                    offset: r.offset(),
                    msg: "invalid export descriptor tag",
                })
            }
        };
        Ok(Export { name, desc })
    })
}

fn decode_element_section(r: &mut Reader) -> Result<Vec<ElementSegment>> {
    r.read_vec(|r| {
        let table = r.read_var_u32()?;
        let offset = decode_init_expr(r)?;
        let init = r.read_vec(|r| r.read_var_u32())?;
        Ok(ElementSegment {
            table,
            offset,
            init,
        })
    })
}

fn decode_code_section(r: &mut Reader) -> Result<Vec<Code>> {
    let count = r.read_var_u32()? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let size = r.read_var_u32()? as usize;
        let mut body = Reader::new(r.read_bytes(size)?);

        let locals = body.read_vec(|r| {
            let count = r.read_var_u32()?;
            let val_type = decode_val_type(r)?;
            Ok(LocalDecl { count, val_type })
        })?;

        // The rest of the entry is the instruction stream, terminated by
        // `end` per the format; the validator re-checks the terminator.
        let code = body.read_bytes(body.remaining())?.to_vec();
        out.push(Code { locals, body: code });
    }
    Ok(out)
}

fn decode_data_section(r: &mut Reader) -> Result<Vec<DataSegment>> {
    r.read_vec(|r| {
        let memory = r.read_var_u32()?;
        let offset = decode_init_expr(r)?;
        let init = r.read_len_prefixed_bytes()?;
        Ok(DataSegment {
            memory,
            offset,
            init,
        })
    })
}

/* ---------- Top-level module decoder ---------- */

const MAGIC: u32 = 0x6D73_6100; // "\0asm"
const VERSION: u32 = 0x0000_0001;

fn ensure_fully_consumed(r: &Reader) -> Result<()> {
    if r.remaining() != 0 {
        return Err(LoadError::Malformed {
            offset: r.offset(),
            msg: "section payload not fully consumed",
        });
    }
    Ok(())
}

/// Decode a complete module from raw bytes.
///
/// Enforces magic/version, non-decreasing standard section order, no
/// duplicate standard sections, full payload consumption, the function/code
/// length invariant, and the single-memory rule.
pub fn decode_module(bytes: &[u8]) -> Result<Module> {
    let mut r = Reader::new(bytes);

    if r.read_u32_le()? != MAGIC {
        return Err(LoadError::Malformed {
            offset: 0,
            msg: "bad magic header",
        });
    }
    if r.read_u32_le()? != VERSION {
        return Err(LoadError::Malformed {
            offset: 4,
            msg: "unsupported version",
        });
    }

    let mut module = Module::default();
    let mut seen = [false; 12];
    let mut last_id = 0u8;

    while !r.is_eof() {
        let id_byte = r.read_u8()?;
        let id = SectionId::from_byte(id_byte).ok_or(LoadError::Malformed {
            offset: r.offset(),
            msg: "unknown section id",
        })?;
        let payload_len = r.read_var_u32()? as usize;
        let payload_offset = r.offset();
        let mut p = Reader::new(r.read_bytes(payload_len)?);

        if id == SectionId::Custom {
            // Custom sections carry a name and arbitrary bytes; skipped whole.
            continue;
        }

        if id_byte < last_id {
            return Err(LoadError::Malformed {
                offset: payload_offset,
                msg: "section out of order",
            });
        }
        last_id = id_byte;

        if seen[id_byte as usize] {
            return Err(LoadError::Malformed {
                offset: payload_offset,
                msg: "duplicate standard section",
            });
        }
        seen[id_byte as usize] = true;

        match id {
            SectionId::Type => module.types = decode_type_section(&mut p)?,
            SectionId::Import => {
                let (imports, [f, t, m, g]) = decode_import_section(&mut p)?;
                module.imports = imports;
                module.imported_funcs = f;
                module.imported_tables = t;
                module.imported_memories = m;
                module.imported_globals = g;
            }
            SectionId::Function => module.func_type_indices = decode_function_section(&mut p)?,
            SectionId::Table => module.tables = decode_table_section(&mut p)?,
            SectionId::Memory => {
                module.memories = decode_memory_section(&mut p)?;
                if module.memories.len() > 1 {
                    return Err(LoadError::Malformed {
                        offset: payload_offset,
                        msg: "more than one memory",
                    });
                }
            }
            SectionId::Global => module.globals = decode_global_section(&mut p)?,
            SectionId::Export => module.exports = decode_export_section(&mut p)?,
            SectionId::Start => module.start = Some(p.read_var_u32()? as FuncIdx),
            SectionId::Element => module.elements = decode_element_section(&mut p)?,
            SectionId::Code => module.codes = decode_code_section(&mut p)?,
            SectionId::Data => module.data = decode_data_section(&mut p)?,
            SectionId::Custom => unreachable!("custom sections skipped above"),
        }

        ensure_fully_consumed(&p)?;
    }

    if module.func_type_indices.len() != module.codes.len() {
        return Err(LoadError::Malformed {
            offset: bytes.len(),
            msg: "function and code section length mismatch",
        });
    }

    Ok(module)
}
