//! Structural validator: index-space, limits, export, start, and body checks
//! over the parsed module, ahead of instantiation.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::model::{ExportDesc, FuncIdx, FuncType, ImportDesc, Limits, Module, TypeIdx};
use crate::vm::instructions::op;

type VResult<T> = Result<T, ValidationError>;

/// Index-space view over a module: absolute indices cover imports first,
/// locally defined entities after.
struct Spaces<'a> {
    m: &'a Module,
    /// Type indices of imported functions, in import order.
    func_import_types: Vec<TypeIdx>,
}

impl<'a> Spaces<'a> {
    fn new(m: &'a Module) -> Self {
        let func_import_types = m
            .imports
            .iter()
            .filter_map(|imp| match imp.desc {
                ImportDesc::Func(tidx) => Some(tidx),
                _ => None,
            })
            .collect();
        Self {
            m,
            func_import_types,
        }
    }

    fn func_type(&self, fidx: FuncIdx) -> VResult<&'a FuncType> {
        let tidx = if fidx < self.m.imported_funcs {
            self.func_import_types
                .get(fidx as usize)
                .copied()
                .ok_or(ValidationError::IndexOutOfRange {
                    space: "function",
                    index: fidx,
                })?
        } else {
            self.m
                .func_type_indices
                .get((fidx - self.m.imported_funcs) as usize)
                .copied()
                .ok_or(ValidationError::IndexOutOfRange {
                    space: "function",
                    index: fidx,
                })?
        };
        self.m
            .types
            .get(tidx as usize)
            .ok_or(ValidationError::IndexOutOfRange {
                space: "type",
                index: tidx,
            })
    }
}

fn check_limits(limits: &Limits) -> VResult<()> {
    if let Some(max) = limits.max {
        if max < limits.min {
            return Err(ValidationError::LimitInverted {
                min: limits.min,
                max,
            });
        }
    }
    Ok(())
}

pub fn validate_module(m: &Module) -> VResult<()> {
    let spaces = Spaces::new(m);

    if m.func_type_indices.len() != m.codes.len() {
        return Err(ValidationError::FunctionCodeMismatch);
    }

    for &tidx in &m.func_type_indices {
        if tidx as usize >= m.types.len() {
            return Err(ValidationError::IndexOutOfRange {
                space: "type",
                index: tidx,
            });
        }
    }
    for imp in &m.imports {
        match &imp.desc {
            ImportDesc::Func(tidx) => {
                if *tidx as usize >= m.types.len() {
                    return Err(ValidationError::IndexOutOfRange {
                        space: "type",
                        index: *tidx,
                    });
                }
            }
            ImportDesc::Table(tt) => check_limits(&tt.limits)?,
            ImportDesc::Memory(mt) => check_limits(&mt.limits)?,
            ImportDesc::Global(_) => {}
        }
    }

    for tt in &m.tables {
        check_limits(&tt.limits)?;
    }

    if m.total_memories() > 1 {
        return Err(ValidationError::MultipleMemories);
    }
    for mt in &m.memories {
        check_limits(&mt.limits)?;
    }

    let mut export_names = HashSet::new();
    for ex in &m.exports {
        if !export_names.insert(ex.name.as_str()) {
            return Err(ValidationError::DuplicateExportName(ex.name.clone()));
        }
        let (space, index, len) = match ex.desc {
            ExportDesc::Func(i) => ("function", i, m.total_funcs()),
            ExportDesc::Table(i) => ("table", i, m.total_tables()),
            ExportDesc::Memory(i) => ("memory", i, m.total_memories()),
            ExportDesc::Global(i) => ("global", i, m.total_globals()),
        };
        if index >= len {
            return Err(ValidationError::IndexOutOfRange { space, index });
        }
    }

    if let Some(start) = m.start {
        if start >= m.total_funcs() {
            return Err(ValidationError::IndexOutOfRange {
                space: "function",
                index: start,
            });
        }
        let ty = spaces.func_type(start)?;
        if !ty.params.is_empty() || !ty.results.is_empty() {
            return Err(ValidationError::StartSignature);
        }
    }

    for seg in &m.elements {
        if seg.table >= m.total_tables() {
            return Err(ValidationError::IndexOutOfRange {
                space: "table",
                index: seg.table,
            });
        }
        for &fidx in &seg.init {
            if fidx >= m.total_funcs() {
                return Err(ValidationError::IndexOutOfRange {
                    space: "function",
                    index: fidx,
                });
            }
        }
    }

    for seg in &m.data {
        if seg.memory >= m.total_memories() {
            return Err(ValidationError::IndexOutOfRange {
                space: "memory",
                index: seg.memory,
            });
        }
    }

    for code in &m.codes {
        if code.body.last() != Some(&op::END) {
            return Err(ValidationError::UnterminatedBody);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Export, ExportDesc, FuncType, ValType};

    fn answer_module() -> Module {
        Module {
            types: vec![FuncType {
                params: vec![],
                results: vec![ValType::I32],
            }],
            func_type_indices: vec![0],
            codes: vec![crate::model::Code {
                locals: vec![],
                body: vec![0x41, 0x2A, 0x0B],
            }],
            exports: vec![Export {
                name: "answer".into(),
                desc: ExportDesc::Func(0),
            }],
            ..Module::default()
        }
    }

    #[test]
    fn accepts_well_formed_module() {
        assert_eq!(validate_module(&answer_module()), Ok(()));
    }

    #[test]
    fn rejects_duplicate_export_names() {
        let mut m = answer_module();
        m.exports.push(Export {
            name: "answer".into(),
            desc: ExportDesc::Func(0),
        });
        assert!(matches!(
            validate_module(&m),
            Err(ValidationError::DuplicateExportName(_))
        ));
    }

    #[test]
    fn rejects_export_index_out_of_range() {
        let mut m = answer_module();
        m.exports[0].desc = ExportDesc::Func(3);
        assert!(matches!(
            validate_module(&m),
            Err(ValidationError::IndexOutOfRange { space: "function", index: 3 })
        ));
    }

    #[test]
    fn rejects_nonempty_start_signature() {
        let mut m = answer_module();
        m.start = Some(0);
        assert_eq!(validate_module(&m), Err(ValidationError::StartSignature));
    }

    #[test]
    fn rejects_unterminated_body() {
        let mut m = answer_module();
        m.codes[0].body = vec![0x41, 0x2A];
        assert_eq!(validate_module(&m), Err(ValidationError::UnterminatedBody));
    }
}
