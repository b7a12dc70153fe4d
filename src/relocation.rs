//! Relocation classification and instruction patching.

use crate::{
    ebpf::{
        self, hash_symbol_name, BPF_PSEUDO_CALL, BPF_PSEUDO_MAP_FD, CALL_IMM, INSN_SIZE, LD_DW_IMM,
    },
    elf::{
        consts::{R_BPF_64_32, R_BPF_64_64},
        ElfImage, Rel, SymbolSection,
    },
    helpers::HelperRegistry,
    maps::MapSpec,
    program::{CallSite, MapPatch, ProgramUnit, UnitIndex, UnresolvedSymbol},
    section::SectionLayout,
};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelocationError {
    /// Relocation entry references a symbol index that does not exist
    #[error("unknown symbol with index {0}")]
    UnknownSymbol(usize),
    /// Symbol points into the maps section but matches no descriptor
    #[error("no map definition at offset {offset:#x} for symbol `{symbol}`")]
    UnknownMap {
        /// The symbol name
        symbol: String,
        /// The symbol's offset within the maps section
        offset: u64,
    },
    /// Function symbol in an executable section without a matching unit
    #[error("no function at offset {offset:#x} of section `{section}` for symbol `{symbol}`")]
    UnknownFunction {
        /// The symbol name
        symbol: String,
        /// The section the symbol claims to live in
        section: String,
        /// The symbol's offset within that section
        offset: u64,
    },
    /// Relocation does not fit the target instruction buffer; detected
    /// before any byte of the buffer is written
    #[error("relocation at offset {offset:#x} is outside program `{program}` ({len:#x} bytes)")]
    RelocationOutOfBounds {
        /// Name of the program being patched
        program: String,
        /// Unit-relative byte offset of the relocation
        offset: u64,
        /// Length of the unit's instruction buffer
        len: usize,
    },
    /// Relocation type this loader does not understand
    #[error("unknown relocation type {0}")]
    UnknownRelocation(u32),
    /// Relocation kind does not match the instruction it patches
    #[error("relocation at offset {offset:#x} of `{program}` does not fit opcode {opc:#04x}")]
    IncompatibleInstruction {
        /// Name of the program being patched
        program: String,
        /// Unit-relative byte offset of the relocation
        offset: u64,
        /// Opcode found at that offset
        opc: u8,
    },
    /// External symbol missing from the helper registry under strict mode
    #[error("unresolved external symbol `{name}` at instruction #{insn_index}")]
    UnresolvedSymbol {
        /// The symbol name
        name: String,
        /// Instruction index of the reference
        insn_index: usize,
    },
}

/// How a relocation patches its instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocationKind {
    /// 64 bit payload split across the immediates of a `lddw` pair
    LoadImm64,
    /// 32 bit call target immediate
    Call,
}

impl RelocationKind {
    fn from_r_type(r_type: u32) -> Option<Self> {
        match r_type {
            R_BPF_64_64 => Some(RelocationKind::LoadImm64),
            R_BPF_64_32 => Some(RelocationKind::Call),
            _ => None,
        }
    }

    /// Bytes the patch spans, checked against the buffer before writing
    fn span(self) -> usize {
        match self {
            RelocationKind::LoadImm64 => INSN_SIZE.saturating_mul(2),
            RelocationKind::Call => INSN_SIZE,
        }
    }
}

/// What a relocation's symbol turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedReference {
    /// The symbol names a map; payload is the descriptor position
    Map {
        /// Descriptor position in declaration order
        index: usize,
    },
    /// The symbol is a function with its own program unit
    Function {
        /// Index of the called unit
        unit: usize,
    },
    /// The symbol lives in a non-executable data section of the object
    Data {
        /// The symbol's offset within the object
        address: u64,
    },
    /// The symbol is external to the object
    External {
        /// The symbol name
        name: String,
        /// Numeric id when the helper registry knows the name
        id: Option<u32>,
    },
}

/// Shared inputs of one resolution pass
pub(crate) struct Resolver<'a> {
    pub image: &'a ElfImage,
    pub layout: &'a SectionLayout,
    pub maps: &'a [MapSpec],
    pub units: &'a UnitIndex,
    pub helpers: &'a HelperRegistry,
    pub strict: bool,
}

impl<'a> Resolver<'a> {
    /// Apply the given relocations to `unit`, in increasing offset order.
    /// Offsets are section relative; the caller hands each unit the entries
    /// that fall inside it.
    pub fn resolve_unit(
        &self,
        unit: &mut ProgramUnit,
        relocations: &[Rel],
    ) -> Result<(), RelocationError> {
        let mut relocations = relocations.to_vec();
        relocations.sort_by_key(|rel| rel.offset);

        debug!("relocating `{}`: {} entries", unit.name, relocations.len());
        for rel in &relocations {
            let kind = RelocationKind::from_r_type(rel.r_type)
                .ok_or(RelocationError::UnknownRelocation(rel.r_type))?;
            let reference = self.classify(rel)?;
            self.patch(unit, rel.offset.saturating_sub(unit.start), kind, reference)?;
        }
        Ok(())
    }

    /// Decide what the relocation's symbol is
    fn classify(&self, rel: &Rel) -> Result<ResolvedReference, RelocationError> {
        let symbol = self
            .image
            .symbol(rel.symbol_index)
            .ok_or(RelocationError::UnknownSymbol(rel.symbol_index))?;

        match symbol.section {
            SymbolSection::Defined(section) if Some(section) == self.layout.maps => {
                let index = self
                    .maps
                    .iter()
                    .position(|map| map.offset == symbol.value)
                    .ok_or_else(|| RelocationError::UnknownMap {
                        symbol: symbol.name.clone(),
                        offset: symbol.value,
                    })?;
                Ok(ResolvedReference::Map { index })
            }
            SymbolSection::Defined(section)
                if self
                    .image
                    .section(section)
                    .map(|s| s.is_executable())
                    .unwrap_or(false) =>
            {
                let unit = self.units.lookup(section, symbol.value).ok_or_else(|| {
                    RelocationError::UnknownFunction {
                        symbol: symbol.name.clone(),
                        section: self
                            .image
                            .section(section)
                            .map(|s| s.name.clone())
                            .unwrap_or_default(),
                        offset: symbol.value,
                    }
                })?;
                Ok(ResolvedReference::Function { unit })
            }
            SymbolSection::Defined(_) => Ok(ResolvedReference::Data {
                address: symbol.value,
            }),
            SymbolSection::Undefined | SymbolSection::Absolute | SymbolSection::Common => {
                Ok(ResolvedReference::External {
                    name: symbol.name.clone(),
                    id: self.helpers.resolve(&symbol.name),
                })
            }
        }
    }

    /// Rewrite the instruction at `offset`. Bounds and alignment are
    /// established before any write; a failing relocation never leaves a
    /// half patched buffer behind.
    fn patch(
        &self,
        unit: &mut ProgramUnit,
        offset: u64,
        kind: RelocationKind,
        reference: ResolvedReference,
    ) -> Result<(), RelocationError> {
        let byte_offset = offset as usize;
        if offset % INSN_SIZE as u64 != 0
            || byte_offset.saturating_add(kind.span()) > unit.insns.len()
        {
            return Err(RelocationError::RelocationOutOfBounds {
                program: unit.name.clone(),
                offset,
                len: unit.insns.len(),
            });
        }
        let insn_index = byte_offset / INSN_SIZE;
        let opc = unit.insns[byte_offset];

        match reference {
            ResolvedReference::Map { index } => {
                if kind != RelocationKind::LoadImm64 || opc != LD_DW_IMM {
                    return Err(self.incompatible(unit, offset, opc));
                }
                ebpf::set_src_reg(&mut unit.insns, insn_index, BPF_PSEUDO_MAP_FD);
                // descriptor position for now; realizing the maps swaps in
                // the runtime handle
                ebpf::write_imm(&mut unit.insns, insn_index, index as u32);
                ebpf::write_imm(&mut unit.insns, insn_index.saturating_add(1), 0);
                unit.map_patches.push(MapPatch {
                    insn_index,
                    map_index: index,
                });
            }
            ResolvedReference::Data { address } => {
                if kind != RelocationKind::LoadImm64 || opc != LD_DW_IMM {
                    return Err(self.incompatible(unit, offset, opc));
                }
                ebpf::write_imm(&mut unit.insns, insn_index, (address & 0xffff_ffff) as u32);
                ebpf::write_imm(
                    &mut unit.insns,
                    insn_index.saturating_add(1),
                    address.wrapping_shr(32) as u32,
                );
            }
            ResolvedReference::Function { unit: target } => {
                if kind != RelocationKind::Call || opc != CALL_IMM {
                    return Err(self.incompatible(unit, offset, opc));
                }
                ebpf::set_src_reg(&mut unit.insns, insn_index, BPF_PSEUDO_CALL);
                // the assembler rewrites this to the flattened offset
                LittleEndian::write_i32(
                    &mut unit.insns[byte_offset.saturating_add(4)..byte_offset.saturating_add(8)],
                    -1,
                );
                unit.calls.push(CallSite { insn_index, target });
            }
            ResolvedReference::External { name, id } => match id {
                Some(id) => {
                    ebpf::write_imm(&mut unit.insns, insn_index, id);
                }
                None if self.strict => {
                    return Err(RelocationError::UnresolvedSymbol { name, insn_index });
                }
                None => {
                    warn!(
                        "deferring unresolved external symbol `{}` in `{}`",
                        name, unit.name
                    );
                    // the execution environment looks the hash up later
                    ebpf::write_imm(&mut unit.insns, insn_index, hash_symbol_name(name.as_bytes()));
                    unit.warnings.push(UnresolvedSymbol { name, insn_index });
                }
            },
        }
        Ok(())
    }

    fn incompatible(&self, unit: &ProgramUnit, offset: u64, opc: u8) -> RelocationError {
        RelocationError::IncompatibleInstruction {
            program: unit.name.clone(),
            offset,
            opc,
        }
    }
}
