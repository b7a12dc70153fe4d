//! Program units: one relocatable instruction buffer per function.

use crate::{
    ebpf::INSN_SIZE,
    elf::{ElfError, ElfImage, SymbolSection},
    section::{SectionLayout, TEXT_SECTION},
};
use log::debug;
use std::collections::BTreeMap;

/// A call from one unit to another, recorded during relocation resolution
/// and rewritten by the assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallSite {
    /// Instruction index of the call within the calling unit
    pub insn_index: usize,
    /// Index of the called unit
    pub target: usize,
}

/// A `lddw` whose immediate holds a map reference
///
/// During resolution the immediate is the descriptor position; realizing the
/// maps rewrites it to the runtime handle id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapPatch {
    /// Instruction index of the `lddw`
    pub insn_index: usize,
    /// Descriptor position in declaration order
    pub map_index: usize,
}

/// An external symbol whose resolution was deferred to the execution
/// environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedSymbol {
    /// The symbol name
    pub name: String,
    /// Instruction index of the referencing instruction
    pub insn_index: usize,
}

/// One function's instructions under resolution
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ProgramUnit {
    /// Name of the defining function symbol, or of the section when the
    /// section has no function symbols
    pub name: String,
    /// Header table index of the originating section
    pub section_index: usize,
    /// Name of the originating section
    pub section_name: String,
    /// Byte offset of this unit within its section
    pub start: u64,
    /// Mutable copy of the unit's instructions, patched in place
    pub insns: Vec<u8>,
    /// Calls into other units
    pub calls: Vec<CallSite>,
    /// Map reference sites
    pub map_patches: Vec<MapPatch>,
    /// Deferred external symbols
    pub warnings: Vec<UnresolvedSymbol>,
    /// Whether this unit can be an entry program
    pub entry: bool,
}

impl ProgramUnit {
    /// Number of instruction slots
    pub fn insn_count(&self) -> usize {
        self.insns.len() / INSN_SIZE
    }

    /// Whether a section-relative byte offset falls inside this unit
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.start.saturating_add(self.insns.len() as u64)
    }
}

/// Units addressable by (section, offset), so a call can reference a unit
/// defined later in the symbol table than its caller
#[derive(Debug, Default)]
pub(crate) struct UnitIndex {
    map: BTreeMap<(usize, u64), usize>,
}

impl UnitIndex {
    /// Unit starting at `offset` within section `section`
    pub fn lookup(&self, section: usize, offset: u64) -> Option<usize> {
        self.map.get(&(section, offset)).copied()
    }
}

/// Cut every executable section into units along its function symbols.
///
/// Function symbols sorted by value partition the section; a section without
/// function symbols becomes a single unit named after the section. Units in
/// sections other than `.text` starting at offset zero are entry candidates.
pub(crate) fn collect_units(
    image: &ElfImage,
    layout: &SectionLayout,
) -> Result<(Vec<ProgramUnit>, UnitIndex), ElfError> {
    let mut units = Vec::new();
    let mut index = UnitIndex::default();

    for program_section in &layout.programs {
        let section = image.section(program_section.section)?;
        let data = image.data(section);

        let mut starts: Vec<(u64, String)> = image
            .symbols()
            .iter()
            .filter(|symbol| {
                symbol.section == SymbolSection::Defined(program_section.section)
                    && !symbol.name.is_empty()
                    && (symbol.is_function() || symbol.is_global())
            })
            .map(|symbol| (symbol.value, symbol.name.clone()))
            .collect();
        starts.sort_by(|a, b| a.0.cmp(&b.0));
        starts.dedup_by_key(|(offset, _)| *offset);
        if starts.first().map(|(offset, _)| *offset) != Some(0) {
            starts.insert(0, (0, section.name.clone()));
        }

        for (position, (start, name)) in starts.iter().enumerate() {
            if start % INSN_SIZE as u64 != 0 {
                return Err(ElfError::MisalignedFunction {
                    name: name.clone(),
                    offset: *start,
                });
            }
            let end = starts
                .get(position.saturating_add(1))
                .map(|(next, _)| *next as usize)
                .unwrap_or_else(|| data.len());
            index
                .map
                .insert((program_section.section, *start), units.len());
            units.push(ProgramUnit {
                name: name.clone(),
                section_index: program_section.section,
                section_name: section.name.clone(),
                start: *start,
                insns: data[*start as usize..end].to_vec(),
                calls: Vec::new(),
                map_patches: Vec::new(),
                warnings: Vec::new(),
                entry: section.name != TEXT_SECTION && *start == 0,
            });
        }
    }

    debug!("collected {} program units", units.len());
    Ok((units, index))
}
