//! Facade turning raw object bytes into assembled programs and map specs.

use crate::{
    assembler::{self, AssemblyError},
    ebpf,
    elf::{ElfError, ElfImage},
    helpers::HelperRegistry,
    maps::{self, MapError, MapFactory, MapHandle, MapPayload, MapSpec},
    program::{collect_units, MapPatch, UnresolvedSymbol},
    relocation::{RelocationError, Resolver},
    section::SectionLayout,
};
use log::debug;
use std::collections::BTreeSet;

/// Error definitions
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Structural problem with the object file
    #[error(transparent)]
    Elf(#[from] ElfError),
    /// Problem decoding the map definitions
    #[error(transparent)]
    Map(#[from] MapError),
    /// A relocation of this program could not be applied
    #[error("error relocating `{program}`")]
    Relocation {
        /// The program being relocated
        program: String,
        /// The underlying failure
        #[source]
        source: RelocationError,
    },
    /// The map collaborator failed; the load aborts
    #[error("failed to create map `{name}`")]
    MapCreation {
        /// The map being realized
        name: String,
        /// The collaborator's error, verbatim
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The maps of this object were already realized
    #[error("maps were already realized for this object")]
    MapsAlreadyRealized,
}

/// Load behavior knobs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Fail the load instead of deferring when an external symbol is not in
    /// the helper registry
    pub strict_externals: bool,
    /// Only sections with these names, or with a `name/…` prefix, become
    /// entry programs; `None` loads every entry section
    pub section_filter: Option<BTreeSet<String>>,
}

/// An assembled entry program, ready for verification and execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedProgram {
    /// Name of the entry function symbol
    pub name: String,
    /// Name of the originating section
    pub section_name: String,
    /// License of the object, if it carries one
    pub license: Option<String>,
    /// External symbols whose resolution was deferred
    pub warnings: Vec<UnresolvedSymbol>,
    insns: Vec<u8>,
    map_patches: Vec<MapPatch>,
}

impl LoadedProgram {
    /// The flattened instruction stream
    pub fn instructions(&self) -> &[u8] {
        &self.insns
    }

    /// Number of instruction slots
    pub fn instruction_count(&self) -> usize {
        self.insns.len() / ebpf::INSN_SIZE
    }

    /// Map reference sites within [`Self::instructions`]
    pub fn map_patches(&self) -> &[MapPatch] {
        &self.map_patches
    }
}

/// An entry program dropped because its call graph could not be flattened
#[derive(Debug, PartialEq, Eq)]
pub struct RejectedProgram {
    /// Name of the entry function symbol
    pub name: String,
    /// Name of the originating section
    pub section_name: String,
    /// Why assembly failed
    pub error: AssemblyError,
}

/// Everything extracted from one object file
///
/// Produced by [`Object::load`] (pass one). [`Object::realize_maps`] is the
/// optional second pass that swaps descriptor positions for runtime handles
/// once the map collaborator has created the maps.
#[derive(Debug)]
pub struct Object {
    /// Assembled entry programs, in section order
    pub programs: Vec<LoadedProgram>,
    /// Map definitions, in declaration order
    pub maps: Vec<MapSpec>,
    /// Entry programs rejected during assembly
    pub rejected: Vec<RejectedProgram>,
    /// Kernel version the object declares, if any
    pub version: Option<u32>,
    handles: Option<Vec<MapHandle>>,
}

impl Object {
    /// Parse, resolve and assemble an object file
    pub fn load(
        bytes: &[u8],
        options: &LoadOptions,
        helpers: &HelperRegistry,
    ) -> Result<Self, LoadError> {
        let image = ElfImage::parse(bytes)?;
        let layout = SectionLayout::classify(&image)?;
        let maps = match layout.maps {
            Some(index) => maps::parse_maps(&image, index)?,
            None => Vec::new(),
        };
        let (mut units, index) = collect_units(&image, &layout)?;

        let resolver = Resolver {
            image: &image,
            layout: &layout,
            maps: &maps,
            units: &index,
            helpers,
            strict: options.strict_externals,
        };
        for program_section in &layout.programs {
            let relocations = match program_section.relocation {
                // no relocation section: the instructions are already final
                None => continue,
                Some(index) => image.relocations(index)?,
            };
            let section_units: Vec<usize> = units
                .iter()
                .enumerate()
                .filter(|(_, unit)| unit.section_index == program_section.section)
                .map(|(position, _)| position)
                .collect();
            for (position, &unit_index) in section_units.iter().enumerate() {
                let last = position.saturating_add(1) == section_units.len();
                let unit = &units[unit_index];
                let end = unit.start.saturating_add(unit.insns.len() as u64);
                // entries past the section's last unit stay with it so
                // out-of-bounds offsets are diagnosed, not dropped
                let mine: Vec<_> = relocations
                    .iter()
                    .filter(|rel| rel.offset >= unit.start && (rel.offset < end || last))
                    .copied()
                    .collect();
                let unit = &mut units[unit_index];
                resolver
                    .resolve_unit(unit, &mine)
                    .map_err(|source| LoadError::Relocation {
                        program: unit.name.clone(),
                        source,
                    })?;
            }
        }

        let mut programs = Vec::new();
        let mut rejected = Vec::new();
        for (position, unit) in units.iter().enumerate() {
            if !unit.entry || !section_matches(&options.section_filter, &unit.section_name) {
                continue;
            }
            match assembler::assemble(position, &units) {
                Ok(assembled) => programs.push(LoadedProgram {
                    name: unit.name.clone(),
                    section_name: unit.section_name.clone(),
                    license: layout.license.clone(),
                    warnings: assembled.warnings,
                    insns: assembled.insns,
                    map_patches: assembled.map_patches,
                }),
                Err(error) => rejected.push(RejectedProgram {
                    name: unit.name.clone(),
                    section_name: unit.section_name.clone(),
                    error,
                }),
            }
        }

        debug!(
            "loaded {} programs ({} rejected), {} maps",
            programs.len(),
            rejected.len(),
            maps.len()
        );
        Ok(Self {
            programs,
            maps,
            rejected,
            version: layout.version,
            handles: None,
        })
    }

    /// Realize every map through the collaborator and patch the programs'
    /// map reference immediates with the returned handle ids.
    ///
    /// Maps are created sequentially in declaration order, except that a
    /// map-in-map descriptor's inner map is created first when it has not
    /// been realized yet. Handles are returned in declaration order.
    pub fn realize_maps<F: MapFactory>(
        &mut self,
        factory: &mut F,
    ) -> Result<Vec<MapHandle>, LoadError> {
        if self.handles.is_some() {
            return Err(LoadError::MapsAlreadyRealized);
        }

        let mut slots: Vec<Option<MapHandle>> = vec![None; self.maps.len()];
        for index in 0..self.maps.len() {
            if slots[index].is_some() {
                continue;
            }
            let inner = match self.maps[index].descriptor.payload {
                MapPayload::InnerMap { index: inner } => {
                    if slots[inner].is_none() {
                        slots[inner] = Some(Self::create_one(factory, &self.maps[inner], None)?);
                    }
                    slots[inner]
                }
                MapPayload::Value { .. } => None,
            };
            slots[index] = Some(Self::create_one(
                factory,
                &self.maps[index],
                inner.as_ref(),
            )?);
        }
        let handles: Vec<MapHandle> = slots.into_iter().flatten().collect();
        debug_assert_eq!(handles.len(), self.maps.len());

        for program in &mut self.programs {
            for position in 0..program.map_patches.len() {
                let patch = program.map_patches[position];
                ebpf::write_imm(
                    &mut program.insns,
                    patch.insn_index,
                    handles[patch.map_index].id(),
                );
            }
        }

        self.handles = Some(handles.clone());
        Ok(handles)
    }

    /// Handles from a previous [`Self::realize_maps`] call, in declaration
    /// order
    pub fn map_handles(&self) -> Option<&[MapHandle]> {
        self.handles.as_deref()
    }

    fn create_one<F: MapFactory>(
        factory: &mut F,
        spec: &MapSpec,
        inner: Option<&MapHandle>,
    ) -> Result<MapHandle, LoadError> {
        factory
            .create_map(&spec.name, &spec.descriptor, inner)
            .map_err(|source| LoadError::MapCreation {
                name: spec.name.clone(),
                source: Box::new(source),
            })
    }
}

fn section_matches(filter: &Option<BTreeSet<String>>, name: &str) -> bool {
    match filter {
        None => true,
        Some(filter) => filter.iter().any(|candidate| {
            name == candidate.as_str()
                || (name.starts_with(candidate.as_str())
                    && name.as_bytes().get(candidate.len()) == Some(&b'/'))
        }),
    }
}
