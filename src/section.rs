//! Partitioning of object sections by role.

use crate::elf::{consts::SHT_REL, ElfError, ElfImage};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::collections::BTreeMap;

/// Name of the section holding map definition records
pub(crate) const MAPS_SECTION: &str = "maps";
/// Name of the section holding the license string
pub(crate) const LICENSE_SECTION: &str = "license";
/// Name of the section holding the kernel version word
pub(crate) const VERSION_SECTION: &str = "version";
/// Section holding program-local functions shared between entry programs
pub(crate) const TEXT_SECTION: &str = ".text";

/// An executable section together with the relocation section patching it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProgramSection {
    /// Header table index of the instruction section
    pub section: usize,
    /// Header table index of the associated `SHT_REL` section, if any.
    /// Sections without one take the short path that skips resolution.
    pub relocation: Option<usize>,
}

/// Object sections partitioned by role
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SectionLayout {
    /// Header table index of the maps section
    pub maps: Option<usize>,
    /// Contents of the license section
    pub license: Option<String>,
    /// Contents of the version section
    pub version: Option<u32>,
    /// Executable sections in header table order
    pub programs: Vec<ProgramSection>,
}

impl SectionLayout {
    /// Sort sections into maps, metadata and program sections, and pair each
    /// program section with the relocation section that patches it
    pub fn classify(image: &ElfImage) -> Result<Self, ElfError> {
        let mut layout = Self::default();
        let mut program_sections = Vec::new();
        let mut relocation_for = BTreeMap::new();

        for (index, section) in image.sections().iter().enumerate() {
            if section.sh_type == SHT_REL {
                let target = section.info;
                image.section(target)?;
                if relocation_for.insert(target, index).is_some() {
                    return Err(ElfError::DuplicateRelocationSection(
                        image.section(target)?.name.clone(),
                    ));
                }
                continue;
            }
            if section.is_executable() && !section.is_empty() {
                program_sections.push(index);
                continue;
            }
            match section.name.as_str() {
                MAPS_SECTION => layout.maps = Some(index),
                LICENSE_SECTION => {
                    layout.license = Some(parse_license(image.data(section))?);
                }
                VERSION_SECTION => {
                    let data = image.data(section);
                    if data.len() < 4 {
                        return Err(ElfError::MalformedHeader("version section too short"));
                    }
                    layout.version = Some(LittleEndian::read_u32(&data[0..4]));
                }
                _ => {}
            }
        }

        layout.programs = program_sections
            .into_iter()
            .map(|section| ProgramSection {
                section,
                relocation: relocation_for.get(&section).copied(),
            })
            .collect();

        debug!(
            "classified {} program sections, maps section: {:?}, license: {:?}",
            layout.programs.len(),
            layout.maps,
            layout.license
        );
        Ok(layout)
    }
}

/// License strings are NUL terminated C strings
fn parse_license(data: &[u8]) -> Result<String, ElfError> {
    let end = data.iter().position(|&byte| byte == 0).unwrap_or(data.len());
    std::str::from_utf8(&data[..end])
        .map(str::to_string)
        .map_err(|_| ElfError::MalformedHeader("license is not a valid string"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_license() {
        assert_eq!(parse_license(b"MIT\0").unwrap(), "MIT");
        assert_eq!(parse_license(b"Dual MIT/GPL").unwrap(), "Dual MIT/GPL");
        assert!(parse_license(b"\xff\xfe\0").is_err());
    }
}
