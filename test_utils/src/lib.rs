#![allow(dead_code)]

use bpf_object::ebpf::{self, Insn, INSN_SIZE};
use bpf_object::elf::consts::{
    ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_BPF, ET_REL, REL_SIZE, SHDR_SIZE, SHF_EXECINSTR,
    SHT_PROGBITS, SHT_REL, SHT_STRTAB, SHT_SYMTAB, SYM_SIZE,
};
use bpf_object::maps::{MapDescriptor, MapFactory, MapHandle};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;
use std::fmt;

/// Assert that the `Debug` rendering of a result contains the formatted text
#[macro_export]
macro_rules! assert_error {
    ($result:expr, $($error:expr),+) => {
        assert!(format!("{:?}", $result).contains(&format!($($error),+)));
    }
}

// ---------------------------------------------------------------------------
// instruction builders

/// `mov64 dst, imm`
pub fn mov64_imm(dst: u8, imm: i64) -> [u8; INSN_SIZE] {
    Insn {
        opc: ebpf::MOV64_IMM,
        dst,
        src: 0,
        off: 0,
        imm,
    }
    .to_array()
}

/// `mov64 dst, src`
pub fn mov64_reg(dst: u8, src: u8) -> [u8; INSN_SIZE] {
    Insn {
        opc: ebpf::MOV64_REG,
        dst,
        src,
        off: 0,
        imm: 0,
    }
    .to_array()
}

/// `call imm`
pub fn call_imm(imm: i64) -> [u8; INSN_SIZE] {
    Insn {
        opc: ebpf::CALL_IMM,
        dst: 0,
        src: 0,
        off: 0,
        imm,
    }
    .to_array()
}

/// `exit`
pub fn exit() -> [u8; INSN_SIZE] {
    Insn {
        opc: ebpf::EXIT,
        dst: 0,
        src: 0,
        off: 0,
        imm: 0,
    }
    .to_array()
}

/// `lddw dst, imm` occupying two instruction slots
pub fn lddw(dst: u8, imm: i64) -> [u8; 2 * INSN_SIZE] {
    let mut slots = [0u8; 2 * INSN_SIZE];
    slots[..INSN_SIZE].copy_from_slice(
        &Insn {
            opc: ebpf::LD_DW_IMM,
            dst,
            src: 0,
            off: 0,
            imm: imm & 0xffff_ffff,
        }
        .to_array(),
    );
    LittleEndian::write_i32(&mut slots[12..16], (imm >> 32) as i32);
    slots
}

/// Concatenate instruction slots into one buffer
pub fn prog(parts: &[&[u8]]) -> Vec<u8> {
    parts.iter().flat_map(|part| part.iter().copied()).collect()
}

/// A fixed-layout map definition record
pub fn map_def(
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    flags: u32,
    inner_map_idx: u32,
) -> [u8; 24] {
    let mut record = [0u8; 24];
    for (index, field) in [
        map_type,
        key_size,
        value_size,
        max_entries,
        flags,
        inner_map_idx,
    ]
    .iter()
    .enumerate()
    {
        LittleEndian::write_u32(&mut record[index * 4..index * 4 + 4], *field);
    }
    record
}

// ---------------------------------------------------------------------------
// ELF synthesis

struct SectionDef {
    name: String,
    sh_type: u32,
    flags: u64,
    data: Vec<u8>,
}

struct SymbolDef {
    name_offset: u32,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

/// Builds relocatable BPF ELF object images in memory.
///
/// Section and symbol indices returned by the `add` methods are the final
/// header/symbol table indices (the mandatory null entries occupy index 0).
pub struct ElfBuilder {
    sections: Vec<SectionDef>,
    symbols: Vec<SymbolDef>,
    strtab: Vec<u8>,
    rels: BTreeMap<u16, Vec<(u64, u32, u32)>>,
}

impl Default for ElfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            symbols: Vec::new(),
            strtab: vec![0],
            rels: BTreeMap::new(),
        }
    }

    /// Add a section; returns its header table index
    pub fn section(&mut self, name: &str, sh_type: u32, flags: u64, data: &[u8]) -> u16 {
        self.sections.push(SectionDef {
            name: name.to_string(),
            sh_type,
            flags,
            data: data.to_vec(),
        });
        self.sections.len() as u16
    }

    /// Add an executable program section
    pub fn exec(&mut self, name: &str, data: &[u8]) -> u16 {
        self.section(name, SHT_PROGBITS, SHF_EXECINSTR, data)
    }

    /// Add a non-executable data section
    pub fn progbits(&mut self, name: &str, data: &[u8]) -> u16 {
        self.section(name, SHT_PROGBITS, 0, data)
    }

    /// Add a symbol; returns its symbol table index
    pub fn symbol(&mut self, name: &str, shndx: u16, value: u64, size: u64, info: u8) -> u32 {
        let name_offset = self.strtab.len() as u32;
        self.strtab.extend_from_slice(name.as_bytes());
        self.strtab.push(0);
        self.symbols.push(SymbolDef {
            name_offset,
            info,
            shndx,
            value,
            size,
        });
        self.symbols.len() as u32
    }

    /// Add a global function symbol
    pub fn func(&mut self, name: &str, section: u16, value: u64, size: u64) -> u32 {
        self.symbol(name, section, value, size, 0x12)
    }

    /// Add a global object symbol
    pub fn object(&mut self, name: &str, section: u16, value: u64, size: u64) -> u32 {
        self.symbol(name, section, value, size, 0x11)
    }

    /// Add an undefined global symbol
    pub fn undefined(&mut self, name: &str) -> u32 {
        self.symbol(name, 0, 0, 0, 0x10)
    }

    /// Add one relocation entry against a target section
    pub fn rel(&mut self, target: u16, offset: u64, symbol: u32, r_type: u32) {
        self.rels
            .entry(target)
            .or_insert_with(Vec::new)
            .push((offset, symbol, r_type));
    }

    /// Emit the object file bytes
    pub fn build(&self) -> Vec<u8> {
        const EHDR_SIZE: usize = 64;

        let user_count = self.sections.len();
        let symtab_index = user_count + 1;
        let strtab_index = user_count + 2;
        let first_rel_index = user_count + 3;
        let shstr_index = first_rel_index + self.rels.len();
        let section_count = shstr_index + 1;

        // symbol table payload
        let mut symtab = vec![0u8; SYM_SIZE];
        for symbol in &self.symbols {
            let mut entry = [0u8; SYM_SIZE];
            LittleEndian::write_u32(&mut entry[0..4], symbol.name_offset);
            entry[4] = symbol.info;
            LittleEndian::write_u16(&mut entry[6..8], symbol.shndx);
            LittleEndian::write_u64(&mut entry[8..16], symbol.value);
            LittleEndian::write_u64(&mut entry[16..24], symbol.size);
            symtab.extend_from_slice(&entry);
        }

        // relocation payloads, one section per target
        let rel_payloads: Vec<(u16, Vec<u8>)> = self
            .rels
            .iter()
            .map(|(target, entries)| {
                let mut data = Vec::with_capacity(entries.len() * REL_SIZE);
                for (offset, symbol, r_type) in entries {
                    let mut entry = [0u8; REL_SIZE];
                    LittleEndian::write_u64(&mut entry[0..8], *offset);
                    LittleEndian::write_u64(
                        &mut entry[8..16],
                        (u64::from(*symbol) << 32) | u64::from(*r_type),
                    );
                    data.extend_from_slice(&entry);
                }
                (*target, data)
            })
            .collect();

        fn add_name(table: &mut Vec<u8>, name: &str) -> u32 {
            let offset = table.len() as u32;
            table.extend_from_slice(name.as_bytes());
            table.push(0);
            offset
        }

        fn place(bytes: &mut Vec<u8>, data: &[u8]) -> (u64, u64) {
            while bytes.len() % 8 != 0 {
                bytes.push(0);
            }
            let offset = bytes.len() as u64;
            bytes.extend_from_slice(data);
            (offset, data.len() as u64)
        }

        #[allow(clippy::too_many_arguments)]
        fn shdr(
            bytes: &mut Vec<u8>,
            name: u32,
            sh_type: u32,
            flags: u64,
            range: (u64, u64),
            link: u32,
            info: u32,
            entsize: u64,
        ) {
            let mut entry = [0u8; SHDR_SIZE];
            LittleEndian::write_u32(&mut entry[0..4], name);
            LittleEndian::write_u32(&mut entry[4..8], sh_type);
            LittleEndian::write_u64(&mut entry[8..16], flags);
            LittleEndian::write_u64(&mut entry[24..32], range.0);
            LittleEndian::write_u64(&mut entry[32..40], range.1);
            LittleEndian::write_u32(&mut entry[40..44], link);
            LittleEndian::write_u32(&mut entry[44..48], info);
            LittleEndian::write_u64(&mut entry[48..56], 8);
            LittleEndian::write_u64(&mut entry[56..64], entsize);
            bytes.extend_from_slice(&entry);
        }

        // section name string table
        let mut shstrtab = vec![0u8];
        let mut name_offsets = vec![0u32; section_count];
        for (position, section) in self.sections.iter().enumerate() {
            name_offsets[position + 1] = add_name(&mut shstrtab, &section.name);
        }
        name_offsets[symtab_index] = add_name(&mut shstrtab, ".symtab");
        name_offsets[strtab_index] = add_name(&mut shstrtab, ".strtab");
        for (position, (target, _)) in rel_payloads.iter().enumerate() {
            let target_name = &self.sections[*target as usize - 1].name;
            name_offsets[first_rel_index + position] =
                add_name(&mut shstrtab, &format!(".rel{}", target_name));
        }
        name_offsets[shstr_index] = add_name(&mut shstrtab, ".shstrtab");

        // lay out payloads after the file header, 8 byte aligned
        let mut bytes = vec![0u8; EHDR_SIZE];
        let user_ranges: Vec<(u64, u64)> = self
            .sections
            .iter()
            .map(|section| place(&mut bytes, &section.data))
            .collect();
        let symtab_range = place(&mut bytes, &symtab);
        let strtab_range = place(&mut bytes, &self.strtab);
        let rel_ranges: Vec<(u64, u64)> = rel_payloads
            .iter()
            .map(|(_, data)| place(&mut bytes, data))
            .collect();
        let shstr_range = place(&mut bytes, &shstrtab);

        // section header table
        while bytes.len() % 8 != 0 {
            bytes.push(0);
        }
        let sh_offset = bytes.len() as u64;
        shdr(&mut bytes, 0, 0, 0, (0, 0), 0, 0, 0);
        for (position, section) in self.sections.iter().enumerate() {
            shdr(
                &mut bytes,
                name_offsets[position + 1],
                section.sh_type,
                section.flags,
                user_ranges[position],
                0,
                0,
                0,
            );
        }
        shdr(
            &mut bytes,
            name_offsets[symtab_index],
            SHT_SYMTAB,
            0,
            symtab_range,
            strtab_index as u32,
            1,
            SYM_SIZE as u64,
        );
        shdr(
            &mut bytes,
            name_offsets[strtab_index],
            SHT_STRTAB,
            0,
            strtab_range,
            0,
            0,
            0,
        );
        for (position, (target, _)) in rel_payloads.iter().enumerate() {
            shdr(
                &mut bytes,
                name_offsets[first_rel_index + position],
                SHT_REL,
                0,
                rel_ranges[position],
                symtab_index as u32,
                u32::from(*target),
                REL_SIZE as u64,
            );
        }
        shdr(
            &mut bytes,
            name_offsets[shstr_index],
            SHT_STRTAB,
            0,
            shstr_range,
            0,
            0,
            0,
        );

        // file header
        bytes[0..4].copy_from_slice(&ELFMAG);
        bytes[4] = ELFCLASS64;
        bytes[5] = ELFDATA2LSB;
        bytes[6] = 1;
        LittleEndian::write_u16(&mut bytes[16..18], ET_REL);
        LittleEndian::write_u16(&mut bytes[18..20], EM_BPF);
        LittleEndian::write_u32(&mut bytes[20..24], 1);
        LittleEndian::write_u64(&mut bytes[40..48], sh_offset);
        LittleEndian::write_u16(&mut bytes[52..54], EHDR_SIZE as u16);
        LittleEndian::write_u16(&mut bytes[58..60], SHDR_SIZE as u16);
        LittleEndian::write_u16(&mut bytes[60..62], section_count as u16);
        LittleEndian::write_u16(&mut bytes[62..64], shstr_index as u16);
        bytes
    }
}

// ---------------------------------------------------------------------------
// map collaborator stub

/// Error produced by [`FakeMapFactory`]
#[derive(Debug)]
pub struct FakeCreationError(pub String);

impl fmt::Display for FakeCreationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "refused to create `{}`", self.0)
    }
}

impl std::error::Error for FakeCreationError {}

/// Map collaborator handing out sequential ids and recording every call
#[derive(Debug, Default)]
pub struct FakeMapFactory {
    pub next_id: u32,
    /// (name, inner handle id) per create call, in call order
    pub created: Vec<(String, Option<u32>)>,
    /// Fail when asked to create this map
    pub fail_on: Option<String>,
}

impl FakeMapFactory {
    pub fn new(first_id: u32) -> Self {
        Self {
            next_id: first_id,
            created: Vec::new(),
            fail_on: None,
        }
    }
}

impl MapFactory for FakeMapFactory {
    type Error = FakeCreationError;

    fn create_map(
        &mut self,
        name: &str,
        _descriptor: &MapDescriptor,
        inner: Option<&MapHandle>,
    ) -> Result<MapHandle, Self::Error> {
        if self.fail_on.as_deref() == Some(name) {
            return Err(FakeCreationError(name.to_string()));
        }
        self.created
            .push((name.to_string(), inner.map(|handle| handle.id())));
        let handle = MapHandle::new(self.next_id);
        self.next_id += 1;
        Ok(handle)
    }
}
