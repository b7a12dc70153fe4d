//! Loader and relocation resolver for relocatable BPF ELF object files.
//!
//! The input is an object file as emitted by a restricted-C-to-BPF compiler:
//! programs in executable sections, map definitions in a `maps` section, and
//! relocation tables tying instruction immediates to symbols. Loading walks
//! that object in stages:
//!
//! 1. [`elf::ElfImage::parse`] turns the bytes into sections and symbols.
//! 2. Sections are classified into programs, map definitions and metadata.
//! 3. Map definition records become [`maps::MapDescriptor`]s.
//! 4. Each relocation is resolved against a map, another program-local
//!    function, a data symbol, or the injected [`helpers::HelperRegistry`],
//!    and its instruction is patched in place.
//! 5. Cross-function calls are flattened into one self-contained instruction
//!    buffer per entry program.
//!
//! [`loader::Object::load`] drives all of it; a second pass,
//! [`loader::Object::realize_maps`], swaps the map reference immediates for
//! the runtime handles returned by a [`maps::MapFactory`].

#![warn(missing_docs)]

pub mod assembler;
pub mod ebpf;
pub mod elf;
pub mod helpers;
pub mod loader;
pub mod maps;
pub mod program;
pub mod relocation;
mod section;
