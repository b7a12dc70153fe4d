//! Map definitions embedded in the maps section.

// A map definition is a fixed-layout record of six little-endian u32 fields:
// type, key size, value size, max entries, flags, inner map index. The
// compiler convention makes the last two value fields mutually exclusive:
// map-in-map types carry an inner index and no value size.

use crate::elf::{ElfImage, SymbolSection};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

/// Size of one map definition record in bytes
pub const MAP_DEF_SIZE: usize = 24;

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MapError {
    /// Record reaches past the end of the maps section
    #[error("map `{name}`: definition at offset {offset:#x} is truncated")]
    TruncatedDefinition {
        /// The map name
        name: String,
        /// Record offset within the maps section
        offset: u64,
    },
    /// Numeric map type not known to this loader
    #[error("map `{name}`: unknown map type {value}")]
    UnknownMapType {
        /// The map name
        name: String,
        /// The raw type field
        value: u32,
    },
    /// Inner map reference is out of range, self-referential, or itself
    /// a map-in-map
    #[error("map `{name}`: invalid inner map reference {index} ({count} maps defined)")]
    InvalidMapReference {
        /// The referencing map name
        name: String,
        /// The referenced descriptor position
        index: usize,
        /// Number of descriptors in the object
        count: usize,
    },
}

/// Kind of key/value store a descriptor realizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    /// Placeholder type, never valid for creation
    Unspec,
    /// Hash table
    Hash,
    /// Fixed-size array indexed by u32
    Array,
    /// Array of program identifiers for tail calls
    ProgramArray,
    /// Array of perf event queues
    PerfEventArray,
    /// Per-CPU hash table
    PercpuHash,
    /// Per-CPU array
    PercpuArray,
    /// Stack trace storage
    StackTrace,
    /// Array of cgroup identifiers
    CgroupArray,
    /// Hash table with least-recently-used eviction
    LruHash,
    /// Per-CPU LRU hash table
    LruPercpuHash,
    /// Longest-prefix-match trie
    LpmTrie,
    /// Array whose values are other maps
    ArrayOfMaps,
    /// Hash table whose values are other maps
    HashOfMaps,
}

impl MapType {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MapType::Unspec),
            1 => Some(MapType::Hash),
            2 => Some(MapType::Array),
            3 => Some(MapType::ProgramArray),
            4 => Some(MapType::PerfEventArray),
            5 => Some(MapType::PercpuHash),
            6 => Some(MapType::PercpuArray),
            7 => Some(MapType::StackTrace),
            8 => Some(MapType::CgroupArray),
            9 => Some(MapType::LruHash),
            10 => Some(MapType::LruPercpuHash),
            11 => Some(MapType::LpmTrie),
            12 => Some(MapType::ArrayOfMaps),
            13 => Some(MapType::HashOfMaps),
            _ => None,
        }
    }

    /// Whether values of this map are handles of other maps
    pub fn is_map_of_maps(self) -> bool {
        matches!(self, MapType::ArrayOfMaps | MapType::HashOfMaps)
    }
}

/// What the values of a map are
///
/// The two cases are mutually exclusive by the compiler's record layout
/// convention, so they are modeled as a tagged variant instead of two
/// optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapPayload {
    /// Values are opaque byte strings of a fixed size
    Value {
        /// Size of one value in bytes
        value_size: u32,
    },
    /// Values are handles of maps built from another descriptor
    InnerMap {
        /// Position of the inner descriptor in declaration order
        index: usize,
    },
}

/// A single decoded map definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDescriptor {
    /// Kind of store
    pub map_type: MapType,
    /// Size of one key in bytes
    pub key_size: u32,
    /// Capacity in entries
    pub max_entries: u32,
    /// Creation flags, passed through to the map collaborator
    pub flags: u32,
    /// Value layout
    pub payload: MapPayload,
}

impl MapDescriptor {
    /// Value size for plain maps, absent for map-in-map descriptors
    pub fn value_size(&self) -> Option<u32> {
        match self.payload {
            MapPayload::Value { value_size } => Some(value_size),
            MapPayload::InnerMap { .. } => None,
        }
    }

    /// Inner descriptor position for map-in-map descriptors
    pub fn inner_index(&self) -> Option<usize> {
        match self.payload {
            MapPayload::Value { .. } => None,
            MapPayload::InnerMap { index } => Some(index),
        }
    }
}

/// A named map definition; order of appearance is the map's identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSpec {
    /// Name of the defining symbol
    pub name: String,
    /// Record offset within the maps section
    pub(crate) offset: u64,
    /// The decoded definition
    pub descriptor: MapDescriptor,
}

/// Opaque handle to a realized runtime map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHandle(u32);

impl MapHandle {
    /// Wrap a raw map identifier
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw identifier, as patched into `lddw` immediates
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Collaborator that turns descriptors into runtime maps
///
/// Called once per descriptor, sequentially, in declaration order, except
/// that a map-in-map descriptor's inner map is realized first.
pub trait MapFactory {
    /// Error returned when a map cannot be realized
    type Error: std::error::Error + Send + Sync + 'static;

    /// Realize one descriptor. `inner` carries the handle of the referenced
    /// inner map for map-in-map descriptors and is `None` otherwise.
    fn create_map(
        &mut self,
        name: &str,
        descriptor: &MapDescriptor,
        inner: Option<&MapHandle>,
    ) -> Result<MapHandle, Self::Error>;
}

/// Decode all map definitions named by symbols of the maps section, in
/// declaration (ascending offset) order
pub(crate) fn parse_maps(image: &ElfImage, maps_section: usize) -> Result<Vec<MapSpec>, MapError> {
    let section = &image.sections()[maps_section];
    let data = image.data(section);

    let mut names: Vec<(u64, String)> = image
        .symbols()
        .iter()
        .filter(|symbol| {
            symbol.section == SymbolSection::Defined(maps_section) && !symbol.name.is_empty()
        })
        .map(|symbol| (symbol.value, symbol.name.clone()))
        .collect();
    names.sort_by_key(|(offset, _)| *offset);
    names.dedup_by_key(|(offset, _)| *offset);

    let mut maps = Vec::with_capacity(names.len());
    for (offset, name) in names {
        let descriptor = decode_record(&name, data, offset)?;
        maps.push(MapSpec {
            name,
            offset,
            descriptor,
        });
    }

    let count = maps.len();
    for position in 0..count {
        if let MapPayload::InnerMap { index } = maps[position].descriptor.payload {
            let nested = maps
                .get(index)
                .map(|inner| inner.descriptor.map_type.is_map_of_maps())
                .unwrap_or(true);
            if index == position || nested {
                return Err(MapError::InvalidMapReference {
                    name: maps[position].name.clone(),
                    index,
                    count,
                });
            }
        }
    }

    debug!("parsed {} map definitions", maps.len());
    Ok(maps)
}

/// Decode one fixed-layout record
///
/// For map-in-map types the value size field is dead by convention and is
/// never read; for all other types the inner index field is never read.
pub(crate) fn decode_record(
    name: &str,
    data: &[u8],
    offset: u64,
) -> Result<MapDescriptor, MapError> {
    let record = offset
        .checked_add(MAP_DEF_SIZE as u64)
        .and_then(|end| data.get(offset as usize..end as usize))
        .ok_or_else(|| MapError::TruncatedDefinition {
            name: name.to_string(),
            offset,
        })?;

    let raw_type = LittleEndian::read_u32(&record[0..4]);
    let map_type = MapType::from_u32(raw_type).ok_or_else(|| MapError::UnknownMapType {
        name: name.to_string(),
        value: raw_type,
    })?;
    let payload = if map_type.is_map_of_maps() {
        MapPayload::InnerMap {
            index: LittleEndian::read_u32(&record[20..24]) as usize,
        }
    } else {
        MapPayload::Value {
            value_size: LittleEndian::read_u32(&record[8..12]),
        }
    };

    Ok(MapDescriptor {
        map_type,
        key_size: LittleEndian::read_u32(&record[4..8]),
        max_entries: LittleEndian::read_u32(&record[12..16]),
        flags: LittleEndian::read_u32(&record[16..20]),
        payload,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(fields: [u32; 6]) -> Vec<u8> {
        let mut data = vec![0u8; MAP_DEF_SIZE];
        for (index, field) in fields.iter().enumerate() {
            LittleEndian::write_u32(&mut data[index * 4..index * 4 + 4], *field);
        }
        data
    }

    #[test]
    fn test_decode_plain_map() {
        let data = record([1, 4, 2, 42, 4242, 0]);
        let descriptor = decode_record("hash_map", &data, 0).unwrap();
        assert_eq!(descriptor.map_type, MapType::Hash);
        assert_eq!(descriptor.key_size, 4);
        assert_eq!(descriptor.value_size(), Some(2));
        assert_eq!(descriptor.max_entries, 42);
        assert_eq!(descriptor.flags, 4242);
        assert_eq!(descriptor.inner_index(), None);
    }

    #[test]
    fn test_decode_map_in_map_ignores_value_size() {
        // value size field deliberately filled with garbage
        let data = record([12, 4, 0xdead_beef, 2, 0, 1]);
        let descriptor = decode_record("array_of_maps", &data, 0).unwrap();
        assert_eq!(descriptor.map_type, MapType::ArrayOfMaps);
        assert_eq!(descriptor.payload, MapPayload::InnerMap { index: 1 });
        assert_eq!(descriptor.value_size(), None);
    }

    #[test]
    fn test_decode_truncated_record() {
        let data = record([1, 4, 2, 42, 0, 0]);
        assert_eq!(
            decode_record("short", &data, 8),
            Err(MapError::TruncatedDefinition {
                name: "short".to_string(),
                offset: 8,
            })
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let data = record([77, 4, 2, 42, 0, 0]);
        assert_eq!(
            decode_record("bogus", &data, 0),
            Err(MapError::UnknownMapType {
                name: "bogus".to_string(),
                value: 77,
            })
        );
    }
}
