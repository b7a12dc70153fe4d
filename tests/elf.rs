use bpf_object::{
    assembler::AssemblyError,
    ebpf::{self, BPF_PSEUDO_CALL, BPF_PSEUDO_MAP_FD},
    elf::{
        consts::{R_BPF_64_32, R_BPF_64_64},
        ElfError,
    },
    helpers::HelperRegistry,
    loader::{LoadError, LoadOptions, Object},
    maps::{MapError, MapPayload, MapType},
    relocation::RelocationError,
};
use std::collections::BTreeSet;
use test_utils::{
    call_imm, exit, lddw, map_def, mov64_imm, prog, ElfBuilder, FakeMapFactory,
};

fn registry() -> HelperRegistry {
    let mut registry = HelperRegistry::new();
    registry.register("map_lookup_elem", 1);
    registry.register("map_update_elem", 2);
    registry.register("stringfn", 3);
    registry
}

/// The equivalent of the compiler fixture exercising every relocation kind:
/// two plain hash maps, an array-of-maps and hash-of-maps pointing at them,
/// an entry program touching maps, helpers, an unregistered function pointer,
/// a string literal and a bpf-to-bpf call chain through `.text`, plus a
/// second entry program without any relocations.
fn loader_object() -> Vec<u8> {
    let mut builder = ElfBuilder::new();

    let mut maps_data = Vec::new();
    maps_data.extend_from_slice(&map_def(1, 4, 2, 42, 4242, 0));
    maps_data.extend_from_slice(&map_def(1, 2, 1, 21, 2121, 0));
    // the value size field of map-in-map records is dead; fill it with
    // garbage so any read of it shows up in the descriptors
    maps_data.extend_from_slice(&map_def(12, 4, 0xdead_beef, 2, 0, 0));
    maps_data.extend_from_slice(&map_def(13, 4, 0xdead_beef, 2, 0, 1));
    let maps = builder.progbits("maps", &maps_data);

    let mut rodata = vec![0u8; 16];
    rodata.extend_from_slice(b"za warudo\0");
    let rodata_section = builder.progbits(".rodata", &rodata);

    let xdp_insns = prog(&[
        &lddw(1, 0),     // 0: &hash_map
        &call_imm(-1),   // 2: map_lookup_elem
        &lddw(1, 0),     // 3: &hash_map2
        &call_imm(-1),   // 5: map_lookup_elem
        &call_imm(-1),   // 6: other_fn, not registered
        &lddw(1, 0),     // 7: string literal
        &call_imm(-1),   // 9: stringfn
        &call_imm(-1),   // 10: helper_func
        &exit(),         // 11
    ]);
    let xdp = builder.exec("xdp", &xdp_insns);
    let text = builder.exec(
        ".text",
        &prog(&[&call_imm(-1), &exit(), &mov64_imm(0, 1), &exit()]),
    );
    let socket = builder.exec("socket", &prog(&[&mov64_imm(0, 0), &exit()]));
    builder.progbits("license", b"MIT\0");
    builder.progbits("version", &1u32.to_le_bytes());

    let hash_map = builder.object("hash_map", maps, 0, 24);
    let hash_map2 = builder.object("hash_map2", maps, 24, 24);
    builder.object("array_of_hash_map", maps, 48, 24);
    builder.object("hash_of_hash_map", maps, 72, 24);
    let str_lit = builder.symbol(".L.str", rodata_section, 16, 10, 0x01);
    builder.func("xdp_prog", xdp, 0, 96);
    let helper_func = builder.func("helper_func", text, 0, 16);
    let helper_func2 = builder.func("helper_func2", text, 16, 16);
    builder.func("no_relocation", socket, 0, 16);
    let map_lookup = builder.undefined("map_lookup_elem");
    let other_fn = builder.undefined("other_fn");
    let stringfn = builder.undefined("stringfn");

    builder.rel(xdp, 0, hash_map, R_BPF_64_64);
    builder.rel(xdp, 16, map_lookup, R_BPF_64_32);
    builder.rel(xdp, 24, hash_map2, R_BPF_64_64);
    builder.rel(xdp, 40, map_lookup, R_BPF_64_32);
    builder.rel(xdp, 48, other_fn, R_BPF_64_32);
    builder.rel(xdp, 56, str_lit, R_BPF_64_64);
    builder.rel(xdp, 72, stringfn, R_BPF_64_32);
    builder.rel(xdp, 80, helper_func, R_BPF_64_32);
    builder.rel(text, 0, helper_func2, R_BPF_64_32);

    builder.build()
}

#[test]
fn test_load_map_definitions() {
    let object = Object::load(&loader_object(), &LoadOptions::default(), &registry()).unwrap();

    assert_eq!(object.maps.len(), 4);
    let names: Vec<&str> = object.maps.iter().map(|map| map.name.as_str()).collect();
    assert_eq!(
        names,
        ["hash_map", "hash_map2", "array_of_hash_map", "hash_of_hash_map"]
    );

    let hash_map = &object.maps[0].descriptor;
    assert_eq!(hash_map.map_type, MapType::Hash);
    assert_eq!(hash_map.key_size, 4);
    assert_eq!(hash_map.value_size(), Some(2));
    assert_eq!(hash_map.max_entries, 42);
    assert_eq!(hash_map.flags, 4242);

    let hash_map2 = &object.maps[1].descriptor;
    assert_eq!(hash_map2.map_type, MapType::Hash);
    assert_eq!(hash_map2.key_size, 2);
    assert_eq!(hash_map2.value_size(), Some(1));
    assert_eq!(hash_map2.max_entries, 21);
    assert_eq!(hash_map2.flags, 2121);

    let array_of_maps = &object.maps[2].descriptor;
    assert_eq!(array_of_maps.map_type, MapType::ArrayOfMaps);
    assert_eq!(array_of_maps.payload, MapPayload::InnerMap { index: 0 });
    assert_eq!(array_of_maps.value_size(), None);

    let hash_of_maps = &object.maps[3].descriptor;
    assert_eq!(hash_of_maps.map_type, MapType::HashOfMaps);
    assert_eq!(hash_of_maps.payload, MapPayload::InnerMap { index: 1 });
    assert_eq!(hash_of_maps.value_size(), None);
}

#[test]
fn test_load_programs() {
    let object = Object::load(&loader_object(), &LoadOptions::default(), &registry()).unwrap();

    assert!(object.rejected.is_empty());
    assert_eq!(object.programs.len(), 2);
    assert_eq!(object.version, Some(1));

    let xdp_prog = &object.programs[0];
    assert_eq!(xdp_prog.name, "xdp_prog");
    assert_eq!(xdp_prog.section_name, "xdp");
    assert_eq!(xdp_prog.license.as_deref(), Some("MIT"));

    let no_relocation = &object.programs[1];
    assert_eq!(no_relocation.name, "no_relocation");
    assert_eq!(no_relocation.section_name, "socket");
    assert_eq!(no_relocation.license.as_deref(), Some("MIT"));
}

#[test]
fn test_relocations_resolved() {
    let object = Object::load(&loader_object(), &LoadOptions::default(), &registry()).unwrap();
    let program = &object.programs[0];
    // entry, helper_func and helper_func2 flattened into one buffer
    assert_eq!(program.instruction_count(), 16);

    // map references carry the descriptor position until realization
    let map0 = ebpf::get_insn(program.instructions(), 0);
    assert_eq!(map0.src, BPF_PSEUDO_MAP_FD);
    assert_eq!(map0.imm, 0);
    let map1 = ebpf::get_insn(program.instructions(), 3);
    assert_eq!(map1.src, BPF_PSEUDO_MAP_FD);
    assert_eq!(map1.imm, 1);

    // registered helpers get their numeric id
    assert_eq!(ebpf::get_insn(program.instructions(), 2).imm, 1);
    assert_eq!(ebpf::get_insn(program.instructions(), 5).imm, 1);
    assert_eq!(ebpf::get_insn(program.instructions(), 9).imm, 3);

    // the unregistered function pointer is deferred with a hashed immediate
    let deferred = ebpf::get_insn(program.instructions(), 6);
    assert_eq!(
        deferred.imm as u32,
        ebpf::hash_symbol_name(b"other_fn")
    );
    assert_eq!(program.warnings.len(), 1);
    assert_eq!(program.warnings[0].name, "other_fn");
    assert_eq!(program.warnings[0].insn_index, 6);

    // the string literal load carries the symbol's object offset
    let str_load = ebpf::get_insn(program.instructions(), 7);
    assert_eq!(str_load.src, 0);
    assert_eq!(str_load.imm, 16);

    // bpf-to-bpf calls target flattened offsets: helper_func lands at 12,
    // helper_func2 at 14
    let call_helper = ebpf::get_insn(program.instructions(), 10);
    assert_eq!(call_helper.src, BPF_PSEUDO_CALL);
    assert_eq!(call_helper.imm, 1);
    let inner_call = ebpf::get_insn(program.instructions(), 12);
    assert_eq!(inner_call.src, BPF_PSEUDO_CALL);
    assert_eq!(inner_call.imm, 1);

    assert_eq!(
        program
            .map_patches()
            .iter()
            .map(|patch| (patch.insn_index, patch.map_index))
            .collect::<Vec<_>>(),
        [(0, 0), (3, 1)]
    );
}

#[test]
fn test_no_relocation_passthrough() {
    let object = Object::load(&loader_object(), &LoadOptions::default(), &registry()).unwrap();
    let program = &object.programs[1];
    assert!(program.warnings.is_empty());
    assert_eq!(
        program.instructions(),
        &prog(&[&mov64_imm(0, 0), &exit()])[..]
    );
}

#[test]
fn test_strict_externals() {
    let err = Object::load(
        &loader_object(),
        &LoadOptions {
            strict_externals: true,
            ..LoadOptions::default()
        },
        &registry(),
    )
    .unwrap_err();
    match err {
        LoadError::Relocation { program, source } => {
            assert_eq!(program, "xdp_prog");
            assert_eq!(
                source,
                RelocationError::UnresolvedSymbol {
                    name: "other_fn".to_string(),
                    insn_index: 6,
                }
            );
        }
        other => panic!("expected relocation error, got {:?}", other),
    }
}

#[test]
fn test_section_filter() {
    let object = Object::load(
        &loader_object(),
        &LoadOptions {
            section_filter: Some(["xdp".to_string()].iter().cloned().collect::<BTreeSet<_>>()),
            ..LoadOptions::default()
        },
        &registry(),
    )
    .unwrap();
    assert_eq!(object.programs.len(), 1);
    assert_eq!(object.programs[0].name, "xdp_prog");
}

#[test]
fn test_idempotent_loads() {
    let bytes = loader_object();
    let first = Object::load(&bytes, &LoadOptions::default(), &registry()).unwrap();
    let second = Object::load(&bytes, &LoadOptions::default(), &registry()).unwrap();
    assert_eq!(first.programs, second.programs);
    assert_eq!(first.maps, second.maps);
    assert_eq!(first.version, second.version);
}

#[test]
fn test_realize_maps() {
    let mut object =
        Object::load(&loader_object(), &LoadOptions::default(), &registry()).unwrap();
    let mut factory = FakeMapFactory::new(100);
    let handles = object.realize_maps(&mut factory).unwrap();

    assert_eq!(
        handles.iter().map(|handle| handle.id()).collect::<Vec<_>>(),
        [100, 101, 102, 103]
    );
    // sequential, declaration order, inner maps passed through by handle
    assert_eq!(
        factory.created,
        [
            ("hash_map".to_string(), None),
            ("hash_map2".to_string(), None),
            ("array_of_hash_map".to_string(), Some(100)),
            ("hash_of_hash_map".to_string(), Some(101)),
        ]
    );

    // map reference immediates now carry the runtime handles
    let program = &object.programs[0];
    assert_eq!(ebpf::get_insn(program.instructions(), 0).imm, 100);
    assert_eq!(ebpf::get_insn(program.instructions(), 3).imm, 101);

    assert!(matches!(
        object.realize_maps(&mut factory),
        Err(LoadError::MapsAlreadyRealized)
    ));
}

#[test]
fn test_realize_maps_forward_inner_reference() {
    let mut builder = ElfBuilder::new();
    let mut maps_data = Vec::new();
    maps_data.extend_from_slice(&map_def(12, 4, 0, 2, 0, 1));
    maps_data.extend_from_slice(&map_def(1, 4, 8, 16, 0, 0));
    let maps = builder.progbits("maps", &maps_data);
    builder.object("outer", maps, 0, 24);
    builder.object("plain", maps, 24, 24);

    let mut object =
        Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap();
    let mut factory = FakeMapFactory::new(50);
    let handles = object.realize_maps(&mut factory).unwrap();

    // the inner map is realized before the map-in-map that declares it
    assert_eq!(
        factory.created,
        [("plain".to_string(), None), ("outer".to_string(), Some(50))]
    );
    assert_eq!(
        handles.iter().map(|handle| handle.id()).collect::<Vec<_>>(),
        [51, 50]
    );
}

#[test]
fn test_map_creation_error_propagates() {
    let mut object =
        Object::load(&loader_object(), &LoadOptions::default(), &registry()).unwrap();
    let mut factory = FakeMapFactory::new(1);
    factory.fail_on = Some("hash_map2".to_string());
    let err = object.realize_maps(&mut factory).unwrap_err();
    match err {
        LoadError::MapCreation { name, .. } => assert_eq!(name, "hash_map2"),
        other => panic!("expected map creation error, got {:?}", other),
    }
}

#[test]
fn test_cyclic_call_graph_rejects_only_the_entry_touching_it() {
    let mut builder = ElfBuilder::new();
    let text = builder.exec(
        ".text",
        &prog(&[&call_imm(-1), &exit(), &call_imm(-1), &exit()]),
    );
    let cyclic = builder.exec("xdp/cyclic", &prog(&[&call_imm(-1), &exit()]));
    builder.exec("xdp/ok", &prog(&[&mov64_imm(0, 0), &exit()]));

    let fa = builder.func("fa", text, 0, 16);
    let fb = builder.func("fb", text, 16, 16);
    builder.func("cyclic_prog", cyclic, 0, 16);
    // no function symbol for xdp/ok: the section itself becomes the unit

    builder.rel(text, 0, fb, R_BPF_64_32);
    builder.rel(text, 16, fa, R_BPF_64_32);
    builder.rel(cyclic, 0, fa, R_BPF_64_32);

    let object = Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap();
    assert_eq!(object.programs.len(), 1);
    assert_eq!(object.programs[0].name, "xdp/ok");
    assert_eq!(object.rejected.len(), 1);
    assert_eq!(object.rejected[0].name, "cyclic_prog");
    assert_eq!(
        object.rejected[0].error,
        AssemblyError::CyclicCallGraph {
            program: "fa".to_string(),
            caller: "fb".to_string(),
        }
    );
}

#[test]
fn test_uncalled_functions_are_dropped() {
    let mut builder = ElfBuilder::new();
    let text = builder.exec(
        ".text",
        &prog(&[&mov64_imm(0, 1), &exit(), &mov64_imm(0, 2), &exit()]),
    );
    let entry = builder.exec("xdp", &prog(&[&call_imm(-1), &exit()]));
    let used = builder.func("used_fn", text, 0, 16);
    builder.func("unused_fn", text, 16, 16);
    builder.func("entry_prog", entry, 0, 16);
    builder.rel(entry, 0, used, R_BPF_64_32);

    let object = Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap();
    assert_eq!(object.programs.len(), 1);
    let program = &object.programs[0];
    // entry plus used_fn only; unused_fn is eliminated
    assert_eq!(program.instruction_count(), 4);
    assert_eq!(ebpf::get_insn(program.instructions(), 2).imm, 1);
}

#[test]
fn test_relocation_out_of_bounds() {
    for (offset, r_type) in [
        (96, R_BPF_64_32),  // past the section
        (4, R_BPF_64_32),   // not instruction aligned
        (88, R_BPF_64_64),  // lddw pair spilling past the end
    ] {
        let mut builder = ElfBuilder::new();
        let xdp = builder.exec("xdp", &vec![0u8; 96]);
        builder.func("prog", xdp, 0, 96);
        let symbol = builder.undefined("map_lookup_elem");
        builder.rel(xdp, offset, symbol, r_type);

        let err =
            Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap_err();
        match err {
            LoadError::Relocation { source, .. } => assert!(
                matches!(source, RelocationError::RelocationOutOfBounds { .. }),
                "offset {offset}: {source:?}"
            ),
            other => panic!("offset {offset}: expected relocation error, got {other:?}"),
        }
    }
}

#[test]
fn test_unknown_relocation_type() {
    let mut builder = ElfBuilder::new();
    let xdp = builder.exec("xdp", &prog(&[&call_imm(-1), &exit()]));
    builder.func("prog", xdp, 0, 16);
    let symbol = builder.undefined("map_lookup_elem");
    builder.rel(xdp, 0, symbol, 8);

    let err = Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap_err();
    match err {
        LoadError::Relocation { source, .. } => {
            assert_eq!(source, RelocationError::UnknownRelocation(8));
        }
        other => panic!("expected relocation error, got {:?}", other),
    }
}

#[test]
fn test_unknown_map_reference() {
    let mut builder = ElfBuilder::new();
    let maps = builder.progbits("maps", &map_def(1, 4, 4, 4, 0, 0));
    let xdp = builder.exec("xdp", &prog(&[&lddw(1, 0), &exit()]));
    builder.object("hash_map", maps, 0, 24);
    builder.func("prog", xdp, 0, 24);
    // unnamed symbol pointing between records; no descriptor matches it
    let stray = builder.symbol("", maps, 12, 0, 0x01);
    builder.rel(xdp, 0, stray, R_BPF_64_64);

    let err = Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap_err();
    match err {
        LoadError::Relocation { source, .. } => {
            assert!(matches!(source, RelocationError::UnknownMap { offset: 12, .. }));
        }
        other => panic!("expected relocation error, got {:?}", other),
    }
}

#[test]
fn test_incompatible_relocation_kind() {
    let mut builder = ElfBuilder::new();
    let maps = builder.progbits("maps", &map_def(1, 4, 4, 4, 0, 0));
    let xdp = builder.exec("xdp", &prog(&[&call_imm(-1), &exit()]));
    let hash_map = builder.object("hash_map", maps, 0, 24);
    builder.func("prog", xdp, 0, 16);
    // a map reference against a call instruction
    builder.rel(xdp, 0, hash_map, R_BPF_64_64);

    let err = Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap_err();
    match err {
        LoadError::Relocation { source, .. } => {
            assert!(matches!(
                source,
                RelocationError::IncompatibleInstruction { .. }
            ));
        }
        other => panic!("expected relocation error, got {:?}", other),
    }
}

#[test]
fn test_invalid_inner_map_references() {
    for records in [
        // out of range
        vec![map_def(12, 4, 0, 2, 0, 7)],
        // self referential
        vec![map_def(12, 4, 0, 2, 0, 0)],
        // nested map-in-map
        vec![map_def(12, 4, 0, 2, 0, 1), map_def(13, 4, 0, 2, 0, 0)],
    ] {
        let mut builder = ElfBuilder::new();
        let data: Vec<u8> = records.iter().flatten().copied().collect();
        let maps = builder.progbits("maps", &data);
        for (position, _) in records.iter().enumerate() {
            builder.object(&format!("map_{position}"), maps, position as u64 * 24, 24);
        }
        let err =
            Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap_err();
        assert!(
            matches!(
                err,
                LoadError::Map(MapError::InvalidMapReference { .. })
            ),
            "{err:?}"
        );
    }
}

#[test]
fn test_unknown_map_type() {
    let mut builder = ElfBuilder::new();
    let maps = builder.progbits("maps", &map_def(99, 4, 4, 4, 0, 0));
    builder.object("bogus", maps, 0, 24);
    let err = Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Map(MapError::UnknownMapType { value: 99, .. })
    ));
}

#[test]
fn test_truncated_map_definition() {
    let mut builder = ElfBuilder::new();
    let maps = builder.progbits("maps", &[0u8; 30]);
    builder.object("short_map", maps, 24, 24);
    let err = Object::load(&builder.build(), &LoadOptions::default(), &registry()).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Map(MapError::TruncatedDefinition { offset: 24, .. })
    ));
}

#[test]
fn test_malformed_headers() {
    let bytes = loader_object();
    for (offset, value, reason) in [
        (0usize, 0u8, "wrong magic"),
        (4, 1, "not a 64 bit object"),
        (5, 2, "not little endian"),
        (16, 2, "not a relocatable object"),
        (18, 62, "wrong machine"),
    ] {
        let mut bytes = bytes.clone();
        bytes[offset] = value;
        let err = Object::load(&bytes, &LoadOptions::default(), &registry()).unwrap_err();
        match err {
            LoadError::Elf(ElfError::MalformedHeader(text)) => assert_eq!(text, reason),
            other => panic!("expected malformed header, got {:?}", other),
        }
    }
}

#[test]
fn test_truncated_file() {
    let bytes = loader_object();
    let result = Object::load(&bytes[..80], &LoadOptions::default(), &registry());
    test_utils::assert_error!(result, "TruncatedFile");

    let err = Object::load(&[], &LoadOptions::default(), &registry()).unwrap_err();
    assert!(matches!(err, LoadError::Elf(ElfError::MalformedHeader(_))));
}

#[test]
fn test_object_without_maps_or_relocations() {
    let mut builder = ElfBuilder::new();
    let xdp = builder.exec("xdp", &prog(&[&mov64_imm(0, 7), &exit()]));
    builder.func("minimal", xdp, 0, 16);
    let object = Object::load(
        &builder.build(),
        &LoadOptions::default(),
        &HelperRegistry::new(),
    )
    .unwrap();
    assert!(object.maps.is_empty());
    assert_eq!(object.programs.len(), 1);
    assert_eq!(object.programs[0].license, None);
    assert_eq!(
        object.programs[0].instructions(),
        &prog(&[&mov64_imm(0, 7), &exit()])[..]
    );
}
