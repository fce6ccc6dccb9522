//! §4.1 INSERT_LIBRARIES force-load and §4.4.6 interposing (§8 scenario
//! 3): both libraries are force-loaded ahead of the main executable,
//! the first insert wins a flat lookup for a symbol both define, and
//! an `__interpose` section's tuples land in the composed rewrite
//! table the bind pass consults.

mod common;

use common::{interpose_section, write_image, CPU_TYPE_ARM64, MH_DYLIB, MH_EXECUTE};
use macho_loader_core::context::{EnvSnapshot, LinkContext};
use macho_loader_core::fixup::namespace::flat_lookup;
use macho_loader_core::image::{ExportedSymbol, SymbolTable};
use macho_loader_core::loader::Loader;
use macho_loader_core::platform::FakePlatform;

#[test]
fn insert_libraries_are_forced_first_and_win_flat_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let main_path = dir.path().join("a.out");
    let lib_a_path = dir.path().join("liba.dylib");
    let lib_b_path = dir.path().join("libb.dylib");

    write_image(&main_path, MH_EXECUTE, 0x1000, 0x1000, &[], &[]);
    write_image(&lib_a_path, MH_DYLIB, 0x2000, 0x1000, &[], &[]);
    write_image(&lib_b_path, MH_DYLIB, 0x3000, 0x1000, &[], &[]);

    let mut env = EnvSnapshot::default();
    env.insert_libraries = vec![lib_a_path.clone(), lib_b_path.clone()];
    let ctx = LinkContext::new(main_path.clone(), env, false);

    let mut loader = Loader::new(ctx, Box::new(FakePlatform::default()), CPU_TYPE_ARM64, 0);
    loader.export_source = Some(Box::new(|path| {
        let mut table = SymbolTable::default();
        if path.file_name().and_then(|n| n.to_str()) == Some("liba.dylib")
            || path.file_name().and_then(|n| n.to_str()) == Some("libb.dylib")
        {
            table.insert_sorted(ExportedSymbol {
                name: "_malloc".into(),
                address: if path.ends_with("liba.dylib") { 0x2100 } else { 0x3100 },
                is_weak: false,
                is_thread_local: false,
            });
        }
        table
    }));

    loader.load_main_executable(&main_path).unwrap();

    let inserted = loader.inserted.read().clone();
    assert_eq!(inserted.len(), 2);
    let lib_a_id = loader.graph.find_by_path(&lib_a_path).unwrap();
    let lib_b_id = loader.graph.find_by_path(&lib_b_path).unwrap();
    assert_eq!(inserted, vec![lib_a_id, lib_b_id]);

    let found = flat_lookup(&loader.graph, &inserted, "_malloc").unwrap();
    assert_eq!(found.address, 0x2100);
    assert_eq!(found.defining_image, lib_a_id);
    let _ = lib_b_id;
}

#[test]
fn interpose_sections_compose_into_the_loader_wide_rewrite_table() {
    let dir = tempfile::tempdir().unwrap();
    let main_path = dir.path().join("a.out");
    let lib_a_path = dir.path().join("liba.dylib");

    write_image(&main_path, MH_EXECUTE, 0x1000, 0x1000, &[], &[]);
    write_image(
        &lib_a_path,
        MH_DYLIB,
        0x2000,
        0x1000,
        &[interpose_section(&[(0x2100, 0x9000)])],
        &[],
    );

    let mut env = EnvSnapshot::default();
    env.insert_libraries = vec![lib_a_path.clone()];
    let ctx = LinkContext::new(main_path.clone(), env, false);
    let loader = Loader::new(ctx, Box::new(FakePlatform::default()), CPU_TYPE_ARM64, 0);

    loader.load_main_executable(&main_path).unwrap();

    let table = loader.interpose_table.read();
    assert_eq!(table.get(&0x9000), Some(&0x2100));
}
