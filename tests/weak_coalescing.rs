//! §4.4.5: every image flagged `PARTICIPATES_IN_COALESCING` (inferred
//! in `load_one` from carrying at least one weak export) has its
//! matching export rewritten to the same canonical address once the
//! whole closure is loaded.

mod common;

use common::{write_image, CPU_TYPE_ARM64, MH_DYLIB, MH_EXECUTE};
use macho_loader_core::context::{EnvSnapshot, LinkContext};
use macho_loader_core::image::{ExportedSymbol, SymbolTable};
use macho_loader_core::loader::Loader;
use macho_loader_core::platform::FakePlatform;

#[test]
fn weak_definitions_across_images_coalesce_to_one_address() {
    let dir = tempfile::tempdir().unwrap();
    let main_path = dir.path().join("a.out");
    let lib_a_path = dir.path().join("liba.dylib");
    let lib_b_path = dir.path().join("libb.dylib");

    write_image(&main_path, MH_EXECUTE, 0x1000, 0x1000, &[], &["liba.dylib", "libb.dylib"]);
    write_image(&lib_a_path, MH_DYLIB, 0x2000, 0x1000, &[], &[]);
    write_image(&lib_b_path, MH_DYLIB, 0x3000, 0x1000, &[], &[]);

    let mut env = EnvSnapshot::default();
    env.library_path = vec![dir.path().to_path_buf()];
    let ctx = LinkContext::new(main_path.clone(), env, false);
    let mut loader = Loader::new(ctx, Box::new(FakePlatform::default()), CPU_TYPE_ARM64, 0);

    loader.export_source = Some(Box::new(|path| {
        let mut table = SymbolTable::default();
        let addr = match path.file_name().and_then(|n| n.to_str()) {
            Some("liba.dylib") => Some(0x2500),
            Some("libb.dylib") => Some(0x3500),
            _ => None,
        };
        if let Some(addr) = addr {
            table.insert_sorted(ExportedSymbol {
                name: "_weak_vtable".into(),
                address: addr,
                is_weak: true,
                is_thread_local: false,
            });
        }
        table
    }));

    loader.load_main_executable(&main_path).unwrap();

    let lib_a_id = loader.graph.find_by_path(&lib_a_path).unwrap();
    let lib_b_id = loader.graph.find_by_path(&lib_b_path).unwrap();

    let addr_a = loader.graph.with(lib_a_id, |img| img.symbols.lookup("_weak_vtable").unwrap().address).unwrap();
    let addr_b = loader.graph.with(lib_b_id, |img| img.symbols.lookup("_weak_vtable").unwrap().address).unwrap();

    assert_eq!(addr_a, addr_b);
    // First-encountered-in-load-order wins (§4.4.5's merge-walk tie-break).
    assert_eq!(addr_a, 0x2500);
}
