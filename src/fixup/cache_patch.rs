//! §4.4.7 Cache patching.
//!
//! Ties `shared_cache::patch` (which only computes *what* to write) to
//! an actual write into the cache's mapped memory, suspending VM
//! accounting around the write the way §4.4.7 requires ("so that
//! dirty-page charges are not billed to the loader").

use crate::shared_cache::patch::{plan_patch, PatchTable};

/// Cache memory seam, mirroring [`super::rebase::ImageMemory`] but for
/// the one shared-cache mapping rather than a per-image one.
pub trait CacheMemory {
    fn write_u64_suspending_accounting(&mut self, cache_offset: u64, value: u64);
}

/// Applies every recorded patch location for `symbol` in `table`,
/// retargeting them to `replacement_addr` (§4.4.7). Returns the number
/// of locations rewritten.
pub fn apply_cache_patch(
    table: &PatchTable,
    symbol: &str,
    replacement_addr: u64,
    mem: &mut dyn CacheMemory,
) -> usize {
    let writes = plan_patch(table, symbol, replacement_addr);
    for write in &writes {
        mem.write_u64_suspending_accounting(write.cache_offset, write.value);
    }
    writes.len()
}

/// Walks every symbol an overriding image exports and patches every use
/// recorded in `table`, as done once per overridden cache dylib at load
/// time (§4.4.7, scenario 4 "the on-disk copy is loaded; the cache patch
/// table ... is walked").
pub fn patch_overridden_dylib(
    table: &PatchTable,
    exports: impl Iterator<Item = (String, u64)>,
    mem: &mut dyn CacheMemory,
) -> usize {
    let mut total = 0;
    for (name, addr) in exports {
        if table.locations_for(&name).is_empty() {
            continue;
        }
        total += apply_cache_patch(table, &name, addr, mem);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_cache::patch::PatchLocation;

    #[derive(Default)]
    struct FakeCacheMemory {
        writes: Vec<(u64, u64)>,
    }
    impl CacheMemory for FakeCacheMemory {
        fn write_u64_suspending_accounting(&mut self, cache_offset: u64, value: u64) {
            self.writes.push((cache_offset, value));
        }
    }

    #[test]
    fn patches_every_recorded_location() {
        let mut table = PatchTable::new();
        table.record("_foo", PatchLocation { cache_offset: 0x100, addend: 0 });
        table.record("_foo", PatchLocation { cache_offset: 0x200, addend: 0 });
        let mut mem = FakeCacheMemory::default();
        let n = apply_cache_patch(&table, "_foo", 0x9000, &mut mem);
        assert_eq!(n, 2);
        assert_eq!(mem.writes, vec![(0x100, 0x9000), (0x200, 0x9000)]);
    }

    #[test]
    fn override_pass_skips_exports_with_no_recorded_uses() {
        let mut table = PatchTable::new();
        table.record("_patched", PatchLocation { cache_offset: 0x100, addend: 0 });
        let mut mem = FakeCacheMemory::default();
        let exports = vec![
            ("_patched".to_string(), 0x1000),
            ("_unreferenced".to_string(), 0x2000),
        ];
        let n = patch_overridden_dylib(&table, exports.into_iter(), &mut mem);
        assert_eq!(n, 1);
        assert_eq!(mem.writes, vec![(0x100, 0x1000)]);
    }
}
