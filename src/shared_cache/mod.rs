//! The shared-cache reader (§4.1 Component Design intro, §3 `SharedCache`).
//!
//! The cache *builder* is an out-of-scope collaborator (§1); this module
//! only maps and indexes the file it produces.

pub mod patch;

use patch::PatchTable;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One dylib entry recorded in the cache (§3 `SharedCache`
/// "list of cached dylib `{path, mhOffset}`").
#[derive(Debug, Clone)]
pub struct CachedDylib {
    pub path: PathBuf,
    pub mh_offset: u64,
    /// Whether an on-disk copy is allowed to override this cache entry
    /// (mirrors `overridableDylib()` in the original).
    pub overridable: bool,
    pub expected_mtime: Option<i64>,
    pub expected_inode: Option<u64>,
    pub patch_table: Option<PatchTable>,
}

/// Read-only descriptor for the system-wide pre-linked cache (§3).
pub struct SharedCache {
    pub base_address: u64,
    pub slide: i64,
    pub uuid: [u8; 16],
    dylibs_by_path: HashMap<PathBuf, usize>,
    dylibs: Vec<CachedDylib>,
    /// §3 "optional branch-island map" -- trampolines used by some
    /// architectures for out-of-range branches into patched code.
    pub branch_islands: Vec<(u64, u64)>,
    /// Corresponds to `dylibsExpectedOnDisk` in the original: whether
    /// overridable dylibs are expected to also exist as real files so
    /// the mtime/inode comparison in [`SharedCache::resolve`] applies.
    pub dylibs_expected_on_disk: bool,
}

pub enum CacheLookup {
    /// Not present in the cache at all.
    Absent,
    /// Present, and should be used as-is.
    UseCache { mh_addr: u64 },
    /// Present, but a newer on-disk copy should be preferred (§ scenario 4).
    PreferDisk,
}

impl SharedCache {
    pub fn new(base_address: u64, slide: i64, uuid: [u8; 16], dylibs_expected_on_disk: bool) -> Self {
        Self {
            base_address,
            slide,
            uuid,
            dylibs_by_path: HashMap::new(),
            dylibs: Vec::new(),
            branch_islands: Vec::new(),
            dylibs_expected_on_disk,
        }
    }

    pub fn add_dylib(&mut self, dylib: CachedDylib) {
        self.dylibs_by_path
            .insert(dylib.path.clone(), self.dylibs.len());
        self.dylibs.push(dylib);
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.dylibs_by_path.contains_key(path)
    }

    pub fn dylib(&self, path: &Path) -> Option<&CachedDylib> {
        self.dylibs_by_path.get(path).map(|&i| &self.dylibs[i])
    }

    pub fn dylib_mut(&mut self, path: &Path) -> Option<&mut CachedDylib> {
        if let Some(&i) = self.dylibs_by_path.get(path) {
            Some(&mut self.dylibs[i])
        } else {
            None
        }
    }

    /// §4.1 phase 4 "Check shared-cache index by path": decides whether
    /// the cache entry should be used, or whether the on-disk file
    /// (whose metadata the caller supplies) should be preferred.
    ///
    /// `on_disk_metadata` is `None` when the path doesn't exist on disk
    /// at all.
    pub fn resolve(&self, path: &Path, on_disk_metadata: Option<(i64, u64)>) -> CacheLookup {
        let Some(entry) = self.dylib(path) else {
            return CacheLookup::Absent;
        };
        if !entry.overridable {
            return CacheLookup::UseCache {
                mh_addr: self.base_address.wrapping_add(entry.mh_offset),
            };
        }
        match on_disk_metadata {
            None => CacheLookup::UseCache {
                mh_addr: self.base_address.wrapping_add(entry.mh_offset),
            },
            Some((mtime, inode)) => {
                if self.dylibs_expected_on_disk {
                    let matches = entry.expected_mtime == Some(mtime) && entry.expected_inode == Some(inode);
                    if matches {
                        CacheLookup::UseCache {
                            mh_addr: self.base_address.wrapping_add(entry.mh_offset),
                        }
                    } else {
                        CacheLookup::PreferDisk
                    }
                } else {
                    CacheLookup::PreferDisk
                }
            }
        }
    }
}
