//! The `Image` data model (§3).

pub mod graph;
pub mod state;

use crate::context::DependencyKind;
use parking_lot::RwLock;
use state::{ImageState, InitLock, StateCell};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// §3 "Flags".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageFlags: u32 {
        const IN_SHARED_CACHE         = 1 << 0;
        const NEVER_UNLOAD            = 1 << 1;
        const LEAVE_MAPPED            = 1 << 2;
        /// RTLD_LOCAL: exports are not visible to flat-namespace lookups
        /// from other images.
        const HIDE_EXPORTS            = 1 << 3;
        const MATCH_BY_INSTALL_NAME   = 1 << 4;
        const PARTICIPATES_IN_COALESCING = 1 << 5;
        const FORCE_FLAT              = 1 << 6;
        const IS_BUNDLE               = 1 << 7;
        const IS_DYLIB                = 1 << 8;
        const IS_MAIN_EXECUTABLE      = 1 << 9;
        const IS_PIE                  = 1 << 10;
        const TWO_LEVEL_NAMESPACE     = 1 << 11;
        const REFERENCED_DOWNWARD     = 1 << 12;
        const REFERENCED_UPWARD       = 1 << 13;
        /// Declares one or more `(replacement, replacee)` tuples in its own
        /// `__interpose` section (§4.4.6). Consulted to suppress a
        /// self-redirect when this same image is also the importer of a
        /// bind the table would otherwise rewrite.
        const DECLARES_INTERPOSE      = 1 << 14;
    }
}

/// Opaque, stable handle to an [`Image`] inside an [`graph::ImageGraph`].
///
/// Modeled as a flat index plus a generation counter (§9 "use a flat
/// vector of Image owners plus integer ... references between them")
/// rather than a pointer, so cyclic dependency edges don't need any
/// unsafe aliasing and a stale handle from before a GC pass is
/// detectable instead of dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    None,
    ReadOnly,
    ReadExecute,
    ReadWrite,
    ReadWriteExecute,
}

impl Permission {
    pub fn from_prot(prot: i32) -> Self {
        const VM_PROT_READ: i32 = 0x1;
        const VM_PROT_WRITE: i32 = 0x2;
        const VM_PROT_EXECUTE: i32 = 0x4;
        match (
            prot & VM_PROT_READ != 0,
            prot & VM_PROT_WRITE != 0,
            prot & VM_PROT_EXECUTE != 0,
        ) {
            (false, _, false) => Self::None,
            (true, false, false) => Self::ReadOnly,
            (true, false, true) => Self::ReadExecute,
            (true, true, false) => Self::ReadWrite,
            (true, true, true) => Self::ReadWriteExecute,
            (false, _, true) => Self::ReadExecute,
        }
    }

    pub fn is_executable(self) -> bool {
        matches!(self, Self::ReadExecute | Self::ReadWriteExecute)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ReadWriteExecute)
    }
}

/// One `SEGMENT`/`SEGMENT_64` load command (§6).
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: [u8; 16],
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub init_prot: Permission,
    pub max_prot: Permission,
    pub p2align: u32,
}

impl Segment {
    pub fn name_str(&self) -> std::borrow::Cow<'_, str> {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.name[..end])
    }

    pub fn contains_vmaddr(&self, addr: u64) -> bool {
        addr >= self.vm_addr && addr < self.vm_addr.saturating_add(self.vm_size)
    }
}

/// One dependency edge (§3 "Dependency vector").
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub min_version: u32,
    pub compat_version: u32,
    pub kind: DependencyKind,
    /// Resolved once `recursiveLoadLibraries` has run; `None` for an
    /// unresolved weak dependency.
    pub resolved: Option<ImageId>,
}

/// Reference-count triple from §3.
#[derive(Debug, Default)]
pub struct RefCounts {
    pub static_refs: AtomicU32,
    pub dynamic_refs: AtomicU32,
    pub dlopen_refs: AtomicU32,
}

impl RefCounts {
    pub fn total(&self) -> u32 {
        self.static_refs.load(Ordering::Acquire)
            + self.dynamic_refs.load(Ordering::Acquire)
            + self.dlopen_refs.load(Ordering::Acquire)
    }

    pub fn inc_static(&self) {
        self.static_refs.fetch_add(1, Ordering::AcqRel);
    }
    pub fn inc_dynamic(&self) {
        self.dynamic_refs.fetch_add(1, Ordering::AcqRel);
    }
    pub fn inc_dlopen(&self) {
        self.dlopen_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the new count.
    pub fn dec_dlopen(&self) -> u32 {
        let prev = self.dlopen_refs.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(1))
        });
        prev.unwrap_or(0).saturating_sub(1)
    }
}

/// Exports/imports view (§3 "Symbol views"). A thin, intentionally
/// narrow shape: the full trie/nlist parsing is the out-of-scope
/// Mach-O parser collaborator (§1); this crate only needs a name ->
/// address lookup plus a flag for weak/strong and the raw bytes to
/// hand to that collaborator.
#[derive(Debug, Clone, Default)]
pub struct ExportedSymbol {
    pub name: String,
    pub address: u64,
    pub is_weak: bool,
    pub is_thread_local: bool,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Sorted by name so merge-walks in weak coalescing (§4.4.5) can
    /// advance the lowest-named iterator without re-sorting.
    pub exports: Vec<ExportedSymbol>,
}

impl SymbolTable {
    pub fn lookup(&self, name: &str) -> Option<&ExportedSymbol> {
        self.exports
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.exports[i])
    }

    pub fn insert_sorted(&mut self, sym: ExportedSymbol) {
        let idx = self
            .exports
            .partition_point(|e| e.name.as_str() < sym.name.as_str());
        self.exports.insert(idx, sym);
    }
}

/// One loaded Mach-O image (executable, dylib, or bundle). §3.
#[derive(Debug)]
pub struct Image {
    pub id: ImageId,
    pub path: PathBuf,
    pub real_path: Option<PathBuf>,
    pub path_hash: u64,
    pub load_address: u64,
    pub slide: i64,
    pub segments: Vec<Segment>,
    pub dependencies: RwLock<Vec<Dependency>>,
    /// `LC_RPATH` entries carried by this image, in load-command order
    /// (§4.1 "`@rpath` chain").
    pub rpaths: Vec<PathBuf>,
    pub symbols: SymbolTable,
    pub refs: RefCounts,
    pub flags: ImageFlags,
    state: StateCell,
    /// §4.6 "thread-owned recursive lock" guarding this image's
    /// initializer from concurrent and same-thread-reentrant invocation.
    pub init_lock: InitLock,
    /// Topological rank for initializer ordering (§4.5 Depth assignment).
    /// `0` means "not yet computed"; real depths start at 1.
    pub depth: AtomicU32,
    pub uuid: Option<[u8; 16]>,
    pub install_name: Option<String>,
    pub current_version: u32,
    pub compat_version: u32,
    /// Offsets (relative to load address) of initializer function
    /// pointers, validated to lie within an executable segment before
    /// being invoked (§4.6).
    pub initializers: Vec<u64>,
    pub terminators: Vec<u64>,
    /// Raw `(replacement, replacee)` pairs read from this image's own
    /// `__interpose` section, if any (§4.4.6). Only meaningful for images
    /// that were force-loaded as inserted libraries.
    pub interpose_tuples: Vec<(u64, u64)>,
}

impl Image {
    pub fn path_hash_of(path: &std::path::Path) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        path.hash(&mut hasher);
        hasher.finish()
    }

    pub fn state(&self) -> ImageState {
        self.state.get()
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn new(id: ImageId, path: PathBuf, load_address: u64, slide: i64, flags: ImageFlags) -> Self {
        let path_hash = Self::path_hash_of(&path);
        Self {
            id,
            path,
            real_path: None,
            path_hash,
            load_address,
            slide,
            segments: Vec::new(),
            dependencies: RwLock::new(Vec::new()),
            rpaths: Vec::new(),
            symbols: SymbolTable::default(),
            refs: RefCounts::default(),
            flags,
            state: StateCell::new(ImageState::Mapped),
            init_lock: InitLock::new(),
            depth: AtomicU32::new(0),
            uuid: None,
            install_name: None,
            current_version: 0,
            compat_version: 0,
            initializers: Vec::new(),
            terminators: Vec::new(),
            interpose_tuples: Vec::new(),
        }
    }

    pub fn is_reachable_root(&self) -> bool {
        self.flags.contains(ImageFlags::NEVER_UNLOAD) || self.flags.contains(ImageFlags::IS_MAIN_EXECUTABLE)
    }

    /// §3 invariant: every absolute pointer lies within the image's own
    /// segments once rebased, so out-of-range writes are rejected before
    /// they happen rather than merely asserted after the fact.
    pub fn contains_vmaddr(&self, addr: u64) -> bool {
        self.segments.iter().any(|s| s.contains_vmaddr(addr))
    }

    pub fn executable_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.init_prot.is_executable())
    }

    pub fn vmaddr_in_executable_segment(&self, addr: u64) -> bool {
        self.executable_segments().any(|s| s.contains_vmaddr(addr))
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }
}
