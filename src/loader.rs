//! Top-level orchestration tying every phase together into `dlopen`/
//! `dlclose`-equivalent entry points (§3 "Process flow", §7 Propagation).
//!
//! Parsing a Mach-O symbol-export trie is an out-of-scope collaborator
//! (§1): [`Loader::export_source`] is the seam a caller injects that
//! collaborator through. Without one, every newly loaded image's
//! `symbols` table stays empty and binds to it correctly fail with
//! [`crate::error::SymbolError::MissingImport`] for any non-weak import,
//! the same way they would if the collaborator had simply found nothing.

use crate::context::{DependencyKind, LinkContext, RPathChain};
use crate::error::{FormatError, LoaderError, MapError};
use crate::file_opener::{open_and_select_slice, RequiredFileKind};
use crate::fixup::bind::{self, BindRequest, BindResolver};
use crate::fixup::cache_patch::{self, CacheMemory};
use crate::fixup::chained::{self, ChainedImport, PointerFormat};
use crate::fixup::interpose::{self, InterposeTuple};
use crate::fixup::rebase::{self, ImageMemory};
use crate::fixup::weak;
use crate::gc::{assign_depths, link_static_refs, GcCoordinator};
use crate::image::graph::ImageGraph;
use crate::image::state::ImageState;
use crate::image::{Dependency, Image, ImageFlags, ImageId, Segment, SymbolTable};
use crate::init::run_initializer_closure;
use crate::macho::{
    self, ChainedFixupsHeader, DyldInfoCommand, DylibCommand, LoadCommands, MachHeader64, SegmentCommand64,
    LC_DYLD_CHAINED_FIXUPS, LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_ID_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB,
    LC_LOAD_WEAK_DYLIB, LC_RPATH, LC_SEGMENT_64, LC_UUID, MH_BUNDLE, MH_DYLIB, MH_EXECUTE,
};
use crate::mapper::map_image;
use crate::fixup::namespace;
use crate::notify::Notifier;
use crate::path_resolver::{resolve, LoadRequest, ResolveOutcome};
use crate::platform::PlatformOps;
use crate::shared_cache::SharedCache;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const MH_PIE: u32 = 0x0020_0000;

fn read_at(file: &File, offset: u64, len: usize) -> Result<Vec<u8>, std::io::Error> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// [`ImageMemory`] backed by an already-`mmap`'d image: `vmaddr` is the
/// location's address before slide, matching every fixup opcode stream's
/// own convention (§4.4.1); this adds the image's actual slide to find
/// the runtime byte.
struct MappedImageMemory {
    load_address: u64,
    preferred_base: u64,
}

impl ImageMemory for MappedImageMemory {
    fn read_u64(&self, vmaddr: u64) -> Result<u64, crate::error::FixupError> {
        let addr = self.load_address.wrapping_add(vmaddr.wrapping_sub(self.preferred_base));
        // SAFETY: every caller of `apply_rebase`/`apply_binds` has already
        // checked the location lies within one of this image's own mapped
        // segments before reaching here.
        Ok(unsafe { std::ptr::read_unaligned(addr as *const u64) })
    }

    fn write_u64(&mut self, vmaddr: u64, value: u64) -> Result<(), crate::error::FixupError> {
        let addr = self.load_address.wrapping_add(vmaddr.wrapping_sub(self.preferred_base));
        // SAFETY: see `read_u64`; the segment was mapped read-write by `map_image`.
        unsafe { std::ptr::write_unaligned(addr as *mut u64, value) };
        Ok(())
    }
}

/// [`CacheMemory`] backed by the shared cache's own mapping: `MacPlatform`
/// maps the whole cache read-write once at attach time, so a patch write
/// is just a raw store at `base_address + cache_offset` (§4.4.7 "suspend
/// accounting" is a kernel-side concern the platform seam doesn't expose
/// to this crate; the write itself is what §4.4.7 actually specifies).
struct MappedCacheMemory {
    base_address: u64,
}

impl CacheMemory for MappedCacheMemory {
    fn write_u64_suspending_accounting(&mut self, cache_offset: u64, value: u64) {
        let addr = self.base_address.wrapping_add(cache_offset);
        // SAFETY: `cache_offset` came from a `PatchTable` entry built by
        // the cache's own indexer, which only records offsets inside the
        // cache mapping.
        unsafe { std::ptr::write_unaligned(addr as *mut u64, value) };
    }
}

/// [`BindResolver`] that answers against the live [`ImageGraph`] using
/// §4.4.4's two-level/flat policy, then rewrites the resolved address
/// through the composed interpose table (§4.4.6) unless the importer
/// itself declared the interposition.
struct GraphBindResolver<'a> {
    graph: &'a ImageGraph,
    importer: ImageId,
    dependents: Vec<ImageId>,
    inserted: Vec<ImageId>,
    interpose_table: &'a HashMap<u64, u64>,
    importer_declares_interpose: bool,
}

impl BindResolver for GraphBindResolver<'_> {
    fn resolve(&mut self, req: &BindRequest<'_>) -> Result<Option<u64>, crate::error::FixupError> {
        let resolution = namespace::resolve_import(
            self.graph,
            self.importer,
            &self.dependents,
            req.library_ordinal,
            req.symbol_name,
            &self.inserted,
        )
        .map_err(crate::error::FixupError::Symbol)?;
        Ok(resolution.map(|r| interpose::apply(self.interpose_table, r.address, self.importer_declares_interpose)))
    }
}

/// [`chained::ImportResolver`] that answers against the live
/// [`ImageGraph`], the chained-fixup counterpart of [`GraphBindResolver`].
struct GraphChainedResolver<'a> {
    graph: &'a ImageGraph,
    importer: ImageId,
    dependents: Vec<ImageId>,
    inserted: Vec<ImageId>,
    interpose_table: &'a HashMap<u64, u64>,
    importer_declares_interpose: bool,
}

impl chained::ImportResolver for GraphChainedResolver<'_> {
    fn resolve(&self, import: &ChainedImport) -> Result<Option<u64>, crate::error::FixupError> {
        let ordinal = crate::context::LibraryOrdinal::decode(import.library_ordinal);
        let resolution = namespace::resolve_import(
            self.graph,
            self.importer,
            &self.dependents,
            ordinal,
            &import.symbol_name,
            &self.inserted,
        )
        .map_err(crate::error::FixupError::Symbol)?;
        Ok(resolution.map(|r| interpose::apply(self.interpose_table, r.address, self.importer_declares_interpose)))
    }
}

/// One parsed-but-not-yet-resolved dependency entry (§3 "Dependency vector").
struct RawDependency {
    name: String,
    min_version: u32,
    compat_version: u32,
    kind: DependencyKind,
}

/// Everything extracted from an image's load commands before any
/// resolution or mapping has happened.
struct ParsedImage {
    segments: Vec<Segment>,
    dependencies: Vec<RawDependency>,
    rpaths: Vec<PathBuf>,
    uuid: Option<[u8; 16]>,
    install_name: Option<String>,
    current_version: u32,
    compat_version: u32,
    dyld_info: Option<DyldInfoCommand>,
    chained_fixups: Option<(u64, u64)>,
    code_signature: Option<(u64, u64)>,
    flags: ImageFlags,
    init_sections: Vec<SectionRef>,
    term_sections: Vec<SectionRef>,
    interpose_sections: Vec<SectionRef>,
}

/// Where a `__mod_init_func`/`__mod_term_func` section's pointer array
/// lives, both in the file and in the preferred address space (§4.6
/// "initializers are discovered from the `__DATA`/`__DATA_CONST`
/// `__mod_init_func` section" rather than passed in explicitly).
#[derive(Debug, Clone, Copy)]
struct SectionRef {
    addr: u64,
    size: u64,
    seg_vm_addr: u64,
    seg_file_offset: u64,
}

fn parse_load_commands(file: &File, slice_offset: u64, header: &MachHeader64) -> Result<ParsedImage, LoaderError> {
    let cmds_buf = read_at(file, slice_offset + MachHeader64::SIZE as u64, header.size_of_cmds as usize)?;
    let mut segments = Vec::new();
    let mut dependencies = Vec::new();
    let mut rpaths = Vec::new();
    let mut uuid = None;
    let mut install_name = None;
    let mut current_version = 0;
    let mut compat_version = 0;
    let mut dyld_info = None;
    let mut chained_fixups = None;
    let mut code_signature = None;
    let mut init_sections = Vec::new();
    let mut term_sections = Vec::new();
    let mut interpose_sections = Vec::new();

    for cmd in LoadCommands::new(&cmds_buf, header.ncmds) {
        let (hdr, body) = cmd.map_err(FormatError::from)?;
        match hdr.cmd {
            LC_SEGMENT_64 => {
                let seg = SegmentCommand64::parse(body).map_err(FormatError::from)?;
                if seg.name_str() == "__LINKEDIT" {
                    // __LINKEDIT mapping is handled specially by the mapper
                    // (always read-only); it still needs a Segment entry so
                    // fixup-location bounds checks see it.
                }
                for sect in macho::parse_sections(body, seg.nsects).map_err(FormatError::from)? {
                    let sect_ref = SectionRef {
                        addr: sect.addr,
                        size: sect.size,
                        seg_vm_addr: seg.vm_addr,
                        seg_file_offset: seg.file_off,
                    };
                    match sect.sect_name_str().as_ref() {
                        "__mod_init_func" => init_sections.push(sect_ref),
                        "__mod_term_func" => term_sections.push(sect_ref),
                        "__interpose" => interpose_sections.push(sect_ref),
                        _ => {}
                    }
                }
                segments.push(Segment {
                    name: seg.seg_name,
                    vm_addr: seg.vm_addr,
                    vm_size: seg.vm_size,
                    file_offset: seg.file_off,
                    file_size: seg.file_size,
                    init_prot: crate::image::Permission::from_prot(seg.init_prot),
                    max_prot: crate::image::Permission::from_prot(seg.max_prot),
                    p2align: 0,
                });
            }
            LC_LOAD_DYLIB => {
                let d = DylibCommand::parse(body).map_err(FormatError::from)?;
                dependencies.push(RawDependency {
                    name: d.name,
                    min_version: d.compatibility_version,
                    compat_version: d.compatibility_version,
                    kind: DependencyKind::Required,
                });
            }
            LC_LOAD_WEAK_DYLIB => {
                let d = DylibCommand::parse(body).map_err(FormatError::from)?;
                dependencies.push(RawDependency {
                    name: d.name,
                    min_version: d.compatibility_version,
                    compat_version: d.compatibility_version,
                    kind: DependencyKind::Weak,
                });
            }
            macho::LC_REEXPORT_DYLIB => {
                let d = DylibCommand::parse(body).map_err(FormatError::from)?;
                dependencies.push(RawDependency {
                    name: d.name,
                    min_version: d.compatibility_version,
                    compat_version: d.compatibility_version,
                    kind: DependencyKind::Reexport,
                });
            }
            LC_LOAD_UPWARD_DYLIB => {
                let d = DylibCommand::parse(body).map_err(FormatError::from)?;
                dependencies.push(RawDependency {
                    name: d.name,
                    min_version: d.compatibility_version,
                    compat_version: d.compatibility_version,
                    kind: DependencyKind::Upward,
                });
            }
            LC_ID_DYLIB => {
                let d = DylibCommand::parse(body).map_err(FormatError::from)?;
                install_name = Some(d.name);
                current_version = d.current_version;
                compat_version = d.compatibility_version;
            }
            LC_RPATH => {
                let p = macho::parse_rpath(body).map_err(FormatError::from)?;
                rpaths.push(PathBuf::from(p));
            }
            LC_UUID => {
                uuid = Some(macho::parse_uuid(body).map_err(FormatError::from)?);
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                dyld_info = Some(DyldInfoCommand::parse(body).map_err(FormatError::from)?);
            }
            LC_DYLD_CHAINED_FIXUPS => {
                let d = macho::LinkeditDataCommand::parse(body).map_err(FormatError::from)?;
                chained_fixups = Some((d.data_off as u64, d.data_size as u64));
            }
            macho::LC_CODE_SIGNATURE => {
                let d = macho::LinkeditDataCommand::parse(body).map_err(FormatError::from)?;
                code_signature = Some((d.data_off as u64, d.data_size as u64));
            }
            _ => {}
        }
    }

    let mut flags = match header.file_type {
        MH_EXECUTE => ImageFlags::IS_MAIN_EXECUTABLE,
        MH_DYLIB => ImageFlags::IS_DYLIB,
        MH_BUNDLE => ImageFlags::IS_BUNDLE,
        other => return Err(crate::error::CompatibilityError::BadFiletype(other).into()),
    };
    flags |= ImageFlags::TWO_LEVEL_NAMESPACE;
    if header.flags & MH_PIE != 0 {
        flags |= ImageFlags::IS_PIE;
    }

    Ok(ParsedImage {
        segments,
        dependencies,
        rpaths,
        uuid,
        install_name,
        current_version,
        compat_version,
        dyld_info,
        chained_fixups,
        code_signature,
        flags,
        init_sections,
        term_sections,
        interpose_sections,
    })
}

/// Reads a `__interpose` section's `(replacement, replacee)` pointer
/// pairs (`dyld_interpose_tuple`, §4.4.6). Unlike initializer/terminator
/// offsets these are consumed as absolute addresses directly: the
/// loader's segments are never slid (see `MappedImageMemory`'s own
/// preferred-base-equals-load-address convention), so no further
/// adjustment is needed.
fn read_interpose_section(file: &File, slice_offset: u64, section: &SectionRef) -> Result<Vec<(u64, u64)>, LoaderError> {
    let file_offset = slice_offset + section.seg_file_offset + (section.addr - section.seg_vm_addr);
    let bytes = read_at(file, file_offset, section.size as usize)?;
    Ok(bytes
        .chunks_exact(16)
        .map(|c| {
            let replacement = u64::from_le_bytes(c[0..8].try_into().unwrap());
            let replacee = u64::from_le_bytes(c[8..16].try_into().unwrap());
            (replacement, replacee)
        })
        .collect())
}

/// Reads a `__mod_init_func`/`__mod_term_func` section's pointer array
/// and converts each entry from a preferred vmaddr to a `load_address`-
/// relative offset (§4.6), the convention [`crate::init::run_own_initializers`]
/// and [`crate::init::run_terminator`] expect.
fn read_function_pointer_section(
    file: &File,
    slice_offset: u64,
    section: &SectionRef,
    load_address: u64,
) -> Result<Vec<u64>, LoaderError> {
    let file_offset = slice_offset + section.seg_file_offset + (section.addr - section.seg_vm_addr);
    let bytes = read_at(file, file_offset, section.size as usize)?;
    let preferred_base = load_address; // slide is always 0 for this loader (see `map_image` call site).
    Ok(bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()).wrapping_sub(preferred_base))
        .collect())
}

/// Process-wide loader state: the image graph plus every collaborator
/// needed to resolve, map, fix up, and initialize a Mach-O image.
pub struct Loader {
    pub graph: ImageGraph,
    pub ctx: LinkContext,
    pub notifier: Notifier,
    pub cache: Option<SharedCache>,
    pub gc: GcCoordinator,
    platform: Box<dyn PlatformOps>,
    cpu_type: i32,
    cpu_subtype: i32,
    /// Populates a freshly mapped image's exported-symbol table (§1's
    /// out-of-scope trie/nlist parser). `None` leaves every image's
    /// exports empty.
    pub export_source: Option<Box<dyn Fn(&Path) -> SymbolTable + Send + Sync>>,
    /// `DYLD_INSERT_LIBRARIES` images, force-loaded ahead of the main
    /// executable's own dependents (§4.1 tie-break, §6 INSERT_LIBRARIES).
    /// Consulted first by every flat-namespace lookup this process does.
    pub inserted: parking_lot::RwLock<Vec<ImageId>>,
    /// Composed `replacee -> final replacement` map built from every
    /// inserted image's `__interpose` section (§4.4.6), applied to every
    /// bind this process performs after the inserted libraries themselves
    /// are bound.
    pub interpose_table: parking_lot::RwLock<HashMap<u64, u64>>,
}

impl Loader {
    pub fn new(ctx: LinkContext, platform: Box<dyn PlatformOps>, cpu_type: i32, cpu_subtype: i32) -> Self {
        Self {
            graph: ImageGraph::new(),
            ctx,
            notifier: Notifier::new(),
            cache: None,
            gc: GcCoordinator::new(),
            platform,
            cpu_type,
            cpu_subtype,
            export_source: None,
            inserted: parking_lot::RwLock::new(Vec::new()),
            interpose_table: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Force-loads every `DYLD_INSERT_LIBRARIES` entry ahead of the main
    /// executable (§6 INSERT_LIBRARIES row: "Force-load each colon-
    /// separated library before dependents"), then composes their
    /// `__interpose` tuples into a single rewrite table (§4.4.6) before
    /// any other image is bound.
    fn load_inserted_libraries(&self) -> Result<(), LoaderError> {
        let paths = self.ctx.env.insert_libraries.clone();
        let mut ids = Vec::with_capacity(paths.len());
        for path in &paths {
            let id = self.load_one(path, RequiredFileKind::DylibOrBundle, &RPathChain::EMPTY, false)?;
            ids.push(id);
        }

        let mut tuples = Vec::new();
        for &id in &ids {
            self.graph.with(id, |img| {
                tuples.extend(
                    img.interpose_tuples
                        .iter()
                        .map(|&(replacement, replacee)| InterposeTuple { replacement, replacee }),
                );
            });
        }
        *self.interpose_table.write() = interpose::build_table(&tuples);
        *self.inserted.write() = ids;
        Ok(())
    }

    /// Loads the main executable and its full dependency closure, then
    /// runs the initializer pass over the whole process (§3 process
    /// flow step "process launch").
    pub fn load_main_executable(&self, path: &Path) -> Result<ImageId, LoaderError> {
        self.load_inserted_libraries()?;
        let id = self.load_one(path, RequiredFileKind::Executable, &RPathChain::EMPTY, true)?;

        for image_id in self.graph.all_ids() {
            link_static_refs(&self.graph, image_id);
        }
        assign_depths(&self.graph, id);
        self.coalesce_weak_definitions();

        run_initializer_closure(&self.graph, &self.ctx, &self.notifier, id)?;
        Ok(id)
    }

    /// Merge-walks every image flagged `PARTICIPATES_IN_COALESCING` and
    /// rewrites each one's own export entry for a coalesced symbol to the
    /// chosen canonical address (§4.4.5), so that later two-level lookups
    /// by name land on the same definition regardless of which
    /// participant defined it.
    fn coalesce_weak_definitions(&self) {
        let participants: Vec<ImageId> = self
            .graph
            .all_ids()
            .into_iter()
            .filter(|&id| {
                self.graph
                    .with(id, |img| img.flags.contains(ImageFlags::PARTICIPATES_IN_COALESCING))
                    .unwrap_or(false)
            })
            .collect();
        if participants.len() < 2 {
            return;
        }

        let snapshots: Vec<(ImageId, Vec<crate::image::ExportedSymbol>)> = participants
            .iter()
            .map(|&id| (id, self.graph.with(id, |img| img.symbols.exports.clone()).unwrap_or_default()))
            .collect();
        let tables: Vec<(ImageId, &[crate::image::ExportedSymbol])> =
            snapshots.iter().map(|(id, exports)| (*id, exports.as_slice())).collect();
        let coalesced = weak::coalesce(&tables);

        for c in &coalesced {
            for &id in &participants {
                self.graph.with_mut(id, |img| {
                    if let Some(sym) = img.symbols.exports.iter_mut().find(|s| s.name == c.symbol) {
                        sym.address = c.canonical_address;
                    }
                });
            }
        }
    }

    /// `dlopen`-equivalent: resolves and loads `load_name` (and whatever
    /// of its own closure is not already loaded) against `requester`,
    /// then runs initializers over just the newly loaded subgraph.
    /// Unwinds every image this call introduced if any phase fails (§7
    /// Propagation).
    pub fn dlopen(&self, load_name: &str, requester: ImageId) -> Result<ImageId, LoaderError> {
        let before: std::collections::HashSet<ImageId> = self.graph.all_ids().into_iter().collect();

        let result = self.dlopen_inner(load_name, requester);
        match result {
            Ok(id) => {
                self.graph.with(id, |img| img.refs.inc_dlopen());
                Ok(id)
            }
            Err(e) => {
                let after = self.graph.all_ids();
                for image_id in after {
                    if before.contains(&image_id) {
                        continue;
                    }
                    let bound = self
                        .graph
                        .with(image_id, |img| img.state_cell().at_least(ImageState::Bound))
                        .unwrap_or(true);
                    if !bound {
                        crate::mapper::unmap_image(self.platform.as_ref(), &self.graph, image_id);
                        self.graph.remove(image_id);
                    }
                }
                Err(e)
            }
        }
    }

    fn dlopen_inner(&self, load_name: &str, requester: ImageId) -> Result<ImageId, LoaderError> {
        let (requester_dir, rpaths, requester_is_main) = self
            .graph
            .with(requester, |img| {
                (
                    img.path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/")),
                    img.rpaths.clone(),
                    img.flags.contains(ImageFlags::IS_MAIN_EXECUTABLE),
                )
            })
            .unwrap_or((PathBuf::from("/"), Vec::new(), false));

        let chain = RPathChain::new(None, &rpaths);
        let req = LoadRequest {
            load_name,
            requester_dir: &requester_dir,
            requester_is_main_executable: requester_is_main,
            rpaths: &chain,
            force_search_paths: true,
            must_be_dylib: true,
        };

        let outcome = resolve(&req, &self.ctx, &self.graph, self.cache.as_ref())?;
        let id = match outcome {
            ResolveOutcome::AlreadyLoaded(id) => id,
            ResolveOutcome::CacheResident { mh_addr, install_name } => {
                self.adopt_cache_resident(mh_addr, &install_name)
            }
            ResolveOutcome::FilePath(path) => {
                self.load_one(&path, RequiredFileKind::DylibOrBundle, &chain, false)?
            }
        };

        // No dynamic edge is recorded here: `dlopenRefs` (bumped by the
        // caller in `dlopen`, below) is what keeps this image alive for
        // as long as the caller holds the handle. A dynamic edge would
        // never be cleared by `dlclose` and would make every `dlopen`ed
        // image permanently unreachable-to-GC, breaking the round-trip
        // law (§8 "load-then-close ... leaves the image list identical").
        link_static_refs(&self.graph, id);
        assign_depths(&self.graph, id);
        self.coalesce_weak_definitions();
        run_initializer_closure(&self.graph, &self.ctx, &self.notifier, id)?;
        Ok(id)
    }

    /// Decrements this handle's `dlopenRefs` and runs GC; returns every
    /// image collected as a result (§4.5).
    pub fn dlclose(&self, id: ImageId) -> Result<Vec<ImageId>, LoaderError> {
        self.graph.with(id, |img| img.refs.dec_dlopen());
        Ok(self.gc.run(&self.graph, &self.ctx, self.platform.as_ref(), &self.notifier)?)
    }

    /// Walks `path`'s full dependency closure purely to validate
    /// resolvability, without mapping or fixing up any image --
    /// `ImageLoader::recursiveLoadLibraries`'s `preflightOnly` mode.
    /// Returns every path that would be loaded, in load order, or the
    /// first unresolved non-weak dependency's error.
    pub fn load_bundle_preflight(&self, path: &Path) -> Result<Vec<PathBuf>, LoaderError> {
        let mut seen = std::collections::HashSet::new();
        let mut order = Vec::new();
        self.preflight_one(path, &RPathChain::EMPTY, true, &mut seen, &mut order)?;
        Ok(order)
    }

    fn preflight_one(
        &self,
        path: &Path,
        parent_rpaths: &RPathChain<'_>,
        is_main_executable: bool,
        seen: &mut std::collections::HashSet<PathBuf>,
        order: &mut Vec<PathBuf>,
    ) -> Result<(), LoaderError> {
        if !seen.insert(path.to_path_buf()) {
            return Ok(());
        }

        if self.graph.find_by_path(path).is_some() {
            order.push(path.to_path_buf());
            return Ok(());
        }

        let kind = if is_main_executable {
            RequiredFileKind::Executable
        } else {
            RequiredFileKind::DylibOrBundle
        };
        let (file, slice) = open_and_select_slice(path, self.cpu_type, self.cpu_subtype, kind)?;
        let parsed = parse_load_commands(&file, slice.slice_offset, &slice.header)?;
        order.push(path.to_path_buf());

        let own_rpaths = parsed.rpaths.clone();
        let own_chain = RPathChain::new(Some(parent_rpaths), &own_rpaths);

        for dep in parsed.dependencies {
            let req = LoadRequest {
                load_name: &dep.name,
                requester_dir: path.parent().unwrap_or(Path::new("/")),
                requester_is_main_executable: is_main_executable,
                rpaths: &own_chain,
                force_search_paths: false,
                must_be_dylib: true,
            };
            match resolve(&req, &self.ctx, &self.graph, self.cache.as_ref()) {
                Ok(ResolveOutcome::AlreadyLoaded(id)) => {
                    if let Some(p) = self.graph.with(id, |img| img.path.clone()) {
                        if seen.insert(p.clone()) {
                            order.push(p);
                        }
                    }
                }
                Ok(ResolveOutcome::CacheResident { install_name, .. }) => {
                    let p = PathBuf::from(install_name);
                    if seen.insert(p.clone()) {
                        order.push(p);
                    }
                }
                Ok(ResolveOutcome::FilePath(dep_path)) => {
                    self.preflight_one(&dep_path, &own_chain, false, seen, order)?;
                }
                Err(e) => {
                    if dep.kind != DependencyKind::Weak {
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(())
    }

    /// Registers a shared-cache dylib the resolver matched without a
    /// real file to parse (§4.1 Component Design intro): the cache
    /// reader already indexed it, so this only needs a graph entry.
    fn adopt_cache_resident(&self, mh_addr: u64, install_name: &str) -> ImageId {
        if let Some(id) = self.graph.find_by_install_name(install_name) {
            return id;
        }
        let id = self.graph.insert(|id| {
            let mut img = Image::new(id, PathBuf::from(install_name), mh_addr, 0, ImageFlags::IN_SHARED_CACHE | ImageFlags::IS_DYLIB);
            img.install_name = Some(install_name.to_string());
            img.state_cell().set(ImageState::Bound);
            img
        });
        self.notifier.notify_state(id, ImageState::Bound);
        id
    }

    /// Resolves, opens, maps, recursively loads dependencies of, and
    /// fixes up a single image (§4.1-§4.4). Returns once the image has
    /// reached `Bound`.
    fn load_one(
        &self,
        path: &Path,
        kind: RequiredFileKind,
        parent_rpaths: &RPathChain<'_>,
        is_main_executable: bool,
    ) -> Result<ImageId, LoaderError> {
        if let Some(id) = self.graph.find_by_path(path) {
            return Ok(id);
        }

        let (file, slice) = open_and_select_slice(path, self.cpu_type, self.cpu_subtype, kind)?;
        let parsed = parse_load_commands(&file, slice.slice_offset, &slice.header)?;

        let symbols = self.export_source.as_ref().map(|f| f(path)).unwrap_or_default();
        let participates_in_coalescing = symbols.exports.iter().any(|s| s.is_weak);
        let declares_interpose = !parsed.interpose_sections.is_empty();

        let id = self.graph.insert(|id| {
            let mut img = Image::new(id, path.to_path_buf(), 0, 0, parsed.flags);
            img.segments = parsed.segments.clone();
            img.rpaths = parsed.rpaths.clone();
            img.uuid = parsed.uuid;
            img.install_name = parsed.install_name.clone();
            img.current_version = parsed.current_version;
            img.compat_version = parsed.compat_version;
            img.symbols = symbols;
            if participates_in_coalescing {
                img.flags |= ImageFlags::PARTICIPATES_IN_COALESCING;
            }
            if declares_interpose {
                img.flags |= ImageFlags::DECLARES_INTERPOSE;
            }
            img
        });

        for section in &parsed.interpose_sections {
            let tuples = read_interpose_section(&file, slice.slice_offset, section)?;
            self.graph.with_mut(id, |img| img.interpose_tuples.extend(tuples.iter().copied()));
        }

        map_image(self.platform.as_ref(), &self.graph, id, &file, 0, parsed.code_signature).map_err(|e| {
            self.graph.remove(id);
            LoaderError::Map(e)
        })?;
        self.graph.with(id, |img| img.state_cell().advance_if_below(ImageState::DependentsMapped));
        self.notifier.notify_state(id, ImageState::DependentsMapped);

        let load_address = self.graph.with(id, |img| img.load_address).unwrap_or(0);
        for section in &parsed.init_sections {
            let offsets = read_function_pointer_section(&file, slice.slice_offset, section, load_address)?;
            self.graph.with_mut(id, |img| img.initializers.extend(offsets.iter().copied()));
        }
        for section in &parsed.term_sections {
            let offsets = read_function_pointer_section(&file, slice.slice_offset, section, load_address)?;
            self.graph.with_mut(id, |img| img.terminators.extend(offsets.iter().copied()));
        }

        let own_rpaths = parsed.rpaths.clone();
        let own_chain = RPathChain::new(Some(parent_rpaths), &own_rpaths);

        let mut resolved_deps: Vec<(RawDependency, Option<ImageId>)> = Vec::new();
        for dep in parsed.dependencies {
            let req = LoadRequest {
                load_name: &dep.name,
                requester_dir: path.parent().unwrap_or(Path::new("/")),
                requester_is_main_executable: is_main_executable,
                rpaths: &own_chain,
                force_search_paths: false,
                must_be_dylib: true,
            };
            let outcome = resolve(&req, &self.ctx, &self.graph, self.cache.as_ref());
            let resolved = match outcome {
                Ok(ResolveOutcome::AlreadyLoaded(id)) => Some(id),
                Ok(ResolveOutcome::CacheResident { mh_addr, install_name }) => {
                    Some(self.adopt_cache_resident(mh_addr, &install_name))
                }
                Ok(ResolveOutcome::FilePath(dep_path)) => {
                    Some(self.load_one(&dep_path, RequiredFileKind::DylibOrBundle, &own_chain, false)?)
                }
                Err(e) => {
                    if dep.kind == DependencyKind::Weak {
                        None
                    } else {
                        crate::mapper::unmap_image(self.platform.as_ref(), &self.graph, id);
                        self.graph.remove(id);
                        return Err(e.into());
                    }
                }
            };

            // §7 Compatibility: "dependent's current-version below
            // requested compat-version". Cache-resident stand-ins carry
            // no parsed version metadata (§3 `SharedCache` records no
            // version field), so only a fully parsed on-disk/already-
            // loaded image is checked.
            if let Some(resolved_id) = resolved {
                let version_info = self.graph.with(resolved_id, |img| {
                    (img.current_version, img.flags.contains(ImageFlags::IN_SHARED_CACHE), img.path.clone(), img.install_name.clone())
                });
                if let Some((current, in_shared_cache, resolved_path, install_name)) = version_info {
                    if !in_shared_cache && current < dep.compat_version {
                        let name = install_name.unwrap_or_else(|| resolved_path.display().to_string());
                        log::warn!(
                            "dependency {:?} current version {:#x} is below the compatibility version {:#x} required by {:?}",
                            name,
                            current,
                            dep.compat_version,
                            resolved_path
                        );
                        crate::mapper::unmap_image(self.platform.as_ref(), &self.graph, id);
                        self.graph.remove(id);
                        return Err(crate::error::CompatibilityError::VersionMismatch {
                            name,
                            current,
                            required: dep.compat_version,
                        }
                        .into());
                    }
                }
            }

            resolved_deps.push((dep, resolved));
        }

        let dependents: Vec<ImageId> = resolved_deps.iter().filter_map(|(_, r)| *r).collect();
        self.graph.with_mut(id, |img| {
            for (dep, resolved) in &resolved_deps {
                img.dependencies.get_mut().push(Dependency {
                    name: dep.name.clone(),
                    min_version: dep.min_version,
                    compat_version: dep.compat_version,
                    kind: dep.kind,
                    resolved: *resolved,
                });
            }
        });
        self.graph.with(id, |img| img.state_cell().advance_if_below(ImageState::DependentsMapped));
        self.notifier.notify_state(id, ImageState::DependentsMapped);

        self.apply_fixups(id, &file, slice.slice_offset, &parsed, &dependents)
            .map_err(|e| {
                crate::mapper::unmap_image(self.platform.as_ref(), &self.graph, id);
                self.graph.remove(id);
                e
            })?;

        self.graph.with(id, |img| img.state_cell().set(ImageState::Rebased));
        self.notifier.notify_state(id, ImageState::Rebased);
        self.graph.with(id, |img| img.state_cell().set(ImageState::Bound));
        self.notifier.notify_state(id, ImageState::Bound);

        self.patch_cache_if_override(id, path);

        Ok(id)
    }

    /// If `path` overrides a shared-cache dylib that carries a patch
    /// table, rewrites every recorded use of this image's exports inside
    /// the cache to point here instead (§4.4.7, §8 scenario 4). Reaching
    /// `load_one` for a cache-indexed path is itself proof the on-disk
    /// copy was preferred over the cache-resident one -- the resolver
    /// only ever returns `ResolveOutcome::FilePath` for such a path when
    /// `CacheLookup::PreferDisk` won.
    fn patch_cache_if_override(&self, id: ImageId, path: &Path) {
        let Some(cache) = self.cache.as_ref() else { return };
        let Some(entry) = cache.dylib(path) else { return };
        let Some(table) = entry.patch_table.as_ref() else { return };

        let exports: Vec<(String, u64)> = self
            .graph
            .with(id, |img| img.symbols.exports.iter().map(|s| (s.name.clone(), s.address)).collect())
            .unwrap_or_default();

        let mut mem = MappedCacheMemory { base_address: cache.base_address };
        cache_patch::patch_overridden_dylib(table, exports.into_iter(), &mut mem);
    }

    fn apply_fixups(
        &self,
        id: ImageId,
        file: &File,
        slice_offset: u64,
        parsed: &ParsedImage,
        dependents: &[ImageId],
    ) -> Result<(), LoaderError> {
        let Some(dyld_info) = &parsed.dyld_info else {
            return Ok(());
        };

        let linkedit = parsed
            .segments
            .iter()
            .find(|s| s.name_str() == "__LINKEDIT")
            .ok_or(MapError::AddressRangeOccupied)?;
        let lowest = parsed.segments.iter().map(|s| s.vm_addr).min().unwrap_or(0);
        let (load_address, slide) = self
            .graph
            .with(id, |img| (img.load_address, img.slide))
            .unwrap_or((0, 0));

        let linkedit_file_base = linkedit.file_offset + slice_offset;

        let rebase_bytes = read_at(file, linkedit_file_base + dyld_info.rebase_off as u64, dyld_info.rebase_size as usize)?;
        let bind_bytes = read_at(file, linkedit_file_base + dyld_info.bind_off as u64, dyld_info.bind_size as usize)?;
        let weak_bind_bytes = read_at(
            file,
            linkedit_file_base + dyld_info.weak_bind_off as u64,
            dyld_info.weak_bind_size as usize,
        )?;

        let mut mem = MappedImageMemory {
            load_address,
            preferred_base: lowest,
        };

        rebase::apply_rebase(&rebase_bytes, &parsed.segments, slide, &mut mem)?;

        let inserted = self.inserted.read().clone();
        let interpose_table = self.interpose_table.read();
        let importer_declares_interpose = !parsed.interpose_sections.is_empty();
        let mut resolver = GraphBindResolver {
            graph: &self.graph,
            importer: id,
            dependents: dependents.to_vec(),
            inserted: inserted.clone(),
            interpose_table: &interpose_table,
            importer_declares_interpose,
        };
        bind::apply_binds(&bind_bytes, &parsed.segments, &mut resolver, &mut mem)?;
        bind::apply_binds(&weak_bind_bytes, &parsed.segments, &mut resolver, &mut mem)?;

        if let Some((off, size)) = parsed.chained_fixups {
            self.apply_chained_fixups(
                id,
                file,
                linkedit_file_base,
                off,
                size,
                &parsed.segments,
                slide,
                &mut mem,
                dependents,
                &inserted,
                &interpose_table,
                importer_declares_interpose,
            )?;
        }

        Ok(())
    }

    /// Decodes and walks every chain named by a `DYLD_CHAINED_FIXUPS`
    /// linkedit blob (§4.4.2): the fixups header, the per-segment starts
    /// table, and (for the uncompressed import format) the imports table,
    /// then calls [`chained::walk_chain`] once per page that has a chain.
    #[allow(clippy::too_many_arguments)]
    fn apply_chained_fixups(
        &self,
        id: ImageId,
        file: &File,
        linkedit_file_base: u64,
        data_off: u64,
        data_size: u64,
        segments: &[Segment],
        slide: i64,
        mem: &mut dyn ImageMemory,
        dependents: &[ImageId],
        inserted: &[ImageId],
        interpose_table: &HashMap<u64, u64>,
        importer_declares_interpose: bool,
    ) -> Result<(), LoaderError> {
        let blob = read_at(file, linkedit_file_base + data_off, data_size as usize)?;
        let header = ChainedFixupsHeader::parse(&blob).map_err(FormatError::from)?;

        // Only the uncompressed import format (1) is decoded; an image
        // built with the addend variants (2/3) simply yields no resolved
        // imports, so any bind chain in it surfaces as a missing-symbol
        // error rather than being misdecoded.
        let imports: Vec<ChainedImport> = if header.imports_format == 1 {
            macho::parse_chained_imports(&blob, header.imports_offset, header.imports_count, header.symbols_offset)
                .map_err(FormatError::from)?
                .into_iter()
                .map(|raw| ChainedImport {
                    library_ordinal: raw.lib_ordinal,
                    symbol_name: raw.name,
                    addend: 0,
                    is_weak: raw.weak_import,
                })
                .collect()
        } else {
            Vec::new()
        };

        let starts_blob = blob
            .get(header.starts_offset as usize..)
            .ok_or(FormatError::Truncated)?;
        let starts = macho::parse_chained_starts(starts_blob).map_err(FormatError::from)?;

        let resolver = GraphChainedResolver {
            graph: &self.graph,
            importer: id,
            dependents: dependents.to_vec(),
            inserted: inserted.to_vec(),
            interpose_table,
            importer_declares_interpose,
        };

        let preferred_base = segments.iter().map(|s| s.vm_addr).min().unwrap_or(0);
        for start in starts.iter().flatten() {
            let format = match start.pointer_format {
                macho::DYLD_CHAINED_PTR_ARM64E | macho::DYLD_CHAINED_PTR_ARM64E_USERLAND24 => PointerFormat::Arm64e,
                _ => PointerFormat::Generic64,
            };
            let page_size = start.page_size as u64;
            for (page_index, &page_start) in start.page_starts.iter().enumerate() {
                if page_start == macho::DYLD_CHAINED_PTR_START_NONE {
                    continue;
                }
                let chain_head = preferred_base
                    + start.segment_offset
                    + page_index as u64 * page_size
                    + page_start as u64;
                chained::walk_chain(mem, &imports, &resolver, format, chain_head, slide)?;
            }
        }

        Ok(())
    }
}
