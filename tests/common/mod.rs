//! Shared mach-o byte-buffer construction for the integration tests in
//! this directory. Mirrors `loader.rs`'s own inline
//! `write_single_segment_executable` helper, generalized enough to add
//! a `LC_LOAD_DYLIB` dependency and named, file-backed sections (so
//! `__mod_init_func`/`__mod_term_func`/`__interpose` can carry real
//! data) without ever needing a `DYLD_INFO`/chained-fixups command --
//! every file built here has none, so loading it never reaches
//! `MappedImageMemory`'s raw pointer path.

use std::io::Write;
use std::path::Path;

pub const CPU_TYPE_ARM64: i32 = 0x0100_000c;

const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
const LC_SEGMENT_64: u32 = 0x19;
const LC_LOAD_DYLIB: u32 = 0xc;

/// One named, file-backed section inside the single `__TEXT` segment
/// every test image in this directory carries.
pub struct Section {
    pub name: &'static str,
    pub data: Vec<u8>,
}

/// Writes a thin mach-o with one `__TEXT` segment (`seg_vmaddr`,
/// `seg_vmsize`, r-x), the given sections, and an `LC_LOAD_DYLIB` for
/// each entry in `dylibs`. No `DYLD_INFO`, no chained fixups, no
/// `LC_MAIN` -- only what `parse_load_commands` reads.
pub fn write_image(
    path: &Path,
    file_type: u32,
    seg_vmaddr: u64,
    seg_vmsize: u64,
    sections: &[Section],
    dylibs: &[&str],
) {
    let mut cmds = Vec::new();
    let nsects = sections.len() as u32;

    let seg_cmd_size = 72 + 80 * nsects;
    cmds.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
    cmds.extend_from_slice(&seg_cmd_size.to_le_bytes());
    let mut seg_name = [0u8; 16];
    seg_name[..6].copy_from_slice(b"__TEXT");
    cmds.extend_from_slice(&seg_name);
    cmds.extend_from_slice(&seg_vmaddr.to_le_bytes());
    cmds.extend_from_slice(&seg_vmsize.to_le_bytes());
    cmds.extend_from_slice(&0u64.to_le_bytes()); // file_off
    cmds.extend_from_slice(&0u64.to_le_bytes()); // file_size
    cmds.extend_from_slice(&5i32.to_le_bytes()); // max_prot r-x
    cmds.extend_from_slice(&5i32.to_le_bytes()); // init_prot r-x
    cmds.extend_from_slice(&nsects.to_le_bytes());
    cmds.extend_from_slice(&0u32.to_le_bytes()); // flags

    let sections_header_start = cmds.len();
    for s in sections {
        let mut sect_name = [0u8; 16];
        let name_bytes = s.name.as_bytes();
        sect_name[..name_bytes.len()].copy_from_slice(name_bytes);
        cmds.extend_from_slice(&sect_name);
        cmds.extend_from_slice(&seg_name);
        cmds.extend_from_slice(&0u64.to_le_bytes()); // addr, patched below
        cmds.extend_from_slice(&(s.data.len() as u64).to_le_bytes()); // size
        cmds.extend_from_slice(&0u32.to_le_bytes()); // offset (unused by this reader)
        cmds.extend_from_slice(&0u32.to_le_bytes()); // align
        cmds.extend_from_slice(&0u32.to_le_bytes()); // reloff
        cmds.extend_from_slice(&0u32.to_le_bytes()); // nreloc
        cmds.extend_from_slice(&0u32.to_le_bytes()); // flags
        cmds.extend_from_slice(&0u32.to_le_bytes()); // reserved1
        cmds.extend_from_slice(&0u32.to_le_bytes()); // reserved2
        cmds.extend_from_slice(&0u32.to_le_bytes()); // reserved3
    }

    for name in dylibs {
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);
        while (24 + name_bytes.len()) % 8 != 0 {
            name_bytes.push(0);
        }
        let cmd_size = 24 + name_bytes.len() as u32;
        cmds.extend_from_slice(&LC_LOAD_DYLIB.to_le_bytes());
        cmds.extend_from_slice(&cmd_size.to_le_bytes());
        cmds.extend_from_slice(&24u32.to_le_bytes()); // name offset
        cmds.extend_from_slice(&0u32.to_le_bytes()); // timestamp
        cmds.extend_from_slice(&0u32.to_le_bytes()); // current_version
        cmds.extend_from_slice(&0u32.to_le_bytes()); // compat_version
        cmds.extend_from_slice(&name_bytes);
    }

    let ncmds = 1 + dylibs.len() as u32;
    let size_of_cmds = cmds.len() as u32;

    let mut buf = Vec::new();
    buf.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
    buf.extend_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
    buf.extend_from_slice(&0i32.to_le_bytes());
    buf.extend_from_slice(&file_type.to_le_bytes());
    buf.extend_from_slice(&ncmds.to_le_bytes());
    buf.extend_from_slice(&size_of_cmds.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());

    let data_start = (32 + cmds.len()) as u64;
    let mut offset_cursor = data_start;
    let mut section_data = Vec::new();
    for (i, s) in sections.iter().enumerate() {
        let hdr_off = sections_header_start + i * 80;
        let addr = seg_vmaddr + offset_cursor;
        cmds[hdr_off + 32..hdr_off + 40].copy_from_slice(&addr.to_le_bytes());
        section_data.extend_from_slice(&s.data);
        offset_cursor += s.data.len() as u64;
    }

    buf.extend_from_slice(&cmds);
    buf.extend_from_slice(&section_data);

    std::fs::File::create(path).unwrap().write_all(&buf).unwrap();
}

/// Builds an `__mod_init_func`/`__mod_term_func`-style section: a flat
/// array of absolute function-pointer values.
pub fn pointer_array_section(name: &'static str, pointers: &[u64]) -> Section {
    let mut data = Vec::with_capacity(pointers.len() * 8);
    for p in pointers {
        data.extend_from_slice(&p.to_le_bytes());
    }
    Section { name, data }
}

/// Builds an `__interpose` section: a flat array of
/// `(replacement, replacee)` pairs.
pub fn interpose_section(pairs: &[(u64, u64)]) -> Section {
    let mut data = Vec::with_capacity(pairs.len() * 16);
    for &(replacement, replacee) in pairs {
        data.extend_from_slice(&replacement.to_le_bytes());
        data.extend_from_slice(&replacee.to_le_bytes());
    }
    Section { name: "__interpose", data }
}
