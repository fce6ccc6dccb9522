//! The narrow view of a Mach-O file this crate is allowed to consume.
//!
//! Per §1, a full Mach-O semantic parser is an out-of-scope collaborator;
//! this module implements only the header/load-command shape §6
//! describes, using `scroll::Pread` to decode fields directly from an
//! mmap'd file buffer instead of hand-rolling endian-aware struct reads.

use crate::error::FormatError;
use scroll::{Pread, LE};

pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;

// usr/include/mach-o/loader.h filetype values
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_BUNDLE: u32 = 0x8;

// usr/include/mach-o/loader.h load command constants
pub const LC_REQ_DYLD: u32 = 0x8000_0000;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_UUID: u32 = 0x1b;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

/// usr/include/mach-o/loader.h `mach_header_64`.
#[derive(Debug, Clone, Copy)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cpu_type: i32,
    pub cpu_subtype: i32,
    pub file_type: u32,
    pub ncmds: u32,
    pub size_of_cmds: u32,
    pub flags: u32,
}

impl MachHeader64 {
    pub const SIZE: usize = 32;

    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < Self::SIZE {
            return Err(FormatError::Truncated);
        }
        let magic: u32 = buf.pread_with(0, LE)?;
        if magic != MH_MAGIC_64 {
            return Err(FormatError::BadMagic(magic));
        }
        Ok(Self {
            magic,
            cpu_type: buf.pread_with(4, LE)?,
            cpu_subtype: buf.pread_with(8, LE)?,
            file_type: buf.pread_with(12, LE)?,
            ncmds: buf.pread_with(16, LE)?,
            size_of_cmds: buf.pread_with(20, LE)?,
            flags: buf.pread_with(24, LE)?,
            // reserved field at offset 28 intentionally unread
        })
    }
}

/// Big-endian `fat_header` + array of `fat_arch` entries (§6 "Universal
/// (fat) wrapper").
#[derive(Debug, Clone, Copy)]
pub struct FatArch {
    pub cpu_type: i32,
    pub cpu_subtype: i32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

pub struct FatHeader {
    pub arches: Vec<FatArch>,
}

impl FatHeader {
    /// Validates the table as §4.2 requires: no overlapping slices, and
    /// the whole table fits within the first page (4 KiB) of the file,
    /// since that's all the file opener reads before re-reading at the
    /// chosen slice's offset.
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        const BE: scroll::Endian = scroll::BE;
        if buf.len() < 8 {
            return Err(FormatError::Truncated);
        }
        let magic: u32 = buf.pread_with(0, BE)?;
        if magic != FAT_MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let nfat_arch: u32 = buf.pread_with(4, BE)?;
        const ENTRY_SIZE: usize = 20;
        let table_end = 8 + nfat_arch as usize * ENTRY_SIZE;
        if table_end > buf.len() || table_end > 4096 {
            return Err(FormatError::FatTableOverflow { count: nfat_arch });
        }
        let mut arches = Vec::with_capacity(nfat_arch as usize);
        for i in 0..nfat_arch as usize {
            let base = 8 + i * ENTRY_SIZE;
            arches.push(FatArch {
                cpu_type: buf.pread_with(base, BE)?,
                cpu_subtype: buf.pread_with(base + 4, BE)?,
                offset: buf.pread_with(base + 8, BE)?,
                size: buf.pread_with(base + 12, BE)?,
                align: buf.pread_with(base + 16, BE)?,
            });
        }
        for i in 0..arches.len() {
            for j in (i + 1)..arches.len() {
                let (a, b) = (&arches[i], &arches[j]);
                let a_end = a.offset as u64 + a.size as u64;
                let b_end = b.offset as u64 + b.size as u64;
                if (a.offset as u64) < b_end && (b.offset as u64) < a_end {
                    return Err(FormatError::OverlappingSlices { a: i, b: j });
                }
            }
        }
        Ok(Self { arches })
    }
}

/// usr/include/mach-o/loader.h `load_command`.
#[derive(Debug, Clone, Copy)]
pub struct LoadCommandHeader {
    pub cmd: u32,
    pub cmd_size: u32,
}

/// Bounds-checked walk over the load-command region immediately
/// following a `mach_header_64`, mirroring `LoadCommandsIter`'s
/// defensiveness against a lying header.
pub struct LoadCommands<'a> {
    buf: &'a [u8],
    remaining: u32,
    offset: usize,
}

impl<'a> LoadCommands<'a> {
    pub fn new(buf: &'a [u8], ncmds: u32) -> Self {
        Self {
            buf,
            remaining: ncmds,
            offset: 0,
        }
    }
}

impl<'a> Iterator for LoadCommands<'a> {
    type Item = Result<(LoadCommandHeader, &'a [u8]), FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.offset + 8 > self.buf.len() {
            return None;
        }
        let cmd: u32 = match self.buf.pread_with(self.offset, LE) {
            Ok(v) => v,
            Err(e) => return Some(Err(e.into())),
        };
        let cmd_size: u32 = match self.buf.pread_with(self.offset + 4, LE) {
            Ok(v) => v,
            Err(e) => return Some(Err(e.into())),
        };
        if cmd_size < 8 || self.offset + cmd_size as usize > self.buf.len() {
            self.remaining = 0;
            return Some(Err(FormatError::LoadCommandOverrun {
                index: (self.remaining) as usize,
                size: cmd_size,
            }));
        }
        let body = &self.buf[self.offset..self.offset + cmd_size as usize];
        self.offset += cmd_size as usize;
        self.remaining -= 1;
        Some(Ok((LoadCommandHeader { cmd, cmd_size }, body)))
    }
}

/// usr/include/mach-o/loader.h `segment_command_64`, body starts after
/// the 8-byte `load_command` prefix.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCommand64 {
    pub seg_name: [u8; 16],
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_off: u64,
    pub file_size: u64,
    pub max_prot: i32,
    pub init_prot: i32,
    pub nsects: u32,
    pub flags: u32,
}

impl SegmentCommand64 {
    pub fn parse(body: &[u8]) -> Result<Self, FormatError> {
        let mut seg_name = [0u8; 16];
        seg_name.copy_from_slice(body.get(8..24).ok_or(FormatError::Truncated)?);
        Ok(Self {
            seg_name,
            vm_addr: body.pread_with(24, LE)?,
            vm_size: body.pread_with(32, LE)?,
            file_off: body.pread_with(40, LE)?,
            file_size: body.pread_with(48, LE)?,
            max_prot: body.pread_with(56, LE)?,
            init_prot: body.pread_with(60, LE)?,
            nsects: body.pread_with(64, LE)?,
            flags: body.pread_with(68, LE)?,
        })
    }

    pub fn name_str(&self) -> std::borrow::Cow<'_, str> {
        let end = self.seg_name.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.seg_name[..end])
    }
}

/// usr/include/mach-o/loader.h `section_64`, one entry of a segment's
/// section table (immediately following the 72-byte segment_command_64
/// body). Only the fields the initializer/terminator scan needs.
#[derive(Debug, Clone, Copy)]
pub struct Section64 {
    pub sect_name: [u8; 16],
    pub seg_name: [u8; 16],
    pub addr: u64,
    pub size: u64,
}

impl Section64 {
    const SIZE: usize = 80;

    pub fn sect_name_str(&self) -> std::borrow::Cow<'_, str> {
        let end = self.sect_name.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.sect_name[..end])
    }
}

/// Parses the `nsects` section headers following a segment_command_64's
/// 72-byte fixed body within `body` (§6, used to locate
/// `__mod_init_func`/`__mod_term_func` for §4.6).
pub fn parse_sections(body: &[u8], nsects: u32) -> Result<Vec<Section64>, FormatError> {
    const SEG_HEADER_SIZE: usize = 72;
    let mut out = Vec::with_capacity(nsects as usize);
    for i in 0..nsects as usize {
        let base = SEG_HEADER_SIZE + i * Section64::SIZE;
        let mut sect_name = [0u8; 16];
        sect_name.copy_from_slice(body.get(base..base + 16).ok_or(FormatError::Truncated)?);
        let mut seg_name = [0u8; 16];
        seg_name.copy_from_slice(body.get(base + 16..base + 32).ok_or(FormatError::Truncated)?);
        out.push(Section64 {
            sect_name,
            seg_name,
            addr: body.pread_with(base + 32, LE)?,
            size: body.pread_with(base + 40, LE)?,
        });
    }
    Ok(out)
}

/// `dylib_command` (LOAD_DYLIB / LOAD_WEAK_DYLIB / REEXPORT_DYLIB /
/// LOAD_UPWARD_DYLIB / ID_DYLIB).
#[derive(Debug, Clone)]
pub struct DylibCommand {
    pub name: String,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

impl DylibCommand {
    pub fn parse(body: &[u8]) -> Result<Self, FormatError> {
        let name_offset: u32 = body.pread_with(8, LE)?;
        let timestamp: u32 = body.pread_with(12, LE)?;
        let current_version: u32 = body.pread_with(16, LE)?;
        let compatibility_version: u32 = body.pread_with(20, LE)?;
        let name_bytes = body.get(name_offset as usize..).ok_or(FormatError::Truncated)?;
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
        Ok(Self {
            name,
            timestamp,
            current_version,
            compatibility_version,
        })
    }
}

/// `rpath_command`.
pub fn parse_rpath(body: &[u8]) -> Result<String, FormatError> {
    let path_offset: u32 = body.pread_with(8, LE)?;
    let bytes = body.get(path_offset as usize..).ok_or(FormatError::Truncated)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// `uuid_command`.
pub fn parse_uuid(body: &[u8]) -> Result<[u8; 16], FormatError> {
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(body.get(8..24).ok_or(FormatError::Truncated)?);
    Ok(uuid)
}

/// `dyld_info_command` (DYLD_INFO / DYLD_INFO_ONLY).
#[derive(Debug, Clone, Copy, Default)]
pub struct DyldInfoCommand {
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

impl DyldInfoCommand {
    pub fn parse(body: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            rebase_off: body.pread_with(8, LE)?,
            rebase_size: body.pread_with(12, LE)?,
            bind_off: body.pread_with(16, LE)?,
            bind_size: body.pread_with(20, LE)?,
            weak_bind_off: body.pread_with(24, LE)?,
            weak_bind_size: body.pread_with(28, LE)?,
            lazy_bind_off: body.pread_with(32, LE)?,
            lazy_bind_size: body.pread_with(36, LE)?,
            export_off: body.pread_with(40, LE)?,
            export_size: body.pread_with(44, LE)?,
        })
    }
}

/// `linkedit_data_command` (CODE_SIGNATURE / DYLD_CHAINED_FIXUPS /
/// DYLD_EXPORTS_TRIE all share this shape).
#[derive(Debug, Clone, Copy)]
pub struct LinkeditDataCommand {
    pub data_off: u32,
    pub data_size: u32,
}

impl LinkeditDataCommand {
    pub fn parse(body: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            data_off: body.pread_with(8, LE)?,
            data_size: body.pread_with(12, LE)?,
        })
    }
}

/// `dyld_chained_fixups_header`, at the start of the blob named by the
/// `DYLD_CHAINED_FIXUPS` linkedit-data command (§4.4.2).
#[derive(Debug, Clone, Copy)]
pub struct ChainedFixupsHeader {
    pub fixups_version: u32,
    pub starts_offset: u32,
    pub imports_offset: u32,
    pub symbols_offset: u32,
    pub imports_count: u32,
    pub imports_format: u32,
    pub symbols_format: u32,
}

impl ChainedFixupsHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            fixups_version: buf.pread_with(0, LE)?,
            starts_offset: buf.pread_with(4, LE)?,
            imports_offset: buf.pread_with(8, LE)?,
            symbols_offset: buf.pread_with(12, LE)?,
            imports_count: buf.pread_with(16, LE)?,
            imports_format: buf.pread_with(20, LE)?,
            symbols_format: buf.pread_with(24, LE)?,
        })
    }
}

/// `DYLD_CHAINED_PTR_*` pointer-format codes this crate understands
/// (§4.4.2); anything else is surfaced as [`FormatError::Scroll`]-free
/// "unsupported" by the caller rather than misdecoded.
pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;
pub const DYLD_CHAINED_PTR_64: u16 = 2;
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;

/// Sentinel `page_start` value meaning "no chain starts on this page".
pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xFFFF;

/// One decoded `dyld_chained_starts_in_segment` record: a segment's page
/// size plus, per page, the byte offset of that page's first chain link
/// (or [`DYLD_CHAINED_PTR_START_NONE`]).
#[derive(Debug, Clone)]
pub struct ChainedStartsInSegment {
    pub page_size: u16,
    pub pointer_format: u16,
    pub segment_offset: u64,
    pub page_starts: Vec<u16>,
}

/// Parses `dyld_chained_starts_in_image` (an array of per-segment
/// offsets into this same blob, 0 meaning "no chains in this segment")
/// followed by each referenced `dyld_chained_starts_in_segment`. Indexed
/// the same way as the image's own segment vector.
pub fn parse_chained_starts(buf: &[u8]) -> Result<Vec<Option<ChainedStartsInSegment>>, FormatError> {
    let seg_count: u32 = buf.pread_with(0, LE)?;
    let mut out = Vec::with_capacity(seg_count as usize);
    for i in 0..seg_count as usize {
        let seg_info_offset: u32 = buf.pread_with(4 + i * 4, LE)?;
        if seg_info_offset == 0 {
            out.push(None);
            continue;
        }
        let base = seg_info_offset as usize;
        let page_size: u16 = buf.pread_with(base + 4, LE)?;
        let pointer_format: u16 = buf.pread_with(base + 6, LE)?;
        let segment_offset: u64 = buf.pread_with(base + 8, LE)?;
        let page_count: u16 = buf.pread_with(base + 20, LE)?;
        let mut page_starts = Vec::with_capacity(page_count as usize);
        for p in 0..page_count as usize {
            page_starts.push(buf.pread_with(base + 22 + p * 2, LE)?);
        }
        out.push(Some(ChainedStartsInSegment {
            page_size,
            pointer_format,
            segment_offset,
            page_starts,
        }));
    }
    Ok(out)
}

/// One decoded `dyld_chained_import` entry (format 1, the uncompressed
/// layout; formats 2/3 add an addend table this crate does not decode —
/// callers should treat an unrecognized `imports_format` as "no imports"
/// rather than misparsing the bitfield).
#[derive(Debug, Clone)]
pub struct RawChainedImport {
    pub lib_ordinal: i32,
    pub weak_import: bool,
    pub name: String,
}

/// `imports_format == 1` (`DYLD_CHAINED_IMPORT`): `lib_ordinal:8,
/// weak_import:1, name_offset:23` packed into one little-endian `u32`.
pub fn parse_chained_imports(
    buf: &[u8],
    imports_offset: u32,
    imports_count: u32,
    symbols_offset: u32,
) -> Result<Vec<RawChainedImport>, FormatError> {
    let mut out = Vec::with_capacity(imports_count as usize);
    for i in 0..imports_count as usize {
        let raw: u32 = buf.pread_with(imports_offset as usize + i * 4, LE)?;
        let lib_ordinal = (raw & 0xFF) as i32;
        let weak_import = (raw >> 8) & 1 != 0;
        let name_offset = raw >> 9;
        let str_base = symbols_offset as usize + name_offset as usize;
        let bytes = buf.get(str_base..).ok_or(FormatError::Truncated)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        out.push(RawChainedImport {
            lib_ordinal,
            weak_import,
            name: String::from_utf8_lossy(&bytes[..end]).into_owned(),
        });
    }
    Ok(out)
}

/// `entry_point_command` (MAIN).
#[derive(Debug, Clone, Copy)]
pub struct EntryPointCommand {
    pub entry_off: u64,
    pub stack_size: u64,
}

impl EntryPointCommand {
    pub fn parse(body: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            entry_off: body.pread_with(8, LE)?,
            stack_size: body.pread_with(16, LE)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_bytes(vals: &[(usize, u32)], len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        for &(off, v) in vals {
            buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    #[test]
    fn header_rejects_bad_magic() {
        let buf = le_bytes(&[(0, 0xdead_beef)], 32);
        assert!(matches!(MachHeader64::parse(&buf), Err(FormatError::BadMagic(_))));
    }

    #[test]
    fn header_parses_valid_fields() {
        let buf = le_bytes(
            &[
                (0, MH_MAGIC_64),
                (4, 0x0100_000c),
                (12, MH_EXECUTE),
                (16, 3),
                (20, 200),
            ],
            32,
        );
        let h = MachHeader64::parse(&buf).unwrap();
        assert_eq!(h.file_type, MH_EXECUTE);
        assert_eq!(h.ncmds, 3);
        assert_eq!(h.size_of_cmds, 200);
    }

    #[test]
    fn load_commands_stop_on_overrun() {
        let mut buf = vec![0u8; 16];
        buf[0..4].copy_from_slice(&LC_UUID.to_le_bytes());
        buf[4..8].copy_from_slice(&100u32.to_le_bytes()); // bogus oversized cmdsize
        let mut it = LoadCommands::new(&buf, 1);
        assert!(matches!(it.next(), Some(Err(FormatError::LoadCommandOverrun { .. }))));
    }

    #[test]
    fn fat_header_rejects_overlapping_slices() {
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&2u32.to_be_bytes());
        // arch 0: offset 0x1000 size 0x2000
        buf[8..12].copy_from_slice(&0x0100_000c_i32.to_be_bytes());
        buf[16..20].copy_from_slice(&0x1000u32.to_be_bytes());
        buf[20..24].copy_from_slice(&0x2000u32.to_be_bytes());
        // arch 1: offset 0x1800 size 0x2000 (overlaps arch 0)
        buf[28..32].copy_from_slice(&0x0100_0007_i32.to_be_bytes());
        buf[36..40].copy_from_slice(&0x1800u32.to_be_bytes());
        buf[40..44].copy_from_slice(&0x2000u32.to_be_bytes());
        assert!(matches!(
            FatHeader::parse(&buf),
            Err(FormatError::OverlappingSlices { .. })
        ));
    }

    #[test]
    fn segment_command_parses_name_and_bounds() {
        let mut body = vec![0u8; 72];
        body[0..4].copy_from_slice(&LC_SEGMENT_64.to_le_bytes());
        body[4..8].copy_from_slice(&72u32.to_le_bytes());
        body[8..14].copy_from_slice(b"__TEXT");
        body[24..32].copy_from_slice(&0x1000u64.to_le_bytes());
        body[32..40].copy_from_slice(&0x4000u64.to_le_bytes());
        let seg = SegmentCommand64::parse(&body).unwrap();
        assert_eq!(seg.name_str(), "__TEXT");
        assert_eq!(seg.vm_addr, 0x1000);
        assert_eq!(seg.vm_size, 0x4000);
    }

    #[test]
    fn chained_starts_skips_segments_with_no_chains() {
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&2u32.to_le_bytes()); // seg_count
        buf[4..8].copy_from_slice(&0u32.to_le_bytes()); // segment 0: no chains
        buf[8..12].copy_from_slice(&12u32.to_le_bytes()); // segment 1: info at offset 12
        let base = 12usize;
        buf[base + 4..base + 6].copy_from_slice(&0x1000u16.to_le_bytes()); // page_size
        buf[base + 6..base + 8].copy_from_slice(&DYLD_CHAINED_PTR_64.to_le_bytes());
        buf[base + 8..base + 16].copy_from_slice(&0x4000u64.to_le_bytes()); // segment_offset
        buf[base + 20..base + 22].copy_from_slice(&1u16.to_le_bytes()); // page_count
        buf[base + 22..base + 24].copy_from_slice(&0x10u16.to_le_bytes()); // page_start[0]
        let starts = parse_chained_starts(&buf).unwrap();
        assert_eq!(starts.len(), 2);
        assert!(starts[0].is_none());
        let seg1 = starts[1].as_ref().unwrap();
        assert_eq!(seg1.page_size, 0x1000);
        assert_eq!(seg1.segment_offset, 0x4000);
        assert_eq!(seg1.page_starts, vec![0x10]);
    }

    #[test]
    fn chained_imports_parses_name_and_ordinal() {
        let mut buf = vec![0u8; 64];
        let imports_offset = 0u32;
        let symbols_offset = 4u32;
        // lib_ordinal=2, weak=0, name_offset=0 -> "_foo" at symbols_offset+0
        let raw: u32 = 2 | (0 << 8) | (0 << 9);
        buf[0..4].copy_from_slice(&raw.to_le_bytes());
        buf[4..8].copy_from_slice(b"_foo");
        let imports = parse_chained_imports(&buf, imports_offset, 1, symbols_offset).unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].lib_ordinal, 2);
        assert!(!imports[0].weak_import);
        assert_eq!(imports[0].name, "_foo");
    }

    #[test]
    fn section_table_parses_name_and_bounds() {
        let mut body = vec![0u8; 72 + 80];
        body[72..72 + 6].copy_from_slice(b"__data");
        body[72 + 32..72 + 40].copy_from_slice(&0x2000u64.to_le_bytes());
        body[72 + 40..72 + 48].copy_from_slice(&0x8u64.to_le_bytes());
        let sections = parse_sections(&body, 1).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].sect_name_str(), "__data");
        assert_eq!(sections[0].addr, 0x2000);
        assert_eq!(sections[0].size, 0x8);
    }
}
