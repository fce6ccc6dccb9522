//! §4.2 File Opener and Slice Selector.

use crate::error::{CompatibilityError, FormatError, LoaderError};
use crate::macho::{FatArch, FatHeader, MachHeader64, MH_BUNDLE, MH_DYLIB, MH_EXECUTE};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// CPU subtype preference order for a given CPU type, most specific
/// first, with a final "any" fallback (§4.2 "preferring CPU-subtype
/// preferences in a fixed per-architecture order, with an 'any'
/// fallback"). ARM64 is modeled here; other architectures would add
/// their own table entry.
const CPU_TYPE_ARM64: i32 = 0x0100_000c;
const CPU_TYPE_X86_64: i32 = 0x0100_0007;
const CPU_SUBTYPE_MASK: i32 = 0x00ff_ffff;
const CPU_SUBTYPE_ANY: i32 = -1 & CPU_SUBTYPE_MASK;

fn subtype_preference(cpu_type: i32) -> &'static [i32] {
    match cpu_type {
        CPU_TYPE_ARM64 => &[2 /* ARM64E */, 0 /* ARM64_ALL */, CPU_SUBTYPE_ANY],
        CPU_TYPE_X86_64 => &[3 /* X86_64_H */, 0 /* X86_64_ALL */, CPU_SUBTYPE_ANY],
        _ => &[CPU_SUBTYPE_ANY],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredFileKind {
    Executable,
    DylibOrBundle,
}

/// Result of opening and slice-selecting a file: the byte offset within
/// the file at which the chosen Mach-O slice's header begins, and the
/// parsed header itself.
pub struct OpenedSlice {
    pub slice_offset: u64,
    pub header: MachHeader64,
}

/// Reads the first 4 KiB, detects a fat wrapper, validates its table,
/// and selects the slice matching `required_cpu_type`; otherwise treats
/// the file as a thin Mach-O at offset 0.
pub fn open_and_select_slice(
    path: &Path,
    required_cpu_type: i32,
    required_cpu_subtype: i32,
    kind: RequiredFileKind,
) -> Result<(File, OpenedSlice), LoaderError> {
    let mut file = File::open(path)?;
    let mut first_page = [0u8; 4096];
    let n = read_up_to(&mut file, &mut first_page)?;
    let first_page = &first_page[..n];

    let magic = if first_page.len() >= 4 {
        u32::from_be_bytes([first_page[0], first_page[1], first_page[2], first_page[3]])
    } else {
        return Err(FormatError::Truncated.into());
    };

    let slice_offset = if magic == crate::macho::FAT_MAGIC {
        let fat = FatHeader::parse(first_page)?;
        select_arch(&fat.arches, required_cpu_type, required_cpu_subtype)? as u64
    } else {
        0
    };

    let header = if slice_offset == 0 {
        MachHeader64::parse(first_page)?
    } else {
        let mut slice_header = [0u8; MachHeader64::SIZE];
        read_exact_at(&mut file, slice_offset, &mut slice_header)?;
        MachHeader64::parse(&slice_header)?
    };

    validate_filetype(header.file_type, kind)?;

    Ok((file, OpenedSlice { slice_offset, header }))
}

fn validate_filetype(file_type: u32, kind: RequiredFileKind) -> Result<(), CompatibilityError> {
    let ok = match kind {
        RequiredFileKind::Executable => file_type == MH_EXECUTE,
        RequiredFileKind::DylibOrBundle => file_type == MH_DYLIB || file_type == MH_BUNDLE,
    };
    if ok {
        Ok(())
    } else {
        Err(CompatibilityError::BadFiletype(file_type))
    }
}

/// §4.2 "selects the slice whose architecture matches the main
/// executable, preferring CPU-subtype preferences in a fixed
/// per-architecture order, with an 'any' fallback".
fn select_arch(arches: &[FatArch], cpu_type: i32, cpu_subtype: i32) -> Result<u32, CompatibilityError> {
    let candidates: Vec<&FatArch> = arches.iter().filter(|a| a.cpu_type == cpu_type).collect();
    if candidates.is_empty() {
        return Err(CompatibilityError::NoMatchingSlice);
    }
    let wanted_subtype = cpu_subtype & CPU_SUBTYPE_MASK;
    if let Some(exact) = candidates
        .iter()
        .find(|a| (a.cpu_subtype & CPU_SUBTYPE_MASK) == wanted_subtype)
    {
        return Ok(exact.offset);
    }
    for &pref in subtype_preference(cpu_type) {
        if let Some(found) = candidates
            .iter()
            .find(|a| (a.cpu_subtype & CPU_SUBTYPE_MASK) == pref)
        {
            return Ok(found.offset);
        }
    }
    Err(CompatibilityError::NoMatchingSlice)
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let mut total = 0;
    loop {
        match file.read(&mut buf[total..]) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if total == buf.len() {
            return Ok(total);
        }
    }
}

fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<(), FormatError> {
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;
    Ok(())
}
