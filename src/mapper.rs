//! §4.3 Segment Mapper.

use crate::error::MapError;
use crate::image::graph::ImageGraph;
use crate::image::{Image, ImageId, Permission, Segment};
use crate::platform::PlatformOps;
use std::fs::File;

/// §4.3 step 1: walk the segment table, rejecting the malformed shapes
/// it names. Returns `(lowest vm_addr, total span)` over non-zero-size
/// segments.
pub fn validate_and_span(segments: &[Segment]) -> Result<(u64, u64), MapError> {
    if segments.is_empty() {
        return Ok((0, 0));
    }
    let mut sorted: Vec<&Segment> = segments.iter().collect();
    sorted.sort_by_key(|s| s.vm_addr);

    for (i, seg) in sorted.iter().enumerate() {
        if seg.file_size > seg.vm_size {
            return Err(MapError::Format(crate::error::FormatError::FileSizeExceedsVmSize {
                name: seg.name_str().into_owned(),
                filesize: seg.file_size,
                vmsize: seg.vm_size,
            }));
        }
        if i > 0 && seg.file_offset == 0 && seg.file_size == 0 {
            return Err(MapError::Format(crate::error::FormatError::BadZeroFillPlacement {
                name: seg.name_str().into_owned(),
            }));
        }
        if i > 0 {
            let prev = sorted[i - 1];
            let prev_end = prev.vm_addr.saturating_add(prev.vm_size);
            if seg.vm_addr < prev_end {
                return Err(MapError::Format(crate::error::FormatError::OverlappingSegments {
                    name: seg.name_str().into_owned(),
                }));
            }
        }
    }

    let lowest = sorted[0].vm_addr;
    let highest = sorted
        .iter()
        .map(|s| s.vm_addr.saturating_add(s.vm_size))
        .max()
        .unwrap_or(lowest);
    Ok((lowest, highest - lowest))
}

/// §4.3 step 2-5: reserve address space, map every segment, register the
/// code signature, and index the mapped ranges. `code_signature` is
/// `(file_offset, size)` of the `CODE_SIGNATURE` linkedit blob, if any.
pub fn map_image(
    platform: &dyn PlatformOps,
    graph: &ImageGraph,
    id: ImageId,
    file: &File,
    slide: i64,
    code_signature: Option<(u64, u64)>,
) -> Result<(), MapError> {
    let (lowest, span) = graph
        .with(id, |img| validate_and_span(&img.segments))
        .ok_or(MapError::AddressRangeOccupied)??;

    let preferred = (lowest as i64).checked_add(slide).map(|v| v as u64);
    let base = platform.reserve(preferred, span as usize, slide == 0)?;

    // §4.3 step 4: code signature must be registered before any
    // executable page can be touched by the mappings below.
    if let Some((offset, size)) = code_signature {
        platform.register_code_signature(file, offset, size)?;
    }

    let segments: Vec<Segment> = graph.with(id, |img| img.segments.clone()).unwrap_or_default();
    for seg in &segments {
        let seg_base = base.wrapping_add(seg.vm_addr - lowest);
        let prot = if seg.name_str().as_ref() == "__LINKEDIT" {
            Permission::ReadOnly
        } else {
            seg.init_prot
        };

        if seg.file_size > 0 {
            platform
                .map_file(seg_base, seg.file_size as usize, file, seg.file_offset, prot)
                .map_err(|e| name_error(e, &seg.name_str()))?;
        }
        if seg.vm_size > seg.file_size {
            let zf_start = seg_base.wrapping_add(seg.file_size);
            let zf_len = (seg.vm_size - seg.file_size) as usize;
            platform
                .map_zero_fill(zf_start, zf_len, prot)
                .map_err(|e| name_error(e, &seg.name_str()))?;
        }

        graph.insert_range(seg_base, seg_base.wrapping_add(seg.vm_size), id);
    }

    graph.with_mut(id, |img| {
        img.load_address = base;
        img.slide = (base as i64) - (lowest as i64);
    });

    Ok(())
}

fn name_error(e: MapError, name: &str) -> MapError {
    match e {
        MapError::MmapFailed { source, .. } => MapError::MmapFailed {
            name: name.to_string(),
            source,
        },
        MapError::SandboxDeniedMmap(_) => MapError::SandboxDeniedMmap(name.to_string()),
        other => other,
    }
}

/// Unmaps every segment of an image, e.g. during GC of a non-`leaveMapped`
/// image (§4.5 step 4) or unwinding a partial load (§7 Propagation).
pub fn unmap_image(platform: &dyn PlatformOps, graph: &ImageGraph, id: ImageId) {
    let segments: Vec<Segment> = graph.with(id, |img| img.segments.clone()).unwrap_or_default();
    let load_address = graph.with(id, |img| img.load_address).unwrap_or(0);
    let lowest = segments.iter().map(|s| s.vm_addr).min().unwrap_or(0);
    for seg in &segments {
        let seg_base = load_address.wrapping_add(seg.vm_addr - lowest);
        platform.unmap(seg_base, seg.vm_size as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageFlags, Permission};
    use crate::platform::FakePlatform;
    use std::path::PathBuf;

    fn seg(name: &str, vm_addr: u64, vm_size: u64, file_size: u64, prot: Permission) -> Segment {
        let mut name_bytes = [0u8; 16];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        Segment {
            name: name_bytes,
            vm_addr,
            vm_size,
            file_offset: 0,
            file_size,
            init_prot: prot,
            max_prot: prot,
            p2align: 12,
        }
    }

    #[test]
    fn span_covers_all_segments() {
        let segs = vec![
            seg("__TEXT", 0x1000, 0x1000, 0x1000, Permission::ReadExecute),
            seg("__DATA", 0x2000, 0x1000, 0x800, Permission::ReadWrite),
        ];
        let (lowest, span) = validate_and_span(&segs).unwrap();
        assert_eq!(lowest, 0x1000);
        assert_eq!(span, 0x2000);
    }

    #[test]
    fn overlapping_segments_rejected() {
        let segs = vec![
            seg("__TEXT", 0x1000, 0x2000, 0x2000, Permission::ReadExecute),
            seg("__DATA", 0x2000, 0x1000, 0x1000, Permission::ReadWrite),
        ];
        assert!(matches!(
            validate_and_span(&segs),
            Err(MapError::Format(crate::error::FormatError::OverlappingSegments { .. }))
        ));
    }

    #[test]
    fn filesize_exceeding_vmsize_rejected() {
        let segs = vec![seg("__TEXT", 0x1000, 0x1000, 0x2000, Permission::ReadExecute)];
        assert!(matches!(
            validate_and_span(&segs),
            Err(MapError::Format(crate::error::FormatError::FileSizeExceedsVmSize { .. }))
        ));
    }

    #[test]
    fn map_image_indexes_every_segment() {
        let graph = ImageGraph::new();
        let id = graph.insert(|id| {
            let mut img = Image::new(id, PathBuf::from("/bin/a"), 0, 0, ImageFlags::IS_MAIN_EXECUTABLE);
            img.segments = vec![
                seg("__TEXT", 0x1000, 0x1000, 0x1000, Permission::ReadExecute),
                seg("__LINKEDIT", 0x2000, 0x1000, 0x1000, Permission::ReadWrite),
            ];
            img
        });
        let platform = FakePlatform::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.out");
        std::fs::write(&path, [0u8; 0x2000]).unwrap();
        let file = File::open(&path).unwrap();

        map_image(&platform, &graph, id, &file, 0, None).unwrap();

        assert_eq!(graph.lookup_address(0x1500), Some(id));
        assert_eq!(graph.lookup_address(0x2500), Some(id));
    }
}
