//! §4.4.4 Symbol resolution policy.

use crate::context::DependencyKind;
use crate::error::SymbolError;
use crate::image::graph::ImageGraph;
use crate::image::ImageId;

/// One resolved symbol: the address and which image actually defined it
/// (needed by weak coalescing and interposing to compare "did this bind
/// land on the replacee").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub address: u64,
    pub defining_image: ImageId,
}

/// Two-level lookup: consult only `library` and its re-exports,
/// transitively, never following an upward edge (§4.4.4).
pub fn two_level_lookup(graph: &ImageGraph, library: ImageId, symbol: &str) -> Option<Resolution> {
    let mut visited = Vec::new();
    search_reexports(graph, library, symbol, &mut visited)
}

fn search_reexports(
    graph: &ImageGraph,
    image: ImageId,
    symbol: &str,
    visited: &mut Vec<ImageId>,
) -> Option<Resolution> {
    if visited.contains(&image) {
        return None;
    }
    visited.push(image);

    if let Some(found) = graph.with(image, |img| {
        img.symbols.lookup(symbol).map(|s| Resolution {
            address: s.address,
            defining_image: image,
        })
    })? {
        return Some(found);
    }

    let reexports: Vec<ImageId> = graph
        .with(image, |img| {
            img.dependencies
                .read()
                .iter()
                .filter(|d| d.kind == DependencyKind::Reexport)
                .filter_map(|d| d.resolved)
                .collect()
        })
        .unwrap_or_default();

    for dep in reexports {
        if let Some(found) = search_reexports(graph, dep, symbol, visited) {
            return Some(found);
        }
    }
    None
}

/// Flat lookup: walk every loaded image in load order, inserted
/// libraries first, applying the four precedence rules of §4.4.4.
/// `inserted` lists the `DYLD_INSERT_LIBRARIES` image ids, in the order
/// they were forced, and must be consulted ahead of load order.
pub fn flat_lookup(graph: &ImageGraph, inserted: &[ImageId], symbol: &str) -> Option<Resolution> {
    let mut order: Vec<ImageId> = inserted.to_vec();
    for id in graph.all_ids() {
        if !order.contains(&id) {
            order.push(id);
        }
    }

    let mut best_weak: Option<Resolution> = None;
    for id in order {
        if let Some(found) = flat_search_one(graph, id, symbol, &mut Vec::new()) {
            if found.is_weak {
                if best_weak.is_none() {
                    best_weak = Some(found.resolution);
                }
            } else {
                return Some(found.resolution);
            }
        }
    }
    best_weak
}

struct FlatFound {
    resolution: Resolution,
    is_weak: bool,
}

fn flat_search_one(
    graph: &ImageGraph,
    image: ImageId,
    symbol: &str,
    visited: &mut Vec<ImageId>,
) -> Option<FlatFound> {
    if visited.contains(&image) {
        return None;
    }
    visited.push(image);

    if let Some(found) = graph.with(image, |img| {
        img.symbols.lookup(symbol).map(|s| FlatFound {
            resolution: Resolution {
                address: s.address,
                defining_image: image,
            },
            is_weak: s.is_weak,
        })
    })? {
        return Some(found);
    }

    let reexports: Vec<ImageId> = graph
        .with(image, |img| {
            img.dependencies
                .read()
                .iter()
                .filter(|d| d.kind == DependencyKind::Reexport)
                .filter_map(|d| d.resolved)
                .collect()
        })
        .unwrap_or_default();

    for dep in reexports {
        if let Some(found) = flat_search_one(graph, dep, symbol, visited) {
            return Some(found);
        }
    }
    None
}

/// Resolves a classic-bind or chained-bind library ordinal plus symbol
/// name against the graph, honoring two-level vs flat per the image's
/// `TWO_LEVEL_NAMESPACE`/`FORCE_FLAT` flags.
pub fn resolve_import(
    graph: &ImageGraph,
    importer: ImageId,
    dependents: &[ImageId],
    ordinal: crate::context::LibraryOrdinal,
    symbol: &str,
    inserted: &[ImageId],
) -> Result<Option<Resolution>, SymbolError> {
    use crate::context::LibraryOrdinal::*;
    let force_flat = graph
        .with(importer, |img| img.flags.contains(crate::image::ImageFlags::FORCE_FLAT))
        .unwrap_or(false);
    let two_level = !force_flat
        && graph
            .with(importer, |img| img.flags.contains(crate::image::ImageFlags::TWO_LEVEL_NAMESPACE))
            .unwrap_or(true);

    if !two_level {
        return Ok(flat_lookup(graph, inserted, symbol));
    }

    let library = match ordinal {
        SelfImage => importer,
        MainExecutable => graph.all_ids().first().copied().unwrap_or(importer),
        FlatLookup | WeakLookup => return Ok(flat_lookup(graph, inserted, symbol)),
        Dependent(n) => *dependents
            .get(n as usize)
            .ok_or(SymbolError::BadLibraryOrdinal(n as i32 + 1))?,
    };
    Ok(two_level_lookup(graph, library, symbol))
}
