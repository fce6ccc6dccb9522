//! §4.4.5 Weak coalescing.

use crate::image::{ExportedSymbol, ImageId};

/// One candidate definition seen while merge-walking the participating
/// images' sorted export tables.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    image: ImageId,
    address: u64,
    is_weak: bool,
}

/// Result of coalescing one symbol name: the chosen canonical address
/// and every image that must have its uses of that name rewritten to it
/// (every participant, including the one that defined it — a self-use
/// is a no-op rewrite).
#[derive(Debug, Clone)]
pub struct Coalesced {
    pub symbol: String,
    pub canonical_address: u64,
    pub canonical_image: ImageId,
}

/// Merge-walks the sorted per-image export tables of every image that
/// participates in coalescing (`PARTICIPATES_IN_COALESCING`), choosing
/// one canonical definition per symbol name: first strong definition
/// wins, else the first weak one (§4.4.5).
///
/// `tables` is `(image id, sorted exports)` for each participating
/// image, in load order — load order breaks ties among same-strength
/// definitions.
pub fn coalesce(tables: &[(ImageId, &[ExportedSymbol])]) -> Vec<Coalesced> {
    let mut cursors = vec![0usize; tables.len()];
    let mut out = Vec::new();

    loop {
        let mut lowest_name: Option<&str> = None;
        for (i, (_, exports)) in tables.iter().enumerate() {
            if let Some(sym) = exports.get(cursors[i]) {
                if lowest_name.is_none_or(|n| sym.name.as_str() < n) {
                    lowest_name = Some(sym.name.as_str());
                }
            }
        }
        let Some(name) = lowest_name else { break };
        let name = name.to_string();

        let mut candidates = Vec::new();
        for (i, (image, exports)) in tables.iter().enumerate() {
            if let Some(sym) = exports.get(cursors[i]) {
                if sym.name == name {
                    candidates.push(Candidate {
                        image: *image,
                        address: sym.address,
                        is_weak: sym.is_weak,
                    });
                    cursors[i] += 1;
                }
            }
        }

        let chosen = candidates
            .iter()
            .find(|c| !c.is_weak)
            .or_else(|| candidates.first())
            .copied();

        if let Some(chosen) = chosen {
            out.push(Coalesced {
                symbol: name,
                canonical_address: chosen.address,
                canonical_image: chosen.image,
            });
        }
    }

    out
}
