//! §4.4.6 Interposing.

use std::collections::HashMap;

/// One `(replacement, replacee)` pair declared in an image's interpose
/// section.
#[derive(Debug, Clone, Copy)]
pub struct InterposeTuple {
    pub replacement: u64,
    pub replacee: u64,
}

/// Composes every interpose tuple declared by the inserted images into a
/// single replacee -> final-replacement map, so that chains (B interposes
/// A, C interposes B) collapse to a single rewrite (§4.4.6 "Chains of
/// interposers compose").
pub fn build_table(tuples: &[InterposeTuple]) -> HashMap<u64, u64> {
    let mut direct: HashMap<u64, u64> = HashMap::new();
    for t in tuples {
        direct.insert(t.replacee, t.replacement);
    }

    let mut resolved = HashMap::with_capacity(direct.len());
    for &replacee in direct.keys() {
        let mut target = replacee;
        let mut seen = std::collections::HashSet::new();
        while let Some(&next) = direct.get(&target) {
            if !seen.insert(target) {
                break; // interpose cycle; stop rather than loop forever
            }
            target = next;
        }
        resolved.insert(replacee, target);
    }
    resolved
}

/// Rewrites `address` if it names a replacee in `table`, unless
/// `importer` is the image that declared the interpose (no self-redirect,
/// §4.4.6).
pub fn apply(table: &HashMap<u64, u64>, address: u64, importer_declares_interpose: bool) -> u64 {
    if importer_declares_interpose {
        return address;
    }
    table.get(&address).copied().unwrap_or(address)
}
