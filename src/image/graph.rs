//! The process-wide [`ImageGraph`] singleton (§3).

use super::{Image, ImageId};
use parking_lot::RwLock;

struct Slot {
    image: Option<Image>,
    generation: u32,
}

/// `[start, end) -> Image` entry in the mapped-ranges index (§3, §4.3
/// step 5). Kept sorted by `start` for O(log n) address lookup.
#[derive(Debug, Clone, Copy)]
struct MappedRange {
    start: u64,
    end: u64,
    image: ImageId,
}

/// An edge created by a flat/dynamic symbol lookup that would otherwise
/// break GC reachability (§3 `dynamicReferences`, §4.5 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicEdge {
    pub from: ImageId,
    pub to: ImageId,
}

/// Process-wide singleton holding every loaded [`Image`] plus the
/// address-to-image index and the dynamic-reference edge set.
///
/// Structural mutation (insert/remove) is always performed under the
/// process-global loader lock described in §5; the `mapped_ranges` table
/// additionally uses its own lock so that address-to-image lookups from
/// unrelated threads (e.g. a backtrace unwinder) don't have to take the
/// loader lock at all.
pub struct ImageGraph {
    slots: RwLock<Vec<Slot>>,
    /// Insertion order: main executable first, inserted libraries second,
    /// then the rest (§3 "Vector of all Images in insertion order").
    order: RwLock<Vec<ImageId>>,
    mapped_ranges: RwLock<Vec<MappedRange>>,
    dynamic_references: RwLock<Vec<DynamicEdge>>,
}

impl Default for ImageGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageGraph {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            order: RwLock::new(Vec::new()),
            mapped_ranges: RwLock::new(Vec::new()),
            dynamic_references: RwLock::new(Vec::new()),
        }
    }

    /// Inserts a newly created image, returning its stable id.
    pub fn insert(&self, make: impl FnOnce(ImageId) -> Image) -> ImageId {
        let mut slots = self.slots.write();
        let index = slots.len() as u32;
        let generation = 1;
        let id = ImageId { index, generation };
        let image = make(id);
        slots.push(Slot {
            image: Some(image),
            generation,
        });
        drop(slots);
        self.order.write().push(id);
        id
    }

    pub fn with<R>(&self, id: ImageId, f: impl FnOnce(&Image) -> R) -> Option<R> {
        let slots = self.slots.read();
        let slot = slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.image.as_ref().map(f)
    }

    pub fn with_mut<R>(&self, id: ImageId, f: impl FnOnce(&mut Image) -> R) -> Option<R> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.image.as_mut().map(f)
    }

    /// Snapshot of every live image id, in load order.
    pub fn all_ids(&self) -> Vec<ImageId> {
        self.order
            .read()
            .iter()
            .copied()
            .filter(|id| self.with(*id, |_| ()).is_some())
            .collect()
    }

    pub fn find_by_path(&self, path: &std::path::Path) -> Option<ImageId> {
        let hash = Image::path_hash_of(path);
        self.order.read().iter().copied().find(|id| {
            self.with(*id, |img| img.path_hash == hash && img.path == path)
                .unwrap_or(false)
        })
    }

    pub fn find_by_install_name(&self, name: &str) -> Option<ImageId> {
        self.order.read().iter().copied().find(|id| {
            self.with(*id, |img| img.install_name.as_deref() == Some(name))
                .unwrap_or(false)
        })
    }

    /// Removes an image once GC has proven it unreachable (§3
    /// "destroyed only after ... terminated AND refcounts zero AND
    /// unreachable"). Bumps the slot generation so any stale [`ImageId`]
    /// still referencing it fails `with`/`with_mut` instead of aliasing
    /// a reused slot.
    pub fn remove(&self, id: ImageId) -> Option<Image> {
        let removed = {
            let mut slots = self.slots.write();
            let slot = slots.get_mut(id.index as usize)?;
            if slot.generation != id.generation {
                return None;
            }
            slot.generation += 1;
            slot.image.take()
        };
        if removed.is_some() {
            self.order.write().retain(|&o| o != id);
            self.remove_ranges_for(id);
            self.dynamic_references
                .write()
                .retain(|e| e.from != id && e.to != id);
        }
        removed
    }

    pub fn insert_range(&self, start: u64, end: u64, image: ImageId) {
        let mut ranges = self.mapped_ranges.write();
        let idx = ranges.partition_point(|r| r.start < start);
        ranges.insert(idx, MappedRange { start, end, image });
    }

    fn remove_ranges_for(&self, image: ImageId) {
        self.mapped_ranges.write().retain(|r| r.image != image);
    }

    /// §8 property 4: the returned image's matching segment must
    /// actually contain `addr`.
    pub fn lookup_address(&self, addr: u64) -> Option<ImageId> {
        let ranges = self.mapped_ranges.read();
        let idx = ranges.partition_point(|r| r.start <= addr);
        if idx == 0 {
            return None;
        }
        let candidate = ranges[idx - 1];
        (candidate.start <= addr && addr < candidate.end).then_some(candidate.image)
    }

    pub fn add_dynamic_edge(&self, from: ImageId, to: ImageId) {
        let mut edges = self.dynamic_references.write();
        if !edges.contains(&DynamicEdge { from, to }) {
            edges.push(DynamicEdge { from, to });
        }
    }

    pub fn dynamic_edges_from(&self, from: ImageId) -> Vec<ImageId> {
        self.dynamic_references
            .read()
            .iter()
            .filter(|e| e.from == from)
            .map(|e| e.to)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
