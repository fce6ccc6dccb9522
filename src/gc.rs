//! §4.5 Dependency Graph and Garbage Collection.
//!
//! Depth assignment for initializer order also lives here since it is
//! computed over the same dependency edges the GC mark phase walks.

use crate::context::{DependencyKind, LinkContext};
use crate::error::GcError;
use crate::image::graph::ImageGraph;
use crate::image::{ImageFlags, ImageId};
use crate::notify::Notifier;
use crate::platform::PlatformOps;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// §4.5 "Load order is a breadth-first walk from the main executable.
/// For each image, after its dependents are loaded, the parent's
/// `staticRefs` on each non-upward dependent is incremented".
pub fn link_static_refs(graph: &ImageGraph, parent: ImageId) {
    let deps: Vec<(ImageId, DependencyKind)> = graph
        .with(parent, |img| {
            img.dependencies
                .read()
                .iter()
                .filter_map(|d| d.resolved.map(|id| (id, d.kind)))
                .collect()
        })
        .unwrap_or_default();

    for (dep, kind) in deps {
        if kind != DependencyKind::Upward {
            graph.with(dep, |img| img.refs.inc_static());
            graph.with_mut(dep, |img| img.flags |= ImageFlags::REFERENCED_DOWNWARD);
        } else {
            graph.with_mut(dep, |img| img.flags |= ImageFlags::REFERENCED_UPWARD);
        }
    }
}

/// §4.5 Depth assignment: `depth(img) = 1 + min(depth(d) for d in
/// dependents, skipping upward)`; a large sentinel breaks cycles by
/// making a node its own placeholder depth before recursing into it.
pub fn assign_depths(graph: &ImageGraph, root: ImageId) {
    const CYCLE_SENTINEL: u32 = u32::MAX;
    let mut visiting: HashSet<ImageId> = HashSet::new();
    assign_depth_rec(graph, root, &mut visiting, CYCLE_SENTINEL);
}

fn assign_depth_rec(graph: &ImageGraph, id: ImageId, visiting: &mut HashSet<ImageId>, sentinel: u32) -> u32 {
    if let Some(d) = graph.with(id, |img| img.depth()) {
        if d != 0 && d != sentinel {
            return d;
        }
    }
    if !visiting.insert(id) {
        return sentinel;
    }
    graph.with(id, |img| img.depth.store(sentinel, Ordering::Release));

    let deps: Vec<ImageId> = graph
        .with(id, |img| {
            img.dependencies
                .read()
                .iter()
                .filter(|d| d.kind != DependencyKind::Upward)
                .filter_map(|d| d.resolved)
                .collect()
        })
        .unwrap_or_default();

    let min_child = deps
        .iter()
        .map(|&d| assign_depth_rec(graph, d, visiting, sentinel))
        .filter(|&d| d != sentinel)
        .min();

    let depth = 1 + min_child.unwrap_or(0);
    graph.with(id, |img| img.depth.store(depth, Ordering::Release));
    visiting.remove(&id);
    depth
}

/// §4.5 step 1-2: marks every image reachable from the never-unload root
/// set through static, reexport, and dynamic-reference edges.
pub fn mark_reachable(graph: &ImageGraph) -> HashSet<ImageId> {
    let mut reachable = HashSet::new();
    let mut stack: Vec<ImageId> = graph
        .all_ids()
        .into_iter()
        .filter(|&id| {
            graph
                .with(id, |img| {
                    img.is_reachable_root() || img.refs.dlopen_refs.load(Ordering::Acquire) > 0
                })
                .unwrap_or(false)
        })
        .collect();

    while let Some(id) = stack.pop() {
        if !reachable.insert(id) {
            continue;
        }
        let mut edges: Vec<ImageId> = graph
            .with(id, |img| {
                img.dependencies
                    .read()
                    .iter()
                    .filter(|d| d.kind != DependencyKind::Upward)
                    .filter_map(|d| d.resolved)
                    .collect()
            })
            .unwrap_or_default();
        edges.extend(graph.dynamic_edges_from(id));
        stack.extend(edges);
    }

    reachable
}

/// Guards against overlapping GC passes (§4.5 "GC reentrancy is guarded
/// by an atomic counter: a concurrent GC request while one is already
/// running bumps the counter; the running one re-iterates until the
/// counter settles").
#[derive(Default)]
pub struct GcCoordinator {
    generation: AtomicU32,
    in_progress: AtomicBool,
}

impl GcCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `collect` until no further generation bump was observed
    /// mid-pass, i.e. until the redo flag (§4.5 step 5) settles.
    ///
    /// A terminator invoked from within `collect_one_pass` may itself
    /// call back into `dlclose`, reaching this method again before the
    /// outer call has returned (§4.5 step 3 "wrapped to catch a
    /// recursive `dlclose` by setting a 'redo GC' flag instead of
    /// re-entering"). `in_progress` detects that reentrant call and
    /// bumps the generation instead of running `collect_one_pass`
    /// concurrently with the outer pass's own mark/collect state.
    pub fn run(
        &self,
        graph: &ImageGraph,
        ctx: &LinkContext,
        platform: &dyn PlatformOps,
        notifier: &Notifier,
    ) -> Result<Vec<ImageId>, GcError> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            self.request_redo();
            return Ok(Vec::new());
        }

        let result = (|| {
            let mut collected_total = Vec::new();
            loop {
                let before = self.generation.load(Ordering::Acquire);
                let collected = collect_one_pass(graph, ctx, platform, notifier)?;
                collected_total.extend(collected);
                let after = self.generation.load(Ordering::Acquire);
                if after == before {
                    return Ok(collected_total);
                }
            }
        })();

        self.in_progress.store(false, Ordering::Release);
        result
    }

    /// Called by a terminator that itself triggers `dlclose` reentrantly
    /// (§4.5 step 3 "wrapped to catch a recursive `dlclose` ... instead
    /// of re-entering"), so the running pass knows to redo step 1.
    pub fn request_redo(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

fn collect_one_pass(
    graph: &ImageGraph,
    ctx: &LinkContext,
    platform: &dyn PlatformOps,
    notifier: &Notifier,
) -> Result<Vec<ImageId>, GcError> {
    let reachable = mark_reachable(graph);
    let dead: Vec<ImageId> = graph
        .all_ids()
        .into_iter()
        .filter(|id| !reachable.contains(id))
        .collect();

    log::debug!("gc pass: {} reachable, {} collected", reachable.len(), dead.len());

    if dead.is_empty() {
        return Ok(Vec::new());
    }

    // §4.5 step 3: run terminators in the recorded order (LIFO relative
    // to initialization order, SPEC_FULL §C.3), restricted to images
    // that are actually being collected this pass.
    let mut order = ctx.termination_order.lock();
    let mut to_run: Vec<ImageId> = Vec::new();
    order.retain(|id| {
        if dead.contains(id) {
            to_run.push(*id);
            false
        } else {
            true
        }
    });
    drop(order);
    to_run.reverse();

    for id in &to_run {
        crate::init::run_terminator(graph, ctx, *id);
    }

    for &id in &dead {
        let leave_mapped = graph.with(id, |img| img.flags.contains(ImageFlags::LEAVE_MAPPED)).unwrap_or(false);
        if !leave_mapped {
            crate::mapper::unmap_image(platform, graph, id);
        }
        graph.remove(id);
        notifier.notify_removed(id);
    }

    Ok(dead)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EnvSnapshot;
    use crate::image::{Dependency, Image};
    use crate::platform::FakePlatform;
    use std::path::PathBuf;

    fn make_image(graph: &ImageGraph, path: &str, flags: ImageFlags) -> ImageId {
        graph.insert(|id| Image::new(id, PathBuf::from(path), 0, 0, flags))
    }

    fn link(graph: &ImageGraph, from: ImageId, to: ImageId, kind: DependencyKind) {
        graph.with_mut(from, |img| {
            img.dependencies.get_mut().push(Dependency {
                name: "dep".into(),
                min_version: 0,
                compat_version: 0,
                kind,
                resolved: Some(to),
            });
        });
    }

    #[test]
    fn unreferenced_leaf_is_collected() {
        let graph = ImageGraph::new();
        let main = make_image(&graph, "/bin/a", ImageFlags::IS_MAIN_EXECUTABLE);
        let leaf = make_image(&graph, "/lib/leaf.dylib", ImageFlags::IS_DYLIB);
        let _ = main;
        // leaf has no refs and is not a root: must be collected.
        let reachable = mark_reachable(&graph);
        assert!(reachable.contains(&main));
        assert!(!reachable.contains(&leaf));
    }

    #[test]
    fn static_dependency_keeps_dependent_alive() {
        let graph = ImageGraph::new();
        let main = make_image(&graph, "/bin/a", ImageFlags::IS_MAIN_EXECUTABLE);
        let dep = make_image(&graph, "/lib/dep.dylib", ImageFlags::IS_DYLIB);
        link(&graph, main, dep, DependencyKind::Required);

        let reachable = mark_reachable(&graph);
        assert!(reachable.contains(&dep));
    }

    #[test]
    fn dynamic_edge_keeps_target_alive() {
        let graph = ImageGraph::new();
        let main = make_image(&graph, "/bin/a", ImageFlags::IS_MAIN_EXECUTABLE);
        let looked_up = make_image(&graph, "/lib/flat.dylib", ImageFlags::IS_DYLIB);
        graph.add_dynamic_edge(main, looked_up);

        let reachable = mark_reachable(&graph);
        assert!(reachable.contains(&looked_up));
    }

    #[test]
    fn cyclic_dependents_both_get_a_finite_depth() {
        let graph = ImageGraph::new();
        let a = make_image(&graph, "/lib/a.dylib", ImageFlags::IS_DYLIB);
        let b = make_image(&graph, "/lib/b.dylib", ImageFlags::IS_DYLIB);
        link(&graph, a, b, DependencyKind::Required);
        link(&graph, b, a, DependencyKind::Upward);

        assign_depths(&graph, a);
        let depth_a = graph.with(a, |img| img.depth()).unwrap();
        let depth_b = graph.with(b, |img| img.depth()).unwrap();
        assert_ne!(depth_a, u32::MAX);
        assert_ne!(depth_b, u32::MAX);
    }

    #[test]
    fn collect_unmaps_and_removes_dead_images() {
        let graph = ImageGraph::new();
        let main = make_image(&graph, "/bin/a", ImageFlags::IS_MAIN_EXECUTABLE);
        let leaf = make_image(&graph, "/lib/leaf.dylib", ImageFlags::IS_DYLIB);
        let _ = main;

        let ctx = LinkContext::new(PathBuf::from("/bin/a"), EnvSnapshot::default(), false);
        let platform = FakePlatform::default();
        let notifier = Notifier::new();

        let coordinator = GcCoordinator::new();
        let collected = coordinator.run(&graph, &ctx, &platform, &notifier).unwrap();
        assert_eq!(collected, vec![leaf]);
        assert!(graph.with(leaf, |_| ()).is_none());
    }

    /// §4.5 step 3: a terminator that itself triggers `dlclose`
    /// reentrantly must not recurse into `collect_one_pass` while the
    /// outer pass is still unwinding; it should instead set the redo
    /// flag that the outer `run` loop already checks for.
    #[test]
    fn reentrant_run_sets_redo_instead_of_recursing() {
        let graph = ImageGraph::new();
        let ctx = LinkContext::new(PathBuf::from("/bin/a"), EnvSnapshot::default(), false);
        let platform = FakePlatform::default();
        let notifier = Notifier::new();

        let coordinator = GcCoordinator::new();
        // Simulate a terminator-triggered `dlclose` reaching `run` while
        // the outer pass (not actually running here) is in progress.
        coordinator.in_progress.store(true, Ordering::Release);
        let before = coordinator.generation.load(Ordering::Acquire);

        let collected = coordinator.run(&graph, &ctx, &platform, &notifier).unwrap();

        assert!(collected.is_empty());
        assert_eq!(coordinator.generation.load(Ordering::Acquire), before + 1);
    }
}
