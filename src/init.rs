//! §4.6 Initializer Scheduler.
//!
//! A recursive, bottom-up walk over the non-upward dependency edges:
//! an image's initializers run only after every dependency it is not
//! in an upward cycle with has already run its own. Upward dependents
//! (the back-edge of a cycle) are initialized afterward, once the
//! forward edge has already broken the cycle.
//!
//! Recursion and same-thread re-entrancy are both guarded by each
//! image's [`crate::image::state::InitLock`]; a different thread that
//! reaches an image already being initialized blocks until the owning
//! thread finishes, then observes `Inited` and returns immediately.

use crate::context::{DependencyKind, LinkContext};
use crate::error::InitError;
use crate::image::graph::ImageGraph;
use crate::image::state::{ImageState, InitLockEntry};
use crate::image::ImageId;
use crate::notify::{ImageEvent, Notifier};

/// Collaborator that actually transfers control to a resolved function
/// pointer. Out of scope for this crate proper (§1): the loader only
/// ever hands the invoker an address it has already validated lies
/// inside an executable segment of the owning image.
pub trait LifecycleInvoker: Send + Sync {
    fn call_initializer(&self, image: ImageId, addr: u64);
    fn call_terminator(&self, image: ImageId, addr: u64);
}

/// Default invoker that does nothing; lets every other subsystem be
/// exercised without wiring up a real executor.
pub struct NoopInvoker;

impl LifecycleInvoker for NoopInvoker {
    fn call_initializer(&self, _image: ImageId, _addr: u64) {}
    fn call_terminator(&self, _image: ImageId, _addr: u64) {}
}

fn state_at_least(graph: &ImageGraph, id: ImageId, target: ImageState) -> bool {
    graph.with(id, |img| img.state_cell().at_least(target)).unwrap_or(true)
}

/// Runs the full initializer closure rooted at `root` (ordinarily the
/// main executable). Ensures the libSystem-equivalent image, if one is
/// present in the graph, is always the very first to run (§4.6 "the
/// libSystem constraint").
pub fn run_initializer_closure(
    graph: &ImageGraph,
    ctx: &LinkContext,
    notifier: &Notifier,
    root: ImageId,
) -> Result<(), InitError> {
    let libsystem = ctx
        .libsystem_install_name
        .as_deref()
        .and_then(|name| graph.find_by_install_name(name));

    let mut batch: Vec<(ImageId, ImageEvent)> = Vec::new();
    init_one(graph, ctx, notifier, libsystem, root, &mut batch)?;
    notifier.notify_batch(&batch);
    Ok(())
}

/// Initializes a single image and its transitive non-upward closure, if
/// not already done. Idempotent and safe to call reentrantly from
/// within another image's initializer.
fn init_one(
    graph: &ImageGraph,
    ctx: &LinkContext,
    notifier: &Notifier,
    libsystem: Option<ImageId>,
    id: ImageId,
    batch: &mut Vec<(ImageId, ImageEvent)>,
) -> Result<(), InitError> {
    if state_at_least(graph, id, ImageState::Inited) {
        return Ok(());
    }

    if libsystem.is_some_and(|ls| ls != id) && !state_at_least(graph, libsystem.unwrap(), ImageState::Inited) {
        init_one(graph, ctx, notifier, libsystem, libsystem.unwrap(), batch)?;
    }

    let Some(entry) = graph.with(id, |img| img.init_lock.enter()) else {
        return Ok(());
    };
    if entry == InitLockEntry::Reentrant {
        // Already on this thread's call stack: a dependency cycle,
        // treated as a no-op per §4.6.
        return Ok(());
    }

    // Re-check: another thread may have finished while we waited to
    // acquire the lock.
    if state_at_least(graph, id, ImageState::Inited) {
        graph.with(id, |img| img.init_lock.exit());
        return Ok(());
    }

    let deps: Vec<(ImageId, bool)> = graph
        .with(id, |img| {
            img.dependencies
                .read()
                .iter()
                .filter_map(|d| d.resolved.map(|r| (r, d.kind == DependencyKind::Upward)))
                .collect()
        })
        .unwrap_or_default();

    for &(dep, is_upward) in &deps {
        if !is_upward {
            init_one(graph, ctx, notifier, libsystem, dep, batch)?;
        }
    }

    if graph.with(id, |img| img.state_cell().advance_if_below(ImageState::DependentsInited)).unwrap_or(false) {
        notifier.notify_state(id, ImageState::DependentsInited);
        batch.push((id, ImageEvent::DependentsInited));
    }

    graph.with(id, |img| img.state_cell().set(ImageState::BeingInited));

    run_own_initializers(graph, ctx, id)?;

    graph.with(id, |img| img.state_cell().set(ImageState::Inited));
    ctx.record_needs_termination(id);
    notifier.notify_state(id, ImageState::Inited);
    batch.push((id, ImageEvent::Initialized));

    graph.with(id, |img| img.init_lock.exit());

    // Upward dependents' own closure does not transitively include
    // this image (the forward edge above already broke the cycle), so
    // they are safe to run only now that this image is fully inited.
    for &(dep, is_upward) in &deps {
        if is_upward {
            init_one(graph, ctx, notifier, libsystem, dep, batch)?;
        }
    }

    Ok(())
}

/// Invokes every initializer function pointer recorded for `id`, after
/// validating each lies inside one of the image's own executable
/// segments (§3 invariant, §4.6).
fn run_own_initializers(graph: &ImageGraph, ctx: &LinkContext, id: ImageId) -> Result<(), InitError> {
    let addrs: Vec<u64> = graph
        .with(id, |img| {
            img.initializers
                .iter()
                .map(|&off| img.load_address.wrapping_add(off))
                .collect()
        })
        .unwrap_or_default();

    for addr in addrs {
        let in_range = graph.with(id, |img| img.vmaddr_in_executable_segment(addr)).unwrap_or(false);
        if !in_range {
            return Err(InitError::InitializerOutOfRange(addr));
        }
        ctx.invoker.call_initializer(id, addr);
    }
    Ok(())
}

/// Runs `id`'s terminators, in reverse of the order they were recorded
/// (SPEC_FULL §C.3), and marks the image terminated. Called by GC once
/// an image has already been proven unreachable; never called on an
/// image that is still referenced.
pub fn run_terminator(graph: &ImageGraph, ctx: &LinkContext, id: ImageId) {
    let addrs: Vec<u64> = graph
        .with(id, |img| {
            img.terminators
                .iter()
                .rev()
                .map(|&off| img.load_address.wrapping_add(off))
                .collect()
        })
        .unwrap_or_default();

    for addr in addrs {
        ctx.invoker.call_terminator(id, addr);
    }
}
