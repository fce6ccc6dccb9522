//! §4.7 Notifier Dispatch, plus the debugger-facing beacon of §6 and
//! the `AllImages` snapshot supplement (SPEC_FULL §C.6).

use crate::image::graph::ImageGraph;
use crate::image::state::ImageState;
use crate::image::ImageId;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

/// One observable transition an observer can subscribe to (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEvent {
    Mapped,
    DependentsMapped,
    Rebased,
    Bound,
    DependentsInited,
    Initialized,
    Terminated,
}

impl ImageEvent {
    fn from_state(state: ImageState) -> Option<Self> {
        match state {
            ImageState::Mapped => Some(Self::Mapped),
            ImageState::DependentsMapped => Some(Self::DependentsMapped),
            ImageState::Rebased => Some(Self::Rebased),
            ImageState::Bound => Some(Self::Bound),
            ImageState::DependentsInited => Some(Self::DependentsInited),
            ImageState::Inited => Some(Self::Initialized),
            ImageState::Terminated => Some(Self::Terminated),
            ImageState::BeingInited => None,
        }
    }
}

type StateHandler = Arc<dyn Fn(ImageId, ImageEvent) + Send + Sync>;
type BatchHandler = Arc<dyn Fn(&[(ImageId, ImageEvent)]) + Send + Sync>;

/// A runtime-callback triple (`mapped`, `init`, `unmapped`), registered
/// once per higher-level runtime such as an Objective-C-style runtime
/// (§4.6 "notify higher-level runtimes", §4.7 last paragraph).
pub struct RuntimeCallbacks {
    pub mapped: Box<dyn Fn(ImageId) + Send + Sync>,
    pub init: Box<dyn Fn(ImageId) + Send + Sync>,
    pub unmapped: Box<dyn Fn(ImageId) + Send + Sync>,
}

/// Observer registry plus the debugger beacon and `AllImages` snapshot.
/// Recording a notification and invoking it happen under separate
/// critical sections (§4.7 "calls back outside any critical section it
/// can release") -- modeled here by collecting handler snapshots under
/// the lock, then calling them after it is dropped.
pub struct Notifier {
    per_image: RwLock<Vec<(ImageId, StateHandler)>>,
    batch: RwLock<Vec<BatchHandler>>,
    runtime: RwLock<Vec<Arc<RuntimeCallbacks>>>,
    beacon: DebuggerBeacon,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            per_image: RwLock::new(Vec::new()),
            batch: RwLock::new(Vec::new()),
            runtime: RwLock::new(Vec::new()),
            beacon: DebuggerBeacon::new(),
        }
    }

    pub fn on_image(&self, id: ImageId, handler: impl Fn(ImageId, ImageEvent) + Send + Sync + 'static) {
        self.per_image.write().push((id, Arc::new(handler)));
    }

    pub fn on_batch(&self, handler: impl Fn(&[(ImageId, ImageEvent)]) + Send + Sync + 'static) {
        self.batch.write().push(Arc::new(handler));
    }

    /// Registers a runtime callback triple. §4.7 "on registration the
    /// loader replays the `mapped` event for every already-bound image
    /// and the `init` event for every already-initialized image."
    pub fn register_runtime(&self, callbacks: RuntimeCallbacks, graph: &ImageGraph) {
        for id in graph.all_ids() {
            let state = graph.with(id, |img| img.state());
            match state {
                Some(s) if s >= ImageState::Bound => (callbacks.mapped)(id),
                _ => {}
            }
            if matches!(state, Some(ImageState::Inited) | Some(ImageState::Terminated)) {
                (callbacks.init)(id);
            }
        }
        self.runtime.write().push(Arc::new(callbacks));
    }

    /// §4.7 "records a notification under a dedicated lock and calls
    /// back outside any critical section it can release": every handler
    /// is cloned (as an `Arc`) out from under the lock before any of
    /// them runs, so a handler that re-enters `on_image`/`register_runtime`
    /// cannot deadlock against this call.
    pub fn notify_state(&self, id: ImageId, state: ImageState) {
        let Some(event) = ImageEvent::from_state(state) else {
            return;
        };
        log::debug!("image {:?} transitioned to {:?}", id, state);
        let handlers: Vec<StateHandler> = self
            .per_image
            .read()
            .iter()
            .filter(|(hid, _)| *hid == id)
            .map(|(_, h)| h.clone())
            .collect();
        for h in handlers {
            h(id, event);
        }

        let runtime_cbs: Vec<Arc<RuntimeCallbacks>> = self.runtime.read().clone();
        match event {
            ImageEvent::Bound => {
                for cb in &runtime_cbs {
                    (cb.mapped)(id);
                }
            }
            ImageEvent::Initialized => {
                for cb in &runtime_cbs {
                    (cb.init)(id);
                }
            }
            _ => {}
        }
    }

    /// §C.4 "`dyld_image_state_change` batch notification after init":
    /// called once after a whole initializer pass completes, in addition
    /// to the per-image notifications already sent during the pass.
    pub fn notify_batch(&self, events: &[(ImageId, ImageEvent)]) {
        let handlers: Vec<BatchHandler> = self.batch.read().clone();
        for handler in handlers {
            handler(events);
        }
    }

    pub fn notify_removed(&self, id: ImageId) {
        let runtime_cbs: Vec<Arc<RuntimeCallbacks>> = self.runtime.read().clone();
        for cb in &runtime_cbs {
            (cb.unmapped)(id);
        }
        self.notify_state(id, ImageState::Terminated);
    }

    pub fn beacon(&self) -> &DebuggerBeacon {
        &self.beacon
    }
}

/// One entry in the debugger-facing `infoArray` (§6).
#[derive(Debug, Clone)]
pub struct ImageInfoEntry {
    pub id: ImageId,
    pub path: PathBuf,
    pub load_address: u64,
}

/// The process-global debugger beacon (§6, §4.7). Follows the
/// "null-publish-restore" pattern: a writer swaps the pointer to null,
/// builds the new buffer, then publishes it with release ordering; a
/// concurrent reader retries until it observes a non-null pointer,
/// exactly mirroring the original's spin-on-null protocol instead of
/// blocking on a lock.
pub struct DebuggerBeacon {
    array: AtomicPtr<Vec<ImageInfoEntry>>,
    version: AtomicU32,
}

impl DebuggerBeacon {
    fn new() -> Self {
        Self {
            array: AtomicPtr::new(Arc::into_raw(Arc::new(Vec::new())) as *mut _),
            version: AtomicU32::new(1),
        }
    }

    /// Publishes a new snapshot, following §4.7's null-publish-restore
    /// sequence so a concurrent reader never observes a torn buffer.
    pub fn publish(&self, entries: Vec<ImageInfoEntry>) {
        let old = self.array.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let new = Arc::into_raw(Arc::new(entries)) as *mut Vec<ImageInfoEntry>;
        self.version.fetch_add(1, Ordering::AcqRel);
        self.array.store(new, Ordering::Release);
        if !old.is_null() {
            // SAFETY: `old` was produced by a prior `Arc::into_raw` call
            // on this same type and is not aliased elsewhere once swapped out.
            unsafe { drop(Arc::from_raw(old as *const Vec<ImageInfoEntry>)) };
        }
    }

    /// Spins until a non-null array is observed, per §4.7's reader
    /// protocol, then returns a cloned snapshot.
    pub fn read(&self) -> Vec<ImageInfoEntry> {
        loop {
            let ptr = self.array.load(Ordering::Acquire);
            if ptr.is_null() {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: non-null pointers stored here always originate from
            // `Arc::into_raw` in `publish` and stay valid until swapped out.
            let arc = unsafe { Arc::from_raw(ptr as *const Vec<ImageInfoEntry>) };
            let cloned = (*arc).clone();
            std::mem::forget(arc); // don't drop; `array` still owns this allocation
            return cloned;
        }
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }
}

impl Drop for DebuggerBeacon {
    fn drop(&mut self) {
        let ptr = self.array.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: this is the sole owner at drop time.
            unsafe { drop(Arc::from_raw(ptr as *const Vec<ImageInfoEntry>)) };
        }
    }
}

/// SPEC_FULL §C.6 `AllImages` supplement: a consistent point-in-time
/// snapshot for introspection tooling, guarded the way
/// `AllImages::withReadLock` is (here, simply the graph's own lock).
#[derive(Debug, Clone)]
pub struct ImageSnapshot {
    pub id: ImageId,
    pub path: PathBuf,
    pub load_address: u64,
    pub state: ImageState,
}

pub fn snapshot(graph: &ImageGraph) -> Vec<ImageSnapshot> {
    graph
        .all_ids()
        .into_iter()
        .filter_map(|id| {
            graph.with(id, |img| ImageSnapshot {
                id,
                path: img.path.clone(),
                load_address: img.load_address,
                state: img.state(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Image, ImageFlags};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn beacon_publish_then_read_roundtrips() {
        let beacon = DebuggerBeacon::new();
        beacon.publish(vec![ImageInfoEntry {
            id: ImageId { index: 0, generation: 1 },
            path: PathBuf::from("/bin/a"),
            load_address: 0x1000,
        }]);
        let read = beacon.read();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].load_address, 0x1000);
        assert_eq!(beacon.version(), 2);
    }

    #[test]
    fn runtime_registration_replays_already_inited_images() {
        let graph = ImageGraph::new();
        let id = graph.insert(|id| Image::new(id, PathBuf::from("/bin/a"), 0, 0, ImageFlags::IS_MAIN_EXECUTABLE));
        graph.with(id, |img| img.state_cell().set(ImageState::Inited));

        let notifier = Notifier::new();
        let mapped_calls = Arc::new(AtomicUsize::new(0));
        let init_calls = Arc::new(AtomicUsize::new(0));
        let m = mapped_calls.clone();
        let i = init_calls.clone();
        notifier.register_runtime(
            RuntimeCallbacks {
                mapped: Box::new(move |_| {
                    m.fetch_add(1, Ordering::SeqCst);
                }),
                init: Box::new(move |_| {
                    i.fetch_add(1, Ordering::SeqCst);
                }),
                unmapped: Box::new(|_| {}),
            },
            &graph,
        );
        assert_eq!(mapped_calls.load(Ordering::SeqCst), 1);
        assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_reflects_current_state() {
        let graph = ImageGraph::new();
        let id = graph.insert(|id| Image::new(id, PathBuf::from("/bin/a"), 0x4000, 0, ImageFlags::IS_MAIN_EXECUTABLE));
        let snap = snapshot(&graph);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, id);
        assert_eq!(snap[0].load_address, 0x4000);
    }
}
