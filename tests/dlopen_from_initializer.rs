//! §8 scenario 2: an executable linked to one dylib whose initializer
//! calls `dlopen` on a third dylib. Exercises the initializer
//! scheduler's reentrancy guard and `Loader::dlopen` from inside
//! `run_own_initializers`, without ever touching raw mapped memory
//! (the [`LifecycleInvoker`] boundary is the only place a real
//! function pointer would be jumped to, and this crate never
//! dereferences it itself).

mod common;

use common::{pointer_array_section, write_image, CPU_TYPE_ARM64, MH_DYLIB, MH_EXECUTE};
use macho_loader_core::context::{EnvSnapshot, LinkContext};
use macho_loader_core::image::state::ImageState;
use macho_loader_core::image::ImageId;
use macho_loader_core::init::LifecycleInvoker;
use macho_loader_core::loader::Loader;
use macho_loader_core::platform::FakePlatform;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Watches for B's initializer and, on seeing it, reenters the loader
/// to `dlopen` C -- the scenario's "initializer of B calls dlopen on a
/// third dylib".
struct DlopenFromInitInvoker {
    loader: OnceLock<Arc<Loader>>,
    triggered: AtomicBool,
    c_state_during_b_init: std::sync::Mutex<Option<ImageState>>,
}

impl LifecycleInvoker for DlopenFromInitInvoker {
    fn call_initializer(&self, image: ImageId, _addr: u64) {
        let loader = self.loader.get().expect("loader handle set before any initializer runs");
        let is_b = loader
            .graph
            .with(image, |img| img.path.file_name().and_then(|n| n.to_str()) == Some("libb.dylib"))
            .unwrap_or(false);
        if !is_b {
            return;
        }
        self.triggered.store(true, Ordering::SeqCst);
        let c = loader.dlopen("libc.dylib", image).unwrap();
        // By the time dlopen returns, C's own initializer closure has
        // already run to completion.
        let c_state = loader.graph.with(c, |img| img.state()).unwrap();
        *self.c_state_during_b_init.lock().unwrap() = Some(c_state);
    }

    fn call_terminator(&self, _image: ImageId, _addr: u64) {}
}

#[test]
fn dlopen_from_an_initializer_fully_inits_the_new_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let main_path = dir.path().join("a.out");
    let lib_b_path = dir.path().join("libb.dylib");
    let lib_c_path = dir.path().join("libc.dylib");

    write_image(&main_path, MH_EXECUTE, 0x1000, 0x1000, &[], &["libb.dylib"]);
    write_image(
        &lib_b_path,
        MH_DYLIB,
        0x2000,
        0x1000,
        &[pointer_array_section("__mod_init_func", &[0x2010])],
        &[],
    );
    write_image(&lib_c_path, MH_DYLIB, 0x3000, 0x1000, &[], &[]);

    let invoker = Arc::new(DlopenFromInitInvoker {
        loader: OnceLock::new(),
        triggered: AtomicBool::new(false),
        c_state_during_b_init: std::sync::Mutex::new(None),
    });

    let mut env = EnvSnapshot::default();
    env.library_path = vec![dir.path().to_path_buf()];
    let ctx = LinkContext::new(main_path.clone(), env, false).with_invoker(invoker.clone());
    let loader = Arc::new(Loader::new(ctx, Box::new(FakePlatform::default()), CPU_TYPE_ARM64, 0));
    invoker.loader.set(loader.clone()).ok().expect("set once");

    let main_id = loader.load_main_executable(&main_path).unwrap();

    assert!(invoker.triggered.load(Ordering::SeqCst));
    assert_eq!(*invoker.c_state_during_b_init.lock().unwrap(), Some(ImageState::Inited));

    let b_id = loader.graph.find_by_path(&lib_b_path).unwrap();
    let c_id = loader.graph.find_by_path(&lib_c_path).unwrap();
    assert_eq!(loader.graph.with(main_id, |img| img.state()).unwrap(), ImageState::Inited);
    assert_eq!(loader.graph.with(b_id, |img| img.state()).unwrap(), ImageState::Inited);
    assert_eq!(loader.graph.with(c_id, |img| img.state()).unwrap(), ImageState::Inited);
}
