//! [`LinkContext`] and the environment snapshot it is built from (§3, §6).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// §3 "Dependency vector" `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Required,
    Weak,
    Reexport,
    Upward,
}

/// How a library ordinal in a classic bind record should be interpreted
/// (§4.4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryOrdinal {
    Dependent(u32),
    MainExecutable,
    FlatLookup,
    WeakLookup,
    SelfImage,
}

impl LibraryOrdinal {
    pub fn decode(raw: i32) -> Self {
        match raw {
            0 => Self::SelfImage,
            -1 => Self::MainExecutable,
            -2 => Self::FlatLookup,
            -3 => Self::WeakLookup,
            n if n > 0 => Self::Dependent(n as u32 - 1),
            _ => Self::SelfImage,
        }
    }
}

/// §4.1 "for each rpath recorded along the load chain (from outermost
/// caller to current image)". A borrowed linked list rather than a
/// flattened `Vec` so nested `dlopen`/dependency loads can extend the
/// chain without copying everything their ancestors contributed.
pub struct RPathChain<'a> {
    parent: Option<&'a RPathChain<'a>>,
    own: &'a [PathBuf],
}

impl<'a> RPathChain<'a> {
    pub const EMPTY: RPathChain<'static> = RPathChain {
        parent: None,
        own: &[],
    };

    pub fn new(parent: Option<&'a RPathChain<'a>>, own: &'a [PathBuf]) -> Self {
        Self { parent, own }
    }

    /// Walks outermost-caller-first, matching the order §4.1 phase 2
    /// specifies for `@rpath` substitution.
    pub fn iter_outward_in(&self) -> impl Iterator<Item = &PathBuf> {
        let mut frames = Vec::new();
        let mut cur = Some(self);
        while let Some(frame) = cur {
            frames.push(frame);
            cur = frame.parent;
        }
        frames.into_iter().rev().flat_map(|f| f.own.iter())
    }
}

/// Search-flag permissions a process may or may not have (§3
/// `LinkContext` "permissions").
#[derive(Debug, Clone, Copy, Default)]
pub struct Permissions {
    pub may_use_at_paths: bool,
    pub may_use_env_var_paths: bool,
    pub may_use_custom_shared_cache: bool,
    pub may_follow_classic_fallback_paths: bool,
    pub may_permit_insertion_failures: bool,
}

impl Permissions {
    pub fn unrestricted() -> Self {
        Self {
            may_use_at_paths: true,
            may_use_env_var_paths: true,
            may_use_custom_shared_cache: true,
            may_follow_classic_fallback_paths: true,
            may_permit_insertion_failures: false,
        }
    }

    /// A setuid/library-validation/marked-restricted process ignores
    /// every environment-derived search path (§6 "Restricted
    /// processes").
    pub fn restricted() -> Self {
        Self {
            may_use_at_paths: false,
            may_use_env_var_paths: false,
            may_use_custom_shared_cache: false,
            may_follow_classic_fallback_paths: true,
            may_permit_insertion_failures: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedRegionMode {
    Use,
    Private,
    Avoid,
}

/// One process's worth of environment-derived configuration (§6's
/// table). Parsed once at process start; the prefix is a parameter so
/// no vendor-specific string needs to appear verbatim in code.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub library_path: Vec<PathBuf>,
    pub framework_path: Vec<PathBuf>,
    pub fallback_library_path: Vec<PathBuf>,
    pub fallback_framework_path: Vec<PathBuf>,
    pub insert_libraries: Vec<PathBuf>,
    pub image_suffix: Option<String>,
    pub force_flat_namespace: bool,
    pub bind_at_launch: bool,
    pub root_path: Vec<PathBuf>,
    pub shared_region: Option<SharedRegionMode>,
    pub print_libraries: bool,
}

impl EnvSnapshot {
    /// Parses a `prefix_VARNAME` style environment, as captured by
    /// `vars: impl Iterator<Item = (String, String)>` (normally
    /// `std::env::vars()`, injected here so tests don't mutate the real
    /// process environment).
    pub fn parse(prefix: &str, vars: impl Iterator<Item = (String, String)>) -> Self {
        let mut snap = Self::default();
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix(prefix) else {
                continue;
            };
            match suffix {
                "LIBRARY_PATH" => snap.library_path = split_colon_list(&value),
                "FRAMEWORK_PATH" => snap.framework_path = split_colon_list(&value),
                "FALLBACK_LIBRARY_PATH" => snap.fallback_library_path = split_colon_list(&value),
                "FALLBACK_FRAMEWORK_PATH" => snap.fallback_framework_path = split_colon_list(&value),
                "INSERT_LIBRARIES" => snap.insert_libraries = split_colon_list(&value),
                "IMAGE_SUFFIX" => snap.image_suffix = Some(value),
                "FORCE_FLAT_NAMESPACE" => snap.force_flat_namespace = true,
                "BIND_AT_LAUNCH" => snap.bind_at_launch = true,
                "ROOT_PATH" => snap.root_path = split_colon_list(&value),
                "SHARED_REGION" => {
                    snap.shared_region = match value.as_str() {
                        "private" => Some(SharedRegionMode::Private),
                        "avoid" => Some(SharedRegionMode::Avoid),
                        _ => Some(SharedRegionMode::Use),
                    }
                }
                s if s.starts_with("PRINT_") => {
                    if s == "PRINT_LIBRARIES" {
                        snap.print_libraries = true;
                    }
                }
                _ => {}
            }
        }
        snap
    }
}

fn split_colon_list(value: &str) -> Vec<PathBuf> {
    value
        .split(':')
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Plumbing threaded through every phase (§3 `LinkContext`).
pub struct LinkContext {
    pub env: EnvSnapshot,
    pub permissions: Permissions,
    pub platform: u32,
    pub main_executable_path: PathBuf,
    pub main_executable_dir: PathBuf,
    pub restricted: bool,
    /// FIFO of images whose terminators must run, in the order they were
    /// first observed to need one -- used by GC step 3 to run
    /// terminators in a defined (reverse-of-registration) order, the
    /// way the original's termination recorder stack does.
    pub termination_order: parking_lot::Mutex<VecDeque<crate::image::ImageId>>,
    /// Install name the loader treats as the libSystem-equivalent root of
    /// every closure (§4.6 "libSystem constraint": it is always the first
    /// image initialized and the last terminated).
    pub libsystem_install_name: Option<String>,
    /// Collaborator that actually invokes a resolved initializer/terminator
    /// function pointer (§4.6, §1 "out of scope: executing machine code").
    /// Defaults to a no-op so every other subsystem can be built and tested
    /// without a real executor.
    pub invoker: Arc<dyn crate::init::LifecycleInvoker>,
}

impl LinkContext {
    pub fn new(main_executable_path: PathBuf, env: EnvSnapshot, restricted: bool) -> Self {
        let main_executable_dir = main_executable_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let permissions = if restricted {
            Permissions::restricted()
        } else {
            Permissions::unrestricted()
        };
        Self {
            env,
            permissions,
            platform: 1, // macOS
            main_executable_path,
            main_executable_dir,
            restricted,
            termination_order: parking_lot::Mutex::new(VecDeque::new()),
            libsystem_install_name: Some("/usr/lib/libSystem.B.dylib".to_string()),
            invoker: Arc::new(crate::init::NoopInvoker),
        }
    }

    pub fn record_needs_termination(&self, id: crate::image::ImageId) {
        self.termination_order.lock().push_back(id);
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn crate::init::LifecycleInvoker>) -> Self {
        self.invoker = invoker;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_snapshot_parses_colon_lists() {
        let vars = vec![
            ("DYLD_LIBRARY_PATH".to_string(), "/a:/b".to_string()),
            ("DYLD_BIND_AT_LAUNCH".to_string(), "1".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let snap = EnvSnapshot::parse("DYLD_", vars.into_iter());
        assert_eq!(snap.library_path, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(snap.bind_at_launch);
    }

    #[test]
    fn library_ordinal_decoding() {
        assert_eq!(LibraryOrdinal::decode(0), LibraryOrdinal::SelfImage);
        assert_eq!(LibraryOrdinal::decode(-1), LibraryOrdinal::MainExecutable);
        assert_eq!(LibraryOrdinal::decode(-2), LibraryOrdinal::FlatLookup);
        assert_eq!(LibraryOrdinal::decode(-3), LibraryOrdinal::WeakLookup);
        assert_eq!(LibraryOrdinal::decode(2), LibraryOrdinal::Dependent(1));
    }

    #[test]
    fn rpath_chain_orders_outermost_first() {
        let root = vec![PathBuf::from("/root/rpath")];
        let root_chain = RPathChain::new(None, &root);
        let mid = vec![PathBuf::from("/mid/rpath")];
        let mid_chain = RPathChain::new(Some(&root_chain), &mid);
        let leaf = vec![PathBuf::from("/leaf/rpath")];
        let leaf_chain = RPathChain::new(Some(&mid_chain), &leaf);

        let collected: Vec<_> = leaf_chain.iter_outward_in().cloned().collect();
        assert_eq!(
            collected,
            vec![
                PathBuf::from("/root/rpath"),
                PathBuf::from("/mid/rpath"),
                PathBuf::from("/leaf/rpath"),
            ]
        );
    }
}
