//! §4.1 Path Resolver.

use crate::context::{LinkContext, RPathChain};
use crate::error::{AttemptFailure, PolicyError, ResolveAttempt, ResolveError};
use crate::image::graph::ImageGraph;
use crate::image::ImageId;
use crate::shared_cache::{CacheLookup, SharedCache};
use std::path::{Path, PathBuf};

/// What a requester's own position in the load chain supplies to this
/// resolution (§4.1's "requester path, `@rpath` chain, search flags").
pub struct LoadRequest<'a> {
    pub load_name: &'a str,
    pub requester_dir: &'a Path,
    /// `true` only for the direct dependency load of the main executable
    /// itself -- gates the "requester is main executable" special case
    /// in `@loader_path` policy (§4.1 phase 2, SPEC_FULL §C.2).
    pub requester_is_main_executable: bool,
    pub rpaths: &'a RPathChain<'a>,
    /// §4.1 phase 1 "if N is a bare leaf OR search flags demand it".
    pub force_search_paths: bool,
    pub must_be_dylib: bool,
}

pub enum ResolveOutcome {
    AlreadyLoaded(ImageId),
    CacheResident { mh_addr: u64, install_name: String },
    FilePath(PathBuf),
}

struct Attempts {
    load_name: String,
    log: Vec<ResolveAttempt>,
}

impl Attempts {
    fn record(&mut self, path: &Path, reason: AttemptFailure) {
        log::debug!("path resolution for {:?} failed at {:?}: {}", self.load_name, path, reason);
        self.log.push(ResolveAttempt {
            path: path.to_path_buf(),
            reason,
        });
    }

    fn into_error(self) -> ResolveError {
        log::warn!(
            "could not resolve {:?} after trying {} candidate path(s)",
            self.load_name,
            self.log.len()
        );
        ResolveError {
            load_name: self.load_name,
            attempts: self.log,
        }
    }
}

/// Runs every phase of §4.1 in order, returning the first successful
/// resolution or an aggregated [`ResolveError`] listing every attempt.
pub fn resolve(
    req: &LoadRequest<'_>,
    ctx: &LinkContext,
    graph: &ImageGraph,
    cache: Option<&SharedCache>,
) -> Result<ResolveOutcome, ResolveError> {
    let mut attempts = Attempts {
        load_name: req.load_name.to_string(),
        log: Vec::new(),
    };

    let candidates = build_candidate_list(req, ctx);

    for candidate in &candidates {
        if let Some(outcome) = try_match_loaded(candidate, req.must_be_dylib, req.load_name, graph) {
            return Ok(outcome);
        }
    }

    for candidate in &candidates {
        match try_open(candidate, cache, &mut attempts) {
            Ok(Some(outcome)) => return Ok(outcome),
            Ok(None) => continue,
            Err(e) => {
                attempts.record(candidate, e);
            }
        }
    }

    // §4.1 phase 5: fallback paths, tried only when opening (not
    // matching) every earlier candidate failed.
    let fallback_candidates = build_fallback_list(req, ctx);
    for candidate in &fallback_candidates {
        match try_open(candidate, cache, &mut attempts) {
            Ok(Some(outcome)) => return Ok(outcome),
            Ok(None) => continue,
            Err(e) => attempts.record(candidate, e),
        }
    }

    Err(attempts.into_error())
}

fn build_candidate_list(req: &LoadRequest<'_>, ctx: &LinkContext) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let name = req.load_name;

    // Phase 0: root substitution.
    if !ctx.env.root_path.is_empty() && name.starts_with('/') {
        for root in &ctx.env.root_path {
            out.push(join_root(root, name));
        }
    }

    // Phase 2: @-variable expansion.
    if let Some(rest) = name.strip_prefix("@executable_path/") {
        if ctx.permissions.may_use_at_paths {
            out.push(ctx.main_executable_dir.join(rest));
        }
    } else if let Some(rest) = name.strip_prefix("@loader_path/") {
        let denied = !ctx.permissions.may_use_at_paths
            || (req.requester_is_main_executable && ctx.restricted);
        if !denied {
            out.push(req.requester_dir.join(rest));
        }
    } else if let Some(rest) = name.strip_prefix("@rpath/") {
        for rp in req.rpaths.iter_outward_in() {
            out.push(rp.join(rest));
        }
        for lp in &ctx.env.library_path {
            out.push(lp.join(rest));
        }
    } else {
        // Phase 1: forced search paths for a bare leaf or when demanded.
        let is_bare_leaf = !name.contains('/');
        if (is_bare_leaf || req.force_search_paths) && ctx.permissions.may_use_env_var_paths {
            for lp in &ctx.env.library_path {
                out.push(lp.join(name));
            }
            for fp in &ctx.env.framework_path {
                out.push(fp.join(name));
            }
        }
        out.push(PathBuf::from(name));
    }

    // Phase 3: image-suffix overlay -- try base+suffix+ext before base+ext.
    if let Some(suffix) = &ctx.env.image_suffix {
        let mut suffixed: Vec<PathBuf> = out.iter().map(|p| apply_suffix(p, suffix)).collect();
        suffixed.extend(out);
        out = suffixed;
    }

    out
}

fn build_fallback_list(req: &LoadRequest<'_>, ctx: &LinkContext) -> Vec<PathBuf> {
    if !ctx.permissions.may_follow_classic_fallback_paths {
        return Vec::new();
    }
    let name = Path::new(req.load_name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(req.load_name));
    let mut out = Vec::new();
    for lp in &ctx.env.fallback_library_path {
        out.push(lp.join(&name));
    }
    for fp in &ctx.env.fallback_framework_path {
        out.push(fp.join(&name));
    }
    out
}

fn join_root(root: &Path, absolute: &str) -> PathBuf {
    let trimmed = absolute.trim_start_matches('/');
    root.join(trimmed)
}

fn apply_suffix(path: &Path, suffix: &str) -> PathBuf {
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => {
            let mut name = stem.to_os_string();
            name.push(suffix);
            name.push(".");
            name.push(ext);
            path.with_file_name(name)
        }
        (Some(stem), None) => {
            let mut name = stem.to_os_string();
            name.push(suffix);
            path.with_file_name(name)
        }
        _ => path.to_path_buf(),
    }
}

/// §4.1 "each candidate is tried first as a 'match against
/// already-loaded'" -- both exact path match and, for `@rpath`-style
/// names, install-name match (§ tie-break rules and the original's
/// "an install name starting with @rpath should match by install
/// name").
fn try_match_loaded(
    candidate: &Path,
    must_be_dylib: bool,
    orig_load_name: &str,
    graph: &ImageGraph,
) -> Option<ResolveOutcome> {
    if let Some(id) = graph.find_by_path(candidate) {
        let ok = graph
            .with(id, |img| {
                !must_be_dylib || img.flags.contains(crate::image::ImageFlags::IS_DYLIB)
            })
            .unwrap_or(false);
        if ok {
            return Some(ResolveOutcome::AlreadyLoaded(id));
        }
    }
    if orig_load_name.starts_with("@rpath/") {
        if let Some(id) = graph.find_by_install_name(orig_load_name) {
            return Some(ResolveOutcome::AlreadyLoaded(id));
        }
    }
    None
}

/// §4.1 phase 4 "Resolve to an Image" for a single candidate that was
/// not already loaded: cache check, then stat-based symlink aliasing,
/// then treat as a path to open. `Ok(None)` means "this candidate
/// doesn't exist, try the next one"; the caller records that as a
/// `NotFound` attempt.
fn try_open(
    candidate: &Path,
    cache: Option<&SharedCache>,
    attempts: &mut Attempts,
) -> Result<Option<ResolveOutcome>, AttemptFailure> {
    if let Some(cache) = cache {
        if cache.contains_path(candidate) {
            let on_disk = stat_metadata(candidate);
            match cache.resolve(candidate, on_disk) {
                CacheLookup::UseCache { mh_addr } => {
                    return Ok(Some(ResolveOutcome::CacheResident {
                        mh_addr,
                        install_name: candidate.to_string_lossy().into_owned(),
                    }));
                }
                CacheLookup::PreferDisk => {
                    // fall through to the on-disk open below
                }
                CacheLookup::Absent => unreachable!("contains_path already checked"),
            }
        }
    }

    match candidate.metadata() {
        Ok(_) => Ok(Some(ResolveOutcome::FilePath(candidate.to_path_buf()))),
        Err(e) => {
            let _ = attempts;
            let errno = e.raw_os_error().unwrap_or(-1);
            Err(AttemptFailure::NotFound(errno))
        }
    }
}

#[cfg(unix)]
fn stat_metadata(path: &Path) -> Option<(i64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.mtime(), meta.ino()))
}

#[cfg(not(unix))]
fn stat_metadata(_path: &Path) -> Option<(i64, u64)> {
    None
}

/// §6 "Restricted processes ignore every `*_` variable" and §7 Policy:
/// used by callers before even attempting `@`-path expansion when they
/// already know the process is restricted and the name is a raw `@`
/// path (kept separate from `resolve` so the policy-denied error can
/// carry the specific variable name).
pub fn check_at_path_policy(load_name: &str, ctx: &LinkContext) -> Result<(), PolicyError> {
    let variable = if load_name.starts_with("@executable_path/") {
        Some("@executable_path")
    } else if load_name.starts_with("@loader_path/") {
        Some("@loader_path")
    } else {
        None
    };
    if let Some(variable) = variable {
        if !ctx.permissions.may_use_at_paths {
            return Err(PolicyError::RestrictedPathVariable(variable));
        }
    }
    Ok(())
}
