//! Error taxonomy for the loader core.
//!
//! Mirrors §7 of the design: structural/file-format, compatibility,
//! policy, symbol and recoverable errors each get their own variant
//! family so callers can tell a fatal-at-launch error from one that
//! only fails a single `dlopen`.

use crate::image::ImageId;
use std::path::PathBuf;
use thiserror::Error;

/// Structural/file-format failures detected while parsing a Mach-O header
/// or its load commands (§7 "Structural / file-format").
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("file is too small to contain a mach-o header")]
    Truncated,
    #[error("unrecognized magic number {0:#x}")]
    BadMagic(u32),
    #[error("fat header claims {count} slices but the table does not fit in the first page")]
    FatTableOverflow { count: u32 },
    #[error("fat slices {a} and {b} overlap")]
    OverlappingSlices { a: usize, b: usize },
    #[error("segment {name:?} overlaps a previously seen segment")]
    OverlappingSegments { name: String },
    #[error("segment {name:?} has filesize {filesize} greater than vmsize {vmsize}")]
    FileSizeExceedsVmSize {
        name: String,
        filesize: u64,
        vmsize: u64,
    },
    #[error("segment {name:?} has nonzero file offset but zero file size and is not the first segment")]
    BadZeroFillPlacement { name: String },
    #[error("load command size {size} at index {index} overruns the load-command region")]
    LoadCommandOverrun { index: usize, size: u32 },
    #[error("truncated __LINKEDIT segment, expected at least {expected} bytes, found {found}")]
    LinkeditTruncated { expected: u64, found: u64 },
    #[error(transparent)]
    Scroll(#[from] scroll::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compatibility failures (§7 "Compatibility").
#[derive(Debug, Error)]
pub enum CompatibilityError {
    #[error("cpu type {found:#x} does not match required {required:#x}")]
    WrongCpuType { required: u32, found: u32 },
    #[error("no slice in the universal file matches the requested architecture")]
    NoMatchingSlice,
    #[error("platform {found} is not compatible with the running platform {running}")]
    WrongPlatform { running: u32, found: u32 },
    #[error("minimum OS version {required} exceeds running OS version {running}")]
    MinOsTooHigh { required: u32, running: u32 },
    #[error("required dependency {0:?} could not be found or opened")]
    MissingDylib(String),
    #[error("dependent {name:?} current version {current} is below the required compatibility version {required}")]
    VersionMismatch {
        name: String,
        current: u32,
        required: u32,
    },
    #[error("filetype {0} is not one of dylib, bundle, or executable")]
    BadFiletype(u32),
}

/// Policy failures (§7 "Policy").
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("use of {0} is denied in a restricted process")]
    RestrictedPathVariable(&'static str),
    #[error("the sandbox denied {operation} on a path")]
    SandboxDenied { operation: &'static str },
    #[error("code signature is invalid or missing")]
    CodeSignatureInvalid,
}

/// Symbol-resolution failures (§7 "Symbol").
#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("non-weak import {symbol:?} from library ordinal {ordinal} could not be resolved")]
    MissingImport { symbol: String, ordinal: i32 },
    #[error("interposing target {0:?} was never bound")]
    InterposeTargetMissing(String),
    #[error("library ordinal {0} is out of range for the dependency table")]
    BadLibraryOrdinal(i32),
}

/// Errors raised while resolving a load-name to a concrete image, with the
/// full attempt log per §4.1 ("every phase's failure is recorded").
#[derive(Debug, Error)]
#[error("could not resolve {load_name:?}: tried {} candidate path(s)", attempts.len())]
pub struct ResolveError {
    pub load_name: String,
    pub attempts: Vec<ResolveAttempt>,
}

#[derive(Debug, Clone)]
pub struct ResolveAttempt {
    pub path: PathBuf,
    pub reason: AttemptFailure,
}

#[derive(Debug, Clone, Error)]
pub enum AttemptFailure {
    #[error("not found (errno {0})")]
    NotFound(i32),
    #[error("wrong architecture")]
    WrongArch,
    #[error("version mismatch")]
    VersionMismatch,
    #[error("denied by policy")]
    PolicyDenied,
    #[error("blocked by sandbox")]
    Sandboxed,
}

/// Segment-mapping failures (§4.3).
#[derive(Debug, Error)]
pub enum MapError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("a segment's preferred address range is already occupied")]
    AddressRangeOccupied,
    #[error("failed to reserve {size:#x} bytes of address space")]
    ReservationFailed { size: usize },
    #[error("mmap failed for segment {name:?}: {source}")]
    MmapFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox denied mmap of segment {0:?}")]
    SandboxDeniedMmap(String),
    #[error("code signature registration failed")]
    CodeSignatureRejected,
}

/// Fixup-engine failures (§4.4).
#[derive(Debug, Error)]
pub enum FixupError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    #[error("rebase opcode stream is malformed at byte offset {offset}")]
    BadRebaseOpcode { offset: usize },
    #[error("bind opcode stream is malformed at byte offset {offset}")]
    BadBindOpcode { offset: usize },
    #[error("chained fixup pointer at segment offset {offset:#x} has an unrecognized format")]
    BadChainedPointer { offset: u64 },
    #[error("rebase/bind location {offset:#x} lies outside every segment of the image")]
    LocationOutOfRange { offset: u64 },
    #[error("arithmetic overflow while applying slide {slide:#x} at offset {offset:#x}")]
    RebaseOverflow { offset: u64, slide: isize },
}

/// GC/dependency-graph failures (§4.5).
#[derive(Debug, Error)]
pub enum GcError {
    #[error("image {0:?} is still referenced and cannot be forcibly removed")]
    StillReferenced(ImageId),
    #[error("a terminator for image {0:?} requested garbage collection re-entrantly too many times")]
    TerminatorLoopSuspected(ImageId),
}

/// Initializer-scheduling failures (§4.6).
#[derive(Debug, Error)]
pub enum InitError {
    #[error("initializer for image {0:?} raised an exception")]
    InitializerThrew(ImageId),
    #[error("function pointer at {0:#x} does not lie within any executable segment of its image")]
    InitializerOutOfRange(u64),
}

/// Top-level error aggregating every subsystem, returned by the public
/// entry points in `loader.rs`.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Fixup(#[from] FixupError),
    #[error(transparent)]
    Gc(#[from] GcError),
    #[error(transparent)]
    Init(#[from] InitError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = LoaderError> = std::result::Result<T, E>;
