//! Kernel syscall seam (§4.3 step 4, §5).
//!
//! Everything that actually touches the VM system or the code-signing
//! kernel interface goes through [`PlatformOps`] so the rest of the
//! crate's tests can run on any host, wrapping raw `mach2`/`libc` calls
//! behind [`crate::error::MapError`] instead of letting `kern_return_t`
//! and `errno` leak everywhere.

use crate::error::MapError;
use crate::image::Permission;

/// One contiguous anonymous mapping backing a segment (§4.3 step 2-3).
pub trait PlatformOps: Send + Sync {
    /// Reserves `size` bytes of address space, optionally at a preferred
    /// address. Returns the actual base; implementations that cannot
    /// honor `preferred` are free to pick elsewhere unless
    /// `must_be_preferred` is set, in which case they must fail instead.
    fn reserve(&self, preferred: Option<u64>, size: usize, must_be_preferred: bool) -> Result<u64, MapError>;

    /// Maps `len` bytes of `file` at `file_offset` into the reservation
    /// at `addr`, with the given initial protection.
    fn map_file(
        &self,
        addr: u64,
        len: usize,
        file: &std::fs::File,
        file_offset: u64,
        prot: Permission,
    ) -> Result<(), MapError>;

    /// Backs `len` bytes at `addr` with zero-filled anonymous memory
    /// (§4.3 step 3 "zero-fill regions").
    fn map_zero_fill(&self, addr: u64, len: usize, prot: Permission) -> Result<(), MapError>;

    fn unmap(&self, addr: u64, len: usize);

    /// Registers the segment's code signature with the kernel before any
    /// executable page in it can be paged in (§4.3 step 4).
    fn register_code_signature(&self, file: &std::fs::File, blob_offset: u64, blob_size: u64) -> Result<(), MapError>;

    /// Distinguishes a sandbox-denied mmap from every other mmap failure
    /// (§4.3 "Failure semantics").
    fn is_sandbox_denied(&self, addr: u64, len: usize) -> bool;
}

#[cfg(target_os = "macos")]
pub use macos::MacPlatform;

#[cfg(target_os = "macos")]
mod macos {
    use super::*;
    use std::os::fd::AsRawFd;

    /// The real platform, backed by `mmap`/`mprotect` via `libc` and code
    /// signature registration via `mach2`'s task calls, mirroring how
    /// `mac::mach` wraps `kern_return_t` into [`crate::error::MapError`]-
    /// adjacent variants instead of raw ints.
    #[derive(Default)]
    pub struct MacPlatform;

    fn prot_bits(prot: Permission) -> i32 {
        let mut bits = libc::PROT_NONE;
        if prot.is_executable() {
            bits |= libc::PROT_READ | libc::PROT_EXEC;
        }
        match prot {
            Permission::ReadOnly | Permission::ReadExecute => bits |= libc::PROT_READ,
            Permission::ReadWrite | Permission::ReadWriteExecute => bits |= libc::PROT_READ | libc::PROT_WRITE,
            Permission::None => {}
        }
        bits
    }

    impl PlatformOps for MacPlatform {
        fn reserve(&self, preferred: Option<u64>, size: usize, must_be_preferred: bool) -> Result<u64, MapError> {
            // SAFETY: anonymous, unmapped reservation; no existing memory is aliased.
            let addr = unsafe {
                libc::mmap(
                    preferred.unwrap_or(0) as *mut libc::c_void,
                    size,
                    libc::PROT_NONE,
                    libc::MAP_ANON | libc::MAP_PRIVATE,
                    -1,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(MapError::ReservationFailed { size });
            }
            let actual = addr as u64;
            if must_be_preferred {
                if let Some(want) = preferred {
                    if actual != want {
                        // SAFETY: addr was just returned by mmap above.
                        unsafe {
                            libc::munmap(addr, size);
                        }
                        return Err(MapError::AddressRangeOccupied);
                    }
                }
            }
            Ok(actual)
        }

        fn map_file(
            &self,
            addr: u64,
            len: usize,
            file: &std::fs::File,
            file_offset: u64,
            prot: Permission,
        ) -> Result<(), MapError> {
            if len == 0 {
                return Ok(());
            }
            // SAFETY: `addr` was reserved by `reserve` and is large enough for `len`.
            let mapped = unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    len,
                    prot_bits(prot),
                    libc::MAP_PRIVATE | libc::MAP_FIXED,
                    file.as_raw_fd(),
                    file_offset as libc::off_t,
                )
            };
            if mapped == libc::MAP_FAILED {
                let err = std::io::Error::last_os_error();
                if self.is_sandbox_denied(addr, len) {
                    return Err(MapError::SandboxDeniedMmap(String::new()));
                }
                return Err(MapError::MmapFailed {
                    name: String::new(),
                    source: err,
                });
            }
            Ok(())
        }

        fn map_zero_fill(&self, addr: u64, len: usize, prot: Permission) -> Result<(), MapError> {
            if len == 0 {
                return Ok(());
            }
            // SAFETY: `addr` was reserved by `reserve` and is large enough for `len`.
            let mapped = unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    len,
                    prot_bits(prot),
                    libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                return Err(MapError::MmapFailed {
                    name: String::new(),
                    source: std::io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        fn unmap(&self, addr: u64, len: usize) {
            if len == 0 {
                return;
            }
            // SAFETY: `addr`/`len` describe a mapping previously created by this struct.
            unsafe {
                libc::munmap(addr as *mut libc::c_void, len);
            }
        }

        fn register_code_signature(&self, file: &std::fs::File, blob_offset: u64, blob_size: u64) -> Result<(), MapError> {
            let arg = libc::fsignatures_t {
                fs_file_start: 0,
                fs_blob_start: blob_offset as *mut libc::c_void,
                fs_blob_size: blob_size as libc::size_t,
            };
            // SAFETY: `arg` is a valid, fully initialized fsignatures_t for the duration of the call.
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADDFILESIGS_RETURN, &arg) };
            if rc == -1 {
                return Err(MapError::CodeSignatureRejected);
            }
            Ok(())
        }

        fn is_sandbox_denied(&self, _addr: u64, _len: usize) -> bool {
            std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
    }
}

/// In-memory fake used by unit/integration tests on every host: backs
/// every "mapping" with an ordinary heap buffer instead of real VM.
#[cfg(any(test, not(target_os = "macos")))]
pub struct FakePlatform {
    pub denied_ranges: parking_lot::Mutex<Vec<(u64, usize)>>,
}

#[cfg(any(test, not(target_os = "macos")))]
impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            denied_ranges: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(any(test, not(target_os = "macos")))]
impl PlatformOps for FakePlatform {
    fn reserve(&self, preferred: Option<u64>, size: usize, _must_be_preferred: bool) -> Result<u64, MapError> {
        if size == 0 {
            return Err(MapError::ReservationFailed { size });
        }
        Ok(preferred.unwrap_or(0x1000_0000))
    }

    fn map_file(
        &self,
        addr: u64,
        len: usize,
        _file: &std::fs::File,
        _file_offset: u64,
        _prot: Permission,
    ) -> Result<(), MapError> {
        if self.denied_ranges.lock().iter().any(|&(a, l)| a == addr && l == len) {
            return Err(MapError::SandboxDeniedMmap(String::new()));
        }
        Ok(())
    }

    fn map_zero_fill(&self, _addr: u64, _len: usize, _prot: Permission) -> Result<(), MapError> {
        Ok(())
    }

    fn unmap(&self, _addr: u64, _len: usize) {}

    fn register_code_signature(&self, _file: &std::fs::File, _blob_offset: u64, _blob_size: u64) -> Result<(), MapError> {
        Ok(())
    }

    fn is_sandbox_denied(&self, _addr: u64, _len: usize) -> bool {
        false
    }
}
