//! Shared-memory status segment and readiness semaphore.
//!
//! Local monitors read the daemon state without an RPC round trip: a
//! small fixed-layout POSIX shared memory segment mirrors the seeding
//! state, and a named semaphore is posted whenever the segment changes.
//! The server creates both; the reaper removes them after the server
//! exits.

use std::ffi::CString;
use std::io;

use thiserror::Error;

use crate::drng::StatusSnapshot;

/// POSIX shared memory name of the status segment.
pub const SHM_NAME: &str = "/esdm-status";

/// POSIX named semaphore posted on status updates.
pub const SEM_NAME: &str = "/esdm-sem";

/// Fixed wire layout of the status segment.
#[repr(C)]
struct RawStatus {
    operational: u8,
    fully_seeded: u8,
    sp80090c: u8,
    _pad: u8,
    avail_entropy: u32,
    generation: u64,
}

/// Status segment setup failures.
#[derive(Debug, Error)]
pub enum StatusShmError {
    /// Creating or mapping the shared memory segment failed.
    #[error("shared memory setup failed: {0}")]
    Shm(io::Error),
    /// Creating the named semaphore failed.
    #[error("semaphore setup failed: {0}")]
    Sem(io::Error),
}

fn c_name(name: &str) -> Result<CString, io::Error> {
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL"))
}

/// The mapped status segment plus its semaphore.
pub struct StatusShm {
    status: *mut RawStatus,
    sem: *mut libc::sem_t,
}

// The raw pointers reference process-global mappings that live until
// drop; all mutation goes through `update` with volatile accesses.
#[allow(unsafe_code)]
unsafe impl Send for StatusShm {}
#[allow(unsafe_code)]
unsafe impl Sync for StatusShm {}

impl StatusShm {
    /// Creates and maps the status segment and semaphore.
    pub fn create() -> Result<Self, StatusShmError> {
        Self::create_named(SHM_NAME, SEM_NAME)
    }

    #[allow(unsafe_code)]
    fn create_named(shm_name: &str, sem_name: &str) -> Result<Self, StatusShmError> {
        let shm = c_name(shm_name).map_err(StatusShmError::Shm)?;
        let sem = c_name(sem_name).map_err(StatusShmError::Sem)?;
        let size = std::mem::size_of::<RawStatus>();

        let fd = unsafe { libc::shm_open(shm.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o644) };
        if fd < 0 {
            return Err(StatusShmError::Shm(io::Error::last_os_error()));
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(StatusShmError::Shm(err));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(StatusShmError::Shm(io::Error::last_os_error()));
        }

        let sem_ptr = unsafe {
            libc::sem_open(sem.as_ptr(), libc::O_CREAT, 0o644 as libc::mode_t, 0u32)
        };
        if sem_ptr == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(ptr, size) };
            return Err(StatusShmError::Sem(err));
        }

        tracing::info!(shm = shm_name, sem = sem_name, "Status segment created");

        Ok(Self {
            status: ptr as *mut RawStatus,
            sem: sem_ptr,
        })
    }

    /// Mirrors a status snapshot into the segment.
    ///
    /// The semaphore is posted only when the visible state changed.
    #[allow(unsafe_code)]
    pub fn update(&self, snapshot: &StatusSnapshot) {
        let next = RawStatus {
            operational: u8::from(snapshot.operational),
            fully_seeded: u8::from(snapshot.fully_seeded),
            sp80090c: u8::from(snapshot.sp80090c),
            _pad: 0,
            avail_entropy: snapshot.avail_entropy_bits,
            generation: snapshot.generation,
        };

        let changed = unsafe {
            let current = std::ptr::read_volatile(self.status);
            current.operational != next.operational
                || current.fully_seeded != next.fully_seeded
                || current.sp80090c != next.sp80090c
                || current.avail_entropy != next.avail_entropy
                || current.generation != next.generation
        };

        if changed {
            unsafe {
                std::ptr::write_volatile(self.status, next);
                libc::sem_post(self.sem);
            }
        }
    }

    #[cfg(test)]
    #[allow(unsafe_code)]
    fn read_back(&self) -> (u8, u8, u8, u32, u64) {
        let raw = unsafe { std::ptr::read_volatile(self.status) };
        (
            raw.operational,
            raw.fully_seeded,
            raw.sp80090c,
            raw.avail_entropy,
            raw.generation,
        )
    }
}

impl Drop for StatusShm {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.status as *mut libc::c_void, std::mem::size_of::<RawStatus>());
            libc::sem_close(self.sem);
        }
    }
}

/// Unlinks the status segment and semaphore.
///
/// Cleanup failures are logged, never fatal: a missing object just means
/// the server never got far enough to create it.
#[allow(unsafe_code)]
pub fn remove() {
    remove_named(SHM_NAME, SEM_NAME);
}

#[allow(unsafe_code)]
fn remove_named(shm_name: &str, sem_name: &str) {
    if let Ok(name) = c_name(shm_name) {
        if unsafe { libc::shm_unlink(name.as_ptr()) } < 0 {
            tracing::warn!(
                shm = shm_name,
                err = %io::Error::last_os_error(),
                "Status segment removal failed"
            );
        } else {
            tracing::debug!(shm = shm_name, "Status segment removed");
        }
    }

    if let Ok(name) = c_name(sem_name) {
        if unsafe { libc::sem_unlink(name.as_ptr()) } < 0 {
            tracing::warn!(
                sem = sem_name,
                err = %io::Error::last_os_error(),
                "Semaphore removal failed"
            );
        } else {
            tracing::debug!(sem = sem_name, "Semaphore removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_roundtrip() {
        let shm_name = "/esdm-test-status";
        let sem_name = "/esdm-test-sem";

        let Ok(shm) = StatusShm::create_named(shm_name, sem_name) else {
            // Shared memory may be unavailable in minimal environments.
            return;
        };

        let snapshot = StatusSnapshot {
            operational: true,
            fully_seeded: true,
            sp80090c: false,
            avail_entropy_bits: 512,
            generation: 3,
            ..StatusSnapshot::default()
        };
        shm.update(&snapshot);

        assert_eq!(shm.read_back(), (1, 1, 0, 512, 3));

        drop(shm);
        remove_named(shm_name, sem_name);
    }

    #[test]
    fn test_layout_is_16_bytes() {
        assert_eq!(std::mem::size_of::<RawStatus>(), 16);
    }
}
