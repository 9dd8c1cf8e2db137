//! Daemon process plumbing.
//!
//! The server starts as root, binds the privileged socket, forks into a
//! retained-privilege reaper and the actual server process, drops
//! privileges permanently and publishes its state through a shared
//! memory segment with a readiness semaphore.

mod fips;
mod privileges;
mod reaper;
mod status;

pub use fips::{fips_enabled, sp80090c_requested};
pub use privileges::{drop_privileges_permanent, PrivilegeError};
pub use reaper::{run_with_reaper, ReaperError};
pub use status::{remove as remove_status, StatusShm, StatusShmError, SEM_NAME, SHM_NAME};
