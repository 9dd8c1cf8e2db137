//! Permanent privilege drop.
//!
//! After the listening sockets are bound the server has no further use
//! for root. The drop is permanent: groups, gid and uid are all
//! replaced, in that order, so no path back to root remains.

use nix::unistd::{setgid, setgroups, setuid, Uid, User};
use thiserror::Error;

/// Privilege-drop failures; all fatal at startup.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    /// The drop target does not exist in the user database.
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    /// A system call failed.
    #[error("privilege drop failed: {0}")]
    Sys(#[from] nix::Error),
}

/// Permanently drops privileges to the given user.
///
/// A no-op when not running as root, so unprivileged development runs
/// keep working against non-default socket paths.
pub fn drop_privileges_permanent(username: &str) -> Result<(), PrivilegeError> {
    if !Uid::effective().is_root() {
        tracing::debug!("Not root; skipping privilege drop");
        return Ok(());
    }

    let user = User::from_name(username)?
        .ok_or_else(|| PrivilegeError::UnknownUser(username.to_string()))?;

    setgroups(&[user.gid])?;
    setgid(user.gid)?;
    setuid(user.uid)?;

    tracing::info!(user = username, uid = %user.uid, gid = %user.gid, "Privileges dropped permanently");
    Ok(())
}
