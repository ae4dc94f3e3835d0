//! Syscall-filter activation point.
//!
//! The filter profile itself ships with the deployment and is layered on by
//! the launch wrapper; what the supervisor owns is the no-new-privileges
//! fence every profile relies on. Insecure runs skip the fence entirely.

use std::io;

use crate::utils::check;

pub fn setup_sandbox(insecure: bool) -> io::Result<()> {
    if insecure {
        return Ok(());
    }

    check(unsafe {
        libc::prctl(
            libc::PR_SET_NO_NEW_PRIVS,
            1 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    })?;

    Ok(())
}
