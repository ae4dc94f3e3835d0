use std::io;

use crate::utils::check;

/// Address-space cap for a directly launched CB.
const CB_ADDRESS_SPACE: u64 = 1 << 30;
/// Address-space cap when a wrapper is interposed; the wrapper's own runtime
/// needs headroom on top of the CB's.
const WRAPPED_ADDRESS_SPACE: u64 = 2 << 30;
/// CPU-seconds budget for one CB.
const CB_CPU_SECONDS: u64 = 60;
/// Largest file a CB may create.
const CB_FILE_SIZE: u64 = 16 << 20;

/// Arms the wall-clock alarm for the calling process. The monitor has already
/// called `setsid`, so the whole CB group shares the same budget.
pub fn set_timeout(seconds: u32) {
    if seconds != 0 {
        unsafe { libc::alarm(seconds) };
    }
}

pub fn set_core_size(bytes: u64) -> io::Result<()> {
    set_rlimit(libc::RLIMIT_CORE, bytes)
}

/// Caps address space, CPU time and file size before `execve`.
pub fn set_cb_resources(wrapped: bool) -> io::Result<()> {
    let address_space = if wrapped {
        WRAPPED_ADDRESS_SPACE
    } else {
        CB_ADDRESS_SPACE
    };

    set_rlimit(libc::RLIMIT_AS, address_space)?;
    set_rlimit(libc::RLIMIT_CPU, CB_CPU_SECONDS)?;
    set_rlimit(libc::RLIMIT_FSIZE, CB_FILE_SIZE)?;

    Ok(())
}

fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    check(unsafe { libc::setrlimit(resource, &rlim) })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_core_size_applies_both_bounds() {
        // GIVEN
        set_core_size(0).unwrap();
        // WHEN
        let mut rlim = libc::rlimit {
            rlim_cur: u64::MAX,
            rlim_max: u64::MAX,
        };
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_CORE, &mut rlim) };
        // THEN
        assert_eq!(rc, 0);
        assert_eq!(rlim.rlim_cur, 0);
        assert_eq!(rlim.rlim_max, 0);
    }
}
