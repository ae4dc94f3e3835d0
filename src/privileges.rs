use std::ffi::{CStr, CString};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::ptr;
use libc::{gid_t, uid_t};

use crate::utils::{check, get_random};

/// Upper bound on random draws when hunting for an unused identity.
const MAX_IDENTITY_DRAWS: u32 = 1000;

/// Moves the process into the service jail. In insecure mode only the
/// directory change happens, so unprivileged runs keep working.
pub fn setup_chroot(directory: &Path, insecure: bool) -> io::Result<()> {
    let dir: CString = path_cstring(directory)?;
    check(unsafe { libc::chdir(dir.as_ptr()) })?;

    if insecure {
        return Ok(());
    }

    check(unsafe { libc::chroot(dir.as_ptr()) })?;
    check(unsafe { libc::chdir(c"/".as_ptr()) })?;

    Ok(())
}

/// Draws random uids until one misses the passwd database.
pub fn get_unused_uid() -> io::Result<uid_t> {
    let mut raw: [u8; 4] = [0; 4];

    for _ in 0..=MAX_IDENTITY_DRAWS {
        get_random(&mut raw)?;
        let uid = uid_t::from_ne_bytes(raw);

        if !passwd_entry_exists(uid) {
            return Ok(uid);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::Other,
        "unable to find an unused uid",
    ))
}

/// Draws random gids until one misses the group database.
pub fn get_unused_gid() -> io::Result<gid_t> {
    let mut raw: [u8; 4] = [0; 4];

    for _ in 0..=MAX_IDENTITY_DRAWS {
        get_random(&mut raw)?;
        let gid = gid_t::from_ne_bytes(raw);

        if !group_entry_exists(gid) {
            return Ok(gid);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::Other,
        "unable to find an unused gid",
    ))
}

/// Home directory of a fixed-identity uid; the instance chroots into it.
pub fn home_directory_of(uid: uid_t) -> io::Result<PathBuf> {
    let mut pwd: MaybeUninit<libc::passwd> = MaybeUninit::uninit();
    let mut buf: [libc::c_char; 4096] = [0; 4096];
    let mut result: *mut libc::passwd = ptr::null_mut();

    let rc = unsafe {
        libc::getpwuid_r(uid, pwd.as_mut_ptr(), buf.as_mut_ptr(), buf.len(), &mut result)
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    if result.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no passwd entry for uid {}", uid),
        ));
    }

    let home: &CStr = unsafe { CStr::from_ptr((*result).pw_dir) };
    Ok(PathBuf::from(std::ffi::OsStr::from_bytes(home.to_bytes())))
}

/// Hard gate between supervisor and CB identity. Every step must succeed and
/// the final real/effective/saved triples must equal the target, otherwise
/// the instance is unlaunchable.
pub fn drop_privileges(uid: uid_t, gid: gid_t, home: Option<&Path>, insecure: bool) -> io::Result<()> {
    check(unsafe { libc::setsid() })?;

    if insecure {
        return Ok(());
    }

    if let Some(home) = home {
        setup_chroot(home, false)?;
    }

    check(unsafe { libc::setresgid(gid, gid, gid) })?;
    check(unsafe { libc::setgroups(1, &gid) })?;
    check(unsafe { libc::setgid(gid) })?;
    check(unsafe { libc::setegid(gid) })?;
    check(unsafe { libc::setresuid(uid, uid, uid) })?;
    check(unsafe { libc::setuid(uid) })?;
    check(unsafe { libc::seteuid(uid) })?;

    assert_identity(uid, gid)
}

fn assert_identity(uid: uid_t, gid: gid_t) -> io::Result<()> {
    let mut real: uid_t = 0;
    let mut effective: uid_t = 0;
    let mut saved: uid_t = 0;
    check(unsafe { libc::getresuid(&mut real, &mut effective, &mut saved) })?;
    if [real, effective, saved] != [uid, uid, uid] {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "uid drop left a mismatched identity",
        ));
    }

    let mut real: gid_t = 0;
    let mut effective: gid_t = 0;
    let mut saved: gid_t = 0;
    check(unsafe { libc::getresgid(&mut real, &mut effective, &mut saved) })?;
    if [real, effective, saved] != [gid, gid, gid] {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "gid drop left a mismatched identity",
        ));
    }

    Ok(())
}

fn passwd_entry_exists(uid: uid_t) -> bool {
    let mut pwd: MaybeUninit<libc::passwd> = MaybeUninit::uninit();
    let mut buf: [libc::c_char; 4096] = [0; 4096];
    let mut result: *mut libc::passwd = ptr::null_mut();

    unsafe {
        libc::getpwuid_r(uid, pwd.as_mut_ptr(), buf.as_mut_ptr(), buf.len(), &mut result)
    };
    !result.is_null()
}

fn group_entry_exists(gid: gid_t) -> bool {
    let mut group: MaybeUninit<libc::group> = MaybeUninit::uninit();
    let mut buf: [libc::c_char; 4096] = [0; 4096];
    let mut result: *mut libc::group = ptr::null_mut();

    unsafe {
        libc::getgrgid_r(gid, group.as_mut_ptr(), buf.as_mut_ptr(), buf.len(), &mut result)
    };
    !result.is_null()
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}
