use std::ffi::{CStr, CString};
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::net::TcpStream;
use std::os::fd::{FromRawFd as _, RawFd};
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::ptr;
use libc::c_char;
use tracing::instrument;

use crate::core::{ServerConfig, UidPolicy};
use crate::privileges::{drop_privileges, get_unused_gid, get_unused_uid, home_directory_of, setup_chroot};
use crate::resources::{set_cb_resources, set_core_size, set_timeout};
use crate::sandbox::setup_sandbox;
use crate::signals;
use crate::sockets::{
    close_saved_sockets, ready_pairwise, reset_base_sockets, setup_connection, setup_pairwise_wait,
    setup_sockpairs, wait_pairwise,
};
use crate::utils::{get_prng_seed, is_executable, print_filesizes, set_prng_seed, to_hex};

const RECORD_SEED: u32 = 1;
const RECORD_SOURCE_ID: u32 = 2;
const RECORD_HASH: u32 = 4;
const NEGOTIATE_ACK: u32 = 1;

/// Drives one service instance inside the post-accept child. Never returns:
/// the monitor exits carrying the instance verdict.
pub fn run_instance(config: &ServerConfig, connection: RawFd) -> ! {
    match monitor_instance(config, connection) {
        Ok(verdict) => finish(verdict),
        Err(e) => {
            tracing::error!("service instance failed: {}", e);
            unsafe { libc::_exit(-1) };
        }
    }
}

#[instrument(name = "monitor", skip_all, fields(pid = unsafe { libc::getpid() }))]
fn monitor_instance(config: &ServerConfig, connection: RawFd) -> io::Result<i32> {
    signals::mark_monitor_process();

    let negotiated: Option<String> = negotiate(connection, config.negotiate)?;
    let seed: String = match negotiated.or_else(|| config.seed.clone()) {
        Some(seed) => seed,
        None => get_prng_seed()?,
    };

    let (uid, gid, home) = resolve_identity(config)?;

    print_filesizes(&config.programs)?;
    drop_privileges(uid, gid, home.as_deref(), config.insecure)?;

    let count: usize = config.programs.len();
    let saved: [RawFd; 2] = setup_connection(connection, count, config.debug)?;
    setup_sockpairs(count, 3)?;
    setup_sandbox(config.insecure)?;

    signals::set_num_children(count);
    signals::zero_perf_stats(count);

    for program in &config.programs {
        launch(config, program, &seed, saved)?;
    }

    reset_base_sockets(saved)?;

    while signals::num_children() > 0 {
        signals::wait_for_signal();
    }

    signals::show_perf_stats();
    Ok(signals::exit_val())
}

/// Identity and jail for this instance, per the configured policy.
fn resolve_identity(config: &ServerConfig) -> io::Result<(libc::uid_t, libc::gid_t, Option<PathBuf>)> {
    match &config.uid_policy {
        UidPolicy::RandomUnused { directory } => {
            let uid = get_unused_uid()?;
            let gid = get_unused_gid()?;
            setup_chroot(directory, config.insecure)?;
            Ok((uid, gid, None))
        }
        UidPolicy::Fixed { uid, gid } => {
            let home = if config.insecure {
                None
            } else {
                Some(home_directory_of(*uid)?)
            };
            Ok((*uid, *gid, home))
        }
    }
}

/// Forks one CB and sequences its launch: the CB parks at the rendezvous
/// until the monitor has attached the tracer and armed the perf counters, so
/// no user instruction ever runs unobserved.
fn launch(config: &ServerConfig, program: &Path, seed: &str, saved: [RawFd; 2]) -> io::Result<()> {
    let gate_ready = setup_pairwise_wait()?;
    let gate_release = setup_pairwise_wait()?;

    match unsafe { libc::fork() } {
        0 => {
            let result = ready_pairwise(gate_ready)
                .and_then(|()| wait_pairwise(gate_release))
                .and_then(|()| {
                    close_saved_sockets(saved);
                    set_cb_resources(config.wrapper.is_some())
                })
                .and_then(|()| start_program(config, program, seed));

            // only reachable when setup or execve failed
            if let Err(e) = result {
                tracing::error!("unable to start {}: {}", program.display(), e);
            }
            unsafe { libc::_exit(-1) };
        }
        pid if pid > 0 => {
            wait_pairwise(gate_ready)?;

            let traced = config.wrapper.is_none() && !config.debug;
            if traced {
                signals::setup_ptrace(pid)?;
            }
            signals::setup_counters(pid)?;
            ready_pairwise(gate_release)?;
            if traced {
                signals::continue_ptrace(pid)?;
            }

            Ok(())
        }
        _ => Err(io::Error::last_os_error()),
    }
}

/// Final stretch of the CB side: arm the alarm, restore default signal
/// dispositions and `execve` the CB (or its wrapper).
fn start_program(config: &ServerConfig, program: &Path, seed: &str) -> io::Result<()> {
    set_timeout(config.timeout);
    signals::unsetup_signals()?;

    tracing::debug!(
        pid = unsafe { libc::getpid() },
        executable = is_executable(program),
        program = %program.display(),
        "launching",
    );

    let argv = build_argv(
        program,
        seed,
        config.skip_rng.as_deref(),
        config.max_transmit.as_deref(),
        config.max_receive.as_deref(),
    )?;
    let target: CString = match &config.wrapper {
        Some(wrapper) => path_cstring(wrapper)?,
        None => path_cstring(program)?,
    };

    exec(&target, &argv)
}

/// The launch argv: the program twice, then the seed, then the optional
/// cells. The vector stops at the first absent cell, matching what a
/// NULL-terminated argv would have carried.
fn build_argv(
    program: &Path,
    seed: &str,
    skip_rng: Option<&str>,
    max_transmit: Option<&str>,
    max_receive: Option<&str>,
) -> io::Result<Vec<CString>> {
    let mut argv: Vec<CString> = vec![
        path_cstring(program)?,
        path_cstring(program)?,
        text_cstring(seed)?,
    ];

    for cell in [skip_rng, max_transmit, max_receive] {
        match cell {
            Some(value) => argv.push(text_cstring(value)?),
            None => break,
        }
    }

    Ok(argv)
}

fn exec(target: &CStr, argv: &[CString]) -> io::Result<()> {
    let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|cell| cell.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    let envp: [*const c_char; 1] = [ptr::null()];

    unsafe { libc::execve(target.as_ptr(), argv_ptrs.as_ptr(), envp.as_ptr()) };
    Err(io::Error::last_os_error())
}

fn finish(verdict: i32) -> ! {
    if verdict < 0 {
        let _ = signals::unsetup_signals();
        let _ = set_core_size(0);
        unsafe {
            libc::raise(-verdict);
            libc::pause();
        }
    }
    unsafe { libc::_exit(verdict) };
}

/// Pre-launch negotiation over the accepted connection. Returns the seed
/// argv cell when the client supplied one.
fn negotiate(connection: RawFd, enabled: bool) -> io::Result<Option<String>> {
    if !enabled {
        return Ok(None);
    }

    // the connection stays owned by the caller; it is dup'd into the CB
    // stdio table later
    let mut stream = ManuallyDrop::new(unsafe { TcpStream::from_raw_fd(connection) });
    negotiate_records(&mut *stream)
}

/// Reads the record stream and acknowledges it:
///
/// | record count (u32) | { type (u32) | size (u32) | payload } ... |
///
/// All fields little-endian. An unknown record type aborts the instance.
fn negotiate_records<S: Read + Write>(stream: &mut S) -> io::Result<Option<String>> {
    let record_count: u32 = read_u32(stream)?;
    let mut seed: Option<String> = None;

    for _ in 0..record_count {
        let record_type: u32 = read_u32(stream)?;
        let record_size: u32 = read_u32(stream)?;
        let payload: Vec<u8> = read_record(stream, record_size as usize)?;

        match record_type {
            RECORD_SEED => seed = Some(set_prng_seed(&payload)),
            RECORD_SOURCE_ID => println!("source identifier: {}", to_hex(&payload)),
            RECORD_HASH => println!("hash: {}", to_hex(&payload)),
            unsupported => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported record type {}", unsupported),
                ));
            }
        }
    }

    stream.write_all(&NEGOTIATE_ACK.to_le_bytes())?;
    Ok(seed)
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf: [u8; 4] = [0; 4];
    reader.read_exact(&mut buf)?;

    Ok(u32::from_le_bytes(buf))
}

fn read_record(reader: &mut impl Read, size: usize) -> io::Result<Vec<u8>> {
    let mut payload: Vec<u8> = vec![0; size];
    reader.read_exact(&mut payload)?;

    Ok(payload)
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

fn text_cstring(text: &str) -> io::Result<CString> {
    CString::new(text)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "argv cell contains a NUL byte"))
}
