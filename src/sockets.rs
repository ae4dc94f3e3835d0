use std::io::{self, Write as _};
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::ptr;
use libc::{c_int, c_void, AF_INET, AF_UNIX, SOCK_STREAM, F_DUPFD, O_WRONLY};
use libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};

use crate::utils::check;

/// The one-byte payload of the pairwise rendezvous.
const READY_BYTE: u8 = b'1';

/// Creates the listening socket. `SO_LINGER` keeps a short drain window so a
/// clean shutdown can rebind the port immediately.
pub fn socket_bind(port: u16, backlog: i32) -> io::Result<RawFd> {
    let server: RawFd = check(unsafe { libc::socket(AF_INET, SOCK_STREAM, 0) })?;

    let opt: c_int = 1;
    set_option(server, libc::SOL_SOCKET, libc::SO_REUSEADDR, &opt)?;
    set_option(server, libc::IPPROTO_TCP, libc::TCP_NODELAY, &opt)?;

    let so_linger = libc::linger {
        l_onoff: 1,
        l_linger: 5,
    };
    set_option(server, libc::SOL_SOCKET, libc::SO_LINGER, &so_linger)?;

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();

    check(unsafe {
        libc::bind(
            server,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;
    check(unsafe { libc::listen(server, backlog) })?;

    Ok(server)
}

/// Polls the listener for 100 microseconds, then accepts. Returns `None` when
/// nothing is pending so the caller can interleave child bookkeeping.
pub fn socket_accept(server: RawFd) -> Option<RawFd> {
    let mut rfds: libc::fd_set = unsafe { mem::zeroed() };
    unsafe {
        libc::FD_ZERO(&mut rfds);
        libc::FD_SET(server, &mut rfds);
    }

    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 100,
    };
    let ready: c_int = unsafe {
        libc::select(server + 1, &mut rfds, ptr::null_mut(), ptr::null_mut(), &mut tv)
    };
    if ready <= 0 {
        return None;
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let connection: c_int = unsafe {
        libc::accept(
            server,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if connection < 0 {
        return None;
    }

    let peer_ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    println!("connection from: {}:{}", peer_ip, u16::from_be(addr.sin_port));
    let _ = io::stdout().flush();

    Some(connection)
}

/// Installs the accepted connection as stdin/stdout and parks the monitor's
/// own stdio just above the CB mesh range. Stderr goes to `/dev/null`, or to
/// the connection when `debug` keeps CB diagnostics client-visible. Returns
/// the saved stdio pair.
pub fn setup_connection(connection: RawFd, program_count: usize, debug: bool) -> io::Result<[RawFd; 2]> {
    let last_fd = (program_count * 2 + 3) as c_int;

    let saved_in: RawFd = check(unsafe { libc::fcntl(STDIN_FILENO, F_DUPFD, last_fd) })?;
    let saved_out: RawFd = check(unsafe { libc::fcntl(STDOUT_FILENO, F_DUPFD, last_fd + 1) })?;
    close_fd(STDIN_FILENO);
    close_fd(STDOUT_FILENO);

    close_fd(STDERR_FILENO);
    if debug {
        check(unsafe { libc::fcntl(connection, F_DUPFD, STDERR_FILENO) })?;
    } else {
        let dev_null: RawFd = check(unsafe { libc::open(c"/dev/null".as_ptr(), O_WRONLY) })?;
        check(unsafe { libc::fcntl(dev_null, F_DUPFD, STDERR_FILENO) })?;
        close_fd(dev_null);
    }

    check(unsafe { libc::fcntl(connection, F_DUPFD, STDIN_FILENO) })?;
    check(unsafe { libc::fcntl(connection, F_DUPFD, STDOUT_FILENO) })?;
    if connection > STDERR_FILENO {
        close_fd(connection);
    }

    Ok([saved_in, saved_out])
}

/// Wires the CB-to-CB mesh: one full-duplex socketpair per CB, landing on
/// descriptors `destination_fd + 2i` / `destination_fd + 2i + 1`. A single-CB
/// instance has no peers and gets no mesh.
pub fn setup_sockpairs(program_count: usize, destination_fd: c_int) -> io::Result<()> {
    if program_count <= 1 {
        return Ok(());
    }

    let mut destination_fd = destination_fd;
    for _ in 0..program_count {
        close_fd(destination_fd);
        close_fd(destination_fd + 1);

        let mut pair: [c_int; 2] = [0; 2];
        check(unsafe { libc::socketpair(AF_UNIX, SOCK_STREAM, 0, pair.as_mut_ptr()) })?;

        for end in pair {
            if end != destination_fd {
                check(unsafe { libc::fcntl(end, F_DUPFD, destination_fd) })?;
                close_fd(end);
            }
            destination_fd += 1;
        }
    }

    Ok(())
}

pub fn close_saved_sockets(saved: [RawFd; 2]) {
    close_fd(saved[0]);
    close_fd(saved[1]);
}

/// Puts the monitor's saved stdio back on descriptors 0 and 1 once the CBs
/// own the connection, so the final report reaches the original stdout.
pub fn reset_base_sockets(saved: [RawFd; 2]) -> io::Result<()> {
    close_fd(STDIN_FILENO);
    close_fd(STDOUT_FILENO);
    check(unsafe { libc::fcntl(saved[0], F_DUPFD, STDIN_FILENO) })?;
    check(unsafe { libc::fcntl(saved[1], F_DUPFD, STDOUT_FILENO) })?;

    Ok(())
}

pub fn setup_pairwise_wait() -> io::Result<[RawFd; 2]> {
    let mut pair: [c_int; 2] = [0; 2];
    check(unsafe { libc::socketpair(AF_UNIX, SOCK_STREAM, 0, pair.as_mut_ptr()) })?;

    Ok(pair)
}

/// Signals the peer side of a rendezvous pair. Consumes both descriptors.
pub fn ready_pairwise(pair: [RawFd; 2]) -> io::Result<()> {
    close_fd(pair[1]);

    let byte: u8 = READY_BYTE;
    let written = unsafe { libc::write(pair[0], &byte as *const u8 as *const c_void, 1) };
    if written != 1 {
        return Err(io::Error::last_os_error());
    }
    close_fd(pair[0]);

    Ok(())
}

/// Blocks until the peer signals ready. Consumes both descriptors. Anything
/// other than the ready byte means the peer died mid-handshake.
pub fn wait_pairwise(pair: [RawFd; 2]) -> io::Result<()> {
    close_fd(pair[0]);

    let mut byte: u8 = 0;
    let read = unsafe { libc::read(pair[1], &mut byte as *mut u8 as *mut c_void, 1) };
    if read != 1 || byte != READY_BYTE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "rendezvous byte missing",
        ));
    }
    close_fd(pair[1]);

    Ok(())
}

pub fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

fn set_option<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    check(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dup(fd: RawFd) -> RawFd {
        check(unsafe { libc::dup(fd) }).unwrap()
    }

    #[test]
    fn test_socket_bind_returns_a_listening_fd() {
        // GIVEN an ephemeral port
        // WHEN
        let server: RawFd = socket_bind(0, 4).unwrap();
        // THEN
        assert!(server >= 0);
        close_fd(server);
    }

    #[test]
    fn test_rendezvous_handshake_delivers_the_ready_byte() {
        // GIVEN a pair plus a second descriptor table standing in for the peer
        let pair: [RawFd; 2] = setup_pairwise_wait().unwrap();
        let peer: [RawFd; 2] = [dup(pair[0]), dup(pair[1])];
        // WHEN the peer signals first
        ready_pairwise(peer).unwrap();
        // THEN the waiting side observes the byte
        assert!(wait_pairwise(pair).is_ok());
    }

    #[test]
    fn test_wait_pairwise_fails_on_peer_death() {
        // GIVEN a pair whose write side is gone without signalling
        let pair: [RawFd; 2] = setup_pairwise_wait().unwrap();
        // WHEN / THEN: closing pair[0] inside wait_pairwise leaves the read
        // side at EOF, which must not pass for a rendezvous
        assert!(wait_pairwise(pair).is_err());
    }

    #[test]
    fn test_wait_pairwise_rejects_a_wrong_byte() {
        // GIVEN
        let pair: [RawFd; 2] = setup_pairwise_wait().unwrap();
        let peer: [RawFd; 2] = [dup(pair[0]), dup(pair[1])];
        let byte: u8 = b'2';
        // WHEN
        let written = unsafe { libc::write(peer[0], &byte as *const u8 as *const c_void, 1) };
        assert_eq!(written, 1);
        close_fd(peer[0]);
        close_fd(peer[1]);
        // THEN
        assert!(wait_pairwise(pair).is_err());
    }
}
