use std::fmt::Write as _;
use std::io::{self, Write as _};
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use libc::{c_int, pid_t};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use perf_event_open_sys as perf;

use crate::utils::check;

/// CBs forked but not yet reaped, in the current process. The parent counts
/// monitors; each monitor counts its own CBs.
static NUM_CHILDREN: AtomicUsize = AtomicUsize::new(0);

/// Instance verdict: 0 success, positive the first non-zero exit code,
/// negative the negated first fatal signal. Written only while `SIGCHLD` is
/// being handled.
static EXIT_VAL: AtomicI32 = AtomicI32::new(0);

/// Gates the per-CB report lines; the acceptor reaps monitors silently.
static MONITOR_PROCESS: AtomicBool = AtomicBool::new(false);

/// Accounting book of the live instance, installed by `zero_perf_stats`.
/// Null in the acceptor, which tracks no telemetry.
static PERF_BOOK: AtomicPtr<PerfBook> = AtomicPtr::new(ptr::null_mut());

pub fn num_children() -> usize {
    NUM_CHILDREN.load(Ordering::Relaxed)
}

pub fn set_num_children(count: usize) {
    NUM_CHILDREN.store(count, Ordering::Relaxed);
}

pub fn add_child() {
    NUM_CHILDREN.fetch_add(1, Ordering::Relaxed);
}

pub fn exit_val() -> i32 {
    EXIT_VAL.load(Ordering::Relaxed)
}

pub fn reset_exit_val() {
    EXIT_VAL.store(0, Ordering::Relaxed);
}

pub fn mark_monitor_process() {
    MONITOR_PROCESS.store(true, Ordering::Relaxed);
}

/// Telemetry summed over every CB of one instance.
pub struct PerfBook {
    nkids: u64,
    maxrss: i64,
    minflt: i64,
    utime_sec: i64,
    utime_usec: i64,
    cpu_clock: u64,
    task_clock: u64,
    counters: Vec<Counter>,
}

struct Counter {
    pid: pid_t,
    fd: RawFd,
    kind: CounterKind,
}

#[derive(Clone, Copy)]
enum CounterKind {
    CpuClock,
    TaskClock,
}

impl PerfBook {
    fn new(capacity: usize) -> Self {
        Self {
            nkids: 0,
            maxrss: 0,
            minflt: 0,
            utime_sec: 0,
            utime_usec: 0,
            cpu_clock: 0,
            task_clock: 0,
            counters: Vec::with_capacity(capacity),
        }
    }

    fn fold_rusage(&mut self, rusage: &libc::rusage) {
        self.minflt += rusage.ru_minflt;
        self.maxrss += rusage.ru_maxrss;
        self.utime_sec += rusage.ru_utime.tv_sec;
        self.utime_usec += rusage.ru_utime.tv_usec;
        while self.utime_usec >= 1_000_000 {
            self.utime_sec += 1;
            self.utime_usec -= 1_000_000;
        }
        self.nkids += 1;
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "total children: {}", self.nkids);
        let _ = writeln!(out, "total maxrss {}", self.maxrss);
        let _ = writeln!(out, "total minflt {}", self.minflt);
        let _ = writeln!(out, "total utime {}.{:06}", self.utime_sec, self.utime_usec);
        let _ = writeln!(out, "total sw-cpu-clock {}", self.cpu_clock);
        let _ = writeln!(out, "total sw-task-clock {}", self.task_clock);
        out
    }
}

// The book is only ever touched with SIGCHLD blocked: the handler masks
// itself, and every mainline caller runs under the process-wide block from
// setup_signals. That exclusion is what makes the &mut sound.
fn with_book<R>(f: impl FnOnce(&mut PerfBook) -> R) -> Option<R> {
    let book = PERF_BOOK.load(Ordering::Acquire);
    if book.is_null() {
        None
    } else {
        Some(f(unsafe { &mut *book }))
    }
}

/// Installs a zeroed accounting book sized for `nprocs` CBs. The book lives
/// until the monitor exits.
pub fn zero_perf_stats(nprocs: usize) {
    let book = Box::new(PerfBook::new(nprocs * 2));
    PERF_BOOK.store(Box::into_raw(book), Ordering::Release);
}

/// Prints the instance totals to the restored stdout.
pub fn show_perf_stats() {
    if let Some(report) = with_book(|book| book.render()) {
        print!("{}", report);
        let _ = io::stdout().flush();
    }
}

/// Opens the two software clocks for one CB, grouped on the first descriptor.
/// `enable_on_exec` keeps them dormant until the CB leaves the supervisor's
/// code path.
pub fn setup_counters(pid: pid_t) -> io::Result<()> {
    let mut group_fd: RawFd = -1;

    for kind in [CounterKind::CpuClock, CounterKind::TaskClock] {
        let fd = make_counter(kind, pid, group_fd)?;
        if group_fd == -1 {
            group_fd = fd;
        }
        with_book(|book| book.counters.push(Counter { pid, fd, kind }));
    }

    Ok(())
}

fn make_counter(kind: CounterKind, pid: pid_t, group_fd: RawFd) -> io::Result<RawFd> {
    let mut attr = perf::bindings::perf_event_attr::default();
    attr.type_ = perf::bindings::PERF_TYPE_SOFTWARE;
    attr.size = mem::size_of::<perf::bindings::perf_event_attr>() as u32;
    attr.config = match kind {
        CounterKind::CpuClock => perf::bindings::PERF_COUNT_SW_CPU_CLOCK as u64,
        CounterKind::TaskClock => perf::bindings::PERF_COUNT_SW_TASK_CLOCK as u64,
    };
    attr.set_disabled(1);
    attr.set_exclude_idle(1);
    attr.set_exclude_kernel(1);
    attr.set_exclude_hv(1);
    attr.set_enable_on_exec(1);

    let fd = unsafe {
        perf::perf_event_open(
            &mut attr,
            pid,
            -1,
            group_fd,
            perf::bindings::PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
        )
    };
    check(fd)
}

fn read_counters(pid: pid_t) {
    with_book(|book| {
        let mut cpu_clock: u64 = 0;
        let mut task_clock: u64 = 0;

        for counter in &book.counters {
            if counter.pid != pid {
                continue;
            }
            let mut value: u64 = 0;
            let read = unsafe {
                libc::read(counter.fd, &mut value as *mut u64 as *mut libc::c_void, 8)
            };
            if read != 8 {
                continue;
            }
            match counter.kind {
                CounterKind::CpuClock => cpu_clock += value,
                CounterKind::TaskClock => task_clock += value,
            }
        }

        book.cpu_clock += cpu_clock;
        book.task_clock += task_clock;
    });
}

/// Installs the handler set: `SIGCHLD` reaping (blocked outside the explicit
/// wait points), `SIGTERM` immediate exit, `SIGPIPE`/`SIGUSR1` ignored.
pub fn setup_signals() -> io::Result<()> {
    unsafe {
        let mut blocked: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut blocked);
        libc::sigaddset(&mut blocked, libc::SIGCHLD);

        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = sigchld as extern "C" fn(c_int) as usize;
        action.sa_mask = blocked;
        action.sa_flags = 0;
        check(libc::sigaction(libc::SIGCHLD, &action, ptr::null_mut()))?;

        check(libc::sigprocmask(libc::SIG_BLOCK, &blocked, ptr::null_mut()))?;

        let mut term: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut term.sa_mask);
        term.sa_sigaction = sigterm as extern "C" fn(c_int) as usize;
        term.sa_flags = 0;
        check(libc::sigaction(libc::SIGTERM, &term, ptr::null_mut()))?;

        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        if libc::signal(libc::SIGUSR1, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

/// Restores default dispositions, for CBs about to `execve` and for the final
/// re-raise of a fatal verdict.
pub fn unsetup_signals() -> io::Result<()> {
    for sig in [libc::SIGCHLD, libc::SIGTERM, libc::SIGPIPE, libc::SIGUSR1] {
        if unsafe { libc::signal(sig, libc::SIG_DFL) } == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

/// Briefly opens the `SIGCHLD` mask so anything delivered while blocked is
/// handled now.
pub fn handle_blocked_children() {
    unsafe {
        let mut blocked: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut blocked);
        libc::sigaddset(&mut blocked, libc::SIGCHLD);
        libc::sigprocmask(libc::SIG_UNBLOCK, &blocked, ptr::null_mut());
        libc::sigprocmask(libc::SIG_BLOCK, &blocked, ptr::null_mut());
    }
}

/// Suspends until any signal arrives. When the instance already has a fatal
/// verdict, the whole process group is nudged with `SIGUSR1` first so CBs
/// parked in blocking I/O exit promptly.
pub fn wait_for_signal() {
    if exit_val() < 0 {
        unsafe { libc::kill(-libc::getpid(), libc::SIGUSR1) };
    }

    unsafe {
        let mut empty: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigsuspend(&empty);
    }
}

/// Attaches to a CB parked at the launch rendezvous, swallowing the attach
/// `SIGSTOP` so the CB is running (and still parked) when the gate opens.
pub fn setup_ptrace(pid: pid_t) -> io::Result<()> {
    ptrace::attach(Pid::from_raw(pid)).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    expect_stop(pid, libc::SIGSTOP)?;
    ptrace::cont(Pid::from_raw(pid), None).map_err(|e| io::Error::from_raw_os_error(e as i32))?;

    Ok(())
}

/// Waits out the `SIGTRAP` the CB's `execve` raises under trace, then lets
/// the CB run user code.
pub fn continue_ptrace(pid: pid_t) -> io::Result<()> {
    expect_stop(pid, libc::SIGTRAP)?;
    ptrace::cont(Pid::from_raw(pid), None).map_err(|e| io::Error::from_raw_os_error(e as i32))?;

    Ok(())
}

fn expect_stop(pid: pid_t, expected: c_int) -> io::Result<()> {
    let mut status: c_int = 0;
    let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
    if reaped != pid {
        return Err(io::Error::last_os_error());
    }
    if !(libc::WIFSTOPPED(status) && libc::WSTOPSIG(status) == expected) {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("unexpected wait status {:#x} for pid {}", status, pid),
        ));
    }

    Ok(())
}

extern "C" fn sigchld(_sig: c_int) {
    let mut status: c_int = 0;
    let mut rusage: libc::rusage = unsafe { mem::zeroed() };

    loop {
        let pid = unsafe { libc::wait4(-1, &mut status, libc::WNOHANG, &mut rusage) };
        if pid <= 0 {
            break;
        }
        reap(pid, status, &rusage);
    }
}

extern "C" fn sigterm(_sig: c_int) {
    unsafe { libc::_exit(0) };
}

#[derive(Debug, PartialEq, Eq)]
enum ChildFate {
    Exited(i32),
    Signaled(c_int),
    Stopped(c_int),
}

fn decode_status(status: c_int) -> Option<ChildFate> {
    if libc::WIFEXITED(status) {
        Some(ChildFate::Exited(libc::WEXITSTATUS(status)))
    } else if libc::WIFSIGNALED(status) {
        Some(ChildFate::Signaled(libc::WTERMSIG(status)))
    } else if libc::WIFSTOPPED(status) {
        Some(ChildFate::Stopped(libc::WSTOPSIG(status)))
    } else {
        None
    }
}

fn reap(pid: pid_t, status: c_int, rusage: &libc::rusage) {
    let monitor = MONITOR_PROCESS.load(Ordering::Relaxed);
    let Some(fate) = decode_status(status) else {
        return;
    };

    match fate {
        ChildFate::Exited(code) => {
            println!("CB exited (pid: {}, exit code: {})", pid, code);
            EXIT_VAL.store(fold_exit_code(exit_val(), code), Ordering::Relaxed);
            account(pid, rusage);
        }
        ChildFate::Stopped(sig) if sig == libc::SIGPIPE => {
            // benign under trace; hand it back and keep the CB running
            let _ = ptrace::cont(Pid::from_raw(pid), Signal::SIGPIPE);
        }
        ChildFate::Stopped(sig) => {
            if sig != libc::SIGUSR1 {
                report_fatal(pid, sig, monitor);
                EXIT_VAL.store(fold_fatal_signal(exit_val(), sig), Ordering::Relaxed);
            }
            // release the CB and let the signal kill it for real; the final
            // reap of the termination does the accounting
            let _ = ptrace::detach(Pid::from_raw(pid), None);
            unsafe { libc::kill(pid, sig) };
        }
        ChildFate::Signaled(sig) => {
            if sig != libc::SIGUSR1 {
                report_fatal(pid, sig, monitor);
                EXIT_VAL.store(fold_fatal_signal(exit_val(), sig), Ordering::Relaxed);
            }
            account(pid, rusage);
        }
    }
}

fn report_fatal(pid: pid_t, sig: c_int, monitor: bool) {
    match sig {
        libc::SIGALRM => {
            if monitor {
                println!("CB timed out (pid: {})", pid);
            }
        }
        libc::SIGSEGV | libc::SIGILL | libc::SIGBUS => {
            print_registers(pid);
            if monitor {
                println!("CB generated signal (pid: {}, signal: {})", pid, sig);
            }
        }
        _ => {
            if monitor {
                println!("CB generated signal (pid: {}, signal: {})", pid, sig);
            }
        }
    }
}

fn account(pid: pid_t, rusage: &libc::rusage) {
    with_book(|book| book.fold_rusage(rusage));
    read_counters(pid);
    let _ = NUM_CHILDREN.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
}

fn fold_exit_code(current: i32, code: i32) -> i32 {
    if current == 0 {
        code
    } else {
        current
    }
}

fn fold_fatal_signal(current: i32, sig: c_int) -> i32 {
    if current >= 0 && sig != libc::SIGUSR1 {
        -sig
    } else {
        current
    }
}

#[cfg(target_arch = "x86_64")]
fn print_registers(pid: pid_t) {
    // post-mortem reads fail quietly; registers are only available while the
    // CB is still in its signal stop
    let Ok(regs) = ptrace::getregs(Pid::from_raw(pid)) else {
        return;
    };
    println!(
        "register states - rax: {:08x} rcx: {:08x} rdx: {:08x} rbx: {:08x} rsp: {:08x} rbp: {:08x} rsi: {:08x} rdi: {:08x} rip: {:08x}",
        regs.rax, regs.rcx, regs.rdx, regs.rbx, regs.rsp, regs.rbp, regs.rsi, regs.rdi, regs.rip,
    );
    let _ = io::stdout().flush();
}

#[cfg(not(target_arch = "x86_64"))]
fn print_registers(_pid: pid_t) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> c_int {
        (code & 0xff) << 8
    }

    fn signaled(sig: c_int) -> c_int {
        sig & 0x7f
    }

    fn stopped(sig: c_int) -> c_int {
        0x7f | (sig << 8)
    }

    #[test]
    fn test_decode_status_recognises_each_shape() {
        assert_eq!(decode_status(exited(3)), Some(ChildFate::Exited(3)));
        assert_eq!(decode_status(signaled(libc::SIGSEGV)), Some(ChildFate::Signaled(libc::SIGSEGV)));
        assert_eq!(decode_status(stopped(libc::SIGALRM)), Some(ChildFate::Stopped(libc::SIGALRM)));
    }

    #[test]
    fn test_fold_exit_code_keeps_the_first_nonzero() {
        // GIVEN a clean slate
        assert_eq!(fold_exit_code(0, 0), 0);
        // WHEN the first non-zero code lands
        assert_eq!(fold_exit_code(0, 7), 7);
        // THEN later codes never overwrite it
        assert_eq!(fold_exit_code(7, 3), 7);
        assert_eq!(fold_exit_code(7, 0), 7);
    }

    #[test]
    fn test_fold_fatal_signal_wins_over_exit_codes() {
        // GIVEN an instance that already saw exit code 5
        // WHEN a CB dies by SIGSEGV
        assert_eq!(fold_fatal_signal(5, libc::SIGSEGV), -libc::SIGSEGV);
        // THEN a later signal cannot displace the verdict
        assert_eq!(fold_fatal_signal(-libc::SIGSEGV, libc::SIGILL), -libc::SIGSEGV);
    }

    #[test]
    fn test_fold_fatal_signal_ignores_sigusr1() {
        assert_eq!(fold_fatal_signal(0, libc::SIGUSR1), 0);
        assert_eq!(fold_fatal_signal(4, libc::SIGUSR1), 4);
    }

    #[test]
    fn test_fold_rusage_carries_microseconds() {
        // GIVEN two usage records that together overflow a second
        let mut book = PerfBook::new(0);
        let mut rusage: libc::rusage = unsafe { mem::zeroed() };
        rusage.ru_utime.tv_sec = 1;
        rusage.ru_utime.tv_usec = 700_000;
        rusage.ru_minflt = 10;
        rusage.ru_maxrss = 2048;
        // WHEN
        book.fold_rusage(&rusage);
        book.fold_rusage(&rusage);
        // THEN the usec field stays normalised
        assert_eq!(book.utime_sec, 3);
        assert_eq!(book.utime_usec, 400_000);
        assert_eq!(book.minflt, 20);
        assert_eq!(book.maxrss, 4096);
        assert_eq!(book.nkids, 2);
    }

    #[test]
    fn test_render_matches_the_report_shape() {
        // GIVEN
        let mut book = PerfBook::new(0);
        book.nkids = 2;
        book.maxrss = 1234;
        book.minflt = 56;
        book.utime_sec = 1;
        book.utime_usec = 42;
        book.cpu_clock = 777;
        book.task_clock = 888;
        // WHEN
        let report: String = book.render();
        // THEN
        assert_eq!(
            report,
            "total children: 2\n\
             total maxrss 1234\n\
             total minflt 56\n\
             total utime 1.000042\n\
             total sw-cpu-clock 777\n\
             total sw-task-clock 888\n"
        );
    }
}
