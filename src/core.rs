use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use libc::{gid_t, uid_t};
use tracing::instrument;

use crate::resources::set_core_size;
use crate::service;
use crate::signals::{self, handle_blocked_children, wait_for_signal};
use crate::sockets::{close_fd, socket_accept, socket_bind};

/// How each service instance picks the identity its CBs run under.
#[derive(Debug, Clone)]
pub enum UidPolicy {
    /// A fixed uid/gid pair; the instance chroots into that uid's home.
    Fixed { uid: uid_t, gid: gid_t },
    /// A random identity unknown to the user database, jailed in `directory`.
    RandomUnused { directory: PathBuf },
}

/// Immutable run configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub backlog: i32,
    pub timeout: u32,
    pub limit: usize,
    pub max_connections: usize,
    pub uid_policy: UidPolicy,
    pub seed: Option<String>,
    pub skip_rng: Option<String>,
    pub max_transmit: Option<String>,
    pub max_receive: Option<String>,
    pub wrapper: Option<PathBuf>,
    pub insecure: bool,
    pub negotiate: bool,
    pub debug: bool,
    pub programs: Vec<PathBuf>,
}

/// Challenge-binary supervisor: accepts connections and forks one monitor per
/// connection, under a bounded-concurrency admission gate.
pub struct CbServer {
    config: ServerConfig,
    listener: RawFd,
}

impl CbServer {
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        signals::setup_signals()?;
        let listener: RawFd = socket_bind(config.port, config.backlog)?;
        tracing::info!(port = config.port, "Listening");

        Ok(Self { config, listener })
    }

    /// Runs the accept loop until the connection cap is reached, then drains
    /// outstanding instances. Returns the process exit code.
    #[instrument(name = "server", skip_all)]
    pub fn serve(&self) -> io::Result<i32> {
        let mut connections: usize = 0;

        loop {
            handle_blocked_children();

            while signals::num_children() >= self.config.limit {
                wait_for_signal();
            }

            let Some(connection) = socket_accept(self.listener) else {
                continue;
            };

            connections += 1;
            signals::add_child();
            signals::reset_exit_val();

            match unsafe { libc::fork() } {
                0 => {
                    close_fd(self.listener);
                    service::run_instance(&self.config, connection);
                }
                pid if pid > 0 => {
                    tracing::debug!(%pid, active = signals::num_children(), "Forked monitor");
                }
                _ => return Err(io::Error::last_os_error()),
            }

            close_fd(connection);

            if self.config.max_connections > 0 && connections >= self.config.max_connections {
                break;
            }
        }

        self.drain()
    }

    fn drain(&self) -> io::Result<i32> {
        handle_blocked_children();
        while signals::num_children() > 0 {
            wait_for_signal();
        }

        let verdict: i32 = signals::exit_val();
        if verdict != 0 {
            signals::unsetup_signals()?;
            set_core_size(0)?;
            return Ok(-verdict);
        }

        Ok(0)
    }
}
