use std::io;
use std::path::PathBuf;
use std::process;
use clap::{value_parser, ArgGroup, CommandFactory as _, Parser, ValueHint};
use tracing_subscriber::EnvFilter;

use cb_server::core::{CbServer, ServerConfig, UidPolicy};
use cb_server::resources::set_core_size;

#[derive(Parser, Debug)]
#[command(
    name = "cb-server",
    version = "1.0",
    about = "Challenge binary supervisor",
    group = ArgGroup::new("identity").args(["uid", "directory"]),
)]
struct Args {
    /// Port to listen on
    #[arg(short = 'p', long = "port")]
    port: u16,

    /// Listen backlog
    #[arg(short = 'b', long = "backlog", default_value_t = 20)]
    backlog: i32,

    /// Wall-clock seconds each CB may run (0 disables the alarm)
    #[arg(short = 't', long = "timeout", default_value_t = 0)]
    timeout: u32,

    /// Maximum concurrent service instances
    #[arg(short = 'l', long = "limit", default_value_t = 40, value_parser = value_parser!(u32).range(1..))]
    limit: u32,

    /// Stop serving after this many connections (0 = unbounded)
    #[arg(short = 'm', long = "max-connections", default_value_t = 0)]
    max_connections: u32,

    /// Cap both max_transmit and max_receive at this many bytes
    #[arg(short = 'M', long = "max-send")]
    max_send: Option<u64>,

    /// Core dump size limit in bytes
    #[arg(short = 'c', long = "core-size")]
    core_size: Option<u64>,

    /// PRNG seed handed to each CB
    #[arg(short = 's', long = "seed", conflicts_with = "negotiate")]
    seed: Option<String>,

    /// Number of PRNG draws each CB discards at startup
    #[arg(short = 'S', long = "skip-rng")]
    skip_rng: Option<u64>,

    /// Wrapper executable run in place of each CB
    #[arg(short = 'w', long = "wrapper", value_hint = ValueHint::FilePath)]
    wrapper: Option<PathBuf>,

    /// Uid the CBs run under (pairs with --gid)
    #[arg(short = 'u', long = "uid", requires = "gid", value_parser = value_parser!(u32).range(1..))]
    uid: Option<u32>,

    /// Gid the CBs run under (pairs with --uid)
    #[arg(short = 'g', long = "gid", requires = "uid", value_parser = value_parser!(u32).range(1..))]
    gid: Option<u32>,

    /// Jail directory for the random-identity policy
    #[arg(short = 'd', long = "directory", value_hint = ValueHint::DirPath)]
    directory: Option<PathBuf>,

    /// Skip chroot and the syscall filter (does not require root)
    #[arg(long)]
    insecure: bool,

    /// Negotiate the PRNG seed with the client before launch
    #[arg(long)]
    negotiate: bool,

    /// Keep stderr on the connection and skip ptrace supervision
    #[arg(long)]
    debug: bool,

    /// Challenge binaries launched for every connection
    #[arg(required = true, value_name = "BINARY", value_hint = ValueHint::FilePath)]
    programs: Vec<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, &'static str> {
        let uid_policy = match (self.uid, self.gid, self.directory) {
            (Some(uid), Some(gid), None) => UidPolicy::Fixed { uid, gid },
            (None, None, Some(directory)) => UidPolicy::RandomUnused { directory },
            // privileges are never dropped in insecure mode, so the identity
            // flags may be omitted there
            (None, None, None) if self.insecure => UidPolicy::Fixed {
                uid: unsafe { libc::getuid() },
                gid: unsafe { libc::getgid() },
            },
            _ => return Err("either --uid/--gid or --directory must be given"),
        };

        Ok(ServerConfig {
            port: self.port,
            backlog: self.backlog,
            timeout: self.timeout,
            limit: self.limit as usize,
            max_connections: self.max_connections as usize,
            uid_policy,
            seed: self.seed.map(|s| format!("seed={}", s)),
            skip_rng: self.skip_rng.map(|n| format!("skiprng={}", n)),
            max_transmit: self.max_send.map(|n| format!("max_transmit={}", n)),
            max_receive: self.max_send.map(|n| format!("max_receive={}", n)),
            wrapper: self.wrapper,
            insecure: self.insecure,
            negotiate: self.negotiate,
            debug: self.debug,
            programs: self.programs,
        })
    }
}

fn usage(error: &str) -> ! {
    println!("ERROR: {}", error);
    let _ = Args::command().print_help();
    process::exit(-1);
}

fn run(config: ServerConfig) -> io::Result<i32> {
    let server = CbServer::bind(config)?;
    server.serve()
}

fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_writer(io::stderr) // stdout carries the replay telemetry
        .with_env_filter(EnvFilter::from_default_env()) // RUST_LOG env var by default
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            // configuration errors land on stdout, next to the usage text
            println!("ERROR: {}", e.kind());
            let _ = Args::command().print_help();
            process::exit(-1);
        }
        Err(e) => e.exit(), // --help / --version
    };
    tracing::debug!(?args, "Parsed arguments");

    if !args.insecure && unsafe { libc::geteuid() } != 0 {
        usage("unable to chroot. either run as root or add --insecure");
    }

    if let Some(bytes) = args.core_size {
        if let Err(e) = set_core_size(bytes) {
            tracing::error!("unable to set the core size limit: {}", e);
            process::exit(-1);
        }
    }

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => usage(e),
    };

    match run(config) {
        Ok(code) => process::exit(code),
        Err(e) => {
            // partial setup cannot be recovered; the wiring would be wrong
            tracing::error!("fatal: {}", e);
            process::exit(-1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(argv: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(argv)
    }

    #[test]
    fn test_args_require_a_port() {
        // GIVEN an invocation without -p
        let result = parse(&["cb-server", "--insecure", "-d", "/srv", "./cb"]);
        // THEN
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::MissingRequiredArgument));
    }

    #[test]
    fn test_secure_mode_requires_an_identity_policy() {
        // GIVEN neither --uid/--gid nor --directory, without --insecure
        let args = parse(&["cb-server", "-p", "10000", "./cb"]).unwrap();
        // WHEN / THEN
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_insecure_mode_defaults_the_identity() {
        // GIVEN an insecure run with no identity flags
        let args = parse(&["cb-server", "-p", "10000", "--insecure", "./cb"]).unwrap();
        // WHEN
        let config = args.into_config().unwrap();
        // THEN the unused policy falls back to the current ids
        match config.uid_policy {
            UidPolicy::Fixed { uid, gid } => {
                assert_eq!(uid, unsafe { libc::getuid() });
                assert_eq!(gid, unsafe { libc::getgid() });
            }
            UidPolicy::RandomUnused { .. } => panic!("expected a fixed identity"),
        }
    }

    #[test]
    fn test_args_require_at_least_one_binary() {
        let result = parse(&["cb-server", "-p", "10000", "-d", "/srv"]);
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::MissingRequiredArgument));
    }

    #[test]
    fn test_uid_and_gid_must_be_paired() {
        let result = parse(&["cb-server", "-p", "10000", "-u", "500", "./cb"]);
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::MissingRequiredArgument));
    }

    #[test]
    fn test_uid_zero_is_rejected() {
        // GIVEN root as the target identity
        let result = parse(&["cb-server", "-p", "10000", "-u", "0", "-g", "500", "./cb"]);
        // THEN strict parsing refuses it
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::ValueValidation));
    }

    #[test]
    fn test_malformed_numbers_are_rejected() {
        // GIVEN a port with trailing junk, which lenient parsers would truncate
        let result = parse(&["cb-server", "-p", "10000x", "-d", "/srv", "./cb"]);
        // THEN
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::ValueValidation));
    }

    #[test]
    fn test_seed_conflicts_with_negotiation() {
        let result = parse(&[
            "cb-server", "-p", "10000", "-d", "/srv", "-s", "AAAA", "--negotiate", "./cb",
        ]);
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::ArgumentConflict));
    }

    #[test]
    fn test_fixed_identity_conflicts_with_directory() {
        let result = parse(&[
            "cb-server", "-p", "10000", "-u", "500", "-g", "500", "-d", "/srv", "./cb",
        ]);
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::ArgumentConflict));
    }

    #[test]
    fn test_defaults_match_the_documented_values() {
        // GIVEN a minimal valid invocation
        let args = parse(&["cb-server", "-p", "10000", "-d", "/srv", "./a", "./b"]).unwrap();
        // THEN
        assert_eq!(args.backlog, 20);
        assert_eq!(args.limit, 40);
        assert_eq!(args.timeout, 0);
        assert_eq!(args.max_connections, 0);
        assert_eq!(args.programs.len(), 2);
    }

    #[test]
    fn test_config_formats_the_argv_cells() {
        // GIVEN seed, skip-rng and send caps
        let args = parse(&[
            "cb-server", "-p", "10000", "-d", "/srv", "-s", "AB", "-S", "3", "-M", "4096", "./cb",
        ])
        .unwrap();
        // WHEN
        let config = args.into_config().unwrap();
        // THEN the cells carry the key=value shape the CBs expect
        assert_eq!(config.seed.as_deref(), Some("seed=AB"));
        assert_eq!(config.skip_rng.as_deref(), Some("skiprng=3"));
        assert_eq!(config.max_transmit.as_deref(), Some("max_transmit=4096"));
        assert_eq!(config.max_receive.as_deref(), Some("max_receive=4096"));
    }
}
