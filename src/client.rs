//! Test client for a running supervisor: optionally negotiates a seed, then
//! relays its stdin/stdout over the connection so a human (or a script) can
//! talk to the launched CBs directly.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cb_server::utils::parse_hex;

#[derive(Parser, Debug)]
#[command(name = "cb-client", version = "1.0", about = "Challenge binary service client")]
struct Args {
    /// Socket address of the supervisor
    #[arg(short = 'a', long = "socket_addr", default_value = "127.0.0.1:10000")]
    socket_addr: SocketAddr,

    /// Negotiate before relaying, sending this hex-encoded seed
    #[arg(short = 's', long = "seed")]
    seed: Option<String>,
}

/// Sends a single seed record and waits for the acknowledgement.
fn negotiate_seed<S: Read + Write>(stream: &mut S, seed_hex: &str) -> io::Result<()> {
    let seed: Vec<u8> = parse_hex(seed_hex)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seed must be hex encoded"))?;

    stream.write_all(&1u32.to_le_bytes())?; // record count
    stream.write_all(&1u32.to_le_bytes())?; // seed record type
    stream.write_all(&(seed.len() as u32).to_le_bytes())?;
    stream.write_all(&seed)?;

    let mut ack: [u8; 4] = [0; 4];
    stream.read_exact(&mut ack)?;
    match u32::from_le_bytes(ack) {
        1 => Ok(()),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected negotiation ack {}", other),
        )),
    }
}

/// Pumps stdin into the connection and the connection onto stdout until both
/// directions close. Returns the number of bytes received.
fn relay(stream: TcpStream) -> io::Result<u64> {
    let mut reader: TcpStream = stream.try_clone()?;

    let upstream = thread::spawn(move || -> io::Result<u64> {
        let mut writer = stream;
        let sent: u64 = io::copy(&mut io::stdin(), &mut writer)?;
        writer.shutdown(Shutdown::Write)?;
        Ok(sent)
    });

    let received: u64 = io::copy(&mut reader, &mut io::stdout())?;
    let sent: u64 = upstream
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "stdin relay panicked"))??;
    tracing::debug!(%sent, %received, "Connection closed");

    Ok(received)
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "Parsed arguments");

    let mut stream: TcpStream = TcpStream::connect(args.socket_addr)?;
    tracing::info!(peer = %args.socket_addr, "Connected");

    if let Some(seed) = &args.seed {
        negotiate_seed(&mut stream, seed)?;
        tracing::info!("Negotiation acknowledged");
    }

    relay(stream)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_negotiate_seed_frames_one_record() {
        // GIVEN a server that acknowledges
        let mut stream = Duplex {
            input: Cursor::new(1u32.to_le_bytes().to_vec()),
            output: Vec::new(),
        };
        // WHEN
        negotiate_seed(&mut stream, "41414141").unwrap();
        // THEN count, type, size and payload are on the wire in order
        let mut expected: Vec<u8> = Vec::new();
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(b"AAAA");
        assert_eq!(stream.output, expected);
    }

    #[test]
    fn test_negotiate_seed_rejects_a_bad_ack() {
        // GIVEN a server that answers with something other than 1
        let mut stream = Duplex {
            input: Cursor::new(7u32.to_le_bytes().to_vec()),
            output: Vec::new(),
        };
        // WHEN / THEN
        assert!(negotiate_seed(&mut stream, "00").is_err());
    }

    #[test]
    fn test_negotiate_seed_rejects_non_hex_input() {
        let mut stream = Duplex {
            input: Cursor::new(Vec::new()),
            output: Vec::new(),
        };
        assert!(negotiate_seed(&mut stream, "not-hex").is_err());
    }
}
