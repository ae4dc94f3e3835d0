use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Length in bytes of a generated PRNG seed.
pub const SEED_LENGTH: usize = 48;

/// Maps a `-1` syscall return to the current `errno`.
pub(crate) fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Prints one `stat:` line per challenge binary so replay tooling can verify
/// it is driving the same build of the service.
pub fn print_filesizes(programs: &[PathBuf]) -> io::Result<()> {
    for program in programs {
        let metadata: fs::Metadata = fs::metadata(program)?;
        println!("stat: {} filesize {}", program.display(), metadata.len());
    }

    Ok(())
}

/// Whether the owner execute bit is set. Only used for diagnostics; `execve`
/// remains the authority on whether a binary can actually be launched.
pub fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o100 != 0)
}

pub fn get_random(buf: &mut [u8]) -> io::Result<()> {
    File::open("/dev/urandom")?.read_exact(buf)
}

/// Draws a fresh random seed for instances that negotiated none.
pub fn get_prng_seed() -> io::Result<String> {
    let mut seed: [u8; SEED_LENGTH] = [0; SEED_LENGTH];
    get_random(&mut seed)?;

    Ok(set_prng_seed(&seed))
}

/// Formats raw seed bytes as the `seed=<hex>` argv cell handed to each CB.
pub fn set_prng_seed(bytes: &[u8]) -> String {
    format!("seed={}", to_hex(bytes))
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }

    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex_formats_lowercase_pairs() {
        // GIVEN
        let bytes: [u8; 4] = [0x00, 0x0f, 0xab, 0xff];
        // WHEN
        let hex: String = to_hex(&bytes);
        // THEN
        assert_eq!(hex, "000fabff");
    }

    #[test]
    fn test_parse_hex_roundtrips_to_hex() {
        // GIVEN
        let bytes: Vec<u8> = (0u8..=255).collect();
        // WHEN
        let parsed: Option<Vec<u8>> = parse_hex(&to_hex(&bytes));
        // THEN
        assert_eq!(parsed.as_deref(), Some(bytes.as_slice()));
    }

    #[test]
    fn test_parse_hex_rejects_odd_length_and_non_hex() {
        assert_eq!(parse_hex("abc"), None);
        assert_eq!(parse_hex("zz"), None);
    }

    #[test]
    fn test_set_prng_seed_prefixes_hex() {
        // GIVEN
        let bytes: [u8; 3] = [1, 2, 3];
        // WHEN
        let cell: String = set_prng_seed(&bytes);
        // THEN
        assert_eq!(cell, "seed=010203");
    }

    #[test]
    fn test_get_prng_seed_has_expected_shape() {
        // WHEN
        let cell: String = get_prng_seed().unwrap();
        // THEN
        assert_eq!(cell.len(), "seed=".len() + SEED_LENGTH * 2);
        assert!(cell.starts_with("seed="));
    }

    #[test]
    fn test_get_random_draws_differ() {
        // GIVEN
        let mut first: [u8; 16] = [0; 16];
        let mut second: [u8; 16] = [0; 16];
        // WHEN
        get_random(&mut first).unwrap();
        get_random(&mut second).unwrap();
        // THEN
        assert_ne!(first, second);
    }

    #[test]
    fn test_is_executable_probes_the_owner_bit() {
        assert!(is_executable(Path::new("/bin/sh")));
        assert!(!is_executable(Path::new("/etc/hostname")));
    }
}
