//! Command line interface and configuration validation.

use crate::daemon::DaemonConfig;
use crate::segment::{SegmentConfig, SegmentMethod};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

const EXTRA_HELP: &str = "\
Memory size:
  A shared memory size that is a multiple of the platform page size
  must be given via --memory.

Client connection:
  You must pass --socket with a path name to use for the Unix domain
  socket (AF_UNIX socket) used for client connection. An absolute
  path is recommended because the same path must also be given to
  clients.

Unix shared memory:
  [--posix] [--name=/myshmem]: Create with shm_open(2) and map with
      mmap(2). If name is given it should start with a slash and
      contain no more slashes.
  --systemv [--name=key]: Create with shmget(2) and map with shmat(2).
      If name is given it must be an integer key.
  --file=myfile: Create with open(2) and map with mmap(2). The --name
      option is ignored.
  Not all of the above may be available on a given Unix-like system.
  On Linux, huge pages can be allocated either by using --file with a
  location in a mounted hugetlbfs or by giving --huge-pages with
  --systemv. In both cases, --memory must be a multiple of the huge
  page size.

In all cases, partaked will exit with an error if the filename given
by --file or the name given by --name already exists, unless --force
is also given.";

/// The partake daemon.
#[derive(Debug, Parser)]
#[command(name = "partaked", version, about = "The partake daemon.", after_help = EXTRA_HELP)]
pub struct Cli {
    /// Size of shared memory (suffixes K/M/G allowed)
    #[arg(short = 'm', long, value_name = "BYTES", value_parser = parse_size)]
    pub memory: Option<u64>,

    /// Filename of socket for client connection
    #[arg(short = 's', long, value_name = "NAME")]
    pub socket: Option<PathBuf>,

    /// Name of shared memory (integer if --systemv)
    #[arg(short = 'n', long, value_name = "NAME")]
    pub name: Option<String>,

    /// Use shared memory backed by the given file
    #[arg(short = 'F', long, value_name = "FILENAME")]
    pub file: Option<PathBuf>,

    /// Use POSIX shm_open(2) shared memory (default)
    #[arg(short = 'P', long)]
    pub posix: bool,

    /// Use System V shmget(2) shared memory
    #[arg(short = 'S', long)]
    pub systemv: bool,

    /// Use Win32 named shared memory (default on Windows)
    #[arg(short = 'W', long)]
    pub windows: bool,

    /// Allocation granularity (suffixes K/M/G allowed)
    #[arg(short = 'g', long, value_name = "BYTES", value_parser = parse_size)]
    pub granularity: Option<u64>,

    /// Use Linux huge pages with --systemv
    #[arg(short = 'H', long)]
    pub huge_pages: bool,

    /// Select Linux huge page size (implies --huge-pages)
    #[arg(long, value_name = "BYTES", value_parser = parse_size)]
    pub huge_page_size: Option<u64>,

    /// Use Windows large pages
    #[arg(short = 'L', long)]
    pub large_pages: bool,

    /// Set voucher time-to-live (default: 10 s)
    #[arg(long, value_name = "SECONDS", default_value_t = 10.0, allow_negative_numbers = true)]
    pub voucher_ttl: f64,

    /// Overwrite existing shared memory and/or file
    #[arg(short = 'f', long)]
    pub force: bool,
}

/// Parses a byte size with an optional B/K/M/G suffix (case-insensitive).
fn parse_size(text: &str) -> Result<u64, String> {
    if text.is_empty() {
        return Err("size must not be empty".into());
    }
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    if digits_end == 0 {
        return Err(format!("invalid size: {text}"));
    }
    let number: u64 = text[..digits_end]
        .parse()
        .map_err(|_| format!("size too large: {text}"))?;
    let multiplier: u64 = match &text[digits_end..] {
        "" | "B" | "b" => 1,
        "K" | "k" => 1 << 10,
        "M" | "m" => 1 << 20,
        "G" | "g" => 1 << 30,
        suffix => return Err(format!("invalid size suffix: {suffix}")),
    };
    number
        .checked_mul(multiplier)
        .filter(|&v| i64::try_from(v).is_ok())
        .ok_or_else(|| format!("size too large: {text}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShmemType {
    Posix,
    SystemV,
    Win32,
    PosixFile,
}

fn validate_segment_type(cli: &Cli) -> Result<ShmemType, String> {
    let mechanism_count = usize::from(cli.posix)
        + usize::from(cli.systemv)
        + usize::from(cli.windows)
        + usize::from(cli.file.is_some());
    if mechanism_count > 1 {
        return Err("Only one of --posix, --systemv, --windows, --file may be given".into());
    }
    if cli.posix {
        Ok(ShmemType::Posix)
    } else if cli.systemv {
        Ok(ShmemType::SystemV)
    } else if cli.windows {
        Ok(ShmemType::Win32)
    } else if cli.file.is_some() {
        Ok(ShmemType::PosixFile)
    } else {
        Ok(ShmemType::Posix)
    }
}

fn validate_posix_shmem_name(name: Option<&str>) -> Result<Option<String>, String> {
    let Some(name) = name else {
        return Ok(None); // Autogenerate.
    };
    let Some(rest) = name.strip_prefix('/') else {
        return Err("POSIX shared memory name must start with a slash".into());
    };
    if rest.is_empty() {
        return Err(
            "POSIX shared memory name must contain characters after the initial slash".into(),
        );
    }
    if rest.contains('/') {
        return Err(
            "POSIX shared memory name must not contain slashes after the initial slash".into(),
        );
    }
    Ok(Some(name.to_owned()))
}

fn validate_sysv_shmem_name(name: Option<&str>) -> Result<i32, String> {
    match name {
        None | Some("") => Ok(0), // Auto-select.
        Some(name) => name
            .parse()
            .map_err(|_| "System V shared memory name (key) must be an integer in the 32-bit range".into()),
    }
}

fn validate_segment_config(cli: &Cli) -> Result<SegmentConfig, String> {
    let shmem_type = validate_segment_type(cli)?;

    let use_huge_pages = cli.huge_pages || cli.huge_page_size.is_some();
    if use_huge_pages && shmem_type != ShmemType::SystemV {
        return Err("--huge-pages requires System V shared memory".into());
    }
    if cli.large_pages && shmem_type != ShmemType::Win32 {
        return Err("--large-pages requires Windows (non-file-backed) shared memory".into());
    }
    if let Some(huge_size) = cli.huge_page_size {
        if !huge_size.is_power_of_two() {
            return Err("Huge page size must be a power of 2".into());
        }
    }

    let method = match shmem_type {
        ShmemType::Posix => SegmentMethod::Posix {
            name: validate_posix_shmem_name(cli.name.as_deref())?,
            force: cli.force,
        },
        ShmemType::SystemV => SegmentMethod::SystemV {
            key: validate_sysv_shmem_name(cli.name.as_deref())?,
            force: cli.force,
            huge_pages: use_huge_pages,
            huge_page_size: cli.huge_page_size.map(|s| s as usize),
        },
        ShmemType::Win32 => SegmentMethod::Win32 {
            filename: cli.file.clone(),
            name: cli.name.clone(),
            force: cli.force,
            large_pages: cli.large_pages,
        },
        ShmemType::PosixFile => SegmentMethod::File {
            path: cli.file.clone().unwrap_or_default(),
            force: cli.force,
        },
    };
    Ok(SegmentConfig {
        method,
        size: cli.memory.unwrap_or(0) as usize,
    })
}

impl Cli {
    /// Full validation into a daemon configuration; errors are user-facing
    /// messages.
    pub fn validate(&self) -> Result<DaemonConfig, String> {
        if self.memory.unwrap_or(0) == 0 {
            return Err("--memory is required and its argument must be positive".into());
        }

        // Unix domain socket path length limits are low (91-107 bytes
        // depending on the platform); the bind call reports violations.
        let Some(socket_path) = self.socket.clone() else {
            return Err("--socket is required".into());
        };

        let mut granularity_log2 = None;
        if let Some(granularity) = self.granularity {
            if !granularity.is_power_of_two() {
                return Err("Allocation granularity must be a power of 2".into());
            }
            const MIN_GRANULARITY: u64 = 512;
            if granularity < MIN_GRANULARITY {
                return Err(format!(
                    "Allocation granularity must not be less than {MIN_GRANULARITY}"
                ));
            }
            granularity_log2 = Some(granularity.trailing_zeros());
        }

        let voucher_ttl = Duration::try_from_secs_f64(self.voucher_ttl)
            .ok()
            .filter(|ttl| !ttl.is_zero())
            .ok_or("Voucher time-to-live must be positive")?;

        let segment = validate_segment_config(self)?;
        Ok(DaemonConfig {
            socket_path,
            segment,
            granularity_log2,
            voucher_ttl,
            force: self.force,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("partaked").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn parse_size_plain_and_suffixed() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("1"), Ok(1));
        assert_eq!(parse_size("12345"), Ok(12345));
        assert_eq!(parse_size("0B"), Ok(0));
        assert_eq!(parse_size("1B"), Ok(1));
        assert_eq!(parse_size("0k"), Ok(0));
        assert_eq!(parse_size("1k"), Ok(1024));
        assert_eq!(parse_size("12345k"), Ok(12_641_280));
        assert_eq!(parse_size("1M"), Ok(1_048_576));
        assert_eq!(parse_size("1G"), Ok(1_073_741_824));
        assert_eq!(parse_size("9223372036854775807"), Ok(i64::MAX as u64));
    }

    #[test]
    fn parse_size_rejects_malformed() {
        assert!(parse_size("").is_err());
        assert!(parse_size("b").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("1n").is_err());
        assert!(parse_size("1 B").is_err());
        assert!(parse_size("9223372036854775808").is_err()); // 2^63
    }

    #[test]
    fn mechanism_defaults_to_posix() {
        let config = cli(&["-m", "1M", "-s", "/tmp/sock"]).validate().unwrap();
        assert!(matches!(
            config.segment.method,
            SegmentMethod::Posix { name: None, .. }
        ));
    }

    #[test]
    fn mechanism_flags_are_mutually_exclusive() {
        assert!(cli(&["-m", "1M", "-s", "s", "--posix", "--systemv"])
            .validate()
            .is_err());
        assert!(cli(&["-m", "1M", "-s", "s", "--posix", "--file", "f"])
            .validate()
            .is_err());
        assert!(cli(&["-m", "1M", "-s", "s", "--windows", "--file", "f"])
            .validate()
            .is_err());
    }

    #[test]
    fn file_mechanism_from_file_flag() {
        let config = cli(&["-m", "1M", "-s", "s", "--file", "backing"])
            .validate()
            .unwrap();
        assert!(matches!(config.segment.method, SegmentMethod::File { .. }));
    }

    #[test]
    fn posix_name_validation() {
        assert!(cli(&["-m", "1M", "-s", "s", "-n", "/ok"]).validate().is_ok());
        assert!(cli(&["-m", "1M", "-s", "s", "-n", "noslash"])
            .validate()
            .is_err());
        assert!(cli(&["-m", "1M", "-s", "s", "-n", "/"]).validate().is_err());
        assert!(cli(&["-m", "1M", "-s", "s", "-n", "/a/b"])
            .validate()
            .is_err());
    }

    #[test]
    fn sysv_name_must_be_integer_key() {
        let config = cli(&["-m", "1M", "-s", "s", "--systemv", "-n", "42"])
            .validate()
            .unwrap();
        assert!(matches!(
            config.segment.method,
            SegmentMethod::SystemV { key: 42, .. }
        ));
        assert!(cli(&["-m", "1M", "-s", "s", "--systemv", "-n", "abc"])
            .validate()
            .is_err());
        assert!(cli(&["-m", "1M", "-s", "s", "--systemv", "-n", "2147483648"])
            .validate()
            .is_err());
        let auto = cli(&["-m", "1M", "-s", "s", "--systemv"]).validate().unwrap();
        assert!(matches!(
            auto.segment.method,
            SegmentMethod::SystemV { key: 0, .. }
        ));
    }

    #[test]
    fn memory_and_socket_are_required() {
        assert!(cli(&["-s", "/tmp/sock"]).validate().is_err());
        assert!(cli(&["-m", "0", "-s", "/tmp/sock"]).validate().is_err());
        assert!(cli(&["-m", "1M"]).validate().is_err());
    }

    #[test]
    fn granularity_must_be_power_of_two_and_large_enough() {
        assert!(cli(&["-m", "1M", "-s", "s", "-g", "4096"]).validate().is_ok());
        assert!(cli(&["-m", "1M", "-s", "s", "-g", "1000"])
            .validate()
            .is_err());
        assert!(cli(&["-m", "1M", "-s", "s", "-g", "256"]).validate().is_err());
        let config = cli(&["-m", "1M", "-s", "s", "-g", "512"]).validate().unwrap();
        assert_eq!(config.granularity_log2, Some(9));
    }

    #[test]
    fn huge_pages_require_systemv() {
        assert!(cli(&["-m", "2M", "-s", "s", "--huge-pages"]).validate().is_err());
        assert!(cli(&["-m", "2M", "-s", "s", "--systemv", "--huge-pages"])
            .validate()
            .is_ok());
        // --huge-page-size implies --huge-pages.
        assert!(cli(&["-m", "2M", "-s", "s", "--huge-page-size", "2M"])
            .validate()
            .is_err());
        let config = cli(&[
            "-m", "2M", "-s", "s", "--systemv", "--huge-page-size", "2M",
        ])
        .validate()
        .unwrap();
        assert!(matches!(
            config.segment.method,
            SegmentMethod::SystemV {
                huge_pages: true,
                huge_page_size: Some(s),
                ..
            } if s == 2 << 20
        ));
    }

    #[test]
    fn large_pages_require_windows() {
        assert!(cli(&["-m", "1M", "-s", "s", "--large-pages"]).validate().is_err());
        assert!(cli(&["-m", "1M", "-s", "s", "--windows", "--large-pages"])
            .validate()
            .is_ok());
    }

    #[test]
    fn voucher_ttl_must_be_positive() {
        assert!(cli(&["-m", "1M", "-s", "s", "--voucher-ttl", "0"])
            .validate()
            .is_err());
        assert!(cli(&["-m", "1M", "-s", "s", "--voucher-ttl", "-1"])
            .validate()
            .is_err());
        let config = cli(&["-m", "1M", "-s", "s", "--voucher-ttl", "2.5"])
            .validate()
            .unwrap();
        assert_eq!(config.voucher_ttl, Duration::from_millis(2500));
    }
}
