//! Parameters of a single fio invocation.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

/// A number of bytes, parsed from and printed as fio-style sizes (`4k`, `1g`).
///
/// Suffixes are binary multiples, the same as fio's default `kb_base=1024`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub(crate) struct ByteSize(pub u64);

const UNITS: [(char, u64); 5] = [
    ('p', 1 << 50),
    ('t', 1 << 40),
    ('g', 1 << 30),
    ('m', 1 << 20),
    ('k', 1 << 10),
];

impl ByteSize {
    #[cfg(test)]
    pub(crate) const fn kib(n: u64) -> Self {
        Self(n << 10)
    }

    #[cfg(test)]
    pub(crate) const fn mib(n: u64) -> Self {
        Self(n << 20)
    }

    #[cfg(test)]
    pub(crate) const fn gib(n: u64) -> Self {
        Self(n << 30)
    }

    pub(crate) fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let trimmed = lower
            .strip_suffix("ib")
            .or_else(|| lower.strip_suffix('b'))
            .unwrap_or(&lower);
        let (digits, multiplier) = match trimmed.chars().last() {
            Some(suffix) if suffix.is_ascii_alphabetic() => {
                let (_, multiplier) = UNITS
                    .iter()
                    .find(|(unit, _)| *unit == suffix)
                    .ok_or_else(|| anyhow::anyhow!("Unknown size suffix {suffix:?} in {s:?}"))?;
                (&trimmed[..trimmed.len() - 1], *multiplier)
            }
            _ => (trimmed, 1),
        };
        let count: u64 = digits
            .parse()
            .map_err(|_| anyhow::anyhow!("Can not parse {s:?} as a size (try e.g. 4k, 1M, 2G)"))?;
        count
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| anyhow::anyhow!("Size {s:?} does not fit in 64 bits"))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 != 0 {
            for (unit, multiplier) in UNITS {
                if self.0 % multiplier == 0 {
                    return write!(f, "{}{}", self.0 / multiplier, unit);
                }
            }
        }
        write!(f, "{}", self.0)
    }
}

/// fio's `rw=` access pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub(crate) enum RwMode {
    Read,
    Write,
    #[value(name = "randread")]
    RandRead,
    #[value(name = "randwrite")]
    RandWrite,
    #[value(name = "rw", alias = "readwrite")]
    ReadWrite,
    #[value(name = "randrw")]
    RandRw,
}

impl RwMode {
    pub(crate) fn as_fio(self) -> &'static str {
        match self {
            RwMode::Read => "read",
            RwMode::Write => "write",
            RwMode::RandRead => "randread",
            RwMode::RandWrite => "randwrite",
            RwMode::ReadWrite => "rw",
            RwMode::RandRw => "randrw",
        }
    }

    /// Whether fio honors `rwmixread` for this pattern.
    pub(crate) fn is_mixed(self) -> bool {
        matches!(self, RwMode::ReadWrite | RwMode::RandRw)
    }
}

impl fmt::Display for RwMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_fio())
    }
}

impl FromStr for RwMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <RwMode as clap::ValueEnum>::from_str(s, true)
            .map_err(|_| anyhow::anyhow!("Unknown read/write mode {s:?}"))
    }
}

/// fio's `--output-format=` selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// fio's human-readable report.
    #[default]
    Normal,
    /// Structured JSON; each measurement run also gets its own artifact file.
    Json,
}

impl OutputFormat {
    pub(crate) fn as_fio(self) -> &'static str {
        match self {
            OutputFormat::Normal => "normal",
            OutputFormat::Json => "json",
        }
    }
}

/// Everything fio needs to know for one run.
///
/// A `RunConfig` is never mutated after construction; sweep steps are built
/// by struct update from a base config.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RunConfig {
    pub name: String,
    pub device: PathBuf,
    pub offset: ByteSize,
    pub size: ByteSize,
    pub block_size: ByteSize,
    pub mode: RwMode,
    /// Percentage of reads in mixed modes.
    pub rwmix_read: Option<u8>,
    pub queue_depth: u32,
    pub jobs: u32,
    pub runtime: Option<Duration>,
    pub ioengine: String,
    pub output_format: OutputFormat,
    pub randseed: Option<u64>,
    pub extra: Vec<String>,
}

impl RunConfig {
    /// One byte past the end of the region under test, or `None` if that
    /// overflows.
    pub(crate) fn region_end(&self) -> Option<u64> {
        self.offset.bytes().checked_add(self.size.bytes())
    }

    /// The parameter summary that goes into a session log entry header.
    pub(crate) fn describe(&self) -> String {
        let time = match self.runtime {
            Some(runtime) => format!("{}s", runtime.as_secs()),
            None => "full".to_string(),
        };
        format!(
            "RW={}, BS={}, Jobs={}, QD={}, Size={}, Time={}",
            self.mode, self.block_size, self.jobs, self.queue_depth, self.size, time
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_fio_sizes() {
        assert_eq!("4k".parse::<ByteSize>().unwrap(), ByteSize::kib(4));
        assert_eq!("4KiB".parse::<ByteSize>().unwrap(), ByteSize::kib(4));
        assert_eq!("1G".parse::<ByteSize>().unwrap(), ByteSize::gib(1));
        assert_eq!("128mb".parse::<ByteSize>().unwrap(), ByteSize::mib(128));
        assert_eq!("512".parse::<ByteSize>().unwrap(), ByteSize(512));
        assert_eq!(" 2t ".parse::<ByteSize>().unwrap(), ByteSize(2 << 40));
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("k".parse::<ByteSize>().is_err());
        assert!("4x".parse::<ByteSize>().is_err());
        assert!("-1k".parse::<ByteSize>().is_err());
        assert!("99999999999p".parse::<ByteSize>().is_err());
    }

    #[test]
    fn displays_largest_exact_unit() {
        assert_eq!(ByteSize::kib(4).to_string(), "4k");
        assert_eq!(ByteSize::kib(1536).to_string(), "1536k");
        assert_eq!(ByteSize::gib(1).to_string(), "1g");
        assert_eq!(ByteSize(1000).to_string(), "1000");
        assert_eq!(ByteSize(0).to_string(), "0");
    }

    #[test]
    fn parses_modes_like_fio() {
        assert_eq!("randread".parse::<RwMode>().unwrap(), RwMode::RandRead);
        assert_eq!("readwrite".parse::<RwMode>().unwrap(), RwMode::ReadWrite);
        assert_eq!("RandRW".parse::<RwMode>().unwrap(), RwMode::RandRw);
        assert!("sideways".parse::<RwMode>().is_err());
        assert!(RwMode::RandRw.is_mixed());
        assert!(!RwMode::RandWrite.is_mixed());
    }

    #[test]
    fn region_end_detects_overflow() {
        let config = RunConfig {
            name: "overflow".to_string(),
            device: PathBuf::from("/dev/test"),
            offset: ByteSize(u64::MAX),
            size: ByteSize(1),
            block_size: ByteSize::kib(4),
            mode: RwMode::Write,
            rwmix_read: None,
            queue_depth: 1,
            jobs: 1,
            runtime: None,
            ioengine: "libaio".to_string(),
            output_format: OutputFormat::Normal,
            randseed: None,
            extra: vec![],
        };
        assert_eq!(config.region_end(), None);
        assert_eq!(
            config.describe(),
            "RW=write, BS=4k, Jobs=1, QD=1, Size=1, Time=full"
        );
    }
}
