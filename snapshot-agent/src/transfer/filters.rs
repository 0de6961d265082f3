//! Filter stages that sit between `send` and `receive`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stream compression applied on the sending side and undone by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zstd,
    Gzip,
    Lz4,
}

impl Compression {
    /// Command compressing stdin to stdout.
    pub fn compress_argv(&self) -> Vec<String> {
        let argv: &[&str] = match self {
            Compression::Zstd => &["zstd", "-c", "-T0", "-q"],
            Compression::Gzip => &["gzip", "-c"],
            Compression::Lz4 => &["lz4", "-c", "-q"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Shell fragment decompressing stdin to stdout.
    pub fn decompress_command(&self) -> &'static str {
        match self {
            Compression::Zstd => "zstd -d -c -q",
            Compression::Gzip => "gzip -d -c",
            Compression::Lz4 => "lz4 -d -c -q",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Zstd => "zstd",
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
        };
        f.write_str(name)
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zstd" => Ok(Compression::Zstd),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "lz4" => Ok(Compression::Lz4),
            other => Err(format!("unknown compression '{}'", other)),
        }
    }
}

/// Bandwidth limit stage, e.g. `10M` for ten megabytes per second.
pub fn rate_limit_argv(limit: &str) -> Vec<String> {
    vec!["pv".into(), "-q".into(), "-L".into(), limit.to_string()]
}

/// Wrap a receive command so the stream is decompressed first. `pipefail`
/// makes a decompressor failure fail the whole receive stage.
pub fn with_decompression(receive_command: &str, compression: Option<Compression>) -> Vec<String> {
    match compression {
        None => vec!["sh".into(), "-c".into(), receive_command.to_string()],
        Some(c) => vec![
            "bash".into(),
            "-c".into(),
            format!("set -o pipefail; {} | {}", c.decompress_command(), receive_command),
        ],
    }
}
