//! External-interface argument parsing (spec §6). The parsing itself is
//! ambient scaffolding for the out-of-core orchestrator; the core exposes
//! it so the demonstration binary and that orchestrator share one parser.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

/// `{jobs, memory_bytes, kernel_path, input_dir, output_dir, memory_files[],
/// basic_blocks_path, binary_path, binary_argv[]}` (spec §6).
#[derive(Parser, Debug)]
#[command(name = "hostel")]
pub struct Args {
    /// Number of parallel fuzzing jobs; unused by the core itself, which is
    /// single VM per call, but threaded through for the orchestrator.
    #[arg(short, long, default_value_t = 1)]
    pub jobs: u32,

    /// Guest physical memory size, e.g. "256M", "1G".
    #[arg(short = 'm', long = "memory", default_value = "256M", value_parser = parse_memory_size)]
    pub memory_bytes: u64,

    /// Path to the compiled guest kernel stub ELF. Defaults to the stub
    /// `build.rs` compiles alongside this crate; overriding it is only
    /// useful when testing against a hand-modified stub.
    #[arg(short, long, default_value = env!("GUEST_KERNEL_BIN"))]
    pub kernel_path: PathBuf,

    #[arg(long)]
    pub input_dir: Option<PathBuf>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long = "memory-file")]
    pub memory_files: Vec<PathBuf>,

    #[arg(long)]
    pub basic_blocks_path: Option<PathBuf>,

    /// Path to the target binary; prepended to `binary_argv` before being
    /// handed to the loader (spec §6).
    pub binary_path: PathBuf,

    /// Arguments to the target binary, after the target's own path.
    pub binary_argv: Vec<String>,
}

/// Parses a memory size with an optional `K`/`M`/`G` suffix (powers of
/// 1024), per spec §6.
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits.parse().map_err(|_| Error::InvalidMemorySize(s.to_string()))?;
    value.checked_mul(multiplier).ok_or_else(|| Error::InvalidMemorySize(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_memory_size("256").unwrap(), 256);
        assert_eq!(parse_memory_size("4K").unwrap(), 4 * 1024);
        assert_eq!(parse_memory_size("16M").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_memory_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_memory_size("big").is_err());
        assert!(parse_memory_size("").is_err());
    }
}
