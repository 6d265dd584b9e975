use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};

use coffer::{Coffer, ScryptParams};

use crate::error::{CliError, CliResult};
use crate::helpers::{DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BLOCKS};

/// Fixed password for the throwaway soak files.
const SOAK_PASSWORD: &[u8] = b"coffer-soak-test-password-0123";

const DEFAULT_SIZE_MB: usize = 4;

// ---------------------------------------------------------------------------
// Cleanup guard — deletes temp files on drop (even on panic)
// ---------------------------------------------------------------------------

struct CleanupGuard {
    paths: Vec<String>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

struct SoakArgs {
    prefix: String,
    size: usize,
    block_size: usize,
}

fn parse_soak_args(args: &[String]) -> Result<SoakArgs, CliError> {
    if args.is_empty() {
        return Err(CliError::new(
            "Usage: coffer soak <prefix> [--size-mb N] [-s N]",
        ));
    }

    let prefix = args[0].clone();
    let mut size_mb = DEFAULT_SIZE_MB;
    let mut block_size = DEFAULT_BLOCK_SIZE;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--size-mb" => {
                i += 1;
                size_mb = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| CliError::new("--size-mb requires a numeric argument"))?;
            }
            "-s" | "--block-size" => {
                i += 1;
                block_size = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| CliError::new("-s requires a numeric argument"))?;
            }
            other => {
                return Err(CliError::new(format!(
                    "Unknown option: {}. Usage: coffer soak <prefix> [--size-mb N] [-s N]",
                    other
                )));
            }
        }
        i += 1;
    }

    Ok(SoakArgs { prefix, size: size_mb * 1024 * 1024, block_size })
}

/// Chunk sizes deliberately misaligned with the block size.
fn misaligned_chunk_sizes(block_size: usize) -> Vec<usize> {
    let mut sizes: Vec<usize> = (1..=16).collect();
    sizes.extend([
        256,
        block_size - 100,
        block_size - 1,
        block_size,
        block_size + 1,
        block_size + 100,
        block_size * 2,
        block_size * 3,
        block_size * 4,
        block_size * 4 - 1,
        block_size * 4 + 1,
    ]);
    sizes
}

/// Deterministic contents for one round; varies per round so rewrites are
/// observable.
fn round_byte(offset: usize, round: usize) -> u8 {
    (offset.wrapping_add(round.wrapping_mul(131))) as u8
}

// ---------------------------------------------------------------------------
// The soak scenario
// ---------------------------------------------------------------------------

/// Apply identical write/read patterns to a plain native file and a
/// coffer, and fail loudly on the first divergence.
pub fn cmd_soak(args: &[String]) -> CliResult {
    let opts = parse_soak_args(args)?;

    let native_path = format!("{}.native", opts.prefix);
    let coffer_path = format!("{}.coffer", opts.prefix);
    let _guard = CleanupGuard {
        paths: vec![native_path.clone(), coffer_path.clone()],
    };

    eprintln!(
        "soak: writing two {} MB files ({}, {}) with many misaligned I/O patterns and comparing them",
        opts.size / 1024 / 1024,
        native_path,
        coffer_path
    );

    let mut native = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&native_path)
        .map_err(|e| CliError::new(format!("Error creating {}: {}", native_path, e)))?;
    let enc = Coffer::create(
        &coffer_path,
        SOAK_PASSWORD,
        ScryptParams::MIN,
        opts.block_size,
        DEFAULT_CACHE_BLOCKS,
    )
    .map_err(|e| CliError::new(format!("Error creating {}: {}", coffer_path, e)))?;

    let chunk_sizes = misaligned_chunk_sizes(opts.block_size);

    eprintln!("1. initial fill, chunk_size={}", opts.block_size);
    write_fully(&mut native, &enc, opts.size, opts.block_size, 0)?;

    for (i, &chunk) in chunk_sizes.iter().enumerate() {
        eprintln!("2.{}. full compare, read_chunk_size={}", i + 1, chunk);
        fully_compare(&mut native, &enc, opts.size, chunk)?;
    }

    for (i, &chunk) in chunk_sizes.iter().enumerate() {
        eprintln!("3.{}.1. rewrite, chunk_size={}", i + 1, chunk);
        write_fully(&mut native, &enc, opts.size, chunk, i + 1)?;
        eprintln!("3.{}.2. verify, chunk_size={}", i + 1, opts.block_size);
        fully_compare(&mut native, &enc, opts.size, opts.block_size)?;
    }

    enc.sync()
        .map_err(|e| CliError::new(format!("Error syncing: {}", e)))?;
    enc.close()
        .map_err(|e| CliError::new(format!("Error closing: {}", e)))?;

    eprintln!("soak: OK, no divergence found");
    Ok(())
}

fn write_fully(
    native: &mut fs::File,
    enc: &Coffer,
    total: usize,
    chunk_size: usize,
    round: usize,
) -> CliResult {
    native
        .seek(SeekFrom::Start(0))
        .map_err(|e| CliError::new(format!("native seek: {}", e)))?;
    enc.seek(0, 0)
        .map_err(|e| CliError::new(format!("coffer seek: {}", e)))?;

    let mut offset = 0usize;
    let mut buf = vec![0u8; chunk_size];
    while offset < total {
        let n = chunk_size.min(total - offset);
        for (i, b) in buf[..n].iter_mut().enumerate() {
            *b = round_byte(offset + i, round);
        }
        native
            .write_all(&buf[..n])
            .map_err(|e| CliError::new(format!("native write at {}: {}", offset, e)))?;
        let written = enc
            .write(&buf[..n])
            .map_err(|e| CliError::new(format!("coffer write at {}: {}", offset, e)))?;
        if written != n {
            return Err(CliError::new(format!(
                "coffer short write at {}: {} != {}",
                offset, written, n
            )));
        }
        offset += n;
    }
    Ok(())
}

fn fully_compare(
    native: &mut fs::File,
    enc: &Coffer,
    total: usize,
    chunk_size: usize,
) -> CliResult {
    native
        .seek(SeekFrom::Start(0))
        .map_err(|e| CliError::new(format!("native seek: {}", e)))?;
    enc.seek(0, 0)
        .map_err(|e| CliError::new(format!("coffer seek: {}", e)))?;

    let mut offset = 0usize;
    let mut nat_buf = vec![0u8; chunk_size];
    let mut enc_buf = vec![0u8; chunk_size];
    while offset < total {
        let n = chunk_size.min(total - offset);
        native
            .read_exact(&mut nat_buf[..n])
            .map_err(|e| CliError::new(format!("native read at {}: {}", offset, e)))?;
        read_exactly(enc, &mut enc_buf[..n])
            .map_err(|e| CliError::new(format!("coffer read at {}: {}", offset, e)))?;
        if nat_buf[..n] != enc_buf[..n] {
            let first_diff = nat_buf[..n]
                .iter()
                .zip(&enc_buf[..n])
                .position(|(a, b)| a != b)
                .unwrap_or(0);
            return Err(CliError::new(format!(
                "files diverge at byte {}",
                offset + first_diff
            )));
        }
        offset += n;
    }
    Ok(())
}

/// A coffer read stops at block boundaries only at end-of-stream, but be
/// strict anyway: fill the whole buffer or fail.
fn read_exactly(enc: &Coffer, buf: &mut [u8]) -> Result<(), CliError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = enc
            .read(&mut buf[filled..])
            .map_err(|e| CliError::new(e.to_string()))?;
        if n == 0 {
            return Err(CliError::new("unexpected end of stream"));
        }
        filled += n;
    }
    Ok(())
}
