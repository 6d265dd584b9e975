use std::io;
use std::os::unix::fs::PermissionsExt;
use std::time::UNIX_EPOCH;

use coffer::Coffer;

use crate::error::{CliError, CliResult};
use crate::helpers::{
    close_coffer, hex_string, parse_scrypt_preset, resolve_password, resolve_password_create,
    scrypt_preset_name, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BLOCKS,
};

/// Options shared by the file commands, parsed from the argument tail.
struct FileArgs {
    path: String,
    password_file: Option<String>,
    block_size: usize,
    scrypt_preset: String,
}

fn parse_file_args(args: &[String], usage: &str) -> Result<FileArgs, CliError> {
    if args.is_empty() {
        return Err(CliError::new(format!("Usage: {}", usage)));
    }

    let path = args[0].clone();
    let mut password_file = None;
    let mut block_size = DEFAULT_BLOCK_SIZE;
    let mut scrypt_preset = String::from("default");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-p" | "--password-file" => {
                i += 1;
                password_file = Some(
                    args.get(i)
                        .cloned()
                        .ok_or_else(|| CliError::new("-p requires a file argument"))?,
                );
            }
            "-s" | "--block-size" => {
                i += 1;
                block_size = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| CliError::new("-s requires a numeric argument"))?;
            }
            "--scrypt" => {
                i += 1;
                scrypt_preset = args
                    .get(i)
                    .cloned()
                    .ok_or_else(|| CliError::new("--scrypt requires a preset argument"))?;
            }
            other => {
                return Err(CliError::new(format!(
                    "Unknown option: {}. Usage: {}",
                    other, usage
                )));
            }
        }
        i += 1;
    }

    Ok(FileArgs { path, password_file, block_size, scrypt_preset })
}

pub fn cmd_enc(args: &[String]) -> CliResult {
    let opts = parse_file_args(args, "coffer enc <file> [-p <pwfile>] [-s N] [--scrypt PRESET]")?;
    let scrypt = parse_scrypt_preset(&opts.scrypt_preset)?;
    let password = resolve_password_create(opts.password_file.as_deref())?;

    let f = Coffer::create(
        &opts.path,
        password.as_bytes(),
        scrypt,
        opts.block_size,
        DEFAULT_CACHE_BLOCKS,
    )
    .map_err(|e| CliError::new(format!("Error creating coffer file: {}", e)))?;

    let written = io::copy(&mut io::stdin().lock(), &mut &f)
        .map_err(|e| CliError::new(format!("Error encrypting: {}", e)))?;
    close_coffer(f)?;

    eprintln!("{} bytes written to {}", written, opts.path);
    Ok(())
}

pub fn cmd_dec(args: &[String]) -> CliResult {
    let opts = parse_file_args(args, "coffer dec <file> [-p <pwfile>]")?;
    let password = resolve_password(opts.password_file.as_deref())?;

    let f = Coffer::open(&opts.path, password.as_bytes(), DEFAULT_CACHE_BLOCKS)
        .map_err(|e| CliError::new(format!("Error opening coffer file: {}", e)))?;

    io::copy(&mut &f, &mut io::stdout().lock())
        .map_err(|e| CliError::new(format!("Error decrypting: {}", e)))?;
    close_coffer(f)
}

pub fn cmd_info(args: &[String]) -> CliResult {
    let opts = parse_file_args(args, "coffer info <file> [-p <pwfile>]")?;
    let password = resolve_password(opts.password_file.as_deref())?;

    let f = Coffer::open(&opts.path, password.as_bytes(), DEFAULT_CACHE_BLOCKS)
        .map_err(|e| CliError::new(format!("Error opening coffer file: {}", e)))?;
    let stat = f
        .stat()
        .map_err(|e| CliError::new(format!("Error reading file metadata: {}", e)))?;

    let mtime_secs = stat
        .modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let overhead = if stat.size > 0 {
        stat.encrypted_size as f64 * 100.0 / stat.size as f64 - 100.0
    } else {
        0.0
    };

    println!("           File Name: {}", stat.name);
    println!("   Modification Time: {} (epoch seconds)", mtime_secs);
    println!("           File Mode: {:o}", stat.permissions.mode());
    println!("        Content Size: {} bytes", stat.size);
    println!("   File Size On Disk: {} bytes", stat.encrypted_size);
    println!(" Encryption Overhead: {:.2}%", overhead);
    println!("  Content Block Size: {} bytes", stat.block_size);
    println!("Encrypted Block Size: {} bytes", stat.disk_block_size);
    println!(" Total Blocks Writen: {} (= unique nonces)", stat.blocks_written);
    println!("       SCrypt Preset: {}", scrypt_preset_name(stat.scrypt_params));
    println!(
        "   SCrypt Parameters: N={}, R={}, P={}, keyLength=96, salt=",
        stat.scrypt_params.n, stat.scrypt_params.r, stat.scrypt_params.p
    );
    let hexa = hex_string(&stat.scrypt_salt);
    println!("{:>69}", &hexa[..64]);
    println!("{:>69}", &hexa[64..128]);
    println!("{:>69}", &hexa[128..]);

    close_coffer(f)
}
