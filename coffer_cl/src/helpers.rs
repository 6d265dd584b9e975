use std::io::Write;

use coffer::ScryptParams;

use crate::error::CliError;

/// Default before-encryption block size.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Default cache capacity (decrypted blocks held in memory).
pub const DEFAULT_CACHE_BLOCKS: usize = 10;

/// Environment variable for dev/test convenience.
/// If set, its value is used as the password instead of prompting
/// interactively. NOT intended for production use.
const PASSWORD_ENV_VAR: &str = "COFFER_PASSWORD";

/// Resolve a password for opening a coffer file.
///
/// 1. If a password file was given (`-p path` or `-p @path`), read it and
///    trim the trailing newline. A password on the command line itself is
///    not supported: argv is visible to every user on a multi-user host.
/// 2. If `COFFER_PASSWORD` is set, use its value.
/// 3. Otherwise, prompt interactively via rpassword.
pub fn resolve_password(password_file: Option<&str>) -> Result<String, CliError> {
    if let Some(spec) = password_file {
        return read_password_file(spec);
    }
    if let Ok(pw) = std::env::var(PASSWORD_ENV_VAR) {
        return Ok(pw);
    }
    eprint!("Password: ");
    std::io::stderr().flush().ok();
    rpassword::read_password().map_err(|e| CliError::new(format!("Error reading password: {}", e)))
}

/// Resolve a password for creating a coffer file. Interactive entry is
/// prompted twice for confirmation; file and env sources are taken as-is.
pub fn resolve_password_create(password_file: Option<&str>) -> Result<String, CliError> {
    if let Some(spec) = password_file {
        return read_password_file(spec);
    }
    if let Ok(pw) = std::env::var(PASSWORD_ENV_VAR) {
        return Ok(pw);
    }
    eprint!("Password: ");
    std::io::stderr().flush().ok();
    let pw1 = rpassword::read_password()
        .map_err(|e| CliError::new(format!("Error reading password: {}", e)))?;
    eprint!("Confirm password: ");
    std::io::stderr().flush().ok();
    let pw2 = rpassword::read_password()
        .map_err(|e| CliError::new(format!("Error reading password: {}", e)))?;
    if pw1 != pw2 {
        return Err(CliError::new("Passwords do not match"));
    }
    Ok(pw1)
}

fn read_password_file(spec: &str) -> Result<String, CliError> {
    let path = spec.strip_prefix('@').unwrap_or(spec);
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CliError::new(format!("Error reading password file '{}': {}", path, e)))?;
    Ok(contents.trim_end_matches(['\r', '\n']).to_string())
}

/// Parse a scrypt preset name.
pub fn parse_scrypt_preset(name: &str) -> Result<ScryptParams, CliError> {
    match name {
        "min" => Ok(ScryptParams::MIN),
        "default" => Ok(ScryptParams::RECOMMENDED),
        "better" => Ok(ScryptParams::BETTER),
        "max" => Ok(ScryptParams::MAX),
        other => Err(CliError::new(format!(
            "Unknown scrypt preset '{}' (expected min, default, better or max)",
            other
        ))),
    }
}

/// Human-readable name for stored scrypt parameters.
pub fn scrypt_preset_name(params: ScryptParams) -> &'static str {
    if params == ScryptParams::MIN {
        "Minimal"
    } else if params == ScryptParams::RECOMMENDED {
        "Recommended"
    } else if params == ScryptParams::BETTER {
        "Better"
    } else if params == ScryptParams::MAX {
        "Maximum"
    } else {
        "Custom"
    }
}

/// Lowercase hex rendering, for printing the salt.
pub fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Close a coffer file, wrapping the error for display.
pub fn close_coffer(f: coffer::Coffer) -> Result<(), CliError> {
    f.close()
        .map_err(|e| CliError::new(format!("Error closing coffer file: {}", e)))
}
