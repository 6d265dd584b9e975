mod cmd_file;
mod error;
mod helpers;
mod soak;

use std::env;
use std::process;

use crate::error::CliResult;

/// Metadata for a single command — used for dispatch and help generation.
struct CommandEntry {
    name: &'static str,
    usage: &'static str,
    description: &'static str,
    run: fn(&[String]) -> CliResult,
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// All commands. Order here = order in help output.
const COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        name: "enc",
        usage: "coffer enc <file> [-p <pwfile>] [-s N] [--scrypt PRESET]",
        description: "Encrypt stdin into a new coffer file",
        run: cmd_file::cmd_enc,
    },
    CommandEntry {
        name: "dec",
        usage: "coffer dec <file> [-p <pwfile>]",
        description: "Decrypt a coffer file to stdout",
        run: cmd_file::cmd_dec,
    },
    CommandEntry {
        name: "info",
        usage: "coffer info <file> [-p <pwfile>]",
        description: "Show coffer file metadata",
        run: cmd_file::cmd_info,
    },
    CommandEntry {
        name: "soak",
        usage: "coffer soak <prefix> [--size-mb N] [-s N]",
        description: "Mirror many misaligned I/O patterns against a native file and compare",
        run: soak::cmd_soak,
    },
];

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "--help" | "-h" => {
            print_usage();
            return;
        }
        "--version" | "-V" => {
            println!("coffer {}", VERSION);
            return;
        }
        _ => {}
    }

    let cmd_name = &args[1];
    let cmd_args = &args[2..];

    let result = match COMMANDS.iter().find(|c| c.name == cmd_name.as_str()) {
        Some(cmd) => (cmd.run)(cmd_args),
        None => {
            eprintln!("Unknown command: {}", cmd_name);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: coffer <command> [args...]");
    eprintln!();
    eprintln!("Commands:");

    let max_usage_len = COMMANDS.iter().map(|c| c.usage.len()).max().unwrap_or(0);
    for cmd in COMMANDS {
        eprintln!(
            "  {:<width$}  {}",
            cmd.usage,
            cmd.description,
            width = max_usage_len
        );
    }

    eprintln!();
    eprintln!("Options:");
    eprintln!("  --help, -h       Show this help message");
    eprintln!("  --version, -V    Show version");
    eprintln!();
    eprintln!("Notes:");
    eprintln!("  Passwords come from -p <pwfile> (an @ prefix on the path is accepted),");
    eprintln!("  the COFFER_PASSWORD environment variable, or an interactive prompt.");
    eprintln!("  Scrypt presets: min, default, better, max.");
}
