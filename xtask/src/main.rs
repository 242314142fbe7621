//! xtask: Development tasks for shmcall
//!
//! Run with: `cargo xtask <command>`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use xshell::{cmd, Shell};

const FUZZ_TARGETS: &[(&str, &str)] = &[
    ("handshake", "driver/executor interleavings on the channel model"),
    ("chunking", "chunk codec against a real channel buffer"),
];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for shmcall")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests (workspace + fuzz harnesses)
    Test,
    /// Run fuzz tests with bolero
    Fuzz {
        /// Target to fuzz ("handshake" or "chunking").
        /// If not specified, runs all fuzz harnesses in test mode (quick smoke test)
        target: Option<String>,
    },
    /// Run the reverse demo with debug logging
    Demo,
    /// Run clippy on all code
    Clippy,
    /// Check formatting
    Fmt {
        /// Fix formatting issues instead of just checking
        #[arg(long)]
        fix: bool,
    },
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn workspace_root() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::current_dir()?.join("xtask"),
    };
    manifest_dir
        .parent()
        .map(PathBuf::from)
        .ok_or_else(|| "xtask has no parent directory".into())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Commands::Test => {
            println!("=== Running workspace tests ===");

            if cmd!(sh, "cargo nextest --version").quiet().run().is_ok() {
                println!("Using cargo-nextest");
                cmd!(sh, "cargo nextest run --workspace").run()?;
                // nextest skips doctests
                cmd!(sh, "cargo test --workspace --doc").run()?;
            } else {
                println!("cargo-nextest not found, using cargo test");
                cmd!(sh, "cargo test --workspace").run()?;
            }

            println!("\n=== Running fuzz harnesses (test mode) ===");
            sh.change_dir(workspace_root.join("fuzz"));
            cmd!(sh, "cargo test").run()?;

            println!("\n=== All tests passed ===");
        }
        Commands::Fuzz { target } => {
            sh.change_dir(workspace_root.join("fuzz"));

            if let Some(t) = target {
                if !FUZZ_TARGETS.iter().any(|(name, _)| *name == t) {
                    return Err(format!("unknown fuzz target: {t}").into());
                }
                println!("=== Fuzzing target: {t} ===");
                println!("Press Ctrl+C to stop.\n");

                if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
                    eprintln!("cargo-bolero not found. Install with:");
                    eprintln!("  cargo install cargo-bolero");
                    return Err("cargo-bolero not installed".into());
                }

                cmd!(sh, "cargo bolero test {t}").run()?;
            } else {
                println!("=== Running all fuzz harnesses in test mode ===");
                println!("(For real fuzzing, specify a target: cargo xtask fuzz handshake)\n");
                println!("Available targets:");
                for (name, about) in FUZZ_TARGETS {
                    println!("  - {name:<10} ({about})");
                }
                println!();

                cmd!(sh, "cargo test").run()?;
            }
        }
        Commands::Demo => {
            println!("=== Running reverse demo ===");
            cmd!(sh, "cargo run -p shmcall --example reverse")
                .env("RUST_LOG", "shmcall=debug,reverse=info")
                .run()?;
        }
        Commands::Clippy => {
            println!("=== Running clippy ===");
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;

            println!("\n=== Clippy on fuzz crate ===");
            sh.change_dir(workspace_root.join("fuzz"));
            cmd!(sh, "cargo clippy --all-targets -- -D warnings").run()?;
        }
        Commands::Fmt { fix } => {
            if fix {
                println!("=== Fixing formatting ===");
                cmd!(sh, "cargo fmt --all").run()?;
                sh.change_dir(workspace_root.join("fuzz"));
                cmd!(sh, "cargo fmt").run()?;
            } else {
                println!("=== Checking formatting ===");
                cmd!(sh, "cargo fmt --all -- --check").run()?;
                sh.change_dir(workspace_root.join("fuzz"));
                cmd!(sh, "cargo fmt -- --check").run()?;
            }
        }
    }

    Ok(())
}
