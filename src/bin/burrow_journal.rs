//! # Journal Diagnostic Tool
//!
//! Recovers a journal directory without starting the engine and prints
//! what recovery found: the last valid checkpoint, the dirty address if
//! the journal was not cleanly closed, and the page index in
//! `(volume path, page)` order with gap markers between non-adjacent
//! pages.
//!
//! ## Usage
//!
//! ```bash
//! # Inspect a journal directory
//! burrow-journal ./journal
//!
//! # Verbose recovery logging
//! RUST_LOG=debug burrow-journal ./journal
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use env_logger::{Builder, Env};
use eyre::{bail, Result, WrapErr};

use burrow_journal::volume::VolumeRegistry;
use burrow_journal::{Journal, JournalConfig};

fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut journal_path: Option<PathBuf> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--version" | "-v" => {
                println!("burrow-journal {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            arg if arg.starts_with('-') => {
                bail!("Unknown option: {}", arg);
            }
            path => {
                if journal_path.is_some() {
                    bail!("Multiple journal paths specified");
                }
                journal_path = Some(PathBuf::from(path));
            }
        }
        i += 1;
    }

    let journal_path = match journal_path {
        Some(p) => p,
        None => {
            print_usage();
            return Ok(());
        }
    };
    if !journal_path.is_dir() {
        bail!("{:?} is not a journal directory", journal_path);
    }

    let journal = Journal::open(
        JournalConfig::new(&journal_path),
        Arc::new(VolumeRegistry::new()),
    )
    .wrap_err_with(|| format!("failed to open journal at {:?}", journal_path))?;
    journal.recover()?;

    println!();
    println!("Last valid checkpoint: {}", journal.last_valid_checkpoint());
    match journal.dirty_recovery_file_address() {
        Some(address) => println!("Journal not cleanly closed; dirty from {}", address),
        None => println!("Journal cleanly closed"),
    }
    println!(
        "Generations: {}..{}",
        journal.first_generation(),
        journal.current_generation()
    );
    println!();
    println!("Page index ({} entries):", journal.page_index_size());
    println!();

    let mut previous: Option<u64> = None;
    for (page, address) in journal.page_index_snapshot() {
        if let Some(previous) = previous {
            let gap = page.page().saturating_sub(previous);
            if gap > 1 {
                println!("---{}---", gap);
            }
        }
        println!("{}  {}", page, address);
        previous = Some(page.page());
    }

    journal.close()?;
    Ok(())
}

fn print_usage() {
    println!("burrow-journal - journal recovery diagnostics");
    println!();
    println!("USAGE:");
    println!("    burrow-journal [OPTIONS] <journal-dir>");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Show this help");
    println!("    -v, --version    Show version");
}
