use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;

use address_base::report::Level;
use address_base::{count_records, run_init, ImportOptions};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => run_init_command(&args[2..]),
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(2);
        }
        None => {
            print_usage();
            std::process::exit(2);
        }
    }
}

fn print_usage() {
    eprintln!("Usage: address-base init <records.ndjson> [--db PATH] [--limit N] [--workers N]");
}

fn run_init_command(args: &[String]) -> Result<()> {
    let mut input_path: Option<PathBuf> = None;
    let mut db_path = PathBuf::from("addresses.db");
    let mut options = ImportOptions::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--db" => match iter.next() {
                Some(value) => db_path = PathBuf::from(value),
                None => bail!("--db requires a path"),
            },
            "--limit" => match iter.next() {
                Some(value) => options.limit = value.parse()?,
                None => bail!("--limit requires a number"),
            },
            "--workers" => match iter.next() {
                Some(value) => options.workers = value.parse()?,
                None => bail!("--workers requires a number"),
            },
            other => input_path = Some(PathBuf::from(other)),
        }
    }
    let Some(input_path) = input_path else {
        print_usage();
        std::process::exit(2);
    };

    println!("🗄️  Address Base - Initial Import");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Counting records...");
    let total = count_records(&input_path)?;
    println!("✓ {} records in {}", total, input_path.display());
    if options.limit > 0 {
        println!("✓ Limit set: processing at most {} records", options.limit);
    }

    println!(
        "\n💾 Importing into {} ({} workers, chunks of {})...",
        db_path.display(),
        options.workers,
        options.chunk_size
    );
    let reporter = run_init(&db_path, &input_path, &options)?;
    println!("✓ Import finished");

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📊 {}", reporter.summary());
    for entry in reporter.entries_at(Level::Error) {
        eprintln!("  ✗ {}: {}", entry.message, entry.context);
    }
    for entry in reporter.entries_at(Level::Warning) {
        eprintln!("  ⚠ {}: {}", entry.message, entry.context);
    }

    // Per-record failures are reported, not fatal: the batch still succeeded.
    Ok(())
}
