//! branchstore - a branchable transactional statement store
//!
//! This is the main entry point for the branchstore command-line interface.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use branchstore::db::{CommandOutcome, Database, DatabaseConfig, Repl};
use branchstore::transaction::IsolationLevel;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse simple command line args.
    let mut config_path: Option<PathBuf> = None;
    let mut isolation: Option<IsolationLevel> = None;
    let mut verbose = false;
    let mut execute: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = Some(PathBuf::from(path)),
                    None => return missing_value("--config"),
                }
            }
            "-i" | "--isolation" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    return missing_value("--isolation");
                };
                match value.parse::<IsolationLevel>() {
                    Ok(level) => isolation = Some(level),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            }
            "-e" | "--execute" => {
                i += 1;
                match args.get(i) {
                    Some(command) => execute.push(command.clone()),
                    None => return missing_value("--execute"),
                }
            }
            "-v" | "--verbose" => {
                verbose = true;
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("branchstore v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg => {
                eprintln!("Unknown option: {}", arg);
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(path) => match DatabaseConfig::from_json_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => DatabaseConfig::new(),
    };
    if let Some(level) = isolation {
        config = config.default_isolation(level);
    }
    if verbose {
        config = config.verbose(true);
    }
    init_tracing(config.verbose);

    let db = match Database::open(config) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error opening database: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = if execute.is_empty() {
        Repl::new(db).run()
    } else {
        execute_commands(db, &execute)
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn missing_value(flag: &str) -> ExitCode {
    eprintln!("Missing value for {}", flag);
    ExitCode::FAILURE
}

fn print_help() {
    println!("branchstore - a branchable transactional statement store");
    println!();
    println!("Usage: branchstore [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config FILE        Load configuration from a JSON file");
    println!("  -i, --isolation LEVEL    Default isolation level (default: SNAPSHOT_READ)");
    println!("  -e, --execute CMD        Execute a command and exit (repeatable)");
    println!("  -v, --verbose            Enable debug logging");
    println!("  -h, --help               Show this help message");
    println!("  --version                Show version");
    println!();
    println!("Examples:");
    println!("  branchstore                                   Start the REPL");
    println!("  branchstore -i serializable                   Start the REPL, serializable by default");
    println!("  branchstore -e '.add ex:a ex:p ex:b' -e '.match'  Run commands and exit");
}

fn execute_commands(db: Database, commands: &[String]) -> branchstore::db::DatabaseResult<()> {
    let mut repl = Repl::new(db);
    for command in commands {
        match repl.execute(command)? {
            CommandOutcome::Output(text) if !text.is_empty() => println!("{}", text),
            CommandOutcome::Output(_) => {}
            CommandOutcome::Quit => break,
        }
    }
    Ok(())
}
