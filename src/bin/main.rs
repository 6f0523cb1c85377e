//! Screener CLI - Compile screening queries to SQL
//!
//! Usage:
//!   screener compile <query.json> [--skip-validation] [--output <format>]
//!   screener lint <query.json>
//!
//! Examples:
//!   screener compile queries/value_picks.json
//!   screener compile queries/value_picks.json --output json
//!   screener lint queries/value_picks.json

use clap::{Parser, Subcommand, ValueEnum};
use screener::compile::{CompileOptions, ScreenCompiler};
use screener::metrics::DerivedMetricsEngine;
use screener::validation::{Severity, ValidationEngine};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "screener")]
#[command(about = "Compiles declarative stock-screening filters to parameterized SQL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a query file to SQL
    Compile {
        /// Path to the JSON query file
        file: PathBuf,

        /// Skip the validation pass before compiling
        #[arg(long)]
        skip_validation: bool,

        /// Output format
        #[arg(short, long, default_value = "sql")]
        output: OutputFormat,
    },

    /// Validate a query file without generating SQL
    Lint {
        /// Path to the JSON query file
        file: PathBuf,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Output SQL only
    Sql,
    /// Output SQL, parameters and metadata as JSON
    Json,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            file,
            skip_validation,
            output,
        } => cmd_compile(file, skip_validation, output),
        Commands::Lint { file } => cmd_lint(file),
    }
}

fn read_query(file: &PathBuf) -> Result<serde_json::Value, ExitCode> {
    let source = match fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", file.display(), e);
            return Err(ExitCode::FAILURE);
        }
    };
    match serde_json::from_str(&source) {
        Ok(value) => Ok(value),
        Err(e) => {
            eprintln!("Error parsing '{}': {}", file.display(), e);
            Err(ExitCode::FAILURE)
        }
    }
}

fn cmd_compile(file: PathBuf, skip_validation: bool, output: OutputFormat) -> ExitCode {
    let query = match read_query(&file) {
        Ok(q) => q,
        Err(code) => return code,
    };

    let mut options = CompileOptions::default();
    if skip_validation {
        options = options.skip_validation();
    }

    match ScreenCompiler::new(options).compile_value(&query) {
        Ok(compiled) => {
            match output {
                OutputFormat::Sql => {
                    println!("{}", compiled.sql);
                }
                OutputFormat::Json => match serde_json::to_string_pretty(&compiled) {
                    Ok(rendered) => println!("{}", rendered),
                    Err(e) => {
                        eprintln!("Error rendering output: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Compilation error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_lint(file: PathBuf) -> ExitCode {
    let query = match read_query(&file) {
        Ok(q) => q,
        Err(code) => return code,
    };

    let metrics = DerivedMetricsEngine::new();
    let result = ValidationEngine::new(&metrics).validate_value(&query);

    if result.issues.is_empty() {
        println!("OK: no issues found");
        return ExitCode::SUCCESS;
    }

    for issue in &result.issues {
        let tag = match issue.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        let location = issue.path.as_deref().unwrap_or("query");
        println!("{:>7}  {} [{}]: {}", tag, location, issue.kind, issue.message);
        if let Some(suggestion) = &issue.suggestion {
            println!("         hint: {}", suggestion);
        }
    }

    println!();
    println!(
        "{} error(s), {} warning(s), {} condition(s), complexity {}",
        result.errors().count(),
        result.warnings().count(),
        result.metadata.condition_count,
        result.metadata.complexity_score
    );

    if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
