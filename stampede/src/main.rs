mod api;
mod cli;
mod config;
mod exit_codes;
mod run;
mod run_error;
mod runtime;
mod summary;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn init_tracing(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = match cli::Cli::try_parse() {
        Ok(v) => v,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    exit_codes::ExitCode::Success.as_i32()
                }
                _ => exit_codes::ExitCode::InvalidInput.as_i32(),
            };
            std::process::exit(code);
        }
    };

    let code = match cli.command {
        cli::Command::Run(args) => {
            init_tracing(args.quiet);
            match run::run(args).await {
                Ok(code) => code.as_i32(),
                Err(err) => {
                    eprintln!("{err}");
                    err.exit_code().as_i32()
                }
            }
        }
        cli::Command::Archive(args) => {
            init_tracing(false);
            match run::archive(args) {
                Ok(()) => exit_codes::ExitCode::Success.as_i32(),
                Err(err) => {
                    eprintln!("{err}");
                    err.exit_code().as_i32()
                }
            }
        }
    };

    std::process::exit(code);
}
