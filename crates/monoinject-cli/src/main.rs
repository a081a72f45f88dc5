mod config;
#[cfg(windows)]
mod hijack;
#[cfg_attr(not(windows), allow(dead_code))]
mod pe;
#[cfg(windows)]
mod reader;
#[cfg_attr(not(windows), allow(dead_code))]
mod stub;
#[cfg(windows)]
mod target;

use std::process::ExitCode;

use clap::{ArgAction, CommandFactory, Parser};
use monoinject_shared::{InjectionFailure, InvocationResult};
use tracing_subscriber::EnvFilter;

use config::Settings;

#[derive(Parser, Debug)]
#[command(name = "monoinject")]
#[command(about = "Inject a managed assembly into a running Mono process", version)]
#[command(group(clap::ArgGroup::new("target").required(true)))]
pub(crate) struct Cli {
    /// Path to the managed assembly to load
    #[arg(long)]
    dll: String,
    /// Namespace of the class holding the entry point
    #[arg(long)]
    namespace: String,
    /// Class holding the entry point
    #[arg(long)]
    class: String,
    /// Static, parameterless method to call
    #[arg(long)]
    method: String,
    /// Executable name of the target (e.g., "game.exe")
    #[arg(long, group = "target")]
    exe: Option<String>,
    /// Process ID of the target
    #[arg(long, group = "target")]
    pid: Option<u32>,
    /// Mono runtime module (default: mono.dll, then the Unity runtimes)
    #[arg(long)]
    module: Option<String>,
    /// Give up on a remote call after this many milliseconds
    #[arg(long, value_name = "MS")]
    call_timeout_ms: Option<u64>,
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    if std::env::args_os().len() <= 1 {
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = match config::load(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", Cli::command().render_usage());
            eprintln!("ERROR: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!(
        "Attempting to inject {} into {}...",
        settings.request.assembly_file_name(),
        settings.target_label()
    );

    match run(&settings) {
        Ok(result) => {
            if let Some(object) = result.returned {
                println!("Method returned object at {}", object.address());
            }
            println!(
                "Injection complete. Called {}.",
                settings.request.entry_point()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Default level `warn`, one step more per `-v`; `RUST_LOG` wins when set.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(windows)]
fn run(settings: &Settings) -> Result<InvocationResult, InjectionFailure> {
    let provider = target::WindowsProcesses::new(settings.call_timeout);
    monoinject_shared::inject(&provider, &settings.request)
}

#[cfg(not(windows))]
fn run(_settings: &Settings) -> Result<InvocationResult, InjectionFailure> {
    Err(monoinject_shared::Error::UnsupportedPlatform.into())
}
