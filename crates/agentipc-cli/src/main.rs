#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;

use agentipc_core::{paths, IpcConfig};
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "agentipc")]
#[command(author, version, about = "Local request/response IPC over Unix domain sockets", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Config file to read (defaults to the user config dir)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the socket directory
    #[arg(long, global = true, value_name = "DIR")]
    socket_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Run an agent exposing echo servers and a control server (foreground)
    Serve {
        /// Name of an echo server to expose (repeatable)
        #[arg(long = "name", value_name = "NAME")]
        names: Vec<String>,
    },

    /// Send one request to a named server and print the response
    Send {
        /// Server name
        name: String,

        /// Request payload
        payload: String,

        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Verify the socket directory's type, mode and owner
    Check,

    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(paths::default_config_path);
    let mut config = IpcConfig::load_or_default(&config_path).into_diagnostic()?;
    if let Some(dir) = &cli.socket_dir {
        config.socket_dir.clone_from(dir);
    }

    // Commands that print a report handle their own output
    if matches!(cli.command, Some(Commands::Check)) {
        return commands::check::run(&config, cli.json);
    }

    if let Some(Commands::Config { save }) = &cli.command {
        return commands::config::run(&config, &config_path, *save, cli.json);
    }

    logging::init(cli.verbose, cli.json);

    match cli.command {
        Some(Commands::Version) | None => commands::version::run(),
        Some(Commands::Serve { names }) => {
            let span = tracing::info_span!("serve", cmd = "serve");
            let _guard = span.enter();
            commands::serve::run(&config, &names, cli.json)
        }
        Some(Commands::Send {
            name,
            payload,
            timeout_ms,
        }) => commands::send::run(&config, &name, payload.as_bytes(), timeout_ms, cli.json),
        Some(Commands::Check | Commands::Config { .. }) => {
            unreachable!() // Handled above
        }
    }
}
