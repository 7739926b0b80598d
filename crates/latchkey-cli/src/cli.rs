//! Argument parsing and command dispatch for the `latchkey` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use latchkey_config::defaults::DEFAULT_INSTANCE_ID;
use latchkey_telemetry::{DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, init_logging};

use crate::commands::{check, defaults, inspect, seal};
use crate::error::CliResult;

/// Parses CLI arguments, installs logging, and executes the requested
/// command. Returns the process exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();
    let logging = LoggingConfig {
        level: &cli.log_level,
        format: cli.log_format,
    };
    if let Err(err) = init_logging(&logging) {
        eprintln!("warning: {err}");
    }

    match dispatch(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {}", err.display_message());
            err.exit_code()
        }
    }
}

fn dispatch(cli: &Cli) -> CliResult<()> {
    match &cli.command {
        Command::Check(args) => check::handle_check(args, cli.output),
        Command::Inspect(args) => inspect::handle_inspect(args, cli.output),
        Command::Seal(args) => seal::handle_seal(args),
        Command::Defaults(args) => defaults::handle_defaults(args),
    }
}

#[derive(Parser)]
#[command(name = "latchkey", about = "Offline tooling for latchkey configuration trees")]
pub(crate) struct Cli {
    #[arg(long, global = true, env = "LATCHKEY_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    log_level: String,
    #[arg(
        long,
        global = true,
        env = "LATCHKEY_LOG_FORMAT",
        value_parser = parse_log_format,
        default_value = "pretty"
    )]
    log_format: LogFormat,
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate one or more source files.
    Check(CheckArgs),
    /// List the keys of a source file with their kinds.
    Inspect(InspectArgs),
    /// Encrypt a value for a secure setting.
    Seal(SealArgs),
    /// Print the default source of a schema.
    Defaults(DefaultsArgs),
}

#[derive(Args, Debug)]
pub(crate) struct CheckArgs {
    #[arg(required = true)]
    pub(crate) files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub(crate) struct InspectArgs {
    pub(crate) file: PathBuf,
    /// Master key used to recognise bare encrypted strings.
    #[arg(long, env = "LATCHKEY_KEY_FILE")]
    pub(crate) key_file: Option<PathBuf>,
    /// Schema id; defaults to the file stem.
    #[arg(long)]
    pub(crate) schema: Option<String>,
    #[arg(long, default_value = DEFAULT_INSTANCE_ID)]
    pub(crate) instance: String,
}

#[derive(Args, Debug)]
pub(crate) struct SealArgs {
    /// Master key file; created when missing.
    #[arg(long, env = "LATCHKEY_KEY_FILE")]
    pub(crate) key_file: PathBuf,
    #[arg(long)]
    pub(crate) schema: String,
    #[arg(long, default_value = DEFAULT_INSTANCE_ID)]
    pub(crate) instance: String,
    /// Treat the value as JSON rather than as a string.
    #[arg(long)]
    pub(crate) json: bool,
    /// Print the bare payload instead of the object form.
    #[arg(long)]
    pub(crate) bare: bool,
    pub(crate) value: String,
}

#[derive(Args, Debug)]
pub(crate) struct DefaultsArgs {
    #[arg(long, env = "LATCHKEY_ROOT")]
    pub(crate) root: PathBuf,
    pub(crate) schema: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Table,
    Json,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse().map_err(|err: latchkey_telemetry::TelemetryError| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "latchkey",
            "check",
            "a.json",
            "b.json",
            "--output",
            "json",
            "--log-format",
            "json",
        ])
        .expect("parse");
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Check(args) => assert_eq!(args.files.len(), 2),
            _ => panic!("expected check"),
        }
    }

    #[test]
    fn seal_defaults_the_instance() {
        let cli = Cli::try_parse_from([
            "latchkey",
            "seal",
            "--key-file",
            "master.key",
            "--schema",
            "editor",
            "hunter2",
        ])
        .expect("parse");
        match cli.command {
            Command::Seal(args) => {
                assert_eq!(args.instance, DEFAULT_INSTANCE_ID);
                assert_eq!(args.value, "hunter2");
                assert!(!args.json && !args.bare);
            }
            _ => panic!("expected seal"),
        }
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["latchkey", "--log-format", "xml", "check", "a.json"]).is_err());
        assert!(Cli::try_parse_from(["latchkey", "check"]).is_err());
    }
}
