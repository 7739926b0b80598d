//! Output renderers for CLI commands.

use anyhow::anyhow;
use serde::Serialize;

use crate::cli::OutputFormat;
use crate::commands::check::CheckReport;
use crate::commands::inspect::InspectRow;
use crate::error::{CliError, CliResult};

pub(crate) fn render_check(reports: &[CheckReport], format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(reports)?,
        OutputFormat::Table => {
            for report in reports {
                println!("{}", check_line(report));
            }
        }
    }
    Ok(())
}

pub(crate) fn render_inspect(rows: &[InspectRow], format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(rows)?,
        OutputFormat::Table => {
            println!("{:<32} {:<8} VALUE", "KEY", "KIND");
            for row in rows {
                println!("{}", inspect_line(row));
            }
        }
    }
    Ok(())
}

fn check_line(report: &CheckReport) -> String {
    match (&report.error, report.keys) {
        (Some(error), _) => format!("fail {}: {error}", report.path.display()),
        (None, keys) => format!("ok   {} ({} keys)", report.path.display(), keys.unwrap_or(0)),
    }
}

fn inspect_line(row: &InspectRow) -> String {
    let kind = serde_json::to_value(row.kind)
        .ok()
        .and_then(|value| value.as_str().map(str::to_owned))
        .unwrap_or_default();
    format!("{:<32} {:<8} {}", row.key, kind, row.value)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::failure(anyhow!("failed to format JSON: {err}")))?;
    println!("{text}");
    Ok(())
}
