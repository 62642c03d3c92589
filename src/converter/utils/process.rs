//! Bounded execution of external tools.

use crate::converter::error::{Error, Result};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Maximum number of stderr lines carried into error messages.
const DIAGNOSTIC_LINES: usize = 20;

/// Run a command to completion within `budget`, capturing its output.
///
/// The child is killed if the budget elapses. A non-zero exit status is
/// returned as-is; callers decide whether that is fatal.
pub async fn run(mut command: Command, label: &str, budget: Duration) -> Result<Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    log::debug!("Running {} ({:?})", label, command.as_std());

    match tokio::time::timeout(budget, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(Error::CommandFailed {
            command: label.to_string(),
            error,
        }),
        Err(_elapsed) => Err(Error::Timeout {
            operation: label.to_string(),
            seconds: budget.as_secs(),
        }),
    }
}

/// Like [`run`], but a non-zero exit becomes [`Error::BuildFailure`] with the
/// tool's diagnostic appended.
pub async fn run_checked(command: Command, label: &str, budget: Duration) -> Result<Output> {
    let output = run(command, label, budget).await?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(Error::BuildFailure {
            step: label.to_string(),
            status: output.status.to_string(),
            diagnostic: diagnostic_tail(&output),
        })
    }
}

/// Last lines of stderr (or stdout when stderr is empty).
pub fn diagnostic_tail(output: &Output) -> String {
    let stream = if output.stderr.iter().any(|b| !b.is_ascii_whitespace()) {
        &output.stderr
    } else {
        &output.stdout
    };
    let text = String::from_utf8_lossy(stream);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    lines[start..].join("\n")
}
