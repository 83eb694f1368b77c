use tokio::process::Command;
use tracing::debug;

use super::{DriverError, DriverResult};

/// Run `program` and return its stdout, failing on a non-zero exit.
pub(super) async fn run(program: &str, args: &[&str]) -> DriverResult<String> {
    debug!(program, ?args, "Running");
    let output = Command::new(program).args(args).output().await?;

    if !output.status.success() {
        return Err(DriverError::Command {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Like [`run`], but a non-zero exit yields `None`.
pub(super) async fn run_optional(program: &str, args: &[&str]) -> DriverResult<Option<String>> {
    match run(program, args).await {
        Ok(out) => Ok(Some(out)),
        Err(DriverError::Command { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}
