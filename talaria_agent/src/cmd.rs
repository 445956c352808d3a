//! Subprocess helper for sources that scrape a system tool's output.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

/// Run `program` with a deadline and return its stdout. The child is killed if
/// the deadline passes.
pub async fn run_cmd(program: &str, args: &[&str], budget: Duration) -> Result<String> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let out = timeout(budget, cmd.output())
        .await
        .with_context(|| format!("{program} timed out after {budget:?}"))?
        .with_context(|| format!("spawning {program}"))?;
    if !out.status.success() {
        warn!(
            program,
            ?args,
            status = %out.status,
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "subprocess failed"
        );
        bail!("{program} exited with {}", out.status);
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}
