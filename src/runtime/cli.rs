use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::ExecOutput;
use crate::{Error, Result};

// Runs an engine CLI and returns combined stdout/stderr with the exit code.
// Only a failure to spawn the process is an error.
pub async fn run(program: &str, args: &[String], env: &[(String, String)]) -> Result<ExecOutput> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::engine(program, format!("failed to run {}: {}", program, e)))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ExecOutput {
        stdout: combined,
        // Killed by a signal still means the command ran and failed.
        exit_code: output.status.code().unwrap_or(1),
    })
}

// Like `run`, but a nonzero exit becomes an engine error with the output.
pub async fn run_checked(
    program: &str,
    args: &[String],
    env: &[(String, String)],
    what: &str,
) -> Result<String> {
    let out = run(program, args, env).await?;
    if !out.success() {
        return Err(Error::engine(
            program,
            format!("{} failed: {}", what, out.stdout.trim()),
        ));
    }
    Ok(out.stdout)
}

pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
