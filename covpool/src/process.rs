// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Serializable representation of a process output.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Output {
    pub exit_status: ExitStatus,
    pub stderr: String,
    pub stdout: String,
}

impl From<std::process::Output> for Output {
    fn from(output: std::process::Output) -> Self {
        let exit_status = output.status.into();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        Self {
            exit_status,
            stderr,
            stdout,
        }
    }
}

/// Serializable representation of a process exit status.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl From<std::process::ExitStatus> for ExitStatus {
    #[cfg(target_os = "windows")]
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: None,
            success: status.success(),
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        Self {
            code: status.code(),
            signal: status.signal(),
            success: status.success(),
        }
    }
}

/// Run an external command to completion, capturing its output.
///
/// A non-zero exit is an error carrying the full command line and the
/// captured stdout/stderr, so callers never lose the tool's diagnostics.
pub async fn run_cmd(program: &str, argv: &[String]) -> Result<Output> {
    run_cmd_impl(program, argv, None).await
}

/// As `run_cmd`, but with an explicit working directory.
pub async fn run_cmd_in(program: &str, argv: &[String], dir: &Path) -> Result<Output> {
    run_cmd_impl(program, argv, Some(dir)).await
}

async fn run_cmd_impl(program: &str, argv: &[String], dir: Option<&Path>) -> Result<Output> {
    debug!("running command: cmd:{:?} argv:{:?} dir:{:?}", program, argv, dir);

    let mut cmd = Command::new(program);
    cmd.env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .args(argv);

    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .spawn()
        .with_context(|| format!("process failed to start: {}", program))?
        .wait_with_output()
        .await
        .with_context(|| format!("process failed to run: {}", program))?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "command failed: {} {} status:{} stdout:{:?} stderr:{:?}",
            program,
            argv.join(" "),
            output.status,
            stdout,
            stderr
        );
    }

    Ok(output.into())
}

/// Run `first | second` with `second` executing in `dir`.
///
/// The intermediate stream is raw bytes, not text, and flows through an OS
/// pipe connecting the two processes directly, so neither the payload nor
/// the consumer's output is ever buffered whole in this process. Used for
/// archive extraction, where `rpm2cpio` emits a binary cpio stream.
pub async fn run_pipeline(
    first: (&str, &[String]),
    second: (&str, &[String]),
    dir: &Path,
) -> Result<()> {
    debug!("running pipeline: {:?} | {:?} in {}", first, second, dir.display());

    let mut producer = Command::new(first.0)
        .args(first.1)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("process failed to start: {}", first.0))?;

    let pipe: Stdio = producer
        .stdout
        .take()
        .ok_or_else(|| format_err!("stdout not captured: {}", first.0))?
        .try_into()
        .with_context(|| format!("unable to connect pipeline from: {}", first.0))?;

    let consumer = Command::new(second.0)
        .args(second.1)
        .current_dir(dir)
        .stdin(pipe)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("process failed to start: {}", second.0))?;

    // Both ends are drained concurrently; waiting on them in sequence could
    // deadlock once either output exceeds the pipe buffer.
    let (produced, consumed) = tokio::try_join!(
        producer.wait_with_output(),
        consumer.wait_with_output()
    )
    .with_context(|| format!("pipeline failed to run: {} | {}", first.0, second.0))?;

    if !produced.status.success() {
        bail!(
            "command failed: {} {} status:{} stderr:{:?}",
            first.0,
            first.1.join(" "),
            produced.status,
            String::from_utf8_lossy(&produced.stderr)
        );
    }

    if !consumed.status.success() {
        bail!(
            "command failed: {} {} status:{} stderr:{:?}",
            second.0,
            second.1.join(" "),
            consumed.status,
            String::from_utf8_lossy(&consumed.stderr)
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Vec<String> {
        argv.iter().map(|a| a.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_cmd_captures_stdout() {
        let output = run_cmd("echo", &args(&["hello"])).await.unwrap();
        assert!(output.exit_status.success);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_cmd_nonzero_exit_is_error() {
        let err = run_cmd("false", &[]).await.unwrap_err();
        let text = format!("{:#}", err);
        assert!(text.contains("command failed"), "got: {}", text);
        assert!(text.contains("false"), "got: {}", text);
    }

    #[tokio::test]
    async fn test_run_cmd_missing_binary_is_error() {
        let err = run_cmd("covpool-no-such-binary", &[]).await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to start"));
    }

    #[tokio::test]
    async fn test_run_pipeline_connects_processes() {
        let dir = tempfile::tempdir().unwrap();
        run_pipeline(
            ("echo", &args(&["hello"])),
            ("tee", &args(&["out.txt"])),
            dir.path(),
        )
        .await
        .unwrap();

        let text = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(text, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_pipeline_streams_past_pipe_buffer() {
        // Both legs carry well over a pipe buffer's worth of data.
        let dir = tempfile::tempdir().unwrap();
        run_pipeline(
            ("head", &args(&["-c", "1048576", "/dev/zero"])),
            ("cat", &[]),
            dir.path(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_pipeline_consumer_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_pipeline(("echo", &args(&["x"])), ("false", &[]), dir.path())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("command failed"));
    }

    #[tokio::test]
    async fn test_run_cmd_in_sets_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = run_cmd_in("pwd", &[], dir.path()).await.unwrap();
        let reported = std::path::PathBuf::from(output.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
