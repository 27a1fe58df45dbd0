//! Centralized subprocess execution.
//!
//! Every external binary the orchestrator drives goes through this module
//! so callers get captured output, debug-level command logging, and a
//! uniform error kind they can branch on ("binary missing" vs "binary
//! failed").

use std::ffi::OsStr;
use std::process::Output;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{program} not found on PATH")]
    Missing { program: String },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run a command, returning its raw output without inspecting the exit
/// status. `ErrorKind::NotFound` from the spawn maps to `Missing`.
pub async fn run_raw<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<Output, ExecError> {
    let rendered: Vec<&str> = args.iter().filter_map(|a| a.as_ref().to_str()).collect();
    debug!(program, args = %rendered.join(" "), "exec");

    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ExecError::Missing {
                program: program.to_string(),
            },
            _ => ExecError::Spawn {
                program: program.to_string(),
                source: e,
            },
        })
}

/// Run a command and require a zero exit status. Returns stdout.
pub async fn run<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<String, ExecError> {
    let output = run_raw(program, args).await?;

    if !output.status.success() {
        return Err(ExecError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command through the elevation helper. Bridge and TAP operations
/// use the binary's own CAP_NET_ADMIN, but iptables, sysctl, qemu-nbd,
/// mkfs and system-session unit registration need root.
pub async fn run_elevated(program: &str, args: &[&str]) -> Result<String, ExecError> {
    let mut full: Vec<&str> = Vec::with_capacity(args.len() + 1);
    full.push(program);
    full.extend_from_slice(args);

    match run("sudo", &full).await {
        // Report the real program as failed, not sudo itself.
        Err(ExecError::Failed { status, stderr, .. }) => Err(ExecError::Failed {
            program: program.to_string(),
            status,
            stderr,
        }),
        other => other,
    }
}

/// Like `run_elevated` but returning the raw output for callers that
/// classify failures themselves (e.g. iptables rule probes).
pub async fn run_elevated_raw(program: &str, args: &[&str]) -> Result<Output, ExecError> {
    let mut full: Vec<&str> = Vec::with_capacity(args.len() + 1);
    full.push(program);
    full.extend_from_slice(args);
    run_raw("sudo", &full).await
}

/// Locate a binary on PATH, used by `doctor` preflight checks.
pub fn lookup(program: &str) -> Option<std::path::PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_classified() {
        let err = run::<&str>("qemu-compose-no-such-binary", &[]).await.unwrap_err();
        assert!(matches!(err, ExecError::Missing { .. }));
    }

    #[tokio::test]
    async fn failed_binary_carries_stderr() {
        let err = run("ls", &["/qemu-compose-no-such-path"]).await.unwrap_err();
        match err {
            ExecError::Failed { program, stderr, .. } => {
                assert_eq!(program, "ls");
                assert!(!stderr.is_empty());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_run_returns_stdout() {
        let out = run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
