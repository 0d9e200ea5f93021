use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use avafleet_core::config::CommandOptions;
use avafleet_core::error::FleetError;
use avafleet_core::node::Host;
use avafleet_core::retry;

/// Upper bound for one remote script.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// ssh exits 255 when the connection itself failed.
const SSH_CONNECT_FAILURE: i32 = 255;

/// Captured result of a command run against a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stdout of a successful command, or an error naming `what` failed.
    pub fn into_stdout(self, host: &Host, what: &str) -> Result<String> {
        if !self.success() {
            anyhow::bail!(
                "{} failed on {} (exit {}): {}",
                what,
                host.node_id,
                self.code,
                self.stderr.trim()
            );
        }
        Ok(self.stdout)
    }
}

/// "Run this script against host H."
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, host: &Host, script: &str) -> Result<CommandOutput>;
}

/// Runs scripts over SSH, retrying connection failures.
pub struct SshExecutor {
    connect_retries: u32,
    connect_timeout: Duration,
    script_timeout: Duration,
}

impl SshExecutor {
    pub fn new(opts: &CommandOptions) -> Self {
        Self {
            connect_retries: opts.ssh_connect_retries,
            connect_timeout: opts.ssh_connect_timeout,
            script_timeout: SCRIPT_TIMEOUT,
        }
    }

    async fn run_once(&self, host: &Host, script: &str) -> Result<CommandOutput> {
        let args = ssh_args(host, self.connect_timeout, Some(script));
        debug!(host = %host.node_id, ip = %host.ip, "Running remote script");
        let output = run_with_timeout(Command::new("ssh").args(&args), self.script_timeout)
            .await
            .with_context(|| format!("Failed to run ssh to {}", host.node_id))?;
        if output.code == SSH_CONNECT_FAILURE {
            return Err(FleetError::TransientRemote {
                target: host.node_id.clone(),
                reason: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &Host, script: &str) -> Result<CommandOutput> {
        if host.is_local() {
            return LocalExecutor.run(host, script).await;
        }
        let label = format!("ssh to {}", host.node_id);
        retry::retry(self.connect_retries, Duration::from_secs(1), &label, || {
            self.run_once(host, script)
        })
        .await
    }
}

/// Runs scripts with bash on this machine. Used for local clusters.
pub struct LocalExecutor;

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn run(&self, host: &Host, script: &str) -> Result<CommandOutput> {
        debug!(host = %host.node_id, "Running local script");
        run_with_timeout(Command::new("bash").args(["-c", script]), SCRIPT_TIMEOUT)
            .await
            .with_context(|| format!("Failed to run local script for {}", host.node_id))
    }
}

pub(crate) async fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("Command timed out after {}s", timeout.as_secs()),
    };
    Ok(CommandOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Arguments for `ssh` to a host, optionally running a script.
pub fn ssh_args(host: &Host, connect_timeout: Duration, script: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
    ];
    args.extend(host.ssh_common_args.split_whitespace().map(str::to_string));
    if !host.ssh_private_key_path.is_empty() {
        args.push("-i".to_string());
        args.push(host.ssh_private_key_path.clone());
    }
    if script.is_none() {
        args.push("-t".to_string());
    }
    args.push(format!("{}@{}", host.ssh_user, host.ip));
    if let Some(script) = script {
        args.push("--".to_string());
        args.push(format!("bash -c {}", shell_quote(script)));
    }
    args
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Replace the current process with an interactive command.
/// Only returns on failure.
#[cfg(unix)]
pub fn replace_process(cmd: &str, args: &[String]) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(cmd)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .exec();

    // exec() only returns on error
    Err(err).with_context(|| format!("Failed to exec: {} {}", cmd, args.join(" ")))
}

/// Open an interactive SSH session on a host.
#[cfg(unix)]
pub fn interactive_ssh(host: &Host, connect_timeout: Duration) -> Result<()> {
    which::which("ssh").with_context(|| "ssh is not installed or not on PATH")?;
    replace_process("ssh", &ssh_args(host, connect_timeout, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host {
            node_id: "aws_node_i-1".to_string(),
            ip: "10.0.0.5".to_string(),
            ssh_user: "ubuntu".to_string(),
            ssh_private_key_path: "/keys/kp.pem".to_string(),
            ssh_common_args: "-o IdentitiesOnly=yes".to_string(),
            api_port: 9650,
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_ssh_args_with_script() {
        let args = ssh_args(&host(), Duration::from_secs(3), Some("uptime"));
        assert!(args.contains(&"ConnectTimeout=3".to_string()));
        assert!(args.contains(&"IdentitiesOnly=yes".to_string()));
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/keys/kp.pem");
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args.last().unwrap(), "bash -c 'uptime'");
        assert!(args.contains(&"ubuntu@10.0.0.5".to_string()));
        assert!(!args.contains(&"-t".to_string()));
    }

    #[test]
    fn test_ssh_args_interactive() {
        let args = ssh_args(&host(), Duration::from_secs(3), None);
        assert!(args.contains(&"-t".to_string()));
        assert_eq!(args.last().unwrap(), "ubuntu@10.0.0.5");
    }

    #[test]
    fn test_into_stdout_failure_names_host() {
        let out = CommandOutput {
            code: 2,
            stdout: String::new(),
            stderr: "no such file\n".to_string(),
        };
        let err = out.into_stdout(&host(), "read config").unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("aws_node_i-1"));
        assert!(msg.contains("no such file"));
    }

    #[tokio::test]
    async fn test_local_executor_runs_bash() {
        let mut h = host();
        h.node_id = "local_node_n1".to_string();
        let out = LocalExecutor.run(&h, "echo hello; exit 3").await.unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_ssh_executor_short_circuits_local_hosts() {
        let mut h = host();
        h.node_id = "local_node_n1".to_string();
        let exec = SshExecutor::new(&CommandOptions::default());
        let out = exec.run(&h, "printf ok").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "ok");
    }
}
