//! Node transport: command execution and file copy on cluster nodes.
//!
//! The production implementation shells out to ssh/scp through the
//! cluster's admin proxy. The trait seam exists so deployer tests can run
//! against an in-memory fleet.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{GravityError, Result};
use crate::ops::Server;

#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Open a session to the node's admin endpoint and verify it answers.
    async fn check(&self, node: &Server) -> Result<()>;

    /// Run a command on the node, returning stdout.
    async fn run(&self, node: &Server, command: &str) -> Result<String>;

    /// Copy a local file to a path on the node.
    async fn copy(&self, node: &Server, source: &Path, dest: &str) -> Result<()>;
}

/// ssh/scp transport through the cluster proxy entry point.
pub struct SshTransport {
    user: String,
    /// Jump host, when sessions must hop through the cluster proxy.
    proxy: Option<String>,
}

impl SshTransport {
    pub fn new(user: &str, proxy: Option<String>) -> Self {
        Self {
            user: user.to_string(),
            proxy,
        }
    }

    fn base_ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");
        if let Some(proxy) = &self.proxy {
            cmd.arg("-J").arg(proxy);
        }
        cmd
    }

    async fn run_checked(mut cmd: Command, what: &str) -> Result<String> {
        cmd.stdin(Stdio::null());
        let output = cmd.output().await.map_err(|e| {
            GravityError::ConnectionProblem(format!("failed to spawn {what}: {e}"))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GravityError::ConnectionProblem(format!(
                "{what} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl NodeTransport for SshTransport {
    async fn check(&self, node: &Server) -> Result<()> {
        let mut cmd = self.base_ssh();
        cmd.arg(format!("{}@{}", self.user, node.advertise_ip))
            .arg("true");
        debug!(node = %node.advertise_ip, "probing admin endpoint");
        Self::run_checked(cmd, &format!("probe of {}", node.hostname)).await?;
        Ok(())
    }

    async fn run(&self, node: &Server, command: &str) -> Result<String> {
        let mut cmd = self.base_ssh();
        cmd.arg(format!("{}@{}", self.user, node.advertise_ip))
            .arg(command);
        debug!(node = %node.advertise_ip, %command, "running remote command");
        Self::run_checked(cmd, &format!("command on {}", node.hostname)).await
    }

    async fn copy(&self, node: &Server, source: &Path, dest: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");
        if let Some(proxy) = &self.proxy {
            cmd.arg("-J").arg(proxy);
        }
        cmd.arg(source)
            .arg(format!("{}@{}:{}", self.user, node.advertise_ip, dest));
        debug!(node = %node.advertise_ip, ?source, %dest, "copying file");
        Self::run_checked(cmd, &format!("copy to {}", node.hostname)).await?;
        Ok(())
    }
}
