//! Recovery of jobs that failed on a server rather than in the ESS.
//!
//! A job stuck or killed by its scheduler is deleted and, where the scheduler
//! allows pinning a node, moved to a node it has not tried yet. Commands go
//! through the [`RemoteExecutor`] trait so the decision logic can run against
//! a mock.

use crate::settings::{ClusterSoft, ServerConfig};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Line marking the node a job is pinned to in an OGE submit script.
const OGE_NODE_DIRECTIVE: &str = "#$ -l h=node";

/// Line index at which a missing node directive is inserted.
const OGE_NODE_DIRECTIVE_LINE: usize = 7;

/// Free slots pattern of an idle 8-core OGE node.
const OGE_FREE_NODE: &str = "0/0/8";

/// Errors raised while talking to a server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Server name not present in the settings
    #[error("Unknown server: {0}")]
    UnknownServer(String),
    /// Command returned a non-zero status
    #[error("Command `{command}` failed: {stderr}")]
    Command {
        /// The command as sent
        command: String,
        /// Its standard error
        stderr: String,
    },
    /// Process spawning or file system error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for server results
pub type Result<T> = std::result::Result<T, ServerError>;

/// Runs commands and transfers files on a server.
pub trait RemoteExecutor {
    /// Runs a shell command and returns its standard output lines.
    fn execute(&self, server: &ServerConfig, command: &str) -> Result<Vec<String>>;

    /// Reads a file in `remote_path`, one entry per line.
    fn read_remote_file(
        &self,
        server: &ServerConfig,
        remote_path: &str,
        filename: &str,
    ) -> Result<Vec<String>>;

    /// Writes `content` to `remote_file_path`, replacing any existing file.
    fn upload_file(&self, server: &ServerConfig, remote_file_path: &str, content: &str)
        -> Result<()>;
}

fn run(mut command: Command, description: &str, stdin: Option<&str>) -> Result<Vec<String>> {
    debug!("Running: {}", description);
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    }
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(text.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(ServerError::Command {
            command: description.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect())
}

/// Runs everything on this machine through `sh -c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExecutor;

impl RemoteExecutor for LocalExecutor {
    fn execute(&self, _server: &ServerConfig, command: &str) -> Result<Vec<String>> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run(cmd, command, None)
    }

    fn read_remote_file(
        &self,
        _server: &ServerConfig,
        remote_path: &str,
        filename: &str,
    ) -> Result<Vec<String>> {
        let content = fs::read_to_string(Path::new(remote_path).join(filename))?;
        Ok(content.lines().map(str::to_string).collect())
    }

    fn upload_file(
        &self,
        _server: &ServerConfig,
        remote_file_path: &str,
        content: &str,
    ) -> Result<()> {
        fs::write(remote_file_path, content)?;
        Ok(())
    }
}

/// Runs commands over the system `ssh` client.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshExecutor;

impl SshExecutor {
    fn destination(server: &ServerConfig) -> Result<String> {
        let address = server
            .address
            .as_deref()
            .ok_or_else(|| ServerError::UnknownServer(format!("{} has no address", server.name)))?;
        Ok(match server.user.as_deref() {
            Some(user) => format!("{}@{}", user, address),
            None => address.to_string(),
        })
    }

    fn ssh(server: &ServerConfig, remote_command: &str, stdin: Option<&str>) -> Result<Vec<String>> {
        let destination = Self::destination(server)?;
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("BatchMode=yes").arg(&destination).arg(remote_command);
        run(cmd, &format!("ssh {} {}", destination, remote_command), stdin)
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute(&self, server: &ServerConfig, command: &str) -> Result<Vec<String>> {
        Self::ssh(server, command, None)
    }

    fn read_remote_file(
        &self,
        server: &ServerConfig,
        remote_path: &str,
        filename: &str,
    ) -> Result<Vec<String>> {
        let path = Path::new(remote_path).join(filename);
        Self::ssh(server, &format!("cat '{}'", path.display()), None)
    }

    fn upload_file(&self, server: &ServerConfig, remote_file_path: &str, content: &str) -> Result<()> {
        Self::ssh(server, &format!("cat > '{}'", remote_file_path), Some(content))?;
        Ok(())
    }
}

/// What to do with a job after a server-side failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecovery {
    /// Node the job is now pinned to, if it was moved
    pub node: Option<String>,
    /// Whether the job should be submitted again now
    pub resubmit: bool,
}

/// Extracts the node number from a `qstat -f` queue line, e.g. `18` from
/// `long1@node18.cluster`.
fn oge_node(line: &str) -> Option<String> {
    let host = line.split_whitespace().next()?;
    let after = &host[host.find("node")? + "node".len()..];
    let node = after.split('.').next()?;
    if node.is_empty() {
        None
    } else {
        Some(node.to_string())
    }
}

/// Deletes a failed job from its server and decides how to resubmit it.
///
/// `tried_nodes` holds the nodes already used by this job on this server and
/// is extended with the node chosen here.
///
/// * Local jobs are always resubmitted.
/// * OGE jobs move to the first idle node not tried yet. The node directive
///   of the submit script is rewritten (or inserted at line 8) and uploaded.
///   Without a free node the job waits: `{None, false}`.
/// * Slurm, PBS and other schedulers without node pinning are resubmitted
///   without a node change.
///
/// # Errors
///
/// Propagates executor failures.
pub fn trsh_job_on_server(
    server: &ServerConfig,
    job_name: &str,
    job_id: &str,
    server_status: &str,
    remote_path: &str,
    tried_nodes: &mut Vec<String>,
    executor: &dyn RemoteExecutor,
) -> Result<ServerRecovery> {
    if server_status != "done" {
        error!(
            "Job {} has server status \"{}\" on {}.",
            job_name, server_status, server.name
        );
    }

    let delete = format!("{} {}", server.cluster_soft.delete_command(), job_id);
    executor.execute(server, &delete)?;
    if server.is_local() {
        return Ok(ServerRecovery {
            node: None,
            resubmit: true,
        });
    }

    match server.cluster_soft {
        ClusterSoft::Oge => {
            error!("Troubleshooting by changing node.");
            let list = server
                .cluster_soft
                .list_available_nodes_command()
                .unwrap_or_default();
            let lines = executor.execute(server, list)?;
            let node = lines.iter().find_map(|line| {
                let node = oge_node(line)?;
                (line.contains(OGE_FREE_NODE) && !tried_nodes.contains(&node)).then_some(node)
            });
            let Some(node) = node else {
                error!("Could not find an available node on the server {}", server.name);
                return Ok(ServerRecovery {
                    node: None,
                    resubmit: false,
                });
            };
            tried_nodes.push(node.clone());

            let filename = server.cluster_soft.submit_filename();
            let mut content = executor.read_remote_file(server, remote_path, filename)?;
            let directive = format!("{}{}.cluster", OGE_NODE_DIRECTIVE, node);
            match content.iter().position(|l| l.contains(OGE_NODE_DIRECTIVE)) {
                Some(i) => content[i] = directive,
                None => content.insert(OGE_NODE_DIRECTIVE_LINE.min(content.len()), directive),
            }
            let target = Path::new(remote_path).join(filename);
            executor.upload_file(server, &target.to_string_lossy(), &(content.join("\n") + "\n"))?;
            info!("Moving job {} on {} to node {}", job_name, server.name, node);
            Ok(ServerRecovery {
                node: Some(node),
                resubmit: true,
            })
        }
        // No node pinning: resubmit as is.
        _ => Ok(ServerRecovery {
            node: None,
            resubmit: true,
        }),
    }
}
