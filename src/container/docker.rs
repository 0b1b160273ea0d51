//! [`ContainerRuntime`] over the Docker-compatible CLI (`docker` or `podman`).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::container::runtime::{AttachSession, ContainerRuntime, ContainerSpec, ContainerSummary};
use crate::error::{NodeError, Result};

/// Kept from the tail of attached stderr for start failure messages.
const STDERR_KEEP: usize = 4096;

pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Run one CLI command to completion and return its stdout.
    async fn run(&self, args: &[String], target: Option<&str>) -> Result<String> {
        let command = args.first().cloned().unwrap_or_default();
        debug!(binary = %self.binary, command = %command, "container runtime call");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&self.binary, e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(&command, target, &stderr))
        }
    }
}

fn spawn_error(binary: &str, e: std::io::Error) -> NodeError {
    if e.kind() == std::io::ErrorKind::NotFound {
        NodeError::RuntimeUnavailable(format!("`{binary}` not found in PATH"))
    } else {
        NodeError::RuntimeUnavailable(format!("failed to run `{binary}`: {e}"))
    }
}

/// Map CLI stderr onto the error taxonomy.
pub fn classify_failure(command: &str, target: Option<&str>, stderr: &str) -> NodeError {
    let lower = stderr.to_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("cannot connect to podman")
    {
        return NodeError::RuntimeUnavailable(stderr.trim().to_string());
    }
    if lower.contains("no such container") {
        if let Some(name) = target {
            return NodeError::ContainerAbsent(name.to_string());
        }
    }
    NodeError::Runtime {
        command: command.to_string(),
        stderr: stderr.trim().to_string(),
    }
}

/// `create` arguments for `spec`, image and command last.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    if spec.interactive {
        args.push("--interactive".to_string());
    }
    for cap in &spec.cap_drop {
        args.push("--cap-drop".to_string());
        args.push(cap.clone());
    }
    for cap in &spec.cap_add {
        args.push("--cap-add".to_string());
        args.push(cap.clone());
    }
    for (key, value) in &spec.sysctls {
        args.push("--sysctl".to_string());
        args.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host.display(), mount.container);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("--volume".to_string());
        args.push(volume);
    }
    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(format!("{}:{}", port.port, port.exposed()));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Parse `ps --format '{{.Names}}\t{{.State}}'` output.
pub fn parse_ps(stdout: &str) -> Vec<ContainerSummary> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, state) = line.split_once('\t')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(ContainerSummary {
                name: name.to_string(),
                state: state.trim().to_lowercase(),
            })
        })
        .collect()
}

/// Forward raw chunks of `reader` into `tx` until EOF. Returns the last
/// [`STDERR_KEEP`] bytes read when `keep` is set.
async fn forward<R>(mut reader: R, tx: mpsc::Sender<String>, keep: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept = String::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
        if keep {
            kept.push_str(&chunk);
            if kept.len() > STDERR_KEEP {
                let mut cut = kept.len() - STDERR_KEEP;
                while !kept.is_char_boundary(cut) {
                    cut += 1;
                }
                kept.drain(..cut);
            }
        }
        // Receiver gone means the session was closed; keep draining the pipe.
        let _ = tx.send(chunk).await;
    }
    kept
}

fn s(v: &str) -> String {
    v.to_string()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut args = vec![s("ps")];
        if all {
            args.push(s("--all"));
        }
        args.push(s("--format"));
        args.push(s("{{.Names}}\t{{.State}}"));
        let stdout = self.run(&args, None).await?;
        Ok(parse_ps(&stdout))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        self.run(&create_args(spec), None).await.map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run(&[s("start"), s(name)], Some(name)).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run(&[s("stop"), s(name)], Some(name)).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.run(&[s("rm"), s("--force"), s(name)], Some(name))
            .await
            .map(|_| ())
    }

    async fn start_attached(&self, name: &str) -> Result<AttachSession> {
        debug!(binary = %self.binary, container = %name, "attached start");
        let mut child = Command::new(&self.binary)
            .args(["start", "--attach", "--interactive", name])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;

        let missing = |which: &str| NodeError::Attach(format!("{which} was not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (out_tx, out_rx) = mpsc::channel(64);
        let (started_tx, started_rx) = oneshot::channel();
        let (detach_tx, mut detach_rx) = oneshot::channel::<()>();

        let out_task = tokio::spawn(forward(stdout, out_tx.clone(), false));
        let err_task = tokio::spawn(forward(stderr, out_tx.clone(), true));
        let container = name.to_string();

        tokio::spawn(async move {
            let streams = async {
                let _ = out_task.await;
                err_task.await.unwrap_or_default()
            };
            let stderr_tail = tokio::select! {
                tail = streams => tail,
                _ = &mut detach_rx => {
                    // Killing the attach client leaves the container running.
                    let _ = child.kill().await;
                    debug!(container = %container, "detached");
                    return;
                }
            };

            let started = match child.wait().await {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => {
                    let stderr = if stderr_tail.trim().is_empty() {
                        format!("attach client exited with {status}")
                    } else {
                        stderr_tail.trim().to_string()
                    };
                    warn!(container = %container, %status, "attached start failed");
                    Err(classify_failure("start", Some(&container), &stderr))
                }
                Err(e) => Err(NodeError::Attach(e.to_string())),
            };
            let _ = started_tx.send(started);
            drop(out_tx);
        });

        Ok(AttachSession {
            stdin: Box::new(stdin),
            output: out_rx,
            started: started_rx,
            detach: Some(detach_tx),
        })
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        let args = [s("logs"), s("--tail"), tail.to_string(), s(name)];
        debug!(binary = %self.binary, container = %name, tail, "container logs");
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&self.binary, e))?;

        // The engine replays the container's stderr on its own stderr.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify_failure("logs", Some(name), &stderr));
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&stderr);
        Ok(text)
    }
}
