//! In-memory [`ContainerRuntime`] for tests.
//!
//! Keeps a name → state table, records every call, and scripts the output of
//! attached starts. The attached stdin is a real duplex pipe: scripted output
//! is only emitted after a full line has been written, the same way a node
//! blocks on its passphrase prompt.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};

use crate::container::runtime::{AttachSession, ContainerRuntime, ContainerSpec, ContainerSummary};
use crate::error::{NodeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    List { all: bool },
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
    StartAttached(String),
    Logs { name: String, tail: usize },
}

#[derive(Debug)]
struct MockState {
    containers: BTreeMap<String, String>,
    calls: Vec<RuntimeCall>,
    specs: Vec<ContainerSpec>,
    unavailable: bool,
    start_error: Option<String>,
    attach_output: Vec<String>,
    attach_start_error: Option<String>,
    close_after_output: bool,
    stdin: Vec<u8>,
    logs: String,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            containers: BTreeMap::new(),
            calls: Vec::new(),
            specs: Vec::new(),
            unavailable: false,
            start_error: None,
            attach_output: vec!["Starting the node".to_string()],
            attach_start_error: None,
            close_after_output: false,
            stdin: Vec::new(),
            logs: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a container in the given engine state (`created`, `running`, ...).
    pub fn with_container(self, name: &str, state: &str) -> Self {
        lock(&self.state)
            .containers
            .insert(name.to_string(), state.to_string());
        self
    }

    /// Every call fails with `RuntimeUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Plain `start` fails with this stderr.
    pub fn fail_start(&self, stderr: &str) {
        lock(&self.state).start_error = Some(stderr.to_string());
    }

    /// Output emitted by the next attached start once stdin has a full line.
    /// Defaults to the unlock success marker.
    pub fn script_attach(&self, chunks: &[&str]) {
        lock(&self.state).attach_output = chunks.iter().map(|c| c.to_string()).collect();
    }

    /// The attached start fails. Clears the scripted output; script again
    /// afterwards to emit some before the failure.
    pub fn fail_attached_start(&self, stderr: &str) {
        let mut state = lock(&self.state);
        state.attach_start_error = Some(stderr.to_string());
        state.attach_output.clear();
    }

    /// End the attach stream right after the scripted output instead of
    /// holding it open until detach.
    pub fn close_stream_after_output(&self) {
        lock(&self.state).close_after_output = true;
    }

    pub fn set_logs(&self, logs: &str) {
        lock(&self.state).logs = logs.to_string();
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.state).calls.clone()
    }

    /// Calls other than listings, which every query issues.
    pub fn mutating_calls(&self) -> Vec<RuntimeCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, RuntimeCall::List { .. }))
            .collect()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        lock(&self.state).specs.clone()
    }

    /// Everything written to attached stdin so far.
    pub fn stdin_written(&self) -> String {
        String::from_utf8_lossy(&lock(&self.state).stdin).into_owned()
    }

    pub fn container_state(&self, name: &str) -> Option<String> {
        lock(&self.state).containers.get(name).cloned()
    }

    fn record(&self, call: RuntimeCall) -> Result<MutexGuard<'_, MockState>> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if state.unavailable {
            return Err(NodeError::RuntimeUnavailable(
                "Cannot connect to the container engine".to_string(),
            ));
        }
        Ok(state)
    }
}

fn absent(name: &str) -> NodeError {
    NodeError::ContainerAbsent(name.to_string())
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let state = self.record(RuntimeCall::List { all })?;
        Ok(state
            .containers
            .iter()
            .filter(|(_, s)| all || s.as_str() == "running")
            .map(|(name, s)| ContainerSummary {
                name: name.clone(),
                state: s.clone(),
            })
            .collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let mut state = self.record(RuntimeCall::Create(spec.name.clone()))?;
        if state.containers.contains_key(&spec.name) {
            return Err(NodeError::Runtime {
                command: "create".to_string(),
                stderr: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }
        state.containers.insert(spec.name.clone(), "created".to_string());
        state.specs.push(spec.clone());
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut state = self.record(RuntimeCall::Start(name.to_string()))?;
        if !state.containers.contains_key(name) {
            return Err(absent(name));
        }
        if let Some(stderr) = state.start_error.clone() {
            return Err(NodeError::Runtime {
                command: "start".to_string(),
                stderr,
            });
        }
        state.containers.insert(name.to_string(), "running".to_string());
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut state = self.record(RuntimeCall::Stop(name.to_string()))?;
        match state.containers.get_mut(name) {
            Some(s) => {
                *s = "exited".to_string();
                Ok(())
            }
            None => Err(absent(name)),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.record(RuntimeCall::Remove(name.to_string()))?;
        state.containers.remove(name).map(|_| ()).ok_or_else(|| absent(name))
    }

    async fn start_attached(&self, name: &str) -> Result<AttachSession> {
        let (output, start_error, close_after_output) = {
            let state = self.record(RuntimeCall::StartAttached(name.to_string()))?;
            if !state.containers.contains_key(name) {
                return Err(absent(name));
            }
            (
                state.attach_output.clone(),
                state.attach_start_error.clone(),
                state.close_after_output,
            )
        };

        let (client, mut server) = tokio::io::duplex(4096);
        let (out_tx, out_rx) = mpsc::channel(64);
        let (started_tx, started_rx) = oneshot::channel();
        let (detach_tx, detach_rx) = oneshot::channel::<()>();

        if start_error.is_none() {
            lock(&self.state)
                .containers
                .insert(name.to_string(), "running".to_string());
        }

        let shared = Arc::clone(&self.state);
        tokio::spawn(async move {
            // Block on the prompt until a full line arrives.
            let mut buf = [0u8; 256];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut state = lock(&shared);
                        state.stdin.extend_from_slice(&buf[..n]);
                        if buf[..n].contains(&b'\n') {
                            break;
                        }
                    }
                }
            }

            for chunk in output {
                if out_tx.send(chunk).await.is_err() {
                    return;
                }
            }

            match start_error {
                Some(stderr) => {
                    let _ = started_tx.send(Err(NodeError::Runtime {
                        command: "start".to_string(),
                        stderr,
                    }));
                    drop(out_tx);
                }
                None if close_after_output => {
                    let _ = started_tx.send(Ok(()));
                    drop(out_tx);
                }
                None => {
                    let _ = started_tx.send(Ok(()));
                    let _ = detach_rx.await;
                    drop(out_tx);
                }
            }
        });

        Ok(AttachSession {
            stdin: Box::new(client),
            output: out_rx,
            started: started_rx,
            detach: Some(detach_tx),
        })
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        let state = self.record(RuntimeCall::Logs {
            name: name.to_string(),
            tail,
        })?;
        if !state.containers.contains_key(name) {
            return Err(absent(name));
        }
        let lines: Vec<&str> = state.logs.lines().collect();
        let from = lines.len().saturating_sub(tail);
        Ok(lines[from..].join("\n"))
    }
}
