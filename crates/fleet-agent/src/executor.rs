//! Carries out node actions on the local host.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use fleet_protocol::{ActionRequest, NodeAction, NodeConfig};

use crate::config::ExecutorSection;
use crate::error::AgentError;

#[async_trait]
pub trait NodeActionExecutor: Send + Sync {
    async fn execute(&self, node: &NodeConfig, request: &ActionRequest) -> Result<(), AgentError>;
}

/// Accept only a bare file name: one normal path component.
pub fn validate_file_name(name: &str) -> Result<&str, AgentError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(AgentError::InvalidFileName(name.to_string())),
    }
}

/// Launches node daemons as child processes and keeps them keyed by node.
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessExecutor {
    pub fn new(config: &ExecutorSection) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub async fn running(&self) -> Vec<String> {
        let mut children = self.children.lock().await;
        reap(&mut children);
        let mut names: Vec<String> = children.keys().cloned().collect();
        names.sort();
        names
    }

    async fn start(&self, node: &NodeConfig) -> Result<(), AgentError> {
        let mut children = self.children.lock().await;
        reap(&mut children);
        if children.contains_key(node.full_name()) {
            tracing::info!(node = %node.full_name(), "Node already running");
            return Ok(());
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(node.startup_switches.split_whitespace())
            .arg(format!("-datadir={}", node.data_dir.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &node.project_directory {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| AgentError::Launch {
            node: node.full_name().to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(node = %node.full_name(), pid = ?child.id(), "Node started");
        children.insert(node.full_name().to_string(), child);
        Ok(())
    }

    async fn stop(&self, node: &NodeConfig) -> Result<(), AgentError> {
        let child = self.children.lock().await.remove(node.full_name());
        let Some(mut child) = child else {
            return Err(AgentError::NotRunning(node.full_name().to_string()));
        };
        child.kill().await?;
        tracing::info!(node = %node.full_name(), "Node stopped");
        Ok(())
    }

    async fn remove_file(&self, node: &NodeConfig, parameters: &[String]) -> Result<(), AgentError> {
        let Some(name) = parameters.first() else {
            return Err(AgentError::InvalidFileName(String::new()));
        };
        let path = node.network_directory().join(validate_file_name(name)?);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(node = %node.full_name(), path = %path.display(), "File removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "File already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Drop children that exited on their own.
fn reap(children: &mut HashMap<String, Child>) {
    children.retain(|name, child| match child.try_wait() {
        Ok(Some(status)) => {
            tracing::info!(node = %name, %status, "Node exited");
            false
        }
        Ok(None) => true,
        Err(e) => {
            tracing::warn!(node = %name, error = %e, "Cannot poll node process");
            true
        }
    });
}

#[async_trait]
impl NodeActionExecutor for ProcessExecutor {
    async fn execute(&self, node: &NodeConfig, request: &ActionRequest) -> Result<(), AgentError> {
        match request.action {
            NodeAction::StartNode => self.start(node).await,
            NodeAction::StopNode => self.stop(node).await,
            NodeAction::RemoveFile => self.remove_file(node, &request.parameters).await,
        }
    }
}
