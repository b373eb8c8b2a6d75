use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::sandbox::{SandboxError, SandboxExecutor};
use crate::worker_pool::PoolLane;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("agent produced no output")]
    EmptyReply,
    #[error("agent request could not be staged: {0}")]
    Staging(String),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Sandbox(err) => err.code(),
            AgentError::EmptyReply => "AGENT_EMPTY_REPLY",
            AgentError::Staging(_) => "AGENT_STAGING_FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInvocation {
    pub request_id: Uuid,
    pub message: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    #[serde(skip)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub text: String,
    pub duration_ms: u64,
}

/// Upstream model invocation seam. The production implementation runs the
/// agent binary inside the sandbox via the worker pool; tests substitute a
/// canned implementation.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentReply, AgentError>;
}

pub struct SandboxAgentRuntime {
    sandbox: Arc<SandboxExecutor>,
    agent_binary: String,
}

impl SandboxAgentRuntime {
    pub fn new(sandbox: Arc<SandboxExecutor>, agent_binary: impl Into<String>) -> Self {
        Self {
            sandbox,
            agent_binary: agent_binary.into(),
        }
    }
}

#[async_trait]
impl AgentRuntime for SandboxAgentRuntime {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentReply, AgentError> {
        // The message body never travels through command tokenization; it is
        // staged as a file inside the jail and passed by path.
        let staging_dir = self.sandbox.jail_root().join("requests");
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|err| AgentError::Staging(err.to_string()))?;
        let input_path = staging_dir.join(format!("{}.json", invocation.request_id));
        let payload = serde_json::to_vec(&invocation)
            .map_err(|err| AgentError::Staging(err.to_string()))?;
        tokio::fs::write(&input_path, payload)
            .await
            .map_err(|err| AgentError::Staging(err.to_string()))?;

        let command = format!(
            "{} --input requests/{}.json",
            self.agent_binary, invocation.request_id
        );
        let result = self
            .sandbox
            .execute(&command, PoolLane::Interactive, invocation.session_id.clone())
            .await;
        let _ = tokio::fs::remove_file(&input_path).await;
        let result = result?;

        let text = result.stdout.trim().to_string();
        if text.is_empty() {
            return Err(AgentError::EmptyReply);
        }
        Ok(AgentReply {
            text,
            duration_ms: result.duration_ms,
        })
    }
}
