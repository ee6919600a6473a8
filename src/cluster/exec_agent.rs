use crate::cluster::{AgentError, FenceAgent};
use crate::domain::NodeId;
use std::path::PathBuf;
use tokio::process::Command;

/// Runs an external fence program, e.g. `fence_node`, with the victim's name as last argument.
/// The victim's id is passed in `FENCED_VICTIM_ID`. Exit status 0 means the node is fenced.
pub struct ExecFenceAgent {
    program: PathBuf,
    args: Vec<String>,
}

impl ExecFenceAgent {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        ExecFenceAgent {
            program: program.into(),
            args,
        }
    }
}

#[async_trait::async_trait]
impl FenceAgent for ExecFenceAgent {
    async fn fence(&self, victim: NodeId, victim_name: &str) -> Result<(), AgentError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(victim_name)
            .env("FENCED_VICTIM_ID", victim.to_string())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AgentError::Failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )))
        }
    }
}
