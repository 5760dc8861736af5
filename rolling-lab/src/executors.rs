use async_trait::async_trait;
use rolling_core::{CoreError, Result};
use rolling_workflow::{TrainContext, TrainOutput, TrainingExecutor};
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Records what would have been trained, without training anything.
pub struct ProvenanceExecutor;

#[async_trait]
impl TrainingExecutor for ProvenanceExecutor {
    async fn train(&self, ctx: &TrainContext) -> Result<TrainOutput> {
        let test = ctx.task.segment("test")?;
        Ok(TrainOutput::new().with_artifact(
            "provenance",
            json!({
                "model": ctx.task.model_class(),
                "test": test,
                "worker": ctx.worker_id,
                "attempt": ctx.attempt,
            }),
        ))
    }
}

/// Trains a task by running an external program.
///
/// The task definition goes to the program's stdin as JSON. The program must
/// print a JSON object whose entries become the run's artifacts.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl TrainingExecutor for CommandExecutor {
    async fn train(&self, ctx: &TrainContext) -> Result<TrainOutput> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("ROLLING_TASK_ID", ctx.task_id.as_str())
            .env("ROLLING_NAMESPACE", &ctx.namespace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::TrainingExecution(format!("failed to start {}: {}", self.program, e)))?;

        let input = serde_json::to_vec(&ctx.task)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| CoreError::TrainingExecution(format!("writing task to {}: {}", self.program, e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CoreError::TrainingExecution(format!("waiting for {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(CoreError::TrainingExecution(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let printed = serde_json::from_slice::<Value>(&output.stdout).map_err(|e| {
            CoreError::TrainingExecution(format!("{} printed invalid JSON: {}", self.program, e))
        })?;
        match printed {
            Value::Object(artifacts) => Ok(TrainOutput {
                artifacts: artifacts.into_iter().collect(),
            }),
            other => Err(CoreError::TrainingExecution(format!(
                "{} printed {} instead of an artifact object",
                self.program,
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
