use async_trait::async_trait;
use indexmap::IndexMap;
use pfcore::{Callable, Tool, ToolContext, ToolError, ToolType, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Runs a user script from the flow directory as a child process.
///
/// The node's arguments are written to stdin as one JSON object and stdout
/// is parsed as JSON, falling back to the trimmed text. Scripts run with the
/// same privileges as the executor; nothing here sandboxes them.
pub struct ScriptTool {
    script: PathBuf,
    working_dir: PathBuf,
}

impl ScriptTool {
    pub fn new(script: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            working_dir: working_dir.into(),
        }
    }

    /// Tool definition for a script that has no entry in the flow's `tools`:
    /// every node input is passed through untyped.
    pub fn definition(path: &str, input_names: impl IntoIterator<Item = String>) -> Tool {
        let name = Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        let mut tool = Tool::new(name, ToolType::Python);
        tool.source = Some(path.to_string());
        for input in input_names {
            tool.inputs.insert(input, Default::default());
        }
        tool
    }

    fn command(&self) -> Command {
        let interpreter = match self.script.extension().and_then(|e| e.to_str()) {
            Some("py") => Some("python3"),
            Some("sh") => Some("sh"),
            Some("js") => Some("node"),
            _ => None,
        };
        let mut cmd = match interpreter {
            Some(program) => {
                let mut cmd = Command::new(program);
                cmd.arg(&self.script);
                cmd
            }
            None => Command::new(&self.script),
        };
        cmd.current_dir(&self.working_dir);
        cmd
    }

    fn failure(&self, message: impl Into<String>) -> ToolError {
        ToolError::ScriptExecution {
            script: self.script.display().to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Callable for ScriptTool {
    async fn call(&self, ctx: &ToolContext, args: IndexMap<String, Value>) -> Result<Value, ToolError> {
        let payload = serde_json::to_vec(&Value::Object(args)).map_err(|e| self.failure(e.to_string()))?;

        let mut cmd = self.command();
        cmd.env("PF_NODE_NAME", &ctx.node_name)
            .env("PF_RUN_ID", &ctx.run_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(line) = ctx.line_number {
            cmd.env("PF_LINE_NUMBER", line.to_string());
        }

        tracing::debug!("Running script {} for node {}", self.script.display(), ctx.node_name);
        let mut child = cmd
            .spawn()
            .map_err(|e| self.failure(format!("Failed to spawn: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| self.failure(format!("Failed to write stdin: {}", e)))?;
        }

        let mut stdout_data = Vec::new();
        let mut stderr_data = Vec::new();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let read_out = async {
            if let Some(out) = stdout.as_mut() {
                out.read_to_end(&mut stdout_data).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_err = async {
            if let Some(err) = stderr.as_mut() {
                err.read_to_end(&mut stderr_data).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (out_res, err_res) = tokio::join!(read_out, read_err);
        out_res
            .and(err_res)
            .map_err(|e| self.failure(format!("Failed to read output: {}", e)))?;

        let status = child
            .wait()
            .await
            .map_err(|e| self.failure(format!("Failed to wait for process: {}", e)))?;

        let stderr_str = String::from_utf8_lossy(&stderr_data).trim().to_string();
        if !status.success() {
            let message = if stderr_str.is_empty() {
                format!("exited with status {}", status)
            } else {
                stderr_str
            };
            return Err(self.failure(message));
        }
        if !stderr_str.is_empty() {
            tracing::warn!("Script {} stderr: {}", self.script.display(), stderr_str);
        }

        let stdout_str = String::from_utf8_lossy(&stdout_data);
        let trimmed = stdout_str.trim();
        Ok(match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(json) => Value::from(json),
            Err(_) => Value::String(trimmed.to_string()),
        })
    }

    fn describe(&self) -> String {
        self.script.display().to_string()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_script_reads_json_args() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("echo.sh"), "cat\n").unwrap();
        let tool = ScriptTool::new("echo.sh", dir.path());
        let mut args = IndexMap::new();
        args.insert("text".to_string(), Value::from("hello"));

        let out = tool.call(&ToolContext::new("echo", "run", Some(0)), args).await.unwrap();
        assert_eq!(out.get("text"), Some(&Value::from("hello")));
    }

    #[tokio::test]
    async fn test_script_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("fail.sh"), "echo broken >&2\nexit 3\n").unwrap();
        let tool = ScriptTool::new("fail.sh", dir.path());

        let err = tool.call(&ToolContext::default(), IndexMap::new()).await.unwrap_err();
        assert_eq!(err.error_code(), "ScriptExecutionError");
        assert!(err.to_string().contains("broken"));
    }
}
