//! jq filter evaluation. The engine only needs [`FilterEvaluator`]; [`JqCommand`]
//! runs the `jq` binary.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("running {binary}: {source}")]
    Spawn { binary: String, source: std::io::Error },
    #[error("jq exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("{0}")]
    Other(String),
}

/// Evaluates a filter expression against a JSON document.
#[async_trait]
pub trait FilterEvaluator: Send + Sync {
    async fn evaluate(&self, filter: &str, input: &[u8]) -> Result<Vec<u8>, FilterError>;
}

/// [`FilterEvaluator`] that pipes the document through the `jq` binary.
#[derive(Debug, Clone)]
pub struct JqCommand {
    pub binary: PathBuf,
    /// Passed to `jq -L` so filters can `import` modules.
    pub library_path: Option<PathBuf>,
}

impl Default for JqCommand {
    fn default() -> Self {
        Self { binary: PathBuf::from("jq"), library_path: None }
    }
}

impl JqCommand {
    /// `PATCHWORK_JQ_BIN` (default `jq`) and `PATCHWORK_JQ_LIBRARY_PATH`.
    pub fn from_env() -> Self {
        let binary = std::env::var_os("PATCHWORK_JQ_BIN").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("jq"));
        let library_path = std::env::var_os("PATCHWORK_JQ_LIBRARY_PATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        Self { binary, library_path }
    }

    fn args(&self, filter: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-c".into()];
        if let Some(lib) = &self.library_path {
            args.push("-L".into());
            args.push(lib.clone().into_os_string());
        }
        args.push(filter.into());
        args
    }
}

#[async_trait]
impl FilterEvaluator for JqCommand {
    async fn evaluate(&self, filter: &str, input: &[u8]) -> Result<Vec<u8>, FilterError> {
        let spawn_err = |source| FilterError::Spawn { binary: self.binary.display().to_string(), source };
        let mut child = Command::new(&self.binary)
            .args(self.args(filter))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| FilterError::Other("jq stdin unavailable".into()))?;
        let input = input.to_vec();
        let writer = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(writer, child.wait_with_output());
        let output = output.map_err(spawn_err)?;
        if !output.status.success() {
            return Err(FilterError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        written.map_err(spawn_err)?;
        Ok(output.stdout)
    }
}
