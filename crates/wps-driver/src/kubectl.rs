use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use wps_config::StackConfig;
use wps_domain::WorkspacePlan;

use crate::driver::{ApplyOutputs, DestroyOutcome, StackDriver};
use crate::error::DriverError;
use crate::render::{render_list, stack_label, STACK_LABEL};

/// Resource kinds a stack is made of, in the form `kubectl` takes them.
const STACK_KINDS: &str = "deployments,persistentvolumeclaims,secrets,networkpolicies";

/// Applies stacks by rendering a `v1/List` manifest and shelling out to
/// `kubectl`.
///
/// Every resource is labelled with the stack name, so destroy selects by
/// label instead of tracking individual resources.
pub struct KubectlDriver {
    binary: String,
    refresh_before_update: bool,
    work_dir: Option<PathBuf>,
}

impl KubectlDriver {
    pub fn new(cfg: &StackConfig) -> Self {
        KubectlDriver {
            binary: "kubectl".to_string(),
            refresh_before_update: cfg.refresh_before_update,
            work_dir: cfg.work_dir.as_ref().map(PathBuf::from),
        }
    }

    /// Override the binary, e.g. for a wrapper script.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Run kubectl with the given args, feeding `stdin` when provided.
    /// Returns the exit code and combined stdout+stderr.
    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<(i32, String), DriverError> {
        debug!(binary = %self.binary, args = ?args, "running kubectl");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| DriverError::Internal(format!("spawn {}: {}", self.binary, e)))?;

        if let Some(input) = stdin {
            let mut handle = child
                .stdin
                .take()
                .ok_or_else(|| DriverError::Internal("child stdin unavailable".into()))?;
            handle
                .write_all(input)
                .await
                .map_err(|e| DriverError::Internal(format!("write manifest: {}", e)))?;
            drop(handle);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DriverError::Internal(format!("wait for {}: {}", self.binary, e)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code().unwrap_or(-1), combined))
    }

    /// List resources currently labelled to the stack, one `kind/name` per
    /// line. An empty result means the stack does not exist.
    async fn existing_resources(&self, label: &str) -> Result<Vec<String>, DriverError> {
        let selector = format!("{}={}", STACK_LABEL, label);
        let (code, output) = self
            .run(
                &[
                    "get",
                    STACK_KINDS,
                    "--all-namespaces",
                    "-l",
                    &selector,
                    "-o",
                    "name",
                ],
                None,
            )
            .await?;
        if code != 0 {
            return Err(DriverError::Internal(format!(
                "kubectl get exited with code {}: {}",
                code,
                output.trim()
            )));
        }
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl StackDriver for KubectlDriver {
    fn name(&self) -> &'static str {
        "kubectl"
    }

    async fn apply(&self, plan: &WorkspacePlan) -> Result<ApplyOutputs, DriverError> {
        let manifest = serde_json::to_vec(&render_list(plan))
            .map_err(|e| DriverError::Internal(format!("render manifest: {}", e)))?;

        if self.refresh_before_update {
            // Refresh pass: diff against live state before mutating. Exit
            // code 1 just means "differences found".
            let (code, output) = self.run(&["diff", "-f", "-"], Some(&manifest)).await?;
            if code > 1 {
                warn!(
                    stack = %plan.stack_name,
                    code,
                    "kubectl diff failed; continuing with apply: {}",
                    output.trim()
                );
            }
        }

        let (code, output) = self.run(&["apply", "-f", "-"], Some(&manifest)).await?;
        if code != 0 {
            return Err(DriverError::ApplyFailed(format!(
                "kubectl apply exited with code {}: {}",
                code,
                output.trim()
            )));
        }
        info!(stack = %plan.stack_name, "stack applied");

        let mut outputs = ApplyOutputs::new();
        if let Some(connection) = &plan.connection_info {
            outputs.insert("connection".to_string(), connection.clone());
        }
        Ok(outputs)
    }

    async fn destroy(&self, stack_name: &str) -> Result<DestroyOutcome, DriverError> {
        let label = stack_label(stack_name);

        let existing = self
            .existing_resources(label)
            .await
            .map_err(|e| DriverError::DestroyFailed(e.to_string()))?;
        if existing.is_empty() {
            debug!(stack = %stack_name, "stack not found; nothing to destroy");
            return Ok(DestroyOutcome::NotFound);
        }

        let selector = format!("{}={}", STACK_LABEL, label);
        let (code, output) = self
            .run(
                &[
                    "delete",
                    STACK_KINDS,
                    "--all-namespaces",
                    "-l",
                    &selector,
                    "--ignore-not-found",
                ],
                None,
            )
            .await?;
        if code != 0 {
            return Err(DriverError::DestroyFailed(format!(
                "kubectl delete exited with code {}: {}",
                code,
                output.trim()
            )));
        }
        info!(stack = %stack_name, resources = existing.len(), "stack destroyed");
        Ok(DestroyOutcome::Destroyed)
    }
}
