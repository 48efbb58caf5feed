//! Podman (or Docker) backed container driver
//!
//! Handles the computation process lifecycle:
//! - Checking the container CLI is available
//! - Pulling images, once per image even under concurrent requests
//! - Running a computation with its envelope on stdin
//! - Stopping the container when the run is cancelled
//!
//! `cmd` computations run as plain host processes through the same path.

use async_trait::async_trait;
use coinstac_core::domain::computation::ComputationKind;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ComputationOutput, ContainerDriver, Invocation};
use crate::error::{PipelineError, Result};

/// Driver shelling out to a container CLI
pub struct PodmanDriver {
    binary: String,

    /// One cell per image: concurrent pulls of an image share one attempt
    pulls: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl PodmanDriver {
    /// Creates a driver using `binary` (e.g. "podman" or "docker")
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            pulls: Mutex::new(HashMap::new()),
        }
    }

    /// Checks the container CLI is installed and answers
    ///
    /// # Returns
    /// The version string it reports
    pub async fn check_available(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| {
                PipelineError::Config(format!(
                    "Failed to execute '{} --version'. Is it installed? {}",
                    self.binary, e
                ))
            })?;

        if !output.status.success() {
            return Err(PipelineError::Config(format!(
                "{} is not working correctly",
                self.binary
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("{} is available: {}", self.binary, version);

        Ok(version)
    }

    fn command_for(&self, invocation: &Invocation) -> Result<Command> {
        match &invocation.kind {
            ComputationKind::Docker {
                docker_image,
                command,
            } => {
                let dirs = &invocation.directories;
                let mut cmd = Command::new(&self.binary);
                cmd.arg("run")
                    .arg("--rm")
                    .arg("-i") // Envelope goes to stdin
                    .arg("--name")
                    .arg(invocation.container_name())
                    .arg("-v")
                    .arg(format!("{}:/input", dirs.input.display()))
                    .arg("-v")
                    .arg(format!("{}:/output", dirs.output.display()))
                    .arg("-v")
                    .arg(format!("{}:/transfer", dirs.transfer.display()))
                    .arg(docker_image)
                    .args(command);
                Ok(cmd)
            }
            ComputationKind::Cmd { command } => {
                let (program, args) = command
                    .split_first()
                    .ok_or_else(|| PipelineError::container("Computation command is empty"))?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
        }
    }

    /// Best-effort stop of a named container
    async fn stop_container(&self, name: &str) {
        match Command::new(&self.binary).arg("stop").arg(name).output().await {
            Ok(output) if output.status.success() => debug!("Container {} stopped", name),
            Ok(output) => {
                // Usually the container is already gone
                let stderr = String::from_utf8_lossy(&output.stderr);
                debug!("Failed to stop container {}: {}", name, stderr.trim());
            }
            Err(e) => warn!("Failed to stop container {}: {}", name, e),
        }
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!("Pulling image {}", image);

        let output = Command::new(&self.binary)
            .arg("pull")
            .arg(image)
            .output()
            .await
            .map_err(|e| {
                PipelineError::container(format!("Failed to execute {} pull: {}", self.binary, e))
            })?;

        if !output.status.success() {
            return Err(PipelineError::Container {
                message: format!("Failed to pull image {}", image),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!("Image {} is up to date", image);
        Ok(())
    }

    fn pull_cell(&self, image: &str) -> Arc<OnceCell<()>> {
        let mut pulls = self.pulls.lock().unwrap_or_else(|e| e.into_inner());
        pulls.entry(image.to_string()).or_default().clone()
    }
}

#[async_trait]
impl ContainerDriver for PodmanDriver {
    async fn run(&self, invocation: Invocation, cancel: CancellationToken) -> Result<ComputationOutput> {
        let mut command = self.command_for(&invocation)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            "Starting {} computation for run {} step {} iteration {}",
            invocation.kind.label(),
            invocation.run_id,
            invocation.step,
            invocation.iteration
        );

        let payload = serde_json::to_vec(&invocation.envelope())
            .map_err(|e| PipelineError::Internal(format!("Failed to encode input: {}", e)))?;

        let mut child = command
            .spawn()
            .map_err(|e| PipelineError::container(format!("Failed to start computation: {}", e)))?;

        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("Computation did not read its input: {}", e);
                }
            }
        });
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                PipelineError::container(format!("Failed to wait for computation: {}", e))
            })?,
            _ = cancel.cancelled() => {
                warn!(
                    "Stopping computation for run {} step {} iteration {}",
                    invocation.run_id, invocation.step, invocation.iteration
                );
                if let Err(e) = child.start_kill() {
                    debug!("Computation already exited: {}", e);
                }
                if matches!(invocation.kind, ComputationKind::Docker { .. }) {
                    self.stop_container(&invocation.container_name()).await;
                }
                let _ = child.wait().await;
                writer.abort();
                return Err(PipelineError::cancelled("computation stopped"));
            }
        };

        let _ = writer.await;
        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        debug!(
            "Computation exited: exit_code={:?}, stdout_len={}, stderr_len={}",
            status.code(),
            stdout.len(),
            stderr.len()
        );

        if !status.success() {
            return Err(PipelineError::Container {
                message: match status.code() {
                    Some(code) => format!("Computation exited with status {}", code),
                    None => "Computation was killed by a signal".to_string(),
                },
                exit_code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        ComputationOutput::parse(&stdout, stderr)
    }

    async fn pull_images(&self, images: &[String]) -> Result<()> {
        for image in images {
            let cell = self.pull_cell(image);
            cell.get_or_try_init(|| self.pull(image)).await?;
        }
        Ok(())
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!("Failed to read computation output: {}", e);
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(reader: JoinHandle<String>) -> String {
    reader.await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunDirectories;
    use coinstac_core::domain::run::RunMode;
    use serde_json::json;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn shell(script: &str) -> Invocation {
        Invocation {
            run_id: "run-1".to_string(),
            client_id: "alice".to_string(),
            mode: RunMode::Local,
            step: 0,
            iteration: 1,
            kind: ComputationKind::Cmd {
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            },
            input: json!({ "start": 1 }),
            cache: json!({}),
            directories: RunDirectories::new(Path::new("/tmp/coinstac-test"), "alice", "run-1"),
        }
    }

    #[tokio::test]
    async fn test_cmd_computation_output() {
        let driver = PodmanDriver::new("podman");
        let output = driver
            .run(
                shell(r#"cat > /dev/null; echo '{"output": {"sum": 3}, "success": true}'"#),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(output.success);
        assert_eq!(output.data, json!({ "sum": 3 }));
    }

    #[tokio::test]
    async fn test_envelope_reaches_stdin() {
        let driver = PodmanDriver::new("podman");
        let output = driver
            .run(shell("cat"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.data["input"]["start"], 1);
        assert_eq!(output.data["state"]["clientId"], "alice");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_container_error() {
        let driver = PodmanDriver::new("podman");
        let err = driver
            .run(shell("echo oops >&2; exit 3"), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PipelineError::Container {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_computation() {
        let driver = PodmanDriver::new("podman");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = driver
            .run(shell("exec sleep 5"), cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_empty_cmd_is_rejected() {
        let driver = PodmanDriver::new("podman");
        let mut invocation = shell("true");
        invocation.kind = ComputationKind::Cmd { command: vec![] };

        assert!(driver.run(invocation, CancellationToken::new()).await.is_err());
    }
}
