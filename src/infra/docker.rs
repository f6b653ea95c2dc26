use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use bollard::{
    container::{Config, CreateContainerOptions, StartContainerOptions, StopContainerOptions},
    image::BuildImageOptions,
    secret::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum},
    Docker,
};
use bytes::{BufMut, BytesMut};
use flate2::{write::GzEncoder, Compression};
use futures::StreamExt;
use log::info;

use crate::{
    config::AppConfig,
    domain::{
        image::CONTAINER_LOG_DIR,
        model::{Application, ContainerState},
        port::{BuildOutput, ContainerRuntime},
    },
};

pub struct DockerContainerRuntime {
    pub config: AppConfig,
    pub docker: Docker,
}

/// Pure progress markers the image builder emits: step counters, layer-id
/// echoes, cache notices. Dropped from the build log to keep it readable.
fn is_progress_marker(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with("Step ")
        || trimmed.starts_with("--->")
        || trimmed.starts_with("Removing intermediate container")
        || trimmed.starts_with("Using cache")
        || (trimmed.len() >= 12 && trimmed.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Read the last `n` lines of a file without scanning it forward: walk
/// backward in fixed-size blocks from the end, growing the window until
/// enough lines are captured or the file start is reached.
fn tail_file(path: &Path, n: usize, block_size: u64) -> std::io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut window: Vec<u8> = Vec::new();
    let mut pos = len;
    while pos > 0 {
        let read = block_size.min(pos);
        pos -= read;
        file.seek(SeekFrom::Start(pos))?;
        let mut block = vec![0u8; read as usize];
        file.read_exact(&mut block)?;
        block.extend_from_slice(&window);
        window = block;
        if window.iter().filter(|b| **b == b'\n').count() > n {
            break;
        }
    }
    let text = String::from_utf8_lossy(&window);
    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    if lines.len() > n {
        lines = lines.split_off(lines.len() - n);
    }
    Ok(lines)
}

const TAIL_BLOCK_SIZE: u64 = 8192;

impl DockerContainerRuntime {
    fn app_log_dir(&self, app_name: &str) -> PathBuf {
        Path::new(&self.config.logs_dir).join(app_name)
    }

    fn app_log_file(&self, app_name: &str) -> PathBuf {
        self.app_log_dir(app_name).join(format!("{app_name}.log"))
    }

    /// Container port to expose, taken from the image's EXPOSE declaration.
    async fn extract_min_exposed_port(&self, image_id: &str) -> Result<u16, Error> {
        self.docker
            .inspect_image(image_id)
            .await?
            .config
            .and_then(|c| c.exposed_ports)
            .and_then(|exposed_ports| exposed_ports.into_keys().min())
            .and_then(|port| port.split('/').next().map(String::from))
            .ok_or(anyhow!(
                "Can't detect exposed port for {} image",
                image_id
            ))
            .and_then(|port| port.parse::<u16>().context("Exposed port can't be parsed"))
    }

    fn build_context(&self, context_dir: &Path) -> Result<bytes::Bytes, Error> {
        let tar_gz = BytesMut::new().writer();
        let enc = GzEncoder::new(tar_gz, Compression::default());
        let mut tar = tar::Builder::new(enc);
        tar.append_dir_all(".", context_dir)?;
        let tar_gz = tar.into_inner()?.finish()?;
        Ok(tar_gz.into_inner().freeze())
    }
}

#[async_trait]
impl ContainerRuntime for DockerContainerRuntime {
    async fn image_exists(&self, app_name: &str) -> Result<bool, Error> {
        match self.docker.inspect_image(app_name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e).context(format!("Error while inspecting image {app_name}")),
        }
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        app_name: &str,
        sink: &(dyn Fn(BuildOutput) + Send + Sync),
    ) -> Result<(), Error> {
        let context = self.build_context(context_dir)?;

        info!("Build image {}", app_name);
        let mut stream = self.docker.build_image(
            BuildImageOptions {
                dockerfile: "Dockerfile",
                t: app_name,
                rm: true,
                pull: true,
                ..Default::default()
            },
            None,
            Some(context),
        );

        let mut failed = false;
        while let Some(message) = stream.next().await {
            match message {
                Ok(build_info) => {
                    if let Some(output) = build_info.stream {
                        for line in output.lines().filter(|line| !is_progress_marker(line)) {
                            sink(BuildOutput::Line(line.to_string()));
                        }
                    }
                    if let Some(error) = build_info.error {
                        failed = true;
                        for line in error.lines() {
                            sink(BuildOutput::Error(line.to_string()));
                        }
                        if let Some(detail) = build_info.error_detail.and_then(|d| d.message) {
                            for line in detail.lines().filter(|line| line.trim() != error.trim()) {
                                sink(BuildOutput::Error(line.to_string()));
                            }
                        }
                    }
                }
                Err(e) => {
                    failed = true;
                    sink(BuildOutput::Error(e.to_string()));
                }
            }
        }

        if failed {
            Err(anyhow!("Image build failed for {}", app_name))
        } else {
            Ok(())
        }
    }

    async fn container_state(&self, app_name: &str) -> Result<ContainerState, Error> {
        match self.docker.inspect_container(app_name, None).await {
            Ok(container) => {
                let running = container
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false);
                Ok(if running {
                    ContainerState::Running
                } else {
                    ContainerState::Stopped
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerState::Absent),
            Err(e) => Err(e).context(format!("Error while inspecting container {app_name}")),
        }
    }

    async fn create_and_start(&self, app: &Application, host_port: u16) -> Result<(), Error> {
        let container_port = self.extract_min_exposed_port(&app.name).await?;

        // The log directory is bind-mounted so logs survive container
        // recreation.
        let log_dir = self.app_log_dir(&app.name);
        create_dir_all(&log_dir)
            .context(format!("Can't create log directory for {}", app.name))?;

        let config = Config {
            image: Some(app.name.clone()),
            exposed_ports: Some(HashMap::from([(
                format!("{container_port}/tcp"),
                HashMap::new(),
            )])),
            host_config: Some(HostConfig {
                port_bindings: Some(HashMap::from([(
                    format!("{container_port}/tcp"),
                    Some(vec![PortBinding {
                        host_port: Some(host_port.to_string()),
                        host_ip: None,
                    }]),
                )])),
                binds: Some(vec![format!(
                    "{}:{}",
                    log_dir.display(),
                    CONTAINER_LOG_DIR
                )]),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ON_FAILURE),
                    maximum_retry_count: Some(3),
                }),
                ..Default::default()
            }),
            labels: Some(HashMap::from([(
                String::from("quay.application.name"),
                app.name.clone(),
            )])),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: app.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .context(format!("Error while creating container for {}", app.name))?;
        self.docker
            .start_container(container.id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .context(format!("Error while starting container for {}", app.name))?;
        info!("Container {} started on port {}", app.name, host_port);
        Ok(())
    }

    async fn restart(&self, app_name: &str) -> Result<(), Error> {
        self.docker
            .restart_container(app_name, None)
            .await
            .context(format!("Error while restarting container {app_name}"))
    }

    async fn stop(&self, app_name: &str) -> Result<(), Error> {
        match self.container_state(app_name).await? {
            ContainerState::Running => self
                .docker
                .stop_container(app_name, None::<StopContainerOptions>)
                .await
                .context(format!("Error while stopping container {app_name}")),
            ContainerState::Stopped | ContainerState::Absent => Ok(()),
        }
    }

    async fn tail_logs(&self, app_name: &str, lines: usize) -> Result<Vec<String>, Error> {
        let path = self.app_log_file(app_name);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        tail_file(&path, lines, TAIL_BLOCK_SIZE)
            .context(format!("Error while tailing logs for {app_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_lines(path: &Path, count: usize) {
        let content: String = (1..=count).map(|i| format!("line {i}\n")).collect();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn tail_returns_last_n_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        write_lines(&path, 100);

        let lines = tail_file(&path, 3, TAIL_BLOCK_SIZE).unwrap();
        assert_eq!(lines, vec!["line 98", "line 99", "line 100"]);
    }

    #[test]
    fn tail_with_tiny_blocks_crosses_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        write_lines(&path, 50);

        // Force the backward walk to grow the window several times.
        let lines = tail_file(&path, 5, 16).unwrap();
        assert_eq!(
            lines,
            vec!["line 46", "line 47", "line 48", "line 49", "line 50"]
        );
    }

    #[test]
    fn tail_of_short_file_returns_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        write_lines(&path, 2);

        let lines = tail_file(&path, 10, TAIL_BLOCK_SIZE).unwrap();
        assert_eq!(lines, vec!["line 1", "line 2"]);
    }

    #[test]
    fn tail_handles_missing_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\nthree").unwrap();

        let lines = tail_file(&path, 2, TAIL_BLOCK_SIZE).unwrap();
        assert_eq!(lines, vec!["two", "three"]);
    }

    #[test]
    fn tail_of_empty_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        assert!(tail_file(&path, 5, TAIL_BLOCK_SIZE).unwrap().is_empty());
    }

    #[test]
    fn progress_markers_are_filtered() {
        for line in [
            "Step 3/7 : RUN pip install -r requirements.txt",
            " ---> a1b2c3d4e5f6",
            "---> Running in 0123456789ab",
            "Removing intermediate container 0123456789ab",
            "Using cache",
            "0123456789abcdef",
            "   ",
        ] {
            assert!(is_progress_marker(line), "{line}");
        }
    }

    #[test]
    fn substantive_lines_are_kept() {
        for line in [
            "Collecting flask",
            "Successfully installed flask-3.0.0",
            "error: subprocess-exited-with-error",
            "Successfully tagged demo:latest",
        ] {
            assert!(!is_progress_marker(line), "{line}");
        }
    }
}
