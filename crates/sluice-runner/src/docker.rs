//! Docker runtime used by the local task executor.

use crate::runner::{OutputLine, OutputStream};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use futures::{StreamExt, TryStreamExt};
use sluice_core::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Label put on every task container.
pub const TASK_LABEL: &str = "io.sluice.task";

/// Everything needed to create one task container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// The slice of the docker API the executor needs.
#[async_trait]
pub trait DockerRuntime: Send + Sync {
    /// Pull the image unless it is already present.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create and start a container, returning its id. A container that was
    /// created but failed to start is removed before returning the error.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Block until the container stops; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Captured output, at most `max_bytes` per stream.
    async fn logs(&self, id: &str, max_bytes: usize) -> Result<Vec<OutputLine>>;

    async fn kill(&self, id: &str) -> Result<()>;

    /// Force-remove. Removing a container that is already gone succeeds.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Ids of containers carrying `label`, running or not.
    async fn list(&self, label: &str) -> Result<Vec<String>>;
}

/// Fully qualify an image reference: `alpine` becomes
/// `docker.io/library/alpine:latest`.
pub fn qualify_image(image: &str) -> String {
    let (name, suffix) = match image.find('@') {
        Some(at) => (&image[..at], &image[at..]),
        None => (image, ""),
    };

    let last_segment = name.rsplit('/').next().unwrap_or(name);
    let needs_tag = suffix.is_empty() && !last_segment.contains(':');

    let mut segments = name.splitn(2, '/');
    let first = segments.next().unwrap_or_default();
    let has_registry = segments.next().is_some()
        && (first.contains('.') || first.contains(':') || first == "localhost");

    let mut qualified = if has_registry {
        name.to_string()
    } else if name.contains('/') {
        format!("docker.io/{name}")
    } else {
        format!("docker.io/library/{name}")
    };
    if needs_tag {
        qualified.push_str(":latest");
    }
    qualified.push_str(suffix);
    qualified
}

fn docker_error(action: &str, e: bollard::errors::Error) -> Error {
    Error::DockerPool(format!("{action}: {e}"))
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// [`DockerRuntime`] on top of the local docker daemon.
#[derive(Debug, Clone)]
pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| docker_error("failed to connect to docker", e))?;
        Ok(Self { docker })
    }

    /// Create with an existing Docker client.
    pub fn with_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl DockerRuntime for BollardRuntime {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| docker_error(&format!("failed to pull {image}"), e))?;
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            host_config: Some(bollard::models::HostConfig {
                binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| docker_error("failed to create container", e))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(remove) = self.remove(&created.id).await {
                warn!(container = %created.id, error = %remove, "Failed to remove unstarted container");
            }
            return Err(docker_error("failed to start container", e));
        }

        debug!(container = %created.id, name = %spec.name, image = %spec.image, "Container started");
        Ok(created.id)
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        match self.docker.wait_container(id, Some(options)).next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(docker_error("container wait failed", e)),
            None => Err(Error::DockerPool("container wait returned no result".to_string())),
        }
    }

    async fn logs(&self, id: &str, max_bytes: usize) -> Result<Vec<OutputLine>> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut lines = Vec::new();
        let (mut stdout_bytes, mut stderr_bytes) = (0usize, 0usize);
        let (mut stdout_line, mut stderr_line) = (0u32, 0u32);

        while let Some(chunk) = stream.next().await {
            let (kind, message, used, line_number) = match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    (OutputStream::Stdout, message, &mut stdout_bytes, &mut stdout_line)
                }
                Ok(LogOutput::StdErr { message }) => {
                    (OutputStream::Stderr, message, &mut stderr_bytes, &mut stderr_line)
                }
                Ok(_) => continue,
                Err(e) => return Err(docker_error("failed to read container logs", e)),
            };

            if *used >= max_bytes {
                continue;
            }
            let text = String::from_utf8_lossy(&message);
            for content in text.lines() {
                if *used >= max_bytes {
                    break;
                }
                *used += content.len() + 1;
                *line_number += 1;
                lines.push(OutputLine {
                    stream: kind,
                    content: content.to_string(),
                    line_number: *line_number,
                });
            }
        }

        Ok(lines)
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container::<String>(id, None)
            .await
            .map_err(|e| docker_error("failed to kill container", e))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_error("failed to remove container", e)),
        }
    }

    async fn list(&self, label: &str) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| docker_error("failed to list containers", e))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
