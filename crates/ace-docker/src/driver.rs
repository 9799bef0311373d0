use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerInspectResponse, ContainerSummary, HostConfig, PortBinding};
use futures_util::stream::StreamExt;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::get_container_cache;
use crate::error::{DockerError, Result};
use crate::pool::get_docker_connection;

/// Everything the provisioner needs to start an engine container, already
/// shaped by `ace-control::provisioner` from an `EngineVariant` and a
/// reserved port.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    /// host_port -> container_port, TCP.
    pub port_bindings: HashMap<u16, u16>,
    pub labels: HashMap<String, String>,
    /// When set, the container joins this container's network namespace
    /// (`--network container:<name>`), which is how engines share a VPN
    /// sidecar's tunnel.
    pub network_mode_container: Option<String>,
}

/// Exit code plus drained stdout/stderr from an `exec` call.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Default)]
pub struct ContainerDriver;

impl ContainerDriver {
    pub fn new() -> Self {
        crate::cache::start_cache_cleanup_task();
        Self
    }

    #[tracing::instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn create_and_start(&self, spec: ContainerSpec) -> Result<String> {
        let mut port_bindings = HashMap::new();
        for (host_port, container_port) in &spec.port_bindings {
            port_bindings.insert(
                format!("{container_port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.network_mode_container.map(|c| format!("container:{c}")),
            restart_policy: Some(bollard::models::RestartPolicy {
                name: Some(bollard::models::RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image),
            env: Some(spec.env),
            cmd: if spec.cmd.is_empty() { None } else { Some(spec.cmd) },
            labels: Some(spec.labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let connection = get_docker_connection().await?;
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            ..Default::default()
        };
        let created = connection
            .docker()
            .create_container(Some(options), config)
            .await?;

        connection
            .docker()
            .start_container(&spec.name, None::<bollard::container::StartContainerOptions<String>>)
            .await?;

        get_container_cache().invalidate(&spec.name).await;
        debug!(container_id = %created.id, "container created and started");
        Ok(created.id)
    }

    pub async fn stop(&self, id: &str, timeout: Option<i64>) -> Result<()> {
        let connection = get_docker_connection().await?;
        let options = StopContainerOptions {
            t: timeout.unwrap_or(10),
        };
        match connection.docker().stop_container(id, Some(options)).await {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(DockerError::NotFound(id.to_string())),
            Err(e) => return Err(e.into()),
        }

        connection
            .docker()
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .ok();

        get_container_cache().invalidate(id).await;
        Ok(())
    }

    pub async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse> {
        if let Some(cached) = get_container_cache().get_inspect(id).await {
            return Ok(cached);
        }
        let connection = get_docker_connection().await?;
        let inspect = connection
            .docker()
            .inspect_container(id, None)
            .await
            .map_err(|_| DockerError::NotFound(id.to_string()))?;
        get_container_cache().put_inspect(id, inspect.clone()).await;
        Ok(inspect)
    }

    /// Executes `argv` in `id`, draining stdout/stderr fully before
    /// returning — exec pipes must never be left half-read.
    pub async fn exec(&self, id: &str, argv: Vec<&str>) -> Result<ExecOutput> {
        let connection = get_docker_connection().await?;
        let exec = connection
            .docker()
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            connection.docker().start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(other) => stdout.push_str(&other.to_string()),
                    Err(e) => warn!(error = %e, "exec stream error"),
                }
            }
        }

        let inspect = connection.docker().inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(0);
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    pub async fn list(&self, label_filter: Vec<String>) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        if !label_filter.is_empty() {
            filters.insert("label".to_string(), label_filter);
        }
        let connection = get_docker_connection().await?;
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        Ok(connection.docker().list_containers(Some(options)).await?)
    }

    /// Streams Docker daemon events matching `label_filter`. Used by
    /// startup rehydration and, optionally, by out-of-band container
    /// removal detection.
    pub async fn events(
        &self,
        label_filter: Vec<String>,
    ) -> Result<impl futures_util::Stream<Item = Result<bollard::system::EventMessage>>> {
        let mut filters = HashMap::new();
        if !label_filter.is_empty() {
            filters.insert("label".to_string(), label_filter);
        }
        let connection = get_docker_connection().await?;
        let options = bollard::system::EventsOptions::<String> {
            filters,
            ..Default::default()
        };
        let docker = connection.docker().clone();
        Ok(docker.events(Some(options)).map(|r| r.map_err(DockerError::from)))
    }

    /// Stops many containers concurrently, bounded to `max_concurrent` at a
    /// time, so e.g. 6 containers finish in roughly one timeout window
    /// instead of `6 * timeout` (spec §4.3, §5).
    pub async fn batch_stop(
        &self,
        ids: Vec<String>,
        timeout: Option<i64>,
        max_concurrent: usize,
    ) -> BatchStopResult {
        let start = std::time::Instant::now();
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for id in ids {
            let driver = self.clone();
            let permit = semaphore.clone();
            tasks.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                let result = driver.stop(&id, timeout).await;
                (id, result)
            });
        }

        let mut successful = Vec::new();
        let mut failed = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => successful.push(id),
                Ok((id, Err(e))) => {
                    failed.insert(id, e.to_string());
                }
                Err(join_err) => {
                    failed.insert("unknown".to_string(), join_err.to_string());
                }
            }
        }

        BatchStopResult {
            successful,
            failed,
            elapsed: start.elapsed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchStopResult {
    pub successful: Vec<String>,
    pub failed: HashMap<String, String>,
    pub elapsed: Duration,
}

pub const DEFAULT_SHUTDOWN_CONCURRENCY: usize = 10;
