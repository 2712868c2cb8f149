//! [`ContainerApi`] backed by the local or remote Docker daemon through bollard.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{
    BuildImageOptions, CommitContainerOptions, CreateImageOptions, PushImageOptions,
    RemoveImageOptions, TagImageOptions,
};
use bollard::models::{ContainerInspectResponse, HostConfig};
use bollard::Docker;
use futures::{Stream, StreamExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument};
use workbench_common::ImageReference;

use crate::auth::{Credentials, DEFAULT_REGISTRY};
use crate::config::TimeoutConfig;
use crate::docker::{
    ApiError, ApiResult, BuildRequest, CommitRequest, ContainerApi, ContainerInfo, ContainerSpec,
    ImageConfig, NetworkSettings, PortBinding,
};
use crate::logs::LogSink;

#[derive(Clone)]
pub struct DockerDaemon {
    docker: Docker,
    timeouts: TimeoutConfig,
}

impl DockerDaemon {
    /// Connects using `DOCKER_HOST` or the platform default socket.
    pub fn connect(timeouts: TimeoutConfig) -> ApiResult<Self> {
        let docker = Docker::connect_with_defaults()?
            .with_timeout(timeouts.request());
        Ok(Self { docker, timeouts })
    }

    pub fn with_client(docker: Docker, timeouts: TimeoutConfig) -> Self {
        Self { docker, timeouts }
    }

    async fn bounded<T, F>(&self, operation: &str, limit: Duration, fut: F) -> ApiResult<T>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        match timeout(limit, fut).await {
            Ok(result) => result.map_err(ApiError::from),
            Err(_) => Err(ApiError::Timeout(format!("{operation} after {limit:?}"))),
        }
    }

    /// Drives a progress stream to completion, handing every item to `on_item`.
    /// Each item must arrive within the step timeout and the whole stream within `total`.
    async fn drain<S, I, F>(
        &self,
        operation: &str,
        total: Duration,
        stream: S,
        mut on_item: F,
    ) -> ApiResult<()>
    where
        S: Stream<Item = Result<I, bollard::errors::Error>>,
        F: FnMut(I) -> ApiResult<()>,
    {
        tokio::pin!(stream);
        let deadline = Instant::now() + total;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ApiError::Timeout(format!("{operation} exceeded {total:?}")));
            }
            let step = self.timeouts.stream_step().min(remaining);
            let next = timeout(step, stream.next())
                .await
                .map_err(|_| ApiError::Timeout(format!("{operation}: no output for {step:?}")))?;
            match next {
                None => return Ok(()),
                Some(Ok(item)) => on_item(item)?,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

fn progress_line(id: Option<&str>, status: Option<&str>, progress: Option<&str>) -> Option<String> {
    let status = status.filter(|s| !s.is_empty())?;
    let mut line = String::new();
    if let Some(id) = id.filter(|id| !id.is_empty()) {
        line.push_str(id);
        line.push_str(": ");
    }
    line.push_str(status);
    if let Some(progress) = progress.filter(|p| !p.is_empty()) {
        line.push(' ');
        line.push_str(progress);
    }
    Some(line)
}

/// Extracts the digest from a push status line `<tag>: digest: <digest> size: <size>`.
pub(crate) fn parse_push_digest(tag: &str, status: &str) -> Option<String> {
    let prefix = format!("{tag}: digest: ");
    let rest = status.strip_prefix(&prefix)?;
    let digest = rest.split_whitespace().next()?;
    Some(digest.to_string())
}

/// Packs an inline Dockerfile into a tar build context.
fn dockerfile_context(content: &str) -> ApiResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "Dockerfile", content.as_bytes())
        .map_err(|e| ApiError::Stream(format!("failed to pack build context: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| ApiError::Stream(format!("failed to pack build context: {e}")))
}

fn to_container_info(response: ContainerInspectResponse) -> ContainerInfo {
    let state = response.state.unwrap_or_default();
    let config = response.config.unwrap_or_default();

    let network = response.network_settings.and_then(|settings| {
        let ports = settings.ports?;
        let ports = ports
            .into_iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|b| {
                        b.host_port.map(|host_port| PortBinding {
                            host_ip: b.host_ip.filter(|ip| !ip.is_empty()),
                            host_port,
                        })
                    })
                    .collect();
                (port, bindings)
            })
            .collect();
        let networks = settings
            .networks
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, endpoint)| endpoint.ip_address.map(|ip| (name, ip)))
            .collect();
        Some(NetworkSettings {
            ip_address: settings.ip_address,
            networks,
            ports,
        })
    });

    ContainerInfo {
        id: response.id.unwrap_or_default(),
        name: response
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        status: state.status.map(|s| s.to_string()),
        running: state.running.unwrap_or(false),
        env: config.env.unwrap_or_default(),
        network,
    }
}

fn empty_set(keys: &[String]) -> Option<HashMap<String, HashMap<(), ()>>> {
    if keys.is_empty() {
        return None;
    }
    Some(keys.iter().map(|k| (k.clone(), HashMap::new())).collect())
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

#[async_trait]
impl ContainerApi for DockerDaemon {
    async fn inspect_container(&self, container: &str) -> ApiResult<ContainerInfo> {
        let response = self
            .bounded(
                "inspect container",
                self.timeouts.request(),
                self.docker
                    .inspect_container(container, None::<InspectContainerOptions>),
            )
            .await?;
        Ok(to_container_info(response))
    }

    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> ApiResult<String> {
        let host_config = HostConfig {
            binds: non_empty(&spec.binds),
            memory: spec.memory,
            memory_swap: spec.memory_swap,
            network_mode: spec.network_mode.clone(),
            publish_all_ports: Some(spec.publish_all_ports),
            privileged: Some(spec.privileged),
            pids_limit: spec.pids_limit,
            extra_hosts: non_empty(&spec.extra_hosts),
            dns: non_empty(&spec.dns),
            cpuset_cpus: spec.cpuset_cpus.clone(),
            cpu_period: spec.cpu_period,
            cpu_quota: spec.cpu_quota,
            cgroup_parent: spec.cgroup_parent.clone(),
            ..Default::default()
        };

        let config = BollardConfig {
            image: Some(spec.image.clone()),
            env: non_empty(&spec.env),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            exposed_ports: empty_set(&spec.exposed_ports),
            volumes: empty_set(&spec.volumes),
            labels: (!spec.labels.is_empty())
                .then(|| spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        });

        let created = self
            .bounded(
                "create container",
                self.timeouts.request(),
                self.docker.create_container(options, config),
            )
            .await?;
        debug!(container_id = %created.id, "Container created");
        Ok(created.id)
    }

    async fn start_container(&self, container: &str) -> ApiResult<()> {
        self.bounded(
            "start container",
            self.timeouts.request(),
            self.docker
                .start_container(container, None::<StartContainerOptions<String>>),
        )
        .await
    }

    async fn stop_container(&self, container: &str, grace: Duration) -> ApiResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.bounded(
            "stop container",
            grace + self.timeouts.request(),
            self.docker.stop_container(container, Some(options)),
        )
        .await
    }

    async fn kill_container(&self, container: &str) -> ApiResult<()> {
        self.bounded(
            "kill container",
            self.timeouts.request(),
            self.docker
                .kill_container(container, None::<KillContainerOptions<String>>),
        )
        .await
    }

    async fn remove_container(
        &self,
        container: &str,
        force: bool,
        remove_volumes: bool,
    ) -> ApiResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: remove_volumes,
            ..Default::default()
        };
        self.bounded(
            "remove container",
            self.timeouts.request(),
            self.docker.remove_container(container, Some(options)),
        )
        .await
    }

    async fn inspect_image(&self, image: &str) -> ApiResult<ImageConfig> {
        let inspect = self
            .bounded(
                "inspect image",
                self.timeouts.request(),
                self.docker.inspect_image(image),
            )
            .await?;
        let config = inspect.config.unwrap_or_default();
        Ok(ImageConfig {
            cmd: config.cmd,
            entrypoint: config.entrypoint,
        })
    }

    #[instrument(skip(self, request, logs), fields(repository = %request.repository))]
    async fn build_image(&self, request: &BuildRequest, logs: &dyn LogSink) -> ApiResult<String> {
        let tar = match &request.dockerfile_content {
            Some(content) => Some(dockerfile_context(content)?),
            None => None,
        };
        let options = BuildImageOptions {
            dockerfile: request
                .dockerfile_path
                .clone()
                .unwrap_or_else(|| "Dockerfile".to_string()),
            t: request.repository.clone(),
            remote: request.remote.clone().unwrap_or_default(),
            rm: true,
            forcerm: true,
            pull: request.force_pull,
            memory: request.memory_limit.map(|m| m as u64),
            memswap: Some(-1),
            cpusetcpus: request.cpuset_cpus.clone().unwrap_or_default(),
            cpuperiod: request.cpu_period.map(|p| p as u64),
            cpuquota: request.cpu_quota.map(|q| q as u64),
            buildargs: request.build_args.clone().into_iter().collect(),
            ..Default::default()
        };

        let stream = self
            .docker
            .build_image(options, None, tar.map(bytes::Bytes::from));
        let mut image_id = None;
        self.drain("image build", self.timeouts.build(), stream, |info| {
            if let Some(error) = info.error {
                logs.write_line(&error);
                return Err(ApiError::Stream(error));
            }
            if let Some(line) = info.stream.as_deref().map(str::trim_end) {
                if !line.is_empty() {
                    if let Some(id) = line.strip_prefix("Successfully built ") {
                        image_id = Some(id.trim().to_string());
                    }
                    logs.write_line(line);
                }
            }
            if let Some(line) = progress_line(
                info.id.as_deref(),
                info.status.as_deref(),
                info.progress.as_deref(),
            ) {
                logs.write_line(&line);
            }
            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                image_id = Some(id);
            }
            Ok(())
        })
        .await?;

        image_id.ok_or_else(|| {
            ApiError::Stream("Docker image build failed. Image id not found in build output.".into())
        })
    }

    #[instrument(skip(self, credentials, logs), fields(image = %image))]
    async fn pull_image(
        &self,
        image: &ImageReference,
        credentials: Option<&Credentials>,
        logs: &dyn LogSink,
    ) -> ApiResult<()> {
        let options = CreateImageOptions {
            from_image: image.full_repository(),
            tag: image.tag_or_latest().to_string(),
            ..Default::default()
        };
        let registry = image.registry.as_deref().unwrap_or(DEFAULT_REGISTRY);
        let stream = self.docker.create_image(
            Some(options),
            None,
            credentials.map(|c| c.to_docker(registry)),
        );
        self.drain("image pull", self.timeouts.build(), stream, |info| {
            if let Some(error) = info.error {
                logs.write_line(&error);
                return Err(ApiError::Stream(error));
            }
            if let Some(line) = progress_line(
                info.id.as_deref(),
                info.status.as_deref(),
                info.progress.as_deref(),
            ) {
                logs.write_line(&line);
            }
            Ok(())
        })
        .await
    }

    async fn tag_image(&self, image: &str, repository: &str, tag: &str) -> ApiResult<()> {
        let options = TagImageOptions {
            repo: repository.to_string(),
            tag: tag.to_string(),
        };
        self.bounded(
            "tag image",
            self.timeouts.request(),
            self.docker.tag_image(image, Some(options)),
        )
        .await
    }

    #[instrument(skip(self, credentials, logs))]
    async fn push_image(
        &self,
        repository: &str,
        tag: &str,
        credentials: Option<&Credentials>,
        logs: &dyn LogSink,
    ) -> ApiResult<String> {
        let registry = ImageReference::parse(repository)
            .and_then(|r| r.registry)
            .unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
        let options = PushImageOptions {
            tag: tag.to_string(),
        };
        let stream = self.docker.push_image(
            repository,
            Some(options),
            credentials.map(|c| c.to_docker(&registry)),
        );
        let mut digest = None;
        self.drain("image push", self.timeouts.build(), stream, |info| {
            if let Some(error) = info.error {
                logs.write_line(&error);
                return Err(ApiError::Stream(error));
            }
            if let Some(status) = info.status.as_deref() {
                if let Some(found) = parse_push_digest(tag, status) {
                    digest = Some(found);
                }
                if let Some(line) = progress_line(None, Some(status), info.progress.as_deref()) {
                    logs.write_line(&line);
                }
            }
            Ok(())
        })
        .await?;

        digest.ok_or_else(|| {
            ApiError::Stream(format!(
                "Image {repository}:{tag} was pushed, but its digest wasn't obtained"
            ))
        })
    }

    #[instrument(skip(self, request), fields(container_id = %request.container))]
    async fn commit_container(&self, request: &CommitRequest) -> ApiResult<String> {
        let options = CommitContainerOptions {
            container: request.container.clone(),
            repo: request.repository.clone(),
            tag: request.tag.clone(),
            comment: request.comment.clone(),
            author: request.author.clone(),
            pause: false,
            ..Default::default()
        };
        let commit = self
            .bounded(
                "commit container",
                self.timeouts.build(),
                self.docker
                    .commit_container(options, BollardConfig::<String>::default()),
            )
            .await?;
        Ok(commit
            .id
            .unwrap_or_else(|| format!("{}:{}", request.repository, request.tag)))
    }

    async fn remove_image(&self, image: &str, force: bool) -> ApiResult<()> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        self.bounded(
            "remove image",
            self.timeouts.request(),
            self.docker.remove_image(image, Some(options), None),
        )
        .await
        .map(|_| ())
    }
}
