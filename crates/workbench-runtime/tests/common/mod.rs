//! In-memory container daemon used by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use workbench_common::ImageReference;
use workbench_runtime::auth::Credentials;
use workbench_runtime::config::RuntimeConfig;
use workbench_runtime::docker::{
    ApiError, ApiResult, BuildRequest, CommitRequest, ContainerApi, ContainerInfo, ContainerSpec,
    ImageConfig, NetworkSettings, PortBinding,
};
use workbench_runtime::logs::LogSink;

pub const CONTAINER_IP: &str = "172.17.0.2";
pub const FIRST_HOST_PORT: u16 = 32768;

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Build output followed by the daemon error message.
    pub build_failure: Option<(Vec<String>, String)>,
    pub start_failure: bool,
    /// Containers exit right after start.
    pub exit_on_start: bool,
    pub create_delay: Option<Duration>,
    pub stop_delay: Option<Duration>,
    pub pull_failure: bool,
    /// Containers come up without network settings.
    pub no_network: bool,
    pub push_digest: Option<String>,
    pub push_failure: bool,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    images: BTreeMap<String, ImageConfig>,
    calls: Vec<String>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct MockContainerApi {
    state: Arc<Mutex<MockState>>,
    behavior: Arc<Mutex<MockBehavior>>,
}

/// `repo` and `repo:latest` name the same image.
fn image_key(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

fn dockerfile_cmd(content: &str) -> Option<Vec<String>> {
    content
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("CMD "))
        .last()
        .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
}

impl MockContainerApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls of one operation, e.g. `remove_container`.
    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(operation))
            .count()
    }

    pub fn add_image(&self, image: &str, cmd: &[&str]) {
        let config = ImageConfig {
            cmd: Some(cmd.iter().map(|c| c.to_string()).collect()),
            entrypoint: None,
        };
        self.state
            .lock()
            .unwrap()
            .images
            .insert(image_key(image), config);
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .images
            .contains_key(&image_key(image))
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .cloned()
            .collect()
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    fn find_id(state: &MockState, container: &str) -> Option<String> {
        if state.containers.contains_key(container) {
            return Some(container.to_string());
        }
        state
            .containers
            .values()
            .find(|c| c.spec.name.as_deref() == Some(container))
            .map(|c| c.id.clone())
    }
}

#[async_trait]
impl ContainerApi for MockContainerApi {
    async fn inspect_container(&self, container: &str) -> ApiResult<ContainerInfo> {
        let no_network = self.behavior().no_network;
        let state = self.state.lock().unwrap();
        let id = Self::find_id(&state, container)
            .ok_or_else(|| ApiError::NotFound(format!("No such container: {container}")))?;
        let found = &state.containers[&id];
        let running = found.status == "running";
        let network = (running && !no_network).then(|| NetworkSettings {
            ip_address: Some(CONTAINER_IP.to_string()),
            networks: BTreeMap::new(),
            ports: found
                .spec
                .exposed_ports
                .iter()
                .enumerate()
                .map(|(i, port)| {
                    let binding = PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: (FIRST_HOST_PORT + i as u16).to_string(),
                    };
                    (port.clone(), vec![binding])
                })
                .collect(),
        });
        Ok(ContainerInfo {
            id: found.id.clone(),
            name: found.spec.name.clone().unwrap_or_default(),
            image: found.spec.image.clone(),
            status: Some(found.status.clone()),
            running,
            env: found.spec.env.clone(),
            network,
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> ApiResult<String> {
        self.record(format!("create_container {}", spec.image));
        if let Some(delay) = self.behavior().create_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(&image_key(&spec.image)) {
            return Err(ApiError::NotFound(format!("No such image: {}", spec.image)));
        }
        if let Some(name) = &spec.name {
            if Self::find_id(&state, name).is_some() {
                return Err(ApiError::Conflict(format!("name {name} is already in use")));
            }
        }
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                status: "created".to_string(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container: &str) -> ApiResult<()> {
        self.record(format!("start_container {container}"));
        let behavior = self.behavior();
        if behavior.start_failure {
            return Err(ApiError::Daemon {
                status: 500,
                message: "driver failed programming external connectivity".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, container)
            .ok_or_else(|| ApiError::NotFound(format!("No such container: {container}")))?;
        let status = if behavior.exit_on_start { "exited" } else { "running" };
        if let Some(c) = state.containers.get_mut(&id) {
            c.status = status.to_string();
        }
        Ok(())
    }

    async fn stop_container(&self, container: &str, _grace: Duration) -> ApiResult<()> {
        self.record(format!("stop_container {container}"));
        if let Some(delay) = self.behavior().stop_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, container)
            .ok_or_else(|| ApiError::NotFound(format!("No such container: {container}")))?;
        let Some(c) = state.containers.get_mut(&id) else {
            return Err(ApiError::NotFound(container.to_string()));
        };
        if c.status != "running" {
            return Err(ApiError::Daemon {
                status: 304,
                message: "container already stopped".to_string(),
            });
        }
        c.status = "exited".to_string();
        Ok(())
    }

    async fn kill_container(&self, container: &str) -> ApiResult<()> {
        self.record(format!("kill_container {container}"));
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, container)
            .ok_or_else(|| ApiError::NotFound(format!("No such container: {container}")))?;
        if let Some(c) = state.containers.get_mut(&id) {
            c.status = "exited".to_string();
        }
        Ok(())
    }

    async fn remove_container(
        &self,
        container: &str,
        _force: bool,
        _remove_volumes: bool,
    ) -> ApiResult<()> {
        self.record(format!("remove_container {container}"));
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, container)
            .ok_or_else(|| ApiError::NotFound(format!("No such container: {container}")))?;
        state.containers.remove(&id);
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> ApiResult<ImageConfig> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(&image_key(image))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("No such image: {image}")))
    }

    async fn build_image(&self, request: &BuildRequest, logs: &dyn LogSink) -> ApiResult<String> {
        self.record(format!("build_image {}", request.repository));
        if let Some((lines, message)) = self.behavior().build_failure {
            for line in &lines {
                logs.write_line(line);
            }
            return Err(ApiError::Stream(message));
        }
        let content = request.dockerfile_content.clone().unwrap_or_default();
        for (i, line) in content.lines().filter(|l| !l.trim().is_empty()).enumerate() {
            logs.write_line(&format!("Step {}: {}", i + 1, line.trim()));
        }
        let config = ImageConfig {
            cmd: dockerfile_cmd(&content),
            entrypoint: None,
        };
        self.state
            .lock()
            .unwrap()
            .images
            .insert(image_key(&request.repository), config);
        logs.write_line("Successfully built 0123456789ab");
        Ok("sha256:0123456789ab".to_string())
    }

    async fn pull_image(
        &self,
        image: &ImageReference,
        _credentials: Option<&Credentials>,
        logs: &dyn LogSink,
    ) -> ApiResult<()> {
        let location = image.location_without_digest();
        self.record(format!("pull_image {location}"));
        if self.behavior().pull_failure {
            return Err(ApiError::NotFound(format!("manifest for {location} not found")));
        }
        logs.write_line(&format!("Pulling from {}", image.full_repository()));
        let mut state = self.state.lock().unwrap();
        state
            .images
            .entry(image_key(&location))
            .or_insert_with(|| ImageConfig {
                cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                entrypoint: None,
            });
        Ok(())
    }

    async fn tag_image(&self, image: &str, repository: &str, tag: &str) -> ApiResult<()> {
        self.record(format!("tag_image {image} {repository}:{tag}"));
        let mut state = self.state.lock().unwrap();
        let config = state
            .images
            .get(&image_key(image))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("No such image: {image}")))?;
        state.images.insert(format!("{repository}:{tag}"), config);
        Ok(())
    }

    async fn push_image(
        &self,
        repository: &str,
        tag: &str,
        _credentials: Option<&Credentials>,
        logs: &dyn LogSink,
    ) -> ApiResult<String> {
        self.record(format!("push_image {repository}:{tag}"));
        if self.behavior().push_failure {
            return Err(ApiError::Stream(
                "denied: requested access to the resource is denied".to_string(),
            ));
        }
        if !self.has_image(&format!("{repository}:{tag}")) {
            return Err(ApiError::NotFound(format!("No such image: {repository}:{tag}")));
        }
        let digest = self
            .behavior()
            .push_digest
            .unwrap_or_else(|| "sha256:4f0e2b4a".to_string());
        logs.write_line(&format!("{tag}: digest: {digest} size: 1234"));
        Ok(digest)
    }

    async fn commit_container(&self, request: &CommitRequest) -> ApiResult<String> {
        self.record(format!("commit_container {}", request.container));
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, &request.container)
            .ok_or_else(|| ApiError::NotFound(format!("No such container: {}", request.container)))?;
        let spec = state.containers[&id].spec.clone();
        let config = ImageConfig {
            cmd: spec.cmd,
            entrypoint: spec.entrypoint,
        };
        state
            .images
            .insert(format!("{}:{}", request.repository, request.tag), config);
        Ok("sha256:c0ffee".to_string())
    }

    async fn remove_image(&self, image: &str, _force: bool) -> ApiResult<()> {
        self.record(format!("remove_image {image}"));
        self.state
            .lock()
            .unwrap()
            .images
            .remove(&image_key(image))
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(format!("No such image: {image}")))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runtime settings with fast polling and workspace folders below `root`.
pub fn test_config(root: &Path) -> RuntimeConfig {
    init_tracing();
    let mut config = RuntimeConfig::default();
    config.workspaces_root = root.to_path_buf();
    config.timeouts.start_poll_interval_ms = 10;
    config.timeouts.start_deadline_secs = 2;
    config.infra.host_path_convention = workbench_runtime::path_escape::PathConvention::Unix;
    config
}
