//! In-memory container runtime for tests.
//!
//! Attachments are `tokio::io::duplex` pairs: the fake keeps the far ends so
//! tests can emit framed output, read stdin, and close the stream to simulate
//! a container exit.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::Mutex as AsyncMutex,
};

use crate::{
    frames::{StreamKind, encode_frame},
    labels,
    runtime::{
        Attachment, ContainerInfo, ContainerRuntime, ContainerSpec, NetworkSpec, ResourceSummary,
        RuntimeError,
    },
};

const PIPE_BYTES: usize = 64 * 1024;

#[derive(Debug)]
struct FakeContainer {
    id: String,
    running: bool,
    exit_code: Option<i64>,
    labels: BTreeMap<String, String>,
    network: Option<String>,
    binds: Vec<String>,
    output: Option<Arc<AsyncMutex<DuplexStream>>>,
    stdin: Option<Arc<AsyncMutex<DuplexStream>>>,
}

#[derive(Debug)]
struct FakeNetwork {
    id: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, FakeNetwork>,
    next_id: u64,
    missing_images: HashSet<String>,
    unpullable: HashSet<String>,
    fail_attach: bool,
    fail_ping: bool,
    create_delay: Option<Duration>,
    create_reply_delay: Option<Duration>,
    stuck_containers: bool,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012x}", self.next_id)
    }

    fn container_key(&self, name_or_id: &str) -> Option<String> {
        if self.containers.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        self.containers
            .iter()
            .find(|(_, c)| c.id == name_or_id)
            .map(|(name, _)| name.clone())
    }

    fn network_key(&self, name_or_id: &str) -> Option<String> {
        if self.networks.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        self.networks
            .iter()
            .find(|(_, n)| n.id == name_or_id)
            .map(|(name, _)| name.clone())
    }
}

fn matches_labels(have: &BTreeMap<String, String>, want: &BTreeMap<String, String>) -> bool {
    want.iter().all(|(k, v)| have.get(k) == Some(v))
}

#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    pulls: AtomicUsize,
    creates: AtomicUsize,
    attaches: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_missing_image(&self, image: &str) {
        self.state.lock().missing_images.insert(image.to_string());
    }

    pub fn set_unpullable(&self, image: &str) {
        let mut st = self.state.lock();
        st.missing_images.insert(image.to_string());
        st.unpullable.insert(image.to_string());
    }

    pub fn set_fail_attach(&self, fail: bool) {
        self.state.lock().fail_attach = fail;
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.state.lock().fail_ping = fail;
    }

    pub fn set_create_delay(&self, delay: Option<Duration>) {
        self.state.lock().create_delay = delay;
    }

    /// The container exists as soon as create is called, but the reply is
    /// held back for `delay`.
    pub fn set_create_reply_delay(&self, delay: Option<Duration>) {
        self.state.lock().create_reply_delay = delay;
    }

    /// Stop and remove fail with a daemon error.
    pub fn set_stuck_containers(&self, stuck: bool) {
        self.state.lock().stuck_containers = stuck;
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.state.lock().networks.keys().cloned().collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn container_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().containers.get(name).map(|c| c.labels.clone())
    }

    pub fn container_binds(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.binds.clone())
            .unwrap_or_default()
    }

    /// Register a container as if it had been created by a previous agent.
    pub fn insert_container(
        &self,
        name: &str,
        running: bool,
        exit_code: Option<i64>,
        labels: BTreeMap<String, String>,
    ) {
        let mut st = self.state.lock();
        let id = st.next_id("c");
        st.containers.insert(
            name.to_string(),
            FakeContainer {
                id,
                running,
                exit_code,
                labels,
                network: None,
                binds: Vec::new(),
                output: None,
                stdin: None,
            },
        );
    }

    pub fn insert_network(&self, name: &str, labels: BTreeMap<String, String>) {
        let mut st = self.state.lock();
        let id = st.next_id("n");
        st.networks
            .insert(name.to_string(), FakeNetwork { id, labels });
    }

    /// Labels for a game resource created `age` ago.
    pub fn labels_aged(
        kind: labels::ResourceKind,
        session: i64,
        slot: i64,
        server: i64,
        env: Option<&str>,
        age: chrono::Duration,
    ) -> BTreeMap<String, String> {
        let created: DateTime<Utc> = Utc::now() - age;
        labels::resource_labels(
            kind,
            hostmgr_session::SessionId(session),
            hostmgr_session::SlotId(slot),
            hostmgr_session::ServerId(server),
            env,
            created,
        )
    }

    /// Write one framed chunk to the container's attached output.
    pub async fn emit(&self, name: &str, stream: StreamKind, payload: &[u8]) {
        let pipe = self
            .state
            .lock()
            .containers
            .get(name)
            .and_then(|c| c.output.clone());
        if let Some(pipe) = pipe {
            let _ = pipe.lock().await.write_all(&encode_frame(stream, payload)).await;
        }
    }

    /// Write bytes to the attached output without framing them.
    pub async fn emit_raw(&self, name: &str, bytes: &[u8]) {
        let pipe = self
            .state
            .lock()
            .containers
            .get(name)
            .and_then(|c| c.output.clone());
        if let Some(pipe) = pipe {
            let _ = pipe.lock().await.write_all(bytes).await;
        }
    }

    /// Simulate the game process exiting on its own.
    pub fn exit(&self, name: &str, code: i64) {
        let mut st = self.state.lock();
        if let Some(c) = st.containers.get_mut(name) {
            c.running = false;
            c.exit_code = Some(code);
            c.output = None;
            c.stdin = None;
        }
    }

    pub async fn read_stdin(&self, name: &str, len: usize) -> Vec<u8> {
        let pipe = self
            .state
            .lock()
            .containers
            .get(name)
            .and_then(|c| c.stdin.clone());
        let mut buf = vec![0u8; len];
        if let Some(pipe) = pipe {
            let _ = pipe.lock().await.read_exact(&mut buf).await;
        }
        buf
    }

    fn insert_created(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut st = self.state.lock();
        if st.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        if st.missing_images.contains(&spec.image) {
            return Err(RuntimeError::ImageNotFound(spec.image.clone()));
        }
        let id = st.next_id("c");
        st.containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                running: false,
                exit_code: None,
                labels: spec.labels.clone(),
                network: spec.network.clone(),
                binds: spec
                    .binds
                    .iter()
                    .map(|b| format!("{}:{}", b.host_path, b.container_path))
                    .collect(),
                output: None,
                stdin: None,
            },
        );
        Ok(id)
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.state.lock().fail_ping {
            return Err(RuntimeError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, RuntimeError> {
        let mut st = self.state.lock();
        if st.networks.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        let id = st.next_id("n");
        st.networks.insert(
            spec.name.clone(),
            FakeNetwork {
                id: id.clone(),
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        Ok(self.state.lock().networks.get(name).map(|n| n.id.clone()))
    }

    async fn remove_network(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        let mut st = self.state.lock();
        let key = st
            .network_key(name_or_id)
            .ok_or_else(|| RuntimeError::NotFound(name_or_id.to_string()))?;
        let in_use = st
            .containers
            .values()
            .any(|c| c.running && c.network.as_deref() == Some(key.as_str()));
        if in_use {
            return Err(RuntimeError::Api {
                status: 403,
                message: format!("network {key} has active endpoints"),
            });
        }
        st.networks.remove(&key);
        Ok(())
    }

    async fn list_networks(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceSummary>, RuntimeError> {
        Ok(self
            .state
            .lock()
            .networks
            .iter()
            .filter(|(_, n)| matches_labels(&n.labels, labels))
            .map(|(name, n)| ResourceSummary {
                id: n.id.clone(),
                name: name.clone(),
                labels: n.labels.clone(),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let delay = self.state.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.creates.fetch_add(1, Ordering::SeqCst);

        let id = self.insert_created(spec)?;
        let reply_delay = self.state.lock().create_reply_delay;
        if let Some(delay) = reply_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn start_container(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        let mut st = self.state.lock();
        let key = st
            .container_key(name_or_id)
            .ok_or_else(|| RuntimeError::NotFound(name_or_id.to_string()))?;
        let Some(c) = st.containers.get_mut(&key) else {
            return Err(RuntimeError::NotFound(name_or_id.to_string()));
        };
        if c.running {
            return Err(RuntimeError::NotModified(key));
        }
        c.running = true;
        c.exit_code = None;
        Ok(())
    }

    async fn stop_container(
        &self,
        name_or_id: &str,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        let mut st = self.state.lock();
        if st.stuck_containers {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("cannot stop container {name_or_id}: device or resource busy"),
            });
        }
        let key = st
            .container_key(name_or_id)
            .ok_or_else(|| RuntimeError::NotFound(name_or_id.to_string()))?;
        let Some(c) = st.containers.get_mut(&key) else {
            return Err(RuntimeError::NotFound(name_or_id.to_string()));
        };
        if !c.running {
            return Err(RuntimeError::NotModified(key));
        }
        c.running = false;
        c.exit_code = Some(if timeout.is_zero() { 137 } else { 0 });
        c.output = None;
        c.stdin = None;
        Ok(())
    }

    async fn remove_container(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        let mut st = self.state.lock();
        if st.stuck_containers {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("cannot remove container {name_or_id}: device or resource busy"),
            });
        }
        let key = st
            .container_key(name_or_id)
            .ok_or_else(|| RuntimeError::NotFound(name_or_id.to_string()))?;
        if st.containers.get(&key).map(|c| c.running).unwrap_or(false) {
            return Err(RuntimeError::Conflict(format!("container {key} is running")));
        }
        st.containers.remove(&key);
        Ok(())
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerInfo, RuntimeError> {
        let st = self.state.lock();
        let key = st
            .container_key(name_or_id)
            .ok_or_else(|| RuntimeError::NotFound(name_or_id.to_string()))?;
        let c = st
            .containers
            .get(&key)
            .ok_or_else(|| RuntimeError::NotFound(name_or_id.to_string()))?;
        Ok(ContainerInfo {
            id: c.id.clone(),
            name: key,
            running: c.running,
            exit_code: c.exit_code,
            labels: c.labels.clone(),
        })
    }

    async fn list_containers(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceSummary>, RuntimeError> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| matches_labels(&c.labels, labels))
            .map(|(name, c)| ResourceSummary {
                id: c.id.clone(),
                name: name.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        if st.unpullable.contains(image) {
            return Err(RuntimeError::Api {
                status: 404,
                message: format!("manifest for {image} not found"),
            });
        }
        st.missing_images.remove(image);
        Ok(())
    }

    async fn attach(&self, name_or_id: &str) -> Result<Attachment, RuntimeError> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        if st.fail_attach {
            return Err(RuntimeError::Transport("attach upgrade failed".to_string()));
        }
        let key = st
            .container_key(name_or_id)
            .ok_or_else(|| RuntimeError::NotFound(name_or_id.to_string()))?;
        let Some(c) = st.containers.get_mut(&key) else {
            return Err(RuntimeError::NotFound(name_or_id.to_string()));
        };
        let (client_out, runtime_out) = tokio::io::duplex(PIPE_BYTES);
        let (client_in, runtime_in) = tokio::io::duplex(PIPE_BYTES);
        if c.running {
            c.output = Some(Arc::new(AsyncMutex::new(runtime_out)));
            c.stdin = Some(Arc::new(AsyncMutex::new(runtime_in)));
        }
        // A stopped container's attachment is closed immediately.
        Ok(Attachment {
            output: Box::new(client_out),
            input: Box::new(client_in),
        })
    }
}
