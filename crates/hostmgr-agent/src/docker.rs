//! Docker implementation of [`ContainerRuntime`].
//!
//! Management calls go through bollard. Attach is done with a raw HTTP
//! upgrade over the unix socket so the caller receives the daemon's framed
//! stdio stream untouched.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    errors::Error as BollardError,
    models::{ContainerCreateBody, HostConfig, NetworkCreateRequest, PortBinding},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        InspectNetworkOptions, ListContainersOptionsBuilder, ListNetworksOptionsBuilder,
        RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    },
};
use futures_util::TryStreamExt;
use http_body_util::Full;
use hyper::{Method, Request, StatusCode, Uri, body::Bytes, header};
use hyper_util::{client::legacy::Client, rt::TokioIo};
use hyperlocal::{UnixClientExt, UnixConnector, Uri as HyperlocalUri};

use crate::runtime::{
    Attachment, ContainerInfo, ContainerRuntime, ContainerSpec, NetworkSpec, ResourceSummary,
    RuntimeError,
};

pub struct DockerRuntime {
    docker: Docker,
    socket: PathBuf,
    http: Client<UnixConnector, Full<Bytes>>,
    timeout: Duration,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("socket", &self.socket)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl DockerRuntime {
    pub fn connect(socket: &Path, timeout: Duration) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_socket(
            &socket.to_string_lossy(),
            timeout.as_secs().max(1),
            API_DEFAULT_VERSION,
        )
        .with_context(|| format!("connect docker socket {}", socket.display()))?;
        Ok(Self {
            docker,
            socket: socket.to_path_buf(),
            http: Client::unix(),
            timeout,
        })
    }
}

fn map_err(e: BollardError, what: &str) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            304 => RuntimeError::NotModified(what.to_string()),
            404 => RuntimeError::NotFound(format!("{what}: {message}")),
            409 => RuntimeError::Conflict(format!("{what}: {message}")),
            status => RuntimeError::Api { status, message },
        },
        other => RuntimeError::Transport(format!("{what}: {other}")),
    }
}

/// Create answers 404 both for a missing image and for a missing network;
/// only the former is worth a pull.
fn map_create_err(e: BollardError, name: &str, image: &str) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } if message.contains("No such image") || message.contains(image) => {
            RuntimeError::ImageNotFound(image.to_string())
        }
        other => map_err(other, name),
    }
}

fn to_btree(labels: Option<HashMap<String, String>>) -> BTreeMap<String, String> {
    labels.unwrap_or_default().into_iter().collect()
}

fn label_filters(labels: &BTreeMap<String, String>) -> HashMap<String, Vec<String>> {
    let values = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    HashMap::from([("label".to_string(), values)])
}

/// Split `repo[:tag]` for the image-create endpoint. Digests and registry
/// ports are left intact.
fn split_image(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
        _ => (image, Some("latest")),
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, "ping"))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, RuntimeError> {
        let req = NetworkCreateRequest {
            name: spec.name.clone(),
            driver: Some("bridge".to_string()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            ..Default::default()
        };
        let resp = self
            .docker
            .create_network(req)
            .await
            .map_err(|e| map_err(e, &spec.name))?;
        Ok(resp.id)
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(net) => Ok(Some(net.id.unwrap_or_else(|| name.to_string()))),
            Err(e) => match map_err(e, name) {
                RuntimeError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn remove_network(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_network(name_or_id)
            .await
            .map_err(|e| map_err(e, name_or_id))
    }

    async fn list_networks(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceSummary>, RuntimeError> {
        let opts = ListNetworksOptionsBuilder::new()
            .filters(&label_filters(labels))
            .build();
        let nets = self
            .docker
            .list_networks(Some(opts))
            .await
            .map_err(|e| map_err(e, "list networks"))?;
        Ok(nets
            .into_iter()
            .map(|n| ResourceSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                labels: to_btree(n.labels),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for p in &spec.ports {
            port_bindings
                .entry(format!("{}/{}", p.container_port, p.protocol.as_str()))
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: None,
                    host_port: Some(p.host_port.to_string()),
                });
        }

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let binds: Vec<String> = spec
            .binds
            .iter()
            .map(|b| format!("{}:{}", b.host_path, b.container_path))
            .collect();

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(spec.labels.clone().into_iter().collect()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(false),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: if binds.is_empty() { None } else { Some(binds) },
                port_bindings: if port_bindings.is_empty() {
                    None
                } else {
                    Some(port_bindings)
                },
                network_mode: spec.network.clone(),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let opts = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        match self.docker.create_container(Some(opts), body).await {
            Ok(resp) => Ok(resp.id),
            Err(e) => Err(map_create_err(e, &spec.name, &spec.image)),
        }
    }

    async fn start_container(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name_or_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| map_err(e, name_or_id))
    }

    async fn stop_container(
        &self,
        name_or_id: &str,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        let secs = i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX);
        self.docker
            .stop_container(
                name_or_id,
                Some(StopContainerOptionsBuilder::new().t(secs).build()),
            )
            .await
            .map_err(|e| map_err(e, name_or_id))
    }

    async fn remove_container(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name_or_id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(false)
                        .v(false)
                        .build(),
                ),
            )
            .await
            .map_err(|e| map_err(e, name_or_id))
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerInfo, RuntimeError> {
        let resp = self
            .docker
            .inspect_container(name_or_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err(e, name_or_id))?;
        let state = resp.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);
        Ok(ContainerInfo {
            id: resp.id.unwrap_or_default(),
            name: resp
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name_or_id.to_string()),
            running,
            exit_code: if running { None } else { state.exit_code },
            labels: to_btree(resp.config.and_then(|c| c.labels)),
        })
    }

    async fn list_containers(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceSummary>, RuntimeError> {
        let opts = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&label_filters(labels))
            .build();
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|e| map_err(e, "list containers"))?;
        Ok(containers
            .into_iter()
            .map(|c| ResourceSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                labels: to_btree(c.labels),
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (from_image, tag) = split_image(image);
        let mut builder = CreateImageOptionsBuilder::new().from_image(from_image);
        if let Some(tag) = tag {
            builder = builder.tag(tag);
        }
        tracing::info!(image, "pulling image");
        self.docker
            .create_image(Some(builder.build()), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, image))
    }

    async fn attach(&self, name_or_id: &str) -> Result<Attachment, RuntimeError> {
        let path = format!("/containers/{name_or_id}/attach?stream=1&stdin=1&stdout=1&stderr=1");
        let uri: Uri = HyperlocalUri::new(&self.socket, &path).into();
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .body(Full::new(Bytes::new()))
            .map_err(|e| RuntimeError::Transport(format!("build attach request: {e}")))?;

        let resp = tokio::time::timeout(self.timeout, self.http.request(req))
            .await
            .map_err(|_| RuntimeError::Transport(format!("attach {name_or_id}: timed out")))?
            .map_err(|e| RuntimeError::Transport(format!("attach {name_or_id}: {e}")))?;

        match resp.status() {
            StatusCode::SWITCHING_PROTOCOLS => {}
            StatusCode::NOT_FOUND => return Err(RuntimeError::NotFound(name_or_id.to_string())),
            StatusCode::CONFLICT => return Err(RuntimeError::Conflict(name_or_id.to_string())),
            other => {
                return Err(RuntimeError::Api {
                    status: other.as_u16(),
                    message: format!("attach {name_or_id}: unexpected status"),
                });
            }
        }

        let upgraded = hyper::upgrade::on(resp)
            .await
            .map_err(|e| RuntimeError::Transport(format!("attach {name_or_id} upgrade: {e}")))?;
        let (output, input) = tokio::io::split(TokioIo::new(upgraded));
        Ok(Attachment {
            output: Box::new(output),
            input: Box::new(input),
        })
    }
}
