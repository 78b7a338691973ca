//! Session lifecycle: Start, Stop/Kill, SendInput.
//!
//! Start and Stop run on their own tasks so that a caller dropping its
//! future (client disconnect) never leaves a half-created session behind;
//! cancellation is signalled explicitly through a [`CancellationToken`] and
//! always goes through rollback.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use hostmgr_session::{
    ServerId, SessionId, SessionSnapshot, SessionStats, SessionStatus, SlotId,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::{self, AgentConfig},
    error::SessionError,
    events::EventPublisher,
    labels::{self, LabelledResource, ResourceKind},
    output::{self, ReaderSettings},
    registry::{InsertError, SessionEntry, SessionRegistry},
    runtime::{ContainerRuntime, ContainerSpec, NetworkSpec, PortMapping, RuntimeError},
    strategies::{self, StrategySource},
    volumes::{self, ResolvedVolume, VolumeRequest},
};

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: SessionId,
    pub slot_id: SlotId,
    pub server_id: ServerId,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeRequest>,
    pub force: bool,
}

struct ControllerInner {
    config: Arc<AgentConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: SessionRegistry,
    events: EventPublisher,
    strategies: Arc<dyn StrategySource>,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("server_id", &self.inner.config.server_id)
            .field("sessions", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

fn ignore_gone(res: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        Err(RuntimeError::NotModified(_)) => Ok(()),
        other => other,
    }
}

impl SessionController {
    pub fn new(
        config: Arc<AgentConfig>,
        runtime: Arc<dyn ContainerRuntime>,
        registry: SessionRegistry,
        events: EventPublisher,
        strategies: Arc<dyn StrategySource>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                config,
                runtime,
                registry,
                events,
                strategies,
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventPublisher {
        &self.inner.events
    }

    pub(crate) fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            batch_lines: self.inner.config.log_batch_lines,
            flush_interval: self.inner.config.log_flush_interval,
        }
    }

    pub fn get(&self, id: SessionId) -> Result<SessionSnapshot, SessionError> {
        self.inner
            .registry
            .get(id)
            .map(|e| e.snapshot())
            .ok_or(SessionError::NotFound(id))
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.inner.registry.snapshots()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.registry.stats()
    }

    pub async fn start(
        &self,
        req: StartRequest,
        cancel: CancellationToken,
    ) -> Result<SessionSnapshot, SessionError> {
        let span = tracing::info_span!(
            "session_start",
            session_id = %req.session_id,
            slot_id = %req.slot_id
        );
        let this = self.clone();
        tokio::spawn(async move { this.start_inner(req, cancel).await }.instrument(span))
            .await
            .map_err(|e| SessionError::Internal(format!("start task failed: {e}")))?
    }

    pub async fn stop(&self, id: SessionId, force: bool) -> Result<SessionSnapshot, SessionError> {
        let entry = self
            .inner
            .registry
            .get(id)
            .ok_or(SessionError::NotFound(id))?;
        let span = tracing::info_span!("session_stop", session_id = %id, force);
        let this = self.clone();
        tokio::spawn(async move { this.stop_entry(entry, force).await }.instrument(span))
            .await
            .map_err(|e| SessionError::Internal(format!("stop task failed: {e}")))
    }

    pub async fn kill(&self, id: SessionId) -> Result<SessionSnapshot, SessionError> {
        self.stop(id, true).await
    }

    pub async fn send_input(&self, id: SessionId, data: &[u8]) -> Result<(), SessionError> {
        let entry = self
            .inner
            .registry
            .get(id)
            .ok_or(SessionError::NotFound(id))?;
        let status = entry.status();
        if status != SessionStatus::Running {
            return Err(SessionError::NotRunning { id, status });
        }
        let mut line = data.to_vec();
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        entry.write_input(&line).await?;
        Ok(())
    }

    fn validate(&self, req: &StartRequest) -> Result<Vec<ResolvedVolume>, SessionError> {
        let cfg = &self.inner.config;
        if req.server_id != cfg.server_id {
            return Err(SessionError::Invalid(format!(
                "server_id {} does not match this agent ({})",
                req.server_id, cfg.server_id
            )));
        }
        if req.image.trim().is_empty() {
            return Err(SessionError::Invalid("image must be non-empty".to_string()));
        }
        let data_root = config::absolute_path(&cfg.data_root);
        volumes::resolve(&data_root, req.server_id, req.slot_id, &req.volumes)
            .map_err(|e| SessionError::Invalid(e.to_string()))
    }

    async fn start_inner(
        &self,
        req: StartRequest,
        cancel: CancellationToken,
    ) -> Result<SessionSnapshot, SessionError> {
        let inner = &self.inner;
        let resolved = self.validate(&req)?;
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        if inner.registry.contains(req.session_id) {
            return Err(SessionError::DuplicateSession(req.session_id));
        }
        if let Some(occupant) = inner.registry.get_by_slot(req.slot_id) {
            if !req.force {
                return Err(SessionError::SlotOccupied {
                    slot: req.slot_id,
                    session: occupant.id,
                });
            }
            tracing::info!(occupant = %occupant.id, "force start: stopping current session");
            self.stop_entry(occupant, false).await;
        }
        self.reap_terminal(req.slot_id).await;

        let env = inner.config.environment.as_deref();
        let container_name = labels::container_name(req.server_id, req.slot_id, env);
        if req.force {
            self.remove_stale_container(&container_name).await;
        }

        let entry = SessionEntry::new(
            req.session_id,
            req.slot_id,
            req.server_id,
            container_name,
            labels::network_name(req.server_id, req.slot_id, req.session_id, env),
        );
        inner.registry.insert(entry.clone()).map_err(|e| match e {
            InsertError::Duplicate(id) => SessionError::DuplicateSession(id),
            InsertError::SlotOccupied { slot, session } => {
                SessionError::SlotOccupied { slot, session }
            }
        })?;
        entry.set_status(SessionStatus::Starting);
        inner
            .events
            .status(entry.id, entry.slot_id, SessionStatus::Starting, None, None);
        inner
            .events
            .agent_line(entry.id, format!("start requested (image {})", req.image));
        tracing::info!(image = %req.image, container = %entry.container_name, "starting session");

        let outcome = tokio::select! {
            res = tokio::time::timeout(inner.config.start_timeout, self.provision(&entry, &req, &resolved)) => {
                res.unwrap_or(Err(SessionError::Timeout("start")))
            }
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(container = %entry.container_name, "session running");
                Ok(entry.snapshot())
            }
            Err(e) => {
                tracing::warn!(error = %e, permanent = e.is_permanent(), "start failed, rolling back");
                self.rollback(&entry, &e).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        entry: &Arc<SessionEntry>,
        req: &StartRequest,
        resolved: &[ResolvedVolume],
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        let env = inner.config.environment.as_deref();
        let created_at = Utc::now();

        let net = NetworkSpec {
            name: entry.network_name.clone(),
            labels: labels::resource_labels(
                ResourceKind::Network,
                entry.id,
                entry.slot_id,
                entry.server_id,
                env,
                created_at,
            ),
        };
        let network_id = match inner.runtime.create_network(&net).await {
            Ok(id) => id,
            Err(RuntimeError::Conflict(_)) => {
                tracing::debug!(network = %net.name, "network exists, reusing");
                inner
                    .runtime
                    .find_network(&net.name)
                    .await?
                    .ok_or_else(|| RuntimeError::NotFound(net.name.clone()))?
            }
            Err(e) => return Err(e.into()),
        };
        entry.update(|st| st.network_id = Some(network_id));

        volumes::ensure_dirs(resolved).await?;
        self.render_strategies(entry, resolved).await;

        let spec = ContainerSpec {
            name: entry.container_name.clone(),
            image: req.image.clone(),
            command: req.command.clone(),
            env: req.env.clone(),
            ports: req.ports.clone(),
            binds: resolved.iter().map(ResolvedVolume::bind).collect(),
            network: Some(entry.network_name.clone()),
            labels: labels::resource_labels(
                ResourceKind::GameContainer,
                entry.id,
                entry.slot_id,
                entry.server_id,
                env,
                created_at,
            ),
        };
        let container_id = self.create_container(entry, &spec, req.force).await?;
        entry.update(|st| st.container_id = Some(container_id));

        ignore_gone(inner.runtime.start_container(&spec.name).await)?;

        let attachment = inner.runtime.attach(&spec.name).await?;
        entry.set_stdin(attachment.input).await;

        // Running must be visible before the reader exists so an immediate
        // exit is classified as a crash.
        let promoted = entry.update(|st| {
            if st.status != SessionStatus::Starting {
                return false;
            }
            st.status = SessionStatus::Running;
            st.started_at = Some(Utc::now());
            true
        });
        if !promoted {
            return Err(SessionError::Cancelled);
        }
        let handle = output::spawn(
            entry.clone(),
            attachment.output,
            inner.runtime.clone(),
            inner.events.clone(),
            self.reader_settings(),
        );
        entry.set_reader(handle);

        inner
            .events
            .status(entry.id, entry.slot_id, SessionStatus::Running, None, None);
        Ok(())
    }

    /// Best-effort; configuration is an enhancement, never a reason to fail.
    async fn render_strategies(&self, entry: &SessionEntry, resolved: &[ResolvedVolume]) {
        let inner = &self.inner;
        let fetch = inner.strategies.fetch(entry.server_id, entry.slot_id);
        match tokio::time::timeout(inner.config.strategy_fetch_timeout, fetch).await {
            Ok(Ok(list)) if list.is_empty() => {}
            Ok(Ok(list)) => {
                let written = strategies::apply(&list, resolved).await;
                tracing::info!(written, total = list.len(), "configuration strategies rendered");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %format!("{e:#}"), "strategy fetch failed, starting without extra configuration");
                inner
                    .events
                    .agent_line(entry.id, "configuration fetch failed; starting with defaults");
            }
            Err(_) => {
                tracing::warn!("strategy fetch timed out, starting without extra configuration");
                inner
                    .events
                    .agent_line(entry.id, "configuration fetch timed out; starting with defaults");
            }
        }
    }

    async fn create_container(
        &self,
        entry: &SessionEntry,
        spec: &ContainerSpec,
        force: bool,
    ) -> Result<String, SessionError> {
        let runtime = &self.inner.runtime;
        let first = match runtime.create_container(spec).await {
            Err(RuntimeError::ImageNotFound(_)) => {
                self.inner
                    .events
                    .agent_line(entry.id, format!("pulling image {}", spec.image));
                runtime
                    .pull_image(&spec.image)
                    .await
                    .map_err(|e| SessionError::ImageUnavailable {
                        image: spec.image.clone(),
                        message: e.to_string(),
                    })?;
                match runtime.create_container(spec).await {
                    Err(RuntimeError::ImageNotFound(_)) => {
                        return Err(SessionError::ImageUnavailable {
                            image: spec.image.clone(),
                            message: "image still missing after pull".to_string(),
                        });
                    }
                    other => other,
                }
            }
            other => other,
        };

        match first {
            Ok(id) => Ok(id),
            Err(RuntimeError::Conflict(_)) if force => {
                let info = runtime.inspect_container(&spec.name).await?;
                if info.running {
                    tracing::info!(container = %spec.name, "adopting running container");
                    self.inner
                        .events
                        .agent_line(entry.id, "adopted already-running container");
                } else {
                    tracing::info!(container = %spec.name, "restarting existing container");
                }
                Ok(info.id)
            }
            Err(RuntimeError::Conflict(_)) => {
                if !self.is_own_container(entry, &spec.name).await {
                    return Err(SessionError::NameConflict(spec.name.clone()));
                }
                // An earlier attempt of this session was abandoned after the
                // runtime had already created its container.
                tracing::info!(container = %spec.name, "replacing container left by an earlier attempt");
                self.remove_stale_container(&spec.name).await;
                match runtime.create_container(spec).await {
                    Ok(id) => Ok(id),
                    Err(RuntimeError::Conflict(_)) => {
                        Err(SessionError::NameConflict(spec.name.clone()))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the container under `name` is labelled with this session.
    async fn is_own_container(&self, entry: &SessionEntry, name: &str) -> bool {
        match self.inner.runtime.inspect_container(name).await {
            Ok(info) => LabelledResource::parse(&info.labels)
                .is_some_and(|ident| ident.session_id == entry.id),
            Err(e) => {
                if !e.is_not_found() {
                    tracing::warn!(container = name, error = %e, "inspect container failed");
                }
                false
            }
        }
    }

    /// Graceful stop, then forced, then remove. Errors are logged only.
    async fn remove_stale_container(&self, name: &str) {
        let runtime = &self.inner.runtime;
        let info = match runtime.inspect_container(name).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                tracing::warn!(container = name, error = %e, "inspect stale container failed");
                return;
            }
        };
        tracing::info!(container = name, running = info.running, "removing existing container");
        if info.running {
            if let Err(e) = ignore_gone(
                runtime
                    .stop_container(name, self.inner.config.stop_timeout)
                    .await,
            ) {
                tracing::warn!(container = name, error = %e, "graceful stop failed, killing");
                if let Err(e) = ignore_gone(runtime.stop_container(name, Duration::ZERO).await) {
                    tracing::warn!(container = name, error = %e, "kill failed");
                }
            }
        }
        if let Err(e) = ignore_gone(runtime.remove_container(name).await) {
            tracing::warn!(container = name, error = %e, "remove stale container failed");
        }
    }

    /// Crashed sessions keep their slot's container name until reaped.
    async fn reap_terminal(&self, slot: SlotId) {
        for entry in self.inner.registry.terminal_in_slot(slot) {
            tracing::info!(session_id = %entry.id, status = %entry.status(), "reaping terminal session");
            self.stop_entry(entry, true).await;
        }
    }

    /// Remove whatever the session owns. Returns the container's exit code
    /// when it could be read.
    async fn teardown(&self, entry: &SessionEntry, grace: Duration) -> Option<i64> {
        let runtime = &self.inner.runtime;
        if let Some(handle) = entry.take_reader() {
            handle.cancel.cancel();
        }
        entry.close_stdin().await;

        let st = entry.state();
        let mut exit_code = st.exit_code;
        let name = entry.container_name.as_str();
        if st.container_id.is_some() {
            if let Err(e) = ignore_gone(runtime.stop_container(name, grace).await) {
                tracing::warn!(container = name, error = %e, "stop container failed");
            }
            match runtime.inspect_container(name).await {
                Ok(info) => exit_code = info.exit_code.or(exit_code),
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(container = name, error = %e, "inspect container failed"),
            }
            if let Err(e) = ignore_gone(runtime.remove_container(name).await) {
                tracing::warn!(container = name, error = %e, "remove container failed");
            }
        }
        if st.network_id.is_some()
            && let Err(e) = ignore_gone(runtime.remove_network(&entry.network_name).await)
        {
            tracing::warn!(network = %entry.network_name, error = %e, "remove network failed");
        }
        exit_code
    }

    async fn stop_entry(&self, entry: Arc<SessionEntry>, force: bool) -> SessionSnapshot {
        let inner = &self.inner;
        let was_active = entry.update(|st| {
            let active = st.status.is_active();
            if active {
                st.status = SessionStatus::Stopping;
            }
            active
        });
        if was_active {
            inner
                .events
                .status(entry.id, entry.slot_id, SessionStatus::Stopping, None, None);
        }
        inner
            .events
            .agent_line(entry.id, format!("stop requested (force={force})"));
        tracing::info!(container = %entry.container_name, force, "stopping session");

        let grace = if force {
            Duration::ZERO
        } else {
            inner.config.stop_timeout
        };
        let exit_code = self.teardown(&entry, grace).await;

        entry.update(|st| {
            st.status = SessionStatus::Stopped;
            st.stopped_at = Some(Utc::now());
            st.exit_code = exit_code;
        });
        inner
            .events
            .status(entry.id, entry.slot_id, SessionStatus::Stopped, exit_code, None);
        inner.registry.remove_entry(&entry);
        entry.snapshot()
    }

    async fn rollback(&self, entry: &Arc<SessionEntry>, cause: &SessionError) {
        // A create dropped on timeout or cancel may still have landed in the
        // runtime without its id ever being recorded.
        if entry.state().container_id.is_none()
            && self.is_own_container(entry, &entry.container_name).await
        {
            self.remove_stale_container(&entry.container_name).await;
        }
        let exit_code = self.teardown(entry, Duration::ZERO).await;
        // The network name is unique to this session.
        if let Err(e) = ignore_gone(self.inner.runtime.remove_network(&entry.network_name).await) {
            tracing::warn!(network = %entry.network_name, error = %e, "remove network failed");
        }
        entry.update(|st| {
            st.status = SessionStatus::Stopped;
            st.stopped_at = Some(Utc::now());
            st.exit_code = exit_code;
        });
        self.inner.events.status(
            entry.id,
            entry.slot_id,
            SessionStatus::Stopped,
            exit_code,
            Some(format!("start failed: {cause}")),
        );
        self.inner.registry.remove_entry(entry);
    }
}
