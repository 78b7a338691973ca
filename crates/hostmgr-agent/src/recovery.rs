//! Reconciliation against the runtime.
//!
//! [`recover`] runs once at startup, before any command is accepted, and
//! re-adopts running game containers. [`sweep`] runs periodically and
//! removes labelled resources that no active session accounts for.

use chrono::Utc;
use hostmgr_session::{SessionId, SessionStatus};
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    controller::SessionController,
    error::SessionError,
    labels::{self, LabelledResource, ResourceKind},
    output,
    registry::SessionEntry,
    runtime::{ContainerInfo, ResourceSummary, RuntimeError},
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub adopted: Vec<SessionId>,
    pub exited: Vec<SessionId>,
    /// Running containers that could not be re-attached; left for the sweep.
    pub orphaned: Vec<String>,
    pub skipped: usize,
}

pub async fn recover(controller: &SessionController) -> RecoveryReport {
    let cfg = controller.config();
    let runtime = controller.runtime();
    let mut report = RecoveryReport::default();

    let filter = labels::discovery_filter(
        ResourceKind::GameContainer,
        cfg.server_id,
        cfg.environment.as_deref(),
    );
    let containers = match runtime.list_containers(&filter).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "recovery: listing containers failed, starting empty");
            return report;
        }
    };

    for c in containers {
        let Some(ident) = LabelledResource::parse(&c.labels) else {
            tracing::warn!(container = %c.name, "recovery: unreadable labels, skipping");
            report.skipped += 1;
            continue;
        };
        let info = match runtime.inspect_container(&c.name).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(container = %c.name, error = %e, "recovery: inspect failed, skipping");
                report.skipped += 1;
                continue;
            }
        };

        if !info.running {
            discard_exited(controller, &c, &info, &ident).await;
            report.exited.push(ident.session_id);
            continue;
        }

        match adopt(controller, &c, info, &ident).await {
            Ok(()) => report.adopted.push(ident.session_id),
            Err(e) => {
                tracing::warn!(
                    container = %c.name,
                    session_id = %ident.session_id,
                    error = %e,
                    "recovery: could not re-adopt running container, leaving it to the sweep"
                );
                report.orphaned.push(c.name.clone());
            }
        }
    }

    tracing::info!(
        adopted = report.adopted.len(),
        exited = report.exited.len(),
        orphaned = report.orphaned.len(),
        skipped = report.skipped,
        "recovery complete"
    );
    report
}

async fn adopt(
    controller: &SessionController,
    c: &ResourceSummary,
    info: ContainerInfo,
    ident: &LabelledResource,
) -> Result<(), SessionError> {
    let cfg = controller.config();
    let runtime = controller.runtime();
    let network_name = labels::network_name(
        cfg.server_id,
        ident.slot_id,
        ident.session_id,
        cfg.environment.as_deref(),
    );
    let network_id = runtime.find_network(&network_name).await.unwrap_or_else(|e| {
        tracing::debug!(network = %network_name, error = %e, "recovery: network lookup failed");
        None
    });

    let attachment = runtime.attach(&c.name).await?;

    let entry = SessionEntry::new(
        ident.session_id,
        ident.slot_id,
        cfg.server_id,
        c.name.clone(),
        network_name,
    );
    entry.update(|st| {
        st.status = SessionStatus::Running;
        st.container_id = Some(info.id);
        st.network_id = network_id;
        st.started_at = ident.created_at;
    });
    controller
        .registry()
        .insert(entry.clone())
        .map_err(|e| SessionError::Internal(e.to_string()))?;
    entry.set_stdin(attachment.input).await;
    let handle = output::spawn(
        entry.clone(),
        attachment.output,
        runtime.clone(),
        controller.events().clone(),
        controller.reader_settings(),
    );
    entry.set_reader(handle);

    tracing::info!(session_id = %entry.id, slot_id = %entry.slot_id, container = %c.name, "recovered running session");
    controller
        .events()
        .agent_line(entry.id, "agent restarted; session re-attached");
    controller.events().status(
        entry.id,
        entry.slot_id,
        SessionStatus::Running,
        None,
        Some("recovered".to_string()),
    );
    Ok(())
}

/// A stopped container is a session that is no longer active: report its
/// exit and free the slot's deterministic name.
async fn discard_exited(
    controller: &SessionController,
    c: &ResourceSummary,
    info: &ContainerInfo,
    ident: &LabelledResource,
) {
    let cfg = controller.config();
    let runtime = controller.runtime();
    tracing::info!(
        container = %c.name,
        session_id = %ident.session_id,
        exit_code = ?info.exit_code,
        "recovery: container exited while agent was down"
    );
    controller.events().status(
        ident.session_id,
        ident.slot_id,
        SessionStatus::Crashed,
        Some(info.exit_code.unwrap_or(output::UNKNOWN_EXIT_CODE)),
        Some("exited while agent was offline".to_string()),
    );

    match runtime.remove_container(&c.name).await {
        Ok(()) | Err(RuntimeError::NotFound(_)) => {}
        Err(e) => tracing::warn!(container = %c.name, error = %e, "recovery: remove exited container failed"),
    }
    let network = labels::network_name(
        cfg.server_id,
        ident.slot_id,
        ident.session_id,
        cfg.environment.as_deref(),
    );
    match runtime.remove_network(&network).await {
        Ok(()) | Err(RuntimeError::NotFound(_)) => {}
        Err(e) => tracing::warn!(network = %network, error = %e, "recovery: remove network failed"),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub containers_removed: Vec<String>,
    pub networks_removed: Vec<String>,
    pub within_grace: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.containers_removed.is_empty() && self.networks_removed.is_empty()
    }
}

fn past_grace(ident: &LabelledResource, grace: chrono::Duration) -> bool {
    match ident.created_at {
        Some(created) => Utc::now() - created >= grace,
        // No readable timestamp: nothing in flight could have produced it.
        None => true,
    }
}

pub async fn sweep(controller: &SessionController) -> SweepReport {
    let cfg = controller.config();
    let runtime = controller.runtime();
    let registry = controller.registry();
    let env = cfg.environment.as_deref();
    let grace = chrono::Duration::from_std(cfg.orphan_grace).unwrap_or(chrono::Duration::MAX);
    let mut report = SweepReport::default();

    let active_slots = registry.active_slot_ids();
    let containers = runtime
        .list_containers(&labels::discovery_filter(ResourceKind::GameContainer, cfg.server_id, env))
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "sweep: listing containers failed");
            Vec::new()
        });

    for c in containers {
        let Some(ident) = LabelledResource::parse(&c.labels) else {
            continue;
        };
        if active_slots.contains(&ident.slot_id) {
            continue;
        }
        if !past_grace(&ident, grace) {
            report.within_grace += 1;
            continue;
        }
        // A Start may have claimed the slot since the snapshot above.
        if registry.get_by_slot(ident.slot_id).is_some() {
            continue;
        }

        match runtime.inspect_container(&c.name).await {
            Ok(info) if info.running => {
                match runtime.stop_container(&c.name, cfg.stop_timeout).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) | Err(RuntimeError::NotModified(_)) => {}
                    Err(e) => {
                        tracing::warn!(container = %c.name, error = %e, "sweep: stop failed");
                        continue;
                    }
                }
            }
            Ok(_) => {}
            Err(RuntimeError::NotFound(_)) => continue,
            Err(e) => {
                tracing::warn!(container = %c.name, error = %e, "sweep: inspect failed");
                continue;
            }
        }
        match runtime.remove_container(&c.name).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                tracing::info!(container = %c.name, session_id = %ident.session_id, slot_id = %ident.slot_id, "sweep: removed orphaned container");
                report.containers_removed.push(c.name.clone());
                if let Some(entry) = registry.get(ident.session_id)
                    && entry.status().is_terminal()
                {
                    registry.remove_entry(&entry);
                }
            }
            Err(e) => tracing::warn!(container = %c.name, error = %e, "sweep: remove failed"),
        }
    }

    let networks = runtime
        .list_networks(&labels::discovery_filter(ResourceKind::Network, cfg.server_id, env))
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "sweep: listing networks failed");
            Vec::new()
        });

    for n in networks {
        let Some(ident) = LabelledResource::parse(&n.labels) else {
            continue;
        };
        // Networks are per session, so only that session can keep one alive.
        let owned = registry
            .get(ident.session_id)
            .map(|e| e.status().is_active())
            .unwrap_or(false);
        if owned {
            continue;
        }
        if !past_grace(&ident, grace) {
            report.within_grace += 1;
            continue;
        }
        match runtime.remove_network(&n.name).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                tracing::info!(network = %n.name, session_id = %ident.session_id, "sweep: removed orphaned network");
                report.networks_removed.push(n.name.clone());
            }
            Err(e) => {
                tracing::debug!(network = %n.name, error = %e, "sweep: network not removable yet");
            }
        }
    }

    report
}

/// Periodic sweep. The first run happens one interval after startup.
pub fn spawn_sweeper(controller: SessionController, cancel: CancellationToken) -> JoinHandle<()> {
    let period = controller.config().sweep_interval;
    let task = async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let report = sweep(&controller).await;
                    if report.is_empty() {
                        tracing::debug!(within_grace = report.within_grace, "sweep: nothing to remove");
                    } else {
                        tracing::info!(
                            containers = report.containers_removed.len(),
                            networks = report.networks_removed.len(),
                            "sweep complete"
                        );
                    }
                }
            }
        }
        tracing::debug!("sweeper stopped");
    };
    tokio::spawn(task.instrument(tracing::info_span!("orphan_sweeper")))
}
