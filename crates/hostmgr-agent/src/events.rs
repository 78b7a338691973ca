//! Outbound log/status events.
//!
//! Publishing never blocks: events go into a bounded queue with `try_send`
//! and are dropped (and counted) when the queue is full or closed.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use hostmgr_proto::agent_v1;
use hostmgr_session::{SessionId, SessionStatus, SlotId};
use tokio::sync::mpsc;

use crate::frames::StreamKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
    Agent,
}

impl From<StreamKind> for LogSource {
    fn from(value: StreamKind) -> Self {
        match value {
            StreamKind::Stdout => LogSource::Stdout,
            StreamKind::Stderr => LogSource::Stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp_ms: i64,
    pub source: LogSource,
    pub message: String,
}

impl LogLine {
    pub fn now(source: LogSource, message: impl Into<String>) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis(),
            source,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Logs {
        session_id: SessionId,
        lines: Vec<LogLine>,
    },
    Status {
        session_id: SessionId,
        slot_id: SlotId,
        status: SessionStatus,
        exit_code: Option<i64>,
        at: DateTime<Utc>,
        message: Option<String>,
    },
}

pub(crate) fn status_to_proto(s: SessionStatus) -> agent_v1::SessionStatus {
    match s {
        SessionStatus::Pending => agent_v1::SessionStatus::Pending,
        SessionStatus::Starting => agent_v1::SessionStatus::Starting,
        SessionStatus::Running => agent_v1::SessionStatus::Running,
        SessionStatus::Stopping => agent_v1::SessionStatus::Stopping,
        SessionStatus::Stopped => agent_v1::SessionStatus::Stopped,
        SessionStatus::Crashed => agent_v1::SessionStatus::Crashed,
    }
}

impl AgentEvent {
    pub fn into_proto(self) -> agent_v1::AgentEvent {
        let event = match self {
            AgentEvent::Logs { session_id, lines } => {
                agent_v1::agent_event::Event::Logs(agent_v1::LogBatch {
                    session_id: session_id.0,
                    lines: lines
                        .into_iter()
                        .map(|l| agent_v1::LogLine {
                            timestamp_ms: l.timestamp_ms,
                            source: match l.source {
                                LogSource::Stdout => agent_v1::LogSource::Stdout,
                                LogSource::Stderr => agent_v1::LogSource::Stderr,
                                LogSource::Agent => agent_v1::LogSource::Agent,
                            } as i32,
                            message: l.message,
                        })
                        .collect(),
                })
            }
            AgentEvent::Status {
                session_id,
                slot_id,
                status,
                exit_code,
                at,
                message,
            } => agent_v1::agent_event::Event::Status(agent_v1::StatusChanged {
                session_id: session_id.0,
                slot_id: slot_id.0,
                status: status_to_proto(status) as i32,
                exit_code: exit_code.unwrap_or_default(),
                has_exit_code: exit_code.is_some(),
                at_unix_ms: at.timestamp_millis(),
                message: message.unwrap_or_default(),
            }),
        };
        agent_v1::AgentEvent { event: Some(event) }
    }
}

#[derive(Clone, Debug)]
pub struct EventPublisher {
    tx: mpsc::Sender<AgentEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn publish(&self, event: AgentEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n % 1000 == 0 {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "queue closed",
                };
                tracing::warn!(dropped_total = n, reason, "dropping outbound agent event");
            }
        }
    }

    pub fn logs(&self, session_id: SessionId, lines: Vec<LogLine>) {
        if lines.is_empty() {
            return;
        }
        self.publish(AgentEvent::Logs { session_id, lines });
    }

    /// Agent-authored line in the session's log stream.
    pub fn agent_line(&self, session_id: SessionId, message: impl Into<String>) {
        self.logs(session_id, vec![LogLine::now(LogSource::Agent, message)]);
    }

    pub fn status(
        &self,
        session_id: SessionId,
        slot_id: SlotId,
        status: SessionStatus,
        exit_code: Option<i64>,
        message: Option<String>,
    ) {
        self.publish(AgentEvent::Status {
            session_id,
            slot_id,
            status,
            exit_code,
            at: Utc::now(),
            message,
        });
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
