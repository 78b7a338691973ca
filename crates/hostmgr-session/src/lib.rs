use std::fmt;

use chrono::{DateTime, Utc};

/// Externally assigned session identifier (one run of a game configuration).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct SessionId(pub i64);

/// A server + game-config pairing. Hosts at most one active session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct SlotId(pub i64);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ServerId(pub i64);

macro_rules! display_id {
    ($($t:ty),*) => {
        $(impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(SessionId, SlotId, ServerId);

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 6] = [
        SessionStatus::Pending,
        SessionStatus::Starting,
        SessionStatus::Running,
        SessionStatus::Stopping,
        SessionStatus::Stopped,
        SessionStatus::Crashed,
    ];

    /// Terminal sessions never block a new Start for their slot.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Crashed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Crashed => "crashed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a session, safe to hand out of the registry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub slot_id: SlotId,
    pub server_id: ServerId,
    pub status: SessionStatus,
    pub container_name: String,
    pub container_id: Option<String>,
    pub network_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SessionStats {
    pub total: usize,
    pub pending: usize,
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
    pub stopped: usize,
    pub crashed: usize,
}

impl SessionStats {
    pub fn record(&mut self, status: SessionStatus) {
        self.total += 1;
        *self.slot_mut(status) += 1;
    }

    pub fn count(&self, status: SessionStatus) -> usize {
        match status {
            SessionStatus::Pending => self.pending,
            SessionStatus::Starting => self.starting,
            SessionStatus::Running => self.running,
            SessionStatus::Stopping => self.stopping,
            SessionStatus::Stopped => self.stopped,
            SessionStatus::Crashed => self.crashed,
        }
    }

    fn slot_mut(&mut self, status: SessionStatus) -> &mut usize {
        match status {
            SessionStatus::Pending => &mut self.pending,
            SessionStatus::Starting => &mut self.starting,
            SessionStatus::Running => &mut self.running,
            SessionStatus::Stopping => &mut self.stopping,
            SessionStatus::Stopped => &mut self.stopped,
            SessionStatus::Crashed => &mut self.crashed,
        }
    }
}
