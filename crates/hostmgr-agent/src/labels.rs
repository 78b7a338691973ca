//! Label vocabulary and deterministic resource names.
//!
//! Recovery and the orphan sweep rediscover resources across agent restarts
//! purely through these labels, so the keys must stay stable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hostmgr_session::{ServerId, SessionId, SlotId};

pub const LABEL_TYPE: &str = "hostmgr.type";
pub const LABEL_SESSION_ID: &str = "hostmgr.session_id";
pub const LABEL_SLOT_ID: &str = "hostmgr.slot_id";
pub const LABEL_SERVER_ID: &str = "hostmgr.server_id";
pub const LABEL_ENVIRONMENT: &str = "hostmgr.environment";
pub const LABEL_CREATED_AT: &str = "hostmgr.created_at";

const NAME_PREFIX: &str = "hostmgr";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Network,
    GameContainer,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::GameContainer => "game",
        }
    }
}

/// Docker names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]`.
fn sanitize_component(raw: &str) -> String {
    let mut out: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while out.starts_with(['-', '.', '_']) {
        out.remove(0);
    }
    if out.is_empty() {
        out.push('x');
    }
    out
}

/// Never derived from the session id: a second Start for the same slot must
/// resolve to the same container.
pub fn container_name(server: ServerId, slot: SlotId, environment: Option<&str>) -> String {
    match environment {
        Some(env) => format!(
            "{NAME_PREFIX}-{}-game-{server}-{slot}",
            sanitize_component(env)
        ),
        None => format!("{NAME_PREFIX}-game-{server}-{slot}"),
    }
}

pub fn network_name(
    server: ServerId,
    slot: SlotId,
    session: SessionId,
    environment: Option<&str>,
) -> String {
    match environment {
        Some(env) => format!(
            "{NAME_PREFIX}-{}-net-{server}-{slot}-{session}",
            sanitize_component(env)
        ),
        None => format!("{NAME_PREFIX}-net-{server}-{slot}-{session}"),
    }
}

pub fn resource_labels(
    kind: ResourceKind,
    session: SessionId,
    slot: SlotId,
    server: ServerId,
    environment: Option<&str>,
    created_at: DateTime<Utc>,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_TYPE.to_string(), kind.as_str().to_string());
    labels.insert(LABEL_SESSION_ID.to_string(), session.to_string());
    labels.insert(LABEL_SLOT_ID.to_string(), slot.to_string());
    labels.insert(LABEL_SERVER_ID.to_string(), server.to_string());
    labels.insert(
        LABEL_ENVIRONMENT.to_string(),
        environment.unwrap_or_default().to_string(),
    );
    labels.insert(LABEL_CREATED_AT.to_string(), created_at.to_rfc3339());
    labels
}

/// Label-equality filter selecting this agent's resources of one kind.
pub fn discovery_filter(
    kind: ResourceKind,
    server: ServerId,
    environment: Option<&str>,
) -> BTreeMap<String, String> {
    let mut filter = BTreeMap::new();
    filter.insert(LABEL_TYPE.to_string(), kind.as_str().to_string());
    filter.insert(LABEL_SERVER_ID.to_string(), server.to_string());
    if let Some(env) = environment {
        filter.insert(LABEL_ENVIRONMENT.to_string(), env.to_string());
    }
    filter
}

/// Identity recovered from a labelled resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelledResource {
    pub session_id: SessionId,
    pub slot_id: SlotId,
    pub created_at: Option<DateTime<Utc>>,
}

impl LabelledResource {
    pub fn parse(labels: &BTreeMap<String, String>) -> Option<Self> {
        let session_id = labels.get(LABEL_SESSION_ID)?.trim().parse::<i64>().ok()?;
        let slot_id = labels.get(LABEL_SLOT_ID)?.trim().parse::<i64>().ok()?;
        let created_at = labels
            .get(LABEL_CREATED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v.trim()).ok())
            .map(|t| t.with_timezone(&Utc));
        Some(Self {
            session_id: SessionId(session_id),
            slot_id: SlotId(slot_id),
            created_at,
        })
    }
}
