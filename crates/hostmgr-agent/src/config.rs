use std::{
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use hostmgr_session::ServerId;

const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
const DEFAULT_GRPC_ADDR: &str = "0.0.0.0:50061";

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    env_string(name).and_then(|v| v.parse::<usize>().ok())
}

/// Resolve a relative path against the working directory. Bind mounts need
/// an absolute host path; a relative one would be taken as a volume name.
pub fn absolute_path(p: &Path) -> PathBuf {
    if p.is_absolute() {
        return p.to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(p)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn data_root(raw: Option<String>) -> PathBuf {
    let abs = absolute_path(Path::new(raw.as_deref().unwrap_or("./data")));
    // Best-effort: the directory may not exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

fn env_secs(name: &str, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_secs(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

fn env_millis(name: &str, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

/// Accept http(s) URLs for the tunnel by converting them to ws(s).
pub(crate) fn parse_ws_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Some(format!("ws://{rest}"));
    }
    Some(trimmed.to_string())
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_id: ServerId,
    pub environment: Option<String>,
    pub node_name: String,
    pub data_root: PathBuf,
    pub docker_socket: PathBuf,
    pub docker_timeout: Duration,
    pub grpc_addr: SocketAddr,
    pub control_ws_url: Option<String>,
    pub node_token: Option<String>,
    pub control_grpc_url: Option<String>,
    pub strategy_fetch_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub sweep_interval: Duration,
    pub orphan_grace: Duration,
    pub log_batch_lines: usize,
    pub log_flush_interval: Duration,
    pub event_queue_capacity: usize,
    pub log_dir: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let raw_server = env_string("HOSTMGR_SERVER_ID")
            .ok_or_else(|| anyhow::anyhow!("HOSTMGR_SERVER_ID is required"))?;
        let server_id = raw_server
            .parse::<i64>()
            .with_context(|| format!("invalid HOSTMGR_SERVER_ID: {raw_server}"))?;

        let grpc_addr = env_string("HOSTMGR_GRPC_ADDR")
            .unwrap_or_else(|| DEFAULT_GRPC_ADDR.to_string());
        let grpc_addr: SocketAddr = grpc_addr
            .parse()
            .with_context(|| format!("invalid HOSTMGR_GRPC_ADDR: {grpc_addr}"))?;

        let node_name = env_string("HOSTMGR_NODE_NAME")
            .or_else(|| env_string("HOSTNAME"))
            .unwrap_or_else(|| format!("server-{server_id}"));

        Ok(Self {
            server_id: ServerId(server_id),
            environment: env_string("HOSTMGR_ENVIRONMENT"),
            node_name,
            data_root: data_root(env_string("HOSTMGR_DATA_ROOT")),
            docker_socket: env_string("HOSTMGR_DOCKER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOCKER_SOCKET)),
            docker_timeout: env_secs("HOSTMGR_DOCKER_TIMEOUT_SEC", 120, 5, 600),
            grpc_addr,
            control_ws_url: env_string("HOSTMGR_CONTROL_WS_URL").and_then(|v| parse_ws_url(&v)),
            node_token: env_string("HOSTMGR_NODE_TOKEN"),
            control_grpc_url: env_string("HOSTMGR_CONTROL_GRPC_URL"),
            strategy_fetch_timeout: env_millis(
                "HOSTMGR_STRATEGY_FETCH_TIMEOUT_MS",
                5000,
                100,
                120_000,
            ),
            start_timeout: env_secs("HOSTMGR_START_TIMEOUT_SEC", 180, 10, 3600),
            stop_timeout: env_secs("HOSTMGR_STOP_TIMEOUT_SEC", 30, 1, 600),
            sweep_interval: env_secs("HOSTMGR_SWEEP_INTERVAL_SEC", 180, 10, 3600),
            orphan_grace: env_secs("HOSTMGR_ORPHAN_GRACE_SEC", 300, 30, 86_400),
            log_batch_lines: env_usize("HOSTMGR_LOG_BATCH_LINES")
                .map(|v| v.clamp(1, 10_000))
                .unwrap_or(50),
            log_flush_interval: env_millis("HOSTMGR_LOG_FLUSH_MS", 1000, 50, 60_000),
            event_queue_capacity: env_usize("HOSTMGR_EVENT_QUEUE")
                .map(|v| v.clamp(64, 1_000_000))
                .unwrap_or(4096),
            log_dir: env_string("HOSTMGR_LOG_DIR").map(PathBuf::from),
        })
    }

    /// Defaults suitable for tests; nothing is read from the environment.
    #[cfg(test)]
    pub fn for_tests(data_root: PathBuf) -> Self {
        Self {
            server_id: ServerId(7),
            environment: Some("test".to_string()),
            node_name: "test-node".to_string(),
            data_root,
            docker_socket: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            docker_timeout: Duration::from_secs(5),
            grpc_addr: ([127, 0, 0, 1], 0).into(),
            control_ws_url: None,
            node_token: None,
            control_grpc_url: None,
            strategy_fetch_timeout: Duration::from_millis(200),
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            orphan_grace: Duration::from_secs(300),
            log_batch_lines: 50,
            log_flush_interval: Duration::from_millis(20),
            event_queue_capacity: 1024,
            log_dir: None,
        }
    }
}
