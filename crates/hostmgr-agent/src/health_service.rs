use std::path::Path;

use hostmgr_proto::agent_v1::agent_health_service_server::{
    AgentHealthService, AgentHealthServiceServer,
};
use hostmgr_proto::agent_v1::{HealthCheckRequest, HealthCheckResponse};
use tonic::{Request, Response, Status};

use crate::controller::SessionController;

#[derive(Debug, Clone)]
pub struct HealthApi {
    controller: SessionController,
}

impl HealthApi {
    pub fn new(controller: SessionController) -> Self {
        Self { controller }
    }
}

fn probe_writable(data_root: &Path) -> bool {
    std::fs::create_dir_all(data_root)
        .and_then(|_| {
            let probe = data_root.join(".hostmgr_write_probe");
            std::fs::write(&probe, b"ok\n").and_then(|_| std::fs::remove_file(probe))
        })
        .is_ok()
}

#[cfg(unix)]
fn free_bytes(p: &Path) -> u64 {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let c = match CString::new(p.as_os_str().as_bytes()) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return 0;
    }
    (s.f_bsize as u64).saturating_mul(s.f_bavail as u64)
}

#[cfg(not(unix))]
fn free_bytes(_p: &Path) -> u64 {
    0
}

#[tonic::async_trait]
impl AgentHealthService for HealthApi {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let config = self.controller.config();
        let data_root = config.data_root.clone();
        let writable = probe_writable(&data_root);

        let (runtime_reachable, runtime_error) = match self.controller.runtime().ping().await {
            Ok(()) => (true, String::new()),
            Err(e) => {
                tracing::warn!(error = %e, "container runtime ping failed");
                (false, e.to_string())
            }
        };

        let status = if writable && runtime_reachable {
            "SERVING"
        } else {
            "DEGRADED"
        };

        let reply = HealthCheckResponse {
            status: status.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            server_id: config.server_id.0,
            environment: config.environment.clone().unwrap_or_default(),
            data_root: data_root.display().to_string(),
            data_root_writable: writable,
            data_root_free_bytes: free_bytes(&data_root),
            runtime_reachable,
            runtime_error,
            active_sessions: self.controller.registry().active_session_ids().len() as u32,
        };
        Ok(Response::new(reply))
    }
}

pub fn server(controller: SessionController) -> AgentHealthServiceServer<HealthApi> {
    AgentHealthServiceServer::new(HealthApi::new(controller))
}
