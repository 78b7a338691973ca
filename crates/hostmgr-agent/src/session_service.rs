use std::collections::BTreeMap;

use hostmgr_proto::agent_v1::session_service_server::{SessionService, SessionServiceServer};
use hostmgr_proto::agent_v1::{
    GetSessionRequest, GetSessionResponse, GetStatsRequest, GetStatsResponse, KillSessionRequest,
    KillSessionResponse, ListSessionsRequest, ListSessionsResponse, SendInputRequest,
    SendInputResponse, Session, StartSessionRequest, StartSessionResponse, StopSessionRequest,
    StopSessionResponse,
};
use hostmgr_session::{ServerId, SessionId, SessionSnapshot, SessionStatus, SlotId};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::{
    controller::{SessionController, StartRequest},
    error::SessionError,
    events::status_to_proto,
    runtime::{PortMapping, PortProtocol},
    volumes::VolumeRequest,
};

#[derive(Debug, Clone)]
pub struct SessionApi {
    controller: SessionController,
}

impl SessionApi {
    pub fn new(controller: SessionController) -> Self {
        Self { controller }
    }
}

pub(crate) fn map_session(s: SessionSnapshot) -> Session {
    Session {
        session_id: s.session_id.0,
        slot_id: s.slot_id.0,
        server_id: s.server_id.0,
        status: status_to_proto(s.status) as i32,
        container_name: s.container_name,
        container_id: s.container_id.unwrap_or_default(),
        network_id: s.network_id.unwrap_or_default(),
        started_at_unix_ms: s.started_at.map(|t| t.timestamp_millis()).unwrap_or_default(),
        stopped_at_unix_ms: s.stopped_at.map(|t| t.timestamp_millis()).unwrap_or_default(),
        exit_code: s.exit_code.unwrap_or_default(),
        has_exit_code: s.exit_code.is_some(),
    }
}

fn port(raw: u32, what: &str) -> Result<u16, SessionError> {
    u16::try_from(raw)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| SessionError::Invalid(format!("invalid {what}: {raw}")))
}

fn map_start(req: StartSessionRequest) -> Result<StartRequest, SessionError> {
    let ports = req
        .ports
        .into_iter()
        .map(|p| {
            Ok(PortMapping {
                container_port: port(p.container_port, "container_port")?,
                host_port: port(p.host_port, "host_port")?,
                protocol: PortProtocol::parse(&p.protocol).ok_or_else(|| {
                    SessionError::Invalid(format!("invalid protocol: {}", p.protocol))
                })?,
            })
        })
        .collect::<Result<Vec<_>, SessionError>>()?;

    Ok(StartRequest {
        session_id: SessionId(req.session_id),
        slot_id: SlotId(req.slot_id),
        server_id: ServerId(req.server_id),
        image: req.image,
        command: req.command,
        env: req.env.into_iter().collect::<BTreeMap<_, _>>(),
        ports,
        volumes: req
            .volumes
            .into_iter()
            .map(|v| VolumeRequest {
                name: v.name,
                container_path: v.container_path,
                host_subpath: v.host_subpath,
            })
            .collect(),
        force: req.force,
    })
}

#[tonic::async_trait]
impl SessionService for SessionApi {
    async fn start(
        &self,
        request: Request<StartSessionRequest>,
    ) -> Result<Response<StartSessionResponse>, Status> {
        let req = map_start(request.into_inner())?;
        // Dropping this handler (client gone) cancels the start and rolls back.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let snapshot = self.controller.start(req, cancel).await?;
        Ok(Response::new(StartSessionResponse {
            session: Some(map_session(snapshot)),
        }))
    }

    async fn stop(
        &self,
        request: Request<StopSessionRequest>,
    ) -> Result<Response<StopSessionResponse>, Status> {
        let req = request.into_inner();
        let snapshot = self
            .controller
            .stop(SessionId(req.session_id), req.force)
            .await?;
        Ok(Response::new(StopSessionResponse {
            session: Some(map_session(snapshot)),
        }))
    }

    async fn kill(
        &self,
        request: Request<KillSessionRequest>,
    ) -> Result<Response<KillSessionResponse>, Status> {
        let req = request.into_inner();
        let snapshot = self.controller.kill(SessionId(req.session_id)).await?;
        Ok(Response::new(KillSessionResponse {
            session: Some(map_session(snapshot)),
        }))
    }

    async fn send_input(
        &self,
        request: Request<SendInputRequest>,
    ) -> Result<Response<SendInputResponse>, Status> {
        let req = request.into_inner();
        self.controller
            .send_input(SessionId(req.session_id), &req.data)
            .await?;
        Ok(Response::new(SendInputResponse {}))
    }

    async fn get(
        &self,
        request: Request<GetSessionRequest>,
    ) -> Result<Response<GetSessionResponse>, Status> {
        let req = request.into_inner();
        let snapshot = self.controller.get(SessionId(req.session_id))?;
        Ok(Response::new(GetSessionResponse {
            session: Some(map_session(snapshot)),
        }))
    }

    async fn list(
        &self,
        _request: Request<ListSessionsRequest>,
    ) -> Result<Response<ListSessionsResponse>, Status> {
        let sessions = self
            .controller
            .list()
            .into_iter()
            .map(map_session)
            .collect();
        Ok(Response::new(ListSessionsResponse { sessions }))
    }

    async fn stats(
        &self,
        _request: Request<GetStatsRequest>,
    ) -> Result<Response<GetStatsResponse>, Status> {
        let stats = self.controller.stats();
        let by_status = SessionStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), stats.count(*s) as u32))
            .collect();
        Ok(Response::new(GetStatsResponse {
            total: stats.total as u32,
            by_status,
        }))
    }
}

pub fn server(controller: SessionController) -> SessionServiceServer<SessionApi> {
    SessionServiceServer::new(SessionApi::new(controller))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hostmgr_proto::agent_v1::{self, PortBinding, VolumeMount};

    use super::*;
    use crate::{
        config::AgentConfig, error_payload, events::EventPublisher, fake_runtime::FakeRuntime,
        registry::SessionRegistry, strategies::NoStrategies,
    };

    fn api() -> (SessionApi, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig::for_tests(tmp.path().to_path_buf());
        let (events, _rx) = EventPublisher::channel(64);
        let controller = SessionController::new(
            Arc::new(config),
            FakeRuntime::new(),
            SessionRegistry::new(),
            events,
            Arc::new(NoStrategies),
        );
        (SessionApi::new(controller), tmp)
    }

    fn start_req(session: i64, slot: i64) -> StartSessionRequest {
        StartSessionRequest {
            session_id: session,
            slot_id: slot,
            server_id: 7,
            image: "ghcr.io/example/terraria:1.4".to_string(),
            command: vec!["-autocreate".to_string(), "2".to_string()],
            env: Default::default(),
            ports: vec![PortBinding {
                container_port: 7777,
                host_port: 31000,
                protocol: "udp".to_string(),
            }],
            volumes: vec![VolumeMount {
                name: "worlds".to_string(),
                container_path: "/root/.local/share/Terraria/Worlds".to_string(),
                host_subpath: "worlds".to_string(),
            }],
            force: false,
        }
    }

    #[tokio::test]
    async fn start_get_list_stats_stop() {
        let (api, _tmp) = api();
        let resp = api.start(Request::new(start_req(1, 100))).await.unwrap().into_inner();
        let session = resp.session.unwrap();
        assert_eq!(session.status, agent_v1::SessionStatus::Running as i32);
        assert!(session.started_at_unix_ms > 0);
        assert!(!session.container_id.is_empty());

        let got = api
            .get(Request::new(GetSessionRequest { session_id: 1 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(got.session.unwrap().slot_id, 100);

        let list = api.list(Request::new(ListSessionsRequest {})).await.unwrap().into_inner();
        assert_eq!(list.sessions.len(), 1);

        let stats = api.stats(Request::new(GetStatsRequest {})).await.unwrap().into_inner();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_status.get("running"), Some(&1));
        assert_eq!(stats.by_status.get("crashed"), Some(&0));

        let stopped = api
            .stop(Request::new(StopSessionRequest {
                session_id: 1,
                force: false,
            }))
            .await
            .unwrap()
            .into_inner();
        let s = stopped.session.unwrap();
        assert_eq!(s.status, agent_v1::SessionStatus::Stopped as i32);
        assert!(s.has_exit_code);
    }

    #[tokio::test]
    async fn slot_conflict_is_failed_precondition_and_not_retryable() {
        let (api, _tmp) = api();
        api.start(Request::new(start_req(1, 100))).await.unwrap();
        let status = api.start(Request::new(start_req(2, 100))).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        let payload = error_payload::decode(status.message()).unwrap();
        assert_eq!(payload.code, "slot_occupied");
        assert!(!payload.retryable);
    }

    #[tokio::test]
    async fn invalid_ports_are_rejected_before_any_work() {
        let (api, _tmp) = api();
        let mut req = start_req(1, 100);
        req.ports[0].host_port = 70_000;
        let status = api.start(Request::new(req)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let mut req = start_req(1, 100);
        req.ports[0].protocol = "sctp".to_string();
        let status = api.start(Request::new(req)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (api, _tmp) = api();
        let status = api
            .kill(Request::new(KillSessionRequest { session_id: 42 }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status = api
            .send_input(Request::new(SendInputRequest {
                session_id: 42,
                data: b"save".to_vec(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
