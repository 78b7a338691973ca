//! Outbound WebSocket tunnel to the control plane's message bus.
//!
//! Requests arrive as `req` frames carrying a gRPC method name and a protobuf
//! payload; they are dispatched to the same services the gRPC server exposes
//! and answered with `resp` frames. Agent events are drained from the
//! publisher queue and sent as `event` frames.

use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use hostmgr_proto::agent_v1::{
    GetSessionRequest, GetStatsRequest, HealthCheckRequest, KillSessionRequest,
    ListSessionsRequest, SendInputRequest, StartSessionRequest, StopSessionRequest,
    agent_health_service_server::AgentHealthService, session_service_server::SessionService,
};
use tonic::{Code, Request, Status};

use crate::{
    controller::SessionController, error_payload, events::AgentEvent, health_service::HealthApi,
    session_service::SessionApi,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const RESPONSE_QUEUE: usize = 256;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
enum AgentToControlFrame {
    #[serde(rename = "hello")]
    Hello {
        node: String,
        server_id: i64,
        environment: Option<String>,
        agent_version: String,
        active_sessions: Vec<i64>,
    },
    #[serde(rename = "resp")]
    Resp {
        id: String,
        ok: bool,
        payload_b64: Option<String>,
        status_code: Option<i32>,
        status_message: Option<String>,
        retryable: Option<bool>,
    },
    #[serde(rename = "event")]
    Event { payload_b64: String },
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type")]
enum ControlToAgentFrame {
    #[serde(rename = "req")]
    Req {
        id: String,
        method: String,
        payload_b64: String,
    },
    #[serde(other)]
    Unknown,
}

/// Whether the bus may redeliver a failed request.
fn status_retryable(status: &Status) -> bool {
    if let Some(payload) = error_payload::decode(status.message()) {
        return payload.retryable;
    }
    matches!(
        status.code(),
        Code::Unavailable
            | Code::DeadlineExceeded
            | Code::Cancelled
            | Code::Aborted
            | Code::ResourceExhausted
    )
}

fn resp_frame(id: String, result: Result<Vec<u8>, Status>) -> AgentToControlFrame {
    let b64 = base64::engine::general_purpose::STANDARD;
    match result {
        Ok(bytes) => AgentToControlFrame::Resp {
            id,
            ok: true,
            payload_b64: Some(b64.encode(bytes)),
            status_code: None,
            status_message: None,
            retryable: None,
        },
        Err(status) => AgentToControlFrame::Resp {
            id,
            ok: false,
            payload_b64: None,
            status_code: Some(status.code() as i32),
            status_message: Some(status.message().to_string()),
            retryable: Some(status_retryable(&status)),
        },
    }
}

fn event_frame(event: AgentEvent) -> AgentToControlFrame {
    let b64 = base64::engine::general_purpose::STANDARD;
    AgentToControlFrame::Event {
        payload_b64: b64.encode(event.into_proto().encode_to_vec()),
    }
}

#[derive(Debug, Clone)]
struct AgentRpc {
    health: HealthApi,
    session: SessionApi,
}

impl AgentRpc {
    fn new(controller: SessionController) -> Self {
        Self {
            health: HealthApi::new(controller.clone()),
            session: SessionApi::new(controller),
        }
    }

    fn decode_req<T: Message + Default>(&self, bytes: &[u8]) -> Result<T, Status> {
        T::decode(bytes).map_err(|_| Status::invalid_argument("invalid protobuf payload"))
    }

    async fn dispatch(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>, Status> {
        match method {
            "/hostmgr.agent.v1.AgentHealthService/Check" => {
                let req: HealthCheckRequest = self.decode_req(payload)?;
                let resp = self.health.check(Request::new(req)).await?.into_inner();
                Ok(resp.encode_to_vec())
            }

            "/hostmgr.agent.v1.SessionService/Start" => {
                let req: StartSessionRequest = self.decode_req(payload)?;
                let resp = self.session.start(Request::new(req)).await?.into_inner();
                Ok(resp.encode_to_vec())
            }
            "/hostmgr.agent.v1.SessionService/Stop" => {
                let req: StopSessionRequest = self.decode_req(payload)?;
                let resp = self.session.stop(Request::new(req)).await?.into_inner();
                Ok(resp.encode_to_vec())
            }
            "/hostmgr.agent.v1.SessionService/Kill" => {
                let req: KillSessionRequest = self.decode_req(payload)?;
                let resp = self.session.kill(Request::new(req)).await?.into_inner();
                Ok(resp.encode_to_vec())
            }
            "/hostmgr.agent.v1.SessionService/SendInput" => {
                let req: SendInputRequest = self.decode_req(payload)?;
                let resp = self.session.send_input(Request::new(req)).await?.into_inner();
                Ok(resp.encode_to_vec())
            }
            "/hostmgr.agent.v1.SessionService/Get" => {
                let req: GetSessionRequest = self.decode_req(payload)?;
                let resp = self.session.get(Request::new(req)).await?.into_inner();
                Ok(resp.encode_to_vec())
            }
            "/hostmgr.agent.v1.SessionService/List" => {
                let req: ListSessionsRequest = self.decode_req(payload)?;
                let resp = self.session.list(Request::new(req)).await?.into_inner();
                Ok(resp.encode_to_vec())
            }
            "/hostmgr.agent.v1.SessionService/Stats" => {
                let req: GetStatsRequest = self.decode_req(payload)?;
                let resp = self.session.stats(Request::new(req)).await?.into_inner();
                Ok(resp.encode_to_vec())
            }

            _ => Err(Status::unimplemented(format!("unknown method: {method}"))),
        }
    }
}

/// Run the tunnel until `shutdown` fires. Without a configured URL the
/// event queue is still drained so publishers never back up.
pub fn spawn(
    controller: SessionController,
    events: mpsc::Receiver<AgentEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let config = controller.config();
    let Some(url) = config.control_ws_url.clone() else {
        return tokio::spawn(drain(events, shutdown).instrument(info_span!("event_drain")));
    };

    let node = config.node_name.clone();
    let token = config.node_token.clone();
    let span = info_span!("control_tunnel", node = %node, url = %url);
    let tunnel = Tunnel {
        url,
        node,
        token,
        rpc: AgentRpc::new(controller.clone()),
        controller,
    };
    tokio::spawn(tunnel.run(events, shutdown).instrument(span))
}

async fn drain(mut events: mpsc::Receiver<AgentEvent>, shutdown: CancellationToken) {
    tracing::info!("no control tunnel configured; agent events are discarded");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            ev = events.recv() => match ev {
                Some(ev) => tracing::trace!(event = ?ev, "event discarded"),
                None => return,
            },
        }
    }
}

struct Tunnel {
    url: String,
    node: String,
    token: Option<String>,
    rpc: AgentRpc,
    controller: SessionController,
}

impl Tunnel {
    async fn run(self, mut events: mpsc::Receiver<AgentEvent>, shutdown: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let res = tokio::select! {
                _ = shutdown.cancelled() => return,
                res = self.run_once(&mut events) => res,
            };
            match res {
                Ok(()) => {
                    tracing::info!("control tunnel closed");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "control tunnel disconnected");
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn hello(&self) -> AgentToControlFrame {
        let config = self.controller.config();
        AgentToControlFrame::Hello {
            node: self.node.clone(),
            server_id: config.server_id.0,
            environment: config.environment.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            active_sessions: self
                .controller
                .registry()
                .active_session_ids()
                .into_iter()
                .map(|id| id.0)
                .collect(),
        }
    }

    async fn run_once(&self, events: &mut mpsc::Receiver<AgentEvent>) -> anyhow::Result<()> {
        let mut req = self.url.as_str().into_client_request()?;
        if let Some(tok) = &self.token {
            let value = format!("Bearer {tok}");
            req.headers_mut().insert("Authorization", value.parse()?);
        }

        let (ws, _) = tokio_tungstenite::connect_async(req).await?;
        let (mut sink, mut stream) = ws.split();
        tracing::info!("control tunnel connected");

        sink.send(WsMessage::Text(serde_json::to_string(&self.hello())?.into()))
            .await?;

        // In-flight requests are abandoned with the connection.
        let conn = CancellationToken::new();
        let _conn_guard = conn.clone().drop_guard();
        let (resp_tx, mut resp_rx) = mpsc::channel::<AgentToControlFrame>(RESPONSE_QUEUE);
        let b64 = base64::engine::general_purpose::STANDARD;

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(msg) = msg else { break };
                    match msg? {
                        WsMessage::Text(text) => {
                            let frame = serde_json::from_str::<ControlToAgentFrame>(&text)
                                .unwrap_or(ControlToAgentFrame::Unknown);
                            let ControlToAgentFrame::Req { id, method, payload_b64 } = frame else {
                                continue;
                            };
                            let Ok(payload) = b64.decode(payload_b64.as_bytes()) else {
                                let out = resp_frame(id, Err(Status::invalid_argument("invalid base64 payload")));
                                sink.send(WsMessage::Text(serde_json::to_string(&out)?.into())).await?;
                                continue;
                            };

                            let rpc = self.rpc.clone();
                            let cancel = conn.child_token();
                            let tx = resp_tx.clone();
                            let span = info_span!("tunnel_request", request_id = %id, method = %method);
                            tokio::spawn(
                                async move {
                                    tokio::select! {
                                        _ = cancel.cancelled() => {
                                            tracing::info!("request abandoned with tunnel connection");
                                        }
                                        res = rpc.dispatch(&method, &payload) => {
                                            let _ = tx.send(resp_frame(id, res)).await;
                                        }
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        WsMessage::Close(_) => break,
                        _ => {}
                    }
                }
                Some(out) = resp_rx.recv() => {
                    sink.send(WsMessage::Text(serde_json::to_string(&out)?.into())).await?;
                }
                Some(ev) = events.recv() => {
                    let out = event_frame(ev);
                    sink.send(WsMessage::Text(serde_json::to_string(&out)?.into())).await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hostmgr_proto::agent_v1::{self, GetStatsResponse, HealthCheckResponse};
    use hostmgr_session::{SessionId, SessionStatus, SlotId};
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        config::AgentConfig, events::EventPublisher, fake_runtime::FakeRuntime,
        registry::SessionRegistry, strategies::NoStrategies,
    };

    struct Harness {
        controller: SessionController,
        events: EventPublisher,
        rx: Option<mpsc::Receiver<AgentEvent>>,
        fake: Arc<FakeRuntime>,
        _tmp: tempfile::TempDir,
    }

    fn harness(url: Option<String>) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::for_tests(tmp.path().to_path_buf());
        config.control_ws_url = url;
        let (events, rx) = EventPublisher::channel(64);
        let fake = FakeRuntime::new();
        let controller = SessionController::new(
            Arc::new(config),
            fake.clone(),
            SessionRegistry::new(),
            events.clone(),
            Arc::new(NoStrategies),
        );
        Harness {
            controller,
            events,
            rx: Some(rx),
            fake,
            _tmp: tmp,
        }
    }

    fn b64() -> base64::engine::GeneralPurpose {
        base64::engine::general_purpose::STANDARD
    }

    async fn next_json<S>(stream: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("frame timeout")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn req_text(id: &str, method: &str, payload: Vec<u8>) -> WsMessage {
        let frame = serde_json::json!({
            "type": "req",
            "id": id,
            "method": method,
            "payload_b64": b64().encode(payload),
        });
        WsMessage::Text(frame.to_string().into())
    }

    #[test]
    fn retryable_prefers_error_payload() {
        let slot = crate::error::SessionError::SlotOccupied {
            slot: SlotId(1),
            session: SessionId(2),
        };
        assert!(!status_retryable(&slot.to_status()));
        assert!(status_retryable(&crate::error::SessionError::Timeout("start").to_status()));
        assert!(status_retryable(&Status::unavailable("down")));
        assert!(!status_retryable(&Status::invalid_argument("bad")));
    }

    #[test]
    fn frames_are_tagged() {
        let v = serde_json::to_value(resp_frame("r1".to_string(), Ok(vec![1, 2]))).unwrap();
        assert_eq!(v["type"], "resp");
        assert_eq!(v["ok"], true);
        assert_eq!(v["payload_b64"], "AQI=");

        let frame: ControlToAgentFrame =
            serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ControlToAgentFrame::Unknown));
    }

    #[tokio::test]
    async fn dispatch_routes_by_method() {
        let h = harness(None);
        let rpc = AgentRpc::new(h.controller.clone());

        let bytes = rpc
            .dispatch(
                "/hostmgr.agent.v1.AgentHealthService/Check",
                &HealthCheckRequest {}.encode_to_vec(),
            )
            .await
            .unwrap();
        let health = HealthCheckResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(health.server_id, 7);

        let err = rpc
            .dispatch("/hostmgr.agent.v1.SessionService/Nope", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let err = rpc
            .dispatch("/hostmgr.agent.v1.SessionService/Get", &[0xff, 0xff])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn drain_consumes_events_without_tunnel() {
        let mut h = harness(None);
        let shutdown = CancellationToken::new();
        let task = spawn(h.controller.clone(), h.rx.take().unwrap(), shutdown.clone());
        for _ in 0..4 {
            for _ in 0..60 {
                h.events.agent_line(SessionId(1), "line");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(h.events.dropped(), 0);
    }

    #[tokio::test]
    async fn tunnel_serves_requests_and_forwards_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let mut h = harness(Some(url));
        let shutdown = CancellationToken::new();
        let task = spawn(h.controller.clone(), h.rx.take().unwrap(), shutdown.clone());

        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let (mut sink, mut stream) = ws.split();

        let hello = next_json(&mut stream).await;
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["server_id"], 7);
        assert_eq!(hello["active_sessions"], serde_json::json!([]));

        sink.send(req_text(
            "r1",
            "/hostmgr.agent.v1.SessionService/Stats",
            GetStatsRequest {}.encode_to_vec(),
        ))
        .await
        .unwrap();
        let resp = next_json(&mut stream).await;
        assert_eq!(resp["type"], "resp");
        assert_eq!(resp["id"], "r1");
        assert_eq!(resp["ok"], true);
        let payload = b64().decode(resp["payload_b64"].as_str().unwrap()).unwrap();
        assert_eq!(GetStatsResponse::decode(payload.as_slice()).unwrap().total, 0);

        sink.send(req_text(
            "r2",
            "/hostmgr.agent.v1.SessionService/Stop",
            StopSessionRequest {
                session_id: 99,
                force: false,
            }
            .encode_to_vec(),
        ))
        .await
        .unwrap();
        let resp = next_json(&mut stream).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["status_code"], Code::NotFound as i32);
        assert_eq!(resp["retryable"], false);

        h.events
            .status(SessionId(5), SlotId(50), SessionStatus::Running, None, None);
        let ev = next_json(&mut stream).await;
        assert_eq!(ev["type"], "event");
        let payload = b64().decode(ev["payload_b64"].as_str().unwrap()).unwrap();
        let ev = agent_v1::AgentEvent::decode(payload.as_slice()).unwrap();
        assert!(matches!(
            ev.event,
            Some(agent_v1::agent_event::Event::Status(ref s)) if s.session_id == 5
        ));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_cancels_in_flight_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let mut h = harness(Some(url));
        h.fake.set_create_delay(Some(Duration::from_secs(3)));
        let shutdown = CancellationToken::new();
        let task = spawn(h.controller.clone(), h.rx.take().unwrap(), shutdown.clone());

        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let (mut sink, mut stream) = ws.split();
        let _hello = next_json(&mut stream).await;

        let start = StartSessionRequest {
            session_id: 1,
            slot_id: 100,
            server_id: 7,
            image: "ghcr.io/example/game:1".to_string(),
            ..Default::default()
        };
        sink.send(req_text(
            "s1",
            "/hostmgr.agent.v1.SessionService/Start",
            start.encode_to_vec(),
        ))
        .await
        .unwrap();

        // Wait until the start is registered, then drop the connection.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !h.controller.registry().contains(SessionId(1)) {
            assert!(tokio::time::Instant::now() < deadline, "start never registered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(sink);
        drop(stream);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.controller.registry().contains(SessionId(1)) {
            assert!(tokio::time::Instant::now() < deadline, "start was not rolled back");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.fake.container_names().is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }
}
