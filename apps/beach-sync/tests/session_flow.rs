use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use beach_sync::channel::{
    ChannelConfig, ChannelDeps, ChannelEvent, ConnectionState, SessionChannel,
    StaticTokenProvider, TungsteniteConnector,
};
use beach_sync::probe::{Endpoint, Jitter, ProbeConfig, ReqwestProbeBackend};
use beach_sync::protocol::{
    BackMessage, Delta, ElementPayload, ForwardBody, ForwardMessage, FrameCodec, JsonCodec,
    MessageMetadata, NewSession, ScriptFinishedStatus,
};
use beach_sync::session::{SessionDriver, SessionUpdate};
use beach_sync::tree::ScriptRunState;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Clone)]
struct FakeHost {
    /// Frames pushed in answer to the n-th rerun request on a connection.
    runs: Arc<Vec<Vec<ForwardMessage>>>,
    received: mpsc::UnboundedSender<BackMessage>,
    handshakes: mpsc::UnboundedSender<String>,
    connections: Arc<AtomicUsize>,
    drop_first_connection: bool,
}

struct HostHandle {
    endpoint: Endpoint,
    received: mpsc::UnboundedReceiver<BackMessage>,
    handshakes: mpsc::UnboundedReceiver<String>,
}

async fn spawn_host(runs: Vec<Vec<ForwardMessage>>, drop_first_connection: bool) -> HostHandle {
    let (received_tx, received) = mpsc::unbounded_channel();
    let (handshakes_tx, handshakes) = mpsc::unbounded_channel();
    let host = FakeHost {
        runs: Arc::new(runs),
        received: received_tx,
        handshakes: handshakes_tx,
        connections: Arc::new(AtomicUsize::new(0)),
        drop_first_connection,
    };

    let app = Router::new()
        .route("/_sync/health", get(|| async { "ok" }))
        .route(
            "/_sync/host-config",
            get(|| async { Json(json!({ "allowed_origins": ["*"], "max_upload_mb": 200 })) }),
        )
        .route("/_sync/stream", get(stream))
        .with_state(host);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    HostHandle {
        endpoint: Endpoint::parse(&format!("127.0.0.1:{port}")).unwrap(),
        received,
        handshakes,
    }
}

async fn stream(
    State(host): State<FakeHost>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let offered = headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let _ = host.handshakes.send(offered);
    ws.protocols(["beach-sync"])
        .on_upgrade(move |socket| serve_session(socket, host))
}

async fn serve_session(mut socket: WebSocket, host: FakeHost) {
    let connection = host.connections.fetch_add(1, Ordering::SeqCst);
    if host.drop_first_connection && connection == 0 {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let mut reruns = 0;
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Binary(frame) = message else {
            continue;
        };
        let Ok(back) = JsonCodec.decode_back(&frame) else {
            break;
        };
        let is_rerun = matches!(back, BackMessage::RerunScript { .. });
        let _ = host.received.send(back);
        if !is_rerun {
            continue;
        }
        let Some(frames) = host.runs.get(reruns) else {
            continue;
        };
        reruns += 1;
        for message in frames {
            let frame = JsonCodec.encode_forward(message).unwrap();
            if socket.send(Message::Binary(frame.to_vec())).await.is_err() {
                return;
            }
        }
    }
}

fn new_session(run_id: &str) -> ForwardMessage {
    ForwardMessage::new(ForwardBody::NewSession(NewSession {
        run_id: run_id.into(),
        main_script_hash: "main".into(),
        fragment_ids_this_run: Vec::new(),
        max_cached_message_age: 2,
    }))
}

fn finished() -> ForwardMessage {
    ForwardMessage::new(ForwardBody::ScriptFinished {
        status: ScriptFinishedStatus::FinishedSuccessfully,
    })
}

fn first_run() -> Vec<ForwardMessage> {
    vec![
        new_session("run-1"),
        ForwardMessage::new(ForwardBody::Delta(Delta::new_element(ElementPayload::new(
            "markdown",
            json!({ "text": "# Title" }),
        ))))
        .with_hash("h-title")
        .with_metadata(MessageMetadata::at_path([0]).cacheable(true)),
        ForwardMessage::new(ForwardBody::Delta(Delta::new_element(ElementPayload::widget(
            "slider",
            "size",
            json!({ "value": 3 }),
        ))))
        .with_metadata(MessageMetadata::at_path([1])),
        finished(),
    ]
}

fn second_run() -> Vec<ForwardMessage> {
    vec![
        new_session("run-2"),
        ForwardMessage::reference("h-title", MessageMetadata::at_path([0]).cacheable(true)),
        finished(),
    ]
}

fn channel_config(endpoints: Vec<Endpoint>) -> ChannelConfig {
    ChannelConfig {
        endpoints,
        probe: ProbeConfig {
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            retry_threshold: 6,
            jitter: Jitter::Fixed(1.0),
        },
        connect_timeout: Duration::from_secs(5),
        ..ChannelConfig::default()
    }
}

fn deps() -> ChannelDeps {
    ChannelDeps {
        probe_backend: Arc::new(ReqwestProbeBackend::new(Duration::from_secs(5)).unwrap()),
        connector: Arc::new(TungsteniteConnector),
        tokens: Arc::new(StaticTokenProvider::new(Some("token-1".into()))),
        codec: Arc::new(JsonCodec),
    }
}

struct Client {
    channel: SessionChannel,
    driver: SessionDriver,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
    seen_events: Vec<ChannelEvent>,
}

impl Client {
    fn start(endpoints: Vec<Endpoint>) -> Self {
        let (channel, events) = SessionChannel::spawn(channel_config(endpoints), deps());
        let (driver, updates) = SessionDriver::new(Arc::new(channel.clone()));
        channel.start();
        Self {
            channel,
            driver,
            events,
            updates,
            seen_events: Vec::new(),
        }
    }

    /// Feeds channel events to the driver until an update matches `done`.
    async fn pump_until(&mut self, done: impl Fn(&SessionUpdate) -> bool) -> Vec<SessionUpdate> {
        let mut seen = Vec::new();
        loop {
            let event = self.events.recv().await.expect("channel task ended");
            self.seen_events.push(event.clone());
            self.driver.handle_event(event).unwrap();
            let mut finished = false;
            while let Ok(update) = self.updates.try_recv() {
                finished |= done(&update);
                seen.push(update);
            }
            if finished {
                return seen;
            }
        }
    }
}

fn widgets_alive(update: &SessionUpdate) -> bool {
    matches!(update, SessionUpdate::WidgetsAlive { .. })
}

#[test_timeout::tokio_timeout_test(30)]
async fn full_run_then_rerun_from_cache() {
    let mut host = spawn_host(vec![first_run(), second_run()], false).await;
    let mut client = Client::start(vec![host.endpoint.clone()]);

    let updates = client.pump_until(widgets_alive).await;
    assert_eq!(host.handshakes.recv().await.unwrap(), "beach-sync, token-1");
    assert_eq!(
        host.received.recv().await.unwrap(),
        BackMessage::RerunScript {
            fragment_id: None,
            cached_message_hashes: Vec::new(),
        }
    );
    assert!(updates.contains(&SessionUpdate::Connection(ConnectionState::Connected)));
    assert!(updates.iter().any(|update| matches!(
        update,
        SessionUpdate::Capabilities(capabilities) if capabilities["max_upload_mb"] == 200
    )));
    assert_eq!(client.driver.run_state(), ScriptRunState::NotRunning);
    assert_eq!(client.channel.base_uri_parts(), Some(host.endpoint.clone()));
    assert_eq!(client.channel.cached_message_hashes(), vec!["h-title".to_string()]);

    let tree = client.driver.tree();
    assert_eq!(tree.children().len(), 2);
    assert_eq!(tree.get(&[1]).unwrap().as_leaf().unwrap().element.kind, "slider");
    assert!(tree.widget_ids().contains("size"));

    client.driver.request_rerun(None).unwrap();
    assert_eq!(
        host.received.recv().await.unwrap(),
        BackMessage::RerunScript {
            fragment_id: None,
            cached_message_hashes: vec!["h-title".to_string()],
        }
    );
    let updates = client.pump_until(widgets_alive).await;
    let alive = updates
        .iter()
        .find_map(|update| match update {
            SessionUpdate::WidgetsAlive { widget_ids, .. } => Some(widget_ids.clone()),
            _ => None,
        })
        .unwrap();
    assert!(alive.is_empty());

    let tree = client.driver.tree();
    assert_eq!(tree.children().len(), 1);
    let title = tree.get(&[0]).unwrap();
    assert_eq!(title.run_id(), "run-2");
    assert_eq!(title.as_leaf().unwrap().element.body["text"], "# Title");

    client.channel.disconnect();
    let mut state = client.channel.watch_state();
    state
        .wait_for(|state| *state == ConnectionState::DisconnectedForever)
        .await
        .unwrap();
    assert!(client.channel.send(BackMessage::StopScript).is_err());
}

#[test_timeout::tokio_timeout_test(30)]
async fn probing_skips_an_unreachable_candidate() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Endpoint::parse(&format!("127.0.0.1:{port}")).unwrap()
    };
    let host = spawn_host(vec![first_run()], false).await;
    let mut client = Client::start(vec![dead, host.endpoint.clone()]);

    client
        .pump_until(|update| *update == SessionUpdate::Connection(ConnectionState::Connected))
        .await;

    assert_eq!(client.channel.base_uri_parts(), Some(host.endpoint.clone()));
    assert!(client
        .seen_events
        .iter()
        .any(|event| matches!(event, ChannelEvent::Retry { .. })));
}

#[test_timeout::tokio_timeout_test(30)]
async fn reconnects_after_the_host_drops_the_stream() {
    let mut host = spawn_host(vec![first_run()], true).await;
    let mut client = Client::start(vec![host.endpoint.clone()]);

    client.pump_until(widgets_alive).await;

    assert_eq!(host.handshakes.recv().await.unwrap(), "beach-sync, token-1");
    assert_eq!(host.handshakes.recv().await.unwrap(), "beach-sync, token-1");
    let states: Vec<ConnectionState> = client
        .seen_events
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Pinging,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Pinging,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(client.driver.tree().children().len(), 2);
}
