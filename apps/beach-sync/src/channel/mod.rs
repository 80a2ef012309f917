//! Persistent duplex channel to the session host.
//!
//! A [`SessionChannel`] is a handle to one actor task that owns the
//! connection state, the outbound sink and the message cache. The actor
//! probes for a live endpoint, opens the stream, feeds every inbound frame
//! through the cache and reconnects with backoff when the stream drops.
//! Cache aging happens here too: a successful `ScriptFinished` advances the
//! run counter before the next frame is looked at.
//!
//! ```text
//! Initial ─start─▶ Pinging ─probe ok─▶ Connecting ─open─▶ Connected
//!                    ▲                     │  ▲                │
//!                    └──── open failed ────┘  └── drop (pinned) ┤
//!                    └──────────────── drop ─────────────────────┘
//! any ─disconnect / budget exhausted / fatal frame─▶ DisconnectedForever
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::MessageCache;
use crate::probe::{
    Backoff, ClientErrorReport, Endpoint, ProbeBackend, ProbeConfig, ProbeEvent, Prober,
};
use crate::protocol::{BackMessage, ForwardBody, ForwardMessage, FrameCodec};

mod connector;
pub mod mock;
mod state;

pub use connector::{
    PLACEHOLDER_AUTH_TOKEN, SUBPROTOCOL_MARKER, StaticTokenProvider, StreamConnection,
    StreamConnector, TokenProvider, TungsteniteConnector, subprotocols,
};
pub use state::{ConnectionState, StateMachine, StateTransaction};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not connected (state: {0})")]
    NotConnected(ConnectionState),
    #[error("invalid connection state transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("failed to open stream: {0}")]
    Connect(String),
    #[error("opening the stream timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("channel task has stopped")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoints: Vec<Endpoint>,
    pub probe: ProbeConfig,
    pub connect_timeout: Duration,
    /// Consecutive reconnects allowed without reaching `Connected`; `None`
    /// retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Probe all candidates again after a drop instead of reusing the last
    /// endpoint.
    pub reprobe_on_drop: bool,
    pub resume_session_id: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            probe: ProbeConfig::default(),
            connect_timeout: Duration::from_secs(15),
            max_reconnect_attempts: None,
            reprobe_on_drop: true,
            resume_session_id: None,
        }
    }
}

/// Collaborators the channel talks to.
#[derive(Clone)]
pub struct ChannelDeps {
    pub probe_backend: Arc<dyn ProbeBackend>,
    pub connector: Arc<dyn StreamConnector>,
    pub tokens: Arc<dyn TokenProvider>,
    pub codec: Arc<dyn FrameCodec>,
}

/// Everything the channel reports to its single listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ConnectionState),
    Retry {
        attempt: u32,
        message: String,
        delay: Duration,
    },
    /// Capability payload of the endpoint that was just connected.
    Capabilities(Value),
    Message(ForwardMessage),
    ClientError(ClientErrorReport),
}

#[derive(Debug)]
pub enum ChannelCommand {
    Start,
    Send(BackMessage),
    Disconnect,
}

#[derive(Clone)]
pub struct SessionChannel {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    state: watch::Receiver<ConnectionState>,
    cache: Arc<Mutex<MessageCache>>,
    endpoint: Arc<Mutex<Option<Endpoint>>>,
}

impl SessionChannel {
    /// Spawns the channel task in `Initial`. Nothing happens until
    /// [`SessionChannel::start`].
    pub fn spawn(
        config: ChannelConfig,
        deps: ChannelDeps,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initial);
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();

        let cache = Arc::new(Mutex::new(MessageCache::new(deps.codec.clone())));
        let endpoint = Arc::new(Mutex::new(None));
        let prober = Prober::new(deps.probe_backend.clone(), config.probe.clone()).with_events(probe_tx);

        let task = ChannelTask {
            reconnect: config.probe.backoff(),
            config,
            deps,
            prober,
            probe_events: probe_rx,
            commands: commands_rx,
            events: events_tx.clone(),
            machine: StateMachine::new(state_tx, events_tx),
            cache: cache.clone(),
            aging: RunAging::default(),
            endpoint: endpoint.clone(),
        };
        tokio::spawn(task.run());

        (
            Self {
                commands: commands_tx,
                state: state_rx,
                cache,
                endpoint,
            },
            events_rx,
        )
    }

    /// Begins the establish sequence. A no-op unless the channel is `Initial`.
    pub fn start(&self) {
        let _ = self.commands.send(ChannelCommand::Start);
    }

    /// Queues a message for the host. Rejected unless `Connected`.
    ///
    /// `Ok` means the message was accepted while connected, not that it was
    /// written. If the stream drops before the task picks it up the message
    /// is discarded; nothing is buffered for a later connection.
    pub fn send(&self, message: BackMessage) -> Result<(), ChannelError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            warn!(
                target = "beach_sync::channel",
                state = %state,
                kind = message.kind(),
                "rejecting send while not connected"
            );
            return Err(ChannelError::NotConnected(state));
        }
        self.commands
            .send(ChannelCommand::Send(message))
            .map_err(|_| ChannelError::Closed)
    }

    /// Moves to `DisconnectedForever`. Pending probes and timers are dropped.
    pub fn disconnect(&self) {
        let _ = self.commands.send(ChannelCommand::Disconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn increment_message_cache_run_count(&self, max_age: u64, fragment_ids_this_run: &[String]) {
        self.cache
            .lock()
            .increment_run_count(max_age, fragment_ids_this_run);
    }

    pub fn cached_message_hashes(&self) -> Vec<String> {
        self.cache.lock().cached_message_hashes()
    }

    /// Endpoint of the open stream; `None` unless `Connected`.
    pub fn base_uri_parts(&self) -> Option<Endpoint> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.endpoint.lock().clone()
    }
}

enum Step {
    Probe {
        delay: Option<Duration>,
    },
    Connect {
        endpoint: Endpoint,
        capabilities: Value,
        delay: Option<Duration>,
    },
    Stop,
}

enum Exit {
    Dropped,
    Stop,
}

struct ChannelTask {
    config: ChannelConfig,
    deps: ChannelDeps,
    prober: Prober,
    probe_events: mpsc::UnboundedReceiver<ProbeEvent>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    machine: StateMachine,
    cache: Arc<Mutex<MessageCache>>,
    aging: RunAging,
    endpoint: Arc<Mutex<Option<Endpoint>>>,
    reconnect: Backoff,
}

/// Aging parameters announced by the latest `NewSession`.
struct RunAging {
    max_age: u64,
    fragment_ids: Vec<String>,
}

impl Default for RunAging {
    fn default() -> Self {
        Self {
            max_age: crate::cache::DEFAULT_MAX_CACHED_MESSAGE_AGE,
            fragment_ids: Vec::new(),
        }
    }
}

impl ChannelTask {
    async fn run(mut self) {
        if self.wait_for_start().await {
            let mut step = Step::Probe { delay: None };
            loop {
                step = match step {
                    Step::Probe { delay } => self.probe(delay).await,
                    Step::Connect {
                        endpoint,
                        capabilities,
                        delay,
                    } => self.connect(endpoint, capabilities, delay).await,
                    Step::Stop => break,
                };
            }
        }
        self.finish();
    }

    async fn wait_for_start(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(ChannelCommand::Start) => return true,
                Some(ChannelCommand::Send(message)) => reject_send(&message, self.machine.state()),
                Some(ChannelCommand::Disconnect) | None => return false,
            }
        }
    }

    /// Handles a command that arrives while no stream is open. Returns true
    /// when the channel must stop.
    fn idle_command(&self, command: Option<ChannelCommand>) -> bool {
        match command {
            Some(ChannelCommand::Start) => {
                debug!(target = "beach_sync::channel", "start ignored; already started");
                false
            }
            Some(ChannelCommand::Send(message)) => {
                reject_send(&message, self.machine.state());
                false
            }
            Some(ChannelCommand::Disconnect) | None => true,
        }
    }

    /// Sleeps for `delay` unless a disconnect arrives first.
    async fn pause(&mut self, delay: Option<Duration>) -> bool {
        let Some(delay) = delay else {
            return true;
        };
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => {
                    if self.idle_command(command) {
                        return false;
                    }
                }
            }
        }
    }

    async fn probe(&mut self, delay: Option<Duration>) -> Step {
        if self.enter(ConnectionState::Pinging).is_err() || !self.pause(delay).await {
            return Step::Stop;
        }

        let mut handle = self.prober.probe(self.config.endpoints.clone());
        loop {
            tokio::select! {
                outcome = &mut handle => {
                    self.drain_probe_events();
                    return match outcome {
                        Ok(outcome) => Step::Connect {
                            endpoint: outcome.endpoint,
                            capabilities: outcome.capabilities,
                            delay: None,
                        },
                        Err(err) => {
                            error!(target = "beach_sync::channel", error = %err, "probe failed");
                            self.emit(ChannelEvent::ClientError(ClientErrorReport::new(
                                "probe_failed",
                                err.to_string(),
                                "",
                            )));
                            Step::Stop
                        }
                    };
                }
                Some(event) = self.probe_events.recv() => self.forward_probe_event(event),
                command = self.commands.recv() => {
                    if self.idle_command(command) {
                        handle.cancel();
                        return Step::Stop;
                    }
                }
            }
        }
    }

    async fn connect(
        &mut self,
        endpoint: Endpoint,
        capabilities: Value,
        delay: Option<Duration>,
    ) -> Step {
        if self.enter(ConnectionState::Connecting).is_err() || !self.pause(delay).await {
            return Step::Stop;
        }

        let url = match endpoint.stream_url() {
            Ok(url) => url,
            Err(err) => {
                error!(target = "beach_sync::channel", endpoint = %endpoint, error = %err, "invalid stream url");
                self.emit(ChannelEvent::ClientError(ClientErrorReport::new(
                    "invalid_endpoint",
                    err.to_string(),
                    endpoint.path_prefix(),
                )));
                return Step::Stop;
            }
        };
        let token = self.deps.tokens.bearer_token().await;
        let protocols = subprotocols(token, self.config.resume_session_id.as_deref());
        let connector = self.deps.connector.clone();
        let timeout = self.config.connect_timeout;
        let attempt = tokio::time::timeout(timeout, connector.connect(&url, &protocols));
        tokio::pin!(attempt);

        let result = loop {
            tokio::select! {
                result = &mut attempt => {
                    break result.unwrap_or(Err(ChannelError::ConnectTimeout(timeout)));
                }
                command = self.commands.recv() => {
                    if self.idle_command(command) {
                        return Step::Stop;
                    }
                }
            }
        };

        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                warn!(target = "beach_sync::channel", url = %url, error = %err, "failed to open stream");
                return match self.reconnect_delay(&err.to_string()) {
                    Some(delay) => Step::Probe { delay: Some(delay) },
                    None => Step::Stop,
                };
            }
        };

        *self.endpoint.lock() = Some(endpoint.clone());
        if self.enter(ConnectionState::Connected).is_err() {
            return Step::Stop;
        }
        self.reconnect.reset();
        info!(target = "beach_sync::channel", url = %url, "stream connected");
        self.emit(ChannelEvent::Capabilities(capabilities.clone()));

        let exit = self.serve(connection, &url).await;
        *self.endpoint.lock() = None;
        match exit {
            Exit::Stop => Step::Stop,
            Exit::Dropped => match self.reconnect_delay("stream dropped") {
                None => Step::Stop,
                Some(delay) if self.config.reprobe_on_drop => Step::Probe { delay: Some(delay) },
                Some(delay) => Step::Connect {
                    endpoint,
                    capabilities,
                    delay: Some(delay),
                },
            },
        }
    }

    async fn serve(&mut self, connection: StreamConnection, url: &Url) -> Exit {
        let StreamConnection {
            outbound,
            mut inbound,
        } = connection;
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(report) = self.deliver(frame, url.path()) {
                            self.emit(ChannelEvent::ClientError(report));
                            return Exit::Stop;
                        }
                    }
                    None => {
                        info!(target = "beach_sync::channel", url = %url, "stream dropped");
                        return Exit::Dropped;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Send(message)) => {
                        match self.deps.codec.encode_back(&message) {
                            Ok(frame) => {
                                debug!(target = "beach_sync::channel", kind = message.kind(), bytes = frame.len(), "sending message");
                                if outbound.send(frame).is_err() {
                                    return Exit::Dropped;
                                }
                            }
                            Err(err) => {
                                error!(target = "beach_sync::channel", kind = message.kind(), error = %err, "failed to encode message");
                            }
                        }
                    }
                    Some(ChannelCommand::Start) => {}
                    Some(ChannelCommand::Disconnect) | None => return Exit::Stop,
                },
            }
        }
    }

    /// Decodes one frame and resolves it through the cache. Any error is a
    /// protocol violation.
    ///
    /// Run boundaries are applied to the cache in stream order, so an entry
    /// is always stamped with the run it arrived in.
    fn deliver(&mut self, frame: Bytes, path: &str) -> Result<(), ClientErrorReport> {
        let message = self.deps.codec.decode_forward(&frame).map_err(|err| {
            error!(target = "beach_sync::channel", error = %err, "undecodable frame");
            ClientErrorReport::new("decode_error", err.to_string(), path)
        })?;
        let mut cache = self.cache.lock();
        let resolved = cache.process_message_payload(message, &frame).map_err(|err| {
            error!(target = "beach_sync::channel", error = %err, code = err.code(), "message cache error");
            ClientErrorReport::new(err.code(), err.to_string(), path)
        })?;
        match &resolved.body {
            ForwardBody::NewSession(session) => {
                self.aging = RunAging {
                    max_age: session.max_cached_message_age,
                    fragment_ids: session.fragment_ids_this_run.clone(),
                };
            }
            ForwardBody::ScriptFinished { status } if status.is_success() => {
                cache.increment_run_count(self.aging.max_age, &self.aging.fragment_ids);
            }
            _ => {}
        }
        drop(cache);
        self.emit(ChannelEvent::Message(resolved));
        Ok(())
    }

    /// Next reconnect delay, or `None` once the budget is exhausted.
    fn reconnect_delay(&mut self, reason: &str) -> Option<Duration> {
        let attempt = self.reconnect.attempts() + 1;
        if let Some(max) = self.config.max_reconnect_attempts {
            if attempt > max {
                warn!(target = "beach_sync::channel", attempts = max, reason, "reconnect budget exhausted");
                self.emit(ChannelEvent::ClientError(ClientErrorReport::new(
                    "reconnect_exhausted",
                    format!("gave up after {max} reconnect attempts: {reason}"),
                    "",
                )));
                return None;
            }
        }
        let delay = self.reconnect.next_delay();
        info!(
            target = "beach_sync::channel",
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "scheduling reconnect"
        );
        self.emit(ChannelEvent::Retry {
            attempt,
            message: reason.to_string(),
            delay,
        });
        Some(delay)
    }

    fn enter(&mut self, next: ConnectionState) -> Result<(), ChannelError> {
        self.machine.transition(next).map_err(|err| {
            error!(target = "beach_sync::channel", error = %err, "rejected state transition");
            err
        })
    }

    fn forward_probe_event(&self, event: ProbeEvent) {
        match event {
            ProbeEvent::Retry {
                attempt,
                message,
                delay,
                ..
            } => self.emit(ChannelEvent::Retry {
                attempt,
                message,
                delay,
            }),
            ProbeEvent::ThresholdCrossed(report) => self.emit(ChannelEvent::ClientError(report)),
        }
    }

    fn drain_probe_events(&mut self) {
        while let Ok(event) = self.probe_events.try_recv() {
            self.forward_probe_event(event);
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn finish(&mut self) {
        *self.endpoint.lock() = None;
        if !self.machine.state().is_terminal() {
            let _ = self.machine.transition(ConnectionState::DisconnectedForever);
        }
        info!(target = "beach_sync::channel", "channel disconnected for good");
    }
}

fn reject_send(message: &BackMessage, state: ConnectionState) {
    warn!(
        target = "beach_sync::channel",
        state = %state,
        kind = message.kind(),
        "dropping message while not connected"
    );
}
