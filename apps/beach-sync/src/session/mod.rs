//! Run lifecycle on top of a [`SessionChannel`].
//!
//! The driver consumes channel events one at a time, tracks the script run
//! state, applies deltas to the [`SessionTree`] and prunes stale nodes when a
//! run completes. Cache aging is not done here; the channel applies it as it
//! delivers the finish message. Every new tree is published whole through a `watch`
//! channel, so readers only ever see complete snapshots.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ChannelEvent, ConnectionState, SessionChannel};
use crate::probe::ClientErrorReport;
use crate::protocol::{BackMessage, ForwardBody, ForwardMessage, NewSession, ScriptFinishedStatus};
use crate::tree::{NodeId, RootKey, ScriptRunState, SessionTree, TreeError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unrecognized message from host")]
    UnrecognizedMessage,
    #[error("reference to {0} reached the session unresolved")]
    UnresolvedReference(String),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Outbound side of the channel as seen by the driver.
pub trait SessionLink: Send + Sync {
    fn send(&self, message: BackMessage) -> Result<(), ChannelError>;
    fn cached_message_hashes(&self) -> Vec<String>;
}

impl SessionLink for SessionChannel {
    fn send(&self, message: BackMessage) -> Result<(), ChannelError> {
        SessionChannel::send(self, message)
    }

    fn cached_message_hashes(&self) -> Vec<String> {
        SessionChannel::cached_message_hashes(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Connection(ConnectionState),
    Capabilities(Value),
    RunStateChanged(ScriptRunState),
    /// Nodes and widgets that survived a stale-node cleanup. Per-node state
    /// keyed by anything else can be released.
    WidgetsAlive {
        node_ids: BTreeSet<NodeId>,
        widget_ids: BTreeSet<String>,
    },
    ClientError(ClientErrorReport),
}

pub struct SessionDriver {
    link: Arc<dyn SessionLink>,
    run_state: ScriptRunState,
    run_id: String,
    fragment_ids_this_run: Vec<String>,
    tree: watch::Sender<Arc<SessionTree>>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl SessionDriver {
    pub fn new(link: Arc<dyn SessionLink>) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (tree, _) = watch::channel(Arc::new(SessionTree::new()));
        (
            Self {
                link,
                run_state: ScriptRunState::NotRunning,
                run_id: String::new(),
                fragment_ids_this_run: Vec::new(),
                tree,
                updates,
            },
            updates_rx,
        )
    }

    pub fn subscribe_tree(&self) -> watch::Receiver<Arc<SessionTree>> {
        self.tree.subscribe()
    }

    pub fn tree(&self) -> Arc<SessionTree> {
        self.tree.borrow().clone()
    }

    pub fn run_state(&self) -> ScriptRunState {
        self.run_state
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Nodes that should render as stale right now.
    pub fn stale_node_ids(&self) -> Vec<NodeId> {
        self.tree().stale_node_ids(
            self.run_state,
            &self.run_id,
            &self.fragment_ids_this_run,
        )
    }

    /// Asks the host to rerun the script, or one fragment of it. Everything
    /// currently rendered turns stale until new content arrives.
    pub fn request_rerun(&mut self, fragment_id: Option<String>) -> Result<(), SessionError> {
        let cached_message_hashes = self.link.cached_message_hashes();
        debug!(
            target = "beach_sync::session",
            fragment_id = fragment_id.as_deref().unwrap_or(""),
            cached = cached_message_hashes.len(),
            "requesting rerun"
        );
        self.link.send(BackMessage::RerunScript {
            fragment_id,
            cached_message_hashes,
        })?;
        self.set_run_state(ScriptRunState::RerunRequested);
        Ok(())
    }

    pub fn request_stop(&mut self) -> Result<(), SessionError> {
        self.link.send(BackMessage::StopScript)?;
        self.set_run_state(ScriptRunState::StopRequested);
        Ok(())
    }

    /// Processes one channel event. An `Err` means the host and this client
    /// have diverged; the caller should stop the session.
    pub fn handle_event(&mut self, event: ChannelEvent) -> Result<(), SessionError> {
        match event {
            ChannelEvent::StateChanged(state) => {
                self.emit(SessionUpdate::Connection(state));
                if state == ConnectionState::Connected {
                    if let Err(err) = self.request_rerun(None) {
                        warn!(target = "beach_sync::session", error = %err, "initial rerun request failed");
                    }
                }
                Ok(())
            }
            ChannelEvent::Retry { .. } => Ok(()),
            ChannelEvent::Capabilities(capabilities) => {
                self.emit(SessionUpdate::Capabilities(capabilities));
                Ok(())
            }
            ChannelEvent::Message(message) => self.handle_message(message),
            ChannelEvent::ClientError(report) => {
                self.emit(SessionUpdate::ClientError(report));
                Ok(())
            }
        }
    }

    pub fn handle_message(&mut self, message: ForwardMessage) -> Result<(), SessionError> {
        let ForwardMessage { metadata, body, .. } = message;
        match body {
            ForwardBody::NewSession(session) => {
                self.begin_run(session);
                Ok(())
            }
            ForwardBody::SessionStatusChanged { script_is_running } => {
                if script_is_running {
                    self.set_run_state(ScriptRunState::Running);
                } else if matches!(
                    self.run_state,
                    ScriptRunState::Running | ScriptRunState::StopRequested
                ) {
                    self.set_run_state(ScriptRunState::NotRunning);
                }
                Ok(())
            }
            ForwardBody::Delta(delta) => {
                let metadata = metadata.unwrap_or_default();
                let next = self.tree().apply_delta(&self.run_id, &delta, &metadata)?;
                self.publish(next);
                Ok(())
            }
            ForwardBody::ScriptFinished { status } => {
                self.finish_run(status);
                Ok(())
            }
            ForwardBody::Reference { ref_hash } => Err(SessionError::UnresolvedReference(ref_hash)),
            ForwardBody::Unknown => Err(SessionError::UnrecognizedMessage),
        }
    }

    fn begin_run(&mut self, session: NewSession) {
        info!(
            target = "beach_sync::session",
            run_id = %session.run_id,
            main_script_hash = %session.main_script_hash,
            fragments = session.fragment_ids_this_run.len(),
            "script run started"
        );
        let root = RootKey::new(session.main_script_hash);
        let current = self.tree();
        if current.active_root() != &root {
            self.publish(current.set_active_root(root));
        }
        self.run_id = session.run_id;
        self.fragment_ids_this_run = session.fragment_ids_this_run;
        self.set_run_state(ScriptRunState::Running);
    }

    fn finish_run(&mut self, status: ScriptFinishedStatus) {
        info!(
            target = "beach_sync::session",
            run_id = %self.run_id,
            status = ?status,
            "script run finished"
        );
        match status {
            ScriptFinishedStatus::FinishedEarlyForRerun => {}
            ScriptFinishedStatus::FinishedWithCompileError => {
                self.set_run_state(ScriptRunState::CompilationError);
            }
            ScriptFinishedStatus::FinishedSuccessfully
            | ScriptFinishedStatus::FinishedFragmentRunSuccessfully => {
                let mut cleaned = self
                    .tree()
                    .clear_stale_nodes(&self.run_id, &self.fragment_ids_this_run);
                if self.fragment_ids_this_run.is_empty() {
                    cleaned = cleaned.clear_inactive_roots(&self.run_id);
                }
                let node_ids = cleaned.live_node_ids();
                let widget_ids = cleaned.widget_ids();
                self.publish(cleaned);
                self.emit(SessionUpdate::WidgetsAlive {
                    node_ids,
                    widget_ids,
                });
                self.set_run_state(ScriptRunState::NotRunning);
            }
        }
    }

    fn set_run_state(&mut self, next: ScriptRunState) {
        if self.run_state == next {
            return;
        }
        debug!(
            target = "beach_sync::session",
            from = ?self.run_state,
            to = ?next,
            "script run state changed"
        );
        self.run_state = next;
        self.emit(SessionUpdate::RunStateChanged(next));
    }

    fn publish(&self, tree: SessionTree) {
        self.tree.send_replace(Arc::new(tree));
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}
