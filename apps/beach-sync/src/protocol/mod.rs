//! Typed envelope for frames exchanged with the remote session host.
//!
//! Only the fields the synchronization layer needs are modelled: the content
//! hash and metadata used by the message cache, and the delta/run lifecycle
//! bodies consumed by the session driver. Element and block payloads are kept
//! opaque (`serde_json::Value`) because rendering is someone else's concern.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod codec;

pub use codec::{CodecError, FrameCodec, JsonCodec};

/// Message pushed from the remote host to this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardMessage {
    /// Content hash assigned by the host. Present on cacheable messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    pub body: ForwardBody,
}

impl ForwardMessage {
    pub fn new(body: ForwardBody) -> Self {
        Self {
            hash: None,
            metadata: None,
            body,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Builds a pointer to a previously cached message.
    pub fn reference(ref_hash: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self::new(ForwardBody::Reference {
            ref_hash: ref_hash.into(),
        })
        .with_metadata(metadata)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.body, ForwardBody::Reference { .. })
    }

    pub fn is_cacheable(&self) -> bool {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.cacheable)
            .unwrap_or(false)
    }

    pub fn fragment_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.fragment_id.as_deref())
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

/// Per-delivery metadata. A reference message carries its own copy, which is
/// overlaid onto the cached message it points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub cacheable: bool,
    /// Container path addressed by a delta, starting below the root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delta_path: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
    /// Identity of the top-level script that owns the addressed root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_script_hash: Option<String>,
}

impl MessageMetadata {
    pub fn at_path(path: impl Into<Vec<usize>>) -> Self {
        Self {
            delta_path: path.into(),
            ..Self::default()
        }
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn in_fragment(mut self, fragment_id: impl Into<String>) -> Self {
        self.fragment_id = Some(fragment_id.into());
        self
    }

    pub fn owned_by(mut self, script_hash: impl Into<String>) -> Self {
        self.active_script_hash = Some(script_hash.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForwardBody {
    NewSession(NewSession),
    SessionStatusChanged {
        script_is_running: bool,
    },
    Delta(Delta),
    ScriptFinished {
        status: ScriptFinishedStatus,
    },
    /// Pointer to a cached message; everything else comes from the cache.
    Reference {
        ref_hash: String,
    },
    #[serde(other)]
    Unknown,
}

impl ForwardBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardBody::NewSession(_) => "new_session",
            ForwardBody::SessionStatusChanged { .. } => "session_status_changed",
            ForwardBody::Delta(_) => "delta",
            ForwardBody::ScriptFinished { .. } => "script_finished",
            ForwardBody::Reference { .. } => "reference",
            ForwardBody::Unknown => "unknown",
        }
    }
}

/// Announces the start of a script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub run_id: String,
    pub main_script_hash: String,
    /// Empty for a full run.
    #[serde(default)]
    pub fragment_ids_this_run: Vec<String>,
    #[serde(default = "default_max_cached_message_age")]
    pub max_cached_message_age: u64,
}

fn default_max_cached_message_age() -> u64 {
    crate::cache::DEFAULT_MAX_CACHED_MESSAGE_AGE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFinishedStatus {
    FinishedSuccessfully,
    FinishedFragmentRunSuccessfully,
    FinishedWithCompileError,
    FinishedEarlyForRerun,
}

impl ScriptFinishedStatus {
    /// Whether the run completed normally and stale content may be pruned.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ScriptFinishedStatus::FinishedSuccessfully
                | ScriptFinishedStatus::FinishedFragmentRunSuccessfully
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub op: DeltaOp,
}

impl Delta {
    pub fn new_element(element: ElementPayload) -> Self {
        Self {
            op: DeltaOp::NewElement { element },
        }
    }

    pub fn add_block(block: BlockPayload) -> Self {
        Self {
            op: DeltaOp::AddBlock { block },
        }
    }

    pub fn append_data(rows: Vec<Value>) -> Self {
        Self {
            op: DeltaOp::AppendData { rows },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeltaOp {
    NewElement { element: ElementPayload },
    AddBlock { block: BlockPayload },
    AppendData { rows: Vec<Value> },
    #[serde(other)]
    Unknown,
}

impl DeltaOp {
    pub fn kind(&self) -> &'static str {
        match self {
            DeltaOp::NewElement { .. } => "new_element",
            DeltaOp::AddBlock { .. } => "add_block",
            DeltaOp::AppendData { .. } => "append_data",
            DeltaOp::Unknown => "unknown",
        }
    }
}

/// Opaque leaf content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementPayload {
    pub kind: String,
    /// Set for interactive elements whose client-side state is keyed by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Value>,
}

impl ElementPayload {
    pub fn new(kind: impl Into<String>, body: Value) -> Self {
        Self {
            kind: kind.into(),
            widget_id: None,
            body,
            rows: Vec::new(),
        }
    }

    pub fn widget(kind: impl Into<String>, widget_id: impl Into<String>, body: Value) -> Self {
        Self {
            widget_id: Some(widget_id.into()),
            ..Self::new(kind, body)
        }
    }

    /// Placeholder used to fill gaps when a delta writes past the end of a container.
    pub fn empty() -> Self {
        Self::new("empty", Value::Null)
    }
}

/// Opaque container content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub kind: String,
    #[serde(default)]
    pub body: Value,
}

impl BlockPayload {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            body: Value::Null,
        }
    }
}

/// Message sent from this client to the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackMessage {
    RerunScript {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fragment_id: Option<String>,
        /// Hashes the client already holds so the host can send references instead.
        #[serde(default)]
        cached_message_hashes: Vec<String>,
    },
    StopScript,
    AppHeartbeat,
}

impl BackMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BackMessage::RerunScript { .. } => "rerun_script",
            BackMessage::StopScript => "stop_script",
            BackMessage::AppHeartbeat => "app_heartbeat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_body_type_decodes_to_unknown() {
        let raw = json!({ "body": { "type": "page_profile", "commands": [] } });
        let message: ForwardMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.body, ForwardBody::Unknown);
        assert!(message.metadata.is_none());
    }

    #[test]
    fn unknown_delta_op_decodes_to_unknown() {
        let raw = json!({
            "hash": "abc",
            "metadata": { "cacheable": true, "delta_path": [0, 1] },
            "body": { "type": "delta", "op": { "kind": "arrow_add_rows" } }
        });
        let message: ForwardMessage = serde_json::from_value(raw).unwrap();
        let ForwardBody::Delta(delta) = message.body else {
            panic!("expected delta body");
        };
        assert_eq!(delta.op, DeltaOp::Unknown);
        assert_eq!(message.metadata.unwrap().delta_path, vec![0, 1]);
    }

    #[test]
    fn reference_keeps_wire_cacheable_flag() {
        let reference = ForwardMessage::reference("H1", MessageMetadata::at_path([2]).cacheable(true));
        assert!(reference.is_reference());
        assert!(reference.is_cacheable());
        assert_eq!(reference.kind(), "reference");
    }

    #[test]
    fn new_session_defaults_cache_age() {
        let raw = json!({
            "body": { "type": "new_session", "run_id": "r1", "main_script_hash": "main" }
        });
        let message: ForwardMessage = serde_json::from_value(raw).unwrap();
        let ForwardBody::NewSession(session) = message.body else {
            panic!("expected new session");
        };
        assert!(session.fragment_ids_this_run.is_empty());
        assert_eq!(
            session.max_cached_message_age,
            crate::cache::DEFAULT_MAX_CACHED_MESSAGE_AGE
        );
    }
}
