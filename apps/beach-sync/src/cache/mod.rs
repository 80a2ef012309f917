//! Content-addressed cache of forward messages.
//!
//! The host marks large, frequently repeated messages as cacheable and tags
//! them with a content hash. Once the client has seen a hash, the host may
//! send a small reference message instead of the full payload; this cache
//! resolves those references back into complete messages.
//!
//! Entries age by *script run*, not wall-clock time. Each completed run calls
//! [`MessageCache::increment_run_count`], and entries that were not seen for
//! more than `max_age` qualifying runs are purged. Fragment runs only age the
//! entries that belong to the fragments that ran:
//!
//! ```text
//! full run      (fragments = [])      -> every entry ages
//! fragment run  (fragments = ["F"])   -> only entries tagged "F" age
//! ```
//!
//! Entries without a fragment id therefore never age during fragment-only
//! runs; they wait for the next full run.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::protocol::{CodecError, ForwardBody, ForwardMessage, FrameCodec};

/// Runs an unseen entry survives when the host does not announce an age.
pub const DEFAULT_MAX_CACHED_MESSAGE_AGE: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cached message {hash} is missing")]
    Miss { hash: String },
    #[error("reference message to {ref_hash} has no metadata")]
    MissingMetadata { ref_hash: String },
    #[error("cached message {hash} failed to decode: {source}")]
    Decode {
        hash: String,
        #[source]
        source: CodecError,
    },
}

impl CacheError {
    /// Code reported through the client error side channel.
    pub fn code(&self) -> &'static str {
        match self {
            CacheError::Miss { .. } => "cache_miss",
            CacheError::MissingMetadata { .. } => "reference_missing_metadata",
            CacheError::Decode { .. } => "cache_decode",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    encoded: Bytes,
    last_seen_run_count: u64,
    fragment_id: Option<String>,
}

pub struct MessageCache {
    codec: Arc<dyn FrameCodec>,
    entries: HashMap<String, CacheEntry>,
    run_count: u64,
}

impl MessageCache {
    pub fn new(codec: Arc<dyn FrameCodec>) -> Self {
        Self {
            codec,
            entries: HashMap::new(),
            run_count: 0,
        }
    }

    /// Stores cacheable content and resolves references.
    ///
    /// `encoded` must be the frame `message` was decoded from; it is what gets
    /// stored and later decoded again for every reference hit.
    pub fn process_message_payload(
        &mut self,
        message: ForwardMessage,
        encoded: &Bytes,
    ) -> Result<ForwardMessage, CacheError> {
        let ref_hash = match &message.body {
            ForwardBody::Reference { ref_hash } => ref_hash.clone(),
            _ => {
                self.maybe_cache(&message, encoded);
                return Ok(message);
            }
        };

        let Some(metadata) = message.metadata else {
            return Err(CacheError::MissingMetadata { ref_hash });
        };

        let run_count = self.run_count;
        let entry = self
            .entries
            .get_mut(&ref_hash)
            .ok_or_else(|| CacheError::Miss {
                hash: ref_hash.clone(),
            })?;
        entry.last_seen_run_count = run_count;

        let mut resolved = self
            .codec
            .decode_forward(&entry.encoded)
            .map_err(|source| CacheError::Decode {
                hash: ref_hash.clone(),
                source,
            })?;
        resolved.metadata = Some(metadata);
        trace!(
            target = "beach_sync::cache",
            hash = %ref_hash,
            kind = resolved.kind(),
            "resolved cached message"
        );
        Ok(resolved)
    }

    fn maybe_cache(&mut self, message: &ForwardMessage, encoded: &Bytes) {
        if !message.is_cacheable() {
            return;
        }
        let Some(hash) = message.hash.as_ref() else {
            return;
        };
        let run_count = self.run_count;
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.last_seen_run_count = run_count;
            return;
        }
        debug!(
            target = "beach_sync::cache",
            hash = %hash,
            bytes = encoded.len(),
            fragment_id = message.fragment_id().unwrap_or(""),
            "caching message"
        );
        self.entries.insert(
            hash.clone(),
            CacheEntry {
                encoded: encoded.clone(),
                last_seen_run_count: run_count,
                fragment_id: message.fragment_id().map(str::to_owned),
            },
        );
    }

    /// Advances the run counter and purges entries older than `max_age` runs.
    pub fn increment_run_count(&mut self, max_age: u64, fragment_ids_this_run: &[String]) {
        self.run_count += 1;
        let run_count = self.run_count;
        let before = self.entries.len();
        self.entries.retain(|hash, entry| {
            if !fragment_ids_this_run.is_empty() {
                let in_scope = entry
                    .fragment_id
                    .as_ref()
                    .map(|id| fragment_ids_this_run.contains(id))
                    .unwrap_or(false);
                if !in_scope {
                    return true;
                }
            }
            let age = run_count - entry.last_seen_run_count;
            if age > max_age {
                trace!(target = "beach_sync::cache", hash = %hash, age, "evicting message");
                false
            } else {
                true
            }
        });
        debug!(
            target = "beach_sync::cache",
            run_count,
            max_age,
            fragments = fragment_ids_this_run.len(),
            evicted = before - self.entries.len(),
            remaining = self.entries.len(),
            "message cache run count incremented"
        );
    }

    pub fn cached_message_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.entries.keys().cloned().collect();
        hashes.sort();
        hashes
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for MessageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCache")
            .field("entries", &self.entries.len())
            .field("run_count", &self.run_count)
            .finish()
    }
}
