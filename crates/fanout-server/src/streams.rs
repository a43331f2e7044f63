//! Message-stream sessions: chunked messages keyed by `conversation:message`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fanout_core::RoomId;
use metrics::gauge;
use tokio::time::Instant;
use tracing::warn;

use crate::metrics::MESSAGE_STREAMS_ACTIVE;

/// Registry key for a stream.
pub fn stream_key(conversation_id: &RoomId, message_id: &str) -> String {
    format!("{conversation_id}:{message_id}")
}

/// One in-progress streamed message.
#[derive(Clone, Debug)]
pub struct MessageStream {
    /// Conversation the message is streamed into.
    pub conversation_id: RoomId,
    /// Message identifier.
    pub message_id: String,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    started: Instant,
    last_activity: Instant,
    /// Chunks received so far.
    pub chunks: usize,
    /// Concatenated chunk text.
    pub content: String,
}

/// A finished stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSummary {
    /// Conversation the message was streamed into.
    pub conversation_id: RoomId,
    /// Message identifier.
    pub message_id: String,
    /// Time from start to end.
    pub duration: Duration,
    /// Chunks received.
    pub total_chunks: usize,
    /// Full message text.
    pub content: String,
}

impl MessageStream {
    fn into_summary(self) -> StreamSummary {
        StreamSummary {
            conversation_id: self.conversation_id,
            message_id: self.message_id,
            duration: self.started.elapsed(),
            total_chunks: self.chunks,
            content: self.content,
        }
    }
}

/// Open streams.
#[derive(Default)]
pub struct StreamRegistry {
    sessions: DashMap<String, MessageStream>,
}

impl StreamRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream. Restarting a stream that is already open resets it.
    pub fn start(&self, conversation_id: &RoomId, message_id: &str) -> DateTime<Utc> {
        let key = stream_key(conversation_id, message_id);
        let now = Instant::now();
        let stream = MessageStream {
            conversation_id: conversation_id.clone(),
            message_id: message_id.to_owned(),
            started_at: Utc::now(),
            started: now,
            last_activity: now,
            chunks: 0,
            content: String::new(),
        };
        let started_at = stream.started_at;
        if self.sessions.insert(key.clone(), stream).is_some() {
            warn!(stream = %key, "message stream restarted");
        }
        gauge!(MESSAGE_STREAMS_ACTIVE).set(self.sessions.len() as f64);
        started_at
    }

    /// Append a chunk. Returns the new chunk count, or `None` for an
    /// unknown stream.
    pub fn append(&self, conversation_id: &RoomId, message_id: &str, chunk: &str) -> Option<usize> {
        let key = stream_key(conversation_id, message_id);
        match self.sessions.entry(key) {
            Entry::Occupied(mut entry) => {
                let stream = entry.get_mut();
                stream.chunks += 1;
                stream.content.push_str(chunk);
                stream.last_activity = Instant::now();
                Some(stream.chunks)
            }
            Entry::Vacant(entry) => {
                warn!(stream = %entry.key(), "chunk for unknown message stream dropped");
                None
            }
        }
    }

    /// Close a stream and summarise it. `None` for an unknown stream.
    pub fn finish(&self, conversation_id: &RoomId, message_id: &str) -> Option<StreamSummary> {
        let key = stream_key(conversation_id, message_id);
        let Some((_, stream)) = self.sessions.remove(&key) else {
            warn!(stream = %key, "end of unknown message stream ignored");
            return None;
        };
        gauge!(MESSAGE_STREAMS_ACTIVE).set(self.sessions.len() as f64);
        Some(stream.into_summary())
    }

    /// Remove streams that have had no chunk for longer than `max_idle`
    /// and summarise them.
    pub fn expire_idle(&self, max_idle: Duration) -> Vec<StreamSummary> {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.last_activity.elapsed() > max_idle)
            .map(|s| s.key().clone())
            .collect();
        let expired: Vec<StreamSummary> = idle
            .iter()
            .filter_map(|key| {
                self.sessions
                    .remove_if(key, |_, s| s.last_activity.elapsed() > max_idle)
            })
            .map(|(key, stream)| {
                warn!(stream = %key, chunks = stream.chunks, "idle message stream expired");
                stream.into_summary()
            })
            .collect();
        if !expired.is_empty() {
            gauge!(MESSAGE_STREAMS_ACTIVE).set(self.sessions.len() as f64);
        }
        expired
    }

    /// Snapshot of one open stream.
    pub fn get(&self, conversation_id: &RoomId, message_id: &str) -> Option<MessageStream> {
        self.sessions
            .get(&stream_key(conversation_id, message_id))
            .map(|s| s.clone())
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no stream is open.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
