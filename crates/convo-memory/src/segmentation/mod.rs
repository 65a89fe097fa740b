//! Segmentation: groups a conversation's message stream into bounded,
//! coherent segments.
//!
//! [`ConversationSegmenter`] is the per-conversation state machine. It only
//! decides *when* the open segment closes and hands back a [`SegmentDraft`];
//! [`finalizer::SegmentFinalizer`] persists, embeds and indexes drafts.

pub mod finalizer;
pub mod quality;

pub use finalizer::SegmentFinalizer;

use crate::config::SegmentationConfig;
use crate::embedding::{cosine_similarity, ActiveModel};
use crate::memory_db::StoredMessage;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tracing::debug;

/// Text a segment is embedded from.
pub fn segment_text(messages: &[StoredMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Time,
    Count,
    Drift,
    Idle,
    Flush,
}

#[derive(Debug, Clone)]
pub struct OpenMember {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub vector: Option<Vec<f32>>,
}

/// A closed group of messages awaiting persistence.
#[derive(Debug, Clone)]
pub struct SegmentDraft {
    pub conversation_id: String,
    pub members: Vec<OpenMember>,
    pub reason: CloseReason,
    /// Model the member vectors came from, if any.
    pub vector_model: Option<String>,
}

impl SegmentDraft {
    pub fn message_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.message_id.clone()).collect()
    }
}

pub struct ConversationSegmenter {
    conversation_id: String,
    config: SegmentationConfig,
    max_messages: usize,
    open: Vec<OpenMember>,
    centroid_sum: Option<Vec<f32>>,
    centroid_count: usize,
    vector_model: Option<String>,
    recent: VecDeque<DateTime<Utc>>,
}

impl ConversationSegmenter {
    pub fn new(conversation_id: impl Into<String>, config: SegmentationConfig) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            max_messages: config.max_messages.max(1),
            config,
            open: Vec::new(),
            centroid_sum: None,
            centroid_count: 0,
            vector_model: None,
            recent: VecDeque::new(),
        }
    }

    pub fn set_max_messages(&mut self, max_messages: Option<usize>) {
        self.max_messages = max_messages.unwrap_or(self.config.max_messages).max(1);
    }

    pub fn open_len(&self) -> usize {
        self.open.len()
    }

    pub fn open_message_ids(&self) -> Vec<String> {
        self.open.iter().map(|m| m.message_id.clone()).collect()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.open.first().map(|m| m.timestamp)
    }

    /// Messages per minute over the activity window ending at `now`.
    pub fn activity_rate(&self, now: DateTime<Utc>) -> f64 {
        let window = self.config.activity_window();
        let window_start = now - window;
        let count = self
            .recent
            .iter()
            .filter(|ts| **ts > window_start && **ts <= now)
            .count();
        let minutes = (window.num_milliseconds() as f64 / 60_000.0).max(1.0 / 60.0);
        count as f64 / minutes
    }

    /// `base / (1 + rate / reference_rate)` clamped to `[min, max]`. Without
    /// activity shortening the base interval is used as is.
    pub fn dynamic_interval(&self, now: DateTime<Utc>) -> Duration {
        let base = self.config.base_interval();
        let interval = if self.config.activity_shortening {
            let rate = self.activity_rate(now);
            let factor = 1.0 + rate / self.config.activity_reference_rate;
            Duration::milliseconds((base.num_milliseconds() as f64 / factor) as i64)
        } else {
            base
        };
        interval.clamp(self.config.min_interval(), self.config.max_interval())
    }

    /// When the open segment closes if nothing else arrives.
    pub fn close_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.first_timestamp().map(|first| first + self.dynamic_interval(now))
    }

    fn centroid(&self) -> Option<Vec<f32>> {
        let sum = self.centroid_sum.as_ref()?;
        if self.centroid_count == 0 {
            return None;
        }
        Some(sum.iter().map(|x| x / self.centroid_count as f32).collect())
    }

    fn record_activity(&mut self, ts: DateTime<Utc>) {
        let pos = self.recent.partition_point(|t| *t <= ts);
        self.recent.insert(pos, ts);
        let horizon = self.recent.back().copied().unwrap_or(ts) - self.config.activity_window();
        while self.recent.front().is_some_and(|t| *t <= horizon) {
            self.recent.pop_front();
        }
    }

    fn push_member(&mut self, member: OpenMember, model: Option<&str>) {
        if let Some(vector) = &member.vector {
            // A model switch mid-segment restarts the centroid.
            if self.vector_model.as_deref() != model {
                self.centroid_sum = None;
                self.centroid_count = 0;
                self.vector_model = model.map(str::to_string);
            }
            match self.centroid_sum.as_mut() {
                Some(sum) if sum.len() == vector.len() => {
                    sum.iter_mut().zip(vector).for_each(|(s, v)| *s += v);
                    self.centroid_count += 1;
                }
                Some(_) => {}
                None => {
                    self.centroid_sum = Some(vector.clone());
                    self.centroid_count = 1;
                }
            }
        }
        self.open.push(member);
    }

    fn take_draft(&mut self, reason: CloseReason) -> Option<SegmentDraft> {
        if self.open.is_empty() {
            return None;
        }
        let members = std::mem::take(&mut self.open);
        self.centroid_sum = None;
        self.centroid_count = 0;
        debug!(
            "Closing segment of {} ({} messages, {:?})",
            self.conversation_id,
            members.len(),
            reason
        );
        Some(SegmentDraft {
            conversation_id: self.conversation_id.clone(),
            members,
            reason,
            vector_model: self.vector_model.take(),
        })
    }

    /// Feeds one message. Time and drift close the open segment before the
    /// message joins; the count trigger closes after. Returns closed drafts
    /// in order.
    pub fn observe(
        &mut self,
        message: &StoredMessage,
        vector: Option<Vec<f32>>,
        model: Option<&ActiveModel>,
    ) -> Vec<SegmentDraft> {
        let mut closed = Vec::new();
        self.record_activity(message.timestamp);

        if let Some(first) = self.first_timestamp() {
            let interval = self.dynamic_interval(message.timestamp);
            if message.timestamp - first > interval {
                closed.extend(self.take_draft(CloseReason::Time));
            }
        }

        if self.open.len() >= self.config.min_messages_for_drift.max(1) {
            let same_model = model.map(|m| m.model_id.as_str()) == self.vector_model.as_deref();
            if let (Some(v), Some(center), true) = (vector.as_ref(), self.centroid(), same_model) {
                let similarity = cosine_similarity(v, &center);
                if similarity < self.config.similarity_cutoff {
                    debug!(
                        "Topic drift in {}: similarity {:.3} < {:.3}",
                        self.conversation_id, similarity, self.config.similarity_cutoff
                    );
                    closed.extend(self.take_draft(CloseReason::Drift));
                }
            }
        }

        self.push_member(
            OpenMember {
                message_id: message.id.clone(),
                timestamp: message.timestamp,
                vector,
            },
            model.map(|m| m.model_id.as_str()),
        );

        if self.open.len() >= self.max_messages {
            closed.extend(self.take_draft(CloseReason::Count));
        }
        closed
    }

    /// Closes the open segment when its interval has elapsed at `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<SegmentDraft> {
        let first = self.first_timestamp()?;
        if now - first >= self.dynamic_interval(now) {
            self.take_draft(CloseReason::Idle)
        } else {
            None
        }
    }

    pub fn flush(&mut self) -> Option<SegmentDraft> {
        self.take_draft(CloseReason::Flush)
    }

    /// Rebuilds the open segment from messages that were stored but never
    /// segmented. Vectors are unknown, so drift stays off until new vectors
    /// arrive.
    pub fn restore(&mut self, messages: &[StoredMessage]) {
        self.open.clear();
        self.centroid_sum = None;
        self.centroid_count = 0;
        self.vector_model = None;
        for message in messages {
            self.record_activity(message.timestamp);
            self.open.push(OpenMember {
                message_id: message.id.clone(),
                timestamp: message.timestamp,
                vector: None,
            });
        }
    }

    /// Puts a draft's members back in front of the open segment, e.g. after
    /// persisting it failed.
    pub fn reopen(&mut self, draft: SegmentDraft) {
        let mut members = draft.members;
        members.append(&mut self.open);
        self.open = members;
        self.centroid_sum = None;
        self.centroid_count = 0;
        self.vector_model = None;
    }
}
