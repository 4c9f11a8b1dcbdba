//! Bounded, queryable timeline of task- and node-lifecycle events.
//!
//! Events live in an in-memory ring buffer; the oldest are evicted once the
//! bound is reached. Queries snapshot under the lock and filter outside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_MAX_EVENTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineEventType {
    TaskCreated,
    TaskQueued,
    TaskLeased,
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskExpired,
    TaskRequeued,
    LeaseIssued,
    LeaseExpired,
    LeaseRevoked,
    NodeCrashed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_type: TimelineEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// AND-combined query filters; `limit`/`offset` paginate the sorted result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineQuery {
    pub task_id: Option<String>,
    pub peer_id: Option<String>,
    pub event_type: Option<TimelineEventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug)]
pub struct Timeline {
    max_events: usize,
    events: Mutex<VecDeque<TimelineEvent>>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl Timeline {
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events,
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
        }
    }

    /// Record an event. Timestamp defaults to now, metadata to `{}`.
    pub fn record(
        &self,
        event_type: TimelineEventType,
        task_id: Option<String>,
        peer_id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
        metadata: Option<Map<String, Value>>,
    ) -> TimelineEvent {
        let event = TimelineEvent {
            event_type,
            task_id,
            peer_id,
            timestamp: timestamp.unwrap_or_else(Utc::now),
            metadata: metadata.unwrap_or_default(),
        };

        let mut events = self.events.lock().expect("timeline lock poisoned");
        if events.len() == self.max_events {
            events.pop_front();
        }
        events.push_back(event.clone());
        event
    }

    /// Query with AND filters; newest-first. Returns the page plus the
    /// post-filter, pre-pagination total.
    pub fn query(&self, query: &TimelineQuery) -> (Vec<TimelineEvent>, usize) {
        let snapshot: Vec<TimelineEvent> = {
            let events = self.events.lock().expect("timeline lock poisoned");
            events.iter().cloned().collect()
        };

        let mut filtered: Vec<TimelineEvent> = snapshot
            .into_iter()
            .filter(|e| {
                query
                    .task_id
                    .as_ref()
                    .is_none_or(|t| e.task_id.as_ref() == Some(t))
                    && query
                        .peer_id
                        .as_ref()
                        .is_none_or(|p| e.peer_id.as_ref() == Some(p))
                    && query.event_type.is_none_or(|t| e.event_type == t)
                    && query.since.is_none_or(|s| e.timestamp >= s)
                    && query.until.is_none_or(|u| e.timestamp <= u)
            })
            .collect();

        filtered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total = filtered.len();

        let offset = query.offset.unwrap_or(0).min(total);
        let limit = query.limit.unwrap_or(100);
        let page = filtered.into_iter().skip(offset).take(limit).collect();

        (page, total)
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("timeline lock poisoned").len()
    }

    pub fn clear(&self) {
        self.events.lock().expect("timeline lock poisoned").clear();
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }
}
