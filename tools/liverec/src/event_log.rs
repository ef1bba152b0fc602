//! Append-only, capacity-capped event log.
//!
//! Every entry receives the next position; positions start at zero and are
//! never reused, even after old entries are evicted to make room.

use crate::annotation::Annotation;
use crate::runtime::AttachInfo;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_EVENT_LOG_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionStarted(AttachInfo),
    Execution { thread_id: u64, detail: String },
    Annotation(Annotation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub position: u64,
    pub timestamp_ns: u64,
    pub event: Event,
}

impl EventRecord {
    fn encoded_len(&self) -> u64 {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct EventLogStore {
    capacity_bytes: u64,
    used_bytes: u64,
    next_position: u64,
    evicted: u64,
    entries: VecDeque<(EventRecord, u64)>,
}

impl EventLogStore {
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            used_bytes: 0,
            next_position: 0,
            evicted: 0,
            entries: VecDeque::new(),
        }
    }

    /// Appends `event` and returns the position it was recorded at.
    pub fn append(&mut self, timestamp_ns: u64, event: Event) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        let record = EventRecord {
            position,
            timestamp_ns,
            event,
        };
        let len = record.encoded_len();
        while !self.entries.is_empty() && self.used_bytes + len > self.capacity_bytes {
            if let Some((_, old_len)) = self.entries.pop_front() {
                self.used_bytes -= old_len;
                self.evicted += 1;
            }
        }
        self.used_bytes += len;
        self.entries.push_back((record, len));
        position
    }

    /// Position the next append will receive.
    pub fn current_position(&self) -> u64 {
        self.next_position
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> EventLogSnapshot {
        EventLogSnapshot {
            capacity_bytes: self.capacity_bytes,
            next_position: self.next_position,
            evicted: self.evicted,
            records: self.entries.iter().map(|(record, _)| record.clone()).collect(),
        }
    }

    pub fn into_snapshot(self) -> EventLogSnapshot {
        EventLogSnapshot {
            capacity_bytes: self.capacity_bytes,
            next_position: self.next_position,
            evicted: self.evicted,
            records: self.entries.into_iter().map(|(record, _)| record).collect(),
        }
    }
}

/// Frozen copy of an event log, ready to be saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogSnapshot {
    pub capacity_bytes: u64,
    pub next_position: u64,
    pub evicted: u64,
    pub records: Vec<EventRecord>,
}

impl EventLogSnapshot {
    pub fn annotations(&self) -> impl Iterator<Item = &Annotation> {
        self.records.iter().filter_map(|record| match &record.event {
            Event::Annotation(annotation) => Some(annotation),
            _ => None,
        })
    }

    pub fn attach_info(&self) -> Option<&AttachInfo> {
        self.records.iter().find_map(|record| match &record.event {
            Event::SessionStarted(info) => Some(info),
            _ => None,
        })
    }
}
