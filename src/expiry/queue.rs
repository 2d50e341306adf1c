//! Time Queue
//!
//! Min-priority queue of `(due_at, transfer_id)`. Each id appears at most
//! once; re-inserting an id moves it to the new deadline.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Callback fired after every insert
pub type InsertListener = Box<dyn Fn(DateTime<Utc>, Uuid) + Send + Sync>;

#[derive(Default)]
pub struct TimeQueue {
    /// Ordered by deadline, id breaks ties
    entries: BTreeSet<(DateTime<Utc>, Uuid)>,
    index: HashMap<Uuid, DateTime<Utc>>,
    listener: Option<InsertListener>,
}

impl TimeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, due_at: DateTime<Utc>, id: Uuid) {
        if let Some(previous) = self.index.insert(id, due_at) {
            self.entries.remove(&(previous, id));
        }
        self.entries.insert((due_at, id));

        if let Some(listener) = &self.listener {
            listener(due_at, id);
        }
    }

    pub fn earliest_due_at(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|(at, _)| *at)
    }

    /// Remove and return every id due at or before `now`, earliest first
    pub fn pop_all_due_by(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due = Vec::new();
        while let Some(&(at, id)) = self.entries.first() {
            if at > now {
                break;
            }
            self.entries.pop_first();
            self.index.remove(&id);
            due.push(id);
        }
        due
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.contains_key(&id)
    }

    /// Returns whether the id was queued
    pub fn remove(&mut self, id: Uuid) -> bool {
        match self.index.remove(&id) {
            Some(at) => {
                self.entries.remove(&(at, id));
                true
            }
            None => false,
        }
    }

    pub fn due_at(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.index.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Register the insert listener, replacing any previous one
    pub fn set_insert_listener(&mut self, listener: InsertListener) {
        self.listener = Some(listener);
    }

    pub fn clear_insert_listener(&mut self) {
        self.listener = None;
    }

    pub fn has_insert_listener(&self) -> bool {
        self.listener.is_some()
    }
}
