//! Reconciliation snapshot store — compacted room state for late joiners.
//!
//! DESIGN
//! ======
//! `Snapshot` folds sequenced events into a map of drawing elements keyed by
//! the payload's `id`. Folds must arrive in strict sequence order; an
//! out-of-order fold is rejected, never buffered, because the only writer is
//! the room's sequencer and a gap means its invariant is already broken.
//!
//! `EventLog` keeps a bounded window of raw events so reconnecting clients
//! can replay a short gap instead of reloading the snapshot. A `clear`
//! supersedes everything before it, so the log drops those events and any
//! replay that starts before the clear is still valid.
//!
//! FOLD RULES
//! ==========
//! - `op: "clear"` drops every element.
//! - `op: "delete" | "remove"` with `id` drops that element.
//! - `op: "move" | "update"` with `id` shallow-merges payload fields
//!   (except `op`).
//! - any other payload with `id` replaces the element.
//! - payloads without `id` are kept as element `#<sequence>`.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Value, json};

use crate::services::sequencer::SequencedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FoldError {
    #[error("out-of-order fold: expected sequence {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
}

/// What a payload asks the snapshot to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldOp {
    Clear,
    Remove(String),
    Merge(String),
    Replace(String),
}

impl FoldOp {
    /// Classify a payload. Payloads without an id become `Replace("#<seq>")`.
    #[must_use]
    pub fn classify(payload: &Value, sequence: u64) -> Self {
        let op = payload.get("op").and_then(Value::as_str).unwrap_or("");
        if op == "clear" {
            return Self::Clear;
        }
        let Some(id) = element_id(payload) else {
            return Self::Replace(format!("#{sequence}"));
        };
        match op {
            "delete" | "remove" => Self::Remove(id),
            "move" | "update" => Self::Merge(id),
            _ => Self::Replace(id),
        }
    }
}

fn element_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Element {
    /// Sequence that first created the element; drives draw order.
    created: u64,
    data: Value,
}

/// Compacted visual state of a room as of `sequence`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    sequence: u64,
    elements: HashMap<String, Element>,
}

impl Snapshot {
    /// Sequence number of the last folded event (0 for a fresh room).
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.elements.get(id).map(|e| &e.data)
    }

    /// Apply one event. Returns the classified op so callers can compact.
    ///
    /// # Errors
    ///
    /// Returns [`FoldError::OutOfOrder`] unless `event.sequence` is exactly
    /// one past the current sequence. The snapshot is unchanged on error.
    pub fn fold(&mut self, event: &SequencedEvent) -> Result<FoldOp, FoldError> {
        let expected = self.sequence + 1;
        if event.sequence != expected {
            return Err(FoldError::OutOfOrder { expected, got: event.sequence });
        }

        let op = FoldOp::classify(&event.payload, event.sequence);
        match &op {
            FoldOp::Clear => self.elements.clear(),
            FoldOp::Remove(id) => {
                self.elements.remove(id);
            }
            FoldOp::Merge(id) => match self.elements.get_mut(id) {
                Some(existing) => merge_into(&mut existing.data, &event.payload),
                None => {
                    self.elements
                        .insert(id.clone(), Element { created: event.sequence, data: event.payload.clone() });
                }
            },
            FoldOp::Replace(id) => {
                let created = self
                    .elements
                    .get(id)
                    .map_or(event.sequence, |existing| existing.created);
                self.elements
                    .insert(id.clone(), Element { created, data: event.payload.clone() });
            }
        }
        self.sequence = event.sequence;
        Ok(op)
    }

    /// Elements as `(id, data)` in draw order.
    #[must_use]
    pub fn ordered(&self) -> Vec<(&str, &Value)> {
        let mut by_created: BTreeMap<u64, (&str, &Value)> = BTreeMap::new();
        for (id, element) in &self.elements {
            by_created.insert(element.created, (id.as_str(), &element.data));
        }
        by_created.into_values().collect()
    }

    /// Wire form sent in `joined` and `resync` replies.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let elements: Vec<Value> = self
            .ordered()
            .into_iter()
            .map(|(id, data)| json!({"id": id, "data": data}))
            .collect();
        json!({"sequence": self.sequence, "elements": elements})
    }
}

fn merge_into(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch.iter().filter(|(key, _)| key.as_str() != "op") {
                target.insert(key.clone(), value.clone());
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

// =============================================================================
// EVENT LOG
// =============================================================================

/// Bounded window of recent raw events.
#[derive(Debug)]
pub struct EventLog {
    events: BTreeMap<u64, SequencedEvent>,
    capacity: usize,
    /// Replays must start at or after this sequence.
    horizon: u64,
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { events: BTreeMap::new(), capacity: capacity.max(1), horizon: 0 }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    /// Append an event, evicting the oldest entries past capacity.
    pub fn push(&mut self, event: SequencedEvent) {
        self.events.insert(event.sequence, event);
        while self.events.len() > self.capacity {
            if let Some((evicted, _)) = self.events.pop_first() {
                self.horizon = self.horizon.max(evicted);
            }
        }
    }

    /// Drop every event before `clear_sequence`. Replays from any point
    /// remain valid because the clear itself is retained.
    pub fn compact_before(&mut self, clear_sequence: u64) {
        self.events = self.events.split_off(&clear_sequence);
        self.horizon = 0;
    }

    /// Forget events after `sequence`. Used when a room is reset.
    pub fn truncate_after(&mut self, sequence: u64) {
        let _ = self.events.split_off(&(sequence + 1));
    }

    /// Retained events with sequence `> since`, or `None` if the window no
    /// longer covers the gap.
    #[must_use]
    pub fn since(&self, since: u64) -> Option<Vec<SequencedEvent>> {
        if since < self.horizon {
            return None;
        }
        Some(
            self.events
                .range(since + 1..)
                .map(|(_, event)| event.clone())
                .collect(),
        )
    }

    #[cfg(test)]
    pub(crate) fn sequences(&self) -> Vec<u64> {
        self.events.keys().copied().collect()
    }
}

#[cfg(test)]
#[path = "snapshot_test.rs"]
mod tests;
