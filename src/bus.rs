//! # Local Event Bus
//!
//! The mesh never owns application events; it relays whatever the process's
//! local bus carries. This module defines the collaborator interface the mesh
//! consumes ([`EventBus`]), the event model, subscription filters, and
//! [`LocalBus`], an in-process implementation built on a Tokio broadcast
//! channel.
//!
//! ## Filters
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `*` | every event |
//! | `sensor:*` | glob over the event `type` (`*` spans any run of characters) |
//! | `/^sensor:(temp\|rh)$/` | regular expression over the event `type` |
//! | `sensor:temp` | exact `type` |
//!
//! A condition is a JSON object. Every key (dotted paths reach into nested
//! objects, e.g. `data.unit`) must equal the event's value at that path.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::error::{MeshError, MeshResult};

/// Default broadcast buffer for [`LocalBus`].
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Pattern that matches every event.
pub const MATCH_ALL: &str = "*";

/// An event as carried by the local bus and relayed over the mesh.
///
/// Unknown fields are preserved in `extra` so events pass through nodes that
/// do not understand them unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Bus id of the process that first emitted this event.
    #[serde(default)]
    pub origin: String,
    /// Component that produced the event. Mesh lifecycle events carry the
    /// node identity here and are never relayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Look up a dotted path (`data.unit`) using the wire field names.
    fn lookup(&self, path: &str) -> Option<Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let root = match head {
            "data" => &self.data,
            "id" | "type" | "origin" | "source" | "timestamp" => {
                return if rest.is_none() { self.scalar(head) } else { None };
            }
            other => self.extra.get(other)?,
        };
        match rest {
            None => Some(root.clone()),
            Some(rest) => rest
                .split('.')
                .try_fold(root, |current, segment| current.as_object()?.get(segment))
                .cloned(),
        }
    }

    fn scalar(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::String(self.id.clone())),
            "type" => Some(Value::String(self.kind.clone())),
            "origin" => Some(Value::String(self.origin.clone())),
            "source" => self.source.clone().map(Value::String),
            "timestamp" => Some(Value::from(self.timestamp)),
            _ => None,
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Debug)]
enum Pattern {
    Any,
    Exact(String),
    Regex(Regex),
}

/// Pattern plus optional condition, as declared by a subscriber.
#[derive(Clone, Debug)]
pub struct EventFilter {
    pattern: Pattern,
    condition: Option<Map<String, Value>>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self {
            pattern: Pattern::Any,
            condition: None,
        }
    }

    /// Build a filter from a pattern string and an optional condition object.
    ///
    /// # Errors
    /// Returns [`MeshError::Config`] if the pattern is an invalid regular
    /// expression or the condition is neither an object nor null.
    pub fn new(pattern: &str, condition: Option<&Value>) -> MeshResult<Self> {
        let pattern = compile_pattern(pattern)?;
        let condition = match condition {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) if map.is_empty() => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(other) => {
                return Err(MeshError::Config(format!(
                    "condition must be an object, got {other}"
                )));
            }
        };
        Ok(Self { pattern, condition })
    }

    pub fn matches(&self, event: &Event) -> bool {
        let type_matches = match &self.pattern {
            Pattern::Any => true,
            Pattern::Exact(kind) => event.kind == *kind,
            Pattern::Regex(re) => re.is_match(&event.kind),
        };
        if !type_matches {
            return false;
        }
        match &self.condition {
            None => true,
            Some(condition) => condition
                .iter()
                .all(|(path, expected)| event.lookup(path).as_ref() == Some(expected)),
        }
    }
}

fn compile_pattern(pattern: &str) -> MeshResult<Pattern> {
    let pattern = pattern.trim();
    if pattern.is_empty() || pattern == MATCH_ALL {
        return Ok(Pattern::Any);
    }

    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        let source = &pattern[1..pattern.len() - 1];
        return Regex::new(source)
            .map(Pattern::Regex)
            .map_err(|e| MeshError::Config(format!("invalid pattern {pattern}: {e}")));
    }

    if !pattern.contains('*') {
        return Ok(Pattern::Exact(pattern.to_owned()));
    }

    let glob = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{glob}$"))
        .map(Pattern::Regex)
        .map_err(|e| MeshError::Config(format!("invalid pattern {pattern}: {e}")))
}

/// A filtered view over the bus. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<Arc<Event>>,
    filter: EventFilter,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<Arc<Event>>, filter: EventFilter) -> Self {
        Self { rx, filter }
    }

    /// Wait for the next matching event. Returns `None` once the bus is gone.
    ///
    /// Cancel-safe: usable as a `tokio::select!` branch.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Collaborator interface the mesh consumes from the host process.
pub trait EventBus: Send + Sync + 'static {
    /// Process-unique bus identifier, used as `origin` on emitted events.
    fn id(&self) -> &str;

    /// Fresh unique identifier (event ids, connection ids, secrets).
    fn unique_id(&self) -> String;

    /// Publish an event, filling in `id`, `origin` and `timestamp` when they
    /// are empty. Returns the event as delivered to subscribers.
    fn emit(&self, event: Event) -> Arc<Event>;

    fn subscribe(&self, filter: EventFilter) -> Subscription;

    fn subscribe_all(&self) -> Subscription {
        self.subscribe(EventFilter::any())
    }
}

/// In-process bus backed by a broadcast channel.
pub struct LocalBus {
    id: String,
    tx: broadcast::Sender<Arc<Event>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tx,
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for LocalBus {
    fn id(&self) -> &str {
        &self.id
    }

    fn unique_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn emit(&self, mut event: Event) -> Arc<Event> {
        if event.id.is_empty() {
            event.id = self.unique_id();
        }
        if event.origin.is_empty() {
            event.origin = self.id.clone();
        }
        if event.timestamp == 0 {
            event.timestamp = now_millis();
        }

        let event = Arc::new(event);
        trace!(bus = %self.id, id = %event.id, kind = %event.kind, "emit");
        // No receivers is not an error: nobody is listening yet.
        let _ = self.tx.send(event.clone());
        event
    }

    fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription::new(self.tx.subscribe(), filter)
    }
}
