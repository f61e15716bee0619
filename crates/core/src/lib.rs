//! Manta core types: opaque cluster objects, event references, watch specs.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod expr;
pub mod object;
pub mod shutdown;

pub use object::Object;

/// The transition kinds delivered to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "add" => Ok(EventKind::Add),
            "update" => Ok(EventKind::Update),
            "delete" => Ok(EventKind::Delete),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// One registered watch: a resource kind scoped by namespace and selectors.
///
/// Assigned a stable integer index at registration; the index is the routing
/// key carried by every [`EventRef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub label_selector: String,
    pub field_selector: String,
    pub resync: Duration,
}

impl WatchSpec {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: String::new(),
            label_selector: String::new(),
            field_selector: String::new(),
            resync: Duration::ZERO,
        }
    }
}

/// Work-queue item: which watch, which object key, which transition.
///
/// Dedup in the queue is by value equality, so two updates for the same key
/// coalesce while queued.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventRef {
    pub watch_index: usize,
    pub key: String,
    pub kind: EventKind,
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}#{}", self.kind, self.watch_index, self.key)
    }
}

pub mod prelude {
    pub use super::{EventKind, EventRef, Object, WatchSpec};
}
