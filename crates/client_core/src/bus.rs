//! Topic-keyed listener table shared by the page controller and every pagelet.
//!
//! Topics are structured rather than colon-joined strings so a pagelet name
//! containing `:` can never be mistaken for a namespaced control topic. The
//! colon form only exists for display and for parsing host-supplied names.

use std::{collections::HashMap, fmt};

use serde_json::Value;
use shared::domain::FragmentId;

/// Page-level control events. User code may not emit these.
pub const PAGE_EVENTS: [&str; 5] = ["remove", "received", "finished", "progress", "create"];

/// Pagelet lifecycle events. A page broadcast never reaches a pagelet under
/// one of these names.
pub const FRAGMENT_EVENTS: [&str; 8] = [
    "configured",
    "error",
    "loaded",
    "submit",
    "initialize",
    "initialized",
    "render",
    "destroy",
];

pub fn is_page_event(event: &str) -> bool {
    PAGE_EVENTS.contains(&event)
}

pub fn is_fragment_event(event: &str) -> bool {
    FRAGMENT_EVENTS.contains(&event)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Un-namespaced topic, e.g. `received` or a user event.
    Direct(String),
    /// `<pagelet>:<event>`.
    Scoped { scope: String, event: String },
    /// `<parent>:<pagelet>:<event>`.
    Nested {
        parent: String,
        scope: String,
        event: String,
    },
}

impl Topic {
    pub fn direct(event: impl Into<String>) -> Self {
        Self::Direct(event.into())
    }

    pub fn scoped(scope: impl Into<String>, event: impl Into<String>) -> Self {
        Self::Scoped {
            scope: scope.into(),
            event: event.into(),
        }
    }

    pub fn nested(
        parent: impl Into<String>,
        scope: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self::Nested {
            parent: parent.into(),
            scope: scope.into(),
            event: event.into(),
        }
    }

    /// Splits a colon-delimited name coming from outside the crate.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(scope), Some(event), None) => Self::scoped(scope, event),
            (Some(parent), Some(scope), Some(event)) => Self::nested(parent, scope, event),
            _ => Self::direct(raw),
        }
    }

    pub fn event(&self) -> &str {
        match self {
            Self::Direct(event) | Self::Scoped { event, .. } | Self::Nested { event, .. } => event,
        }
    }

    /// First colon-delimited segment of a namespaced topic.
    pub fn scope(&self) -> Option<&str> {
        match self {
            Self::Direct(_) => None,
            Self::Scoped { scope, .. } => Some(scope),
            Self::Nested { parent, .. } => Some(parent),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(event) => f.write_str(event),
            Self::Scoped { scope, event } => write!(f, "{scope}:{event}"),
            Self::Nested {
                parent,
                scope,
                event,
            } => write!(f, "{parent}:{scope}:{event}"),
        }
    }
}

/// The pagelet an event was raised by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub name: String,
    pub id: FragmentId,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: Topic,
    pub origin: Option<Origin>,
    pub args: Vec<Value>,
}

impl Event {
    pub fn new(topic: Topic, args: Vec<Value>) -> Self {
        Self {
            topic,
            origin: None,
            args,
        }
    }

    pub fn from_origin(topic: Topic, origin: Origin, args: Vec<Value>) -> Self {
        Self {
            topic,
            origin: Some(origin),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Handler = Box<dyn FnMut(&Event) + Send>;

struct Listener {
    id: ListenerId,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<Topic, Vec<Listener>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, topic: Topic, handler: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.insert(topic, false, Box::new(handler))
    }

    pub fn once<F>(&mut self, topic: Topic, handler: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.insert(topic, true, Box::new(handler))
    }

    fn insert(&mut self, topic: Topic, once: bool, handler: Handler) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.entry(topic).or_default().push(Listener {
            id,
            once,
            handler,
        });
        id
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        let mut removed = false;
        self.listeners.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|listener| listener.id != id);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }

    /// Calls every listener of `event.topic` in registration order and drops
    /// the `once` listeners afterwards. Returns whether anyone was listening.
    pub fn emit(&mut self, event: &Event) -> bool {
        let Some(listeners) = self.listeners.get_mut(&event.topic) else {
            return false;
        };
        if listeners.is_empty() {
            return false;
        }

        listeners.retain_mut(|listener| {
            (listener.handler)(event);
            !listener.once
        });
        if listeners.is_empty() {
            self.listeners.remove(&event.topic);
        }
        true
    }

    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.listeners.get(topic).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn remove_all_listeners(&mut self) {
        self.listeners.clear();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut topics = f.debug_map();
        for (topic, listeners) in &self.listeners {
            topics.entry(&topic.to_string(), &listeners.len());
        }
        topics.finish()
    }
}

#[cfg(test)]
#[path = "tests/bus_tests.rs"]
mod tests;
