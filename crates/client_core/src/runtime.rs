use std::collections::VecDeque;

use serde_json::Value;

use crate::{
    bus::{Event, EventBus, Origin, Topic},
    options::PipeOptions,
    services::Services,
};

/// Follow-up work a pagelet asks of the page controller. Queued while the
/// pagelet is borrowed and run once the triggering operation returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Signal {
    Fired(Topic),
    /// Re-render the child whenever `parent` renders again.
    WatchParent { child_epoch: u64, parent: String },
}

/// Page state every pagelet operation needs next to the pagelet itself.
pub(crate) struct Runtime {
    pub options: PipeOptions,
    pub services: Services,
    pub bus: EventBus,
    /// Names of pagelets in the order of their first render.
    pub rendered: Vec<String>,
    pub signals: VecDeque<Signal>,
    next_epoch: u64,
}

impl Runtime {
    pub fn new(options: PipeOptions, services: Services) -> Self {
        Self {
            options,
            services,
            bus: EventBus::new(),
            rendered: Vec::new(),
            signals: VecDeque::new(),
            next_epoch: 0,
        }
    }

    pub fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    /// Raises a pagelet event on the page bus as `<parent>:<name>:<event>`
    /// and `<name>:<event>`.
    pub fn shout(&mut self, origin: &Origin, event: &str, args: &[Value]) {
        if let Some(parent) = &origin.parent {
            let topic = Topic::nested(parent, &origin.name, event);
            self.bus
                .emit(&Event::from_origin(topic, origin.clone(), args.to_vec()));
        }

        let topic = Topic::scoped(&origin.name, event);
        self.bus.emit(&Event::from_origin(
            topic.clone(),
            origin.clone(),
            args.to_vec(),
        ));
        self.signals.push_back(Signal::Fired(topic));
    }
}
