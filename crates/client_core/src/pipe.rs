//! Page controller: registry of live pagelets, arrival and completion
//! accounting, broadcast relay and connection announcements.

use std::collections::HashMap;

use serde_json::{json, Value};
use shared::{
    domain::{FragmentId, NodeId, ReadyState},
    protocol::{ArrivalData, PageMessage},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    bus::{is_fragment_event, is_page_event, Event, ListenerId, Topic},
    error::{AssetError, PipeError, TransportError},
    form::{FormSnapshot, SubmitOutcome},
    options::PipeOptions,
    pagelet::{Content, DestroyOptions, Fragment},
    pool::ReusePool,
    rpc::RpcCallback,
    runtime::{Runtime, Signal},
    services::{LoadTicket, Services},
};

/// Class carried by the document element while pagelets stream in.
pub const ROOT_LOADING_CLASS: &str = "pagelets-loading";

/// Classes the served markup sets for clients without scripting.
const NO_SCRIPT_CLASSES: [&str; 2] = ["no-js", "no_js"];

/// Extension run once against a freshly constructed page controller.
pub trait Plugin {
    fn configure(&self, pipe: &mut Pipe, options: &PipeOptions);
}

impl<F> Plugin for F
where
    F: Fn(&mut Pipe, &PipeOptions),
{
    fn configure(&self, pipe: &mut Pipe, options: &PipeOptions) {
        self(pipe, options)
    }
}

/// Page-level events mirrored to `subscribe_events` receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum PipeEvent {
    Arrive { name: String },
    Create { name: String, id: FragmentId },
    Progress { percent: u8, remaining: usize },
    Received,
    Finished,
    Remove { name: String },
    ReadyStateChanged(ReadyState),
}

/// Page reaction waiting on a pagelet topic.
#[derive(Debug, Clone)]
enum Hook {
    /// Create a child once its parent rendered.
    CreateChild { name: String, data: ArrivalData },
    CheckFinished,
    /// Re-attach the child after every parent render. Stays registered while
    /// the child's configuration is alive.
    RerenderChild { child_epoch: u64 },
    CountInitialized,
}

pub struct Pipe {
    rt: Runtime,
    fragments: Vec<Fragment>,
    pool: ReusePool<Fragment>,
    hooks: HashMap<Topic, Vec<Hook>>,
    expected: usize,
    allowed: usize,
    progress: u8,
    uninitialized: usize,
    ready_state: ReadyState,
    received: bool,
    finished: bool,
    destroyed: bool,
    events: broadcast::Sender<PipeEvent>,
}

impl Pipe {
    pub fn new(options: PipeOptions, services: Services) -> Self {
        Self::with_plugins(options, services, Vec::new())
    }

    /// Builds the controller, marks the document as loading and hands the
    /// page to every plugin in order.
    pub fn with_plugins(
        options: PipeOptions,
        services: Services,
        plugins: Vec<Box<dyn Plugin>>,
    ) -> Self {
        let (events, _) = broadcast::channel(options.events_capacity.max(1));
        let expected = options.expected_fragments;
        let pool = ReusePool::new(options.reuse_limit);
        info!(
            page = %options.page_id,
            expected,
            reuse_limit = options.reuse_limit,
            "pipe: page controller ready"
        );

        let mut pipe = Self {
            rt: Runtime::new(options, services),
            fragments: Vec::new(),
            pool,
            hooks: HashMap::new(),
            expected,
            allowed: expected,
            progress: 0,
            uninitialized: expected,
            ready_state: ReadyState::Loading,
            received: false,
            finished: false,
            destroyed: false,
            events,
        };

        let dom = &mut pipe.rt.services.dom;
        for class in NO_SCRIPT_CLASSES {
            dom.remove_root_class(class);
        }
        dom.add_root_class(ROOT_LOADING_CLASS);

        if !plugins.is_empty() {
            let options = pipe.rt.options.clone();
            debug!(plugins = plugins.len(), "pipe: configuring plugins");
            for plugin in &plugins {
                plugin.configure(&mut pipe, &options);
            }
        }
        pipe
    }

    pub fn options(&self) -> &PipeOptions {
        &self.rt.options
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn allowed(&self) -> usize {
        self.allowed
    }

    /// Pagelet names in the order of their first render.
    pub fn rendered(&self) -> &[String] {
        &self.rt.rendered
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    pub fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipeEvent> {
        self.events.subscribe()
    }

    /// Listens on a page topic; colon-delimited names address pagelet
    /// topics such as `header:render`.
    pub fn on<F>(&mut self, topic: &str, handler: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.rt.bus.on(Topic::parse(topic), handler)
    }

    pub fn once<F>(&mut self, topic: &str, handler: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.rt.bus.once(Topic::parse(topic), handler)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.rt.bus.off(id)
    }

    /// The server flushed pagelet `name`.
    pub fn arrive(&mut self, name: &str, data: ArrivalData) {
        if self.destroyed {
            warn!(pagelet = %name, "pipe: arrival after page teardown ignored");
            return;
        }

        let percent = if self.expected == 0 {
            100
        } else {
            let done = self.expected.saturating_sub(data.remaining) as f64;
            (done / self.expected as f64 * 100.0).round().min(100.0) as u8
        };
        self.progress = self.progress.max(percent);

        info!(
            pagelet = %name,
            remaining = data.remaining,
            remove = data.remove,
            "pipe: pagelet arrived"
        );
        self.emit_page(
            "arrive",
            vec![json!(name), serde_json::to_value(&data).unwrap_or_default()],
            PipeEvent::Arrive {
                name: name.to_string(),
            },
        );

        let remove = data.remove;
        let remaining = data.remaining;

        if !self.has(name) {
            self.hook(Topic::scoped(name, "initialized"), Hook::CountInitialized);

            match data.parent.clone().filter(|parent| !self.rt.options.is_root(parent)) {
                Some(parent) if !self.rt.rendered.contains(&parent) => {
                    debug!(pagelet = %name, %parent, "pipe: deferring child until its parent renders");
                    self.hook(
                        Topic::scoped(&parent, "render"),
                        Hook::CreateChild {
                            name: name.to_string(),
                            data,
                        },
                    );
                }
                Some(parent) => {
                    let roots = self.placeholders_of(&parent);
                    self.spawn(name, data, roots.as_deref());
                }
                None => self.spawn(name, data, None),
            }
        }

        if remove {
            self.allowed = self.allowed.saturating_sub(1);
            self.check_finished();
        } else {
            self.hook(Topic::scoped(name, "render"), Hook::CheckFinished);
        }

        if remaining == 0 && !self.received {
            self.received = true;
            self.rt.services.dom.remove_root_class(ROOT_LOADING_CLASS);
            self.set_ready_state(ReadyState::Interactive);
            self.emit_page("received", Vec::new(), PipeEvent::Received);
        }

        self.drain();
    }

    /// Allocates, registers and configures pagelet `name`.
    pub fn create(&mut self, name: &str, data: ArrivalData, roots: Option<&[NodeId]>) {
        if self.destroyed {
            return;
        }
        self.spawn(name, data, roots);
        self.drain();
    }

    fn spawn(&mut self, name: &str, data: ArrivalData, roots: Option<&[NodeId]>) {
        let remaining = data.remaining;
        let mut fragment = self.pool.acquire();
        let index = self.fragments.len();
        fragment.configure(name, data, roots, &mut self.rt);
        let id = fragment.id().clone();
        self.fragments.push(fragment);

        if self.fragments[index].is_destroyed() {
            let fragment = self.fragments.remove(index);
            self.pool.release(fragment);
        } else {
            debug!(pagelet = %name, %id, "pipe: pagelet created");
            self.emit_page(
                "create",
                vec![json!(name), json!(id)],
                PipeEvent::Create {
                    name: name.to_string(),
                    id,
                },
            );
        }

        let percent = self.progress;
        self.emit_page(
            "progress",
            vec![json!(percent), json!(remaining), json!(name)],
            PipeEvent::Progress { percent, remaining },
        );
    }

    pub fn has(&self, name: &str) -> bool {
        self.position(name, None).is_some()
    }

    /// Looks a pagelet up by name, optionally only below `parent`.
    pub fn get(&self, name: &str, parent: Option<&str>) -> Option<&Fragment> {
        self.position(name, parent).map(|index| &self.fragments[index])
    }

    pub fn get_mut(&mut self, name: &str, parent: Option<&str>) -> Option<&mut Fragment> {
        self.position(name, parent)
            .map(|index| &mut self.fragments[index])
    }

    /// Pagelet `sibling` as seen from pagelet `from`: a child of `from`
    /// when one exists, otherwise any pagelet of that name.
    pub fn pagelet(&self, from: &str, sibling: &str) -> Option<&Fragment> {
        self.get(sibling, Some(from))
            .or_else(|| self.get(sibling, None))
    }

    fn position(&self, name: &str, parent: Option<&str>) -> Option<usize> {
        self.fragments.iter().position(|fragment| {
            fragment.name() == name && parent.map_or(true, |parent| fragment.parent() == Some(parent))
        })
    }

    fn index_of(&self, name: &str) -> Result<usize, PipeError> {
        if self.destroyed {
            return Err(PipeError::Destroyed);
        }
        self.position(name, None)
            .ok_or_else(|| PipeError::UnknownFragment(name.to_string()))
    }

    fn placeholders_of(&self, name: &str) -> Option<Vec<NodeId>> {
        self.get(name, None)
            .map(|fragment| fragment.placeholders().to_vec())
    }

    /// Detaches and destroys pagelet `name`. False when it is not registered.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(index) = self.position(name, None) else {
            return false;
        };

        self.emit_page(
            "remove",
            vec![json!(name)],
            PipeEvent::Remove {
                name: name.to_string(),
            },
        );
        let mut fragment = self.fragments.remove(index);
        if fragment.destroy(DestroyOptions::default(), &mut self.rt) {
            self.pool.release(fragment);
        }
        self.drain();
        true
    }

    /// Whether user code may not broadcast `topic` on the page.
    pub fn reserved(&self, topic: &str) -> bool {
        let parsed = Topic::parse(topic);
        let head = parsed.scope().unwrap_or_else(|| parsed.event());
        self.has(head) || is_page_event(topic) || is_fragment_event(topic)
    }

    /// Delivers `topic` to every pagelet that does not reserve it. Returns
    /// how many pagelets it reached.
    pub fn broadcast(&mut self, topic: &str, args: Vec<Value>) -> usize {
        self.relay(&Topic::parse(topic), args)
    }

    fn relay(&mut self, topic: &Topic, args: Vec<Value>) -> usize {
        if topic.scope().is_some_and(|scope| self.has(scope)) {
            return 0;
        }
        let mut reached = 0;
        for fragment in &mut self.fragments {
            if fragment.reserved(topic) {
                continue;
            }
            fragment.emit_local(topic, args.clone());
            reached += 1;
        }
        reached
    }

    /// Completion of an asset requested with `ticket`. False when the
    /// configuration it belonged to is gone.
    pub fn asset_settled(
        &mut self,
        ticket: LoadTicket,
        url: &str,
        result: Result<(), AssetError>,
    ) -> bool {
        let Some(fragment) = self
            .fragments
            .iter_mut()
            .find(|fragment| fragment.epoch() == ticket.epoch)
        else {
            debug!(%url, epoch = ticket.epoch, "pipe: asset settled for a retired pagelet, ignored");
            return false;
        };
        let applied = fragment.asset_settled(url, result, &mut self.rt);
        self.drain();
        applied
    }

    /// Feeds a raw sub-channel message to pagelet `name`.
    pub fn deliver(&mut self, name: &str, raw: &Value) -> bool {
        let Some(index) = self.position(name, None) else {
            debug!(pagelet = %name, "pipe: sub-channel message for unknown pagelet");
            return false;
        };
        let handled = self.fragments[index].processor(raw, &mut self.rt);
        self.drain();
        handled
    }

    pub fn call(
        &mut self,
        name: &str,
        method: &str,
        args: Vec<Value>,
        callback: RpcCallback,
    ) -> Result<String, PipeError> {
        let index = self.index_of(name)?;
        let id = self.fragments[index].call(method, args, callback, &mut self.rt)?;
        self.drain();
        Ok(id)
    }

    /// A form below pagelet `name` was submitted.
    pub fn submit(&mut self, name: &str, form: &FormSnapshot) -> Result<SubmitOutcome, PipeError> {
        let index = self.index_of(name)?;
        let outcome = self.fragments[index].submit(form, &mut self.rt);
        self.drain();
        Ok(outcome)
    }

    pub fn render(&mut self, name: &str, content: Content) -> Result<bool, PipeError> {
        let index = self.index_of(name)?;
        let rendered = self.fragments[index].render(content, &mut self.rt);
        self.drain();
        Ok(rendered)
    }

    pub fn loading(&mut self, name: &str, unloading: bool) -> Result<(), PipeError> {
        let index = self.index_of(name)?;
        self.fragments[index].loading(unloading, &mut self.rt);
        self.drain();
        Ok(())
    }

    /// Registers the page on a fresh control channel.
    pub fn connected(&mut self) -> Result<(), TransportError> {
        let page = PageMessage::Page {
            id: self.rt.options.page_id.clone(),
        };
        self.rt.services.transport.write_page(&page)
    }

    /// Re-announces the page and every registered pagelet after the
    /// connection came back.
    pub fn reconnected(&mut self) -> Result<(), TransportError> {
        self.connected()?;
        for fragment in &self.fragments {
            let announcement = PageMessage::Pagelet {
                name: fragment.name().to_string(),
                id: fragment.id().clone(),
                parent: fragment.parent().map(str::to_string),
            };
            self.rt.services.transport.write_page(&announcement)?;
        }
        info!(
            page = %self.rt.options.page_id,
            pagelets = self.fragments.len(),
            "pipe: re-announced page after reconnect"
        );
        Ok(())
    }

    /// Tears the whole page down. Later arrivals are ignored.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        let names: Vec<String> = self
            .fragments
            .iter()
            .map(|fragment| fragment.name().to_string())
            .collect();
        for name in names {
            self.remove(&name);
        }

        self.hooks.clear();
        self.rt.signals.clear();
        self.rt.bus.remove_all_listeners();
        self.pool.clear();
        self.destroyed = true;
        info!(page = %self.rt.options.page_id, "pipe: page destroyed");
    }

    fn hook(&mut self, topic: Topic, hook: Hook) {
        self.hooks.entry(topic).or_default().push(hook);
    }

    /// Runs every page reaction queued by the last operation, including the
    /// ones those reactions queue in turn.
    fn drain(&mut self) {
        while let Some(signal) = self.rt.signals.pop_front() {
            match signal {
                Signal::WatchParent {
                    child_epoch,
                    parent,
                } => {
                    self.hook(
                        Topic::scoped(parent, "render"),
                        Hook::RerenderChild { child_epoch },
                    );
                }
                Signal::Fired(topic) => self.run_hooks(&topic),
            }
        }
    }

    fn run_hooks(&mut self, topic: &Topic) {
        let Some(hooks) = self.hooks.remove(topic) else {
            return;
        };

        let mut kept = Vec::new();
        for hook in hooks {
            if self.run_hook(topic, &hook) {
                kept.push(hook);
            }
        }

        if !kept.is_empty() {
            let slot = self.hooks.entry(topic.clone()).or_default();
            kept.append(slot);
            *slot = kept;
        }
    }

    /// Returns whether the hook stays registered for the next firing.
    fn run_hook(&mut self, topic: &Topic, hook: &Hook) -> bool {
        match hook {
            Hook::CreateChild { name, data } => {
                let Some(parent) = topic.scope() else {
                    return false;
                };
                if self.position(name, Some(parent)).is_some() {
                    return false;
                }
                let roots = self.placeholders_of(parent);
                debug!(pagelet = %name, %parent, "pipe: parent rendered, creating child");
                self.spawn(name, data.clone(), roots.as_deref());
                false
            }
            Hook::CheckFinished => {
                self.check_finished();
                false
            }
            Hook::RerenderChild { child_epoch } => {
                let Some(parent) = topic.scope() else {
                    return false;
                };
                let Some(roots) = self.placeholders_of(parent) else {
                    return false;
                };
                let Some(child) = self
                    .fragments
                    .iter_mut()
                    .find(|fragment| fragment.epoch() == *child_epoch)
                else {
                    return false;
                };
                child.relocate(&roots, &mut self.rt);
                true
            }
            Hook::CountInitialized => {
                self.uninitialized = self.uninitialized.saturating_sub(1);
                if self.uninitialized == 0 {
                    self.set_ready_state(ReadyState::Complete);
                }
                false
            }
        }
    }

    fn check_finished(&mut self) {
        if self.finished || self.rt.rendered.len() < self.allowed {
            return;
        }
        self.finished = true;
        info!(
            rendered = self.rt.rendered.len(),
            allowed = self.allowed,
            "pipe: every allowed pagelet rendered"
        );
        self.emit_page("finished", Vec::new(), PipeEvent::Finished);
        self.relay(&Topic::direct("finished"), Vec::new());
    }

    fn set_ready_state(&mut self, state: ReadyState) {
        if state <= self.ready_state {
            return;
        }
        self.ready_state = state;
        info!(%state, "pipe: ready state changed");
        self.emit_page(
            "readystatechange",
            vec![json!(state.to_string())],
            PipeEvent::ReadyStateChanged(state),
        );
    }

    fn emit_page(&mut self, event: &str, args: Vec<Value>, mirrored: PipeEvent) {
        self.rt.bus.emit(&Event::new(Topic::direct(event), args));
        let _ = self.events.send(mirrored);
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("page", &self.rt.options.page_id)
            .field("fragments", &self.fragments.len())
            .field("ready_state", &self.ready_state)
            .field("progress", &self.progress)
            .field("allowed", &self.allowed)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/pipe_tests.rs"]
mod tests;
