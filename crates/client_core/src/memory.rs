//! In-memory collaborators. Each is a cloneable handle over shared state so
//! the host keeps one clone for inspection after handing the other to the
//! page controller.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::{
    domain::{ChannelHandle, ContainerHandle, FragmentId, NodeId, RenderMode},
    protocol::{ChannelMessage, PageMessage},
};
use tracing::debug;

use crate::{
    error::{AssetError, TransportError},
    services::{AssetLoader, AssetPoll, Dom, LoadTicket, MountOptions, Sandbox, Transport},
};

fn guard<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
struct Node {
    parent: Option<NodeId>,
    attributes: HashMap<String, String>,
    html: String,
    comment: Option<String>,
    classes: Vec<String>,
    styles: HashMap<String, String>,
    mode: RenderMode,
    attached: bool,
    forms: Option<String>,
}

#[derive(Debug, Default)]
struct DomState {
    nodes: BTreeMap<NodeId, Node>,
    next_id: u64,
    mounts: usize,
    navigations: Vec<String>,
    root_classes: Vec<String>,
}

impl DomState {
    fn below(&self, node: NodeId, root: NodeId) -> bool {
        let mut cursor = self.nodes.get(&node).and_then(|n| n.parent);
        while let Some(current) = cursor {
            if current == root {
                return true;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent);
        }
        false
    }
}

/// Flat element tree. Node ids grow in insertion order, which doubles as
/// document order.
#[derive(Debug, Clone, Default)]
pub struct MemoryDom {
    state: Arc<Mutex<DomState>>,
}

impl MemoryDom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an element below `parent` (the document when `None`).
    pub fn insert(&self, parent: Option<NodeId>, attributes: &[(&str, &str)], html: &str) -> NodeId {
        let mut state = guard(&self.state);
        state.next_id += 1;
        let id = NodeId(state.next_id);
        state.nodes.insert(
            id,
            Node {
                parent,
                attributes: attributes
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
                html: html.to_string(),
                attached: true,
                ..Node::default()
            },
        );
        id
    }

    /// Adds an element whose first child is the comment `text`.
    pub fn insert_with_comment(
        &self,
        parent: Option<NodeId>,
        attributes: &[(&str, &str)],
        text: &str,
    ) -> NodeId {
        let id = self.insert(parent, attributes, "");
        if let Some(node) = guard(&self.state).nodes.get_mut(&id) {
            node.comment = Some(text.to_string());
        }
        id
    }

    pub fn html(&self, node: NodeId) -> Option<String> {
        guard(&self.state).nodes.get(&node).map(|n| n.html.clone())
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        guard(&self.state)
            .nodes
            .get(&node)
            .is_some_and(|n| n.classes.iter().any(|c| c == class))
    }

    pub fn style(&self, node: NodeId, property: &str) -> Option<String> {
        guard(&self.state)
            .nodes
            .get(&node)
            .and_then(|n| n.styles.get(property).cloned())
    }

    pub fn mode(&self, node: NodeId) -> Option<RenderMode> {
        guard(&self.state).nodes.get(&node).map(|n| n.mode)
    }

    pub fn is_attached(&self, node: NodeId) -> bool {
        guard(&self.state)
            .nodes
            .get(&node)
            .is_some_and(|n| n.attached)
    }

    /// Pagelet the node's forms are routed to, if intercepted.
    pub fn intercepted(&self, node: NodeId) -> Option<String> {
        guard(&self.state)
            .nodes
            .get(&node)
            .and_then(|n| n.forms.clone())
    }

    pub fn mounts(&self) -> usize {
        guard(&self.state).mounts
    }

    pub fn navigations(&self) -> Vec<String> {
        guard(&self.state).navigations.clone()
    }

    /// Seeds the document element's class list, as the served markup would.
    pub fn set_root_classes(&self, classes: &[&str]) {
        guard(&self.state).root_classes = classes.iter().map(|c| c.to_string()).collect();
    }

    pub fn root_classes(&self) -> Vec<String> {
        guard(&self.state).root_classes.clone()
    }

    /// Attached elements with their markup, in document order.
    pub fn snapshot(&self) -> Vec<(NodeId, String)> {
        guard(&self.state)
            .nodes
            .iter()
            .filter(|(_, node)| node.attached)
            .map(|(id, node)| (*id, node.html.clone()))
            .collect()
    }
}

impl Dom for MemoryDom {
    fn locate(&self, attribute: &str, value: &str, roots: Option<&[NodeId]>) -> Vec<NodeId> {
        let state = guard(&self.state);
        state
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.attached && node.attributes.get(attribute).map(String::as_str) == Some(value)
            })
            .filter(|(id, _)| {
                roots.map_or(true, |roots| roots.iter().any(|root| state.below(**id, *root)))
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn inner_html(&self, node: NodeId) -> String {
        self.html(node).unwrap_or_default()
    }

    fn leading_comment(&self, node: NodeId) -> Option<String> {
        guard(&self.state)
            .nodes
            .get(&node)
            .and_then(|n| n.comment.clone())
    }

    fn mount(&mut self, node: NodeId, markup: &str, options: MountOptions) {
        let mut state = guard(&self.state);
        state.mounts += 1;
        if let Some(target) = state.nodes.get_mut(&node) {
            if options.append {
                target.html.push_str(markup);
            } else {
                target.html = markup.to_string();
            }
            target.mode = options.mode;
        }
    }

    fn clear(&mut self, node: NodeId) {
        if let Some(target) = guard(&self.state).nodes.get_mut(&node) {
            target.html.clear();
        }
    }

    fn detach(&mut self, node: NodeId) {
        if let Some(target) = guard(&self.state).nodes.get_mut(&node) {
            target.attached = false;
        }
    }

    fn add_class(&mut self, node: NodeId, class: &str) {
        if let Some(target) = guard(&self.state).nodes.get_mut(&node) {
            if !target.classes.iter().any(|c| c == class) {
                target.classes.push(class.to_string());
            }
        }
    }

    fn remove_class(&mut self, node: NodeId, class: &str) {
        if let Some(target) = guard(&self.state).nodes.get_mut(&node) {
            target.classes.retain(|c| c != class);
        }
    }

    fn add_root_class(&mut self, class: &str) {
        let mut state = guard(&self.state);
        if !state.root_classes.iter().any(|c| c == class) {
            state.root_classes.push(class.to_string());
        }
    }

    fn remove_root_class(&mut self, class: &str) {
        guard(&self.state).root_classes.retain(|c| c != class);
    }

    fn set_style(&mut self, node: NodeId, property: &str, value: &str) {
        if let Some(target) = guard(&self.state).nodes.get_mut(&node) {
            if value.is_empty() {
                target.styles.remove(property);
            } else {
                target.styles.insert(property.to_string(), value.to_string());
            }
        }
    }

    fn intercept_forms(&mut self, node: NodeId, fragment: &str) {
        if let Some(target) = guard(&self.state).nodes.get_mut(&node) {
            target.forms = Some(fragment.to_string());
        }
    }

    fn release_forms(&mut self, node: NodeId) {
        if let Some(target) = guard(&self.state).nodes.get_mut(&node) {
            target.forms = None;
        }
    }

    fn navigate(&mut self, url: &str) {
        guard(&self.state).navigations.push(url.to_string());
    }
}

#[derive(Debug, Default)]
struct AssetState {
    deferred: bool,
    failing: HashMap<String, String>,
    requests: Vec<(String, LoadTicket, Duration)>,
    pending: Vec<(String, LoadTicket)>,
    released: Vec<String>,
}

/// Asset loader that succeeds immediately unless told to defer or fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssets {
    state: Arc<Mutex<AssetState>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acquisition stays pending until settled by the host.
    pub fn deferred() -> Self {
        let assets = Self::default();
        guard(&assets.state).deferred = true;
        assets
    }

    pub fn fail(&self, url: &str, reason: &str) {
        guard(&self.state)
            .failing
            .insert(url.to_string(), reason.to_string());
    }

    pub fn requested(&self) -> Vec<String> {
        guard(&self.state)
            .requests
            .iter()
            .map(|(url, _, _)| url.clone())
            .collect()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        guard(&self.state)
            .requests
            .iter()
            .map(|(_, _, timeout)| *timeout)
            .collect()
    }

    /// Pending acquisitions, removed from the loader.
    pub fn take_pending(&self) -> Vec<(String, LoadTicket)> {
        std::mem::take(&mut guard(&self.state).pending)
    }

    pub fn released(&self) -> Vec<String> {
        guard(&self.state).released.clone()
    }
}

impl AssetLoader for MemoryAssets {
    fn acquire(&mut self, url: &str, ticket: LoadTicket, timeout: Duration) -> AssetPoll {
        let mut state = guard(&self.state);
        state.requests.push((url.to_string(), ticket, timeout));

        if let Some(reason) = state.failing.get(url) {
            return AssetPoll::Ready(Err(AssetError::Failed {
                url: url.to_string(),
                reason: reason.clone(),
            }));
        }
        if state.deferred {
            state.pending.push((url.to_string(), ticket));
            return AssetPoll::Pending;
        }
        AssetPoll::Ready(Ok(()))
    }

    fn release(&mut self, url: &str) {
        guard(&self.state).released.push(url.to_string());
    }
}

#[derive(Debug, Default)]
struct SandboxState {
    next_id: u64,
    live: HashSet<ContainerHandle>,
    executed: Vec<(ContainerHandle, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySandbox {
    state: Arc<Mutex<SandboxState>>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> usize {
        guard(&self.state).live.len()
    }

    pub fn executed(&self) -> Vec<String> {
        guard(&self.state)
            .executed
            .iter()
            .map(|(_, code)| code.clone())
            .collect()
    }
}

impl Sandbox for MemorySandbox {
    fn create_container(&mut self) -> ContainerHandle {
        let mut state = guard(&self.state);
        state.next_id += 1;
        let handle = ContainerHandle(state.next_id);
        state.live.insert(handle);
        handle
    }

    fn run(&mut self, container: ContainerHandle, code: &str) {
        guard(&self.state)
            .executed
            .push((container, code.to_string()));
    }

    fn destroy_container(&mut self, container: ContainerHandle) {
        guard(&self.state).live.remove(&container);
    }
}

#[derive(Debug, Clone)]
struct Channel {
    name: String,
    id: FragmentId,
    open: bool,
}

#[derive(Debug, Default)]
struct TransportState {
    offline: bool,
    next_id: u64,
    channels: BTreeMap<ChannelHandle, Channel>,
    page: Vec<PageMessage>,
    written: Vec<(ChannelHandle, ChannelMessage)>,
}

/// Records every message instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every open or write fails.
    pub fn set_offline(&self, offline: bool) {
        guard(&self.state).offline = offline;
    }

    pub fn page_messages(&self) -> Vec<PageMessage> {
        guard(&self.state).page.clone()
    }

    /// Messages written on the sub-channels of pagelet `name`.
    pub fn written(&self, name: &str) -> Vec<ChannelMessage> {
        let state = guard(&self.state);
        state
            .written
            .iter()
            .filter(|(handle, _)| state.channels.get(handle).is_some_and(|c| c.name == name))
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn is_open(&self, name: &str) -> bool {
        guard(&self.state)
            .channels
            .values()
            .any(|channel| channel.open && channel.name == name)
    }

    pub fn open_channels(&self) -> usize {
        guard(&self.state)
            .channels
            .values()
            .filter(|channel| channel.open)
            .count()
    }

    pub fn channel_id(&self, name: &str) -> Option<FragmentId> {
        guard(&self.state)
            .channels
            .values()
            .find(|channel| channel.open && channel.name == name)
            .map(|channel| channel.id.clone())
    }
}

impl Transport for MemoryTransport {
    fn write_page(&mut self, message: &PageMessage) -> Result<(), TransportError> {
        let mut state = guard(&self.state);
        if state.offline {
            return Err(TransportError::Unavailable);
        }
        state.page.push(message.clone());
        Ok(())
    }

    fn open_channel(&mut self, name: &str, id: &FragmentId) -> Result<ChannelHandle, TransportError> {
        let mut state = guard(&self.state);
        if state.offline {
            return Err(TransportError::Unavailable);
        }
        state.next_id += 1;
        let handle = ChannelHandle(state.next_id);
        state.channels.insert(
            handle,
            Channel {
                name: name.to_string(),
                id: id.clone(),
                open: true,
            },
        );
        debug!(%handle, pagelet = %name, "transport: sub-channel opened");
        Ok(handle)
    }

    fn write(
        &mut self,
        channel: ChannelHandle,
        message: &ChannelMessage,
    ) -> Result<(), TransportError> {
        let mut state = guard(&self.state);
        if state.offline {
            return Err(TransportError::Write("transport is offline".into()));
        }
        match state.channels.get(&channel) {
            Some(open) if open.open => {}
            _ => return Err(TransportError::Closed(channel.0)),
        }
        state.written.push((channel, message.clone()));
        Ok(())
    }

    fn close_channel(&mut self, channel: ChannelHandle) {
        if let Some(open) = guard(&self.state).channels.get_mut(&channel) {
            open.open = false;
        }
    }
}
