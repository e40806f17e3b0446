//! Collaborators the page controller drives but does not implement: the
//! host document, asset loading, the client-code sandbox, the real-time
//! transport and the template registry.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde_json::Value;
use shared::{
    domain::{ChannelHandle, ContainerHandle, FragmentId, NodeId, RenderMode},
    protocol::{ChannelMessage, PageMessage},
};
use tracing::warn;

use crate::error::{AssetError, TemplateError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountOptions {
    /// Keep the existing children and add the new markup after them.
    pub append: bool,
    pub mode: RenderMode,
}

pub trait Dom: Send {
    /// Elements whose `attribute` equals `value`, searched below every root
    /// (the whole document when `roots` is `None`), in document order.
    fn locate(&self, attribute: &str, value: &str, roots: Option<&[NodeId]>) -> Vec<NodeId>;
    fn inner_html(&self, node: NodeId) -> String;
    /// Text of the node's first child when that child is a comment.
    fn leading_comment(&self, node: NodeId) -> Option<String>;
    fn mount(&mut self, node: NodeId, markup: &str, options: MountOptions);
    fn clear(&mut self, node: NodeId);
    fn detach(&mut self, node: NodeId);
    fn add_class(&mut self, node: NodeId, class: &str);
    fn remove_class(&mut self, node: NodeId, class: &str);
    fn set_style(&mut self, node: NodeId, property: &str, value: &str);
    /// Class list of the document element.
    fn add_root_class(&mut self, class: &str);
    fn remove_root_class(&mut self, class: &str);
    /// Route submit events of forms below `node` to the named pagelet.
    fn intercept_forms(&mut self, node: NodeId, fragment: &str);
    fn release_forms(&mut self, node: NodeId);
    fn navigate(&mut self, url: &str);
}

/// Identifies one asset batch of one pagelet configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadTicket {
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetPoll {
    Ready(Result<(), AssetError>),
    /// Completion is reported later through `Pipe::asset_settled`.
    Pending,
}

pub trait AssetLoader: Send {
    fn acquire(&mut self, url: &str, ticket: LoadTicket, timeout: Duration) -> AssetPoll;
    fn release(&mut self, url: &str);
}

pub trait Sandbox: Send {
    fn create_container(&mut self) -> ContainerHandle;
    fn run(&mut self, container: ContainerHandle, code: &str);
    fn destroy_container(&mut self, container: ContainerHandle);
}

pub trait Transport: Send {
    fn write_page(&mut self, message: &PageMessage) -> Result<(), TransportError>;
    fn open_channel(&mut self, name: &str, id: &FragmentId) -> Result<ChannelHandle, TransportError>;
    fn write(
        &mut self,
        channel: ChannelHandle,
        message: &ChannelMessage,
    ) -> Result<(), TransportError>;
    fn close_channel(&mut self, channel: ChannelHandle);
}

pub type Renderer = Arc<dyn Fn(&Value) -> Result<String, TemplateError> + Send + Sync>;

pub trait Templates: Send {
    fn resolve(&self, key: &str) -> Option<Renderer>;
}

/// Compiled client templates keyed by the hash the server ships.
#[derive(Default, Clone)]
pub struct TemplateStore {
    renderers: HashMap<String, Renderer>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<String>, renderer: F)
    where
        F: Fn(&Value) -> Result<String, TemplateError> + Send + Sync + 'static,
    {
        self.renderers.insert(key.into(), Arc::new(renderer));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.renderers.contains_key(key)
    }
}

impl Templates for TemplateStore {
    fn resolve(&self, key: &str) -> Option<Renderer> {
        self.renderers.get(key).cloned()
    }
}

impl fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.renderers.keys()).finish()
    }
}

pub struct MissingDom;

impl Dom for MissingDom {
    fn locate(&self, _attribute: &str, _value: &str, _roots: Option<&[NodeId]>) -> Vec<NodeId> {
        Vec::new()
    }

    fn inner_html(&self, _node: NodeId) -> String {
        String::new()
    }

    fn leading_comment(&self, _node: NodeId) -> Option<String> {
        None
    }

    fn mount(&mut self, _node: NodeId, _markup: &str, _options: MountOptions) {}

    fn clear(&mut self, _node: NodeId) {}

    fn detach(&mut self, _node: NodeId) {}

    fn add_class(&mut self, _node: NodeId, _class: &str) {}

    fn remove_class(&mut self, _node: NodeId, _class: &str) {}

    fn set_style(&mut self, _node: NodeId, _property: &str, _value: &str) {}

    fn add_root_class(&mut self, _class: &str) {}

    fn remove_root_class(&mut self, _class: &str) {}

    fn intercept_forms(&mut self, _node: NodeId, _fragment: &str) {}

    fn release_forms(&mut self, _node: NodeId) {}

    fn navigate(&mut self, url: &str) {
        warn!(%url, "dom: no document attached, ignoring navigation");
    }
}

pub struct MissingAssetLoader;

impl AssetLoader for MissingAssetLoader {
    fn acquire(&mut self, url: &str, _ticket: LoadTicket, _timeout: Duration) -> AssetPoll {
        AssetPoll::Ready(Err(AssetError::Failed {
            url: url.to_string(),
            reason: "asset loader is unavailable".to_string(),
        }))
    }

    fn release(&mut self, _url: &str) {}
}

pub struct MissingSandbox;

impl Sandbox for MissingSandbox {
    fn create_container(&mut self) -> ContainerHandle {
        ContainerHandle(0)
    }

    fn run(&mut self, container: ContainerHandle, _code: &str) {
        warn!(%container, "sandbox: unavailable, client code not executed");
    }

    fn destroy_container(&mut self, _container: ContainerHandle) {}
}

pub struct MissingTransport;

impl Transport for MissingTransport {
    fn write_page(&mut self, _message: &PageMessage) -> Result<(), TransportError> {
        Err(TransportError::Unavailable)
    }

    fn open_channel(
        &mut self,
        _name: &str,
        _id: &FragmentId,
    ) -> Result<ChannelHandle, TransportError> {
        Err(TransportError::Unavailable)
    }

    fn write(
        &mut self,
        _channel: ChannelHandle,
        _message: &ChannelMessage,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unavailable)
    }

    fn close_channel(&mut self, _channel: ChannelHandle) {}
}

/// Everything a pagelet talks to, owned once by the page controller.
pub struct Services {
    pub dom: Box<dyn Dom>,
    pub assets: Box<dyn AssetLoader>,
    pub sandbox: Box<dyn Sandbox>,
    pub transport: Box<dyn Transport>,
    pub templates: Box<dyn Templates>,
}

impl Services {
    pub fn missing() -> Self {
        Self {
            dom: Box::new(MissingDom),
            assets: Box::new(MissingAssetLoader),
            sandbox: Box::new(MissingSandbox),
            transport: Box::new(MissingTransport),
            templates: Box::new(TemplateStore::new()),
        }
    }

    pub fn with_dom(mut self, dom: impl Dom + 'static) -> Self {
        self.dom = Box::new(dom);
        self
    }

    pub fn with_assets(mut self, assets: impl AssetLoader + 'static) -> Self {
        self.assets = Box::new(assets);
        self
    }

    pub fn with_sandbox(mut self, sandbox: impl Sandbox + 'static) -> Self {
        self.sandbox = Box::new(sandbox);
        self
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Box::new(transport);
        self
    }

    pub fn with_templates(mut self, templates: impl Templates + 'static) -> Self {
        self.templates = Box::new(templates);
        self
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::missing()
    }
}
