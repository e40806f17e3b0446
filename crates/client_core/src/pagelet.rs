//! One server-pushed content unit of the page.
//!
//! A pagelet moves through `Allocated -> Configuring -> Ready -> Active ->
//! Destroying -> Pooled`. Every lifecycle step is broadcast locally and on
//! the page bus; page-level reactions (deferred children, completion
//! accounting) are queued on the runtime and handled by the controller.

use std::{fmt, sync::Arc, time::Duration};

use serde_json::{json, Map, Value};
use shared::{
    domain::{ChannelHandle, ContainerHandle, FragmentId, NodeId, RenderMode},
    error::RemoteError,
    protocol::{ArrivalData, ChannelMessage, TemplateHashes},
};
use tracing::{debug, info, warn};

use crate::{
    bus::{is_fragment_event, is_page_event, Event, EventBus, ListenerId, Origin, Topic},
    error::{AssetError, FragmentError},
    form::{self, FormSnapshot, SubmitOutcome},
    merge::merge_layers,
    pool::Reusable,
    rpc::{RpcCallback, RpcTable},
    runtime::{Runtime, Signal},
    services::{AssetPoll, LoadTicket, MountOptions, Renderer},
};

/// Attribute marking the containers a pagelet renders into.
pub const PLACEHOLDER_ATTRIBUTE: &str = "data-pagelet";
/// Attribute of the container holding the server-rendered initial view.
pub const VIEW_ATTRIBUTE: &str = "data-pagelet-fragment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentState {
    #[default]
    Allocated,
    Configuring,
    Ready,
    Active,
    Destroying,
    Pooled,
}

/// What a pagelet shows while (re)loading.
#[derive(Clone)]
pub enum Loader {
    Markup(String),
    Producer(Arc<dyn Fn() -> String + Send + Sync>),
}

impl Loader {
    fn produce(&self) -> String {
        match self {
            Self::Markup(markup) => markup.clone(),
            Self::Producer(producer) => producer(),
        }
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Markup(markup) => f.debug_tuple("Markup").field(markup).finish(),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

/// Input of a render pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Content {
    /// Nothing supplied; the stored template state is rendered if possible.
    #[default]
    Empty,
    Markup(String),
    /// Data for the client template.
    Data(Value),
    Error(RemoteError),
}

impl Content {
    /// Interprets a view delivered over the sub-channel.
    pub fn from_view(view: Value) -> Self {
        match view {
            Value::Null => Self::Empty,
            Value::String(markup) => Self::Markup(markup),
            other => Self::Data(other),
        }
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Self::Markup(value.to_string())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Self::Markup(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Detach the placeholder nodes instead of emptying them.
    pub remove: bool,
    pub release_assets: bool,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self {
            remove: false,
            release_assets: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateKind {
    Client,
    Error,
}

#[derive(Debug, Default)]
pub struct Fragment {
    name: String,
    id: FragmentId,
    parent: Option<String>,
    epoch: u64,
    state: FragmentState,
    placeholders: Vec<NodeId>,
    mode: RenderMode,
    append: bool,
    loader: Option<Loader>,
    css: Vec<String>,
    js: Vec<String>,
    timeout: Duration,
    hash: TemplateHashes,
    run: Option<String>,
    template_state: Option<Value>,
    streaming: bool,
    rpc: RpcTable,
    events: EventBus,
    channel: Option<ChannelHandle>,
    container: Option<ContainerHandle>,
    outstanding: Option<usize>,
    assets_requested: bool,
    load_error: Option<AssetError>,
    rendered: bool,
    initialized: bool,
    destroyed: bool,
}

impl Fragment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &FragmentId {
        &self.id
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn state(&self) -> FragmentState {
        self.state
    }

    pub fn placeholders(&self) -> &[NodeId] {
        &self.placeholders
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn loader(&self) -> Option<&Loader> {
        self.loader.as_ref()
    }

    pub fn set_loader(&mut self, loader: Loader) {
        self.loader = Some(loader);
    }

    pub fn css(&self) -> &[String] {
        &self.css
    }

    pub fn js(&self) -> &[String] {
        &self.js
    }

    pub fn streaming(&self) -> bool {
        self.streaming
    }

    pub fn template_state(&self) -> Option<&Value> {
        self.template_state.as_ref()
    }

    pub fn rpc_methods(&self) -> &[String] {
        self.rpc.methods()
    }

    pub fn pending_calls(&self) -> usize {
        self.rpc.pending()
    }

    pub fn channel(&self) -> Option<ChannelHandle> {
        self.channel
    }

    pub fn container(&self) -> Option<ContainerHandle> {
        self.container
    }

    pub fn load_error(&self) -> Option<&AssetError> {
        self.load_error.as_ref()
    }

    pub fn is_rendered(&self) -> bool {
        self.rendered
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Ticket of the asset batch of the current configuration.
    pub fn ticket(&self) -> LoadTicket {
        LoadTicket { epoch: self.epoch }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn origin(&self) -> Origin {
        Origin {
            name: self.name.clone(),
            id: self.id.clone(),
            parent: self.parent.clone(),
        }
    }

    pub fn on<F>(&mut self, event: &str, handler: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.events.on(Topic::parse(event), handler)
    }

    pub fn once<F>(&mut self, event: &str, handler: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.events.once(Topic::parse(event), handler)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Whether a page broadcast of `topic` must not reach this pagelet:
    /// lifecycle names and topics namespaced under this pagelet. Topics of
    /// other registered pagelets are refused by the page controller.
    pub fn reserved(&self, topic: &Topic) -> bool {
        match topic.scope() {
            None => is_fragment_event(topic.event()),
            Some(scope) => scope == self.name,
        }
    }

    /// Delivers a page broadcast to the local listeners only.
    pub(crate) fn emit_local(&mut self, topic: &Topic, args: Vec<Value>) -> bool {
        self.events.emit(&Event::new(topic.clone(), args))
    }

    fn broadcast(&mut self, event: &str, args: Vec<Value>, rt: &mut Runtime) {
        let origin = self.origin();
        self.events.emit(&Event::from_origin(
            Topic::direct(event),
            origin.clone(),
            args.clone(),
        ));
        rt.shout(&origin, event, &args);
    }

    pub(crate) fn configure(
        &mut self,
        name: &str,
        data: ArrivalData,
        roots: Option<&[NodeId]>,
        rt: &mut Runtime,
    ) {
        self.epoch = rt.next_epoch();
        self.state = FragmentState::Configuring;
        self.name = name.to_string();
        self.id = data.id;
        self.parent = data.parent.filter(|parent| !rt.options.is_root(parent));
        self.timeout = data
            .timeout
            .map(Duration::from_millis)
            .unwrap_or_else(|| rt.options.asset_timeout());
        self.css = data.css;
        self.js = data.js;
        self.append = data.append;
        self.mode = data.mode;
        self.hash = data.hash;
        self.run = data.run;
        self.template_state = data.state;
        self.streaming = data.streaming;
        self.loader = data.loader.filter(|l| !l.is_empty()).map(Loader::Markup);
        self.placeholders = rt
            .services
            .dom
            .locate(PLACEHOLDER_ATTRIBUTE, name, roots);

        if data.remove {
            info!(
                pagelet = %self.name,
                "pagelet: cancelled by the server before activation"
            );
            self.destroy(
                DestroyOptions {
                    remove: true,
                    release_assets: false,
                },
                rt,
            );
            return;
        }

        // Must run before the first render replaces the placeholder content.
        if self.loader.is_none() {
            self.loader = self
                .placeholders
                .iter()
                .map(|node| rt.services.dom.inner_html(*node).trim().to_string())
                .find(|html| !html.is_empty())
                .map(Loader::Markup);
        }

        self.rpc.declare(&self.name, &data.rpc);
        if self.run.is_some() {
            self.container = Some(rt.services.sandbox.create_container());
        }

        debug!(
            pagelet = %self.name,
            placeholders = self.placeholders.len(),
            assets = self.css.len() + self.js.len(),
            "pagelet: configured"
        );
        self.broadcast("configured", vec![json!({ "id": self.id, "parent": self.parent })], rt);
        self.load_assets(rt);
    }

    fn load_assets(&mut self, rt: &mut Runtime) {
        let urls: Vec<String> = self.css.iter().chain(&self.js).cloned().collect();
        if urls.is_empty() {
            self.assets_loaded(rt);
            return;
        }

        self.assets_requested = true;
        self.outstanding = Some(urls.len());
        let ticket = self.ticket();
        for url in urls {
            if self.outstanding.is_none() || self.destroyed {
                break;
            }
            match rt.services.assets.acquire(&url, ticket, self.timeout) {
                AssetPoll::Ready(result) => {
                    self.asset_settled(&url, result, rt);
                }
                AssetPoll::Pending => {}
            }
        }
    }

    /// Records the outcome of one asset of the current batch. The first
    /// failure settles the whole batch; later outcomes are ignored.
    pub(crate) fn asset_settled(
        &mut self,
        url: &str,
        result: Result<(), AssetError>,
        rt: &mut Runtime,
    ) -> bool {
        if self.destroyed {
            debug!(pagelet = %self.name, %url, "pagelet: asset settled after destroy, ignored");
            return false;
        }
        let Some(outstanding) = self.outstanding.as_mut() else {
            return false;
        };

        match result {
            Err(error) => {
                self.outstanding = None;
                self.assets_failed(error, rt);
            }
            Ok(()) => {
                *outstanding = outstanding.saturating_sub(1);
                if *outstanding == 0 {
                    self.outstanding = None;
                    self.assets_loaded(rt);
                }
            }
        }
        true
    }

    fn assets_failed(&mut self, error: AssetError, rt: &mut Runtime) {
        warn!(pagelet = %self.name, %error, "pagelet: asset loading failed");
        self.state = FragmentState::Ready;
        self.load_error = Some(error.clone());
        self.broadcast("error", vec![json!(error.to_string())], rt);
        self.render(Content::Error(RemoteError::new(error.to_string())), rt);
        self.mark_initialized(rt);
    }

    fn assets_loaded(&mut self, rt: &mut Runtime) {
        self.state = FragmentState::Ready;
        self.broadcast("loaded", Vec::new(), rt);

        let view = self.parse(rt).map_or(Content::Empty, Content::Markup);
        self.render(view, rt);

        // A parent re-render replaces our placeholders; follow it.
        if let Some(parent) = self.parent.clone() {
            rt.signals.push_back(Signal::WatchParent {
                child_epoch: self.epoch,
                parent,
            });
        }

        self.initialize(rt);
    }

    fn initialize(&mut self, rt: &mut Runtime) {
        self.state = FragmentState::Active;
        self.broadcast("initialize", Vec::new(), rt);
        self.mark_initialized(rt);

        match rt.services.transport.open_channel(&self.name, &self.id) {
            Ok(channel) => self.channel = Some(channel),
            Err(error) => {
                debug!(pagelet = %self.name, %error, "pagelet: sub-channel not opened");
            }
        }

        for node in &self.placeholders {
            rt.services.dom.intercept_forms(*node, &self.name);
        }

        if let (Some(code), Some(container)) = (&self.run, self.container) {
            rt.services.sandbox.run(container, code);
        }
    }

    fn mark_initialized(&mut self, rt: &mut Runtime) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        self.broadcast("initialized", Vec::new(), rt);
    }

    fn template(&self, kind: TemplateKind, rt: &Runtime) -> Option<Renderer> {
        let key = match kind {
            TemplateKind::Client => self.hash.client.as_deref()?,
            TemplateKind::Error => self.hash.error.as_deref().unwrap_or("error"),
        };
        rt.services.templates.resolve(key)
    }

    /// Server-rendered initial view shipped as a comment inside the
    /// `data-pagelet-fragment` container.
    pub(crate) fn parse(&self, rt: &Runtime) -> Option<String> {
        let dom = &rt.services.dom;
        let node = *dom
            .locate(VIEW_ATTRIBUTE, self.id.as_str(), None)
            .first()?;
        let comment = dom.leading_comment(node)?;
        Some(unwrap_view(&comment))
    }

    /// Renders `content` into every placeholder. False when there is nowhere
    /// to render.
    pub(crate) fn render(&mut self, content: Content, rt: &mut Runtime) -> bool {
        if self.destroyed {
            return false;
        }
        if self.placeholders.is_empty() {
            debug!(pagelet = %self.name, "pagelet: no placeholders, render skipped");
            return false;
        }

        let markup = self.compose(content, rt);
        let options = MountOptions {
            append: self.append,
            mode: self.mode,
        };
        for node in &self.placeholders {
            rt.services.dom.mount(*node, &markup, options);
        }

        if !self.rendered {
            self.rendered = true;
            rt.rendered.push(self.name.clone());
        }
        self.broadcast("render", vec![Value::String(markup)], rt);
        true
    }

    fn compose(&self, content: Content, rt: &Runtime) -> String {
        let empty = Value::Object(Map::new());
        let state = self.template_state.as_ref().unwrap_or(&empty);

        let data = match content {
            Content::Markup(markup) => return markup,
            Content::Error(error) => return self.error_view(&empty, &error, rt),
            Content::Data(Value::String(markup)) => return markup,
            Content::Data(Value::Null) | Content::Empty if !state.is_object() => {
                return String::new();
            }
            Content::Data(Value::Null) | Content::Empty => empty.clone(),
            Content::Data(data) => data,
        };

        let Some(template) = self.template(TemplateKind::Client, rt) else {
            return match data {
                Value::Object(_) | Value::Array(_) => {
                    debug!(pagelet = %self.name, "pagelet: data without client template, rendering nothing");
                    String::new()
                }
                other => other.to_string(),
            };
        };
        if !data.is_object() {
            return data.to_string();
        }

        match template(&merge_layers(&[&data, state])) {
            Ok(markup) => markup,
            Err(error) => {
                warn!(pagelet = %self.name, %error, "pagelet: client template failed");
                let failure = RemoteError {
                    message: error.message,
                    stack: error.stack,
                };
                self.error_view(&data, &failure, rt)
            }
        }
    }

    fn error_view(&self, data: &Value, error: &RemoteError, rt: &Runtime) -> String {
        let failure = json!({
            "reason": format!("Failed to render: {}", self.name),
            "message": error.message,
            "stack": error.stack,
        });
        let empty = Value::Object(Map::new());
        let state = self.template_state.as_ref().unwrap_or(&empty);
        let merged = merge_layers(&[data, state, &failure]);

        match self.template(TemplateKind::Error, rt) {
            Some(template) => template(&merged).unwrap_or_else(|nested| {
                warn!(pagelet = %self.name, error = %nested, "pagelet: error template failed");
                escape_html(&error.message)
            }),
            None => escape_html(&error.message),
        }
    }

    /// Shows the loader content and marks the placeholders busy, or undoes
    /// the marking when `unloading`.
    pub(crate) fn loading(&mut self, unloading: bool, rt: &mut Runtime) {
        if !unloading {
            let markup = self.loader.as_ref().map(Loader::produce).unwrap_or_default();
            self.render(Content::Markup(markup), rt);
        }

        let class = rt.options.loading_class.clone();
        let dom = &mut rt.services.dom;
        for node in &self.placeholders {
            if unloading {
                dom.remove_class(*node, &class);
                dom.set_style(*node, "cursor", "");
            } else {
                dom.add_class(*node, &class);
                dom.set_style(*node, "cursor", "wait");
            }
        }
    }

    /// Finds the placeholders again below the parent's current ones and
    /// re-renders the last known view.
    pub(crate) fn relocate(&mut self, parent_placeholders: &[NodeId], rt: &mut Runtime) {
        if self.destroyed {
            return;
        }
        let active = self.state == FragmentState::Active;
        for node in &self.placeholders {
            if active {
                rt.services.dom.release_forms(*node);
            }
        }
        self.placeholders =
            rt.services
                .dom
                .locate(PLACEHOLDER_ATTRIBUTE, &self.name, Some(parent_placeholders));
        if active {
            for node in &self.placeholders {
                rt.services.dom.intercept_forms(*node, &self.name);
            }
        }

        let content = match self.parse(rt) {
            Some(view) => Content::Markup(view),
            None => self
                .template_state
                .clone()
                .map_or(Content::Empty, Content::Data),
        };
        self.render(content, rt);
    }

    /// Handles a raw sub-channel message. False for anything that is not a
    /// well-formed message this side understands.
    pub(crate) fn processor(&mut self, raw: &Value, rt: &mut Runtime) -> bool {
        if !raw.is_object() {
            debug!(pagelet = %self.name, "pagelet: non-object sub-channel payload rejected");
            return false;
        }
        match serde_json::from_value::<ChannelMessage>(raw.clone()) {
            Ok(message) => self.process(message, rt),
            Err(error) => {
                debug!(pagelet = %self.name, %error, "pagelet: unrecognized sub-channel message");
                false
            }
        }
    }

    pub(crate) fn process(&mut self, message: ChannelMessage, rt: &mut Runtime) -> bool {
        if self.destroyed {
            return false;
        }

        match message {
            ChannelMessage::Rpc { id, args, .. } => {
                let fulfilled = self.rpc.fulfill(&id, args);
                if !fulfilled {
                    debug!(pagelet = %self.name, %id, "pagelet: rpc reply without pending call");
                }
                fulfilled
            }
            ChannelMessage::Event { mut args } => {
                let Some(Value::String(event)) = args.first().cloned() else {
                    return false;
                };
                let topic = Topic::parse(&event);
                if self.reserved(&topic) || is_page_event(&event) {
                    warn!(pagelet = %self.name, %event, "pagelet: server tried to emit a reserved event");
                    return false;
                }
                args.remove(0);
                self.events
                    .emit(&Event::from_origin(topic, self.origin(), args));
                true
            }
            ChannelMessage::Fragment { view } => {
                self.loading(true, rt);
                self.render(Content::from_view(view), rt);
                true
            }
            ChannelMessage::Err(error) => {
                self.render(Content::Error(error), rt);
                true
            }
            ChannelMessage::Redirect { url } => {
                info!(pagelet = %self.name, %url, "pagelet: server requested navigation");
                rt.services.dom.navigate(&url);
                true
            }
            other @ (ChannelMessage::Get { .. } | ChannelMessage::Post { .. }) => {
                debug!(
                    pagelet = %self.name,
                    kind = other.kind(),
                    "pagelet: client-to-server message received from server, rejected"
                );
                false
            }
        }
    }

    /// Invokes remote method `method`; `callback` receives the reply args.
    pub(crate) fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        callback: RpcCallback,
        rt: &mut Runtime,
    ) -> Result<String, FragmentError> {
        if self.destroyed {
            return Err(FragmentError::Destroyed(self.name.clone()));
        }
        if !self.rpc.exposes(method) {
            return Err(FragmentError::UnknownMethod {
                fragment: self.name.clone(),
                method: method.to_string(),
            });
        }
        let channel = self
            .channel
            .ok_or_else(|| FragmentError::ChannelUnavailable(self.name.clone()))?;

        let (id, message) = self.rpc.prepare(method, args, callback);
        if let Err(error) = rt.services.transport.write(channel, &message) {
            self.rpc.abandon(&id);
            return Err(error.into());
        }
        debug!(pagelet = %self.name, %id, "pagelet: rpc call written");
        Ok(id)
    }

    /// Decides what happens to a form submitted under this pagelet.
    pub(crate) fn submit(&mut self, form: &FormSnapshot, rt: &mut Runtime) -> SubmitOutcome {
        let snapshot = serde_json::to_value(form).unwrap_or_default();
        self.broadcast("submit", vec![snapshot], rt);

        let native = SubmitOutcome::Native {
            action: form::amend_action(&form.action, &rt.options.fragment_param, &self.name),
        };
        if self.destroyed || !self.streaming || form.opt_out {
            return native;
        }
        let Some(channel) = self.channel else {
            debug!(pagelet = %self.name, "pagelet: streaming form without sub-channel, submitting natively");
            return native;
        };

        let message = form::submission_message(form);
        match rt.services.transport.write(channel, &message) {
            Ok(()) => {
                self.loading(false, rt);
                SubmitOutcome::Streamed
            }
            Err(error) => {
                warn!(pagelet = %self.name, %error, "pagelet: streaming submit failed, submitting natively");
                native
            }
        }
    }

    /// Tears the pagelet down. False when it already was.
    pub(crate) fn destroy(&mut self, options: DestroyOptions, rt: &mut Runtime) -> bool {
        if self.destroyed {
            return false;
        }
        self.state = FragmentState::Destroying;

        self.broadcast(
            "destroy",
            vec![json!({ "remove": options.remove, "assets": options.release_assets })],
            rt,
        );
        // A pagelet torn down early still counts as initialized for the page.
        self.mark_initialized(rt);

        let dom = &mut rt.services.dom;
        for node in self.placeholders.drain(..) {
            dom.release_forms(node);
            if options.remove {
                dom.detach(node);
            } else {
                dom.clear(node);
            }
        }

        self.rpc.clear();
        if let Some(container) = self.container.take() {
            rt.services.sandbox.destroy_container(container);
        }
        if let Some(channel) = self.channel.take() {
            rt.services.transport.close_channel(channel);
        }
        if options.release_assets && self.assets_requested {
            for url in self.css.iter().chain(&self.js) {
                rt.services.assets.release(url);
            }
        }
        self.outstanding = None;
        self.destroyed = true;

        info!(pagelet = %self.name, remove = options.remove, "pagelet: destroyed");
        true
    }
}

impl Reusable for Fragment {
    fn reset(&mut self) {
        self.name.clear();
        self.id = FragmentId::default();
        self.parent = None;
        self.epoch = 0;
        self.state = FragmentState::Pooled;
        self.placeholders.clear();
        self.mode = RenderMode::default();
        self.append = false;
        self.loader = None;
        self.css.clear();
        self.js.clear();
        self.timeout = Duration::ZERO;
        self.hash = TemplateHashes::default();
        self.run = None;
        self.template_state = None;
        self.streaming = false;
        self.rpc.clear();
        self.events.remove_all_listeners();
        self.channel = None;
        self.container = None;
        self.outstanding = None;
        self.assets_requested = false;
        self.load_error = None;
        self.rendered = false;
        self.initialized = false;
        self.destroyed = false;
    }
}

/// Strips the comment delimiters the server wraps the view in and undoes its
/// backslash escaping.
fn unwrap_view(comment: &str) -> String {
    let mut chars = comment.chars();
    chars.next();
    chars.next_back();

    let mut view = String::with_capacity(comment.len());
    let mut inner = chars.as_str().chars();
    while let Some(c) = inner.next() {
        if c == '\\' {
            if let Some(escaped) = inner.next() {
                view.push(escaped);
            }
        } else {
            view.push(c);
        }
    }
    view
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
#[path = "tests/pagelet_tests.rs"]
mod tests;
