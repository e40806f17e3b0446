use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Context};
use client_core::{
    memory::{MemoryAssets, MemoryDom, MemorySandbox, MemoryTransport},
    AssetError, FormSnapshot, LoadTicket, Pipe, PipeEvent, PipeOptions, Services,
};
use serde::Deserialize;
use serde_json::Value;
use shared::{domain::NodeId, protocol::ArrivalData};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn};

use crate::template;

/// A recorded page: its document, templates, asset behavior and the
/// sequence of host and server actions to replay.
#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub expected: usize,
    #[serde(default)]
    pub dom: Vec<Element>,
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    /// Keep asset loads pending until a `settle` step.
    #[serde(default)]
    pub deferred_assets: bool,
    #[serde(default)]
    pub failing_assets: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct Element {
    /// Scenario-local key other elements use as `parent`.
    pub key: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Arrive {
        name: String,
        #[serde(default)]
        data: ArrivalData,
    },
    Settle {
        url: String,
        /// `"timeout"` or a failure reason; success when absent.
        #[serde(default)]
        error: Option<String>,
    },
    Deliver {
        name: String,
        message: Value,
    },
    Submit {
        name: String,
        form: FormSnapshot,
    },
    Call {
        name: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Broadcast {
        event: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Remove {
        name: String,
    },
    Reconnect,
    Destroy,
}

/// What a replay left behind.
#[derive(Debug)]
pub struct Report {
    pub events: Vec<PipeEvent>,
    pub dom: Vec<(String, String)>,
    pub navigations: Vec<String>,
    pub page_messages: Vec<Value>,
}

pub struct Replay {
    pipe: Pipe,
    dom: MemoryDom,
    assets: MemoryAssets,
    transport: MemoryTransport,
    keys: HashMap<NodeId, String>,
    pending: Vec<(String, LoadTicket)>,
    asset_timeout_ms: u64,
    events: broadcast::Receiver<PipeEvent>,
    log: Vec<PipeEvent>,
}

impl Replay {
    pub fn new(scenario: &Scenario, options: PipeOptions) -> anyhow::Result<Self> {
        let dom = MemoryDom::new();
        let mut nodes: HashMap<&str, NodeId> = HashMap::new();
        let mut keys = HashMap::new();
        for element in &scenario.dom {
            let parent = match &element.parent {
                Some(parent) => Some(
                    *nodes
                        .get(parent.as_str())
                        .with_context(|| format!("element {} names unknown parent {parent}", element.key))?,
                ),
                None => None,
            };
            let attributes: Vec<(&str, &str)> = element
                .attributes
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect();
            let id = match &element.comment {
                Some(comment) => dom.insert_with_comment(parent, &attributes, comment),
                None => dom.insert(parent, &attributes, &element.html),
            };
            nodes.insert(&element.key, id);
            keys.insert(id, element.key.clone());
        }

        let assets = if scenario.deferred_assets {
            MemoryAssets::deferred()
        } else {
            MemoryAssets::new()
        };
        for (url, reason) in &scenario.failing_assets {
            assets.fail(url, reason);
        }

        let transport = MemoryTransport::new();
        let asset_timeout_ms = options.asset_timeout_ms;
        let services = Services::missing()
            .with_dom(dom.clone())
            .with_assets(assets.clone())
            .with_sandbox(MemorySandbox::new())
            .with_transport(transport.clone())
            .with_templates(template::compile(&scenario.templates));
        let mut pipe = Pipe::new(options, services);
        let events = pipe.subscribe_events();
        if let Err(err) = pipe.connected() {
            warn!(error = %err, "replay: page registration failed");
        }

        Ok(Self {
            pipe,
            dom,
            assets,
            transport,
            keys,
            pending: Vec::new(),
            asset_timeout_ms,
            events,
            log: Vec::new(),
        })
    }

    pub fn run(mut self, steps: &[Step]) -> anyhow::Result<Report> {
        for (index, step) in steps.iter().enumerate() {
            self.apply(step)
                .with_context(|| format!("step {} failed", index + 1))?;
            self.collect();
        }
        Ok(self.report())
    }

    fn apply(&mut self, step: &Step) -> anyhow::Result<()> {
        match step {
            Step::Arrive { name, data } => self.pipe.arrive(name, data.clone()),
            Step::Settle { url, error } => {
                self.pending.extend(self.assets.take_pending());
                let Some(index) = self.pending.iter().position(|(pending, _)| pending == url) else {
                    bail!("no pending load for {url}");
                };
                let (url, ticket) = self.pending.remove(index);
                let result = match error.as_deref() {
                    None => Ok(()),
                    Some("timeout") => Err(AssetError::Timeout {
                        url: url.clone(),
                        after_ms: self.asset_timeout_ms,
                    }),
                    Some(reason) => Err(AssetError::Failed {
                        url: url.clone(),
                        reason: reason.to_string(),
                    }),
                };
                if !self.pipe.asset_settled(ticket, &url, result) {
                    info!(%url, "replay: settlement ignored by the page");
                }
            }
            Step::Deliver { name, message } => {
                if !self.pipe.deliver(name, message) {
                    warn!(pagelet = %name, "replay: message rejected");
                }
            }
            Step::Submit { name, form } => {
                let outcome = self.pipe.submit(name, form)?;
                info!(pagelet = %name, ?outcome, "replay: form submitted");
            }
            Step::Call { name, method, args } => {
                let label = format!("{name}.{method}");
                let id = self.pipe.call(
                    name,
                    method,
                    args.clone(),
                    Box::new(move |reply| info!(call = %label, ?reply, "replay: rpc answered")),
                )?;
                info!(%id, "replay: rpc written");
            }
            Step::Broadcast { event, args } => {
                let reached = self.pipe.broadcast(event, args.clone());
                info!(%event, reached, "replay: broadcast");
            }
            Step::Remove { name } => {
                if !self.pipe.remove(name) {
                    warn!(pagelet = %name, "replay: nothing to remove");
                }
            }
            Step::Reconnect => self.pipe.reconnected()?,
            Step::Destroy => self.pipe.destroy(),
        }
        Ok(())
    }

    fn collect(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.log.push(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "replay: page events dropped, raise events_capacity");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    fn report(self) -> Report {
        let dom = self
            .dom
            .snapshot()
            .into_iter()
            .map(|(id, html)| {
                let key = self.keys.get(&id).cloned().unwrap_or_else(|| id.to_string());
                (key, html)
            })
            .collect();
        let page_messages = self
            .transport
            .page_messages()
            .iter()
            .filter_map(|message| serde_json::to_value(message).ok())
            .collect();

        Report {
            events: self.log,
            dom,
            navigations: self.dom.navigations(),
            page_messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn scenario(raw: Value) -> Scenario {
        serde_json::from_value(raw).expect("scenario")
    }

    #[test]
    fn replays_a_deferred_page_with_a_timed_out_asset() {
        let scenario = scenario(json!({
            "expected": 2,
            "deferred_assets": true,
            "templates": {
                "error": "<p>{{message}}</p>",
                "title": "<h1>{{title}}</h1>"
            },
            "dom": [
                {"key": "shell", "attributes": {"data-pagelet": "shell"}},
                {"key": "ads", "parent": "shell", "attributes": {"data-pagelet": "ads"}}
            ],
            "steps": [
                {"step": "arrive", "name": "ads", "data": {"id": "a", "parent": "shell", "remaining": 1, "js": "/ads.js"}},
                {"step": "arrive", "name": "shell", "data": {"id": "s", "remaining": 0, "hash": {"client": "title"}, "state": {"title": "Home"}}},
                {"step": "settle", "url": "/ads.js", "error": "timeout"}
            ]
        }));
        let options = PipeOptions::new("page-1", scenario.expected);
        let report = Replay::new(&scenario, options)
            .expect("replay")
            .run(&scenario.steps)
            .expect("run");

        assert!(report.events.contains(&PipeEvent::Finished));
        assert_eq!(
            report.dom,
            vec![
                ("shell".to_string(), "<h1>Home</h1>".to_string()),
                (
                    "ads".to_string(),
                    "<p>asset /ads.js timed out after 25000ms</p>".to_string()
                ),
            ]
        );
        assert_eq!(report.page_messages, vec![json!({"type": "page", "id": "page-1"})]);
    }

    #[test]
    fn settling_an_unknown_asset_fails_the_step() {
        let scenario = scenario(json!({
            "expected": 1,
            "steps": [{"step": "settle", "url": "/nothing.js"}]
        }));
        let options = PipeOptions::new("page-1", 1);
        let error = Replay::new(&scenario, options)
            .expect("replay")
            .run(&scenario.steps)
            .expect_err("unknown asset");

        assert_eq!(error.to_string(), "step 1 failed");
    }

    #[test]
    fn unknown_parent_element_is_rejected() {
        let scenario = scenario(json!({
            "expected": 0,
            "dom": [{"key": "orphan", "parent": "missing"}],
            "steps": []
        }));

        assert!(Replay::new(&scenario, PipeOptions::default()).is_err());
    }
}
