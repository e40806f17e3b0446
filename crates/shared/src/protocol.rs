use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{FragmentId, PageId, RenderMode},
    error::RemoteError,
};

/// Template keys the server computed for a fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateHashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload flushed by the server when a fragment arrives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrivalData {
    #[serde(default)]
    pub id: FragmentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Fragments the server still has to flush after this one.
    #[serde(default)]
    pub remaining: usize,
    /// Server cancelled this fragment before it became visible.
    #[serde(default)]
    pub remove: bool,
    #[serde(default, deserialize_with = "one_or_many")]
    pub css: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub js: Vec<String>,
    /// Asset loading timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub append: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader: Option<String>,
    #[serde(default)]
    pub mode: RenderMode,
    #[serde(default)]
    pub hash: TemplateHashes,
    /// Client code executed in the sandbox once the fragment is initialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default)]
    pub rpc: Vec<String>,
    #[serde(default)]
    pub streaming: bool,
    /// Template state rendered through the client template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Nothing(Option<()>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
        OneOrMany::Nothing(_) => Vec::new(),
    })
}

/// Messages exchanged over a fragment's sub-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Rpc {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default)]
        args: Vec<Value>,
        id: String,
    },
    Event {
        #[serde(default)]
        args: Vec<Value>,
    },
    Fragment {
        #[serde(default)]
        view: Value,
    },
    Err(RemoteError),
    Redirect {
        url: String,
    },
    Get {
        #[serde(default)]
        body: Map<String, Value>,
    },
    Post {
        #[serde(default)]
        body: Map<String, Value>,
    },
}

impl ChannelMessage {
    pub fn rpc_call(method: &str, args: Vec<Value>, id: String) -> Self {
        Self::Rpc {
            method: Some(method.to_string()),
            args,
            id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rpc { .. } => "rpc",
            Self::Event { .. } => "event",
            Self::Fragment { .. } => "fragment",
            Self::Err(_) => "err",
            Self::Redirect { .. } => "redirect",
            Self::Get { .. } => "get",
            Self::Post { .. } => "post",
        }
    }
}

/// Messages written on the page control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageMessage {
    Page {
        id: PageId,
    },
    Pagelet {
        name: String,
        id: FragmentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
    },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
