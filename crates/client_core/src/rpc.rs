//! Remote methods a pagelet exposes on behalf of the server.

use std::{collections::HashMap, fmt};

use serde_json::Value;
use shared::protocol::ChannelMessage;
use tracing::warn;

/// Operation names of the pagelet itself; a server-declared method with one
/// of these names is never exposed.
pub const BUILTIN_OPERATIONS: [&str; 16] = [
    "configure",
    "initialize",
    "render",
    "loading",
    "destroy",
    "broadcast",
    "reserved",
    "processor",
    "submit",
    "template",
    "parse",
    "pagelet",
    "call",
    "on",
    "once",
    "emit",
];

pub type RpcCallback = Box<dyn FnOnce(Vec<Value>) + Send>;

#[derive(Default)]
pub struct RpcTable {
    methods: Vec<String>,
    counter: u64,
    pending: HashMap<String, RpcCallback>,
}

impl RpcTable {
    /// Exposes every declared name that is not a built-in operation and not
    /// already exposed.
    pub fn declare(&mut self, fragment: &str, names: &[String]) {
        for name in names {
            if BUILTIN_OPERATIONS.contains(&name.as_str()) {
                warn!(
                    pagelet = fragment,
                    method = %name,
                    "pagelet: remote method collides with a built-in operation, skipped"
                );
                continue;
            }
            if !self.methods.contains(name) {
                self.methods.push(name.clone());
            }
        }
    }

    pub fn exposes(&self, method: &str) -> bool {
        self.methods.iter().any(|name| name == method)
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Registers `callback` under a fresh `method#n` id and returns the call
    /// message to write.
    pub fn prepare(
        &mut self,
        method: &str,
        args: Vec<Value>,
        callback: RpcCallback,
    ) -> (String, ChannelMessage) {
        self.counter += 1;
        let id = format!("{method}#{}", self.counter);
        self.pending.insert(id.clone(), callback);
        let message = ChannelMessage::rpc_call(method, args, id.clone());
        (id, message)
    }

    /// Drops a pending call whose message could not be written.
    pub fn abandon(&mut self, id: &str) {
        self.pending.remove(id);
    }

    /// Resolves the pending call `id`. False when nothing waits on it.
    pub fn fulfill(&mut self, id: &str, args: Vec<Value>) -> bool {
        match self.pending.remove(id) {
            Some(callback) => {
                callback(args);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Forgets every method and drops outstanding callbacks without calling
    /// them.
    pub fn clear(&mut self) {
        self.methods.clear();
        self.pending.clear();
        self.counter = 0;
    }
}

impl fmt::Debug for RpcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcTable")
            .field("methods", &self.methods)
            .field("counter", &self.counter)
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod tests;
