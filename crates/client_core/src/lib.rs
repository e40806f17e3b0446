//! Client-side orchestration of server-pushed pagelets.
//!
//! [`Pipe`] is the page controller: it registers pagelets as the server
//! flushes them, drives each [`Fragment`] through asset loading, rendering
//! and initialization, and accounts for page completion. Everything outside
//! the page (document, assets, sandbox, transport, templates) is reached
//! through the collaborator traits in [`services`].

pub mod bus;
pub mod error;
pub mod form;
pub mod memory;
pub mod merge;
pub mod options;
pub mod pagelet;
pub mod pipe;
pub mod pool;
pub mod rpc;
mod runtime;
pub mod services;

pub use bus::{Event, EventBus, ListenerId, Origin, Topic};
pub use error::{AssetError, FragmentError, PipeError, TemplateError, TransportError};
pub use form::{FormField, FormMethod, FormSnapshot, SubmitOutcome};
pub use options::PipeOptions;
pub use pagelet::{Content, DestroyOptions, Fragment, FragmentState, Loader};
pub use pipe::{Pipe, PipeEvent, Plugin, ROOT_LOADING_CLASS};
pub use pool::{Reusable, ReusePool};
pub use services::{
    AssetLoader, AssetPoll, Dom, LoadTicket, MountOptions, Sandbox, Services, TemplateStore,
    Templates, Transport,
};

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
