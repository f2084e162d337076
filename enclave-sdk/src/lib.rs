//! Guest SDK for Enclave plugins.
//!
//! Plugin authors implement [`GuestModule`] and use the [`PluginContext`]
//! handed to its hooks to expose RPC methods, register UI components,
//! emit events, persist state and make network requests. Every capability
//! API checks the plugin's granted permissions first.
//!
//! The crate also carries the in-container [`GuestRuntime`] that an
//! isolation backend boots for each sandbox.
//!
//! # Example
//!
//! ```ignore
//! use enclave_sdk::prelude::*;
//!
//! struct Charts;
//!
//! #[async_trait]
//! impl GuestModule for Charts {
//!     async fn on_load(&self, ctx: &PluginContext) -> anyhow::Result<()> {
//!         ctx.register_api("render", |args| async move {
//!             Ok(json!({"points": args.len()}))
//!         })?;
//!         ctx.emit("ready", Value::Null)?;
//!         Ok(())
//!     }
//! }
//! ```

mod context;
mod control;
mod document;
mod error;
mod meter;
mod module;
mod runtime;

pub use context::{
    ComponentFactory, PluginContext, PluginState, HOST_EVENT_CHANNEL, PLUGIN_EVENT_CHANNEL,
    UI_CHANNEL,
};
pub use control::{Ack, ControlMessage, GuestHandle, ScriptElement, ScriptSource};
pub use document::{DocumentRoot, Node};
pub use error::{GuestError, GuestResult};
pub use meter::ResourceMeter;
pub use module::{GuestModule, ModuleFactory, ModuleRegistry, ScriptEngine, ScriptKind};
pub use runtime::{GuestRuntime, GuestSpec};

/// Everything a plugin module usually needs.
pub mod prelude {
    pub use crate::{GuestError, GuestModule, GuestResult, Node, PluginContext};
    pub use async_trait::async_trait;
    pub use enclave_types::{FetchRequest, FetchResponse, Permission, PluginId};
    pub use serde_json::{json, Value};
}
