//! Graph objects for the Audio Graph Manager.
//!
//! A [`Graph`] wraps one engine handle for the lifetime of a session:
//! it resolves the tagged modules present under the effective graph key
//! vector, walks them through configuration, drives the engine through
//! prepare/start/stop, applies topology edits when audio interfaces
//! come and go, and carries the client data path.
//!
//! Graphs are not shared: each session owns exactly one. Devices
//! referenced by device-side modules are shared and refcounted by the
//! device layer.

mod graph;
mod module;

pub use graph::{Graph, GraphState};
pub use module::{ConfigureContext, ModuleRole, ResolvedModule};
