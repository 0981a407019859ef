//! Graph engine boundary for the Audio Graph Manager.
//!
//! The lower-level DSP graph engine is an external component; this
//! crate pins down the surface the manager relies on and nothing more:
//!
//! - [`GraphEngine`]: process-wide entry points — initialize with
//!   calibration data, open graph handles, query tag/module mappings
//! - [`EngineGraph`]: the per-handle command set — lifecycle commands,
//!   topology edits, custom config set/get, data read/write, event
//!   callback hookup
//! - [`acdb`]: discovery of calibration data files handed to the
//!   engine at initialization
//!
//! Both traits are object-safe so the engine can be selected at
//! runtime; the `mock` feature provides a deterministic in-memory
//! implementation for tests.

pub mod acdb;
#[cfg(feature = "mock")]
pub mod mock;

use agm_core::{Direction, EventParams, EventRegistration, KeyVector, Result};

/// Maps a module instance to its module type, as reported by the
/// engine for one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleIdPair {
    /// Module type id.
    pub module_id: u32,
    /// Globally unique module instance id.
    pub module_instance_id: u32,
}

/// All module instances carrying one tag under a graph key vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagModuleInfo {
    /// The tag.
    pub tag: u32,
    /// Modules carrying the tag.
    pub modules: Vec<ModuleIdPair>,
}

/// Properties selecting a subgraph for a scoped stop.
///
/// A stop with properties tears down only the matching subgraph
/// (single-session-single-device); a stop without stops the whole
/// graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopProperties {
    /// Graph key vector identifying the subgraph.
    pub gkv: KeyVector,
    /// Property id scoping the stop.
    pub prop_id: u32,
    /// Property values.
    pub values: Vec<u32>,
}

/// Data-path buffer parameters handed to the engine before prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSetup {
    /// Number of buffers.
    pub count: u32,
    /// Size of each buffer in bytes.
    pub size: usize,
    /// Start threshold in bytes.
    pub start_threshold: u32,
    /// Stop threshold in bytes.
    pub stop_threshold: u32,
    /// True for blocking transfers, false for non-blocking.
    pub blocking: bool,
}

/// Callback invoked by the engine for graph events.
pub type EngineEventCallback = Box<dyn Fn(&EventParams) + Send + Sync>;

/// Process-wide graph engine entry points.
pub trait GraphEngine: Send + Sync {
    /// Initialize the engine with calibration data. Called once before
    /// any graph is opened.
    fn initialize(&self, init: &acdb::EngineInitData) -> Result<()>;

    /// Tear the engine down. Called once at service shutdown.
    fn shutdown(&self);

    /// Open a graph for the given key vectors and return its handle.
    fn open(&self, gkv: &KeyVector, ckv: &KeyVector) -> Result<Box<dyn EngineGraph>>;

    /// Report every tag present under `gkv` together with the modules
    /// carrying it.
    fn tag_module_info(&self, gkv: &KeyVector) -> Result<Vec<TagModuleInfo>>;

    /// Report the modules carrying one specific tag under `gkv`.
    fn tagged_module_info(&self, gkv: &KeyVector, tag: u32) -> Result<Vec<ModuleIdPair>>;
}

/// Command surface of one opened graph handle.
///
/// Calls may block (prepare, start, read, and blocking-mode write in
/// particular); callers hold the graph lock across them by design.
pub trait EngineGraph: Send {
    /// Prepare the graph for data flow.
    fn prepare(&mut self) -> Result<()>;

    /// Start the graph.
    fn start(&mut self) -> Result<()>;

    /// Stop the whole graph, or only the subgraph selected by `props`.
    fn stop(&mut self, props: Option<&StopProperties>) -> Result<()>;

    /// Signal end-of-stream into the data path.
    fn eos(&mut self) -> Result<()>;

    /// Add the subgraph selected by the key vectors to this graph.
    fn add_graph(&mut self, gkv: &KeyVector, ckv: &KeyVector) -> Result<()>;

    /// Replace this graph's topology with the one selected by the key
    /// vectors. The engine tears the old topology down.
    fn change_graph(&mut self, gkv: &KeyVector, ckv: &KeyVector) -> Result<()>;

    /// Remove the subgraph selected by `gkv` from this graph.
    fn remove_graph(&mut self, gkv: &KeyVector) -> Result<()>;

    /// Configure the client data path (write params for render, read
    /// params for capture).
    fn configure_buffers(&mut self, direction: Direction, setup: &BufferSetup) -> Result<()>;

    /// Push an opaque module configuration blob.
    fn set_custom_config(&mut self, payload: &[u8]) -> Result<()>;

    /// Round-trip an opaque configuration query; returns the filled
    /// payload.
    fn get_custom_config(&mut self, request: &[u8]) -> Result<Vec<u8>>;

    /// Set a tag-scoped configuration under the given graph key vector.
    fn set_tagged_config(&mut self, gkv: &KeyVector, tag: u32, tkv: &KeyVector) -> Result<()>;

    /// Apply calibration data selected by the key vectors.
    fn set_cal(&mut self, gkv: &KeyVector, ckv: &KeyVector) -> Result<()>;

    /// Write client data toward the endpoint module carrying `tag`.
    /// Returns the number of bytes consumed; partial writes are legal.
    fn write(&mut self, tag: u32, buf: &[u8]) -> Result<usize>;

    /// Read captured data from the endpoint module carrying `tag`.
    /// Returns the number of bytes produced; partial reads are legal.
    fn read(&mut self, tag: u32, buf: &mut [u8]) -> Result<usize>;

    /// Install the event callback for this graph.
    fn register_event_callback(&mut self, callback: EngineEventCallback) -> Result<()>;

    /// Register or deregister a module-generated event.
    fn register_custom_event(&mut self, registration: &EventRegistration) -> Result<()>;

    /// Count of buffers the hardware has processed in `direction`.
    /// Monotonically increasing, wraps at `usize::MAX`.
    fn processed_buffer_count(&self, direction: Direction) -> usize;
}
