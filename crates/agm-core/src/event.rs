//! Event types delivered from the graph engine to client callbacks.

/// Source module id the engine uses for its own data-path events.
///
/// Events whose source equals this constant are engine-internal
/// (EOS rendered, read done, write done); everything else originates
/// from a graph module.
pub const ENGINE_EVENT_SOURCE_MODULE: u32 = 0x2001;

/// EOS has been rendered at the end of the pipeline.
pub const EVENT_ID_EOS_RENDERED: u32 = 0x0;
/// A buffer handed to `read` has been filled.
pub const EVENT_ID_READ_DONE: u32 = 0x1;
/// A buffer handed to `write` has been consumed.
pub const EVENT_ID_WRITE_DONE: u32 = 0x2;

/// Classes of events a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Engine-internal data-path events: EOS rendered, read done,
    /// write done.
    DataPath,
    /// Events raised by graph modules.
    Module,
}

/// Payload passed to a client event callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventParams {
    /// Module that generated the event, or
    /// [`ENGINE_EVENT_SOURCE_MODULE`] for engine-internal events.
    pub source_module_id: u32,
    /// Event identifier.
    pub event_id: u32,
    /// Module-specific payload, possibly empty.
    pub payload: Vec<u8>,
}

impl EventParams {
    /// True when this event comes from the engine's data path rather
    /// than a module.
    pub fn is_data_path(&self) -> bool {
        self.source_module_id == ENGINE_EVENT_SOURCE_MODULE
            && matches!(
                self.event_id,
                EVENT_ID_EOS_RENDERED | EVENT_ID_READ_DONE | EVENT_ID_WRITE_DONE
            )
    }
}

/// Registration request for a module-generated event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRegistration {
    /// Instance id of the module to watch.
    pub module_instance_id: u32,
    /// Event id within that module.
    pub event_id: u32,
    /// True to register, false to deregister.
    pub register: bool,
    /// Module-specific registration payload.
    pub payload: Vec<u8>,
}
