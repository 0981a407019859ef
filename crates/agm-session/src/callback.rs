//! Per-session callback pool and event fanout.
//!
//! Delivery filters on the subscriber's event type: data-path
//! subscribers see only engine-internal data events (EOS rendered,
//! read done, write done); module subscribers see everything raised by
//! graph modules. The pool has its own lock so that delivery never
//! contends with a session API call.

use std::sync::Arc;

use agm_core::{EventParams, EventType, ENGINE_EVENT_SOURCE_MODULE};

/// Client event callback: `(session_id, event)`.
pub type SessionEventCallback = Arc<dyn Fn(u32, &EventParams) + Send + Sync>;

struct CallbackEntry {
    event_type: EventType,
    client_data: u64,
    callback: SessionEventCallback,
}

/// Subscribers of one session.
#[derive(Default)]
pub(crate) struct CallbackPool {
    entries: Vec<CallbackEntry>,
}

impl CallbackPool {
    /// Add a subscriber.
    pub(crate) fn register(
        &mut self,
        callback: SessionEventCallback,
        event_type: EventType,
        client_data: u64,
    ) {
        self.entries.push(CallbackEntry {
            event_type,
            client_data,
            callback,
        });
    }

    /// Remove every subscriber matching `(event_type, client_data)`.
    pub(crate) fn unregister(&mut self, event_type: EventType, client_data: u64) {
        self.entries
            .retain(|entry| !(entry.event_type == event_type && entry.client_data == client_data));
    }

    /// Fan `params` out to every subscriber whose filter matches.
    pub(crate) fn dispatch(&self, session_id: u32, params: &EventParams) {
        for entry in &self.entries {
            let matches = match entry.event_type {
                EventType::DataPath => params.is_data_path(),
                EventType::Module => params.source_module_id != ENGINE_EVENT_SOURCE_MODULE,
            };
            if matches {
                (entry.callback)(session_id, params);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
