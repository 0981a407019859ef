//! Audio interface attachments.
//!
//! An attachment joins one session to one device. `Close`/`Open` track
//! the client's connection request before it is realized; the
//! remaining states track the realized graph/device phases.

use std::sync::Arc;

use agm_core::Metadata;
use agm_device::Device;

/// Connection state of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AifState {
    /// Connection requested off (or never requested).
    Close,
    /// Connection requested on, not yet realized.
    Open,
    /// Realized: device opened and subgraph present.
    Opened,
    /// Realized and prepared.
    Prepared,
    /// Realized and running.
    Started,
    /// Realized and stopped after running.
    Stopped,
    /// Torn down after being realized.
    Closed,
}

impl AifState {
    /// True while the attachment holds a device reference and a live
    /// subgraph.
    pub fn is_realized(self) -> bool {
        matches!(
            self,
            AifState::Opened | AifState::Prepared | AifState::Started | AifState::Stopped
        )
    }
}

/// One session-to-device attachment.
pub(crate) struct AifAttachment {
    pub(crate) aif_id: u32,
    pub(crate) device: Arc<Device>,
    /// Session-AIF pair metadata.
    pub(crate) metadata: Metadata,
    /// Param blob replayed on the next attach.
    pub(crate) cached_params: Option<Vec<u8>>,
    pub(crate) state: AifState,
}

impl AifAttachment {
    pub(crate) fn new(aif_id: u32, device: Arc<Device>) -> Self {
        Self {
            aif_id,
            device,
            metadata: Metadata::default(),
            cached_params: None,
            state: AifState::Close,
        }
    }

    /// Merge of the session metadata, this pair's metadata and the
    /// device metadata — the effective bundle for this leg.
    pub(crate) fn merged_with(&self, session_meta: &Metadata) -> Metadata {
        Metadata::merge([session_meta, &self.metadata, &self.device.metadata()])
    }
}
